//! The stream assembler: merges the paged backfill reader with live socket
//! pushes into one gap-free ordered feed.
//!
//! # Switchover
//!
//! While behind, [`wait`](TransactionStream::wait) pages the filtered
//! listing forward (`populate`), one overlapping page at a time. When the
//! listing is exhausted the queue's tail flags force a repair pass
//! (`fill_tail_holes`) that syncs the watermark to the *unfiltered* tail;
//! only then can live pushes chain, because pushes carry every transaction
//! while pages carry only the filtered ones. A live push that fails to
//! chain after that re-marks the hole and the repair runs again; a hole too
//! wide for one repair page drops the assembler back to paged backfill.

use std::collections::HashSet;

use anyhow::Result;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use kst_api::{fetch_page, locate, KristClient, Order, Transaction, TransactionFilter, PAGE_LIMIT};
use kst_state::{next_event, Bus, StreamEvent};

use crate::queue::{PageOutcome, TransactionQueue};

#[derive(Debug)]
struct Inner {
    queue: TransactionQueue,
    /// Ascending listing offset just past the last page-ingested entry.
    /// `None` until (re)located.
    next_offset: Option<u64>,
    /// Whether `next_offset` chains off an entry we ingested, making the
    /// one-entry overlap check valid.
    anchored: bool,
}

/// The assembled, gap-free transaction feed.
#[derive(Debug)]
pub struct TransactionStream {
    client: KristClient,
    filter: TransactionFilter,
    bus: Bus,
    inner: Mutex<Inner>,
}

impl TransactionStream {
    pub fn new(client: KristClient, filter: TransactionFilter, bus: Bus, last_popped_id: i64) -> Self {
        Self {
            client,
            inner: Mutex::new(Inner {
                queue: TransactionQueue::new(filter.clone(), last_popped_id),
                next_offset: None,
                anchored: false,
            }),
            filter,
            bus,
        }
    }

    /// Offer a live socket push. Returns whether it chained.
    pub async fn push_live(&self, tx: Transaction) -> bool {
        let mut inner = self.inner.lock().await;
        let id = tx.id;
        let accepted = inner.queue.try_push_transaction(tx);
        if !accepted && inner.queue.tail_hole() {
            warn!(id, last_seen = inner.queue.last_seen_id(), "live push left a tail hole");
        }
        accepted
    }

    /// Pop the next transaction if one is ready.
    pub async fn try_pop(&self) -> Option<Transaction> {
        self.inner.lock().await.queue.pop()
    }

    /// Block until a transaction is poppable.
    pub async fn wait(&self) -> Result<()> {
        loop {
            // Subscribe before inspecting state so a push that lands in the
            // gap still wakes us.
            let mut rx = self.bus.subscribe();
            let (poppable, reached_tail, tail_hole) = {
                let inner = self.inner.lock().await;
                (
                    inner.queue.has_poppable(),
                    inner.queue.reached_tail(),
                    inner.queue.tail_hole(),
                )
            };
            if poppable {
                return Ok(());
            }
            if reached_tail {
                if tail_hole {
                    self.fill_tail_holes().await?;
                } else {
                    next_event(&mut rx, |e| matches!(e, StreamEvent::SocketStatus { .. })).await;
                }
            } else {
                self.populate().await?;
            }
        }
    }

    /// Fetch and ingest the next backfill page, re-locating the listing
    /// offset when the overlap check reveals a deletion.
    async fn populate(&self) -> Result<()> {
        let plan = {
            let inner = self.inner.lock().await;
            inner
                .next_offset
                .map(|offset| (offset, inner.anchored))
                .ok_or(inner.queue.last_seen_id())
        };
        let (offset, anchored) = match plan {
            Ok(plan) => plan,
            Err(anchor) => {
                match locate(&self.client, &self.filter, anchor).await? {
                    Some(found) => {
                        debug!(anchor, offset = found.offset, exact = found.exact, "located backfill offset");
                        let mut inner = self.inner.lock().await;
                        inner.next_offset = Some(found.offset + u64::from(found.exact));
                        inner.anchored = found.exact;
                    }
                    None => {
                        // Empty listing: nothing to backfill.
                        self.inner.lock().await.queue.note_backfill_exhausted();
                    }
                }
                return Ok(());
            }
        };

        // Fetch one offset early so the page overlaps the last ingested
        // entry; a missing overlap means it was deleted on the node.
        let (fetch_offset, overlap) = if anchored && offset > 0 {
            (offset - 1, true)
        } else {
            (offset, false)
        };
        let page = fetch_page(
            &self.client,
            &self.filter,
            Order::Asc,
            fetch_offset,
            PAGE_LIMIT,
        )
        .await?;

        let mut inner = self.inner.lock().await;
        match inner.queue.try_push_page(&page.transactions, overlap) {
            PageOutcome::Accepted { appended } => {
                debug!(fetch_offset, appended, "backfill page ingested");
                let consumed = fetch_offset + page.transactions.len() as u64;
                inner.next_offset = Some(consumed);
                inner.anchored = true;
                if consumed >= page.total {
                    inner.queue.note_backfill_exhausted();
                }
            }
            PageOutcome::Rejected => {
                warn!(fetch_offset, "backfill page rejected; relocating offset");
                inner.next_offset = None;
                inner.anchored = false;
            }
        }
        Ok(())
    }

    /// Repair the gap between the filtered watermark and the node's
    /// unfiltered tail.
    ///
    /// The superset tail page is fetched strictly before the filtered tail
    /// page: anything the filtered page shows beyond the superset window
    /// proves a race and the repair retries. Advancing the watermark to the
    /// superset tail is sound only when the filtered page demonstrably
    /// covers the whole hole (it overlaps the seen region or spans the
    /// entire filtered set); otherwise the hole is wider than a page and the
    /// assembler falls back to paged backfill.
    async fn fill_tail_holes(&self) -> Result<()> {
        let superset = TransactionFilter::superset();
        let next = fetch_page(&self.client, &superset, Order::Desc, 0, PAGE_LIMIT).await?;
        let last = fetch_page(&self.client, &self.filter, Order::Desc, 0, PAGE_LIMIT).await?;

        let mut inner = self.inner.lock().await;
        let seen = inner.queue.last_seen_id();

        let last_total = last.total;
        let mut last_asc: Vec<Transaction> = last.transactions;
        last_asc.reverse();

        let covers = last_asc.first().map_or(true, |oldest| oldest.id <= seen)
            || last_total as usize <= last_asc.len();
        if !covers {
            warn!(seen, "tail hole wider than a page; resuming backfill");
            inner.queue.abandon_tail();
            inner.next_offset = None;
            inner.anchored = false;
            return Ok(());
        }

        let next_ids: HashSet<i64> = next.transactions.iter().map(|tx| tx.id).collect();
        let watermark = next
            .transactions
            .first()
            .map(|tx| tx.id)
            .unwrap_or(seen);
        let fresh: Vec<Transaction> = last_asc.into_iter().filter(|tx| tx.id > seen).collect();
        if fresh.iter().any(|tx| !next_ids.contains(&tx.id)) {
            // The filtered page saw entries the earlier superset query did
            // not: new arrivals raced the repair. Retry on the next pass.
            debug!(seen, "tail repair raced new arrivals; retrying");
            return Ok(());
        }

        debug!(seen, watermark, appended = fresh.len(), "tail hole closed");
        inner.queue.push_unseen(fresh, watermark);
        // Page bookkeeping is stale once the watermark jumps.
        inner.next_offset = None;
        inner.anchored = false;
        Ok(())
    }
}
