//! The in-memory gap-free buffer between the two ingestion paths (paged
//! backfill, live socket pushes) and the inbox worker.
//!
//! # Invariant
//!
//! `last_seen_id` is a global watermark: every transaction on the node with
//! an id at or below it has been examined, and the ones passing the filter
//! that have not yet been popped sit in the buffer in ascending id order.
//! Pops deliver strictly increasing ids with no gaps within the filtered
//! set.
//!
//! # Tail flags
//!
//! - `reached_tail`: the watermark is believed to equal the node's newest
//!   transaction id.
//! - `tail_hole`: a live push was rejected after the tail was reached, so
//!   transactions exist between the watermark and the push; the hole must be
//!   repaired from pages before live pushes can chain again.

use std::collections::VecDeque;

use kst_api::{Transaction, TransactionFilter};

/// Result of offering a backfill page to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOutcome {
    /// The page chained onto the watermark; `appended` new entries ingested.
    Accepted { appended: usize },
    /// The page does not chain (missing overlap entry or id disorder); the
    /// caller must re-locate its offset.
    Rejected,
}

#[derive(Debug)]
pub struct TransactionQueue {
    filter: TransactionFilter,
    buf: VecDeque<Transaction>,
    last_seen_id: i64,
    reached_tail: bool,
    tail_hole: bool,
}

impl TransactionQueue {
    pub fn new(filter: TransactionFilter, last_popped_id: i64) -> Self {
        Self {
            filter,
            buf: VecDeque::new(),
            last_seen_id: last_popped_id,
            reached_tail: false,
            tail_hole: false,
        }
    }

    pub fn last_seen_id(&self) -> i64 {
        self.last_seen_id
    }

    pub fn reached_tail(&self) -> bool {
        self.reached_tail
    }

    pub fn tail_hole(&self) -> bool {
        self.tail_hole
    }

    pub fn has_poppable(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Deliver the next filtered transaction, advancing the pop watermark
    /// past any filtered-out ids.
    pub fn pop(&mut self) -> Option<Transaction> {
        self.buf.pop_front()
    }

    /// Offer a live push. Accepted only when it chains directly onto the
    /// watermark; a rejection after the tail was reached marks a hole.
    pub fn try_push_transaction(&mut self, tx: Transaction) -> bool {
        if tx.id == self.last_seen_id + 1 {
            self.last_seen_id = tx.id;
            if self.filter.matches(&tx) {
                self.buf.push_back(tx);
            }
            self.reached_tail = true;
            self.tail_hole = false;
            true
        } else {
            if self.reached_tail {
                self.tail_hole = true;
            }
            false
        }
    }

    /// Offer one ascending backfill page.
    ///
    /// With `anchored`, the page was fetched one offset early and its first
    /// entry must be the watermark transaction itself (the overlap that
    /// detects deletions); the rest is ingested. Without it, every entry
    /// must lie beyond the watermark and all are ingested. Any id disorder
    /// or watermark violation rejects the whole page.
    pub fn try_push_page(&mut self, page: &[Transaction], anchored: bool) -> PageOutcome {
        let fresh: &[Transaction] = if anchored {
            match page.first() {
                Some(first) if first.id == self.last_seen_id => &page[1..],
                _ => return PageOutcome::Rejected,
            }
        } else {
            page
        };
        let mut prev = self.last_seen_id;
        for tx in fresh {
            if tx.id <= prev {
                return PageOutcome::Rejected;
            }
            prev = tx.id;
        }
        for tx in fresh {
            self.last_seen_id = tx.id;
            if self.filter.matches(tx) {
                self.buf.push_back(tx.clone());
            }
        }
        PageOutcome::Accepted {
            appended: fresh.len(),
        }
    }

    /// Ingest hole-repair candidates and advance the watermark to the
    /// verified superset tail. Candidates must already be ascending and
    /// beyond the watermark; the caller established that with the coverage
    /// and subset checks.
    pub fn push_unseen(&mut self, fresh: Vec<Transaction>, watermark: i64) {
        for tx in fresh {
            if tx.id > self.last_seen_id && self.filter.matches(&tx) {
                self.last_seen_id = tx.id;
                self.buf.push_back(tx);
            }
        }
        self.last_seen_id = self.last_seen_id.max(watermark);
        self.tail_hole = false;
    }

    /// The backfill reader exhausted the listing: the watermark is at the
    /// filtered tail. A repair pass is forced so the watermark can be
    /// synced to the unfiltered tail before live pushes are trusted.
    pub fn note_backfill_exhausted(&mut self) {
        self.reached_tail = true;
        self.tail_hole = true;
    }

    /// A repair pass could not cover the hole; fall back to paged backfill.
    pub fn abandon_tail(&mut self) {
        self.reached_tail = false;
        self.tail_hole = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kst_api::ApiTransaction;

    fn tx(id: i64) -> Transaction {
        Transaction::decode(ApiTransaction {
            id,
            from: Some("kfrom00000".into()),
            to: "kto0000000".into(),
            value: 1,
            time: "2021-01-01T00:00:00.000Z".into(),
            kind: "transfer".into(),
            name: None,
            metadata: None,
        })
        .unwrap()
    }

    fn queue(last_popped: i64) -> TransactionQueue {
        TransactionQueue::new(TransactionFilter::superset(), last_popped)
    }

    #[test]
    fn live_push_chains_on_watermark() {
        let mut q = queue(10);
        assert!(q.try_push_transaction(tx(11)));
        assert!(q.reached_tail());
        assert!(!q.tail_hole());
        assert_eq!(q.pop().map(|t| t.id), Some(11));
    }

    #[test]
    fn rejected_push_after_tail_marks_hole() {
        let mut q = queue(10);
        assert!(q.try_push_transaction(tx(11)));
        assert!(!q.try_push_transaction(tx(14)));
        assert!(q.tail_hole());
        // Before the tail is reached a reject is not a hole.
        let mut cold = queue(10);
        assert!(!cold.try_push_transaction(tx(14)));
        assert!(!cold.tail_hole());
    }

    #[test]
    fn page_with_gap_rejected_overlap_accepted() {
        let mut q = queue(10);
        // Anchored page missing the overlap entry: gap.
        assert_eq!(
            q.try_push_page(&[tx(12), tx(13)], true),
            PageOutcome::Rejected,
        );
        // Overlapping page chains.
        assert_eq!(
            q.try_push_page(&[tx(10), tx(11), tx(12)], true),
            PageOutcome::Accepted { appended: 2 },
        );
        assert_eq!(q.last_seen_id(), 12);
        assert_eq!(q.pop().map(|t| t.id), Some(11));
        assert_eq!(q.pop().map(|t| t.id), Some(12));
    }

    #[test]
    fn disordered_page_rejected() {
        let mut q = queue(-1);
        assert_eq!(
            q.try_push_page(&[tx(2), tx(1)], false),
            PageOutcome::Rejected,
        );
        assert_eq!(q.try_push_page(&[tx(1), tx(2)], false), PageOutcome::Accepted { appended: 2 });
    }

    #[test]
    fn filtered_out_entries_advance_watermark_without_buffering() {
        let filter = TransactionFilter {
            address: Some("kme0000000".into()),
            include_mined: true,
        };
        let mut q = TransactionQueue::new(filter, 0);
        // Chained pushes to an unrelated address are seen but not buffered.
        assert!(q.try_push_transaction(tx(1)));
        assert!(!q.has_poppable());
        assert_eq!(q.last_seen_id(), 1);
    }

    #[test]
    fn unseen_batch_closes_hole() {
        let mut q = queue(10);
        q.note_backfill_exhausted();
        assert!(q.tail_hole());
        q.push_unseen(vec![tx(12), tx(15)], 16);
        assert!(!q.tail_hole());
        assert_eq!(q.last_seen_id(), 16);
        assert_eq!(q.pop().map(|t| t.id), Some(12));
        assert_eq!(q.pop().map(|t| t.id), Some(15));
        // Now a push chaining on the synced watermark is accepted.
        assert!(q.try_push_transaction(tx(17)));
    }
}
