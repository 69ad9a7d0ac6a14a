//! The stream facade: creation, recovery, the three concurrent workers, and
//! the user-facing operations.
//!
//! `run` drives everything as one task: the inbox worker (assembler →
//! inbox slot → `on_transaction`), the outbox worker (head entry → node →
//! send hooks), and the push socket. All three borrow the same internals;
//! durable state moves only under the store cell's mutex, so hook frames
//! never overlap and every commit is serialized.

use std::cell::RefCell;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{info, warn};
use uuid::Uuid;

use kst_api::{
    fetch_page, retry_idempotent, serialize_meta_with_ref, ApiError, KristClient, Order,
    SendError, SendRequest, TransactionFilter,
};
use kst_state::{
    deadline_after, next_event, Bus, SendStatus, StateStore, StoreCell, StoreGuard, StreamConfig,
    StreamEvent,
};

use crate::assembler::TransactionStream;
use crate::handler::Handler;
use crate::idgen::RefSource;
use crate::socket::{run_push_socket, SocketContext};
use crate::view::{run_hook, BoxView, HookOutcome};

const SEND_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Outcome of driving the outbox head to a resolution.
enum SendDisposition {
    Delivered,
    Refused(SendError),
}

/// A reliable transaction stream bound to one state directory.
pub struct Stream {
    cell: StoreCell,
    client: KristClient,
    assembler: TransactionStream,
    refs: StdMutex<RefSource>,
    up: AtomicBool,
    shutdown: watch::Sender<bool>,
    run_guard: tokio::sync::Mutex<()>,
}

impl Stream {
    /// Create a fresh state directory against `endpoint`.
    ///
    /// Probes the node for its newest transaction id so the new stream
    /// starts observing from "now" instead of replaying all history.
    pub async fn create(
        dir: &Path,
        endpoint: &str,
        address: Option<String>,
        include_mined: bool,
    ) -> Result<()> {
        let client = KristClient::new(endpoint);
        let tail = fetch_page(&client, &TransactionFilter::superset(), Order::Desc, 0, 1)
            .await
            .context("probe node for newest transaction")?;
        let last_popped_id = tail.transactions.first().map(|tx| tx.id).unwrap_or(-1);
        let config = StreamConfig {
            endpoint: endpoint.to_string(),
            address,
            include_mined,
        };
        StateStore::create(dir, config, last_popped_id)?;
        info!(dir = %dir.display(), last_popped_id, "stream created");
        Ok(())
    }

    /// Open an existing state directory.
    ///
    /// Pass the revision recorded by a `Prepare` callback to promote the
    /// matching prepared snapshot; without it (or with a stale one) the
    /// snapshot is discarded and the previous committed state wins.
    pub fn open(dir: &Path, revision: Option<u64>) -> Result<Self> {
        let store = StateStore::open(dir, revision)?;
        let config = store.state.config.clone();
        let last_popped_id = store.state.last_popped_id;
        let client = KristClient::new(&config.endpoint);
        let bus = Bus::new();
        let assembler = TransactionStream::new(
            client.clone(),
            config.filter(),
            bus.clone(),
            last_popped_id,
        );
        Ok(Self {
            cell: StoreCell::new(store, bus),
            client,
            assembler,
            refs: StdMutex::new(RefSource::new()),
            up: AtomicBool::new(false),
            shutdown: watch::Sender::new(false),
            run_guard: tokio::sync::Mutex::new(()),
        })
    }

    /// Run the pipeline until it fails or [`close`](Self::close) is called.
    ///
    /// The three workers run cooperatively on the calling task. A hook
    /// failure (or any fatal error) tears all of them down and surfaces
    /// here; reopening the directory resumes exactly where the last commit
    /// left off.
    pub async fn run<H: Handler + ?Sized>(&self, handler: &mut H) -> Result<()> {
        let _running = self
            .run_guard
            .try_lock()
            .map_err(|_| anyhow!("stream is already running"))?;
        self.shutdown.send_replace(false);
        let handler = RefCell::new(handler);
        let socket = SocketContext {
            client: &self.client,
            bus: self.cell.bus(),
            assembler: &self.assembler,
            refs: &self.refs,
            up: &self.up,
            shutdown: self.shutdown.subscribe(),
        };
        tokio::try_join!(
            self.inbox_worker(&handler, self.shutdown.subscribe()),
            self.outbox_worker(&handler, self.shutdown.subscribe()),
            run_push_socket(socket),
        )?;
        Ok(())
    }

    /// Stop the socket and let both workers drain; `run` then returns.
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }

    /// Last known liveness of the push socket.
    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Relaxed)
    }

    /// Current balance of an address, with transport retries bounded by
    /// `timeout`.
    pub async fn get_balance(&self, address: &str, timeout: Option<Duration>) -> Result<i64> {
        let found = retry_idempotent(deadline_after(timeout), || {
            self.client.get_address(address)
        })
        .await?;
        Ok(found.balance)
    }

    /// Run `body` as a hook frame of its own. Returns `false` when the
    /// state mutex could not be acquired before `timeout`; once the body
    /// runs, it runs to completion and commits atomically.
    pub async fn begin<F>(&self, body: F, timeout: Option<Duration>) -> Result<bool>
    where
        F: FnOnce(&mut BoxView<'_>) -> Result<HookOutcome>,
    {
        let mut guard = match deadline_after(timeout) {
            Some(deadline) => match self.cell.try_lock_until(deadline).await? {
                Some(guard) => guard,
                None => return Ok(false),
            },
            None => self.cell.lock().await?,
        };
        run_hook(&mut guard, &self.refs, body)?;
        Ok(true)
    }

    /// Enqueue one outgoing transaction. Returns its tracking id, or `None`
    /// when the mutex was not acquired before `timeout`.
    pub async fn send(
        &self,
        transaction: SendRequest,
        timeout: Option<Duration>,
    ) -> Result<Option<Uuid>> {
        let mut id = None;
        let ran = self
            .begin(
                |view| {
                    id = Some(view.enqueue_send(transaction));
                    Ok(HookOutcome::Done)
                },
                timeout,
            )
            .await?;
        Ok(if ran { id } else { None })
    }

    // -----------------------------------------------------------------------
    // Inbox worker
    // -----------------------------------------------------------------------

    async fn inbox_worker<H: Handler + ?Sized>(
        &self,
        handler: &RefCell<&mut H>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            let Some(mut guard) = self.fetch_inbox(&mut shutdown).await? else {
                return Ok(());
            };
            run_hook(&mut guard, &self.refs, |view| {
                let Some(tx) = view.take_inbox() else {
                    return Ok(HookOutcome::Done);
                };
                handler.borrow_mut().on_transaction(view, &tx)
            })?;
        }
    }

    /// Acquire the store with a filled inbox slot.
    ///
    /// An already-filled slot is returned as-is: the previous hook attempt
    /// did not commit and the entry must be redelivered. Otherwise the slot
    /// is filled from the assembler, writing the inbox and the delivery
    /// watermark in one durable commit. `Ok(None)` means shutdown.
    async fn fetch_inbox(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<StoreGuard<'_>>> {
        loop {
            if *shutdown.borrow() {
                return Ok(None);
            }
            let guard = self.cell.lock().await?;
            if guard.state.committed.inbox.is_some() {
                return Ok(Some(guard));
            }
            drop(guard);

            tokio::select! {
                waited = self.assembler.wait() => waited?,
                _ = shutdown.changed() => continue,
            }

            let mut guard = self.cell.lock().await?;
            if guard.state.committed.inbox.is_some() {
                return Ok(Some(guard));
            }
            if let Some(tx) = self.assembler.try_pop().await {
                guard.state.last_popped_id = tx.id;
                guard.state.committed.inbox = Some(tx);
                guard.commit().context("commit popped inbox entry")?;
                return Ok(Some(guard));
            }
            // Lost the entry to a racing pass; wait again.
        }
    }

    // -----------------------------------------------------------------------
    // Outbox worker
    // -----------------------------------------------------------------------

    async fn outbox_worker<H: Handler + ?Sized>(
        &self,
        handler: &RefCell<&mut H>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            let mut guard = self.cell.lock().await?;
            let Some(entry) = guard.state.committed.outbox_head().cloned() else {
                // Subscribe before releasing: the first unlock event is our
                // own release, the second means someone else held the store
                // since, so an enqueue may have landed.
                let mut rx = self.cell.bus().subscribe();
                drop(guard);
                for _ in 0..2 {
                    tokio::select! {
                        _ = next_event(&mut rx, |e| matches!(e, StreamEvent::MutexUnlocked)) => {}
                        _ = shutdown.changed() => return Ok(()),
                    }
                }
                continue;
            };

            match self.send_head(&mut guard).await? {
                SendDisposition::Delivered => {
                    run_hook(&mut guard, &self.refs, |view| {
                        handler
                            .borrow_mut()
                            .on_send_success(view, &entry.transaction, entry.id)
                    })?;
                    if guard.state.committed.outbox_head().map(|e| e.id) == Some(entry.id) {
                        warn!(id = %entry.id, "send-success hook left the delivered entry at the outbox head");
                    }
                }
                SendDisposition::Refused(error) => {
                    run_hook(&mut guard, &self.refs, |view| {
                        handler
                            .borrow_mut()
                            .on_send_failure(view, &entry.transaction, entry.id, &error)
                    })?;
                }
            }
        }
    }

    /// Drive the outbox head to a resolution, holding the store throughout.
    ///
    /// The status walk is what makes delivery exactly-once from the node's
    /// perspective: `Unknown` goes to disk *before* the POST leaves, so a
    /// crash anywhere around the network call lands in the resolver on
    /// restart. The dedup ref is searched, and only a confirmed absence
    /// re-arms the entry as `Pending`.
    async fn send_head(&self, store: &mut StateStore) -> Result<SendDisposition> {
        loop {
            let entry = store
                .state
                .committed
                .outbox_head()
                .cloned()
                .context("outbox head vanished mid-send")?;
            match entry.status {
                SendStatus::Sent => return Ok(SendDisposition::Delivered),
                SendStatus::Unknown => {
                    let matches = retry_idempotent(None, || {
                        self.client.search_ref_matches(entry.dedup_ref)
                    })
                    .await?;
                    let head = store
                        .state
                        .committed
                        .outbox_head_mut()
                        .context("outbox head vanished mid-send")?;
                    if matches > 0 {
                        info!(id = %entry.id, "unknown send resolved as delivered");
                        head.transition(SendStatus::Sent)?;
                        store.commit()?;
                        return Ok(SendDisposition::Delivered);
                    }
                    head.transition(SendStatus::Pending)?;
                    store.commit()?;
                }
                SendStatus::Pending => {
                    let metadata =
                        serialize_meta_with_ref(&entry.transaction.meta, entry.dedup_ref);
                    store
                        .state
                        .committed
                        .outbox_head_mut()
                        .context("outbox head vanished mid-send")?
                        .transition(SendStatus::Unknown)?;
                    store.commit()?;

                    match self
                        .client
                        .post_transaction(&entry.transaction, &metadata)
                        .await
                    {
                        Ok(()) => {
                            store
                                .state
                                .committed
                                .outbox_head_mut()
                                .context("outbox head vanished mid-send")?
                                .transition(SendStatus::Sent)?;
                            store.commit()?;
                            return Ok(SendDisposition::Delivered);
                        }
                        Err(ApiError::Api(refusal)) => {
                            store
                                .state
                                .committed
                                .outbox_head_mut()
                                .context("outbox head vanished mid-send")?
                                .transition(SendStatus::Pending)?;
                            store.commit()?;
                            return Ok(SendDisposition::Refused(refusal));
                        }
                        Err(err) if err.is_transport() => {
                            warn!(%err, id = %entry.id, "send outcome unknown; resolving by ref");
                            sleep(SEND_RETRY_DELAY).await;
                            // Status stays Unknown; the next pass resolves.
                        }
                        Err(err) => {
                            // Decode/deadline here means the node broke the
                            // protocol; the stream must not guess.
                            return Err(err).context("transaction POST returned nonsense");
                        }
                    }
                }
            }
        }
    }
}
