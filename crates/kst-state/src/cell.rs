//! Shared ownership of the state store: one cooperative async mutex plus a
//! broadcast event bus.
//!
//! Every durable read or write of the committed/prepared boxes happens while
//! holding the guard handed out here. Dropping the guard broadcasts
//! [`StreamEvent::MutexUnlocked`] so waiters that coalesce on "the store just
//! changed hands" (the outbox worker's empty-queue wait) can wake without
//! polling. The bus also carries the push socket's liveness transitions.

use std::ops::{Deref, DerefMut};
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::{broadcast, Mutex, MutexGuard};
use tokio::time::Instant;

use crate::store::StateStore;

const BUS_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Event bus
// ---------------------------------------------------------------------------

/// Events multiplexed over the stream's broadcast bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    /// The state mutex was released.
    MutexUnlocked,
    /// The push socket changed (or re-asserted) liveness.
    SocketStatus { up: bool },
}

/// Cheap cloneable handle to the broadcast bus.
#[derive(Debug, Clone)]
pub struct Bus {
    tx: broadcast::Sender<StreamEvent>,
}

impl Bus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: StreamEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.tx.subscribe()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

/// Await the next occurrence of `wanted` on a subscription.
///
/// Lagged receivers resume at the stream head; a lag is treated as a wake,
/// which is sound for every waiter here (they all re-check state after
/// waking).
pub async fn next_event(
    rx: &mut broadcast::Receiver<StreamEvent>,
    wanted: impl Fn(&StreamEvent) -> bool,
) {
    loop {
        match rx.recv().await {
            Ok(event) if wanted(&event) => return,
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(_)) => return,
            Err(broadcast::error::RecvError::Closed) => {
                // Sender gone: nothing will ever match. Yield to the caller,
                // whose state re-check will decide what to do.
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Store cell
// ---------------------------------------------------------------------------

/// The store behind its mutex, with the bus it signals on.
#[derive(Debug)]
pub struct StoreCell {
    store: Mutex<StateStore>,
    bus: Bus,
}

impl StoreCell {
    pub fn new(store: StateStore, bus: Bus) -> Self {
        Self {
            store: Mutex::new(store),
            bus,
        }
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Acquire the store.
    ///
    /// A prepared snapshot visible here is an invariant violation: only
    /// `open` may ever observe one, and it resolves it before the cell is
    /// constructed. The error is fatal to the stream.
    pub async fn lock(&self) -> Result<StoreGuard<'_>> {
        let guard = self.store.lock().await;
        if guard.state.prepared.is_some() {
            bail!("prepared state visible outside recovery; state is corrupt");
        }
        Ok(StoreGuard {
            guard: Some(guard),
            bus: self.bus.clone(),
        })
    }

    /// Like [`lock`](Self::lock), but gives up at `deadline`. `Ok(None)`
    /// means the deadline expired while waiting.
    pub async fn try_lock_until(&self, deadline: Instant) -> Result<Option<StoreGuard<'_>>> {
        let wait = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(wait, self.lock()).await {
            Ok(locked) => locked.map(Some),
            Err(_elapsed) => Ok(None),
        }
    }
}

/// Mutex guard over the store; dropping it signals `MutexUnlocked`.
pub struct StoreGuard<'a> {
    guard: Option<MutexGuard<'a, StateStore>>,
    bus: Bus,
}

impl Deref for StoreGuard<'_> {
    type Target = StateStore;

    fn deref(&self) -> &StateStore {
        self.guard.as_deref().expect("guard taken before drop")
    }
}

impl DerefMut for StoreGuard<'_> {
    fn deref_mut(&mut self) -> &mut StateStore {
        self.guard.as_deref_mut().expect("guard taken before drop")
    }
}

impl Drop for StoreGuard<'_> {
    fn drop(&mut self) {
        // Release the mutex before telling waiters about it.
        drop(self.guard.take());
        self.bus.publish(StreamEvent::MutexUnlocked);
    }
}

/// Convenience: a deadline `timeout` from now, or `None` for "wait forever".
pub fn deadline_after(timeout: Option<Duration>) -> Option<Instant> {
    timeout.map(|t| Instant::now() + t)
}
