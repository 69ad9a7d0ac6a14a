//! The box record: one inbox slot plus the ordered outbox, snapshotted under
//! a monotonically increasing revision.
//!
//! # Outbox status machine
//!
//! ```text
//!              POST issued                resolver: ref found
//!   Pending ───────────────► Unknown ───────────────────────► Sent (terminal)
//!      ▲                        │
//!      └────────────────────────┘
//!        resolver: ref absent / structured API error
//! ```
//!
//! `Unknown` is the on-disk state while a POST's outcome is not yet known;
//! its only exits are through the search-based resolver. `Sent` is terminal
//! until the entry is removed by a send hook.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use kst_api::{SendRequest, Transaction};

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Delivery status of an outbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendStatus {
    /// Not yet handed to the node.
    Pending,
    /// A POST was issued; its outcome is not on disk yet.
    Unknown,
    /// Confirmed on the node. Terminal prior to removal.
    Sent,
}

impl SendStatus {
    /// Whether `self → next` is a legal transition.
    pub fn may_become(self, next: SendStatus) -> bool {
        matches!(
            (self, next),
            (SendStatus::Pending, SendStatus::Unknown)
                | (SendStatus::Unknown, SendStatus::Pending)
                | (SendStatus::Unknown, SendStatus::Sent)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SendStatus::Sent)
    }
}

/// Returned when an outbox entry is driven through an illegal transition.
/// Callers must treat this as a pipeline inconsistency, not retry it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusError {
    pub from: SendStatus,
    pub to: SendStatus,
}

impl fmt::Display for StatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "illegal outbox transition: {:?} -> {:?}", self.from, self.to)
    }
}

impl std::error::Error for StatusError {}

// ---------------------------------------------------------------------------
// Outbox entry
// ---------------------------------------------------------------------------

/// One queued outgoing transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// User-facing tracking id, assigned at enqueue.
    pub id: Uuid,
    /// Dedup token attached as `ref=<uuid>` in the outgoing metadata. Stable
    /// across every retry of this entry; the node-side idempotency key.
    #[serde(rename = "ref")]
    pub dedup_ref: Uuid,
    pub status: SendStatus,
    pub transaction: SendRequest,
}

impl OutboxEntry {
    pub fn new(id: Uuid, dedup_ref: Uuid, transaction: SendRequest) -> Self {
        Self {
            id,
            dedup_ref,
            status: SendStatus::Pending,
            transaction,
        }
    }

    /// Drive the entry's status forward, rejecting illegal transitions.
    pub fn transition(&mut self, next: SendStatus) -> Result<(), StatusError> {
        if !self.status.may_become(next) {
            return Err(StatusError {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Boxes
// ---------------------------------------------------------------------------

/// The pair (inbox slot, outbox queue) under a revision counter.
///
/// The revision increments every time a hook context is opened over this
/// record; it is the handshake token between the stream and any coordinating
/// external store.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Boxes {
    pub revision: u64,
    /// At most one incoming transaction awaiting user processing.
    pub inbox: Option<Transaction>,
    /// Ordered queue of outgoing sends; index 0 is dispatched first.
    pub outbox: Vec<OutboxEntry>,
}

impl Boxes {
    pub fn outbox_head(&self) -> Option<&OutboxEntry> {
        self.outbox.first()
    }

    pub fn outbox_head_mut(&mut self) -> Option<&mut OutboxEntry> {
        self.outbox.first_mut()
    }

    /// Remove an outbox entry by tracking id.
    pub fn remove_outbox(&mut self, id: Uuid) -> Option<OutboxEntry> {
        let pos = self.outbox.iter().position(|entry| entry.id == id)?;
        Some(self.outbox.remove(pos))
    }
}
