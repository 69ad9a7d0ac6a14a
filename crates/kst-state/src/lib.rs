//! kst-state
//!
//! Everything the pipeline must not lose across a crash: the boxes data
//! model (inbox slot, outbox queue, revision counter), the single-document
//! state store with its two-phase file protocol and revision recovery, and
//! the shared store cell (cooperative mutex + event bus) that serializes all
//! durable access.

pub mod boxes;
pub mod cell;
pub mod store;

pub use boxes::{Boxes, OutboxEntry, SendStatus, StatusError};
pub use cell::{deadline_after, next_event, Bus, StoreCell, StoreGuard, StreamEvent};
pub use store::{StateStore, StoredState, StreamConfig, CREATE_FILE, PENDING_FILE, STATE_FILE};
