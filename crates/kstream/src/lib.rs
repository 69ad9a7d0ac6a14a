//! kstream
//!
//! A reliable client for a Krist-style currency node. Every transaction the
//! node observes is delivered to a user hook exactly in order, and outgoing
//! transactions are sent at least once with a searchable dedup tag,
//! across process crashes and reboots.
//!
//! The moving parts: a disk-backed state document with a two-phase commit
//! protocol ([`kst_state`]), a gap-free merge of paged backfill and live
//! socket pushes ([`assembler`]), and an outbox whose send algorithm writes
//! its uncertainty to disk *before* every network attempt so a restart can
//! resolve it by searching for the dedup ref ([`stream`]).
//!
//! # Getting started
//!
//! ```no_run
//! use kstream::{Handler, HookOutcome, Stream, Transaction};
//!
//! struct Printer;
//!
//! impl Handler for Printer {
//!     fn on_transaction(
//!         &mut self,
//!         _view: &mut kstream::BoxView<'_>,
//!         tx: &Transaction,
//!     ) -> anyhow::Result<HookOutcome> {
//!         println!("{} -> {}: {}", tx.from.as_deref().unwrap_or("(mined)"), tx.to, tx.value);
//!         Ok(HookOutcome::Done)
//!     }
//! }
//!
//! # async fn demo() -> anyhow::Result<()> {
//! Stream::create("state".as_ref(), "https://krist.dev", None, false).await?;
//! let stream = Stream::open("state".as_ref(), None)?;
//! stream.run(&mut Printer).await?;
//! # Ok(())
//! # }
//! ```

pub mod assembler;
pub mod handler;
pub mod idgen;
pub mod queue;
pub mod socket;
pub mod stream;
pub mod view;

pub use assembler::TransactionStream;
pub use handler::Handler;
pub use idgen::RefSource;
pub use queue::{PageOutcome, TransactionQueue};
pub use stream::Stream;
pub use view::{BoxView, HookOutcome};

pub use kst_api::{
    make_refund_for, make_v2_address, parse_meta, serialize_meta, Address, ApiError, SendError,
    SendRequest, Transaction, TransactionFilter, TransactionKind,
};
pub use kst_state::{Boxes, OutboxEntry, SendStatus, StreamConfig};
