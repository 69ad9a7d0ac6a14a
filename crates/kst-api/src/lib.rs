//! kst-api
//!
//! The remote node's HTTP surface: wire and decoded transaction types, the
//! CommonMeta codec, the observation filter, a typed endpoint client with a
//! deadline-bounded retry layer, the paged listing reader with its offset
//! locator, and wallet helpers (v2 address derivation, refunds).
//!
//! This crate performs no state persistence and holds no stream logic; it is
//! the boundary the rest of the workspace talks to the node through.

pub mod client;
pub mod filter;
pub mod meta;
pub mod pages;
pub mod types;
pub mod wallet;

pub use client::{
    retry_idempotent, Address, ApiError, KristClient, Order, SendError, TransactionPage,
};
pub use filter::TransactionFilter;
pub use meta::{parse_meta, serialize_meta, serialize_meta_with_ref, REF_KEY, RETURN_KEY};
pub use pages::{fetch_page, locate, Located, PAGE_LIMIT};
pub use types::{parse_time, ApiTransaction, SendRequest, Transaction, TransactionKind};
pub use wallet::{make_refund_for, make_v2_address};
