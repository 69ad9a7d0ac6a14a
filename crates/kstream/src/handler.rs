//! The hook capability record handed to [`Stream::run`].
//!
//! All three hooks run inside the state mutex hold and must not suspend;
//! long work belongs outside the hook, keyed by the entry's tracking id.
//! A hook's durable effects go through the [`BoxView`] it receives and take
//! effect atomically when the hook returns `Ok`.
//!
//! [`Stream::run`]: crate::stream::Stream::run

use anyhow::Result;
use uuid::Uuid;

use kst_api::{SendError, SendRequest, Transaction};

use crate::view::{BoxView, HookOutcome};

/// User hooks driven by the stream's workers.
///
/// `on_transaction` is mandatory; it is the point of the pipeline. The send
/// hooks default to removing the dispatched entry and committing, which is
/// the right behavior for fire-and-forget senders; override them to react
/// to outcomes, and make sure an override still removes the entry, or the
/// outbox head never advances.
pub trait Handler {
    /// An observed transaction is ready. Runs at least once per
    /// transaction; a failure aborts the working copy and the same
    /// transaction is redelivered on the next run.
    fn on_transaction(&mut self, view: &mut BoxView<'_>, tx: &Transaction) -> Result<HookOutcome>;

    /// The outbox head was confirmed on the node.
    fn on_send_success(
        &mut self,
        view: &mut BoxView<'_>,
        request: &SendRequest,
        id: Uuid,
    ) -> Result<HookOutcome> {
        let _ = request;
        view.remove_outbox(id);
        Ok(HookOutcome::Done)
    }

    /// The node refused the outbox head with a structured error.
    fn on_send_failure(
        &mut self,
        view: &mut BoxView<'_>,
        request: &SendRequest,
        id: Uuid,
        error: &SendError,
    ) -> Result<HookOutcome> {
        let _ = (request, error);
        view.remove_outbox(id);
        Ok(HookOutcome::Done)
    }
}
