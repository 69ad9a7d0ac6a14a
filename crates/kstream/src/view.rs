//! The box view: a transactional working copy of the committed boxes, and
//! the protocol that runs user hooks over one.
//!
//! A view is created from the committed record with its revision bumped,
//! mutated by exactly one hook frame through an exclusive borrow, and then
//! consumed by [`run_hook`]: either discarded (the hook failed; nothing
//! touched disk) or written back through one of three commit shapes chosen
//! by the hook's returned [`HookOutcome`].
//!
//! # Commit shapes
//!
//! - `Done`: replace committed, commit to disk.
//! - `Prepare(f)`: write the working copy as *prepared*, commit, call
//!   `f(revision)` so an external store can record the handshake token,
//!   then promote to committed and commit again. If `f` fails the prepared
//!   document stays on disk and the error is fatal: the only recovery is a
//!   restart with `open(dir, revision)`.
//! - `AfterCommit(f)`: replace committed, commit, then call `f` exactly
//!   once. An `f` failure propagates without re-running the main hook.
//!
//! These shapes are what make the documented guarantees true: the main hook
//! runs at least once per inbox entry, `AfterCommit` callbacks run at most
//! once.

use std::sync::Mutex as StdMutex;

use anyhow::{Context, Result};
use uuid::Uuid;

use kst_api::{SendRequest, Transaction};
use kst_state::{Boxes, OutboxEntry, StateStore};

use crate::idgen::RefSource;

/// What a hook asks the runner to do after its body succeeded.
pub enum HookOutcome {
    /// Commit the working copy.
    Done,
    /// Two-phase commit: the callback receives the new revision between the
    /// prepared write and the committed write.
    Prepare(Box<dyn FnOnce(u64) -> Result<()>>),
    /// Commit, then run the callback exactly once.
    AfterCommit(Box<dyn FnOnce() -> Result<()>>),
}

impl HookOutcome {
    /// Convenience constructor for [`HookOutcome::Prepare`].
    pub fn prepare(f: impl FnOnce(u64) -> Result<()> + 'static) -> Self {
        Self::Prepare(Box::new(f))
    }

    /// Convenience constructor for [`HookOutcome::AfterCommit`].
    pub fn after_commit(f: impl FnOnce() -> Result<()> + 'static) -> Self {
        Self::AfterCommit(Box::new(f))
    }
}

/// Transactional view over the inbox/outbox handed to a hook body.
pub struct BoxView<'a> {
    uncommitted: Boxes,
    refs: &'a StdMutex<RefSource>,
}

impl<'a> BoxView<'a> {
    fn new(committed: &Boxes, refs: &'a StdMutex<RefSource>) -> Self {
        let mut uncommitted = committed.clone();
        uncommitted.revision += 1;
        Self { uncommitted, refs }
    }

    /// Revision of the working copy; becomes the committed revision if this
    /// frame commits, and is the token passed to a `Prepare` callback.
    pub fn revision(&self) -> u64 {
        self.uncommitted.revision
    }

    pub fn inbox(&self) -> Option<&Transaction> {
        self.uncommitted.inbox.as_ref()
    }

    pub fn outbox(&self) -> &[OutboxEntry] {
        &self.uncommitted.outbox
    }

    /// Append an outgoing transaction to the working outbox. Returns the
    /// tracking id; the dedup `ref` is drawn at the same time and reused
    /// across every retry of the entry.
    pub fn enqueue_send(&mut self, transaction: SendRequest) -> Uuid {
        let (id, dedup_ref) = {
            let mut refs = self.refs.lock().expect("ref source mutex poisoned");
            (refs.next_id(), refs.next_id())
        };
        self.uncommitted
            .outbox
            .push(OutboxEntry::new(id, dedup_ref, transaction));
        id
    }

    /// Remove an outbox entry from the working copy by tracking id.
    pub fn remove_outbox(&mut self, id: Uuid) -> bool {
        self.uncommitted.remove_outbox(id).is_some()
    }

    /// Consume the working inbox slot. The inbox worker takes the entry
    /// before invoking the hook so a committed frame marks it processed.
    pub(crate) fn take_inbox(&mut self) -> Option<Transaction> {
        self.uncommitted.inbox.take()
    }
}

/// Run one hook frame over the store, which the caller has locked.
///
/// A hook-body failure discards the working copy (nothing was written) and
/// re-raises; the committed record is untouched and the same work is
/// redelivered later.
pub(crate) fn run_hook<F>(
    store: &mut StateStore,
    refs: &StdMutex<RefSource>,
    body: F,
) -> Result<()>
where
    F: FnOnce(&mut BoxView<'_>) -> Result<HookOutcome>,
{
    let mut view = BoxView::new(&store.state.committed, refs);
    let outcome = body(&mut view)?;
    let revision = view.revision();
    let boxes = view.uncommitted;

    match outcome {
        HookOutcome::Done => {
            store.state.committed = boxes;
            store.state.prepared = None;
            store.commit().context("commit hook frame")?;
        }
        HookOutcome::Prepare(on_prepare) => {
            store.state.prepared = Some(boxes.clone());
            store.commit().context("write prepared state")?;
            // A failure here is deliberate poison: the prepared document is
            // on disk and only `open(dir, revision)` may resolve it.
            on_prepare(revision).context("prepare callback failed with prepared state on disk")?;
            store.state.committed = boxes;
            store.state.prepared = None;
            store.commit().context("promote prepared state")?;
        }
        HookOutcome::AfterCommit(after_commit) => {
            store.state.committed = boxes;
            store.state.prepared = None;
            store.commit().context("commit hook frame")?;
            after_commit().context("after-commit callback failed")?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    use kst_state::{SendStatus, StreamConfig};

    fn store() -> (StateStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::create(
            dir.path(),
            StreamConfig {
                endpoint: "http://node.test".into(),
                address: None,
                include_mined: true,
            },
            -1,
        )
        .unwrap();
        (store, dir)
    }

    fn refs() -> StdMutex<RefSource> {
        StdMutex::new(RefSource::new())
    }

    fn request() -> SendRequest {
        SendRequest {
            to: "ktarget000".into(),
            amount: 3,
            private_key: "pk".into(),
            meta: Default::default(),
            user_data: serde_json::Value::Null,
        }
    }

    #[test]
    fn committed_outbox_is_union_of_enqueues_in_order() {
        let (mut store, _dir) = store();
        let refs = refs();
        let mut ids = Vec::new();
        run_hook(&mut store, &refs, |view| {
            ids.push(view.enqueue_send(request()));
            ids.push(view.enqueue_send(request()));
            Ok(HookOutcome::Done)
        })
        .unwrap();
        let outbox = &store.state.committed.outbox;
        assert_eq!(outbox.iter().map(|e| e.id).collect::<Vec<_>>(), ids);
        assert!(outbox.iter().all(|e| e.status == SendStatus::Pending));
        assert_eq!(store.state.committed.revision, 1);
    }

    #[test]
    fn failed_body_leaves_committed_untouched() {
        let (mut store, _dir) = store();
        let refs = refs();
        let result = run_hook(&mut store, &refs, |view| {
            view.enqueue_send(request());
            anyhow::bail!("user hook exploded");
        });
        assert!(result.is_err());
        assert!(store.state.committed.outbox.is_empty());
        assert_eq!(store.state.committed.revision, 0);
        assert!(store.state.prepared.is_none());
    }

    #[test]
    fn prepare_failure_leaves_prepared_on_disk() {
        let (mut store, _dir) = store();
        let dir = store.dir().to_path_buf();
        let refs = refs();
        let result = run_hook(&mut store, &refs, |view| {
            view.enqueue_send(request());
            Ok(HookOutcome::prepare(|_revision| {
                anyhow::bail!("external store declined")
            }))
        });
        assert!(result.is_err());
        // Reopen without the revision: prepared is discarded.
        drop(store);
        let reopened = StateStore::open(&dir, None).unwrap();
        assert!(reopened.state.committed.outbox.is_empty());
    }

    #[test]
    fn prepare_success_passes_revision_and_promotes() {
        let (mut store, _dir) = store();
        let refs = refs();
        let seen = Rc::new(Cell::new(0u64));
        let seen_in_hook = Rc::clone(&seen);
        run_hook(&mut store, &refs, move |view| {
            view.enqueue_send(request());
            let seen = Rc::clone(&seen_in_hook);
            Ok(HookOutcome::prepare(move |revision| {
                seen.set(revision);
                Ok(())
            }))
        })
        .unwrap();
        assert_eq!(seen.get(), 1);
        assert_eq!(store.state.committed.revision, 1);
        assert_eq!(store.state.committed.outbox.len(), 1);
        assert!(store.state.prepared.is_none());
    }

    #[test]
    fn after_commit_failure_keeps_the_commit() {
        let (mut store, _dir) = store();
        let refs = refs();
        let result = run_hook(&mut store, &refs, |view| {
            view.enqueue_send(request());
            Ok(HookOutcome::after_commit(|| {
                anyhow::bail!("notification channel down")
            }))
        });
        assert!(result.is_err());
        // The commit happened; the callback failure must not undo it.
        assert_eq!(store.state.committed.outbox.len(), 1);
        assert!(store.state.prepared.is_none());
    }
}
