//! Scenario: two-phase commit coordination with an external store.
//!
//! A hook processes a delivered transaction, enqueues a send, and asks for
//! a two-phase commit; the prepare callback records the revision in an
//! external file and then the process "crashes" (the callback errors, which
//! leaves disk in exactly the crashed shape: prepared snapshot present,
//! promotion never run).
//!
//! - Reopening with the recorded revision promotes the snapshot: the
//!   enqueued send is in the outbox and the inbox entry is consumed.
//! - Reopening without it discards the snapshot: the outbox is empty and
//!   the same transaction is still in the inbox, to be delivered again.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use httpmock::prelude::*;
use serde_json::json;

use kst_api::SendRequest;
use kst_state::StateStore;
use kstream::{BoxView, Handler, HookOutcome, Stream, Transaction};

fn tx_json(id: i64) -> serde_json::Value {
    json!({
        "id": id,
        "from": "kpayer0000",
        "to": "kme0000000",
        "value": 5,
        "time": "2023-06-01T12:00:00.000Z",
        "type": "transfer",
    })
}

/// Node with exactly one transaction and no listening socket.
async fn mock_single_tx_node(server: &MockServer) {
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/lookup/transactions/")
                .query_param("order", "DESC");
            then.status(200).json_body(json!({
                "ok": true, "count": 1, "total": 1, "transactions": [tx_json(1)],
            }));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/lookup/transactions/")
                .query_param("order", "ASC");
            then.status(200).json_body(json!({
                "ok": true, "count": 1, "total": 1, "transactions": [tx_json(1)],
            }));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/ws/start");
            then.status(200)
                .json_body(json!({ "ok": true, "url": "ws://127.0.0.1:9/" }));
        })
        .await;
}

/// Enqueues a refund for the delivered transaction, then crashes inside the
/// prepare callback, after optionally recording the revision externally.
struct PrepareThenCrash {
    record_to: Option<PathBuf>,
}

impl Handler for PrepareThenCrash {
    fn on_transaction(
        &mut self,
        view: &mut BoxView<'_>,
        tx: &Transaction,
    ) -> anyhow::Result<HookOutcome> {
        view.enqueue_send(SendRequest {
            to: tx.from.clone().unwrap(),
            amount: tx.value,
            private_key: "pk".into(),
            meta: Default::default(),
            user_data: serde_json::Value::Null,
        });
        let record_to = self.record_to.clone();
        Ok(HookOutcome::prepare(move |revision| {
            if let Some(path) = record_to {
                fs::write(path, revision.to_string())?;
            }
            anyhow::bail!("crash after external handshake");
        }))
    }
}

async fn run_to_crash(dir: &std::path::Path, handler: &mut PrepareThenCrash) {
    let stream = Stream::open(dir, None).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(30), stream.run(handler))
        .await
        .expect("pipeline stalled");
    assert!(result.is_err(), "the prepare crash must surface out of run()");
}

#[tokio::test]
async fn recorded_revision_recovers_the_prepared_commit() {
    let server = MockServer::start_async().await;
    mock_single_tx_node(&server).await;
    let dir = tempfile::tempdir().unwrap();
    Stream::create(dir.path(), &server.base_url(), None, false)
        .await
        .unwrap();
    // The probe saw the node's newest id; rewind so id 1 gets delivered.
    rewind_watermark(dir.path());

    let rev_file = dir.path().join("external-revision");
    run_to_crash(
        dir.path(),
        &mut PrepareThenCrash {
            record_to: Some(rev_file.clone()),
        },
    )
    .await;

    let revision: u64 = fs::read_to_string(&rev_file).unwrap().parse().unwrap();
    let recovered = StateStore::open(dir.path(), Some(revision)).unwrap();
    assert_eq!(recovered.state.committed.revision, revision);
    assert_eq!(recovered.state.committed.outbox.len(), 1);
    assert_eq!(recovered.state.committed.outbox[0].transaction.to, "kpayer0000");
    // The inbox entry was consumed by the promoted frame, and the
    // watermark reflects the delivery.
    assert!(recovered.state.committed.inbox.is_none());
    assert_eq!(recovered.state.last_popped_id, 1);
}

#[tokio::test]
async fn declined_handshake_discards_the_prepared_commit() {
    let server = MockServer::start_async().await;
    mock_single_tx_node(&server).await;
    let dir = tempfile::tempdir().unwrap();
    Stream::create(dir.path(), &server.base_url(), None, false)
        .await
        .unwrap();
    rewind_watermark(dir.path());

    run_to_crash(dir.path(), &mut PrepareThenCrash { record_to: None }).await;

    let recovered = StateStore::open(dir.path(), None).unwrap();
    assert!(recovered.state.committed.outbox.is_empty());
    // The transaction is still in the inbox: the next run delivers it again.
    assert_eq!(
        recovered.state.committed.inbox.as_ref().map(|tx| tx.id),
        Some(1),
    );
    assert_eq!(recovered.state.last_popped_id, 1);
}

/// `create` probes the node's newest transaction so new streams skip
/// history; these scenarios want that transaction delivered, so the
/// watermark is reset to "nothing seen yet".
fn rewind_watermark(dir: &std::path::Path) {
    let mut store = StateStore::open(dir, None).unwrap();
    store.state.last_popped_id = -1;
    store.commit().unwrap();
}
