//! Scenario: ordered backfill → live handover → tail-hole repair.
//!
//! The assembler is driven directly: a mocked node serves the paged
//! listing, and live pushes arrive through the same entry point the socket
//! uses. Proven here:
//!
//! - a stream resuming at watermark 100 against a 200-entry node delivers
//!   101..=200 in order, pulled from overlapping pages;
//! - a live push that arrives mid-backfill does not corrupt ordering (it is
//!   rejected until the watermark chains onto it);
//! - after the handover, a push skipping ids marks a tail hole, the repair
//!   pass closes it from the node's tail pages, and delivery continues in
//!   order with no id delivered twice.

use std::time::Duration;

use httpmock::prelude::*;
use serde_json::json;

use kst_api::{ApiTransaction, KristClient, Transaction, TransactionFilter};
use kst_state::Bus;
use kstream::TransactionStream;

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

fn tx_json(id: i64) -> serde_json::Value {
    json!({
        "id": id,
        "from": "kfrom00000",
        "to": "kto0000000",
        "value": 1,
        "time": "2021-01-01T00:00:00.000Z",
        "type": "transfer",
    })
}

fn page_body(ids: impl Iterator<Item = i64>, total: usize) -> serde_json::Value {
    let txs: Vec<serde_json::Value> = ids.map(tx_json).collect();
    json!({ "ok": true, "count": txs.len(), "total": total, "transactions": txs })
}

async fn mock_asc_page(
    server: &MockServer,
    offset: u64,
    limit: u64,
    ids: impl Iterator<Item = i64>,
    total: usize,
) {
    let body = page_body(ids, total);
    server
        .mock_async(move |when, then| {
            when.method(GET)
                .path("/lookup/transactions/")
                .query_param("includeMined", "true")
                .query_param("order", "ASC")
                .query_param("offset", offset.to_string())
                .query_param("limit", limit.to_string());
            then.status(200).json_body(body.clone());
        })
        .await;
}

#[tokio::test]
async fn backfill_then_live_then_hole_repair() {
    let server = MockServer::start_async().await;

    // Node state during backfill: ids 1..=200.
    let mut initial_tail = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/lookup/transactions/")
                .query_param("includeMined", "true")
                .query_param("order", "DESC")
                .query_param("offset", "0")
                .query_param("limit", "50");
            then.status(200)
                .json_body(page_body((151..=200).rev(), 200));
        })
        .await;
    // Locator probes for the watermark (id 100), then overlapping pages.
    mock_asc_page(&server, 99, 1, 100..=100, 200).await;
    mock_asc_page(&server, 99, 2, 100..=101, 200).await;
    mock_asc_page(&server, 99, 50, 100..=149, 200).await;
    mock_asc_page(&server, 148, 50, 149..=198, 200).await;
    mock_asc_page(&server, 197, 50, 198..=200, 200).await;

    let client = KristClient::new(&server.base_url());
    let assembler = TransactionStream::new(
        client,
        TransactionFilter::superset(),
        Bus::new(),
        100,
    );

    let drive = async {
        // First page lands.
        assembler.wait().await.unwrap();
        // A push mid-backfill does not chain and must be rejected.
        assert!(!assembler.push_live(tx(201)).await);

        let mut delivered: Vec<i64> = Vec::new();
        while delivered.last() != Some(&200) {
            assembler.wait().await.unwrap();
            while let Some(tx) = assembler.try_pop().await {
                delivered.push(tx.id);
            }
        }
        assert_eq!(delivered, (101..=200).collect::<Vec<i64>>());

        // Handover: the push now chains directly onto the watermark.
        assert!(assembler.push_live(tx(201)).await);
        assembler.wait().await.unwrap();
        assert_eq!(assembler.try_pop().await.map(|t| t.id), Some(201));

        // A push three ids ahead leaves a hole.
        assert!(!assembler.push_live(tx(204)).await);

        // The node has meanwhile advanced to ids 1..=204; repair reads its
        // tail pages and closes the hole.
        initial_tail.delete_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/lookup/transactions/")
                    .query_param("includeMined", "true")
                    .query_param("order", "DESC")
                    .query_param("offset", "0")
                    .query_param("limit", "50");
                then.status(200)
                    .json_body(page_body((155..=204).rev(), 204));
            })
            .await;

        assembler.wait().await.unwrap();
        let mut repaired: Vec<i64> = Vec::new();
        while let Some(tx) = assembler.try_pop().await {
            repaired.push(tx.id);
        }
        assert_eq!(repaired, vec![202, 203, 204]);

        // Live pushes resume seamlessly after the repair.
        assert!(assembler.push_live(tx(205)).await);
        assembler.wait().await.unwrap();
        assert_eq!(assembler.try_pop().await.map(|t| t.id), Some(205));
    };
    tokio::time::timeout(Duration::from_secs(30), drive)
        .await
        .expect("assembler stalled");
}
