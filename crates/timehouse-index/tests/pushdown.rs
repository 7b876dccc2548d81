//! Metadata Pushdown (S6)
//!
//! A scan whose predicate is ruled out by segment statistics must not touch
//! the data file at all. The buffer pool's page counter is the observable:
//! meta files are always read, data pages only when a page might hold a
//! matching row.

use std::sync::Arc;

use object_store::memory::InMemory;
use timehouse_core::{Predicate, TemporalClause, TxOp, Value};
use timehouse_index::{doc, Node, NodeConfig, QueryOpts, ScanQuery};

async fn seeded_node() -> Node {
    // small pages so the segment really has many leaves to prune
    let config = NodeConfig {
        page_size_rows: 16,
        ..Default::default()
    };
    let node = Node::new(Arc::new(InMemory::new()), config).unwrap();
    for i in 0..200i64 {
        node.submit_tx_at(
            vec![TxOp::put(
                "items",
                doc(&[
                    ("xt/id", Value::Int(i)),
                    ("k", Value::from(format!("key-{}", i))),
                    ("qty", Value::Int(i)),
                ]),
            )],
            1_000 + i,
        )
        .await
        .unwrap();
    }
    node.flush_all().await.unwrap();
    node
}

#[tokio::test]
async fn test_s6_absent_value_reads_zero_pages() {
    let node = seeded_node().await;
    let before = node.pool().stats().data_pages_decoded;

    let query = ScanQuery::table("items")
        .filter(Predicate::Eq("k".into(), Value::from("no-such-key")))
        .valid_time(TemporalClause::All);
    let mut cursor = node.open_query(query, QueryOpts::default()).await.unwrap();
    let rows = cursor.collect_rows().await.unwrap();

    assert!(rows.is_empty());
    let after = node.pool().stats().data_pages_decoded;
    assert_eq!(after - before, 0, "bloom-pruned scan must read no data pages");
}

#[tokio::test]
async fn test_present_value_reads_pages_and_rows() {
    let node = seeded_node().await;
    let before = node.pool().stats().data_pages_decoded;

    let query = ScanQuery::table("items")
        .filter(Predicate::Eq("k".into(), Value::from("key-42")))
        .valid_time(TemporalClause::All);
    let mut cursor = node.open_query(query, QueryOpts::default()).await.unwrap();
    let rows = cursor.collect_rows().await.unwrap();

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("qty"), Some(&Value::Int(42)));
    let after = node.pool().stats().data_pages_decoded;
    assert!(after > before, "a matching scan must actually read pages");
}

#[tokio::test]
async fn test_range_predicate_pruning() {
    let node = seeded_node().await;
    let before = node.pool().stats().data_pages_decoded;

    // qty is 0..200; nothing is above 10_000
    let query = ScanQuery::table("items")
        .filter(Predicate::Gt("qty".into(), Value::Int(10_000)))
        .valid_time(TemporalClause::All);
    let mut cursor = node.open_query(query, QueryOpts::default()).await.unwrap();
    assert!(cursor.collect_rows().await.unwrap().is_empty());
    assert_eq!(node.pool().stats().data_pages_decoded, before);
}

#[tokio::test]
async fn test_id_selector_narrows_page_reads() {
    let node = seeded_node().await;
    let full_scan = {
        let query = ScanQuery::table("items").valid_time(TemporalClause::All);
        let before = node.pool().stats().data_pages_decoded;
        let mut cursor = node.open_query(query, QueryOpts::default()).await.unwrap();
        let rows = cursor.collect_rows().await.unwrap();
        assert_eq!(rows.len(), 200);
        node.pool().stats().data_pages_decoded - before
    };

    let selected = {
        let query = ScanQuery::table("items")
            .filter(Predicate::Eq("xt$id".into(), Value::Int(7)))
            .valid_time(TemporalClause::All);
        let before = node.pool().stats().data_pages_decoded;
        let mut cursor = node.open_query(query, QueryOpts::default()).await.unwrap();
        let rows = cursor.collect_rows().await.unwrap();
        assert_eq!(rows.len(), 1);
        node.pool().stats().data_pages_decoded - before
    };

    assert!(
        selected < full_scan,
        "id selector should visit fewer pages ({} vs {})",
        selected,
        full_scan
    );
}
