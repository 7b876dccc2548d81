//! Compaction Equivalence (S5)
//!
//! Compaction must be invisible to readers: for any query and any basis, the
//! result before and after `compact_all` is the same multiset of rows. This
//! test pours a deterministic pseudo-random workload over many entities and
//! chunks, snapshots fifty point queries, compacts everything, and replays
//! the same queries against the same bases.

use std::sync::Arc;

use object_store::memory::InMemory;
use timehouse_core::{Basis, EntityId, Predicate, TemporalClause, TxOp, Value};
use timehouse_index::{doc, Node, NodeConfig, QueryOpts, Row, ScanQuery};

const ENTITIES: i64 = 1_000;
const EVENTS: usize = 10_000;
const QUERIES: usize = 50;
const FLUSH_EVERY: usize = 640;

/// Small deterministic generator; no global RNG, no wall clock.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }

    fn below(&mut self, bound: u64) -> u64 {
        self.next() % bound
    }
}

fn valid_point(rng: &mut Lcg) -> i64 {
    // a coarse grid of valid-time instants so windows overlap often
    1_000_000 + (rng.below(40) as i64) * 10_000
}

async fn run_queries(node: &Node, rng_seed: u64) -> Vec<Vec<String>> {
    let mut rng = Lcg(rng_seed);
    let mut out = Vec::with_capacity(QUERIES);
    for _ in 0..QUERIES {
        let entity = rng.below(ENTITIES as u64) as i64;
        let sys_at = 1_000 + rng.below(EVENTS as u64 + 1_000) as i64;
        let valid_at = valid_point(&mut rng);
        let query = ScanQuery::table("events")
            .filter(Predicate::Eq("xt$id".into(), Value::Int(entity)))
            .system_time(TemporalClause::At(sys_at))
            .valid_time(TemporalClause::At(valid_at));
        let opts = QueryOpts {
            basis: Basis {
                at_system_time: Some(sys_at),
                current_time: Some(valid_at),
            },
            ..Default::default()
        };
        let mut cursor = node.open_query(query, opts).await.unwrap();
        let rows: Vec<Row> = cursor.collect_rows().await.unwrap();
        let mut canonical: Vec<String> = rows.iter().map(|r| format!("{:?}", r)).collect();
        canonical.sort();
        out.push(canonical);
    }
    out
}

#[tokio::test]
async fn test_s5_compaction_preserves_reads() {
    let config = NodeConfig {
        page_size_rows: 64, // small pages: force real tries and many leaves
        ..Default::default()
    };
    let node = Node::new(Arc::new(InMemory::new()), config).unwrap();

    let mut rng = Lcg(0x5eed);
    for i in 0..EVENTS {
        let entity = rng.below(ENTITIES as u64) as i64;
        let system_time = 1_000 + i as i64;
        let op = if rng.below(5) == 0 {
            let from = valid_point(&mut rng);
            TxOp::delete_valid(
                "events",
                EntityId::Int(entity),
                Some(from),
                Some(from + 10_000 + (rng.below(4) as i64) * 10_000),
            )
        } else {
            let from = valid_point(&mut rng);
            TxOp::put_valid(
                "events",
                doc(&[
                    ("xt/id", Value::Int(entity)),
                    ("n", Value::Int(rng.below(1_000) as i64)),
                ]),
                Some(from),
                Some(from + 10_000 + (rng.below(6) as i64) * 10_000),
            )
        };
        node.submit_tx_at(vec![op], system_time).await.unwrap();
        if (i + 1) % FLUSH_EVERY == 0 {
            node.flush_table("events").await.unwrap();
        }
    }
    node.flush_all().await.unwrap();

    let before = run_queries(&node, 0xfeed).await;

    let results = node.compact_all_table("events").await.unwrap();
    assert!(!results.is_empty(), "workload must actually compact");

    let after = run_queries(&node, 0xfeed).await;
    assert_eq!(before, after, "compaction changed query results");

    // and again after garbage collection of the covered inputs
    node.gc().await.unwrap();
    let after_gc = run_queries(&node, 0xfeed).await;
    assert_eq!(before, after_gc, "gc changed query results");
}
