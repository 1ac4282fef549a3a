//! Deterministic execution of cyclically dependent instances.
//!
//! Test flow:
//! 1) Two writes to `a` commit with each other in their dependency sets (the
//!    shape concurrent conflicting proposals leave behind).
//! 2) Read `a` on every replica, forcing each to resolve the cycle.
//!
//! Failure model covered:
//! - The execution engine loops or deadlocks on a dependency cycle.
//! - Replicas order members of a strongly connected component differently.
//!
//! Verification:
//! - Every replica applies the component members in `(sequence, id)` order
//!   and converges on the same final value.

mod common;

use common::{set, TestCluster};
use strata_epaxos::{
    CommitRequest, InstanceId, InstanceSnapshot, InstanceStatus, PreAcceptRequest,
};

fn write_snapshot(micros: u64, node: u64, value: &str) -> InstanceSnapshot {
    InstanceSnapshot {
        id: InstanceId {
            micros,
            node,
            counter: 1,
        },
        leader: node,
        commands: vec![set("a", value, micros)],
        deps: Vec::new(),
        seq: 1,
        status: InstanceStatus::PreAccepted,
        max_ballot: 0,
        noop: false,
        dependency_match: false,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn cyclic_dependencies_execute_in_seq_then_id_order() {
    let cluster = TestCluster::new(3);
    let first = write_snapshot(100, 1, "1");
    let second = write_snapshot(200, 2, "2");

    for node in cluster.replica_ids() {
        let manager = &cluster.node(node).manager;
        assert!(manager
            .handle_pre_accept(PreAcceptRequest {
                instance: first.clone(),
            })
            .accepted);
        assert!(manager
            .handle_pre_accept(PreAcceptRequest {
                instance: second.clone(),
            })
            .accepted);

        // both commit pointing at each other, same sequence
        assert!(manager
            .handle_commit(CommitRequest {
                id: first.id,
                ballot: 0,
                seq: 1,
                deps: vec![second.id],
                noop: false,
            })
            .accepted);
        assert!(manager
            .handle_commit(CommitRequest {
                id: second.id,
                ballot: 0,
                seq: 1,
                deps: vec![first.id],
                noop: false,
            })
            .accepted);
    }

    for node in cluster.replica_ids() {
        let value = cluster.read(node, "a", 300).await;
        assert_eq!(value.as_deref(), Some(b"2".as_slice()), "node {node}");
    }

    // equal sequences tie-break on the id's embedded timestamp: 100 first
    for node in cluster.replica_ids() {
        let store = &cluster.node(node).store;
        assert_eq!(store.writes_to("a"), vec!["1", "2"], "node {node}");
        assert_eq!(store.get("a").as_deref(), Some("2"), "node {node}");
    }

    // resolving the component again must not re-apply anything
    let again = cluster.read(1, "a", 301).await;
    assert_eq!(again.as_deref(), Some(b"2".as_slice()));
    assert_eq!(cluster.node(1).store.writes_to("a"), vec!["1", "2"]);
}
