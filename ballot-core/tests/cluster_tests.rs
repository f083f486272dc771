mod common;

use std::collections::HashMap;
use std::time::Duration;

use ballot_core::{BallotError, Command, Role, StateMachine};
use common::{wait_for_condition, TestCluster, TEST_TIMEOUT};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_node_cluster_commits_foo() {
    let cluster = TestCluster::new(3).await;
    let leader = cluster.wait_for_leader().await;

    let response = cluster
        .node(&leader)
        .client_request(Command::data(b"foo".to_vec()))
        .await
        .unwrap();
    assert!(response.success);
    assert_eq!(response.entry_index, 1);
    assert_eq!(response.leader_id.as_deref(), Some(leader.as_str()));

    let ids = cluster.ids();
    cluster.wait_for_commit(&ids, 1).await;
    for id in &ids {
        let sm = cluster.state_machine(id);
        assert_eq!(sm.commit_index(), 1, "{} commit index", id);
        assert_eq!(sm.data(), Some(b"foo".to_vec()), "{} data", id);
    }

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_logs_converge_after_many_commands() {
    let cluster = TestCluster::new(3).await;
    let leader = cluster.wait_for_leader().await;

    let mut last_index = 0;
    for i in 0..20 {
        let response = cluster
            .node(&leader)
            .client_request(Command::data(format!("cmd-{}", i).into_bytes()))
            .await
            .unwrap();
        last_index = response.entry_index;
    }

    let ids = cluster.ids();
    cluster.wait_for_commit(&ids, last_index).await;

    let reference = cluster.node(&leader).entries(0, None).await.unwrap();
    for id in &ids {
        let entries = cluster.node(id).entries(0, Some(last_index + 1)).await.unwrap();
        assert_eq!(entries, reference[..entries.len()].to_vec(), "{} log diverged", id);
        assert_eq!(cluster.state_machine(id).applied(), 20);
        assert_eq!(cluster.state_machine(id).data(), Some(b"cmd-19".to_vec()));
    }

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_follower_refuses_client_requests() {
    let cluster = TestCluster::new(3).await;
    let leader = cluster.wait_for_leader().await;
    let follower = cluster.ids().into_iter().find(|id| id != &leader).unwrap();

    let err = cluster
        .node(&follower)
        .client_request(Command::data(b"bar".to_vec()))
        .await
        .unwrap_err();
    match err {
        BallotError::NotLeader { leader_id } => assert_eq!(leader_id, Some(leader)),
        other => panic!("expected NotLeader, got {:?}", other),
    }

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_at_most_one_leader_per_term() {
    let cluster = TestCluster::new(5).await;
    let ids = cluster.ids();
    let mut leaders: HashMap<u64, String> = HashMap::new();

    // Sample while elections happen, including forced re-elections
    for round in 0..3 {
        let leader = cluster.wait_for_leader().await;
        for _ in 0..20 {
            for id in &ids {
                let status = cluster.node(id).status().await;
                if status.role == Role::Leader {
                    let previous = leaders.entry(status.term).or_insert_with(|| id.clone());
                    assert_eq!(previous.as_str(), id.as_str(), "two leaders in term {}", status.term);
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        if round < 2 {
            // Isolate the leader to force a new election
            let rest: Vec<_> = ids.iter().filter(|id| **id != leader).cloned().collect();
            cluster.partition.set_partitions([vec![leader.clone()], rest.clone()]);
            cluster.wait_for_leader_among(&rest).await;
            cluster.partition.heal();
        }
    }

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_partitioned_leader_is_replaced() {
    let cluster = TestCluster::new(3).await;
    let old_leader = cluster.wait_for_leader().await;
    let rest: Vec<_> = cluster
        .ids()
        .into_iter()
        .filter(|id| id != &old_leader)
        .collect();

    cluster
        .partition
        .set_partitions([vec![old_leader.clone()], rest.clone()]);

    // The isolated leader accepts the command but cannot commit it
    let stranded = {
        let node = cluster.node(&old_leader).clone();
        tokio::spawn(async move { node.client_request(Command::data(b"lost".to_vec())).await })
    };

    let new_leader = cluster.wait_for_leader_among(&rest).await;
    assert_ne!(new_leader, old_leader);
    let committed = cluster
        .node(&new_leader)
        .client_request(Command::data(b"kept".to_vec()))
        .await
        .unwrap();

    cluster.partition.heal();

    let err = stranded.await.unwrap().unwrap_err();
    assert!(
        matches!(err, BallotError::NotLeader { .. }),
        "expected NotLeader, got {:?}",
        err
    );

    // The old leader rejoins as a follower and drops its uncommitted entry
    cluster.wait_for_commit(&cluster.ids(), committed.entry_index).await;
    let sm = cluster.state_machine(&old_leader);
    assert_eq!(sm.data(), Some(b"kept".to_vec()));
    let status = cluster.node(&old_leader).status().await;
    assert_eq!(status.role, Role::Follower);

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_minority_leader_times_out() {
    let cluster = TestCluster::with_config(3, |config| {
        config.raft.proposal_timeout = Duration::from_millis(300);
    })
    .await;
    let leader = cluster.wait_for_leader().await;
    cluster.partition.set_partitions([vec![leader.clone()]]);

    let err = cluster
        .node(&leader)
        .client_request(Command::data(b"nowhere".to_vec()))
        .await
        .unwrap_err();
    assert!(
        matches!(err, BallotError::Timeout { .. } | BallotError::NotLeader { .. }),
        "got {:?}",
        err
    );

    cluster.partition.heal();
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_node_cluster_commits_alone() {
    let cluster = TestCluster::new(1).await;
    let leader = cluster.wait_for_leader().await;
    assert_eq!(leader, "raft-1");

    let response = cluster
        .node(&leader)
        .client_request(Command::data(b"solo".to_vec()))
        .await
        .unwrap();
    assert_eq!(response.entry_index, 1);
    assert_eq!(cluster.state_machine(&leader).data(), Some(b"solo".to_vec()));

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unreachable_peers_leave_no_outstanding_requests() {
    let cluster = TestCluster::new(3).await;
    let leader = cluster.wait_for_leader().await;
    cluster.partition.set_partitions([vec![leader.clone()]]);

    // Heartbeats to unreachable peers complete with errors and leave the table
    let node = cluster.node(&leader).clone();
    wait_for_condition(
        || {
            let node = node.clone();
            async move { node.outstanding_requests() == 0 }
        },
        TEST_TIMEOUT,
    )
    .await
    .unwrap();

    cluster.partition.heal();
    cluster.shutdown().await;
}
