//! Failover tests for leader failure and recovery.
//!
//! These tests verify cluster behavior when leaders stop, including new
//! leader election, loss of quorum, and rejoining of a stopped node.


use std::time::Duration;

use kvstore_raft::RaftError;
use test_harness::{
    assert_eventually, count_leaders, fast_config, start_cluster, total_timer_errors,
    wait_for_leader, wait_for_new_leader, wait_for_valid,
};

/// Test 1: New leader is elected after the leader is stopped
#[tokio::test(start_paused = true)]
async fn test_new_leader_election_after_stop() {
    let cluster = start_cluster(5, fast_config()).await;

    let initial_leader = wait_for_leader(&cluster, Duration::from_secs(10))
        .await
        .expect("Initial leader should be elected");
    let initial_term = initial_leader.current_term().await;

    let stopped = cluster.stop_leader().await.expect("Leader should be stopped");
    assert_eq!(stopped.id(), initial_leader.id());
    assert!(stopped.is_stopped().await);
    assert!(stopped.is_follower().await, "Stopped leader falls back to follower");

    let new_leader = wait_for_new_leader(&cluster, initial_leader.id(), Duration::from_secs(10))
        .await
        .expect("New leader should be elected");
    assert_ne!(new_leader.id(), initial_leader.id());

    let new_term = new_leader.current_term().await;
    assert!(new_term > initial_term, "Term should increase after new election");

    assert!(
        wait_for_valid(&cluster, Duration::from_secs(5)).await,
        "Cluster should be valid with one node stopped"
    );
    assert_eq!(count_leaders(&cluster).await, 1, "Exactly one leader should exist");
    assert_eq!(total_timer_errors(&cluster), 0);
}

/// Test 2: Two sequential leader failures are tolerated by five nodes
#[tokio::test(start_paused = true)]
async fn test_multiple_sequential_leader_failures() {
    let cluster = start_cluster(5, fast_config()).await;
    let mut previous_leaders = Vec::new();

    for i in 0..2 {
        let leader = wait_for_leader(&cluster, Duration::from_secs(10))
            .await
            .unwrap_or_else(|| panic!("Leader {} should be elected", i + 1));
        previous_leaders.push(leader.id());
        leader.stop().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    let final_leader = wait_for_leader(&cluster, Duration::from_secs(10))
        .await
        .expect("Remaining three nodes still form a majority");
    assert!(!previous_leaders.contains(&final_leader.id()));
    assert!(wait_for_valid(&cluster, Duration::from_secs(5)).await);
    assert_eq!(total_timer_errors(&cluster), 0);
}

/// Test 3: Without a majority no leader can be elected
#[tokio::test(start_paused = true)]
async fn test_no_leader_without_majority() {
    let cluster = start_cluster(5, fast_config()).await;
    let leader = wait_for_leader(&cluster, Duration::from_secs(10))
        .await
        .expect("Leader should be elected");

    leader.stop().await;
    for peer in cluster.get_remote_followers(leader.id()).iter().take(2) {
        peer.stop().await;
    }

    // Many election rounds pass among the two remaining nodes
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(count_leaders(&cluster).await, 0);
    let err = cluster.check_invariant().await.unwrap_err();
    assert!(matches!(err, RaftError::NoLeader));
    assert!(err.is_cluster_invalid());

    let running: Vec<_> = {
        let mut running = Vec::new();
        for node in cluster.nodes() {
            if !node.is_stopped().await {
                running.push(node.clone());
            }
        }
        running
    };
    assert_eq!(running.len(), 2);
    for node in &running {
        assert!(
            node.current_term().await > leader.current_term().await,
            "Remaining nodes keep campaigning"
        );
    }
    assert_eq!(total_timer_errors(&cluster), 0);
}

/// Test 4: Stopped leader rejoins as a follower of the new leader
#[tokio::test(start_paused = true)]
async fn test_old_leader_rejoins_as_follower() {
    let cluster = start_cluster(5, fast_config()).await;

    let old_leader = wait_for_leader(&cluster, Duration::from_secs(10))
        .await
        .expect("Initial leader should be elected");
    cluster.stop_leader().await.expect("Leader should be stopped");

    let new_leader = wait_for_new_leader(&cluster, old_leader.id(), Duration::from_secs(10))
        .await
        .expect("New leader should be elected");

    old_leader.start(&cluster).await;
    assert!(!old_leader.is_stopped().await);

    assert_eventually(
        || async {
            old_leader.leader_hint().await == Some(new_leader.id())
                && old_leader.current_term().await == new_leader.current_term().await
        },
        Duration::from_secs(5),
        "Restarted node should follow the new leader",
    )
    .await;

    assert!(old_leader.is_follower().await);
    assert!(new_leader.is_leader().await);
    assert!(cluster.check_invariant().await.is_ok());
    assert_eq!(total_timer_errors(&cluster), 0);
}

/// Test 5: Stopping every node leaves the cluster without a leader
#[tokio::test(start_paused = true)]
async fn test_stop_all_clears_leadership() {
    let cluster = start_cluster(3, fast_config()).await;
    wait_for_leader(&cluster, Duration::from_secs(10))
        .await
        .expect("Leader should be elected");

    cluster.stop_all().await;
    let terms: Vec<u64> = {
        let mut terms = Vec::new();
        for node in cluster.nodes() {
            terms.push(node.current_term().await);
        }
        terms
    };

    tokio::time::sleep(Duration::from_secs(2)).await;

    for (node, term) in cluster.nodes().iter().zip(terms) {
        assert!(node.is_stopped().await);
        assert!(node.is_follower().await);
        assert_eq!(node.current_term().await, term, "Stopped nodes never campaign");
    }
    assert!(matches!(cluster.stop_leader().await, Err(RaftError::NoLeader)));
}
