//! Protocol managers running over an in-process network

mod common;

use common::{ClusterProposer, ManagedCluster};
use meridian_consensus::Proposer;
use meridian_core::{ClientRequestId, GroupId, MeridianError, ProtocolKind};
use meridian_state::{KvCommand, KvResponse};
use std::time::Duration;

fn put(key: &str) -> Vec<u8> {
    KvCommand::put(key, "v").encode().unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_proposals_commit_in_submission_order() {
    let mut config = ManagedCluster::fast_config();
    config.batching.pipeline_depth = 3;
    let mut cluster = ManagedCluster::new(3, config);
    let group = GroupId(1);
    cluster.provision(group, ProtocolKind::CrashFaultTolerant);
    let leader = cluster.wait_for_leader(group).await;

    let manager = cluster.managers[leader].clone();
    let mut commits = manager.subscribe();
    let ids: Vec<ClientRequestId> = (1..=3).map(ClientRequestId::from_u128).collect();
    let (a, b, c) = tokio::join!(
        manager.propose(group, put("a"), ids[0]),
        manager.propose(group, put("b"), ids[1]),
        manager.propose(group, put("c"), ids[2]),
    );
    let acks = [a.unwrap(), b.unwrap(), c.unwrap()];
    assert!(acks.windows(2).all(|w| w[0].index < w[1].index));
    for ack in &acks {
        assert_eq!(KvResponse::decode(ack.response.as_ref().unwrap()).unwrap(), KvResponse::Applied);
    }

    let mut order = Vec::new();
    while order.len() < 3 {
        let entry = tokio::time::timeout(Duration::from_secs(2), commits.recv())
            .await
            .unwrap()
            .unwrap();
        order.extend(
            entry
                .payload
                .commands()
                .into_iter()
                .map(|c| c.request_id)
                .filter(|id| ids.contains(id)),
        );
    }
    assert_eq!(order, ids);

    let again = manager.propose(group, put("a"), ids[0]).await.unwrap();
    assert!(again.duplicate);
    assert_eq!(again.index, acks[0].index);

    let readers = cluster.readers.clone();
    assert!(cluster.wait_all(|i| readers[i][&group].get(b"c").is_some()).await);
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_follower_manager_redirects_to_leader() {
    let mut cluster = ManagedCluster::new(3, ManagedCluster::fast_config());
    let group = GroupId(1);
    cluster.provision(group, ProtocolKind::CrashFaultTolerant);
    let leader = cluster.wait_for_leader(group).await;
    let follower = (leader + 1) % 3;

    match cluster.managers[follower].propose(group, put("x"), ClientRequestId::new()).await {
        Err(MeridianError::NotLeader { leader: Some(hint) }) => {
            assert_eq!(hint, cluster.managers[leader].node_id())
        }
        other => panic!("expected redirect, got {:?}", other),
    }
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_leader_crash_recovers_through_network() {
    let mut cluster = ManagedCluster::new(3, ManagedCluster::fast_config());
    let group = GroupId(1);
    cluster.provision(group, ProtocolKind::CrashFaultTolerant);
    let leader = cluster.wait_for_leader(group).await;
    let proposer = ClusterProposer::new(cluster.managers.clone());

    proposer.propose(group, put("before"), ClientRequestId::new()).await.unwrap();
    let old_term = cluster.managers[leader].status(group).unwrap().epoch;
    cluster.network.crash(cluster.managers[leader].node_id());

    let mut successor = None;
    for _ in 0..400 {
        successor = (0..3).filter(|i| *i != leader).find(|i| {
            cluster.managers[*i]
                .status(group)
                .map(|s| s.role == meridian_core::Role::Leader && s.epoch > old_term)
                .unwrap_or(false)
        });
        if successor.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let successor = successor.expect("no successor elected");

    let ack = cluster.managers[successor]
        .propose(group, put("after"), ClientRequestId::new())
        .await
        .unwrap();
    assert!(!ack.duplicate);
    assert!(cluster.readers[successor][&group].get(b"before").is_some());

    cluster.network.restart(cluster.managers[leader].node_id());
    let readers = cluster.readers.clone();
    assert!(cluster.wait_all(|i| readers[i][&group].get(b"after").is_some()).await);
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_byzantine_group_commits_from_backup() {
    let mut cluster = ManagedCluster::new(4, ManagedCluster::fast_config());
    let group = GroupId(7);
    cluster.provision(group, ProtocolKind::ByzantineFaultTolerant);

    let request = ClientRequestId::new();
    let ack = cluster.managers[2].propose(group, put("bft"), request).await.unwrap();
    assert_eq!(ack.request_id, request);
    assert_eq!(KvResponse::decode(ack.response.as_ref().unwrap()).unwrap(), KvResponse::Applied);

    let readers = cluster.readers.clone();
    assert!(cluster.wait_all(|i| readers[i][&group].get(b"bft").is_some()).await);
    let statuses: Vec<_> = cluster.managers.iter().map(|m| m.status(group).unwrap()).collect();
    assert!(statuses.iter().all(|s| s.commit_index >= 1 && s.epoch == statuses[0].epoch));
    assert!(cluster.managers.iter().all(|m| m.alerts().is_empty()));
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_removed_group_refuses_proposals() {
    let mut cluster = ManagedCluster::new(3, ManagedCluster::fast_config());
    let group = GroupId(3);
    cluster.provision(group, ProtocolKind::CrashFaultTolerant);

    cluster.managers[0].remove_group(group).await.unwrap();
    assert!(cluster.managers[0].groups().is_empty());
    assert!(matches!(
        cluster.managers[0].propose(group, put("gone"), ClientRequestId::new()).await,
        Err(MeridianError::GroupNotFound(_))
    ));
    cluster.shutdown().await;
}
