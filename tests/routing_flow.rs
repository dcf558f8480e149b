//! End-to-end routing over the simulated network: bootstrap, path
//! building, onion round trips and swarm lookups.
//!
//! Run with: cargo test -p swarmroute-tests --test routing_flow

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use swarmroute_core::{NodeId, RouteError, RoutingStore};
use swarmroute_crypto::SigningKeypair;
use swarmroute_network::RpcRequest;
use swarmroute_tests::{context, context_with, routing_config, SimNetwork};
use tokio_util::sync::CancellationToken;

/// Pool nodes that no current path uses
fn off_path_nodes(ctx: &swarmroute_client::RoutingContext) -> Vec<swarmroute_core::Node> {
    let paths = ctx.paths().paths();
    ctx.pool()
        .snapshot()
        .iter()
        .filter(|n| !paths.iter().any(|p| p.contains(n.id())))
        .cloned()
        .collect()
}

#[tokio::test]
async fn test_bootstrap_from_seed_builds_three_paths() {
    let sim = SimNetwork::new(15);
    let (ctx, store) = context(&sim);
    assert!(ctx.pool().is_empty());

    assert_eq!(ctx.build_paths().await.unwrap(), 3);
    assert_eq!(sim.seed_requests.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.pool().len(), 15);

    let paths = ctx.paths().paths();
    let mut used = HashSet::new();
    for path in paths.iter() {
        assert_eq!(path.len(), 3);
        for node in path.nodes() {
            assert!(used.insert(*node.id()), "node {} on two paths", node.id().short());
        }
    }

    let state = store.snapshot();
    assert_eq!(state.node_pool.len(), 15);
    assert_eq!(state.guard_nodes.len(), 3);
    let guards: HashSet<NodeId> = paths.iter().map(|p| *p.guard().id()).collect();
    assert!(state.guard_nodes.iter().all(|g| guards.contains(g)));
}

#[tokio::test]
async fn test_too_small_network_fails_bootstrap() {
    let sim = SimNetwork::new(8);
    let (ctx, store) = context(&sim);

    let err = ctx.build_paths().await.unwrap_err();
    assert!(matches!(err, RouteError::InsufficientNodes { have: 8, need: 12 }), "{:?}", err);
    assert!(store.snapshot().node_pool.is_empty());
}

#[tokio::test]
async fn test_info_round_trip_through_three_hops() {
    let sim = SimNetwork::new(15);
    let (ctx, _store) = context(&sim);
    ctx.build_paths().await.unwrap();

    let target = off_path_nodes(&ctx).remove(0);
    let reply = ctx
        .send_to_node(&target, &RpcRequest::info(), None, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(reply.status, 200);
    assert_eq!(reply.json().unwrap()["version"][0], 2);
    assert_eq!(sim.onion_requests.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_get_path_builds_on_demand() {
    let sim = SimNetwork::new(15);
    let (ctx, _store) = context(&sim);

    let path = ctx.get_path(None).await.unwrap();
    assert_eq!(path.len(), 3);
    assert!(ctx.paths().path_for_guard(path.guard().id()).is_some());
}

#[tokio::test]
async fn test_swarm_lookup_is_fetched_once_and_persisted() {
    let sim = SimNetwork::new(15);
    let (ctx, store) = context(&sim);
    ctx.build_paths().await.unwrap();

    let members: Vec<_> = off_path_nodes(&ctx).into_iter().take(3).collect();
    sim.assign_swarm("alice", &members);

    let swarm = ctx.get_swarm("alice", &CancellationToken::new()).await.unwrap();
    let expected: HashSet<NodeId> = members.iter().map(|n| *n.id()).collect();
    let got: HashSet<NodeId> = swarm.iter().map(|n| *n.id()).collect();
    assert_eq!(got, expected);

    let persisted = store.swarm("alice").unwrap().unwrap();
    assert_eq!(persisted.iter().copied().collect::<HashSet<_>>(), expected);

    let requests = sim.onion_requests.load(Ordering::SeqCst);
    ctx.get_swarm("alice", &CancellationToken::new()).await.unwrap();
    assert_eq!(sim.onion_requests.load(Ordering::SeqCst), requests);
}

#[tokio::test]
async fn test_unknown_identity_has_no_swarm() {
    let sim = SimNetwork::new(15);
    let (ctx, store) = context(&sim);

    let err = ctx.get_swarm("nobody", &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, RouteError::InvalidResponse(_)), "{:?}", err);
    assert!(store.swarm("nobody").unwrap().is_none());
}

#[tokio::test]
async fn test_store_then_retrieve() {
    let sim = SimNetwork::new(15);
    let (ctx, _store) = context(&sim);
    ctx.build_paths().await.unwrap();

    let members: Vec<_> = off_path_nodes(&ctx).into_iter().take(3).collect();
    sim.assign_swarm("alice", &members);

    let cancel = CancellationToken::new();
    let stored = ctx
        .store_message("alice", "aGVsbG8=".into(), 60_000, &cancel)
        .await
        .unwrap();
    let hash = stored.hash.expect("store returns a hash");
    assert_eq!(sim.stored_messages("alice").len(), 1);

    let result = ctx
        .retrieve_messages("alice", &members[0], None, &cancel)
        .await
        .unwrap();
    assert_eq!(result.messages.len(), 1);
    assert_eq!(result.messages[0].hash, hash);
    assert_eq!(result.messages[0].data, "aGVsbG8=");

    let result = ctx
        .retrieve_messages("alice", &members[1], Some(&hash), &cancel)
        .await
        .unwrap();
    assert!(result.messages.is_empty());
}

#[tokio::test]
async fn test_registered_key_signs_retrieves() {
    let sim = SimNetwork::new(15);
    let (ctx, _store) = context(&sim);
    ctx.build_paths().await.unwrap();

    let members: Vec<_> = off_path_nodes(&ctx).into_iter().take(3).collect();
    sim.assign_swarm("alice", &members);
    sim.push_message("alice", "c2lnbmVk");

    let cancel = CancellationToken::new();
    ctx.retrieve_messages("alice", &members[0], None, &cancel).await.unwrap();
    assert_eq!(sim.signed_retrieves(), 0);

    ctx.register_signing_key("alice", SigningKeypair::generate());
    let result = ctx
        .retrieve_messages("alice", &members[0], None, &cancel)
        .await
        .unwrap();
    assert_eq!(result.messages.len(), 1);
    assert_eq!(sim.signed_retrieves(), 1);
}

#[tokio::test]
async fn test_restart_reuses_persisted_pool_and_guards() {
    let sim = SimNetwork::new(15);
    let (ctx, store) = context(&sim);
    ctx.build_paths().await.unwrap();
    let guards: HashSet<NodeId> = store.snapshot().guard_nodes.into_iter().collect();
    drop(ctx);

    let restarted = swarmroute_client::RoutingContext::new(routing_config(), sim.clone(), store.clone()).unwrap();
    assert_eq!(restarted.pool().len(), 15);
    assert_eq!(restarted.build_paths().await.unwrap(), 3);

    assert_eq!(sim.seed_requests.load(Ordering::SeqCst), 1);
    let rebuilt: HashSet<NodeId> = restarted.paths().paths().iter().map(|p| *p.guard().id()).collect();
    assert_eq!(rebuilt, guards);
}

#[tokio::test]
async fn test_refresh_by_consensus_skips_seed() {
    let sim = SimNetwork::new(15);
    let mut config = routing_config();
    config.required_agreement = 12;
    let (ctx, _store) = context_with(&sim, config);

    assert_eq!(ctx.refresh_pool().await.unwrap(), 15);
    assert_eq!(sim.seed_requests.load(Ordering::SeqCst), 1);

    // the pool is large enough now, so the next refresh asks the nodes
    assert_eq!(ctx.refresh_pool().await.unwrap(), 15);
    assert_eq!(sim.seed_requests.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failed_consensus_falls_back_to_seed() {
    let sim = SimNetwork::new(15);
    let (ctx, _store) = context(&sim);
    ctx.refresh_pool().await.unwrap();

    // 15 agreeing nodes never reach the default agreement of 24
    assert_eq!(ctx.refresh_pool().await.unwrap(), 15);
    assert_eq!(sim.seed_requests.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_concurrent_callers_share_one_bootstrap() {
    let sim = SimNetwork::new(15);
    let (ctx, _store) = context(&sim);
    let ctx = Arc::new(ctx);

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.get_path(None).await })
        })
        .collect();
    for task in tasks {
        assert!(task.await.unwrap().is_ok());
    }
    assert_eq!(sim.seed_requests.load(Ordering::SeqCst), 1);
}
