use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use hsm_client::{
    ConnectionFactory, ConnectionSettings, HsmClient, HsmConfig, HsmError, LoadBalancingType,
};
use hsm_common::{ProtocolCodec, UtimacoCodec};
use hsm_sim::{Behavior, SimServer};

const HMAC_KEY: &str = "MERCHANT_HMAC";

async fn start_sims(behaviors: &[Behavior]) -> Vec<SimServer> {
    let mut sims = Vec::with_capacity(behaviors.len());
    for behavior in behaviors {
        sims.push(SimServer::start(*behavior).await.expect("start simulator"));
    }
    sims
}

fn config_for(sims: &[SimServer], strategy: LoadBalancingType) -> HsmConfig {
    let mut config = HsmConfig::new(strategy);
    config.hsm_nodes = sims.iter().map(SimServer::node).collect();
    config.connect_timeout_ms = 500;
    config.health_check_interval_secs = 3_600;
    config
}

fn keys() -> HashMap<String, String> {
    let mut keys = HashMap::new();
    keys.insert(HMAC_KEY.to_string(), "S10096K0TB00E0000".to_string());
    keys.insert("HDFC_VISA_CAVV_GEN".to_string(), "S1VISA".to_string());
    keys.insert("HDFC_MASTERCARD_CAVV_GEN".to_string(), "S1MC".to_string());
    keys
}

async fn shutdown_all(client: HsmClient, sims: Vec<SimServer>) {
    client.shutdown().await;
    for sim in sims {
        sim.shutdown().await;
    }
}

#[tokio::test]
async fn generates_all_three_operations() {
    let sims = start_sims(&[Behavior::Normal]).await;
    let client = HsmClient::connect(config_for(&sims, LoadBalancingType::ClientSideFailover), keys())
        .await
        .expect("connect");

    let visa = client.generate_visa_cavv("hdfc", "4111111111111111").await.unwrap();
    let master = client.generate_master_cavv("hdfc", "4111111111111111").await.unwrap();
    let hmac = client.generate_hmac(HMAC_KEY, "payload").await.unwrap();
    assert_eq!(visa.len(), 16);
    assert_ne!(visa, master);
    assert_eq!(hmac.len(), 16);
    assert_eq!(sims[0].commands_received(), 3);

    let metrics = client.metrics();
    assert_eq!(metrics.requests_total, 3);
    assert_eq!(metrics.errors_total, 0);
    assert_eq!(metrics.latency.samples, 3);

    shutdown_all(client, sims).await;
}

#[tokio::test]
async fn fails_over_past_two_dead_nodes() {
    let sims = start_sims(&[Behavior::CloseOnCommand, Behavior::CloseOnCommand, Behavior::Normal]).await;
    let client = HsmClient::connect(config_for(&sims, LoadBalancingType::ClientSideFailover), keys())
        .await
        .expect("connect");

    let first = client.generate_hmac(HMAC_KEY, "payload").await.unwrap();
    assert_eq!(first.len(), 16);

    let pools = client.balancer().pools();
    assert!(!pools[0].is_healthy());
    assert!(!pools[1].is_healthy());
    assert!(pools[2].is_healthy());
    assert_eq!(sims[0].commands_received(), 1);
    assert_eq!(sims[1].commands_received(), 1);
    assert_eq!(sims[2].commands_received(), 1);

    // Node 2 is now the only candidate and answers the same body identically.
    let second = client.generate_hmac(HMAC_KEY, "payload").await.unwrap();
    assert_eq!(first, second);
    assert_eq!(sims[0].commands_received(), 1);
    assert_eq!(sims[2].commands_received(), 2);

    shutdown_all(client, sims).await;
}

#[tokio::test]
async fn every_node_dead_ends_in_all_nodes_failed() {
    let sims = start_sims(&[Behavior::CloseOnCommand, Behavior::CloseOnCommand]).await;
    let client = HsmClient::connect(config_for(&sims, LoadBalancingType::ClientSideRoundRobin), keys())
        .await
        .expect("connect");

    let err = client.generate_hmac(HMAC_KEY, "payload").await.unwrap_err();
    assert!(matches!(err, HsmError::AllNodesFailed(_)), "got {err:?}");
    assert_eq!(client.balancer().healthy_count(), 0);

    let err = client.generate_hmac(HMAC_KEY, "payload").await.unwrap_err();
    assert!(matches!(err, HsmError::NoHealthyNode(_)), "got {err:?}");
    assert_eq!(sims[0].commands_received() + sims[1].commands_received(), 2);

    shutdown_all(client, sims).await;
}

#[tokio::test]
async fn command_error_is_not_retried() {
    let sims = start_sims(&[Behavior::Reject, Behavior::Normal]).await;
    let client = HsmClient::connect(config_for(&sims, LoadBalancingType::ClientSideFailover), keys())
        .await
        .expect("connect");

    let err = client.generate_hmac(HMAC_KEY, "payload").await.unwrap_err();
    assert!(matches!(err, HsmError::Command(ref msg) if msg.contains("15")), "got {err:?}");
    assert!(client.balancer().pools()[0].is_healthy());
    assert_eq!(sims[0].commands_received(), 1);
    assert_eq!(sims[1].commands_received(), 0);

    // The rejected connection went back to the pool instead of being retired.
    assert_eq!(sims[0].connections_accepted(), 1);
    let _ = client.generate_hmac(HMAC_KEY, "payload").await;
    assert_eq!(sims[0].connections_accepted(), 1);

    shutdown_all(client, sims).await;
}

#[tokio::test]
async fn silent_node_times_out_without_failover() {
    let sims = start_sims(&[Behavior::Silent, Behavior::Normal]).await;
    let mut config = config_for(&sims, LoadBalancingType::ClientSideFailover);
    config.request_timeout_ms = 150;
    let client = HsmClient::connect(config, keys()).await.expect("connect");

    let err = client.generate_hmac(HMAC_KEY, "payload").await.unwrap_err();
    assert!(matches!(err, HsmError::Timeout(_)), "got {err:?}");
    assert!(client.balancer().pools()[0].is_healthy());
    assert_eq!(sims[1].commands_received(), 0);

    shutdown_all(client, sims).await;
}

#[tokio::test]
async fn untagged_garbage_resolves_by_timeout() {
    let sims = start_sims(&[Behavior::Garbage]).await;
    let mut config = config_for(&sims, LoadBalancingType::ClientSideFailover);
    config.request_timeout_ms = 150;
    let client = HsmClient::connect(config, keys()).await.expect("connect");

    let err = client.generate_hmac(HMAC_KEY, "payload").await.unwrap_err();
    assert!(matches!(err, HsmError::Timeout(_)), "got {err:?}");
    assert!(client.balancer().pools()[0].is_healthy());

    shutdown_all(client, sims).await;
}

#[tokio::test]
async fn round_robin_spreads_commands_evenly() {
    let sims = start_sims(&[Behavior::Normal, Behavior::Normal, Behavior::Normal]).await;
    let client = HsmClient::connect(config_for(&sims, LoadBalancingType::ClientSideRoundRobin), keys())
        .await
        .expect("connect");

    for i in 0..30 {
        client.generate_hmac(HMAC_KEY, &format!("payload-{i}")).await.unwrap();
    }
    for sim in &sims {
        assert_eq!(sim.commands_received(), 10);
    }

    shutdown_all(client, sims).await;
}

#[tokio::test]
async fn health_sweep_recovers_and_demotes_nodes() {
    let mut sims = start_sims(&[Behavior::Normal, Behavior::Normal]).await;
    let client = HsmClient::connect(config_for(&sims, LoadBalancingType::ClientSideFailover), keys())
        .await
        .expect("connect");
    let balancer = client.balancer();

    balancer.pools()[0].mark_unhealthy();
    assert_eq!(balancer.run_health_sweep().await, 2);
    assert!(balancer.pools()[0].is_healthy());

    let dead = sims.pop().expect("second simulator");
    dead.shutdown().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(balancer.run_health_sweep().await, 1);
    assert!(balancer.pools()[0].is_healthy());
    assert!(!balancer.pools()[1].is_healthy());

    shutdown_all(client, sims).await;
}

#[tokio::test]
async fn ping_warmup_tolerates_a_dead_node() {
    let sims = start_sims(&[Behavior::Normal]).await;
    let mut config = config_for(&sims, LoadBalancingType::ClientSideFailover);
    config.warmup = hsm_client::WarmupMode::Ping;
    config.borrow_timeout_ms = 200;
    // Reserve a port, then free it so nothing listens there.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_port = listener.local_addr().unwrap().port();
    drop(listener);
    config.hsm_nodes.insert(0, hsm_client::Node::new("127.0.0.1", dead_port));

    let client = HsmClient::connect(config, keys()).await.expect("connect");
    assert_eq!(client.balancer().healthy_count(), 1);
    assert!(!client.balancer().pools()[0].is_healthy());
    assert!(client.generate_hmac(HMAC_KEY, "payload").await.is_ok());

    shutdown_all(client, sims).await;
}

#[tokio::test]
async fn connect_fails_when_no_node_warms_up() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let mut config = HsmConfig::new(LoadBalancingType::ClientSideFailover);
    config.hsm_nodes = vec![hsm_client::Node::new("127.0.0.1", port)];
    config.borrow_timeout_ms = 200;

    let err = HsmClient::connect(config, keys()).await.err().unwrap();
    assert!(matches!(err, HsmError::NoHealthyNode(_)), "got {err:?}");
}

#[tokio::test]
async fn missing_key_never_reaches_a_node() {
    let sims = start_sims(&[Behavior::Normal]).await;
    let client = HsmClient::connect(config_for(&sims, LoadBalancingType::ClientSideFailover), keys())
        .await
        .expect("connect");

    let err = client.generate_visa_cavv("icici", "data").await.unwrap_err();
    assert!(matches!(err, HsmError::KeyNotFound(_)));
    assert_eq!(sims[0].commands_received(), 0);

    shutdown_all(client, sims).await;
}

#[tokio::test]
async fn connects_from_json_config() {
    let sims = start_sims(&[Behavior::Normal]).await;
    let json = format!(
        r#"{{
            "provider": "UTIMACO",
            "loadBalancingType": "NETWORK_LEVEL",
            "vip": "{}",
            "maxConnections": 2,
            "idleConnections": 2,
            "keyBlocks": {{ "{HMAC_KEY}": "S10096" }}
        }}"#,
        sims[0].addr()
    );
    let config = HsmConfig::from_json_str(&json).unwrap();
    let client = HsmClient::connect(config, HashMap::new()).await.expect("connect");

    assert_eq!(client.balancer().pools().len(), 1);
    assert_eq!(client.balancer().pools()[0].stats().total, 2);
    assert!(client.generate_hmac(HMAC_KEY, "payload").await.is_ok());

    shutdown_all(client, sims).await;
}

#[tokio::test]
async fn out_of_order_replies_reach_their_callers() {
    let jittery = SimServer::start(Behavior::Jitter(Duration::from_millis(40))).await.unwrap();
    let steady = SimServer::start(Behavior::Normal).await.unwrap();
    let codec: Arc<dyn ProtocolCodec> = Arc::new(UtimacoCodec::new());
    let factory = |node| {
        ConnectionFactory::new(
            node,
            Arc::clone(&codec),
            Duration::from_millis(500),
            ConnectionSettings::default(),
        )
    };
    let multiplexed = factory(jittery.node()).create().await.unwrap();
    let reference = factory(steady.node()).create().await.unwrap();

    let commands: Vec<String> = (0..16)
        .map(|i| codec.build_hmac_command("KB", &format!("data-{i}")))
        .collect();

    let mut handles = Vec::with_capacity(commands.len());
    for (i, command) in commands.iter().enumerate() {
        let id = format!("REQ{i}");
        handles.push(multiplexed.send(command, &id, Some(Duration::from_secs(1))).await);
    }
    let results = join_all(handles).await;

    for (command, result) in commands.iter().zip(results) {
        let expected = reference
            .send(command, "REF", Some(Duration::from_secs(1)))
            .await
            .await
            .unwrap();
        assert_eq!(result.unwrap(), expected);
    }
    assert_eq!(multiplexed.pending_requests(), 0);

    multiplexed.close().await;
    reference.close().await;
    jittery.shutdown().await;
    steady.shutdown().await;
}
