//! HMAC load driver.
//!
//! Starts simulated nodes in-process (or targets `--node host:port` entries),
//! then fires concurrent HMAC requests through `HsmClient` and reports
//! throughput, latency quantiles and the error count.
//!
//! Usage: `hsm-bench [--requests N] [--concurrency N] [--nodes N] [--node host:port]...
//!                   [--strategy failover|round-robin] [--connections N]`

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use futures::future::join_all;
use tracing::info;
use tracing_subscriber::EnvFilter;

use hsm_client::{HsmClient, HsmConfig, LoadBalancingType, MetricsSnapshot, Node};
use hsm_sim::{Behavior, SimServer};

const KEY_NAME: &str = "BENCH_HMAC";

struct Options {
    requests: usize,
    concurrency: usize,
    sim_nodes: usize,
    nodes: Vec<Node>,
    strategy: LoadBalancingType,
    connections: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            requests: 10_000,
            concurrency: 32,
            sim_nodes: 3,
            nodes: Vec::new(),
            strategy: LoadBalancingType::ClientSideRoundRobin,
            connections: 4,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let options = parse_args(std::env::args().skip(1))?;

    let mut sims = Vec::new();
    let nodes = if options.nodes.is_empty() {
        for _ in 0..options.sim_nodes {
            sims.push(SimServer::start(Behavior::Normal).await.context("failed to start simulator")?);
        }
        sims.iter().map(SimServer::node).collect()
    } else {
        options.nodes.clone()
    };

    let mut config = HsmConfig::new(options.strategy);
    config.hsm_nodes = nodes;
    config.max_connections = options.connections;
    config.idle_connections = options.connections;
    let mut keys = HashMap::new();
    keys.insert(KEY_NAME.to_string(), "S10096K0TB00E0000".to_string());

    let client = Arc::new(HsmClient::connect(config, keys).await.context("failed to connect")?);
    info!(
        requests = options.requests,
        concurrency = options.concurrency,
        strategy = ?options.strategy,
        "starting HMAC load"
    );

    let started = Instant::now();
    let workers = (0..options.concurrency).map(|worker| {
        let client = Arc::clone(&client);
        let share = share_of(options.requests, options.concurrency, worker);
        tokio::spawn(async move {
            let mut failures = 0usize;
            for i in 0..share {
                let data = format!("{worker:04}-{i:08}");
                if client.generate_hmac(KEY_NAME, &data).await.is_err() {
                    failures += 1;
                }
            }
            failures
        })
    });
    let mut failures = 0usize;
    for joined in join_all(workers).await {
        failures += joined.context("worker panicked")?;
    }
    let elapsed = started.elapsed();

    report(&client.metrics(), failures, elapsed.as_secs_f64());

    client.shutdown().await;
    for sim in sims {
        sim.shutdown().await;
    }
    Ok(())
}

/// Requests assigned to `worker` when `total` is split over `workers`.
fn share_of(total: usize, workers: usize, worker: usize) -> usize {
    total / workers + usize::from(worker < total % workers)
}

fn report(metrics: &MetricsSnapshot, failures: usize, secs: f64) {
    let latency = &metrics.latency;
    let fmt_bound = |q: f64| match latency.quantile_upper_bound(q) {
        Some(bound) => format!("<= {bound:?}"),
        None => "overflow".to_string(),
    };
    println!("requests:   {}", metrics.requests_total);
    println!("errors:     {} ({failures} seen by workers)", metrics.errors_total);
    println!("elapsed:    {secs:.3}s");
    println!("throughput: {:.0} req/s", metrics.requests_total as f64 / secs.max(f64::EPSILON));
    println!("mean:       {:?}", latency.mean());
    println!("p50:        {}", fmt_bound(0.50));
    println!("p99:        {}", fmt_bound(0.99));
    println!("p999:       {}", fmt_bound(0.999));
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Options> {
    let mut options = Options::default();
    while let Some(flag) = args.next() {
        let mut value = || args.next().with_context(|| format!("{flag} needs a value"));
        match flag.as_str() {
            "--requests" => options.requests = value()?.parse().context("invalid --requests")?,
            "--concurrency" => options.concurrency = value()?.parse().context("invalid --concurrency")?,
            "--nodes" => options.sim_nodes = value()?.parse().context("invalid --nodes")?,
            "--node" => options.nodes.push(Node::parse(&value()?)?),
            "--connections" => options.connections = value()?.parse().context("invalid --connections")?,
            "--strategy" => {
                options.strategy = match value()?.as_str() {
                    "failover" => LoadBalancingType::ClientSideFailover,
                    "round-robin" => LoadBalancingType::ClientSideRoundRobin,
                    other => bail!("unknown strategy {other}"),
                }
            }
            other => bail!("unknown argument {other}"),
        }
    }
    if options.concurrency == 0 || options.connections == 0 {
        bail!("--concurrency and --connections must be at least 1");
    }
    if options.nodes.is_empty() && options.sim_nodes == 0 {
        bail!("--nodes must be at least 1 when no --node is given");
    }
    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shares_cover_every_request() {
        let total: usize = (0..7).map(|worker| share_of(100, 7, worker)).sum();
        assert_eq!(total, 100);
        assert_eq!(share_of(100, 7, 0), 15);
        assert_eq!(share_of(100, 7, 6), 14);
    }

    #[test]
    fn parses_flags() {
        let args = ["--requests", "50", "--node", "10.0.0.1:1500", "--strategy", "failover"]
            .into_iter()
            .map(String::from);
        let options = parse_args(args).unwrap();
        assert_eq!(options.requests, 50);
        assert_eq!(options.nodes, vec![Node::new("10.0.0.1", 1500)]);
        assert_eq!(options.strategy, LoadBalancingType::ClientSideFailover);
        assert!(parse_args(["--bogus".to_string()].into_iter()).is_err());
    }
}
