//! Standalone HSM simulator.
//!
//! Usage: `hsm-sim [ADDR] [normal|close|silent|garbage|reject|delay:<ms>|jitter:<ms>]`

use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing_subscriber::EnvFilter;

use hsm_sim::{Behavior, SimServer};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let addr = args.next().unwrap_or_else(|| "127.0.0.1:1500".to_string());
    let behavior = match args.next() {
        Some(name) => parse_behavior(&name)?,
        None => Behavior::Normal,
    };

    let server = SimServer::bind(&addr, behavior)
        .await
        .with_context(|| format!("failed to bind simulator on {addr}"))?;

    tokio::signal::ctrl_c().await.context("failed to wait for ctrl-c")?;
    server.shutdown().await;
    Ok(())
}

fn parse_behavior(name: &str) -> Result<Behavior> {
    let behavior = match name {
        "normal" => Behavior::Normal,
        "close" => Behavior::CloseOnCommand,
        "silent" => Behavior::Silent,
        "garbage" => Behavior::Garbage,
        "reject" => Behavior::Reject,
        other => match other.split_once(':') {
            Some(("delay", ms)) => Behavior::Delay(parse_millis(ms)?),
            Some(("jitter", ms)) => Behavior::Jitter(parse_millis(ms)?),
            _ => bail!("unknown behavior {other}"),
        },
    };
    Ok(behavior)
}

fn parse_millis(ms: &str) -> Result<Duration> {
    let ms = ms.parse().with_context(|| format!("invalid milliseconds {ms}"))?;
    Ok(Duration::from_millis(ms))
}
