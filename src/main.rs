use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use swarm_core::config::parse_seed_peer;
use swarm_core::demo_chain::{DemoCodec, MemChain};
use swarm_core::{keys, ChainId, Swarm, SwarmConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Use JSON logs in production (SWARM_LOG_JSON=1), human-readable otherwise.
    let json_logs = std::env::var("SWARM_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("swarm_core=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = SwarmConfig::parse();
    let signing_key = keys::load_or_create(&config.key_file)?;

    // The real block/transaction model and storage layer are out of scope
    // for this crate; `MemChain`/`DemoCodec` exist only so
    // this binary is runnable standalone.
    let chain = Arc::new(MemChain::new(ChainId(1)));
    let codec = Arc::new(DemoCodec);
    let swarm = Swarm::new(signing_key, &config, chain, codec, None)?;

    tracing::info!(address = %swarm.local_address(), "swarm identity loaded");

    let seeds: Vec<_> =
        config.seed_peers.iter().map(|s| parse_seed_peer(s)).collect::<Result<_>>()?;
    if !seeds.is_empty() {
        let swarm = Arc::clone(&swarm);
        tokio::spawn(async move {
            // Give `start()` a moment to bind the router before dialing out.
            tokio::time::sleep(Duration::from_millis(200)).await;
            swarm.add(seeds, swarm_core::util::now_ms()).await;
        });
    }

    swarm.start().await?;
    Ok(())
}
