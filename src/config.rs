//! Swarm configuration.
//!
//! The library itself takes a plain `SwarmConfig` — no CLI coupling in the
//! core — but the struct derives `clap::Parser` so the `swarm-node` binary
//! can build one straight from argv/env.

use crate::error::SwarmError;
use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(name = "swarm-node", about = "Peer-swarm networking core for a blockchain node")]
pub struct SwarmConfig {
    /// Path to a hex-encoded Ed25519 signing key (see `swarm-keygen`).
    #[arg(long = "key-file", env = "SWARM_KEY_FILE")]
    pub key_file: PathBuf,

    /// Local application protocol version, compared against each peer's
    /// `Pong` during the dial handshake.
    #[arg(long = "protocol-version", env = "SWARM_PROTOCOL_VERSION", default_value_t = 1)]
    pub protocol_version: i32,

    /// Dial handshake timeout in milliseconds (default 15s).
    #[arg(long = "dial-timeout-ms", env = "SWARM_DIAL_TIMEOUT_MS", default_value_t = 15_000)]
    pub dial_timeout_ms: u64,

    /// Request/response timeout for sync-engine peer queries
    /// (`GetBlockHashes`/`GetBlocks`/`GetTxs`). Reuses the dial timeout's
    /// default but is configurable independently (see `DESIGN.md`).
    #[arg(long = "request-timeout-ms", env = "SWARM_REQUEST_TIMEOUT_MS", default_value_t = 15_000)]
    pub request_timeout_ms: u64,

    /// Locally advertised host, used when not behind NAT. Required unless
    /// at least one ICE server is configured.
    #[arg(long, env = "SWARM_HOST")]
    pub host: Option<IpAddr>,

    /// TCP port to bind the inbound ROUTER socket on; 0 = ephemeral.
    #[arg(long, env = "SWARM_PORT", default_value_t = 0)]
    pub port: u16,

    /// ICE/TURN server URLs, for NAT traversal via the relay client seam.
    #[arg(long = "ice-server", env = "SWARM_ICE_SERVERS", value_delimiter = ',')]
    pub ice_servers: Vec<String>,

    /// Delta-distribution interval in milliseconds (default 1500ms).
    #[arg(
        long = "distribute-interval-ms",
        env = "SWARM_DISTRIBUTE_INTERVAL_MS",
        default_value_t = 1500
    )]
    pub distribute_interval_ms: u64,

    /// Seed peers to dial at startup, `pubkey-hex@host:port`.
    #[arg(long = "peer", env = "SWARM_SEED_PEERS", value_delimiter = ',')]
    pub seed_peers: Vec<String>,
}

impl SwarmConfig {
    /// Either a local host or at least one ICE server must be provided;
    /// otherwise construction fails.
    pub fn validate(&self) -> Result<(), SwarmError> {
        if self.host.is_none() && self.ice_servers.is_empty() {
            return Err(SwarmError::Configuration(
                "either a local host or at least one ICE server must be provided".into(),
            ));
        }
        Ok(())
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn distribute_interval(&self) -> Duration {
        Duration::from_millis(self.distribute_interval_ms)
    }
}

/// Parse a `pubkey-hex@host:port` seed peer string into a `Peer`.
pub fn parse_seed_peer(s: &str) -> anyhow::Result<crate::peer::Peer> {
    let (key_part, endpoint_part) =
        s.split_once('@').ok_or_else(|| anyhow::anyhow!("seed peer {s:?} missing '@host:port'"))?;
    let key_bytes = hex::decode(key_part)?;
    let key_array: [u8; 32] =
        key_bytes.try_into().map_err(|_| anyhow::anyhow!("seed peer {s:?} key must be 32 bytes"))?;
    let public_key = ed25519_dalek::VerifyingKey::from_bytes(&key_array)?;
    let socket_addr: std::net::SocketAddr = endpoint_part.parse()?;
    Ok(crate::peer::Peer::new(public_key, socket_addr.ip(), socket_addr.port()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_requires_host_or_ice() {
        let mut cfg = SwarmConfig {
            key_file: PathBuf::from("k"),
            protocol_version: 1,
            dial_timeout_ms: 1000,
            request_timeout_ms: 1000,
            host: None,
            port: 0,
            ice_servers: vec![],
            distribute_interval_ms: 1500,
            seed_peers: vec![],
        };
        assert!(cfg.validate().is_err());
        cfg.host = Some("127.0.0.1".parse().unwrap());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_accepts_ice_without_host() {
        let cfg = SwarmConfig {
            key_file: PathBuf::from("k"),
            protocol_version: 1,
            dial_timeout_ms: 1000,
            request_timeout_ms: 1000,
            host: None,
            port: 0,
            ice_servers: vec!["turn:example.com".into()],
            distribute_interval_ms: 1500,
            seed_peers: vec![],
        };
        assert!(cfg.validate().is_ok());
    }
}
