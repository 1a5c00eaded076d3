//! Peer-swarm networking core for a blockchain node: membership/peer
//! registry, ZeroMQ ROUTER/DEALER transport, periodic delta gossip, inbound
//! message dispatch, and block/tx reconciliation.
//!
//! The block/transaction data model, consensus, and persistent storage live
//! outside this crate and are reached only through the [`chain`] module's
//! `Chain`/`BlockCodec` traits.

pub mod chain;
pub mod config;
pub mod demo_chain;
pub mod dispatcher;
pub mod distribute;
pub mod error;
pub mod events;
pub mod keys;
pub mod message;
pub mod peer;
pub mod registry;
pub mod relay;
pub mod reply;
pub mod swarm;
pub mod sync;
pub mod transport;
pub mod util;

pub use chain::{Block, BlockCodec, BlockHash, BlockHeader, Chain, ChainError, ChainId, Tx, TxId};
pub use config::SwarmConfig;
pub use error::{CodecError, PeerError, SwarmError};
pub use peer::{Address, Peer};
pub use swarm::Swarm;
