//! NAT-traversal relay client seam — STUN/TURN negotiation lives outside
//! this crate and is consumed only through this trait.

use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("relay allocation failed: {0}")]
    AllocationFailed(String),
    #[error("relay refresh failed: {0}")]
    RefreshFailed(String),
}

/// An ICE-style relay/TURN client. The swarm only calls this when ICE
/// servers are configured; the implementation itself (STUN/TURN
/// negotiation, the actual relayed data path) is an external
/// collaborator, out of scope for this crate.
///
/// `async_trait` is used here (and nowhere else in this crate) purely to
/// keep this seam object-safe — the swarm holds an
/// `Option<Arc<dyn RelayClient>>` chosen at construction time, not a
/// generic type parameter, since whether a node is behind NAT is a
/// runtime configuration fact, not a compile-time one.
#[async_trait::async_trait]
pub trait RelayClient: Send + Sync {
    async fn is_behind_nat(&self) -> bool;

    /// Reserve a public address with the given lifetime.
    async fn allocate(&self, lifetime: Duration) -> Result<SocketAddr, RelayError>;

    /// Extend the current allocation, returning the new lifetime granted.
    async fn refresh_allocation(&self, lifetime: Duration) -> Result<Duration, RelayError>;

    async fn create_permission(&self, endpoint: SocketAddr) -> Result<(), RelayError>;

    /// Block until a relayed stream is accepted (used by the relay-binding
    /// loop).
    async fn accept_relayed_stream(&self) -> Result<(), RelayError>;

    async fn get_mapped_address(&self) -> Option<SocketAddr>;
}
