//! Peer registry.
//!
//! Tracks known peers and their last-seen timestamps, recently-removed
//! peers, and the outbound-socket handle for each active peer. Mutation
//! only happens inside one of the four named mutexes owned by the swarm,
//! but Rust has no garbage collector standing between a torn write and a
//! concurrent read, so an unsynchronized `HashMap` shared across tasks is
//! simply unsound — not just bad practice, but unsound against the
//! language's own memory model. We wrap the three maps in one finer-grained
//! `RwLock`, always acquired and released within a single call and never
//! held across an `await` that crosses one of the four named mutexes. The
//! named mutexes still define the application-level atomicity and lock
//! order; this lock is purely an implementation-level safety net.

use crate::error::PeerError;
use crate::message::Frames;
use crate::peer::{Address, Peer};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// A handle to a peer's outbound (dealer) socket, owned by the transport.
/// The registry only ever calls `close`; `send`/`recv` are used by the
/// delta distributor, broadcast paths, and the block-sync/tx-gossip
/// request/response queries, all of which look the socket up by address
/// and hold only this trait object, never the concrete `Dealer`.
#[async_trait::async_trait]
pub trait OutboundSocketHandle: Send + Sync {
    /// Dispose of the socket. Called at most once.
    fn close(&self);

    async fn send(&self, frames: Frames, timeout: Duration) -> Result<(), PeerError>;

    /// Receive the next reply frame set on this socket, or `PeerError::Timeout`.
    async fn recv(&self, timeout: Duration) -> Result<Frames, PeerError>;
}

struct Inner {
    active: HashMap<Address, (Peer, u64)>,
    removed: HashMap<Address, (Peer, u64)>,
    sockets: HashMap<Address, Arc<dyn OutboundSocketHandle>>,
}

pub struct PeerRegistry {
    self_public_key: ed25519_dalek::VerifyingKey,
    inner: RwLock<Inner>,
}

impl PeerRegistry {
    pub fn new(self_public_key: ed25519_dalek::VerifyingKey) -> Self {
        PeerRegistry {
            self_public_key,
            inner: RwLock::new(Inner {
                active: HashMap::new(),
                removed: HashMap::new(),
                sockets: HashMap::new(),
            }),
        }
    }

    pub fn is_self(&self, peer: &Peer) -> bool {
        peer.public_key == self.self_public_key
    }

    pub async fn contains(&self, address: &Address) -> bool {
        self.inner.read().await.active.contains_key(address)
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.active.len()
    }

    pub async fn snapshot(&self) -> Vec<Peer> {
        self.inner.read().await.active.values().map(|(p, _)| *p).collect()
    }

    pub async fn last_seen(&self, address: &Address) -> Option<u64> {
        self.inner.read().await.active.get(address).map(|(_, ts)| *ts)
    }

    /// Bump an already-active peer's last-seen timestamp without touching
    /// its socket — used to record `last_seen[sender]` on every processed
    /// delta, independent of whether `add()` actually inserted anything
    /// this round.
    pub async fn touch(&self, address: &Address, timestamp_ms: u64) {
        if let Some((_, ts)) = self.inner.write().await.active.get_mut(address) {
            *ts = timestamp_ms.max(*ts);
        }
    }

    /// The removal timestamp recorded for `address`, if any — used to
    /// enforce "re-entry only with timestamp > removal timestamp" before
    /// `add()` inserts a peer.
    pub async fn removed_at(&self, address: &Address) -> Option<u64> {
        self.inner.read().await.removed.get(address).map(|(_, ts)| *ts)
    }

    /// Active peers whose last-seen timestamp is strictly after
    /// `after_ms` and at most `now_ms` — the distributor's "added since
    /// last broadcast" computation.
    pub async fn active_since(&self, after_ms: u64, now_ms: u64) -> Vec<Peer> {
        self.inner
            .read()
            .await
            .active
            .values()
            .filter(|(_, ts)| *ts > after_ms && *ts <= now_ms)
            .map(|(p, _)| *p)
            .collect()
    }

    pub async fn removed_since(&self, after_ms: u64, now_ms: u64) -> Vec<(Peer, u64)> {
        self.inner
            .read()
            .await
            .removed
            .values()
            .filter(|(_, ts)| *ts > after_ms && *ts <= now_ms)
            .map(|(p, ts)| (*p, *ts))
            .collect()
    }

    /// Consume (remove from the removed map) every entry with timestamp
    /// `<= now_ms`, returning what was consumed. Entries are announced by
    /// the delta distributor exactly once.
    pub async fn drain_removed_up_to(&self, now_ms: u64) -> Vec<(Peer, u64)> {
        let mut inner = self.inner.write().await;
        let (to_remove, keep): (HashMap<_, _>, HashMap<_, _>) =
            inner.removed.drain().partition(|(_, (_, ts))| *ts <= now_ms);
        inner.removed = keep;
        to_remove.into_values().collect()
    }

    /// Insert a peer as active with the given socket handle, recording the
    /// timestamp. Enforces "re-entry only with timestamp > removal
    /// timestamp" by the caller having already checked `removed_at`; this
    /// just performs the write atomically.
    pub async fn insert_active(
        &self,
        peer: Peer,
        timestamp_ms: u64,
        socket: Arc<dyn OutboundSocketHandle>,
    ) {
        let address = peer.address();
        let mut inner = self.inner.write().await;
        inner.active.insert(address, (peer, timestamp_ms));
        inner.sockets.insert(address, socket);
    }

    /// A point-in-time copy of every outbound socket handle, for broadcast
    /// paths that must not hold the registry lock while sending.
    pub async fn snapshot_sockets(&self) -> Vec<(Address, Arc<dyn OutboundSocketHandle>)> {
        self.inner.read().await.sockets.iter().map(|(a, s)| (*a, Arc::clone(s))).collect()
    }

    /// Record a removal timestamp for `peer` without touching the
    /// active/socket maps; used when only bookkeeping is needed. The full
    /// `Peer` (not just the address) is kept so the distributor can still
    /// announce it after it has left the active map.
    pub async fn mark_removed(&self, peer: Peer, timestamp_ms: u64) {
        self.inner.write().await.removed.insert(peer.address(), (peer, timestamp_ms));
    }

    /// Remove `address` from the active map and return/close its socket,
    /// if any. Does not touch the removed map.
    pub async fn evict(&self, address: &Address) -> Option<Peer> {
        let mut inner = self.inner.write().await;
        let peer = inner.active.remove(address).map(|(p, _)| p);
        if let Some(socket) = inner.sockets.remove(address) {
            socket.close();
        }
        peer
    }

    /// Find every active peer sharing `public_key`, regardless of address
    /// — used so that removing a peer by public key also drops any other
    /// endpoint it is known under ("key-identity dominates endpoint
    /// changes").
    pub async fn addresses_for_public_key(
        &self,
        public_key: &ed25519_dalek::VerifyingKey,
    ) -> Vec<Address> {
        self.inner
            .read()
            .await
            .active
            .values()
            .filter(|(p, _)| &p.public_key == public_key)
            .map(|(p, _)| p.address())
            .collect()
    }

    pub async fn get(&self, address: &Address) -> Option<Peer> {
        self.inner.read().await.active.get(address).map(|(p, _)| *p)
    }

    /// Close every outbound socket and clear both maps. Used by `stop()`.
    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        for (_, socket) in inner.sockets.drain() {
            socket.close();
        }
        inner.active.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    struct NoopSocket;
    #[async_trait::async_trait]
    impl OutboundSocketHandle for NoopSocket {
        fn close(&self) {}

        async fn send(&self, _frames: Frames, _timeout: Duration) -> Result<(), PeerError> {
            Ok(())
        }

        async fn recv(&self, _timeout: Duration) -> Result<Frames, PeerError> {
            Err(PeerError::Timeout)
        }
    }

    fn rand_peer(port: u16) -> Peer {
        let signing = SigningKey::generate(&mut OsRng);
        Peer::new(signing.verifying_key(), "127.0.0.1".parse().unwrap(), port)
    }

    #[tokio::test]
    async fn insert_then_evict_round_trips() {
        let registry = PeerRegistry::new(SigningKey::generate(&mut OsRng).verifying_key());
        let peer = rand_peer(9001);
        registry.insert_active(peer, 10, Arc::new(NoopSocket)).await;
        assert!(registry.contains(&peer.address()).await);
        assert_eq!(registry.count().await, 1);

        let evicted = registry.evict(&peer.address()).await;
        assert_eq!(evicted, Some(peer));
        assert!(!registry.contains(&peer.address()).await);
    }

    #[tokio::test]
    async fn removed_peers_drain_exactly_once() {
        let registry = PeerRegistry::new(SigningKey::generate(&mut OsRng).verifying_key());
        let peer = rand_peer(9001);
        registry.mark_removed(peer, 5).await;

        let drained = registry.drain_removed_up_to(10).await;
        assert_eq!(drained, vec![(peer, 5)]);

        let drained_again = registry.drain_removed_up_to(10).await;
        assert!(drained_again.is_empty());
    }

    #[tokio::test]
    async fn same_public_key_is_found_across_endpoints() {
        let registry = PeerRegistry::new(SigningKey::generate(&mut OsRng).verifying_key());
        let a = rand_peer(9001);
        let b = Peer::new(a.public_key, a.host, 9002);
        registry.insert_active(a, 1, Arc::new(NoopSocket)).await;
        registry.insert_active(b, 2, Arc::new(NoopSocket)).await;

        let found = registry.addresses_for_public_key(&a.public_key).await;
        assert_eq!(found.len(), 1, "a and b share an address since it's derived from the key");
    }
}
