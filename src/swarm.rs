//! The swarm: construction, peer-set mutation primitives (`add`/`remove`),
//! request/response queries against a single peer, and lifecycle
//! (`start`/`stop`/broadcast).
//!
//! The delta distributor (`distribute.rs`), dispatcher (`dispatcher.rs`),
//! and block-sync/tx-gossip engine (`sync.rs`) are free functions taking
//! `&Arc<Swarm>` rather than methods on one god object.

use crate::chain::{Block, BlockCodec, BlockHash, Chain, Tx, TxId};
use crate::config::SwarmConfig;
use crate::error::{PeerError, SwarmError};
use crate::events::Events;
use crate::message::{Message, MessageKind};
use crate::peer::{Address, Peer};
use crate::registry::{OutboundSocketHandle, PeerRegistry};
use crate::relay::RelayClient;
use crate::reply::{OutgoingReply, ReplyQueue};
use crate::transport::{self, Dealer, Router};
use crate::util::now_ms;
use ed25519_dalek::{SigningKey, VerifyingKey};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

/// Every 10th distribute tick is a full re-sync broadcast.
pub const FULL_DISTRIBUTE_EVERY: u64 = 10;

/// Per-message send timeout used by broadcasts and the delta distributor.
pub const BROADCAST_SEND_TIMEOUT: Duration = Duration::from_millis(300);

pub struct Swarm {
    pub(crate) ctx: zmq::Context,
    pub(crate) signing_key: SigningKey,
    pub(crate) local_protocol_version: i32,
    pub(crate) dial_timeout: Duration,
    pub(crate) request_timeout: Duration,
    pub(crate) distribute_interval: Duration,
    configured_host: Option<std::net::IpAddr>,
    configured_port: u16,

    pub(crate) registry: PeerRegistry,
    router: RwLock<Option<Arc<Router>>>,
    pub(crate) reply_queue: ReplyQueue,
    reply_rx: Mutex<Option<mpsc::UnboundedReceiver<OutgoingReply>>>,

    pub events: Events,
    pub(crate) chain: Arc<dyn Chain>,
    pub(crate) codec: Arc<dyn BlockCodec>,
    relay: Option<Arc<dyn RelayClient>>,
    advertised_endpoint: RwLock<Option<SocketAddr>>,

    running: Mutex<bool>,
    pub(crate) block_sync_mutex: Mutex<()>,
    pub(crate) receive_mutex: Mutex<()>,
    distribute_mutex: Mutex<()>,
    pub(crate) last_distributed_ms: Mutex<u64>,
    pub(crate) last_received_ms: Mutex<u64>,
    distribute_tick: AtomicU64,

    pub(crate) cancel: CancellationToken,
}

impl Swarm {
    pub fn new(
        signing_key: SigningKey,
        config: &SwarmConfig,
        chain: Arc<dyn Chain>,
        codec: Arc<dyn BlockCodec>,
        relay: Option<Arc<dyn RelayClient>>,
    ) -> Result<Arc<Swarm>, SwarmError> {
        config.validate()?;
        let verifying_key = signing_key.verifying_key();
        let (reply_queue, reply_rx) = ReplyQueue::new();
        Ok(Arc::new(Swarm {
            ctx: zmq::Context::new(),
            signing_key,
            local_protocol_version: config.protocol_version,
            dial_timeout: config.dial_timeout(),
            request_timeout: config.request_timeout(),
            distribute_interval: config.distribute_interval(),
            configured_host: config.host,
            configured_port: config.port,
            registry: PeerRegistry::new(verifying_key),
            router: RwLock::new(None),
            reply_queue,
            reply_rx: Mutex::new(Some(reply_rx)),
            events: Events::default(),
            chain,
            codec,
            relay,
            advertised_endpoint: RwLock::new(None),
            running: Mutex::new(false),
            block_sync_mutex: Mutex::new(()),
            receive_mutex: Mutex::new(()),
            distribute_mutex: Mutex::new(()),
            last_distributed_ms: Mutex::new(0),
            last_received_ms: Mutex::new(0),
            distribute_tick: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        }))
    }

    pub fn local_public_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn local_address(&self) -> Address {
        Address::from_public_key(&self.local_public_key())
    }

    pub fn local_protocol_version(&self) -> i32 {
        self.local_protocol_version
    }

    pub async fn is_running(&self) -> bool {
        *self.running.lock().await
    }

    pub async fn peer_count(&self) -> usize {
        self.registry.count().await
    }

    pub async fn contains_peer(&self, address: &Address) -> bool {
        self.registry.contains(address).await
    }

    pub async fn snapshot_peers(&self) -> Vec<Peer> {
        self.registry.snapshot().await
    }

    pub(crate) async fn router_handle(&self) -> Option<Arc<Router>> {
        self.router.read().await.clone()
    }

    /// The endpoint advertised to peers — the relay-allocated address if
    /// behind NAT, otherwise the configured host/bound port.
    pub async fn advertised_endpoint(&self) -> Option<SocketAddr> {
        *self.advertised_endpoint.read().await
    }

    /// Build and sign a message, ready to enqueue as a reply or send
    /// directly on a dealer.
    pub(crate) fn sign(&self, reply_identity: &[u8], kind: &MessageKind) -> Vec<Vec<u8>> {
        Message::encode(&self.signing_key, reply_identity, kind)
    }

    pub(crate) fn enqueue_reply(&self, connection_identity: Vec<u8>, frames: Vec<Vec<u8>>) {
        self.reply_queue.enqueue(connection_identity, frames);
    }

    // ---- peer registry mutation -----------------------------------------

    /// For each peer not equal to self and not already known, dial it (if
    /// the swarm is running) and insert it into the registry on success.
    /// Returns the accepted subset. Dial failures with `Io`, `Timeout`, or
    /// `DifferentAppProtocolVersion` are swallowed (logged).
    pub async fn add(self: &Arc<Self>, peers: Vec<Peer>, timestamp_ms: u64) -> Vec<Peer> {
        let running = self.is_running().await;
        let mut accepted = Vec::new();
        for peer in peers {
            if self.registry.is_self(&peer) {
                continue;
            }
            if self.registry.contains(&peer.address()).await {
                continue;
            }
            if let Some(removed_ts) = self.registry.removed_at(&peer.address()).await {
                if timestamp_ms <= removed_ts {
                    continue;
                }
            }
            if !running {
                continue;
            }
            match self.dial(&peer).await {
                Ok(dealer) => {
                    self.registry.insert_active(peer, timestamp_ms, Arc::new(dealer)).await;
                    tracing::info!(peer = %peer, "dialed and added peer");
                    accepted.push(peer);
                }
                Err(PeerError::DifferentAppProtocolVersion { local, remote }) => {
                    tracing::warn!(peer = %peer, local, remote, "peer speaks a different protocol version, skipping");
                }
                Err(e) => {
                    tracing::warn!(peer = %peer, error = %e, "dial failed, skipping peer");
                }
            }
        }
        accepted
    }

    /// Record removal, close and drop outbound sockets for the removed
    /// addresses, and (key-identity dominates endpoint changes) any other
    /// address sharing the same public key.
    pub async fn remove(&self, peers: Vec<Peer>, timestamp_ms: u64) {
        for peer in peers {
            let address = peer.address();
            for other in self.registry.addresses_for_public_key(&peer.public_key).await {
                if other != address {
                    if let Some(dominated) = self.registry.evict(&other).await {
                        self.registry.mark_removed(dominated, timestamp_ms).await;
                    }
                }
            }
            self.registry.evict(&address).await;
            self.registry.mark_removed(peer, timestamp_ms).await;
            tracing::info!(peer = %peer, "removed peer");
        }
    }

    async fn dial(&self, peer: &Peer) -> Result<Dealer, PeerError> {
        transport::dial(
            &self.ctx,
            peer,
            self.local_address().0.as_slice(),
            &self.signing_key,
            self.local_protocol_version,
            self.dial_timeout,
        )
        .await
    }

    // ---- request/response queries against one peer -----------------------

    async fn dealer_for(&self, address: &Address) -> Result<Arc<dyn OutboundSocketHandle>, PeerError> {
        let endpoint = self
            .registry
            .get(address)
            .await
            .map(|p| p.endpoint())
            .unwrap_or_else(|| SocketAddr::new(std::net::IpAddr::from([0, 0, 0, 0]), 0));
        self.registry
            .snapshot_sockets()
            .await
            .into_iter()
            .find(|(a, _)| a == address)
            .map(|(_, socket)| socket)
            .ok_or(PeerError::PeerNotFound(endpoint))
    }

    pub async fn request_block_hashes(
        &self,
        to: &Address,
        locator: Vec<BlockHash>,
        stop: Option<BlockHash>,
    ) -> Result<Vec<BlockHash>, PeerError> {
        let socket = self.dealer_for(to).await?;
        let frames = self.sign(b"", &MessageKind::GetBlockHashes { locator, stop });
        socket.send(frames, self.request_timeout).await?;
        let reply = socket.recv(self.request_timeout).await?;
        match Message::parse(reply, true) {
            Ok(Message { kind: MessageKind::BlockHashes { hashes, .. }, .. }) => Ok(hashes),
            _ => Err(PeerError::Timeout),
        }
    }

    /// Request `hashes` from `to` and collect the corresponding decoded
    /// blocks, one `Block` reply expected per requested hash, in order.
    pub async fn request_blocks(&self, to: &Address, hashes: Vec<BlockHash>) -> Result<Vec<Block>, PeerError> {
        let socket = self.dealer_for(to).await?;
        let count = hashes.len();
        let frames = self.sign(b"", &MessageKind::GetBlocks { hashes });
        socket.send(frames, self.request_timeout).await?;
        let mut blocks = Vec::with_capacity(count);
        for _ in 0..count {
            let reply = socket.recv(self.request_timeout).await?;
            match Message::parse(reply, true) {
                Ok(Message { kind: MessageKind::Block { payload }, .. }) => {
                    let block = self
                        .codec
                        .decode_block(&payload)
                        .map_err(|e| PeerError::Io(std::io::Error::other(e.to_string())))?;
                    blocks.push(block);
                }
                _ => return Err(PeerError::Timeout),
            }
        }
        Ok(blocks)
    }

    pub async fn request_txs(&self, to: &Address, ids: Vec<TxId>) -> Result<Vec<Tx>, PeerError> {
        let socket = self.dealer_for(to).await?;
        let count = ids.len();
        let frames = self.sign(b"", &MessageKind::GetTxs { ids });
        socket.send(frames, self.request_timeout).await?;
        let mut txs = Vec::with_capacity(count);
        for _ in 0..count {
            let reply = socket.recv(self.request_timeout).await?;
            match Message::parse(reply, true) {
                Ok(Message { kind: MessageKind::Tx { payload }, .. }) => {
                    let tx = self
                        .codec
                        .decode_tx(&payload)
                        .map_err(|e| PeerError::Io(std::io::Error::other(e.to_string())))?;
                    txs.push(tx);
                }
                _ => return Err(PeerError::Timeout),
            }
        }
        Ok(txs)
    }

    // ---- broadcast fan-out -----------------------------------------------

    /// Send `frames` to every outbound dealer, tolerating per-dealer
    /// failures.
    pub(crate) async fn broadcast(&self, frames: Vec<Vec<u8>>) {
        for (address, socket) in self.registry.snapshot_sockets().await {
            if let Err(e) = socket.send(frames.clone(), BROADCAST_SEND_TIMEOUT).await {
                tracing::warn!(peer = %address, error = %e, "broadcast send failed");
            }
        }
    }

    pub async fn broadcast_blocks(&self, blocks: &[Block]) {
        let hashes = blocks.iter().map(|b| b.header.hash).collect();
        let frames = self.sign(b"", &MessageKind::BlockHashes { sender: self.local_address(), hashes });
        self.broadcast(frames).await;
    }

    pub async fn broadcast_txs(&self, txs: &[Tx]) {
        let ids = txs.iter().map(|t| t.id).collect();
        let frames = self.sign(b"", &MessageKind::TxIds { sender: self.local_address(), ids });
        self.broadcast(frames).await;
    }

    // ---- lifecycle ---------------------------------------------------------

    /// Binds the inbound socket, re-dials known peers, and runs the
    /// distributor/dispatcher/reply-writer (and, if behind NAT, the relay
    /// loops) until cancelled or one of them returns an unexpected error,
    /// at which point `stop()` always runs.
    pub async fn start(self: &Arc<Self>) -> Result<(), SwarmError> {
        let mut behind_nat = false;
        {
            let mut running = self.running.lock().await;
            if *running {
                return Err(SwarmError::AlreadyRunning);
            }

            // Bind first: when `configured_port` is 0 (ephemeral), the
            // advertised endpoint must carry the port the OS actually chose,
            // not the configured one.
            let router = Router::bind(&self.ctx, self.configured_port).map_err(SwarmError::Peer)?;
            let bound_port = router.port();

            if let Some(relay) = &self.relay {
                behind_nat = relay.is_behind_nat().await;
                if behind_nat {
                    let endpoint = relay
                        .allocate(RELAY_ALLOCATION_LIFETIME)
                        .await
                        .map_err(|e| SwarmError::Relay(e.to_string()))?;
                    *self.advertised_endpoint.write().await = Some(endpoint);
                    tracing::info!(%endpoint, "allocated relay endpoint");
                } else if let Some(host) = self.configured_host {
                    *self.advertised_endpoint.write().await = Some(SocketAddr::new(host, bound_port));
                } else {
                    *self.advertised_endpoint.write().await =
                        Some(SocketAddr::new(std::net::IpAddr::from([0, 0, 0, 0]), bound_port));
                }
            } else if let Some(host) = self.configured_host {
                *self.advertised_endpoint.write().await = Some(SocketAddr::new(host, bound_port));
            } else {
                *self.advertised_endpoint.write().await =
                    Some(SocketAddr::new(std::net::IpAddr::from([0, 0, 0, 0]), bound_port));
            }
            *self.router.write().await = Some(Arc::new(router));

            *running = true;

            let known: Vec<Peer> = self.registry.snapshot().await;
            drop(running);
            if !known.is_empty() {
                self.add(known, now_ms()).await;
            }
        }

        let reply_rx = self.reply_rx.lock().await.take().expect("reply receiver taken twice");
        let router_for_writer = self.router_handle().await.expect("router just bound");

        let dispatcher = tokio::spawn(crate::dispatcher::run(Arc::clone(self)));
        let distributor = tokio::spawn(crate::distribute::run(Arc::clone(self)));
        let writer = tokio::spawn(crate::reply::writer_loop(router_for_writer, reply_rx, self.cancel.clone()));

        // Spec §4.9 step 5: the relay-binding/allocation-refresh loops run
        // only "if behind NAT" — a relay-configured-but-not-behind-NAT node
        // never allocated anything, so refreshing would refresh nothing.
        let relay_loops = if behind_nat {
            self.relay.clone().map(|relay| {
                let refresh = tokio::spawn(relay_refresh_loop(Arc::clone(self), Arc::clone(&relay)));
                let binding = tokio::spawn(relay_binding_loop(self.cancel.clone(), relay));
                vec![refresh, binding]
            })
        } else {
            None
        };

        tokio::select! {
            _ = self.cancel.cancelled() => {
                tracing::info!("swarm cancelled");
            }
            res = dispatcher => {
                if let Err(e) = res {
                    tracing::error!("dispatcher task panicked: {e}");
                }
            }
            res = distributor => {
                if let Err(e) = res {
                    tracing::error!("distributor task panicked: {e}");
                }
            }
            res = writer => {
                if let Err(e) = res {
                    tracing::error!("reply writer task panicked: {e}");
                }
            }
        }

        if let Some(handles) = relay_loops {
            for handle in handles {
                handle.abort();
            }
        }

        self.stop().await;
        Ok(())
    }

    /// Announces our own departure, then disposes every socket.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        if !*running {
            return;
        }
        self.cancel.cancel();

        let self_peer = self.local_self_peer().await;
        if let Some(peer) = self_peer {
            self.registry.mark_removed(peer, now_ms()).await;
        }
        crate::distribute::distribute(self, false).await;

        *self.router.write().await = None;
        self.registry.clear().await;
        *running = false;
        tracing::info!("swarm stopped");
    }

    async fn local_self_peer(&self) -> Option<Peer> {
        let endpoint = self.advertised_endpoint().await?;
        Some(Peer::new(self.local_public_key(), endpoint.ip(), endpoint.port()))
    }

    pub(crate) async fn self_peer_for_delta(&self) -> Peer {
        match self.local_self_peer().await {
            Some(p) => p,
            None => Peer::new(self.local_public_key(), std::net::IpAddr::from([0, 0, 0, 0]), 0),
        }
    }

    pub(crate) fn next_distribute_tick(&self) -> u64 {
        self.distribute_tick.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn distribute_mutex(&self) -> &Mutex<()> {
        &self.distribute_mutex
    }
}

/// NAT-traversal allocation lifetime.
pub const RELAY_ALLOCATION_LIFETIME: Duration = Duration::from_secs(777);

/// Allocation-refresh loop: refresh at lifetime-minus-1-minute.
async fn relay_refresh_loop(swarm: Arc<Swarm>, relay: Arc<dyn RelayClient>) {
    let refresh_after = RELAY_ALLOCATION_LIFETIME.saturating_sub(Duration::from_secs(60));
    loop {
        tokio::select! {
            _ = swarm.cancel.cancelled() => return,
            _ = tokio::time::sleep(refresh_after) => {
                match relay.refresh_allocation(RELAY_ALLOCATION_LIFETIME).await {
                    Ok(new_lifetime) => {
                        tracing::info!(lifetime_secs = new_lifetime.as_secs(), "refreshed relay allocation");
                    }
                    Err(e) => {
                        tracing::warn!("relay allocation refresh failed: {e}");
                    }
                }
            }
        }
    }
}

/// Relay-binding loop: continuously accept relayed streams so
/// NAT-traversed peers can reach us. The relayed data path itself is the
/// relay client's concern; this loop only keeps the accept side alive.
async fn relay_binding_loop(cancel: CancellationToken, relay: Arc<dyn RelayClient>) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            result = relay.accept_relayed_stream() => {
                if let Err(e) = result {
                    tracing::warn!("relay binding error: {e}");
                }
            }
        }
    }
}
