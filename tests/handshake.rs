//! Loopback integration tests exercising real ZeroMQ sockets between two
//! in-process swarms: the dial handshake, mutual registry convergence via
//! delta distribution, and the protocol-version mismatch rejection.

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use std::sync::Arc;
use std::time::Duration;
use swarm_core::chain::{Block, BlockCodec, BlockHash, BlockHeader, Chain, ChainError, ChainId, Tx, TxId};
use swarm_core::config::SwarmConfig;
use swarm_core::peer::{Address, Peer};
use swarm_core::swarm::Swarm;
use swarm_core::util::now_ms;

struct EmptyChain;
impl Chain for EmptyChain {
    fn id(&self) -> ChainId {
        ChainId(1)
    }
    fn tip(&self) -> Option<BlockHeader> {
        None
    }
    fn contains_block(&self, _hash: &BlockHash) -> bool {
        false
    }
    fn contains_tx(&self, _id: &TxId) -> bool {
        false
    }
    fn get_block(&self, _hash: &BlockHash) -> Option<Block> {
        None
    }
    fn get_tx(&self, _id: &TxId) -> Option<Tx> {
        None
    }
    fn get_block_locator(&self) -> Vec<BlockHash> {
        vec![]
    }
    fn find_next_hashes(&self, _locator: &[BlockHash], _stop: Option<BlockHash>, _max: usize) -> Vec<BlockHash> {
        vec![]
    }
    fn append(&self, _block: Block) -> Result<(), ChainError> {
        Ok(())
    }
    fn stage_transactions(&self, _txs: Vec<Tx>) -> Result<(), ChainError> {
        Ok(())
    }
    fn fork(&self, _branch: BlockHash) -> Box<dyn Chain> {
        Box::new(EmptyChain)
    }
    fn fresh(&self) -> Box<dyn Chain> {
        Box::new(EmptyChain)
    }
    fn swap(&self, _other: Box<dyn Chain>) {}
}

struct NoopCodec;
impl BlockCodec for NoopCodec {
    fn decode_block(&self, _payload: &[u8]) -> Result<Block, ChainError> {
        Err(ChainError::Store("not implemented".into()))
    }
    fn encode_block(&self, _block: &Block) -> Vec<u8> {
        vec![]
    }
    fn decode_tx(&self, _payload: &[u8]) -> Result<Tx, ChainError> {
        Err(ChainError::Store("not implemented".into()))
    }
    fn encode_tx(&self, _tx: &Tx) -> Vec<u8> {
        vec![]
    }
}

fn spawn_swarm(protocol_version: i32, distribute_interval_ms: u64) -> Arc<Swarm> {
    let signing_key = SigningKey::generate(&mut OsRng);
    let config = SwarmConfig {
        key_file: "unused".into(),
        protocol_version,
        dial_timeout_ms: 2000,
        request_timeout_ms: 2000,
        host: Some("127.0.0.1".parse().unwrap()),
        port: 0,
        ice_servers: vec![],
        distribute_interval_ms,
        seed_peers: vec![],
    };
    Swarm::new(signing_key, &config, Arc::new(EmptyChain), Arc::new(NoopCodec), None).unwrap()
}

/// Poll `advertised_endpoint()` until the router has bound and the port is
/// known, so callers can build a `Peer` pointing at the ephemeral port the
/// OS actually chose.
async fn wait_for_endpoint(swarm: &Arc<Swarm>) -> std::net::SocketAddr {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Some(endpoint) = swarm.advertised_endpoint().await {
                if endpoint.port() != 0 {
                    return endpoint;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("router never bound")
}

async fn wait_until<F, Fut>(timeout: Duration, mut predicate: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(timeout, async {
        loop {
            if predicate().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition never became true")
}

fn peer_for(swarm: &Arc<Swarm>, endpoint: std::net::SocketAddr) -> Peer {
    Peer::new(swarm.local_public_key(), endpoint.ip(), endpoint.port())
}

#[tokio::test]
async fn two_node_handshake_converges_to_mutual_registry() {
    let a = spawn_swarm(1, 100);
    let b = spawn_swarm(1, 100);

    let a_handle = tokio::spawn({
        let a = Arc::clone(&a);
        async move { a.start().await }
    });
    let b_handle = tokio::spawn({
        let b = Arc::clone(&b);
        async move { b.start().await }
    });

    let a_endpoint = wait_for_endpoint(&a).await;
    wait_for_endpoint(&b).await;

    let accepted = b.add(vec![peer_for(&a, a_endpoint)], now_ms()).await;
    assert_eq!(accepted.len(), 1, "B should have dialed and accepted A");
    assert!(b.contains_peer(&Address::from_public_key(&a.local_public_key())).await);

    // B's distributor announces A to nobody yet (A hasn't dialed back), but
    // once A's registry folds in B's next delta it dials B back, and from
    // there both sides converge via reciprocal first-encounter redistribution.
    wait_until(Duration::from_secs(5), || {
        let a = Arc::clone(&a);
        let b_address = Address::from_public_key(&b.local_public_key());
        async move { a.contains_peer(&b_address).await }
    })
    .await;

    assert_eq!(a.peer_count().await, 1);
    assert_eq!(b.peer_count().await, 1);

    a.stop().await;
    b.stop().await;
    a_handle.abort();
    b_handle.abort();
    let _ = tokio::join!(a_handle, b_handle);
}

#[tokio::test]
async fn mismatched_protocol_version_is_rejected() {
    let a = spawn_swarm(1, 1000);
    let b = spawn_swarm(2, 1000);

    let a_handle = tokio::spawn({
        let a = Arc::clone(&a);
        async move { a.start().await }
    });
    let b_handle = tokio::spawn({
        let b = Arc::clone(&b);
        async move { b.start().await }
    });

    let a_endpoint = wait_for_endpoint(&a).await;
    wait_for_endpoint(&b).await;

    let accepted = b.add(vec![peer_for(&a, a_endpoint)], now_ms()).await;
    assert!(accepted.is_empty(), "version mismatch must reject the dial");
    assert!(!b.contains_peer(&Address::from_public_key(&a.local_public_key())).await);
    assert_eq!(b.peer_count().await, 0);

    a.stop().await;
    b.stop().await;
    a_handle.abort();
    b_handle.abort();
    let _ = tokio::join!(a_handle, b_handle);
}
