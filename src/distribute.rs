//! The delta distributor: periodically announces peer-set
//! changes to every connected peer, and folds inbound deltas back into the
//! local registry.
//!
//! A free function over `&Arc<Swarm>`/`&Swarm`, not a type of its own.

use crate::message::{MessageKind, PeerSetDelta};
use crate::peer::Peer;
use crate::swarm::{Swarm, FULL_DISTRIBUTE_EVERY};
use crate::util::now_ms;
use std::collections::HashSet;
use std::sync::Arc;

/// The timer-driven loop started by `Swarm::start()`: every
/// `distribute_interval`, distribute the incremental delta; every 10th tick,
/// distribute the full peer set instead.
pub async fn run(swarm: Arc<Swarm>) {
    let mut ticker = tokio::time::interval(swarm.distribute_interval);
    loop {
        tokio::select! {
            _ = swarm.cancel.cancelled() => return,
            _ = ticker.tick() => {
                let tick = swarm.next_distribute_tick();
                let all = tick % FULL_DISTRIBUTE_EVERY == 0;
                distribute(&swarm, all).await;
            }
        }
    }
}

/// One distribution round. `all = true` additionally attaches the full
/// current peer set as `existing`, so a freshly-joined peer (or one that
/// missed earlier incremental deltas) can reconstruct the whole peer set
/// from a single message.
pub async fn distribute(swarm: &Swarm, all: bool) {
    let _guard = swarm.distribute_mutex().lock().await;

    let now = now_ms();
    let last_distributed = *swarm.last_distributed_ms.lock().await;

    let added = swarm.registry.active_since(last_distributed, now).await;
    // Removed entries are consumed here and announced at most once,
    // regardless of `all` — there is no "existing" equivalent for removals.
    let removed: Vec<Peer> =
        swarm.registry.drain_removed_up_to(now).await.into_iter().map(|(p, _)| p).collect();

    if !all && added.is_empty() && removed.is_empty() {
        return;
    }

    let existing = if all {
        let added_addresses: HashSet<_> = added.iter().map(|p| p.address()).collect();
        Some(
            swarm
                .registry
                .snapshot()
                .await
                .into_iter()
                .filter(|p| !added_addresses.contains(&p.address()))
                .collect(),
        )
    } else {
        None
    };

    let sender = swarm.self_peer_for_delta().await;
    let delta = PeerSetDelta { sender, timestamp_ms: now, added, removed, existing };
    let frames = swarm.sign(b"", &MessageKind::PeerSetDelta(delta));

    *swarm.last_distributed_ms.lock().await = now;
    swarm.broadcast(frames).await;
    swarm.events.delta_distributed.set();
}

/// Fold an inbound `PeerSetDelta` into the local registry, symmetric to
/// `distribute` above but applied to the receiving side.
pub async fn process_delta(swarm: &Arc<Swarm>, delta: PeerSetDelta) {
    let sender_address = delta.sender.address();
    let first_encounter =
        !swarm.registry.is_self(&delta.sender) && !swarm.contains_peer(&sender_address).await;

    let mut delta = delta;
    {
        let _guard = swarm.receive_mutex.lock().await;

        if first_encounter && !delta.added.iter().any(|p| p.address() == sender_address) {
            delta.added.push(delta.sender);
        }

        // The public-key-equals-self check guards only whether a peer is
        // recorded as removed, never whether its socket gets torn down —
        // so filter self out before either.
        let removed: Vec<Peer> =
            delta.removed.iter().copied().filter(|p| !swarm.registry.is_self(p)).collect();
        swarm.remove(removed, delta.timestamp_ms).await;

        let removed_keys: HashSet<_> = delta.removed.iter().map(|p| p.public_key).collect();
        let mut union = delta.added.clone();
        if let Some(existing) = &delta.existing {
            union.extend(existing.iter().copied());
        }
        union.retain(|p| !removed_keys.contains(&p.public_key));

        swarm.add(union, delta.timestamp_ms).await;
        swarm.registry.touch(&sender_address, delta.timestamp_ms).await;
        *swarm.last_received_ms.lock().await = delta.timestamp_ms;
    }

    swarm.events.delta_received.set();

    if first_encounter {
        distribute(swarm, true).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Block, BlockCodec, BlockHash, BlockHeader, Chain, ChainError, ChainId, Tx, TxId};
    use crate::config::SwarmConfig;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;
    use std::path::PathBuf;

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

    fn test_swarm() -> Arc<Swarm> {
        let signing_key = SigningKey::generate(&mut OsRng);
        let config = SwarmConfig {
            key_file: PathBuf::from("unused"),
            protocol_version: 1,
            dial_timeout_ms: 1000,
            request_timeout_ms: 1000,
            host: Some("127.0.0.1".parse().unwrap()),
            port: 0,
            ice_servers: vec![],
            distribute_interval_ms: 1500,
            seed_peers: vec![],
        };
        Swarm::new(signing_key, &config, Arc::new(EmptyChain), Arc::new(NoopCodec), None).unwrap()
    }

    #[tokio::test]
    async fn distribute_with_nothing_changed_and_not_full_is_a_no_op() {
        let swarm = test_swarm();
        // Not running and no peers: added/removed are both empty, so a
        // partial round should send nothing (no panic, no broadcast target).
        distribute(&swarm, false).await;
        assert_eq!(swarm.peer_count().await, 0);
    }

    #[tokio::test]
    async fn process_delta_from_unknown_sender_marks_first_encounter_added() {
        let swarm = test_swarm();
        let sender_signing = SigningKey::generate(&mut OsRng);
        let sender = Peer::new(sender_signing.verifying_key(), "127.0.0.1".parse().unwrap(), 9100);
        let delta = PeerSetDelta {
            sender,
            timestamp_ms: now_ms(),
            added: vec![],
            removed: vec![],
            existing: None,
        };
        // The swarm is not running, so `add()` will skip dialing — but the
        // registry bookkeeping (touch, last_received) must still happen
        // without panicking.
        process_delta(&swarm, delta).await;
        assert_eq!(*swarm.last_received_ms.lock().await > 0, true);
    }
}
