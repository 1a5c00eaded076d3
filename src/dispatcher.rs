//! Inbound dispatcher: drains the ROUTER socket, verifies
//! and parses each frame set into a `Message`, and spawns one handler task
//! per message so a slow or blocking handler never stalls the receive loop.

use crate::message::{Message, MessageKind};
use crate::swarm::Swarm;
use std::sync::Arc;

/// Upper bound on hashes/ids returned from a single `GetBlockHashes` reply:
/// responses are bounded, never proportional to an unbounded
/// locator/request.
pub const MAX_HASHES_PER_REPLY: usize = 500;

pub async fn run(swarm: Arc<Swarm>) {
    loop {
        if swarm.cancel.is_cancelled() {
            return;
        }
        let router = match swarm.router_handle().await {
            Some(router) => router,
            None => return,
        };
        let frames = match router.recv_frames().await {
            Some(frames) => frames,
            None => continue,
        };
        let swarm = Arc::clone(&swarm);
        tokio::spawn(async move {
            match Message::parse(frames, false) {
                Ok(message) => handle(swarm, message).await,
                Err(e) => tracing::warn!("dropping unparseable inbound message: {e}"),
            }
        });
    }
}

async fn handle(swarm: Arc<Swarm>, message: Message) {
    let reply_identity = message.reply_identity;
    match message.kind {
        MessageKind::Ping => {
            let frames = swarm.sign(
                &reply_identity,
                &MessageKind::Pong { app_protocol_version: swarm.local_protocol_version() },
            );
            swarm.enqueue_reply(reply_identity, frames);
        }

        MessageKind::PeerSetDelta(delta) => {
            crate::distribute::process_delta(&swarm, delta).await;
        }

        MessageKind::GetBlockHashes { locator, stop } => {
            let hashes = swarm.chain.find_next_hashes(&locator, stop, MAX_HASHES_PER_REPLY);
            let frames = swarm.sign(
                &reply_identity,
                &MessageKind::BlockHashes { sender: swarm.local_address(), hashes },
            );
            swarm.enqueue_reply(reply_identity, frames);
        }

        MessageKind::GetBlocks { hashes } => {
            for hash in hashes {
                if let Some(block) = swarm.chain.get_block(&hash) {
                    let payload = swarm.codec.encode_block(&block);
                    let frames = swarm.sign(&reply_identity, &MessageKind::Block { payload });
                    swarm.enqueue_reply(reply_identity.clone(), frames);
                }
            }
        }

        MessageKind::GetTxs { ids } => {
            for id in ids {
                if let Some(tx) = swarm.chain.get_tx(&id) {
                    let payload = swarm.codec.encode_tx(&tx);
                    let frames = swarm.sign(&reply_identity, &MessageKind::Tx { payload });
                    swarm.enqueue_reply(reply_identity.clone(), frames);
                }
            }
        }

        MessageKind::BlockHashes { sender, hashes } => {
            crate::sync::process_block_hashes(&swarm, sender, hashes).await;
        }

        MessageKind::TxIds { sender, ids } => {
            crate::sync::process_tx_ids(&swarm, sender, ids).await;
        }

        MessageKind::Pong { .. } | MessageKind::Block { .. } | MessageKind::Tx { .. } => {
            // Reply-only kinds arriving outside a request/response round trip
            // (typically a late reply to a request we already timed out on).
            tracing::debug!("ignoring unsolicited reply-only message");
        }
    }
}
