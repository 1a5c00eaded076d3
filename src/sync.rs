//! Block-sync reconciliation and transaction gossip.
//!
//! Triggered by an inbound `BlockHashes`/`TxIds` announcement — the same
//! message shape `request_block_hashes`/`broadcast_blocks` produce, so a
//! peer learns of new work either by asking directly or by being told.

use crate::chain::{Block, BlockHash, Chain, TxId};
use crate::peer::Address;
use crate::swarm::Swarm;
use std::sync::Arc;

/// Give up on a fill round after this many failed request attempts.
const MAX_FILL_ATTEMPTS: usize = 3;

/// Blocks requested per `GetBlocks` round trip.
const MAX_BLOCKS_PER_REQUEST: usize = 500;

/// The chain being extended during one sync round: either the live chain
/// (branch point is our current tip, no fork needed) or a transient chain
/// that gets swapped in atomically once fully filled. Unifying the two
/// behind one type keeps the fill loop below oblivious to which case
/// it's in.
enum Working<'a> {
    Live(&'a dyn Chain),
    Forked(Box<dyn Chain>),
}

impl<'a> Working<'a> {
    fn as_chain(&self) -> &dyn Chain {
        match self {
            Working::Live(c) => *c,
            Working::Forked(c) => c.as_ref(),
        }
    }
}

/// Reconcile with `from` after it announces it has the blocks in `hashes`.
///
/// Spec §4.7: "All of step 2–8 runs under the block-sync mutex." Two
/// `BlockHashes` announcements from the same peer are dispatched as
/// independent handler tasks that would otherwise both call
/// `request_blocks` on the same shared dealer concurrently and interleave
/// replies on that one socket, so the fetch (step 2) and staleness check
/// (step 3) must be inside the guard too, not just steps 4 onward.
pub async fn process_block_hashes(swarm: &Arc<Swarm>, from: Address, hashes: Vec<BlockHash>) {
    if !swarm.contains_peer(&from).await {
        return;
    }
    if hashes.is_empty() {
        return;
    }

    let _guard = swarm.block_sync_mutex.lock().await;

    let blocks = match swarm.request_blocks(&from, hashes).await {
        Ok(blocks) if !blocks.is_empty() => blocks,
        Ok(_) => return,
        Err(e) => {
            tracing::warn!(peer = %from, error = %e, "failed to fetch announced blocks");
            return;
        }
    };

    let oldest = blocks[0].header;
    let latest = blocks[blocks.len() - 1].header;
    if let Some(tip) = swarm.chain.tip() {
        if latest.index <= tip.index {
            return; // stale announcement
        }
    }

    let locator = swarm.chain.get_block_locator();
    let branch_point = match swarm.request_block_hashes(&from, locator, Some(oldest.hash)).await {
        Ok(h) if !h.is_empty() => h[0],
        Ok(_) => return,
        Err(e) => {
            tracing::warn!(peer = %from, error = %e, "branch-point negotiation failed");
            return;
        }
    };

    let working = if swarm.chain.tip().is_none() || swarm.chain.tip().map(|t| t.hash) == Some(branch_point) {
        Working::Live(swarm.chain.as_ref())
    } else if !swarm.chain.contains_block(&branch_point) {
        Working::Forked(swarm.chain.fresh())
    } else {
        Working::Forked(swarm.chain.fork(branch_point))
    };

    if !fill_ancestors(swarm, &from, &working, oldest.previous_hash).await {
        tracing::warn!(peer = %from, "giving up on ancestor fill after repeated failures");
        return;
    }

    if !append_batch(working.as_chain(), &blocks) {
        tracing::warn!(peer = %from, "announced blocks did not extend the working chain");
        return;
    }

    if let Working::Forked(forked) = working {
        swarm.chain.swap(forked);
    }

    swarm.events.block_received.set();
}

/// Fill the gap between `working`'s current tip and `target_previous_hash`
/// (the hash immediately preceding the oldest announced block), retrying
/// the whole fill loop up to `MAX_FILL_ATTEMPTS` times on any error.
/// Returns whether the gap was fully closed.
async fn fill_ancestors(
    swarm: &Arc<Swarm>,
    from: &Address,
    working: &Working<'_>,
    target_previous_hash: BlockHash,
) -> bool {
    for attempt in 1..=MAX_FILL_ATTEMPTS {
        match try_fill_ancestors(swarm, from, working, target_previous_hash).await {
            Ok(()) => return true,
            Err(e) => {
                tracing::warn!(peer = %from, error = %e, attempt, "ancestor fill round failed, retrying");
            }
        }
    }
    working.as_chain().tip().map(|t| t.hash) == Some(target_previous_hash)
}

async fn try_fill_ancestors(
    swarm: &Arc<Swarm>,
    from: &Address,
    working: &Working<'_>,
    target_previous_hash: BlockHash,
) -> Result<(), crate::error::PeerError> {
    while working.as_chain().tip().map(|t| t.hash) != Some(target_previous_hash) {
        let has_tip = working.as_chain().tip().is_some();
        let locator = working.as_chain().get_block_locator();
        let mut hashes =
            swarm.request_block_hashes(from, locator, Some(target_previous_hash)).await?;
        if has_tip && !hashes.is_empty() {
            hashes.remove(0); // the first hash is the working tip itself
        }
        if hashes.is_empty() {
            break;
        }
        for batch in hashes.chunks(MAX_BLOCKS_PER_REQUEST) {
            let blocks = swarm.request_blocks(from, batch.to_vec()).await?;
            if !append_batch(working.as_chain(), &blocks) {
                return Err(crate::error::PeerError::Timeout);
            }
        }
    }
    Ok(())
}

fn append_batch(chain: &dyn Chain, blocks: &[Block]) -> bool {
    for block in blocks {
        if chain.append(block.clone()).is_err() {
            return false;
        }
    }
    true
}

/// Fetch and stage every `from`-announced tx id we don't already have.
pub async fn process_tx_ids(swarm: &Arc<Swarm>, from: Address, ids: Vec<TxId>) {
    let missing: Vec<TxId> = ids.into_iter().filter(|id| !swarm.chain.contains_tx(id)).collect();
    if missing.is_empty() {
        return;
    }

    match swarm.request_txs(&from, missing).await {
        Ok(txs) if txs.is_empty() => {}
        Ok(txs) => {
            if let Err(e) = swarm.chain.stage_transactions(txs) {
                tracing::warn!(peer = %from, error = %e, "failed to stage fetched transactions");
                return;
            }
            swarm.events.tx_received.set();
        }
        Err(e) => tracing::warn!(peer = %from, error = %e, "tx fetch failed"),
    }
}
