//! A minimal in-memory [`Chain`]/[`BlockCodec`] pair.
//!
//! The real block/transaction model is explicitly out of scope for this
//! crate; this is a toy linked-list chain that exists only
//! so the `swarm-node` binary is runnable standalone and can exercise the
//! sync engine end to end, not a second attempt at a production chain.

use crate::chain::{Block, BlockCodec, BlockHash, BlockHeader, Chain, ChainError, ChainId, Tx, TxId};
use byteorder::{BigEndian, ByteOrder};
use parking_lot::RwLock;
use std::collections::HashMap;

struct Inner {
    blocks: HashMap<BlockHash, Block>,
    order: Vec<BlockHash>,
    txs: HashMap<TxId, Tx>,
}

pub struct MemChain {
    id: ChainId,
    inner: RwLock<Inner>,
}

impl MemChain {
    pub fn new(id: ChainId) -> Self {
        MemChain { id, inner: RwLock::new(Inner { blocks: HashMap::new(), order: Vec::new(), txs: HashMap::new() }) }
    }
}

impl Chain for MemChain {
    fn id(&self) -> ChainId {
        self.id
    }

    fn tip(&self) -> Option<BlockHeader> {
        let inner = self.inner.read();
        inner.order.last().map(|h| inner.blocks[h].header)
    }

    fn contains_block(&self, hash: &BlockHash) -> bool {
        self.inner.read().blocks.contains_key(hash)
    }

    fn contains_tx(&self, id: &TxId) -> bool {
        self.inner.read().txs.contains_key(id)
    }

    fn get_block(&self, hash: &BlockHash) -> Option<Block> {
        self.inner.read().blocks.get(hash).cloned()
    }

    fn get_tx(&self, id: &TxId) -> Option<Tx> {
        self.inner.read().txs.get(id).cloned()
    }

    /// Exponentially-spaced hashes from the tip backwards, ending at
    /// genesis. Not the locator-compaction a real chain would need for a
    /// long history, but enough to drive branch-point negotiation in tests
    /// and local demos.
    fn get_block_locator(&self) -> Vec<BlockHash> {
        let inner = self.inner.read();
        let mut out = Vec::new();
        if inner.order.is_empty() {
            return out;
        }
        let mut step = 1usize;
        let mut i = inner.order.len() - 1;
        loop {
            out.push(inner.order[i]);
            if i < step {
                break;
            }
            i -= step;
            step *= 2;
        }
        out
    }

    fn find_next_hashes(&self, locator: &[BlockHash], stop: Option<BlockHash>, max: usize) -> Vec<BlockHash> {
        let inner = self.inner.read();
        let start = locator
            .iter()
            .find_map(|h| inner.order.iter().position(|o| o == h))
            .unwrap_or(0);

        let mut out = Vec::new();
        let mut idx = start;
        while idx < inner.order.len() && out.len() < max {
            let hash = inner.order[idx];
            out.push(hash);
            if Some(hash) == stop {
                break;
            }
            idx += 1;
        }
        out
    }

    fn append(&self, block: Block) -> Result<(), ChainError> {
        let mut inner = self.inner.write();
        if let Some(tip_hash) = inner.order.last() {
            if block.header.previous_hash != *tip_hash {
                return Err(ChainError::NotContiguous);
            }
        }
        let hash = block.header.hash;
        inner.order.push(hash);
        inner.blocks.insert(hash, block);
        Ok(())
    }

    fn stage_transactions(&self, txs: Vec<Tx>) -> Result<(), ChainError> {
        let mut inner = self.inner.write();
        for tx in txs {
            inner.txs.insert(tx.id, tx);
        }
        Ok(())
    }

    fn fork(&self, branch: BlockHash) -> Box<dyn Chain> {
        let inner = self.inner.read();
        let mut order = Vec::new();
        let mut blocks = HashMap::new();
        for hash in &inner.order {
            order.push(*hash);
            blocks.insert(*hash, inner.blocks[hash].clone());
            if *hash == branch {
                break;
            }
        }
        Box::new(MemChain { id: self.id, inner: RwLock::new(Inner { blocks, order, txs: HashMap::new() }) })
    }

    fn fresh(&self) -> Box<dyn Chain> {
        Box::new(MemChain::new(self.id))
    }

    /// Re-materialize `other`'s full block list through its own trait
    /// surface (`find_next_hashes`/`get_block`) rather than downcasting —
    /// `other` is an opaque `dyn Chain`, and this is the only vocabulary
    /// the trait gives us to enumerate it.
    fn swap(&self, other: Box<dyn Chain>) {
        let hashes = other.find_next_hashes(&[], None, usize::MAX);
        let mut blocks = HashMap::with_capacity(hashes.len());
        for hash in &hashes {
            if let Some(block) = other.get_block(hash) {
                blocks.insert(*hash, block);
            }
        }
        let mut inner = self.inner.write();
        inner.order = hashes;
        inner.blocks = blocks;
    }
}

/// Encodes a [`Block`]/[`Tx`] as `hash | previous_hash | index | payload`
/// (blocks) or `id | payload` (txs) — just enough structure to round-trip
/// through [`MemChain`].
pub struct DemoCodec;

impl BlockCodec for DemoCodec {
    fn decode_block(&self, payload: &[u8]) -> Result<Block, ChainError> {
        if payload.len() < 72 {
            return Err(ChainError::Store("block payload truncated".into()));
        }
        let hash = BlockHash(payload[0..32].try_into().unwrap());
        let previous_hash = BlockHash(payload[32..64].try_into().unwrap());
        let index = BigEndian::read_u64(&payload[64..72]);
        let body = payload[72..].to_vec();
        Ok(Block { header: BlockHeader { hash, previous_hash, index }, payload: body })
    }

    fn encode_block(&self, block: &Block) -> Vec<u8> {
        let mut buf = Vec::with_capacity(72 + block.payload.len());
        buf.extend_from_slice(&block.header.hash.0);
        buf.extend_from_slice(&block.header.previous_hash.0);
        let mut index_buf = [0u8; 8];
        BigEndian::write_u64(&mut index_buf, block.header.index);
        buf.extend_from_slice(&index_buf);
        buf.extend_from_slice(&block.payload);
        buf
    }

    fn decode_tx(&self, payload: &[u8]) -> Result<Tx, ChainError> {
        if payload.len() < 32 {
            return Err(ChainError::Store("tx payload truncated".into()));
        }
        let id = TxId(payload[0..32].try_into().unwrap());
        Ok(Tx { id, payload: payload[32..].to_vec() })
    }

    fn encode_tx(&self, tx: &Tx) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32 + tx.payload.len());
        buf.extend_from_slice(&tx.id.0);
        buf.extend_from_slice(&tx.payload);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(hash: u8, previous: u8, index: u64) -> Block {
        Block {
            header: BlockHeader { hash: BlockHash([hash; 32]), previous_hash: BlockHash([previous; 32]), index },
            payload: vec![hash],
        }
    }

    #[test]
    fn append_enforces_contiguity() {
        let chain = MemChain::new(ChainId(1));
        chain.append(block(1, 0, 0)).unwrap();
        assert!(chain.append(block(3, 2, 1)).is_err(), "previous_hash does not match tip");
        chain.append(block(2, 1, 1)).unwrap();
        assert_eq!(chain.tip().unwrap().hash, BlockHash([2u8; 32]));
    }

    #[test]
    fn fork_stops_at_branch_point() {
        let chain = MemChain::new(ChainId(1));
        chain.append(block(1, 0, 0)).unwrap();
        chain.append(block(2, 1, 1)).unwrap();
        chain.append(block(3, 2, 2)).unwrap();

        let forked = chain.fork(BlockHash([2u8; 32]));
        assert!(forked.contains_block(&BlockHash([2u8; 32])));
        assert!(!forked.contains_block(&BlockHash([3u8; 32])));
    }

    #[test]
    fn block_codec_roundtrips() {
        let codec = DemoCodec;
        let b = block(9, 8, 42);
        let encoded = codec.encode_block(&b);
        let decoded = codec.decode_block(&encoded).unwrap();
        assert_eq!(decoded.header.hash, b.header.hash);
        assert_eq!(decoded.header.index, 42);
        assert_eq!(decoded.payload, b.payload);
    }
}
