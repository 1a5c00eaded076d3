//! The chain collaborator seam.
//!
//! The block/transaction data model, validation, and persistent store live
//! outside this crate. Everything the sync engine and dispatcher need from
//! "the chain" is expressed here as a narrow trait plus opaque-payload
//! newtypes, so the core can be built, tested, and reasoned about without
//! depending on an actual block/tx implementation.

use std::fmt;

/// 32-byte block hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockHash(pub [u8; 32]);

/// 32-byte transaction id.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxId(pub [u8; 32]);

macro_rules! hash_display {
    ($ty:ident) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex::encode(self.0))
            }
        }
        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($ty), &hex::encode(self.0)[..8])
            }
        }
    };
}
hash_display!(BlockHash);
hash_display!(TxId);

/// Minimal header info the sync engine needs: enough to order blocks and
/// chain them by `previous_hash` without understanding their contents.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BlockHeader {
    pub hash: BlockHash,
    pub previous_hash: BlockHash,
    pub index: u64,
}

/// An opaque, already-encoded block. Decoding/validating its contents is a
/// job for the (external) block model; this crate only needs the header
/// fields to drive reconciliation.
#[derive(Clone)]
pub struct Block {
    pub header: BlockHeader,
    pub payload: Vec<u8>,
}

/// An opaque, already-encoded transaction.
#[derive(Clone)]
pub struct Tx {
    pub id: TxId,
    pub payload: Vec<u8>,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ChainId(pub u32);

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("block does not extend the chain tip")]
    NotContiguous,
    #[error("chain store error: {0}")]
    Store(String),
}

/// The external chain collaborator.
///
/// Implemented by the node's storage/consensus layer. The swarm core only
/// ever calls these methods; it never constructs a chain itself except
/// through `fork`, which the implementation must honor as "shares genesis,
/// policy, and store with the parent until diverged".
pub trait Chain: Send + Sync {
    fn id(&self) -> ChainId;

    fn tip(&self) -> Option<BlockHeader>;

    fn contains_block(&self, hash: &BlockHash) -> bool;

    fn contains_tx(&self, id: &TxId) -> bool;

    /// Look up an already-stored block by hash, for serving `GetBlocks`
    /// requests from peers.
    fn get_block(&self, hash: &BlockHash) -> Option<Block>;

    /// Look up a staged/confirmed transaction by id, for serving `GetTxs`.
    fn get_tx(&self, id: &TxId) -> Option<Tx>;

    /// Sparse, exponentially-spaced hashes from tip backwards.
    fn get_block_locator(&self) -> Vec<BlockHash>;

    /// At most `max` hashes reachable from the responder's chain, starting
    /// just after the deepest ancestor in `locator`, stopping at `stop` if
    /// given. The first returned hash is that deepest common ancestor.
    fn find_next_hashes(
        &self,
        locator: &[BlockHash],
        stop: Option<BlockHash>,
        max: usize,
    ) -> Vec<BlockHash>;

    fn append(&self, block: Block) -> Result<(), ChainError>;

    fn stage_transactions(&self, txs: Vec<Tx>) -> Result<(), ChainError>;

    /// A transient, isolated chain sharing this chain's genesis/policy/store
    /// up to and including `branch`, mutated independently thereafter.
    fn fork(&self, branch: BlockHash) -> Box<dyn Chain>;

    /// A transient, empty chain sharing this chain's genesis/policy/store
    /// but none of its blocks — used when the sync engine's branch point
    /// isn't in the local block index at all.
    fn fresh(&self) -> Box<dyn Chain>;

    /// Atomically swap this chain's contents for `other`'s.
    fn swap(&self, other: Box<dyn Chain>);
}

/// The block/tx serialization codec, implemented outside this crate.
/// `Block`/`Tx` messages on the wire carry only opaque payload bytes; this
/// seam turns those bytes into the header-bearing types the sync engine
/// needs to order and chain blocks, and back again for outbound replies
/// and broadcasts.
pub trait BlockCodec: Send + Sync {
    fn decode_block(&self, payload: &[u8]) -> Result<Block, ChainError>;
    fn encode_block(&self, block: &Block) -> Vec<u8>;
    fn decode_tx(&self, payload: &[u8]) -> Result<Tx, ChainError>;
    fn encode_tx(&self, tx: &Tx) -> Vec<u8>;
}
