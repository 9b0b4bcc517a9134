// Block Validation
//
// Orchestrates the acceptance checks in a fixed order: stateless header
// checks, space-proof verification against the difficulty target,
// signature, then the body replayed against pending account state. On
// success the computed account deltas are handed back so the chain store
// can commit them atomically. Failures are typed; a bad block is fatal to
// the block, never to the node.

use std::collections::{HashMap, HashSet};

use crate::crypto::hash::Hash;
use crate::crypto::keys::verify_signature;
use crate::node::kv::StoreError;
use crate::primitives::account::{AccountState, AccountView};
use crate::primitives::block::{BLOCK_VERSION, Block};
use crate::primitives::transaction::TxError;

use super::difficulty::target_for;
use super::proof::{ProofError, validate_proof};

/// Accepted skew between block timestamps and local clocks.
pub const MAX_CLOCK_DRIFT_SECS: i64 = 120;

#[derive(Debug, thiserror::Error)]
pub enum BlockError {
    #[error("unknown block version {0}")]
    UnknownVersion(u8),
    #[error("bad timestamp {timestamp}: {reason}")]
    BadTimestamp { timestamp: i64, reason: &'static str },
    #[error("wrong difficulty: expected {expected}, got {got}")]
    WrongDifficulty { expected: u64, got: u64 },
    #[error("wrong epoch: expected {expected}, got {got}")]
    WrongEpoch { expected: u64, got: u64 },
    #[error("wrong challenge: expected {expected}, got {got}")]
    WrongChallenge { expected: String, got: String },
    #[error("reserved state root must be zero")]
    ReservedStateRoot,
    #[error("bad proof: {0}")]
    BadProof(#[from] ProofError),
    #[error("bad header signature")]
    BadSignature,
    #[error("bad tx root: expected {expected}, got {got}")]
    BadTxRoot { expected: String, got: String },
    #[error("transaction {index} rejected: {source}")]
    TxRejected { index: usize, source: TxError },
    #[error("unknown parent {0}")]
    UnknownParent(String),
    #[error("height mismatch: parent is at {parent}, block claims {got}")]
    WrongHeight { parent: i64, got: u64 },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Reorg(#[from] ReorgError),
    #[error("corrupt block record: {0}")]
    Corrupt(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ReorgError {
    #[error("no common ancestor with the active chain")]
    CommonAncestorNotFound,
    #[error("inconsistent state during reorganization: {0}")]
    InconsistentState(String),
}

/// Everything the validator needs to judge one block. The caller (chain
/// store or builder) resolves expectations from its own state.
pub struct ValidationContext<'a> {
    /// Timestamp of the parent block; ignored when `genesis` is set.
    pub parent_timestamp: i64,
    /// Local wall clock, unix seconds.
    pub now: i64,
    pub expected_difficulty: u64,
    pub expected_epoch: u64,
    pub expected_challenge: Hash,
    pub accounts: &'a dyn AccountView,
    pub genesis: bool,
}

/// Header checks that need no state at all.
pub fn check_header_stateless(block: &Block, ctx: &ValidationContext) -> Result<(), BlockError> {
    let header = &block.header;

    if header.version != BLOCK_VERSION {
        return Err(BlockError::UnknownVersion(header.version));
    }
    if header.state_root != [0u8; 32] {
        return Err(BlockError::ReservedStateRoot);
    }

    if !ctx.genesis && header.timestamp < ctx.parent_timestamp - MAX_CLOCK_DRIFT_SECS {
        return Err(BlockError::BadTimestamp {
            timestamp: header.timestamp,
            reason: "before parent",
        });
    }
    if header.timestamp > ctx.now + MAX_CLOCK_DRIFT_SECS {
        return Err(BlockError::BadTimestamp {
            timestamp: header.timestamp,
            reason: "too far in the future",
        });
    }

    if header.difficulty == 0 || header.difficulty != ctx.expected_difficulty {
        return Err(BlockError::WrongDifficulty {
            expected: ctx.expected_difficulty,
            got: header.difficulty,
        });
    }
    if header.epoch != ctx.expected_epoch {
        return Err(BlockError::WrongEpoch {
            expected: ctx.expected_epoch,
            got: header.epoch,
        });
    }
    if header.challenge != ctx.expected_challenge {
        return Err(BlockError::WrongChallenge {
            expected: hex::encode(ctx.expected_challenge),
            got: hex::encode(header.challenge),
        });
    }
    Ok(())
}

/// Proof and signature checks; stateless but crypto-heavy.
pub fn check_proof_and_signature(block: &Block) -> Result<(), BlockError> {
    let header = &block.header;

    if header.proof_score != block.proof.proof.score {
        return Err(BlockError::BadProof(ProofError::ScoreMismatch {
            expected: hex::encode(block.proof.proof.score),
            got: hex::encode(header.proof_score),
        }));
    }
    validate_proof(
        &block.proof.proof,
        &header.challenge,
        &header.plot_root,
        Some(&target_for(header.difficulty)),
        block.proof.plot.tree_height(),
    )?;

    if !verify_signature(&header.hash(), &header.signature, &header.miner_pubkey) {
        return Err(BlockError::BadSignature);
    }
    Ok(())
}

/// Replays the body against `ctx.accounts` overlaid with in-block deltas.
/// Returns the touched accounts in their post-block state.
pub fn check_body(
    block: &Block,
    ctx: &ValidationContext,
) -> Result<HashMap<Vec<u8>, AccountState>, BlockError> {
    let tx_root = Block::compute_tx_root(&block.transactions);
    if tx_root != block.header.tx_root {
        return Err(BlockError::BadTxRoot {
            expected: hex::encode(tx_root),
            got: hex::encode(block.header.tx_root),
        });
    }

    let mut pending: HashMap<Vec<u8>, AccountState> = HashMap::new();
    let mut seen: HashSet<Hash> = HashSet::new();

    let read = |pending: &HashMap<Vec<u8>, AccountState>, addr: &[u8]| -> AccountState {
        pending
            .get(addr)
            .copied()
            .unwrap_or_else(|| ctx.accounts.account(addr))
    };

    for (index, tx) in block.transactions.iter().enumerate() {
        let reject = |source: TxError| BlockError::TxRejected { index, source };

        tx.check_stateless().map_err(reject)?;

        if !seen.insert(tx.hash()) {
            return Err(reject(TxError::Duplicate(hex::encode(tx.hash()))));
        }

        let sender_addr = tx.sender_address().to_vec();
        let mut sender = read(&pending, &sender_addr);
        if tx.nonce != sender.nonce {
            return Err(reject(TxError::BadNonce {
                expected: sender.nonce,
                got: tx.nonce,
            }));
        }
        let spend = tx.total_spend();
        if sender.balance < spend {
            return Err(reject(TxError::InsufficientBalance {
                balance: sender.balance,
                required: spend,
            }));
        }

        sender.balance -= spend;
        sender.nonce = tx.nonce + 1;
        pending.insert(sender_addr.clone(), sender);

        let mut recipient = read(&pending, &tx.recipient);
        recipient.balance = recipient.balance.saturating_add(tx.amount);
        pending.insert(tx.recipient.clone(), recipient);
    }

    Ok(pending)
}

/// Full validation pipeline in acceptance order.
pub fn validate_block(
    block: &Block,
    ctx: &ValidationContext,
) -> Result<HashMap<Vec<u8>, AccountState>, BlockError> {
    check_header_stateless(block, ctx)?;
    check_proof_and_signature(block)?;
    check_body(block, ctx)
}
