// Block Assembly
//
// Turns a winning proof into a signed block: pulls the best-paying
// transactions from the mempool, drops any that no longer validate
// (without evicting them, the mempool owns that decision), computes the
// tx root, signs the header, and runs the full validator once before the
// block leaves this node.

use crate::crypto::hash::Hash;
use crate::crypto::keys::Signer;
use crate::mempool::Mempool;
use crate::primitives::account::{AccountState, AccountView};
use crate::primitives::block::{BLOCK_VERSION, Block, BlockHeader};
use crate::primitives::proof::BlockProof;
use crate::primitives::transaction::Transaction;

use super::validator::{BlockError, ValidationContext, validate_block};

#[derive(Debug, Clone, Copy)]
pub struct BuilderConfig {
    pub max_transactions: usize,
    pub max_body_bytes: usize,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        BuilderConfig {
            max_transactions: 500,
            max_body_bytes: 256 * 1024,
        }
    }
}

pub struct BuildParams {
    pub parent_hash: Hash,
    pub height: u64,
    pub difficulty: u64,
    pub epoch: u64,
    pub challenge: Hash,
    pub block_proof: BlockProof,
    pub timestamp: i64,
    pub parent_timestamp: i64,
    pub genesis: bool,
}

/// Re-validates the selection against committed state, keeping only the
/// prefix of each sender's transactions that still applies cleanly.
fn filter_applicable(
    selected: Vec<Transaction>,
    accounts: &dyn AccountView,
) -> Vec<Transaction> {
    let mut pending: std::collections::HashMap<Vec<u8>, AccountState> =
        std::collections::HashMap::new();
    let mut kept = Vec::with_capacity(selected.len());

    for tx in selected {
        if tx.check_stateless().is_err() {
            continue;
        }
        let sender_addr = tx.sender_address().to_vec();
        let mut sender = pending
            .get(&sender_addr)
            .copied()
            .unwrap_or_else(|| accounts.account(&sender_addr));
        if tx.nonce != sender.nonce || sender.balance < tx.total_spend() {
            continue;
        }
        sender.balance -= tx.total_spend();
        sender.nonce = tx.nonce + 1;
        pending.insert(sender_addr, sender);

        let mut recipient = pending
            .get(&tx.recipient)
            .copied()
            .unwrap_or_else(|| accounts.account(&tx.recipient));
        recipient.balance = recipient.balance.saturating_add(tx.amount);
        pending.insert(tx.recipient.clone(), recipient);

        kept.push(tx);
    }
    kept
}

pub fn build_block(
    params: BuildParams,
    mempool: &Mempool,
    accounts: &dyn AccountView,
    signer: &dyn Signer,
    config: &BuilderConfig,
) -> Result<Block, BlockError> {
    let proof_overhead = params.block_proof.to_bytes().len();
    let tx_budget = config.max_body_bytes.saturating_sub(proof_overhead);

    let selected = mempool.select(config.max_transactions, tx_budget);
    let transactions = filter_applicable(selected, accounts);

    let mut header = BlockHeader {
        version: BLOCK_VERSION,
        parent_hash: params.parent_hash,
        height: params.height,
        timestamp: params.timestamp,
        difficulty: params.difficulty,
        epoch: params.epoch,
        challenge: params.challenge,
        plot_root: params.block_proof.proof.merkle_root,
        proof_score: params.block_proof.proof.score,
        tx_root: Block::compute_tx_root(&transactions),
        state_root: [0u8; 32],
        miner_pubkey: signer.public_key(),
        signature: [0u8; 64],
    };
    header.signature = signer
        .sign(&header.hash())
        .map_err(|_| BlockError::BadSignature)?;

    let block = Block {
        header,
        proof: params.block_proof,
        transactions,
    };

    // Will-accept gate: never emit a block this node would itself reject.
    let ctx = ValidationContext {
        parent_timestamp: params.parent_timestamp,
        now: params.timestamp,
        expected_difficulty: params.difficulty,
        expected_epoch: params.epoch,
        expected_challenge: params.challenge,
        accounts,
        genesis: params.genesis,
    };
    validate_block(&block, &ctx)?;

    Ok(block)
}
