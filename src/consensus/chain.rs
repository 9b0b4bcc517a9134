// Chain State and Storage Adapter
//
// Owns the tip, cumulative difficulty, and the persisted chain across five
// column families:
//   blocks        — "h:"||hash → header bytes, "b:"||hash → body bytes
//   heights       — height u64 LE → hash            (active chain only)
//   transactions  — tx hash → block hash||height||index
//   accounts      — address → balance||nonce
//   metadata      — "best_block_hash", "chain_height",
//                   "cumulative_difficulty:"||hash
//
// Every block application is one atomic write batch. Side-chain blocks are
// stored with their cumulative difficulty; a branch that strictly exceeds
// the active chain triggers a rollback/replay reorganization. Blocks whose
// parent has not arrived wait in a bounded buffer, which makes the final
// tip a function of the delivered set, not the delivery order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::crypto::hash::Hash;
use crate::node::kv::{Cf, KvStore, WriteBatch};
use crate::primitives::account::{AccountState, AccountView};
use crate::primitives::block::{Block, BlockHeader, GENESIS_PARENT};

use super::challenge::{challenge_for, genesis_challenge};
use super::difficulty::{DifficultyConfig, is_retarget_height, retarget};
use super::validator::{
    BlockError, ReorgError, ValidationContext, check_header_stateless, check_proof_and_signature,
    validate_block,
};

const KEY_BEST: &[u8] = b"best_block_hash";
const KEY_HEIGHT: &[u8] = b"chain_height";
const CUM_DIFF_PREFIX: &[u8] = b"cumulative_difficulty:";
const HEADER_PREFIX: &[u8] = b"h:";
const BODY_PREFIX: &[u8] = b"b:";

/// Cap on blocks waiting for a missing parent.
const ORPHAN_BUFFER_LIMIT: usize = 256;

fn header_key(hash: &Hash) -> Vec<u8> {
    [HEADER_PREFIX, hash.as_slice()].concat()
}

fn body_key(hash: &Hash) -> Vec<u8> {
    [BODY_PREFIX, hash.as_slice()].concat()
}

fn cum_diff_key(hash: &Hash) -> Vec<u8> {
    [CUM_DIFF_PREFIX, hash.as_slice()].concat()
}

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub network_id: String,
    pub difficulty: DifficultyConfig,
    /// Difficulty of the genesis block and of every block until the first
    /// retarget boundary.
    pub initial_difficulty: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        ChainConfig {
            network_id: "mainnet".to_string(),
            difficulty: DifficultyConfig::default(),
            initial_difficulty: 1,
        }
    }
}

/// In-memory chain state; `tip_height` is -1 for an empty chain.
#[derive(Debug, Clone)]
pub struct ChainSnapshot {
    pub tip_hash: Option<Hash>,
    pub tip_height: i64,
    pub best_difficulty: u64,
    pub cumulative_difficulty: u128,
    pub expected_epoch: u64,
    pub expected_challenge: Hash,
}

/// One-way view the miner consumes; keeps the miner → chain dependency
/// acyclic (blocks flow back through the session channel, not through a
/// reference to the miner).
pub trait ChainView: Send + Sync {
    fn chain_snapshot(&self) -> ChainSnapshot;
    /// Difficulty the next block must carry (retarget-aware).
    fn next_difficulty(&self) -> u64;
    fn tip_timestamp(&self) -> i64;
}

#[derive(Debug, PartialEq, Eq)]
pub enum AcceptOutcome {
    /// Extended the active tip.
    Connected,
    /// Stored on a side branch that does not (yet) win.
    SideChain,
    /// Triggered a reorganization; the listed blocks were orphaned.
    Reorged { orphaned: Vec<Hash> },
    /// Parent unknown; parked until it arrives.
    Buffered,
    AlreadyKnown,
}

pub struct ChainStore {
    kv: Arc<dyn KvStore>,
    config: ChainConfig,
    state: RwLock<ChainSnapshot>,
    orphans: Mutex<HashMap<Hash, Vec<Block>>>,
    /// Single-writer gate for block acceptance; snapshot readers never
    /// take it.
    write_gate: Mutex<()>,
}

impl ChainStore {
    pub fn open(kv: Arc<dyn KvStore>, config: ChainConfig) -> Result<Self, BlockError> {
        let snapshot = match kv.get(Cf::Metadata, KEY_BEST)? {
            Some(raw) => {
                let tip: Hash = raw
                    .try_into()
                    .map_err(|_| BlockError::Corrupt("best_block_hash is not 32 bytes".into()))?;
                let header = Self::read_header(kv.as_ref(), &tip)?
                    .ok_or_else(|| BlockError::Corrupt("tip header missing".into()))?;
                let cum = Self::read_cum_diff(kv.as_ref(), &tip)?
                    .ok_or_else(|| BlockError::Corrupt("tip cumulative difficulty missing".into()))?;
                ChainSnapshot {
                    tip_hash: Some(tip),
                    tip_height: header.height as i64,
                    best_difficulty: header.difficulty,
                    cumulative_difficulty: cum,
                    expected_epoch: header.height + 1,
                    expected_challenge: challenge_for(&tip, header.height + 1),
                }
            }
            None => ChainSnapshot {
                tip_hash: None,
                tip_height: -1,
                best_difficulty: config.initial_difficulty,
                cumulative_difficulty: 0,
                expected_epoch: 0,
                expected_challenge: genesis_challenge(&config.network_id),
            },
        };

        Ok(ChainStore {
            kv,
            config,
            state: RwLock::new(snapshot),
            orphans: Mutex::new(HashMap::new()),
            write_gate: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    fn snapshot_locked(&self) -> ChainSnapshot {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn read_header(kv: &dyn KvStore, hash: &Hash) -> Result<Option<BlockHeader>, BlockError> {
        match kv.get(Cf::Blocks, &header_key(hash))? {
            Some(raw) => Ok(Some(
                BlockHeader::from_bytes(&raw).map_err(|e| BlockError::Corrupt(e.into()))?,
            )),
            None => Ok(None),
        }
    }

    fn read_cum_diff(kv: &dyn KvStore, hash: &Hash) -> Result<Option<u128>, BlockError> {
        match kv.get(Cf::Metadata, &cum_diff_key(hash))? {
            Some(raw) if raw.len() >= 16 => {
                Ok(Some(u128::from_le_bytes(raw[..16].try_into().unwrap())))
            }
            Some(_) => Err(BlockError::Corrupt("cumulative difficulty record".into())),
            None => Ok(None),
        }
    }

    pub fn header(&self, hash: &Hash) -> Result<Option<BlockHeader>, BlockError> {
        Self::read_header(self.kv.as_ref(), hash)
    }

    pub fn block(&self, hash: &Hash) -> Result<Option<Block>, BlockError> {
        let Some(header) = self.header(hash)? else {
            return Ok(None);
        };
        let Some(raw) = self.kv.get(Cf::Blocks, &body_key(hash))? else {
            return Err(BlockError::Corrupt("header present but body missing".into()));
        };
        let (proof, transactions) =
            Block::body_from_bytes(&raw).map_err(|e| BlockError::Corrupt(e.into()))?;
        Ok(Some(Block {
            header,
            proof,
            transactions,
        }))
    }

    pub fn block_hash_at(&self, height: u64) -> Result<Option<Hash>, BlockError> {
        match self.kv.get(Cf::Heights, &height.to_le_bytes())? {
            Some(raw) => Ok(Some(raw.try_into().map_err(|_| {
                BlockError::Corrupt("height index entry is not 32 bytes".into())
            })?)),
            None => Ok(None),
        }
    }

    pub fn cumulative_difficulty_of(&self, hash: &Hash) -> Result<Option<u128>, BlockError> {
        Self::read_cum_diff(self.kv.as_ref(), hash)
    }

    /// Stored but no longer referenced by the active-height index.
    pub fn is_orphaned(&self, hash: &Hash) -> Result<bool, BlockError> {
        let Some(header) = self.header(hash)? else {
            return Ok(false);
        };
        Ok(self.block_hash_at(header.height)? != Some(*hash))
    }

    /// `tx hash → (block hash, height, index)` for included transactions.
    pub fn transaction_location(&self, tx_hash: &Hash) -> Result<Option<(Hash, u64, u32)>, BlockError> {
        match self.kv.get(Cf::Transactions, tx_hash)? {
            Some(raw) if raw.len() == 44 => {
                let block_hash: Hash = raw[0..32].try_into().unwrap();
                let height = u64::from_le_bytes(raw[32..40].try_into().unwrap());
                let index = u32::from_le_bytes(raw[40..44].try_into().unwrap());
                Ok(Some((block_hash, height, index)))
            }
            Some(_) => Err(BlockError::Corrupt("transaction index entry".into())),
            None => Ok(None),
        }
    }

    /// Direct account write, used to seed balances (there is no coinbase;
    /// emission is a future module) and by tests.
    pub fn put_account(&self, address: &[u8], state: &AccountState) -> Result<(), BlockError> {
        self.kv.put(Cf::Accounts, address, &state.to_bytes())?;
        Ok(())
    }

    /// Accepts a block from any source. Serialized internally; concurrent
    /// callers observe a linear history.
    pub fn accept_block(&self, block: Block) -> Result<AcceptOutcome, BlockError> {
        let _gate = self.write_gate.lock().unwrap_or_else(|e| e.into_inner());

        let hash = block.hash();
        let outcome = self.accept_inner(block, hash)?;

        // A newly known block may unblock buffered children, recursively.
        if !matches!(outcome, AcceptOutcome::Buffered) {
            let mut ready = vec![hash];
            while let Some(parent) = ready.pop() {
                let children = {
                    let mut orphans = self.orphans.lock().unwrap_or_else(|e| e.into_inner());
                    orphans.remove(&parent).unwrap_or_default()
                };
                for child in children {
                    let child_hash = child.hash();
                    // A buffered block that turns out invalid is dropped.
                    if self.accept_inner(child, child_hash).is_ok() {
                        ready.push(child_hash);
                    }
                }
            }
        }

        Ok(outcome)
    }

    fn accept_inner(&self, block: Block, hash: Hash) -> Result<AcceptOutcome, BlockError> {
        if self.header(&hash)?.is_some() {
            return Ok(AcceptOutcome::AlreadyKnown);
        }

        let snapshot = self.snapshot_locked();
        let genesis = block.header.height == 0;

        if genesis {
            if block.header.parent_hash != GENESIS_PARENT {
                return Err(BlockError::UnknownParent(hex::encode(
                    block.header.parent_hash,
                )));
            }
            if snapshot.tip_hash.is_none() {
                self.connect_block(&block, &hash, self.config.initial_difficulty)?;
                return Ok(AcceptOutcome::Connected);
            }
            // A competing genesis shares no ancestor with this chain.
            return Err(BlockError::Reorg(ReorgError::CommonAncestorNotFound));
        }

        let Some(parent) = self.header(&block.header.parent_hash)? else {
            let mut orphans = self.orphans.lock().unwrap_or_else(|e| e.into_inner());
            let buffered: usize = orphans.values().map(Vec::len).sum();
            if buffered < ORPHAN_BUFFER_LIMIT {
                orphans
                    .entry(block.header.parent_hash)
                    .or_default()
                    .push(block);
            }
            return Ok(AcceptOutcome::Buffered);
        };

        if block.header.height != parent.height + 1 {
            return Err(BlockError::WrongHeight {
                parent: parent.height as i64,
                got: block.header.height,
            });
        }

        let expected_difficulty = self.expected_difficulty_after(&parent)?;

        if snapshot.tip_hash == Some(block.header.parent_hash) {
            self.connect_block(&block, &hash, expected_difficulty)?;
            return Ok(AcceptOutcome::Connected);
        }

        // Side branch: full stateless scrutiny, but account state along a
        // foreign branch is only replayed if the branch actually wins.
        self.validate_side_block(&block, &parent, expected_difficulty)?;
        let parent_cum = Self::read_cum_diff(self.kv.as_ref(), &block.header.parent_hash)?
            .ok_or_else(|| BlockError::Corrupt("parent cumulative difficulty missing".into()))?;
        let branch_cum = parent_cum + block.header.difficulty as u128;

        let mut batch = WriteBatch::default();
        batch.put(Cf::Blocks, header_key(&hash), block.header.to_bytes().to_vec());
        batch.put(Cf::Blocks, body_key(&hash), block.body_bytes());
        batch.put(
            Cf::Metadata,
            cum_diff_key(&hash),
            branch_cum.to_le_bytes().to_vec(),
        );
        self.kv.write(batch)?;

        // Strictly greater wins; ties keep the current tip (first seen).
        if branch_cum > snapshot.cumulative_difficulty {
            let orphaned = self.reorg_to(&hash)?;
            return Ok(AcceptOutcome::Reorged { orphaned });
        }
        Ok(AcceptOutcome::SideChain)
    }

    fn validate_side_block(
        &self,
        block: &Block,
        parent: &BlockHeader,
        expected_difficulty: u64,
    ) -> Result<(), BlockError> {
        let ctx = ValidationContext {
            parent_timestamp: parent.timestamp,
            now: unix_now(),
            expected_difficulty,
            expected_epoch: block.header.height,
            expected_challenge: challenge_for(&block.header.parent_hash, block.header.height),
            accounts: self,
            genesis: false,
        };
        check_header_stateless(block, &ctx)?;
        check_proof_and_signature(block)?;
        let tx_root = Block::compute_tx_root(&block.transactions);
        if tx_root != block.header.tx_root {
            return Err(BlockError::BadTxRoot {
                expected: hex::encode(tx_root),
                got: hex::encode(block.header.tx_root),
            });
        }
        for (index, tx) in block.transactions.iter().enumerate() {
            tx.check_stateless()
                .map_err(|source| BlockError::TxRejected { index, source })?;
        }
        Ok(())
    }

    /// Full validation and atomic application of a block extending the
    /// branch its parent is on (during normal operation: the active tip).
    fn connect_block(
        &self,
        block: &Block,
        hash: &Hash,
        expected_difficulty: u64,
    ) -> Result<(), BlockError> {
        let genesis = block.header.height == 0;
        let (parent_timestamp, parent_cum, expected_challenge) = if genesis {
            (0, 0u128, genesis_challenge(&self.config.network_id))
        } else {
            let parent = self
                .header(&block.header.parent_hash)?
                .ok_or_else(|| BlockError::UnknownParent(hex::encode(block.header.parent_hash)))?;
            let cum = Self::read_cum_diff(self.kv.as_ref(), &block.header.parent_hash)?
                .ok_or_else(|| BlockError::Corrupt("parent cumulative difficulty missing".into()))?;
            (
                parent.timestamp,
                cum,
                challenge_for(&block.header.parent_hash, block.header.height),
            )
        };

        let ctx = ValidationContext {
            parent_timestamp,
            now: unix_now(),
            expected_difficulty,
            expected_epoch: block.header.height,
            expected_challenge,
            accounts: self,
            genesis,
        };
        let deltas = validate_block(block, &ctx)?;

        for (index, tx) in block.transactions.iter().enumerate() {
            if self.transaction_location(&tx.hash())?.is_some() {
                return Err(BlockError::TxRejected {
                    index,
                    source: crate::primitives::transaction::TxError::Duplicate(hex::encode(
                        tx.hash(),
                    )),
                });
            }
        }

        let cum = parent_cum + block.header.difficulty as u128;
        let mut batch = WriteBatch::default();
        batch.put(Cf::Blocks, header_key(hash), block.header.to_bytes().to_vec());
        batch.put(Cf::Blocks, body_key(hash), block.body_bytes());
        batch.put(
            Cf::Heights,
            block.header.height.to_le_bytes().to_vec(),
            hash.to_vec(),
        );
        for (index, tx) in block.transactions.iter().enumerate() {
            let mut loc = Vec::with_capacity(44);
            loc.extend_from_slice(hash);
            loc.extend_from_slice(&block.header.height.to_le_bytes());
            loc.extend_from_slice(&(index as u32).to_le_bytes());
            batch.put(Cf::Transactions, tx.hash().to_vec(), loc);
        }
        for (address, state) in &deltas {
            batch.put(Cf::Accounts, address.clone(), state.to_bytes().to_vec());
        }
        batch.put(Cf::Metadata, KEY_BEST.to_vec(), hash.to_vec());
        batch.put(
            Cf::Metadata,
            KEY_HEIGHT.to_vec(),
            block.header.height.to_le_bytes().to_vec(),
        );
        batch.put(Cf::Metadata, cum_diff_key(hash), cum.to_le_bytes().to_vec());
        self.kv.write(batch)?;

        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.tip_hash = Some(*hash);
        state.tip_height = block.header.height as i64;
        state.best_difficulty = block.header.difficulty;
        state.cumulative_difficulty = cum;
        state.expected_epoch = block.header.height + 1;
        state.expected_challenge = challenge_for(hash, block.header.height + 1);
        Ok(())
    }

    /// Unwinds the current tip: reverses its account deltas (recomputed
    /// from the stored body), drops its height and transaction index
    /// entries, and moves the tip to its parent. The block itself stays
    /// stored, now orphaned.
    fn disconnect_tip(&self) -> Result<Hash, BlockError> {
        let snapshot = self.snapshot_locked();
        let tip = snapshot.tip_hash.ok_or_else(|| {
            BlockError::Reorg(ReorgError::InconsistentState("no tip to disconnect".into()))
        })?;
        let block = self
            .block(&tip)?
            .ok_or_else(|| BlockError::Corrupt("tip block missing".into()))?;

        let mut reversed: HashMap<Vec<u8>, AccountState> = HashMap::new();
        let read = |this: &Self, map: &HashMap<Vec<u8>, AccountState>, addr: &[u8]| {
            map.get(addr).copied().unwrap_or_else(|| this.account(addr))
        };
        for tx in block.transactions.iter().rev() {
            let recipient_addr = tx.recipient.clone();
            let mut recipient = read(self, &reversed, &recipient_addr);
            recipient.balance = recipient.balance.saturating_sub(tx.amount);
            reversed.insert(recipient_addr, recipient);

            let sender_addr = tx.sender_address().to_vec();
            let mut sender = read(self, &reversed, &sender_addr);
            sender.balance = sender.balance.saturating_add(tx.total_spend());
            sender.nonce = tx.nonce;
            reversed.insert(sender_addr, sender);
        }

        let parent_hash = block.header.parent_hash;
        let height = block.header.height;

        let mut batch = WriteBatch::default();
        batch.delete(Cf::Heights, height.to_le_bytes().to_vec());
        for tx in &block.transactions {
            batch.delete(Cf::Transactions, tx.hash().to_vec());
        }
        for (address, state) in &reversed {
            batch.put(Cf::Accounts, address.clone(), state.to_bytes().to_vec());
        }
        if height == 0 {
            batch.delete(Cf::Metadata, KEY_BEST.to_vec());
            batch.delete(Cf::Metadata, KEY_HEIGHT.to_vec());
        } else {
            batch.put(Cf::Metadata, KEY_BEST.to_vec(), parent_hash.to_vec());
            batch.put(
                Cf::Metadata,
                KEY_HEIGHT.to_vec(),
                (height - 1).to_le_bytes().to_vec(),
            );
        }
        self.kv.write(batch)?;

        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if height == 0 {
            state.tip_hash = None;
            state.tip_height = -1;
            state.best_difficulty = self.config.initial_difficulty;
            state.cumulative_difficulty = 0;
            state.expected_epoch = 0;
            state.expected_challenge = genesis_challenge(&self.config.network_id);
        } else {
            let parent = Self::read_header(self.kv.as_ref(), &parent_hash)?
                .ok_or_else(|| BlockError::Corrupt("parent header missing".into()))?;
            let parent_cum = Self::read_cum_diff(self.kv.as_ref(), &parent_hash)?
                .ok_or_else(|| BlockError::Corrupt("parent cumulative difficulty missing".into()))?;
            state.tip_hash = Some(parent_hash);
            state.tip_height = parent.height as i64;
            state.best_difficulty = parent.difficulty;
            state.cumulative_difficulty = parent_cum;
            state.expected_epoch = parent.height + 1;
            state.expected_challenge = challenge_for(&parent_hash, parent.height + 1);
        }
        Ok(tip)
    }

    /// Switches the active chain to the branch ending at `new_tip`:
    /// find the common ancestor, unwind to it, replay the branch with full
    /// validation. Returns the orphaned ex-active blocks.
    fn reorg_to(&self, new_tip: &Hash) -> Result<Vec<Hash>, BlockError> {
        // Collect the new branch back to the first block that is already
        // on the active chain.
        let mut branch = Vec::new();
        let mut cursor = *new_tip;
        let ancestor = loop {
            let Some(header) = self.header(&cursor)? else {
                return Err(BlockError::Reorg(ReorgError::CommonAncestorNotFound));
            };
            if self.block_hash_at(header.height)? == Some(cursor) {
                break cursor;
            }
            branch.push(cursor);
            if header.height == 0 {
                return Err(BlockError::Reorg(ReorgError::CommonAncestorNotFound));
            }
            cursor = header.parent_hash;
        };
        branch.reverse();

        // Unwind the active chain down to the ancestor.
        let mut orphaned = Vec::new();
        while self.snapshot_locked().tip_hash != Some(ancestor) {
            orphaned.push(self.disconnect_tip()?);
        }

        // Replay the winning branch; every block gets the same scrutiny a
        // tip extension would.
        for hash in &branch {
            let block = self
                .block(hash)?
                .ok_or_else(|| BlockError::Corrupt("branch block missing".into()))?;
            let parent = self
                .header(&block.header.parent_hash)?
                .ok_or_else(|| BlockError::Corrupt("branch parent missing".into()))?;
            let expected_difficulty = self.expected_difficulty_after(&parent)?;

            if let Err(e) = self.connect_block(&block, hash, expected_difficulty) {
                return Err(self.restore_after_failed_replay(&ancestor, &orphaned, e));
            }
        }
        Ok(orphaned)
    }

    /// Best-effort restoration of the previous active chain after a branch
    /// block failed stateful replay.
    fn restore_after_failed_replay(
        &self,
        ancestor: &Hash,
        orphaned: &[Hash],
        cause: BlockError,
    ) -> BlockError {
        let restore = (|| -> Result<(), BlockError> {
            while self.snapshot_locked().tip_hash != Some(*ancestor) {
                self.disconnect_tip()?;
            }
            for hash in orphaned.iter().rev() {
                let block = self
                    .block(hash)?
                    .ok_or_else(|| BlockError::Corrupt("orphaned block missing".into()))?;
                let difficulty = if block.header.height == 0 {
                    self.config.initial_difficulty
                } else {
                    let parent = self
                        .header(&block.header.parent_hash)?
                        .ok_or_else(|| BlockError::Corrupt("orphaned parent missing".into()))?;
                    self.expected_difficulty_after(&parent)?
                };
                self.connect_block(&block, hash, difficulty)?;
            }
            Ok(())
        })();

        match restore {
            Ok(()) => BlockError::Reorg(ReorgError::InconsistentState(cause.to_string())),
            Err(e) => BlockError::Reorg(ReorgError::InconsistentState(format!(
                "{cause}; restoring the previous chain also failed: {e}"
            ))),
        }
    }

    /// Difficulty a child of `parent` must carry: the parent's difficulty
    /// between boundaries, the dampened retarget at interval boundaries.
    pub fn expected_difficulty_after(&self, parent: &BlockHeader) -> Result<u64, BlockError> {
        let child_height = parent.height + 1;
        if !is_retarget_height(child_height, &self.config.difficulty) {
            return Ok(parent.difficulty);
        }

        // Walk the parent's branch back to the interval start block.
        let start_height = child_height - self.config.difficulty.adjustment_interval;
        let mut cursor = parent.clone();
        while cursor.height > start_height {
            cursor = Self::read_header(self.kv.as_ref(), &cursor.parent_hash)?
                .ok_or_else(|| BlockError::Corrupt("interval walk hit a missing header".into()))?;
        }
        Ok(retarget(
            parent.difficulty,
            cursor.timestamp,
            parent.timestamp,
            &self.config.difficulty,
        ))
    }
}

impl AccountView for ChainStore {
    fn account(&self, address: &[u8]) -> AccountState {
        match self.kv.get(Cf::Accounts, address) {
            Ok(Some(raw)) => AccountState::from_bytes(&raw).unwrap_or_default(),
            _ => AccountState::default(),
        }
    }
}

impl ChainView for ChainStore {
    fn chain_snapshot(&self) -> ChainSnapshot {
        self.snapshot_locked()
    }

    fn next_difficulty(&self) -> u64 {
        let snapshot = self.snapshot_locked();
        let Some(tip) = snapshot.tip_hash else {
            return self.config.initial_difficulty;
        };
        match self.header(&tip) {
            Ok(Some(header)) => self
                .expected_difficulty_after(&header)
                .unwrap_or(snapshot.best_difficulty),
            _ => snapshot.best_difficulty,
        }
    }

    fn tip_timestamp(&self) -> i64 {
        let snapshot = self.snapshot_locked();
        snapshot
            .tip_hash
            .and_then(|tip| self.header(&tip).ok().flatten())
            .map(|h| h.timestamp)
            .unwrap_or(0)
    }
}
