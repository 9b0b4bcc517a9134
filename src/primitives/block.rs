// Data Structures: Block
//
// Fixed-width little-endian header layout; the hash covers everything
// before the trailing signature, and the signature covers the hash. The
// body carries the embedded space proof followed by the transaction
// vector.

use super::proof::BlockProof;
use super::transaction::Transaction;
use crate::crypto::hash::{Hash, hash_concat, hash_sha256};
use crate::crypto::keys::{PUBLIC_KEY_BYTES, PublicKey, SIGNATURE_BYTES, SignatureBytes};

pub const BLOCK_VERSION: u8 = 1;
pub const HEADER_UNSIGNED_BYTES: usize = 1 + 32 + 8 + 8 + 8 + 8 + 32 + 32 + 32 + 32 + 32 + 33;
pub const HEADER_BYTES: usize = HEADER_UNSIGNED_BYTES + SIGNATURE_BYTES;
pub const GENESIS_PARENT: Hash = [0u8; 32];

/// Root of an empty transaction set. Documented convention: all-zero.
pub const EMPTY_TX_ROOT: Hash = [0u8; 32];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: u8,
    pub parent_hash: Hash,
    pub height: u64,
    pub timestamp: i64,
    pub difficulty: u64,
    pub epoch: u64,
    pub challenge: Hash,
    pub plot_root: Hash,
    pub proof_score: Hash,
    pub tx_root: Hash,
    /// Reserved for a future account-state commitment; must be all-zero
    /// at version 1.
    pub state_root: Hash,
    pub miner_pubkey: PublicKey,
    pub signature: SignatureBytes,
}

impl BlockHeader {
    /// Canonical bytes without the signature; input to the header hash.
    pub fn signing_bytes(&self) -> [u8; HEADER_UNSIGNED_BYTES] {
        let mut b = [0u8; HEADER_UNSIGNED_BYTES];
        b[0] = self.version;
        b[1..33].copy_from_slice(&self.parent_hash);
        b[33..41].copy_from_slice(&self.height.to_le_bytes());
        b[41..49].copy_from_slice(&self.timestamp.to_le_bytes());
        b[49..57].copy_from_slice(&self.difficulty.to_le_bytes());
        b[57..65].copy_from_slice(&self.epoch.to_le_bytes());
        b[65..97].copy_from_slice(&self.challenge);
        b[97..129].copy_from_slice(&self.plot_root);
        b[129..161].copy_from_slice(&self.proof_score);
        b[161..193].copy_from_slice(&self.tx_root);
        b[193..225].copy_from_slice(&self.state_root);
        b[225..258].copy_from_slice(&self.miner_pubkey);
        b
    }

    /// The definitive block hash.
    pub fn hash(&self) -> Hash {
        hash_sha256(&self.signing_bytes())
    }

    pub fn to_bytes(&self) -> [u8; HEADER_BYTES] {
        let mut b = [0u8; HEADER_BYTES];
        b[..HEADER_UNSIGNED_BYTES].copy_from_slice(&self.signing_bytes());
        b[HEADER_UNSIGNED_BYTES..].copy_from_slice(&self.signature);
        b
    }

    pub fn from_bytes(d: &[u8]) -> Result<Self, &'static str> {
        if d.len() < HEADER_BYTES {
            return Err("block header too short");
        }

        let mut parent_hash = [0u8; 32];
        parent_hash.copy_from_slice(&d[1..33]);
        let mut challenge = [0u8; 32];
        challenge.copy_from_slice(&d[65..97]);
        let mut plot_root = [0u8; 32];
        plot_root.copy_from_slice(&d[97..129]);
        let mut proof_score = [0u8; 32];
        proof_score.copy_from_slice(&d[129..161]);
        let mut tx_root = [0u8; 32];
        tx_root.copy_from_slice(&d[161..193]);
        let mut state_root = [0u8; 32];
        state_root.copy_from_slice(&d[193..225]);
        let mut miner_pubkey = [0u8; PUBLIC_KEY_BYTES];
        miner_pubkey.copy_from_slice(&d[225..258]);
        let mut signature = [0u8; SIGNATURE_BYTES];
        signature.copy_from_slice(&d[258..322]);

        Ok(BlockHeader {
            version: d[0],
            parent_hash,
            height: u64::from_le_bytes(d[33..41].try_into().unwrap()),
            timestamp: i64::from_le_bytes(d[41..49].try_into().unwrap()),
            difficulty: u64::from_le_bytes(d[49..57].try_into().unwrap()),
            epoch: u64::from_le_bytes(d[57..65].try_into().unwrap()),
            challenge,
            plot_root,
            proof_score,
            tx_root,
            state_root,
            miner_pubkey,
            signature,
        })
    }
}

/// A full block: header, embedded space proof, ordered transactions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub proof: BlockProof,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    /// Merkle root over transaction ids, duplicating the last node on odd
    /// levels. Empty set hashes to the all-zero convention.
    pub fn compute_tx_root(transactions: &[Transaction]) -> Hash {
        if transactions.is_empty() {
            return EMPTY_TX_ROOT;
        }

        let mut level: Vec<Hash> = transactions.iter().map(|tx| tx.hash()).collect();
        while level.len() > 1 {
            let mut next = Vec::with_capacity(level.len().div_ceil(2));
            for pair in level.chunks(2) {
                let right = if pair.len() == 2 { &pair[1] } else { &pair[0] };
                next.push(hash_concat(&pair[0], right));
            }
            level = next;
        }
        level[0]
    }

    /// Body bytes as persisted and relayed: proof, then the length-prefixed
    /// transaction vector.
    pub fn body_bytes(&self) -> Vec<u8> {
        let mut b = self.proof.to_bytes();
        b.extend_from_slice(&(self.transactions.len() as u32).to_le_bytes());
        for tx in &self.transactions {
            b.extend_from_slice(&tx.to_bytes());
        }
        b
    }

    pub fn body_from_bytes(d: &[u8]) -> Result<(BlockProof, Vec<Transaction>), &'static str> {
        let (proof, mut off) = BlockProof::from_bytes(d)?;
        if d.len() < off + 4 {
            return Err("block body: missing tx count");
        }
        let count = u32::from_le_bytes(d[off..off + 4].try_into().unwrap()) as usize;
        off += 4;
        let mut transactions = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let (tx, n) =
                Transaction::from_bytes(&d[off..]).map_err(|_| "block body: bad transaction")?;
            transactions.push(tx);
            off += n;
        }
        Ok((proof, transactions))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut b = self.header.to_bytes().to_vec();
        b.extend_from_slice(&self.body_bytes());
        b
    }

    pub fn from_bytes(d: &[u8]) -> Result<Self, &'static str> {
        let header = BlockHeader::from_bytes(d)?;
        let (proof, transactions) = Self::body_from_bytes(&d[HEADER_BYTES..])?;
        Ok(Block {
            header,
            proof,
            transactions,
        })
    }
}
