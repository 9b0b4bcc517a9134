// Data Structures: Transaction
//
// Account-model transfer. The hash (and the signature) cover every field
// except the signature itself; amounts and fees are signed 64-bit so the
// wire format matches the account balance representation, but negatives
// are rejected structurally.

use crate::crypto::hash::{Hash, hash_sha256};
use crate::crypto::keys::{
    Address, PublicKey, SIGNATURE_BYTES, SignatureBytes, Signer, derive_address, verify_signature,
};

pub const MAX_RECIPIENT_BYTES: usize = 64;
pub const MAX_TX_BYTES: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub sender_pubkey: PublicKey,
    /// Recipient account address, 1..=64 bytes. Senders are identified by
    /// the 32-byte hash of their pubkey; recipients are free-form so funds
    /// can be sent to identities this node has never seen a key for.
    pub recipient: Vec<u8>,
    pub amount: i64,
    pub fee: i64,
    pub nonce: u64,
    pub signature: SignatureBytes,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TxError {
    #[error("malformed transaction: {0}")]
    Malformed(&'static str),
    #[error("invalid signature")]
    InvalidSignature,
    #[error("bad nonce: expected {expected}, got {got}")]
    BadNonce { expected: u64, got: u64 },
    #[error("insufficient balance: have {balance}, need {required}")]
    InsufficientBalance { balance: i64, required: i64 },
    #[error("duplicate transaction {0}")]
    Duplicate(String),
    #[error("sender queue full")]
    SenderQueueFull,
    #[error("mempool full")]
    MempoolFull,
    #[error("transaction expired")]
    Expired,
}

impl Transaction {
    /// Canonical bytes fed to the hash: everything except the signature.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&self.sender_pubkey);
        buf.extend_from_slice(&(self.recipient.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.recipient);
        buf.extend_from_slice(&self.amount.to_le_bytes());
        buf.extend_from_slice(&self.fee.to_le_bytes());
        buf.extend_from_slice(&self.nonce.to_le_bytes());
        buf
    }

    /// Transaction id: SHA-256 over the unsigned canonical form.
    pub fn hash(&self) -> Hash {
        hash_sha256(&self.signing_bytes())
    }

    pub fn sender_address(&self) -> Address {
        derive_address(&self.sender_pubkey)
    }

    pub fn encoded_len(&self) -> usize {
        33 + 4 + self.recipient.len() + 8 + 8 + 8 + SIGNATURE_BYTES
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = self.signing_bytes();
        buf.extend_from_slice(&self.signature);
        buf
    }

    /// Self-delimiting decode; returns the consumed byte count so callers
    /// can parse transaction vectors.
    pub fn from_bytes(d: &[u8]) -> Result<(Self, usize), TxError> {
        let mut off = 0usize;

        if d.len() < off + 33 {
            return Err(TxError::Malformed("missing sender pubkey"));
        }
        let mut sender_pubkey = [0u8; 33];
        sender_pubkey.copy_from_slice(&d[off..off + 33]);
        off += 33;

        if d.len() < off + 4 {
            return Err(TxError::Malformed("missing recipient length"));
        }
        let rec_len = u32::from_le_bytes(d[off..off + 4].try_into().unwrap()) as usize;
        off += 4;
        if rec_len == 0 || rec_len > MAX_RECIPIENT_BYTES {
            return Err(TxError::Malformed("recipient length out of range"));
        }
        if d.len() < off + rec_len {
            return Err(TxError::Malformed("truncated recipient"));
        }
        let recipient = d[off..off + rec_len].to_vec();
        off += rec_len;

        if d.len() < off + 24 {
            return Err(TxError::Malformed("missing scalar fields"));
        }
        let amount = i64::from_le_bytes(d[off..off + 8].try_into().unwrap());
        off += 8;
        let fee = i64::from_le_bytes(d[off..off + 8].try_into().unwrap());
        off += 8;
        let nonce = u64::from_le_bytes(d[off..off + 8].try_into().unwrap());
        off += 8;

        if d.len() < off + SIGNATURE_BYTES {
            return Err(TxError::Malformed("truncated signature"));
        }
        let mut signature = [0u8; SIGNATURE_BYTES];
        signature.copy_from_slice(&d[off..off + SIGNATURE_BYTES]);
        off += SIGNATURE_BYTES;

        Ok((
            Transaction {
                sender_pubkey,
                recipient,
                amount,
                fee,
                nonce,
                signature,
            },
            off,
        ))
    }

    /// Structural and signature checks. Does NOT touch account state.
    pub fn check_stateless(&self) -> Result<(), TxError> {
        if self.recipient.is_empty() || self.recipient.len() > MAX_RECIPIENT_BYTES {
            return Err(TxError::Malformed("recipient length out of range"));
        }
        if self.encoded_len() > MAX_TX_BYTES {
            return Err(TxError::Malformed("transaction too large"));
        }
        if self.amount < 0 {
            return Err(TxError::Malformed("negative amount"));
        }
        if self.fee < 0 {
            return Err(TxError::Malformed("negative fee"));
        }
        // Catch arithmetic DoS attacks
        if self.amount.checked_add(self.fee).is_none() {
            return Err(TxError::Malformed("amount + fee overflows"));
        }
        if !verify_signature(&self.hash(), &self.signature, &self.sender_pubkey) {
            return Err(TxError::InvalidSignature);
        }
        Ok(())
    }

    /// Total debit this transaction causes on the sender account.
    pub fn total_spend(&self) -> i64 {
        // check_stateless guarantees no overflow for admitted transactions
        self.amount.saturating_add(self.fee)
    }

    /// Builds and signs a transfer with the given signer.
    pub fn signed(
        signer: &dyn Signer,
        recipient: Vec<u8>,
        amount: i64,
        fee: i64,
        nonce: u64,
    ) -> Result<Self, TxError> {
        let mut tx = Transaction {
            sender_pubkey: signer.public_key(),
            recipient,
            amount,
            fee,
            nonce,
            signature: [0u8; SIGNATURE_BYTES],
        };
        tx.signature = signer
            .sign(&tx.hash())
            .map_err(|_| TxError::InvalidSignature)?;
        Ok(tx)
    }
}
