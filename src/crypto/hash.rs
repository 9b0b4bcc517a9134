// Cryptographic Hashing Wrappers
use sha2::{Digest, Sha256};

pub const HASH_BYTES: usize = 32;

/// 32-byte SHA-256 digest. All consensus hashing uses this type.
pub type Hash = [u8; HASH_BYTES];

/// SHA-256: the single hash function of the protocol (leaves, scores,
/// Merkle nodes, block and transaction ids, challenges).
pub fn hash_sha256(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA-256 Concat: hashes a then b without allocating a temporary Vec
pub fn hash_concat(a: &[u8], b: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(a);
    hasher.update(b);
    hasher.finalize().into()
}

/// Scores and targets are compared as 256-bit big-endian unsigned integers,
/// which for fixed 32-byte arrays is plain lexicographic byte order.
pub fn score_below(score: &Hash, target: &Hash) -> bool {
    score < target
}

/// Number of leading zero bits, big-endian. Used by the quality-threshold
/// early-termination check during plot scans.
pub fn leading_zero_bits(h: &Hash) -> u32 {
    let mut bits = 0u32;
    for byte in h {
        if *byte == 0 {
            bits += 8;
        } else {
            bits += byte.leading_zeros();
            break;
        }
    }
    bits
}
