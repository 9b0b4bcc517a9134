// Challenge Derivation and Epoch Lifecycle
//
// One challenge per epoch, bound to the parent block: the chain cannot be
// farmed ahead of time because the next challenge only exists once the
// previous block does. Epoch numbers track the height being mined for.

use std::time::{Duration, Instant};

use crate::crypto::hash::{Hash, hash_sha256};

pub const DEFAULT_EPOCH_DURATION: Duration = Duration::from_secs(10);
/// Proofs are still accepted this long after nominal expiry, absorbing
/// scan-completion and delivery latency.
pub const EPOCH_GRACE: Duration = Duration::from_secs(2);

const GENESIS_DOMAIN: &[u8] = b"spacetime-genesis";

/// Challenge for epoch 0: `H("spacetime-genesis" || network_id)`.
pub fn genesis_challenge(network_id: &str) -> Hash {
    let mut buf = Vec::with_capacity(GENESIS_DOMAIN.len() + network_id.len());
    buf.extend_from_slice(GENESIS_DOMAIN);
    buf.extend_from_slice(network_id.as_bytes());
    hash_sha256(&buf)
}

/// Challenge for any later epoch: `H(parent_block_hash || epoch_le)`.
pub fn challenge_for(parent_hash: &Hash, epoch: u64) -> Hash {
    let mut buf = [0u8; 40];
    buf[0..32].copy_from_slice(parent_hash);
    buf[32..40].copy_from_slice(&epoch.to_le_bytes());
    hash_sha256(&buf)
}

pub struct EpochMachine {
    current_epoch: u64,
    current_challenge: Hash,
    parent_hash: Hash,
    epoch_start: Instant,
    epoch_duration: Duration,
}

impl EpochMachine {
    /// Starts at epoch 0 with the genesis challenge for `network_id`.
    pub fn new(network_id: &str, epoch_duration: Duration) -> Self {
        EpochMachine {
            current_epoch: 0,
            current_challenge: genesis_challenge(network_id),
            parent_hash: [0u8; 32],
            epoch_start: Instant::now(),
            epoch_duration,
        }
    }

    pub fn current_epoch(&self) -> u64 {
        self.current_epoch
    }

    pub fn current_challenge(&self) -> Hash {
        self.current_challenge
    }

    pub fn parent_hash(&self) -> Hash {
        self.parent_hash
    }

    /// Rotates to the next epoch on block acceptance. Monotonic: only
    /// [`reset`](Self::reset) can move the epoch backward.
    pub fn advance_epoch(&mut self, parent_hash: Hash) {
        self.current_epoch += 1;
        self.parent_hash = parent_hash;
        self.current_challenge = challenge_for(&parent_hash, self.current_epoch);
        self.epoch_start = Instant::now();
    }

    /// Rewind or jump, used on reorg rollback and on (re)connection when
    /// the chain tip moved while this miner was away.
    pub fn reset(&mut self, epoch: u64, challenge: Hash, parent_hash: Hash, start: Instant) {
        self.current_epoch = epoch;
        self.current_challenge = challenge;
        self.parent_hash = parent_hash;
        self.epoch_start = start;
    }

    pub fn time_remaining_in_epoch(&self) -> Duration {
        self.epoch_duration
            .saturating_sub(self.epoch_start.elapsed())
    }

    pub fn is_expired(&self) -> bool {
        self.epoch_start.elapsed() > self.epoch_duration
    }

    /// Whether a proof arriving now may still be used for this epoch.
    pub fn accepts_proofs(&self) -> bool {
        self.epoch_start.elapsed() <= self.epoch_duration + EPOCH_GRACE
    }

    /// Checks that `challenge` is the unique valid challenge for
    /// `(parent_hash, epoch)`.
    pub fn validate_challenge_for_epoch(
        challenge: &Hash,
        epoch: u64,
        parent_hash: &Hash,
    ) -> bool {
        *challenge == challenge_for(parent_hash, epoch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_genesis_challenge_literal() {
        // H("spacetime-genesis" || "testnet")
        let expected = hash_sha256(b"spacetime-genesistestnet");
        assert_eq!(genesis_challenge("testnet"), expected);
        assert_ne!(genesis_challenge("testnet"), genesis_challenge("mainnet"));
    }

    #[test]
    fn test_challenge_binds_parent_and_epoch() {
        let parent = [7u8; 32];
        assert_ne!(challenge_for(&parent, 1), challenge_for(&parent, 2));
        assert_ne!(challenge_for(&parent, 1), challenge_for(&[8u8; 32], 1));
    }

    #[test]
    fn test_advance_is_monotonic() {
        let mut m = EpochMachine::new("testnet", DEFAULT_EPOCH_DURATION);
        assert_eq!(m.current_epoch(), 0);
        m.advance_epoch([1u8; 32]);
        m.advance_epoch([2u8; 32]);
        assert_eq!(m.current_epoch(), 2);
        assert_eq!(m.current_challenge(), challenge_for(&[2u8; 32], 2));
    }

    #[test]
    fn test_reset_rewinds() {
        let mut m = EpochMachine::new("testnet", DEFAULT_EPOCH_DURATION);
        m.advance_epoch([1u8; 32]);
        m.advance_epoch([2u8; 32]);
        let ch = challenge_for(&[1u8; 32], 1);
        m.reset(1, ch, [1u8; 32], Instant::now());
        assert_eq!(m.current_epoch(), 1);
        assert_eq!(m.current_challenge(), ch);
    }

    #[test]
    fn test_expiry() {
        let mut m = EpochMachine::new("testnet", Duration::from_secs(1));
        assert!(!m.is_expired());
        assert!(m.time_remaining_in_epoch() <= Duration::from_secs(1));
        // Backdate the epoch start past duration + grace.
        m.reset(
            0,
            m.current_challenge(),
            [0u8; 32],
            Instant::now() - Duration::from_secs(4),
        );
        assert!(m.is_expired());
        assert!(!m.accepts_proofs());
        assert_eq!(m.time_remaining_in_epoch(), Duration::ZERO);
    }

    #[test]
    fn test_grace_window() {
        let mut m = EpochMachine::new("testnet", Duration::from_secs(1));
        m.reset(
            0,
            m.current_challenge(),
            [0u8; 32],
            Instant::now() - Duration::from_secs(2),
        );
        assert!(m.is_expired());
        assert!(m.accepts_proofs());
    }

    #[test]
    fn test_validate_challenge() {
        let parent = [9u8; 32];
        let ch = challenge_for(&parent, 5);
        assert!(EpochMachine::validate_challenge_for_epoch(&ch, 5, &parent));
        assert!(!EpochMachine::validate_challenge_for_epoch(&ch, 6, &parent));
        assert!(!EpochMachine::validate_challenge_for_epoch(
            &ch,
            5,
            &[0u8; 32]
        ));
    }
}
