// Scan Strategies
//
// A strategy is only an index stream: the scanner asks for the next batch
// of leaf indices until the stream runs dry. Duplicates are harmless (the
// score of a leaf does not change), so sampling does not deduplicate.

use crate::crypto::hash::{Hash, hash_sha256};

/// Capability consumed by the scanner. Implementations are cheap state
/// machines; no inheritance hierarchy.
pub trait ScanStrategy: Send {
    /// Returns up to `limit` leaf indices; an empty batch ends the scan.
    fn next_batch(&mut self, limit: usize) -> Vec<u64>;
}

/// Strategy selection, as carried in config and manager calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Visit every leaf once, in order.
    Full,
    /// Visit `samples` deterministically derived pseudo-random indices.
    Sampling { samples: u64 },
    /// Visit leaves in contiguous blocks for disk locality, optionally
    /// sub-sampling a fixed count per block at an even stride.
    CacheFriendly {
        block_leaves: u64,
        samples_per_block: Option<u64>,
    },
}

impl Strategy {
    pub fn build(&self, leaf_count: u64, challenge: &Hash) -> Box<dyn ScanStrategy> {
        match *self {
            Strategy::Full => Box::new(FullScan {
                next: 0,
                leaf_count,
            }),
            Strategy::Sampling { samples } => Box::new(SamplingScan {
                challenge: *challenge,
                leaf_count,
                counter: 0,
                remaining: samples,
            }),
            Strategy::CacheFriendly {
                block_leaves,
                samples_per_block,
            } => Box::new(BlockScan {
                leaf_count,
                block_leaves: block_leaves.max(1),
                samples_per_block,
                block: 0,
                slot: 0,
            }),
        }
    }
}

struct FullScan {
    next: u64,
    leaf_count: u64,
}

impl ScanStrategy for FullScan {
    fn next_batch(&mut self, limit: usize) -> Vec<u64> {
        let end = self.leaf_count.min(self.next + limit as u64);
        let batch: Vec<u64> = (self.next..end).collect();
        self.next = end;
        batch
    }
}

/// Index i is the first 8 bytes (LE) of `H(challenge || counter_le)`,
/// reduced mod leaf_count. Deterministic for a given challenge.
struct SamplingScan {
    challenge: Hash,
    leaf_count: u64,
    counter: u64,
    remaining: u64,
}

impl SamplingScan {
    fn index_for(&self, counter: u64) -> u64 {
        let mut buf = [0u8; 40];
        buf[0..32].copy_from_slice(&self.challenge);
        buf[32..40].copy_from_slice(&counter.to_le_bytes());
        let h = hash_sha256(&buf);
        u64::from_le_bytes(h[0..8].try_into().unwrap()) % self.leaf_count
    }
}

impl ScanStrategy for SamplingScan {
    fn next_batch(&mut self, limit: usize) -> Vec<u64> {
        let take = self.remaining.min(limit as u64);
        let mut batch = Vec::with_capacity(take as usize);
        for _ in 0..take {
            batch.push(self.index_for(self.counter));
            self.counter += 1;
        }
        self.remaining -= take;
        batch
    }
}

struct BlockScan {
    leaf_count: u64,
    block_leaves: u64,
    samples_per_block: Option<u64>,
    block: u64,
    slot: u64,
}

impl BlockScan {
    fn block_count(&self) -> u64 {
        self.leaf_count.div_ceil(self.block_leaves)
    }

    /// Per-block slot count and stride between sampled leaves.
    fn block_shape(&self, block: u64) -> (u64, u64) {
        let start = block * self.block_leaves;
        let len = self.block_leaves.min(self.leaf_count - start);
        match self.samples_per_block {
            None => (len, 1),
            Some(s) => {
                let samples = s.clamp(1, len);
                (samples, (len / samples).max(1))
            }
        }
    }
}

impl ScanStrategy for BlockScan {
    fn next_batch(&mut self, limit: usize) -> Vec<u64> {
        let mut batch = Vec::with_capacity(limit);
        while batch.len() < limit && self.block < self.block_count() {
            let (slots, stride) = self.block_shape(self.block);
            let start = self.block * self.block_leaves;
            while self.slot < slots && batch.len() < limit {
                batch.push(start + self.slot * stride);
                self.slot += 1;
            }
            if self.slot >= slots {
                self.block += 1;
                self.slot = 0;
            }
        }
        batch
    }
}

/// Early-termination and batching knobs for a scan. Termination is
/// best-effort: the scan may finish the batch it is in.
#[derive(Debug, Clone, Copy)]
pub struct ScanningConfig {
    /// Stop once the best score has at least this many leading zero bits.
    pub quality_threshold_bits: Option<u32>,
    /// Hard budget on visited leaves.
    pub max_leaves: Option<u64>,
    /// Leaves per batch; also the cancellation-check granularity.
    pub batch_leaves: usize,
}

impl Default for ScanningConfig {
    fn default() -> Self {
        ScanningConfig {
            quality_threshold_bits: None,
            max_leaves: None,
            batch_leaves: 4096,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(strategy: &mut dyn ScanStrategy, limit: usize) -> Vec<u64> {
        let mut all = Vec::new();
        loop {
            let batch = strategy.next_batch(limit);
            if batch.is_empty() {
                break;
            }
            all.extend(batch);
            assert!(all.len() < 1_000_000, "strategy never terminated");
        }
        all
    }

    #[test]
    fn test_full_scan_visits_every_leaf_once() {
        let mut s = Strategy::Full.build(1000, &[0u8; 32]);
        let all = drain(s.as_mut(), 64);
        assert_eq!(all, (0..1000).collect::<Vec<u64>>());
    }

    #[test]
    fn test_sampling_is_deterministic_and_bounded() {
        let challenge = [0x42u8; 32];
        let mut a = Strategy::Sampling { samples: 500 }.build(1 << 16, &challenge);
        let mut b = Strategy::Sampling { samples: 500 }.build(1 << 16, &challenge);
        let ia = drain(a.as_mut(), 128);
        let ib = drain(b.as_mut(), 128);
        assert_eq!(ia, ib);
        assert_eq!(ia.len(), 500);
        assert!(ia.iter().all(|&i| i < 1 << 16));
    }

    #[test]
    fn test_sampling_differs_across_challenges() {
        let mut a = Strategy::Sampling { samples: 100 }.build(1 << 16, &[1u8; 32]);
        let mut b = Strategy::Sampling { samples: 100 }.build(1 << 16, &[2u8; 32]);
        assert_ne!(drain(a.as_mut(), 64), drain(b.as_mut(), 64));
    }

    #[test]
    fn test_block_scan_full_coverage_without_sampling() {
        let mut s = Strategy::CacheFriendly {
            block_leaves: 64,
            samples_per_block: None,
        }
        .build(200, &[0u8; 32]);
        let mut all = drain(s.as_mut(), 50);
        all.sort_unstable();
        assert_eq!(all, (0..200).collect::<Vec<u64>>());
    }

    #[test]
    fn test_block_scan_subsamples_each_block() {
        let mut s = Strategy::CacheFriendly {
            block_leaves: 64,
            samples_per_block: Some(4),
        }
        .build(256, &[0u8; 32]);
        let all = drain(s.as_mut(), 7);
        // 4 blocks, 4 samples each, stride 16 within the block.
        assert_eq!(all.len(), 16);
        assert_eq!(&all[0..4], &[0, 16, 32, 48]);
        assert_eq!(&all[4..8], &[64, 80, 96, 112]);
    }

    #[test]
    fn test_batch_limit_respected() {
        let mut s = Strategy::Full.build(1000, &[0u8; 32]);
        assert_eq!(s.next_batch(10).len(), 10);
    }
}
