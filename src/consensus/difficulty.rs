// Difficulty Retargeting
//
// The difficulty integer D >= 1 maps to the 32-byte big-endian target
// T = (2^256 - 1) / D; a block wins when its score is strictly below T.
// This module is the only place the conversion lives; the miner, builder
// and validator all call through here. All arithmetic is integer with
// truncation toward zero.

use primitive_types::U256;

use crate::crypto::hash::Hash;

#[derive(Debug, Clone, Copy)]
pub struct DifficultyConfig {
    pub target_block_time_s: u64,
    /// Retarget every N blocks (at heights h where h % N == 0).
    pub adjustment_interval: u64,
    /// Dampening factor F >= 1; only 1/F of the raw correction is applied.
    pub dampening_factor: u64,
    pub min_difficulty: u64,
    pub max_difficulty: u64,
}

impl Default for DifficultyConfig {
    fn default() -> Self {
        DifficultyConfig {
            target_block_time_s: 10,
            adjustment_interval: 100,
            dampening_factor: 4,
            min_difficulty: 1,
            max_difficulty: u64::MAX,
        }
    }
}

/// `T = (2^256 - 1) / D`, big-endian. Higher difficulty, lower target.
pub fn target_for(difficulty: u64) -> Hash {
    let t = U256::MAX / U256::from(difficulty.max(1));
    let mut out = [0u8; 32];
    t.to_big_endian(&mut out);
    out
}

/// Inverse of [`target_for`] up to truncation: `D = (2^256 - 1) / T`.
pub fn difficulty_for(target: &Hash) -> u64 {
    let t = U256::from_big_endian(target);
    if t.is_zero() {
        return u64::MAX;
    }
    let d = U256::MAX / t;
    if d > U256::from(u64::MAX) {
        u64::MAX
    } else {
        d.as_u64()
    }
}

pub fn is_retarget_height(height: u64, config: &DifficultyConfig) -> bool {
    height > 0 && height % config.adjustment_interval == 0
}

/// Recomputes difficulty at an interval boundary from the wall time the
/// previous interval took:
///
///   raw      = D_prev * expected / observed
///   adjusted = D_prev + (raw - D_prev) / F
///   D_new    = clamp(adjusted, min, max)
///
/// When the interval ran exactly on schedule the result is D_prev.
pub fn retarget(
    d_prev: u64,
    interval_start_ts: i64,
    tip_ts: i64,
    config: &DifficultyConfig,
) -> u64 {
    let expected = (config.adjustment_interval as u128) * (config.target_block_time_s as u128);
    let observed = tip_ts.saturating_sub(interval_start_ts).max(1) as u128;

    let raw = (d_prev as u128) * expected / observed;
    let damping = config.dampening_factor.max(1) as i128;
    let adjusted = d_prev as i128 + (raw as i128 - d_prev as i128) / damping;

    adjusted.clamp(config.min_difficulty.max(1) as i128, config.max_difficulty as i128) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash::score_below;

    #[test]
    fn test_difficulty_one_is_all_ones_target() {
        assert_eq!(target_for(1), [0xFFu8; 32]);
    }

    #[test]
    fn test_target_halves_as_difficulty_doubles() {
        let t2 = target_for(2);
        let mut expected = [0xFFu8; 32];
        expected[0] = 0x7F;
        assert_eq!(t2, expected);
        assert!(score_below(&t2, &target_for(1)));
        assert!(score_below(&target_for(4), &t2));
    }

    #[test]
    fn test_conversion_roundtrip() {
        for d in [1u64, 2, 3, 1000, 12345, 1 << 40, u64::MAX] {
            assert_eq!(difficulty_for(&target_for(d)), d);
        }
    }

    #[test]
    fn test_retarget_twice_as_fast() {
        // 100 blocks expected to take 1000 s arrived in 500 s:
        // raw = 2000, adjusted = 1000 + 1000/4 = 1250.
        let cfg = DifficultyConfig::default();
        assert_eq!(retarget(1000, 1_000_000, 1_000_500, &cfg), 1250);
    }

    #[test]
    fn test_retarget_on_schedule_is_identity() {
        let cfg = DifficultyConfig::default();
        assert_eq!(retarget(1000, 0, 1000, &cfg), 1000);
    }

    #[test]
    fn test_retarget_slow_interval_lowers_difficulty() {
        // Twice as slow: raw = 500, adjusted = 1000 - 125 = 875.
        let cfg = DifficultyConfig::default();
        assert_eq!(retarget(1000, 0, 2000, &cfg), 875);
    }

    #[test]
    fn test_retarget_clamps() {
        let cfg = DifficultyConfig {
            min_difficulty: 100,
            max_difficulty: 2000,
            ..Default::default()
        };
        // Extremely fast interval pushes far above max.
        assert_eq!(retarget(1900, 0, 1, &cfg), 2000);
        // Extremely slow interval drops below min.
        assert_eq!(retarget(101, 0, 1_000_000, &cfg), 100);
    }

    #[test]
    fn test_retarget_zero_or_negative_interval() {
        let cfg = DifficultyConfig::default();
        // Clock skew: observed clamps to 1 second.
        let fast = retarget(1000, 500, 400, &cfg);
        assert_eq!(fast, retarget(1000, 0, 1, &cfg));
    }

    #[test]
    fn test_retarget_heights() {
        let cfg = DifficultyConfig::default();
        assert!(!is_retarget_height(0, &cfg));
        assert!(!is_retarget_height(99, &cfg));
        assert!(is_retarget_height(100, &cfg));
        assert!(is_retarget_height(200, &cfg));
    }
}
