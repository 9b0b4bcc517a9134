// Proof Generation
//
// Drives a scan strategy over one plot for one challenge, tracks the best
// score, and extracts the Merkle path for the winning leaf. Cancellation
// is cooperative: the flag is checked at every leaf batch and every
// sibling computation, so a cancelled scan returns within one batch.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::crypto::hash::{Hash, leading_zero_bits, score_below};
use crate::plot::cache::PlotCache;
use crate::plot::file::{PlotError, PlotFile};
use crate::primitives::proof::{PlotProof, score_leaf};

use super::strategy::{ScanStrategy, ScanningConfig};

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("scan cancelled")]
    Cancelled,
    #[error(transparent)]
    Plot(#[from] PlotError),
}

#[derive(Debug)]
pub struct ScanOutcome {
    pub proof: Option<PlotProof>,
    pub leaves_scanned: u64,
}

/// Scans `plot` under `challenge` and returns the best proof found, or
/// `None` when the strategy produced no indices. The winning leaf's path
/// is extracted once, after scanning, using the cache where it covers the
/// level and streamed subtree recomputation below it.
pub fn scan_plot(
    plot: &PlotFile,
    cache: Option<&PlotCache>,
    challenge: &Hash,
    strategy: &mut dyn ScanStrategy,
    config: &ScanningConfig,
    cancel: &AtomicBool,
) -> Result<ScanOutcome, ScanError> {
    let mut best: Option<(u64, Hash, Hash)> = None; // (index, leaf, score)
    let mut scanned = 0u64;

    loop {
        if cancel.load(Ordering::Relaxed) {
            return Err(ScanError::Cancelled);
        }

        let batch = strategy.next_batch(config.batch_leaves);
        if batch.is_empty() {
            break;
        }

        for index in batch {
            let Some(leaf) = plot.leaf_at(index) else {
                continue;
            };
            let score = score_leaf(challenge, &leaf);
            let improved = match &best {
                None => true,
                Some((_, _, current)) => score_below(&score, current),
            };
            if improved {
                best = Some((index, leaf, score));
            }
            scanned += 1;
        }

        if let Some((_, _, score)) = &best
            && let Some(bits) = config.quality_threshold_bits
            && leading_zero_bits(score) >= bits
        {
            break;
        }
        if let Some(max) = config.max_leaves
            && scanned >= max
        {
            break;
        }
    }

    let Some((leaf_index, leaf, score)) = best else {
        return Ok(ScanOutcome {
            proof: None,
            leaves_scanned: scanned,
        });
    };

    let (siblings, sibling_on_left) = extract_path(plot, cache, leaf_index, cancel)?;
    Ok(ScanOutcome {
        proof: Some(PlotProof {
            leaf,
            leaf_index,
            siblings,
            sibling_on_left,
            merkle_root: plot.merkle_root(),
            challenge: *challenge,
            score,
        }),
        leaves_scanned: scanned,
    })
}

/// Sibling hashes for `leaf_index`, ordered leaf-to-root with their
/// orientation bits. Levels the cache covers come from the cache; deeper
/// siblings are recomputed by streaming their leaf range off the plot.
pub fn extract_path(
    plot: &PlotFile,
    cache: Option<&PlotCache>,
    leaf_index: u64,
    cancel: &AtomicBool,
) -> Result<(Vec<Hash>, Vec<bool>), ScanError> {
    let height = plot.tree_height();
    let mut siblings = Vec::with_capacity(height as usize);
    let mut on_left = Vec::with_capacity(height as usize);

    for level in (1..=height).rev() {
        if cancel.load(Ordering::Relaxed) {
            return Err(ScanError::Cancelled);
        }

        let node_index = leaf_index >> (height - level);
        let sibling_index = node_index ^ 1;

        let cached = cache
            .filter(|c| level <= c.levels())
            .and_then(|c| c.node(level, sibling_index));
        let sibling = match cached {
            Some(node) => node,
            None => {
                let span = 1u64 << (height - level);
                plot.subtree_root(sibling_index * span, span)
                    .ok_or_else(|| PlotError::Corrupt("sibling range out of bounds".into()))?
            }
        };

        siblings.push(sibling);
        on_left.push(sibling_index < node_index);
    }

    Ok((siblings, on_left))
}
