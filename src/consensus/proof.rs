// Proof Validation
//
// Stateless verification of a space proof against the epoch challenge, the
// claimed plot root, and (optionally) the difficulty target. Checks run in
// a fixed order and failures are data: tagged errors carrying the hex the
// operator needs, never panics.

use crate::crypto::hash::{Hash, score_below};
use crate::plot::merkle::fold_path;
use crate::primitives::proof::{PlotProof, score_leaf};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProofError {
    #[error("challenge mismatch: expected {expected}, got {got}")]
    ChallengeMismatch { expected: String, got: String },
    #[error("plot root mismatch: expected {expected}, got {got}")]
    PlotRootMismatch { expected: String, got: String },
    #[error("score mismatch: recomputed {expected}, proof claims {got}")]
    ScoreMismatch { expected: String, got: String },
    #[error("score {score} not below target {target}")]
    ScoreAboveTarget { score: String, target: String },
    #[error("leaf index {index} out of range for {leaf_count} leaves")]
    InvalidLeaf { index: u64, leaf_count: u64 },
    #[error("invalid merkle path: {0}")]
    InvalidMerklePath(&'static str),
}

/// Validates `proof` for an epoch with `expected_challenge` over a plot
/// committed to by `expected_plot_root`. `tree_height` is derived from the
/// plot's leaf count; `target`, when given, enforces the difficulty bound.
pub fn validate_proof(
    proof: &PlotProof,
    expected_challenge: &Hash,
    expected_plot_root: &Hash,
    target: Option<&Hash>,
    tree_height: u32,
) -> Result<(), ProofError> {
    if proof.challenge != *expected_challenge {
        return Err(ProofError::ChallengeMismatch {
            expected: hex::encode(expected_challenge),
            got: hex::encode(proof.challenge),
        });
    }

    if proof.merkle_root != *expected_plot_root {
        return Err(ProofError::PlotRootMismatch {
            expected: hex::encode(expected_plot_root),
            got: hex::encode(proof.merkle_root),
        });
    }

    let recomputed = score_leaf(&proof.challenge, &proof.leaf);
    if recomputed != proof.score {
        return Err(ProofError::ScoreMismatch {
            expected: hex::encode(recomputed),
            got: hex::encode(proof.score),
        });
    }

    if let Some(target) = target
        && !score_below(&proof.score, target)
    {
        return Err(ProofError::ScoreAboveTarget {
            score: hex::encode(proof.score),
            target: hex::encode(target),
        });
    }

    let leaf_count = 1u64
        .checked_shl(tree_height)
        .ok_or(ProofError::InvalidMerklePath("tree height out of range"))?;
    if proof.leaf_index >= leaf_count {
        return Err(ProofError::InvalidLeaf {
            index: proof.leaf_index,
            leaf_count,
        });
    }
    if proof.siblings.len() != tree_height as usize {
        return Err(ProofError::InvalidMerklePath(
            "path length does not match tree height",
        ));
    }
    if proof.sibling_on_left.len() != proof.siblings.len() {
        return Err(ProofError::InvalidMerklePath(
            "orientation bit count does not match path length",
        ));
    }

    if fold_path(&proof.leaf, &proof.siblings, &proof.sibling_on_left) != proof.merkle_root {
        return Err(ProofError::InvalidMerklePath(
            "path does not reconstruct the plot root",
        ));
    }

    Ok(())
}
