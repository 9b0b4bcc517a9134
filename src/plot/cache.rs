// Plot Merkle Cache
//
// Optional sidecar file holding the top k levels of a plot's Merkle tree
// so proof paths near the root do not require streaming half the plot.
// Strictly advisory: validation never trusts it, and a missing or stale
// cache only costs recomputation time.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use super::file::PlotError;
use crate::crypto::hash::Hash;

pub const CACHE_MAGIC: [u8; 4] = *b"SPLC";
pub const CACHE_FORMAT_VERSION: u8 = 1;

/// Loaded cache: `levels[0]` is level 1 (the two children of the root),
/// `levels[k-1]` is level k, each level l holding 2^l nodes left to right.
pub struct PlotCache {
    merkle_root: Hash,
    levels: Vec<Vec<Hash>>,
}

/// Writes the cache file bound to `merkle_root`.
pub fn write_cache(path: &Path, merkle_root: &Hash, levels: &[Vec<Hash>]) -> Result<(), PlotError> {
    if levels.len() > 255 {
        return Err(PlotError::InvalidConfig("too many cache levels".into()));
    }
    for (i, level) in levels.iter().enumerate() {
        if level.len() != 1usize << (i + 1) {
            return Err(PlotError::InvalidConfig(format!(
                "cache level {} holds {} nodes, expected {}",
                i + 1,
                level.len(),
                1usize << (i + 1)
            )));
        }
    }

    let file = File::create(path)?;
    let mut w = BufWriter::new(file);
    w.write_all(&CACHE_MAGIC)?;
    w.write_all(&[CACHE_FORMAT_VERSION])?;
    w.write_all(merkle_root)?;
    w.write_all(&[levels.len() as u8])?;
    for level in levels {
        for node in level {
            w.write_all(node)?;
        }
    }
    w.flush()?;
    Ok(())
}

impl PlotCache {
    /// Opens a cache file and binds it against the owning plot's root.
    pub fn open(path: &Path, expected_root: &Hash) -> Result<Self, PlotError> {
        let mut file = File::open(path)?;
        let mut head = [0u8; 4 + 1 + 32 + 1];
        file.read_exact(&mut head)
            .map_err(|_| PlotError::Corrupt("cache header too short".into()))?;

        if head[0..4] != CACHE_MAGIC {
            return Err(PlotError::Corrupt("cache: bad magic".into()));
        }
        if head[4] != CACHE_FORMAT_VERSION {
            return Err(PlotError::Corrupt(format!(
                "cache: unknown format version {}",
                head[4]
            )));
        }
        let mut merkle_root = [0u8; 32];
        merkle_root.copy_from_slice(&head[5..37]);
        if merkle_root != *expected_root {
            return Err(PlotError::Corrupt(
                "cache is bound to a different plot root".into(),
            ));
        }

        let level_count = head[37] as usize;
        let mut levels = Vec::with_capacity(level_count);
        for l in 1..=level_count {
            let nodes = 1usize << l;
            let mut buf = vec![0u8; nodes * 32];
            file.read_exact(&mut buf)
                .map_err(|_| PlotError::Corrupt("cache: truncated level data".into()))?;
            let mut level = Vec::with_capacity(nodes);
            for chunk in buf.chunks_exact(32) {
                let mut h = [0u8; 32];
                h.copy_from_slice(chunk);
                level.push(h);
            }
            levels.push(level);
        }

        Ok(PlotCache {
            merkle_root,
            levels,
        })
    }

    pub fn merkle_root(&self) -> Hash {
        self.merkle_root
    }

    /// Number of cached levels below the root.
    pub fn levels(&self) -> u32 {
        self.levels.len() as u32
    }

    /// Node at `level` (1 = children of the root), `index` left to right.
    pub fn node(&self, level: u32, index: u64) -> Option<Hash> {
        if level == 0 || level > self.levels() {
            return None;
        }
        self.levels[(level - 1) as usize].get(index as usize).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plot::file::{
        LEAF_BYTES, PlotCreateParams, PlotFile, cache_path_for, create_unchecked,
    };
    use crate::plot::merkle::merkle_root;
    use std::path::Path;

    fn build(dir: &Path, leaves: u64, cache_levels: u8) -> (PlotFile, PlotCache) {
        let params = PlotCreateParams {
            size_bytes: leaves * LEAF_BYTES as u64,
            miner_key: [0x01u8; 32],
            seed: [0x00u8; 32],
            output_path: dir.join("cache-test.plot"),
            cache_levels: Some(cache_levels),
            created_at: 1_700_000_000,
        };
        let created = create_unchecked(&params, &mut |_| {}).unwrap();
        let plot = PlotFile::open(&created.path).unwrap();
        let cache = PlotCache::open(&created.cache_path.unwrap(), &plot.merkle_root()).unwrap();
        (plot, cache)
    }

    #[test]
    fn test_cache_file_convention() {
        assert_eq!(
            cache_path_for(Path::new("/plots/a.plot")),
            Path::new("/plots/a.plot.cache")
        );
    }

    #[test]
    fn test_cached_nodes_match_subtrees() {
        let dir = tempfile::tempdir().unwrap();
        let (plot, cache) = build(dir.path(), 256, 3);
        assert_eq!(cache.levels(), 3);

        // Level l node i is the root of the subtree spanning 256 >> l
        // leaves starting at i * (256 >> l).
        for level in 1..=3u32 {
            let span = 256u64 >> level;
            for index in 0..(1u64 << level) {
                let expected = plot.subtree_root(index * span, span).unwrap();
                assert_eq!(cache.node(level, index).unwrap(), expected);
            }
        }
    }

    #[test]
    fn test_level_one_pair_hashes_to_root() {
        let dir = tempfile::tempdir().unwrap();
        let (plot, cache) = build(dir.path(), 64, 1);
        let left = cache.node(1, 0).unwrap();
        let right = cache.node(1, 1).unwrap();
        assert_eq!(
            crate::crypto::hash::hash_concat(&left, &right),
            plot.merkle_root()
        );
    }

    #[test]
    fn test_out_of_range_node_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let (_plot, cache) = build(dir.path(), 64, 2);
        assert_eq!(cache.node(0, 0), None);
        assert_eq!(cache.node(3, 0), None);
        assert_eq!(cache.node(2, 4), None);
    }

    #[test]
    fn test_foreign_root_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (plot, _cache) = build(dir.path(), 64, 2);
        let cache_path = cache_path_for(plot.path());
        assert!(matches!(
            PlotCache::open(&cache_path, &[0xEEu8; 32]),
            Err(PlotError::Corrupt(_))
        ));
    }

    #[test]
    fn test_write_rejects_malformed_levels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.cache");
        let levels = vec![vec![[0u8; 32]; 3]]; // level 1 must hold 2 nodes
        assert!(matches!(
            write_cache(&path, &merkle_root(&[]), &levels),
            Err(PlotError::InvalidConfig(_))
        ));
    }
}
