// Plot File Engine
//
// A plot is a sealed, read-only artifact: a 149-byte header followed by
// 2^k deterministic 32-byte leaves. Creation streams leaves to disk in
// 80 KiB writes and folds the Merkle tree in the same pass; the header is
// patched in afterward. Reads are random-access through a shared memory
// map. The leaf body and Merkle root depend only on (seed, miner key,
// size); the creation timestamp is supplied by the caller so identical
// inputs produce bit-identical files.

use memmap2::Mmap;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::merkle::MerkleAccumulator;
use crate::crypto::hash::{Hash, hash_sha256};

pub const PLOT_MAGIC: [u8; 4] = *b"SPLT";
pub const PLOT_FORMAT_VERSION: u8 = 1;
pub const LEAF_BYTES: usize = 32;
pub const PLOT_HEADER_BYTES: usize = 4 + 1 + 32 + 32 + 8 + 32 + 8 + 32;
const CHECKSUM_OFFSET: usize = PLOT_HEADER_BYTES - 32;

pub const MIN_PLOT_BODY_BYTES: u64 = 100 * 1024 * 1024;
pub const MAX_CACHE_LEVELS: u8 = 20;
/// 2560 leaves = 80 KiB per write
const WRITE_CHUNK_LEAVES: u64 = 2560;

#[derive(Debug, thiserror::Error)]
pub enum PlotError {
    #[error("invalid plot configuration: {0}")]
    InvalidConfig(String),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt plot: {0}")]
    Corrupt(String),
}

/// Deterministic leaf derivation: `H(seed || miner_key || index_le)`.
pub fn compute_leaf(seed: &[u8; 32], miner_key: &[u8; 32], index: u64) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(seed);
    hasher.update(miner_key);
    hasher.update(index.to_le_bytes());
    hasher.finalize().into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlotHeader {
    pub seed: [u8; 32],
    pub miner_key: [u8; 32],
    pub leaf_count: u64,
    pub merkle_root: Hash,
    pub created_at: u64,
}

impl PlotHeader {
    pub fn to_bytes(&self) -> [u8; PLOT_HEADER_BYTES] {
        let mut b = [0u8; PLOT_HEADER_BYTES];
        b[0..4].copy_from_slice(&PLOT_MAGIC);
        b[4] = PLOT_FORMAT_VERSION;
        b[5..37].copy_from_slice(&self.seed);
        b[37..69].copy_from_slice(&self.miner_key);
        b[69..77].copy_from_slice(&self.leaf_count.to_le_bytes());
        b[77..109].copy_from_slice(&self.merkle_root);
        b[109..117].copy_from_slice(&self.created_at.to_le_bytes());
        let checksum = hash_sha256(&b[..CHECKSUM_OFFSET]);
        b[CHECKSUM_OFFSET..].copy_from_slice(&checksum);
        b
    }

    pub fn from_bytes(d: &[u8]) -> Result<Self, PlotError> {
        if d.len() < PLOT_HEADER_BYTES {
            return Err(PlotError::Corrupt("header too short".into()));
        }
        if d[0..4] != PLOT_MAGIC {
            return Err(PlotError::Corrupt("bad magic".into()));
        }
        if d[4] != PLOT_FORMAT_VERSION {
            return Err(PlotError::Corrupt(format!("unknown format version {}", d[4])));
        }
        let checksum = hash_sha256(&d[..CHECKSUM_OFFSET]);
        if d[CHECKSUM_OFFSET..PLOT_HEADER_BYTES] != checksum {
            return Err(PlotError::Corrupt("header checksum mismatch".into()));
        }

        let mut seed = [0u8; 32];
        seed.copy_from_slice(&d[5..37]);
        let mut miner_key = [0u8; 32];
        miner_key.copy_from_slice(&d[37..69]);
        let leaf_count = u64::from_le_bytes(d[69..77].try_into().unwrap());
        if leaf_count == 0 || !leaf_count.is_power_of_two() {
            return Err(PlotError::Corrupt("leaf count not a power of two".into()));
        }
        let mut merkle_root = [0u8; 32];
        merkle_root.copy_from_slice(&d[77..109]);

        Ok(PlotHeader {
            seed,
            miner_key,
            leaf_count,
            merkle_root,
            created_at: u64::from_le_bytes(d[109..117].try_into().unwrap()),
        })
    }

    /// Hash of the header contents; doubles as the on-disk checksum and as
    /// the plot identifier referenced by block proofs.
    pub fn header_hash(&self) -> Hash {
        hash_sha256(&self.to_bytes()[..CHECKSUM_OFFSET])
    }

    pub fn body_bytes(&self) -> u64 {
        self.leaf_count * LEAF_BYTES as u64
    }

    pub fn tree_height(&self) -> u32 {
        self.leaf_count.ilog2()
    }
}

/// Cache file naming convention: `<plot>.cache` next to the plot file.
pub fn cache_path_for(plot_path: &Path) -> PathBuf {
    let mut os = plot_path.as_os_str().to_os_string();
    os.push(".cache");
    PathBuf::from(os)
}

pub struct PlotCreateParams {
    pub size_bytes: u64,
    pub miner_key: [u8; 32],
    pub seed: [u8; 32],
    pub output_path: PathBuf,
    /// None = no cache file; Some(k) emits the top k levels.
    pub cache_levels: Option<u8>,
    pub created_at: u64,
}

pub struct CreatedPlot {
    pub header: PlotHeader,
    pub path: PathBuf,
    pub cache_path: Option<PathBuf>,
}

/// Builds a plot file, streaming leaves and Merkle state in one pass.
/// `progress` observes a monotonic fraction in 0..=1.
pub fn create(
    params: &PlotCreateParams,
    progress: &mut dyn FnMut(f64),
) -> Result<CreatedPlot, PlotError> {
    if params.size_bytes < MIN_PLOT_BODY_BYTES {
        return Err(PlotError::InvalidConfig(format!(
            "plot body must be at least {} bytes, got {}",
            MIN_PLOT_BODY_BYTES, params.size_bytes
        )));
    }
    validate_shape(params)?;
    build(params, progress)
}

fn validate_shape(params: &PlotCreateParams) -> Result<(), PlotError> {
    if params.size_bytes == 0 || params.size_bytes % LEAF_BYTES as u64 != 0 {
        return Err(PlotError::InvalidConfig(
            "plot size must be a multiple of the 32-byte leaf size".into(),
        ));
    }
    let leaf_count = params.size_bytes / LEAF_BYTES as u64;
    if !leaf_count.is_power_of_two() {
        return Err(PlotError::InvalidConfig(format!(
            "leaf count {} is not a power of two",
            leaf_count
        )));
    }
    if let Some(levels) = params.cache_levels
        && levels > MAX_CACHE_LEVELS
    {
        return Err(PlotError::InvalidConfig(format!(
            "cache levels {} exceeds the maximum of {}",
            levels, MAX_CACHE_LEVELS
        )));
    }
    Ok(())
}

/// Same as [`create`] but without the minimum-size floor; lets tests build
/// small trees while exercising the identical write path.
pub(crate) fn create_unchecked(
    params: &PlotCreateParams,
    progress: &mut dyn FnMut(f64),
) -> Result<CreatedPlot, PlotError> {
    validate_shape(params)?;
    build(params, progress)
}

fn build(
    params: &PlotCreateParams,
    progress: &mut dyn FnMut(f64),
) -> Result<CreatedPlot, PlotError> {
    let leaf_count = params.size_bytes / LEAF_BYTES as u64;
    let tree_height = leaf_count.ilog2();
    let cache_levels = params
        .cache_levels
        .map(|l| (l as u32).min(tree_height))
        .unwrap_or(0);

    let file = File::create(&params.output_path)?;
    let mut writer = BufWriter::with_capacity((WRITE_CHUNK_LEAVES as usize) * LEAF_BYTES, file);
    writer.write_all(&[0u8; PLOT_HEADER_BYTES])?;

    let mut acc = if cache_levels > 0 {
        MerkleAccumulator::with_capture(tree_height, cache_levels)
    } else {
        MerkleAccumulator::new()
    };

    let mut chunk = Vec::with_capacity((WRITE_CHUNK_LEAVES as usize) * LEAF_BYTES);
    let mut index = 0u64;
    while index < leaf_count {
        chunk.clear();
        let end = (index + WRITE_CHUNK_LEAVES).min(leaf_count);
        for i in index..end {
            let leaf = compute_leaf(&params.seed, &params.miner_key, i);
            chunk.extend_from_slice(&leaf);
            acc.push(leaf);
        }
        writer.write_all(&chunk)?;
        index = end;
        progress(index as f64 / leaf_count as f64);
    }

    let (merkle_root, captured) = acc.finalize_with_levels();
    let header = PlotHeader {
        seed: params.seed,
        miner_key: params.miner_key,
        leaf_count,
        merkle_root,
        created_at: params.created_at,
    };

    let mut file = writer.into_inner().map_err(|e| PlotError::Io(e.into_error()))?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&header.to_bytes())?;
    file.sync_all()?;

    let cache_path = if cache_levels > 0 {
        let path = cache_path_for(&params.output_path);
        super::cache::write_cache(&path, &merkle_root, &captured)?;
        Some(path)
    } else {
        None
    };

    Ok(CreatedPlot {
        header,
        path: params.output_path.clone(),
        cache_path,
    })
}

/// Read handle over a sealed plot. The body is memory-mapped; handles are
/// cheap to share and safe for concurrent readers.
pub struct PlotFile {
    header: PlotHeader,
    body: Mmap,
    path: PathBuf,
}

impl PlotFile {
    pub fn open(path: &Path) -> Result<Self, PlotError> {
        let file = File::open(path)?;
        let map = unsafe { Mmap::map(&file)? };
        if map.len() < PLOT_HEADER_BYTES {
            return Err(PlotError::Corrupt("file shorter than header".into()));
        }
        let header = PlotHeader::from_bytes(&map[..PLOT_HEADER_BYTES])?;
        let expected = PLOT_HEADER_BYTES as u64 + header.body_bytes();
        if map.len() as u64 != expected {
            return Err(PlotError::Corrupt(format!(
                "file is {} bytes, header implies {}",
                map.len(),
                expected
            )));
        }
        Ok(PlotFile {
            header,
            body: map,
            path: path.to_path_buf(),
        })
    }

    pub fn header(&self) -> &PlotHeader {
        &self.header
    }

    pub fn leaf_count(&self) -> u64 {
        self.header.leaf_count
    }

    pub fn merkle_root(&self) -> Hash {
        self.header.merkle_root
    }

    pub fn tree_height(&self) -> u32 {
        self.header.tree_height()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn leaf_at(&self, index: u64) -> Option<Hash> {
        if index >= self.header.leaf_count {
            return None;
        }
        let off = PLOT_HEADER_BYTES + (index as usize) * LEAF_BYTES;
        let mut leaf = [0u8; 32];
        leaf.copy_from_slice(&self.body[off..off + LEAF_BYTES]);
        Some(leaf)
    }

    /// Root of the subtree spanning `count` leaves from `start`; streams
    /// straight off the map. `count` must be a power of two within bounds.
    pub fn subtree_root(&self, start: u64, count: u64) -> Option<Hash> {
        if count == 0 || !count.is_power_of_two() || start % count != 0 {
            return None;
        }
        if start + count > self.header.leaf_count {
            return None;
        }
        let mut acc = MerkleAccumulator::new();
        for i in start..start + count {
            acc.push(self.leaf_at(i)?);
        }
        Some(acc.finalize())
    }
}
