// Storage Backing Interface
//
// The chain store talks to its key-value backing through this minimal
// contract: per-column-family point get, delete, and an atomic write
// batch. Production runs on RocksDB (db.rs); unit tests run on the
// in-memory implementation below.

use std::collections::BTreeMap;
use std::sync::RwLock;

/// Logical column families of the chain store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cf {
    Blocks,
    Heights,
    Transactions,
    Accounts,
    Metadata,
}

impl Cf {
    pub const ALL: [Cf; 5] = [
        Cf::Blocks,
        Cf::Heights,
        Cf::Transactions,
        Cf::Accounts,
        Cf::Metadata,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Cf::Blocks => "blocks",
            Cf::Heights => "heights",
            Cf::Transactions => "transactions",
            Cf::Accounts => "accounts",
            Cf::Metadata => "metadata",
        }
    }

    fn index(self) -> usize {
        match self {
            Cf::Blocks => 0,
            Cf::Heights => 1,
            Cf::Transactions => 2,
            Cf::Accounts => 3,
            Cf::Metadata => 4,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage backend: {0}")]
    Backend(String),
    #[error("data corruption: {0}")]
    Corruption(String),
}

pub(crate) enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// Ordered set of writes committed atomically: after `write` returns,
/// either every operation is durable or none is.
#[derive(Default)]
pub struct WriteBatch {
    pub(crate) ops: Vec<(Cf, BatchOp)>,
}

impl WriteBatch {
    pub fn put(&mut self, cf: Cf, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push((cf, BatchOp::Put(key.into(), value.into())));
    }

    pub fn delete(&mut self, cf: Cf, key: impl Into<Vec<u8>>) {
        self.ops.push((cf, BatchOp::Delete(key.into())));
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

pub trait KvStore: Send + Sync {
    fn get(&self, cf: Cf, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    fn write(&self, batch: WriteBatch) -> Result<(), StoreError>;

    fn put(&self, cf: Cf, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        batch.put(cf, key, value);
        self.write(batch)
    }

    fn delete(&self, cf: Cf, key: &[u8]) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        batch.delete(cf, key);
        self.write(batch)
    }

    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// In-memory backing used by unit tests; a single lock gives batches the
/// same all-or-nothing visibility the real store provides.
pub struct MemKv {
    trees: RwLock<[BTreeMap<Vec<u8>, Vec<u8>>; 5]>,
}

impl MemKv {
    pub fn new() -> Self {
        MemKv {
            trees: RwLock::new(std::array::from_fn(|_| BTreeMap::new())),
        }
    }
}

impl Default for MemKv {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for MemKv {
    fn get(&self, cf: Cf, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let trees = self
            .trees
            .read()
            .map_err(|_| StoreError::Backend("poisoned lock".into()))?;
        Ok(trees[cf.index()].get(key).cloned())
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut trees = self
            .trees
            .write()
            .map_err(|_| StoreError::Backend("poisoned lock".into()))?;
        for (cf, op) in batch.ops {
            match op {
                BatchOp::Put(key, value) => {
                    trees[cf.index()].insert(key, value);
                }
                BatchOp::Delete(key) => {
                    trees[cf.index()].remove(&key);
                }
            }
        }
        Ok(())
    }
}
