// RocksDB Storage Backing
//
// Production implementation of the KvStore contract.
//
// Design principles:
// 1. Durability - WAL enabled, sync on batch commits
// 2. Performance - tuned for blockchain workloads
// 3. Atomicity - one WriteBatch per multi-family update
// 4. Crash recovery - automatic via RocksDB WAL

use rocksdb::{ColumnFamilyDescriptor, DB, Options};
use std::path::Path;
use std::sync::Arc;

use super::kv::{BatchOp, Cf, KvStore, StoreError, WriteBatch};

pub struct RocksKv {
    db: Arc<DB>,
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

impl RocksKv {
    /// Open or create the database with settings tuned for chain traffic.
    ///
    /// - write_buffer_size 64MB: balance between memory and flush
    ///   frequency at a 10-second block cadence.
    /// - max_write_buffer_number 3: no write stalls during compaction.
    /// - LZ4: fast compression; chain data (hash-keyed records) still
    ///   compresses usefully.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        opts.set_write_buffer_size(64 * 1024 * 1024);
        opts.set_max_write_buffer_number(3);
        opts.set_min_write_buffer_number_to_merge(1);

        opts.set_target_file_size_base(64 * 1024 * 1024);
        opts.set_max_bytes_for_level_base(256 * 1024 * 1024);

        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let cache = rocksdb::Cache::new_lru_cache(256 * 1024 * 1024);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_block_cache(&cache);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        // WAL settings - critical for crash recovery
        opts.set_wal_bytes_per_sync(1024 * 1024);
        opts.set_max_total_wal_size(128 * 1024 * 1024);

        opts.set_level_compaction_dynamic_level_bytes(true);
        opts.set_max_background_jobs(4);

        let cfs: Vec<ColumnFamilyDescriptor> = Cf::ALL
            .iter()
            .map(|cf| ColumnFamilyDescriptor::new(cf.name(), opts.clone()))
            .collect();

        let db = DB::open_cf_descriptors(&opts, path, cfs)?;
        Ok(RocksKv { db: Arc::new(db) })
    }

    fn handle(&self, cf: Cf) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(cf.name())
            .ok_or_else(|| StoreError::Corruption(format!("column family {} missing", cf.name())))
    }
}

impl KvStore for RocksKv {
    fn get(&self, cf: Cf, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.db.get_cf(self.handle(cf)?, key)?)
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut inner = rocksdb::WriteBatch::default();
        for (cf, op) in batch.ops {
            let handle = self.handle(cf)?;
            match op {
                BatchOp::Put(key, value) => inner.put_cf(handle, key, value),
                BatchOp::Delete(key) => inner.delete_cf(handle, key),
            }
        }

        // Force fsync: a block commit must survive a crash.
        let mut write_opts = rocksdb::WriteOptions::default();
        write_opts.set_sync(true);
        self.db.write_opt(inner, &write_opts)?;
        Ok(())
    }

    fn flush(&self) -> Result<(), StoreError> {
        for cf in Cf::ALL {
            self.db.flush_cf(self.handle(cf)?)?;
        }
        Ok(())
    }
}
