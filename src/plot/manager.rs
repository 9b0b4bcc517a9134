// Plot Manager
//
// Owns the fleet: open plot handles, their metadata record on disk, and
// fan-out proof generation with bounded concurrency. The registry lock is
// read-mostly; metadata file writes are serialized separately so readers
// never wait on disk. Observers subscribe to a broadcast channel rather
// than registering callbacks, so a dropped manager simply closes the
// stream.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{Semaphore, broadcast};
use uuid::Uuid;

use super::cache::PlotCache;
use super::file::{PlotError, PlotFile, cache_path_for};
use crate::crypto::hash::{Hash, score_below};
use crate::miner::generator::{ScanError, scan_plot};
use crate::miner::strategy::{ScanningConfig, Strategy};
use crate::primitives::proof::PlotProof;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlotStatus {
    Valid,
    Missing,
    Corrupt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlotMetadata {
    pub id: Uuid,
    pub file_path: PathBuf,
    pub size_bytes: u64,
    pub leaf_count: u64,
    pub merkle_root: String,
    pub cache_path: Option<PathBuf>,
    pub status: PlotStatus,
    pub created_at: u64,
}

impl PlotMetadata {
    pub fn merkle_root_bytes(&self) -> Option<Hash> {
        let raw = hex::decode(&self.merkle_root).ok()?;
        raw.try_into().ok()
    }
}

#[derive(Debug, Clone)]
pub enum PlotEvent {
    PlotAdded(Uuid),
    PlotRemoved(Uuid),
}

struct PlotRecord {
    metadata: PlotMetadata,
    handle: Option<Arc<PlotFile>>,
    cache: Option<Arc<PlotCache>>,
}

pub struct PlotManager {
    registry: RwLock<HashMap<Uuid, PlotRecord>>,
    metadata_path: PathBuf,
    /// Serializes metadata file writes; the registry stays readable.
    metadata_write: Mutex<()>,
    events: broadcast::Sender<PlotEvent>,
    scan_permits: Arc<Semaphore>,
}

impl PlotManager {
    pub fn new(metadata_path: PathBuf, max_concurrent_proofs: usize) -> Self {
        let (events, _) = broadcast::channel(64);
        PlotManager {
            registry: RwLock::new(HashMap::new()),
            metadata_path,
            metadata_write: Mutex::new(()),
            events,
            scan_permits: Arc::new(Semaphore::new(max_concurrent_proofs.max(1))),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlotEvent> {
        self.events.subscribe()
    }

    fn registry_read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Uuid, PlotRecord>> {
        self.registry.read().unwrap_or_else(|e| e.into_inner())
    }

    fn registry_write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Uuid, PlotRecord>> {
        self.registry.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Opens, verifies, and indexes a plot file. The cache sidecar is
    /// picked up when present and bound to the same root; a bad cache is
    /// ignored, never fatal.
    pub fn add_plot(&self, path: &Path, id: Option<Uuid>) -> Result<PlotMetadata, PlotError> {
        {
            let registry = self.registry_read();
            if let Some(existing) = registry.values().find(|r| r.metadata.file_path == path) {
                return Err(PlotError::InvalidConfig(format!(
                    "plot already registered as {}",
                    existing.metadata.id
                )));
            }
        }

        let plot = Arc::new(PlotFile::open(path)?);
        let cache_path = cache_path_for(path);
        let cache = if cache_path.exists() {
            PlotCache::open(&cache_path, &plot.merkle_root())
                .ok()
                .map(Arc::new)
        } else {
            None
        };

        let id = id.unwrap_or_else(Uuid::new_v4);
        let metadata = PlotMetadata {
            id,
            file_path: path.to_path_buf(),
            size_bytes: plot.header().body_bytes(),
            leaf_count: plot.leaf_count(),
            merkle_root: hex::encode(plot.merkle_root()),
            cache_path: cache.as_ref().map(|_| cache_path),
            status: PlotStatus::Valid,
            created_at: plot.header().created_at,
        };

        self.registry_write().insert(
            id,
            PlotRecord {
                metadata: metadata.clone(),
                handle: Some(plot),
                cache,
            },
        );
        self.save_metadata()?;
        let _ = self.events.send(PlotEvent::PlotAdded(id));
        Ok(metadata)
    }

    /// Drops a plot from the registry; `delete_file` also unlinks the
    /// plot and its cache from disk.
    pub fn delete_plot(&self, id: &Uuid, delete_file: bool) -> Result<(), PlotError> {
        let record = self
            .registry_write()
            .remove(id)
            .ok_or_else(|| PlotError::InvalidConfig(format!("no plot with id {id}")))?;

        if delete_file {
            // Handles drop with the record; the map goes away with them.
            std::fs::remove_file(&record.metadata.file_path)?;
            if let Some(cache_path) = &record.metadata.cache_path {
                let _ = std::fs::remove_file(cache_path);
            }
        }
        self.save_metadata()?;
        let _ = self.events.send(PlotEvent::PlotRemoved(*id));
        Ok(())
    }

    /// Loads the registry from the metadata file, revalidating every
    /// entry: files that vanished are Missing, files that fail header or
    /// checksum validation are Corrupt.
    pub fn load_metadata(&self) -> Result<(), PlotError> {
        if !self.metadata_path.exists() {
            return Ok(());
        }
        let raw = std::fs::read(&self.metadata_path)?;
        let entries: Vec<PlotMetadata> = serde_json::from_slice(&raw)
            .map_err(|e| PlotError::Corrupt(format!("plot metadata file: {e}")))?;

        let mut registry = self.registry_write();
        registry.clear();
        for mut metadata in entries {
            let (status, handle, cache) = if !metadata.file_path.exists() {
                (PlotStatus::Missing, None, None)
            } else {
                match PlotFile::open(&metadata.file_path) {
                    Ok(plot) => {
                        let plot = Arc::new(plot);
                        let cache = metadata
                            .cache_path
                            .as_ref()
                            .filter(|p| p.exists())
                            .and_then(|p| PlotCache::open(p, &plot.merkle_root()).ok())
                            .map(Arc::new);
                        (PlotStatus::Valid, Some(plot), cache)
                    }
                    Err(_) => (PlotStatus::Corrupt, None, None),
                }
            };
            metadata.status = status;
            registry.insert(
                metadata.id,
                PlotRecord {
                    metadata,
                    handle,
                    cache,
                },
            );
        }
        Ok(())
    }

    /// Persists the registry as pretty JSON; writes are serialized.
    pub fn save_metadata(&self) -> Result<(), PlotError> {
        let entries: Vec<PlotMetadata> = {
            let registry = self.registry_read();
            let mut list: Vec<PlotMetadata> =
                registry.values().map(|r| r.metadata.clone()).collect();
            list.sort_by_key(|m| m.id);
            list
        };
        let json = serde_json::to_vec_pretty(&entries)
            .map_err(|e| PlotError::Corrupt(format!("serializing plot metadata: {e}")))?;

        let _write = self.metadata_write.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(dir) = self.metadata_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&self.metadata_path, json)?;
        Ok(())
    }

    /// Registers `.plot` files in `dir` that the registry does not know
    /// yet. Returns how many were added; unreadable files are skipped.
    pub fn discover(&self, dir: &Path) -> Result<usize, PlotError> {
        if !dir.exists() {
            return Ok(0);
        }
        let known: Vec<PathBuf> = self
            .registry_read()
            .values()
            .map(|r| r.metadata.file_path.clone())
            .collect();

        let mut added = 0;
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("plot") {
                continue;
            }
            if known.contains(&path) {
                continue;
            }
            if self.add_plot(&path, None).is_ok() {
                added += 1;
            }
        }
        Ok(added)
    }

    pub fn plots(&self) -> Vec<PlotMetadata> {
        let mut list: Vec<PlotMetadata> = self
            .registry_read()
            .values()
            .map(|r| r.metadata.clone())
            .collect();
        list.sort_by_key(|m| m.id);
        list
    }

    pub fn valid_plot_count(&self) -> usize {
        self.registry_read()
            .values()
            .filter(|r| r.metadata.status == PlotStatus::Valid)
            .count()
    }

    pub fn total_valid_bytes(&self) -> u64 {
        self.registry_read()
            .values()
            .filter(|r| r.metadata.status == PlotStatus::Valid)
            .map(|r| r.metadata.size_bytes)
            .sum()
    }

    pub fn plot_handle(&self, id: &Uuid) -> Option<Arc<PlotFile>> {
        self.registry_read().get(id)?.handle.clone()
    }

    /// Scans every Valid plot for `challenge`, at most
    /// `max_concurrent_proofs` at a time. One scan task per plot runs on
    /// the blocking pool behind a shared semaphore; the overall best
    /// proof wins. Cancellation wins over partial results: a tripped flag
    /// yields `Cancelled`, never a stale proof.
    pub async fn generate_proof(
        &self,
        challenge: &Hash,
        strategy: Strategy,
        config: ScanningConfig,
        cancel: Arc<AtomicBool>,
    ) -> Result<FleetScan, ScanError> {
        let jobs: Vec<(Uuid, Arc<PlotFile>, Option<Arc<PlotCache>>)> = {
            let registry = self.registry_read();
            registry
                .values()
                .filter(|r| r.metadata.status == PlotStatus::Valid)
                .filter_map(|r| {
                    r.handle
                        .clone()
                        .map(|h| (r.metadata.id, h, r.cache.clone()))
                })
                .collect()
        };

        let mut tasks = Vec::with_capacity(jobs.len());
        for (id, plot, cache) in jobs {
            let permit = self
                .scan_permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| ScanError::Cancelled)?;
            let challenge = *challenge;
            let cancel = cancel.clone();
            tasks.push(tokio::task::spawn_blocking(move || {
                let _permit = permit;
                let mut scan = strategy.build(plot.leaf_count(), &challenge);
                scan_plot(
                    &plot,
                    cache.as_deref(),
                    &challenge,
                    scan.as_mut(),
                    &config,
                    &cancel,
                )
                .map(|outcome| (id, outcome))
            }));
        }

        let mut fleet = FleetScan {
            best: None,
            leaves_scanned: 0,
            plots_scanned: 0,
        };
        for task in tasks {
            let Ok(result) = task.await else { continue };
            let Ok((id, outcome)) = result else { continue };
            fleet.plots_scanned += 1;
            fleet.leaves_scanned += outcome.leaves_scanned;
            if let Some(proof) = outcome.proof {
                let improves = match &fleet.best {
                    None => true,
                    Some((_, current)) => score_below(&proof.score, &current.score),
                };
                if improves {
                    fleet.best = Some((id, proof));
                }
            }
        }

        if cancel.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(ScanError::Cancelled);
        }
        Ok(fleet)
    }
}

/// Result of one fan-out over the fleet: the winning proof (if any plot
/// produced one) plus the work the scan actually did.
#[derive(Debug)]
pub struct FleetScan {
    pub best: Option<(Uuid, PlotProof)>,
    pub leaves_scanned: u64,
    pub plots_scanned: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plot::file::{LEAF_BYTES, PlotCreateParams, create_unchecked};
    use crate::primitives::proof::score_leaf;

    fn build_plot(dir: &Path, name: &str, seed_byte: u8, leaves: u64) -> PathBuf {
        let params = PlotCreateParams {
            size_bytes: leaves * LEAF_BYTES as u64,
            miner_key: [0x01u8; 32],
            seed: [seed_byte; 32],
            output_path: dir.join(name),
            cache_levels: Some(2),
            created_at: 1_700_000_000,
        };
        create_unchecked(&params, &mut |_| {}).unwrap().path
    }

    fn manager(dir: &Path) -> PlotManager {
        PlotManager::new(dir.join("plots.json"), 2)
    }

    #[test]
    fn test_add_list_delete() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let path = build_plot(dir.path(), "a.plot", 1, 64);

        let mut events = mgr.subscribe();
        let meta = mgr.add_plot(&path, None).unwrap();
        assert_eq!(meta.status, PlotStatus::Valid);
        assert_eq!(meta.leaf_count, 64);
        assert!(meta.cache_path.is_some());
        assert_eq!(mgr.valid_plot_count(), 1);
        assert_eq!(mgr.total_valid_bytes(), 64 * 32);
        assert!(matches!(
            events.try_recv().unwrap(),
            PlotEvent::PlotAdded(id) if id == meta.id
        ));

        mgr.delete_plot(&meta.id, true).unwrap();
        assert_eq!(mgr.plots().len(), 0);
        assert!(!path.exists());
        assert!(matches!(
            events.try_recv().unwrap(),
            PlotEvent::PlotRemoved(id) if id == meta.id
        ));
    }

    #[test]
    fn test_double_registration_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let path = build_plot(dir.path(), "a.plot", 1, 64);
        mgr.add_plot(&path, None).unwrap();
        assert!(matches!(
            mgr.add_plot(&path, None),
            Err(PlotError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_metadata_roundtrip_and_status_revalidation() {
        let dir = tempfile::tempdir().unwrap();
        let good = build_plot(dir.path(), "good.plot", 1, 64);
        let doomed = build_plot(dir.path(), "doomed.plot", 2, 64);

        let (good_id, doomed_id) = {
            let mgr = manager(dir.path());
            let g = mgr.add_plot(&good, None).unwrap();
            let d = mgr.add_plot(&doomed, None).unwrap();
            (g.id, d.id)
        };

        std::fs::remove_file(&doomed).unwrap();

        let mgr = manager(dir.path());
        mgr.load_metadata().unwrap();
        let plots: HashMap<Uuid, PlotStatus> =
            mgr.plots().into_iter().map(|m| (m.id, m.status)).collect();
        assert_eq!(plots[&good_id], PlotStatus::Valid);
        assert_eq!(plots[&doomed_id], PlotStatus::Missing);
        assert_eq!(mgr.valid_plot_count(), 1);
    }

    #[test]
    fn test_corrupt_plot_flagged_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = build_plot(dir.path(), "a.plot", 1, 64);
        let id = {
            let mgr = manager(dir.path());
            mgr.add_plot(&path, None).unwrap().id
        };

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[20] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let mgr = manager(dir.path());
        mgr.load_metadata().unwrap();
        assert_eq!(mgr.plots()[0].id, id);
        assert_eq!(mgr.plots()[0].status, PlotStatus::Corrupt);
    }

    #[test]
    fn test_discover_picks_up_new_files() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        build_plot(dir.path(), "one.plot", 1, 64);
        build_plot(dir.path(), "two.plot", 2, 64);
        std::fs::write(dir.path().join("not-a-plot.txt"), b"x").unwrap();

        assert_eq!(mgr.discover(dir.path()).unwrap(), 2);
        // Idempotent: nothing new on a second pass.
        assert_eq!(mgr.discover(dir.path()).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fleet_scan_returns_overall_best() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let a = build_plot(dir.path(), "a.plot", 1, 128);
        let b = build_plot(dir.path(), "b.plot", 2, 128);
        mgr.add_plot(&a, None).unwrap();
        mgr.add_plot(&b, None).unwrap();

        let challenge = [0x77u8; 32];
        let fleet = mgr
            .generate_proof(
                &challenge,
                Strategy::Full,
                ScanningConfig::default(),
                Arc::new(AtomicBool::new(false)),
            )
            .await
            .unwrap();
        assert_eq!(fleet.plots_scanned, 2);
        assert_eq!(fleet.leaves_scanned, 256);
        let (_, proof) = fleet.best.unwrap();

        // Brute-force the best score across both plots.
        let mut expected = [0xFFu8; 32];
        for path in [&a, &b] {
            let plot = PlotFile::open(path).unwrap();
            for i in 0..plot.leaf_count() {
                let s = score_leaf(&challenge, &plot.leaf_at(i).unwrap());
                if s < expected {
                    expected = s;
                }
            }
        }
        assert_eq!(proof.score, expected);
    }

    #[tokio::test]
    async fn test_fleet_scan_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let a = build_plot(dir.path(), "a.plot", 1, 128);
        mgr.add_plot(&a, None).unwrap();

        let result = mgr
            .generate_proof(
                &[0u8; 32],
                Strategy::Full,
                ScanningConfig::default(),
                Arc::new(AtomicBool::new(true)),
            )
            .await;
        assert!(matches!(result, Err(ScanError::Cancelled)));
    }
}
