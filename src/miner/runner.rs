// Miner Control Loop
//
// Boot, connect, mine. Each accepted block rotates the epoch, cancels the
// in-flight scan, and starts a fresh one under a linked timeout; the best
// proof is submitted, and when it also beats the difficulty target the
// miner assembles and broadcasts a block of its own. Cancellation is a
// shared flag the scanners poll every batch, so a superseded scan dies
// within one batch and its result is never submitted.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use crate::config::MinerConfig;
use crate::consensus::builder::{BuildParams, BuilderConfig, build_block};
use crate::consensus::chain::{ChainView, unix_now};
use crate::consensus::challenge::{DEFAULT_EPOCH_DURATION, EpochMachine, challenge_for};
use crate::consensus::difficulty::target_for;
use crate::crypto::hash::{Hash, score_below};
use crate::crypto::keys::Signer;
use crate::mempool::Mempool;
use crate::miner::generator::ScanError;
use crate::miner::strategy::{ScanningConfig, Strategy};
use crate::node::session::{NodeConnector, OutboundMessage, Session, SessionEvent};
use crate::plot::manager::PlotManager;
use crate::primitives::account::AccountView;
use crate::primitives::block::GENESIS_PARENT;
use crate::primitives::proof::{BlockPlotMetadata, BlockProof};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinerState {
    Idle,
    Booting,
    Connected,
    Mining,
    ProofTimeout,
    Reconnecting,
    Stopped,
}

impl MinerState {
    fn name(self) -> &'static str {
        match self {
            MinerState::Idle => "idle",
            MinerState::Booting => "booting",
            MinerState::Connected => "connected",
            MinerState::Mining => "mining",
            MinerState::ProofTimeout => "proof-timeout",
            MinerState::Reconnecting => "reconnecting",
            MinerState::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Default)]
pub struct MinerCounters {
    pub challenges_received: AtomicU64,
    pub proofs_generated: AtomicU64,
    pub proofs_submitted: AtomicU64,
    pub blocks_won: AtomicU64,
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub state: String,
    pub epoch: u64,
    pub challenges_received: u64,
    pub proofs_generated: u64,
    pub proofs_submitted: u64,
    pub blocks_won: u64,
    pub valid_plots: usize,
    pub total_plot_bytes: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum MinerError {
    #[error("network: {0}")]
    Network(String),
    #[error(transparent)]
    Plot(#[from] crate::plot::file::PlotError),
    #[error("mock signer refused; set SPACETIME_ALLOW_MOCK_SIGNER=1 for development")]
    MockSignerRefused,
}

struct ScanTask {
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl ScanTask {
    fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }
}

pub struct Miner<C, S>
where
    C: ChainView + AccountView + Send + Sync + 'static,
    S: Signer + 'static,
{
    config: MinerConfig,
    manager: Arc<PlotManager>,
    chain: Arc<C>,
    mempool: Arc<Mempool>,
    signer: Arc<S>,
    epoch: Arc<StdMutex<EpochMachine>>,
    strategy: Strategy,
    builder_config: BuilderConfig,
    counters: Arc<MinerCounters>,
    state: Arc<StdMutex<MinerState>>,
    shutdown: Arc<AtomicBool>,
}

impl<C, S> Miner<C, S>
where
    C: ChainView + AccountView + Send + Sync + 'static,
    S: Signer + 'static,
{
    pub fn new(
        config: MinerConfig,
        manager: Arc<PlotManager>,
        chain: Arc<C>,
        mempool: Arc<Mempool>,
        signer: Arc<S>,
        strategy: Strategy,
    ) -> Self {
        let epoch = EpochMachine::new(&config.network_id, DEFAULT_EPOCH_DURATION);
        Miner {
            config,
            manager,
            chain,
            mempool,
            signer,
            epoch: Arc::new(StdMutex::new(epoch)),
            strategy,
            builder_config: BuilderConfig::default(),
            counters: Arc::new(MinerCounters::default()),
            state: Arc::new(StdMutex::new(MinerState::Idle)),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn counters(&self) -> Arc<MinerCounters> {
        self.counters.clone()
    }

    pub fn state(&self) -> MinerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Flag checked by the run loop; lets signal handlers and tests stop
    /// the miner from outside.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    fn set_state(&self, state: MinerState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    pub async fn run(&self, connector: &impl NodeConnector) -> Result<(), MinerError> {
        self.set_state(MinerState::Booting);

        if self.signer.is_mock()
            && std::env::var("SPACETIME_ALLOW_MOCK_SIGNER").ok().as_deref() != Some("1")
        {
            return Err(MinerError::MockSignerRefused);
        }

        self.manager.load_metadata()?;
        let discovered = self.manager.discover(&self.config.plot_directory)?;
        eprintln!(
            "[miner] plots: {} valid, {} bytes total, {} newly discovered",
            self.manager.valid_plot_count(),
            self.manager.total_valid_bytes(),
            discovered
        );

        loop {
            let mut session = self.connect_with_retries(connector).await?;
            self.set_state(MinerState::Connected);
            self.sync_epoch_from_chain();

            let mut scan = self.spawn_scan(session.outbound.clone());
            self.set_state(MinerState::Mining);
            let mut stop_poll = tokio::time::interval(Duration::from_millis(500));

            loop {
                tokio::select! {
                    event = session.events.recv() => match event {
                        Some(SessionEvent::BlockAccepted { height, hash }) => {
                            self.counters.challenges_received.fetch_add(1, Ordering::Relaxed);
                            scan.cancel();
                            self.rotate_epoch(height, hash);
                            self.write_status();
                            scan = self.spawn_scan(session.outbound.clone());
                            self.set_state(MinerState::Mining);
                        }
                        None => {
                            scan.cancel();
                            let _ = scan.handle.await;
                            self.set_state(MinerState::Reconnecting);
                            break;
                        }
                    },
                    _ = stop_poll.tick() => {
                        let stop_file = self.config.stop_file_path();
                        if self.shutdown.load(Ordering::Relaxed) || stop_file.exists() {
                            scan.cancel();
                            let _ = scan.handle.await;
                            let _ = std::fs::remove_file(&stop_file);
                            self.set_state(MinerState::Stopped);
                            self.write_status();
                            return Ok(());
                        }
                        self.mempool.sweep_expired();
                    }
                }
            }
        }
    }

    async fn connect_with_retries(
        &self,
        connector: &impl NodeConnector,
    ) -> Result<Session, MinerError> {
        let interval = Duration::from_secs(self.config.connection_retry_interval_seconds);
        let mut last_error = String::new();
        for attempt in 0..=self.config.max_connection_retries {
            if self.shutdown.load(Ordering::Relaxed) {
                return Err(MinerError::Network("shutdown during connect".into()));
            }
            match connector.connect().await {
                Ok(session) => return Ok(session),
                Err(e) => {
                    last_error = e.to_string();
                    self.set_state(MinerState::Reconnecting);
                    eprintln!(
                        "[miner] connect attempt {}/{} failed: {}",
                        attempt + 1,
                        self.config.max_connection_retries + 1,
                        last_error
                    );
                    if attempt < self.config.max_connection_retries {
                        // Linear backoff: interval, 2x interval, 3x ...
                        tokio::time::sleep(interval * (attempt + 1)).await;
                    }
                }
            }
        }
        Err(MinerError::Network(format!(
            "giving up after {} attempts: {last_error}",
            self.config.max_connection_retries + 1
        )))
    }

    fn sync_epoch_from_chain(&self) {
        let snapshot = self.chain.chain_snapshot();
        let mut epoch = self.epoch.lock().unwrap_or_else(|e| e.into_inner());
        epoch.reset(
            snapshot.expected_epoch,
            snapshot.expected_challenge,
            snapshot.tip_hash.unwrap_or(GENESIS_PARENT),
            Instant::now(),
        );
    }

    fn rotate_epoch(&self, accepted_height: u64, accepted_hash: Hash) {
        let mut epoch = self.epoch.lock().unwrap_or_else(|e| e.into_inner());
        if accepted_height + 1 == epoch.current_epoch() + 1 {
            epoch.advance_epoch(accepted_hash);
        } else {
            // Missed events or a reorg rewound the chain; resynchronize.
            epoch.reset(
                accepted_height + 1,
                challenge_for(&accepted_hash, accepted_height + 1),
                accepted_hash,
                Instant::now(),
            );
        }
    }

    fn spawn_scan(&self, outbound: tokio::sync::mpsc::Sender<OutboundMessage>) -> ScanTask {
        let cancel = Arc::new(AtomicBool::new(false));
        let (challenge, epoch_no) = {
            let epoch = self.epoch.lock().unwrap_or_else(|e| e.into_inner());
            (epoch.current_challenge(), epoch.current_epoch())
        };

        let manager = self.manager.clone();
        let chain = self.chain.clone();
        let mempool = self.mempool.clone();
        let signer = self.signer.clone();
        let epoch_machine = self.epoch.clone();
        let counters = self.counters.clone();
        let state = self.state.clone();
        let strategy = self.strategy;
        let builder_config = self.builder_config;
        let timeout = Duration::from_secs(self.config.proof_generation_timeout_seconds);
        let perf_monitoring = self.config.enable_performance_monitoring;
        let task_cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            let started = Instant::now();
            let scan = manager.generate_proof(
                &challenge,
                strategy,
                ScanningConfig::default(),
                task_cancel.clone(),
            );
            let fleet = match tokio::time::timeout(timeout, scan).await {
                Err(_) => {
                    task_cancel.store(true, Ordering::Relaxed);
                    *state.lock().unwrap_or_else(|e| e.into_inner()) = MinerState::ProofTimeout;
                    eprintln!("[miner] epoch {epoch_no}: proof generation timed out");
                    return;
                }
                Ok(Err(ScanError::Cancelled)) => return,
                Ok(Err(e)) => {
                    eprintln!("[miner] epoch {epoch_no}: scan failed: {e}");
                    return;
                }
                Ok(Ok(fleet)) => fleet,
            };
            if perf_monitoring {
                eprintln!(
                    "[perf] epoch {epoch_no}: scanned {} leaves across {} plot(s) in {}ms",
                    fleet.leaves_scanned,
                    fleet.plots_scanned,
                    started.elapsed().as_millis()
                );
            }
            let Some((plot_id, proof)) = fleet.best else {
                return;
            };
            counters.proofs_generated.fetch_add(1, Ordering::Relaxed);

            // A newer epoch may have raced the scan to completion; results
            // for a superseded challenge are dropped on the floor.
            {
                let epoch = epoch_machine.lock().unwrap_or_else(|e| e.into_inner());
                if epoch.current_challenge() != proof.challenge || !epoch.accepts_proofs() {
                    return;
                }
            }

            let Some(plot) = manager.plot_handle(&plot_id) else {
                return;
            };
            let mut plot_id_bytes = [0u8; 32];
            plot_id_bytes[..16].copy_from_slice(plot_id.as_bytes());
            let block_proof = BlockProof {
                proof: proof.clone(),
                plot: BlockPlotMetadata {
                    leaf_count: plot.leaf_count(),
                    plot_id: plot_id_bytes,
                    plot_header_hash: plot.header().header_hash(),
                    version: 1,
                },
            };

            if outbound
                .send(OutboundMessage::ProofSubmission {
                    proof: block_proof.to_bytes(),
                    miner_id: signer.public_key(),
                    epoch: epoch_no,
                })
                .await
                .is_err()
            {
                return;
            }
            counters.proofs_submitted.fetch_add(1, Ordering::Relaxed);

            // Only a score under the target wins block authorship; lesser
            // proofs were still worth submitting for tracking.
            let difficulty = chain.next_difficulty();
            if !score_below(&proof.score, &target_for(difficulty)) {
                return;
            }

            let snapshot = chain.chain_snapshot();
            let params = BuildParams {
                parent_hash: snapshot.tip_hash.unwrap_or(GENESIS_PARENT),
                height: (snapshot.tip_height + 1) as u64,
                difficulty,
                epoch: epoch_no,
                challenge: proof.challenge,
                block_proof,
                timestamp: unix_now(),
                parent_timestamp: chain.tip_timestamp(),
                genesis: snapshot.tip_hash.is_none(),
            };
            match build_block(
                params,
                &mempool,
                chain.as_ref(),
                signer.as_ref(),
                &builder_config,
            ) {
                Ok(block) => {
                    let included: Vec<_> = block.transactions.iter().map(|tx| tx.hash()).collect();
                    if outbound
                        .send(OutboundMessage::BlockBroadcast {
                            block: block.to_bytes(),
                        })
                        .await
                        .is_ok()
                    {
                        mempool.remove_included(&included);
                        counters.blocks_won.fetch_add(1, Ordering::Relaxed);
                        eprintln!(
                            "[miner] epoch {epoch_no}: won block {} at height {}",
                            hex::encode(block.hash()),
                            block.header.height
                        );
                    }
                }
                Err(e) => eprintln!("[miner] epoch {epoch_no}: block assembly failed: {e}"),
            }
        });

        ScanTask { cancel, handle }
    }

    pub fn status_report(&self) -> StatusReport {
        let epoch = {
            let epoch = self.epoch.lock().unwrap_or_else(|e| e.into_inner());
            epoch.current_epoch()
        };
        StatusReport {
            state: self.state().name().to_string(),
            epoch,
            challenges_received: self.counters.challenges_received.load(Ordering::Relaxed),
            proofs_generated: self.counters.proofs_generated.load(Ordering::Relaxed),
            proofs_submitted: self.counters.proofs_submitted.load(Ordering::Relaxed),
            blocks_won: self.counters.blocks_won.load(Ordering::Relaxed),
            valid_plots: self.manager.valid_plot_count(),
            total_plot_bytes: self.manager.total_valid_bytes(),
        }
    }

    /// One status line per epoch plus the status file the CLI reads.
    fn write_status(&self) {
        let report = self.status_report();
        eprintln!(
            "[miner] status epoch={} state={} challenges={} proofs={} submitted={} won={}",
            report.epoch,
            report.state,
            report.challenges_received,
            report.proofs_generated,
            report.proofs_submitted,
            report.blocks_won
        );
        if let Ok(json) = serde_json::to_vec_pretty(&report) {
            if let Some(dir) = self.config.status_file_path().parent() {
                let _ = std::fs::create_dir_all(dir);
            }
            let _ = std::fs::write(self.config.status_file_path(), json);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::chain::{ChainConfig, ChainStore};
    use crate::crypto::keys::{MockSigner, Secp256k1Signer};
    use crate::mempool::MempoolConfig;
    use crate::node::kv::MemKv;
    use crate::node::session::ChannelConnector;

    fn test_config(dir: &std::path::Path) -> MinerConfig {
        let mut config = MinerConfig::default();
        config.plot_directory = dir.join("plots");
        config.plot_metadata_path = dir.join("plots/plots.json");
        config.connection_retry_interval_seconds = 1;
        config.max_connection_retries = 0;
        config
    }

    fn chain() -> Arc<ChainStore> {
        let config = ChainConfig {
            network_id: "testnet".to_string(),
            ..Default::default()
        };
        Arc::new(ChainStore::open(Arc::new(MemKv::new()), config).unwrap())
    }

    fn miner_with<S: Signer + 'static>(
        dir: &std::path::Path,
        signer: S,
    ) -> Miner<ChainStore, S> {
        let config = test_config(dir);
        let manager = Arc::new(PlotManager::new(config.plot_metadata_path.clone(), 2));
        Miner::new(
            config,
            manager,
            chain(),
            Arc::new(Mempool::new(MempoolConfig::default())),
            Arc::new(signer),
            Strategy::Full,
        )
    }

    #[tokio::test]
    async fn test_mock_signer_refused() {
        let dir = tempfile::tempdir().unwrap();
        let miner = miner_with(dir.path(), MockSigner);
        let (connector, _events, _outbound) = ChannelConnector::single();
        assert!(matches!(
            miner.run(&connector).await,
            Err(MinerError::MockSignerRefused)
        ));
    }

    #[tokio::test]
    async fn test_connect_retries_exhaust() {
        let dir = tempfile::tempdir().unwrap();
        let signer = Secp256k1Signer::from_secret_bytes(&[1u8; 32]).unwrap();
        let miner = miner_with(dir.path(), signer);
        let connector = ChannelConnector::new(vec![]);
        let started = Instant::now();
        assert!(matches!(
            miner.run(&connector).await,
            Err(MinerError::Network(_))
        ));
        // Zero retries: fail fast, no backoff sleep.
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_shutdown_flag_stops_loop() {
        let dir = tempfile::tempdir().unwrap();
        let signer = Secp256k1Signer::from_secret_bytes(&[1u8; 32]).unwrap();
        let miner = Arc::new(miner_with(dir.path(), signer));
        let (connector, _events, _outbound) = ChannelConnector::single();

        let shutdown = miner.shutdown_handle();
        let runner = {
            let miner = miner.clone();
            tokio::spawn(async move { miner.run(&connector).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.store(true, Ordering::Relaxed);

        let result = tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .expect("miner did not stop")
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(miner.state(), MinerState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_end_to_end_mining_loop() {
        use crate::node::session::LoopbackConnector;
        use crate::plot::file::{LEAF_BYTES, PlotCreateParams, create_unchecked};

        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let plot_dir = config.plot_directory.clone();
        std::fs::create_dir_all(&plot_dir).unwrap();
        for (name, seed) in [("a.plot", 1u8), ("b.plot", 2u8)] {
            let params = PlotCreateParams {
                size_bytes: 256 * LEAF_BYTES as u64,
                miner_key: [0x01u8; 32],
                seed: [seed; 32],
                output_path: plot_dir.join(name),
                cache_levels: Some(3),
                created_at: 1_700_000_000,
            };
            create_unchecked(&params, &mut |_| {}).unwrap();
        }

        let chain = chain();
        let manager = Arc::new(PlotManager::new(config.plot_metadata_path.clone(), 2));
        let signer = Secp256k1Signer::from_secret_bytes(&[9u8; 32]).unwrap();
        let miner = Arc::new(Miner::new(
            config,
            manager,
            chain.clone(),
            Arc::new(Mempool::new(MempoolConfig::default())),
            Arc::new(signer),
            Strategy::Full,
        ));
        let connector = LoopbackConnector::new(chain.clone());

        let shutdown = miner.shutdown_handle();
        let runner = {
            let miner = miner.clone();
            tokio::spawn(async move { miner.run(&connector).await })
        };

        // Initial scan mines genesis; each acceptance rotates the epoch
        // and mines the next block, closing the loop.
        let deadline = Instant::now() + Duration::from_secs(30);
        while chain.chain_snapshot().tip_height < 2 {
            assert!(Instant::now() < deadline, "mining loop made no progress");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        shutdown.store(true, Ordering::Relaxed);
        let _ = tokio::time::timeout(Duration::from_secs(5), runner).await;

        let snapshot = chain.chain_snapshot();
        assert!(snapshot.tip_height >= 2);
        assert!(miner.counters().blocks_won.load(Ordering::Relaxed) >= 3);
        assert!(miner.counters().proofs_submitted.load(Ordering::Relaxed) >= 3);
        // Every block on the chain carries a proof this store validated.
        let tip = snapshot.tip_hash.unwrap();
        let header = chain.header(&tip).unwrap().unwrap();
        assert_eq!(header.height as i64, snapshot.tip_height);
    }

    #[tokio::test]
    async fn test_stop_file_stops_loop() {
        let dir = tempfile::tempdir().unwrap();
        let signer = Secp256k1Signer::from_secret_bytes(&[1u8; 32]).unwrap();
        let miner = Arc::new(miner_with(dir.path(), signer));
        let stop_file = miner.config.stop_file_path();
        let (connector, _events, _outbound) = ChannelConnector::single();

        let runner = {
            let miner = miner.clone();
            tokio::spawn(async move { miner.run(&connector).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        std::fs::create_dir_all(stop_file.parent().unwrap()).unwrap();
        std::fs::write(&stop_file, b"").unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .expect("miner did not stop")
            .unwrap();
        assert!(result.is_ok());
        // The sentinel is consumed on shutdown.
        assert!(!stop_file.exists());
    }
}
