// Miner Configuration
//
// JSON config file with environment overrides. Unknown keys are rejected
// rather than silently ignored; a typo in a config file should fail loud
// at boot, not at 3am. Environment variables use the
// SPACETIME_MINER_<UPPER_SNAKE> convention and win over the file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MinerConfig {
    pub plot_directory: PathBuf,
    pub plot_metadata_path: PathBuf,
    pub node_address: String,
    pub node_port: u16,
    pub private_key_path: PathBuf,
    pub network_id: String,
    pub max_concurrent_proofs: usize,
    pub proof_generation_timeout_seconds: u64,
    pub connection_retry_interval_seconds: u64,
    pub max_connection_retries: u32,
    /// Emit a per-scan `[perf]` line (leaves scanned, plots, wall time).
    pub enable_performance_monitoring: bool,
}

impl Default for MinerConfig {
    fn default() -> Self {
        MinerConfig {
            plot_directory: PathBuf::from("plots"),
            plot_metadata_path: PathBuf::from("plots/plots.json"),
            node_address: "127.0.0.1".to_string(),
            node_port: 7744,
            private_key_path: PathBuf::from("miner.key"),
            network_id: "mainnet".to_string(),
            max_concurrent_proofs: 4,
            proof_generation_timeout_seconds: 30,
            connection_retry_interval_seconds: 5,
            max_connection_retries: 10,
            enable_performance_monitoring: false,
        }
    }
}

impl MinerConfig {
    /// Loads the config file (defaults when `path` is None), applies
    /// environment overrides, and validates the result.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read(path)?;
                serde_json::from_slice(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?
            }
            None => MinerConfig::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        fn var(name: &str) -> Option<String> {
            std::env::var(format!("SPACETIME_MINER_{name}")).ok()
        }
        fn parsed<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
            match var(name) {
                None => Ok(None),
                Some(raw) => raw.parse().map(Some).map_err(|_| {
                    ConfigError::Invalid(format!("SPACETIME_MINER_{name}: cannot parse {raw:?}"))
                }),
            }
        }

        if let Some(v) = var("PLOT_DIRECTORY") {
            self.plot_directory = PathBuf::from(v);
        }
        if let Some(v) = var("PLOT_METADATA_PATH") {
            self.plot_metadata_path = PathBuf::from(v);
        }
        if let Some(v) = var("NODE_ADDRESS") {
            self.node_address = v;
        }
        if let Some(v) = parsed("NODE_PORT")? {
            self.node_port = v;
        }
        if let Some(v) = var("PRIVATE_KEY_PATH") {
            self.private_key_path = PathBuf::from(v);
        }
        if let Some(v) = var("NETWORK_ID") {
            self.network_id = v;
        }
        if let Some(v) = parsed("MAX_CONCURRENT_PROOFS")? {
            self.max_concurrent_proofs = v;
        }
        if let Some(v) = parsed("PROOF_GENERATION_TIMEOUT_SECONDS")? {
            self.proof_generation_timeout_seconds = v;
        }
        if let Some(v) = parsed("CONNECTION_RETRY_INTERVAL_SECONDS")? {
            self.connection_retry_interval_seconds = v;
        }
        if let Some(v) = parsed("MAX_CONNECTION_RETRIES")? {
            self.max_connection_retries = v;
        }
        if let Some(v) = parsed("ENABLE_PERFORMANCE_MONITORING")? {
            self.enable_performance_monitoring = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_proofs < 1 {
            return Err(ConfigError::Invalid(
                "max_concurrent_proofs must be at least 1".into(),
            ));
        }
        if self.proof_generation_timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "proof_generation_timeout_seconds must be positive".into(),
            ));
        }
        if self.connection_retry_interval_seconds == 0 {
            return Err(ConfigError::Invalid(
                "connection_retry_interval_seconds must be positive".into(),
            ));
        }
        if self.network_id.is_empty() {
            return Err(ConfigError::Invalid("network_id must not be empty".into()));
        }
        Ok(())
    }

    fn runtime_dir(&self) -> PathBuf {
        self.plot_metadata_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Written by the running miner once per epoch; read by `status`.
    pub fn status_file_path(&self) -> PathBuf {
        self.runtime_dir().join("miner-status.json")
    }

    /// Sentinel file polled by the running miner; created by `stop`.
    pub fn stop_file_path(&self) -> PathBuf {
        self.runtime_dir().join("miner.stop")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        MinerConfig::default().validate().unwrap();
    }

    #[test]
    fn test_load_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("miner.json");
        std::fs::write(
            &path,
            r#"{"network_id": "testnet", "node_port": 9001, "max_concurrent_proofs": 2}"#,
        )
        .unwrap();

        let config = MinerConfig::load(Some(&path)).unwrap();
        assert_eq!(config.network_id, "testnet");
        assert_eq!(config.node_port, 9001);
        assert_eq!(config.max_concurrent_proofs, 2);
        // Untouched fields keep their defaults.
        assert_eq!(config.connection_retry_interval_seconds, 5);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("miner.json");
        std::fs::write(&path, r#"{"network_id": "testnet", "plot_dir": "x"}"#).unwrap();
        assert!(matches!(
            MinerConfig::load(Some(&path)),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = MinerConfig::default();
        config.max_concurrent_proofs = 0;
        assert!(config.validate().is_err());

        let mut config = MinerConfig::default();
        config.proof_generation_timeout_seconds = 0;
        assert!(config.validate().is_err());

        let mut config = MinerConfig::default();
        config.network_id.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        // Single test touching the process environment; set_var is unsafe
        // under edition 2024 because of concurrent readers.
        unsafe {
            std::env::set_var("SPACETIME_MINER_NETWORK_ID", "devnet");
            std::env::set_var("SPACETIME_MINER_NODE_PORT", "8001");
            std::env::set_var("SPACETIME_MINER_ENABLE_PERFORMANCE_MONITORING", "true");
        }
        let config = MinerConfig::load(None).unwrap();
        unsafe {
            std::env::remove_var("SPACETIME_MINER_NETWORK_ID");
            std::env::remove_var("SPACETIME_MINER_NODE_PORT");
            std::env::remove_var("SPACETIME_MINER_ENABLE_PERFORMANCE_MONITORING");
        }
        assert_eq!(config.network_id, "devnet");
        assert_eq!(config.node_port, 8001);
        assert!(config.enable_performance_monitoring);
    }

    #[test]
    fn test_runtime_file_conventions() {
        let mut config = MinerConfig::default();
        config.plot_metadata_path = PathBuf::from("/data/plots/plots.json");
        assert_eq!(
            config.status_file_path(),
            PathBuf::from("/data/plots/miner-status.json")
        );
        assert_eq!(
            config.stop_file_path(),
            PathBuf::from("/data/plots/miner.stop")
        );
    }
}
