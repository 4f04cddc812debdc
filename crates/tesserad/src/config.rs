//! TOML configuration for `tesserad`.
//!
//! When no config file is provided, [`CliConfig::auto_detect`] probes the
//! system (RAM via `/proc/meminfo`) and sizes the caches accordingly.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;
use tessera_types::{ChunkerConfig, EngineConfig, GcConfig, StoreConfig};

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Key-value backend.
    pub storage: StorageSection,
    /// Namespace and payload limits.
    pub engine: EngineSection,
    /// Content-defined chunking parameters.
    pub chunking: ChunkerConfig,
    /// Content store settings.
    pub store: StoreConfig,
    /// Sweep and audit settings.
    pub gc: GcConfig,
    /// Logging configuration.
    pub log: LogSection,
}

/// `[storage]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// Backend type: `"fjall"` (default) or `"memory"`.
    pub backend: String,
    /// Directory holding the Fjall keyspace.
    pub data_dir: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        let data_dir = dirs::home_dir()
            .map(|h| h.join(".tessera"))
            .unwrap_or_else(|| PathBuf::from(".tessera"));
        Self {
            backend: "fjall".to_string(),
            data_dir,
        }
    }
}

/// `[engine]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// Namespace prepended to every key.
    pub key_prefix: String,
    /// Largest accepted payload in bytes.
    pub max_payload_size: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        let defaults = EngineConfig::default();
        Self {
            key_prefix: defaults.key_prefix,
            max_payload_size: defaults.max_payload_size,
        }
    }
}

/// `[log]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log level filter (e.g. `"info"`, `"debug"`, `"warn"`).
    pub level: String,
    /// Colour the console output.
    pub ansi: bool,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            ansi: true,
        }
    }
}

impl CliConfig {
    /// Load config from a TOML file, or auto-detect if no path given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)
                    .with_context(|| format!("failed to read {}", p.display()))?;
                let config: CliConfig = toml::from_str(&content)?;
                Ok(config)
            }
            None => Ok(Self::auto_detect()),
        }
    }

    /// Parse config from a TOML string (used in tests).
    #[cfg(test)]
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Build a config with hardware-adaptive defaults.
    ///
    /// Probes system RAM and sizes the verified-hash cache and sweep batch:
    /// - < 1 GB RAM → small profile (4 K cached hashes, batches of 100)
    /// - 1–16 GB    → default profile
    /// - > 16 GB    → large profile (1 M cached hashes, batches of 10 000)
    pub fn auto_detect() -> Self {
        let mut config = Self::default();

        if let Some(ram) = detect_total_ram() {
            if ram < 1_073_741_824 {
                config.store.verified_cache_capacity = 4_096;
                config.gc.batch_size = 100;
            } else if ram > 17_179_869_184 {
                config.store.verified_cache_capacity = 1_048_576;
                config.gc.batch_size = 10_000;
            }
        }

        config
    }

    /// Whether the key-value store lives only in this process.
    pub fn is_memory(&self) -> bool {
        self.storage.backend == "memory"
    }

    /// Assemble and validate the engine configuration.
    pub fn engine_config(&self) -> anyhow::Result<EngineConfig> {
        let config = EngineConfig {
            key_prefix: self.engine.key_prefix.clone(),
            max_payload_size: self.engine.max_payload_size,
            chunking: self.chunking,
            store: self.store,
            gc: self.gc,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Detect total system RAM in bytes by reading `/proc/meminfo`.
///
/// Returns `None` on non-Linux platforms or if the file cannot be read.
fn detect_total_ram() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            let kb_str = rest.split_whitespace().next()?;
            let kb: u64 = kb_str.parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}
