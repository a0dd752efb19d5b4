//! Configuration management for cluster-backup.
//!
//! Loads configuration from a TOML file; command-line flags override it.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::fs::walker::{default_exclude_dirs, default_exclude_files, WalkOptions};
use crate::server::PsqlSettings;
use crate::session::{BackupMode, BackupOptions};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub server: PsqlSettings,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Data directory of the cluster
    #[serde(default)]
    pub pgdata: Option<PathBuf>,

    /// Directory the server archives WAL segments into
    #[serde(default)]
    pub arclog_path: Option<PathBuf>,

    /// Directories whose contents are never copied
    #[serde(default = "default_exclude_dirs")]
    pub exclude_dirs: Vec<String>,

    /// Files that are never copied
    #[serde(default = "default_exclude_files")]
    pub exclude_files: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Root of the backup catalog
    #[serde(default)]
    pub backup_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// full or page
    #[serde(default)]
    pub mode: Option<BackupMode>,

    /// Wait for a regular checkpoint instead of forcing one
    #[serde(default)]
    pub smooth_checkpoint: bool,

    #[serde(default)]
    pub compress: bool,

    /// Compression level (1-22 for zstd)
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_compression_level() -> i32 {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            pgdata: None,
            arclog_path: None,
            exclude_dirs: default_exclude_dirs(),
            exclude_files: default_exclude_files(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            mode: None,
            smooth_checkpoint: false,
            compress: false,
            compression_level: default_compression_level(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Session options described by this configuration.
    pub fn backup_options(&self) -> BackupOptions {
        BackupOptions {
            pgdata: self.cluster.pgdata.clone(),
            arclog_path: self.cluster.arclog_path.clone(),
            backup_path: self.catalog.backup_path.clone(),
            mode: self.backup.mode,
            smooth_checkpoint: self.backup.smooth_checkpoint,
            compress: self.backup.compress,
            walk: WalkOptions {
                follow_links: true,
                exclude_dirs: self.cluster.exclude_dirs.clone(),
                exclude_files: self.cluster.exclude_files.clone(),
            },
        }
    }
}
