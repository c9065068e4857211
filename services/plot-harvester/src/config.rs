// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Harvester configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

/// Default config file name, relative to the working directory
pub const DEFAULT_CONFIG_FILE: &str = "harvester.json";

/// Default scheduler tick period (seconds)
const DEFAULT_TICK_INTERVAL_SECS: u64 = 60;

/// Default timeout for listing, probe and remove requests (seconds)
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Default maximum gap between download chunks (seconds)
const DEFAULT_DOWNLOAD_STALL_TIMEOUT_SECS: u64 = 300;

/// Default progress sampling period (milliseconds)
const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 1000;

/// Default number of validation attempts
const DEFAULT_VALIDATION_ATTEMPTS: u32 = 10;

/// Default delay before each validation attempt (seconds)
const DEFAULT_VALIDATION_DELAY_SECS: u64 = 5;

/// Harvester configuration loaded from a JSON file
///
/// Key names are camelCase. The names used by older harvester deployments
/// (`parentMount`, `farmers`) are accepted as aliases.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarvesterConfig {
    /// Directory whose subdirectories are the managed volumes
    #[serde(alias = "parentMount")]
    pub volumes_root: PathBuf,

    /// Farmer base URLs
    #[serde(alias = "farmers")]
    pub sources: Vec<String>,

    /// Volumes to leave alone (absolute, or relative to `volumes_root`)
    #[serde(default)]
    pub ignore_volumes: Vec<PathBuf>,

    /// Scheduler tick period in seconds
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,

    /// Timeout for listing, probe and remove requests in seconds
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,

    /// A download fails when no data arrives for this many seconds
    #[serde(default = "default_download_stall_timeout_secs")]
    pub download_stall_timeout_secs: u64,

    /// Progress sampling period in milliseconds
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,

    /// Eviction policy; `null` disables eviction entirely
    #[serde(default = "default_eviction")]
    pub eviction: Option<EvictionConfig>,

    /// Chia environment directory; enables plot validation when set
    #[serde(default)]
    pub chia_dir: Option<PathBuf>,

    /// Number of validation attempts before a plot is rejected
    #[serde(default = "default_validation_attempts")]
    pub validation_attempts: u32,

    /// Delay before each validation attempt in seconds
    #[serde(default = "default_validation_delay_secs")]
    pub validation_delay_secs: u64,
}

/// Eviction policy settings
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EvictionConfig {
    /// Class tag of plots that may be evicted
    pub primary_class: String,
    /// Class tag of plots whose presence vetoes eviction on a volume
    pub protected_class: String,
    /// Minimum number of primary plots a volume must hold to be considered
    pub min_primary_files: usize,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            primary_class: "k32".to_string(),
            protected_class: "k33".to_string(),
            min_primary_files: 2,
        }
    }
}

fn default_tick_interval_secs() -> u64 {
    DEFAULT_TICK_INTERVAL_SECS
}

fn default_http_timeout_secs() -> u64 {
    DEFAULT_HTTP_TIMEOUT_SECS
}

fn default_download_stall_timeout_secs() -> u64 {
    DEFAULT_DOWNLOAD_STALL_TIMEOUT_SECS
}

fn default_progress_interval_ms() -> u64 {
    DEFAULT_PROGRESS_INTERVAL_MS
}

fn default_eviction() -> Option<EvictionConfig> {
    Some(EvictionConfig::default())
}

fn default_validation_attempts() -> u32 {
    DEFAULT_VALIDATION_ATTEMPTS
}

fn default_validation_delay_secs() -> u64 {
    DEFAULT_VALIDATION_DELAY_SECS
}

impl HarvesterConfig {
    /// Build a configuration with defaults for everything but the volume
    /// root and the farmer list
    pub fn new(volumes_root: impl Into<PathBuf>, sources: Vec<String>) -> Self {
        Self {
            volumes_root: volumes_root.into(),
            sources,
            ignore_volumes: Vec::new(),
            tick_interval_secs: DEFAULT_TICK_INTERVAL_SECS,
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            download_stall_timeout_secs: DEFAULT_DOWNLOAD_STALL_TIMEOUT_SECS,
            progress_interval_ms: DEFAULT_PROGRESS_INTERVAL_MS,
            eviction: default_eviction(),
            chia_dir: None,
            validation_attempts: DEFAULT_VALIDATION_ATTEMPTS,
            validation_delay_secs: DEFAULT_VALIDATION_DELAY_SECS,
        }
    }

    /// Load and validate configuration from a JSON file
    pub async fn from_file(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;

        Ok(config)
    }

    /// Check values serde cannot check on its own
    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            bail!("at least one source is required");
        }

        for source in &self.sources {
            reqwest::Url::parse(source).with_context(|| format!("Invalid source URL: {source}"))?;
        }

        if self.tick_interval_secs == 0 {
            bail!("tickIntervalSecs must be positive");
        }

        if self.progress_interval_ms == 0 {
            bail!("progressIntervalMs must be positive");
        }

        if self.http_timeout_secs == 0 {
            bail!("httpTimeoutSecs must be positive");
        }

        if self.download_stall_timeout_secs == 0 {
            bail!("downloadStallTimeoutSecs must be positive");
        }

        if let Some(eviction) = &self.eviction {
            // The policy always evicts the two largest primary plots
            if eviction.min_primary_files < 2 {
                bail!("eviction.minPrimaryFiles must be at least 2");
            }
        }

        Ok(())
    }

    /// Resolve the exclusion list against the volume root
    pub fn ignored_volume_paths(&self) -> Vec<PathBuf> {
        self.ignore_volumes
            .iter()
            .map(|p| {
                if p.is_absolute() {
                    p.clone()
                } else {
                    self.volumes_root.join(p)
                }
            })
            .collect()
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn download_stall_timeout(&self) -> Duration {
        Duration::from_secs(self.download_stall_timeout_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn validation_delay(&self) -> Duration {
        Duration::from_secs(self.validation_delay_secs)
    }
}
