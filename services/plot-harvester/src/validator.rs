// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Post-commit plot validation
//!
//! A committed plot is only final once the farming tool agrees it is a single
//! valid plot. The check is retried with a fixed delay because the tool may
//! not see a freshly written file straight away.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, error, warn};

#[derive(Error, Debug)]
pub enum ValidatorError {
    #[error("Failed to run chia in {dir}: {source}")]
    Spawn {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("chia {command} exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{plot} not accepted after {attempts} attempts")]
    Exhausted { plot: PathBuf, attempts: u32 },
}

/// External check for committed plots.
#[async_trait]
pub trait PlotValidator: Send + Sync + fmt::Debug {
    /// Number of valid plots the tool finds at `plot`
    async fn check(&self, plot: &Path) -> Result<u32, ValidatorError>;

    /// Make the farming tool aware of a volume
    async fn register_volume(&self, _volume: &Path) -> Result<(), ValidatorError> {
        Ok(())
    }
}

// The pattern is a constant; failing to compile it is a programming error
#[allow(clippy::expect_used)]
mod patterns {
    use lazy_static::lazy_static;
    use regex::Regex;

    lazy_static! {
        pub static ref VALID_PLOTS: Regex =
            Regex::new(r"Found\s(\d+)\svalid\splots").expect("valid regex");
    }
}

/// Extract the count from `plots check` output
pub fn parse_valid_count(output: &str) -> Option<u32> {
    patterns::VALID_PLOTS
        .captures(output)?
        .get(1)?
        .as_str()
        .parse()
        .ok()
}

/// The `chia` command line, run inside its virtualenv.
#[derive(Debug, Clone)]
pub struct ChiaCli {
    chia_dir: PathBuf,
}

impl ChiaCli {
    pub fn new(chia_dir: impl Into<PathBuf>) -> Self {
        Self {
            chia_dir: chia_dir.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<Output, ValidatorError> {
        debug!(args = ?args, "Running chia");

        // Arguments are passed positionally so paths never need quoting
        Command::new("bash")
            .arg("-c")
            .arg(r#". ./activate && chia "$@""#)
            .arg("bash")
            .args(args)
            .current_dir(&self.chia_dir)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ValidatorError::Spawn {
                dir: self.chia_dir.clone(),
                source,
            })
    }
}

#[async_trait]
impl PlotValidator for ChiaCli {
    async fn check(&self, plot: &Path) -> Result<u32, ValidatorError> {
        let plot = plot.to_string_lossy();
        let output = self.run(&["plots", "check", "-g", &*plot]).await?;

        // chia logs its summary to stderr
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        if let Some(count) = parse_valid_count(&stderr).or_else(|| parse_valid_count(&stdout)) {
            return Ok(count);
        }

        if output.status.success() {
            Ok(0)
        } else {
            Err(ValidatorError::Failed {
                command: "plots check".to_string(),
                status: output.status,
                stderr: stderr.trim().to_string(),
            })
        }
    }

    async fn register_volume(&self, volume: &Path) -> Result<(), ValidatorError> {
        let volume = volume.to_string_lossy();
        let output = self.run(&["plots", "add", "-d", &*volume]).await?;

        if output.status.success() {
            Ok(())
        } else {
            Err(ValidatorError::Failed {
                command: "plots add".to_string(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

/// Attempts and delay for validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationPolicy {
    pub attempts: u32,
    /// Wait before every attempt, including the first
    pub delay: Duration,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            delay: Duration::from_secs(5),
        }
    }
}

impl ValidationPolicy {
    /// Check `plot` until the validator reports exactly one valid plot.
    ///
    /// Zero means "not yet", more than one is an anomaly; both are retried.
    /// Tool errors count as failed attempts.
    pub async fn validate(
        &self,
        validator: &dyn PlotValidator,
        plot: &Path,
    ) -> Result<(), ValidationError> {
        for attempt in 1..=self.attempts {
            tokio::time::sleep(self.delay).await;

            match validator.check(plot).await {
                Ok(1) => return Ok(()),
                Ok(0) => {
                    debug!(plot = %plot.display(), attempt, "Plot not valid yet");
                }
                Ok(count) => {
                    error!(
                        plot = %plot.display(),
                        attempt,
                        count,
                        "Validator reported more than one valid plot"
                    );
                }
                Err(e) => {
                    warn!(plot = %plot.display(), attempt, error = %e, "Validator failed");
                }
            }
        }

        Err(ValidationError::Exhausted {
            plot: plot.to_path_buf(),
            attempts: self.attempts,
        })
    }
}

/// A validator together with its retry policy
#[derive(Debug, Clone)]
pub struct Validation {
    pub validator: Arc<dyn PlotValidator>,
    pub policy: ValidationPolicy,
}

impl Validation {
    pub fn new(validator: Arc<dyn PlotValidator>, policy: ValidationPolicy) -> Self {
        Self { validator, policy }
    }

    pub async fn validate(&self, plot: &Path) -> Result<(), ValidationError> {
        self.policy.validate(self.validator.as_ref(), plot).await
    }
}
