// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Transfer session
//!
//! Moves one plot from a farmer onto a reserved volume:
//!
//! 1. `Evicting`: delete the reservation's eviction victims (best effort)
//! 2. `Downloading`: stream into `<name>.tmp` next to the destination while a
//!    [`ProgressSampler`] watches the file grow
//! 3. `Verifying`: the file on disk must be exactly the probed size
//! 4. `Committed`: rename the temporary file into place
//!
//! Any failure removes both the temporary and the final file. The session
//! never releases the reservation; that is the caller's job.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use harvester_types::{TransferFailure, TransferPhase};

use crate::inventory::Reservation;
use crate::metrics;
use crate::progress::{ProgressSampler, ProgressState};
use crate::source::{SourceError, SourceTransport, TransferCandidate, is_plain_file_name};

/// Suffix of the file a plot is downloaded into before commit
pub const TEMP_SUFFIX: &str = ".tmp";

#[derive(Error, Debug)]
pub enum TransferError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("No data received for {plot} in {}s", .timeout.as_secs())]
    Stalled { plot: String, timeout: Duration },

    #[error("Size mismatch for {plot}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        plot: String,
        expected: u64,
        actual: u64,
    },

    #[error("Filesystem error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl TransferError {
    /// Failure reason reported in outcomes and the status API
    pub fn to_failure(&self) -> TransferFailure {
        match self {
            TransferError::Source(SourceError::Status { status, .. }) => {
                TransferFailure::HttpStatusCode(*status)
            }
            TransferError::Source(_) => TransferFailure::NetworkError,
            TransferError::Stalled { .. } => TransferFailure::Stalled,
            TransferError::SizeMismatch {
                expected, actual, ..
            } => TransferFailure::SizeMismatch {
                expected: *expected,
                actual: *actual,
            },
            TransferError::Io { .. } => TransferFailure::LocalFsError,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransferSettings {
    /// How often the temporary file is sampled for progress
    pub progress_interval: Duration,
    /// Longest wait for the next chunk before giving up
    pub stall_timeout: Duration,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            progress_interval: Duration::from_secs(1),
            stall_timeout: Duration::from_secs(300),
        }
    }
}

/// One plot transfer into one reserved volume.
#[derive(Debug)]
pub struct TransferSession<'a> {
    reservation: &'a Reservation,
    candidate: &'a TransferCandidate,
    progress: Arc<ProgressState>,
    settings: &'a TransferSettings,
    destination: PathBuf,
    temp_path: PathBuf,
}

impl<'a> TransferSession<'a> {
    pub fn new(
        reservation: &'a Reservation,
        candidate: &'a TransferCandidate,
        progress: Arc<ProgressState>,
        settings: &'a TransferSettings,
    ) -> Self {
        let destination = reservation.volume().join(&candidate.name);
        let temp_path = reservation
            .volume()
            .join(format!("{}{}", candidate.name, TEMP_SUFFIX));

        Self {
            reservation,
            candidate,
            progress,
            settings,
            destination,
            temp_path,
        }
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    /// Run the session to a terminal phase, returning the committed path
    pub async fn run(self, transport: &dyn SourceTransport) -> Result<PathBuf, TransferError> {
        // Nothing on disk is touched for a name that would leave the volume
        if !is_plain_file_name(&self.candidate.name) {
            self.progress.set_phase(TransferPhase::Failed);
            return Err(TransferError::Io {
                path: self.destination,
                source: io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{:?} is not a plain file name", self.candidate.name),
                ),
            });
        }

        match self.execute(transport).await {
            Ok(()) => {
                self.progress.set_phase(TransferPhase::Committed);
                info!(
                    plot = %self.candidate.name,
                    path = %self.destination.display(),
                    bytes = self.candidate.size,
                    "Plot committed"
                );
                Ok(self.destination)
            }
            Err(e) => {
                self.progress.set_phase(TransferPhase::Failed);
                self.discard().await;
                Err(e)
            }
        }
    }

    async fn execute(&self, transport: &dyn SourceTransport) -> Result<(), TransferError> {
        if !self.reservation.evictions().is_empty() {
            self.progress.set_phase(TransferPhase::Evicting);
            self.evict().await;
        }

        for path in [&self.destination, &self.temp_path] {
            if remove_if_exists(path).await.map_err(|source| TransferError::Io {
                path: path.clone(),
                source,
            })? {
                debug!(path = %path.display(), "Removed stale file");
            }
        }

        self.progress.set_phase(TransferPhase::Downloading);
        let sampler = ProgressSampler::start(
            self.temp_path.clone(),
            self.settings.progress_interval,
            Arc::clone(&self.progress),
        );
        let downloaded = self.download(transport).await;
        sampler.stop().await;
        let written = downloaded?;

        self.progress.set_phase(TransferPhase::Verifying);
        let actual = fs::metadata(&self.temp_path)
            .await
            .map_err(|source| TransferError::Io {
                path: self.temp_path.clone(),
                source,
            })?
            .len();
        self.progress.record(actual);

        if actual != self.candidate.size || written != self.candidate.size {
            return Err(TransferError::SizeMismatch {
                plot: self.candidate.name.clone(),
                expected: self.candidate.size,
                actual,
            });
        }

        fs::rename(&self.temp_path, &self.destination)
            .await
            .map_err(|source| TransferError::Io {
                path: self.destination.clone(),
                source,
            })
    }

    /// Stream the plot into the temporary file, returning bytes written
    async fn download(&self, transport: &dyn SourceTransport) -> Result<u64, TransferError> {
        let stalled = || TransferError::Stalled {
            plot: self.candidate.name.clone(),
            timeout: self.settings.stall_timeout,
        };
        let io_err = |source: io::Error| TransferError::Io {
            path: self.temp_path.clone(),
            source,
        };

        let mut stream =
            tokio::time::timeout(self.settings.stall_timeout, transport.fetch(&self.candidate.name))
                .await
                .map_err(|_| stalled())??;

        let mut file = File::create(&self.temp_path).await.map_err(io_err)?;
        let mut written: u64 = 0;

        loop {
            let next = tokio::time::timeout(self.settings.stall_timeout, stream.next())
                .await
                .map_err(|_| stalled())?;
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk?;
            file.write_all(&chunk).await.map_err(io_err)?;
            written += chunk.len() as u64;
        }

        file.flush().await.map_err(io_err)?;
        file.sync_all().await.map_err(io_err)?;
        Ok(written)
    }

    async fn evict(&self) {
        for victim in self.reservation.evictions() {
            match fs::remove_file(&victim.path).await {
                Ok(()) => {
                    metrics::record_eviction();
                    info!(
                        path = %victim.path.display(),
                        size = victim.size,
                        "Evicted plot"
                    );
                }
                Err(e) => {
                    warn!(path = %victim.path.display(), error = %e, "Failed to evict plot");
                }
            }
        }
    }

    /// Remove everything this session may have left behind
    async fn discard(&self) {
        for path in [&self.temp_path, &self.destination] {
            if let Err(e) = remove_if_exists(path).await {
                metrics::record_cleanup_failure();
                warn!(path = %path.display(), error = %e, "Failed to remove partial file");
            }
        }
    }
}

/// Delete a file, treating a missing file as success.
/// Returns whether something was deleted.
async fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
