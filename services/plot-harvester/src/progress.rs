// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Transfer progress tracking
//!
//! A [`ProgressState`] is shared between a transfer session and whoever wants
//! to observe it (the status API). While bytes are streaming, a
//! [`ProgressSampler`] polls the size of the temporary file on a fixed
//! interval and records it. Sampling is observability only; it never decides
//! whether a transfer lives or dies.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use harvester_types::{TransferPhase, TransferProgress};

/// Observable state of one transfer session
#[derive(Debug)]
pub struct ProgressState {
    plot: String,
    volume: String,
    expected_bytes: u64,
    transferred_bytes: AtomicU64,
    phase: Mutex<TransferPhase>,
    sampling: AtomicBool,
    sampler_stops: AtomicU32,
}

impl ProgressState {
    pub fn new(plot: impl Into<String>, volume: impl Into<String>, expected_bytes: u64) -> Self {
        Self {
            plot: plot.into(),
            volume: volume.into(),
            expected_bytes,
            transferred_bytes: AtomicU64::new(0),
            phase: Mutex::new(TransferPhase::Pending),
            sampling: AtomicBool::new(false),
            sampler_stops: AtomicU32::new(0),
        }
    }

    pub fn phase(&self) -> TransferPhase {
        *self.phase.lock()
    }

    pub fn set_phase(&self, phase: TransferPhase) {
        *self.phase.lock() = phase;
    }

    pub fn record(&self, bytes: u64) {
        self.transferred_bytes.store(bytes, Ordering::Relaxed);
    }

    pub fn transferred_bytes(&self) -> u64 {
        self.transferred_bytes.load(Ordering::Relaxed)
    }

    pub fn expected_bytes(&self) -> u64 {
        self.expected_bytes
    }

    /// Completion as a percentage, capped at 100
    pub fn percent(&self) -> f64 {
        if self.expected_bytes == 0 {
            return 100.0;
        }
        let pct = self.transferred_bytes() as f64 * 100.0 / self.expected_bytes as f64;
        pct.min(100.0)
    }

    /// Whether a sampler is currently running for this session
    pub fn is_sampling(&self) -> bool {
        self.sampling.load(Ordering::Acquire)
    }

    /// How many times a sampler has been stopped for this session
    pub fn sampler_stops(&self) -> u32 {
        self.sampler_stops.load(Ordering::Acquire)
    }

    pub fn to_progress(&self) -> TransferProgress {
        TransferProgress {
            plot: self.plot.clone(),
            volume: self.volume.clone(),
            phase: self.phase(),
            expected_bytes: self.expected_bytes,
            transferred_bytes: self.transferred_bytes(),
            percent: self.percent(),
        }
    }
}

/// Background task sampling the size of a file while it is written.
///
/// [`stop`](Self::stop) consumes the sampler and waits for the task to finish,
/// so a sampler can only be stopped once. Dropping a sampler that was never
/// stopped aborts its task.
#[derive(Debug)]
pub struct ProgressSampler {
    stop_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
    state: Arc<ProgressState>,
    path: PathBuf,
}

impl ProgressSampler {
    /// Start sampling `path` every `interval`, recording into `state`
    pub fn start(path: PathBuf, interval: Duration, state: Arc<ProgressState>) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        state.sampling.store(true, Ordering::Release);

        let task_state = Arc::clone(&state);
        let task_path = path.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        // The file may not exist for the first few samples
                        if let Ok(meta) = tokio::fs::metadata(&task_path).await {
                            task_state.record(meta.len());
                            debug!(
                                plot = %task_state.plot,
                                percent = format_args!("{:.1}", task_state.percent()),
                                "Transfer progress"
                            );
                        }
                    }
                }
            }
        });

        Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
            state,
            path,
        }
    }

    /// Stop sampling, take one final sample and return it
    pub async fn stop(mut self) -> u64 {
        if let Some(tx) = self.stop_tx.take() {
            // The task may already be gone; nothing to signal then
            let _ = tx.send(());
        }

        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(path = %self.path.display(), error = %e, "Progress sampler task failed");
            }
        }

        if let Ok(meta) = tokio::fs::metadata(&self.path).await {
            self.state.record(meta.len());
        }

        self.state.sampling.store(false, Ordering::Release);
        self.state.sampler_stops.fetch_add(1, Ordering::AcqRel);
        self.state.transferred_bytes()
    }
}

impl Drop for ProgressSampler {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            self.state.sampling.store(false, Ordering::Release);
        }
    }
}
