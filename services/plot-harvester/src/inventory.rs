// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Local volume inventory
//!
//! Tracks the volumes under the configured root, their free space and the
//! plots already harvested onto them, and hands out exclusive
//! [`Reservation`]s sized for incoming plots.
//!
//! Reservation sizes are tracked explicitly: granting a reservation debits
//! the volume's cached free space immediately, and a rescan that sees a
//! volume still under reservation subtracts the full reserved size from what
//! the disk reports. A volume released between rescans therefore keeps the
//! debited figure until the next rescan measures the real one.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use harvester_types::VolumeStatus;

use crate::eviction::{EvictionPolicy, classify_plot_name};

/// Extension of harvested plot files
pub const PLOT_EXTENSION: &str = "plot";

#[derive(Error, Debug)]
pub enum InventoryError {
    #[error("Failed to scan volume root {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Source of free-space figures for a volume.
pub trait SpaceProbe: Send + Sync + fmt::Debug {
    /// Bytes available to an unprivileged writer on the filesystem holding `path`
    fn available_bytes(&self, path: &Path) -> io::Result<u64>;
}

/// Free space from `statvfs` (or the platform equivalent).
#[derive(Debug, Default, Clone, Copy)]
pub struct StatvfsProbe;

impl SpaceProbe for StatvfsProbe {
    fn available_bytes(&self, path: &Path) -> io::Result<u64> {
        fs4::available_space(path)
    }
}

/// A plot already harvested onto a volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarvestedFile {
    /// Absolute path of the plot
    pub path: PathBuf,
    /// Size in bytes at the last scan
    pub size: u64,
    /// Class tag parsed from the file name
    pub class: Option<String>,
}

impl HarvestedFile {
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// One local storage location
#[derive(Debug, Clone)]
pub struct Volume {
    /// Absolute path of the volume directory
    pub path: PathBuf,
    /// Bytes available, as of the last scan minus live reservations
    pub available_bytes: u64,
    /// Harvested plots on the volume
    pub files: Vec<HarvestedFile>,
}

#[derive(Debug, Default)]
struct InventoryState {
    /// Volumes in scan order
    volumes: Vec<Volume>,
    /// Live reservations: volume path -> reserved bytes
    reserved: HashMap<PathBuf, u64>,
}

/// Inventory of local volumes and the reservations held against them.
#[derive(Debug)]
pub struct VolumeInventory {
    root: PathBuf,
    ignore: Vec<PathBuf>,
    policy: Arc<dyn EvictionPolicy>,
    probe: Arc<dyn SpaceProbe>,
    state: Arc<Mutex<InventoryState>>,
}

impl VolumeInventory {
    /// Create an inventory over the subdirectories of `root`
    ///
    /// The inventory is empty until the first [`refresh`](Self::refresh).
    pub fn new(
        root: impl Into<PathBuf>,
        ignore: Vec<PathBuf>,
        policy: Arc<dyn EvictionPolicy>,
    ) -> Self {
        Self {
            root: root.into(),
            ignore,
            policy,
            probe: Arc::new(StatvfsProbe),
            state: Arc::new(Mutex::new(InventoryState::default())),
        }
    }

    /// Replace the free-space source
    pub fn with_space_probe(mut self, probe: Arc<dyn SpaceProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Rescan the volume root.
    ///
    /// Lists the root's subdirectories in lexicographic order, drops the ones
    /// on the exclusion list, and measures free space and harvested plots for
    /// the rest. A volume that can't be measured is left out of this scan.
    /// Reservations are untouched. Returns the number of volumes found.
    pub async fn refresh(&self) -> Result<usize, InventoryError> {
        let io_err = |source: io::Error| InventoryError::Io {
            path: self.root.clone(),
            source,
        };

        let mut dirs = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await.map_err(io_err)?;
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let path = entry.path();
            match entry.file_type().await {
                Ok(ft) if ft.is_dir() => dirs.push(path),
                Ok(_) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to stat entry"),
            }
        }
        dirs.sort();

        let mut scanned = Vec::with_capacity(dirs.len());
        for path in dirs {
            if self.ignore.iter().any(|ignored| ignored == &path) {
                debug!(volume = %path.display(), "Ignoring excluded volume");
                continue;
            }

            let available_bytes = match self.probe.available_bytes(&path) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(volume = %path.display(), error = %e, "Failed to query free space");
                    continue;
                }
            };

            let files = match scan_plots(&path).await {
                Ok(files) => files,
                Err(e) => {
                    warn!(volume = %path.display(), error = %e, "Failed to list plots");
                    continue;
                }
            };

            scanned.push(Volume {
                path,
                available_bytes,
                files,
            });
        }

        let mut state = self.state.lock();
        for volume in &mut scanned {
            if let Some(reserved) = state.reserved.get(&volume.path) {
                volume.available_bytes = volume.available_bytes.saturating_sub(*reserved);
            }
        }
        let count = scanned.len();
        state.volumes = scanned;

        debug!(root = %self.root.display(), volumes = count, "Refreshed volume inventory");
        Ok(count)
    }

    /// Claim a volume with room for `size` bytes.
    ///
    /// The first unreserved volume (in scan order) with more than `size`
    /// bytes available wins outright. Failing that, the first unreserved
    /// volume the eviction policy can make room on wins, and the reservation
    /// carries the plots to delete. Returns `None` when neither works.
    pub fn reserve(&self, size: u64) -> Option<Reservation> {
        let mut state = self.state.lock();
        let InventoryState { volumes, reserved } = &mut *state;

        let direct = volumes
            .iter()
            .position(|v| !reserved.contains_key(&v.path) && v.available_bytes > size);

        let (idx, evictions) = match direct {
            Some(idx) => (idx, Vec::new()),
            None => volumes.iter().enumerate().find_map(|(idx, v)| {
                if reserved.contains_key(&v.path) {
                    return None;
                }
                self.policy.select(size, v).map(|victims| (idx, victims))
            })?,
        };

        let volume = &mut volumes[idx];
        let reclaimed: u64 = evictions.iter().map(|f| f.size).sum();
        volume.available_bytes = volume
            .available_bytes
            .saturating_add(reclaimed)
            .saturating_sub(size);
        volume.files.retain(|f| !evictions.contains(f));
        reserved.insert(volume.path.clone(), size);

        if evictions.is_empty() {
            debug!(volume = %volume.path.display(), size, "Reserved volume");
        } else {
            info!(
                volume = %volume.path.display(),
                size,
                evict = ?evictions.iter().map(HarvestedFile::name).collect::<Vec<_>>(),
                "Reserved volume with eviction"
            );
        }

        Some(Reservation {
            volume: volume.path.clone(),
            size,
            evictions,
            state: Arc::clone(&self.state),
            released: AtomicBool::new(false),
        })
    }

    /// Release a reservation. Same as [`Reservation::release`].
    pub fn release(&self, reservation: &Reservation) {
        reservation.release();
    }

    /// Volumes as of the last scan, with reservation debits applied
    pub fn volumes(&self) -> Vec<Volume> {
        self.state.lock().volumes.clone()
    }

    /// Number of reservations currently held
    pub fn live_reservations(&self) -> usize {
        self.state.lock().reserved.len()
    }

    /// Whether a reservation currently holds the volume at `path`
    pub fn is_reserved(&self, path: &Path) -> bool {
        self.state.lock().reserved.contains_key(path)
    }

    /// Volume status for the status API
    pub fn snapshot(&self) -> Vec<VolumeStatus> {
        let state = self.state.lock();
        state
            .volumes
            .iter()
            .map(|v| VolumeStatus {
                path: v.path.display().to_string(),
                available_bytes: v.available_bytes,
                reserved: state.reserved.contains_key(&v.path),
                plot_count: v.files.len(),
            })
            .collect()
    }
}

/// List harvested plots directly inside a volume
async fn scan_plots(volume: &Path) -> io::Result<Vec<HarvestedFile>> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(volume).await?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(PLOT_EXTENSION) {
            continue;
        }

        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }

        let class = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(classify_plot_name);

        files.push(HarvestedFile {
            path,
            size: metadata.len(),
            class,
        });
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

/// An exclusive claim on one volume, sized for one transfer.
///
/// Releasing is idempotent, and dropping an unreleased reservation releases
/// it.
#[derive(Debug)]
pub struct Reservation {
    volume: PathBuf,
    size: u64,
    evictions: Vec<HarvestedFile>,
    state: Arc<Mutex<InventoryState>>,
    released: AtomicBool,
}

impl Reservation {
    /// The claimed volume
    pub fn volume(&self) -> &Path {
        &self.volume
    }

    /// Bytes the reservation was sized for
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Plots that must be deleted before writing
    pub fn evictions(&self) -> &[HarvestedFile] {
        &self.evictions
    }

    /// Give the volume back. Returns `false` if already released.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }

        self.state.lock().reserved.remove(&self.volume);
        debug!(volume = %self.volume.display(), "Released volume");
        true
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.release();
    }
}
