// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Shared types for the plot harvester service and its status API.
//!
//! These types describe the observable state of the harvester: the local
//! volumes it fills, the remote farmers it pulls plots from, and the progress
//! of transfers in flight.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, VariantNames};

// ============================================================================
// Type Aliases
// ============================================================================

/// HTTP status code type
pub type HttpStatusCode = u16;

/// Plot file name as listed by a farmer (e.g. "plot-k32-...plot")
pub type PlotName = String;

// ============================================================================
// Transfer Types
// ============================================================================

/// Phase of a single transfer session.
///
/// A session goes `Pending -> Evicting -> Downloading -> Verifying ->
/// Committed` (`Evicting` only when the reservation carries victims). Any of
/// these may end in `Failed` instead of `Committed`. When a validator is
/// configured, a committed plot then goes `Committed -> Validating` and ends
/// back in `Committed` if accepted or in `Failed` if rejected.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    JsonSchema,
    Display,
    EnumString,
    VariantNames,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransferPhase {
    /// Accepted, nothing touched on disk yet
    #[default]
    Pending,
    /// Deleting eviction candidates to make room
    Evicting,
    /// Streaming bytes into the temporary file
    Downloading,
    /// Comparing the downloaded size against the probed size
    Verifying,
    /// Final file is in place
    Committed,
    /// Waiting for the external validator to accept the plot
    Validating,
    /// Terminal failure; partial files have been removed
    Failed,
}

/// Reasons a transfer may fail.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
    Display,
    VariantNames,
)]
#[strum(serialize_all = "snake_case")]
#[serde(tag = "type", content = "detail")]
pub enum TransferFailure {
    /// Catchall for transport errors while talking to the farmer
    NetworkError,
    /// The farmer answered the download with a non-success status
    HttpStatusCode(HttpStatusCode),
    /// No bytes arrived within the stall window
    Stalled,
    /// The downloaded file does not have the probed size
    SizeMismatch {
        /// Size reported by the farmer
        expected: u64,
        /// Size found on disk
        actual: u64,
    },
    /// Local filesystem error (create, write, rename)
    LocalFsError,
    /// The external validator never accepted the committed plot
    ValidationFailed,
}

/// Sampled progress of a transfer in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TransferProgress {
    /// Plot being transferred
    pub plot: PlotName,
    /// Volume the plot is being written to
    pub volume: String,
    /// Current session phase
    pub phase: TransferPhase,
    /// Size reported by the farmer's metadata probe
    pub expected_bytes: u64,
    /// Size of the temporary file at the last sample
    pub transferred_bytes: u64,
    /// `transferred_bytes` as a percentage of `expected_bytes`
    pub percent: f64,
}

// ============================================================================
// Status Types
// ============================================================================

/// State of one local volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct VolumeStatus {
    /// Absolute path of the volume
    pub path: String,
    /// Bytes the inventory currently believes are available
    pub available_bytes: u64,
    /// Whether a reservation currently holds the volume
    pub reserved: bool,
    /// Number of harvested plots found on the volume at the last scan
    pub plot_count: usize,
}

/// State of one remote farmer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SourceStatus {
    /// Base URL of the farmer
    pub url: String,
    /// A transfer from this farmer is in flight
    pub busy: bool,
    /// The last poll failed
    pub error: bool,
    /// Plot names from the last successful poll, in transfer order
    pub candidates: Vec<PlotName>,
    /// Progress of the active transfer, if any
    pub active: Option<TransferProgress>,
}

/// Full harvester status returned by `GET /status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct HarvesterStatus {
    /// Number of scheduler ticks completed since startup
    pub ticks: u64,
    /// Volumes in scan order
    pub volumes: Vec<VolumeStatus>,
    /// Farmers in configuration order
    pub sources: Vec<SourceStatus>,
}
