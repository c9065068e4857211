// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Eviction policies
//!
//! When no volume has room for an incoming plot, the inventory asks an
//! [`EvictionPolicy`] whether deleting some already-harvested plots on a
//! volume would make enough headroom. The policy only picks victims; deleting
//! them is the transfer session's job, once the reservation is granted.

use std::fmt;

use crate::config::EvictionConfig;
use crate::inventory::{HarvestedFile, Volume};

/// Number of plots the default policy evicts per reservation
const VICTIMS_PER_RESERVATION: usize = 2;

/// Extract the class tag from a plot file name.
///
/// Plot names look like `plot-k32-2021-05-12-09-13-<id>.plot`; the class is
/// the `k<size>` token. Names that don't follow the pattern have no class and
/// are never eviction candidates.
pub fn classify_plot_name(name: &str) -> Option<String> {
    let mut parts = name.split('-');
    if parts.next()? != "plot" {
        return None;
    }

    let class = parts.next()?;
    let digits = class.strip_prefix('k')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    Some(class.to_string())
}

/// Strategy deciding which harvested plots to sacrifice on a volume.
pub trait EvictionPolicy: Send + Sync + fmt::Debug {
    /// Return the plots to delete so that `volume` can take `request` bytes,
    /// or `None` if this volume cannot be made to fit.
    fn select(&self, request: u64, volume: &Volume) -> Option<Vec<HarvestedFile>>;
}

/// Never evicts anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoEviction;

impl EvictionPolicy for NoEviction {
    fn select(&self, _request: u64, _volume: &Volume) -> Option<Vec<HarvestedFile>> {
        None
    }
}

/// Evicts the two largest primary-class plots from a volume that holds enough
/// of them and no protected-class plots at all.
///
/// A volume holding any protected plot has already been committed to the
/// newer class and is left alone.
#[derive(Debug, Clone)]
pub struct LargestPrimaryPolicy {
    primary_class: String,
    protected_class: String,
    min_primary_files: usize,
}

impl LargestPrimaryPolicy {
    pub fn new(
        primary_class: impl Into<String>,
        protected_class: impl Into<String>,
        min_primary_files: usize,
    ) -> Self {
        Self {
            primary_class: primary_class.into(),
            protected_class: protected_class.into(),
            min_primary_files: min_primary_files.max(VICTIMS_PER_RESERVATION),
        }
    }
}

impl From<&EvictionConfig> for LargestPrimaryPolicy {
    fn from(config: &EvictionConfig) -> Self {
        Self::new(
            config.primary_class.clone(),
            config.protected_class.clone(),
            config.min_primary_files,
        )
    }
}

impl EvictionPolicy for LargestPrimaryPolicy {
    fn select(&self, request: u64, volume: &Volume) -> Option<Vec<HarvestedFile>> {
        let has_class = |f: &HarvestedFile, class: &str| f.class.as_deref() == Some(class);

        if volume
            .files
            .iter()
            .any(|f| has_class(f, &self.protected_class))
        {
            return None;
        }

        let mut primary: Vec<&HarvestedFile> = volume
            .files
            .iter()
            .filter(|f| has_class(f, &self.primary_class))
            .collect();

        if primary.len() < self.min_primary_files {
            return None;
        }

        // Largest first; stable so equal sizes keep scan order
        primary.sort_by(|a, b| b.size.cmp(&a.size));
        let victims: Vec<HarvestedFile> = primary
            .into_iter()
            .take(VICTIMS_PER_RESERVATION)
            .cloned()
            .collect();

        let reclaimed: u64 = victims.iter().map(|f| f.size).sum();
        if volume.available_bytes.saturating_add(reclaimed) > request {
            Some(victims)
        } else {
            None
        }
    }
}
