// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Harvest and API contexts
//!
//! [`HarvestContext`] is built once at startup and owns everything shared by
//! the scheduler: configuration, the HTTP client and the optional validator.
//! [`ApiContext`] is what the status API handlers see.

use std::sync::Arc;

use anyhow::{Context, Result};
use reqwest::Client;

use harvester_types::HarvesterStatus;

use crate::config::HarvesterConfig;
use crate::eviction::{EvictionPolicy, LargestPrimaryPolicy, NoEviction};
use crate::inventory::VolumeInventory;
use crate::orchestrator::Orchestrator;
use crate::source::{HttpSource, JobSettings, SourceAgent};
use crate::transfer::TransferSettings;
use crate::validator::{ChiaCli, PlotValidator, Validation, ValidationPolicy};

/// Install the process-wide rustls crypto provider.
///
/// reqwest is built without a provider of its own. Calling this more than
/// once is harmless.
pub fn install_crypto_provider() {
    // Err only means a provider is already installed
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Shared state for one harvester process
#[derive(Debug, Clone)]
pub struct HarvestContext {
    config: HarvesterConfig,
    client: Client,
    validator: Option<Arc<dyn PlotValidator>>,
}

impl HarvestContext {
    /// Build the context; enables chia validation when `chiaDir` is set
    pub fn new(config: HarvesterConfig) -> Result<Self> {
        install_crypto_provider();

        // No overall timeout: it would cap whole downloads. Listing, probe
        // and remove requests set their own.
        let client = Client::builder()
            .connect_timeout(config.http_timeout())
            .build()
            .context("Failed to build HTTP client")?;

        let validator = config
            .chia_dir
            .as_ref()
            .map(|dir| Arc::new(ChiaCli::new(dir)) as Arc<dyn PlotValidator>);

        Ok(Self {
            config,
            client,
            validator,
        })
    }

    /// Replace the validator
    pub fn with_validator(mut self, validator: Option<Arc<dyn PlotValidator>>) -> Self {
        self.validator = validator;
        self
    }

    pub fn config(&self) -> &HarvesterConfig {
        &self.config
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn eviction_policy(&self) -> Arc<dyn EvictionPolicy> {
        match &self.config.eviction {
            Some(eviction) => Arc::new(LargestPrimaryPolicy::from(eviction)),
            None => Arc::new(NoEviction),
        }
    }

    pub fn job_settings(&self) -> JobSettings {
        let validation = self.validator.as_ref().map(|validator| {
            Validation::new(
                Arc::clone(validator),
                ValidationPolicy {
                    attempts: self.config.validation_attempts,
                    delay: self.config.validation_delay(),
                },
            )
        });

        JobSettings {
            transfer: TransferSettings {
                progress_interval: self.config.progress_interval(),
                stall_timeout: self.config.download_stall_timeout(),
            },
            validation,
        }
    }

    pub fn build_inventory(&self) -> VolumeInventory {
        VolumeInventory::new(
            self.config.volumes_root.clone(),
            self.config.ignored_volume_paths(),
            self.eviction_policy(),
        )
    }

    /// One agent per configured source, in configuration order
    pub fn build_agents(&self) -> Vec<Arc<SourceAgent>> {
        self.config
            .sources
            .iter()
            .map(|url| {
                let transport =
                    HttpSource::new(url, self.client.clone(), self.config.http_timeout());
                Arc::new(SourceAgent::new(Arc::new(transport)))
            })
            .collect()
    }

    pub fn build_orchestrator(&self) -> Orchestrator {
        self.build_orchestrator_with(self.build_inventory())
    }

    /// Build the orchestrator around an existing inventory
    pub fn build_orchestrator_with(&self, inventory: VolumeInventory) -> Orchestrator {
        Orchestrator::new(
            Arc::new(inventory),
            self.build_agents(),
            self.job_settings(),
            self.config.tick_interval(),
        )
    }
}

/// API context shared across all request handlers
pub struct ApiContext {
    orchestrator: Arc<Orchestrator>,
}

impl ApiContext {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    pub fn status(&self) -> HarvesterStatus {
        self.orchestrator.status()
    }
}
