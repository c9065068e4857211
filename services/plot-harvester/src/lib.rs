// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Plot Harvester Library
//!
//! The harvester pulls finished plots from a fleet of remote farmers onto a
//! fixed set of local volumes. Each volume takes at most one transfer at a
//! time, each farmer sends at most one plot at a time, and when no volume has
//! room an eviction policy may sacrifice older plots to make some.
//!
//! # Modules
//!
//! - [`config`] - Harvester configuration (volume root, farmers, timings)
//! - [`context`] - Startup context and API context
//! - [`eviction`] - Pluggable eviction policies
//! - [`inventory`] - Volume scanning and reservations
//! - [`metrics`] - Prometheus metrics
//! - [`orchestrator`] - The scheduling loop
//! - [`progress`] - Transfer progress sampling
//! - [`source`] - Farmer client and transfer jobs
//! - [`transfer`] - The download, verify, commit session
//! - [`validator`] - Post-commit validation through the chia CLI

pub mod config;
pub mod context;
pub mod eviction;
pub mod inventory;
pub mod metrics;
pub mod orchestrator;
pub mod progress;
pub mod source;
pub mod transfer;
pub mod validator;

use dropshot::{Body, HttpError, HttpResponseOk, RequestContext};
use harvester_api::HarvesterApi;
use harvester_types::HarvesterStatus;
use http::Response;

use crate::context::ApiContext;

/// Plot Harvester API implementation
///
/// This enum serves as the implementation type for the `HarvesterApi` trait.
/// It contains no data - all state is stored in the `ApiContext`.
pub enum PlotHarvesterImpl {}

impl HarvesterApi for PlotHarvesterImpl {
    type Context = ApiContext;

    async fn get_status(
        rqctx: RequestContext<Self::Context>,
    ) -> Result<HttpResponseOk<HarvesterStatus>, HttpError> {
        Ok(HttpResponseOk(rqctx.context().status()))
    }

    async fn get_metrics(
        _rqctx: RequestContext<Self::Context>,
    ) -> Result<Response<Body>, HttpError> {
        Response::builder()
            .status(200)
            .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
            .body(metrics::gather_metrics().into())
            .map_err(|e| HttpError::for_internal_error(format!("Failed to build response: {}", e)))
    }
}
