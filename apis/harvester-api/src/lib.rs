// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Dropshot API trait for the plot harvester.
//!
//! The harvester pulls finished plots from remote farmers onto local volumes.
//! This API is read-only: it reports what the scheduler is doing and never
//! changes it.
//!
//! ## Endpoints
//!
//! - `GET /status` - Volumes, farmers and transfer progress
//! - `GET /metrics` - Prometheus text exposition

use dropshot::{Body, HttpError, HttpResponseOk, RequestContext};
use harvester_types::HarvesterStatus;
use http::Response;

/// Plot Harvester API
#[dropshot::api_description]
pub trait HarvesterApi {
    /// Context type for request handlers
    type Context: Send + Sync + 'static;

    /// Get harvester status
    ///
    /// Returns every volume with its available bytes and reservation state,
    /// and every farmer with its candidate list and, while busy, the phase
    /// and percentage of its active transfer.
    #[endpoint {
        method = GET,
        path = "/status",
        tags = ["status"],
    }]
    async fn get_status(
        rqctx: RequestContext<Self::Context>,
    ) -> Result<HttpResponseOk<HarvesterStatus>, HttpError>;

    /// Get metrics
    ///
    /// Returns the harvester's Prometheus counters in text format.
    #[endpoint {
        method = GET,
        path = "/metrics",
        tags = ["status"],
    }]
    async fn get_metrics(
        rqctx: RequestContext<Self::Context>,
    ) -> Result<Response<Body>, HttpError>;
}
