// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Source agent client
//!
//! A [`SourceAgent`] represents one remote farmer. It polls the farmer's
//! listing, resolves each candidate's size with a `HEAD` probe, and runs at
//! most one transfer at a time. The wire protocol lives behind the
//! [`SourceTransport`] trait; [`HttpSource`] is the production
//! implementation.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, BoxStream};
use futures_util::{StreamExt, TryStreamExt};
use parking_lot::Mutex;
use reqwest::Client;
use reqwest::header::{CONTENT_LENGTH, HeaderValue};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use harvester_types::{HttpStatusCode, PlotName, SourceStatus, TransferFailure, TransferPhase};

use crate::inventory::{Reservation, VolumeInventory};
use crate::metrics;
use crate::progress::ProgressState;
use crate::transfer::{TransferSession, TransferSettings};
use crate::validator::Validation;

/// Body bytes of a download, chunk by chunk
pub type ByteStream = BoxStream<'static, Result<Bytes, SourceError>>;

/// Size probes in flight per poll
const PROBE_CONCURRENCY: usize = 4;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: HttpStatusCode },

    #[error("Malformed listing from {url}: {reason}")]
    MalformedListing { url: String, reason: String },

    #[error("No usable content-length for {url}")]
    Probe { url: String },

    #[error("Download from {url} interrupted: {reason}")]
    Stream { url: String, reason: String },
}

/// Whether `name` is usable as a file name inside a volume
///
/// Rejects the empty name, anything with a path separator, and `.`/`..`.
pub fn is_plain_file_name(name: &str) -> bool {
    if name.contains(['/', '\\']) {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Parse a `Content-Length` header value
///
/// Returns `None` when the header is missing or not a decimal integer.
pub fn parse_content_length(value: Option<&HeaderValue>) -> Option<u64> {
    value?.to_str().ok()?.trim().parse().ok()
}

/// Wire protocol spoken with one farmer.
#[async_trait]
pub trait SourceTransport: Send + Sync + fmt::Debug {
    /// Base URL identifying the farmer
    fn base_url(&self) -> &str;

    /// Where a candidate is downloaded from
    fn locator(&self, name: &str) -> String;

    /// Candidate names, in transfer order
    async fn list(&self) -> Result<Vec<PlotName>, SourceError>;

    /// Size of one candidate in bytes
    async fn probe_size(&self, name: &str) -> Result<u64, SourceError>;

    /// Start downloading a candidate
    async fn fetch(&self, name: &str) -> Result<ByteStream, SourceError>;

    /// Ask the farmer to delete its copy of a candidate
    async fn remove(&self, name: &str) -> Result<(), SourceError>;
}

/// Farmer reached over HTTP.
///
/// `GET /` lists candidates as a JSON array of names, `HEAD /download/{name}`
/// reports the size, `GET /download/{name}` streams the plot and
/// `GET /remove/{name}` deletes it.
#[derive(Debug, Clone)]
pub struct HttpSource {
    base_url: String,
    client: Client,
    request_timeout: Duration,
}

impl HttpSource {
    /// `client` must not carry an overall timeout: downloads run for as long
    /// as data keeps arriving. `request_timeout` bounds every other request.
    pub fn new(base_url: &str, client: Client, request_timeout: Duration) -> Self {
        let mut base_url = base_url.to_string();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }

        Self {
            base_url,
            client,
            request_timeout,
        }
    }

    fn remove_url(&self, name: &str) -> String {
        format!("{}remove/{}", self.base_url, urlencoding::encode(name))
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        url: &str,
    ) -> Result<reqwest::Response, SourceError> {
        let response = request
            .send()
            .await
            .map_err(|source| SourceError::Request {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        Ok(response)
    }
}

#[async_trait]
impl SourceTransport for HttpSource {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn locator(&self, name: &str) -> String {
        format!("{}download/{}", self.base_url, urlencoding::encode(name))
    }

    async fn list(&self) -> Result<Vec<PlotName>, SourceError> {
        let url = self.base_url.clone();
        let request = self.client.get(&url).timeout(self.request_timeout);
        let response = self.send(request, &url).await?;

        let malformed = |reason: String| SourceError::MalformedListing {
            url: url.clone(),
            reason,
        };

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| malformed(e.to_string()))?;

        let serde_json::Value::Array(entries) = body else {
            return Err(malformed("expected a JSON array".to_string()));
        };

        entries
            .into_iter()
            .map(|entry| match entry {
                serde_json::Value::String(name) => Ok(name),
                other => Err(malformed(format!("non-string entry {other}"))),
            })
            .collect()
    }

    async fn probe_size(&self, name: &str) -> Result<u64, SourceError> {
        let url = self.locator(name);
        let request = self.client.head(&url).timeout(self.request_timeout);
        let response = self.send(request, &url).await?;

        // Response::content_length() describes the (empty) HEAD body, so
        // read the header itself
        parse_content_length(response.headers().get(CONTENT_LENGTH))
            .ok_or(SourceError::Probe { url })
    }

    async fn fetch(&self, name: &str) -> Result<ByteStream, SourceError> {
        let url = self.locator(name);
        let response = self.send(self.client.get(&url), &url).await?;

        let stream = response.bytes_stream().map(move |chunk| {
            chunk.map_err(|e| SourceError::Stream {
                url: url.clone(),
                reason: e.to_string(),
            })
        });

        Ok(stream.boxed())
    }

    async fn remove(&self, name: &str) -> Result<(), SourceError> {
        let url = self.remove_url(name);
        let request = self.client.get(&url).timeout(self.request_timeout);
        self.send(request, &url).await?;
        Ok(())
    }
}

/// A plot offered by a farmer, as resolved by the last poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferCandidate {
    pub name: PlotName,
    /// Size reported by the probe
    pub size: u64,
    /// Download URL
    pub locator: String,
}

#[derive(Debug, Default)]
struct AgentState {
    candidates: Vec<TransferCandidate>,
    error: bool,
    active: Option<Arc<ProgressState>>,
}

/// Everything a transfer job needs besides the agent and the reservation
#[derive(Debug, Clone, Default)]
pub struct JobSettings {
    pub transfer: TransferSettings,
    /// Post-commit validation; `None` commits without checking
    pub validation: Option<Validation>,
}

/// One remote farmer and its scheduling state.
#[derive(Debug)]
pub struct SourceAgent {
    transport: Arc<dyn SourceTransport>,
    busy: AtomicBool,
    state: Mutex<AgentState>,
}

impl SourceAgent {
    pub fn new(transport: Arc<dyn SourceTransport>) -> Self {
        Self {
            transport,
            busy: AtomicBool::new(false),
            state: Mutex::new(AgentState::default()),
        }
    }

    pub fn url(&self) -> &str {
        self.transport.base_url()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn has_error(&self) -> bool {
        self.state.lock().error
    }

    /// Candidates from the last successful poll
    pub fn candidates(&self) -> Vec<TransferCandidate> {
        self.state.lock().candidates.clone()
    }

    /// Scheduling priority: the candidate count, or -1 after a failed poll
    pub fn candidate_count(&self) -> i64 {
        let state = self.state.lock();
        if state.error {
            -1
        } else {
            state.candidates.len() as i64
        }
    }

    /// Refresh the candidate list.
    ///
    /// Every listed name is probed for its size; one failed probe or one
    /// name that isn't a plain file name fails the whole poll. A failed poll clears the candidates and flags the agent
    /// until the next successful poll. The error is returned for reporting
    /// only; the agent's state already reflects it.
    pub async fn poll(&self) -> Result<usize, SourceError> {
        match self.resolve_candidates().await {
            Ok(candidates) => {
                let count = candidates.len();
                {
                    let mut state = self.state.lock();
                    state.candidates = candidates;
                    state.error = false;
                }

                metrics::record_poll(true);
                debug!(source = %self.url(), candidates = count, "Polled source");
                Ok(count)
            }
            Err(e) => {
                {
                    let mut state = self.state.lock();
                    state.candidates.clear();
                    state.error = true;
                }

                metrics::record_poll(false);
                warn!(source = %self.url(), error = %e, "Failed to poll source");
                Err(e)
            }
        }
    }

    async fn resolve_candidates(&self) -> Result<Vec<TransferCandidate>, SourceError> {
        let names = self.transport.list().await?;

        if let Some(bad) = names.iter().find(|name| !is_plain_file_name(name)) {
            return Err(SourceError::MalformedListing {
                url: self.url().to_string(),
                reason: format!("{bad:?} is not a plain file name"),
            });
        }

        stream::iter(names)
            .map(|name| async move {
                let size = self.transport.probe_size(&name).await?;
                let locator = self.transport.locator(&name);
                Ok::<_, SourceError>(TransferCandidate {
                    name,
                    size,
                    locator,
                })
            })
            .buffered(PROBE_CONCURRENCY)
            .try_collect()
            .await
    }

    /// Accept the next transfer, if this agent can take one.
    ///
    /// Skips (returning `None`) when the agent is busy, errored or has no
    /// candidates, and when the inventory has no room for the first
    /// candidate. Otherwise the reservation is taken and the agent is marked
    /// busy before this returns; the busy flag is cleared when the returned
    /// job finishes or is dropped.
    pub fn try_start(
        self: &Arc<Self>,
        inventory: &VolumeInventory,
        settings: &JobSettings,
    ) -> Option<TransferJob> {
        if self.is_busy() {
            debug!(source = %self.url(), "Source busy, skipping");
            return None;
        }

        let candidate = {
            let state = self.state.lock();
            if state.error {
                debug!(source = %self.url(), "Source in error, skipping");
                return None;
            }
            match state.candidates.first() {
                Some(c) => c.clone(),
                None => {
                    debug!(source = %self.url(), "No candidates, skipping");
                    return None;
                }
            }
        };

        let Some(reservation) = inventory.reserve(candidate.size) else {
            metrics::record_capacity_exhausted();
            warn!(
                source = %self.url(),
                plot = %candidate.name,
                size = candidate.size,
                "No volume has room for plot"
            );
            return None;
        };

        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Lost a race with another start; the reservation drops here
            return None;
        }

        let progress = Arc::new(ProgressState::new(
            candidate.name.clone(),
            reservation.volume().display().to_string(),
            candidate.size,
        ));
        self.state.lock().active = Some(Arc::clone(&progress));

        info!(
            source = %self.url(),
            plot = %candidate.name,
            volume = %reservation.volume().display(),
            size = candidate.size,
            "Starting transfer"
        );

        Some(TransferJob {
            guard: BusyGuard {
                agent: Arc::clone(self),
            },
            candidate,
            reservation,
            progress,
            settings: settings.clone(),
        })
    }

    /// Accept and run a transfer to completion
    pub async fn begin_transfer(
        self: &Arc<Self>,
        inventory: &VolumeInventory,
        settings: &JobSettings,
    ) -> Option<HarvestOutcome> {
        let job = self.try_start(inventory, settings)?;
        Some(job.run().await)
    }

    /// Ask the farmer to delete its copy of a plot. Failures are logged and
    /// otherwise ignored.
    pub async fn remove(&self, name: &str) -> bool {
        match self.transport.remove(name).await {
            Ok(()) => {
                metrics::record_source_removal(true);
                info!(source = %self.url(), plot = %name, "Source removed plot");
                true
            }
            Err(e) => {
                metrics::record_source_removal(false);
                warn!(source = %self.url(), plot = %name, error = %e, "Failed to remove plot from source");
                false
            }
        }
    }

    /// Status for the status API
    pub fn status(&self) -> SourceStatus {
        let state = self.state.lock();
        SourceStatus {
            url: self.url().to_string(),
            busy: self.is_busy(),
            error: state.error,
            candidates: state.candidates.iter().map(|c| c.name.clone()).collect(),
            active: state.active.as_ref().map(|p| p.to_progress()),
        }
    }

    fn transport(&self) -> &dyn SourceTransport {
        self.transport.as_ref()
    }
}

/// Clears the agent's busy flag and active transfer when dropped
#[derive(Debug)]
struct BusyGuard {
    agent: Arc<SourceAgent>,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.agent.state.lock().active = None;
        self.agent.busy.store(false, Ordering::Release);
    }
}

/// Result of one accepted transfer
#[derive(Debug, Clone, PartialEq)]
pub struct HarvestOutcome {
    pub source: String,
    pub plot: PlotName,
    /// Final path of the plot, or why it was not harvested
    pub result: Result<PathBuf, TransferFailure>,
}

/// A transfer accepted by [`SourceAgent::try_start`], ready to run.
#[derive(Debug)]
pub struct TransferJob {
    candidate: TransferCandidate,
    reservation: Reservation,
    progress: Arc<ProgressState>,
    settings: JobSettings,
    // Dropped last so busy covers the whole job
    guard: BusyGuard,
}

impl TransferJob {
    pub fn candidate(&self) -> &TransferCandidate {
        &self.candidate
    }

    pub fn progress(&self) -> Arc<ProgressState> {
        Arc::clone(&self.progress)
    }

    /// Run the session, validate, tell the farmer, release the volume.
    pub async fn run(self) -> HarvestOutcome {
        let agent = Arc::clone(&self.guard.agent);
        let started = Instant::now();

        let session = TransferSession::new(
            &self.reservation,
            &self.candidate,
            Arc::clone(&self.progress),
            &self.settings.transfer,
        );

        let result = match session.run(agent.transport()).await {
            Ok(path) => self.validate(&agent, path).await,
            Err(e) => {
                warn!(
                    source = %agent.url(),
                    plot = %self.candidate.name,
                    error = %e,
                    "Transfer failed"
                );
                metrics::record_transfer_failed();
                Err(e.to_failure())
            }
        };

        if result.is_ok() {
            agent.remove(&self.candidate.name).await;
            agent
                .state
                .lock()
                .candidates
                .retain(|c| c.name != self.candidate.name);
        }

        self.reservation.release();
        metrics::observe_transfer_duration(started.elapsed());

        HarvestOutcome {
            source: agent.url().to_string(),
            plot: self.candidate.name.clone(),
            result,
        }
    }

    async fn validate(
        &self,
        agent: &SourceAgent,
        path: PathBuf,
    ) -> Result<PathBuf, TransferFailure> {
        let Some(validation) = &self.settings.validation else {
            metrics::record_transfer_committed(self.candidate.size);
            return Ok(path);
        };

        self.progress.set_phase(TransferPhase::Validating);
        match validation.validate(&path).await {
            Ok(()) => {
                self.progress.set_phase(TransferPhase::Committed);
                metrics::record_transfer_committed(self.candidate.size);
                info!(source = %agent.url(), plot = %self.candidate.name, "Plot validated");
                Ok(path)
            }
            Err(e) => {
                self.progress.set_phase(TransferPhase::Failed);
                metrics::record_validation_failed();
                error!(
                    source = %agent.url(),
                    plot = %self.candidate.name,
                    error = %e,
                    "Plot rejected, keeping source copy"
                );
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    metrics::record_cleanup_failure();
                    warn!(path = %path.display(), error = %e, "Failed to delete rejected plot");
                }
                Err(TransferFailure::ValidationFailed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eviction::NoEviction;
    use crate::inventory::SpaceProbe;
    use crate::validator::{PlotValidator, ValidationPolicy, ValidatorError};
    use std::io;
    use std::sync::atomic::AtomicUsize;
    use tempfile::{TempDir, tempdir};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Debug)]
    struct Plenty;

    impl SpaceProbe for Plenty {
        fn available_bytes(&self, _path: &Path) -> io::Result<u64> {
            Ok(1 << 30)
        }
    }

    async fn inventory(root: &TempDir) -> VolumeInventory {
        std::fs::create_dir(root.path().join("disk-0")).unwrap();
        let inv = VolumeInventory::new(root.path(), Vec::new(), Arc::new(NoEviction))
            .with_space_probe(Arc::new(Plenty));
        inv.refresh().await.unwrap();
        inv
    }

    fn agent(server: &MockServer) -> Arc<SourceAgent> {
        crate::context::install_crypto_provider();
        let transport = HttpSource::new(&server.uri(), Client::new(), Duration::from_secs(5));
        Arc::new(SourceAgent::new(Arc::new(transport)))
    }

    async fn mount_plot(server: &MockServer, name: &str, size: usize) {
        Mock::given(method("HEAD"))
            .and(path(format!("/download/{name}")))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-length", size.to_string().as_str())
                    .set_body_bytes(vec![0u8; size]),
            )
            .mount(server)
            .await;
    }

    #[test]
    fn test_parse_content_length() {
        assert_eq!(
            parse_content_length(Some(&HeaderValue::from_static("1000"))),
            Some(1000)
        );
        assert_eq!(parse_content_length(Some(&HeaderValue::from_static("abc"))), None);
        assert_eq!(parse_content_length(Some(&HeaderValue::from_static("-1"))), None);
        assert_eq!(parse_content_length(None), None);
    }

    #[test]
    fn test_plain_file_names() {
        assert!(is_plain_file_name("plot-k32-a.plot"));
        assert!(is_plain_file_name("a plot.plot"));
        assert!(!is_plain_file_name(""));
        assert!(!is_plain_file_name("."));
        assert!(!is_plain_file_name(".."));
        assert!(!is_plain_file_name("/abs.plot"));
        assert!(!is_plain_file_name("../x.plot"));
        assert!(!is_plain_file_name("dir/x.plot"));
        assert!(!is_plain_file_name("x.plot/"));
        assert!(!is_plain_file_name("..\\x.plot"));
    }

    #[test]
    fn test_urls() {
        crate::context::install_crypto_provider();
        let source = HttpSource::new("http://farmer:9999", Client::new(), Duration::from_secs(1));
        assert_eq!(source.base_url(), "http://farmer:9999/");
        assert_eq!(
            source.locator("plot a.plot"),
            "http://farmer:9999/download/plot%20a.plot"
        );
        assert_eq!(source.remove_url("a.plot"), "http://farmer:9999/remove/a.plot");
    }

    #[tokio::test]
    async fn test_poll_resolves_sizes_in_listing_order() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(["b.plot", "a.plot"]))
            .mount(&server)
            .await;
        mount_plot(&server, "a.plot", 10).await;
        mount_plot(&server, "b.plot", 20).await;

        let agent = agent(&server);
        assert_eq!(agent.poll().await.unwrap(), 2);
        assert_eq!(agent.candidate_count(), 2);

        let candidates = agent.candidates();
        assert_eq!(candidates[0].name, "b.plot");
        assert_eq!(candidates[0].size, 20);
        assert_eq!(candidates[1].name, "a.plot");
        assert_eq!(candidates[1].size, 10);
        assert!(!agent.has_error());
    }

    #[tokio::test]
    async fn test_malformed_listing_flags_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"plots": []})))
            .mount(&server)
            .await;

        let agent = agent(&server);
        let err = agent.poll().await.unwrap_err();
        assert!(matches!(err, SourceError::MalformedListing { .. }));
        assert!(agent.has_error());
        assert_eq!(agent.candidate_count(), -1);
    }

    #[tokio::test]
    async fn test_unsafe_names_fail_poll() {
        for name in ["/abs.plot", "../x.plot", ""] {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/"))
                .respond_with(ResponseTemplate::new(200).set_body_json(["a.plot", name]))
                .mount(&server)
                .await;
            mount_plot(&server, "a.plot", 10).await;

            let agent = agent(&server);
            let err = agent.poll().await.unwrap_err();
            assert!(matches!(err, SourceError::MalformedListing { .. }), "{name:?}");
            assert_eq!(agent.candidate_count(), -1);
            assert!(agent.candidates().is_empty());
        }
    }

    /// Farmer whose size probes take a while, counting how many overlap
    #[derive(Debug, Default)]
    struct SlowProbes {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl SourceTransport for SlowProbes {
        fn base_url(&self) -> &str {
            "slow://farmer/"
        }

        fn locator(&self, name: &str) -> String {
            format!("slow://farmer/download/{name}")
        }

        async fn list(&self) -> Result<Vec<PlotName>, SourceError> {
            Ok((0..20).map(|i| format!("p{i:02}.plot")).collect())
        }

        async fn probe_size(&self, name: &str) -> Result<u64, SourceError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(name.len() as u64)
        }

        async fn fetch(&self, name: &str) -> Result<ByteStream, SourceError> {
            Err(SourceError::Status {
                url: self.locator(name),
                status: 404,
            })
        }

        async fn remove(&self, _name: &str) -> Result<(), SourceError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_probes_are_bounded() {
        let transport = Arc::new(SlowProbes::default());
        let agent = SourceAgent::new(Arc::clone(&transport) as Arc<dyn SourceTransport>);

        assert_eq!(agent.poll().await.unwrap(), 20);

        let peak = transport.peak.load(Ordering::SeqCst);
        assert!((1..=PROBE_CONCURRENCY).contains(&peak), "peak {peak}");
        let names: Vec<String> = agent.candidates().into_iter().map(|c| c.name).collect();
        let expected: Vec<String> = (0..20).map(|i| format!("p{i:02}.plot")).collect();
        assert_eq!(names, expected);
    }

    #[tokio::test]
    async fn test_failed_probe_fails_whole_poll() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(["a.plot", "gone.plot"]))
            .mount(&server)
            .await;
        mount_plot(&server, "a.plot", 10).await;
        Mock::given(method("HEAD"))
            .and(path("/download/gone.plot"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let agent = agent(&server);
        assert!(agent.poll().await.is_err());
        assert_eq!(agent.candidate_count(), -1);
        assert!(agent.candidates().is_empty());
    }

    #[tokio::test]
    async fn test_successful_poll_clears_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(Vec::<String>::new()))
            .mount(&server)
            .await;

        let agent = agent(&server);
        assert!(matches!(
            agent.poll().await,
            Err(SourceError::Status { status: 500, .. })
        ));
        assert!(agent.has_error());

        assert_eq!(agent.poll().await.unwrap(), 0);
        assert!(!agent.has_error());
        assert_eq!(agent.candidate_count(), 0);
    }

    #[tokio::test]
    async fn test_try_start_skips_without_candidates() {
        let server = MockServer::start().await;
        let root = tempdir().unwrap();
        let inv = inventory(&root).await;

        let agent = agent(&server);
        assert!(agent.try_start(&inv, &JobSettings::default()).is_none());
        assert!(!agent.is_busy());
        assert_eq!(inv.live_reservations(), 0);
    }

    #[tokio::test]
    async fn test_busy_spans_job_lifetime() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(["a.plot"]))
            .mount(&server)
            .await;
        mount_plot(&server, "a.plot", 10).await;

        let root = tempdir().unwrap();
        let inv = inventory(&root).await;
        let agent = agent(&server);
        agent.poll().await.unwrap();

        let job = agent.try_start(&inv, &JobSettings::default()).unwrap();
        assert!(agent.is_busy());
        assert_eq!(inv.live_reservations(), 1);
        assert_eq!(job.candidate().name, "a.plot");
        assert!(agent.status().active.is_some());

        // A second start is refused while the first job is alive
        assert!(agent.try_start(&inv, &JobSettings::default()).is_none());

        drop(job);
        assert!(!agent.is_busy());
        assert_eq!(inv.live_reservations(), 0);
        assert!(agent.status().active.is_none());
    }

    /// Replays validator answers, then reports zero
    #[derive(Debug)]
    struct ScriptedValidator {
        answers: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl PlotValidator for ScriptedValidator {
        async fn check(&self, _plot: &Path) -> Result<u32, ValidatorError> {
            let mut answers = self.answers.lock();
            Ok(if answers.is_empty() { 0 } else { answers.remove(0) })
        }
    }

    fn validating(answers: &[u32]) -> JobSettings {
        let validator = ScriptedValidator {
            answers: Mutex::new(answers.to_vec()),
        };
        JobSettings {
            transfer: TransferSettings::default(),
            validation: Some(Validation::new(
                Arc::new(validator),
                ValidationPolicy {
                    attempts: 3,
                    delay: Duration::ZERO,
                },
            )),
        }
    }

    /// Farmer offering one 10-byte `a.plot`, expecting `removals` removes
    async fn farmer_with_plot(removals: u64) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(["a.plot"]))
            .mount(&server)
            .await;
        mount_plot(&server, "a.plot", 10).await;
        Mock::given(method("GET"))
            .and(path("/download/a.plot"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![5u8; 10]))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/remove/a.plot"))
            .respond_with(ResponseTemplate::new(200))
            .expect(removals)
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn test_rejected_plot_is_deleted_and_source_kept() {
        let server = farmer_with_plot(0).await;
        let root = tempdir().unwrap();
        let inv = inventory(&root).await;
        let agent = agent(&server);
        agent.poll().await.unwrap();

        // More than one valid plot never counts as success
        let job = agent.try_start(&inv, &validating(&[0, 2])).unwrap();
        let progress = job.progress();
        let outcome = job.run().await;

        assert_eq!(outcome.result, Err(TransferFailure::ValidationFailed));
        assert_eq!(progress.phase(), TransferPhase::Failed);
        assert!(!root.path().join("disk-0/a.plot").exists());
        assert!(!root.path().join("disk-0/a.plot.tmp").exists());
        assert!(!agent.is_busy());
        assert_eq!(inv.live_reservations(), 0);
        // Still offered, so a later tick may try again
        assert_eq!(agent.candidate_count(), 1);
    }

    #[tokio::test]
    async fn test_validated_plot_removed_from_source() {
        let server = farmer_with_plot(1).await;
        let root = tempdir().unwrap();
        let inv = inventory(&root).await;
        let agent = agent(&server);
        agent.poll().await.unwrap();

        let job = agent.try_start(&inv, &validating(&[0, 1])).unwrap();
        let progress = job.progress();
        let outcome = job.run().await;

        let committed = root.path().join("disk-0/a.plot");
        assert_eq!(outcome.result, Ok(committed.clone()));
        assert_eq!(progress.phase(), TransferPhase::Committed);
        assert_eq!(std::fs::read(&committed).unwrap(), vec![5u8; 10]);
        assert!(!agent.is_busy());
        assert_eq!(inv.live_reservations(), 0);
        assert_eq!(agent.candidate_count(), 0);
    }

    #[tokio::test]
    async fn test_remove_failure_is_not_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/remove/a.plot"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let agent = agent(&server);
        assert!(!agent.remove("a.plot").await);
    }
}
