// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Scheduling loop
//!
//! Every tick the orchestrator polls all sources concurrently, rescans the
//! volumes, and starts at most one new transfer: from the eligible source
//! with the most candidates. Transfers run as tasks in a [`JoinSet`] and
//! outlive the tick that started them. Nothing a source or a transfer does
//! can stop the loop.

use std::cmp::Reverse;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::{Mutex, watch};
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use harvester_types::HarvesterStatus;

use crate::inventory::VolumeInventory;
use crate::source::{HarvestOutcome, JobSettings, SourceAgent};

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    /// Sources polled
    pub polled: usize,
    /// Sources whose poll failed
    pub poll_errors: usize,
    /// Volumes found by the rescan; `None` if the rescan failed
    pub volumes: Option<usize>,
    /// Source a transfer was started from
    pub started: Option<String>,
    /// Transfers that had finished since the previous tick
    pub finished: Vec<HarvestOutcome>,
}

/// Owns the sources and the inventory and drives them.
#[derive(Debug)]
pub struct Orchestrator {
    inventory: Arc<VolumeInventory>,
    agents: Vec<Arc<SourceAgent>>,
    settings: JobSettings,
    tick_interval: Duration,
    ticks: AtomicU64,
    in_flight: Mutex<JoinSet<HarvestOutcome>>,
}

impl Orchestrator {
    pub fn new(
        inventory: Arc<VolumeInventory>,
        agents: Vec<Arc<SourceAgent>>,
        settings: JobSettings,
        tick_interval: Duration,
    ) -> Self {
        Self {
            inventory,
            agents,
            settings,
            tick_interval,
            ticks: AtomicU64::new(0),
            in_flight: Mutex::new(JoinSet::new()),
        }
    }

    pub fn inventory(&self) -> &VolumeInventory {
        &self.inventory
    }

    /// Sources in configuration order
    pub fn agents(&self) -> &[Arc<SourceAgent>] {
        &self.agents
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    /// Number of transfers currently running
    pub async fn in_flight(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    /// Run one scheduling round.
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport {
            finished: self.reap().await,
            ..TickReport::default()
        };

        let polls = join_all(self.agents.iter().map(|agent| agent.poll())).await;
        report.polled = polls.len();
        report.poll_errors = polls.iter().filter(|r| r.is_err()).count();

        match self.inventory.refresh().await {
            Ok(count) => report.volumes = Some(count),
            Err(e) => {
                warn!(error = %e, "Failed to refresh volume inventory");
            }
        }

        if report.volumes.is_some() {
            self.register_volumes().await;
            report.started = self.start_one().await;
        }

        let tick = self.ticks.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(
            tick,
            polled = report.polled,
            poll_errors = report.poll_errors,
            started = ?report.started,
            "Tick complete"
        );

        report
    }

    /// Tick every `tick_interval` until `shutdown` turns true, then wait for
    /// running transfers to finish.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Vec<HarvestOutcome> {
        info!(
            sources = self.agents.len(),
            root = %self.inventory.root().display(),
            interval_secs = self.tick_interval.as_secs(),
            "Harvester started"
        );

        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        let in_flight = self.in_flight().await;
        info!(in_flight, "Shutting down, waiting for transfers");
        self.drain().await
    }

    /// Wait for every running transfer
    pub async fn drain(&self) -> Vec<HarvestOutcome> {
        let mut set = self.in_flight.lock().await;
        let mut outcomes = Vec::new();
        while let Some(joined) = set.join_next().await {
            if let Some(outcome) = log_outcome(joined) {
                outcomes.push(outcome);
            }
        }
        outcomes
    }

    /// Status for the status API
    pub fn status(&self) -> HarvesterStatus {
        HarvesterStatus {
            ticks: self.ticks(),
            volumes: self.inventory.snapshot(),
            sources: self.agents.iter().map(|a| a.status()).collect(),
        }
    }

    async fn reap(&self) -> Vec<HarvestOutcome> {
        let mut set = self.in_flight.lock().await;
        let mut outcomes = Vec::new();
        while let Some(joined) = set.try_join_next() {
            if let Some(outcome) = log_outcome(joined) {
                outcomes.push(outcome);
            }
        }
        outcomes
    }

    async fn register_volumes(&self) {
        let Some(validation) = &self.settings.validation else {
            return;
        };

        for volume in self.inventory.volumes() {
            if let Err(e) = validation.validator.register_volume(&volume.path).await {
                warn!(volume = %volume.path.display(), error = %e, "Failed to register volume");
            }
        }
    }

    /// Sources that could take a transfer, most candidates first. Ties keep
    /// configuration order.
    fn ranked(&self) -> Vec<&Arc<SourceAgent>> {
        let mut eligible: Vec<(&Arc<SourceAgent>, i64)> = self
            .agents
            .iter()
            .filter(|a| !a.is_busy())
            .map(|a| (a, a.candidate_count()))
            .filter(|(_, count)| *count > 0)
            .collect();

        eligible.sort_by_key(|(_, count)| Reverse(*count));
        eligible.into_iter().map(|(a, _)| a).collect()
    }

    async fn start_one(&self) -> Option<String> {
        let Some(agent) = self.ranked().into_iter().next() else {
            debug!("No eligible source");
            return None;
        };

        let job = agent.try_start(&self.inventory, &self.settings)?;
        self.in_flight.lock().await.spawn(job.run());
        Some(agent.url().to_string())
    }
}

fn log_outcome(joined: Result<HarvestOutcome, JoinError>) -> Option<HarvestOutcome> {
    match joined {
        Ok(outcome) => {
            match &outcome.result {
                Ok(path) => info!(
                    source = %outcome.source,
                    plot = %outcome.plot,
                    path = %path.display(),
                    "Harvest finished"
                ),
                Err(failure) => warn!(
                    source = %outcome.source,
                    plot = %outcome.plot,
                    failure = %failure,
                    "Harvest failed"
                ),
            }
            Some(outcome)
        }
        Err(e) => {
            error!(error = %e, "Transfer task panicked");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eviction::NoEviction;
    use crate::inventory::SpaceProbe;
    use crate::source::{ByteStream, SourceError, SourceTransport};
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures_util::StreamExt;
    use futures_util::stream;
    use harvester_types::PlotName;
    use std::io;
    use std::path::Path;
    use std::sync::Mutex as StdMutex;
    use tempfile::{TempDir, tempdir};

    #[derive(Debug)]
    struct FixedSpace(u64);

    impl SpaceProbe for FixedSpace {
        fn available_bytes(&self, _path: &Path) -> io::Result<u64> {
            Ok(self.0)
        }
    }

    /// In-memory farmer serving `size`-byte plots
    #[derive(Debug)]
    struct MemorySource {
        url: String,
        plots: StdMutex<Vec<(String, u64)>>,
        fail_listing: bool,
        removed: StdMutex<Vec<String>>,
    }

    impl MemorySource {
        fn new(url: &str, plots: &[(&str, u64)]) -> Self {
            Self {
                url: url.to_string(),
                plots: StdMutex::new(plots.iter().map(|(n, s)| (n.to_string(), *s)).collect()),
                fail_listing: false,
                removed: StdMutex::new(Vec::new()),
            }
        }

        fn failing(url: &str) -> Self {
            Self {
                fail_listing: true,
                ..Self::new(url, &[])
            }
        }
    }

    #[async_trait]
    impl SourceTransport for MemorySource {
        fn base_url(&self) -> &str {
            &self.url
        }

        fn locator(&self, name: &str) -> String {
            format!("{}download/{name}", self.url)
        }

        async fn list(&self) -> Result<Vec<PlotName>, SourceError> {
            if self.fail_listing {
                return Err(SourceError::MalformedListing {
                    url: self.url.clone(),
                    reason: "not a list".to_string(),
                });
            }
            Ok(self.plots.lock().unwrap().iter().map(|(n, _)| n.clone()).collect())
        }

        async fn probe_size(&self, name: &str) -> Result<u64, SourceError> {
            self.plots
                .lock()
                .unwrap()
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, s)| *s)
                .ok_or(SourceError::Probe {
                    url: self.locator(name),
                })
        }

        async fn fetch(&self, name: &str) -> Result<ByteStream, SourceError> {
            let size = self.probe_size(name).await?;
            let chunk: Result<Bytes, SourceError> = Ok(Bytes::from(vec![1u8; size as usize]));
            Ok(stream::iter(vec![chunk]).boxed())
        }

        async fn remove(&self, name: &str) -> Result<(), SourceError> {
            self.plots.lock().unwrap().retain(|(n, _)| n != name);
            self.removed.lock().unwrap().push(name.to_string());
            Ok(())
        }
    }

    fn inventory(root: &TempDir, volumes: usize, available: u64) -> Arc<VolumeInventory> {
        for i in 0..volumes {
            std::fs::create_dir(root.path().join(format!("disk-{i}"))).unwrap();
        }
        Arc::new(
            VolumeInventory::new(root.path(), Vec::new(), Arc::new(NoEviction))
                .with_space_probe(Arc::new(FixedSpace(available))),
        )
    }

    fn orchestrator(
        inventory: Arc<VolumeInventory>,
        sources: Vec<Arc<MemorySource>>,
    ) -> Orchestrator {
        let agents = sources
            .into_iter()
            .map(|s| Arc::new(SourceAgent::new(s as Arc<dyn SourceTransport>)))
            .collect();
        Orchestrator::new(
            inventory,
            agents,
            JobSettings::default(),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn test_starts_richest_source_first() {
        let root = tempdir().unwrap();
        let inv = inventory(&root, 3, 1 << 20);
        let poor = Arc::new(MemorySource::new("mem://poor/", &[("p1.plot", 10)]));
        let rich = Arc::new(MemorySource::new(
            "mem://rich/",
            &[("r1.plot", 10), ("r2.plot", 10)],
        ));
        let orch = orchestrator(inv, vec![poor, rich]);

        let report = orch.tick().await;
        assert_eq!(report.polled, 2);
        assert_eq!(report.volumes, Some(3));
        assert_eq!(report.started.as_deref(), Some("mem://rich/"));
        assert!(orch.agents()[1].is_busy());
        assert!(!orch.agents()[0].is_busy());
    }

    #[tokio::test]
    async fn test_ties_keep_configuration_order() {
        let root = tempdir().unwrap();
        let inv = inventory(&root, 2, 1 << 20);
        let a = Arc::new(MemorySource::new("mem://a/", &[("a.plot", 10)]));
        let b = Arc::new(MemorySource::new("mem://b/", &[("b.plot", 10)]));
        let orch = orchestrator(inv, vec![a, b]);

        assert_eq!(orch.tick().await.started.as_deref(), Some("mem://a/"));
    }

    #[tokio::test]
    async fn test_one_start_per_tick() {
        let root = tempdir().unwrap();
        let inv = inventory(&root, 3, 1 << 20);
        let a = Arc::new(MemorySource::new("mem://a/", &[("a.plot", 10)]));
        let b = Arc::new(MemorySource::new("mem://b/", &[("b.plot", 10)]));
        let orch = orchestrator(Arc::clone(&inv), vec![a, b]);

        let report = orch.tick().await;
        assert_eq!(report.started.as_deref(), Some("mem://a/"));
        assert!(inv.live_reservations() <= 1);
        // b was eligible too but has to wait for the next tick
        assert!(!orch.agents()[1].is_busy());

        orch.drain().await;
        assert_eq!(inv.live_reservations(), 0);
    }

    #[tokio::test]
    async fn test_error_source_does_not_stall_others() {
        let root = tempdir().unwrap();
        let inv = inventory(&root, 1, 1 << 20);
        let broken = Arc::new(MemorySource::failing("mem://broken/"));
        let good = Arc::new(MemorySource::new("mem://good/", &[("g.plot", 10)]));
        let orch = orchestrator(inv, vec![broken, Arc::clone(&good)]);

        let report = orch.tick().await;
        assert_eq!(report.poll_errors, 1);
        assert_eq!(report.started.as_deref(), Some("mem://good/"));
        assert_eq!(orch.agents()[0].candidate_count(), -1);

        let outcomes = orch.drain().await;
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].result.is_ok());
        assert_eq!(*good.removed.lock().unwrap(), vec!["g.plot".to_string()]);
    }

    #[tokio::test]
    async fn test_no_capacity_is_a_noop() {
        let root = tempdir().unwrap();
        let inv = inventory(&root, 2, 5);
        let a = Arc::new(MemorySource::new("mem://a/", &[("a.plot", 10)]));
        let orch = orchestrator(Arc::clone(&inv), vec![Arc::clone(&a)]);

        let report = orch.tick().await;
        assert!(report.started.is_none());
        assert!(!orch.agents()[0].is_busy());
        assert_eq!(inv.live_reservations(), 0);
        assert!(a.removed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_finished_transfers_reaped_next_tick() {
        let root = tempdir().unwrap();
        let inv = inventory(&root, 1, 1 << 20);
        let a = Arc::new(MemorySource::new("mem://a/", &[("a.plot", 10)]));
        let orch = orchestrator(inv, vec![Arc::clone(&a)]);

        orch.tick().await;
        // Let the transfer task finish
        while orch.agents()[0].is_busy() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // The task may still be wrapping up after clearing busy
        tokio::time::sleep(Duration::from_millis(20)).await;

        let report = orch.tick().await;
        assert_eq!(report.finished.len(), 1);
        assert_eq!(report.finished[0].plot, "a.plot");
        assert_eq!(orch.ticks(), 2);
        assert!(root.path().join("disk-0/a.plot").exists());
    }

    #[tokio::test]
    async fn test_live_reservations_bounded_by_volumes() {
        let root = tempdir().unwrap();
        let inv = inventory(&root, 2, 1 << 20);
        let sources: Vec<Arc<MemorySource>> = (0..4)
            .map(|i| {
                let plot = format!("p{i}.plot");
                Arc::new(MemorySource::new(&format!("mem://s{i}/"), &[(plot.as_str(), 10)]))
            })
            .collect();
        let orch = orchestrator(Arc::clone(&inv), sources);

        for _ in 0..6 {
            orch.tick().await;
            assert!(inv.live_reservations() <= 2);
        }
        orch.drain().await;
        assert_eq!(inv.live_reservations(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let root = tempdir().unwrap();
        let inv = inventory(&root, 1, 1 << 20);
        let a = Arc::new(MemorySource::new("mem://a/", &[("a.plot", 10)]));
        let agents = vec![Arc::new(SourceAgent::new(a as Arc<dyn SourceTransport>))];
        let orch = Arc::new(Orchestrator::new(
            inv,
            agents,
            JobSettings::default(),
            Duration::from_millis(20),
        ));
        let (tx, rx) = watch::channel(false);

        let runner = {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move { orch.run(rx).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        runner.await.unwrap();

        assert!(orch.ticks() >= 2);
        assert_eq!(orch.in_flight().await, 0);
        assert!(root.path().join("disk-0/a.plot").exists());
    }

    #[tokio::test]
    async fn test_status() {
        let root = tempdir().unwrap();
        let inv = inventory(&root, 2, 1000);
        let a = Arc::new(MemorySource::new("mem://a/", &[("a.plot", 10), ("b.plot", 20)]));
        let orch = orchestrator(inv, vec![a]);

        orch.tick().await;
        let status = orch.status();
        assert_eq!(status.ticks, 1);
        assert_eq!(status.volumes.len(), 2);
        assert_eq!(status.sources.len(), 1);
        assert_eq!(status.sources[0].url, "mem://a/");
        orch.drain().await;
    }
}
