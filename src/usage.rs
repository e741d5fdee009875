//! Per-tunnel usage counters and the optional periodic reporter.

use crate::logger::{self, BreadcrumbFlags};
use parking_lot::Mutex;
use serde::Serialize;
use std::time::{Duration, Instant};

pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Counter update pushed by the relay link. Totals are absolute values.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UsageSample {
    pub live_connections: u64,
    pub total_connections: u64,
    pub total_req_bytes: u64,
    pub total_res_bytes: u64,
    pub total_tx_bytes: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageReport {
    pub elapsed_time: u64,
    pub num_live_connections: u64,
    pub num_total_connections: u64,
    pub num_total_req_bytes: u64,
    pub num_total_res_bytes: u64,
    pub num_total_tx_bytes: u64,
}

impl UsageReport {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[derive(Default)]
struct Counters {
    sample: UsageSample,
    active_since: Option<Instant>,
}

pub struct UsageMonitor {
    counters: Mutex<Counters>,
    reporter: Mutex<Option<tokio::task::JoinHandle<()>>>,
    interval: Duration,
}

impl Default for UsageMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_REPORT_INTERVAL)
    }
}

impl UsageMonitor {
    pub fn new(interval: Duration) -> Self {
        Self {
            counters: Mutex::new(Counters::default()),
            reporter: Mutex::new(None),
            interval: interval.max(Duration::from_millis(10)),
        }
    }

    /// Starts the elapsed-time clock the first time the tunnel goes active.
    pub fn mark_active(&self) {
        let mut counters = self.counters.lock();
        if counters.active_since.is_none() {
            counters.active_since = Some(Instant::now());
        }
    }

    pub fn record(&self, sample: UsageSample) {
        self.counters.lock().sample = sample;
    }

    pub fn snapshot(&self) -> UsageReport {
        let counters = self.counters.lock();
        UsageReport {
            elapsed_time: counters
                .active_since
                .map(|since| since.elapsed().as_secs())
                .unwrap_or(0),
            num_live_connections: counters.sample.live_connections,
            num_total_connections: counters.sample.total_connections,
            num_total_req_bytes: counters.sample.total_req_bytes,
            num_total_res_bytes: counters.sample.total_res_bytes,
            num_total_tx_bytes: counters.sample.total_tx_bytes,
        }
    }

    /// Installs the reporter task unless one is already running. The spawner
    /// receives the interval and returns the task handle.
    pub fn start_with(
        &self,
        spawn: impl FnOnce(Duration) -> tokio::task::JoinHandle<()>,
    ) -> bool {
        {
            let mut reporter = self.reporter.lock();
            if reporter.as_ref().map(|task| !task.is_finished()).unwrap_or(false) {
                return false;
            }
            *reporter = Some(spawn(self.interval));
        }
        logger::breadcrumb(BreadcrumbFlags::USAGE, "usage reporter started");
        true
    }

    /// Stops the reporter; a no-op when none is running.
    pub fn stop(&self) -> bool {
        let task = self.reporter.lock().take();
        match task {
            Some(task) => {
                task.abort();
                logger::breadcrumb(BreadcrumbFlags::USAGE, "usage reporter stopped");
                true
            }
            None => false,
        }
    }
}

impl Drop for UsageMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.reporter.get_mut().take() {
            task.abort();
        }
    }
}
