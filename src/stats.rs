//! Verdict counters and periodic size reports.

use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use log::info;
use parking_lot::Mutex;
use serde::Serialize;

use crate::pipeline::Verdict;

const REPORT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub total: u64,
    pub allowed: u64,
    pub denied: u64,
    pub repeated: u64,
}

/// Entries held by each store.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Sizes {
    pub rules: usize,
    pub hosts: usize,
    pub pids: usize,
    pub conns: usize,
    pub pending: usize,
    pub prompts: usize,
}

#[derive(Serialize)]
struct Report {
    #[serde(flatten)]
    counters: Counters,
    #[serde(flatten)]
    sizes: Sizes,
}

#[derive(Default)]
pub struct Stats {
    counters: Mutex<Counters>,
}

impl Stats {
    pub fn record(&self, verdict: Verdict) {
        let mut counters = self.counters.lock();
        counters.total += 1;
        match verdict {
            Verdict::Allow => counters.allowed += 1,
            Verdict::Deny => counters.denied += 1,
            Verdict::Repeat => counters.repeated += 1,
        }
    }

    pub fn snapshot(&self) -> Counters {
        *self.counters.lock()
    }

    fn report(&self, sizes: Sizes) -> Result<String> {
        let report = Report {
            counters: self.snapshot(),
            sizes,
        };
        serde_json::to_string(&report).context("failed to encode stats")
    }

    /// Log counters and store sizes every few seconds.
    pub fn run_size_logger<F>(&self, sizes: F) -> Result<()>
    where
        F: Fn() -> Sizes,
    {
        loop {
            info!("Stats {}", self.report(sizes())?);
            thread::sleep(REPORT_INTERVAL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_verdicts() {
        let stats = Stats::default();
        stats.record(Verdict::Allow);
        stats.record(Verdict::Repeat);
        stats.record(Verdict::Deny);
        stats.record(Verdict::Allow);

        assert_eq!(
            stats.snapshot(),
            Counters {
                total: 4,
                allowed: 2,
                denied: 1,
                repeated: 1
            }
        );
    }

    #[test]
    fn report_is_flat_json() {
        let stats = Stats::default();
        stats.record(Verdict::Deny);
        let sizes = Sizes {
            rules: 3,
            ..Sizes::default()
        };

        let json: serde_json::Value = serde_json::from_str(&stats.report(sizes).unwrap()).unwrap();
        assert_eq!(json["denied"], 1);
        assert_eq!(json["rules"], 3);
        assert_eq!(json["prompts"], 0);
    }
}
