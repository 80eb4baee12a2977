//! Per-run context threaded through every stage of the pipeline.
//!
//! Collects stage durations, excluded hosts and failed VMs. Nothing here
//! outlives a run: the driver creates one context and hands it down.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Final outcome of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// Every enabled phase ran and nothing was excluded.
    Completed,
    /// Some hosts or VMs were excluded but at least one VM was placed.
    PartiallyCompleted,
    /// A fatal failure happened before any VM was placed.
    Aborted { reason: String },
}

impl RunStatus {
    pub fn label(&self) -> &'static str {
        match self {
            RunStatus::Completed => "COMPLETED",
            RunStatus::PartiallyCompleted => "PARTIALLY COMPLETED",
            RunStatus::Aborted { .. } => "ABORTED",
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, RunStatus::Aborted { .. })
    }
}

/// Elapsed time of one stage or phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTiming {
    pub name: String,
    pub elapsed: Duration,
}

#[derive(Debug)]
pub struct RunContext {
    started: Instant,
    stages: Vec<StageTiming>,
    excluded_hosts: BTreeMap<String, String>,
    failed_vms: BTreeMap<String, String>,
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RunContext {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            stages: Vec::new(),
            excluded_hosts: BTreeMap::new(),
            failed_vms: BTreeMap::new(),
        }
    }

    /// Record a stage that started at `since`. Returns the elapsed time.
    pub fn finish_stage(&mut self, name: &str, since: Instant) -> Duration {
        let elapsed = since.elapsed();
        self.record_stage(name, elapsed);
        elapsed
    }

    pub fn record_stage(&mut self, name: &str, elapsed: Duration) {
        self.stages.push(StageTiming {
            name: name.to_string(),
            elapsed,
        });
    }

    pub fn stages(&self) -> &[StageTiming] {
        &self.stages
    }

    pub fn stage(&self, name: &str) -> Option<&StageTiming> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Mark a host as unusable for the rest of the run. The first reason wins.
    pub fn exclude_host(&mut self, host: &str, reason: impl Into<String>) {
        self.excluded_hosts
            .entry(host.to_string())
            .or_insert_with(|| reason.into());
    }

    pub fn fail_vm(&mut self, vm: &str, reason: impl Into<String>) {
        self.failed_vms
            .entry(vm.to_string())
            .or_insert_with(|| reason.into());
    }

    pub fn is_host_excluded(&self, host: &str) -> bool {
        self.excluded_hosts.contains_key(host)
    }

    pub fn excluded_hosts(&self) -> &BTreeMap<String, String> {
        &self.excluded_hosts
    }

    pub fn failed_vms(&self) -> &BTreeMap<String, String> {
        &self.failed_vms
    }

    pub fn total_elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// One text bar per stage, proportional to its share of the recorded time.
    pub fn timing_bars(&self, width: usize) -> Vec<String> {
        let total: f64 = self.stages.iter().map(|s| s.elapsed.as_secs_f64()).sum();
        let mut offset = 0usize;
        self.stages
            .iter()
            .map(|s| {
                let len = if total > 0.0 {
                    ((s.elapsed.as_secs_f64() / total) * width as f64) as usize
                } else {
                    0
                };
                let bar = format!(
                    "{:<16} {}{} {:.2}s",
                    s.name,
                    " ".repeat(offset),
                    "X".repeat(len.max(1)),
                    s.elapsed.as_secs_f64()
                );
                offset += len;
                bar
            })
            .collect()
    }
}
