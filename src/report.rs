//! Per-unit outcomes for batch steps.
//!
//! Enrichment and the orchestrator process independent units (channels,
//! images, steps). Each unit ends in a [`UnitOutcome`]; the outcomes of one
//! run are collected into a [`BatchReport`] that is printed and persisted, so
//! failures are recorded somewhere other than the log.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::files;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Status {
    Succeeded,
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitOutcome {
    /// Channel name, `channel/file` for images, or a step name.
    pub unit: String,
    #[serde(flatten)]
    pub status: Status,
    /// Rows or records produced by the unit.
    pub produced: u64,
}

impl UnitOutcome {
    pub fn succeeded(unit: impl Into<String>, produced: u64) -> Self {
        Self {
            unit: unit.into(),
            status: Status::Succeeded,
            produced,
        }
    }

    pub fn failed(unit: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            status: Status::Failed {
                reason: reason.into(),
            },
            produced: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Succeeded
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub step: String,
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcomes: Vec<UnitOutcome>,
}

impl BatchReport {
    pub fn new(step: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            run_id: run_id.into(),
            started_at: Utc::now(),
            finished_at: None,
            outcomes: Vec::new(),
        }
    }

    pub fn record(&mut self, outcome: UnitOutcome) {
        if let Status::Failed { reason } = &outcome.status {
            tracing::warn!(step = %self.step, unit = %outcome.unit, %reason, "unit failed");
        }
        self.outcomes.push(outcome);
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    pub fn produced(&self) -> u64 {
        self.outcomes.iter().map(|o| o.produced).sum()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &str)> {
        self.outcomes.iter().filter_map(|o| match &o.status {
            Status::Failed { reason } => Some((o.unit.as_str(), reason.as_str())),
            Status::Succeeded => None,
        })
    }

    /// Writes `<dir>/<step>_<run_id>.json` and returns its path.
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(format!("{}_{}.json", self.step, self.run_id));
        files::write_json_atomic(&path, self)?;
        Ok(path)
    }

    pub fn print_summary(&self) {
        println!("{} {}", self.step, self.run_id);
        println!("  succeeded: {}", self.succeeded());
        println!("  failed: {}", self.failed());
        println!("  produced: {}", self.produced());
        for (unit, reason) in self.failures() {
            println!("  ! {}: {}", unit, reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_outcomes() {
        let mut report = BatchReport::new("enrich", "run-1");
        report.record(UnitOutcome::succeeded("chan/1.jpg", 3));
        report.record(UnitOutcome::failed("chan/bad.jpg", "no message id"));
        report.record(UnitOutcome::succeeded("chan/2.jpg", 0));
        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.produced(), 3);
        let failures: Vec<_> = report.failures().collect();
        assert_eq!(failures, vec![("chan/bad.jpg", "no message id")]);
    }

    #[test]
    fn saved_report_is_json() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut report = BatchReport::new("enrich", "abc");
        report.record(UnitOutcome::failed("chan", "unreadable"));
        report.finish();
        let path = report.save(tmp.path()).unwrap();
        assert!(path.ends_with("enrich_abc.json"));

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(value["outcomes"][0]["status"], "failed");
        assert_eq!(value["outcomes"][0]["reason"], "unreadable");
    }
}
