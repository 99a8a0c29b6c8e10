use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::config::RunConfig;
use crate::observation::{Observation, validate};

/// Latency distribution in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencyStats {
    pub count: usize,
    pub min_ms: f64,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub max_ms: f64,
}

impl LatencyStats {
    /// `None` when there are no samples.
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let mut sorted = samples.to_vec();
        sorted.sort_by(f64::total_cmp);
        let sum: f64 = sorted.iter().sum();
        Some(Self {
            count: sorted.len(),
            min_ms: round_to_3(sorted[0]),
            mean_ms: round_to_3(sum / sorted.len() as f64),
            p50_ms: round_to_3(percentile(&sorted, 50.0)),
            p95_ms: round_to_3(percentile(&sorted, 95.0)),
            max_ms: round_to_3(sorted[sorted.len() - 1]),
        })
    }
}

/// Nearest-rank percentile over already sorted values.
pub fn percentile(sorted_values: &[f64], pct: f64) -> f64 {
    if sorted_values.is_empty() {
        return 0.0;
    }
    let index = (((pct / 100.0) * sorted_values.len() as f64).ceil() as usize)
        .saturating_sub(1)
        .min(sorted_values.len() - 1);
    sorted_values[index]
}

fn round_to_3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageSummary {
    pub page: u64,
    pub requests: u64,
    pub passed: u64,
    pub failed: u64,
    pub latency: Option<LatencyStats>,
}

/// Aggregated result of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub config: RunConfig,
    pub planned: u64,
    pub total: u64,
    pub passed: u64,
    pub failed: u64,
    pub transport_errors: u64,
    pub failure_rate: f64,
    pub latency: Option<LatencyStats>,
    pub pages: Vec<PageSummary>,
}

impl RunSummary {
    pub fn all_passed(&self) -> bool {
        self.failed == 0 && self.total == self.planned
    }
}

#[derive(Debug, Default)]
struct PageAccumulator {
    requests: u64,
    passed: u64,
    latencies: Vec<f64>,
}

/// Folds the observation stream into a [`RunSummary`].
#[derive(Debug)]
pub struct SummaryBuilder {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    config: RunConfig,
    total: u64,
    passed: u64,
    transport_errors: u64,
    latencies: Vec<f64>,
    pages: BTreeMap<u64, PageAccumulator>,
}

impl SummaryBuilder {
    pub fn new(config: &RunConfig) -> Self {
        Self::with_run_id(config, Uuid::new_v4())
    }

    pub fn with_run_id(config: &RunConfig, run_id: Uuid) -> Self {
        Self {
            run_id,
            started_at: Utc::now(),
            config: config.clone(),
            total: 0,
            passed: 0,
            transport_errors: 0,
            latencies: Vec::new(),
            pages: BTreeMap::new(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn record(&mut self, observation: &Observation) {
        let passed = validate(observation);
        self.total += 1;
        if passed {
            self.passed += 1;
        }
        if observation.is_transport_failure() {
            self.transport_errors += 1;
        }

        let page = self.pages.entry(observation.label.page).or_default();
        page.requests += 1;
        if passed {
            page.passed += 1;
        }
        if let Some(latency) = observation.latency_ms() {
            page.latencies.push(latency);
            self.latencies.push(latency);
        }
    }

    pub fn finish(mut self) -> RunSummary {
        // Planned pages nothing was recorded for are still listed, with no samples.
        let first = u64::from(self.config.start_page);
        for page in first..first + u64::from(self.config.pages) {
            self.pages.entry(page).or_default();
        }
        let failed = self.total - self.passed;
        let failure_rate = if self.total == 0 {
            0.0
        } else {
            failed as f64 / self.total as f64
        };
        let pages = self
            .pages
            .into_iter()
            .map(|(page, acc)| PageSummary {
                page,
                requests: acc.requests,
                passed: acc.passed,
                failed: acc.requests - acc.passed,
                latency: LatencyStats::from_samples(&acc.latencies),
            })
            .collect();

        RunSummary {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at: Utc::now(),
            planned: crate::plan::total_iterations(&self.config),
            config: self.config,
            total: self.total,
            passed: self.passed,
            failed,
            transport_errors: self.transport_errors,
            failure_rate,
            latency: LatencyStats::from_samples(&self.latencies),
            pages,
        }
    }
}

/// Streams observations to a JSON-lines file as they are produced.
pub struct ObservationLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl ObservationLog {
    pub fn create(path: &Path) -> Result<Self> {
        ensure_parent(path)?;
        let file = File::create(path)
            .with_context(|| format!("Failed to create observation log {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    pub fn append(&mut self, observation: &Observation) -> Result<()> {
        serde_json::to_writer(&mut self.writer, observation)
            .with_context(|| format!("Failed to write observation to {}", self.path.display()))?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    pub fn finish(mut self) -> Result<PathBuf> {
        self.writer
            .flush()
            .with_context(|| format!("Failed to flush observation log {}", self.path.display()))?;
        Ok(self.path)
    }
}

/// Write the summary as pretty JSON.
pub fn write_summary(path: &Path, summary: &RunSummary) -> Result<()> {
    ensure_parent(path)?;
    let json = serde_json::to_vec_pretty(summary).context("Failed to serialize run summary")?;
    fs::write(path, json)
        .with_context(|| format!("Failed to write run summary {}", path.display()))
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    Ok(())
}

fn format_ms(value: Option<f64>) -> String {
    match value {
        Some(ms) => format!("{ms:.1}ms"),
        None => "-".into(),
    }
}

fn page_range(config: &RunConfig) -> String {
    match config.pages.checked_sub(1) {
        Some(last) => format!(
            "{}..{}",
            config.start_page,
            u64::from(config.start_page) + u64::from(last)
        ),
        None => "-".into(),
    }
}

/// Human-readable end-of-run report.
pub fn render_summary(summary: &RunSummary) -> String {
    let mut out = String::new();
    let config = &summary.config;
    let _ = writeln!(
        out,
        "run {} | brandId={} sort={} size={} pages={} repeat={}",
        summary.run_id,
        config.brand_id,
        config.sort,
        config.size,
        page_range(config),
        config.repeat
    );
    let _ = writeln!(
        out,
        "checks: {}/{} passed ({:.2}% failed, {} transport errors)",
        summary.passed,
        summary.total,
        summary.failure_rate * 100.0,
        summary.transport_errors
    );
    let overall = summary.latency.as_ref();
    let _ = writeln!(
        out,
        "latency: p50={} p95={} max={}",
        format_ms(overall.map(|stats| stats.p50_ms)),
        format_ms(overall.map(|stats| stats.p95_ms)),
        format_ms(overall.map(|stats| stats.max_ms)),
    );
    let _ = writeln!(
        out,
        "{:>8} {:>6} {:>6} {:>10} {:>10} {:>10}",
        "page", "reqs", "fail", "mean", "p50", "p95"
    );
    for page in &summary.pages {
        let stats = page.latency.as_ref();
        let _ = writeln!(
            out,
            "{:>8} {:>6} {:>6} {:>10} {:>10} {:>10}",
            page.page,
            page.requests,
            page.failed,
            format_ms(stats.map(|s| s.mean_ms)),
            format_ms(stats.map(|s| s.p50_ms)),
            format_ms(stats.map(|s| s.p95_ms)),
        );
    }
    out
}
