//! Day-by-day traversal of archived job boards and keyword-share aggregation.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;
use vtrend_adapters::{adapter_for_site, SiteAdapter};
use vtrend_archive::{
    ArchiveClientConfig, ArchiveFetcher, BackoffPolicy, CachedSource, FetchOutcome,
    OfflineSource, SnapshotSource, SnapshotStore, TokenBucketConfig, DEFAULT_ARCHIVE_HOST,
};
use vtrend_core::{
    normalize_title, percentage, site_label, AggregateResult, DayRecord, PercentageEntry,
    SiteKind, SnapshotRequest, UnsupportedSite,
};

pub const CRATE_NAME: &str = "vtrend-aggregate";

#[derive(Debug, Clone, Deserialize)]
pub struct SiteRegistry {
    pub sites: Vec<SiteConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    pub url: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub start: NaiveDate,
    pub end: NaiveDate,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    UnsupportedSite(#[from] UnsupportedSite),
    #[error("site {url}: keywords must not be blank")]
    EmptyKeyword { url: String },
    #[error("site {url}: start {start} is after end {end}")]
    InvertedRange {
        url: String,
        start: NaiveDate,
        end: NaiveDate,
    },
    #[error("site {url} is configured more than once")]
    DuplicateSite { url: String },
    #[error("parsing site registry: {0}")]
    Parse(#[from] serde_yaml::Error),
}

impl SiteRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Validate enabled sites. Runs before any snapshot is requested.
    pub fn resolve(&self) -> Result<Vec<SiteTarget>, ConfigError> {
        let mut seen = HashSet::new();
        let mut targets = Vec::new();
        for site in self.sites.iter().filter(|s| s.enabled) {
            if !seen.insert(site.url.clone()) {
                return Err(ConfigError::DuplicateSite {
                    url: site.url.clone(),
                });
            }
            targets.push(SiteTarget::new(
                &site.url,
                site.keywords.clone(),
                site.start,
                site.end,
            )?);
        }
        Ok(targets)
    }
}

/// A validated site: resolved board kind, deduplicated keywords, inclusive day range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SiteTarget {
    pub url: String,
    pub kind: SiteKind,
    pub keywords: Vec<String>,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl SiteTarget {
    pub fn new(
        url: &str,
        keywords: Vec<String>,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Self, ConfigError> {
        let kind = SiteKind::resolve(url)?;
        if start > end {
            return Err(ConfigError::InvertedRange {
                url: url.to_string(),
                start,
                end,
            });
        }

        // Keep the configured casing for reports; dedup on the form the matcher compares.
        let mut seen = HashSet::new();
        let mut unique = Vec::new();
        for keyword in keywords {
            let keyword = keyword.split_whitespace().collect::<Vec<_>>().join(" ");
            if keyword.is_empty() {
                return Err(ConfigError::EmptyKeyword {
                    url: url.to_string(),
                });
            }
            if seen.insert(normalize_title(&keyword)) {
                unique.push(keyword);
            }
        }

        Ok(Self {
            url: url.to_string(),
            kind,
            keywords: unique,
            start,
            end,
        })
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        self.start.iter_days().take_while(move |day| *day <= end)
    }

    pub fn day_count(&self) -> usize {
        (self.end - self.start).num_days() as usize + 1
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub archive_host: String,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub max_attempts: usize,
    pub retry_delay_ms: u64,
    pub fetch_concurrency: usize,
    pub requests_per_minute: Option<u32>,
    pub snapshots_dir: PathBuf,
    pub snapshot_cache: bool,
    pub offline: bool,
    pub workspace_root: PathBuf,
    pub registry_path: PathBuf,
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "TRUE" | "True" | "yes")
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

impl RunConfig {
    pub fn from_env() -> Self {
        let workspace_root = PathBuf::from(".");
        Self {
            archive_host: std::env::var("VTREND_ARCHIVE_HOST")
                .unwrap_or_else(|_| DEFAULT_ARCHIVE_HOST.to_string()),
            http_timeout_secs: env_parse("VTREND_HTTP_TIMEOUT_SECS").unwrap_or(10),
            user_agent: std::env::var("VTREND_USER_AGENT")
                .unwrap_or_else(|_| "vtrend-bot/0.1".to_string()),
            max_attempts: env_parse("VTREND_MAX_ATTEMPTS").unwrap_or(3),
            retry_delay_ms: env_parse("VTREND_RETRY_DELAY_MS").unwrap_or(0),
            fetch_concurrency: env_parse("VTREND_FETCH_CONCURRENCY").unwrap_or(1),
            requests_per_minute: env_parse("VTREND_REQUESTS_PER_MINUTE"),
            snapshots_dir: std::env::var("SNAPSHOTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./snapshots")),
            snapshot_cache: std::env::var("VTREND_SNAPSHOT_CACHE")
                .map(|v| parse_flag(&v))
                .unwrap_or(true),
            offline: std::env::var("VTREND_OFFLINE")
                .map(|v| parse_flag(&v))
                .unwrap_or(false),
            registry_path: std::env::var("VTREND_SITES")
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace_root.join("sites.yaml")),
            workspace_root,
        }
    }

    pub fn archive_client_config(&self) -> ArchiveClientConfig {
        ArchiveClientConfig {
            archive_host: self.archive_host.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy {
                max_attempts: self.max_attempts.max(1),
                base_delay: Duration::from_millis(self.retry_delay_ms),
                ..Default::default()
            },
            token_bucket: self.requests_per_minute.map(TokenBucketConfig::per_minute),
        }
    }

    pub fn build_source(&self) -> Result<Arc<dyn SnapshotSource>> {
        let store = SnapshotStore::new(self.snapshots_dir.clone());
        if self.offline {
            return Ok(Arc::new(OfflineSource::new(store)));
        }
        let fetcher: Arc<dyn SnapshotSource> =
            Arc::new(ArchiveFetcher::new(self.archive_client_config())?);
        if self.snapshot_cache {
            Ok(Arc::new(CachedSource::new(fetcher, store)))
        } else {
            Ok(fetcher)
        }
    }
}

#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("day {day} for {site} merged after {last}")]
    OutOfOrder {
        site: String,
        day: NaiveDate,
        last: NaiveDate,
    },
}

#[derive(Debug, Default)]
struct SiteAccumulator {
    running_total: usize,
    last_day: Option<NaiveDate>,
}

/// Folds Day Records into an [`AggregateResult`], owning the per-site running totals.
#[derive(Debug, Default)]
pub struct AggregationEngine {
    sites: BTreeMap<String, SiteAccumulator>,
    result: AggregateResult,
}

impl AggregationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accumulate(
        site: &str,
        day: NaiveDate,
        postings: &[String],
        keywords: &[String],
    ) -> DayRecord {
        DayRecord::accumulate(site, day, postings, keywords)
    }

    /// Make the site visible in the result even if no day ends up observed.
    pub fn register_site(&mut self, site: &str) {
        self.sites.entry(site.to_string()).or_default();
        self.result.percentages.entry(site.to_string()).or_default();
        self.result.total_postings_all.entry(site.to_string()).or_default();
        self.result
            .total_matched_across_keywords
            .entry(site.to_string())
            .or_default();
    }

    /// Days of one site must arrive in strictly increasing order.
    pub fn merge(&mut self, record: &DayRecord) -> Result<(), AggregateError> {
        let acc = self.sites.entry(record.site.clone()).or_default();
        if let Some(last) = acc.last_day {
            if record.day <= last {
                return Err(AggregateError::OutOfOrder {
                    site: record.site.clone(),
                    day: record.day,
                    last,
                });
            }
        }
        acc.last_day = Some(record.day);

        if !record.observed {
            return Ok(());
        }

        acc.running_total += record.total_matched_across_keywords;
        let running_total = acc.running_total;
        let denominator = record.total_matched_across_keywords;

        self.result
            .total_postings_all
            .entry(record.site.clone())
            .or_default()
            .insert(record.day, record.total_postings_on_page);
        self.result
            .total_matched_across_keywords
            .entry(record.site.clone())
            .or_default()
            .insert(record.day, denominator);

        let by_keyword = self.result.percentages.entry(record.site.clone()).or_default();
        for (keyword, &quantity) in &record.keyword_counts {
            by_keyword
                .entry(keyword.clone())
                .or_default()
                .push(PercentageEntry {
                    day: record.day,
                    percentage: percentage(quantity, denominator),
                    quantity,
                    total_matched_across_keywords: denominator,
                    running_total,
                });
        }
        Ok(())
    }

    pub fn running_total(&self, site: &str) -> usize {
        self.sites.get(site).map(|s| s.running_total).unwrap_or(0)
    }

    pub fn finish(self) -> AggregateResult {
        self.result
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DayStatus {
    Observed,
    NotFound,
    Unavailable,
    ExtractionFailed,
}

/// Turn one day's fetch outcome into a Day Record. Never fails: problems become an
/// unobserved record.
pub fn process_day(
    target: &SiteTarget,
    adapter: &dyn SiteAdapter,
    day: NaiveDate,
    outcome: FetchOutcome,
) -> (DayRecord, DayStatus) {
    match outcome {
        FetchOutcome::Markup(markup) => match adapter.extract(&markup, day) {
            Ok(postings) => (
                DayRecord::accumulate(&target.url, day, &postings, &target.keywords),
                DayStatus::Observed,
            ),
            Err(err) => {
                warn!(site = %target.url, %day, error = %err, "extraction failed; day skipped");
                (DayRecord::unobserved(&target.url, day), DayStatus::ExtractionFailed)
            }
        },
        FetchOutcome::NotFound => (DayRecord::unobserved(&target.url, day), DayStatus::NotFound),
        FetchOutcome::Unavailable { .. } => {
            (DayRecord::unobserved(&target.url, day), DayStatus::Unavailable)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SiteRunStats {
    pub url: String,
    pub days_total: usize,
    pub observed: usize,
    pub not_found: usize,
    pub unavailable: usize,
    pub extraction_failures: usize,
    pub postings_seen: usize,
}

impl SiteRunStats {
    fn new(url: &str, days_total: usize) -> Self {
        Self {
            url: url.to_string(),
            days_total,
            ..Default::default()
        }
    }

    fn record(&mut self, status: DayStatus, postings: usize) {
        match status {
            DayStatus::Observed => self.observed += 1,
            DayStatus::NotFound => self.not_found += 1,
            DayStatus::Unavailable => self.unavailable += 1,
            DayStatus::ExtractionFailed => self.extraction_failures += 1,
        }
        self.postings_seen += postings;
    }
}

/// Per-day progress callbacks. All methods default to no-ops.
pub trait ProgressObserver: Send + Sync {
    fn site_started(&self, _target: &SiteTarget) {}

    fn day_processed(
        &self,
        _target: &SiteTarget,
        _day: NaiveDate,
        _status: DayStatus,
        _done: usize,
        _total: usize,
    ) {
    }

    fn site_finished(&self, _target: &SiteTarget, _stats: &SiteRunStats) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgress;

impl ProgressObserver for TracingProgress {
    fn site_started(&self, target: &SiteTarget) {
        info!(site = %target.url, kind = %target.kind, days = target.day_count(), "analyzing site");
    }

    fn day_processed(
        &self,
        target: &SiteTarget,
        day: NaiveDate,
        status: DayStatus,
        done: usize,
        total: usize,
    ) {
        info!(site = %target.url, %day, ?status, done, total, "day processed");
    }

    fn site_finished(&self, target: &SiteTarget, stats: &SiteRunStats) {
        info!(
            site = %target.url,
            observed = stats.observed,
            not_found = stats.not_found,
            unavailable = stats.unavailable,
            extraction_failures = stats.extraction_failures,
            "site finished"
        );
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TrendRun {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stats: Vec<SiteRunStats>,
    pub result: AggregateResult,
}

pub struct TrendPipeline {
    source: Arc<dyn SnapshotSource>,
    fetch_concurrency: usize,
    progress: Arc<dyn ProgressObserver>,
}

impl TrendPipeline {
    pub fn new(source: Arc<dyn SnapshotSource>) -> Self {
        Self {
            source,
            fetch_concurrency: 1,
            progress: Arc::new(TracingProgress),
        }
    }

    pub fn with_fetch_concurrency(mut self, fetch_concurrency: usize) -> Self {
        self.fetch_concurrency = fetch_concurrency.max(1);
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressObserver>) -> Self {
        self.progress = progress;
        self
    }

    pub async fn run(&self, targets: &[SiteTarget]) -> Result<TrendRun> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let mut engine = AggregationEngine::new();
        let mut stats = Vec::with_capacity(targets.len());

        for target in targets {
            stats.push(self.run_site(target, &mut engine).await?);
        }

        Ok(TrendRun {
            run_id,
            started_at,
            finished_at: Utc::now(),
            stats,
            result: engine.finish(),
        })
    }

    async fn run_site(
        &self,
        target: &SiteTarget,
        engine: &mut AggregationEngine,
    ) -> Result<SiteRunStats, AggregateError> {
        let adapter = adapter_for_site(target.kind);
        let days = target.days().collect::<Vec<_>>();
        let mut stats = SiteRunStats::new(&target.url, days.len());

        engine.register_site(&target.url);
        self.progress.site_started(target);

        let mut done = 0usize;
        for window in days.chunks(self.fetch_concurrency) {
            let outcomes = self.fetch_window(&target.url, window).await;
            for (day, outcome) in window.iter().copied().zip(outcomes) {
                let (record, status) = process_day(target, adapter.as_ref(), day, outcome);
                stats.record(status, record.total_postings_on_page);
                engine.merge(&record)?;
                done += 1;
                self.progress
                    .day_processed(target, day, status, done, days.len());
            }
        }

        self.progress.site_finished(target, &stats);
        Ok(stats)
    }

    /// Fetch a window of days concurrently; outcomes come back in day order.
    async fn fetch_window(&self, url: &str, days: &[NaiveDate]) -> Vec<FetchOutcome> {
        if let [day] = days {
            return vec![self.source.fetch(&SnapshotRequest::new(url, *day)).await];
        }

        let mut set = JoinSet::new();
        for (slot, day) in days.iter().copied().enumerate() {
            let source = Arc::clone(&self.source);
            let request = SnapshotRequest::new(url, day);
            set.spawn(async move { (slot, source.fetch(&request).await) });
        }

        let mut outcomes: Vec<Option<FetchOutcome>> = vec![None; days.len()];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((slot, outcome)) => outcomes[slot] = Some(outcome),
                Err(err) => warn!(site = url, error = %err, "snapshot fetch task failed"),
            }
        }

        outcomes
            .into_iter()
            .map(|outcome| {
                outcome.unwrap_or_else(|| FetchOutcome::Unavailable {
                    attempts: 0,
                    last_error: "fetch task did not complete".to_string(),
                })
            })
            .collect()
    }
}

/// Consumer of a finished run (charting, spreadsheet export, ...).
pub trait ReportSink {
    fn consume(&mut self, run: &TrendRun) -> Result<()>;
}

/// One row per (site, keyword, day) for tabular export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRow {
    #[serde(rename = "Website")]
    pub website: String,
    #[serde(rename = "Keyword")]
    pub keyword: String,
    #[serde(rename = "Quantity")]
    pub quantity: usize,
    #[serde(rename = "Percentage")]
    pub percentage: f64,
    #[serde(rename = "Total_Matched_Across_Keywords")]
    pub total_matched_across_keywords: usize,
    #[serde(rename = "Total_Running_Quantity")]
    pub total_running_quantity: usize,
    #[serde(rename = "Date")]
    pub date: NaiveDate,
}

pub fn export_rows(result: &AggregateResult) -> Vec<ExportRow> {
    result
        .percentages
        .iter()
        .flat_map(|(site, by_keyword)| {
            by_keyword.iter().flat_map(move |(keyword, entries)| {
                entries.iter().map(move |entry| ExportRow {
                    website: site.clone(),
                    keyword: keyword.clone(),
                    quantity: entry.quantity,
                    percentage: entry.percentage,
                    total_matched_across_keywords: entry.total_matched_across_keywords,
                    total_running_quantity: entry.running_total,
                    date: entry.day,
                })
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartPoint {
    pub day: NaiveDate,
    pub percentage: f64,
    pub quantity: usize,
    /// Sum of `quantity` over this series up to and including `day`.
    pub cumulative_quantity: usize,
    pub total_matched_across_keywords: usize,
    pub running_total: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartSeries {
    pub site: String,
    pub keyword: String,
    pub label: String,
    /// Mean percentage over days where the keyword had a positive share.
    pub average_percentage: f64,
    pub points: Vec<ChartPoint>,
}

/// Stacked-chart input: days with zero quantity are left out, as are empty series.
pub fn chart_series(result: &AggregateResult) -> Vec<ChartSeries> {
    let mut series = Vec::new();
    for (site, by_keyword) in &result.percentages {
        let domain = site_label(site);
        for (keyword, entries) in by_keyword {
            let mut cumulative_quantity = 0usize;
            let points = entries
                .iter()
                .filter(|e| e.quantity > 0)
                .map(|e| {
                    cumulative_quantity += e.quantity;
                    ChartPoint {
                        day: e.day,
                        percentage: e.percentage,
                        quantity: e.quantity,
                        cumulative_quantity,
                        total_matched_across_keywords: e.total_matched_across_keywords,
                        running_total: e.running_total,
                    }
                })
                .collect::<Vec<_>>();
            if points.is_empty() {
                continue;
            }

            let positive = points
                .iter()
                .map(|p| p.percentage)
                .filter(|p| *p > 0.0)
                .collect::<Vec<_>>();
            let average_percentage = if positive.is_empty() {
                0.0
            } else {
                positive.iter().sum::<f64>() / positive.len() as f64
            };

            series.push(ChartSeries {
                site: site.clone(),
                keyword: keyword.clone(),
                label: format!("{keyword}-{average_percentage:.2}% {domain}"),
                average_percentage,
                points,
            });
        }
    }
    series
}

/// Writes `reports/{run_id}/` with the aggregate, export rows, chart series and a summary.
#[derive(Debug, Clone)]
pub struct JsonReportSink {
    reports_root: PathBuf,
    last_run_dir: Option<PathBuf>,
}

impl JsonReportSink {
    pub fn new(reports_root: impl Into<PathBuf>) -> Self {
        Self {
            reports_root: reports_root.into(),
            last_run_dir: None,
        }
    }

    pub fn last_run_dir(&self) -> Option<&Path> {
        self.last_run_dir.as_deref()
    }
}

fn write_json<T: Serialize>(dir: &Path, name: &str, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value).with_context(|| format!("serializing {name}"))?;
    let path = dir.join(name);
    std::fs::write(&path, bytes).with_context(|| format!("writing {}", path.display()))
}

pub fn summary_markdown(run: &TrendRun) -> String {
    let mut lines = vec![
        "# Vacancy Trend Run".to_string(),
        String::new(),
        format!("- Run ID: `{}`", run.run_id),
        format!("- Started: {}", run.started_at),
        format!("- Finished: {}", run.finished_at),
        format!("- Sites: {}", run.stats.len()),
        String::new(),
        "## Sites".to_string(),
    ];
    for s in &run.stats {
        lines.push(format!(
            "- {}: observed {}/{} days, not found {}, unavailable {}, \
             extraction failures {}, postings {}",
            s.url,
            s.observed,
            s.days_total,
            s.not_found,
            s.unavailable,
            s.extraction_failures,
            s.postings_seen
        ));
    }
    lines.push(String::new());
    lines.join("\n")
}

impl ReportSink for JsonReportSink {
    fn consume(&mut self, run: &TrendRun) -> Result<()> {
        let run_dir = self.reports_root.join(run.run_id.to_string());
        std::fs::create_dir_all(&run_dir)
            .with_context(|| format!("creating {}", run_dir.display()))?;

        write_json(&run_dir, "aggregate.json", &run.result)?;
        write_json(&run_dir, "export_rows.json", &export_rows(&run.result))?;
        write_json(&run_dir, "chart_series.json", &chart_series(&run.result))?;
        write_json(&run_dir, "run_stats.json", &run.stats)?;
        let summary = run_dir.join("summary.md");
        std::fs::write(&summary, summary_markdown(run))
            .with_context(|| format!("writing {}", summary.display()))?;

        self.last_run_dir = Some(run_dir);
        Ok(())
    }
}

pub async fn run_once(
    config: &RunConfig,
    registry: &SiteRegistry,
) -> Result<(TrendRun, PathBuf)> {
    let targets = registry.resolve()?;
    let source = config.build_source()?;
    let pipeline = TrendPipeline::new(source).with_fetch_concurrency(config.fetch_concurrency);
    let run = pipeline.run(&targets).await?;

    let sink = JsonReportSink::new(config.workspace_root.join("reports"));
    tokio::task::spawn_blocking(move || -> Result<(TrendRun, PathBuf)> {
        let mut sink = sink;
        sink.consume(&run)?;
        let run_dir = sink
            .last_run_dir()
            .map(Path::to_path_buf)
            .context("report sink did not record a run directory")?;
        Ok((run, run_dir))
    })
    .await
    .context("report writer task failed")?
}

pub async fn run_once_from_env() -> Result<(TrendRun, PathBuf)> {
    let config = RunConfig::from_env();
    let registry = SiteRegistry::load(&config.registry_path)?;
    run_once(&config, &registry).await
}
