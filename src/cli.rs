use std::{env, ffi::OsString, path::PathBuf, process::ExitCode};

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, info_span, warn};
use uuid::Uuid;

use crate::{
    config::{ConfigError, RunConfig, SettingsLayer, SortMode},
    driver::{LoadDriver, Pacer},
    http::{BlockingSearchHttp, SearchHttp},
    plan::{RunCursor, total_iterations},
    report::{ObservationLog, RunSummary, SummaryBuilder, render_summary, write_summary},
    request::SearchRequest,
    telemetry::{self, TraceSettings},
};

#[derive(Parser, Debug)]
#[command(
    name = "pagesweep",
    version,
    about = "Sequential paginated product-search load driver",
    long_about = "Sweeps GET /api/v1/products page by page with a single worker, \
                  checks for status 200 and records per-page latency. Every option \
                  can also be set through the environment (BASE_URL, BRAND_ID, PAGES, \
                  START_PAGE, SIZE, SORT, KEYWORD, REPEAT, SLEEP_SEC, TIMEOUT_SEC)."
)]
pub struct Cli {
    /// Action to perform (defaults to `run`).
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub settings: SettingsArgs,

    #[command(flatten)]
    pub output: OutputArgs,

    /// Increase logging verbosity.
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    pub verbose: bool,

    /// Also write a JSON trace of the run to the platform cache directory.
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    pub trace: bool,

    /// Write JSON traces to DIR (implies --trace).
    #[arg(long, global = true, value_name = "DIR")]
    pub trace_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Execute the sweep and print a summary.
    Run,
    /// Print the resolved configuration and request sequence without sending anything.
    Plan,
}

/// Run settings. Flags take precedence over the environment, which takes
/// precedence over `--config`.
#[derive(Args, Debug, Clone, Default)]
pub struct SettingsArgs {
    /// TOML file with run settings.
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Target host, e.g. http://localhost:8080.
    #[arg(long, global = true)]
    pub base_url: Option<String>,

    #[arg(long, global = true, allow_negative_numbers = true)]
    pub brand_id: Option<i64>,

    /// Number of pages sampled per pass.
    #[arg(long, global = true, allow_negative_numbers = true)]
    pub pages: Option<i64>,

    /// First page index (0 or 1 depending on the service).
    #[arg(long, global = true, allow_negative_numbers = true)]
    pub start_page: Option<i64>,

    /// Page size.
    #[arg(long, global = true, allow_negative_numbers = true)]
    pub size: Option<i64>,

    #[arg(long, global = true, value_enum, ignore_case = true)]
    pub sort: Option<SortMode>,

    /// Optional keyword filter.
    #[arg(long, global = true)]
    pub keyword: Option<String>,

    /// Passes over the page range.
    #[arg(long, global = true, allow_negative_numbers = true)]
    pub repeat: Option<i64>,

    /// Pause between requests, in seconds.
    #[arg(long, global = true, allow_negative_numbers = true)]
    pub sleep_sec: Option<f64>,

    /// Per-request timeout, in seconds.
    #[arg(long, global = true, allow_negative_numbers = true)]
    pub timeout_sec: Option<f64>,
}

impl SettingsArgs {
    fn to_layer(&self) -> SettingsLayer {
        SettingsLayer {
            base_url: self.base_url.clone(),
            brand_id: self.brand_id,
            pages: self.pages,
            start_page: self.start_page,
            size: self.size,
            sort: self.sort.map(|sort| sort.as_str().to_string()),
            keyword: self.keyword.clone(),
            repeat: self.repeat,
            sleep_sec: self.sleep_sec,
            timeout_sec: self.timeout_sec,
        }
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct OutputArgs {
    /// Stream every observation to FILE as JSON lines.
    #[arg(long, global = true, value_name = "FILE")]
    pub observations: Option<PathBuf>,

    /// Write the run summary to FILE as JSON.
    #[arg(long, global = true, value_name = "FILE")]
    pub summary_export: Option<PathBuf>,

    /// Exit non-zero when any check failed (after the run completes).
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    pub fail_on_error: bool,
}

/// Merge `--config`, the environment (through `lookup`) and flags, in that order.
pub fn resolve_config<F>(settings: &SettingsArgs, lookup: F) -> Result<RunConfig, ConfigError>
where
    F: Fn(&str) -> Option<OsString>,
{
    let mut layer = SettingsLayer::default();
    if let Some(path) = &settings.config {
        layer = layer.merge(SettingsLayer::from_file(path)?);
    }
    layer
        .merge(SettingsLayer::from_os_lookup(lookup)?)
        .merge(settings.to_layer())
        .resolve()
}

pub fn run() -> Result<ExitCode> {
    let cli = Cli::parse();

    let run_id = Uuid::new_v4();
    let traces = if cli.trace || cli.trace_dir.is_some() {
        TraceSettings::in_directory(run_id, cli.trace_dir.clone())
    } else {
        TraceSettings::disabled(run_id)
    };
    telemetry::init_tracing("pagesweep", cli.verbose, &traces)?;
    if let Some(path) = telemetry::current_trace_file() {
        info!(path = %path.display(), "writing JSON trace");
    }

    let config = resolve_config(&cli.settings, |key| env::var_os(key))
        .context("invalid configuration")?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Plan => {
            print_plan(&config);
            Ok(ExitCode::SUCCESS)
        }
        Command::Run => {
            let http = BlockingSearchHttp::new(config.timeout)?;
            let summary = sweep(run_id, LoadDriver::new(config, http), &cli.output)?;
            print!("{}", render_summary(&summary));
            if should_fail(&summary, cli.output.fail_on_error) {
                Ok(ExitCode::FAILURE)
            } else {
                Ok(ExitCode::SUCCESS)
            }
        }
    }
}

/// Drive the whole run, exporting as configured. Only export failures are errors.
pub fn sweep<H, P>(
    run_id: Uuid,
    driver: LoadDriver<H, P>,
    output: &OutputArgs,
) -> Result<RunSummary>
where
    H: SearchHttp,
    P: Pacer,
{
    let config = driver.config().clone();
    let mut builder = SummaryBuilder::with_run_id(&config, run_id);
    let mut log = output
        .observations
        .as_deref()
        .map(ObservationLog::create)
        .transpose()?;
    let mut log_error = None;

    let span = info_span!(
        "pagesweep.run",
        run = %builder.run_id(),
        base_url = %config.base_url,
        brand_id = config.brand_id,
        sort = %config.sort,
        planned = driver.total_iterations()
    );
    let _span_guard = span.enter();
    info!(
        pages = config.pages,
        start_page = config.start_page,
        size = config.size,
        repeat = config.repeat,
        sleep_s = config.sleep.as_secs_f64(),
        "starting sweep"
    );

    let last_page = u64::from(config.start_page) + u64::from(config.pages.saturating_sub(1));
    for observation in driver.execute() {
        let write_failure = match log.as_mut() {
            Some(writer) => writer.append(&observation).err(),
            None => None,
        };
        if let Some(err) = write_failure {
            warn!(error = %format!("{err:#}"), "observation log disabled after write failure");
            log = None;
            log_error = Some(err);
        }
        builder.record(&observation);
        if observation.label.page == last_page {
            info!(pass = observation.pass, "completed pass");
        }
    }

    let summary = builder.finish();
    info!(
        total = summary.total,
        failed = summary.failed,
        transport_errors = summary.transport_errors,
        "sweep finished"
    );

    if let Some(writer) = log {
        let path = writer.finish()?;
        info!(path = %path.display(), "wrote observations");
    }
    if let Some(path) = &output.summary_export {
        write_summary(path, &summary)?;
        info!(path = %path.display(), "wrote run summary");
    }
    if let Some(err) = log_error {
        return Err(err.context("observation export failed"));
    }

    Ok(summary)
}

fn should_fail(summary: &RunSummary, fail_on_error: bool) -> bool {
    fail_on_error && !summary.all_passed()
}

fn print_plan(config: &RunConfig) {
    println!(
        "base_url={} brandId={} sort={} size={} keyword={} pages={} start_page={} repeat={} sleep={}s",
        config.base_url,
        config.brand_id,
        config.sort,
        config.size,
        config.keyword.as_deref().unwrap_or("(unset)"),
        config.pages,
        config.start_page,
        config.repeat,
        config.sleep.as_secs_f64()
    );
    println!("{} request(s):", total_iterations(config));
    for index in RunCursor::new(config) {
        let request = SearchRequest::for_iteration(config, index);
        println!("{:>6} pass={} {}", index.iteration, index.pass, request.url);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpOutcome;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::fs;
    use std::time::Duration;
    use tempfile::tempdir;

    struct FixedStatus {
        status: u16,
        urls: RefCell<Vec<String>>,
    }

    impl SearchHttp for FixedStatus {
        fn get(&self, url: &str) -> Result<HttpOutcome> {
            self.urls.borrow_mut().push(url.to_string());
            Ok(HttpOutcome {
                status: self.status,
                body_bytes: 2,
            })
        }
    }

    struct NoPause;

    impl Pacer for NoPause {
        fn pause(&self, _duration: Duration) {}
    }

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<OsString> {
        let map: HashMap<String, OsString> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), OsString::from(v)))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_to_run_without_subcommand() {
        let cli = Cli::parse_from(["pagesweep"]);
        assert_eq!(cli.command, None);
        assert!(!cli.output.fail_on_error);
    }

    #[test]
    fn parses_settings_after_subcommand() {
        let cli = Cli::parse_from([
            "pagesweep",
            "plan",
            "--pages",
            "3",
            "--sort",
            "latest",
            "--keyword",
            "wool socks",
            "--sleep-sec",
            "0.5",
        ]);
        assert_eq!(cli.command, Some(Command::Plan));
        assert_eq!(cli.settings.pages, Some(3));
        assert_eq!(cli.settings.sort, Some(SortMode::Latest));
        assert_eq!(cli.settings.keyword.as_deref(), Some("wool socks"));
        assert_eq!(cli.settings.sleep_sec, Some(0.5));
    }

    #[test]
    fn flags_override_environment_and_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sweep.toml");
        fs::write(&path, "pages = 9\nsize = 10\nbrand_id = 3\n").unwrap();

        let cli = Cli::parse_from([
            "pagesweep",
            "--config",
            path.to_str().unwrap(),
            "--size",
            "30",
        ]);
        let config =
            resolve_config(&cli.settings, env_from(&[("PAGES", "4"), ("SIZE", "15")])).unwrap();
        assert_eq!(config.pages, 4);
        assert_eq!(config.size, 30);
        assert_eq!(config.brand_id, 3);
    }

    #[test]
    fn invalid_environment_fails_before_any_request() {
        let cli = Cli::parse_from(["pagesweep"]);
        let err = resolve_config(&cli.settings, env_from(&[("PAGES", "abc")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidNumber { key: "PAGES", .. }));
    }

    #[cfg(unix)]
    #[test]
    fn non_utf8_environment_fails_before_any_request() {
        use std::os::unix::ffi::OsStringExt;

        let cli = Cli::parse_from(["pagesweep", "--pages", "3"]);
        let err = resolve_config(&cli.settings, |key: &str| {
            (key == "BRAND_ID").then(|| OsString::from_vec(vec![0x31, 0xff, 0x32]))
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::NotUnicode { key: "BRAND_ID" }));
    }

    #[test]
    fn zero_page_sweep_sends_nothing() {
        let config = RunConfig {
            pages: 0,
            repeat: 4,
            ..RunConfig::default()
        };
        let http = FixedStatus {
            status: 200,
            urls: RefCell::new(Vec::new()),
        };
        let run_id = Uuid::new_v4();
        let summary = sweep(
            run_id,
            LoadDriver::with_pacer(config, &http, NoPause),
            &OutputArgs::default(),
        )
        .unwrap();
        assert!(http.urls.borrow().is_empty());
        assert_eq!(summary.run_id, run_id);
        assert_eq!(summary.total, 0);
        assert!(summary.pages.is_empty());
        assert!(render_summary(&summary).contains("pages=-"));
    }

    #[test]
    fn failing_service_still_completes_the_run() {
        let dir = tempdir().unwrap();
        let output = OutputArgs {
            observations: Some(dir.path().join("obs.jsonl")),
            summary_export: Some(dir.path().join("summary.json")),
            fail_on_error: true,
        };
        let config = RunConfig {
            pages: 5,
            repeat: 2,
            ..RunConfig::default()
        };
        let http = FixedStatus {
            status: 500,
            urls: RefCell::new(Vec::new()),
        };

        let summary = sweep(
            Uuid::new_v4(),
            LoadDriver::with_pacer(config, &http, NoPause),
            &output,
        )
        .unwrap();
        assert_eq!(http.urls.borrow().len(), 10);
        assert_eq!(summary.total, 10);
        assert_eq!(summary.failure_rate, 1.0);
        assert!(should_fail(&summary, true));
        assert!(!should_fail(&summary, false));

        let lines = fs::read_to_string(dir.path().join("obs.jsonl")).unwrap();
        assert_eq!(lines.lines().count(), 10);
        assert!(dir.path().join("summary.json").exists());
    }

    #[test]
    fn healthy_service_passes_every_check() {
        let config = RunConfig {
            pages: 3,
            repeat: 1,
            start_page: 1,
            ..RunConfig::default()
        };
        let http = FixedStatus {
            status: 200,
            urls: RefCell::new(Vec::new()),
        };
        let summary = sweep(
            Uuid::new_v4(),
            LoadDriver::with_pacer(config, &http, NoPause),
            &OutputArgs::default(),
        )
        .unwrap();
        assert!(summary.all_passed());
        assert!(!should_fail(&summary, true));
        let pages: Vec<u64> = summary.pages.iter().map(|page| page.page).collect();
        assert_eq!(pages, vec![1, 2, 3]);
    }
}
