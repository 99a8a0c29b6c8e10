use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use once_cell::sync::OnceCell;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt};
use uuid::Uuid;

static TRACE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();
static ACTIVE_TRACE_FILE: OnceCell<PathBuf> = OnceCell::new();

const TRACE_SUFFIX: &str = ".trace.jsonl";

/// JSON trace export for one sweep. The file is named after the run id, so a
/// trace lines up with the summary exported for the same run.
#[derive(Debug, Clone)]
pub struct TraceSettings {
    pub run_id: Uuid,
    pub enabled: bool,
    pub directory: Option<PathBuf>,
}

impl TraceSettings {
    pub fn disabled(run_id: Uuid) -> Self {
        Self {
            run_id,
            enabled: false,
            directory: None,
        }
    }

    pub fn in_directory(run_id: Uuid, directory: Option<PathBuf>) -> Self {
        Self {
            run_id,
            enabled: true,
            directory,
        }
    }
}

/// Install the global subscriber. Console output always; with traces enabled,
/// every debug-and-above event is also written as JSON to the run's trace file.
pub fn init_tracing(service: &str, verbose: bool, traces: &TraceSettings) -> Result<()> {
    let default_level = if verbose {
        "pagesweep=debug"
    } else {
        "pagesweep=info"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let trace_layer = match open_run_trace(service, traces)? {
        Some((writer, guard, path)) => {
            let _ = TRACE_GUARD.set(guard);
            let _ = ACTIVE_TRACE_FILE.set(path);
            Some(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_writer(writer)
                    .with_filter(LevelFilter::DEBUG),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(false))
        .with(trace_layer)
        .try_init()
        .context("tracing subscriber already installed")
}

/// Trace file written by this process, if trace export is active.
pub fn current_trace_file() -> Option<&'static PathBuf> {
    ACTIVE_TRACE_FILE.get()
}

fn open_run_trace(
    service: &str,
    settings: &TraceSettings,
) -> Result<Option<(NonBlocking, WorkerGuard, PathBuf)>> {
    if !settings.enabled {
        return Ok(None);
    }

    let directory = match &settings.directory {
        Some(dir) => dir.clone(),
        None => default_trace_directory()?,
    };
    fs::create_dir_all(&directory)
        .with_context(|| format!("failed to create trace directory {}", directory.display()))?;

    let path = trace_path(&directory, service, settings.run_id);
    // A run id names exactly one file; never append to another run's trace.
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .with_context(|| format!("failed to create trace file {}", path.display()))?;

    let (writer, guard) = tracing_appender::non_blocking(file);
    Ok(Some((writer, guard, path)))
}

fn default_trace_directory() -> Result<PathBuf> {
    let dirs = ProjectDirs::from("dev", "pagesweep", "pagesweep")
        .context("unable to resolve platform trace directory")?;
    Ok(dirs.cache_dir().join("traces"))
}

fn trace_path(directory: &Path, service: &str, run_id: Uuid) -> PathBuf {
    directory.join(format!("{service}-{run_id}{TRACE_SUFFIX}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn disabled_traces_open_nothing() {
        let settings = TraceSettings::disabled(Uuid::new_v4());
        assert!(open_run_trace("pagesweep", &settings).unwrap().is_none());
    }

    #[test]
    fn trace_file_is_named_after_the_run() {
        let dir = tempdir().unwrap();
        let run_id = Uuid::new_v4();
        let settings = TraceSettings::in_directory(run_id, Some(dir.path().join("traces")));

        let (_, _guard, path) = open_run_trace("pagesweep", &settings).unwrap().unwrap();

        assert_eq!(path, dir.path().join("traces").join(format!("pagesweep-{run_id}.trace.jsonl")));
        assert!(path.is_file());
    }

    #[test]
    fn other_runs_traces_are_left_alone() {
        let dir = tempdir().unwrap();
        let earlier = dir.path().join(format!("pagesweep-{}{TRACE_SUFFIX}", Uuid::new_v4()));
        fs::write(&earlier, b"{}\n").unwrap();

        let settings = TraceSettings::in_directory(Uuid::new_v4(), Some(dir.path().to_path_buf()));
        let (_, _guard, path) = open_run_trace("pagesweep", &settings).unwrap().unwrap();

        assert_ne!(path, earlier);
        assert_eq!(fs::read(&earlier).unwrap(), b"{}\n");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[test]
    fn reused_run_id_is_rejected() {
        let dir = tempdir().unwrap();
        let settings = TraceSettings::in_directory(Uuid::new_v4(), Some(dir.path().to_path_buf()));
        let _first = open_run_trace("pagesweep", &settings).unwrap();
        assert!(open_run_trace("pagesweep", &settings).is_err());
    }
}
