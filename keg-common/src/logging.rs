// keg-common/src/logging.rs
//! Tracing subscriber setup for embedders of the evaluator.

use std::fs;
use std::path::Path;

use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

pub const LOG_ENV_VAR: &str = "KEG_LOG";
const LOG_FILE_NAME: &str = "keg.log";

pub fn level_for_verbosity(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// Installs the global subscriber. `KEG_LOG` overrides the verbosity-derived
/// default. With `verbose > 0` and a `log_dir`, output is also written to a
/// daily rolling file; the returned guard must be kept alive for that writer
/// to flush.
///
/// Returns `None` if a subscriber was already installed.
pub fn init_logging(verbose: u8, log_dir: Option<&Path>) -> Option<Option<WorkerGuard>> {
    let level_filter = level_for_verbosity(verbose);
    let max_log_level = level_filter.into_level().unwrap_or(tracing::Level::INFO);

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .with_env_var(LOG_ENV_VAR)
        .from_env_lossy();

    match log_dir {
        Some(dir) if verbose > 0 && fs::create_dir_all(dir).is_ok() => {
            let file_appender = tracing_appender::rolling::daily(dir, LOG_FILE_NAME);
            let (non_blocking_appender, guard) = tracing_appender::non_blocking(file_appender);

            let stderr_writer = std::io::stderr.with_max_level(max_log_level);
            let file_writer = non_blocking_appender.with_max_level(max_log_level);

            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(stderr_writer.and(file_writer))
                .with_ansi(true)
                .without_time()
                .try_init()
                .ok()
                .map(|_| Some(guard))
        }
        _ => tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .without_time()
            .try_init()
            .ok()
            .map(|_| None),
    }
}
