use tracing::info;
use tracing::{level_filters::LevelFilter, Level};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, layer::SubscriberExt};

use crate::config::HarnessConfig;

const LOG_FILE_NAME: &str = "etcd-flood.log";

/// Sends every event to stdout and to a daily rolling file under `logs_path`.
/// Both guards must be kept alive for the duration of the run.
pub fn init_tracing(logs_path: &str, log_level: Level) -> (WorkerGuard, WorkerGuard) {
    let (non_blocking_stdout, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    let stdout_layer = fmt::layer()
        .with_target(true)
        .with_writer(non_blocking_stdout);

    let file_appender = RollingFileAppender::new(Rotation::DAILY, logs_path, LOG_FILE_NAME);

    let (non_blocking_file, log_file_guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_target(true)
        .with_writer(non_blocking_file);

    tracing_subscriber::registry()
        .with(LevelFilter::from_level(log_level))
        .with(stdout_layer)
        .with(file_layer)
        .init();

    (stdout_guard, log_file_guard)
}

macro_rules! log_env_var {
    ($label:expr, $env_var:expr) => {
        if let Some(value) = option_env!($env_var) {
            info!("{}: {}", $label, value);
        }
    };
}

pub fn log_build_information() {
    log_env_var!("Version", "CARGO_PKG_VERSION");
    log_env_var!("Git Branch", "VERGEN_GIT_BRANCH");
    log_env_var!("Git Commit ID", "VERGEN_GIT_SHA");
    log_env_var!("Git Commit Message", "VERGEN_GIT_COMMIT_MESSAGE");
    log_env_var!("Build Date", "VERGEN_BUILD_DATE");
    log_env_var!("Rust Version", "VERGEN_RUSTC_SEMVER");
}

pub fn log_app_config(app_config: &HarnessConfig) {
    info!("Starting etcd flood harness with the following config:");
    info!("{}", app_config);
}
