use clap::ValueEnum;
use tracing_subscriber::EnvFilter;

/// Full filter directives (`target=level,...`); overrides `--log-level`.
pub const LOG_FILTER_ENV: &str = "SYNCLINK_LOG";

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Directives for `level`. The TLS stack stays at warn unless tracing.
fn default_directives(level: LogLevel) -> String {
    let tls = match level {
        LogLevel::Trace => "debug",
        LogLevel::Error => "error",
        _ => "warn",
    };
    format!("{},rustls={tls},tokio_rustls={tls}", level.as_str())
}

fn filter(level: LogLevel, from_env: Option<String>) -> EnvFilter {
    match from_env.filter(|directives| !directives.trim().is_empty()) {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::new(default_directives(level)),
    }
}

/// Install the stderr subscriber. Targets are printed from debug down, where
/// several crates interleave.
pub fn init_logging(format: LogFormat, level: LogLevel) {
    let filter = filter(level, std::env::var(LOG_FILTER_ENV).ok());
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_ansi(false)
        .with_target(matches!(level, LogLevel::Debug | LogLevel::Trace));

    let installed = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    // a subscriber is already set when embedded in tests
    drop(installed);
}
