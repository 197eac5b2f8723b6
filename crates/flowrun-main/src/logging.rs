use error_stack::ResultExt as _;
use std::{fs::File, path::Path, sync::Mutex};
use tracing_subscriber::{
    EnvFilter, filter::LevelFilter, fmt::writer::BoxMakeWriter, layer::SubscriberExt as _,
    util::SubscriberInitExt as _,
};

use crate::{MainError, Result};

/// The flowrun workspace crates, as tracing target prefixes. The CLI's
/// `--log-level` applies to exactly these.
const FLOWRUN_TARGETS: &[&str] = &[
    "flowrun_core",
    "flowrun_registry",
    "flowrun_sandbox",
    "flowrun_state",
    "flowrun_queue",
    "flowrun_interpreter",
    "flowrun_worker",
    "flowrun_main",
];

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

// Must render a valid `--log-level` value; clap uses it for defaults.
impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

/// One directive per flowrun crate on top of the catch-all level.
fn cli_directives(log_level: LogLevel, other_log_level: LogLevel) -> String {
    let mut directives = String::from(other_log_level.as_str());
    for target in FLOWRUN_TARGETS {
        directives.push_str(&format!(",{}={}", target, log_level.as_str()));
    }
    directives
}

/// `RUST_LOG` wins when set; otherwise the CLI levels apply.
fn build_filter(log_level: LogLevel, other_log_level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli_directives(log_level, other_log_level)))
}

/// Initialize the global tracing subscriber.
///
/// Logs go to stderr unless `log_file` is given, keeping stdout free for
/// run reports and validation output.
pub fn init_tracing(
    log_level: LogLevel,
    other_log_level: LogLevel,
    log_file: Option<&Path>,
) -> Result<()> {
    let writer = match log_file {
        Some(path) => {
            let file = File::create(path)
                .change_context_lazy(|| MainError::CreateOutput(path.to_owned()))?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_timer(tracing_subscriber::fmt::time::LocalTime::rfc_3339())
        .with_writer(writer);

    tracing_subscriber::registry()
        .with(build_filter(log_level, other_log_level))
        .with(tracing_error::ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|_| MainError::TracingInit)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_renders_as_clap_value() {
        assert_eq!(LogLevel::Trace.to_string(), "trace");
        assert_eq!(LogLevel::Info.to_string(), "info");
        assert_eq!(LogLevel::Error.to_string(), "error");
    }

    #[test]
    fn test_log_level_to_level_filter() {
        assert_eq!(LevelFilter::from(LogLevel::Debug), LevelFilter::DEBUG);
        assert_eq!(LevelFilter::from(LogLevel::Warn), LevelFilter::WARN);
    }

    #[test]
    fn test_directives_scope_flowrun_crates() {
        let directives = cli_directives(LogLevel::Debug, LogLevel::Warn);
        assert!(directives.starts_with("warn,"));
        assert!(directives.contains("flowrun_interpreter=debug"));
        assert!(directives.contains("flowrun_queue=debug"));
        // Every directive must parse.
        EnvFilter::builder().parse(&directives).unwrap();
    }
}
