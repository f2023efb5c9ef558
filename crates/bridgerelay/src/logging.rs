//! Stderr logging for the `bridgerelay` binary.
//!
//! `--log-level` sets the level for the relay itself. Per-channel mux events
//! stay at `info` or below unless `trace` is asked for. `BRIDGERELAY_LOG`
//! takes a full filter directive (`bridgerelay_core=debug,bridgerelay_mux=trace`)
//! and wins over both.

use clap::ValueEnum;
use tracing_subscriber::EnvFilter;

/// Environment variable holding a filter directive that overrides `--log-level`.
pub const LOG_ENV: &str = "BRIDGERELAY_LOG";

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn name(self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    /// Level applied to `bridgerelay_mux` when the relay runs at `self`.
    fn mux_level(self) -> LogLevel {
        match self {
            LogLevel::Debug => LogLevel::Info,
            other => other,
        }
    }

    /// Filter directive used when no override is set.
    pub fn directive(self) -> String {
        if self == LogLevel::Off {
            return "off".to_string();
        }
        format!("{},bridgerelay_mux={}", self.name(), self.mux_level().name())
    }
}

fn filter(level: LogLevel) -> EnvFilter {
    match std::env::var(LOG_ENV) {
        Ok(directive) if !directive.trim().is_empty() => {
            EnvFilter::try_new(directive).unwrap_or_else(|err| {
                eprintln!("warning: ignoring {LOG_ENV}: {err}");
                EnvFilter::new(level.directive())
            })
        }
        _ => EnvFilter::new(level.directive()),
    }
}

/// Install the stderr subscriber. Mux reader and dispatcher threads are
/// named, so thread names are included.
pub fn init_logging(format: LogFormat, level: LogLevel) {
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter(level))
        .with_ansi(false)
        .with_target(false)
        .with_thread_names(true);

    match format {
        LogFormat::Text => {
            let _ = builder.try_init();
        }
        LogFormat::Json => {
            let _ = builder.json().try_init();
        }
    }
}
