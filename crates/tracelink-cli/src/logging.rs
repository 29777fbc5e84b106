//! Logging configuration and initialization.
//!
//! Presets map the CLI verbosity flags onto per-target `tracing` filters;
//! `RUST_LOG` overrides everything when set.

use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(format!("Invalid log format: '{}'. Use 'text' or 'json'.", s)),
        }
    }
}

/// Logging preset levels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogPreset {
    /// Warnings and errors only; the child's own output still prints.
    #[default]
    Production,
    /// Operational detail: session lifecycle, wait terminations.
    Verbose,
    /// Everything including per-record trace flow.
    Debug,
}

impl LogPreset {
    pub fn from_flags(verbose: bool, debug: bool) -> Self {
        if debug {
            LogPreset::Debug
        } else if verbose {
            LogPreset::Verbose
        } else {
            LogPreset::Production
        }
    }

    fn filter(&self) -> EnvFilter {
        if let Ok(env_filter) = EnvFilter::try_from_default_env() {
            return env_filter;
        }
        let directives = match self {
            LogPreset::Production => "tracelink=warn",
            LogPreset::Verbose => "tracelink=info",
            LogPreset::Debug => "tracelink=trace",
        };
        EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new("warn"))
    }
}

/// Initialize the tracing subscriber. Logs go to stderr so they never mix
/// with the echoed child output on stdout.
pub fn init(preset: LogPreset, format: LogFormat) {
    let filter = preset.filter();
    match format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_target(true),
                )
                .init();
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .json()
                        .with_writer(std::io::stderr)
                        .with_target(true),
                )
                .init();
        }
    }
}
