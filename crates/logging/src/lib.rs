//! SwarmRoute Logging
//!
//! One place to install the tracing subscriber for SwarmRoute binaries.
//!
//! ```no_run
//! use swarmroute_logging::{init, LogLevel};
//!
//! // -v on the command line maps to a verbosity count
//! init(LogLevel::from_verbosity(1));
//! ```
//!
//! `RUST_LOG` overrides the level when set, e.g.
//! `RUST_LOG=swarmroute_client=debug,info`.

use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// - `0` → `Info`
    /// - `1` → `Debug`
    /// - `2+` → `Trace`
    pub fn from_verbosity(count: u8) -> Self {
        match count {
            0 => Self::Info,
            1 => Self::Debug,
            _ => Self::Trace,
        }
    }

    /// `Warn` when the caller only wants machine-readable output
    pub fn quiet_or(self, quiet: bool) -> Self {
        if quiet {
            Self::Warn
        } else {
            self
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

/// Install the subscriber.
///
/// # Panics
///
/// Panics if a subscriber is already set; use [`try_init`] to handle that.
pub fn init(level: LogLevel) {
    try_init(level).expect("Failed to initialize logging");
}

/// Install the subscriber, writing to stderr so stdout stays clean for
/// command output
pub fn try_init(level: LogLevel) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(matches!(level, LogLevel::Debug | LogLevel::Trace))
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| e.to_string())
}
