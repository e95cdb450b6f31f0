//! Bridge configuration.
//!
//! Defaults suit a local worker. Each field can be overridden from the
//! environment through [`BridgeConfig::from_env`]; invalid values are logged
//! and ignored.

use std::str::FromStr;
use std::time::Duration;

use crate::bridge::codec::DEFAULT_MAX_FRAME_LENGTH;

pub const ENV_BACKEND: &str = "SFBRIDGE_BACKEND";
pub const ENV_STARTUP_TIMEOUT_SECS: &str = "SFBRIDGE_STARTUP_TIMEOUT_SECS";
pub const ENV_TERMINATE_GRACE_MILLIS: &str = "SFBRIDGE_TERMINATE_GRACE_MILLIS";
pub const ENV_MAX_FRAME_BYTES: &str = "SFBRIDGE_MAX_FRAME_BYTES";

/// Which execution backend to start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackendPreference {
    /// Probe the worker image: in-process thread if available, else a child process.
    #[default]
    Auto,
    Thread,
    Process,
}

impl FromStr for BackendPreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" | "" => Ok(Self::Auto),
            "thread" => Ok(Self::Thread),
            "process" => Ok(Self::Process),
            other => Err(format!(
                "invalid backend '{other}', expected 'auto', 'thread' or 'process'"
            )),
        }
    }
}

impl std::fmt::Display for BackendPreference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Auto => "auto",
            Self::Thread => "thread",
            Self::Process => "process",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub backend: BackendPreference,
    /// How long to wait for the worker's Ready handshake.
    pub startup_timeout: Duration,
    /// How long a process worker may take to exit after its input closes before it is killed.
    pub terminate_grace: Duration,
    pub max_frame_length: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            backend: BackendPreference::Auto,
            startup_timeout: Duration::from_secs(30),
            terminate_grace: Duration::from_secs(2),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `SFBRIDGE_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    pub fn with_backend(mut self, backend: BackendPreference) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }

    pub fn with_max_frame_length(mut self, max: usize) -> Self {
        self.max_frame_length = max;
        self
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(backend) = parse_var(&lookup, ENV_BACKEND, str::parse::<BackendPreference>) {
            self.backend = backend;
        }
        if let Some(secs) = parse_var(&lookup, ENV_STARTUP_TIMEOUT_SECS, str::parse::<u64>) {
            self.startup_timeout = Duration::from_secs(secs);
        }
        if let Some(millis) = parse_var(&lookup, ENV_TERMINATE_GRACE_MILLIS, str::parse::<u64>) {
            self.terminate_grace = Duration::from_millis(millis);
        }
        if let Some(max) = parse_var(&lookup, ENV_MAX_FRAME_BYTES, str::parse::<usize>) {
            self.max_frame_length = max;
        }
        self
    }
}

fn parse_var<T, E: std::fmt::Display>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    parse: impl Fn(&str) -> Result<T, E>,
) -> Option<T> {
    let raw = lookup(key)?;
    match parse(raw.trim()) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(key, value = %raw, error = %e, "Ignoring invalid environment override");
            None
        }
    }
}
