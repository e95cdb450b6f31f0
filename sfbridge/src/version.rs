//! Version information exchanged in the worker handshake.

/// sfbridge version from Cargo.toml
pub const SFBRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Identity a worker announces in its `Ready` message.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct VersionInfo {
    /// sfbridge version the worker was built from.
    pub sfbridge: String,
    /// OS process id of the worker (the parent's own pid for thread workers).
    pub pid: u32,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            sfbridge: SFBRIDGE_VERSION.to_string(),
            pid: std::process::id(),
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Same major.minor as this build. Patch releases never change the wire format.
    pub fn is_compatible(&self) -> bool {
        major_minor(&self.sfbridge) == major_minor(SFBRIDGE_VERSION)
    }
}

fn major_minor(version: &str) -> Option<(&str, &str)> {
    let mut parts = version.split('.');
    Some((parts.next()?, parts.next()?))
}
