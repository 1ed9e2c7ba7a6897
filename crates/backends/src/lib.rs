//! Backend Registry: enumerates installable miner kinds and gives each a
//! uniform contract (download, install, config-file writing, argv building,
//! stats-URL shape). No inheritance chain — a flat registry keyed by name,
//! per Design Notes: runtime-polymorphic backends are a tagged trait object,
//! not a class hierarchy.

mod config;
mod install;
mod lolminer;
mod trex;
mod ttminer;
mod xmrig;

#[cfg(any(test, feature = "test-backends"))]
mod fake;

pub use config::{split_argv, validate_instance_name, Config};
pub use install::{extract_archive, ArchiveFormat};
pub use lolminer::LolMinerBackend;
pub use trex::TRexBackend;
pub use ttminer::TtMinerBackend;
pub use xmrig::XmrigBackend;

#[cfg(any(test, feature = "test-backends"))]
pub use fake::FakeBackend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("binary not found: {0}")]
    BinaryNotFound(String),
    #[error("checksum mismatch - archive or binary may be tampered")]
    ChecksumMismatch,
    #[error("binary quarantined by the OS: {0}")]
    Quarantined(String),
    #[error("download failed: {0}")]
    DownloadFailed(String),
    #[error("process error: {0}")]
    Process(String),
    #[error("security: path traversal detected")]
    PathTraversal,
    #[error("security: invalid file permissions")]
    InvalidPermissions,
    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),
    #[error("remote error: {0}")]
    Remote(String),
    #[error("unknown backend: {0}")]
    UnknownBackend(String),
}

pub type Result<T> = std::result::Result<T, BackendError>;

/// Per-(BackendKind) installation snapshot. Recomputed by a live probe,
/// cached to disk by the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstallationRecord {
    pub installed: bool,
    pub version: Option<String>,
    pub install_path: Option<PathBuf>,
    pub binary_path: Option<PathBuf>,
    pub config_path: Option<PathBuf>,
}

/// Uniform view over a backend's HTTP stats document (spec §6): missing
/// fields default to zero/empty rather than erroring, since backends vary in
/// which fields they populate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stats {
    pub hashrate: f64,
    pub shares_good: u64,
    pub shares_total: u64,
    pub pool: String,
    pub ping_ms: u64,
    pub algo: String,
    pub uptime_secs: u64,
    pub cpu_brand: Option<String>,
    pub cpu_threads: Option<u32>,
    pub resident_memory_bytes: Option<u64>,
}

impl Stats {
    pub fn rejected_shares(&self) -> u64 {
        self.shares_total.saturating_sub(self.shares_good)
    }
}

/// A miner family sharing one contract (spec §3/§4.A). Immutable at runtime:
/// every method takes `&self`, mutable state (install paths, checksums)
/// belongs to the caller via `InstallationRecord`.
#[async_trait]
pub trait BackendKind: Send + Sync {
    fn name(&self) -> &'static str;

    /// Queries the upstream release index. `ErrRemote` on network/parse
    /// errors — never panics on a malformed response.
    async fn latest_version(&self) -> Result<String>;

    /// Deterministic URL template; fails with `UnsupportedPlatform` rather
    /// than guessing at an unknown combination.
    fn download_url(&self, version: &str, os: &str, arch: &str) -> Result<String>;

    /// Downloads the archive, verifies format, extracts with zip-slip /
    /// symlink / size-cap protection (see `install::extract_archive`), and
    /// returns the populated record.
    async fn install(&self, version: &str, install_dir: &std::path::Path) -> Result<InstallationRecord>;

    /// Cheap filesystem probe plus a `--version` invocation if the binary
    /// exists.
    async fn check_installation(&self, install_dir: &std::path::Path) -> Result<InstallationRecord>;

    /// Stops any running instance of this kind is the *caller's*
    /// responsibility (the Supervisor owns the instance map); this only
    /// removes the install directory.
    async fn uninstall(&self, install_dir: &std::path::Path) -> Result<()>;

    /// Builds the argv passed directly to process creation — never a shell
    /// command line. Any `extra_args` are already argv-split and
    /// allowlist-validated by `Config::validate`.
    fn build_args(&self, instance_name: &str, config: &Config, http_port: u16) -> Result<Vec<String>>;

    fn stats_url(&self, http_port: u16) -> String;

    fn parse_stats(&self, json_bytes: &[u8]) -> Result<Stats>;

    /// Optional pinned checksum for the installed binary. `None` means the
    /// registry has no pin for this version — install proceeds but logs a
    /// warning rather than failing closed, matching the teacher's
    /// development-mode fallback.
    fn pinned_checksum(&self, _version: &str) -> Option<String> {
        None
    }

    fn binary_filename(&self) -> &'static str {
        self.name()
    }
}

/// Flat registry keyed by name (Design Notes §9: no inheritance chain).
#[derive(Default, Clone)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn BackendKind>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the four shipped backends.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(XmrigBackend::new()));
        registry.register(Arc::new(TtMinerBackend::new()));
        registry.register(Arc::new(TRexBackend::new()));
        registry.register(Arc::new(LolMinerBackend::new()));
        registry
    }

    pub fn register(&mut self, backend: Arc<dyn BackendKind>) {
        self.backends.insert(backend.name().to_string(), backend);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn BackendKind>> {
        self.backends
            .get(name)
            .cloned()
            .ok_or_else(|| BackendError::UnknownBackend(name.to_string()))
    }

    pub fn list(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.backends.values().map(|b| b.name()).collect();
        names.sort_unstable();
        names
    }
}

/// Validates an on-disk binary path stays within an expected base directory.
/// Generalizes the teacher's single-binary check to any backend's install
/// directory.
pub fn validate_binary_path(path: &std::path::Path, allowed_base: &std::path::Path) -> Result<()> {
    let canonical = path.canonicalize().map_err(|_| BackendError::PathTraversal)?;
    let canonical_base = allowed_base
        .canonicalize()
        .map_err(|_| BackendError::PathTraversal)?;

    if !canonical.starts_with(&canonical_base) {
        return Err(BackendError::PathTraversal);
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let metadata = std::fs::metadata(&canonical)?;
        let mode = metadata.permissions().mode();
        if mode & 0o002 != 0 {
            tracing::warn!(path = %canonical.display(), "installed binary is world-writable");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_with_defaults_lists_all_four() {
        let registry = BackendRegistry::with_defaults();
        assert_eq!(registry.list(), vec!["lolminer", "t-rex", "ttminer", "xmrig"]);
    }

    #[test]
    fn registry_get_unknown_errors() {
        let registry = BackendRegistry::new();
        assert!(registry.get("doesnotexist").is_err());
    }
}
