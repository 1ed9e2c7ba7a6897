//! Deterministic backend for tests that exercise the Supervisor/Instance
//! machinery without a real miner binary, generalizing the teacher's
//! `FakeMinerAdapter`/`FakeCpuminerAdapter` into one `BackendKind` impl.

use crate::{BackendError, BackendKind, Config, InstallationRecord, Result, Stats};
use async_trait::async_trait;
use std::path::Path;

pub struct FakeBackend;

impl FakeBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackendKind for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn latest_version(&self) -> Result<String> {
        Ok("0.0.0-fake".to_string())
    }

    fn download_url(&self, _version: &str, _os: &str, _arch: &str) -> Result<String> {
        Ok("file:///dev/null".to_string())
    }

    async fn install(&self, version: &str, install_dir: &Path) -> Result<InstallationRecord> {
        std::fs::create_dir_all(install_dir)?;
        let binary_path = install_dir.join(self.binary_filename());
        std::fs::write(&binary_path, b"#!/bin/sh\nsleep 3600\n")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&binary_path, std::fs::Permissions::from_mode(0o755))?;
        }
        Ok(InstallationRecord {
            installed: true,
            version: Some(version.to_string()),
            install_path: Some(install_dir.to_path_buf()),
            binary_path: Some(binary_path),
            config_path: None,
        })
    }

    async fn check_installation(&self, install_dir: &Path) -> Result<InstallationRecord> {
        let binary_path = install_dir.join(self.binary_filename());
        Ok(InstallationRecord {
            installed: binary_path.exists(),
            version: Some("0.0.0-fake".to_string()),
            install_path: Some(install_dir.to_path_buf()),
            binary_path: binary_path.exists().then_some(binary_path),
            config_path: None,
        })
    }

    async fn uninstall(&self, install_dir: &Path) -> Result<()> {
        if install_dir.exists() {
            tokio::fs::remove_dir_all(install_dir).await?;
        }
        Ok(())
    }

    fn build_args(&self, instance_name: &str, config: &Config, _http_port: u16) -> Result<Vec<String>> {
        crate::validate_instance_name(instance_name)?;
        config.validate()?;
        Ok(vec![])
    }

    fn stats_url(&self, http_port: u16) -> String {
        format!("http://127.0.0.1:{http_port}/fake-stats")
    }

    fn parse_stats(&self, json_bytes: &[u8]) -> Result<Stats> {
        serde_json::from_slice(json_bytes).map_err(|e| BackendError::Process(e.to_string()))
    }

    fn binary_filename(&self) -> &'static str {
        "fake-miner.sh"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_stats_round_trips_default() {
        let backend = FakeBackend::new();
        let body = serde_json::to_vec(&Stats::default()).unwrap();
        assert_eq!(backend.parse_stats(&body).unwrap().hashrate, 0.0);
    }

    #[tokio::test]
    async fn install_writes_an_executable_stub() {
        let dir = std::env::temp_dir().join(format!("fleetctl-fake-{}", std::process::id()));
        let backend = FakeBackend::new();
        let record = backend.install("0.0.0-fake", &dir).await.unwrap();
        assert!(record.installed);
        assert!(record.binary_path.unwrap().exists());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
