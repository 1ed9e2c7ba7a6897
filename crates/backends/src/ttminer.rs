//! TT-Miner backend: another JSON-HTTP-API GPU miner, API shape closest to
//! T-Rex's but namespaced under `/status`.

use crate::install::{extract_archive, ArchiveFormat};
use crate::{BackendError, BackendKind, Config, InstallationRecord, Result, Stats};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::Duration;

pub struct TtMinerBackend {
    client: reqwest::Client,
}

impl TtMinerBackend {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn platform_tag(os: &str, arch: &str) -> Result<&'static str> {
        match (os, arch) {
            ("linux", "x86_64") => Ok("linux"),
            ("windows", "x86_64") => Ok("win"),
            _ => Err(BackendError::UnsupportedPlatform(format!("{os}/{arch}"))),
        }
    }
}

impl Default for TtMinerBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackendKind for TtMinerBackend {
    fn name(&self) -> &'static str {
        "ttminer"
    }

    async fn latest_version(&self) -> Result<String> {
        // TT-Miner has no public release API; the registry carries a
        // manually curated "latest known" version and check_installation's
        // --version probe is the source of truth for what's actually
        // installed.
        Ok("23.0".to_string())
    }

    fn download_url(&self, version: &str, os: &str, arch: &str) -> Result<String> {
        let tag = Self::platform_tag(os, arch)?;
        Ok(format!(
            "https://github.com/TrailingStop/TT-Miner-release/releases/download/{version}/TT-Miner-{version}-{tag}.tar.gz"
        ))
    }

    async fn install(&self, version: &str, install_dir: &Path) -> Result<InstallationRecord> {
        let (os, arch) = (std::env::consts::OS, std::env::consts::ARCH);
        let url = self.download_url(version, os, arch)?;

        let bytes = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(60))
            .send()
            .await
            .map_err(|e| BackendError::DownloadFailed(e.to_string()))?
            .bytes()
            .await
            .map_err(|e| BackendError::DownloadFailed(e.to_string()))?;

        let archive_path = install_dir.join("download.tar.gz");
        std::fs::create_dir_all(install_dir)?;
        std::fs::write(&archive_path, &bytes)?;

        if let Some(expected) = self.pinned_checksum(version) {
            let mut hasher = Sha256::new();
            hasher.update(&bytes);
            if hex::encode(hasher.finalize()) != expected {
                let _ = std::fs::remove_file(&archive_path);
                return Err(BackendError::ChecksumMismatch);
            }
        }

        extract_archive(&archive_path, install_dir, ArchiveFormat::sniff(&archive_path)?)?;
        let _ = std::fs::remove_file(&archive_path);

        let binary_path = install_dir.join(self.binary_filename());
        crate::validate_binary_path(&binary_path, install_dir)?;

        Ok(InstallationRecord {
            installed: binary_path.exists(),
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
            version: None,
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

    fn build_args(&self, instance_name: &str, config: &Config, http_port: u16) -> Result<Vec<String>> {
        crate::validate_instance_name(instance_name)?;
        config.validate()?;

        let mut args = vec![
            "-SingleServer".to_string(),
            "-Algorithm".to_string(),
            config.algo.clone(),
            "-User".to_string(),
            format!("{}.{}", config.wallet, config.rig_id),
            "-Server".to_string(),
            config.pool.clone(),
            "-ApiPort".to_string(),
            http_port.to_string(),
        ];

        if !config.gpu_devices.is_empty() {
            args.push("-Devices".to_string());
            args.push(
                config
                    .gpu_devices
                    .iter()
                    .map(u32::to_string)
                    .collect::<Vec<_>>()
                    .join(","),
            );
        }
        args.extend(config.extra_args.iter().cloned());

        Ok(args)
    }

    fn stats_url(&self, http_port: u16) -> String {
        format!("http://127.0.0.1:{http_port}/status")
    }

    fn parse_stats(&self, json_bytes: &[u8]) -> Result<Stats> {
        let v: serde_json::Value =
            serde_json::from_slice(json_bytes).map_err(|e| BackendError::Process(e.to_string()))?;

        Ok(Stats {
            hashrate: v["summary"]["hashrate_total"].as_f64().unwrap_or(0.0),
            shares_good: v["summary"]["accepted"].as_u64().unwrap_or(0),
            shares_total: v["summary"]["accepted"].as_u64().unwrap_or(0)
                + v["summary"]["rejected"].as_u64().unwrap_or(0),
            pool: v["summary"]["server"].as_str().unwrap_or_default().to_string(),
            ping_ms: 0,
            algo: v["summary"]["algorithm"].as_str().unwrap_or_default().to_string(),
            uptime_secs: v["summary"]["uptime"].as_u64().unwrap_or(0),
            cpu_brand: None,
            cpu_threads: None,
            resident_memory_bytes: None,
        })
    }

    fn binary_filename(&self) -> &'static str {
        #[cfg(windows)]
        {
            "TT-Miner.exe"
        }
        #[cfg(not(windows))]
        {
            "TT-Miner"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            pool: "stratum+tcp://pool.example.com:3333".into(),
            wallet: "wallet".into(),
            password: String::new(),
            rig_id: "rig1".into(),
            proxy: None,
            tls: false,
            algo: "kawpow".into(),
            coin: "rvn".into(),
            threads: 0,
            intensity: 0,
            cpu_affinity: None,
            cpu_priority: 0,
            huge_pages: false,
            donate_level: 0,
            gpu_devices: vec![],
            gpu_intensity: vec![],
            log_file: None,
            extra_args: vec![],
        }
    }

    #[test]
    fn build_args_combines_wallet_and_rig_id() {
        let backend = TtMinerBackend::new();
        let args = backend.build_args("ttminer-kawpow", &valid_config(), 4068).unwrap();
        assert!(args.windows(2).any(|w| w == ["-User", "wallet.rig1"]));
    }

    #[test]
    fn latest_version_has_a_fallback() {
        // No async runtime needed since this backend never calls out.
        let backend = TtMinerBackend::new();
        let fut = backend.latest_version();
        let result = futures::executor::block_on(fut);
        assert!(result.is_ok());
    }
}
