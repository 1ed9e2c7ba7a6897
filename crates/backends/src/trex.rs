//! T-Rex backend: NVIDIA GPU miner with a JSON HTTP API at `/summary`,
//! structurally close to XMRig's but keyed by GPU rather than CPU.

use crate::install::{extract_archive, ArchiveFormat};
use crate::{BackendError, BackendKind, Config, InstallationRecord, Result, Stats};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::Duration;

pub struct TRexBackend {
    client: reqwest::Client,
}

impl TRexBackend {
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

impl Default for TRexBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackendKind for TRexBackend {
    fn name(&self) -> &'static str {
        "t-rex"
    }

    async fn latest_version(&self) -> Result<String> {
        let resp = self
            .client
            .get("https://api.github.com/repos/trexminer/T-Rex/releases/latest")
            .header("User-Agent", "fleetctl")
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| BackendError::Remote(e.to_string()))?;

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| BackendError::Remote(e.to_string()))?;

        body["tag_name"]
            .as_str()
            .map(|s| s.trim_start_matches('v').to_string())
            .ok_or_else(|| BackendError::Remote("release index missing tag_name".into()))
    }

    fn download_url(&self, version: &str, os: &str, arch: &str) -> Result<String> {
        let tag = Self::platform_tag(os, arch)?;
        Ok(format!(
            "https://github.com/trexminer/T-Rex/releases/download/{version}/t-rex-{version}-{tag}.tar.gz"
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
            "-a".to_string(),
            config.algo.clone(),
            "-o".to_string(),
            config.pool.clone(),
            "-u".to_string(),
            config.wallet.clone(),
            "-p".to_string(),
            config.password.clone(),
            "--api-bind-http".to_string(),
            format!("127.0.0.1:{http_port}"),
        ];

        if !config.gpu_devices.is_empty() {
            args.push("-d".to_string());
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
        format!("http://127.0.0.1:{http_port}/summary")
    }

    fn parse_stats(&self, json_bytes: &[u8]) -> Result<Stats> {
        let v: serde_json::Value =
            serde_json::from_slice(json_bytes).map_err(|e| BackendError::Process(e.to_string()))?;

        Ok(Stats {
            hashrate: v["hashrate"].as_f64().unwrap_or(0.0),
            shares_good: v["accepted_count"].as_u64().unwrap_or(0),
            shares_total: v["accepted_count"].as_u64().unwrap_or(0) + v["rejected_count"].as_u64().unwrap_or(0),
            pool: v["active_pool"]["url"].as_str().unwrap_or_default().to_string(),
            ping_ms: v["active_pool"]["ping"].as_u64().unwrap_or(0),
            algo: v["algorithm"].as_str().unwrap_or_default().to_string(),
            uptime_secs: v["uptime"].as_u64().unwrap_or(0),
            cpu_brand: None,
            cpu_threads: None,
            resident_memory_bytes: None,
        })
    }

    fn binary_filename(&self) -> &'static str {
        #[cfg(windows)]
        {
            "t-rex.exe"
        }
        #[cfg(not(windows))]
        {
            "t-rex"
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
            password: "x".into(),
            rig_id: String::new(),
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
            gpu_devices: vec![0, 1],
            gpu_intensity: vec![],
            log_file: None,
            extra_args: vec![],
        }
    }

    #[test]
    fn build_args_lists_gpu_devices() {
        let backend = TRexBackend::new();
        let args = backend.build_args("t-rex-kawpow", &valid_config(), 4067).unwrap();
        assert!(args.windows(2).any(|w| w == ["-d", "0,1"]));
    }

    #[test]
    fn parse_stats_computes_rejected_from_counts() {
        let backend = TRexBackend::new();
        let body = br#"{"hashrate":1000.0,"accepted_count":10,"rejected_count":2,"algorithm":"kawpow","uptime":500}"#;
        let stats = backend.parse_stats(body).unwrap();
        assert_eq!(stats.shares_good, 10);
        assert_eq!(stats.rejected_shares(), 2);
    }
}
