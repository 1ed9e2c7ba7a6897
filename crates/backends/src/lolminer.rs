//! lolMiner backend: multi-algorithm GPU miner exposing its own JSON HTTP
//! API shape at `/`. Structurally the closest of the three GPU backends to
//! T-Rex, differing mainly in field names.

use crate::install::{extract_archive, ArchiveFormat};
use crate::{BackendError, BackendKind, Config, InstallationRecord, Result, Stats};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::Duration;

pub struct LolMinerBackend {
    client: reqwest::Client,
}

impl LolMinerBackend {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn platform_tag(os: &str, arch: &str) -> Result<&'static str> {
        match (os, arch) {
            ("linux", "x86_64") => Ok("LUX"),
            ("windows", "x86_64") => Ok("WIN64"),
            _ => Err(BackendError::UnsupportedPlatform(format!("{os}/{arch}"))),
        }
    }
}

impl Default for LolMinerBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackendKind for LolMinerBackend {
    fn name(&self) -> &'static str {
        "lolminer"
    }

    async fn latest_version(&self) -> Result<String> {
        let resp = self
            .client
            .get("https://api.github.com/repos/Lolliedieb/lolMiner-releases/releases/latest")
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
            "https://github.com/Lolliedieb/lolMiner-releases/releases/download/{version}/lolMiner_v{version}_{tag}.tar.gz"
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
            "--algo".to_string(),
            config.algo.clone(),
            "--pool".to_string(),
            config.pool.clone(),
            "--user".to_string(),
            config.wallet.clone(),
            "--apiport".to_string(),
            http_port.to_string(),
        ];

        if !config.gpu_devices.is_empty() {
            args.push("--devices".to_string());
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
        format!("http://127.0.0.1:{http_port}/")
    }

    fn parse_stats(&self, json_bytes: &[u8]) -> Result<Stats> {
        let v: serde_json::Value =
            serde_json::from_slice(json_bytes).map_err(|e| BackendError::Process(e.to_string()))?;

        let total_hashrate: f64 = v["Workers"][0]["Total_Performance"][0]["Performance"]
            .as_f64()
            .unwrap_or(0.0);

        Ok(Stats {
            hashrate: total_hashrate,
            shares_good: v["Session"]["Accepted_Shares"].as_u64().unwrap_or(0),
            shares_total: v["Session"]["Accepted_Shares"].as_u64().unwrap_or(0)
                + v["Session"]["Rejected_Shares"].as_u64().unwrap_or(0),
            pool: v["Session"]["Active_Pool"].as_str().unwrap_or_default().to_string(),
            ping_ms: 0,
            algo: v["Session"]["Algorithm"].as_str().unwrap_or_default().to_string(),
            uptime_secs: v["Session"]["Uptime"].as_u64().unwrap_or(0),
            cpu_brand: None,
            cpu_threads: None,
            resident_memory_bytes: None,
        })
    }

    fn binary_filename(&self) -> &'static str {
        #[cfg(windows)]
        {
            "lolMiner.exe"
        }
        #[cfg(not(windows))]
        {
            "lolMiner"
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
            rig_id: String::new(),
            proxy: None,
            tls: false,
            algo: "ethash".into(),
            coin: "etc".into(),
            threads: 0,
            intensity: 0,
            cpu_affinity: None,
            cpu_priority: 0,
            huge_pages: false,
            donate_level: 0,
            gpu_devices: vec![0],
            gpu_intensity: vec![],
            log_file: None,
            extra_args: vec![],
        }
    }

    #[test]
    fn build_args_includes_algo_flag() {
        let backend = LolMinerBackend::new();
        let args = backend.build_args("lolminer-ethash", &valid_config(), 4444).unwrap();
        assert!(args.windows(2).any(|w| w == ["--algo", "ethash"]));
    }

    #[test]
    fn parse_stats_handles_missing_workers() {
        let backend = LolMinerBackend::new();
        let stats = backend.parse_stats(b"{}").unwrap();
        assert_eq!(stats.hashrate, 0.0);
    }
}
