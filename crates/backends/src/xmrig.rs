//! XMRig backend: HTTP-API-based stats (preferred over log parsing), the
//! teacher's `XMRigAdapter` generalized from an owned process wrapper into a
//! stateless `BackendKind` — process ownership now lives in
//! `crates/core::instance`.

use crate::install::{extract_archive, ArchiveFormat};
use crate::{BackendError, BackendKind, Config, InstallationRecord, Result, Stats};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::Duration;

pub struct XmrigBackend {
    client: reqwest::Client,
}

impl XmrigBackend {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn platform_tag(os: &str, arch: &str) -> Result<&'static str> {
        match (os, arch) {
            ("linux", "x86_64") => Ok("linux-static-x64"),
            ("linux", "aarch64") => Ok("linux-arm64"),
            ("macos", "aarch64") => Ok("macos-arm64"),
            ("macos", "x86_64") => Ok("macos-x64"),
            ("windows", "x86_64") => Ok("win64"),
            _ => Err(BackendError::UnsupportedPlatform(format!("{os}/{arch}"))),
        }
    }
}

impl Default for XmrigBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackendKind for XmrigBackend {
    fn name(&self) -> &'static str {
        "xmrig"
    }

    async fn latest_version(&self) -> Result<String> {
        let resp = self
            .client
            .get("https://api.github.com/repos/xmrig/xmrig/releases/latest")
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
            "https://github.com/xmrig/xmrig/releases/download/v{version}/xmrig-{version}-{tag}.tar.gz"
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
            let computed = hex::encode(hasher.finalize());
            if computed != expected {
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
        if !binary_path.exists() {
            return Ok(InstallationRecord::default());
        }

        let version = tokio::process::Command::new(&binary_path)
            .arg("--version")
            .output()
            .await
            .ok()
            .map(|o| String::from_utf8_lossy(&o.stdout).lines().next().unwrap_or("").to_string());

        Ok(InstallationRecord {
            installed: true,
            version,
            install_path: Some(install_dir.to_path_buf()),
            binary_path: Some(binary_path),
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

        let available_threads = num_cpus::get() as u32;
        let threads = if config.threads > 0 {
            config.threads
        } else {
            (available_threads / 2).max(1)
        };

        let mut args = vec![
            "-o".to_string(),
            config.pool.clone(),
            "-u".to_string(),
            config.wallet.clone(),
            "-p".to_string(),
            config.password.clone(),
            "-t".to_string(),
            threads.to_string(),
            "--cpu-priority".to_string(),
            config.cpu_priority.to_string(),
            "--donate-level".to_string(),
            config.donate_level.to_string(),
            "--http-enabled".to_string(),
            "--http-host".to_string(),
            "127.0.0.1".to_string(),
            "--http-port".to_string(),
            http_port.to_string(),
            "--no-color".to_string(),
        ];

        if config.huge_pages {
            args.push("--huge-pages".to_string());
        }
        if config.tls {
            args.push("--tls".to_string());
        }
        if !config.rig_id.is_empty() {
            args.push("--rig-id".to_string());
            args.push(config.rig_id.clone());
        }
        args.extend(config.extra_args.iter().cloned());

        Ok(args)
    }

    fn stats_url(&self, http_port: u16) -> String {
        format!("http://127.0.0.1:{http_port}/2/summary")
    }

    fn parse_stats(&self, json_bytes: &[u8]) -> Result<Stats> {
        let v: serde_json::Value =
            serde_json::from_slice(json_bytes).map_err(|e| BackendError::Process(e.to_string()))?;

        Ok(Stats {
            hashrate: v["hashrate"]["total"][0].as_f64().unwrap_or(0.0),
            shares_good: v["results"]["shares_good"].as_u64().unwrap_or(0),
            shares_total: v["results"]["shares_total"].as_u64().unwrap_or(0),
            pool: v["connection"]["pool"].as_str().unwrap_or_default().to_string(),
            ping_ms: v["connection"]["ping"].as_u64().unwrap_or(0),
            algo: v["algo"].as_str().unwrap_or_default().to_string(),
            uptime_secs: v["uptime"].as_u64().unwrap_or(0),
            cpu_brand: v["cpu"]["brand"].as_str().map(str::to_string),
            cpu_threads: v["cpu"]["threads"].as_u64().map(|n| n as u32),
            resident_memory_bytes: v["resources"]["memory"]["resident_set_memory"].as_u64(),
        })
    }

    fn binary_filename(&self) -> &'static str {
        #[cfg(windows)]
        {
            "xmrig.exe"
        }
        #[cfg(not(windows))]
        {
            "xmrig"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> XmrigBackend {
        XmrigBackend::new()
    }

    fn valid_config() -> Config {
        Config {
            pool: "stratum+tcp://pool.example.com:3333".into(),
            wallet: "wallet".into(),
            password: "x".into(),
            rig_id: String::new(),
            proxy: None,
            tls: false,
            algo: "rx/0".into(),
            coin: "xmr".into(),
            threads: 4,
            intensity: 3,
            cpu_affinity: None,
            cpu_priority: 2,
            huge_pages: false,
            donate_level: 1,
            gpu_devices: vec![],
            gpu_intensity: vec![],
            log_file: None,
            extra_args: vec![],
        }
    }

    #[test]
    fn build_args_includes_pool_and_wallet() {
        let args = backend().build_args("xmrig-rx0", &valid_config(), 45580).unwrap();
        assert!(args.windows(2).any(|w| w == ["-o", "stratum+tcp://pool.example.com:3333"]));
        assert!(args.windows(2).any(|w| w == ["-u", "wallet"]));
        assert!(args.contains(&"45580".to_string()));
    }

    #[test]
    fn build_args_rejects_bad_instance_name() {
        assert!(backend().build_args("../escape", &valid_config(), 45580).is_err());
    }

    #[test]
    fn parse_stats_defaults_missing_fields() {
        let stats = backend().parse_stats(b"{}").unwrap();
        assert_eq!(stats.hashrate, 0.0);
        assert_eq!(stats.shares_good, 0);
    }

    #[test]
    fn parse_stats_reads_nested_fields() {
        let body = br#"{"hashrate":{"total":[123.4]},"results":{"shares_good":5,"shares_total":6},"connection":{"pool":"p:3333","ping":12},"algo":"rx/0","uptime":99}"#;
        let stats = backend().parse_stats(body).unwrap();
        assert_eq!(stats.hashrate, 123.4);
        assert_eq!(stats.shares_good, 5);
        assert_eq!(stats.rejected_shares(), 1);
        assert_eq!(stats.ping_ms, 12);
    }

    #[test]
    fn download_url_rejects_unknown_platform() {
        assert!(backend().download_url("6.21.0", "plan9", "z80").is_err());
    }
}
