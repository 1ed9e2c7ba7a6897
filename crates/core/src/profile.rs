//! Profile Manager (spec §4.F): durable, rollback-safe CRUD over named
//! mining configurations. Grounded on the teacher's profile persistence
//! (atomic temp-file + rename) generalized from a single flat JSON document
//! to a UUID-keyed map with per-operation rollback.

use crate::supervisor::{MinerSummary, Supervisor};
use crate::{CoreError, Result};
use fleetctl_backends::Config;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub name: String,
    pub backend_kind: String,
    pub config: Config,
}

pub struct ProfileManager {
    profiles: RwLock<HashMap<String, Profile>>,
    path: PathBuf,
}

impl ProfileManager {
    /// Loads `path` if it exists; a missing or corrupt file yields a warning
    /// and an empty map rather than failing startup (spec §4.F).
    pub async fn load(path: PathBuf) -> Self {
        let profiles = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<HashMap<String, Profile>>(&bytes) {
                Ok(map) => map,
                Err(e) => {
                    tracing::warn!(error = %e, path = %path.display(), "profile store is corrupt, starting empty");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        Self { profiles: RwLock::new(profiles), path }
    }

    /// Serializes to a temp file in the same directory, fsyncs, then renames
    /// over the target so a crash mid-write can never leave a truncated
    /// profile store.
    async fn persist(&self, snapshot: &HashMap<String, Profile>) -> Result<()> {
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        tokio::fs::create_dir_all(parent).await?;

        let tmp_path = parent.join(format!(".profiles-{}.tmp", Uuid::new_v4()));
        let bytes = serde_json::to_vec_pretty(snapshot)?;

        let mut file = tokio::fs::File::create(&tmp_path).await?;
        use tokio::io::AsyncWriteExt;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }

    pub async fn create(&self, name: String, backend_kind: String, config: Config) -> Result<Profile> {
        config.validate()?;
        let profile = Profile { id: Uuid::new_v4().to_string(), name, backend_kind, config };

        let snapshot = {
            let mut guard = self.profiles.write().await;
            guard.insert(profile.id.clone(), profile.clone());
            guard.clone()
        };

        if let Err(e) = self.persist(&snapshot).await {
            self.profiles.write().await.remove(&profile.id);
            return Err(e);
        }

        Ok(profile)
    }

    pub async fn get(&self, id: &str) -> Result<Profile> {
        self.profiles.read().await.get(id).cloned().ok_or_else(|| CoreError::NotFound(format!("profile {id}")))
    }

    pub async fn list(&self) -> Vec<Profile> {
        self.profiles.read().await.values().cloned().collect()
    }

    pub async fn update(&self, id: &str, name: String, backend_kind: String, config: Config) -> Result<Profile> {
        config.validate()?;

        let mut guard = self.profiles.write().await;
        let old = guard.get(id).cloned().ok_or_else(|| CoreError::NotFound(format!("profile {id}")))?;

        let updated = Profile { id: id.to_string(), name, backend_kind, config };
        guard.insert(id.to_string(), updated.clone());
        let snapshot = guard.clone();
        drop(guard);

        if let Err(e) = self.persist(&snapshot).await {
            self.profiles.write().await.insert(id.to_string(), old);
            return Err(e);
        }

        Ok(updated)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let mut guard = self.profiles.write().await;
        let old = guard.remove(id).ok_or_else(|| CoreError::NotFound(format!("profile {id}")))?;
        let snapshot = guard.clone();
        drop(guard);

        if let Err(e) = self.persist(&snapshot).await {
            self.profiles.write().await.insert(id.to_string(), old);
            return Err(e);
        }

        Ok(())
    }

    pub async fn start_from_profile(&self, id: &str, supervisor: &Supervisor) -> Result<MinerSummary> {
        let profile = self.get(id).await?;
        supervisor.start_miner(&profile.backend_kind, profile.config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            pool: "stratum+tcp://pool.example.com:3333".into(),
            wallet: "wallet".into(),
            password: String::new(),
            rig_id: String::new(),
            proxy: None,
            tls: false,
            algo: "rx0".into(),
            coin: "xmr".into(),
            threads: 1,
            intensity: 1,
            cpu_affinity: None,
            cpu_priority: 1,
            huge_pages: false,
            donate_level: 0,
            gpu_devices: vec![],
            gpu_intensity: vec![],
            log_file: None,
            extra_args: vec![],
        }
    }

    fn test_path() -> PathBuf {
        std::env::temp_dir().join(format!("fleetctl-profiles-test-{}-{}.json", std::process::id(), Uuid::new_v4()))
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let path = test_path();
        let manager = ProfileManager::load(path.clone()).await;
        let profile = manager.create("main".into(), "xmrig".into(), test_config()).await.unwrap();
        let fetched = manager.get(&profile.id).await.unwrap();
        assert_eq!(fetched.name, "main");
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn delete_removes_and_persists() {
        let path = test_path();
        let manager = ProfileManager::load(path.clone()).await;
        let profile = manager.create("main".into(), "xmrig".into(), test_config()).await.unwrap();
        manager.delete(&profile.id).await.unwrap();
        assert!(manager.get(&profile.id).await.is_err());

        let reloaded = ProfileManager::load(path.clone()).await;
        assert!(reloaded.list().await.is_empty());
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn load_missing_file_yields_empty_map() {
        let manager = ProfileManager::load(std::env::temp_dir().join("does-not-exist-fleetctl.json")).await;
        assert!(manager.list().await.is_empty());
    }
}
