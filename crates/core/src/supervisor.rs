//! Supervisor (spec §4.C): the map of active instances, port allocation,
//! instance naming, and shutdown orchestration. Generalizes the teacher's
//! `SessionManager`'s `Arc<RwLock<HashMap<...>>>` session table from
//! single-tenant-per-backend-kind to the fully multi-instance map spec §4.C
//! describes.

use crate::event_hub::{Event, EventHub};
use crate::instance::{InstanceState, MinerInstance};
use crate::session::SessionTracker;
use crate::{CoreError, Result};
use fleetctl_backends::{BackendRegistry, Config, InstallationRecord};
use fleetctl_store::HashrateStore;
use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

const DEFAULT_PORT_RANGE: RangeInclusive<u16> = 45_580..=45_680;
const STOP_GRACE: Duration = Duration::from_secs(3);

#[derive(Clone)]
pub struct MinerSummary {
    pub name: String,
    pub backend_kind: String,
    pub state: InstanceState,
    pub http_port: u16,
}

#[derive(Clone)]
pub struct BackendInfo {
    pub name: &'static str,
    pub installed: bool,
    pub version: Option<String>,
}

struct PortAllocator {
    range: RangeInclusive<u16>,
    in_use: std::collections::HashSet<u16>,
}

impl PortAllocator {
    fn new(range: RangeInclusive<u16>) -> Self {
        Self {
            range,
            in_use: std::collections::HashSet::new(),
        }
    }

    fn allocate(&mut self) -> Result<u16> {
        for port in self.range.clone() {
            if !self.in_use.contains(&port) {
                self.in_use.insert(port);
                return Ok(port);
            }
        }
        Err(CoreError::Unavailable("no free ports in the configured range".into()))
    }

    fn release(&mut self, port: u16) {
        self.in_use.remove(&port);
    }
}

pub struct Supervisor {
    instances: RwLock<HashMap<String, Arc<MinerInstance>>>,
    ports: RwLock<PortAllocator>,
    registry: Arc<BackendRegistry>,
    install_base: std::path::PathBuf,
    event_hub: Arc<EventHub>,
    sessions: Arc<SessionTracker>,
    store: Arc<HashrateStore>,
    shutdown_started: AtomicBool,
    name_counters: RwLock<HashMap<String, u32>>,
}

impl Supervisor {
    pub fn new(
        registry: Arc<BackendRegistry>,
        install_base: std::path::PathBuf,
        event_hub: Arc<EventHub>,
        sessions: Arc<SessionTracker>,
        store: Arc<HashrateStore>,
    ) -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
            ports: RwLock::new(PortAllocator::new(DEFAULT_PORT_RANGE)),
            registry,
            install_base,
            event_hub,
            sessions,
            store,
            shutdown_started: AtomicBool::new(false),
            name_counters: RwLock::new(HashMap::new()),
        }
    }

    /// Derives `{backend_kind}-{sanitised_algo or counter}`, then validates
    /// it against the same sanitisation rule `build_args` will re-check.
    async fn derive_instance_name(&self, backend_kind: &str, config: &Config) -> Result<String> {
        let sanitized_algo: String = config
            .algo
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();

        let candidate = if sanitized_algo.is_empty() {
            let mut counters = self.name_counters.write().await;
            let counter = counters.entry(backend_kind.to_string()).or_insert(0);
            *counter += 1;
            format!("{backend_kind}-{counter}")
        } else {
            format!("{backend_kind}-{sanitized_algo}")
        };

        fleetctl_backends::validate_instance_name(&candidate)?;
        Ok(candidate)
    }

    pub async fn start_miner(&self, backend_kind: &str, config: Config) -> Result<MinerSummary> {
        config.validate()?;
        let backend = self.registry.get(backend_kind)?;

        let name = self.derive_instance_name(backend_kind, &config).await?;

        {
            let instances = self.instances.read().await;
            if instances.contains_key(&name) {
                return Err(CoreError::Conflict(format!("{name} is already running")));
            }
        }

        let http_port = {
            let mut ports = self.ports.write().await;
            ports.allocate()?
        };

        let install_dir = self.install_base.join(backend_kind);
        let record = backend.check_installation(&install_dir).await?;
        let binary_path = record
            .binary_path
            .ok_or_else(|| CoreError::NotFound(format!("{backend_kind} is not installed")))?;

        let instance = match MinerInstance::start(
            name.clone(),
            backend.clone(),
            config,
            http_port,
            &binary_path,
            crate::instance::DEFAULT_RING_CAPACITY,
            self.sessions.clone(),
            self.store.clone(),
        )
        .await
        {
            Ok(instance) => instance,
            Err(e) => {
                let mut ports = self.ports.write().await;
                ports.release(http_port);
                return Err(e);
            }
        };

        let summary = MinerSummary {
            name: name.clone(),
            backend_kind: backend_kind.to_string(),
            state: instance.state().await,
            http_port,
        };

        {
            let mut instances = self.instances.write().await;
            instances.insert(name.clone(), Arc::new(instance));
        }

        self.event_hub.publish(Event::miner_started(&name)).await;
        info!(instance_name = %name, backend_kind, http_port, "miner started");

        Ok(summary)
    }

    pub async fn stop_miner(&self, name: &str) -> Result<()> {
        let instance = {
            let instances = self.instances.read().await;
            instances
                .get(name)
                .cloned()
                .ok_or_else(|| CoreError::NotFound(format!("{name} is not running")))?
        };

        instance.stop(STOP_GRACE).await?;

        if let Err(e) = self.sessions.close_session(&self.store, name).await {
            warn!(instance_name = %name, error = %e, "failed to close mining session");
        }

        {
            let mut instances = self.instances.write().await;
            instances.remove(name);
        }
        {
            let mut ports = self.ports.write().await;
            ports.release(instance.http_port);
        }

        self.event_hub.publish(Event::miner_stopped(name)).await;
        info!(instance_name = %name, "miner stopped");
        Ok(())
    }

    pub async fn list_miners(&self) -> Vec<MinerSummary> {
        let instances = self.instances.read().await;
        let mut out = Vec::with_capacity(instances.len());
        for instance in instances.values() {
            out.push(MinerSummary {
                name: instance.name.clone(),
                backend_kind: instance.backend_kind.clone(),
                state: instance.state().await,
                http_port: instance.http_port,
            });
        }
        out
    }

    pub async fn get_instance(&self, name: &str) -> Result<Arc<MinerInstance>> {
        self.instances
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("{name} is not running")))
    }

    /// Checks installation state for every registered backend (spec §4.G
    /// `GET /miners/available`). A probe failure is reported as not
    /// installed rather than failing the whole listing.
    pub async fn available_backends(&self) -> Vec<BackendInfo> {
        let mut out = Vec::new();
        for name in self.registry.list() {
            let backend = self.registry.get(name).expect("name came from registry.list()");
            let install_dir = self.install_base.join(name);
            let record = backend.check_installation(&install_dir).await.unwrap_or_default();
            out.push(BackendInfo { name, installed: record.installed, version: record.version });
        }
        out
    }

    /// Installs a backend, resolving the latest upstream version when the
    /// caller doesn't pin one.
    pub async fn install(&self, backend_kind: &str, version: Option<String>) -> Result<InstallationRecord> {
        let backend = self.registry.get(backend_kind)?;
        let version = match version {
            Some(v) => v,
            None => backend.latest_version().await?,
        };
        let install_dir = self.install_base.join(backend_kind);
        Ok(backend.install(&version, &install_dir).await?)
    }

    pub async fn uninstall(&self, backend_kind: &str) -> Result<()> {
        let names: Vec<String> = {
            let instances = self.instances.read().await;
            instances
                .values()
                .filter(|i| i.backend_kind == backend_kind)
                .map(|i| i.name.clone())
                .collect()
        };
        for name in names {
            self.stop_miner(&name).await?;
        }

        let backend = self.registry.get(backend_kind)?;
        let install_dir = self.install_base.join(backend_kind);
        backend.uninstall(&install_dir).await?;
        Ok(())
    }

    /// Idempotent: a second call observes `shutdown_started` already set and
    /// returns immediately (spec §8 invariant 8).
    pub async fn shutdown(&self) {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let names: Vec<String> = self.instances.read().await.keys().cloned().collect();
        for name in names {
            if let Err(e) = self.stop_miner(&name).await {
                tracing::warn!(instance_name = %name, error = %e, "error stopping instance during shutdown");
            }
        }
        self.event_hub.stop().await;
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetctl_backends::FakeBackend;

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

    async fn fake_supervisor() -> (Supervisor, std::path::PathBuf) {
        let mut registry = BackendRegistry::new();
        registry.register(Arc::new(FakeBackend::new()));
        let dir = std::env::temp_dir().join(format!("fleetctl-supervisor-test-{}", std::process::id()));
        let backend = registry.get("fake").unwrap();
        backend.install("0.0.0-fake", &dir.join("fake")).await.unwrap();

        let hub = Arc::new(EventHub::new());
        let sessions = Arc::new(SessionTracker::new());
        let store = Arc::new(HashrateStore::disabled());
        (Supervisor::new(Arc::new(registry), dir.clone(), hub, sessions, store), dir)
    }

    #[tokio::test]
    async fn start_stop_removes_from_list() {
        let (supervisor, dir) = fake_supervisor().await;
        let summary = supervisor.start_miner("fake", test_config()).await.unwrap();
        assert!(supervisor.list_miners().await.iter().any(|m| m.name == summary.name));

        supervisor.stop_miner(&summary.name).await.unwrap();
        assert!(!supervisor.list_miners().await.iter().any(|m| m.name == summary.name));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let (supervisor, dir) = fake_supervisor().await;
        supervisor.start_miner("fake", test_config()).await.unwrap();
        supervisor.shutdown().await;
        supervisor.shutdown().await;
        assert!(supervisor.list_miners().await.is_empty());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn duplicate_start_conflicts() {
        let (supervisor, dir) = fake_supervisor().await;
        supervisor.start_miner("fake", test_config()).await.unwrap();
        let result = supervisor.start_miner("fake", test_config()).await;
        assert!(matches!(result, Err(CoreError::Conflict(_))));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
