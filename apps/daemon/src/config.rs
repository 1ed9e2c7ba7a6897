//! Environment-driven daemon configuration (spec §6). Every field has a
//! default so the daemon runs unconfigured on a laptop; production
//! deployments override via `FLEETCTL_*` env vars.

use fleetctl_p2p::PeerRole;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
}

pub struct DaemonConfig {
    pub http_bind: SocketAddr,
    pub p2p_bind: Option<SocketAddr>,
    pub data_dir: PathBuf,
    pub install_dir: PathBuf,
    pub db_path: Option<PathBuf>,
    pub profiles_path: PathBuf,
    pub identity_path: PathBuf,
    pub node_name: String,
    pub node_role: PeerRole,
    pub peer_public_keys: Vec<[u8; 32]>,
    pub dial_peers: Vec<String>,
    pub allowed_ws_origins: Vec<String>,
}

impl DaemonConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let data_dir = env_path("FLEETCTL_DATA_DIR").unwrap_or_else(default_data_dir);

        let http_bind = env_parse("FLEETCTL_HTTP_BIND")?.unwrap_or_else(|| "127.0.0.1:7878".parse().expect("valid default"));

        let p2p_bind = env_parse("FLEETCTL_P2P_BIND")?;

        let db_path = if env_flag("FLEETCTL_DISABLE_STORE") {
            None
        } else {
            Some(env_path("FLEETCTL_DB_PATH").unwrap_or_else(|| data_dir.join("hashrate.db")))
        };

        let profiles_path = env_path("FLEETCTL_PROFILES_PATH").unwrap_or_else(|| data_dir.join("profiles.json"));
        let install_dir = env_path("FLEETCTL_INSTALL_DIR").unwrap_or_else(|| data_dir.join("backends"));
        let identity_path = env_path("FLEETCTL_IDENTITY_PATH").unwrap_or_else(|| data_dir.join("identity.json"));

        let node_name = std::env::var("FLEETCTL_NODE_NAME").unwrap_or_else(|_| {
            hostname_fallback()
        });

        let node_role = match std::env::var("FLEETCTL_NODE_ROLE").ok().as_deref() {
            None | Some("dual") => PeerRole::Dual,
            Some("controller") => PeerRole::Controller,
            Some("worker") => PeerRole::Worker,
            Some(other) => return Err(ConfigError::InvalidValue("FLEETCTL_NODE_ROLE", other.to_string())),
        };

        let peer_public_keys = match std::env::var("FLEETCTL_PEER_PUBLIC_KEYS") {
            Ok(raw) => parse_hex_keys(&raw)?,
            Err(_) => Vec::new(),
        };

        let dial_peers = std::env::var("FLEETCTL_DIAL_PEERS")
            .map(|raw| raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect())
            .unwrap_or_default();

        let allowed_ws_origins = std::env::var("FLEETCTL_WS_ALLOWED_ORIGINS")
            .map(|raw| raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect())
            .unwrap_or_default();

        Ok(Self {
            http_bind,
            p2p_bind,
            data_dir,
            install_dir,
            db_path,
            profiles_path,
            identity_path,
            node_name,
            node_role,
            peer_public_keys,
            dial_peers,
            allowed_ws_origins,
        })
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir().unwrap_or_else(std::env::temp_dir).join("fleetctl")
}

fn hostname_fallback() -> String {
    format!("fleetctl-{}", std::process::id())
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key).ok().map(PathBuf::from)
}

fn env_flag(key: &str) -> bool {
    matches!(std::env::var(key).ok().as_deref(), Some("1") | Some("true"))
}

fn env_parse<T: std::str::FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.parse::<T>().map(Some).map_err(|_| ConfigError::InvalidValue(key, raw)),
        Err(_) => Ok(None),
    }
}

fn parse_hex_keys(raw: &str) -> Result<Vec<[u8; 32]>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|hex_str| {
            let bytes = hex::decode(hex_str).map_err(|_| ConfigError::InvalidValue("FLEETCTL_PEER_PUBLIC_KEYS", hex_str.to_string()))?;
            <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| ConfigError::InvalidValue("FLEETCTL_PEER_PUBLIC_KEYS", hex_str.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_hex_keys_rejects_wrong_length() {
        assert!(parse_hex_keys("aabb").is_err());
    }

    #[test]
    fn parse_hex_keys_accepts_valid_32_byte_key() {
        let key = hex::encode([7u8; 32]);
        let parsed = parse_hex_keys(&key).unwrap();
        assert_eq!(parsed, vec![[7u8; 32]]);
    }
}
