//! Node identity: the X25519 keypair a process uses to authenticate itself
//! to peers, persisted under the user config dir with restrictive
//! permissions (spec §6: "private key with permissions ≤ 0600").

use crate::peer::PeerRole;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use x25519_dalek::{PublicKey, StaticSecret};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub uuid::Uuid);

impl NodeId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedIdentity {
    id: NodeId,
    name: String,
    role: PeerRole,
    private_key: [u8; 32],
    created_at: i64,
}

/// Single-instance per process (spec §3). Holds the process's long-term
/// keypair; `public_key` is freely shared, `secret` never leaves this type.
pub struct NodeIdentity {
    pub id: NodeId,
    pub name: String,
    pub role: PeerRole,
    pub created_at: i64,
    secret: StaticSecret,
    public: PublicKey,
}

impl NodeIdentity {
    pub fn generate(name: impl Into<String>, role: PeerRole) -> Self {
        let secret = StaticSecret::random_from_rng(rand_core::OsRng);
        let public = PublicKey::from(&secret);
        Self {
            id: NodeId::new(),
            name: name.into(),
            role,
            created_at: now_unix(),
            secret,
            public,
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    pub fn secret(&self) -> &StaticSecret {
        &self.secret
    }

    /// Loads an identity from disk, creating and persisting a fresh one if
    /// the file is absent. The private key file is written with mode 0600
    /// on unix.
    pub async fn load_or_create(path: &Path, name: impl Into<String>, role: PeerRole) -> Result<Self> {
        if let Ok(bytes) = tokio::fs::read(path).await {
            if let Ok(persisted) = serde_json::from_slice::<PersistedIdentity>(&bytes) {
                let secret = StaticSecret::from(persisted.private_key);
                let public = PublicKey::from(&secret);
                return Ok(Self {
                    id: persisted.id,
                    name: persisted.name,
                    role: persisted.role,
                    created_at: persisted.created_at,
                    secret,
                    public,
                });
            }
            tracing::warn!(path = %path.display(), "node identity file is corrupt, regenerating");
        }

        let identity = Self::generate(name, role);
        identity.persist(path).await?;
        Ok(identity)
    }

    pub async fn persist(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let persisted = PersistedIdentity {
            id: self.id,
            name: self.name.clone(),
            role: self.role,
            private_key: self.secret.to_bytes(),
            created_at: self.created_at,
        };
        let bytes = serde_json::to_vec_pretty(&persisted)?;
        tokio::fs::write(path, &bytes).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
        }

        Ok(())
    }
}

fn now_unix() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

/// Formats a public key prefix for logging without panicking on short
/// inputs (spec invariant 5 / scenario S4).
pub fn log_safe_key_prefix(key_bytes: &[u8]) -> String {
    const PREFIX_LEN: usize = 8;
    if key_bytes.len() < PREFIX_LEN {
        return "<short>".to_string();
    }
    hex::encode(&key_bytes[..PREFIX_LEN])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_safe_key_prefix_never_panics_on_short_input() {
        assert_eq!(log_safe_key_prefix(b"abc"), "<short>");
        assert_eq!(log_safe_key_prefix(&[]), "<short>");
    }

    #[test]
    fn log_safe_key_prefix_hex_encodes_long_input() {
        let key = [0u8; 32];
        assert_eq!(log_safe_key_prefix(&key), "0000000000000000");
    }

    #[tokio::test]
    async fn load_or_create_persists_and_reloads_the_same_identity() {
        let path = std::env::temp_dir().join(format!("fleetctl-identity-test-{}.json", std::process::id()));
        let _ = tokio::fs::remove_file(&path).await;

        let first = NodeIdentity::load_or_create(&path, "node-a", PeerRole::Dual).await.unwrap();
        let second = NodeIdentity::load_or_create(&path, "node-a", PeerRole::Dual).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.public_key().to_bytes(), second.public_key().to_bytes());

        let _ = tokio::fs::remove_file(&path).await;
    }
}
