use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::auth::token::{Credential, Identity};
use crate::error::{CoreResult, StorageError};

/// The persisted session: `access_token`, `refresh_token`, and `user`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSession {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<Value>,
}

/// On-disk layout with an integrity hash over the session fields
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoragePayload {
    #[serde(flatten)]
    session: StoredSession,
    created_at: DateTime<Utc>,
    integrity_hash: String,
}

/// Where the persisted session lives
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Raw payload, `None` if nothing is stored
    async fn read(&self) -> Result<Option<String>, StorageError>;

    async fn write(&self, payload: &str) -> Result<(), StorageError>;

    async fn remove(&self) -> Result<(), StorageError>;
}

/// JSON file backend
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl StorageBackend for FileBackend {
    async fn read(&self) -> Result<Option<String>, StorageError> {
        match fs::read_to_string(&self.path).await {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, payload: &str) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        // Write then rename so a crash never leaves a half-written file
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, payload).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    async fn remove(&self) -> Result<(), StorageError> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Process-local backend, nothing survives a restart
#[derive(Default)]
pub struct MemoryBackend {
    slot: RwLock<Option<String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn read(&self) -> Result<Option<String>, StorageError> {
        Ok(self.slot.read().await.clone())
    }

    async fn write(&self, payload: &str) -> Result<(), StorageError> {
        *self.slot.write().await = Some(payload.to_string());
        Ok(())
    }

    async fn remove(&self) -> Result<(), StorageError> {
        *self.slot.write().await = None;
        Ok(())
    }
}

/// In-memory session state
#[derive(Debug, Clone)]
struct SessionRecord {
    credential: Credential,
    identity: Option<Identity>,
}

impl SessionRecord {
    fn to_stored(&self) -> StoredSession {
        StoredSession {
            access_token: self.credential.access_secret.clone(),
            refresh_token: self.credential.refresh_secret.clone(),
            user: self
                .identity
                .as_ref()
                .and_then(|identity| serde_json::to_value(identity).ok()),
        }
    }
}

/// Holds the current credential and identity, mirrored to a [`StorageBackend`].
///
/// The in-memory copy is authoritative; a failed write is reported to the
/// caller but does not roll back the cached value.
pub struct CredentialStore {
    backend: Arc<dyn StorageBackend>,
    cache: RwLock<Option<SessionRecord>>,
}

impl CredentialStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            cache: RwLock::new(None),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(FileBackend::new(path)))
    }

    /// Read the persisted session into memory.
    ///
    /// A payload that fails its integrity check is discarded and treated as
    /// "no session".
    pub async fn load(&self) -> CoreResult<Option<(Credential, Option<Identity>)>> {
        let Some(raw) = self.backend.read().await? else {
            debug!("No persisted session");
            *self.cache.write().await = None;
            return Ok(None);
        };

        let session = match Self::decode(&raw) {
            Ok(session) => session,
            Err(e) => {
                error!(error = %e, "Persisted session is unusable, discarding it");
                self.backend.remove().await?;
                *self.cache.write().await = None;
                return Ok(None);
            }
        };

        let record = SessionRecord {
            credential: Credential::new(session.access_token, session.refresh_token),
            identity: session.user.and_then(Identity::from_value),
        };
        info!(
            expires_at = ?record.credential.expires_at,
            "Loaded persisted session"
        );
        let result = (record.credential.clone(), record.identity.clone());
        *self.cache.write().await = Some(record);
        Ok(Some(result))
    }

    pub async fn credential(&self) -> Option<Credential> {
        self.cache.read().await.as_ref().map(|r| r.credential.clone())
    }

    pub async fn access_secret(&self) -> Option<String> {
        self.cache
            .read()
            .await
            .as_ref()
            .map(|r| r.credential.access_secret.clone())
    }

    pub async fn identity(&self) -> Option<Identity> {
        self.cache
            .read()
            .await
            .as_ref()
            .and_then(|r| r.identity.clone())
    }

    pub async fn has_session(&self) -> bool {
        self.cache.read().await.is_some()
    }

    /// Start a new session, replacing whatever was stored
    pub async fn set_session(
        &self,
        credential: Credential,
        identity: Option<Identity>,
    ) -> CoreResult<()> {
        let record = SessionRecord {
            credential,
            identity,
        };
        let stored = record.to_stored();
        *self.cache.write().await = Some(record);
        self.persist(stored).await
    }

    /// Swap in a renewed credential, keeping the identity
    pub async fn replace_credential(&self, credential: Credential) -> CoreResult<()> {
        let stored = {
            let mut cache = self.cache.write().await;
            let identity = cache.as_ref().and_then(|r| r.identity.clone());
            let record = SessionRecord {
                credential,
                identity,
            };
            let stored = record.to_stored();
            *cache = Some(record);
            stored
        };
        self.persist(stored).await
    }

    /// Replace the identity of the current session; a no-op without one
    pub async fn update_identity(&self, identity: Identity) -> CoreResult<()> {
        let stored = {
            let mut cache = self.cache.write().await;
            match cache.as_mut() {
                Some(record) => {
                    record.identity = Some(identity);
                    record.to_stored()
                }
                None => {
                    warn!("Identity update without an active session ignored");
                    return Ok(());
                }
            }
        };
        self.persist(stored).await
    }

    /// Forget the session in memory and on disk
    pub async fn clear(&self) -> CoreResult<()> {
        *self.cache.write().await = None;
        self.backend.remove().await?;
        info!("Persisted session cleared");
        Ok(())
    }

    async fn persist(&self, session: StoredSession) -> CoreResult<()> {
        let payload = StoragePayload {
            integrity_hash: integrity_hash(&session),
            session,
            created_at: Utc::now(),
        };
        let raw = serde_json::to_string_pretty(&payload).map_err(StorageError::from)?;
        self.backend.write(&raw).await?;
        debug!("Session persisted");
        Ok(())
    }

    fn decode(raw: &str) -> Result<StoredSession, StorageError> {
        let payload: StoragePayload = serde_json::from_str(raw)?;
        if integrity_hash(&payload.session) != payload.integrity_hash {
            return Err(StorageError::Integrity {
                key: "access_token".to_string(),
            });
        }
        Ok(payload.session)
    }
}

/// Hex SHA-256 over the stored fields
fn integrity_hash(session: &StoredSession) -> String {
    let user = session
        .user
        .as_ref()
        .map(|u| u.to_string())
        .unwrap_or_default();
    let material = format!(
        "{}:{}:{}",
        session.access_token,
        session.refresh_token.as_deref().unwrap_or(""),
        user
    );
    let mut hasher = Sha256::new();
    hasher.update(material.as_bytes());
    format!("{:x}", hasher.finalize())
}
