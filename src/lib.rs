use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

// Export modules
pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod http;

#[cfg(test)]
mod tests;

pub use auth::{
    AuthService, Credential, CredentialStore, FileBackend, Identity, MemoryBackend, SessionEndReason,
    StorageBackend, TokenLifecycleManager,
};
pub use config::CoreConfig;
pub use connection::{ConnectionManager, ConnectionSnapshot, ConnectionState, Topic};
pub use error::{CoreError, CoreResult, ErrorCategory, ErrorCode};
pub use events::{CoreEvent, EventBus, EventKind, EventSubscriber};
pub use http::{ApiClient, HttpClient, ReqwestHttpClient};

use auth::HttpAuthProvider;
use connection::{Transport, WebSocketTransport};

/// The session-aware connection core.
///
/// Owns one instance of every manager and wires them together: the token
/// manager renews credentials for the API client, session events drive the
/// push channel, and everything publishes onto a single event bus. Consumers
/// hold a `SessionCore` and subscribe to [`SessionCore::events`].
pub struct SessionCore {
    config: CoreConfig,
    events: EventBus,
    store: Arc<CredentialStore>,
    tokens: TokenLifecycleManager,
    auth: AuthService,
    api: ApiClient,
    connection: ConnectionManager,
    session_listener: Mutex<Option<JoinHandle<()>>>,
}

impl SessionCore {
    /// Build the core with the production HTTP client, WebSocket transport and
    /// file-backed credential store
    pub fn new(config: CoreConfig) -> CoreResult<Self> {
        let http: Arc<dyn HttpClient> = Arc::new(ReqwestHttpClient::new(config.api.timeout())?);
        let transport: Arc<dyn Transport> =
            Arc::new(WebSocketTransport::new(config.channel.connect_timeout()));
        let backend: Arc<dyn StorageBackend> = Arc::new(FileBackend::new(config.storage.path.clone()));
        Ok(Self::with_parts(config, http, transport, backend))
    }

    /// Build the core from explicit collaborators.
    ///
    /// Spawns the session listener, so it must be called inside a Tokio runtime.
    pub fn with_parts(
        config: CoreConfig,
        http: Arc<dyn HttpClient>,
        transport: Arc<dyn Transport>,
        backend: Arc<dyn StorageBackend>,
    ) -> Self {
        let events = EventBus::new(config.event_bus_capacity, config.event_buffer_size);
        let store = Arc::new(CredentialStore::new(backend));
        let provider = Arc::new(HttpAuthProvider::new(http.clone(), config.api.clone()));

        let tokens = TokenLifecycleManager::new(
            store.clone(),
            provider.clone(),
            events.clone(),
            config.renewal.clone(),
        );
        let api = ApiClient::new(http, tokens.clone(), config.api.clone());
        let auth = AuthService::new(provider, tokens.clone(), api.clone());
        let connection = ConnectionManager::new(config.channel.clone(), transport, store.clone(), events.clone());

        // Listen before any session can start so the first SessionStarted is seen
        let session_listener = connection.spawn_session_listener();
        debug!("Session core assembled");

        Self {
            config,
            events,
            store,
            tokens,
            auth,
            api,
            connection,
            session_listener: Mutex::new(Some(session_listener)),
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> EventSubscriber {
        self.events.subscribe()
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub fn tokens(&self) -> &TokenLifecycleManager {
        &self.tokens
    }

    pub fn auth(&self) -> &AuthService {
        &self.auth
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// Resume a persisted session, if there is one
    pub async fn restore(&self) -> CoreResult<Option<Identity>> {
        self.auth.restore().await
    }

    pub async fn login(&self, username: &str, password: &str) -> CoreResult<Option<Identity>> {
        self.auth.login(username, password).await
    }

    pub async fn logout(&self) {
        self.auth.logout().await;
    }

    /// Follow a single crawl task; returns false if already followed
    pub async fn subscribe_task(&self, task_id: u64) -> bool {
        self.connection.subscribe(Topic::task(task_id)).await
    }

    pub async fn unsubscribe_task(&self, task_id: u64) -> bool {
        self.connection.unsubscribe(&Topic::task(task_id)).await
    }

    /// Follow updates for every task
    pub async fn subscribe_all_tasks(&self) -> bool {
        self.connection.subscribe(Topic::all_tasks()).await
    }

    /// Stop background work and close the channel; the persisted session is kept
    pub async fn shutdown(&self) {
        info!("Shutting down session core");
        self.tokens.stop().await;
        self.connection.disconnect().await;
        if let Some(handle) = self.session_listener.lock().await.take() {
            handle.abort();
        }
    }
}
