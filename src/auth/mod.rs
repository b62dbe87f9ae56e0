pub mod providers;
pub mod service;
pub mod storage;
pub mod token;
pub mod token_manager;

pub use providers::{AuthGrant, AuthProvider, HttpAuthProvider};
pub use service::AuthService;
pub use storage::{CredentialStore, FileBackend, MemoryBackend, StorageBackend};
pub use token::{Credential, Identity, SessionEndReason};
pub use token_manager::{RequestContext, TokenLifecycleManager};
