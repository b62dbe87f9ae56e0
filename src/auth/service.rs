use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::auth::providers::{AuthGrant, AuthProvider};
use crate::auth::token::{Identity, SessionEndReason};
use crate::auth::token_manager::TokenLifecycleManager;
use crate::error::{login_failed, malformed_message, CoreResult};
use crate::http::ApiClient;

/// Account operations on top of the token manager: log in, register, update
/// the profile, log out, and restore a persisted session at startup
pub struct AuthService {
    provider: Arc<dyn AuthProvider>,
    tokens: TokenLifecycleManager,
    api: ApiClient,
}

impl AuthService {
    pub fn new(provider: Arc<dyn AuthProvider>, tokens: TokenLifecycleManager, api: ApiClient) -> Self {
        Self {
            provider,
            tokens,
            api,
        }
    }

    /// Log in and start a session
    pub async fn login(&self, username: &str, password: &str) -> CoreResult<Option<Identity>> {
        info!(username, provider = self.provider.name(), "Logging in");
        let grant = self.provider.login(username, password).await?;
        self.start_from_grant(grant).await
    }

    /// Create an account and start a session with it
    pub async fn register(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> CoreResult<Option<Identity>> {
        info!(username, "Registering account");
        let grant = self.provider.register(username, email, password).await?;
        self.start_from_grant(grant).await
    }

    async fn start_from_grant(&self, grant: AuthGrant) -> CoreResult<Option<Identity>> {
        if grant.access_token.is_empty() {
            return Err(login_failed("server returned an empty access_token"));
        }
        let (credential, identity) = grant.into_credential();
        self.tokens.begin_session(credential, identity.clone()).await?;
        match &identity {
            Some(identity) => info!(user = %identity.display_name(), "Session started"),
            None => info!("Session started"),
        }
        Ok(identity)
    }

    /// Apply a profile patch and replace the stored identity with the result
    pub async fn update_profile(&self, patch: &Value) -> CoreResult<Identity> {
        let path = self.api.config().profile_path.clone();
        let response: Value = self.api.put_json(&path, patch).await?;
        let identity = Self::identity_from_response(response)?;
        self.tokens.store().update_identity(identity.clone()).await?;
        debug!(user = %identity.display_name(), "Profile updated");
        Ok(identity)
    }

    /// Read the identity from the server without replacing the stored one
    pub async fn fetch_profile(&self) -> CoreResult<Identity> {
        let path = self.api.config().profile_path.clone();
        let response: Value = self.api.get_json(&path).await?;
        Self::identity_from_response(response)
    }

    // Servers answer either with the user object or with `{"user": {...}}`
    fn identity_from_response(response: Value) -> CoreResult<Identity> {
        let user = match response.get("user") {
            Some(user) => user.clone(),
            None => response,
        };
        Identity::from_value(user).ok_or_else(|| malformed_message("profile response is not a user object"))
    }

    pub async fn logout(&self) {
        info!("Logging out");
        self.tokens.end_session(SessionEndReason::Logout).await;
    }

    /// Bootstrap from the credential store.
    ///
    /// A valid credential starts the session directly; an expired one with a
    /// refresh secret gets exactly one renewal attempt; anything else stays
    /// logged out.
    pub async fn restore(&self) -> CoreResult<Option<Identity>> {
        let Some((credential, identity)) = self.tokens.store().load().await? else {
            debug!("Nothing to restore");
            return Ok(None);
        };

        if credential.is_valid() {
            info!("Restoring persisted session");
            self.tokens.resume_session().await?;
            return Ok(identity);
        }

        if !credential.can_renew() {
            warn!("Persisted credential expired and cannot be renewed, discarding it");
            self.tokens.store().clear().await?;
            return Ok(None);
        }

        info!("Persisted credential expired, attempting one renewal");
        match self.tokens.renew().await {
            Ok(_) => {
                self.tokens.resume_session().await?;
                Ok(self.tokens.store().identity().await)
            }
            Err(e) => {
                // The token manager already ended the session
                error!(error = %e, "Could not renew persisted session");
                Ok(None)
            }
        }
    }

    pub async fn is_authenticated(&self) -> bool {
        self.tokens.store().has_session().await
    }

    pub async fn identity(&self) -> Option<Identity> {
        self.tokens.store().identity().await
    }
}
