use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::auth::token::{Credential, Identity};
use crate::config::ApiConfig;
use crate::error::{login_failed, renewal_failed, unexpected_status, CoreResult};
use crate::http::{HttpClient, HttpMethod, HttpRequest};

/// What the auth endpoints hand back: `access_token`, optional
/// `refresh_token`, optional `user`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub user: Option<Value>,
}

impl AuthGrant {
    /// Credential for a brand new session
    pub fn into_credential(self) -> (Credential, Option<Identity>) {
        let identity = self.user.and_then(Identity::from_value);
        (Credential::new(self.access_token, self.refresh_token), identity)
    }

    pub fn identity(&self) -> Option<Identity> {
        self.user.clone().and_then(Identity::from_value)
    }
}

/// Unauthenticated calls against the account endpoints
#[async_trait]
pub trait AuthProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn login(&self, username: &str, password: &str) -> CoreResult<AuthGrant>;

    async fn register(&self, username: &str, email: &str, password: &str) -> CoreResult<AuthGrant>;

    /// Exchange a refresh secret for a new access secret
    async fn refresh(&self, refresh_secret: &str) -> CoreResult<AuthGrant>;
}

/// [`AuthProvider`] speaking JSON to the dashboard API
pub struct HttpAuthProvider {
    http: Arc<dyn HttpClient>,
    config: ApiConfig,
}

impl HttpAuthProvider {
    pub fn new(http: Arc<dyn HttpClient>, config: ApiConfig) -> Self {
        Self { http, config }
    }

    async fn post_for_grant(&self, path: &str, body: Value) -> CoreResult<Result<AuthGrant, (u16, String)>> {
        let request = HttpRequest::new(HttpMethod::POST, self.config.endpoint(path)).with_json(&body);
        debug!(request = %request, "Calling auth endpoint");

        let response = self.http.send(request).await?;
        if !response.is_success() {
            return Ok(Err((response.status(), response.body().to_string())));
        }
        Ok(Ok(response.json::<AuthGrant>()?))
    }
}

#[async_trait]
impl AuthProvider for HttpAuthProvider {
    fn name(&self) -> &str {
        "http"
    }

    async fn login(&self, username: &str, password: &str) -> CoreResult<AuthGrant> {
        let body = json!({ "username": username, "password": password });
        match self.post_for_grant(&self.config.login_path, body).await? {
            Ok(grant) => Ok(grant),
            Err((status, body)) if (400..500).contains(&status) => {
                warn!(status, "Login rejected");
                Err(login_failed(format!("status {}: {}", status, body)))
            }
            Err((status, body)) => Err(unexpected_status(status, &body)),
        }
    }

    async fn register(&self, username: &str, email: &str, password: &str) -> CoreResult<AuthGrant> {
        let body = json!({ "username": username, "email": email, "password": password });
        match self.post_for_grant(&self.config.register_path, body).await? {
            Ok(grant) => Ok(grant),
            Err((status, body)) if (400..500).contains(&status) => {
                warn!(status, "Registration rejected");
                Err(login_failed(format!("status {}: {}", status, body)))
            }
            Err((status, body)) => Err(unexpected_status(status, &body)),
        }
    }

    async fn refresh(&self, refresh_secret: &str) -> CoreResult<AuthGrant> {
        let body = json!({ "refresh_token": refresh_secret });
        // Any failure here ends the session, so transport errors are folded in too
        match self.post_for_grant(&self.config.refresh_path, body).await {
            Ok(Ok(grant)) if !grant.access_token.is_empty() => Ok(grant),
            Ok(Ok(_)) => Err(renewal_failed("renewal response carried no access_token")),
            Ok(Err((status, body))) => Err(renewal_failed(format!("status {}: {}", status, body))),
            Err(e) => Err(renewal_failed(e)),
        }
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Scripted provider; every refresh hands out the next secret in line
    pub struct MockAuthProvider {
        refresh_results: Mutex<Vec<CoreResult<AuthGrant>>>,
        login_result: Mutex<Option<AuthGrant>>,
        refresh_calls: AtomicUsize,
        refresh_delay: Duration,
    }

    impl MockAuthProvider {
        pub fn new() -> Self {
            Self {
                refresh_results: Mutex::new(Vec::new()),
                login_result: Mutex::new(None),
                refresh_calls: AtomicUsize::new(0),
                refresh_delay: Duration::from_millis(20),
            }
        }

        pub fn with_refresh_delay(mut self, delay: Duration) -> Self {
            self.refresh_delay = delay;
            self
        }

        pub fn push_refresh(&self, result: CoreResult<AuthGrant>) {
            self.refresh_results.lock().unwrap().push(result);
        }

        pub fn set_login(&self, grant: AuthGrant) {
            *self.login_result.lock().unwrap() = Some(grant);
        }

        pub fn refresh_calls(&self) -> usize {
            self.refresh_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AuthProvider for MockAuthProvider {
        fn name(&self) -> &str {
            "mock"
        }

        async fn login(&self, _username: &str, _password: &str) -> CoreResult<AuthGrant> {
            self.login_result
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| login_failed("bad credentials"))
        }

        async fn register(&self, username: &str, _email: &str, password: &str) -> CoreResult<AuthGrant> {
            self.login(username, password).await
        }

        async fn refresh(&self, _refresh_secret: &str) -> CoreResult<AuthGrant> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.refresh_delay).await;
            let mut results = self.refresh_results.lock().unwrap();
            if results.is_empty() {
                return Err(renewal_failed("no scripted refresh result"));
            }
            results.remove(0)
        }
    }
}
