use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::auth::token_manager::{RequestContext, TokenLifecycleManager};
use crate::config::ApiConfig;
use crate::error::{not_authenticated, unauthorized_after_renewal, unexpected_status, CoreResult};
use crate::http::{HttpClient, HttpMethod, HttpRequest, SimpleHttpResponse};

/// Authenticated request layer.
///
/// Attaches the current access secret to every call. A 401 hands the request
/// to the token manager and replays it once with whatever secret the renewal
/// produced; a second 401 is returned to the caller.
#[derive(Clone)]
pub struct ApiClient {
    http: Arc<dyn HttpClient>,
    tokens: TokenLifecycleManager,
    config: ApiConfig,
}

impl ApiClient {
    pub fn new(http: Arc<dyn HttpClient>, tokens: TokenLifecycleManager, config: ApiConfig) -> Self {
        Self {
            http,
            tokens,
            config,
        }
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    /// Send a request with the session credential attached
    pub async fn send(&self, request: HttpRequest) -> CoreResult<SimpleHttpResponse> {
        let Some(secret) = self.tokens.store().access_secret().await else {
            debug!(request = %request, "No session, request refused");
            return Err(not_authenticated());
        };

        let response = self
            .http
            .send(request.clone().with_bearer(&secret))
            .await?;
        if !response.is_unauthorized() {
            return Ok(response);
        }

        warn!(request = %request, "Request unauthorized, waiting for credential renewal");
        let fresh = self
            .tokens
            .on_unauthorized(RequestContext::new(request.to_string()), &secret)
            .await?;

        let replayed = self.http.send(request.clone().with_bearer(&fresh)).await?;
        if replayed.is_unauthorized() {
            warn!(request = %request, "Request rejected again after renewal");
            return Err(unauthorized_after_renewal(&request));
        }
        Ok(replayed)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> CoreResult<T> {
        let request = HttpRequest::new(HttpMethod::GET, self.config.endpoint(path));
        Self::into_json(self.send(request).await?)
    }

    pub async fn post_json<T: DeserializeOwned>(&self, path: &str, body: &Value) -> CoreResult<T> {
        let request = HttpRequest::new(HttpMethod::POST, self.config.endpoint(path)).with_json(body);
        Self::into_json(self.send(request).await?)
    }

    pub async fn put_json<T: DeserializeOwned>(&self, path: &str, body: &Value) -> CoreResult<T> {
        let request = HttpRequest::new(HttpMethod::PUT, self.config.endpoint(path)).with_json(body);
        Self::into_json(self.send(request).await?)
    }

    pub async fn delete(&self, path: &str) -> CoreResult<()> {
        let request = HttpRequest::new(HttpMethod::DELETE, self.config.endpoint(path));
        let response = self.send(request).await?;
        if !response.is_success() {
            return Err(unexpected_status(response.status(), response.body()));
        }
        Ok(())
    }

    fn into_json<T: DeserializeOwned>(response: SimpleHttpResponse) -> CoreResult<T> {
        if !response.is_success() {
            return Err(unexpected_status(response.status(), response.body()));
        }
        // An empty 2xx body reads as null
        if response.body().trim().is_empty() {
            return Ok(serde_json::from_value(Value::Null)?);
        }
        response.json()
    }
}
