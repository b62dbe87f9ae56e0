//! HTTP plumbing: a mockable client trait and the authenticated request layer.

pub mod api;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::error::{request_failed, CoreResult};

pub use api::ApiClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    GET,
    POST,
    PUT,
    PATCH,
    DELETE,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HttpMethod::GET => "GET",
            HttpMethod::POST => "POST",
            HttpMethod::PUT => "PUT",
            HttpMethod::PATCH => "PATCH",
            HttpMethod::DELETE => "DELETE",
        };
        f.write_str(name)
    }
}

/// A fully described request, cheap to clone so it can be replayed
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HashMap::new(),
            body: None,
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Attach a JSON body and the matching content type
    pub fn with_json(mut self, body: &serde_json::Value) -> Self {
        self.body = Some(body.to_string());
        self.headers
            .insert("Content-Type".to_string(), "application/json".to_string());
        self
    }

    pub fn with_bearer(self, secret: &str) -> Self {
        self.with_header("Authorization", format!("Bearer {}", secret))
    }
}

impl fmt::Display for HttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// Status and body of a completed request
#[derive(Debug, Clone)]
pub struct SimpleHttpResponse {
    status_code: u16,
    body: String,
}

impl SimpleHttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status_code: status,
            body: body.into(),
        }
    }

    pub fn status(&self) -> u16 {
        self.status_code
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn json<T: DeserializeOwned>(&self) -> CoreResult<T> {
        Ok(serde_json::from_str(&self.body)?)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status_code == 401
    }
}

/// Sends fully described requests; the seam tests swap out
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Send a request; non-2xx statuses are returned, not raised
    async fn send(&self, request: HttpRequest) -> CoreResult<SimpleHttpResponse>;
}

/// Production client backed by a pooled `reqwest::Client`
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    pub fn new(timeout: Duration) -> CoreResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(request_failed)?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn send(&self, request: HttpRequest) -> CoreResult<SimpleHttpResponse> {
        let method = match request.method {
            HttpMethod::GET => reqwest::Method::GET,
            HttpMethod::POST => reqwest::Method::POST,
            HttpMethod::PUT => reqwest::Method::PUT,
            HttpMethod::PATCH => reqwest::Method::PATCH,
            HttpMethod::DELETE => reqwest::Method::DELETE,
        };

        let mut builder = self.client.request(method, &request.url);
        for (key, value) in &request.headers {
            builder = builder.header(key, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(SimpleHttpResponse::new(status, body))
    }
}


#[cfg(test)]
mod tests {
    use super::mock::MockHttpClient;
    use super::*;

    #[tokio::test]
    async fn test_mock_http_client() {
        let client = MockHttpClient::new();
        client.mock_response("https://example.com/api", 401, "expired");
        client.mock_json(
            "https://example.com/api",
            200,
            &serde_json::json!({"items": []}),
        );

        let request = HttpRequest::new(HttpMethod::GET, "https://example.com/api").with_bearer("abc");
        let first = client.send(request.clone()).await.unwrap();
        assert!(first.is_unauthorized());

        let second = client.send(request.clone()).await.unwrap();
        assert!(second.is_success());
        let body: serde_json::Value = second.json().unwrap();
        assert_eq!(body["items"], serde_json::json!([]));

        // Last response repeats
        assert!(client.send(request).await.unwrap().is_success());

        let missing = client
            .send(HttpRequest::new(HttpMethod::GET, "https://example.com/missing"))
            .await;
        assert!(missing.is_err());

        let recorded = client.requests_to("https://example.com/api");
        assert_eq!(recorded.len(), 3);
        assert_eq!(recorded[0].headers["Authorization"], "Bearer abc");
    }

    #[test]
    fn test_request_display() {
        let request = HttpRequest::new(HttpMethod::DELETE, "http://h/tasks/1");
        assert_eq!(request.to_string(), "DELETE http://h/tasks/1");
    }
}
