//! Pluggable HTTP transport
//!
//! [`NetworkClient`](super::NetworkClient) never talks to `reqwest` directly:
//! it asks a [`TransportFactory`] for a [`Transport`] built from the current
//! [`TransportSettings`], and rebuilds it when the settings change (e.g. a
//! proxy is configured). Tests substitute their own factory.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::config::ProxyConfig;
use crate::error::{Error, Result};

/// HTTP methods used by the API
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
        }
    }
}

/// A fully built request, ready for any transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    /// First value of a header, compared case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Raw response: status and body, uninterpreted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body as text, lossily decoded
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Sends requests on behalf of the network client
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request
    ///
    /// Returns `Err(Error::NetworkDisconnected)` when the server could not be
    /// reached and `Err(Error::Transport)` when no response was received for
    /// another reason. Any status code, including errors, is an `Ok` response.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;

    /// Whether a request can be attempted at all
    fn is_connected(&self) -> bool {
        true
    }
}

/// Settings a transport is built from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSettings {
    pub timeout: Duration,
    pub proxy: Option<ProxyConfig>,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            proxy: None,
        }
    }
}

/// Builds transports from settings
pub trait TransportFactory: Send + Sync {
    fn create(&self, settings: &TransportSettings) -> Result<Arc<dyn Transport>>;
}

/// Transport backed by a `reqwest::Client`
pub struct ReqwestTransport {
    http_client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(settings: &TransportSettings) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(settings.timeout);

        if let Some(proxy) = &settings.proxy {
            let proxy = reqwest::Proxy::all(proxy.url())
                .map_err(|e| Error::Config(format!("invalid proxy: {}", e)))?;
            builder = builder.proxy(proxy);
        }

        let http_client = builder
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self { http_client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
        };

        let mut headers = HeaderMap::new();
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::Config(format!("invalid header name {:?}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::Config(format!("invalid value for header {}: {}", name, e)))?;
            headers.insert(name, value);
        }

        let mut builder = self
            .http_client
            .request(method, &request.url)
            .headers(headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_connect() {
                tracing::debug!(error = %e, "Could not connect");
                Error::NetworkDisconnected
            } else {
                Error::Transport(format!("HTTP request failed: {}", e))
            }
        })?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Transport(format!("failed to read response body: {}", e)))?;

        Ok(HttpResponse {
            status,
            body: body.to_vec(),
        })
    }
}

/// Factory producing [`ReqwestTransport`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct ReqwestTransportFactory;

impl TransportFactory for ReqwestTransportFactory {
    fn create(&self, settings: &TransportSettings) -> Result<Arc<dyn Transport>> {
        Ok(Arc::new(ReqwestTransport::new(settings)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_lookup_ignores_case() {
        let request = HttpRequest {
            method: HttpMethod::Post,
            url: "https://api.keen.io".to_string(),
            headers: vec![("Authorization".to_string(), "key".to_string())],
            body: None,
        };
        assert_eq!(request.header("authorization"), Some("key"));
        assert_eq!(request.header("content-type"), None);
    }

    #[test]
    fn test_response_success_range() {
        let ok = HttpResponse {
            status: 201,
            body: Vec::new(),
        };
        let err = HttpResponse {
            status: 400,
            body: b"bad".to_vec(),
        };
        assert!(ok.is_success());
        assert!(!err.is_success());
        assert_eq!(err.body_text(), "bad");
    }

    #[test]
    fn test_reqwest_factory_accepts_proxy() {
        let settings = TransportSettings {
            timeout: Duration::from_secs(5),
            proxy: Some(ProxyConfig {
                host: "127.0.0.1".to_string(),
                port: 3128,
            }),
        };
        assert!(ReqwestTransportFactory.create(&settings).is_ok());
    }
}
