// http/client.rs - HTTP client for the remote resource service

use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use std::collections::HashMap;
use std::time::Duration;

/// A request ready to go out on the wire
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
}

/// Status and body of a remote response
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The seam between the engine and the network.
///
/// Production uses [`RemoteClient`]; tests substitute scripted transports.
/// A returned `Err` means the request never produced an HTTP response
/// (connect failure, timeout); any response, success or not, is `Ok`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &OutboundRequest) -> Result<TransportResponse>;
}

/// reqwest-backed transport
#[derive(Clone)]
pub struct RemoteClient {
    base_url: Option<String>,
    http_client: reqwest::Client,
}

impl RemoteClient {
    /// Create a client. `base_url` is only consulted for relative request
    /// URLs; absolute URLs pass through untouched.
    pub fn new(base_url: Option<String>) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.map(|u| u.trim_end_matches('/').to_string()),
            http_client,
        })
    }

    fn resolve_url(&self, url: &str) -> Result<String> {
        if url.starts_with("http://") || url.starts_with("https://") {
            return Ok(url.to_string());
        }

        match &self.base_url {
            Some(base) => Ok(format!("{}/{}", base, url.trim_start_matches('/'))),
            None => Err(Error::InvalidInput(format!(
                "Relative URL {} with no remote_base_url configured",
                url
            ))),
        }
    }

    fn build_headers(headers: &HashMap<String, String>) -> Result<HeaderMap> {
        let mut map = HeaderMap::new();
        map.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::InvalidInput(format!("Invalid header name {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::InvalidInput(format!("Invalid header value: {}", e)))?;
            map.insert(name, value);
        }

        Ok(map)
    }
}

#[async_trait]
impl Transport for RemoteClient {
    async fn send(&self, request: &OutboundRequest) -> Result<TransportResponse> {
        let url = self.resolve_url(&request.url)?;
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| Error::InvalidInput(format!("Invalid method {}: {}", request.method, e)))?;
        let headers = Self::build_headers(&request.headers)?;

        let mut builder = self.http_client.request(method, &url).headers(headers);
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Network(format!("{} {} failed: {}", request.method, url, e)))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Network(format!("Failed to read response body: {}", e)))?;

        Ok(TransportResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_url() {
        let client = RemoteClient::new(Some("https://api.example.com/".to_string())).unwrap();

        assert_eq!(
            client.resolve_url("/v1/customers").unwrap(),
            "https://api.example.com/v1/customers"
        );
        assert_eq!(
            client.resolve_url("https://other.example.com/x").unwrap(),
            "https://other.example.com/x"
        );

        let bare = RemoteClient::new(None).unwrap();
        assert!(bare.resolve_url("/v1/customers").is_err());
        assert!(bare.resolve_url("https://other.example.com/x").is_ok());
    }

    #[test]
    fn test_build_headers_rejects_garbage() {
        let mut headers = HashMap::new();
        headers.insert("X-Ok".to_string(), "fine".to_string());
        assert!(RemoteClient::build_headers(&headers).is_ok());

        headers.insert("bad name".to_string(), "x".to_string());
        assert!(RemoteClient::build_headers(&headers).is_err());
    }
}
