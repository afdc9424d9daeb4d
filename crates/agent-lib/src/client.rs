//! HTTP client for the kubelet and cAdvisor endpoints

use crate::error::CollectorError;
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Thin JSON/text GET client bound to one base URL
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    base_url: Url,
    /// Bearer token file, re-read on every request so rotated tokens are picked up
    token_path: Option<PathBuf>,
}

impl HttpClient {
    /// Create a new client for `base_url`
    pub fn new(
        base_url: Url,
        token_path: Option<PathBuf>,
        tls_verify: bool,
        timeout: Duration,
    ) -> Result<Self, CollectorError> {
        let client = Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(!tls_verify)
            .build()
            .map_err(|e| {
                CollectorError::InvalidConfig(format!("failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            base_url,
            token_path,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolve `path` against the base URL
    pub fn url(&self, path: &str) -> Result<Url, CollectorError> {
        self.base_url
            .join(path)
            .map_err(|e| CollectorError::InvalidConfig(format!("invalid path {}: {}", path, e)))
    }

    /// GET `url` and decode the JSON body
    pub async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, CollectorError> {
        let endpoint = url.to_string();
        let response = self.send(url).await?;

        response.json().await.map_err(|e| CollectorError::Decode {
            endpoint,
            message: e.to_string(),
        })
    }

    /// GET `url` and return the body as text
    pub async fn get_text(&self, url: Url) -> Result<String, CollectorError> {
        let endpoint = url.to_string();
        let response = self.send(url).await?;

        response.text().await.map_err(|e| CollectorError::Decode {
            endpoint,
            message: e.to_string(),
        })
    }

    async fn send(&self, url: Url) -> Result<reqwest::Response, CollectorError> {
        let endpoint = url.to_string();
        let mut request = self.client.get(url);

        if let Some(token) = self.bearer_token().await? {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CollectorError::unreachable(&endpoint, e.to_string()))?;

        if !response.status().is_success() {
            return Err(CollectorError::Status {
                endpoint,
                status: response.status().as_u16(),
            });
        }

        Ok(response)
    }

    async fn bearer_token(&self) -> Result<Option<String>, CollectorError> {
        let Some(path) = &self.token_path else {
            return Ok(None);
        };

        let token = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| CollectorError::Credentials {
                path: path.clone(),
                source,
            })?;

        Ok(Some(token.trim().to_string()))
    }
}
