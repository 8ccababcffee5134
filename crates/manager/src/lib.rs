//! HTTP implementation of the pool control-plane contract.

#![forbid(unsafe_code)]

use std::time::Duration;

use async_trait::async_trait;
use krill_core::{KrillError, Pool, PoolManager, PoolSpec};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use tracing::debug;

/// Options for constructing an [`HttpPoolManager`].
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Base URL of the control-plane API, e.g. `https://lb.example.com`.
    pub base_url: String,
    /// Bearer token presented on every request, when set.
    pub bearer_token: Option<String>,
    /// Skip verification of the TLS certificate presented by the API server.
    pub insecure_skip_tls_verify: bool,
    /// Per-request timeout; remote calls must return promptly on shutdown.
    pub timeout: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            bearer_token: None,
            insecure_skip_tls_verify: false,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Pool manager backed by the control plane's v2 HTTP API.
pub struct HttpPoolManager {
    client: reqwest::Client,
    base_url: String,
    bearer_token: Option<String>,
}

impl HttpPoolManager {
    pub fn new(opts: ManagerOptions) -> Result<Self, KrillError> {
        let mut builder = reqwest::Client::builder().timeout(opts.timeout);
        if opts.insecure_skip_tls_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder
            .build()
            .map_err(|e| KrillError::Remote(format!("building http client: {}", e)))?;
        Ok(Self {
            client,
            base_url: opts.base_url.trim_end_matches('/').to_string(),
            bearer_token: opts.bearer_token,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.client.request(method, url);
        if let Some(token) = &self.bearer_token {
            req = req.bearer_auth(token);
        }
        req
    }
}

fn transport_err(e: reqwest::Error) -> KrillError {
    KrillError::Remote(e.to_string())
}

async fn decode_pool(resp: Response) -> Result<Pool, KrillError> {
    let status = resp.status();
    if !status.is_success() {
        return Err(KrillError::Remote(format!(
            "control plane returned {}",
            status
        )));
    }
    resp.json::<Pool>()
        .await
        .map_err(|e| KrillError::Remote(format!("decoding pool: {}", e)))
}

#[async_trait]
impl PoolManager for HttpPoolManager {
    async fn create_pool(&self, spec: &PoolSpec) -> Result<Pool, KrillError> {
        debug!(pool = %spec.name, "creating pool");
        let resp = self
            .request(Method::POST, "/v2/pools")
            .json(spec)
            .send()
            .await
            .map_err(transport_err)?;
        decode_pool(resp).await
    }

    async fn get_pool_by_name(&self, name: &str) -> Result<Pool, KrillError> {
        let resp = self
            .request(Method::GET, &format!("/v2/pools/{}", name))
            .send()
            .await
            .map_err(transport_err)?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(KrillError::NotFound(format!(
                "pool {:?} does not exist",
                name
            )));
        }
        decode_pool(resp).await
    }

    async fn update_pool(&self, name: &str, spec: &PoolSpec) -> Result<Pool, KrillError> {
        debug!(pool = %name, "updating pool");
        let resp = self
            .request(Method::PUT, &format!("/v2/pools/{}", name))
            .json(spec)
            .send()
            .await
            .map_err(transport_err)?;
        decode_pool(resp).await
    }

    async fn get_version(&self) -> Result<String, KrillError> {
        let resp = self
            .request(Method::GET, "/version")
            .send()
            .await
            .map_err(transport_err)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(KrillError::Remote(format!(
                "control plane returned {}",
                status
            )));
        }
        resp.text()
            .await
            .map(|v| v.trim().to_string())
            .map_err(transport_err)
    }
}
