//! HTTP client for the kernel API.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::config::AgentConfig;
use crate::snapshot::{Action, Prepared, StatusSnapshot};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("kernel answered {0}")]
    Status(u16),
}

#[async_trait]
pub trait KernelApi: Send + Sync {
    async fn status(&self) -> Result<StatusSnapshot, ClientError>;
    async fn act(&self, action: Action, pool: &str, vm: &str, recovery: bool) -> Result<bool, ClientError>;
    async fn prepare(&self, action: Action, pool: &str, vm: &str) -> Result<Prepared, ClientError>;
    async fn confirm(&self, token: &str, target: &str, recovery: bool) -> Result<bool, ClientError>;
}

#[derive(Deserialize)]
struct Ack {
    ok: bool,
}

pub struct HttpKernel {
    http: reqwest::Client,
    base: String,
    api_key: String,
    principal: String,
}

impl HttpKernel {
    pub fn new(cfg: &AgentConfig) -> Result<Self, ClientError> {
        Ok(Self {
            http: reqwest::Client::builder().build()?,
            base: cfg.kernel_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
            principal: cfg.principal.clone(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base, path))
            .header("x-api-key", &self.api_key)
            .header("x-remote-user", &self.principal)
    }

    async fn send<T: serde::de::DeserializeOwned>(&self, req: reqwest::RequestBuilder) -> Result<T, ClientError> {
        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(ClientError::Status(resp.status().as_u16()));
        }
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl KernelApi for HttpKernel {
    async fn status(&self) -> Result<StatusSnapshot, ClientError> {
        self.send(self.request(reqwest::Method::GET, "/status")).await
    }

    async fn act(&self, action: Action, pool: &str, vm: &str, recovery: bool) -> Result<bool, ClientError> {
        let req = self
            .request(reqwest::Method::POST, &format!("/actions/{action}"))
            .json(&json!({ "pool": pool, "vm": vm, "recovery": recovery }));
        Ok(self.send::<Ack>(req).await?.ok)
    }

    async fn prepare(&self, action: Action, pool: &str, vm: &str) -> Result<Prepared, ClientError> {
        let req = self
            .request(reqwest::Method::POST, &format!("/actions/{action}/prepare"))
            .json(&json!({ "pool": pool, "vm": vm }));
        self.send(req).await
    }

    async fn confirm(&self, token: &str, target: &str, recovery: bool) -> Result<bool, ClientError> {
        let req = self
            .request(reqwest::Method::POST, "/actions/confirm")
            .json(&json!({ "token": token, "target": target, "recovery": recovery }));
        Ok(self.send::<Ack>(req).await?.ok)
    }
}
