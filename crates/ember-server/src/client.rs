//! HTTP client for the inference server's local API.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::error::ServerError;
use crate::{INIT_PATH, LOOPBACK_HOST};

/// The parts of the server's HTTP surface the manager talks to.
#[async_trait]
pub trait ServerApi: Send + Sync {
    /// Tell a freshly started server which model to load.
    async fn init(&self, port: u16, model: &str) -> Result<(), ServerError>;

    /// Whether the server accepts HTTP connections yet.
    async fn probe(&self, port: u16) -> bool;
}

/// Body of the init handshake.
#[derive(Debug, Serialize)]
struct InitRequest<'a> {
    model: &'a str,
}

/// reqwest-backed [`ServerApi`].
#[derive(Debug, Clone)]
pub struct HttpServerApi {
    client: reqwest::Client,
    host: String,
    init_timeout: Option<Duration>,
}

impl HttpServerApi {
    /// Create a client for servers on the loopback interface.
    pub fn new() -> Self {
        Self::with_host(LOOPBACK_HOST)
    }

    /// Create a client for servers on a custom host.
    pub fn with_host(host: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            host: host.into(),
            init_timeout: None,
        }
    }

    /// Bound the init call. Unbounded by default: loading a model can mean
    /// downloading its weights first.
    pub fn with_init_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.init_timeout = timeout;
        self
    }

    /// Timeout applied to the init call, if any.
    pub fn init_timeout(&self) -> Option<Duration> {
        self.init_timeout
    }

    /// Base URL of a server listening on `port`.
    pub fn base_url(&self, port: u16) -> String {
        format!("http://{}:{}", self.host, port)
    }
}

impl Default for HttpServerApi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServerApi for HttpServerApi {
    async fn init(&self, port: u16, model: &str) -> Result<(), ServerError> {
        let url = format!("{}{}", self.base_url(port), INIT_PATH);
        debug!("POST {} (model: {})", url, model);

        let mut request = self.client.post(&url).json(&InitRequest { model });
        if let Some(timeout) = self.init_timeout {
            request = request.timeout(timeout);
        }
        let response = request.send().await?;

        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            Err(ServerError::InitRejected { status, body })
        }
    }

    async fn probe(&self, port: u16) -> bool {
        // Any answer at all means the listener is up; the server has no health route.
        self.client
            .get(self.base_url(port))
            .timeout(Duration::from_secs(2))
            .send()
            .await
            .is_ok()
    }
}
