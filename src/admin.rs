//! Client for a proxy's administrative HTTP endpoint

use crate::error::{HarnessError, Result};
use std::time::Duration;
use tracing::debug;

/// Path of the flat JSON stats listing, restricted to stats that have been touched
pub const STATS_JSON_PATH: &str = "/stats?format=json&usedonly";
/// Path of the Prometheus text exposition
pub const STATS_PROMETHEUS_PATH: &str = "/stats/prometheus";
/// Path that triggers graceful shutdown
pub const QUIT_PATH: &str = "/quitquitquit";

/// A fetched administrative response
#[derive(Debug, Clone)]
pub struct AdminResponse {
    pub status: u16,
    pub body: String,
}

impl AdminResponse {
    pub fn is_success(&self) -> bool {
        self.status == 200
    }
}

/// Talks to the administrative endpoint of one proxy instance
#[derive(Debug, Clone)]
pub struct AdminClient {
    port: u16,
    base_url: String,
    http: reqwest::Client,
}

impl AdminClient {
    /// Client for the admin endpoint on `port`, bypassing any configured proxy
    pub fn new(port: u16, request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .no_proxy()
            .build()
            .map_err(|e| {
                HarnessError::Config(format!("building admin client for port {}: {}", port, e))
            })?;

        Ok(Self {
            port,
            base_url: format!("http://127.0.0.1:{}", port),
            http,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// GET `path`, returning status and body for any HTTP status
    pub async fn get(&self, path: &str) -> Result<AdminResponse> {
        let url = self.url(path);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|source| HarnessError::Http {
                url: url.clone(),
                source,
            })?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|source| HarnessError::Http { url, source })?;
        Ok(AdminResponse { status, body })
    }

    /// GET `path`, failing on any status other than 200
    pub async fn get_ok(&self, path: &str) -> Result<String> {
        let response = self.get(path).await?;
        if !response.is_success() {
            return Err(HarnessError::Status {
                url: self.url(path),
                status: response.status,
            });
        }
        Ok(response.body)
    }

    pub async fn stats_json(&self) -> Result<String> {
        self.get_ok(STATS_JSON_PATH).await
    }

    pub async fn stats_prometheus(&self) -> Result<String> {
        self.get_ok(STATS_PROMETHEUS_PATH).await
    }

    /// Whether the endpoint at `path` currently answers with 200
    pub async fn is_live(&self, path: &str) -> bool {
        match self.get(path).await {
            Ok(response) => response.is_success(),
            Err(e) => {
                debug!(port = self.port, error = %e, "Liveness probe failed");
                false
            }
        }
    }

    /// Ask the proxy to shut down. The response is ignored.
    pub async fn quit(&self) {
        let url = self.url(QUIT_PATH);
        match self.http.post(&url).send().await {
            Ok(response) => {
                debug!(port = self.port, status = response.status().as_u16(), "Shutdown requested")
            }
            Err(e) => debug!(port = self.port, error = %e, "Shutdown request failed"),
        }
    }
}
