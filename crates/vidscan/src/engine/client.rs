//! HTTP client for the remote analysis engine.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};

use super::error::EngineError;
use super::types::{RemoteAnalysis, StartRequest, StartResponse};
use crate::config::EngineConfig;

/// Error bodies are cut to this length before they reach logs.
const MAX_ERROR_BODY_LENGTH: usize = 200;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

fn truncate_body(body: &str) -> String {
    if body.len() > MAX_ERROR_BODY_LENGTH {
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated)", &body[..end])
    } else {
        body.to_string()
    }
}

/// Operations the orchestrator needs from the analysis engine.
#[async_trait]
pub trait AnalysisEngine: Send + Sync {
    /// Starts a remote task and returns its id.
    async fn start_analysis(&self, request: &StartRequest) -> Result<String, EngineError>;

    async fn get_status(&self, remote_id: &str) -> Result<RemoteAnalysis, EngineError>;

    /// Asks the engine to stop a task. Best effort.
    async fn stop_analysis(&self, remote_id: &str) -> Result<(), EngineError>;

    /// Checks that the engine answers its health endpoint.
    async fn ping(&self) -> Result<(), EngineError>;
}

pub struct HttpEngineClient {
    client: Client,
    base_url: String,
    api_key: Option<SecretString>,
}

impl HttpEngineClient {
    pub fn new(config: &EngineConfig) -> Result<Self, EngineError> {
        let client = Client::builder()
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| EngineError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config
                .api_key
                .as_ref()
                .map(|key| SecretString::from(key.clone())),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key.expose_secret()),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, EngineError> {
        self.authorize(request)
            .send()
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))
    }

    /// Maps non-2xx responses to errors; `not_found_id` turns 404 into `NotFound`.
    async fn check(response: Response, not_found_id: Option<&str>) -> Result<Response, EngineError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::NOT_FOUND {
            if let Some(id) = not_found_id {
                return Err(EngineError::NotFound(id.to_string()));
            }
        }
        let body = response.text().await.unwrap_or_default();
        Err(EngineError::Status {
            status: status.as_u16(),
            body: truncate_body(&body),
        })
    }
}

#[async_trait]
impl AnalysisEngine for HttpEngineClient {
    async fn start_analysis(&self, request: &StartRequest) -> Result<String, EngineError> {
        debug!("Starting remote analysis for {}", request.video_location);

        let response = self
            .send(self.client.post(self.url("/analysis/start")).json(request))
            .await?;
        let response = Self::check(response, None).await?;

        let started: StartResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Decode(e.to_string()))?;

        info!("Remote analysis {} started", started.analysis_id);
        Ok(started.analysis_id)
    }

    async fn get_status(&self, remote_id: &str) -> Result<RemoteAnalysis, EngineError> {
        let response = self
            .send(self.client.get(self.url(&format!("/analysis/{}", remote_id))))
            .await?;
        let response = Self::check(response, Some(remote_id)).await?;

        response
            .json()
            .await
            .map_err(|e| EngineError::Decode(e.to_string()))
    }

    async fn stop_analysis(&self, remote_id: &str) -> Result<(), EngineError> {
        let response = self
            .send(self.client.post(self.url(&format!("/analysis/{}/stop", remote_id))))
            .await?;
        Self::check(response, Some(remote_id)).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), EngineError> {
        let response = self.send(self.client.get(self.url("/health/ping"))).await?;
        Self::check(response, None).await?;
        Ok(())
    }
}
