//! Worker offload client
//!
//! Optional remote helper for the two analysis phases. The pipeline posts
//! the enriched batch and alpha to the worker; any failure (connect, HTTP
//! status, deadline, malformed body) surfaces as [`WorkerError`] and the
//! caller silently falls back to the local implementation.

use forensics_core::{CalibratedAnomaly, FusedSignal, Signal};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Hard deadline on any worker call.
pub const WORKER_TIMEOUT: Duration = Duration::from_secs(8);

pub const FUSE_PATH: &str = "/internal/forensics/v1/fuse";
pub const ANOMALY_PATH: &str = "/internal/forensics/v1/anomaly";

const SECRET_HEADER: &str = "X-Forensics-Worker-Secret";

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("worker returned status {0}")]
    BadStatus(u16),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Clone, Serialize)]
struct WorkerRequest<'a> {
    domain: &'a str,
    signals: &'a [Signal],
    alpha: f64,
}

#[derive(Debug, Clone, Deserialize)]
struct FuseResponse {
    #[serde(default)]
    fused_signals: Option<Vec<FusedSignal>>,
}

#[derive(Debug, Clone, Deserialize)]
struct AnomalyResponse {
    #[serde(default)]
    anomalies: Option<Vec<CalibratedAnomaly>>,
}

#[derive(Clone)]
pub struct WorkerClient {
    client: reqwest::Client,
    base_url: String,
    shared_secret: Option<String>,
}

impl WorkerClient {
    pub fn new(base_url: String, shared_secret: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(WORKER_TIMEOUT)
            .pool_max_idle_per_host(4)
            .build()
            .expect("Failed to create worker HTTP client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            shared_secret: shared_secret.filter(|s| !s.is_empty()),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn post(&self, path: &str, body: &WorkerRequest<'_>) -> WorkerResult<serde_json::Value> {
        let mut request = self.client.post(self.endpoint(path)).json(body);
        if let Some(secret) = &self.shared_secret {
            request = request.header(SECRET_HEADER, secret);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(WorkerError::BadStatus(status.as_u16()));
        }
        response
            .json::<serde_json::Value>()
            .await
            .map_err(WorkerError::RequestFailed)
    }

    /// Offload the fusion phase. Errors mean "fall back to local".
    pub async fn fuse(
        &self,
        domain: &str,
        signals: &[Signal],
        alpha: f64,
    ) -> WorkerResult<Vec<FusedSignal>> {
        let raw = self
            .post(FUSE_PATH, &WorkerRequest { domain, signals, alpha })
            .await?;
        parse_fuse_response(raw)
    }

    /// Offload the anomaly phase. Errors mean "fall back to local".
    pub async fn anomaly(
        &self,
        domain: &str,
        signals: &[Signal],
        alpha: f64,
    ) -> WorkerResult<Vec<CalibratedAnomaly>> {
        let raw = self
            .post(ANOMALY_PATH, &WorkerRequest { domain, signals, alpha })
            .await?;
        parse_anomaly_response(raw)
    }
}

fn parse_fuse_response(raw: serde_json::Value) -> WorkerResult<Vec<FusedSignal>> {
    let parsed: FuseResponse = serde_json::from_value(raw)
        .map_err(|e| WorkerError::InvalidResponse(e.to_string()))?;
    parsed
        .fused_signals
        .ok_or_else(|| WorkerError::InvalidResponse("missing fused_signals".to_string()))
}

fn parse_anomaly_response(raw: serde_json::Value) -> WorkerResult<Vec<CalibratedAnomaly>> {
    let parsed: AnomalyResponse = serde_json::from_value(raw)
        .map_err(|e| WorkerError::InvalidResponse(e.to_string()))?;
    parsed
        .anomalies
        .ok_or_else(|| WorkerError::InvalidResponse("missing anomalies".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn endpoint_normalizes_trailing_slash() {
        let client = WorkerClient::new("http://worker:9000/".to_string(), None);
        assert_eq!(
            client.endpoint(FUSE_PATH),
            "http://worker:9000/internal/forensics/v1/fuse"
        );
    }

    #[test]
    fn empty_secret_is_dropped() {
        let client = WorkerClient::new("http://worker:9000".to_string(), Some(String::new()));
        assert!(client.shared_secret.is_none());

        let client =
            WorkerClient::new("http://worker:9000".to_string(), Some("hunter2".to_string()));
        assert_eq!(client.shared_secret.as_deref(), Some("hunter2"));
    }

    #[test]
    fn fuse_response_requires_payload() {
        assert!(parse_fuse_response(json!({})).is_err());
        assert!(parse_fuse_response(json!({"fused_signals": null})).is_err());

        let ok = parse_fuse_response(json!({"fused_signals": []})).unwrap();
        assert!(ok.is_empty());

        let one = parse_fuse_response(json!({
            "fused_signals": [{
                "source_id": "s",
                "domain": "d",
                "region": "global",
                "probability": 0.7,
                "score": 65.0,
                "confidence_lower": 0.5,
                "confidence_upper": 0.9,
                "contributors": [],
                "evidence_ids": []
            }]
        }))
        .unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].source_id, "s");
    }

    #[test]
    fn anomaly_response_rejects_malformed() {
        assert!(parse_anomaly_response(json!({"anomalies": "nope"})).is_err());
        assert!(parse_anomaly_response(json!({})).is_err());
        assert!(parse_anomaly_response(json!({"anomalies": []})).unwrap().is_empty());
    }
}
