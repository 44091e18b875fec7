//! # Aggregator API
//!
//! One endpoint serves both directions: telemetry is POSTed as a list of
//! per-pod reports and the response carries the pending controls. An empty
//! list fetches controls without reporting anything.
//!
//! ```json
//! [{"pod": "HU-1", "values": [
//!     {"measurement": "sumActivePower", "measuredAt": "2025-06-01T12:00:00.000Z",
//!      "value": 812.4, "quality": 1}
//! ]}]
//! ```
//!
//! ```json
//! {"controls": [{"pod": "HU-1", "heartbeat": 42, "sumSetPoint": 500.0,
//!                "scheduledReference": 480.0, "useSetPoint": 1}]}
//! ```

pub mod payload;

pub use payload::*;

use crate::config::AggregatorConfig;
use crate::model::Control;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, warn};

pub const SUBSCRIPTION_KEY_HEADER: &str = "Ocp-Apim-Subscription-Key";

#[derive(Debug, Error)]
pub enum AggregatorError {
    #[error("aggregator API key is not set (ALTEO_API_KEY)")]
    MissingApiKey,

    #[error("HTTP client configuration error: {0}")]
    Config(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("request failed: {0}")]
    Request(String),
}

impl From<reqwest::Error> for AggregatorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AggregatorError::Timeout(err.to_string())
        } else {
            AggregatorError::Request(err.to_string())
        }
    }
}

/// Status and body of an aggregator response.
///
/// A body that is not JSON is kept as `{"raw_text": <body>}`.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    pub fn from_text(status: u16, text: &str) -> Self {
        let body = serde_json::from_str(text).unwrap_or_else(|_| json!({ "raw_text": text }));
        Self { status, body }
    }

    pub fn is_ok(&self) -> bool {
        self.status == 200
    }

    /// Controls in the body. Entries that do not parse are logged and skipped.
    pub fn controls(&self) -> Vec<Control> {
        let Some(entries) = self.body.get("controls").and_then(Value::as_array) else {
            return Vec::new();
        };
        entries
            .iter()
            .filter_map(|entry| match serde_json::from_value::<Control>(entry.clone()) {
                Ok(control) => Some(control),
                Err(e) => {
                    warn!(error = %e, entry = %entry, "Ignoring malformed control");
                    None
                }
            })
            .collect()
    }

    /// The first entry of `controls`, addressed to `pod` whatever it names.
    ///
    /// Only `controls[0]` is considered; a malformed first entry yields
    /// `None` rather than falling through to the next one.
    pub fn first_control(&self, pod: &str) -> Option<Control> {
        let mut entry = self
            .body
            .get("controls")
            .and_then(Value::as_array)?
            .first()?
            .clone();
        entry
            .as_object_mut()?
            .insert("pod".to_string(), Value::String(pod.to_string()));
        match serde_json::from_value::<Control>(entry) {
            Ok(control) => Some(control),
            Err(e) => {
                warn!(error = %e, pod, "Ignoring malformed control");
                None
            }
        }
    }
}

#[async_trait]
pub trait AggregatorApi: Send + Sync {
    async fn post_reports(&self, reports: &[PodReport]) -> Result<ApiResponse, AggregatorError>;
}

/// reqwest client for the plant-control endpoint.
#[derive(Debug, Clone)]
pub struct HttpAggregator {
    client: Client,
    url: String,
    api_key: Option<String>,
}

impl HttpAggregator {
    /// The key is checked per request, so programs that never call the API
    /// run without one.
    pub fn new(config: &AggregatorConfig) -> Result<Self, AggregatorError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| AggregatorError::Config(e.to_string()))?;
        Ok(Self {
            client,
            url: config.url.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl AggregatorApi for HttpAggregator {
    async fn post_reports(&self, reports: &[PodReport]) -> Result<ApiResponse, AggregatorError> {
        let key = self.api_key.as_deref().ok_or(AggregatorError::MissingApiKey)?;
        let response = self
            .client
            .post(&self.url)
            .header(SUBSCRIPTION_KEY_HEADER, key)
            .json(reports)
            .send()
            .await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        debug!(status, pods = reports.len(), "Aggregator responded");
        Ok(ApiResponse::from_text(status, &text))
    }
}

#[derive(Debug, Default)]
struct ScriptState {
    responses: VecDeque<Result<ApiResponse, String>>,
    requests: Vec<Vec<PodReport>>,
}

/// Aggregator stand-in answering from a queue and recording every request.
///
/// An empty queue answers `200 {"controls": []}`.
#[derive(Debug, Clone, Default)]
pub struct ScriptedAggregator {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn respond(&self, status: u16, body: Value) {
        self.state()
            .responses
            .push_back(Ok(ApiResponse { status, body }));
    }

    pub fn fail(&self, reason: &str) {
        self.state().responses.push_back(Err(reason.to_string()));
    }

    pub fn requests(&self) -> Vec<Vec<PodReport>> {
        self.state().requests.clone()
    }
}

#[async_trait]
impl AggregatorApi for ScriptedAggregator {
    async fn post_reports(&self, reports: &[PodReport]) -> Result<ApiResponse, AggregatorError> {
        let mut state = self.state();
        state.requests.push(reports.to_vec());
        match state.responses.pop_front() {
            Some(Ok(response)) => Ok(response),
            Some(Err(reason)) => Err(AggregatorError::Request(reason)),
            None => Ok(ApiResponse {
                status: 200,
                body: json!({ "controls": [] }),
            }),
        }
    }
}
