use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::Endpoint;
use crate::clients::model::ClassifierResult;

/// Failures from the save-with-explicit-response endpoints. A rejection
/// carries whatever message the backend put in the response body.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("save failed with {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

/// Persistence for classification results, plus the aggregated
/// depression-index report the backend computes from them.
#[async_trait]
pub trait ClassifierStore: Send + Sync {
    async fn save_result(&self, session_id: &str, result: &ClassifierResult) -> Result<(), StoreError>;
    async fn depression_index(&self) -> anyhow::Result<serde_json::Value>;
}

#[derive(Clone)]
pub struct HttpClassifierStore {
    pub endpoint: Endpoint,
}

impl HttpClassifierStore {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }
}

#[derive(Debug, Serialize)]
struct SaveResultBody<'a> {
    #[serde(rename = "sessionID")]
    session_id: &'a str,
    classifier: &'a ClassifierResult,
}

#[derive(Debug, Deserialize, Default)]
struct SaveErrorBody {
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LevelResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: serde_json::Value,
}

#[async_trait]
impl ClassifierStore for HttpClassifierStore {
    async fn save_result(&self, session_id: &str, result: &ClassifierResult) -> Result<(), StoreError> {
        let body = SaveResultBody { session_id, classifier: result };
        let rb = self
            .endpoint
            .client
            .post(self.endpoint.url("classifier/save"))
            .json(&body);
        let resp = self.endpoint.authed(rb).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let err: SaveErrorBody = resp.json().await.unwrap_or_default();
            let message = err
                .error
                .unwrap_or_else(|| format!("save failed with {}", status));
            return Err(StoreError::Rejected { status: status.as_u16(), message });
        }
        Ok(())
    }

    async fn depression_index(&self) -> anyhow::Result<serde_json::Value> {
        let rb = self
            .endpoint
            .client
            .get(self.endpoint.url("levelDetection/depression-index"));
        let resp = self.endpoint.authed(rb).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("depression index failed: {}", resp.status());
        }
        let v: LevelResponse = resp.json().await?;
        if !v.success {
            anyhow::bail!("depression index reported failure");
        }
        Ok(v.data)
    }
}
