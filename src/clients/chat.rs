use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::Endpoint;
use crate::session::Sender;

/// One message as the chat backend returns it from the history endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryEntry {
    pub sender: String,
    #[serde(alias = "text")]
    pub message: String,
}

/// Persistence and session lifecycle, provided by the chat backend service.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn create_session(&self) -> anyhow::Result<String>;
    async fn end_session(&self, session_id: &str) -> anyhow::Result<()>;
    async fn save_message(&self, session_id: &str, sender: Sender, text: &str) -> anyhow::Result<()>;
    async fn fetch_history(&self, session_id: &str) -> anyhow::Result<Vec<HistoryEntry>>;
    async fn fetch_summaries(&self) -> anyhow::Result<Vec<String>>;
}

#[derive(Clone)]
pub struct HttpChatBackend {
    pub endpoint: Endpoint,
}

impl HttpChatBackend {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }
}

/// The backend issues session identifiers as either a JSON number or a
/// string depending on its version; both are carried as strings here.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SessionIdValue {
    Num(i64),
    Str(String),
}

impl SessionIdValue {
    fn into_string(self) -> String {
        match self {
            SessionIdValue::Num(n) => n.to_string(),
            SessionIdValue::Str(s) => s,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StartSessionResponse {
    #[serde(rename = "sessionID")]
    session_id: SessionIdValue,
}

#[derive(Debug, Serialize)]
struct SaveMessageBody<'a> {
    message: &'a str,
    #[serde(rename = "sessionID")]
    session_id: &'a str,
    sender: &'a str,
}

#[derive(Debug, Serialize)]
struct EndSessionBody<'a> {
    #[serde(rename = "sessionID")]
    session_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct SummariesResponse {
    #[serde(default)]
    summaries: Vec<String>,
}

#[async_trait]
impl ChatBackend for HttpChatBackend {
    async fn create_session(&self) -> anyhow::Result<String> {
        let resp = self
            .endpoint
            .client
            .post(self.endpoint.url("session/start"))
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("session start failed: {}", resp.status());
        }
        let v: StartSessionResponse = resp.json().await?;
        Ok(v.session_id.into_string())
    }

    async fn end_session(&self, session_id: &str) -> anyhow::Result<()> {
        let resp = self
            .endpoint
            .client
            .post(self.endpoint.url("session/end"))
            .json(&EndSessionBody { session_id })
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("session end failed: {}", resp.status());
        }
        Ok(())
    }

    async fn save_message(&self, session_id: &str, sender: Sender, text: &str) -> anyhow::Result<()> {
        let body = SaveMessageBody {
            message: text,
            session_id,
            sender: sender.as_str(),
        };
        let resp = self
            .endpoint
            .client
            .post(self.endpoint.url("chat/save"))
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("message save failed: {}", resp.status());
        }
        Ok(())
    }

    async fn fetch_history(&self, session_id: &str) -> anyhow::Result<Vec<HistoryEntry>> {
        let rb = self
            .endpoint
            .client
            .get(self.endpoint.url(&format!("chat/history/{}", session_id)));
        let resp = self.endpoint.authed(rb).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("history fetch failed: {}", resp.status());
        }
        // Older backend versions return a non-array payload here; treat
        // anything that is not a list of entries as an empty history.
        let v: serde_json::Value = resp.json().await?;
        let entries = match v {
            serde_json::Value::Array(items) => items
                .into_iter()
                .filter_map(|item| serde_json::from_value(item).ok())
                .collect(),
            _ => Vec::new(),
        };
        Ok(entries)
    }

    async fn fetch_summaries(&self) -> anyhow::Result<Vec<String>> {
        let resp = self
            .endpoint
            .client
            .get(self.endpoint.url("sessionSummary/session-summaries"))
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("summary fetch failed: {}", resp.status());
        }
        let v: SummariesResponse = resp.json().await?;
        Ok(v.summaries)
    }
}
