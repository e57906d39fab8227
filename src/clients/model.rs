use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::Endpoint;

/// PHQ-9 severity bands. The scoring service reports a label alongside the
/// numeric score; when its spelling is unrecognized the label is re-derived
/// from the score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Minimal,
    Mild,
    Moderate,
    #[serde(rename = "Moderately Severe")]
    ModeratelySevere,
    Severe,
}

impl Severity {
    pub fn from_score(score: f64) -> Self {
        match score {
            s if s < 5.0 => Severity::Minimal,
            s if s < 10.0 => Severity::Mild,
            s if s < 15.0 => Severity::Moderate,
            s if s < 20.0 => Severity::ModeratelySevere,
            _ => Severity::Severe,
        }
    }

    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "minimal" => Some(Severity::Minimal),
            "mild" => Some(Severity::Mild),
            "moderate" => Some(Severity::Moderate),
            "moderately severe" | "moderately_severe" => Some(Severity::ModeratelySevere),
            "severe" => Some(Severity::Severe),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Minimal => "Minimal",
            Severity::Mild => "Mild",
            Severity::Moderate => "Moderate",
            Severity::ModeratelySevere => "Moderately Severe",
            Severity::Severe => "Severe",
        }
    }
}

/// Display-ready depression screening result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierResult {
    pub score: f64,
    pub level: Severity,
}

/// One conversational exchange as the model service returns it. The
/// questionnaire fields are present only when the model decided to
/// interleave a PHQ-9 item into this turn.
#[derive(Debug, Clone)]
pub struct TurnReply {
    pub response: String,
    pub question_id: Option<i64>,
    pub question_text: Option<String>,
}

impl TurnReply {
    /// Shown when the model service itself is unreachable.
    pub fn fallback() -> Self {
        Self {
            response: "Sorry, something went wrong.".into(),
            question_id: None,
            question_text: None,
        }
    }

    /// The questionnaire prompt counts only when both fields arrived
    /// well-typed; a lone id or lone text is ignored.
    pub fn question(&self) -> Option<(i64, &str)> {
        match (self.question_id, self.question_text.as_deref()) {
            (Some(id), Some(text)) => Some((id, text)),
            _ => None,
        }
    }
}

/// The NLP service: next-turn generation and questionnaire scoring.
#[async_trait]
pub trait ConversationModel: Send + Sync {
    async fn next_turn(
        &self,
        transcript: &str,
        latest_input: &str,
        summaries: &[String],
        asked_question_ids: &[i64],
    ) -> anyhow::Result<TurnReply>;

    async fn score(&self, numbered_answers: &[String]) -> anyhow::Result<ClassifierResult>;
}

#[derive(Clone)]
pub struct HttpModel {
    pub endpoint: Endpoint,
}

impl HttpModel {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }
}

#[derive(Debug, Serialize)]
struct AskBody<'a> {
    user_query: &'a str,
    history: &'a str,
    summaries: &'a [String],
    asked_phq_ids: &'a [i64],
}

#[derive(Debug, Deserialize)]
struct AskResponse {
    response: String,
    #[serde(rename = "phq9_questionID", default)]
    phq9_question_id: Option<i64>,
    #[serde(rename = "phq9_question", default)]
    phq9_question: Option<String>,
}

#[derive(Debug, Serialize)]
struct DetectBody<'a> {
    #[serde(rename = "phq9Answers")]
    phq9_answers: &'a [String],
}

#[derive(Debug, Deserialize)]
struct DetectResponse {
    phq9_score: f64,
    level: String,
}

#[derive(Debug, Deserialize, Default)]
struct DetectErrorBody {
    #[serde(default)]
    detail: Option<String>,
}

#[async_trait]
impl ConversationModel for HttpModel {
    async fn next_turn(
        &self,
        transcript: &str,
        latest_input: &str,
        summaries: &[String],
        asked_question_ids: &[i64],
    ) -> anyhow::Result<TurnReply> {
        let body = AskBody {
            user_query: latest_input,
            history: transcript,
            summaries,
            asked_phq_ids: asked_question_ids,
        };
        let resp = self
            .endpoint
            .client
            .post(self.endpoint.url("ask"))
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("ask failed: {}", resp.status());
        }
        let v: AskResponse = resp.json().await?;
        Ok(TurnReply {
            response: v.response,
            question_id: v.phq9_question_id,
            question_text: v.phq9_question,
        })
    }

    async fn score(&self, numbered_answers: &[String]) -> anyhow::Result<ClassifierResult> {
        let body = DetectBody { phq9_answers: numbered_answers };
        let resp = self
            .endpoint
            .client
            .post(self.endpoint.url("detect"))
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let err: DetectErrorBody = resp.json().await.unwrap_or_default();
            match err.detail {
                Some(detail) => anyhow::bail!("detection failed with {}: {}", status, detail),
                None => anyhow::bail!("detection failed with {}", status),
            }
        }
        let v: DetectResponse = resp.json().await?;
        let level = Severity::parse(&v.level).unwrap_or_else(|| Severity::from_score(v.phq9_score));
        Ok(ClassifierResult { score: v.phq9_score, level })
    }
}
