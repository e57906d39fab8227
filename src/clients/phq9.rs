use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::Endpoint;

/// One stored questionnaire answer. The backend has shipped the id field
/// under three different spellings over time; all are accepted here, and a
/// record with no id at all sorts first as id 0.
#[derive(Debug, Clone, Deserialize)]
pub struct AnswerRecord {
    #[serde(default, alias = "questionID", alias = "questionId")]
    pub question_id: i64,
    #[serde(alias = "answerText", alias = "answer_text")]
    pub answer: String,
}

/// Orders answers by question id and renders them the way the scoring
/// service expects: `"<id>. <answer>"`, one entry per item.
pub fn numbered_answers(mut records: Vec<AnswerRecord>) -> Vec<String> {
    records.sort_by_key(|r| r.question_id);
    records
        .into_iter()
        .map(|r| format!("{}. {}", r.question_id, r.answer))
        .collect()
}

#[async_trait]
pub trait QuestionnaireBackend: Send + Sync {
    async fn save_answer(
        &self,
        session_id: &str,
        question_id: i64,
        question: &str,
        answer: &str,
    ) -> anyhow::Result<()>;

    async fn fetch_answers(&self, session_id: &str) -> anyhow::Result<Vec<AnswerRecord>>;
}

#[derive(Clone)]
pub struct HttpQuestionnaireBackend {
    pub endpoint: Endpoint,
}

impl HttpQuestionnaireBackend {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }
}

#[derive(Debug, Serialize)]
struct SaveAnswerBody<'a> {
    #[serde(rename = "sessionID")]
    session_id: &'a str,
    #[serde(rename = "questionID")]
    question_id: i64,
    question: &'a str,
    answer: &'a str,
}

#[async_trait]
impl QuestionnaireBackend for HttpQuestionnaireBackend {
    async fn save_answer(
        &self,
        session_id: &str,
        question_id: i64,
        question: &str,
        answer: &str,
    ) -> anyhow::Result<()> {
        let body = SaveAnswerBody { session_id, question_id, question, answer };
        let rb = self
            .endpoint
            .client
            .post(self.endpoint.url("phq9/phq9-save"))
            .json(&body);
        let resp = self.endpoint.authed(rb).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("answer save failed: {}", resp.status());
        }
        Ok(())
    }

    async fn fetch_answers(&self, session_id: &str) -> anyhow::Result<Vec<AnswerRecord>> {
        let rb = self
            .endpoint
            .client
            .get(self.endpoint.url(&format!("phq9/answers/{}", session_id)));
        let resp = self.endpoint.authed(rb).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("answer fetch failed: {}", resp.status());
        }
        let records: Vec<AnswerRecord> = resp.json().await?;
        Ok(records)
    }
}
