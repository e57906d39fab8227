use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::warn;

use crate::clients::model::{ClassifierResult, ConversationModel};
use crate::clients::phq9::{QuestionnaireBackend, numbered_answers};
use crate::clients::results::ClassifierStore;

#[derive(Debug, PartialEq)]
pub enum ClassifyOutcome {
    /// Scored, persisted, ready to display.
    Completed(ClassifierResult),
    /// Empty session id or no stored answers yet; nothing to score.
    Skipped,
    /// A classification is already in flight for this session.
    Busy,
    /// A collaborator failed; logged, no result set, retry allowed.
    Failed,
}

/// Computes a depression-risk assessment on demand from the stored
/// questionnaire answers. Never invoked automatically per turn.
pub struct ClassifierInvoker {
    phq9: Arc<dyn QuestionnaireBackend>,
    model: Arc<dyn ConversationModel>,
    store: Arc<dyn ClassifierStore>,
    /// Session ids with a classification currently in flight. Keyed per
    /// session so one session's run never blocks another's.
    in_flight: Mutex<HashSet<String>>,
}

impl ClassifierInvoker {
    pub fn new(
        phq9: Arc<dyn QuestionnaireBackend>,
        model: Arc<dyn ConversationModel>,
        store: Arc<dyn ClassifierStore>,
    ) -> Self {
        Self { phq9, model, store, in_flight: Mutex::new(HashSet::new()) }
    }

    pub async fn run_classification(&self, session_id: &str) -> ClassifyOutcome {
        if session_id.is_empty() {
            return ClassifyOutcome::Skipped;
        }
        if !self.in_flight.lock().await.insert(session_id.to_string()) {
            return ClassifyOutcome::Busy;
        }
        let outcome = match self.classify(session_id).await {
            Ok(o) => o,
            Err(err) => {
                warn!(%session_id, error = %err, "classification failed");
                ClassifyOutcome::Failed
            }
        };
        self.in_flight.lock().await.remove(session_id);
        outcome
    }

    async fn classify(&self, session_id: &str) -> anyhow::Result<ClassifyOutcome> {
        let records = self.phq9.fetch_answers(session_id).await?;
        let rendered = numbered_answers(records);
        if rendered.is_empty() {
            return Ok(ClassifyOutcome::Skipped);
        }
        let result = self.model.score(&rendered).await?;
        self.store.save_result(session_id, &result).await?;
        Ok(ClassifyOutcome::Completed(result))
    }

    /// Aggregated depression index from the backend, computed over the
    /// persisted classification results.
    pub async fn depression_index(&self) -> anyhow::Result<serde_json::Value> {
        self.store.depression_index().await
    }
}
