use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::warn;

use crate::clients::chat::{ChatBackend, HistoryEntry};
use crate::clients::model::{ConversationModel, TurnReply};
use crate::clients::phq9::QuestionnaireBackend;
use crate::session::{Delivery, Message, Sender, SessionState};

/// A session plus its turn gate. Only one turn may be in flight per session;
/// a second submission is rejected while the gate is held rather than queued.
pub struct SessionHandle {
    pub state: RwLock<SessionState>,
    turn_gate: Mutex<()>,
}

impl SessionHandle {
    pub fn new(state: SessionState) -> Self {
        Self { state: RwLock::new(state), turn_gate: Mutex::new(()) }
    }

    pub async fn snapshot(&self) -> SessionState {
        self.state.read().await.clone()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Full turn completed; the log was rebuilt from the backend copy.
    Completed,
    /// Blank input: nothing appended, no network call made.
    Ignored,
    /// Another turn is already in flight for this session.
    Busy,
    /// The session was reset or ended while the turn was in flight; its
    /// results were discarded.
    Stale,
    /// The session has ended; no further turns are accepted.
    Ended,
}

/// Orchestrates one conversational exchange against the three collaborators.
pub struct TurnController {
    chat: Arc<dyn ChatBackend>,
    phq9: Arc<dyn QuestionnaireBackend>,
    model: Arc<dyn ConversationModel>,
}

impl TurnController {
    pub fn new(
        chat: Arc<dyn ChatBackend>,
        phq9: Arc<dyn QuestionnaireBackend>,
        model: Arc<dyn ConversationModel>,
    ) -> Self {
        Self { chat, phq9, model }
    }

    /// Creates the initial session: backend identifier plus prior-session
    /// summaries, with the greeting already in the log.
    pub async fn start_session(&self) -> anyhow::Result<SessionHandle> {
        let id = self.chat.create_session().await?;
        let mut state = SessionState::new(id);
        state.summaries = self.fetch_summaries_lenient().await;
        Ok(SessionHandle::new(state))
    }

    /// "New Chat": requests a fresh backend identifier and resets the local
    /// state wholesale. Returns the new identifier.
    pub async fn new_chat(&self, session: &SessionHandle) -> anyhow::Result<String> {
        let new_id = self.chat.create_session().await?;
        let summaries = self.fetch_summaries_lenient().await;
        let mut st = session.state.write().await;
        st.reset(new_id.clone());
        st.summaries = summaries;
        Ok(new_id)
    }

    /// "End Session": tells the backend, then discards local state. The
    /// backend call failing does not keep the session alive locally.
    pub async fn end_session(&self, session: &SessionHandle) {
        let session_id = session.state.read().await.session_id.clone();
        if let Err(err) = self.chat.end_session(&session_id).await {
            warn!(%session_id, error = %err, "session end call failed");
        }
        session.state.write().await.end();
    }

    /// One full turn. Collaborator failures after the optimistic append are
    /// logged and absorbed; the turn always completes with whatever partial
    /// state was reached.
    pub async fn submit_user_input(&self, session: &SessionHandle, input: &str) -> TurnOutcome {
        let text = input.trim().to_string();
        if text.is_empty() {
            return TurnOutcome::Ignored;
        }
        let Ok(_gate) = session.turn_gate.try_lock() else {
            return TurnOutcome::Busy;
        };

        // Optimistic append; the pending question is consumed by this
        // submission no matter how the rest of the turn goes.
        let (session_id, generation, pending, asked_ids, summaries) = {
            let mut st = session.state.write().await;
            if st.ended {
                return TurnOutcome::Ended;
            }
            st.messages.push(Message::user(text.clone()));
            (
                st.session_id.clone(),
                st.generation,
                st.take_pending_question(),
                st.asked_ids(),
                st.summaries.clone(),
            )
        };

        let saved = self.chat.save_message(&session_id, Sender::User, &text).await;
        if let Err(err) = &saved {
            warn!(%session_id, error = %err, "user message save failed");
        }
        self.settle_pending_message(session, generation, saved.is_ok()).await;

        if let Some(q) = &pending {
            if let Err(err) = self.phq9.save_answer(&session_id, q.id, &q.text, &text).await {
                warn!(%session_id, question_id = q.id, error = %err, "answer save failed");
            }
        }

        // The log is rebuilt from the server's copy; when that copy cannot
        // be fetched the local log stands in as the base instead of wiping
        // the conversation.
        let (history, history_fetched) = match self.chat.fetch_history(&session_id).await {
            Ok(h) => (h, true),
            Err(err) => {
                warn!(%session_id, error = %err, "history fetch failed");
                (Vec::new(), false)
            }
        };
        let transcript = build_transcript(&history);

        let reply = match self.model.next_turn(&transcript, &text, &summaries, &asked_ids).await {
            Ok(r) => r,
            Err(err) => {
                warn!(%session_id, error = %err, "conversational model failed");
                TurnReply::fallback()
            }
        };

        if let Err(err) = self.chat.save_message(&session_id, Sender::Bot, &reply.response).await {
            warn!(%session_id, error = %err, "bot message save failed");
        }

        let mut st = session.state.write().await;
        if st.generation != generation || st.session_id != session_id {
            return TurnOutcome::Stale;
        }
        let mut log: Vec<Message> = if history_fetched {
            history.iter().map(message_from_history).collect()
        } else {
            st.messages.clone()
        };
        log.push(Message::bot(reply.response.clone()));
        st.messages = log;
        if let Some((id, question)) = reply.question() {
            st.mark_question_asked(id, question);
        }
        TurnOutcome::Completed
    }

    async fn fetch_summaries_lenient(&self) -> Vec<String> {
        match self.chat.fetch_summaries().await {
            Ok(s) => s,
            Err(err) => {
                warn!(error = %err, "summary fetch failed");
                Vec::new()
            }
        }
    }

    async fn settle_pending_message(&self, session: &SessionHandle, generation: u64, confirmed: bool) {
        let mut st = session.state.write().await;
        if st.generation != generation {
            return;
        }
        if let Some(msg) = st
            .messages
            .iter_mut()
            .rev()
            .find(|m| m.delivery == Delivery::Pending)
        {
            msg.delivery = if confirmed { Delivery::Confirmed } else { Delivery::Failed };
        }
    }
}

/// Linear `"sender: text"` transcript used as conversational context.
pub fn build_transcript(history: &[HistoryEntry]) -> String {
    history
        .iter()
        .map(|e| format!("{}: {}", e.sender, e.message))
        .collect::<Vec<_>>()
        .join("\n")
}

fn message_from_history(entry: &HistoryEntry) -> Message {
    let sender = if entry.sender == "user" { Sender::User } else { Sender::Bot };
    Message {
        sender,
        text: entry.message.clone(),
        created_at: chrono::Utc::now(),
        delivery: Delivery::Confirmed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::clients::model::ClassifierResult;
    use crate::clients::phq9::AnswerRecord;
    use crate::session::DEFAULT_GREETING;

    #[derive(Default)]
    struct FakeChat {
        history: StdMutex<Vec<HistoryEntry>>,
        saved: StdMutex<Vec<(String, String, String)>>,
        sessions_created: AtomicUsize,
        fail_saves: bool,
        fail_history: bool,
    }

    #[async_trait]
    impl ChatBackend for FakeChat {
        async fn create_session(&self) -> anyhow::Result<String> {
            let n = self.sessions_created.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("s-{n}"))
        }

        async fn end_session(&self, _session_id: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn save_message(&self, session_id: &str, sender: Sender, text: &str) -> anyhow::Result<()> {
            if self.fail_saves {
                anyhow::bail!("save down");
            }
            self.saved
                .lock()
                .unwrap()
                .push((session_id.into(), sender.as_str().into(), text.into()));
            self.history.lock().unwrap().push(HistoryEntry {
                sender: sender.as_str().into(),
                message: text.into(),
            });
            Ok(())
        }

        async fn fetch_history(&self, _session_id: &str) -> anyhow::Result<Vec<HistoryEntry>> {
            if self.fail_history {
                anyhow::bail!("history down");
            }
            Ok(self.history.lock().unwrap().clone())
        }

        async fn fetch_summaries(&self) -> anyhow::Result<Vec<String>> {
            Ok(vec!["earlier session".into()])
        }
    }

    #[derive(Default)]
    struct FakePhq9 {
        saved: StdMutex<Vec<(String, i64, String, String)>>,
    }

    #[async_trait]
    impl QuestionnaireBackend for FakePhq9 {
        async fn save_answer(
            &self,
            session_id: &str,
            question_id: i64,
            question: &str,
            answer: &str,
        ) -> anyhow::Result<()> {
            self.saved.lock().unwrap().push((
                session_id.into(),
                question_id,
                question.into(),
                answer.into(),
            ));
            Ok(())
        }

        async fn fetch_answers(&self, _session_id: &str) -> anyhow::Result<Vec<AnswerRecord>> {
            Ok(Vec::new())
        }
    }

    struct FakeModel {
        reply: StdMutex<TurnReply>,
        calls: StdMutex<Vec<(String, String, Vec<i64>)>>,
        fail: bool,
    }

    impl FakeModel {
        fn replying(text: &str) -> Self {
            Self {
                reply: StdMutex::new(TurnReply {
                    response: text.into(),
                    question_id: None,
                    question_text: None,
                }),
                calls: StdMutex::new(Vec::new()),
                fail: false,
            }
        }

        fn with_question(text: &str, id: i64, question: &str) -> Self {
            let f = Self::replying(text);
            {
                let mut r = f.reply.lock().unwrap();
                r.question_id = Some(id);
                r.question_text = Some(question.into());
            }
            f
        }
    }

    #[async_trait]
    impl ConversationModel for FakeModel {
        async fn next_turn(
            &self,
            transcript: &str,
            latest_input: &str,
            _summaries: &[String],
            asked_question_ids: &[i64],
        ) -> anyhow::Result<TurnReply> {
            if self.fail {
                anyhow::bail!("model down");
            }
            self.calls.lock().unwrap().push((
                transcript.into(),
                latest_input.into(),
                asked_question_ids.to_vec(),
            ));
            Ok(self.reply.lock().unwrap().clone())
        }

        async fn score(&self, _numbered_answers: &[String]) -> anyhow::Result<ClassifierResult> {
            anyhow::bail!("not used here")
        }
    }

    fn controller(
        chat: Arc<FakeChat>,
        phq9: Arc<FakePhq9>,
        model: Arc<FakeModel>,
    ) -> TurnController {
        TurnController::new(chat, phq9, model)
    }

    #[tokio::test]
    async fn blank_input_is_a_complete_noop() {
        let chat = Arc::new(FakeChat::default());
        let ctrl = controller(chat.clone(), Arc::new(FakePhq9::default()), Arc::new(FakeModel::replying("x")));
        let session = ctrl.start_session().await.unwrap();

        let outcome = ctrl.submit_user_input(&session, "   \n\t ").await;
        assert_eq!(outcome, TurnOutcome::Ignored);
        assert!(chat.saved.lock().unwrap().is_empty());
        assert_eq!(session.snapshot().await.messages.len(), 1);
    }

    #[tokio::test]
    async fn successful_turn_appends_user_and_bot_messages() {
        let chat = Arc::new(FakeChat::default());
        let model = Arc::new(FakeModel::replying("Tell me more"));
        let ctrl = controller(chat.clone(), Arc::new(FakePhq9::default()), model.clone());
        let session = ctrl.start_session().await.unwrap();
        assert_eq!(session.snapshot().await.summaries, vec!["earlier session"]);

        let outcome = ctrl.submit_user_input(&session, "I feel anxious").await;
        assert_eq!(outcome, TurnOutcome::Completed);

        let st = session.snapshot().await;
        // Log rebuilt from backend history (user msg) plus the new reply.
        assert_eq!(st.messages.len(), 2);
        assert_eq!(st.messages[0].sender, Sender::User);
        assert_eq!(st.messages[0].text, "I feel anxious");
        assert_eq!(st.messages[1].sender, Sender::Bot);
        assert_eq!(st.messages[1].text, "Tell me more");
        assert!(st.pending_question.is_none());

        // user save + bot save, asked ids empty on first call
        let saved = chat.saved.lock().unwrap();
        assert_eq!(saved.len(), 2);
        assert_eq!(saved[0].1, "user");
        assert_eq!(saved[1].1, "bot");
        let calls = model.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, "I feel anxious");
        assert!(calls[0].2.is_empty());
    }

    #[tokio::test]
    async fn reply_with_question_sets_pending_and_asked_ids() {
        let chat = Arc::new(FakeChat::default());
        let model = Arc::new(FakeModel::with_question("Thanks for sharing.", 3, "Over the last 2 weeks..."));
        let ctrl = controller(chat, Arc::new(FakePhq9::default()), model);
        let session = ctrl.start_session().await.unwrap();

        ctrl.submit_user_input(&session, "I have trouble sleeping").await;

        let st = session.snapshot().await;
        let pq = st.pending_question.unwrap();
        assert_eq!(pq.id, 3);
        assert_eq!(pq.text, "Over the last 2 weeks...");
        assert!(st.asked_question_ids.contains(&3));
    }

    #[tokio::test]
    async fn pending_question_is_answered_before_model_call_and_cleared() {
        let chat = Arc::new(FakeChat::default());
        let phq9 = Arc::new(FakePhq9::default());
        let model = Arc::new(FakeModel::replying("Understood."));
        let ctrl = controller(chat.clone(), phq9.clone(), model.clone());
        let session = ctrl.start_session().await.unwrap();
        session.state.write().await.mark_question_asked(3, "Over the last 2 weeks...");

        ctrl.submit_user_input(&session, "several days").await;

        let answers = phq9.saved.lock().unwrap();
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].1, 3);
        assert_eq!(answers[0].2, "Over the last 2 weeks...");
        assert_eq!(answers[0].3, "several days");
        drop(answers);

        let st = session.snapshot().await;
        assert!(st.pending_question.is_none());
        // asked ids keep the answered question; the model was told about it
        let calls = model.calls.lock().unwrap();
        assert_eq!(calls[0].2, vec![3]);
    }

    #[tokio::test]
    async fn model_failure_falls_back_and_still_completes() {
        let chat = Arc::new(FakeChat::default());
        let mut model = FakeModel::replying("unused");
        model.fail = true;
        let ctrl = controller(chat, Arc::new(FakePhq9::default()), Arc::new(model));
        let session = ctrl.start_session().await.unwrap();

        let outcome = ctrl.submit_user_input(&session, "hello").await;
        assert_eq!(outcome, TurnOutcome::Completed);

        let st = session.snapshot().await;
        let last = st.messages.last().unwrap();
        assert_eq!(last.sender, Sender::Bot);
        assert_eq!(last.text, "Sorry, something went wrong.");
    }

    #[tokio::test]
    async fn failed_user_save_marks_message_failed_but_turn_continues() {
        let chat = Arc::new(FakeChat { fail_saves: true, fail_history: true, ..Default::default() });
        let model = Arc::new(FakeModel::replying("Still here."));
        let ctrl = controller(chat, Arc::new(FakePhq9::default()), model);
        let session = ctrl.start_session().await.unwrap();

        let outcome = ctrl.submit_user_input(&session, "hello").await;
        assert_eq!(outcome, TurnOutcome::Completed);

        // History fetch failed too, so the local log is the base: greeting,
        // failed user message, bot reply.
        let st = session.snapshot().await;
        assert_eq!(st.messages.len(), 3);
        assert_eq!(st.messages[0].text, DEFAULT_GREETING);
        assert_eq!(st.messages[1].delivery, Delivery::Failed);
        assert_eq!(st.messages[2].text, "Still here.");
    }

    /// Chat backend that resets the session out from under an in-flight
    /// turn, at the history-fetch step.
    struct ResettingChat {
        inner: FakeChat,
        target: std::sync::OnceLock<Arc<SessionHandle>>,
    }

    #[async_trait]
    impl ChatBackend for ResettingChat {
        async fn create_session(&self) -> anyhow::Result<String> {
            self.inner.create_session().await
        }

        async fn end_session(&self, session_id: &str) -> anyhow::Result<()> {
            self.inner.end_session(session_id).await
        }

        async fn save_message(&self, session_id: &str, sender: Sender, text: &str) -> anyhow::Result<()> {
            self.inner.save_message(session_id, sender, text).await
        }

        async fn fetch_history(&self, session_id: &str) -> anyhow::Result<Vec<HistoryEntry>> {
            if let Some(handle) = self.target.get() {
                handle.state.write().await.reset("s-other");
            }
            self.inner.fetch_history(session_id).await
        }

        async fn fetch_summaries(&self) -> anyhow::Result<Vec<String>> {
            self.inner.fetch_summaries().await
        }
    }

    #[tokio::test]
    async fn reset_during_flight_discards_turn_results() {
        let chat = Arc::new(ResettingChat {
            inner: FakeChat::default(),
            target: std::sync::OnceLock::new(),
        });
        let ctrl = TurnController::new(
            chat.clone(),
            Arc::new(FakePhq9::default()),
            Arc::new(FakeModel::replying("late")),
        );
        let session = Arc::new(ctrl.start_session().await.unwrap());
        chat.target.set(session.clone()).ok();

        // The reset lands mid-turn; the turn sees the moved generation at
        // commit and bails without touching the fresh state.
        let outcome = ctrl.submit_user_input(&session, "hello").await;
        assert_eq!(outcome, TurnOutcome::Stale);

        let st = session.snapshot().await;
        assert_eq!(st.session_id, "s-other");
        assert!(st.messages.iter().all(|m| m.text != "late"));
        assert_eq!(st.messages.len(), 1);
    }

    /// Chat backend that parks the user-message save until released, so a
    /// turn can be held in flight deterministically.
    struct BlockingChat {
        inner: FakeChat,
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl ChatBackend for BlockingChat {
        async fn create_session(&self) -> anyhow::Result<String> {
            self.inner.create_session().await
        }

        async fn end_session(&self, session_id: &str) -> anyhow::Result<()> {
            self.inner.end_session(session_id).await
        }

        async fn save_message(&self, session_id: &str, sender: Sender, text: &str) -> anyhow::Result<()> {
            if sender == Sender::User {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.inner.save_message(session_id, sender, text).await
        }

        async fn fetch_history(&self, session_id: &str) -> anyhow::Result<Vec<HistoryEntry>> {
            self.inner.fetch_history(session_id).await
        }

        async fn fetch_summaries(&self) -> anyhow::Result<Vec<String>> {
            self.inner.fetch_summaries().await
        }
    }

    #[tokio::test]
    async fn second_submit_while_turn_in_flight_is_rejected_busy() {
        let chat = Arc::new(BlockingChat {
            inner: FakeChat::default(),
            entered: tokio::sync::Notify::new(),
            release: tokio::sync::Notify::new(),
        });
        let ctrl = Arc::new(TurnController::new(
            chat.clone(),
            Arc::new(FakePhq9::default()),
            Arc::new(FakeModel::replying("ok")),
        ));
        let session = Arc::new(ctrl.start_session().await.unwrap());

        let first = {
            let ctrl = ctrl.clone();
            let session = session.clone();
            tokio::spawn(async move { ctrl.submit_user_input(&session, "first").await })
        };
        chat.entered.notified().await;

        // First turn is parked inside its save; the gate is still held.
        let outcome = ctrl.submit_user_input(&session, "second").await;
        assert_eq!(outcome, TurnOutcome::Busy);

        // The rejected submit appended nothing: greeting + first user message.
        let st = session.snapshot().await;
        assert_eq!(st.messages.len(), 2);
        assert_eq!(st.messages[1].text, "first");

        chat.release.notify_one();
        assert_eq!(first.await.unwrap(), TurnOutcome::Completed);
        assert!(session.snapshot().await.messages.iter().all(|m| m.text != "second"));
    }

    #[tokio::test]
    async fn new_chat_issues_distinct_session_and_resets() {
        let chat = Arc::new(FakeChat::default());
        let ctrl = controller(chat, Arc::new(FakePhq9::default()), Arc::new(FakeModel::replying("x")));
        let session = ctrl.start_session().await.unwrap();
        let first_id = session.snapshot().await.session_id.clone();

        ctrl.submit_user_input(&session, "hello").await;
        session.state.write().await.mark_question_asked(5, "q5");

        let new_id = ctrl.new_chat(&session).await.unwrap();
        assert_ne!(new_id, first_id);

        let st = session.snapshot().await;
        assert_eq!(st.session_id, new_id);
        assert_eq!(st.messages.len(), 1);
        assert_eq!(st.messages[0].text, DEFAULT_GREETING);
        assert!(st.pending_question.is_none());
        assert!(st.asked_question_ids.is_empty());
    }

    #[tokio::test]
    async fn ended_session_rejects_input() {
        let chat = Arc::new(FakeChat::default());
        let ctrl = controller(chat, Arc::new(FakePhq9::default()), Arc::new(FakeModel::replying("x")));
        let session = ctrl.start_session().await.unwrap();

        ctrl.end_session(&session).await;
        let outcome = ctrl.submit_user_input(&session, "hello").await;
        assert_eq!(outcome, TurnOutcome::Ended);
    }

    #[test]
    fn transcript_joins_sender_and_text() {
        let history = vec![
            HistoryEntry { sender: "user".into(), message: "hi".into() },
            HistoryEntry { sender: "bot".into(), message: "hello".into() },
        ];
        assert_eq!(build_transcript(&history), "user: hi\nbot: hello");
    }
}
