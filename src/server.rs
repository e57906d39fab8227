use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::{Json, Router, routing::{get, post}};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::classifier::{ClassifierInvoker, ClassifyOutcome};
use crate::clients::model::ClassifierResult;
use crate::session::SessionState;
use crate::turn::{SessionHandle, TurnController, TurnOutcome};

#[derive(Clone)]
pub struct AppState {
    pub turns: Arc<TurnController>,
    pub classifier: Arc<ClassifierInvoker>,
    pub sessions: Arc<RwLock<HashMap<String, Arc<SessionHandle>>>>,
}

impl AppState {
    pub fn new(turns: Arc<TurnController>, classifier: Arc<ClassifierInvoker>) -> Self {
        Self { turns, classifier, sessions: Arc::new(RwLock::new(HashMap::new())) }
    }

    async fn handle(&self, id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.read().await.get(id).cloned()
    }
}

#[derive(Debug, Serialize)]
struct SessionCreatedResponse {
    id: String,
}

#[derive(Debug, Serialize)]
struct MessageView {
    sender: &'static str,
    text: String,
    time: String,
    delivery: &'static str,
}

#[derive(Debug, Serialize)]
struct ConversationView {
    session_id: String,
    messages: Vec<MessageView>,
    pending_question: bool,
    ended: bool,
}

fn render(state: &SessionState) -> ConversationView {
    ConversationView {
        session_id: state.session_id.clone(),
        messages: state
            .messages
            .iter()
            .map(|m| MessageView {
                sender: m.sender.as_str(),
                text: m.text.clone(),
                time: m.display_time(),
                delivery: match m.delivery {
                    crate::session::Delivery::Pending => "pending",
                    crate::session::Delivery::Confirmed => "confirmed",
                    crate::session::Delivery::Failed => "failed",
                },
            })
            .collect(),
        pending_question: state.pending_question.is_some(),
        ended: state.ended,
    }
}

async fn create_session(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Result<Json<SessionCreatedResponse>, StatusCode> {
    let handle = state
        .turns
        .start_session()
        .await
        .map_err(|_| StatusCode::BAD_GATEWAY)?;
    let id = handle.state.read().await.session_id.clone();
    state.sessions.write().await.insert(id.clone(), Arc::new(handle));
    Ok(Json(SessionCreatedResponse { id }))
}

async fn get_messages(
    axum::extract::State(state): axum::extract::State<AppState>,
    axum::extract::Path(id): axum::extract::Path<String>,
) -> Result<Json<ConversationView>, StatusCode> {
    let handle = state.handle(&id).await.ok_or(StatusCode::NOT_FOUND)?;
    let snapshot = handle.snapshot().await;
    Ok(Json(render(&snapshot)))
}

#[derive(Debug, Deserialize)]
struct SubmitBody {
    text: String,
}

async fn submit_message(
    axum::extract::State(state): axum::extract::State<AppState>,
    axum::extract::Path(id): axum::extract::Path<String>,
    Json(body): Json<SubmitBody>,
) -> Result<Json<ConversationView>, StatusCode> {
    let handle = state.handle(&id).await.ok_or(StatusCode::NOT_FOUND)?;
    match state.turns.submit_user_input(&handle, &body.text).await {
        TurnOutcome::Completed | TurnOutcome::Ignored => {
            let snapshot = handle.snapshot().await;
            Ok(Json(render(&snapshot)))
        }
        TurnOutcome::Busy | TurnOutcome::Stale => Err(StatusCode::CONFLICT),
        TurnOutcome::Ended => Err(StatusCode::GONE),
    }
}

async fn reset_session(
    axum::extract::State(state): axum::extract::State<AppState>,
    axum::extract::Path(id): axum::extract::Path<String>,
) -> Result<Json<SessionCreatedResponse>, StatusCode> {
    let handle = state.handle(&id).await.ok_or(StatusCode::NOT_FOUND)?;
    let new_id = state
        .turns
        .new_chat(&handle)
        .await
        .map_err(|_| StatusCode::BAD_GATEWAY)?;
    let mut sessions = state.sessions.write().await;
    sessions.remove(&id);
    sessions.insert(new_id.clone(), handle);
    Ok(Json(SessionCreatedResponse { id: new_id }))
}

async fn end_session(
    axum::extract::State(state): axum::extract::State<AppState>,
    axum::extract::Path(id): axum::extract::Path<String>,
) -> Result<StatusCode, StatusCode> {
    let handle = state.handle(&id).await.ok_or(StatusCode::NOT_FOUND)?;
    state.turns.end_session(&handle).await;
    Ok(StatusCode::OK)
}

#[derive(Debug, Serialize)]
struct ClassifyResponse {
    status: &'static str,
    result: Option<ClassifierResult>,
}

async fn classify_session(
    axum::extract::State(state): axum::extract::State<AppState>,
    axum::extract::Path(id): axum::extract::Path<String>,
) -> Result<Json<ClassifyResponse>, StatusCode> {
    let handle = state.handle(&id).await.ok_or(StatusCode::NOT_FOUND)?;
    let session_id = handle.state.read().await.session_id.clone();
    match state.classifier.run_classification(&session_id).await {
        ClassifyOutcome::Completed(result) => {
            Ok(Json(ClassifyResponse { status: "completed", result: Some(result) }))
        }
        ClassifyOutcome::Skipped => Ok(Json(ClassifyResponse { status: "skipped", result: None })),
        ClassifyOutcome::Busy => Err(StatusCode::CONFLICT),
        ClassifyOutcome::Failed => Err(StatusCode::BAD_GATEWAY),
    }
}

async fn depression_index(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    state
        .classifier
        .depression_index()
        .await
        .map(Json)
        .map_err(|_| StatusCode::BAD_GATEWAY)
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/sessions", post(create_session))
        .route("/v1/sessions/:id/messages", get(get_messages).post(submit_message))
        .route("/v1/sessions/:id/reset", post(reset_session))
        .route("/v1/sessions/:id/end", post(end_session))
        .route("/v1/sessions/:id/classify", post(classify_session))
        .route("/v1/depression-index", get(depression_index))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}
