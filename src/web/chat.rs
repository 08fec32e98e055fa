//! The chat streaming endpoint.
//!
//! `POST /v1/chat/stream` proxies one user turn to the completions API and
//! streams the assistant's tokens back as newline-delimited JSON. The request
//! handler validates and persists up front, registers the stream so it can be
//! cancelled from outside, then hands off to a spawned generation task that
//! owns the upstream read loop and the exactly-once finalization step
//! (assistant-message persistence, conversation touch, best-effort title
//! generation, terminal `done` event).
//!
//! Cancellation is cooperative. One token per request is triggered by any of:
//! the client going away (the event channel closes), the explicit cancel
//! endpoint, or the stale-entry sweep. The generation loop checks the token
//! before every chunk it takes from upstream.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::middleware::from_fn_with_state;
use axum::response::Response;
use axum::routing::post;
use axum::{Extension, Json, Router};
use bytes::Bytes;
use futures::StreamExt;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};
use uuid::Uuid;

use crate::completions::{CompletionChunk, CompletionError};
use crate::context_builder::{
    self, build_chat_messages, build_system_prompt, is_first_assistant_turn,
};
use crate::models::conversations::{Conversation, MessageRole, NewMessage};
use crate::registry::StreamRegistration;
use crate::web::auth::{require_session, AuthenticatedUser};
use crate::{ApiError, AppState};

const EVENT_CHANNEL_BUFFER: usize = 64;
const TITLE_MAX_INPUT_CHARS: usize = 500;
const TITLE_MAX_CHARS: usize = 80;

/// What the client sees when the upstream call fails. The real cause stays in
/// the server log.
const UPSTREAM_ERROR_MESSAGE: &str = "The assistant is unavailable right now. Please try again.";

// ============================================================================
// Wire protocol
// ============================================================================

/// One line of the NDJSON response body.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Delta { content: String },
    Error { message: String },
    Done { cancelled: bool },
}

impl StreamEvent {
    fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_default();
        line.push('\n');
        line
    }
}

// ============================================================================
// Router
// ============================================================================

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/stream", post(chat_stream))
        .route("/v1/chat/streams/:request_id/cancel", post(cancel_stream))
        .layer(from_fn_with_state(state.clone(), require_session))
        .with_state(state)
}

// ============================================================================
// Handlers
// ============================================================================

async fn chat_stream(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let prepared = prepare_stream(&state, user, &body)?;

    let (tx, rx) = mpsc::channel::<StreamEvent>(EVENT_CHANNEL_BUFFER);
    tokio::spawn(run_generation(
        state.clone(),
        prepared.turn,
        prepared.cancel,
        tx,
    ));

    Ok(ndjson_response(rx))
}

#[derive(Debug, Serialize)]
struct CancelStreamResponse {
    cancelled: bool,
}

/// Explicit stop. Triggers the stream's token; the stream itself finalizes
/// and unregisters on its own. Unknown or foreign request ids report
/// `cancelled: false` rather than an error.
async fn cancel_stream(
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<String>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Json<CancelStreamResponse> {
    let cancelled = state.registry.cancel(&request_id, user.id);
    Json(CancelStreamResponse { cancelled })
}

// ============================================================================
// Phase 1: validate, persist, register
// ============================================================================

#[derive(Debug)]
struct ValidatedRequest {
    conversation_id: Uuid,
    user_message: String,
    request_id: String,
}

fn validate_request(body: &Value) -> Result<ValidatedRequest, ApiError> {
    let conversation_id = required_field(body, "conversationId")?;
    let user_message = required_field(body, "userMessage")?;
    let request_id = required_field(body, "requestId")?;

    let conversation_id = Uuid::parse_str(&conversation_id).map_err(|_| {
        debug!("rejecting chat stream request with malformed conversationId");
        ApiError::BadRequest
    })?;

    Ok(ValidatedRequest {
        conversation_id,
        user_message,
        request_id,
    })
}

fn required_field(body: &Value, field: &'static str) -> Result<String, ApiError> {
    let value = body
        .get(field)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .unwrap_or("");
    if value.is_empty() {
        debug!("rejecting chat stream request with missing or empty {field}");
        return Err(ApiError::BadRequest);
    }
    Ok(value.to_string())
}

/// Everything the generation task needs, assembled before the stream opens.
struct GenerationTurn {
    conversation: Conversation,
    request_id: String,
    first_turn: bool,
    messages: Vec<Value>,
    user_message: String,
}

struct PreparedStream {
    turn: GenerationTurn,
    cancel: CancellationToken,
}

/// Validation failures and ownership misses short-circuit to an HTTP status
/// here; nothing is registered until this function has succeeded, so failed
/// requests leave no registry entry behind.
fn prepare_stream(
    state: &Arc<AppState>,
    user: AuthenticatedUser,
    body: &Value,
) -> Result<PreparedStream, ApiError> {
    let request = validate_request(body)?;

    let conversation = state
        .db
        .get_conversation_by_uuid_and_user(request.conversation_id, user.id)?;

    // Lazy sweep: reclaim abandoned streams before registering a new one.
    let evicted = state
        .registry
        .cleanup_stale(Instant::now(), state.stream_ttl);
    if evicted > 0 {
        debug!("evicted {evicted} stale stream registrations");
    }

    // The user's message is durable before any upstream work begins.
    let user_message = state.db.create_message(NewMessage::new(
        conversation.id,
        MessageRole::User,
        request.user_message.clone(),
    ))?;

    let system_prompt = build_system_prompt(state.db.as_ref(), user.id, &conversation)?;
    let recent = state.db.get_recent_messages(
        conversation.id,
        (context_builder::HISTORY_WINDOW + 1) as i64,
    )?;
    let first_turn = is_first_assistant_turn(&recent);
    let messages = build_chat_messages(
        &system_prompt,
        &recent,
        user_message.uuid,
        &request.user_message,
    );

    let cancel = CancellationToken::new();
    state.registry.register(StreamRegistration {
        request_id: request.request_id.clone(),
        user_id: user.id,
        conversation_id: conversation.uuid,
        cancel: cancel.clone(),
        started_at: Instant::now(),
    });

    trace!(
        "stream {} prepared for conversation {} ({} prompt messages, first_turn={})",
        request.request_id,
        conversation.uuid,
        messages.len(),
        first_turn
    );

    Ok(PreparedStream {
        turn: GenerationTurn {
            conversation,
            request_id: request.request_id,
            first_turn,
            messages,
            user_message: request.user_message,
        },
        cancel,
    })
}

// ============================================================================
// Phase 2: generation loop
// ============================================================================

async fn run_generation(
    state: Arc<AppState>,
    turn: GenerationTurn,
    cancel: CancellationToken,
    tx: mpsc::Sender<StreamEvent>,
) {
    let mut accumulated = String::new();
    let mut cancelled = false;
    let mut upstream_error = false;

    match state
        .completions
        .stream_chat(&state.chat_model, turn.messages.clone(), cancel.clone())
        .await
    {
        Ok(mut chunks) => loop {
            tokio::select! {
                // The token is checked before each chunk is taken, so a
                // cancelled stream stops asking upstream for more.
                biased;

                _ = cancel.cancelled() => {
                    debug!("stream {} cancelled mid-generation", turn.request_id);
                    cancelled = true;
                    break;
                }

                chunk = chunks.recv() => match chunk {
                    Some(CompletionChunk::Delta(text)) => {
                        accumulated.push_str(&text);
                        if tx.send(StreamEvent::Delta { content: text }).await.is_err() {
                            // Client went away; keep what we have, stop
                            // requesting more.
                            debug!("client disconnected from stream {}", turn.request_id);
                            cancel.cancel();
                            cancelled = true;
                            break;
                        }
                    }
                    Some(CompletionChunk::Done) | None => break,
                    Some(CompletionChunk::Error(message)) => {
                        if cancel.is_cancelled() || message_indicates_abort(&message) {
                            cancelled = true;
                        } else {
                            error!(
                                "upstream stream error for stream {}: {}",
                                turn.request_id, message
                            );
                            upstream_error = true;
                        }
                        break;
                    }
                }
            }
        },
        Err(err) => {
            if ended_by_cancellation(&err, &cancel) {
                cancelled = true;
            } else {
                error!(
                    "upstream completion call failed for stream {}: {}",
                    turn.request_id, err
                );
                upstream_error = true;
            }
        }
    }

    if upstream_error {
        let _ = tx
            .send(StreamEvent::Error {
                message: UPSTREAM_ERROR_MESSAGE.to_string(),
            })
            .await;
    }

    finalize(&state, &turn, &cancel, accumulated, cancelled, &tx).await;
}

/// Cancellation is not a failure: the token already fired, the client's own
/// `Cancelled` variant, or an upstream message naming an abort all mean the
/// stream was stopped on purpose.
fn ended_by_cancellation(err: &CompletionError, cancel: &CancellationToken) -> bool {
    if cancel.is_cancelled() || matches!(err, CompletionError::Cancelled) {
        return true;
    }
    message_indicates_abort(&err.to_string())
}

fn message_indicates_abort(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("abort") || message.contains("cancel")
}

// ============================================================================
// Phase 3: finalization
// ============================================================================

/// Runs exactly once per stream, on every termination path. Best-effort
/// throughout: persistence failures are logged and the terminal event is
/// still emitted.
async fn finalize(
    state: &Arc<AppState>,
    turn: &GenerationTurn,
    cancel: &CancellationToken,
    accumulated: String,
    cancelled: bool,
    tx: &mpsc::Sender<StreamEvent>,
) {
    state.registry.unregister(&turn.request_id);

    // A purely-cancelled stream with zero tokens leaves no assistant message.
    if !accumulated.trim().is_empty() {
        if let Err(err) = state.db.create_message(NewMessage::new(
            turn.conversation.id,
            MessageRole::Assistant,
            accumulated,
        )) {
            error!(
                "failed to persist assistant message for conversation {}: {}",
                turn.conversation.uuid, err
            );
        }
    }

    if let Err(err) = state.db.touch_conversation(turn.conversation.id) {
        error!(
            "failed to update conversation {} after stream: {}",
            turn.conversation.uuid, err
        );
    }

    if turn.first_turn && turn.conversation.has_placeholder_title() {
        generate_title(state, turn, cancel).await;
    }

    let _ = tx.send(StreamEvent::Done { cancelled }).await;
}

/// One best-effort attempt to replace the placeholder title, driven by the
/// same token as the stream itself. Every failure mode is swallowed.
async fn generate_title(state: &Arc<AppState>, turn: &GenerationTurn, cancel: &CancellationToken) {
    let excerpt: String = turn.user_message.chars().take(TITLE_MAX_INPUT_CHARS).collect();

    match state
        .completions
        .complete(&state.title_model, title_prompt(&excerpt), cancel.clone())
        .await
    {
        Ok(raw) => {
            let title = clean_title(&raw);
            if title.is_empty() {
                debug!(
                    "title generation returned nothing usable for conversation {}",
                    turn.conversation.uuid
                );
                return;
            }
            trace!(
                "generated title for conversation {}: {}",
                turn.conversation.uuid,
                title
            );
            if let Err(err) = state
                .db
                .update_conversation_title(turn.conversation.id, &title)
            {
                debug!(
                    "failed to store generated title for conversation {}: {}",
                    turn.conversation.uuid, err
                );
            }
        }
        Err(err) => {
            debug!(
                "title generation failed for conversation {}: {}",
                turn.conversation.uuid, err
            );
        }
    }
}

fn title_prompt(user_message: &str) -> Vec<Value> {
    vec![
        json!({
            "role": "system",
            "content": "You generate concise, meaningful titles (3-5 words) for chat \
                        conversations based on the user's first message. Return only the \
                        title, without quotes or explanations."
        }),
        json!({
            "role": "user",
            "content": format!(
                "Generate a concise title (3-5 words) for a conversation that starts \
                 with this message: \"{}\"",
                user_message
            )
        }),
    ]
}

/// Models like to decorate titles; keep the first line, drop wrapping quotes,
/// cap the length.
fn clean_title(raw: &str) -> String {
    let first_line = raw.lines().next().unwrap_or("");
    let trimmed = first_line
        .trim()
        .trim_matches(|c| c == '"' || c == '\'')
        .trim();
    trimmed.chars().take(TITLE_MAX_CHARS).collect()
}

// ============================================================================
// Response body
// ============================================================================

fn ndjson_response(rx: mpsc::Receiver<StreamEvent>) -> Response {
    let body_stream = ReceiverStream::new(rx)
        .map(|event| Ok::<_, Infallible>(Bytes::from(event.to_line())));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson; charset=utf-8")
        .header(header::CACHE_CONTROL, "no-cache, no-transform")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(body_stream))
        .expect("response builder with valid status and headers")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completions::CompletionClient;
    use crate::db::{DBConnection, DBError};
    use crate::models::conversations::{
        ConversationMode, ConversationsError, Message, MessageRole,
    };
    use crate::registry::StreamRegistry;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;
    use std::time::Duration;

    // ------------------------------------------------------------------
    // In-memory repository
    // ------------------------------------------------------------------

    #[derive(Default)]
    struct MemoryDb {
        conversations: Mutex<Vec<Conversation>>,
        messages: Mutex<Vec<Message>>,
        next_message_id: Mutex<i64>,
        user_summary: Option<String>,
        fail_message_writes: bool,
    }

    impl MemoryDb {
        fn with_conversation(conversation: Conversation) -> Arc<Self> {
            let db = MemoryDb::default();
            db.conversations.lock().unwrap().push(conversation);
            Arc::new(db)
        }

        fn messages_for(&self, conversation_id: i64, role: MessageRole) -> Vec<Message> {
            self.messages
                .lock()
                .unwrap()
                .iter()
                .filter(|m| m.conversation_id == conversation_id && m.role == role)
                .cloned()
                .collect()
        }

        fn title_of(&self, conversation_id: i64) -> String {
            self.conversations
                .lock()
                .unwrap()
                .iter()
                .find(|c| c.id == conversation_id)
                .map(|c| c.title.clone())
                .expect("conversation exists")
        }
    }

    impl DBConnection for MemoryDb {
        fn get_conversation_by_uuid_and_user(
            &self,
            uuid: Uuid,
            user_id: Uuid,
        ) -> Result<Conversation, DBError> {
            self.conversations
                .lock()
                .unwrap()
                .iter()
                .find(|c| c.uuid == uuid && c.user_id == user_id)
                .cloned()
                .ok_or(DBError::Conversations(
                    ConversationsError::ConversationNotFound,
                ))
        }

        fn create_message(&self, new_message: NewMessage) -> Result<Message, DBError> {
            if self.fail_message_writes && new_message.role == MessageRole::Assistant {
                return Err(DBError::Query(diesel::result::Error::BrokenTransactionManager));
            }
            let mut next_id = self.next_message_id.lock().unwrap();
            *next_id += 1;
            let message = Message {
                id: *next_id,
                uuid: new_message.uuid,
                conversation_id: new_message.conversation_id,
                role: new_message.role,
                content: new_message.content,
                created_at: Utc::now(),
            };
            self.messages.lock().unwrap().push(message.clone());
            Ok(message)
        }

        fn get_recent_messages(
            &self,
            conversation_id: i64,
            limit: i64,
        ) -> Result<Vec<Message>, DBError> {
            let messages = self.messages.lock().unwrap();
            let mut rows: Vec<Message> = messages
                .iter()
                .filter(|m| m.conversation_id == conversation_id)
                .cloned()
                .collect();
            let start = rows.len().saturating_sub(limit as usize);
            rows.drain(..start);
            Ok(rows)
        }

        fn update_conversation_title(
            &self,
            conversation_id: i64,
            title: &str,
        ) -> Result<(), DBError> {
            let mut conversations = self.conversations.lock().unwrap();
            if let Some(conversation) =
                conversations.iter_mut().find(|c| c.id == conversation_id)
            {
                conversation.title = title.to_string();
                conversation.updated_at = Utc::now();
            }
            Ok(())
        }

        fn touch_conversation(&self, conversation_id: i64) -> Result<(), DBError> {
            let mut conversations = self.conversations.lock().unwrap();
            if let Some(conversation) =
                conversations.iter_mut().find(|c| c.id == conversation_id)
            {
                conversation.updated_at = Utc::now();
            }
            Ok(())
        }

        fn get_user_summary(&self, _user_id: Uuid) -> Result<Option<String>, DBError> {
            Ok(self.user_summary.clone())
        }

        fn get_project_summary(&self, _project_id: i64) -> Result<Option<String>, DBError> {
            Ok(None)
        }

        fn get_goal_summary(&self, _goal_id: i64) -> Result<Option<String>, DBError> {
            Ok(None)
        }

        fn get_contact_summary(&self, _contact_id: i64) -> Result<Option<String>, DBError> {
            Ok(None)
        }
    }

    // ------------------------------------------------------------------
    // Scripted completion client
    // ------------------------------------------------------------------

    enum ScriptStep {
        Chunk(CompletionChunk),
        /// Block until the stream's token fires, then stop producing.
        WaitForCancel,
    }

    #[derive(Default)]
    struct ScriptedClient {
        steps: Mutex<Option<Vec<ScriptStep>>>,
        stream_failure: Mutex<Option<CompletionError>>,
        title: Mutex<Option<Result<String, CompletionError>>>,
    }

    impl ScriptedClient {
        fn streaming(steps: Vec<ScriptStep>) -> Self {
            Self {
                steps: Mutex::new(Some(steps)),
                ..Default::default()
            }
        }

        fn failing(error: CompletionError) -> Self {
            Self {
                stream_failure: Mutex::new(Some(error)),
                ..Default::default()
            }
        }

        fn with_title(self, title: Result<String, CompletionError>) -> Self {
            *self.title.lock().unwrap() = Some(title);
            self
        }
    }

    #[async_trait]
    impl CompletionClient for ScriptedClient {
        async fn stream_chat(
            &self,
            _model: &str,
            _messages: Vec<Value>,
            cancel: CancellationToken,
        ) -> Result<mpsc::Receiver<CompletionChunk>, CompletionError> {
            if let Some(err) = self.stream_failure.lock().unwrap().take() {
                return Err(err);
            }
            let steps = self.steps.lock().unwrap().take().unwrap_or_default();
            let (tx, rx) = mpsc::channel(4);
            tokio::spawn(async move {
                for step in steps {
                    match step {
                        ScriptStep::Chunk(chunk) => {
                            if tx.send(chunk).await.is_err() {
                                return;
                            }
                        }
                        ScriptStep::WaitForCancel => {
                            cancel.cancelled().await;
                            return;
                        }
                    }
                }
            });
            Ok(rx)
        }

        async fn complete(
            &self,
            _model: &str,
            _messages: Vec<Value>,
            cancel: CancellationToken,
        ) -> Result<String, CompletionError> {
            if cancel.is_cancelled() {
                return Err(CompletionError::Cancelled);
            }
            self.title
                .lock()
                .unwrap()
                .take()
                .unwrap_or(Err(CompletionError::Protocol(
                    "no title scripted".to_string(),
                )))
        }
    }

    // ------------------------------------------------------------------
    // Fixtures
    // ------------------------------------------------------------------

    fn conversation_for(user_id: Uuid, title: &str) -> Conversation {
        Conversation {
            id: 1,
            uuid: Uuid::new_v4(),
            user_id,
            title: title.to_string(),
            mode: ConversationMode::General,
            project_id: None,
            goal_id: None,
            contact_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn test_state(db: Arc<MemoryDb>, completions: ScriptedClient) -> Arc<AppState> {
        Arc::new(AppState {
            db,
            completions: Arc::new(completions),
            registry: StreamRegistry::new(),
            chat_model: "test-chat-model".to_string(),
            title_model: "test-title-model".to_string(),
            jwt_secret: "secret".to_string(),
            stream_ttl: Duration::from_secs(300),
        })
    }

    fn request_body(conversation: &Conversation, message: &str, request_id: &str) -> Value {
        json!({
            "conversationId": conversation.uuid.to_string(),
            "userMessage": message,
            "requestId": request_id,
        })
    }

    async fn collect_events(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    fn delta(content: &str) -> StreamEvent {
        StreamEvent::Delta {
            content: content.to_string(),
        }
    }

    // ------------------------------------------------------------------
    // Wire protocol
    // ------------------------------------------------------------------

    #[test]
    fn stream_events_serialize_to_the_documented_lines() {
        assert_eq!(
            delta("Hel").to_line(),
            "{\"type\":\"delta\",\"content\":\"Hel\"}\n"
        );
        assert_eq!(
            StreamEvent::Error {
                message: "oops".to_string()
            }
            .to_line(),
            "{\"type\":\"error\",\"message\":\"oops\"}\n"
        );
        assert_eq!(
            StreamEvent::Done { cancelled: true }.to_line(),
            "{\"type\":\"done\",\"cancelled\":true}\n"
        );
    }

    #[test]
    fn ndjson_response_carries_the_streaming_headers() {
        let (_tx, rx) = mpsc::channel(1);
        let response = ndjson_response(rx);

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/x-ndjson; charset=utf-8"
        );
        assert_eq!(
            response.headers()[header::CACHE_CONTROL],
            "no-cache, no-transform"
        );
        assert_eq!(response.headers()[header::CONNECTION], "keep-alive");
    }

    // ------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------

    #[test]
    fn validation_rejects_missing_blank_and_malformed_fields() {
        let missing = json!({"conversationId": Uuid::new_v4().to_string(), "userMessage": "hi"});
        let blank = json!({
            "conversationId": Uuid::new_v4().to_string(),
            "userMessage": "   ",
            "requestId": "r1",
        });
        let bad_uuid = json!({
            "conversationId": "not-a-uuid",
            "userMessage": "hi",
            "requestId": "r1",
        });

        assert!(matches!(
            validate_request(&missing),
            Err(ApiError::BadRequest)
        ));
        assert!(matches!(validate_request(&blank), Err(ApiError::BadRequest)));
        assert!(matches!(
            validate_request(&bad_uuid),
            Err(ApiError::BadRequest)
        ));
    }

    #[test]
    fn validation_trims_fields() {
        let body = json!({
            "conversationId": format!("  {}  ", Uuid::new_v4()),
            "userMessage": "  hello  ",
            "requestId": " r1 ",
        });

        let validated = validate_request(&body).expect("valid");

        assert_eq!(validated.user_message, "hello");
        assert_eq!(validated.request_id, "r1");
    }

    // ------------------------------------------------------------------
    // Prepare phase
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn foreign_conversation_is_not_found_and_leaves_no_state() {
        let owner = Uuid::new_v4();
        let stranger = AuthenticatedUser { id: Uuid::new_v4() };
        let conversation = conversation_for(owner, "New conversation");
        let state = test_state(
            MemoryDb::with_conversation(conversation.clone()),
            ScriptedClient::default(),
        );

        let result = prepare_stream(&state, stranger, &request_body(&conversation, "hi", "r1"));

        assert!(matches!(result, Err(ApiError::NotFound)));
        assert!(state.registry.is_empty());
    }

    #[tokio::test]
    async fn prepare_registers_the_stream_and_persists_the_user_message() {
        let user = AuthenticatedUser { id: Uuid::new_v4() };
        let conversation = conversation_for(user.id, "New conversation");
        let state = test_state(
            MemoryDb::with_conversation(conversation.clone()),
            ScriptedClient::default(),
        );

        let prepared = prepare_stream(&state, user, &request_body(&conversation, "hello", "r1"))
            .expect("prepares");

        assert_eq!(state.registry.len(), 1);
        assert!(prepared.turn.first_turn);
        assert_eq!(prepared.turn.request_id, "r1");
        // system prompt + the current user message
        assert_eq!(prepared.turn.messages.len(), 2);
        assert_eq!(prepared.turn.messages[0]["role"], "system");
        assert_eq!(prepared.turn.messages[1]["content"], "hello");
    }

    // ------------------------------------------------------------------
    // Full stream scenarios
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn uncancelled_stream_emits_deltas_then_done_and_persists_the_joined_content() {
        let user = AuthenticatedUser { id: Uuid::new_v4() };
        let conversation = conversation_for(user.id, "Quarterly planning");
        let db = MemoryDb::with_conversation(conversation.clone());
        let state = test_state(
            db.clone(),
            ScriptedClient::streaming(vec![
                ScriptStep::Chunk(CompletionChunk::Delta("Hel".to_string())),
                ScriptStep::Chunk(CompletionChunk::Delta("lo ".to_string())),
                ScriptStep::Chunk(CompletionChunk::Delta("world".to_string())),
                ScriptStep::Chunk(CompletionChunk::Done),
            ]),
        );

        let prepared = prepare_stream(&state, user, &request_body(&conversation, "hi", "r1"))
            .expect("prepares");
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_BUFFER);
        run_generation(state.clone(), prepared.turn, prepared.cancel, tx).await;

        let events = collect_events(rx).await;
        assert_eq!(
            events,
            vec![
                delta("Hel"),
                delta("lo "),
                delta("world"),
                StreamEvent::Done { cancelled: false },
            ]
        );

        let assistant = db.messages_for(conversation.id, MessageRole::Assistant);
        assert_eq!(assistant.len(), 1);
        assert_eq!(assistant[0].content, "Hello world");
        assert!(state.registry.is_empty());
    }

    #[tokio::test]
    async fn cancel_after_the_first_chunk_keeps_the_partial_content() {
        let user = AuthenticatedUser { id: Uuid::new_v4() };
        let conversation = conversation_for(user.id, "Quarterly planning");
        let db = MemoryDb::with_conversation(conversation.clone());
        let state = test_state(
            db.clone(),
            ScriptedClient::streaming(vec![
                ScriptStep::Chunk(CompletionChunk::Delta("Hel".to_string())),
                ScriptStep::WaitForCancel,
            ]),
        );

        let prepared = prepare_stream(&state, user, &request_body(&conversation, "hi", "r1"))
            .expect("prepares");
        let (tx, mut rx) = mpsc::channel(EVENT_CHANNEL_BUFFER);
        let generation = tokio::spawn(run_generation(
            state.clone(),
            prepared.turn,
            prepared.cancel,
            tx,
        ));

        // First delta arrives, then the user hits stop.
        assert_eq!(rx.recv().await, Some(delta("Hel")));
        assert!(state.registry.cancel("r1", user.id));

        generation.await.expect("generation task completes");
        let events = collect_events(rx).await;
        assert_eq!(events, vec![StreamEvent::Done { cancelled: true }]);

        let assistant = db.messages_for(conversation.id, MessageRole::Assistant);
        assert_eq!(assistant.len(), 1);
        assert_eq!(assistant[0].content, "Hel");
        assert!(state.registry.is_empty());
    }

    #[tokio::test]
    async fn cancel_before_any_chunk_persists_no_assistant_message() {
        let user = AuthenticatedUser { id: Uuid::new_v4() };
        let conversation = conversation_for(user.id, "Quarterly planning");
        let db = MemoryDb::with_conversation(conversation.clone());
        let state = test_state(
            db.clone(),
            ScriptedClient::streaming(vec![ScriptStep::WaitForCancel]),
        );

        let prepared = prepare_stream(&state, user, &request_body(&conversation, "hi", "r1"))
            .expect("prepares");
        let cancel = prepared.cancel.clone();
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_BUFFER);
        let generation = tokio::spawn(run_generation(state.clone(), prepared.turn, cancel, tx));

        prepared.cancel.cancel();
        generation.await.expect("generation task completes");

        let events = collect_events(rx).await;
        assert_eq!(events, vec![StreamEvent::Done { cancelled: true }]);

        assert!(db
            .messages_for(conversation.id, MessageRole::Assistant)
            .is_empty());
    }

    #[tokio::test]
    async fn upstream_error_emits_one_generic_error_and_keeps_buffered_content() {
        let user = AuthenticatedUser { id: Uuid::new_v4() };
        let conversation = conversation_for(user.id, "Quarterly planning");
        let db = MemoryDb::with_conversation(conversation.clone());
        let state = test_state(
            db.clone(),
            ScriptedClient::streaming(vec![
                ScriptStep::Chunk(CompletionChunk::Delta("Par".to_string())),
                ScriptStep::Chunk(CompletionChunk::Error("connection reset by peer".to_string())),
            ]),
        );

        let prepared = prepare_stream(&state, user, &request_body(&conversation, "hi", "r1"))
            .expect("prepares");
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_BUFFER);
        run_generation(state.clone(), prepared.turn, prepared.cancel, tx).await;

        let events = collect_events(rx).await;
        assert_eq!(
            events,
            vec![
                delta("Par"),
                StreamEvent::Error {
                    message: UPSTREAM_ERROR_MESSAGE.to_string()
                },
                StreamEvent::Done { cancelled: false },
            ]
        );

        let assistant = db.messages_for(conversation.id, MessageRole::Assistant);
        assert_eq!(assistant.len(), 1);
        assert_eq!(assistant[0].content, "Par");
    }

    #[tokio::test]
    async fn failed_upstream_call_reports_an_error_without_persisting() {
        let user = AuthenticatedUser { id: Uuid::new_v4() };
        let conversation = conversation_for(user.id, "Quarterly planning");
        let db = MemoryDb::with_conversation(conversation.clone());
        let state = test_state(
            db.clone(),
            ScriptedClient::failing(CompletionError::Protocol("bad gateway".to_string())),
        );

        let prepared = prepare_stream(&state, user, &request_body(&conversation, "hi", "r1"))
            .expect("prepares");
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_BUFFER);
        run_generation(state.clone(), prepared.turn, prepared.cancel, tx).await;

        let events = collect_events(rx).await;
        assert_eq!(
            events,
            vec![
                StreamEvent::Error {
                    message: UPSTREAM_ERROR_MESSAGE.to_string()
                },
                StreamEvent::Done { cancelled: false },
            ]
        );

        assert!(db
            .messages_for(conversation.id, MessageRole::Assistant)
            .is_empty());
    }

    #[tokio::test]
    async fn cancelled_upstream_call_is_not_reported_as_an_error() {
        let user = AuthenticatedUser { id: Uuid::new_v4() };
        let conversation = conversation_for(user.id, "Quarterly planning");
        let state = test_state(
            MemoryDb::with_conversation(conversation.clone()),
            ScriptedClient::failing(CompletionError::Cancelled),
        );

        let prepared = prepare_stream(&state, user, &request_body(&conversation, "hi", "r1"))
            .expect("prepares");
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_BUFFER);
        run_generation(state.clone(), prepared.turn, prepared.cancel, tx).await;

        let events = collect_events(rx).await;
        assert_eq!(events, vec![StreamEvent::Done { cancelled: true }]);
    }

    // ------------------------------------------------------------------
    // Title generation
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn first_turn_with_placeholder_title_generates_a_title() {
        let user = AuthenticatedUser { id: Uuid::new_v4() };
        let conversation = conversation_for(user.id, "New conversation");
        let db = MemoryDb::with_conversation(conversation.clone());
        let state = test_state(
            db.clone(),
            ScriptedClient::streaming(vec![
                ScriptStep::Chunk(CompletionChunk::Delta("Sure.".to_string())),
                ScriptStep::Chunk(CompletionChunk::Done),
            ])
            .with_title(Ok("\"Planning the week\"".to_string())),
        );

        let prepared = prepare_stream(&state, user, &request_body(&conversation, "hi", "r1"))
            .expect("prepares");
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_BUFFER);
        run_generation(state.clone(), prepared.turn, prepared.cancel, tx).await;
        collect_events(rx).await;

        assert_eq!(db.title_of(conversation.id), "Planning the week");
    }

    #[tokio::test]
    async fn title_generation_failure_is_swallowed() {
        let user = AuthenticatedUser { id: Uuid::new_v4() };
        let conversation = conversation_for(user.id, "New conversation");
        let db = MemoryDb::with_conversation(conversation.clone());
        let state = test_state(
            db.clone(),
            ScriptedClient::streaming(vec![
                ScriptStep::Chunk(CompletionChunk::Delta("Sure.".to_string())),
                ScriptStep::Chunk(CompletionChunk::Done),
            ])
            .with_title(Err(CompletionError::Protocol("title service down".to_string()))),
        );

        let prepared = prepare_stream(&state, user, &request_body(&conversation, "hi", "r1"))
            .expect("prepares");
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_BUFFER);
        run_generation(state.clone(), prepared.turn, prepared.cancel, tx).await;

        // No error event reaches the client and the stream still completes.
        let events = collect_events(rx).await;
        assert_eq!(
            events,
            vec![delta("Sure."), StreamEvent::Done { cancelled: false }]
        );

        assert_eq!(db.title_of(conversation.id), "New conversation");
    }

    #[tokio::test]
    async fn customized_titles_are_never_overwritten() {
        let user = AuthenticatedUser { id: Uuid::new_v4() };
        let conversation = conversation_for(user.id, "My planning notes");
        let db = MemoryDb::with_conversation(conversation.clone());
        let state = test_state(
            db.clone(),
            ScriptedClient::streaming(vec![
                ScriptStep::Chunk(CompletionChunk::Delta("Sure.".to_string())),
                ScriptStep::Chunk(CompletionChunk::Done),
            ])
            .with_title(Ok("Should not appear".to_string())),
        );

        let prepared = prepare_stream(&state, user, &request_body(&conversation, "hi", "r1"))
            .expect("prepares");
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_BUFFER);
        run_generation(state.clone(), prepared.turn, prepared.cancel, tx).await;
        collect_events(rx).await;

        assert_eq!(db.title_of(conversation.id), "My planning notes");
    }

    #[test]
    fn clean_title_strips_decoration() {
        assert_eq!(clean_title("\"Planning the week\""), "Planning the week");
        assert_eq!(clean_title("  'Standup notes'  "), "Standup notes");
        assert_eq!(clean_title("First line\nSecond line"), "First line");
        assert_eq!(clean_title(""), "");

        let long = "x".repeat(200);
        assert_eq!(clean_title(&long).chars().count(), TITLE_MAX_CHARS);
    }

    // ------------------------------------------------------------------
    // Error classification
    // ------------------------------------------------------------------

    #[test]
    fn cancellation_is_recognized_from_token_variant_and_message() {
        let token = CancellationToken::new();

        assert!(ended_by_cancellation(&CompletionError::Cancelled, &token));
        assert!(ended_by_cancellation(
            &CompletionError::Protocol("request aborted by client".to_string()),
            &token
        ));
        assert!(!ended_by_cancellation(
            &CompletionError::Protocol("bad gateway".to_string()),
            &token
        ));

        token.cancel();
        assert!(ended_by_cancellation(
            &CompletionError::Protocol("bad gateway".to_string()),
            &token
        ));
    }

    // ------------------------------------------------------------------
    // Finalization failure
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn failed_assistant_persist_still_emits_done() {
        let user = AuthenticatedUser { id: Uuid::new_v4() };
        let conversation = conversation_for(user.id, "Quarterly planning");
        let db = Arc::new(MemoryDb {
            fail_message_writes: true,
            ..Default::default()
        });
        db.conversations.lock().unwrap().push(conversation.clone());
        let state = test_state(
            db.clone(),
            ScriptedClient::streaming(vec![
                ScriptStep::Chunk(CompletionChunk::Delta("Hello".to_string())),
                ScriptStep::Chunk(CompletionChunk::Done),
            ]),
        );

        let prepared = prepare_stream(&state, user, &request_body(&conversation, "hi", "r1"))
            .expect("prepares");
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_BUFFER);
        run_generation(state.clone(), prepared.turn, prepared.cancel, tx).await;

        // The write failure is logged, not surfaced: no extra event beyond
        // the already-streamed deltas and the terminal done.
        let events = collect_events(rx).await;
        assert_eq!(
            events,
            vec![delta("Hello"), StreamEvent::Done { cancelled: false }]
        );
        assert!(db
            .messages_for(conversation.id, MessageRole::Assistant)
            .is_empty());
        assert!(state.registry.is_empty());
    }
}
