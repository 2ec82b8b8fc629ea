//! Agent session controller: request lifecycle, streaming consumption,
//! cancellation, and follow-up scheduling.
//!
//! A session owns a document, an [`Engine`], a chat log, and a handle to the
//! shared [`ComponentRegistry`]. `prompt` normalizes caller input into an
//! [`AgentRequest`], sends it through the pluggable [`AgentTransport`], and
//! applies each streamed action as it arrives. In-progress actions are
//! provisional: each one is applied inside a [`ChangeTracker`] scope and its
//! diff is reverted when the revised successor lands, so a shape the agent is
//! still "typing" never duplicates. Concurrent human edits are untouched by
//! those reverts.

pub mod context;
pub mod history;

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::engine::Engine;
use crate::facade::{Bounds, DocumentApi};
use crate::protocol::{Action, ActionKind, AddDetailParams, TodoItem};
use crate::registry::{ComponentRegistry, RegistrationInfo, RegistryToken, UpdateOptions};
use crate::undo::{ActionDiff, ChangeTracker};

pub use context::{ContextItem, ContextSet};
pub use history::{ChatHistory, HistoryEntry};

/// The stream of actions a transport yields for one request.
pub type ActionStream = Pin<Box<dyn Stream<Item = Result<Action>> + Send>>;

/// Where requests go. Implementations wrap an HTTP client, a local model,
/// or a test fixture; the session only sees the action stream coming back.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn send(&self, request: &AgentRequest) -> Result<ActionStream>;
}

/// A fully normalized request, ready for the transport.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequest {
    pub messages: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context: Vec<ContextItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<Bounds>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl AgentRequest {
    /// Merge this request on top of an older pending one: list fields
    /// concatenate (context deduplicates), scalar fields take the newer
    /// value when it is set.
    pub fn merge_over(self, older: AgentRequest) -> AgentRequest {
        let mut context = ContextSet::new();
        for item in older.context.into_iter().chain(self.context) {
            context.add(item);
        }
        AgentRequest {
            messages: older
                .messages
                .into_iter()
                .chain(self.messages)
                .collect(),
            context: context.items().to_vec(),
            bounds: self.bounds.or(older.bounds),
            model: self.model.or(older.model),
        }
    }
}

/// Caller-facing prompt shapes, all normalized into an [`AgentRequest`].
#[derive(Debug, Clone)]
pub enum PromptInput {
    Text(String),
    Messages(Vec<String>),
    Request(AgentRequest),
}

impl From<&str> for PromptInput {
    fn from(text: &str) -> Self {
        PromptInput::Text(text.to_string())
    }
}

impl From<String> for PromptInput {
    fn from(text: String) -> Self {
        PromptInput::Text(text)
    }
}

impl From<Vec<String>> for PromptInput {
    fn from(messages: Vec<String>) -> Self {
        PromptInput::Messages(messages)
    }
}

impl From<AgentRequest> for PromptInput {
    fn from(request: AgentRequest) -> Self {
        PromptInput::Request(request)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Requesting,
    Streaming,
    Complete,
    Cancelled,
    Error,
}

/// Cooperative cancellation flag shared between the session and its caller.
///
/// Cancellation is checked between actions, never mid-mutation, so a
/// cancelled request leaves no half-applied action behind.
#[derive(Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    async fn cancelled(&self) {
        let mut notified = std::pin::pin!(self.notify.notified());
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Model identifier forwarded to the transport when the request does
    /// not name one.
    pub model: Option<String>,
    /// Host sessions own the viewport; non-host sessions have `setViewport`
    /// ignored.
    pub is_host: bool,
}

impl SessionConfig {
    pub fn host() -> Self {
        Self {
            model: None,
            is_host: true,
        }
    }
}

#[derive(Debug, Default)]
struct RunStats {
    applied: usize,
}

/// One human/agent conversation bound to one document.
pub struct AgentSession<D: DocumentApi> {
    session_id: String,
    doc: D,
    engine: Engine,
    transport: Box<dyn AgentTransport>,
    registry: Arc<Mutex<ComponentRegistry>>,
    config: SessionConfig,
    /// Context the user has attached for the next request.
    pub context: ContextSet,
    history: ChatHistory,
    todos: Vec<TodoItem>,
    /// Diff of the most recent incomplete action, reverted when its
    /// successor arrives.
    pending_diff: Option<ActionDiff>,
    /// Explicit follow-up request queued via `schedule`.
    scheduled: Option<AgentRequest>,
    detail_tokens: Vec<RegistryToken>,
    view_bounds: Option<Bounds>,
    state: SessionState,
    active: CancelHandle,
}

impl<D: DocumentApi> AgentSession<D> {
    pub fn new(doc: D, transport: Box<dyn AgentTransport>, config: SessionConfig) -> Self {
        Self::with_registry(
            doc,
            transport,
            Arc::new(Mutex::new(ComponentRegistry::new())),
            config,
        )
    }

    /// Construct against a shared registry, for embedders that wire several
    /// sessions to one component store.
    pub fn with_registry(
        doc: D,
        transport: Box<dyn AgentTransport>,
        registry: Arc<Mutex<ComponentRegistry>>,
        config: SessionConfig,
    ) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            doc,
            engine: Engine::new(config.is_host),
            transport,
            registry,
            config,
            context: ContextSet::new(),
            history: ChatHistory::new(),
            todos: Vec::new(),
            pending_diff: None,
            scheduled: None,
            detail_tokens: Vec::new(),
            view_bounds: None,
            state: SessionState::Idle,
            active: CancelHandle::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn doc(&self) -> &D {
        &self.doc
    }

    pub fn doc_mut(&mut self) -> &mut D {
        &mut self.doc
    }

    pub fn history(&self) -> &ChatHistory {
        &self.history
    }

    pub fn todos(&self) -> &[TodoItem] {
        &self.todos
    }

    pub fn registry(&self) -> Arc<Mutex<ComponentRegistry>> {
        Arc::clone(&self.registry)
    }

    /// Bounds sent with requests that do not carry their own.
    pub fn set_view_bounds(&mut self, bounds: Option<Bounds>) {
        self.view_bounds = bounds;
    }

    /// Handle for the request currently (or next) in flight.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.active.clone()
    }

    pub fn cancel(&self) {
        self.active.cancel();
    }

    /// Queue a follow-up request to run after the current one finishes.
    /// Repeated calls merge, newer over older.
    pub fn schedule(&mut self, input: impl Into<PromptInput>) {
        let request = self.normalize(input.into());
        self.scheduled = Some(match self.scheduled.take() {
            Some(prior) => request.merge_over(prior),
            None => request,
        });
    }

    /// Send a prompt and drive it to completion, including any scheduled or
    /// todo-driven follow-ups. Starting a new prompt cancels the prior one.
    pub async fn prompt(&mut self, input: impl Into<PromptInput>) -> Result<SessionState> {
        self.active.cancel();
        self.active = CancelHandle::new();
        let cancel = self.active.clone();
        self.prompt_with(input, &cancel).await
    }

    /// Like `prompt`, but driven by a caller-owned cancellation handle.
    pub async fn prompt_with(
        &mut self,
        input: impl Into<PromptInput>,
        cancel: &CancelHandle,
    ) -> Result<SessionState> {
        let mut next = Some(self.normalize(input.into()));
        while let Some(request) = next.take() {
            if cancel.is_cancelled() {
                break;
            }
            let stats = match self.run_request(&request, cancel).await {
                Ok(stats) => stats,
                Err(err) => {
                    self.state = SessionState::Error;
                    return Err(err);
                }
            };
            next = self.follow_up(&stats, cancel);
        }
        self.state = if cancel.is_cancelled() {
            SessionState::Cancelled
        } else {
            SessionState::Complete
        };
        Ok(self.state)
    }

    /// Release registry references and per-session engine state.
    pub async fn end(&mut self) {
        self.active.cancel();
        if !self.detail_tokens.is_empty() {
            let mut registry = self.registry.lock().await;
            for token in self.detail_tokens.drain(..) {
                registry.release(&token);
            }
        }
        self.engine.end_session(&self.session_id);
        self.state = SessionState::Idle;
    }

    fn normalize(&self, input: PromptInput) -> AgentRequest {
        let mut request = match input {
            PromptInput::Text(text) => AgentRequest {
                messages: vec![text],
                ..Default::default()
            },
            PromptInput::Messages(messages) => AgentRequest {
                messages,
                ..Default::default()
            },
            PromptInput::Request(request) => request,
        };
        if request.context.is_empty() {
            request.context = self.context.items().to_vec();
        }
        if request.bounds.is_none() {
            request.bounds = self.view_bounds;
        }
        if request.model.is_none() {
            request.model = self.config.model.clone();
        }
        request
    }

    /// Decide whether another request should follow the one that just
    /// finished: an explicit `schedule` wins, then unfinished todos.
    fn follow_up(&mut self, stats: &RunStats, cancel: &CancelHandle) -> Option<AgentRequest> {
        if cancel.is_cancelled() {
            return None;
        }
        if let Some(scheduled) = self.scheduled.take() {
            self.history.push_continuation("scheduled follow-up", now_ms());
            return Some(scheduled);
        }
        // Only continue when the last request made progress, so an agent
        // that returns nothing cannot spin the session forever.
        if stats.applied > 0 && self.todos.iter().any(|todo| !todo.done) {
            self.history.push_continuation("unfinished todos", now_ms());
            let nudge = PromptInput::Text(
                "Continue working through the remaining todo items.".to_string(),
            );
            return Some(self.normalize(nudge));
        }
        None
    }

    async fn run_request(
        &mut self,
        request: &AgentRequest,
        cancel: &CancelHandle,
    ) -> Result<RunStats> {
        self.state = SessionState::Requesting;
        self.history.push_prompt(request.messages.clone(), now_ms());

        let mut stream = self.transport.send(request).await?;
        self.state = SessionState::Streaming;
        debug!(session = %self.session_id, "streaming agent response");

        let mut stats = RunStats::default();
        let mut details: Vec<AddDetailParams> = Vec::new();
        let mut stream_error: Option<anyhow::Error> = None;

        loop {
            if cancel.is_cancelled() {
                break;
            }
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                item = stream.next() => item,
            };
            let Some(item) = item else { break };
            let action = match item {
                Ok(action) => action,
                Err(err) => {
                    stream_error = Some(err);
                    break;
                }
            };

            // A successor supersedes the provisional effect of the previous
            // incomplete action.
            if let Some(diff) = self.pending_diff.take() {
                diff.revert(&mut self.doc);
            }

            self.history.record_action(action.clone(), now_ms());
            self.apply_streamed(&action, &mut stats, &mut details);
        }

        if cancel.is_cancelled() || stream_error.is_some() {
            // Provisional state from an unfinished action must not survive
            // an interrupted stream.
            if let Some(diff) = self.pending_diff.take() {
                diff.revert(&mut self.doc);
            }
        } else {
            // A stream that ends cleanly on an incomplete action finalizes
            // it as-is.
            self.pending_diff = None;
        }

        // Registry publication is deferred until the stream has fully
        // drained, so it never interleaves with document mutation.
        for params in details {
            if let Err(err) = self.publish_detail(params).await {
                warn!(session = %self.session_id, error = %err, "detail publication failed");
            }
        }

        match stream_error {
            Some(err) => {
                self.state = SessionState::Error;
                Err(err)
            }
            None => Ok(stats),
        }
    }

    /// Apply one streamed action inside a tracker scope. Failures revert
    /// whatever partial mutations landed and the stream continues.
    fn apply_streamed(
        &mut self,
        action: &Action,
        stats: &mut RunStats,
        details: &mut Vec<AddDetailParams>,
    ) {
        let mut tracker = ChangeTracker::new(&mut self.doc);
        match self.engine.apply_action(&mut tracker, &self.session_id, action) {
            Ok(outcome) => {
                let diff = tracker.into_diff();
                if outcome.applied {
                    stats.applied += 1;
                    merge_todos(&mut self.todos, outcome.todos);
                    if action.is_complete() {
                        if let ActionKind::AddDetail(params) = &action.kind {
                            details.push(params.clone());
                        }
                    }
                }
                self.pending_diff = (!action.is_complete()).then_some(diff);
            }
            Err(err) => {
                warn!(
                    session = %self.session_id,
                    action = %action.id,
                    error = %err,
                    "action failed, continuing stream"
                );
                tracker.into_diff().revert(&mut self.doc);
                self.pending_diff = None;
            }
        }
    }

    /// Route an `add_detail` payload to the registry: update the component
    /// if it exists, otherwise register it under this session's context key.
    async fn publish_detail(&mut self, params: AddDetailParams) -> Result<()> {
        let mut registry = self.registry.lock().await;
        if registry.get(&params.message_id).is_some() {
            let outcome =
                registry.update(&params.message_id, params.props, UpdateOptions::default())?;
            debug!(component = %params.message_id, ?outcome, "detail update");
        } else {
            let token = registry.register(RegistrationInfo {
                message_id: params.message_id,
                component_type: params.component_type,
                props: params.props,
                context_key: Some(self.session_id.clone()),
                ..Default::default()
            });
            self.detail_tokens.push(token);
        }
        Ok(())
    }
}

/// Fold incoming todo items into the session list, matching by text.
fn merge_todos(todos: &mut Vec<TodoItem>, incoming: Vec<TodoItem>) {
    for item in incoming {
        match todos.iter_mut().find(|todo| todo.text == item.text) {
            Some(existing) => existing.done = item.done,
            None => todos.push(item),
        }
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}
