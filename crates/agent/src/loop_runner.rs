//! The agent loop driver.
//!
//! `AgentLoop` owns the conversation, the coordinator and at most one
//! `StreamSession`. Front ends call `submit`, then `tick` on a short
//! interval; each call returns the `AgentEvent`s to render. Nothing here
//! blocks on the network: stream I/O and tool handlers run on background
//! tasks and are polled.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use meshtalk_core::error::Error;
use meshtalk_core::event::{DomainEvent, EventBus};
use meshtalk_core::message::{Conversation, Message};
use meshtalk_core::provider::Provider;
use meshtalk_core::tool::{ToolCall, ToolResult};
use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coordinator::{Coordinator, Effect, Event, Phase, RoundOutcome};
use crate::events::AgentEvent;
use crate::executor::{ApprovalDecision, Preflight, Resumption, ToolExecutor, handler_context};
use crate::request::RequestBuilder;
use crate::session::{SessionPoll, StreamSession};

/// Upper bound on frames handled per tick so input stays responsive.
const MAX_POLLS_PER_TICK: usize = 64;

pub const DEFAULT_MAX_ROUNDS: u32 = 25;

pub struct AgentLoop {
    provider: Arc<dyn Provider>,
    executor: Arc<ToolExecutor>,
    requests: RequestBuilder,
    conversation: Conversation,
    coordinator: Coordinator,
    session: Option<StreamSession>,
    sessions_opened: u64,
    running: Option<oneshot::Receiver<ToolResult>>,
    round_cancel: CancellationToken,
    working_dir: PathBuf,
    event_bus: Option<Arc<EventBus>>,
}

impl AgentLoop {
    pub fn new(
        provider: Arc<dyn Provider>,
        executor: Arc<ToolExecutor>,
        requests: RequestBuilder,
    ) -> Self {
        let working_dir = executor.permissions().working_dir().to_path_buf();
        Self {
            provider,
            executor,
            requests,
            conversation: Conversation::new(),
            coordinator: Coordinator::new(DEFAULT_MAX_ROUNDS),
            session: None,
            sessions_opened: 0,
            running: None,
            round_cancel: CancellationToken::new(),
            working_dir,
            event_bus: None,
        }
    }

    /// Limit the number of tool-driven resubmissions per turn.
    pub fn with_max_rounds(mut self, max_rounds: u32) -> Self {
        self.coordinator = Coordinator::new(max_rounds);
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Continue an existing conversation.
    pub fn with_conversation(mut self, conversation: Conversation) -> Self {
        self.conversation = conversation;
        self
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    pub fn executor(&self) -> &Arc<ToolExecutor> {
        &self.executor
    }

    pub fn phase(&self) -> Phase {
        self.coordinator.phase()
    }

    pub fn is_idle(&self) -> bool {
        self.coordinator.is_idle()
    }

    /// The call waiting on `resolve_approval`, if any.
    pub fn awaiting_approval(&self) -> Option<&ToolCall> {
        self.coordinator.awaiting_approval()
    }

    /// Assistant text received so far in the current stream.
    pub fn partial_text(&self) -> &str {
        self.coordinator.buffer()
    }

    pub fn model(&self) -> Option<&str> {
        self.requests.model.as_deref()
    }

    pub fn set_model(&mut self, model: impl Into<String>) {
        let model = model.into();
        self.conversation
            .push(Message::notice(format!("Switched model to {model}")));
        self.requests.set_model(model);
    }

    /// Add a transcript-only line that is never sent to the model.
    pub fn push_notice(&mut self, text: impl Into<String>) {
        self.conversation.push(Message::notice(text));
    }

    /// Append a user message and start a round.
    pub fn submit(&mut self, text: impl Into<String>) -> Result<Vec<AgentEvent>, Error> {
        if !self.is_idle() {
            return Err(Error::Internal("a round is already in progress".into()));
        }
        self.conversation.push(Message::user(text));
        Ok(self.dispatch(Event::UserInput))
    }

    /// Poll the stream and any running handler once, without waiting.
    pub fn tick(&mut self) -> Vec<AgentEvent> {
        let mut out = Vec::new();

        for _ in 0..MAX_POLLS_PER_TICK {
            let Some(session) = self.session.as_mut() else {
                break;
            };
            let event = match session.poll() {
                SessionPoll::Pending => break,
                SessionPoll::Chunk(chunk) => Event::Chunk(chunk),
                SessionPoll::Closed => {
                    debug!(
                        session = session.id(),
                        elapsed_ms = session.elapsed().as_millis() as u64,
                        "Stream closed"
                    );
                    Event::StreamClosed
                }
                SessionPoll::Failed(e) => Event::StreamFailed(e),
            };
            out.extend(self.dispatch(event));
        }

        if let Some(rx) = self.running.as_mut() {
            let finished = match rx.try_recv() {
                Ok(result) => Some(result),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Closed) => self.coordinator.current_call().map(|call| {
                    warn!(tool = %call.name, "Tool task ended without a result");
                    ToolResult::error(&call.id, "Tool execution aborted unexpectedly")
                }),
            };
            if let Some(result) = finished {
                self.running = None;
                out.extend(self.dispatch(Event::ToolFinished(result)));
            }
        }
        out
    }

    /// Deliver the user's answer for a parked call.
    pub fn resolve_approval(&mut self, call_id: &str, decision: ApprovalDecision) -> Vec<AgentEvent> {
        match self.executor.resume(call_id, decision) {
            Some(Resumption::Approved(call)) => self.dispatch(Event::ToolReady(call)),
            Some(Resumption::Denied(result)) => self.dispatch(Event::ToolDenied(result)),
            None => {
                warn!(call_id, "No parked call with this id");
                Vec::new()
            }
        }
    }

    /// Cancel the in-flight round. Text already received is kept.
    pub fn cancel(&mut self) -> Vec<AgentEvent> {
        self.dispatch(Event::Cancel)
    }

    /// Tick until the round is idle or waiting on an approval.
    pub async fn run_until_settled(&mut self, poll_interval: Duration) -> Vec<AgentEvent> {
        let mut out = Vec::new();
        loop {
            out.extend(self.tick());
            if self.is_idle() || self.awaiting_approval().is_some() {
                return out;
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    fn dispatch(&mut self, event: Event) -> Vec<AgentEvent> {
        let mut out = Vec::new();
        let mut pending = VecDeque::from([event]);
        while let Some(event) = pending.pop_front() {
            for effect in self.coordinator.handle(event) {
                if let Some(next) = self.perform(effect, &mut out) {
                    pending.push_back(next);
                }
            }
        }
        out
    }

    fn perform(&mut self, effect: Effect, out: &mut Vec<AgentEvent>) -> Option<Event> {
        match effect {
            Effect::StartStream => {
                let request = match self
                    .requests
                    .build(&self.conversation, self.executor.catalog())
                {
                    Ok(request) => request,
                    Err(e) => return Some(Event::RequestInvalid(e.to_string())),
                };
                self.sessions_opened += 1;
                info!(
                    provider = self.provider.name(),
                    model = %request.model,
                    session = self.sessions_opened,
                    messages = request.messages.len(),
                    tools = request.tools.len(),
                    "Starting stream"
                );
                self.session = Some(StreamSession::open(
                    self.sessions_opened,
                    self.provider.clone(),
                    request,
                ));
                None
            }
            Effect::CancelStream => {
                if let Some(session) = self.session.take() {
                    session.cancel();
                }
                None
            }
            Effect::Commit(message) => {
                self.conversation.push(message);
                None
            }
            Effect::Emit(event) => {
                out.push(event);
                None
            }
            Effect::Preflight(call) => Some(match self.executor.preflight(&call) {
                Preflight::Ready(call) => Event::ToolReady(call),
                Preflight::NeedsApproval(request) => Event::ApprovalRequired(request),
                Preflight::Resolved(result) => Event::ToolResolved(result),
            }),
            Effect::Execute(call) => {
                let (tx, rx) = oneshot::channel();
                let executor = self.executor.clone();
                let ctx = handler_context(&self.working_dir, &self.round_cancel);
                tokio::spawn(async move {
                    let result = executor.run(&call, &ctx).await;
                    let _ = tx.send(result);
                });
                self.running = Some(rx);
                None
            }
            Effect::AbortTools => {
                self.round_cancel.cancel();
                self.round_cancel = CancellationToken::new();
                self.running = None;
                let dropped = self.executor.discard_parked();
                debug!(dropped, "Aborted tool activity");
                None
            }
            Effect::Finished(outcome) => {
                self.on_finished(outcome);
                None
            }
        }
    }

    fn on_finished(&self, outcome: RoundOutcome) {
        let Some(bus) = &self.event_bus else {
            return;
        };
        match outcome {
            RoundOutcome::Completed => bus.publish(DomainEvent::RoundCompleted {
                conversation_id: self.conversation.id.to_string(),
                model: self.requests.model.clone().unwrap_or_default(),
                tokens_used: self.coordinator.usage().map_or(0, |u| u.total_tokens),
                timestamp: Utc::now(),
            }),
            RoundOutcome::Failed(message) => bus.publish(DomainEvent::ErrorOccurred {
                context: "agent round".into(),
                error_message: message,
                timestamp: Utc::now(),
            }),
            RoundOutcome::Cancelled => {}
        }
    }
}

impl Drop for AgentLoop {
    fn drop(&mut self) {
        self.round_cancel.cancel();
    }
}
