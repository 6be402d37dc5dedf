//! The round state machine.
//!
//! `Coordinator::handle` is a pure transition: it takes one event and
//! returns the effects the driver must perform, in order. It never touches
//! the network, the terminal or the conversation directly, so every path
//! through a round can be tested with plain values.

use std::collections::VecDeque;

use meshtalk_core::error::ProviderError;
use meshtalk_core::message::Message;
use meshtalk_core::provider::{StreamChunk, Usage};
use meshtalk_core::tool::{ToolCall, ToolResult};
use tracing::{debug, trace};

use crate::events::AgentEvent;
use crate::executor::{ApprovalRequest, CANCELLED_BY_USER, SKIPPED_AFTER_DENIAL};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    AwaitingStream,
    ToolPending,
    Executing,
}

/// Inputs to the state machine.
#[derive(Debug, Clone)]
pub enum Event {
    /// A user message was appended; start a round.
    UserInput,
    Chunk(StreamChunk),
    /// The chunk source closed with no pending error.
    StreamClosed,
    StreamFailed(ProviderError),
    /// The request could not be built (no model selected).
    RequestInvalid(String),
    Cancel,
    /// Preflight allowed the current call, or the user approved it.
    ToolReady(ToolCall),
    /// Preflight parked the current call.
    ApprovalRequired(ApprovalRequest),
    /// Preflight resolved the current call without running it.
    ToolResolved(ToolResult),
    /// The user denied the current call.
    ToolDenied(ToolResult),
    ToolFinished(ToolResult),
}

/// Work for the driver.
#[derive(Debug, Clone)]
pub enum Effect {
    StartStream,
    CancelStream,
    /// Append to the conversation.
    Commit(Message),
    Emit(AgentEvent),
    Preflight(ToolCall),
    Execute(ToolCall),
    /// Stop any running handler and forget parked approvals.
    AbortTools,
    Finished(RoundOutcome),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    Completed,
    Cancelled,
    Failed(String),
}

#[derive(Debug)]
pub struct Coordinator {
    phase: Phase,
    buffer: String,
    current: Option<ToolCall>,
    queue: VecDeque<ToolCall>,
    awaiting_approval: bool,
    resubmissions: u32,
    max_rounds: u32,
    tool_calls_made: usize,
    usage: Option<Usage>,
}

impl Coordinator {
    pub fn new(max_rounds: u32) -> Self {
        Self {
            phase: Phase::Idle,
            buffer: String::new(),
            current: None,
            queue: VecDeque::new(),
            awaiting_approval: false,
            resubmissions: 0,
            max_rounds,
            tool_calls_made: 0,
            usage: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_idle(&self) -> bool {
        self.phase == Phase::Idle
    }

    /// Assistant text accumulated in the current stream.
    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// The call being resolved, if any.
    pub fn current_call(&self) -> Option<&ToolCall> {
        self.current.as_ref()
    }

    /// Usage accumulated over the current (or last) round.
    pub fn usage(&self) -> Option<&Usage> {
        self.usage.as_ref()
    }

    /// The call parked on a human decision, if any.
    pub fn awaiting_approval(&self) -> Option<&ToolCall> {
        self.current.as_ref().filter(|_| self.awaiting_approval)
    }

    pub fn handle(&mut self, event: Event) -> Vec<Effect> {
        trace!(phase = ?self.phase, event = ?event, "Coordinator event");
        match (self.phase, event) {
            (Phase::Idle, Event::UserInput) => {
                self.resubmissions = 0;
                self.tool_calls_made = 0;
                self.usage = None;
                self.begin_stream()
            }
            (_, Event::UserInput) => {
                debug!(phase = ?self.phase, "Input ignored while a round is active");
                Vec::new()
            }

            (Phase::AwaitingStream, Event::Chunk(chunk)) => self.on_chunk(chunk),
            (Phase::AwaitingStream, Event::StreamClosed) => self.complete(),
            (Phase::AwaitingStream, Event::StreamFailed(e)) => {
                let mut effects = vec![Effect::CancelStream];
                effects.extend(self.freeze_partial());
                if e.is_cancellation() {
                    effects.extend(self.finish_cancelled());
                } else {
                    effects.extend(self.fail(e.to_string()));
                }
                effects
            }
            (Phase::AwaitingStream, Event::RequestInvalid(message)) => self.fail(message),

            (Phase::ToolPending, Event::ToolReady(call)) if self.is_current(&call.id) => {
                self.awaiting_approval = false;
                self.phase = Phase::Executing;
                vec![Effect::Execute(call)]
            }
            (Phase::ToolPending, Event::ApprovalRequired(request))
                if self.is_current(&request.call.id) =>
            {
                self.awaiting_approval = true;
                vec![Effect::Emit(AgentEvent::ApprovalRequested {
                    id: request.call.id,
                    name: request.call.name,
                    input: request.call.arguments,
                    framing: request.framing.map(|f| f.to_string()),
                    reason: request.reason,
                })]
            }
            (Phase::ToolPending, Event::ToolResolved(result))
                if self.is_current(&result.tool_call_id) =>
            {
                let mut effects = self.record(result);
                effects.extend(self.advance());
                effects
            }
            (Phase::ToolPending, Event::ToolDenied(result))
                if self.is_current(&result.tool_call_id) =>
            {
                self.awaiting_approval = false;
                let mut effects = self.record(result);
                for call in std::mem::take(&mut self.queue) {
                    effects.extend(self.commit_result(&call, ToolResult::error(&call.id, SKIPPED_AFTER_DENIAL)));
                }
                effects.extend(self.complete_turn());
                effects
            }
            (Phase::Executing, Event::ToolFinished(result))
                if self.is_current(&result.tool_call_id) =>
            {
                let mut effects = self.record(result);
                effects.extend(self.advance());
                effects
            }

            (Phase::Idle, Event::Cancel) => Vec::new(),
            (_, Event::Cancel) => self.cancel(),

            (phase, event) => {
                debug!(?phase, ?event, "Ignoring event not valid in this phase");
                Vec::new()
            }
        }
    }

    fn is_current(&self, call_id: &str) -> bool {
        self.current.as_ref().is_some_and(|c| c.id == call_id)
    }

    fn begin_stream(&mut self) -> Vec<Effect> {
        self.buffer.clear();
        self.phase = Phase::AwaitingStream;
        vec![Effect::StartStream]
    }

    fn on_chunk(&mut self, chunk: StreamChunk) -> Vec<Effect> {
        let mut effects = Vec::new();

        if let Some(usage) = &chunk.usage {
            self.usage.get_or_insert_with(Usage::default).accumulate(usage);
        }
        if let Some(text) = chunk.content.as_deref().filter(|t| !t.is_empty()) {
            self.buffer.push_str(text);
            effects.push(Effect::Emit(AgentEvent::TextDelta {
                content: text.to_string(),
            }));
        }

        // Embedded calls may arrive before the terminal flag, so every
        // chunk is checked.
        let calls = chunk.tool_signal().into_calls();
        if !calls.is_empty() {
            debug!(count = calls.len(), "Tool calls detected mid-stream");
            effects.push(Effect::CancelStream);
            effects.push(Effect::Commit(Message::assistant_with_tools(
                std::mem::take(&mut self.buffer),
                calls.clone(),
            )));
            for call in &calls {
                effects.push(Effect::Emit(AgentEvent::ToolCall {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    input: call.arguments.clone(),
                }));
            }
            self.tool_calls_made += calls.len();
            self.queue = calls.into();
            effects.extend(self.next_call());
            return effects;
        }

        if chunk.done {
            effects.extend(self.complete());
        }
        effects
    }

    /// Stream ended without a tool call.
    fn complete(&mut self) -> Vec<Effect> {
        let mut effects = vec![Effect::CancelStream];
        effects.extend(self.freeze_partial());
        effects.extend(self.complete_turn());
        effects
    }

    fn complete_turn(&mut self) -> Vec<Effect> {
        self.phase = Phase::Idle;
        self.current = None;
        vec![
            Effect::Emit(AgentEvent::Done {
                usage: self.usage.clone(),
                rounds: self.resubmissions + 1,
                tool_calls_made: self.tool_calls_made,
            }),
            Effect::Finished(RoundOutcome::Completed),
        ]
    }

    fn freeze_partial(&mut self) -> Option<Effect> {
        if self.buffer.is_empty() {
            return None;
        }
        Some(Effect::Commit(Message::assistant(std::mem::take(&mut self.buffer))))
    }

    fn fail(&mut self, message: String) -> Vec<Effect> {
        self.phase = Phase::Idle;
        self.current = None;
        self.queue.clear();
        vec![
            Effect::Emit(AgentEvent::Error {
                message: message.clone(),
            }),
            Effect::Finished(RoundOutcome::Failed(message)),
        ]
    }

    fn finish_cancelled(&mut self) -> Vec<Effect> {
        self.phase = Phase::Idle;
        self.current = None;
        self.awaiting_approval = false;
        vec![
            Effect::Emit(AgentEvent::Cancelled),
            Effect::Finished(RoundOutcome::Cancelled),
        ]
    }

    fn cancel(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        match self.phase {
            Phase::AwaitingStream => {
                effects.push(Effect::CancelStream);
                effects.extend(self.freeze_partial());
            }
            Phase::ToolPending | Phase::Executing => {
                effects.push(Effect::AbortTools);
                // Every emitted call still gets exactly one result.
                let pending: Vec<_> = self.current.take().into_iter().chain(self.queue.drain(..)).collect();
                for call in pending {
                    effects.extend(self.commit_result(&call, ToolResult::error(&call.id, CANCELLED_BY_USER)));
                }
            }
            Phase::Idle => {}
        }
        effects.extend(self.finish_cancelled());
        effects
    }

    fn record(&mut self, result: ToolResult) -> Vec<Effect> {
        match self.current.take() {
            Some(call) => self.commit_result(&call, result),
            None => Vec::new(),
        }
    }

    fn commit_result(&self, call: &ToolCall, result: ToolResult) -> Vec<Effect> {
        vec![
            Effect::Emit(AgentEvent::ToolResult {
                id: call.id.clone(),
                name: call.name.clone(),
                output: result.content.clone(),
                is_error: result.is_error,
            }),
            Effect::Commit(Message::tool_result(&result)),
        ]
    }

    fn next_call(&mut self) -> Vec<Effect> {
        match self.queue.pop_front() {
            Some(call) => {
                self.phase = Phase::ToolPending;
                self.awaiting_approval = false;
                self.current = Some(call.clone());
                vec![Effect::Preflight(call)]
            }
            None => Vec::new(),
        }
    }

    /// After a result: next queued call, or resubmit the conversation.
    fn advance(&mut self) -> Vec<Effect> {
        if !self.queue.is_empty() {
            return self.next_call();
        }
        if self.resubmissions >= self.max_rounds {
            return self.fail(format!(
                "Stopped after {} tool rounds without a final answer",
                self.max_rounds
            ));
        }
        self.resubmissions += 1;
        self.begin_stream()
    }
}
