//! The agent loop for meshtalk.
//!
//! One round runs as follows:
//!
//! 1. **Receive** a user message
//! 2. **Build the request** (system prompt + model-visible history + tool schemas)
//! 3. **Stream** the reply through a `StreamSession`, rendering text as it arrives
//! 4. **If tool calls**: resolve each in order through the `ToolExecutor`
//!    (suspending on approvals), append the results, and go back to step 2
//! 5. **Otherwise**: freeze the assistant text into the conversation
//!
//! The transitions live in the pure `Coordinator`; `AgentLoop` performs the
//! effects and is polled by the front end.

pub mod coordinator;
pub mod events;
pub mod executor;
pub mod loop_runner;
pub mod request;
pub mod session;

pub use coordinator::{Coordinator, Effect, Event, Phase, RoundOutcome};
pub use events::AgentEvent;
pub use executor::{
    ApprovalDecision, ApprovalMode, ApprovalRequest, Approver, ChannelApprover, Preflight,
    Resumption, ToolExecutor,
};
pub use loop_runner::AgentLoop;
pub use request::RequestBuilder;
pub use session::{SessionPoll, StreamSession};
