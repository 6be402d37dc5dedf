//! The tool executor: resolves every tool call to exactly one result.
//!
//! Resolution happens in two halves so an interactive front end never
//! blocks on a human:
//!
//! 1. `preflight` looks the tool up and asks the permission engine. An Ask
//!    decision parks the call, keyed by its id, and hands back an
//!    `ApprovalRequest`.
//! 2. `resume` takes the parked call when the decision arrives, and `run`
//!    invokes the handler under a deadline.
//!
//! `execute` and `execute_all` chain both halves for callers that can
//! await an `Approver`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use meshtalk_core::error::ToolError;
use meshtalk_core::event::{DomainEvent, EventBus};
use meshtalk_core::tool::{
    PermissionLevel, ToolCall, ToolCatalog, ToolContext, ToolResult, ToolSpec, truncate_output,
};
use meshtalk_security::{AuditEvent, AuditLogger, AuditOutcome, CommandFraming, PermissionEngine};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DENIED_BY_USER: &str = "Tool execution denied by user";
pub const NO_APPROVAL_HANDLER: &str =
    "Tool execution requires approval but no approval handler is configured";
pub const SKIPPED_AFTER_DENIAL: &str =
    "Tool call skipped: an earlier call in this turn was denied by user";
pub const CANCELLED_BY_USER: &str = "Tool call cancelled by user";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 32 * 1024;

/// A call waiting on a human decision.
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalRequest {
    pub call: ToolCall,
    pub spec: ToolSpec,
    /// Prompt framing for shell commands
    pub framing: Option<CommandFraming>,
    /// Why the engine asked, when a refinement tightened the decision
    pub reason: Option<String>,
}

/// The user's answer to an `ApprovalRequest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ApprovalDecision {
    pub approved: bool,
    /// Also grant the tool for the rest of the session
    pub for_session: bool,
}

impl ApprovalDecision {
    pub fn approve() -> Self {
        Self {
            approved: true,
            for_session: false,
        }
    }

    pub fn approve_for_session() -> Self {
        Self {
            approved: true,
            for_session: true,
        }
    }

    pub fn deny() -> Self {
        Self::default()
    }
}

/// Something that can answer approval requests asynchronously.
#[async_trait]
pub trait Approver: Send + Sync {
    async fn approve(&self, request: ApprovalRequest) -> ApprovalDecision;
}

/// Forwards approval requests over a channel and waits for the reply.
///
/// If the receiving side goes away the call is denied.
pub struct ChannelApprover {
    tx: mpsc::Sender<(ApprovalRequest, oneshot::Sender<ApprovalDecision>)>,
}

impl ChannelApprover {
    pub fn new(
        capacity: usize,
    ) -> (
        Self,
        mpsc::Receiver<(ApprovalRequest, oneshot::Sender<ApprovalDecision>)>,
    ) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Approver for ChannelApprover {
    async fn approve(&self, request: ApprovalRequest) -> ApprovalDecision {
        let (reply, answer) = oneshot::channel();
        if self.tx.send((request, reply)).await.is_err() {
            return ApprovalDecision::deny();
        }
        answer.await.unwrap_or_default()
    }
}

/// How Ask decisions are answered.
#[derive(Clone, Default)]
pub enum ApprovalMode {
    /// No approval channel: Ask resolves to an error result.
    #[default]
    Unavailable,
    /// Park the call and wait for `resume` (interactive loops).
    Deferred,
    /// Await an approver inline (`execute` and `execute_all`).
    Callback(Arc<dyn Approver>),
}

impl std::fmt::Debug for ApprovalMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable => f.write_str("Unavailable"),
            Self::Deferred => f.write_str("Deferred"),
            Self::Callback(_) => f.write_str("Callback"),
        }
    }
}

/// Outcome of the first half of resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum Preflight {
    /// Allowed; run it.
    Ready(ToolCall),
    /// Parked until `resume` is called with the same call id.
    NeedsApproval(ApprovalRequest),
    /// Resolved without running the handler (unknown tool, policy denial,
    /// no approval channel).
    Resolved(ToolResult),
}

/// Outcome of resuming a parked call.
#[derive(Debug, Clone, PartialEq)]
pub enum Resumption {
    Approved(ToolCall),
    Denied(ToolResult),
}

pub struct ToolExecutor {
    catalog: Arc<ToolCatalog>,
    permissions: Arc<PermissionEngine>,
    approval: ApprovalMode,
    timeout: Duration,
    max_output_bytes: usize,
    parked: Mutex<HashMap<String, ApprovalRequest>>,
    event_bus: Option<Arc<EventBus>>,
    audit: Option<Arc<AuditLogger>>,
}

impl ToolExecutor {
    pub fn new(catalog: Arc<ToolCatalog>, permissions: Arc<PermissionEngine>) -> Self {
        Self {
            catalog,
            permissions,
            approval: ApprovalMode::Unavailable,
            timeout: DEFAULT_TIMEOUT,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            parked: Mutex::new(HashMap::new()),
            event_bus: None,
            audit: None,
        }
    }

    pub fn with_approval(mut self, approval: ApprovalMode) -> Self {
        self.approval = approval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_output_bytes(mut self, max: usize) -> Self {
        self.max_output_bytes = max;
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn with_audit(mut self, audit: Arc<AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn permissions(&self) -> &Arc<PermissionEngine> {
        &self.permissions
    }

    pub fn catalog(&self) -> &Arc<ToolCatalog> {
        &self.catalog
    }

    fn publish(&self, event: DomainEvent) {
        if let Some(bus) = &self.event_bus {
            bus.publish(event);
        }
    }

    fn parked(&self) -> std::sync::MutexGuard<'_, HashMap<String, ApprovalRequest>> {
        self.parked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look the tool up and decide whether it may run.
    pub fn preflight(&self, call: &ToolCall) -> Preflight {
        let Some(entry) = self.catalog.get(&call.name) else {
            warn!(tool = %call.name, call_id = %call.id, "Model called an unknown tool");
            return Preflight::Resolved(ToolResult::error(
                &call.id,
                format!("Unknown tool: {}", call.name),
            ));
        };

        let decision = self.permissions.evaluate(&entry.spec, &call.arguments);
        self.publish(DomainEvent::PermissionChecked {
            tool_name: call.name.clone(),
            decision: decision.level,
            timestamp: Utc::now(),
        });

        match decision.level {
            PermissionLevel::Allow => Preflight::Ready(call.clone()),
            PermissionLevel::Deny => {
                let reason = decision
                    .reason
                    .unwrap_or_else(|| "the tool is disabled by configuration".into());
                Preflight::Resolved(ToolResult::error(
                    &call.id,
                    format!("Tool execution denied by policy: {reason}"),
                ))
            }
            PermissionLevel::Ask => {
                if matches!(self.approval, ApprovalMode::Unavailable) {
                    debug!(tool = %call.name, "Ask decision with no approval channel");
                    return Preflight::Resolved(ToolResult::error(&call.id, NO_APPROVAL_HANDLER));
                }
                let request = ApprovalRequest {
                    call: call.clone(),
                    spec: entry.spec,
                    framing: decision.framing,
                    reason: decision.reason,
                };
                self.parked().insert(call.id.clone(), request.clone());
                debug!(tool = %call.name, call_id = %call.id, "Call parked for approval");
                Preflight::NeedsApproval(request)
            }
        }
    }

    /// Resume a parked call. `None` when no call with that id is parked.
    pub fn resume(&self, call_id: &str, decision: ApprovalDecision) -> Option<Resumption> {
        let request = self.parked().remove(call_id)?;
        let tool = &request.call.name;

        if let Some(audit) = &self.audit {
            audit.log(
                AuditEvent::ApprovalDecision {
                    approved: decision.approved,
                    for_session: decision.for_session,
                },
                tool,
                if decision.approved {
                    AuditOutcome::Allowed
                } else {
                    AuditOutcome::Denied
                },
                None,
            );
        }

        if !decision.approved {
            info!(tool = %tool, call_id = %call_id, "Tool call denied by user");
            return Some(Resumption::Denied(ToolResult::error(call_id, DENIED_BY_USER)));
        }
        if decision.for_session {
            self.permissions.grant_for_session(tool);
            self.publish(DomainEvent::SessionGrantChanged {
                tool_name: tool.clone(),
                granted: true,
                timestamp: Utc::now(),
            });
        }
        Some(Resumption::Approved(request.call))
    }

    /// Drop every parked call (the round was cancelled).
    pub fn discard_parked(&self) -> usize {
        let mut parked = self.parked();
        let n = parked.len();
        parked.clear();
        n
    }

    pub fn is_parked(&self, call_id: &str) -> bool {
        self.parked().contains_key(call_id)
    }

    /// Invoke the handler for an allowed call under the deadline.
    ///
    /// Expiry and handler errors both become error results. Output is
    /// truncated to the configured size.
    pub async fn run(&self, call: &ToolCall, ctx: &ToolContext) -> ToolResult {
        let Some(entry) = self.catalog.get(&call.name) else {
            return ToolResult::error(&call.id, format!("Unknown tool: {}", call.name));
        };

        debug!(tool = %call.name, call_id = %call.id, "Executing tool");
        let start = Instant::now();
        let outcome = tokio::select! {
            r = tokio::time::timeout(self.timeout, entry.handler.call(ctx, call.arguments.clone())) => {
                r.unwrap_or_else(|_| Err(ToolError::Timeout {
                    tool_name: call.name.clone(),
                    timeout_secs: self.timeout.as_secs(),
                }))
            }
            _ = ctx.cancel.cancelled() => Err(ToolError::Cancelled),
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(output) => ToolResult::success(&call.id, truncate_output(&output, self.max_output_bytes)),
            Err(e) => {
                warn!(tool = %call.name, error = %e, "Tool execution failed");
                ToolResult::error(&call.id, truncate_output(&e.to_string(), self.max_output_bytes))
            }
        };
        self.publish(DomainEvent::ToolExecuted {
            tool_name: call.name.clone(),
            is_error: result.is_error,
            duration_ms,
            timestamp: Utc::now(),
        });
        result
    }

    /// Resolve one call end to end. Never fails: every failure mode is an
    /// error result.
    pub async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolResult {
        self.execute_inner(call, ctx).await.0
    }

    /// Returns the result and whether the user denied it.
    async fn execute_inner(&self, call: &ToolCall, ctx: &ToolContext) -> (ToolResult, bool) {
        match self.preflight(call) {
            Preflight::Ready(call) => (self.run(&call, ctx).await, false),
            Preflight::Resolved(result) => (result, false),
            Preflight::NeedsApproval(request) => {
                let ApprovalMode::Callback(approver) = &self.approval else {
                    // Deferred mode cannot be awaited inline.
                    self.parked().remove(&call.id);
                    return (ToolResult::error(&call.id, NO_APPROVAL_HANDLER), false);
                };
                let decision = approver.approve(request).await;
                match self.resume(&call.id, decision) {
                    Some(Resumption::Approved(call)) => (self.run(&call, ctx).await, false),
                    Some(Resumption::Denied(result)) => (result, true),
                    None => (ToolResult::error(&call.id, DENIED_BY_USER), true),
                }
            }
        }
    }

    /// Resolve calls strictly in order, one result per call.
    ///
    /// Later calls may depend on earlier side effects, so nothing runs
    /// concurrently. Once the user denies a call, the remaining calls are
    /// skipped with an error result.
    pub async fn execute_all(&self, calls: &[ToolCall], ctx: &ToolContext) -> Vec<ToolResult> {
        let mut results = Vec::with_capacity(calls.len());
        let mut denied = false;
        for call in calls {
            if denied {
                results.push(ToolResult::error(&call.id, SKIPPED_AFTER_DENIAL));
                continue;
            }
            let (result, user_denied) = self.execute_inner(call, ctx).await;
            denied = user_denied;
            results.push(result);
        }
        results
    }
}

/// A token for a handler run, cancelled with the round.
pub fn handler_context(working_dir: &std::path::Path, round: &CancellationToken) -> ToolContext {
    ToolContext {
        cancel: round.child_token(),
        working_dir: working_dir.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use meshtalk_config::PermissionsConfig;
    use meshtalk_core::tool::{ToolCategory, ToolHandler};
    use serde_json::json;

    /// Records invocations; echoes `text`.
    struct Recorder {
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ToolHandler for Recorder {
        async fn call(&self, _ctx: &ToolContext, args: serde_json::Value) -> Result<String, ToolError> {
            let text = args["text"].as_str().unwrap_or_default().to_string();
            self.calls.lock().unwrap().push(text.clone());
            Ok(text)
        }
    }

    struct Sleeper;

    #[async_trait]
    impl ToolHandler for Sleeper {
        async fn call(&self, _ctx: &ToolContext, _args: serde_json::Value) -> Result<String, ToolError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok("late".into())
        }
    }

    struct Failing;

    #[async_trait]
    impl ToolHandler for Failing {
        async fn call(&self, _ctx: &ToolContext, _args: serde_json::Value) -> Result<String, ToolError> {
            Err(ToolError::failed("broken", "disk on fire"))
        }
    }

    struct Scripted {
        answers: Mutex<Vec<ApprovalDecision>>,
        asked: AtomicUsize,
    }

    #[async_trait]
    impl Approver for Scripted {
        async fn approve(&self, _request: ApprovalRequest) -> ApprovalDecision {
            self.asked.fetch_add(1, Ordering::SeqCst);
            self.answers.lock().unwrap().remove(0)
        }
    }

    fn spec(name: &str) -> ToolSpec {
        ToolSpec::new(name, "test", ToolCategory::System, json!({"type": "object"}))
    }

    fn permissive() -> PermissionsConfig {
        PermissionsConfig {
            default_requires_approval: false,
            ..PermissionsConfig::default()
        }
    }

    fn executor(config: PermissionsConfig) -> (ToolExecutor, Arc<Mutex<Vec<String>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let catalog = Arc::new(ToolCatalog::new());
        catalog.register(spec("echo"), Arc::new(Recorder { calls: calls.clone() }));
        catalog.register(
            spec("guarded").requiring_approval(),
            Arc::new(Recorder { calls: calls.clone() }),
        );
        catalog.register(spec("sleepy"), Arc::new(Sleeper));
        catalog.register(spec("broken"), Arc::new(Failing));
        let engine = Arc::new(PermissionEngine::from_config(&config, "/tmp"));
        (ToolExecutor::new(catalog, engine), calls)
    }

    fn call(id: &str, name: &str, text: &str) -> ToolCall {
        ToolCall::new(id, name, json!({"text": text}))
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error_result() {
        let (ex, _) = executor(permissive());
        let r = ex.execute(&call("1", "nope", ""), &ToolContext::default()).await;
        assert!(r.is_error);
        assert!(r.content.contains("nope"));
    }

    #[tokio::test]
    async fn allowed_call_runs() {
        let (ex, calls) = executor(permissive());
        let r = ex.execute(&call("1", "echo", "hi"), &ToolContext::default()).await;
        assert_eq!(r, ToolResult::success("1", "hi"));
        assert_eq!(*calls.lock().unwrap(), vec!["hi"]);
    }

    #[tokio::test]
    async fn policy_denial_never_invokes_handler() {
        let mut config = permissive();
        config.tools.insert("echo".into(), PermissionLevel::Deny);
        let (ex, calls) = executor(config);
        let r = ex.execute(&call("1", "echo", "hi"), &ToolContext::default()).await;
        assert!(r.is_error);
        assert!(r.content.contains("denied by policy"));
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn ask_without_channel_is_an_error() {
        let (ex, calls) = executor(permissive());
        let r = ex.execute(&call("1", "guarded", "x"), &ToolContext::default()).await;
        assert_eq!(r.content, NO_APPROVAL_HANDLER);
        assert!(calls.lock().unwrap().is_empty());
        assert!(!ex.is_parked("1"));
    }

    #[tokio::test]
    async fn deferred_approval_parks_and_resumes() {
        let (ex, _) = executor(permissive());
        let ex = ex.with_approval(ApprovalMode::Deferred);

        let Preflight::NeedsApproval(request) = ex.preflight(&call("c1", "guarded", "x")) else {
            panic!("expected approval request");
        };
        assert_eq!(request.call.id, "c1");
        assert!(ex.is_parked("c1"));

        match ex.resume("c1", ApprovalDecision::approve_for_session()) {
            Some(Resumption::Approved(c)) => assert_eq!(c.id, "c1"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!ex.is_parked("c1"));
        assert!(ex.permissions().has_grant("guarded"));
        assert!(ex.resume("c1", ApprovalDecision::approve()).is_none());

        // Granted for the session: no prompt the second time.
        assert!(matches!(ex.preflight(&call("c2", "guarded", "y")), Preflight::Ready(_)));
    }

    #[tokio::test]
    async fn deferred_denial_yields_user_denied_result() {
        let (ex, _) = executor(permissive());
        let ex = ex.with_approval(ApprovalMode::Deferred);
        ex.preflight(&call("c1", "guarded", "x"));
        assert_eq!(
            ex.resume("c1", ApprovalDecision::deny()),
            Some(Resumption::Denied(ToolResult::error("c1", DENIED_BY_USER)))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn handler_timeout_is_an_error_result() {
        let (ex, _) = executor(permissive());
        let ex = ex.with_timeout(Duration::from_secs(2));
        let r = ex.execute(&call("1", "sleepy", ""), &ToolContext::default()).await;
        assert!(r.is_error);
        assert!(r.content.contains("timed out"));
    }

    #[tokio::test]
    async fn cancelled_context_stops_handler() {
        let (ex, _) = executor(permissive());
        let ctx = ToolContext::default();
        ctx.cancel.cancel();
        let r = ex.execute(&call("1", "sleepy", ""), &ctx).await;
        assert!(r.is_error);
        assert!(r.content.contains("cancelled"));
    }

    #[tokio::test]
    async fn handler_error_text_is_carried() {
        let (ex, _) = executor(permissive());
        let r = ex.execute(&call("1", "broken", ""), &ToolContext::default()).await;
        assert!(r.is_error);
        assert!(r.content.contains("disk on fire"));
    }

    #[tokio::test]
    async fn output_is_truncated() {
        let (ex, _) = executor(permissive());
        let ex = ex.with_max_output_bytes(8);
        let r = ex
            .execute(&call("1", "echo", "0123456789abcdef"), &ToolContext::default())
            .await;
        assert!(r.content.starts_with("01234567"));
        assert!(r.content.contains("truncated"));
    }

    #[tokio::test]
    async fn execute_all_preserves_order_one_to_one() {
        let (ex, calls) = executor(permissive());
        let batch = vec![
            call("a", "echo", "first"),
            call("b", "broken", ""),
            call("c", "echo", "third"),
        ];
        let results = ex.execute_all(&batch, &ToolContext::default()).await;
        let ids: Vec<_> = results.iter().map(|r| r.tool_call_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(results[1].is_error);
        assert_eq!(*calls.lock().unwrap(), vec!["first", "third"]);
    }

    #[tokio::test]
    async fn user_denial_skips_rest_of_batch() {
        let (ex, calls) = executor(permissive());
        let approver = Arc::new(Scripted {
            answers: Mutex::new(vec![ApprovalDecision::approve(), ApprovalDecision::deny()]),
            asked: AtomicUsize::new(0),
        });
        let ex = ex.with_approval(ApprovalMode::Callback(approver.clone()));

        let batch = vec![
            call("a", "guarded", "one"),
            call("b", "guarded", "two"),
            call("c", "echo", "three"),
        ];
        let results = ex.execute_all(&batch, &ToolContext::default()).await;
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].content, "one");
        assert_eq!(results[1].content, DENIED_BY_USER);
        assert_eq!(results[2].content, SKIPPED_AFTER_DENIAL);
        assert_eq!(approver.asked.load(Ordering::SeqCst), 2);
        assert_eq!(*calls.lock().unwrap(), vec!["one"]);
    }

    #[tokio::test]
    async fn channel_approver_round_trip() {
        let (approver, mut rx) = ChannelApprover::new(1);
        let (ex, _) = executor(permissive());
        let ex = ex.with_approval(ApprovalMode::Callback(Arc::new(approver)));

        let answer = tokio::spawn(async move {
            let (request, reply) = rx.recv().await.unwrap();
            assert_eq!(request.spec.name, "guarded");
            reply.send(ApprovalDecision::approve()).unwrap();
        });
        let r = ex.execute(&call("1", "guarded", "ok"), &ToolContext::default()).await;
        answer.await.unwrap();
        assert_eq!(r, ToolResult::success("1", "ok"));
    }

    #[tokio::test]
    async fn dropped_approval_channel_denies() {
        let (approver, rx) = ChannelApprover::new(1);
        drop(rx);
        let decision = approver
            .approve(ApprovalRequest {
                call: call("1", "guarded", ""),
                spec: spec("guarded"),
                framing: None,
                reason: None,
            })
            .await;
        assert!(!decision.approved);
    }

    #[tokio::test]
    async fn executor_publishes_domain_events() {
        let bus = Arc::new(EventBus::new(16));
        let mut rx = bus.subscribe();
        let (ex, _) = executor(permissive());
        let ex = ex.with_event_bus(bus);
        ex.execute(&call("1", "echo", "x"), &ToolContext::default()).await;

        assert!(matches!(*rx.recv().await.unwrap(), DomainEvent::PermissionChecked { .. }));
        assert!(matches!(
            *rx.recv().await.unwrap(),
            DomainEvent::ToolExecuted { is_error: false, .. }
        ));
    }
}
