//! Tools and the tool catalog.
//!
//! A tool is a catalog entry (`ToolSpec`: name, description, JSON schema,
//! category, approval flag) paired with an executable `ToolHandler`. The
//! catalog is shared between start-up registration and an in-flight agent
//! loop, so it is internally synchronized.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::ToolError;
use crate::provider::ToolDefinition;

/// A model-issued request to invoke a named tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Opaque unique id (matches the provider's tool call id)
    pub id: String,

    /// Name of the tool to execute
    pub name: String,

    /// Arguments as untyped JSON
    pub arguments: serde_json::Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    /// String argument lookup, `None` when absent or not a string.
    pub fn str_arg(&self, key: &str) -> Option<&str> {
        self.arguments.get(key).and_then(|v| v.as_str())
    }
}

/// The terminal outcome of resolving one tool call.
///
/// Exactly one result exists per call: denials, timeouts and handler
/// failures are all encoded here with `is_error` set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// The call ID this result is for
    pub tool_call_id: String,

    /// The output content (or the error text)
    pub content: String,

    /// Whether the call failed
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
            is_error: true,
        }
    }
}

/// Cap `text` at `max_bytes`, cutting on a char boundary and noting how
/// much was dropped.
pub fn truncate_output(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut cut = max_bytes;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!(
        "{}\n[output truncated: {} of {} bytes omitted]",
        &text[..cut],
        text.len() - cut,
        text.len()
    )
}

/// The side-effect class a tool is confined to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    Filesystem,
    Process,
    Web,
    Mesh,
    System,
}

impl std::fmt::Display for ToolCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Filesystem => "filesystem",
            Self::Process => "process",
            Self::Web => "web",
            Self::Mesh => "mesh",
            Self::System => "system",
        };
        f.write_str(name)
    }
}

/// A permission decision. Ordered from most to least restrictive, so
/// `min` tightens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    Deny,
    Ask,
    Allow,
}

impl PermissionLevel {
    /// Combine with another decision, keeping the stricter one.
    pub fn tighten(self, other: PermissionLevel) -> PermissionLevel {
        self.min(other)
    }
}

impl std::fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Deny => "deny",
            Self::Ask => "ask",
            Self::Allow => "allow",
        };
        f.write_str(name)
    }
}

/// A catalog entry describing a tool to the model and to the permission engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Unique key
    pub name: String,

    /// Description sent to the model
    pub description: String,

    /// JSON Schema of the arguments
    pub parameters: serde_json::Value,

    pub category: ToolCategory,

    /// Approval-required tools are never silently auto-approved the first time.
    #[serde(default)]
    pub requires_approval: bool,
}

impl ToolSpec {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        category: ToolCategory,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            category,
            requires_approval: false,
        }
    }

    pub fn requiring_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }

    /// Convert into a ToolDefinition for sending to the model.
    pub fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
        }
    }
}

/// Ambient state handed to every handler invocation.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Fired when the round is cancelled or the deadline expires.
    pub cancel: CancellationToken,

    /// Base directory for relative paths and spawned processes.
    pub working_dir: PathBuf,
}

impl ToolContext {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            cancel: CancellationToken::new(),
            working_dir: working_dir.into(),
        }
    }

    /// Resolve an argument path exactly as the permission engine does:
    /// `~` expands, relative paths join the working directory, `..` folds.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, ToolError> {
        crate::path::normalize(path, &self.working_dir)
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))
    }
}

impl Default for ToolContext {
    fn default() -> Self {
        Self::new(std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }
}

/// The executable half of a tool.
///
/// Handlers must stay within the side effects of their declared category.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Run the tool and return its textual output.
    async fn call(&self, ctx: &ToolContext, arguments: serde_json::Value) -> Result<String, ToolError>;
}

/// A spec plus its handler, as stored in the catalog.
#[derive(Clone)]
pub struct CatalogEntry {
    pub spec: ToolSpec,
    pub handler: Arc<dyn ToolHandler>,
}

impl std::fmt::Debug for CatalogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogEntry")
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

/// Maps tool names to their spec and handler.
///
/// Registration never fails and the last registration for a name wins,
/// while listing keeps first-registration order.
#[derive(Default)]
pub struct ToolCatalog {
    tools: RwLock<IndexMap<String, CatalogEntry>>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Replaces any existing entry with the same name in place.
    pub fn register(&self, spec: ToolSpec, handler: Arc<dyn ToolHandler>) {
        let name = spec.name.clone();
        let mut tools = self.tools.write().unwrap_or_else(PoisonError::into_inner);
        if tools.insert(name.clone(), CatalogEntry { spec, handler }).is_some() {
            tracing::debug!(tool = %name, "Replaced existing tool registration");
        }
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<CatalogEntry> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// All specs in first-registration order.
    pub fn all(&self) -> Vec<ToolSpec> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|e| e.spec.clone())
            .collect()
    }

    /// Specs grouped by category, each group in registration order.
    pub fn by_category(&self) -> BTreeMap<ToolCategory, Vec<ToolSpec>> {
        let mut groups: BTreeMap<ToolCategory, Vec<ToolSpec>> = BTreeMap::new();
        for spec in self.all() {
            groups.entry(spec.category).or_default().push(spec);
        }
        groups
    }

    /// Tool definitions for the provider request.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.all().iter().map(ToolSpec::to_definition).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl ToolHandler for EchoTool {
        async fn call(&self, _ctx: &ToolContext, arguments: serde_json::Value) -> Result<String, ToolError> {
            Ok(arguments["text"].as_str().unwrap_or("").to_string())
        }
    }

    struct Shout;

    #[async_trait]
    impl ToolHandler for Shout {
        async fn call(&self, _ctx: &ToolContext, arguments: serde_json::Value) -> Result<String, ToolError> {
            Ok(arguments["text"].as_str().unwrap_or("").to_uppercase())
        }
    }

    fn spec(name: &str, category: ToolCategory) -> ToolSpec {
        ToolSpec::new(
            name,
            "test tool",
            category,
            serde_json::json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            }),
        )
    }

    #[test]
    fn register_and_lookup() {
        let catalog = ToolCatalog::new();
        catalog.register(spec("echo", ToolCategory::System), Arc::new(EchoTool));
        assert!(catalog.get("echo").is_some());
        assert!(catalog.get("nonexistent").is_none());
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn listing_keeps_first_registration_order() {
        let catalog = ToolCatalog::new();
        catalog.register(spec("b", ToolCategory::Web), Arc::new(EchoTool));
        catalog.register(spec("a", ToolCategory::System), Arc::new(EchoTool));
        catalog.register(spec("c", ToolCategory::Web), Arc::new(EchoTool));
        // Re-registering "b" replaces it without moving it.
        catalog.register(spec("b", ToolCategory::Mesh), Arc::new(Shout));

        let names: Vec<_> = catalog.all().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["b", "a", "c"]);
        assert_eq!(catalog.get("b").unwrap().spec.category, ToolCategory::Mesh);
    }

    #[tokio::test]
    async fn last_registration_wins() {
        let catalog = ToolCatalog::new();
        catalog.register(spec("say", ToolCategory::System), Arc::new(EchoTool));
        catalog.register(spec("say", ToolCategory::System), Arc::new(Shout));

        let entry = catalog.get("say").unwrap();
        let out = entry
            .handler
            .call(&ToolContext::default(), serde_json::json!({"text": "hi"}))
            .await
            .unwrap();
        assert_eq!(out, "HI");
    }

    #[test]
    fn by_category_groups() {
        let catalog = ToolCatalog::new();
        catalog.register(spec("read_file", ToolCategory::Filesystem), Arc::new(EchoTool));
        catalog.register(spec("web_search", ToolCategory::Web), Arc::new(EchoTool));
        catalog.register(spec("write_file", ToolCategory::Filesystem), Arc::new(EchoTool));

        let groups = catalog.by_category();
        let fs: Vec<_> = groups[&ToolCategory::Filesystem].iter().map(|s| s.name.as_str()).collect();
        assert_eq!(fs, vec!["read_file", "write_file"]);
        assert_eq!(groups[&ToolCategory::Web].len(), 1);
        assert!(!groups.contains_key(&ToolCategory::Mesh));
    }

    #[test]
    fn concurrent_register_and_lookup() {
        let catalog = Arc::new(ToolCatalog::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let catalog = Arc::clone(&catalog);
                std::thread::spawn(move || {
                    catalog.register(spec(&format!("tool_{i}"), ToolCategory::System), Arc::new(EchoTool));
                    let _ = catalog.definitions();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(catalog.len(), 8);
    }

    #[test]
    fn permission_levels_tighten() {
        assert_eq!(PermissionLevel::Allow.tighten(PermissionLevel::Ask), PermissionLevel::Ask);
        assert_eq!(PermissionLevel::Ask.tighten(PermissionLevel::Deny), PermissionLevel::Deny);
        assert_eq!(PermissionLevel::Ask.tighten(PermissionLevel::Allow), PermissionLevel::Ask);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_output("short", 10), "short");
        let out = truncate_output("héllo", 2);
        assert!(out.starts_with("h\n"));
        assert!(out.contains("5 of 6 bytes omitted"));
    }

    #[test]
    fn context_resolves_relative_paths() {
        let ctx = ToolContext::new("/work");
        assert_eq!(ctx.resolve("src/main.rs").unwrap(), PathBuf::from("/work/src/main.rs"));
        assert_eq!(ctx.resolve("/etc/hosts").unwrap(), PathBuf::from("/etc/hosts"));
        assert!(matches!(ctx.resolve(""), Err(ToolError::InvalidArguments(_))));
    }

    #[test]
    fn context_resolves_like_the_permission_policy() {
        let ctx = ToolContext::new("/work/project");
        for raw in ["~", "~/notes.txt", "../../etc/passwd", "./a/../b", "/srv/./x"] {
            assert_eq!(
                ctx.resolve(raw).unwrap(),
                crate::path::normalize(raw, &ctx.working_dir).unwrap(),
                "{raw}"
            );
        }
        assert_eq!(ctx.resolve("../../etc/passwd").unwrap(), PathBuf::from("/etc/passwd"));
        if std::env::var_os("HOME").is_some() {
            assert_ne!(ctx.resolve("~").unwrap(), ctx.working_dir.join("~"));
        }
    }
}
