//! The permission engine: decides Deny / Ask / Allow for a tool call.
//!
//! Base decision, first match wins:
//! 1. session grant → Allow
//! 2. per-tool override → that level
//! 3. `requires_approval` → at most Ask (applied on top of 2)
//! 4. configured default
//!
//! Category refinements then apply. Filesystem tools are checked against
//! the path lists, the process tool against the command lists. A deny
//! pattern always wins, even over a session grant.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use meshtalk_config::PermissionsConfig;
use meshtalk_core::{PermissionLevel, ToolCategory, ToolSpec};
use serde_json::Value;

use crate::audit::{AuditEvent, AuditLogger, AuditOutcome};
use crate::command::{CommandFraming, CommandRules, CommandVerdict};
use crate::path::{PathRules, PathVerdict, normalize};

/// Which rule produced the base decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionSource {
    SessionGrant,
    Override,
    RequiresApproval,
    Default,
}

/// A full decision with the context needed to explain it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub level: PermissionLevel,
    pub source: DecisionSource,
    /// Human-readable reason when a refinement changed the level
    pub reason: Option<String>,
    /// Prompt framing for shell commands
    pub framing: Option<CommandFraming>,
}

/// Pure decision logic plus the per-session grant set.
#[derive(Debug)]
pub struct PermissionEngine {
    overrides: HashMap<String, PermissionLevel>,
    default_requires_approval: bool,
    paths: PathRules,
    commands: CommandRules,
    working_dir: PathBuf,
    grants: RwLock<HashSet<String>>,
    audit: Option<Arc<AuditLogger>>,
}

impl PermissionEngine {
    /// Build an engine from configuration. Relative path arguments resolve
    /// against `working_dir`.
    pub fn from_config(config: &PermissionsConfig, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            overrides: config.tools.clone(),
            default_requires_approval: config.default_requires_approval,
            paths: PathRules::new(config.allowed_paths.clone(), config.denied_paths.clone()),
            commands: CommandRules::new(
                config.allowed_commands.clone(),
                config.denied_commands.clone(),
            ),
            working_dir: working_dir.into(),
            grants: RwLock::new(HashSet::new()),
            audit: None,
        }
    }

    /// Record every decision and grant change in an audit log.
    pub fn with_audit(mut self, audit: Arc<AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// The decision level for a call.
    pub fn check(&self, tool: &ToolSpec, args: &Value) -> PermissionLevel {
        self.evaluate(tool, args).level
    }

    /// Evaluate a call, returning the decision with its explanation.
    pub fn evaluate(&self, tool: &ToolSpec, args: &Value) -> Decision {
        let mut decision = self.base_decision(tool);

        match tool.category {
            ToolCategory::Filesystem => self.refine_path(tool, args, &mut decision),
            ToolCategory::Process => self.refine_command(tool, args, &mut decision),
            _ => {}
        }

        tracing::debug!(
            tool = %tool.name,
            decision = %decision.level,
            source = ?decision.source,
            "Permission check"
        );
        if let Some(audit) = &self.audit {
            audit.log(
                AuditEvent::PermissionCheck {
                    decision: decision.level,
                },
                &tool.name,
                decision.level.into(),
                decision.reason.clone(),
            );
        }
        decision
    }

    fn base_decision(&self, tool: &ToolSpec) -> Decision {
        let (level, source) = if self.has_grant(&tool.name) {
            (PermissionLevel::Allow, DecisionSource::SessionGrant)
        } else if let Some(level) = self.overrides.get(&tool.name) {
            if tool.requires_approval && *level == PermissionLevel::Allow {
                (PermissionLevel::Ask, DecisionSource::RequiresApproval)
            } else {
                (*level, DecisionSource::Override)
            }
        } else if tool.requires_approval {
            (PermissionLevel::Ask, DecisionSource::RequiresApproval)
        } else if self.default_requires_approval {
            (PermissionLevel::Ask, DecisionSource::Default)
        } else {
            (PermissionLevel::Allow, DecisionSource::Default)
        };

        Decision {
            level,
            source,
            reason: None,
            framing: None,
        }
    }

    fn refine_path(&self, tool: &ToolSpec, args: &Value, decision: &mut Decision) {
        // An omitted path means the working directory, as in list_directory.
        let raw = match args.get("path") {
            None | Some(Value::Null) => ".",
            Some(value) => match value.as_str() {
                Some(raw) => raw,
                None => return,
            },
        };
        let Ok(path) = normalize(raw, &self.working_dir) else {
            return;
        };

        match self.paths.evaluate(&path, &self.working_dir) {
            PathVerdict::Denied { pattern } => {
                decision.level = PermissionLevel::Deny;
                decision.reason = Some(format!(
                    "path '{}' matches denied pattern '{pattern}'",
                    path.display()
                ));
                if let Some(audit) = &self.audit {
                    audit.log(
                        AuditEvent::PathDenied {
                            path: path.display().to_string(),
                        },
                        &tool.name,
                        AuditOutcome::Denied,
                        Some(pattern),
                    );
                }
            }
            PathVerdict::Allowed => {
                if decision.source == DecisionSource::Default {
                    decision.level = PermissionLevel::Allow;
                }
            }
            PathVerdict::OutsideAllowList => {
                if decision.level == PermissionLevel::Allow {
                    decision.reason = Some(format!(
                        "path '{}' is outside the allowed paths",
                        path.display()
                    ));
                }
                decision.level = decision.level.tighten(PermissionLevel::Ask);
            }
            PathVerdict::Unrestricted => {}
        }
    }

    fn refine_command(&self, tool: &ToolSpec, args: &Value, decision: &mut Decision) {
        let Some(command) = args.get("command").and_then(Value::as_str) else {
            return;
        };

        match self.commands.evaluate(command) {
            CommandVerdict::Denied { pattern } => {
                decision.level = PermissionLevel::Deny;
                decision.reason = Some(format!("command matches denied pattern '{pattern}'"));
                if let Some(audit) = &self.audit {
                    audit.log(
                        AuditEvent::CommandDenied {
                            command: command.to_string(),
                        },
                        &tool.name,
                        AuditOutcome::Denied,
                        Some(pattern),
                    );
                }
            }
            CommandVerdict::Framed(framing) => decision.framing = Some(framing),
        }
    }

    /// Remember an approval for the rest of the process lifetime.
    pub fn grant_for_session(&self, tool_name: &str) {
        let added = self.write_grants().insert(tool_name.to_string());
        if added {
            tracing::info!(tool = %tool_name, "Session grant added");
            if let Some(audit) = &self.audit {
                audit.log(AuditEvent::GrantAdded, tool_name, AuditOutcome::Allowed, None);
            }
        }
    }

    /// Remove a session grant. Returns whether one existed.
    pub fn revoke(&self, tool_name: &str) -> bool {
        let removed = self.write_grants().remove(tool_name);
        if removed {
            tracing::info!(tool = %tool_name, "Session grant revoked");
            if let Some(audit) = &self.audit {
                audit.log(AuditEvent::GrantRevoked, tool_name, AuditOutcome::Denied, None);
            }
        }
        removed
    }

    /// Drop every session grant.
    pub fn clear_grants(&self) {
        let mut grants = self.write_grants();
        if !grants.is_empty() {
            tracing::info!(count = grants.len(), "Session grants cleared");
        }
        grants.clear();
    }

    pub fn has_grant(&self, tool_name: &str) -> bool {
        self.grants
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(tool_name)
    }

    /// Current grants, sorted by name.
    pub fn grants(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .grants
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn write_grants(&self) -> std::sync::RwLockWriteGuard<'_, HashSet<String>> {
        self.grants.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn read_file() -> ToolSpec {
        ToolSpec::new("read_file", "Read a file", ToolCategory::Filesystem, json!({}))
            .requiring_approval()
    }

    fn list_dir() -> ToolSpec {
        ToolSpec::new("list_directory", "List", ToolCategory::Filesystem, json!({}))
    }

    fn shell() -> ToolSpec {
        ToolSpec::new("execute_command", "Run", ToolCategory::Process, json!({}))
            .requiring_approval()
    }

    fn system_info() -> ToolSpec {
        ToolSpec::new("system_info", "Info", ToolCategory::System, json!({}))
    }

    fn engine(config: PermissionsConfig) -> PermissionEngine {
        PermissionEngine::from_config(&config, "/work")
    }

    #[test]
    fn default_is_ask() {
        let e = engine(PermissionsConfig::default());
        assert_eq!(e.check(&system_info(), &json!({})), PermissionLevel::Ask);
    }

    #[test]
    fn default_can_be_relaxed() {
        let e = engine(PermissionsConfig {
            default_requires_approval: false,
            ..PermissionsConfig::default()
        });
        assert_eq!(e.check(&system_info(), &json!({})), PermissionLevel::Allow);
    }

    #[test]
    fn override_applies() {
        let mut config = PermissionsConfig::default();
        config.tools.insert("system_info".into(), PermissionLevel::Deny);
        assert_eq!(engine(config).check(&system_info(), &json!({})), PermissionLevel::Deny);
    }

    #[test]
    fn requires_approval_beats_allow_override() {
        let mut config = PermissionsConfig::default();
        config.tools.insert("execute_command".into(), PermissionLevel::Allow);
        config.tools.insert("read_file".into(), PermissionLevel::Allow);
        config.allowed_paths = vec!["/work".into()];
        let e = engine(config);
        assert_eq!(e.check(&shell(), &json!({"command": "ls"})), PermissionLevel::Ask);
        assert_eq!(
            e.check(&read_file(), &json!({"path": "/work/a.txt"})),
            PermissionLevel::Ask
        );
    }

    #[test]
    fn session_grant_allows_and_revoke_restores() {
        let e = engine(PermissionsConfig::default());
        e.grant_for_session("read_file");
        assert_eq!(
            e.check(&read_file(), &json!({"path": "/work/a.txt"})),
            PermissionLevel::Allow
        );
        assert!(e.revoke("read_file"));
        assert!(!e.revoke("read_file"));
        assert_eq!(
            e.check(&read_file(), &json!({"path": "/work/a.txt"})),
            PermissionLevel::Ask
        );
    }

    #[test]
    fn shadow_read_asks_without_extra_rules() {
        let config = PermissionsConfig {
            denied_paths: Vec::new(),
            ..PermissionsConfig::default()
        };
        assert_eq!(
            engine(config).check(&read_file(), &json!({"path": "/etc/shadow"})),
            PermissionLevel::Ask
        );
    }

    #[test]
    fn denied_path_beats_everything() {
        let mut config = PermissionsConfig::default();
        config.allowed_paths = vec!["/etc".into()];
        config.tools.insert("list_directory".into(), PermissionLevel::Allow);
        let e = engine(config);
        e.grant_for_session("list_directory");

        let decision = e.evaluate(&list_dir(), &json!({"path": "/etc/shadow"}));
        assert_eq!(decision.level, PermissionLevel::Deny);
        assert!(decision.reason.unwrap().contains("/etc/shadow"));
    }

    #[test]
    fn relative_traversal_into_denied_path_is_denied() {
        let e = engine(PermissionsConfig::default());
        assert_eq!(
            e.check(&list_dir(), &json!({"path": "../etc/shadow"})),
            PermissionLevel::Deny
        );
    }

    #[test]
    fn allow_list_upgrades_only_default_decisions() {
        let config = PermissionsConfig {
            allowed_paths: vec!["/work".into()],
            ..PermissionsConfig::default()
        };
        let e = engine(config);
        assert_eq!(
            e.check(&list_dir(), &json!({"path": "src"})),
            PermissionLevel::Allow
        );
        // requires_approval is never upgraded
        assert_eq!(
            e.check(&read_file(), &json!({"path": "src/main.rs"})),
            PermissionLevel::Ask
        );
    }

    #[test]
    fn omitted_path_is_judged_as_the_working_directory() {
        let config = PermissionsConfig {
            allowed_paths: vec!["/srv/allowed".into()],
            default_requires_approval: false,
            ..PermissionsConfig::default()
        };
        let e = PermissionEngine::from_config(&config, "/home/user/project");
        let explicit = e.check(&list_dir(), &json!({"path": "."}));
        assert_eq!(explicit, PermissionLevel::Ask);
        assert_eq!(e.check(&list_dir(), &json!({})), explicit);
        assert_eq!(e.check(&list_dir(), &json!({"path": null})), explicit);

        let inside = PermissionEngine::from_config(&config, "/srv/allowed/repo");
        assert_eq!(inside.check(&list_dir(), &json!({})), PermissionLevel::Allow);
    }

    #[test]
    fn omitted_path_inside_denied_working_directory_is_denied() {
        let config = PermissionsConfig {
            denied_paths: vec!["/secrets".into()],
            ..PermissionsConfig::default()
        };
        let e = PermissionEngine::from_config(&config, "/secrets/vault");
        assert_eq!(e.check(&list_dir(), &json!({})), PermissionLevel::Deny);
    }

    #[test]
    fn outside_allow_list_caps_at_ask() {
        let config = PermissionsConfig {
            allowed_paths: vec!["/work".into()],
            default_requires_approval: false,
            ..PermissionsConfig::default()
        };
        let e = engine(config);
        assert_eq!(
            e.check(&list_dir(), &json!({"path": "/tmp"})),
            PermissionLevel::Ask
        );
    }

    #[test]
    fn denied_command_is_denied_even_with_grant() {
        let e = engine(PermissionsConfig::default());
        e.grant_for_session("execute_command");
        assert_eq!(
            e.check(&shell(), &json!({"command": "rm -rf /"})),
            PermissionLevel::Deny
        );
    }

    #[test]
    fn safe_command_is_framed_but_still_asks() {
        let e = engine(PermissionsConfig::default());
        let safe = e.evaluate(&shell(), &json!({"command": "ls -la"}));
        assert_eq!(safe.level, PermissionLevel::Ask);
        assert_eq!(safe.framing, Some(CommandFraming::KnownSafe));

        let unknown = e.evaluate(&shell(), &json!({"command": "python3 x.py"}));
        assert_eq!(unknown.level, PermissionLevel::Ask);
        assert_eq!(unknown.framing, Some(CommandFraming::Unreviewed));
    }

    #[test]
    fn check_is_total_and_deterministic() {
        let e = engine(PermissionsConfig::default());
        let tools = [read_file(), list_dir(), shell(), system_info()];
        let args = [
            json!({}),
            json!({"path": 42}),
            json!({"path": ""}),
            json!({"path": "~/.ssh/id_rsa"}),
            json!({"command": ""}),
            json!(null),
        ];
        for tool in &tools {
            for a in &args {
                assert_eq!(e.check(tool, a), e.check(tool, a));
            }
        }
    }

    #[test]
    fn decisions_are_audited() {
        let audit = Arc::new(AuditLogger::new());
        let e = engine(PermissionsConfig::default()).with_audit(audit.clone());
        e.check(&shell(), &json!({"command": "mkfs /dev/sda"}));
        e.grant_for_session("system_info");

        let entries = audit.entries();
        assert!(entries
            .iter()
            .any(|en| matches!(en.event, AuditEvent::CommandDenied { .. })));
        assert!(entries.iter().any(|en| en.event == AuditEvent::GrantAdded));
    }

    #[test]
    fn grants_are_listed_sorted() {
        let e = engine(PermissionsConfig::default());
        e.grant_for_session("web_search");
        e.grant_for_session("fetch_url");
        assert_eq!(e.grants(), vec!["fetch_url", "web_search"]);
        e.clear_grants();
        assert!(e.grants().is_empty());
    }

    #[test]
    fn concurrent_grants_and_checks() {
        let e = Arc::new(engine(PermissionsConfig::default()));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let e = Arc::clone(&e);
                std::thread::spawn(move || {
                    let name = format!("tool_{i}");
                    e.grant_for_session(&name);
                    let _ = e.check(&system_info(), &json!({}));
                    e.revoke(&name);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(e.grants().is_empty());
    }
}
