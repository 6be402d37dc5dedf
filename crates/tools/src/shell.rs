//! Shell tool: execute a command line through the system shell.
//!
//! The permission engine decides whether a command may run at all; this
//! handler only runs it, kills it on cancellation, and formats the output.

use async_trait::async_trait;
use meshtalk_core::error::ToolError;
use meshtalk_core::tool::{ToolCategory, ToolContext, ToolHandler, ToolSpec};
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::parse_args;

pub struct ExecuteCommandTool;

#[derive(Deserialize)]
struct CommandArgs {
    command: String,
    /// Overrides the context's working directory
    #[serde(default)]
    cwd: Option<String>,
}

impl ExecuteCommandTool {
    pub const NAME: &'static str = "execute_command";

    pub fn spec() -> ToolSpec {
        ToolSpec::new(
            Self::NAME,
            "Execute a shell command and return stdout/stderr. Use this for running programs, \
             inspecting the system, git operations, etc.",
            ToolCategory::Process,
            serde_json::json!({
                "type": "object",
                "properties": {
                    "command": {
                        "type": "string",
                        "description": "The shell command to execute"
                    },
                    "cwd": {
                        "type": "string",
                        "description": "Directory to run in (default: the working directory)"
                    }
                },
                "required": ["command"]
            }),
        )
        .requiring_approval()
    }
}

#[async_trait]
impl ToolHandler for ExecuteCommandTool {
    async fn call(&self, ctx: &ToolContext, arguments: serde_json::Value) -> Result<String, ToolError> {
        let args: CommandArgs = parse_args(arguments)?;
        if args.command.trim().is_empty() {
            return Err(ToolError::InvalidArguments("'command' must not be empty".into()));
        }
        let cwd = match &args.cwd {
            Some(dir) => ctx.resolve(dir)?,
            None => ctx.working_dir.clone(),
        };

        debug!(command = %args.command, cwd = %cwd.display(), "Executing shell command");

        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", &args.command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", &args.command]);
            c
        };
        cmd.current_dir(&cwd).kill_on_drop(true);

        // Dropping the output future on cancellation kills the child.
        let output = tokio::select! {
            out = cmd.output() => out.map_err(|e| ToolError::failed(Self::NAME, e))?,
            _ = ctx.cancel.cancelled() => return Err(ToolError::Cancelled),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if output.status.success() {
            let text = if stderr.trim().is_empty() {
                stdout.into_owned()
            } else {
                format!("{stdout}\n[stderr]: {stderr}")
            };
            Ok(text.trim().to_string())
        } else {
            let code = output.status.code().unwrap_or(-1);
            warn!(command = %args.command, exit_code = code, "Command failed");
            Err(ToolError::failed(
                Self::NAME,
                format!("[exit code: {code}]\n{}\n{}", stdout.trim(), stderr.trim())
                    .trim()
                    .to_string(),
            ))
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn execute_echo() {
        let out = ExecuteCommandTool
            .call(&ToolContext::default(), json!({"command": "echo hello"}))
            .await
            .unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn runs_in_context_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "").unwrap();
        let out = ExecuteCommandTool
            .call(&ToolContext::new(dir.path()), json!({"command": "ls"}))
            .await
            .unwrap();
        assert!(out.contains("marker.txt"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_an_error() {
        let err = ExecuteCommandTool
            .call(&ToolContext::default(), json!({"command": "echo oops >&2; exit 3"}))
            .await
            .unwrap_err();
        let text = err.to_string();
        assert!(text.contains("exit code: 3"));
        assert!(text.contains("oops"));
    }

    #[tokio::test]
    async fn stderr_is_reported_on_success() {
        let out = ExecuteCommandTool
            .call(&ToolContext::default(), json!({"command": "echo out; echo warn >&2"}))
            .await
            .unwrap();
        assert!(out.starts_with("out"));
        assert!(out.contains("[stderr]: warn"));
    }

    #[tokio::test]
    async fn cancellation_stops_the_process() {
        let ctx = ToolContext::default();
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            cancel.cancel();
        });
        let started = std::time::Instant::now();
        let err = ExecuteCommandTool
            .call(&ctx, json!({"command": "sleep 10"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Cancelled));
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }

    #[tokio::test]
    async fn empty_command_rejected() {
        let err = ExecuteCommandTool
            .call(&ToolContext::default(), json!({"command": "  "}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }
}
