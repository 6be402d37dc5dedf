//! Shell command policy.
//!
//! The deny list is substring based and forces a Deny. The safe list only
//! affects how an approval prompt is framed; it never auto-approves.

use serde::{Deserialize, Serialize};

/// How a command is presented when the user is asked to approve it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandFraming {
    /// The base executable is on the known-safe list.
    KnownSafe,
    /// Anything else.
    Unreviewed,
}

impl std::fmt::Display for CommandFraming {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::KnownSafe => f.write_str("known-safe"),
            Self::Unreviewed => f.write_str("unreviewed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandVerdict {
    Denied { pattern: String },
    Framed(CommandFraming),
}

/// Deny substrings and known-safe executables.
#[derive(Debug, Clone, Default)]
pub struct CommandRules {
    pub denied: Vec<String>,
    pub safe: Vec<String>,
}

impl CommandRules {
    pub fn new(safe: Vec<String>, denied: Vec<String>) -> Self {
        Self { denied, safe }
    }

    pub fn evaluate(&self, command: &str) -> CommandVerdict {
        let squeezed = squeeze_whitespace(command);
        for pattern in &self.denied {
            let needle = squeeze_whitespace(pattern);
            if !needle.is_empty() && (command.contains(pattern.as_str()) || squeezed.contains(&needle)) {
                return CommandVerdict::Denied {
                    pattern: pattern.clone(),
                };
            }
        }

        let framing = match base_executable(command) {
            Some(exe) if self.safe.iter().any(|s| s == exe) && !has_chaining(command) => {
                CommandFraming::KnownSafe
            }
            _ => CommandFraming::Unreviewed,
        };
        CommandVerdict::Framed(framing)
    }
}

/// Extract the executable name from a shell command line.
///
/// Leading `VAR=value` assignments are skipped and any directory part is
/// stripped, so `FOO=1 /usr/bin/ls -la` yields `ls`.
pub fn base_executable(command: &str) -> Option<&str> {
    command
        .split_whitespace()
        .find(|token| !is_env_assignment(token))
        .map(|token| token.rsplit('/').next().unwrap_or(token))
        .filter(|exe| !exe.is_empty())
}

fn is_env_assignment(token: &str) -> bool {
    match token.split_once('=') {
        Some((name, _)) => {
            !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    }
}

/// Pipes, sequencing and substitution mean the base executable does not
/// describe the whole command.
fn has_chaining(command: &str) -> bool {
    ["|", ";", "&&", "||", "`", "$(", ">", "<"]
        .iter()
        .any(|op| command.contains(op))
}

fn squeeze_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
