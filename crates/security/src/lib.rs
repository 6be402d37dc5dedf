//! Security policy for meshtalk: the permission engine and its audit log.
//!
//! Provides:
//! - **Permissions**: Deny / Ask / Allow decisions with session grants
//! - **Path policy**: normalization and allow/deny pattern matching
//! - **Command policy**: deny substrings and known-safe executables
//! - **Audit logging**: a record of every decision

pub mod audit;
pub mod command;
pub mod path;
pub mod permission;

pub use audit::{AuditEntry, AuditEvent, AuditLogger, AuditOutcome, AuditSink, TracingSink};
pub use command::{CommandFraming, CommandRules, CommandVerdict, base_executable};
pub use path::{PathError, PathRules, PathVerdict, normalize};
pub use permission::{Decision, DecisionSource, PermissionEngine};
