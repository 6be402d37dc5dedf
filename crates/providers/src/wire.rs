//! Helpers shared by the wire encoders and decoders.

use meshtalk_core::message::{Message, Role};
use meshtalk_core::provider::ProviderRequest;
use serde_json::Value;

/// A fresh call id for back-ends that do not assign one.
pub fn synthesize_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

/// Arguments arrive as an object, as a JSON-encoded string, or not at all.
/// Anything that is neither an object nor decodable stays a string so the
/// handler reports it as invalid arguments.
pub fn normalize_arguments(raw: Value) -> Value {
    match raw {
        Value::Null => Value::Object(Default::default()),
        Value::String(s) => arguments_from_str(&s),
        other => other,
    }
}

/// Decode accumulated argument text.
pub fn arguments_from_str(s: &str) -> Value {
    if s.trim().is_empty() {
        return Value::Object(Default::default());
    }
    serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.to_string()))
}

/// Split the request into a system prompt and the remaining history.
///
/// System-role messages in the history are folded into the system prompt
/// for back-ends that carry it out of band.
pub fn split_system(request: &ProviderRequest) -> (Option<String>, Vec<&Message>) {
    let mut parts: Vec<&str> = Vec::new();
    if let Some(prompt) = request.system_prompt.as_deref().filter(|p| !p.is_empty()) {
        parts.push(prompt);
    }
    let mut rest = Vec::new();
    for message in &request.messages {
        match message.role {
            Role::System => parts.push(&message.content),
            _ => rest.push(message),
        }
    }
    let system = (!parts.is_empty()).then(|| parts.join("\n\n"));
    (system, rest)
}

/// Nanoseconds to whole milliseconds.
pub fn ns_to_ms(ns: u64) -> u64 {
    ns / 1_000_000
}
