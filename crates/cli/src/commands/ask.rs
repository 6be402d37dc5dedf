//! `meshtalk ask`: Single-message mode.
//!
//! There is nobody to answer an approval prompt, so calls that need one
//! resolve to an error result the model can read.

use std::time::Duration;

use meshtalk_agent::{AgentEvent, ApprovalMode};
use meshtalk_config::AppConfig;

use crate::render::Renderer;
use crate::runtime;

pub async fn run(config: AppConfig, message: String) -> Result<(), Box<dyn std::error::Error>> {
    let mut agent = runtime::build_agent(&config, ApprovalMode::Unavailable)?;
    let mut out = Renderer::new(std::io::stdout());
    let poll = Duration::from_millis(config.agent.poll_interval_ms);

    let mut failure = None;
    let mut events = agent.submit(message)?;
    loop {
        out.render_all(&events)?;
        if let Some(AgentEvent::Error { message }) = events.iter().find(|e| e.is_terminal()) {
            failure = Some(message.clone());
        }
        if agent.is_idle() {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(poll) => events = agent.tick(),
            _ = tokio::signal::ctrl_c() => events = agent.cancel(),
        }
    }
    out.line("")?;

    match failure {
        Some(message) => Err(message.into()),
        None => Ok(()),
    }
}
