//! `meshtalk chat`: Interactive session.
//!
//! One cooperative loop multiplexes three sources: stdin lines, a poll
//! tick that drives the agent, and Ctrl+C. While a call is waiting for
//! approval the next input line is read as the answer, except `/quit`
//! and `/cancel`, which still take effect.

use std::time::Duration;

use meshtalk_agent::{AgentLoop, ApprovalDecision, ApprovalMode};
use meshtalk_config::AppConfig;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::MissedTickBehavior;

use crate::render::Renderer;
use crate::runtime;

#[derive(Debug, PartialEq, Eq)]
enum Slash {
    Quit,
    Cancel,
    Grants,
    Revoke(String),
    Model(Option<String>),
    Help,
    Unknown(String),
}

fn parse_slash(line: &str) -> Option<Slash> {
    let rest = line.strip_prefix('/')?;
    let (cmd, arg) = match rest.split_once(char::is_whitespace) {
        Some((cmd, arg)) => (cmd, arg.trim()),
        None => (rest, ""),
    };
    let arg = (!arg.is_empty()).then(|| arg.to_string());
    Some(match cmd {
        "quit" | "exit" | "q" => Slash::Quit,
        "cancel" => Slash::Cancel,
        "grants" => Slash::Grants,
        "revoke" => match arg {
            Some(tool) => Slash::Revoke(tool),
            None => Slash::Unknown("usage: /revoke <tool>".into()),
        },
        "model" => Slash::Model(arg),
        "help" | "?" => Slash::Help,
        other => Slash::Unknown(format!("unknown command /{other} (try /help)")),
    })
}

/// `None` means the answer was not understood.
fn parse_answer(line: &str) -> Option<ApprovalDecision> {
    match line.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Some(ApprovalDecision::approve()),
        "n" | "no" | "" => Some(ApprovalDecision::deny()),
        "a" | "always" => Some(ApprovalDecision::approve_for_session()),
        _ => None,
    }
}

/// How a line typed during a pending approval is handled.
#[derive(Debug, PartialEq, Eq)]
enum ApprovalInput {
    /// `/quit` or `/cancel`, which always take effect.
    Command(Slash),
    Answer(ApprovalDecision),
    Unclear,
}

fn approval_input(line: &str) -> ApprovalInput {
    match parse_slash(line) {
        Some(slash @ (Slash::Quit | Slash::Cancel)) => ApprovalInput::Command(slash),
        _ => match parse_answer(line) {
            Some(decision) => ApprovalInput::Answer(decision),
            None => ApprovalInput::Unclear,
        },
    }
}

enum Flow {
    Continue,
    Quit,
}

pub async fn run(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let mut agent = runtime::build_agent(&config, ApprovalMode::Deferred)?;
    let mut out = Renderer::new(std::io::stdout());

    println!();
    println!("  meshtalk — interactive chat");
    println!();
    println!("  Provider:  {}", agent.provider().name());
    println!("  Model:     {}", agent.model().unwrap_or("(none, use /model <name>)"));
    println!("  Tools:     {}", agent.executor().catalog().len());
    println!();
    println!("  Type a message and press Enter. /help lists commands, Ctrl+C cancels.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut ticker = tokio::time::interval(Duration::from_millis(config.agent.poll_interval_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    out.prompt()?;
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                out.input_received();
                if let Flow::Quit = handle_line(&mut agent, &mut out, line.trim())? {
                    break;
                }
            }
            _ = ticker.tick() => {
                let events = agent.tick();
                out.render_all(&events)?;
                if events.iter().any(|e| e.is_terminal()) {
                    out.prompt()?;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                if agent.is_idle() {
                    break;
                }
                out.render_all(&agent.cancel())?;
                out.prompt()?;
            }
        }
    }

    out.line("")?;
    out.line("  Goodbye!")?;
    Ok(())
}

fn handle_line<W: std::io::Write>(
    agent: &mut AgentLoop,
    out: &mut Renderer<W>,
    line: &str,
) -> std::io::Result<Flow> {
    if let Some(call_id) = agent.awaiting_approval().map(|c| c.id.clone()) {
        match approval_input(line) {
            ApprovalInput::Command(Slash::Quit) => return Ok(Flow::Quit),
            ApprovalInput::Command(_) => {
                // Cancelling drops the parked call along with the round.
                out.render_all(&agent.cancel())?;
                out.prompt()?;
            }
            ApprovalInput::Answer(decision) => {
                out.render_all(&agent.resolve_approval(&call_id, decision))?
            }
            ApprovalInput::Unclear => out.line("  Please answer y, n or a (or /cancel).")?,
        }
        return Ok(Flow::Continue);
    }

    if let Some(slash) = parse_slash(line) {
        match slash {
            Slash::Quit => return Ok(Flow::Quit),
            Slash::Cancel => {
                if agent.is_idle() {
                    out.line("  Nothing to cancel.")?;
                } else {
                    out.render_all(&agent.cancel())?;
                }
            }
            Slash::Grants => {
                let grants = agent.executor().permissions().grants();
                if grants.is_empty() {
                    out.line("  No session grants.")?;
                } else {
                    for tool in grants {
                        out.line(&format!("  • {tool}"))?;
                    }
                }
            }
            Slash::Revoke(tool) => {
                if agent.executor().permissions().revoke(&tool) {
                    out.line(&format!("  Revoked session grant for {tool}."))?;
                } else {
                    out.line(&format!("  {tool} had no session grant."))?;
                }
            }
            Slash::Model(Some(model)) => {
                agent.set_model(model.clone());
                out.line(&format!("  Switched model to {model}."))?;
            }
            Slash::Model(None) => {
                out.line(&format!("  Model: {}", agent.model().unwrap_or("(none)")))?;
            }
            Slash::Help => {
                out.line("  /model [name]   show or switch the model")?;
                out.line("  /grants         list tools approved for this session")?;
                out.line("  /revoke <tool>  drop a session grant")?;
                out.line("  /cancel         stop the current round")?;
                out.line("  /quit           leave")?;
            }
            Slash::Unknown(message) => out.line(&format!("  {message}"))?,
        }
        if agent.is_idle() {
            out.prompt()?;
        }
        return Ok(Flow::Continue);
    }

    if line.is_empty() {
        if agent.is_idle() {
            out.prompt()?;
        }
        return Ok(Flow::Continue);
    }

    match agent.submit(line) {
        Ok(events) => {
            out.render_all(&events)?;
            if agent.is_idle() {
                out.prompt()?;
            }
        }
        Err(_) => out.line("  Still working on the last message; /cancel to stop it.")?,
    }
    Ok(Flow::Continue)
}
