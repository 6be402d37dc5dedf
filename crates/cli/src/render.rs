//! Terminal rendering of `AgentEvent`s.

use std::io::{self, Write};

use meshtalk_agent::AgentEvent;
use serde_json::Value;

/// Tool output longer than this is cut to its first lines on screen.
const PREVIEW_LINES: usize = 6;

pub struct Renderer<W: Write> {
    out: W,
    /// The cursor is not at column zero.
    mid_line: bool,
}

impl<W: Write> Renderer<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            mid_line: false,
        }
    }

    pub fn render_all(&mut self, events: &[AgentEvent]) -> io::Result<()> {
        for event in events {
            self.render(event)?;
        }
        self.out.flush()
    }

    pub fn render(&mut self, event: &AgentEvent) -> io::Result<()> {
        match event {
            AgentEvent::TextDelta { content } => {
                write!(self.out, "{content}")?;
                self.mid_line = !content.ends_with('\n');
            }
            AgentEvent::ToolCall { name, input, .. } => {
                self.break_line()?;
                writeln!(self.out, "  → {name}({})", compact(input))?;
            }
            AgentEvent::ApprovalRequested {
                name,
                input,
                framing,
                reason,
                ..
            } => {
                self.break_line()?;
                writeln!(self.out)?;
                writeln!(self.out, "  ⚠️  {name} needs your approval")?;
                match input.get("command").and_then(Value::as_str) {
                    Some(command) => {
                        let framing = framing.as_deref().unwrap_or("unreviewed");
                        writeln!(self.out, "     command ({framing}): {command}")?;
                    }
                    None => writeln!(self.out, "     arguments: {}", compact(input))?,
                }
                if let Some(reason) = reason {
                    writeln!(self.out, "     note: {reason}")?;
                }
                write!(self.out, "  Allow? [y]es / [n]o / [a]lways this session: ")?;
                self.mid_line = true;
            }
            AgentEvent::ToolResult {
                name,
                output,
                is_error,
                ..
            } => {
                self.break_line()?;
                let mark = if *is_error { "✗" } else { "✓" };
                let lines: Vec<&str> = output.lines().collect();
                match lines.as_slice() {
                    [] => writeln!(self.out, "  {mark} {name}")?,
                    [one] => writeln!(self.out, "  {mark} {name}: {one}")?,
                    many => {
                        writeln!(self.out, "  {mark} {name}:")?;
                        for line in many.iter().take(PREVIEW_LINES) {
                            writeln!(self.out, "     {line}")?;
                        }
                        if many.len() > PREVIEW_LINES {
                            writeln!(self.out, "     … {} more lines", many.len() - PREVIEW_LINES)?;
                        }
                    }
                }
            }
            AgentEvent::Done { usage, .. } => {
                self.break_line()?;
                if let Some(usage) = usage {
                    writeln!(
                        self.out,
                        "  [{} prompt + {} completion tokens]",
                        usage.prompt_tokens, usage.completion_tokens
                    )?;
                }
            }
            AgentEvent::Cancelled => {
                self.break_line()?;
                writeln!(self.out, "  [cancelled]")?;
            }
            AgentEvent::Error { message } => {
                self.break_line()?;
                writeln!(self.out, "  [Error] {message}")?;
            }
        }
        Ok(())
    }

    /// Print a plain line, starting a fresh one if needed.
    pub fn line(&mut self, text: &str) -> io::Result<()> {
        self.break_line()?;
        writeln!(self.out, "{text}")?;
        self.out.flush()
    }

    pub fn prompt(&mut self) -> io::Result<()> {
        self.break_line()?;
        write!(self.out, "\n  You > ")?;
        self.out.flush()
    }

    /// The user's Enter already moved the cursor to column zero.
    pub fn input_received(&mut self) {
        self.mid_line = false;
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.out
    }

    fn break_line(&mut self) -> io::Result<()> {
        if self.mid_line {
            writeln!(self.out)?;
            self.mid_line = false;
        }
        Ok(())
    }
}

fn compact(value: &Value) -> String {
    let text = value.to_string();
    if text.chars().count() > 120 {
        let cut: String = text.chars().take(117).collect();
        format!("{cut}...")
    } else {
        text
    }
}
