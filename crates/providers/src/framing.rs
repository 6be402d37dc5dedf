//! Stream framing: turn a byte stream into decoded chunks.
//!
//! Two framings are in use: newline-delimited JSON (Ollama) and
//! Server-Sent Events (OpenAI-compatible, Anthropic). Both are line based,
//! so a single reader task splits lines, extracts payloads, and hands them
//! to a provider-specific [`WireDecoder`].

use futures::StreamExt;
use meshtalk_core::error::ProviderError;
use meshtalk_core::provider::{ChunkReceiver, StreamChunk};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::transport::ByteStream;

/// Splits bytes into lines, keeping partial lines (and partial UTF-8
/// sequences) across pushes.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buf: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes, returning every line completed by them. Trailing `\r`
    /// is stripped.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// The unterminated remainder, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        let line = String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string();
        (!line.trim().is_empty()).then_some(line)
    }
}

/// Classification of one SSE line.
#[derive(Debug, PartialEq, Eq)]
pub enum SseLine<'a> {
    /// A `data:` payload, prefix and surrounding whitespace trimmed
    Data(&'a str),
    /// The literal `[DONE]` sentinel
    Done,
    /// Comments, `event:`/`id:`/`retry:` fields and blank lines
    Skip,
}

pub fn sse_line(line: &str) -> SseLine<'_> {
    if line.starts_with(':') {
        return SseLine::Skip;
    }
    match line.strip_prefix("data:") {
        Some(payload) => match payload.trim() {
            "" => SseLine::Skip,
            "[DONE]" => SseLine::Done,
            data => SseLine::Data(data),
        },
        None => SseLine::Skip,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Ndjson,
    Sse,
}

/// Why a payload did not decode.
#[derive(Debug)]
pub enum DecodeError {
    /// Not valid JSON for this wire shape; skipped.
    Malformed(serde_json::Error),
    /// The back-end reported an error in-band; ends the stream.
    Remote(ProviderError),
}

impl From<serde_json::Error> for DecodeError {
    fn from(e: serde_json::Error) -> Self {
        Self::Malformed(e)
    }
}

/// Provider-specific payload decoding. Decoders may hold state across
/// payloads (tool-call argument fragments, open content blocks).
pub trait WireDecoder: Send + 'static {
    /// Decode one payload into zero or more chunks.
    fn decode(&mut self, payload: &str) -> Result<Vec<StreamChunk>, DecodeError>;

    /// Called on the SSE `[DONE]` sentinel.
    fn done_marker(&mut self) -> Vec<StreamChunk> {
        vec![StreamChunk::done()]
    }

    /// Called when the byte stream ends without a terminal chunk.
    fn finish(&mut self) -> Vec<StreamChunk> {
        Vec::new()
    }
}

/// Spawn the reader task for one response body.
///
/// Chunks are sent in arrival order. The task stops after the first
/// terminal chunk, on a transport or in-band error (sent as `Err`), when
/// the receiver is dropped, or when `cancel` fires.
pub fn spawn_reader<D: WireDecoder>(
    provider: &'static str,
    mut body: ByteStream,
    framing: Framing,
    mut decoder: D,
    cancel: CancellationToken,
) -> ChunkReceiver {
    let (tx, rx) = mpsc::channel(64);

    tokio::spawn(async move {
        let mut lines = LineDecoder::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    trace!(provider, "Stream reader cancelled");
                    return;
                }
                next = body.next() => next,
            };

            match next {
                Some(Ok(bytes)) => {
                    for line in lines.push(&bytes) {
                        match process_line(provider, &line, framing, &mut decoder) {
                            Step::Chunks(chunks) => {
                                if !forward(&tx, chunks).await {
                                    return;
                                }
                            }
                            Step::Fail(e) => {
                                let _ = tx.send(Err(e)).await;
                                return;
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
                None => break,
            }
        }

        if let Some(line) = lines.finish() {
            match process_line(provider, &line, framing, &mut decoder) {
                Step::Chunks(chunks) => {
                    if !forward(&tx, chunks).await {
                        return;
                    }
                }
                Step::Fail(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
        }
        forward(&tx, decoder.finish()).await;
    });

    rx
}

enum Step {
    Chunks(Vec<StreamChunk>),
    Fail(ProviderError),
}

fn process_line<D: WireDecoder>(
    provider: &'static str,
    line: &str,
    framing: Framing,
    decoder: &mut D,
) -> Step {
    let payload = match framing {
        Framing::Ndjson => {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                return Step::Chunks(Vec::new());
            }
            trimmed
        }
        Framing::Sse => match sse_line(line) {
            SseLine::Data(data) => data,
            SseLine::Done => return Step::Chunks(decoder.done_marker()),
            SseLine::Skip => return Step::Chunks(Vec::new()),
        },
    };

    match decoder.decode(payload) {
        Ok(chunks) => Step::Chunks(chunks),
        Err(DecodeError::Malformed(e)) => {
            trace!(provider, error = %e, data = %payload, "Ignoring unparseable frame");
            Step::Chunks(Vec::new())
        }
        Err(DecodeError::Remote(e)) => Step::Fail(e),
    }
}

/// Send chunks; returns false once the stream should stop (terminal chunk
/// sent or receiver gone).
async fn forward(
    tx: &mpsc::Sender<Result<StreamChunk, ProviderError>>,
    chunks: Vec<StreamChunk>,
) -> bool {
    for chunk in chunks {
        let done = chunk.done;
        if tx.send(Ok(chunk)).await.is_err() || done {
            return false;
        }
    }
    true
}
