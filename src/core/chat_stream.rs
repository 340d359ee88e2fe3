use std::sync::Arc;

use futures_util::StreamExt;
use memchr::memchr;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::providers::{BackendError, BackendRequest, ChatBackend};

#[derive(Debug)]
pub enum StreamMessage {
    Chunk(String),
    Error(BackendError),
    /// Authoritative final text of the turn.
    Done(String),
}

/// Handed to a backend so it can report partial output while it streams.
#[derive(Clone)]
pub struct FragmentSender {
    tx: mpsc::UnboundedSender<StreamMessage>,
}

impl FragmentSender {
    pub fn send(&self, fragment: &str) {
        if fragment.is_empty() {
            return;
        }
        let _ = self.tx.send(StreamMessage::Chunk(fragment.to_string()));
    }

    #[cfg(test)]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StreamMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

/// Receiving end of one dispatched turn.
///
/// Yields any number of `Chunk`s followed by exactly one `Done` or `Error`,
/// unless the turn is cancelled first, in which case the channel just closes.
pub struct ChatHandle {
    rx: mpsc::UnboundedReceiver<StreamMessage>,
    cancel_token: CancellationToken,
}

impl ChatHandle {
    pub async fn next(&mut self) -> Option<StreamMessage> {
        self.rx.recv().await
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

impl Drop for ChatHandle {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// Start a backend call on its own task.
pub fn dispatch(backend: Arc<dyn ChatBackend>, request: BackendRequest) -> ChatHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let cancel_token = CancellationToken::new();
    let task_token = cancel_token.clone();

    tokio::spawn(async move {
        let fragments = FragmentSender { tx: tx.clone() };
        let provider = backend.kind();
        let model = request.model.id.clone();

        tokio::select! {
            result = backend.stream_chat(request, &fragments) => {
                let message = match result {
                    Ok(text) => StreamMessage::Done(text),
                    Err(err) => {
                        warn!(%provider, %model, error = %err, "chat request failed");
                        StreamMessage::Error(err)
                    }
                };
                let _ = tx.send(message);
            }
            _ = task_token.cancelled() => {
                debug!(%provider, %model, "chat request cancelled");
            }
        }
    });

    ChatHandle { rx, cancel_token }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LineControl {
    Continue,
    Stop,
}

/// Feed every line of a streamed response body to `on_line`, with the line
/// terminator removed. The body must be ended by `on_line` returning
/// `LineControl::Stop`; a body that runs out first is a truncated answer.
pub(crate) async fn for_each_line<F>(
    response: reqwest::Response,
    mut on_line: F,
) -> Result<(), BackendError>
where
    F: FnMut(&str) -> Result<LineControl, BackendError>,
{
    let mut stream = response.bytes_stream();
    let mut buffer = LineBuffer::default();

    while let Some(chunk) = stream.next().await {
        let chunk_bytes = chunk.map_err(|e| BackendError::Transport(e.to_string()))?;
        buffer.push(&chunk_bytes);

        while let Some(line) = buffer.next_line() {
            if on_line(&line)? == LineControl::Stop {
                return Ok(());
            }
        }
    }

    if let Some(line) = buffer.take_remainder() {
        if on_line(&line)? == LineControl::Stop {
            return Ok(());
        }
    }
    Err(BackendError::Protocol(
        "Stream ended before completion".to_string(),
    ))
}

#[derive(Default)]
pub(crate) struct LineBuffer {
    buffer: Vec<u8>,
}

impl LineBuffer {
    pub(crate) fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub(crate) fn next_line(&mut self) -> Option<String> {
        loop {
            let newline_pos = memchr(b'\n', &self.buffer)?;
            let decoded = std::str::from_utf8(&self.buffer[..newline_pos])
                .map(|s| s.trim_end_matches('\r').to_string());
            self.buffer.drain(..=newline_pos);
            match decoded {
                Ok(line) => return Some(line),
                Err(e) => warn!("Invalid UTF-8 in stream: {e}"),
            }
        }
    }

    fn take_remainder(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        String::from_utf8(rest)
            .ok()
            .map(|s| s.trim_end_matches('\r').to_string())
            .filter(|s| !s.is_empty())
    }
}

/// Value of an SSE field line such as `data: ...`, with the single optional
/// space after the colon removed.
pub(crate) fn sse_field<'a>(line: &'a str, field: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(field)?.strip_prefix(':')?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

fn extract_error_summary(value: &serde_json::Value) -> Option<String> {
    let summary = value
        .pointer("/error/message")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .or_else(|| {
            value.get("error").and_then(|v| match v {
                serde_json::Value::String(s) => Some(s.to_string()),
                serde_json::Value::Object(map) => map
                    .get("message")
                    .and_then(|message| message.as_str().map(str::to_owned)),
                _ => None,
            })
        })
        .or_else(|| {
            value
                .get("detail")
                .or_else(|| value.get("message"))
                .and_then(|v| v.as_str().map(str::to_owned))
        });

    summary.map(|text| {
        let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
        collapsed.trim().to_string()
    })
}

/// Render a provider error body for display, pretty-printing JSON and pulling
/// out its message when there is one.
pub fn format_api_error(error_text: &str) -> String {
    let trimmed = error_text.trim();

    if trimmed.is_empty() {
        return "API Error:\n```\n<empty>\n```".to_string();
    }

    if let Ok(json_value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Ok(pretty_json) = serde_json::to_string_pretty(&json_value) {
            if let Some(summary) = extract_error_summary(&json_value) {
                if !summary.is_empty() {
                    return format!("API Error: {}\n```json\n{}\n```", summary, pretty_json);
                }
            }
            return format!("API Error:\n```json\n{}\n```", pretty_json);
        }
    }

    if trimmed.starts_with('<') && trimmed.ends_with('>') {
        format!("API Error:\n```xml\n{}\n```", trimmed)
    } else {
        format!("API Error:\n```\n{}\n```", trimmed)
    }
}
