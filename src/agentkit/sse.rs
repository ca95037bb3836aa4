//! Server-Sent-Events framing.
//!
//! One incremental parser serves both consumers in the crate: the client SDK
//! reading reply streams from a peer agent, and the provider adapters reading
//! chat-completion deltas from a remote LLM service.  Callers feed raw body
//! chunks as they arrive off the socket and receive completed events; partial
//! frames stay buffered until their terminating blank line shows up.
//!
//! Framing rules: one or more `event:` / `data:` lines per event, blank line
//! terminates an event, multiple `data:` lines are joined with `\n`.  `id:`,
//! `retry:` and comment lines are ignored.  A literal `[DONE]` data payload,
//! a `done` event name, or a `done` data sentinel all mark end-of-stream.

/// One parsed SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event type from the `event:` field, if present.
    pub event: Option<String>,
    /// Data payload; multiple `data:` lines joined with `\n`.
    pub data: String,
}

impl SseEvent {
    /// Whether this event terminates the stream.
    pub fn is_done(&self) -> bool {
        self.data == "[DONE]" || self.data == "done" || self.event.as_deref() == Some("done")
    }
}

/// Incremental SSE parser.  Feed body chunks in arrival order; completed
/// events come back in the same order.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
}

impl SseParser {
    /// Create an empty parser.
    pub fn new() -> Self {
        SseParser::default()
    }

    /// Feed one chunk of body text and collect every event completed by it.
    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        // Normalizing CRLF up front keeps the frame-splitting logic simple.
        if self.buffer.contains('\r') {
            self.buffer = self.buffer.replace("\r\n", "\n");
        }

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find("\n\n") {
            let frame: String = self.buffer.drain(..pos + 2).collect();
            if let Some(event) = parse_frame(frame.trim_end_matches('\n')) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing frame that was never terminated by a blank line.
    /// Streams that close abruptly after a final `data:` line end up here.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        let trimmed = rest.trim_end_matches('\n');
        if trimmed.is_empty() {
            None
        } else {
            parse_frame(trimmed)
        }
    }
}

/// Parse one blank-line-terminated frame into an event.  Returns `None` for
/// frames carrying neither an event name nor data (comments, keepalives).
fn parse_frame(frame: &str) -> Option<SseEvent> {
    let mut event: Option<String> = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in frame.lines() {
        if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.trim_start_matches(' ').to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
        // id:, retry:, and ":" comment lines are intentionally dropped.
    }

    if event.is_none() && data_lines.is_empty() {
        return None;
    }
    Some(SseEvent {
        event,
        data: data_lines.join("\n"),
    })
}
