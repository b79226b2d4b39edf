/// SSE (Server-Sent Events) frame parser and stream adapter.
///
/// Handles the low-level parsing of SSE frames from a byte stream,
/// including buffering partial lines, partial UTF-8 sequences and handling
/// field semantics per the
/// [SSE specification](https://html.spec.whatwg.org/multipage/server-sent-events.html).
use std::collections::VecDeque;

use futures_util::{Stream, StreamExt};
use memchr::memchr_iter;

use super::SseEvent;

// ---------------------------------------------------------------------------
// SseParser: incremental SSE line parser
// ---------------------------------------------------------------------------

/// Incremental SSE line parser.
///
/// Feed it raw bytes (potentially arriving in arbitrary chunk boundaries,
/// including the middle of a multi-byte character) and it yields
/// fully-assembled [`SseEvent`] frames.
pub struct SseParser {
    buffer: String,
    read_offset: usize,
    utf8_tail: Vec<u8>,
    event_type: Option<String>,
    data_buffer: String,
    has_data: bool,
    last_event_id: Option<String>,
}

impl SseParser {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            read_offset: 0,
            utf8_tail: Vec::new(),
            event_type: None,
            data_buffer: String::new(),
            has_data: false,
            last_event_id: None,
        }
    }

    /// Feed raw bytes and return any complete events parsed.
    ///
    /// SSE rules:
    /// - Lines starting with `event:` set the event type for the next frame
    /// - Lines starting with `data:` append to the data buffer (strip one
    ///   leading space after the colon)
    /// - Empty lines terminate a frame; emit it and reset
    /// - Lines starting with `:` are comments, ignored
    /// - `id:` sets the last event ID
    /// - `retry:` and unknown fields are ignored
    /// - Multiple `data:` lines are joined with `\n`
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let mut out = Vec::new();
        self.feed_into(chunk, &mut out);
        out
    }

    /// Feed raw bytes and append complete events into a caller-provided buffer.
    pub fn feed_into(&mut self, chunk: &[u8], out: &mut Vec<SseEvent>) {
        if chunk.is_empty() {
            return;
        }
        self.push_utf8(chunk);
        self.drain_lines(out);
    }

    /// Bytes received so far that do not yet form a complete frame.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.buffer.len() - self.read_offset + self.utf8_tail.len() + self.data_buffer.len()
    }

    fn push_utf8(&mut self, chunk: &[u8]) {
        let joined: Vec<u8>;
        let mut rest: &[u8] = if self.utf8_tail.is_empty() {
            chunk
        } else {
            self.utf8_tail.extend_from_slice(chunk);
            joined = std::mem::take(&mut self.utf8_tail);
            &joined
        };

        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    self.buffer.push_str(text);
                    return;
                }
                Err(err) => {
                    let (valid, tail) = rest.split_at(err.valid_up_to());
                    if let Ok(text) = std::str::from_utf8(valid) {
                        self.buffer.push_str(text);
                    }
                    match err.error_len() {
                        // Truncated sequence at the end of the chunk: wait for more bytes.
                        None => {
                            self.utf8_tail.extend_from_slice(tail);
                            return;
                        }
                        Some(invalid_len) => {
                            self.buffer.push(char::REPLACEMENT_CHARACTER);
                            rest = &tail[invalid_len..];
                        }
                    }
                }
            }
        }
    }

    fn drain_lines(&mut self, out: &mut Vec<SseEvent>) {
        let mut processed_up_to = self.read_offset;
        let bytes = self.buffer.as_bytes();
        let scan_start = processed_up_to;
        for rel_pos in memchr_iter(b'\n', &bytes[scan_start..]) {
            let line_end = scan_start + rel_pos;
            let mut line = &self.buffer[processed_up_to..line_end];
            if let Some(stripped) = line.strip_suffix('\r') {
                line = stripped;
            }
            Self::process_line(
                line,
                &mut self.event_type,
                &mut self.data_buffer,
                &mut self.has_data,
                &mut self.last_event_id,
                out,
            );
            processed_up_to = line_end + 1;
        }

        self.read_offset = processed_up_to;
        if self.read_offset == self.buffer.len() {
            self.buffer.clear();
            self.read_offset = 0;
            return;
        }
        let should_compact = self.read_offset > 0
            && (self.read_offset >= self.buffer.len() / 2 || self.read_offset >= 8 * 1024);
        if should_compact {
            self.buffer.drain(..self.read_offset);
            self.read_offset = 0;
        }
    }

    fn process_line(
        line: &str,
        event_type: &mut Option<String>,
        data_buffer: &mut String,
        has_data: &mut bool,
        last_event_id: &mut Option<String>,
        events: &mut Vec<SseEvent>,
    ) {
        if line.is_empty() {
            // Empty line = dispatch event
            if *has_data {
                events.push(SseEvent {
                    event: event_type.take(),
                    data: std::mem::take(data_buffer),
                    id: last_event_id.clone(),
                });
                *has_data = false;
            } else {
                event_type.take();
            }
            return;
        }

        if line.starts_with(':') {
            return;
        }

        if let Some(value) = line.strip_prefix("data:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            if *has_data {
                data_buffer.push('\n');
            } else {
                *has_data = true;
            }
            data_buffer.push_str(value);
        } else if let Some(value) = line.strip_prefix("event:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            *event_type = Some(value.to_string());
        } else if let Some(value) = line.strip_prefix("id:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            *last_event_id = Some(value.to_string());
        }
    }
}

impl Default for SseParser {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Encoding helpers
// ---------------------------------------------------------------------------

/// Format an unnamed SSE frame carrying a single-line JSON payload.
#[must_use]
pub fn data_frame(json: &str) -> String {
    let mut out = String::with_capacity(8 + json.len());
    out.push_str("data: ");
    out.push_str(json);
    out.push_str("\n\n");
    out
}

// ---------------------------------------------------------------------------
// Stream utility
// ---------------------------------------------------------------------------

/// Split an upstream byte stream into SSE events using [`SseParser`].
///
/// The returned stream ends right after the `[DONE]` marker, when the byte
/// stream ends (an unterminated trailing frame is dropped), or right after
/// yielding the first transport error.
pub fn sse_event_stream<S, E>(byte_stream: S) -> impl Stream<Item = Result<SseEvent, E>> + Send
where
    S: Stream<Item = Result<bytes::Bytes, E>> + Send + 'static,
    E: Send + 'static,
{
    futures_util::stream::unfold(
        (
            Box::pin(byte_stream),
            SseParser::new(),
            Vec::<SseEvent>::with_capacity(8),
            VecDeque::<SseEvent>::with_capacity(8),
            false,
        ),
        |(mut stream, mut parser, mut parsed, mut pending, mut finished)| async move {
            loop {
                if finished {
                    return None;
                }
                if let Some(event) = pending.pop_front() {
                    if event.is_done() {
                        finished = true;
                        pending.clear();
                    }
                    return Some((Ok(event), (stream, parser, parsed, pending, finished)));
                }

                match stream.as_mut().next().await {
                    Some(Ok(bytes)) => {
                        parser.feed_into(&bytes, &mut parsed);
                        pending.extend(parsed.drain(..));
                    }
                    Some(Err(err)) => {
                        finished = true;
                        return Some((Err(err), (stream, parser, parsed, pending, finished)));
                    }
                    None => {
                        let leftover = parser.pending_len();
                        if leftover > 0 {
                            tracing::debug!(leftover, "upstream closed inside an SSE frame");
                        }
                        return None;
                    }
                }
            }
        },
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
