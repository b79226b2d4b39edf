pub mod accumulator;
pub mod sse;

pub use accumulator::{Completion, Delta};
pub use sse::{sse_event_stream, SseParser};

/// Data payload of the upstream terminal frame.
pub const DONE_SENTINEL: &str = "[DONE]";

/// A parsed SSE frame from the upstream.
///
/// Comment lines never produce an `SseEvent`; every value of this type is a
/// dispatched event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

impl SseEvent {
    /// Build an unnamed event carrying only a `data` payload.
    #[must_use]
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
            id: None,
        }
    }

    /// Whether this is the `[DONE]` terminal marker.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.data == DONE_SENTINEL
    }
}
