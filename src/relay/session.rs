use std::fmt;
use std::time::Instant;

use crate::config::FallbackMessages;
use crate::store::{ChatStore, Role, StoreResult, ThreadId, TurnId};
use crate::stream::{Completion, Delta, SseEvent};
use crate::transport::{FallbackContext, UpstreamFailure};

/// Lifecycle of one relayed completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Opening,
    Streaming,
    Finalizing,
    Closed,
    Errored,
}

impl SessionPhase {
    fn can_advance_to(self, next: SessionPhase) -> bool {
        use SessionPhase::{Closed, Errored, Finalizing, Opening, Streaming};
        matches!(
            (self, next),
            (Opening, Streaming)
                | (Opening | Streaming, Finalizing)
                | (Opening | Streaming | Finalizing, Errored)
                | (Errored, Finalizing)
                | (Finalizing | Errored, Closed)
        )
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionPhase::Opening => "opening",
            SessionPhase::Streaming => "streaming",
            SessionPhase::Finalizing => "finalizing",
            SessionPhase::Closed => "closed",
            SessionPhase::Errored => "errored",
        };
        f.write_str(name)
    }
}

/// What ended the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// The `[DONE]` marker arrived.
    Completed,
    /// Upstream closed the body before `[DONE]`.
    UpstreamClosed,
    /// The upstream could not be opened or failed mid-stream.
    UpstreamFailed(UpstreamFailure),
    ClientDisconnected,
}

impl EndReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::Completed => "completed",
            EndReason::UpstreamClosed => "upstream_closed",
            EndReason::UpstreamFailed(UpstreamFailure::TimedOut(_)) => "timed_out",
            EndReason::UpstreamFailed(_) => "upstream_error",
            EndReason::ClientDisconnected => "client_disconnected",
        }
    }
}

/// Text chosen for the assistant turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalContent {
    pub text: String,
    pub fallback: bool,
}

/// Per-request relay state. Lives for exactly one streamed response.
#[derive(Debug)]
pub struct StreamSession {
    id: String,
    thread_id: ThreadId,
    phase: SessionPhase,
    completion: Completion,
    end: Option<EndReason>,
    persisted: bool,
    started: Instant,
}

impl StreamSession {
    #[must_use]
    pub fn new(id: impl Into<String>, thread_id: ThreadId) -> Self {
        Self {
            id: id.into(),
            thread_id,
            phase: SessionPhase::Opening,
            completion: Completion::new(),
            end: None,
            persisted: false,
            started: Instant::now(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    #[must_use]
    pub fn completion(&self) -> &Completion {
        &self.completion
    }

    #[must_use]
    pub fn end_reason(&self) -> Option<&EndReason> {
        self.end.as_ref()
    }

    #[must_use]
    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    #[must_use]
    pub fn started(&self) -> Instant {
        self.started
    }

    fn advance(&mut self, next: SessionPhase) -> bool {
        if self.phase == next {
            return true;
        }
        if !self.phase.can_advance_to(next) {
            tracing::warn!(
                session_id = %self.id,
                from = %self.phase,
                to = %next,
                "ignored invalid session transition"
            );
            return false;
        }
        self.phase = next;
        true
    }

    /// The upstream stream is open and events are flowing.
    pub fn begin_streaming(&mut self) -> bool {
        self.advance(SessionPhase::Streaming)
    }

    /// Fold one upstream event into the accumulated text.
    pub fn apply(&mut self, event: &SseEvent) -> Delta {
        if self.phase != SessionPhase::Streaming {
            return Delta::Empty;
        }
        let (next, delta) = std::mem::take(&mut self.completion).apply(event);
        self.completion = next;
        delta
    }

    /// Record the terminal condition and move to `Finalizing`.
    ///
    /// Only the first reason is kept; later triggers are ignored.
    pub fn finish(&mut self, reason: EndReason) {
        if self.end.is_some() {
            return;
        }
        if matches!(reason, EndReason::UpstreamFailed(_)) {
            self.advance(SessionPhase::Errored);
        }
        self.end = Some(reason);
        self.advance(SessionPhase::Finalizing);
    }

    /// Accumulated text, or the fallback text when nothing usable arrived.
    #[must_use]
    pub fn final_content(
        &self,
        messages: &FallbackMessages,
        ctx: FallbackContext<'_>,
    ) -> FinalContent {
        if !self.completion.is_empty() {
            return FinalContent {
                text: self.completion.text().to_string(),
                fallback: false,
            };
        }
        let text = match &self.end {
            Some(EndReason::UpstreamFailed(failure)) => failure.render(messages, ctx),
            _ => messages.empty_response.clone(),
        };
        FinalContent {
            text,
            fallback: true,
        }
    }

    /// Write the assistant turn. Only the first call reaches the store.
    ///
    /// The flag flips before the insert is awaited, so a failed write is not
    /// attempted again either. Returns `None` when already persisted.
    pub async fn persist_once(
        &mut self,
        store: &dyn ChatStore,
        content: &str,
    ) -> Option<StoreResult<TurnId>> {
        if self.persisted {
            return None;
        }
        self.persisted = true;
        Some(
            store
                .insert_turn(self.thread_id, Role::Assistant, content)
                .await,
        )
    }

    /// Response ended. The session is finished after this.
    pub fn close(&mut self) {
        if self.phase == SessionPhase::Opening || self.phase == SessionPhase::Streaming {
            self.advance(SessionPhase::Finalizing);
        }
        self.advance(SessionPhase::Closed);
    }
}
