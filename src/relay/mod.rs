//! Streamed completion relay.
//!
//! One [`StreamSession`] per request: upstream bytes are parsed into SSE
//! events, folded into the running completion, re-framed to the client, and
//! the assistant turn is written exactly once when the stream ends, whatever
//! ended it.

pub mod emitter;
pub mod session;

pub use emitter::{sse_response, DownstreamEmitter};
pub use session::{EndReason, FinalContent, SessionPhase, StreamSession};

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};

use crate::config::FallbackMessages;
use crate::store::{ChatStore, ThreadId, TurnId};
use crate::stream::{sse_event_stream, Delta};
use crate::transport::{FallbackContext, UpstreamFailure};

/// Per-session inputs that do not change while streaming.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Wall-clock ceiling for the whole session, opening included.
    pub stream_timeout: Duration,
    pub model: String,
    pub base_url: String,
    pub fallbacks: FallbackMessages,
}

impl RelaySettings {
    fn fallback_context(&self) -> FallbackContext<'_> {
        FallbackContext {
            model: &self.model,
            base_url: &self.base_url,
        }
    }
}

/// Summary of a finished session, for logging and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub session_id: String,
    pub thread_id: ThreadId,
    pub end: EndReason,
    pub content: String,
    pub fallback: bool,
    pub fragments: u32,
    pub skipped: u32,
    pub finish_reason: Option<String>,
    pub persisted_turn: Option<TurnId>,
    pub done_sent: bool,
    pub elapsed: Duration,
}

/// Drive one session from `Opening` to `Closed`.
///
/// `open` resolves to the upstream byte stream or a classified failure. The
/// user turn must already be persisted. The emitter is dropped on return,
/// which ends the client response.
pub async fn drive_session<F, S, E>(
    mut session: StreamSession,
    open: F,
    mut emitter: DownstreamEmitter,
    store: Arc<dyn ChatStore>,
    settings: &RelaySettings,
) -> SessionReport
where
    F: Future<Output = Result<S, UpstreamFailure>>,
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let deadline = tokio::time::sleep(settings.stream_timeout);
    tokio::pin!(deadline);
    let timed_out =
        || EndReason::UpstreamFailed(UpstreamFailure::TimedOut(settings.stream_timeout));

    let opened = tokio::select! {
        biased;
        () = emitter.closed() => {
            session.finish(EndReason::ClientDisconnected);
            None
        }
        () = &mut deadline => {
            session.finish(timed_out());
            None
        }
        result = open => match result {
            Ok(bytes) => Some(bytes),
            Err(failure) => {
                tracing::warn!(
                    session_id = %session.id(),
                    thread_id = session.thread_id(),
                    kind = failure.kind(),
                    error = %failure,
                    "upstream request failed"
                );
                session.finish(EndReason::UpstreamFailed(failure));
                None
            }
        },
    };

    if let Some(bytes) = opened {
        session.begin_streaming();
        let events = sse_event_stream(bytes);
        tokio::pin!(events);

        loop {
            let next = tokio::select! {
                biased;
                () = emitter.closed() => {
                    session.finish(EndReason::ClientDisconnected);
                    break;
                }
                () = &mut deadline => {
                    session.finish(timed_out());
                    break;
                }
                next = events.next() => next,
            };

            let event = match next {
                Some(Ok(event)) => event,
                Some(Err(err)) => {
                    tracing::warn!(
                        session_id = %session.id(),
                        error = %err,
                        "upstream stream broke"
                    );
                    session.finish(EndReason::UpstreamFailed(UpstreamFailure::Transport(
                        err.to_string(),
                    )));
                    break;
                }
                None => {
                    session.finish(EndReason::UpstreamClosed);
                    break;
                }
            };

            // Reserve before folding so a fragment is only counted once the
            // client can still take it.
            let slot = tokio::select! {
                biased;
                () = &mut deadline => {
                    session.finish(timed_out());
                    break;
                }
                slot = emitter.reserve() => slot,
            };
            let Some(slot) = slot else {
                session.finish(EndReason::ClientDisconnected);
                break;
            };

            match session.apply(&event) {
                Delta::Text(fragment) => slot.send_content(&fragment),
                Delta::Done => {
                    session.finish(EndReason::Completed);
                    break;
                }
                Delta::Malformed(reason) => {
                    tracing::debug!(
                        session_id = %session.id(),
                        reason = %reason,
                        "skipped malformed upstream event"
                    );
                }
                Delta::Empty => {}
            }
        }
        // `events` is dropped here; anything upstream sends later is discarded.
    }

    let content = session.final_content(&settings.fallbacks, settings.fallback_context());
    let persisted_turn = match session.persist_once(store.as_ref(), &content.text).await {
        Some(Ok(turn_id)) => {
            if let Err(err) = store.touch_thread(session.thread_id()).await {
                tracing::warn!(
                    thread_id = session.thread_id(),
                    error = %err,
                    "failed to update thread timestamp"
                );
            }
            Some(turn_id)
        }
        Some(Err(err)) => {
            tracing::error!(
                session_id = %session.id(),
                thread_id = session.thread_id(),
                error = %err,
                "failed to persist assistant turn"
            );
            None
        }
        None => None,
    };

    // Trailing frames wait for a stalled client no longer than the session
    // deadline; a free slot is still used once it has passed.
    let until = deadline.deadline();
    if emitter.is_open() {
        let delivered = !content.fallback || emitter.send_content(&content.text, until).await;
        if let (true, Some(turn_id)) = (delivered, persisted_turn) {
            emitter.send_done(turn_id, until).await;
        }
    }

    session.close();
    let end = session
        .end_reason()
        .cloned()
        .unwrap_or(EndReason::UpstreamClosed);
    SessionReport {
        session_id: session.id().to_string(),
        thread_id: session.thread_id(),
        end,
        content: content.text,
        fallback: content.fallback,
        fragments: session.completion().fragments(),
        skipped: session.completion().skipped(),
        finish_reason: session.completion().finish_reason().map(str::to_string),
        persisted_turn,
        done_sent: emitter.done_sent(),
        elapsed: session.started().elapsed(),
    }
}
