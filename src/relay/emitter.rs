use std::convert::Infallible;

use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;

use crate::store::TurnId;
use crate::stream::sse::data_frame;

/// `data: {"content": <fragment>}\n\n`
#[must_use]
pub fn content_frame(fragment: &str) -> Bytes {
    Bytes::from(data_frame(&json!({ "content": fragment }).to_string()))
}

/// `data: {"done": true, "messageId": <id>}\n\n`
#[must_use]
pub fn done_frame(message_id: TurnId) -> Bytes {
    Bytes::from(data_frame(
        &json!({ "done": true, "messageId": message_id }).to_string(),
    ))
}

/// Writes client-facing SSE frames into the response body channel.
///
/// The receiving half is owned by the HTTP response; when the client goes
/// away hyper drops the body and every send from here on fails.
pub struct DownstreamEmitter {
    tx: mpsc::Sender<Bytes>,
    done_sent: bool,
}

/// A reserved slot for exactly one content frame.
pub struct FrameSlot<'a> {
    permit: mpsc::Permit<'a, Bytes>,
}

impl FrameSlot<'_> {
    pub fn send_content(self, fragment: &str) {
        self.permit.send(content_frame(fragment));
    }
}

impl DownstreamEmitter {
    /// Create an emitter and the receiver that feeds the response body.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                done_sent: false,
            },
            rx,
        )
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    #[must_use]
    pub fn done_sent(&self) -> bool {
        self.done_sent
    }

    /// Resolves once the client side of the response is gone.
    pub async fn closed(&self) {
        self.tx.closed().await;
    }

    /// Wait for buffer space. `None` means the client disconnected.
    pub async fn reserve(&self) -> Option<FrameSlot<'_>> {
        self.tx
            .reserve()
            .await
            .ok()
            .map(|permit| FrameSlot { permit })
    }

    /// Send one content frame, waiting for buffer space no later than `until`.
    /// Empty fragments are not framed.
    ///
    /// Returns `false` if the client has disconnected or stopped reading.
    pub async fn send_content(&mut self, fragment: &str, until: Instant) -> bool {
        if fragment.is_empty() {
            return self.is_open();
        }
        self.send_by(content_frame(fragment), until).await
    }

    /// Send the terminal frame, bounded like [`Self::send_content`]. Only the
    /// first successful call writes anything.
    pub async fn send_done(&mut self, message_id: TurnId, until: Instant) -> bool {
        if self.done_sent {
            return false;
        }
        let sent = self.send_by(done_frame(message_id), until).await;
        self.done_sent = sent;
        sent
    }

    // A free slot is taken even when `until` has already passed.
    async fn send_by(&self, frame: Bytes, until: Instant) -> bool {
        match tokio::time::timeout_at(until, self.tx.reserve()).await {
            Ok(Ok(permit)) => {
                permit.send(frame);
                true
            }
            Ok(Err(_)) => false,
            Err(_) => {
                tracing::debug!("client not reading, dropped frame");
                false
            }
        }
    }
}

/// Build the `200 text/event-stream` response fed by `rx`.
#[must_use]
pub fn sse_response(rx: mpsc::Receiver<Bytes>) -> Response {
    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));
    let mut response = Response::new(body);
    *response.status_mut() = http::StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(
        http::header::CACHE_CONTROL,
        http::HeaderValue::from_static("no-cache"),
    );
    headers.insert(
        http::header::CONNECTION,
        http::HeaderValue::from_static("keep-alive"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn soon() -> Instant {
        Instant::now() + Duration::from_secs(1)
    }

    #[test]
    fn test_frame_encoding() {
        assert_eq!(
            content_frame("Hi \"you\"\n"),
            Bytes::from_static(b"data: {\"content\":\"Hi \\\"you\\\"\\n\"}\n\n")
        );
        assert_eq!(
            done_frame(17),
            Bytes::from_static(b"data: {\"done\":true,\"messageId\":17}\n\n")
        );
    }

    #[tokio::test]
    async fn test_frames_arrive_in_order_and_done_once() {
        let (mut emitter, mut rx) = DownstreamEmitter::channel(8);
        assert!(emitter.send_content("a", soon()).await);
        assert!(emitter.send_content("", soon()).await);
        assert!(emitter.send_content("b", soon()).await);
        assert!(emitter.send_done(3, soon()).await);
        assert!(!emitter.send_done(3, soon()).await);
        drop(emitter);

        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame);
        }
        assert_eq!(
            frames,
            vec![content_frame("a"), content_frame("b"), done_frame(3)]
        );
    }

    #[tokio::test]
    async fn test_disconnect_is_observed() {
        let (mut emitter, rx) = DownstreamEmitter::channel(1);
        assert!(emitter.is_open());
        drop(rx);
        emitter.closed().await;
        assert!(!emitter.is_open());
        assert!(!emitter.send_content("late", soon()).await);
        assert!(emitter.reserve().await.is_none());
        assert!(!emitter.send_done(1, soon()).await);
        assert!(!emitter.done_sent());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_reader_does_not_block_send() {
        let (mut emitter, mut rx) = DownstreamEmitter::channel(1);
        assert!(emitter.send_content("fills the buffer", soon()).await);
        assert!(!emitter.send_content("no room", soon()).await);
        assert!(!emitter.send_done(5, Instant::now()).await);
        assert!(!emitter.done_sent());

        assert_eq!(rx.recv().await, Some(content_frame("fills the buffer")));
        // Past the deadline, but the slot is free again.
        assert!(emitter.send_done(5, Instant::now()).await);
        assert!(emitter.done_sent());
        assert_eq!(rx.recv().await, Some(done_frame(5)));
    }

    #[tokio::test]
    async fn test_sse_response_headers_and_body() {
        let (mut emitter, rx) = DownstreamEmitter::channel(4);
        let response = sse_response(rx);
        assert_eq!(response.status(), http::StatusCode::OK);
        assert_eq!(
            response.headers().get(http::header::CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );
        assert_eq!(
            response.headers().get(http::header::CACHE_CONTROL).unwrap(),
            "no-cache"
        );
        emitter.send_content("x", soon()).await;
        drop(emitter);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(body, content_frame("x"));
    }
}
