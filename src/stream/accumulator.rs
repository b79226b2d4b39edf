//! Completion accumulator: folds parsed upstream events into the assistant text.
//!
//! The accumulator is a pure reducer. [`Completion::apply`] takes the current
//! state and one event and returns the next state plus what the event
//! contributed, so the whole thing is testable without any I/O.

use serde::Deserialize;

use super::SseEvent;

/// Outcome of applying one upstream event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delta {
    /// A non-empty text fragment, already appended to the buffer.
    Text(String),
    /// A well-formed chunk that carried no text (role header, finish chunk).
    Empty,
    /// The event could not be read; it contributed nothing.
    Malformed(String),
    /// The `[DONE]` marker.
    Done,
}

/// Running state of one streamed completion.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    text: String,
    fragments: u32,
    skipped: u32,
    finish_reason: Option<String>,
    done: bool,
}

#[derive(Deserialize)]
struct ChunkWire {
    #[serde(default)]
    choices: Vec<ChoiceWire>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct ChoiceWire {
    #[serde(default)]
    delta: Option<DeltaWire>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct DeltaWire {
    #[serde(default)]
    content: Option<String>,
}

impl Completion {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one parsed event.
    ///
    /// Events arriving after the done marker are ignored and reported as
    /// [`Delta::Empty`].
    #[must_use]
    pub fn apply(mut self, event: &SseEvent) -> (Self, Delta) {
        if self.done {
            return (self, Delta::Empty);
        }
        if event.is_done() {
            self.done = true;
            return (self, Delta::Done);
        }

        match extract_fragment(&event.data) {
            Ok((fragment, finish_reason)) => {
                if finish_reason.is_some() {
                    self.finish_reason = finish_reason;
                }
                match fragment {
                    Some(fragment) if !fragment.is_empty() => {
                        self.text.push_str(&fragment);
                        self.fragments += 1;
                        (self, Delta::Text(fragment))
                    }
                    _ => (self, Delta::Empty),
                }
            }
            Err(reason) => {
                self.skipped += 1;
                (self, Delta::Malformed(reason))
            }
        }
    }

    /// Text accumulated so far.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    #[must_use]
    pub fn fragments(&self) -> u32 {
        self.fragments
    }

    /// Number of events dropped as unreadable.
    #[must_use]
    pub fn skipped(&self) -> u32 {
        self.skipped
    }

    #[must_use]
    pub fn finish_reason(&self) -> Option<&str> {
        self.finish_reason.as_deref()
    }

    #[must_use]
    pub fn saw_done(&self) -> bool {
        self.done
    }
}

/// Pull `choices[0].delta.content` (and `finish_reason`) out of a chunk payload.
fn extract_fragment(data: &str) -> Result<(Option<String>, Option<String>), String> {
    let chunk: ChunkWire =
        serde_json::from_str(data).map_err(|err| format!("invalid chunk JSON: {err}"))?;
    if let Some(error) = chunk.error {
        return Err(format!("upstream error payload: {error}"));
    }
    let Some(choice) = chunk.choices.into_iter().next() else {
        return Ok((None, None));
    };
    let content = choice.delta.and_then(|delta| delta.content);
    Ok((content, choice.finish_reason))
}
