//! Shared Server-Sent-Events line decoder, covering both SSE grammars consumed by this
//! crate: "simple" (`data: {json}` + `[DONE]` sentinel — OpenAI Chat, Compat vendors) and
//! "named" (`event: name` + `data: {json}` pairs — OpenAI Responses, Anthropic). Both share
//! the same field grammar; simple SSE just never sets `event:`.
//!
//! Adapted from the line-decoder pattern used by `rig-core`'s Anthropic provider
//! (`sse_decoder`), generalized here to serve every named/simple SSE provider in this crate
//! instead of a single vendor.

use futures_util::stream::{Stream, StreamExt};
use std::pin::Pin;

/// One decoded SSE record: an optional event name and the accumulated `data:` lines joined
/// by `\n`.
#[derive(Debug, Clone, Default)]
pub struct ServerSentEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Stateful line-by-line SSE decoder. Feed it lines one at a time via [`SseDecoder::decode`];
/// it emits a [`ServerSentEvent`] once a blank line completes the current record.
#[derive(Default)]
pub struct SseDecoder {
    data: Vec<String>,
    event: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line (without its trailing newline). Returns `Some(event)` when the line was
    /// blank and completed a non-empty record.
    pub fn decode(&mut self, line: &str) -> Option<ServerSentEvent> {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if line.is_empty() {
            if self.data.is_empty() && self.event.is_none() {
                return None;
            }
            let event = ServerSentEvent {
                event: self.event.take(),
                data: self.data.join("\n"),
            };
            self.data.clear();
            return Some(event);
        }

        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }
}

/// Splits a raw byte stream into lines and decodes each through an [`SseDecoder`], yielding
/// [`ServerSentEvent`]s as they complete. `[DONE]` is NOT filtered here — callers of "simple"
/// SSE providers check `event.data == "[DONE]"` themselves since named-SSE providers have no
/// such sentinel.
pub fn decode_sse_stream<S, E>(
    mut byte_stream: S,
) -> Pin<Box<dyn Stream<Item = Result<ServerSentEvent, E>> + Send>>
where
    S: Stream<Item = Result<bytes::Bytes, E>> + Send + Unpin + 'static,
    E: Send + 'static,
{
    Box::pin(async_stream::try_stream! {
        let mut decoder = SseDecoder::new();
        let mut buffer = String::new();
        while let Some(chunk) = byte_stream.next().await {
            let chunk = chunk?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));
            loop {
                match buffer.find('\n') {
                    Some(idx) => {
                        let line: String = buffer.drain(..=idx).collect();
                        let line = line.trim_end_matches('\n');
                        if let Some(event) = decoder.decode(line) {
                            yield event;
                        }
                    }
                    None => break,
                }
            }
        }
        if let Some(event) = decoder.decode("") {
            yield event;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_simple_data_only_event() {
        let mut dec = SseDecoder::new();
        assert!(dec.decode("data: {\"a\":1}").is_none());
        let event = dec.decode("").unwrap();
        assert_eq!(event.event, None);
        assert_eq!(event.data, "{\"a\":1}");
    }

    #[test]
    fn decodes_named_event_with_multiline_data() {
        let mut dec = SseDecoder::new();
        assert!(dec.decode("event: message_start").is_none());
        assert!(dec.decode("data: line1").is_none());
        assert!(dec.decode("data: line2").is_none());
        let event = dec.decode("").unwrap();
        assert_eq!(event.event.as_deref(), Some("message_start"));
        assert_eq!(event.data, "line1\nline2");
    }

    #[test]
    fn ignores_comments_and_blank_noop() {
        let mut dec = SseDecoder::new();
        assert!(dec.decode(": this is a comment").is_none());
        assert!(dec.decode("").is_none());
    }

    #[test]
    fn strips_trailing_cr() {
        let mut dec = SseDecoder::new();
        dec.decode("data: hi\r");
        let event = dec.decode("\r").unwrap();
        assert_eq!(event.data, "hi");
    }
}
