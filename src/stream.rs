//! The Stream Reader contract: a lazy, finite, non-restartable sequence of [`StreamChunk`]s
//! that yields exactly one terminal (`done: true`) chunk and then stops.
//!
//! Readers are plain `futures_util::Stream`s rather than a `Next()`-method object, which is
//! the idiomatic Rust rendition of the same contract: `StreamExt::next()` already gives
//! "blocks until the next item is ready", and dropping the stream is the idiomatic
//! `Close()`. The one behavior the design calls out that `Stream` does not give you for
//! free — repeating the terminal chunk forever instead of ending — is implemented by
//! [`TerminalRepeat`] below.

use std::pin::Pin;

use futures_util::stream::{Stream, StreamExt};

use crate::error::LlmError;
use crate::model::StreamChunk;

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, LlmError>> + Send>>;

/// Wraps an inner stream so that once it yields a `done: true` chunk, every subsequent poll
/// re-yields that same terminal chunk instead of ending. This matches `Next()` semantics in
/// the design ("returns a terminal chunk exactly once then repeats it") while still letting
/// callers naturally stop consuming (or explicitly `close()`) once they observe `done`.
pub struct TerminalRepeat<S> {
    inner: Option<S>,
    terminal: Option<StreamChunk>,
    closed: std::sync::atomic::AtomicBool,
}

impl<S> TerminalRepeat<S>
where
    S: Stream<Item = Result<StreamChunk, LlmError>> + Unpin,
{
    pub fn new(inner: S) -> Self {
        TerminalRepeat {
            inner: Some(inner),
            terminal: None,
            closed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Idempotent: releases the underlying HTTP response by dropping the inner stream.
    pub fn close(&mut self) {
        self.closed
            .store(true, std::sync::atomic::Ordering::SeqCst);
        self.inner = None;
    }

    pub async fn next(&mut self) -> Result<StreamChunk, LlmError> {
        if let Some(terminal) = &self.terminal {
            return Ok(terminal.clone());
        }
        let Some(inner) = self.inner.as_mut() else {
            return Ok(StreamChunk::terminal());
        };
        match inner.next().await {
            Some(Ok(chunk)) => {
                if chunk.done {
                    self.terminal = Some(chunk.clone());
                    self.inner = None;
                }
                Ok(chunk)
            }
            Some(Err(e)) => Err(e),
            None => {
                let terminal = StreamChunk::terminal();
                self.terminal = Some(terminal.clone());
                self.inner = None;
                Ok(terminal)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    #[tokio::test]
    async fn terminal_chunk_is_idempotent() {
        let items: Vec<Result<StreamChunk, LlmError>> = vec![
            Ok(StreamChunk {
                content: "hi".to_string(),
                ..Default::default()
            }),
            Ok(StreamChunk::terminal()),
        ];
        let mut reader = TerminalRepeat::new(stream::iter(items));

        let first = reader.next().await.unwrap();
        assert_eq!(first.content, "hi");
        assert!(!first.done);

        let second = reader.next().await.unwrap();
        assert!(second.done);

        let third = reader.next().await.unwrap();
        assert!(third.done);
    }

    #[tokio::test]
    async fn exhausted_stream_synthesizes_terminal_chunk() {
        let items: Vec<Result<StreamChunk, LlmError>> = vec![Ok(StreamChunk {
            content: "only".to_string(),
            ..Default::default()
        })];
        let mut reader = TerminalRepeat::new(stream::iter(items));
        reader.next().await.unwrap();
        let terminal = reader.next().await.unwrap();
        assert!(terminal.done);
        let terminal_again = reader.next().await.unwrap();
        assert!(terminal_again.done);
    }
}
