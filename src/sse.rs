//! SSE (Server-Sent Events) stream handling for the streaming path.
//!
//! Upstream providers split events across arbitrary network chunks, so the
//! pipeline wraps the upstream byte stream in a buffer that only releases
//! complete `\n\n`-terminated events. A `UsageScanner` inspects each
//! released event's `data:` payloads for the terminal usage object without
//! modifying the bytes forwarded to the client.

use crate::usage::{TokenUsage, extract_usage};
use bytes::{Bytes, BytesMut};
use futures_util::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};

/// A stream wrapper that buffers SSE events until they are complete.
///
/// Events are delimited by `\n\n`; consumers never see a partially
/// transmitted `data:` line. Whatever remains when the upstream closes is
/// flushed as-is.
pub struct SseBufferedStream<S> {
    inner: S,
    buffer: BytesMut,
}

impl<S> SseBufferedStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buffer: BytesMut::new(),
        }
    }
}

impl<S, E> Stream for SseBufferedStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<Bytes, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        loop {
            if let Some(pos) = this.buffer.windows(2).position(|w| w == b"\n\n") {
                let event = this.buffer.split_to(pos + 2);
                return Poll::Ready(Some(Ok(event.freeze())));
            }
            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    this.buffer.extend_from_slice(&chunk);
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(None) => {
                    if this.buffer.is_empty() {
                        return Poll::Ready(None);
                    }
                    return Poll::Ready(Some(Ok(this.buffer.split().freeze())));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Accumulates the most recent `usage` and `model` seen in a stream of SSE
/// events. OpenAI-style streams attach usage to the final content frame
/// before the `[DONE]` sentinel; scanning every frame and keeping the last
/// one handles providers that emit it earlier too.
#[derive(Debug, Default)]
pub struct UsageScanner {
    usage: Option<TokenUsage>,
    model: Option<String>,
}

impl UsageScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inspect one complete SSE event (possibly several `data:` lines).
    pub fn observe(&mut self, event: &[u8]) {
        let Ok(text) = std::str::from_utf8(event) else {
            return;
        };
        for line in text.lines() {
            let Some(payload) = line.strip_prefix("data:") else {
                continue;
            };
            let payload = payload.trim();
            if payload.is_empty() || payload == "[DONE]" {
                continue;
            }
            let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) else {
                continue;
            };
            if let Some((tokens, model)) = extract_usage(&value) {
                self.usage = Some(tokens);
                if model.is_some() {
                    self.model = model;
                }
            } else if self.model.is_none() {
                // Delta frames carry the model even before usage appears.
                if let Some(model) = value.get("model").and_then(serde_json::Value::as_str) {
                    self.model = Some(model.to_string());
                }
            }
        }
    }

    /// The final `(usage, model)` observation, if any usage frame arrived.
    pub fn finish(self) -> Option<(TokenUsage, Option<String>)> {
        self.usage.map(|u| (u, self.model))
    }
}
