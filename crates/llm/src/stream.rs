//! Streaming reply collection and server-sent-event decoding.

use std::collections::VecDeque;

use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use proto::LlmError;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::tokens::TokenAccountant;

/// Ordered text deltas from a provider.
pub type ChunkStream = BoxStream<'static, Result<String, LlmError>>;

/// Concatenates a [`ChunkStream`] into the final reply.
///
/// Input tokens must already be accounted by the caller; the collector only
/// records the completion estimate once the stream ends.
pub struct StreamCollector<'a> {
    tokens: &'a TokenAccountant,
    sink: Option<&'a UnboundedSender<String>>,
}

impl<'a> StreamCollector<'a> {
    pub fn new(tokens: &'a TokenAccountant) -> Self {
        Self { tokens, sink: None }
    }

    /// Forwards every chunk to `sink` as it arrives.
    pub fn with_sink(mut self, sink: Option<&'a UnboundedSender<String>>) -> Self {
        self.sink = sink;
        self
    }

    /// Drains `chunks` and returns the trimmed reply.
    ///
    /// A chunk error aborts collection. An empty reply is a
    /// [`LlmError::Validation`] error.
    pub async fn collect(self, mut chunks: ChunkStream) -> Result<String, LlmError> {
        let mut completion = String::new();
        let mut received = 0usize;
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            received += 1;
            if let Some(sink) = self.sink {
                // The observer may have gone away; collection continues.
                let _ = sink.send(chunk.clone());
            }
            completion.push_str(&chunk);
        }

        let reply = completion.trim();
        if reply.is_empty() {
            return Err(LlmError::Validation(
                "Empty response from streaming LLM".to_string(),
            ));
        }

        let estimated = self.tokens.counter().count_text(&completion);
        debug!(chunks = received, estimated, "Stream completed");
        self.tokens.record_completion(estimated);
        Ok(reply.to_string())
    }
}

/// Incremental `text/event-stream` parser yielding each event's data field.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    /// Feeds raw bytes and returns the data of every completed event.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some((end, separator)) = find_event_end(&self.buffer) {
            let raw: Vec<u8> = self.buffer.drain(..end + separator).collect();
            if let Some(data) = event_data(&String::from_utf8_lossy(&raw[..end])) {
                events.push(data);
            }
        }
        events
    }

    /// Flushes a trailing event that was not terminated by a blank line.
    pub fn finish(&mut self) -> Option<String> {
        let raw = std::mem::take(&mut self.buffer);
        event_data(&String::from_utf8_lossy(&raw))
    }
}

fn find_event_end(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n").map(|i| (i, 2));
    let crlf = buffer.windows(4).position(|w| w == b"\r\n\r\n").map(|i| (i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn event_data(event: &str) -> Option<String> {
    let data: Vec<&str> = event
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|value| value.strip_prefix(' ').unwrap_or(value))
        .collect();
    (!data.is_empty()).then(|| data.join("\n"))
}

/// Turns a byte stream into a stream of SSE data payloads.
pub fn decode_sse<S, B, E>(body: S) -> BoxStream<'static, Result<String, LlmError>>
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: std::fmt::Display + Send,
{
    let state = (Box::pin(body), SseDecoder::default(), VecDeque::new(), false);
    stream::unfold(
        state,
        |(mut body, mut decoder, mut pending, mut done)| async move {
            loop {
                if let Some(data) = pending.pop_front() {
                    return Some((Ok(data), (body, decoder, pending, done)));
                }
                if done {
                    return None;
                }
                match body.next().await {
                    Some(Ok(bytes)) => pending.extend(decoder.push(bytes.as_ref())),
                    Some(Err(err)) => {
                        done = true;
                        let error = LlmError::Api(format!("Stream read failed: {err}"));
                        return Some((Err(error), (body, decoder, pending, done)));
                    }
                    None => {
                        done = true;
                        pending.extend(decoder.finish());
                    }
                }
            }
        },
    )
    .boxed()
}
