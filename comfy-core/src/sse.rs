//! Decode stage for the upstream completion stream.
//!
//! The upstream speaks line-delimited server-sent events:
//!
//! ```text
//! data: {"choices":[{"delta":{"content":"Hel"}}]}
//! data: {"choices":[{"delta":{"content":"lo"}}]}
//! data: [DONE]
//! ```
//!
//! Lines without the `data: ` marker are ignored. A read boundary can fall in
//! the middle of a line (or of a multi-byte character), so raw bytes are
//! buffered until a newline arrives. Payloads that do not match the delta
//! schema are dropped without ending the stream.

use std::collections::VecDeque;
use std::fmt::Display;
use std::mem;
use std::pin::Pin;

use bytes::Bytes;
use futures::stream::{unfold, Stream, StreamExt};
use serde::Deserialize;

use crate::completion::{CompletionError, FragmentStream};

pub const DATA_PREFIX: &str = "data: ";
pub const DONE_TOKEN: &str = "[DONE]";

/// What the relay sees from the upstream, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamEvent {
    /// A non-empty piece of generated text.
    Fragment(String),
    /// The explicit termination token.
    Done,
}

/// A complete `data:` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseLine {
    Data(String),
    Done,
}

/// Buffers raw bytes and yields complete `data:` lines.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    buffer: Vec<u8>,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseLine> {
        self.buffer.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let rest = self.buffer.split_off(pos + 1);
            let line = mem::replace(&mut self.buffer, rest);
            if let Some(parsed) = classify(&String::from_utf8_lossy(&line[..pos])) {
                lines.push(parsed);
            }
        }
        lines
    }

    /// Whatever is left once the byte stream ends, treated as a final line.
    pub fn flush(&mut self) -> Vec<SseLine> {
        let remaining = mem::take(&mut self.buffer);
        classify(&String::from_utf8_lossy(&remaining))
            .into_iter()
            .collect()
    }
}

fn classify(line: &str) -> Option<SseLine> {
    let payload = line.trim_end_matches('\r').strip_prefix(DATA_PREFIX)?.trim();
    if payload == DONE_TOKEN {
        Some(SseLine::Done)
    } else if payload.is_empty() {
        None
    } else {
        Some(SseLine::Data(payload.to_string()))
    }
}

#[derive(Debug, Default, Deserialize)]
struct DeltaChunk {
    #[serde(default)]
    choices: Vec<DeltaChoice>,
}

#[derive(Debug, Default, Deserialize)]
struct DeltaChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

/// Text delta of the first choice, if the payload has one.
pub fn parse_delta(payload: &str) -> Option<String> {
    let chunk: DeltaChunk = match serde_json::from_str(payload) {
        Ok(c) => c,
        Err(e) => {
            tracing::trace!(error = %e, "Skipping undecodable stream line");
            return None;
        }
    };
    chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|s| !s.is_empty())
}

struct DecodeState {
    bytes: Pin<Box<dyn Stream<Item = Result<Bytes, CompletionError>> + Send>>,
    parser: SseLineBuffer,
    pending: VecDeque<Result<UpstreamEvent, CompletionError>>,
    finished: bool,
}

impl DecodeState {
    fn push_lines(&mut self, lines: Vec<SseLine>) {
        for line in lines {
            match line {
                SseLine::Data(payload) => {
                    if let Some(text) = parse_delta(&payload) {
                        self.pending.push_back(Ok(UpstreamEvent::Fragment(text)));
                    }
                }
                SseLine::Done => {
                    self.pending.push_back(Ok(UpstreamEvent::Done));
                    self.finished = true;
                    return;
                }
            }
        }
    }
}

/// Turn a raw upstream byte stream into ordered [`UpstreamEvent`]s.
///
/// The stream ends after `Done`, after the byte stream ends, or after the
/// single `Err` produced by a failed read.
pub fn decode_event_stream<S, E>(byte_stream: S) -> FragmentStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display,
{
    let bytes = byte_stream
        .map(|r| r.map_err(|e| CompletionError::Stream(e.to_string())))
        .boxed();

    let state = DecodeState {
        bytes,
        parser: SseLineBuffer::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    let stream = unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    let lines = state.parser.feed(&chunk);
                    state.push_lines(lines);
                }
                Some(Err(e)) => {
                    state.finished = true;
                    return Some((Err(e), state));
                }
                None => {
                    let lines = state.parser.flush();
                    state.push_lines(lines);
                    state.finished = true;
                }
            }
        }
    });

    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn delta(text: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({"choices": [{"delta": {"content": text}}]})
        )
    }

    async fn collect(chunks: Vec<Vec<u8>>) -> Vec<Result<UpstreamEvent, CompletionError>> {
        let bytes = stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok::<Bytes, std::io::Error>(Bytes::from(c))),
        );
        decode_event_stream(bytes).collect().await
    }

    fn fragments(events: &[Result<UpstreamEvent, CompletionError>]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                Ok(UpstreamEvent::Fragment(t)) => Some(t.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_line_buffer_ignores_non_data_lines() {
        let mut buf = SseLineBuffer::new();
        let lines = buf.feed(b": keep-alive\nevent: message\nid: 7\ndata: {\"a\":1}\n");
        assert_eq!(lines, vec![SseLine::Data("{\"a\":1}".to_string())]);
    }

    #[test]
    fn test_line_buffer_holds_partial_line() {
        let mut buf = SseLineBuffer::new();
        assert!(buf.feed(b"data: {\"choi").is_empty());
        let lines = buf.feed(b"ces\":[]}\r\n");
        assert_eq!(lines, vec![SseLine::Data("{\"choices\":[]}".to_string())]);
    }

    #[test]
    fn test_line_buffer_flush_emits_unterminated_done() {
        let mut buf = SseLineBuffer::new();
        assert!(buf.feed(b"data: [DONE]").is_empty());
        assert_eq!(buf.flush(), vec![SseLine::Done]);
        assert!(buf.flush().is_empty());
    }

    #[test]
    fn test_parse_delta_schema() {
        assert_eq!(
            parse_delta(r#"{"choices":[{"delta":{"content":"hi"}}]}"#),
            Some("hi".to_string())
        );
        assert_eq!(parse_delta(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#), None);
        assert_eq!(parse_delta(r#"{"choices":[{"delta":{"content":""}}]}"#), None);
        assert_eq!(parse_delta(r#"{"choices":[]}"#), None);
        assert_eq!(parse_delta(r#"{"choices":"nope"}"#), None);
        assert_eq!(parse_delta(r#"{"choices":[{"delta":{"cont"#), None);
        assert_eq!(parse_delta("{}"), None);
    }

    #[tokio::test]
    async fn test_fragments_in_order_then_done() {
        let events = collect(vec![
            delta("Hel").into_bytes(),
            delta("lo").into_bytes(),
            b"data: [DONE]\n\n".to_vec(),
        ])
        .await;

        assert_eq!(fragments(&events), vec!["Hel", "lo"]);
        assert!(matches!(events.last(), Some(Ok(UpstreamEvent::Done))));
    }

    #[tokio::test]
    async fn test_payload_split_across_reads() {
        let whole = format!("{}{}data: [DONE]\n", delta("Hello"), delta(" world"));
        let (a, b) = whole.as_bytes().split_at(17);
        let events = collect(vec![a.to_vec(), b.to_vec()]).await;
        assert_eq!(fragments(&events), vec!["Hello", " world"]);
    }

    #[tokio::test]
    async fn test_multibyte_char_split_across_reads() {
        let whole = delta("café");
        let bytes = whole.as_bytes();
        let cut = whole.find('é').unwrap() + 1;
        let events = collect(vec![bytes[..cut].to_vec(), bytes[cut..].to_vec()]).await;
        assert_eq!(fragments(&events), vec!["café"]);
    }

    #[tokio::test]
    async fn test_malformed_line_does_not_abort() {
        let events = collect(vec![
            b"data: {not json}\n".to_vec(),
            delta("ok").into_bytes(),
        ])
        .await;
        assert_eq!(fragments(&events), vec!["ok"]);
        assert!(events.iter().all(|e| e.is_ok()));
    }

    #[tokio::test]
    async fn test_nothing_after_done_is_emitted() {
        let chunk = format!("data: [DONE]\n{}", delta("late"));
        let events = collect(vec![chunk.into_bytes()]).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Ok(UpstreamEvent::Done)));
    }

    #[tokio::test]
    async fn test_read_error_ends_stream() {
        let bytes = stream::iter(vec![
            Ok(Bytes::from(delta("partial"))),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
            Ok(Bytes::from(delta("never"))),
        ]);
        let events: Vec<_> = decode_event_stream(bytes).collect().await;
        assert_eq!(fragments(&events), vec!["partial"]);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], Err(CompletionError::Stream(_))));
    }
}
