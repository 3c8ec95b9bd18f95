use tracing::debug;

/// Literal payload some upstream providers send instead of a structured
/// `done` frame.
pub const DONE_SENTINEL: &str = "[DONE]";

/// One raw server-sent event, before its payloads are interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// Value of the `event:` field, if any.
    pub event: Option<String>,
    /// Every `data:` line in arrival order, with the prefix removed.
    pub data_lines: Vec<String>,
}

/// Incremental SSE decoder.
///
/// Bytes are buffered until a blank line closes a frame, so multi-byte UTF-8
/// characters split across network chunks are never decoded in halves.
#[derive(Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    /// Appends a network chunk and returns every frame it completed.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some((idx, delim_len)) = find_frame_delimiter(&self.buf) {
            let frame_bytes: Vec<u8> = self.buf.drain(..idx + delim_len).take(idx).collect();
            if let Some(frame) = parse_sse_frame(&frame_bytes) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flushes a trailing frame that was not closed by a blank line before the
    /// connection ended.
    pub fn finish(&mut self) -> Option<SseFrame> {
        let rest = std::mem::take(&mut self.buf);
        parse_sse_frame(&rest)
    }

    /// Number of buffered bytes not yet part of a complete frame.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }
}

fn find_frame_delimiter(buf: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i + 1 < buf.len() {
        if buf[i] == b'\n' && buf[i + 1] == b'\n' {
            return Some((i, 2));
        }
        if i + 3 < buf.len()
            && buf[i] == b'\r'
            && buf[i + 1] == b'\n'
            && buf[i + 2] == b'\r'
            && buf[i + 3] == b'\n'
        {
            return Some((i, 4));
        }
        i += 1;
    }
    None
}

fn parse_sse_frame(bytes: &[u8]) -> Option<SseFrame> {
    if bytes.is_empty() {
        return None;
    }
    let text = String::from_utf8_lossy(bytes);
    let mut event: Option<String> = None;
    let mut data_lines: Vec<String> = Vec::new();
    for raw_line in text.split('\n') {
        let line = raw_line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.trim().to_string());
            continue;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.to_string());
        }
    }
    if event.is_none() && data_lines.is_empty() {
        return None;
    }
    Some(SseFrame { event, data_lines })
}

/// A parsed chat-stream event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    /// The backend bound this stream to a persisted conversation.
    Session { session_id: String },
    /// A text fragment to append.
    Content { text: String },
    /// End of the response.
    Done,
    /// The backend reported a failure.
    Error { message: String },
    /// Well-formed frame of a kind the consumer does not act on.
    Unknown { kind: String },
}

impl StreamFrame {
    /// Returns `true` for frames that end the network phase.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamFrame::Done | StreamFrame::Error { .. })
    }
}

/// Interprets every payload of a raw frame, dropping the ones that do not
/// parse.
pub fn frames_from_sse(frame: &SseFrame) -> Vec<StreamFrame> {
    frame
        .data_lines
        .iter()
        .filter_map(|line| parse_payload(line))
        .collect()
}

/// Parses a single `data:` payload.
///
/// Returns `None` for empty, non-JSON or schema-invalid payloads.
pub fn parse_payload(payload: &str) -> Option<StreamFrame> {
    let payload = payload.trim();
    if payload.is_empty() {
        return None;
    }
    if payload == DONE_SENTINEL {
        return Some(StreamFrame::Done);
    }
    let value: serde_json::Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(e) => {
            debug!(error = %e, len = payload.len(), "skipping non-JSON SSE payload");
            return None;
        }
    };
    let frame = map_json_to_frame(&value);
    if frame.is_none() {
        debug!(len = payload.len(), "skipping schema-invalid SSE payload");
    }
    frame
}

fn map_json_to_frame(value: &serde_json::Value) -> Option<StreamFrame> {
    let kind = value.get("type").and_then(|v| v.as_str())?;
    let field = |name: &str| value.get(name).and_then(|v| v.as_str()).map(ToOwned::to_owned);
    match kind {
        "session" => field("sessionId").map(|session_id| StreamFrame::Session { session_id }),
        // Two upstream schemas name the text frame differently.
        "content" | "answer" => field("content").map(|text| StreamFrame::Content { text }),
        "done" => Some(StreamFrame::Done),
        "error" => field("message").map(|message| StreamFrame::Error { message }),
        other => Some(StreamFrame::Unknown {
            kind: other.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_decoder_handles_partial_chunk_boundaries() {
        let mut decoder = SseDecoder::default();
        let part1 = b"event: message\ndata: {\"type\":\"content\",\"content\":\"hel";
        let part2 = b"lo\"}\n\n";
        assert!(decoder.push_chunk(part1).is_empty());
        let frames = decoder.push_chunk(part2);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("message"));
        assert_eq!(
            frames_from_sse(&frames[0]),
            vec![StreamFrame::Content {
                text: "hello".into()
            }]
        );
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn sse_decoder_keeps_multibyte_characters_split_across_chunks() {
        let mut decoder = SseDecoder::default();
        let bytes = "data: {\"type\":\"content\",\"content\":\"合同\"}\n\n".as_bytes();
        let split = bytes.iter().position(|b| *b >= 0x80).expect("non-ascii byte") + 1;
        assert!(decoder.push_chunk(&bytes[..split]).is_empty());
        let frames = decoder.push_chunk(&bytes[split..]);
        assert_eq!(
            frames_from_sse(&frames[0]),
            vec![StreamFrame::Content {
                text: "合同".into()
            }]
        );
    }

    #[test]
    fn sse_decoder_accepts_crlf_delimiters_and_comments() {
        let mut decoder = SseDecoder::default();
        let frames = decoder.push_chunk(b": keep-alive\r\ndata: {\"type\":\"done\"}\r\n\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames_from_sse(&frames[0]), vec![StreamFrame::Done]);
    }

    #[test]
    fn finish_flushes_unterminated_trailing_frame() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push_chunk(b"data: [DONE]").is_empty());
        let frame = decoder.finish().expect("trailing frame");
        assert_eq!(frames_from_sse(&frame), vec![StreamFrame::Done]);
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn each_data_line_is_its_own_payload() {
        let mut decoder = SseDecoder::default();
        let frames = decoder.push_chunk(
            b"data: {\"type\":\"content\",\"content\":\"a\"}\ndata: {\"type\":\"answer\",\"content\":\"b\"}\nid: 7\n\n",
        );
        assert_eq!(
            frames_from_sse(&frames[0]),
            vec![
                StreamFrame::Content { text: "a".into() },
                StreamFrame::Content { text: "b".into() },
            ]
        );
    }

    #[test]
    fn maps_every_known_frame_kind() {
        assert_eq!(
            parse_payload(r#"{"type":"session","sessionId":"s-1"}"#),
            Some(StreamFrame::Session {
                session_id: "s-1".into()
            })
        );
        assert_eq!(
            parse_payload(r#"{"type":"answer","content":"hi"}"#),
            Some(StreamFrame::Content { text: "hi".into() })
        );
        assert_eq!(parse_payload(r#"{"type":"done"}"#), Some(StreamFrame::Done));
        assert_eq!(
            parse_payload(r#"{"type":"error","message":"upstream failed"}"#),
            Some(StreamFrame::Error {
                message: "upstream failed".into()
            })
        );
        assert_eq!(parse_payload("  [DONE]  "), Some(StreamFrame::Done));
    }

    #[test]
    fn unknown_kinds_are_kept_but_malformed_payloads_are_dropped() {
        assert_eq!(
            parse_payload(r#"{"type":"tool","content":"calling search"}"#),
            Some(StreamFrame::Unknown {
                kind: "tool".into()
            })
        );
        assert_eq!(parse_payload("not json"), None);
        assert_eq!(parse_payload(r#"{"content":"no type"}"#), None);
        assert_eq!(parse_payload(r#"{"type":"content","content":42}"#), None);
        assert_eq!(parse_payload(r#"{"type":"error"}"#), None);
        assert_eq!(parse_payload("   "), None);
    }

    #[test]
    fn terminal_frames() {
        assert!(StreamFrame::Done.is_terminal());
        assert!(StreamFrame::Error { message: "x".into() }.is_terminal());
        assert!(!StreamFrame::Content { text: "x".into() }.is_terminal());
    }
}
