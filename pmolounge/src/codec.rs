//! Chunk framing used by the bind endpoint
//!
//! A bind response body is a sequence of chunks:
//!
//! ```text
//! <decimal length>\n<payload of that many bytes>
//! ```
//!
//! Each payload is a JSON array of `[index, [command, arg...]]` tuples.
//! Arguments that are strings holding JSON are double encoded by the server;
//! they are expanded here so consumers always see structured values.
//!
//! The declared length is not always exact (the server counts characters,
//! not bytes, and some responses overshoot by a few bytes). When the declared
//! length does not delimit a valid payload the decoder falls back to reading
//! the first complete JSON value at that position.

use crate::models::InboundMessage;
use bytes::{Buf, BytesMut};
use serde_json::Value;
use tracing::{debug, warn};

/// Result of decoding one buffer
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Decoded {
    /// Messages in wire order
    pub messages: Vec<InboundMessage>,
    /// Bytes fully consumed; anything after this is an incomplete chunk
    pub consumed: usize,
}

/// Decode every complete chunk in `buf`.
///
/// Malformed chunks are logged and skipped. Decoding stops at a truncated
/// trailing chunk, which is reported through [`Decoded::consumed`] and never
/// partially emitted.
pub fn decode_chunks(buf: &[u8]) -> Decoded {
    let mut messages = Vec::new();
    let mut pos = 0;

    loop {
        while pos < buf.len() && buf[pos].is_ascii_whitespace() {
            pos += 1;
        }
        if pos >= buf.len() {
            break;
        }

        let Some(newline) = buf[pos..].iter().position(|&b| b == b'\n') else {
            if !buf[pos..].iter().all(u8::is_ascii_digit) {
                warn!(bytes = buf.len() - pos, "Dropping unframed trailing data");
                pos = buf.len();
            }
            break;
        };

        let header = &buf[pos..pos + newline];
        let Some(declared) = parse_length(header) else {
            warn!(
                header = %String::from_utf8_lossy(header),
                "Invalid chunk length, dropping rest of buffer"
            );
            pos = buf.len();
            break;
        };

        let start = pos + newline + 1;
        let available = buf.len() - start;

        if declared > available {
            match first_json_value(&buf[start..]) {
                Some((payload, used)) => {
                    debug!(declared, actual = used, "Chunk shorter than declared length");
                    messages.extend(payload_messages(payload));
                    pos = start + used;
                    continue;
                }
                None => {
                    debug!(declared, available, "Truncated chunk, waiting for more data");
                    break;
                }
            }
        }

        let end = start + declared;
        match serde_json::from_slice::<Value>(&buf[start..end]) {
            Ok(payload) => {
                messages.extend(payload_messages(payload));
                pos = end;
            }
            Err(strict_err) => match first_json_value(&buf[start..]) {
                Some((payload, used)) => {
                    debug!(declared, actual = used, "Chunk length mismatch, resynchronised");
                    messages.extend(payload_messages(payload));
                    pos = start + used;
                }
                None => {
                    warn!(error = %strict_err, length = declared, "Skipping malformed chunk");
                    pos = end;
                }
            },
        }
    }

    Decoded {
        messages,
        consumed: pos,
    }
}

/// Frame a batch of messages as a single chunk
pub fn encode_chunk(messages: &[InboundMessage]) -> String {
    let tuples: Vec<Value> = messages
        .iter()
        .map(|msg| {
            let mut body = Vec::with_capacity(msg.args.len() + 1);
            body.push(Value::String(msg.command.clone()));
            body.extend(msg.args.iter().cloned());
            Value::Array(vec![Value::from(msg.index), Value::Array(body)])
        })
        .collect();
    let payload = Value::Array(tuples).to_string();
    format!("{}\n{}", payload.len(), payload)
}

/// Incremental decoder that keeps incomplete chunks between reads
#[derive(Debug, Default)]
pub struct ChunkDecoder {
    buffer: BytesMut,
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `data` and return every message completed by it
    pub fn feed(&mut self, data: &[u8]) -> Vec<InboundMessage> {
        self.buffer.extend_from_slice(data);
        let decoded = decode_chunks(&self.buffer);
        self.buffer.advance(decoded.consumed);
        decoded.messages
    }

    /// Bytes held back waiting for the rest of a chunk
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// End of stream: report and drop whatever is still buffered
    pub fn finish(self) -> usize {
        let dropped = self.buffer.len();
        if dropped > 0 {
            warn!(bytes = dropped, "Response ended inside a chunk, dropping it");
        }
        dropped
    }
}

fn parse_length(header: &[u8]) -> Option<usize> {
    let header = header.trim_ascii();
    if header.is_empty() || !header.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(header).ok()?.parse().ok()
}

fn first_json_value(data: &[u8]) -> Option<(Value, usize)> {
    let mut stream = serde_json::Deserializer::from_slice(data).into_iter::<Value>();
    match stream.next() {
        Some(Ok(value @ Value::Array(_))) => Some((value, stream.byte_offset())),
        _ => None,
    }
}

fn payload_messages(payload: Value) -> Vec<InboundMessage> {
    let Value::Array(tuples) = payload else {
        warn!("Chunk payload is not an array, skipping");
        return Vec::new();
    };
    tuples.into_iter().filter_map(tuple_message).collect()
}

fn tuple_message(tuple: Value) -> Option<InboundMessage> {
    let parsed = match &tuple {
        Value::Array(parts) if parts.len() == 2 => {
            match (parts[0].as_i64(), parts[1].as_array()) {
                (Some(index), Some(body)) => body.split_first().and_then(|(cmd, args)| {
                    cmd.as_str().map(|command| {
                        InboundMessage::new(index, command, args.iter().map(expand_arg).collect())
                    })
                }),
                _ => None,
            }
        }
        _ => None,
    };

    if parsed.is_none() {
        warn!(%tuple, "Skipping malformed message tuple");
    }
    parsed
}

fn expand_arg(arg: &Value) -> Value {
    match arg {
        Value::String(s) if s.contains('"') => {
            serde_json::from_str(s).unwrap_or_else(|_| arg.clone())
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_noop_scenario() {
        let decoded = decode_chunks(b"17\n[[6,[\"noop\"]]\n]\n");
        assert_eq!(decoded.messages, vec![InboundMessage::new(6, "noop", vec![])]);
        assert_eq!(decoded.consumed, 19);
    }

    #[test]
    fn test_session_bootstrap_chunk() {
        let body = r#"[[0,["c","8F0A2D6E9C4B1A37","",8]],[1,["S","7d2c9b0e1f"]]]"#;
        let buf = format!("{}\n{}", body.len(), body);
        let decoded = decode_chunks(buf.as_bytes());

        assert_eq!(decoded.messages.len(), 2);
        assert_eq!(decoded.messages[0].command, "c");
        assert_eq!(decoded.messages[0].first_str(), Some("8F0A2D6E9C4B1A37"));
        assert_eq!(decoded.messages[1].index, 1);
        assert_eq!(decoded.messages[1].args, vec![json!("7d2c9b0e1f")]);
        assert_eq!(decoded.consumed, buf.len());
    }

    #[test]
    fn test_round_trip_multiple_chunks() {
        let first = vec![
            InboundMessage::new(3, "remoteConnected", vec![json!({"name": "Pixel", "app": "android"})]),
            InboundMessage::new(4, "getNowPlaying", vec![]),
        ];
        let second = vec![InboundMessage::new(
            5,
            "setPlaylist",
            vec![json!({"videoId": "dQw4w9WgXcQ", "currentTime": "12.5"})],
        )];

        let buf = format!("{}{}", encode_chunk(&first), encode_chunk(&second));
        let decoded = decode_chunks(buf.as_bytes());

        let expected: Vec<_> = first.into_iter().chain(second).collect();
        assert_eq!(decoded.messages, expected);
    }

    #[test]
    fn test_double_encoded_args_are_expanded() {
        let inner = json!({"videoId": "abc", "currentTime": "3"}).to_string();
        let payload = json!([[9, ["setVideo", inner]]]).to_string();
        let buf = format!("{}\n{}", payload.len(), payload);

        let decoded = decode_chunks(buf.as_bytes());
        assert_eq!(decoded.messages[0].field("videoId"), Some(&json!("abc")));
    }

    #[test]
    fn test_string_with_quote_that_is_not_json_is_kept() {
        let payload = json!([[2, ["onUserActivity", "say \"hi"]]]).to_string();
        let buf = format!("{}\n{}", payload.len(), payload);
        let decoded = decode_chunks(buf.as_bytes());
        assert_eq!(decoded.messages[0].args, vec![json!("say \"hi")]);
    }

    #[test]
    fn test_malformed_chunk_is_skipped() {
        let good1 = encode_chunk(&[InboundMessage::new(1, "play", vec![])]);
        let good2 = encode_chunk(&[InboundMessage::new(2, "pause", vec![])]);
        let buf = format!("{good1}7\n{{bad::}}{good2}");

        let decoded = decode_chunks(buf.as_bytes());
        let commands: Vec<_> = decoded.messages.iter().map(|m| m.command.as_str()).collect();
        assert_eq!(commands, vec!["play", "pause"]);
        assert_eq!(decoded.consumed, buf.len());
    }

    #[test]
    fn test_malformed_tuple_is_skipped_inside_valid_chunk() {
        let payload = r#"[[1,["play"]],["oops"],[2,["pause"]]]"#;
        let buf = format!("{}\n{}", payload.len(), payload);
        let decoded = decode_chunks(buf.as_bytes());
        assert_eq!(decoded.messages.len(), 2);
    }

    #[test]
    fn test_truncated_trailing_chunk_is_not_emitted() {
        let complete = encode_chunk(&[InboundMessage::new(1, "play", vec![])]);
        let buf = format!("{complete}40\n[[2,[\"pause\"]");

        let decoded = decode_chunks(buf.as_bytes());
        assert_eq!(decoded.messages.len(), 1);
        assert_eq!(decoded.consumed, complete.len());
    }

    #[test]
    fn test_empty_and_whitespace_buffers() {
        assert_eq!(decode_chunks(b"").messages.len(), 0);
        let decoded = decode_chunks(b"\n\n  ");
        assert!(decoded.messages.is_empty());
        assert_eq!(decoded.consumed, 4);
    }

    #[test]
    fn test_incremental_decoder_buffers_across_reads() {
        let chunk = encode_chunk(&[
            InboundMessage::new(7, "seekTo", vec![json!({"newTime": "30"})]),
            InboundMessage::new(8, "play", vec![]),
        ]);
        let (head, tail) = chunk.as_bytes().split_at(chunk.len() / 2);

        let mut decoder = ChunkDecoder::new();
        assert!(decoder.feed(head).is_empty());
        assert_eq!(decoder.pending(), head.len());

        let messages = decoder.feed(tail);
        assert_eq!(messages.len(), 2);
        assert_eq!(decoder.pending(), 0);
        assert_eq!(decoder.finish(), 0);
    }

    #[test]
    fn test_incremental_decoder_split_inside_length_line() {
        let chunk = encode_chunk(&[InboundMessage::new(1, "noop", vec![])]);
        let mut decoder = ChunkDecoder::new();
        assert!(decoder.feed(&chunk.as_bytes()[..1]).is_empty());
        assert_eq!(decoder.feed(&chunk.as_bytes()[1..]).len(), 1);
    }

    #[test]
    fn test_finish_reports_dropped_bytes() {
        let mut decoder = ChunkDecoder::new();
        decoder.feed(b"50\n[[1,");
        assert_eq!(decoder.finish(), 7);
    }
}
