// SPDX-License-Identifier: AGPL-3.0-or-later

//! The line protocol: one message per `\n`-terminated line, fields separated
//! by colons. Insert text travels escaped so that it can carry arbitrary
//! bytes without breaking the framing; everything else is plain decimal or
//! raw bytes.
//!
//! ```text
//! client -> server   new:<display_name>
//!                    s:<seq>:<parent_seq>:<parent_editor>:<i|d>:<idx>:<arg>
//!                    k:<server_seq>            (reserved)
//! server -> client   <editor_id>:<secret>:<latest_seq>:<encoded_text>
//!                    a:<seq>
//!                    x:<server_seq>:<i|d>:<idx>:<arg>
//! ```

use crate::ot::Op;
use crate::types::{EditId, EditorId, ProtocolError};
use anyhow::bail;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

/// Inbound lines longer than this are a protocol violation.
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Escape insert text for the wire. Control bytes that would interfere with
/// framing or terminals are escaped; everything else passes through
/// verbatim, including colons and bytes above 127.
#[must_use]
pub fn encode_text(text: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    for &b in text {
        match b {
            0 => out.extend_from_slice(b"\\0"),
            8 => out.extend_from_slice(b"\\b"),
            9 => out.extend_from_slice(b"\\t"),
            10 => out.extend_from_slice(b"\\n"),
            13 => out.extend_from_slice(b"\\r"),
            b'\\' => out.extend_from_slice(b"\\\\"),
            1..=7 | 11 | 12 | 14..=31 | 127 => {
                out.extend_from_slice(format!("\\x{b:02x}").as_bytes());
            }
            _ => out.push(b),
        }
    }
    out
}

/// Undo [`encode_text`]. Hex digits are accepted in either case; any other
/// escape is an error.
pub fn decode_text(wire: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    fn nibble(b: u8) -> Result<u8, ProtocolError> {
        match b {
            b'0'..=b'9' => Ok(b - b'0'),
            b'a'..=b'f' => Ok(b - b'a' + 10),
            b'A'..=b'F' => Ok(b - b'A' + 10),
            _ => Err(ProtocolError::BadEncoding(
                "bad hex in '\\x' escape".into(),
            )),
        }
    }

    let mut out = Vec::with_capacity(wire.len());
    let mut i = 0;
    while i < wire.len() {
        let b = wire[i];
        i += 1;
        if b != b'\\' {
            out.push(b);
            continue;
        }
        let Some(&escape) = wire.get(i) else {
            return Err(ProtocolError::BadEncoding("unmatched '\\'".into()));
        };
        i += 1;
        match escape {
            b'0' => out.push(0),
            b'b' => out.push(8),
            b't' => out.push(9),
            b'n' => out.push(10),
            b'r' => out.push(13),
            b'\\' => out.push(b'\\'),
            b'x' => {
                let (Some(&hi), Some(&lo)) = (wire.get(i), wire.get(i + 1)) else {
                    return Err(ProtocolError::BadEncoding(
                        "incomplete '\\x' escape".into(),
                    ));
                };
                i += 2;
                out.push(16 * nibble(hi)? + nibble(lo)?);
            }
            other => {
                return Err(ProtocolError::BadEncoding(format!(
                    "unknown escape '\\{}'",
                    other as char
                )));
            }
        }
    }
    Ok(out)
}

fn parse_number(field: &[u8], what: &str) -> Result<usize, ProtocolError> {
    std::str::from_utf8(field)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ProtocolError::BadEncoding(format!("bad {what}: {:?}", field.escape_ascii().to_string())))
}

fn decode_op(typ: &[u8], idx: &[u8], arg: &[u8]) -> Result<Op, ProtocolError> {
    let idx = parse_number(idx, "operation index")?;
    match typ {
        b"i" => Ok(Op::Insert {
            idx,
            text: decode_text(arg)?,
        }),
        b"d" => Ok(Op::Delete {
            idx,
            nchars: parse_number(arg, "deletion length")?,
            recovered: None,
        }),
        other => Err(ProtocolError::BadEncoding(format!(
            "unknown operation type {:?}",
            other.escape_ascii().to_string()
        ))),
    }
}

fn encode_op(op: &Op, out: &mut Vec<u8>) {
    match op {
        Op::Insert { idx, text } => {
            out.extend_from_slice(format!("i:{idx}:").as_bytes());
            out.extend_from_slice(&encode_text(text));
        }
        Op::Delete { idx, nchars, .. } => {
            out.extend_from_slice(format!("d:{idx}:{nchars}").as_bytes());
        }
    }
}

/// An edit submission as it arrives on the wire. The submitting editor is
/// implied by the connection, so only the sequence number travels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub seq: usize,
    pub parent: EditId,
    pub op: Op,
}

/// A parsed streaming line from a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Submit(Submission),
    /// Reserved for a future protocol extension; currently ignored.
    Ack { seq: usize },
}

impl ClientMessage {
    pub fn parse(line: &[u8]) -> Result<Self, ProtocolError> {
        let mut fields = line.splitn(7, |b| *b == b':');
        let typ = fields.next().unwrap_or_default();
        match typ {
            b"s" => {
                let rest: Vec<&[u8]> = fields.collect();
                let [seq, parent_seq, parent_editor, op_typ, idx, arg] = rest[..] else {
                    return Err(ProtocolError::BadEncoding(
                        "submission has wrong field count".into(),
                    ));
                };
                Ok(Self::Submit(Submission {
                    seq: parse_number(seq, "edit seq")?,
                    parent: EditId::new(
                        parse_number(parent_seq, "parent seq")?,
                        parse_number(parent_editor, "parent editor")?,
                    ),
                    op: decode_op(op_typ, idx, arg)?,
                }))
            }
            b"k" => {
                let rest: Vec<&[u8]> = fields.collect();
                let [seq] = rest[..] else {
                    return Err(ProtocolError::BadEncoding(
                        "acknowledgement has wrong field count".into(),
                    ));
                };
                Ok(Self::Ack {
                    seq: parse_number(seq, "acknowledged seq")?,
                })
            }
            other => Err(ProtocolError::BadEncoding(format!(
                "unknown message type {:?}",
                other.escape_ascii().to_string()
            ))),
        }
    }
}

/// Parse the one-line negotiation a client opens with, returning its display
/// name. Reconnection (`old:`) is not supported; every connection is fresh.
pub fn parse_hello(line: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut fields = line.splitn(2, |b| *b == b':');
    match (fields.next().unwrap_or_default(), fields.next()) {
        (b"new", Some(name)) => Ok(name.to_vec()),
        (b"old", Some(_)) => Err(ProtocolError::BadEncoding(
            "reconnect negotiation is not supported".into(),
        )),
        _ => Err(ProtocolError::BadEncoding(format!(
            "expected negotiation, got {:?}",
            line.escape_ascii().to_string()
        ))),
    }
}

/// A line from the server to one client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// Negotiation reply: assigned editor id, reconnect secret, the latest
    /// history seq, and the current document (escaped).
    Welcome {
        editor: EditorId,
        secret: String,
        seq: usize,
        text: Vec<u8>,
    },
    /// Echo of an accepted (or consumed-and-dropped) submission id.
    Accepted { seq: usize },
    /// Another client's edit, rebased into history coordinates.
    External { seq: usize, op: Op },
}

impl ServerMessage {
    /// The wire form of this message, without the trailing newline.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Self::Welcome {
                editor,
                secret,
                seq,
                text,
            } => {
                out.extend_from_slice(format!("{editor}:{secret}:{seq}:").as_bytes());
                out.extend_from_slice(&encode_text(text));
            }
            Self::Accepted { seq } => {
                out.extend_from_slice(format!("a:{seq}").as_bytes());
            }
            Self::External { seq, op } => {
                out.extend_from_slice(format!("x:{seq}:").as_bytes());
                encode_op(op, &mut out);
            }
        }
        out
    }
}

/// Framing for one connection: newline-delimited byte lines in, encoded
/// [`ServerMessage`] lines out. The inbound side is byte-oriented because
/// escaped insert text may legally contain non-UTF-8 bytes.
#[derive(Debug, Default)]
pub struct WireCodec;

impl Decoder for WireCodec {
    type Item = Vec<u8>;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(pos) = src.iter().position(|b| *b == b'\n') {
            let line = src.split_to(pos + 1);
            return Ok(Some(line[..pos].to_vec()));
        }
        if src.len() > MAX_LINE_LENGTH {
            bail!("line exceeds {MAX_LINE_LENGTH} bytes");
        }
        Ok(None)
    }
}

impl Encoder<ServerMessage> for WireCodec {
    type Error = anyhow::Error;

    fn encode(&mut self, item: ServerMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&item.encode());
        dst.extend_from_slice(b"\n");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::factories::*;
    use crate::types::SERVER;
    use pretty_assertions::assert_eq;

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(encode_text(b"hello world"), b"hello world");
        assert_eq!(decode_text(b"hello world").unwrap(), b"hello world");
    }

    #[test]
    fn named_escapes_round_trip() {
        let raw = b"\x00\x08\x09\x0a\x0d\\";
        let encoded = encode_text(raw);
        assert_eq!(encoded, b"\\0\\b\\t\\n\\r\\\\");
        assert_eq!(decode_text(&encoded).unwrap(), raw);
    }

    #[test]
    fn control_bytes_hex_encode() {
        assert_eq!(encode_text(b"\x01\x1f\x7f"), b"\\x01\\x1f\\x7f");
        assert_eq!(decode_text(b"\\x01\\x1f\\x7f").unwrap(), b"\x01\x1f\x7f");
    }

    #[test]
    fn hex_digits_accepted_in_both_cases() {
        assert_eq!(decode_text(b"\\x1B").unwrap(), b"\x1b");
        assert!(decode_text(b"\\X1b").is_err());
    }

    #[test]
    fn colons_and_high_bytes_are_verbatim() {
        assert_eq!(encode_text(b"a:b"), b"a:b");
        assert_eq!(encode_text(&[0xc3, 0xa4]), [0xc3, 0xa4]);
        assert_eq!(decode_text(&[0xff]).unwrap(), [0xff]);
    }

    #[test]
    fn every_byte_round_trips() {
        let all: Vec<u8> = (0..=255).collect();
        assert_eq!(decode_text(&encode_text(&all)).unwrap(), all);
    }

    #[test]
    fn bad_escapes_are_rejected() {
        assert!(decode_text(b"abc\\").is_err());
        assert!(decode_text(b"\\q").is_err());
        assert!(decode_text(b"\\x1").is_err());
        assert!(decode_text(b"\\xgg").is_err());
    }

    #[test]
    fn parses_insert_submission() {
        let message = ClientMessage::parse(b"s:0:0:0:i:0:hello world").unwrap();
        assert_eq!(
            message,
            ClientMessage::Submit(Submission {
                seq: 0,
                parent: EditId::new(0, SERVER),
                op: insert(0, "hello world"),
            })
        );
    }

    #[test]
    fn parses_insert_submission_with_colons_in_text() {
        let message = ClientMessage::parse(b"s:3:7:0:i:5:a:b:c").unwrap();
        assert_eq!(
            message,
            ClientMessage::Submit(Submission {
                seq: 3,
                parent: EditId::new(7, SERVER),
                op: insert(5, "a:b:c"),
            })
        );
    }

    #[test]
    fn parses_delete_submission() {
        let message = ClientMessage::parse(b"s:2:1:4:d:5:6").unwrap();
        assert_eq!(
            message,
            ClientMessage::Submit(Submission {
                seq: 2,
                parent: EditId::new(1, 4),
                op: delete(5, 6),
            })
        );
    }

    #[test]
    fn parses_reserved_ack() {
        assert_eq!(
            ClientMessage::parse(b"k:17").unwrap(),
            ClientMessage::Ack { seq: 17 }
        );
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(ClientMessage::parse(b"").is_err());
        assert!(ClientMessage::parse(b"z:1").is_err());
        assert!(ClientMessage::parse(b"s:1:2").is_err());
        assert!(ClientMessage::parse(b"s:1:2:0:q:0:x").is_err());
        assert!(ClientMessage::parse(b"s:one:2:0:i:0:x").is_err());
        assert!(ClientMessage::parse(b"k:").is_err());
    }

    #[test]
    fn parses_negotiation() {
        assert_eq!(parse_hello(b"new:alice").unwrap(), b"alice");
        assert!(parse_hello(b"old:1:secret").is_err());
        assert!(parse_hello(b"s:0:0:0:i:0:x").is_err());
    }

    #[test]
    fn encodes_welcome_with_escaped_text() {
        let message = ServerMessage::Welcome {
            editor: 1,
            secret: "secret".into(),
            seq: 1,
            text: b"hello world\n".to_vec(),
        };
        assert_eq!(message.encode(), b"1:secret:1:hello world\\n");
    }

    #[test]
    fn encodes_accept_and_external() {
        assert_eq!(ServerMessage::Accepted { seq: 4 }.encode(), b"a:4");
        assert_eq!(
            ServerMessage::External {
                seq: 9,
                op: insert(3, "hi\n"),
            }
            .encode(),
            b"x:9:i:3:hi\\n"
        );
        assert_eq!(
            ServerMessage::External {
                seq: 10,
                op: delete(5, 6),
            }
            .encode(),
            b"x:10:d:5:6"
        );
    }

    #[test]
    fn decoder_frames_lines() {
        let mut codec = WireCodec;
        let mut buf = BytesMut::from(&b"a:1\nx:2:i:0:ab"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(b"a:1".to_vec()));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"c\n");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(b"x:2:i:0:abc".to_vec()));
    }
}
