//! # Framing Codec
//!
//! Encodes and decodes the wire frames that fit inside a single mesh
//! text-payload slot. All frames are ASCII, pipe-delimited; binary chunk
//! payloads are base64-encoded so they survive a text transport. See
//! SPEC_FULL.md §4.1 for the frame grammar.

use base64::Engine as _;

use crate::error::{Error, Result};

/// Default budget for a fully-encoded frame, in bytes. This is the mesh's
/// effective text payload slot, not to be confused with `chunk_payload_max`
/// (the pre-encoding chunk size), which is smaller to leave room for base64
/// expansion and frame overhead.
pub const DEFAULT_FRAME_BUDGET: usize = 200;

/// A parsed Z-Mesh wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Discovery probe: `P|<nonce>`
    Ping {
        /// Opaque token echoed back in the PONG.
        nonce: String,
    },
    /// Discovery reply: `O|<nonce>|<name>`
    Pong {
        /// The nonce from the triggering PING.
        nonce: String,
        /// The replying node's display name.
        name: String,
    },
    /// Start transfer: `B|<tid>|<total>|<filename>`
    Begin {
        /// Transfer id chosen by the sender.
        tid: String,
        /// Total number of chunks in this transfer.
        total: u16,
        /// Sanitized filename.
        filename: String,
    },
    /// Data chunk: `D|<tid>|<idx>|<b64payload>`
    Data {
        /// Transfer id.
        tid: String,
        /// Zero-based chunk index.
        idx: u16,
        /// Raw (decoded) chunk payload bytes.
        payload: Vec<u8>,
    },
    /// Positive acknowledgment: `A|<tid>|<idx>`
    Ack {
        /// Transfer id.
        tid: String,
        /// Acknowledged chunk index.
        idx: u16,
    },
    /// Explicit retransmit request: `N|<tid>|<idx>`
    Nak {
        /// Transfer id.
        tid: String,
        /// Missing chunk index.
        idx: u16,
    },
    /// Sender finished sending: `E|<tid>`
    End {
        /// Transfer id.
        tid: String,
    },
    /// Receiver final status: `F|<tid>|<status>`
    Fin {
        /// Transfer id.
        tid: String,
        /// `true` for `ok`, `false` for `err`.
        ok: bool,
    },
    /// Abort, either side: `X|<tid>|<reason>`
    Abt {
        /// Transfer id.
        tid: String,
        /// Human-readable abort reason.
        reason: String,
    },
}

impl Frame {
    /// Encode this frame to its wire form, rejecting it if the result would
    /// exceed `budget` bytes.
    pub fn encode(&self, budget: usize) -> Result<String> {
        let wire = match self {
            Frame::Ping { nonce } => {
                reject_pipe(nonce)?;
                format!("P|{nonce}")
            }
            Frame::Pong { nonce, name } => {
                reject_pipe(nonce)?;
                reject_pipe(name)?;
                format!("O|{nonce}|{name}")
            }
            Frame::Begin { tid, total, filename } => {
                reject_pipe(tid)?;
                reject_pipe(filename)?;
                format!("B|{tid}|{total}|{filename}")
            }
            Frame::Data { tid, idx, payload } => {
                reject_pipe(tid)?;
                let b64 = base64::engine::general_purpose::STANDARD.encode(payload);
                format!("D|{tid}|{idx}|{b64}")
            }
            Frame::Ack { tid, idx } => {
                reject_pipe(tid)?;
                format!("A|{tid}|{idx}")
            }
            Frame::Nak { tid, idx } => {
                reject_pipe(tid)?;
                format!("N|{tid}|{idx}")
            }
            Frame::End { tid } => {
                reject_pipe(tid)?;
                format!("E|{tid}")
            }
            Frame::Fin { tid, ok } => {
                reject_pipe(tid)?;
                format!("F|{tid}|{}", if *ok { "ok" } else { "err" })
            }
            Frame::Abt { tid, reason } => {
                reject_pipe(tid)?;
                reject_pipe(reason)?;
                format!("X|{tid}|{reason}")
            }
        };

        if wire.len() > budget {
            return Err(Error::OversizeFrame {
                actual: wire.len(),
                limit: budget,
            });
        }

        Ok(wire)
    }

    /// Parse a frame from its wire form. Never fatal: callers should log and
    /// drop frames that fail to parse.
    pub fn decode(wire: &str) -> Result<Frame> {
        let mut parts = wire.split('|');
        let kind = parts
            .next()
            .ok_or_else(|| Error::MalformedFrame("empty frame".into()))?;

        match kind {
            "P" => {
                let nonce = next_field(&mut parts, "nonce")?;
                ensure_exhausted(parts)?;
                Ok(Frame::Ping { nonce })
            }
            "O" => {
                let nonce = next_field(&mut parts, "nonce")?;
                let name = next_field(&mut parts, "name")?;
                ensure_exhausted(parts)?;
                Ok(Frame::Pong { nonce, name })
            }
            "B" => {
                let tid = next_field(&mut parts, "tid")?;
                let total = next_u16(&mut parts, "total")?;
                let filename = next_field(&mut parts, "filename")?;
                ensure_exhausted(parts)?;
                Ok(Frame::Begin { tid, total, filename })
            }
            "D" => {
                let tid = next_field(&mut parts, "tid")?;
                let idx = next_u16(&mut parts, "idx")?;
                let b64 = next_field(&mut parts, "payload")?;
                let payload = base64::engine::general_purpose::STANDARD.decode(b64)?;
                ensure_exhausted(parts)?;
                Ok(Frame::Data { tid, idx, payload })
            }
            "A" => {
                let tid = next_field(&mut parts, "tid")?;
                let idx = next_u16(&mut parts, "idx")?;
                ensure_exhausted(parts)?;
                Ok(Frame::Ack { tid, idx })
            }
            "N" => {
                let tid = next_field(&mut parts, "tid")?;
                let idx = next_u16(&mut parts, "idx")?;
                ensure_exhausted(parts)?;
                Ok(Frame::Nak { tid, idx })
            }
            "E" => {
                let tid = next_field(&mut parts, "tid")?;
                ensure_exhausted(parts)?;
                Ok(Frame::End { tid })
            }
            "F" => {
                let tid = next_field(&mut parts, "tid")?;
                let status = next_field(&mut parts, "status")?;
                ensure_exhausted(parts)?;
                let ok = match status.as_str() {
                    "ok" => true,
                    "err" => false,
                    other => {
                        return Err(Error::MalformedFrame(format!(
                            "unknown FIN status: {other}"
                        )))
                    }
                };
                Ok(Frame::Fin { tid, ok })
            }
            "X" => {
                let tid = next_field(&mut parts, "tid")?;
                let reason = next_field(&mut parts, "reason")?;
                ensure_exhausted(parts)?;
                Ok(Frame::Abt { tid, reason })
            }
            other => Err(Error::MalformedFrame(format!(
                "unknown frame kind: {other}"
            ))),
        }
    }

    /// The transfer id this frame is scoped to, if any (PING/PONG are not
    /// transfer-scoped).
    pub fn tid(&self) -> Option<&str> {
        match self {
            Frame::Ping { .. } | Frame::Pong { .. } => None,
            Frame::Begin { tid, .. }
            | Frame::Data { tid, .. }
            | Frame::Ack { tid, .. }
            | Frame::Nak { tid, .. }
            | Frame::End { tid }
            | Frame::Fin { tid, .. }
            | Frame::Abt { tid, .. } => Some(tid),
        }
    }
}

fn reject_pipe(field: &str) -> Result<()> {
    if field.contains('|') {
        return Err(Error::ProtocolError(format!(
            "field contains pipe character: {field:?}"
        )));
    }
    Ok(())
}

fn next_field<'a, I: Iterator<Item = &'a str>>(parts: &mut I, name: &str) -> Result<String> {
    parts
        .next()
        .map(str::to_string)
        .ok_or_else(|| Error::MalformedFrame(format!("missing field: {name}")))
}

fn next_u16<'a, I: Iterator<Item = &'a str>>(parts: &mut I, name: &str) -> Result<u16> {
    let raw = next_field(parts, name)?;
    raw.parse::<u16>()
        .map_err(|_| Error::MalformedFrame(format!("invalid {name}: {raw:?}")))
}

fn ensure_exhausted<'a, I: Iterator<Item = &'a str>>(mut parts: I) -> Result<()> {
    if parts.next().is_some() {
        return Err(Error::MalformedFrame("frame has extra fields".into()));
    }
    Ok(())
}

/// Sanitize a filename for use in a BEGIN frame: strip to basename, drop
/// control characters, path separators, and the `|` field separator, and
/// truncate to `max_len` bytes.
pub fn sanitize_filename(name: &str, max_len: usize) -> String {
    let basename = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(name);

    let cleaned: String = basename
        .chars()
        .filter(|c| !c.is_control() && *c != '/' && *c != '\\' && *c != '|')
        .collect();

    let cleaned = if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned
    };

    cleaned.chars().take(max_len).collect()
}

/// Split a file's bytes into contiguous chunks of at most `chunk_payload_max`
/// bytes each. All chunks except the last are exactly `chunk_payload_max`
/// bytes; the last carries the remainder (1..=chunk_payload_max bytes). An
/// empty file still produces exactly one (empty) chunk, so every transfer has
/// `total_chunks >= 1`.
pub fn split_chunks(bytes: &[u8], chunk_payload_max: usize) -> Vec<Vec<u8>> {
    if bytes.is_empty() {
        return vec![Vec::new()];
    }
    bytes
        .chunks(chunk_payload_max)
        .map(|c| c.to_vec())
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_roundtrip() {
        let frame = Frame::Ping { nonce: "abc123".into() };
        let wire = frame.encode(DEFAULT_FRAME_BUDGET).unwrap();
        assert_eq!(wire, "P|abc123");
        assert_eq!(Frame::decode(&wire).unwrap(), frame);
    }

    #[test]
    fn test_pong_roundtrip() {
        let frame = Frame::Pong {
            nonce: "abc123".into(),
            name: "node-7".into(),
        };
        let wire = frame.encode(DEFAULT_FRAME_BUDGET).unwrap();
        assert_eq!(wire, "O|abc123|node-7");
        assert_eq!(Frame::decode(&wire).unwrap(), frame);
    }

    #[test]
    fn test_begin_roundtrip() {
        let frame = Frame::Begin {
            tid: "tx0001".into(),
            total: 3,
            filename: "report.pdf".into(),
        };
        let wire = frame.encode(DEFAULT_FRAME_BUDGET).unwrap();
        assert_eq!(wire, "B|tx0001|3|report.pdf");
        assert_eq!(Frame::decode(&wire).unwrap(), frame);
    }

    #[test]
    fn test_data_roundtrip() {
        let frame = Frame::Data {
            tid: "tx0001".into(),
            idx: 2,
            payload: vec![1, 2, 3, 255, 0],
        };
        let wire = frame.encode(DEFAULT_FRAME_BUDGET).unwrap();
        assert!(wire.starts_with("D|tx0001|2|"));
        assert_eq!(Frame::decode(&wire).unwrap(), frame);
    }

    #[test]
    fn test_ack_nak_end_fin_abt_roundtrip() {
        let cases = vec![
            Frame::Ack { tid: "t1".into(), idx: 5 },
            Frame::Nak { tid: "t1".into(), idx: 6 },
            Frame::End { tid: "t1".into() },
            Frame::Fin { tid: "t1".into(), ok: true },
            Frame::Fin { tid: "t1".into(), ok: false },
            Frame::Abt { tid: "t1".into(), reason: "IdleTimeout".into() },
        ];
        for frame in cases {
            let wire = frame.encode(DEFAULT_FRAME_BUDGET).unwrap();
            assert_eq!(Frame::decode(&wire).unwrap(), frame);
        }
    }

    #[test]
    fn test_oversize_frame_rejected_at_encode() {
        let frame = Frame::Data {
            tid: "tx0001".into(),
            idx: 0,
            payload: vec![0u8; 120],
        };
        let result = frame.encode(32);
        assert!(matches!(result, Err(Error::OversizeFrame { .. })));
    }

    #[test]
    fn test_malformed_frame_unknown_kind() {
        let result = Frame::decode("Z|whatever");
        assert!(matches!(result, Err(Error::MalformedFrame(_))));
    }

    #[test]
    fn test_malformed_frame_missing_field() {
        let result = Frame::decode("A|tid-only");
        assert!(matches!(result, Err(Error::MalformedFrame(_))));
    }

    #[test]
    fn test_malformed_frame_bad_index() {
        let result = Frame::decode("A|tid|not-a-number");
        assert!(matches!(result, Err(Error::MalformedFrame(_))));
    }

    #[test]
    fn test_malformed_frame_extra_fields() {
        let result = Frame::decode("E|tid|extra");
        assert!(matches!(result, Err(Error::MalformedFrame(_))));
    }

    #[test]
    fn test_filename_with_pipe_rejected_at_encode() {
        let frame = Frame::Begin {
            tid: "t1".into(),
            total: 1,
            filename: "evil|name.txt".into(),
        };
        let result = frame.encode(DEFAULT_FRAME_BUDGET);
        assert!(matches!(result, Err(Error::ProtocolError(_))));
    }

    #[test]
    fn test_sanitize_filename_strips_path() {
        assert_eq!(sanitize_filename("/etc/passwd", 64), "passwd");
        assert_eq!(sanitize_filename("C:\\Users\\bob\\report.pdf", 64), "report.pdf");
        assert_eq!(sanitize_filename("../../evil.sh", 64), "evil.sh");
    }

    #[test]
    fn test_sanitize_filename_strips_control_chars() {
        let dirty = "bad\u{0007}name\n.txt";
        let clean = sanitize_filename(dirty, 64);
        assert!(!clean.chars().any(|c| c.is_control()));
    }

    #[test]
    fn test_sanitize_filename_strips_pipe() {
        assert_eq!(sanitize_filename("notes|draft.txt", 64), "notesdraft.txt");
    }

    #[test]
    fn test_sanitize_filename_truncates() {
        let long = "a".repeat(300);
        assert_eq!(sanitize_filename(&long, 32).len(), 32);
    }

    #[test]
    fn test_sanitize_filename_empty_gets_placeholder() {
        assert_eq!(sanitize_filename("", 64), "file");
        assert_eq!(sanitize_filename("/", 64), "file");
    }

    #[test]
    fn test_split_chunks_exact_and_remainder() {
        let bytes = vec![0u8; 300];
        let chunks = split_chunks(&bytes, 120);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 120);
        assert_eq!(chunks[1].len(), 120);
        assert_eq!(chunks[2].len(), 60);
    }

    #[test]
    fn test_split_chunks_single_byte_file() {
        let chunks = split_chunks(&[42u8], 120);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0], vec![42u8]);
    }

    #[test]
    fn test_split_chunks_empty_file_still_one_chunk() {
        let chunks = split_chunks(&[], 120);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_empty());
    }

    #[test]
    fn test_split_chunks_reassembles_to_original() {
        let bytes: Vec<u8> = (0..=255u8).cycle().take(617).collect();
        let chunks = split_chunks(&bytes, 120);
        let reassembled: Vec<u8> = chunks.into_iter().flatten().collect();
        assert_eq!(reassembled, bytes);
    }
}
