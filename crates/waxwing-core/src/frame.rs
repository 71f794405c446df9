//! RFC 3081 frame codec.
//!
//! Frames travel as an ASCII header line, `size` payload octets and an
//! `END\r\n` trailer. SEQ frames are a bare header line. The decoder is
//! byte-oriented and incremental: it consumes at most one complete frame
//! from the front of a [`BytesMut`] and reports `None` while any part of
//! the frame is still in flight.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::FrameError;

/// Initial receive window of every channel (RFC 3081 section 3.1.4).
pub const DEFAULT_WINDOW: u32 = 4096;

/// Default upper bound for a single frame's payload. Channels may lower
/// or raise it via [`crate::Channel::set_max_frame_size`].
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 4096;

/// Largest legal message number (31-bit space).
pub const MAX_MSGNO: u32 = 0x7fff_ffff;

/// Largest value accepted for channel numbers, sizes, ansno and window.
const MAX_31BIT: u64 = 0x7fff_ffff;

/// Longest possible header line, CRLF included.
const MAX_HEADER: usize = 64;

/// `END\r\n`
const TRAILER: &[u8] = b"END\r\n";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameType {
    Msg,
    Rpy,
    Err,
    Ans,
    Nul,
    Seq,
}

impl FrameType {
    pub fn as_str(self) -> &'static str {
        match self {
            FrameType::Msg => "MSG",
            FrameType::Rpy => "RPY",
            FrameType::Err => "ERR",
            FrameType::Ans => "ANS",
            FrameType::Nul => "NUL",
            FrameType::Seq => "SEQ",
        }
    }

    fn from_token(token: &[u8]) -> Option<FrameType> {
        Some(match token {
            b"MSG" => FrameType::Msg,
            b"RPY" => FrameType::Rpy,
            b"ERR" => FrameType::Err,
            b"ANS" => FrameType::Ans,
            b"NUL" => FrameType::Nul,
            b"SEQ" => FrameType::Seq,
            _ => return None,
        })
    }

    /// Whether this type answers a MSG (RPY, ERR, ANS or NUL).
    pub fn is_reply(self) -> bool {
        matches!(
            self,
            FrameType::Rpy | FrameType::Err | FrameType::Ans | FrameType::Nul
        )
    }

    /// Whether this type terminates the reply exchange for its msgno.
    /// ANS does not; the series stays open until NUL.
    pub fn is_terminal_reply(self) -> bool {
        matches!(self, FrameType::Rpy | FrameType::Err | FrameType::Nul)
    }
}

impl std::fmt::Display for FrameType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A data frame (every type except SEQ).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameType,
    pub channel: u32,
    pub msgno: u32,
    /// `true` when more frames of the same message follow (`*` on the
    /// wire), `false` on the terminal frame (`.`).
    pub more: bool,
    pub seqno: u32,
    /// Answer number; present on ANS frames only.
    pub ansno: Option<u32>,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(
        kind: FrameType,
        channel: u32,
        msgno: u32,
        more: bool,
        seqno: u32,
        payload: Bytes,
    ) -> Frame {
        Frame {
            kind,
            channel,
            msgno,
            more,
            seqno,
            ansno: None,
            payload,
        }
    }

    pub fn with_ansno(mut self, ansno: u32) -> Frame {
        self.ansno = Some(ansno);
        self
    }

    /// Serialize header, payload and trailer into `out`.
    pub fn encode_into(&self, out: &mut BytesMut) {
        let more = if self.more { '*' } else { '.' };
        let header = match self.ansno {
            Some(ansno) => format!(
                "{} {} {} {} {} {} {}\r\n",
                self.kind,
                self.channel,
                self.msgno,
                more,
                self.seqno,
                self.payload.len(),
                ansno
            ),
            None => format!(
                "{} {} {} {} {} {}\r\n",
                self.kind,
                self.channel,
                self.msgno,
                more,
                self.seqno,
                self.payload.len()
            ),
        };
        out.reserve(header.len() + self.payload.len() + TRAILER.len());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(TRAILER);
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::new();
        self.encode_into(&mut out);
        out.freeze()
    }
}

/// A SEQ flow-control frame: no payload, no trailer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SeqFrame {
    pub channel: u32,
    pub ackno: u32,
    pub window: u32,
}

impl SeqFrame {
    pub fn encode(&self) -> Bytes {
        Bytes::from(format!(
            "SEQ {} {} {}\r\n",
            self.channel, self.ackno, self.window
        ))
    }
}

/// One decoded wire element.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decoded {
    Data(Frame),
    Seq(SeqFrame),
}

/// Try to decode one frame from the front of `buf`.
///
/// Returns `Ok(None)` while the header, body or trailer is incomplete;
/// the consumed bytes are removed from `buf` only when a whole frame was
/// decoded.
pub fn decode(buf: &mut BytesMut) -> Result<Option<Decoded>, FrameError> {
    let Some(header_end) = find_crlf(&buf[..buf.len().min(MAX_HEADER)]) else {
        if buf.len() >= MAX_HEADER {
            return Err(FrameError::MalformedHeader("header line too long"));
        }
        return Ok(None);
    };

    let header = &buf[..header_end];
    let mut tokens = header.split(|b| *b == b' ');
    let kind = tokens
        .next()
        .and_then(FrameType::from_token)
        .ok_or(FrameError::UnknownType)?;

    if kind == FrameType::Seq {
        let channel = parse_field(tokens.next(), "channel", MAX_31BIT)?;
        let ackno = parse_field(tokens.next(), "ackno", u32::MAX as u64)?;
        let window = parse_field(tokens.next(), "window", MAX_31BIT)?;
        if tokens.next().is_some() {
            return Err(FrameError::MalformedHeader("trailing SEQ fields"));
        }
        buf.advance(header_end + 2);
        return Ok(Some(Decoded::Seq(SeqFrame {
            channel,
            ackno,
            window,
        })));
    }

    let channel = parse_field(tokens.next(), "channel", MAX_31BIT)?;
    let msgno = parse_field(tokens.next(), "msgno", MAX_MSGNO as u64)?;
    let more = match tokens.next() {
        Some(b".") => false,
        Some(b"*") => true,
        _ => return Err(FrameError::MalformedHeader("continuation indicator")),
    };
    let seqno = parse_field(tokens.next(), "seqno", u32::MAX as u64)?;
    let size = parse_field(tokens.next(), "size", MAX_31BIT)? as usize;
    let ansno = match (kind, tokens.next()) {
        (FrameType::Ans, Some(token)) => Some(parse_field(Some(token), "ansno", MAX_31BIT)?),
        (FrameType::Ans, None) => return Err(FrameError::MalformedHeader("ANS without ansno")),
        (_, Some(_)) => return Err(FrameError::MalformedHeader("unexpected ansno")),
        (_, None) => None,
    };
    if tokens.next().is_some() {
        return Err(FrameError::MalformedHeader("trailing fields"));
    }

    let need = header_end + 2 + size + TRAILER.len();
    if buf.len() < need {
        return Ok(None);
    }
    if &buf[header_end + 2 + size..need] != TRAILER {
        return Err(FrameError::TrailerMissing);
    }

    buf.advance(header_end + 2);
    let payload = buf.split_to(size).freeze();
    buf.advance(TRAILER.len());

    Ok(Some(Decoded::Data(Frame {
        kind,
        channel,
        msgno,
        more,
        seqno,
        ansno,
        payload,
    })))
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Parse an unsigned decimal field: non-empty, digits only, no leading
/// zeros, bounded by `max`.
fn parse_field(
    token: Option<&[u8]>,
    field: &'static str,
    max: u64,
) -> Result<u32, FrameError> {
    let token = token.ok_or(FrameError::MalformedHeader("missing field"))?;
    if token.is_empty() || !token.iter().all(|b| b.is_ascii_digit()) {
        return Err(FrameError::BadFieldValue(field));
    }
    if token.len() > 1 && token[0] == b'0' {
        return Err(FrameError::BadFieldValue(field));
    }
    if token.len() > 10 {
        return Err(FrameError::BadFieldValue(field));
    }
    let mut value: u64 = 0;
    for b in token {
        value = value * 10 + (b - b'0') as u64;
    }
    if value > max {
        return Err(FrameError::BadFieldValue(field));
    }
    Ok(value as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(bytes: &[u8]) -> Result<Option<Decoded>, FrameError> {
        let mut buf = BytesMut::from(bytes);
        decode(&mut buf)
    }

    #[test]
    fn msg_roundtrip() {
        let frame = Frame::new(FrameType::Msg, 1, 0, false, 0, Bytes::from_static(b"hello"));
        let wire = frame.encode();
        assert_eq!(&wire[..], b"MSG 1 0 . 0 5\r\nhelloEND\r\n");

        let mut buf = BytesMut::from(&wire[..]);
        let decoded = decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Decoded::Data(frame));
        assert!(buf.is_empty());
    }

    #[test]
    fn ans_carries_ansno() {
        let frame =
            Frame::new(FrameType::Ans, 3, 7, true, 42, Bytes::from_static(b"x")).with_ansno(2);
        let wire = frame.encode();
        assert_eq!(&wire[..], b"ANS 3 7 * 42 1 2\r\nxEND\r\n");

        match decode_one(&wire).unwrap().unwrap() {
            Decoded::Data(f) => assert_eq!(f.ansno, Some(2)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn ans_without_ansno_is_malformed() {
        let err = decode_one(b"ANS 3 7 * 42 1\r\nxEND\r\n").unwrap_err();
        assert!(matches!(err, FrameError::MalformedHeader(_)));
    }

    #[test]
    fn non_ans_with_ansno_is_malformed() {
        let err = decode_one(b"MSG 1 0 . 0 1 5\r\nxEND\r\n").unwrap_err();
        assert!(matches!(err, FrameError::MalformedHeader(_)));
    }

    #[test]
    fn seq_frame_has_no_trailer() {
        let wire = SeqFrame {
            channel: 2,
            ackno: 8192,
            window: 4096,
        }
        .encode();
        assert_eq!(&wire[..], b"SEQ 2 8192 4096\r\n");

        let mut buf = BytesMut::from(&wire[..]);
        let decoded = decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            decoded,
            Decoded::Seq(SeqFrame {
                channel: 2,
                ackno: 8192,
                window: 4096
            })
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn zero_length_payload_is_legal() {
        match decode_one(b"RPY 1 0 . 0 0\r\nEND\r\n").unwrap().unwrap() {
            Decoded::Data(f) => {
                assert_eq!(f.kind, FrameType::Rpy);
                assert!(f.payload.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn need_more_on_partial_header() {
        assert_eq!(decode_one(b"MSG 1 0 . ").unwrap(), None);
    }

    #[test]
    fn need_more_on_partial_body() {
        assert_eq!(decode_one(b"MSG 1 0 . 0 5\r\nhel").unwrap(), None);
    }

    #[test]
    fn need_more_on_partial_trailer() {
        assert_eq!(decode_one(b"MSG 1 0 . 0 5\r\nhelloEN").unwrap(), None);
    }

    #[test]
    fn trailer_must_follow_payload() {
        let err = decode_one(b"MSG 1 0 . 0 5\r\nhelloXXX\r\n").unwrap_err();
        assert_eq!(err, FrameError::TrailerMissing);
    }

    #[test]
    fn unknown_type_rejected() {
        let err = decode_one(b"FOO 1 0 . 0 0\r\nEND\r\n").unwrap_err();
        assert_eq!(err, FrameError::UnknownType);
    }

    #[test]
    fn leading_zeros_rejected() {
        let err = decode_one(b"MSG 01 0 . 0 0\r\nEND\r\n").unwrap_err();
        assert_eq!(err, FrameError::BadFieldValue("channel"));
    }

    #[test]
    fn double_space_rejected() {
        let err = decode_one(b"MSG 1  0 . 0 0\r\nEND\r\n").unwrap_err();
        assert!(matches!(err, FrameError::BadFieldValue(_)));
    }

    #[test]
    fn msgno_31bit_bound() {
        assert!(decode_one(b"MSG 1 2147483647 . 0 0\r\nEND\r\n").unwrap().is_some());
        let err = decode_one(b"MSG 1 2147483648 . 0 0\r\nEND\r\n").unwrap_err();
        assert_eq!(err, FrameError::BadFieldValue("msgno"));
    }

    #[test]
    fn seqno_full_u32() {
        match decode_one(b"MSG 1 0 . 4294967295 0\r\nEND\r\n").unwrap().unwrap() {
            Decoded::Data(f) => assert_eq!(f.seqno, u32::MAX),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn oversized_header_is_rejected() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[b'9'; MAX_HEADER + 1]);
        let err = decode(&mut buf).unwrap_err();
        assert!(matches!(err, FrameError::MalformedHeader(_)));
    }

    #[test]
    fn decodes_back_to_back_frames() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"MSG 1 0 * 0 2\r\nabEND\r\n");
        buf.extend_from_slice(b"MSG 1 0 . 2 2\r\ncdEND\r\n");

        let first = decode(&mut buf).unwrap().unwrap();
        let second = decode(&mut buf).unwrap().unwrap();
        match (first, second) {
            (Decoded::Data(a), Decoded::Data(b)) => {
                assert!(a.more);
                assert!(!b.more);
                assert_eq!(a.seqno, 0);
                assert_eq!(b.seqno, 2);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn payload_may_contain_trailer_text() {
        let frame = Frame::new(
            FrameType::Msg,
            1,
            0,
            false,
            0,
            Bytes::from_static(b"END\r\nEND\r\n"),
        );
        let wire = frame.encode();
        match decode_one(&wire).unwrap().unwrap() {
            Decoded::Data(f) => assert_eq!(&f.payload[..], b"END\r\nEND\r\n"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
