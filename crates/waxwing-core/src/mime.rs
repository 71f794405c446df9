//! MIME section handling for the first frame of a message.
//!
//! RFC 3080 frames a message body with RFC 2045 entity headers followed
//! by a blank line. When a message uses the default `Content-Type` and
//! `Content-Transfer-Encoding` the headers may be elided and only the
//! blank separator is sent.

use crate::error::FrameError;

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
pub const DEFAULT_TRANSFER_ENCODING: &str = "binary";
/// Content type of channel-management documents.
pub const BEEP_XML_CONTENT_TYPE: &str = "application/beep+xml";

/// The MIME entity headers of one message. Field names compare
/// case-insensitively; insertion order is preserved for re-emission.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MimeHeaders {
    fields: Vec<(String, String)>,
}

impl MimeHeaders {
    pub fn new() -> MimeHeaders {
        MimeHeaders::default()
    }

    /// Headers carrying an explicit content type and transfer encoding.
    pub fn typed(content_type: &str, transfer_encoding: &str) -> MimeHeaders {
        let mut headers = MimeHeaders::new();
        headers.set("Content-Type", content_type);
        headers.set("Content-Transfer-Encoding", transfer_encoding);
        headers
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Set a field, replacing any previous value under the same name.
    pub fn set(&mut self, name: &str, value: &str) {
        if let Some(slot) = self
            .fields
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            slot.1 = value.to_string();
        } else {
            self.fields.push((name.to_string(), value.to_string()));
        }
    }

    /// Effective content type, defaults applied.
    pub fn content_type(&self) -> &str {
        self.get("Content-Type").unwrap_or(DEFAULT_CONTENT_TYPE)
    }

    /// Effective transfer encoding, defaults applied.
    pub fn transfer_encoding(&self) -> &str {
        self.get("Content-Transfer-Encoding")
            .unwrap_or(DEFAULT_TRANSFER_ENCODING)
    }

    /// Whether every field matches the BEEP defaults, so the encoder may
    /// elide the headers and emit only the blank separator.
    pub fn is_default(&self) -> bool {
        self.fields.iter().all(|(n, v)| {
            (n.eq_ignore_ascii_case("Content-Type") && v == DEFAULT_CONTENT_TYPE)
                || (n.eq_ignore_ascii_case("Content-Transfer-Encoding")
                    && v == DEFAULT_TRANSFER_ENCODING)
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Split the MIME section from the start of a message body.
///
/// Returns the parsed headers and the offset at which the payload
/// proper begins.
pub fn split(payload: &[u8]) -> Result<(MimeHeaders, usize), FrameError> {
    if payload.starts_with(b"\r\n") {
        return Ok((MimeHeaders::new(), 2));
    }

    let mut headers = MimeHeaders::new();
    let mut pos = 0;
    loop {
        let line_end = find_crlf(&payload[pos..])
            .map(|i| pos + i)
            .ok_or(FrameError::Mime("missing blank-line separator"))?;
        if line_end == pos {
            // blank line: end of the MIME section
            return Ok((headers, line_end + 2));
        }
        let line = &payload[pos..line_end];
        if line[0] == b' ' || line[0] == b'\t' {
            // folded continuation of the previous field
            let Some(last) = headers.fields.last_mut() else {
                return Err(FrameError::Mime("continuation before first field"));
            };
            let text =
                std::str::from_utf8(line).map_err(|_| FrameError::Mime("non-ascii field"))?;
            last.1.push(' ');
            last.1.push_str(text.trim());
        } else {
            let colon = line
                .iter()
                .position(|b| *b == b':')
                .ok_or(FrameError::Mime("field without colon"))?;
            if colon == 0 {
                return Err(FrameError::Mime("empty field name"));
            }
            let name = std::str::from_utf8(&line[..colon])
                .map_err(|_| FrameError::Mime("non-ascii field name"))?;
            if !name.bytes().all(is_token_byte) {
                return Err(FrameError::Mime("invalid field name"));
            }
            let value = std::str::from_utf8(&line[colon + 1..])
                .map_err(|_| FrameError::Mime("non-ascii field value"))?;
            headers.fields.push((name.to_string(), value.trim().to_string()));
        }
        pos = line_end + 2;
    }
}

/// Serialize `headers` plus the blank separator; headers matching the
/// defaults collapse to the bare separator.
pub fn prelude(headers: &MimeHeaders) -> Vec<u8> {
    if headers.is_default() {
        return b"\r\n".to_vec();
    }
    let mut out = Vec::new();
    for (name, value) in headers.iter() {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// Heuristic used by mixed-mode automatic MIME: does this body already
/// begin with a MIME section?
pub fn starts_with_mime(payload: &[u8]) -> bool {
    if payload.starts_with(b"\r\n") {
        return true;
    }
    let Some(line_end) = find_crlf(payload) else {
        return false;
    };
    let line = &payload[..line_end];
    match line.iter().position(|b| *b == b':') {
        Some(0) | None => false,
        Some(colon) => line[..colon].iter().all(|b| is_token_byte(*b)),
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'!' | b'#' | b'$' | b'%' | b'+')
}
