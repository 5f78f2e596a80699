use super::headers::Headers;
use super::uri::Uri;
use super::{Request, Response, SipMessage, Version};
use std::fmt;

pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;
pub const DEFAULT_MAX_HEADERS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    MalformedStartLine,
    BadHeaderSyntax,
    UnknownScheme,
    BadContentLength,
    BadUri,
    /// The buffer ends before the message does.
    Truncated,
    /// The message exceeds the configured size or header-count limit.
    SizeLimit,
}

/// Parse failure: what went wrong and the byte offset it was detected at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub offset: usize,
}

impl ParseError {
    pub fn new(kind: ParseErrorKind, offset: usize) -> Self {
        ParseError { kind, offset }
    }

    fn rebase(mut self, base: usize) -> Self {
        self.offset += base;
        self
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} at byte {}", self.kind, self.offset)
    }
}

impl std::error::Error for ParseError {}

/// Input limits enforced before any allocation is sized by attacker data.
#[derive(Debug, Clone, Copy)]
pub struct ParseLimits {
    pub max_message_size: usize,
    pub max_headers: usize,
}

impl Default for ParseLimits {
    fn default() -> Self {
        ParseLimits {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_headers: DEFAULT_MAX_HEADERS,
        }
    }
}

/// How the byte buffer was framed by the transport.
///
/// A datagram carries exactly one message, so a missing Content-Length
/// means the rest of the buffer is the body. On a stream the body length
/// must come from the header; a missing one means an empty body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Datagram,
    Stream,
}

/// Parse one message from `buf`.
///
/// Returns the message and the number of bytes it consumed. The parser
/// accepts a lone LF where CRLF is expected, rejects NUL bytes in header
/// values, and never reads past the buffer. `ParseErrorKind::Truncated`
/// from stream framing means "feed me more bytes", not corruption.
pub fn parse_message(
    buf: &[u8],
    framing: Framing,
    limits: &ParseLimits,
) -> Result<(SipMessage, usize), ParseError> {
    if framing == Framing::Datagram && buf.len() > limits.max_message_size {
        return Err(ParseError::new(
            ParseErrorKind::SizeLimit,
            limits.max_message_size,
        ));
    }

    let mut pos = 0usize;
    let (start_line, after_start) = read_line(buf, pos).ok_or_else(|| incomplete(buf, limits))?;
    let start_offset = pos;
    pos = after_start;

    let mut headers = Headers::new();
    let mut content_length: Option<(usize, usize)> = None; // (value, offset)
    let mut header_count = 0usize;

    loop {
        let line_offset = pos;
        let (line, next) = read_line(buf, pos).ok_or_else(|| incomplete(buf, limits))?;
        pos = next;
        if line.is_empty() {
            break;
        }
        if line_offset > limits.max_message_size {
            return Err(ParseError::new(
                ParseErrorKind::SizeLimit,
                limits.max_message_size,
            ));
        }
        if line[0] == b' ' || line[0] == b'\t' {
            return Err(ParseError::new(
                ParseErrorKind::BadHeaderSyntax,
                line_offset,
            ));
        }
        // Fold LWS continuations into this header's value.
        let mut value_buf = Vec::from(line);
        while let Some((peek, peek_next)) = read_line(buf, pos) {
            if peek.first().is_some_and(|b| *b == b' ' || *b == b'\t') {
                value_buf.push(b' ');
                value_buf.extend_from_slice(trim_bytes(peek));
                pos = peek_next;
            } else {
                break;
            }
        }

        let text = std::str::from_utf8(&value_buf)
            .map_err(|_| ParseError::new(ParseErrorKind::BadHeaderSyntax, line_offset))?;
        let colon = text
            .find(':')
            .ok_or_else(|| ParseError::new(ParseErrorKind::BadHeaderSyntax, line_offset))?;
        let name = text[..colon].trim();
        let value = text[colon + 1..].trim();
        if name.is_empty() || !is_token(name) {
            return Err(ParseError::new(
                ParseErrorKind::BadHeaderSyntax,
                line_offset,
            ));
        }
        if value.bytes().any(|b| b == 0) {
            return Err(ParseError::new(
                ParseErrorKind::BadHeaderSyntax,
                line_offset,
            ));
        }
        header_count += 1;
        if header_count > limits.max_headers {
            return Err(ParseError::new(ParseErrorKind::SizeLimit, line_offset));
        }
        headers.push(name, value);
        if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("l") {
            let parsed = value
                .parse::<usize>()
                .map_err(|_| ParseError::new(ParseErrorKind::BadContentLength, line_offset))?;
            content_length = Some((parsed, line_offset));
        }
    }

    let body_start = pos;
    let (body, consumed) = match content_length {
        Some((len, _)) => {
            if buf.len() < body_start + len {
                return Err(ParseError::new(ParseErrorKind::Truncated, buf.len()));
            }
            (buf[body_start..body_start + len].to_vec(), body_start + len)
        }
        None => match framing {
            Framing::Datagram => (buf[body_start..].to_vec(), buf.len()),
            Framing::Stream => (Vec::new(), body_start),
        },
    };
    if consumed > limits.max_message_size {
        return Err(ParseError::new(
            ParseErrorKind::SizeLimit,
            limits.max_message_size,
        ));
    }

    let message = parse_start_line(start_line, start_offset, headers, body)?;
    Ok((message, consumed))
}

fn incomplete(buf: &[u8], limits: &ParseLimits) -> ParseError {
    if buf.len() > limits.max_message_size {
        ParseError::new(ParseErrorKind::SizeLimit, limits.max_message_size)
    } else {
        ParseError::new(ParseErrorKind::Truncated, buf.len())
    }
}

/// Next line ending at CRLF or lone LF. Returns the line without its
/// terminator and the offset just past it.
fn read_line(buf: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    let rest = &buf[pos.min(buf.len())..];
    let nl = rest.iter().position(|b| *b == b'\n')?;
    let mut line = &rest[..nl];
    if line.last() == Some(&b'\r') {
        line = &line[..line.len() - 1];
    }
    Some((line, pos + nl + 1))
}

fn trim_bytes(line: &[u8]) -> &[u8] {
    let start = line
        .iter()
        .position(|b| *b != b' ' && *b != b'\t')
        .unwrap_or(line.len());
    let end = line
        .iter()
        .rposition(|b| *b != b' ' && *b != b'\t')
        .map(|p| p + 1)
        .unwrap_or(start);
    &line[start..end]
}

fn is_token(name: &str) -> bool {
    name.bytes()
        .all(|b| b.is_ascii_alphanumeric() || b"-.!%*_+`'~".contains(&b))
}

fn parse_start_line(
    line: &[u8],
    offset: usize,
    headers: Headers,
    body: Vec<u8>,
) -> Result<SipMessage, ParseError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| ParseError::new(ParseErrorKind::MalformedStartLine, offset))?;

    if let Some(rest) = text.strip_prefix("SIP/2.0 ") {
        let (code_str, reason) = match rest.find(' ') {
            Some(sp) => (&rest[..sp], &rest[sp + 1..]),
            None => (rest, ""),
        };
        let code = code_str
            .parse::<u16>()
            .ok()
            .filter(|c| (100..700).contains(c) && code_str.len() == 3)
            .ok_or_else(|| ParseError::new(ParseErrorKind::MalformedStartLine, offset))?;
        return Ok(SipMessage::Response(Response {
            status_code: code.into(),
            reason: if reason.is_empty() {
                None
            } else {
                Some(reason.to_string())
            },
            version: Version::V2,
            headers,
            body,
        }));
    }

    let mut parts = text.splitn(3, ' ');
    let method_str = parts
        .next()
        .ok_or_else(|| ParseError::new(ParseErrorKind::MalformedStartLine, offset))?;
    let uri_str = parts
        .next()
        .ok_or_else(|| ParseError::new(ParseErrorKind::MalformedStartLine, offset))?;
    let version = parts
        .next()
        .ok_or_else(|| ParseError::new(ParseErrorKind::MalformedStartLine, offset))?;
    if version != "SIP/2.0" {
        return Err(ParseError::new(ParseErrorKind::MalformedStartLine, offset));
    }
    let method = method_str
        .parse()
        .map_err(|_| ParseError::new(ParseErrorKind::MalformedStartLine, offset))?;
    let uri_offset = offset + method_str.len() + 1;
    let uri = Uri::parse(uri_str).map_err(|e| e.rebase(uri_offset))?;
    Ok(SipMessage::Request(Request {
        method,
        uri,
        version: Version::V2,
        headers,
        body,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Method, StatusCode};

    const MINIMAL_OK: &str = "SIP/2.0 200 OK\r\nVia: SIP/2.0/UDP h.example.com;branch=z9hG4bK1\r\nFrom: <sip:a@example.com>;tag=1\r\nTo: <sip:b@example.com>;tag=2\r\nCall-ID: c1\r\nCSeq: 1 INVITE\r\nContent-Length: 0\r\n\r\n";

    #[test]
    fn parse_minimal_ok() {
        let (msg, consumed) =
            parse_message(MINIMAL_OK.as_bytes(), Framing::Datagram, &Default::default()).unwrap();
        assert_eq!(consumed, MINIMAL_OK.len());
        let resp = match msg {
            SipMessage::Response(r) => r,
            _ => panic!("expected response"),
        };
        assert_eq!(resp.status_code, StatusCode::OK);
        assert_eq!(resp.reason.as_deref(), Some("OK"));
        assert_eq!(resp.headers.len(), 6);
        assert!(resp.body.is_empty());
    }

    #[test]
    fn parse_request_with_body() {
        let raw = "MESSAGE sip:bob@ex.com SIP/2.0\r\nVia: SIP/2.0/UDP a.ex.com;branch=z9hG4bKx\r\nFrom: <sip:a@ex.com>;tag=1\r\nTo: <sip:bob@ex.com>\r\nCall-ID: c2\r\nCSeq: 1 MESSAGE\r\nContent-Length: 5\r\n\r\nhello";
        let (msg, consumed) =
            parse_message(raw.as_bytes(), Framing::Stream, &Default::default()).unwrap();
        assert_eq!(consumed, raw.len());
        let req = match msg {
            SipMessage::Request(r) => r,
            _ => panic!("expected request"),
        };
        assert_eq!(req.method, Method::Message);
        assert_eq!(req.body, b"hello");
    }

    #[test]
    fn lone_lf_is_accepted() {
        let raw = "SIP/2.0 180 Ringing\nVia: SIP/2.0/UDP h.ex.com;branch=z9hG4bK2\nContent-Length: 0\n\n";
        let (msg, _) = parse_message(raw.as_bytes(), Framing::Datagram, &Default::default()).unwrap();
        assert!(!msg.is_request());
    }

    #[test]
    fn continuation_lines_fold_with_single_space() {
        let raw = "OPTIONS sip:ex.com SIP/2.0\r\nSubject: first\r\n\tsecond\r\nContent-Length: 0\r\n\r\n";
        let (msg, _) = parse_message(raw.as_bytes(), Framing::Datagram, &Default::default()).unwrap();
        assert_eq!(msg.headers().get("Subject"), Some("first second"));
    }

    #[test]
    fn compact_names_expand_on_parse() {
        let raw = "SIP/2.0 200 OK\r\nv: SIP/2.0/UDP h.ex.com;branch=z9hG4bK3\r\nf: <sip:a@ex.com>;tag=1\r\nt: <sip:b@ex.com>\r\ni: c3\r\nCSeq: 2 OPTIONS\r\nl: 0\r\n\r\n";
        let (msg, _) = parse_message(raw.as_bytes(), Framing::Datagram, &Default::default()).unwrap();
        assert!(msg.headers().has("Via"));
        assert!(msg.headers().has("From"));
        assert_eq!(msg.headers().call_id().unwrap(), "c3");
    }

    #[test]
    fn datagram_without_content_length_takes_rest_as_body() {
        let raw = "SIP/2.0 200 OK\r\nVia: SIP/2.0/UDP h.ex.com;branch=z9hG4bK4\r\n\r\nv=0\r\n";
        let (msg, consumed) =
            parse_message(raw.as_bytes(), Framing::Datagram, &Default::default()).unwrap();
        assert_eq!(consumed, raw.len());
        assert_eq!(msg.body(), b"v=0\r\n");
    }

    #[test]
    fn truncated_body_is_reported() {
        let raw = "SIP/2.0 200 OK\r\nVia: SIP/2.0/UDP h.ex.com;branch=z9hG4bK5\r\nContent-Length: 10\r\n\r\nshort";
        let err = parse_message(raw.as_bytes(), Framing::Stream, &Default::default()).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::Truncated);
        assert_eq!(err.offset, raw.len());
    }

    #[test]
    fn bad_content_length_is_rejected() {
        let raw = "SIP/2.0 200 OK\r\nContent-Length: ten\r\n\r\n";
        let err = parse_message(raw.as_bytes(), Framing::Datagram, &Default::default()).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::BadContentLength);
    }

    #[test]
    fn nul_in_header_value_is_rejected() {
        let raw = b"SIP/2.0 200 OK\r\nSubject: a\0b\r\nContent-Length: 0\r\n\r\n";
        let err = parse_message(raw, Framing::Datagram, &Default::default()).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::BadHeaderSyntax);
    }

    #[test]
    fn malformed_start_lines() {
        for raw in [
            "BOGUS sip:ex.com SIP/2.0\r\n\r\n",
            "SIP/2.0 99 Too Low\r\n\r\n",
            "SIP/2.0 1000 Too High\r\n\r\n",
            "INVITE sip:ex.com\r\n\r\n",
        ] {
            let err =
                parse_message(raw.as_bytes(), Framing::Datagram, &Default::default()).unwrap_err();
            assert_eq!(err.kind, ParseErrorKind::MalformedStartLine, "{:?}", raw);
        }
    }

    #[test]
    fn unknown_scheme_in_request_uri() {
        let raw = "INVITE http:ex.com SIP/2.0\r\n\r\n";
        let err = parse_message(raw.as_bytes(), Framing::Datagram, &Default::default()).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::UnknownScheme);
        assert_eq!(err.offset, "INVITE ".len());
    }

    #[test]
    fn size_limit_is_exact() {
        let body = "x".repeat(100);
        let raw = format!(
            "MESSAGE sip:ex.com SIP/2.0\r\nVia: SIP/2.0/UDP h.ex.com;branch=z9hG4bK6\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        let limits = ParseLimits {
            max_message_size: raw.len(),
            max_headers: DEFAULT_MAX_HEADERS,
        };
        assert!(parse_message(raw.as_bytes(), Framing::Datagram, &limits).is_ok());

        let over = ParseLimits {
            max_message_size: raw.len() - 1,
            max_headers: DEFAULT_MAX_HEADERS,
        };
        let err = parse_message(raw.as_bytes(), Framing::Datagram, &over).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::SizeLimit);
    }

    #[test]
    fn header_count_limit() {
        let mut raw = String::from("OPTIONS sip:ex.com SIP/2.0\r\n");
        for i in 0..5 {
            raw.push_str(&format!("X-Pad-{}: {}\r\n", i, i));
        }
        raw.push_str("\r\n");
        let limits = ParseLimits {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_headers: 4,
        };
        let err = parse_message(raw.as_bytes(), Framing::Datagram, &limits).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::SizeLimit);
    }
}
