//! SIP message codec: typed request/response values, the header
//! repository, URI grammar and the byte-level parser and serializer.
//!
//! The serializer always emits CRLF line endings and recomputes
//! `Content-Length` from the body, even when the application left a stale
//! value in the header block.

pub mod auth;
pub mod headers;
pub mod method;
pub mod parser;
pub mod sdp;
pub mod status;
pub mod uri;

pub use headers::{CSeq, Header, Headers, NameAddr, Via};
pub use method::Method;
pub use status::{StatusCode, StatusKind};
pub use uri::{Scheme, Uri};

use parser::{Framing, ParseLimits};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Version {
    #[default]
    V2,
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SIP/2.0")
    }
}

/// Headers written before all others, in this order, for readability.
const PINNED_ORDER: [&str; 7] = [
    "Via",
    "From",
    "To",
    "Call-ID",
    "CSeq",
    "Max-Forwards",
    "Contact",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: Headers,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status_code: StatusCode,
    /// Reason phrase from the wire; `None` serializes the canonical one.
    pub reason: Option<String>,
    pub version: Version,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Request {
    pub fn to_bytes(&self) -> Vec<u8> {
        let start = format!("{} {} {}\r\n", self.method, self.uri, self.version);
        serialize(start, &self.headers, &self.body)
    }
}

impl Response {
    pub fn to_bytes(&self) -> Vec<u8> {
        let reason = self
            .reason
            .as_deref()
            .unwrap_or_else(|| self.status_code.reason());
        let start = format!("{} {} {}\r\n", self.version, self.status_code, reason);
        serialize(start, &self.headers, &self.body)
    }
}

fn serialize(start_line: String, headers: &Headers, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(start_line.len() + 256 + body.len());
    out.extend_from_slice(start_line.as_bytes());
    for pinned in PINNED_ORDER {
        for value in headers.get_all(pinned) {
            out.extend_from_slice(format!("{}: {}\r\n", pinned, value).as_bytes());
        }
    }
    for header in headers.iter() {
        if PINNED_ORDER.contains(&header.name.as_str()) || header.name == "Content-Length" {
            continue;
        }
        out.extend_from_slice(format!("{}\r\n", header).as_bytes());
    }
    out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
    out.extend_from_slice(body);
    out
}

impl std::fmt::Display for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.to_bytes()))
    }
}

impl std::fmt::Display for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.to_bytes()))
    }
}

/// A parsed SIP message, request or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipMessage {
    Request(Request),
    Response(Response),
}

impl SipMessage {
    /// Parse a single datagram-framed message with default limits.
    pub fn parse(buf: &[u8]) -> crate::Result<SipMessage> {
        let (msg, _) = parser::parse_message(buf, Framing::Datagram, &ParseLimits::default())?;
        Ok(msg)
    }

    pub fn is_request(&self) -> bool {
        matches!(self, SipMessage::Request(_))
    }

    pub fn headers(&self) -> &Headers {
        match self {
            SipMessage::Request(req) => &req.headers,
            SipMessage::Response(resp) => &resp.headers,
        }
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        match self {
            SipMessage::Request(req) => &mut req.headers,
            SipMessage::Response(resp) => &mut resp.headers,
        }
    }

    pub fn body(&self) -> &[u8] {
        match self {
            SipMessage::Request(req) => &req.body,
            SipMessage::Response(resp) => &resp.body,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            SipMessage::Request(req) => req.to_bytes(),
            SipMessage::Response(resp) => resp.to_bytes(),
        }
    }
}

impl std::fmt::Display for SipMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SipMessage::Request(req) => req.fmt(f),
            SipMessage::Response(resp) => resp.fmt(f),
        }
    }
}

impl From<Request> for SipMessage {
    fn from(req: Request) -> Self {
        SipMessage::Request(req)
    }
}

impl From<Response> for SipMessage {
    fn from(resp: Response) -> Self {
        SipMessage::Response(resp)
    }
}

impl TryFrom<&[u8]> for SipMessage {
    type Error = crate::Error;

    fn try_from(buf: &[u8]) -> Result<Self, Self::Error> {
        SipMessage::parse(buf)
    }
}
