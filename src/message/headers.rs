use super::method::Method;
use super::uri::Uri;
use crate::{Error, Result};
use std::fmt;

/// Canonical spellings for well-known header names. Compact forms decode
/// to the long name; unknown names pass through as written.
const CANONICAL: [&str; 26] = [
    "Via",
    "From",
    "To",
    "Call-ID",
    "CSeq",
    "Contact",
    "Max-Forwards",
    "Content-Length",
    "Content-Type",
    "Content-Encoding",
    "Expires",
    "Min-Expires",
    "User-Agent",
    "Server",
    "Allow",
    "Supported",
    "Subject",
    "Authorization",
    "WWW-Authenticate",
    "Proxy-Authorization",
    "Proxy-Authenticate",
    "Route",
    "Record-Route",
    "Event",
    "Refer-To",
    "Date",
];

pub fn canonical_name(name: &str) -> String {
    let expanded = match name {
        n if n.eq_ignore_ascii_case("f") => "From",
        n if n.eq_ignore_ascii_case("t") => "To",
        n if n.eq_ignore_ascii_case("i") => "Call-ID",
        n if n.eq_ignore_ascii_case("m") => "Contact",
        n if n.eq_ignore_ascii_case("v") => "Via",
        n if n.eq_ignore_ascii_case("c") => "Content-Type",
        n if n.eq_ignore_ascii_case("l") => "Content-Length",
        n if n.eq_ignore_ascii_case("s") => "Subject",
        n if n.eq_ignore_ascii_case("k") => "Supported",
        n if n.eq_ignore_ascii_case("e") => "Content-Encoding",
        other => other,
    };
    for known in CANONICAL {
        if known.eq_ignore_ascii_case(expanded) {
            return known.to_string();
        }
    }
    expanded.to_string()
}

/// One header entry: canonical name plus the raw value as it appeared on
/// the wire (or as the application set it).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: &str, value: impl Into<String>) -> Self {
        Header {
            name: canonical_name(name),
            value: value.into(),
        }
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.value)
    }
}

/// Ordered header block with case-insensitive lookup.
///
/// Repeated names keep their insertion order; `get` returns the first
/// occurrence and `get_all` every one. Comma-folded multi-value headers
/// (Via, Route, Record-Route, Contact) expose split views through the
/// typed accessors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<Header>,
}

impl Headers {
    pub fn new() -> Self {
        Headers::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.entries.iter()
    }

    pub fn push(&mut self, name: &str, value: impl Into<String>) {
        self.entries.push(Header::new(name, value));
    }

    /// Set the single value for a header, replacing any existing
    /// occurrences while keeping the first one's position.
    pub fn unique_push(&mut self, name: &str, value: impl Into<String>) {
        let canonical = canonical_name(name);
        let value = value.into();
        let mut replaced = false;
        self.entries.retain_mut(|h| {
            if h.name == canonical {
                if replaced {
                    return false;
                }
                h.value = value.clone();
                replaced = true;
            }
            true
        });
        if !replaced {
            self.entries.push(Header {
                name: canonical,
                value,
            });
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        let canonical = canonical_name(name);
        self.entries
            .iter()
            .find(|h| h.name == canonical)
            .map(|h| h.value.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &str) -> Vec<&'a str> {
        let canonical = canonical_name(name);
        self.entries
            .iter()
            .filter(|h| h.name == canonical)
            .map(|h| h.value.as_str())
            .collect()
    }

    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn remove(&mut self, name: &str) {
        let canonical = canonical_name(name);
        self.entries.retain(|h| h.name != canonical);
    }

    fn required(&self, name: &str) -> Result<&str> {
        self.get(name)
            .ok_or_else(|| Error::ProtocolError(format!("missing {} header", name)))
    }

    /// Topmost Via value, parsed.
    pub fn via(&self) -> Result<Via> {
        let raw = self.required("Via")?;
        let first = split_comma_values(raw)
            .into_iter()
            .next()
            .ok_or_else(|| Error::ProtocolError("empty Via header".to_string()))?;
        Via::parse(first)
    }

    /// Every Via value in order, comma folds flattened.
    pub fn vias(&self) -> Result<Vec<Via>> {
        let mut out = Vec::new();
        for raw in self.get_all("Via") {
            for value in split_comma_values(raw) {
                out.push(Via::parse(value)?);
            }
        }
        Ok(out)
    }

    pub fn from_header(&self) -> Result<NameAddr> {
        NameAddr::parse(self.required("From")?)
    }

    pub fn to_header(&self) -> Result<NameAddr> {
        NameAddr::parse(self.required("To")?)
    }

    pub fn call_id(&self) -> Result<&str> {
        self.required("Call-ID")
    }

    pub fn cseq(&self) -> Result<CSeq> {
        CSeq::parse(self.required("CSeq")?)
    }

    pub fn contact(&self) -> Result<NameAddr> {
        let raw = self.required("Contact")?;
        let first = split_comma_values(raw)
            .into_iter()
            .next()
            .ok_or_else(|| Error::ProtocolError("empty Contact header".to_string()))?;
        NameAddr::parse(first)
    }

    /// All Contact values. The wildcard form is rejected here; callers that
    /// accept it check [`Headers::has_wildcard_contact`] first.
    pub fn contacts(&self) -> Result<Vec<NameAddr>> {
        let mut out = Vec::new();
        for raw in self.get_all("Contact") {
            for value in split_comma_values(raw) {
                if value == "*" {
                    return Err(Error::ProtocolError(
                        "wildcard Contact not allowed here".to_string(),
                    ));
                }
                out.push(NameAddr::parse(value)?);
            }
        }
        Ok(out)
    }

    pub fn has_wildcard_contact(&self) -> bool {
        self.get_all("Contact")
            .iter()
            .flat_map(|raw| split_comma_values(raw))
            .any(|v| v == "*")
    }

    pub fn routes(&self) -> Result<Vec<NameAddr>> {
        self.address_list("Route")
    }

    pub fn record_routes(&self) -> Result<Vec<NameAddr>> {
        self.address_list("Record-Route")
    }

    fn address_list(&self, name: &str) -> Result<Vec<NameAddr>> {
        let mut out = Vec::new();
        for raw in self.get_all(name) {
            for value in split_comma_values(raw) {
                out.push(NameAddr::parse(value)?);
            }
        }
        Ok(out)
    }

    pub fn expires(&self) -> Option<u32> {
        self.get("Expires").and_then(|v| v.trim().parse().ok())
    }

    pub fn min_expires(&self) -> Option<u32> {
        self.get("Min-Expires").and_then(|v| v.trim().parse().ok())
    }

    pub fn max_forwards(&self) -> Option<u32> {
        self.get("Max-Forwards").and_then(|v| v.trim().parse().ok())
    }
}

impl<const N: usize> From<[Header; N]> for Headers {
    fn from(entries: [Header; N]) -> Self {
        Headers {
            entries: entries.into_iter().collect(),
        }
    }
}

impl From<Vec<Header>> for Headers {
    fn from(entries: Vec<Header>) -> Self {
        Headers { entries }
    }
}

/// Split a comma-folded header value into its elements, honouring quoted
/// strings and angle-bracketed URIs (which may contain commas).
pub fn split_comma_values(raw: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut quoted = false;
    let mut start = 0usize;
    let bytes = raw.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        match b {
            b'"' if bytes.get(i.wrapping_sub(1)) != Some(&b'\\') => quoted = !quoted,
            b'<' if !quoted => depth += 1,
            b'>' if !quoted && depth > 0 => depth -= 1,
            b',' if !quoted && depth == 0 => {
                let piece = raw[start..i].trim();
                if !piece.is_empty() {
                    out.push(piece);
                }
                start = i + 1;
            }
            _ => {}
        }
    }
    let piece = raw[start..].trim();
    if !piece.is_empty() {
        out.push(piece);
    }
    out
}

fn format_params(f: &mut fmt::Formatter<'_>, params: &[(String, Option<String>)]) -> fmt::Result {
    for (name, value) in params {
        match value {
            Some(v) => write!(f, ";{}={}", name, v)?,
            None => write!(f, ";{}", name)?,
        }
    }
    Ok(())
}

fn parse_semicolon_params(input: &str) -> Vec<(String, Option<String>)> {
    let mut out = Vec::new();
    for part in input.split(';') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.find('=') {
            Some(eq) => out.push((
                part[..eq].trim().to_string(),
                Some(part[eq + 1..].trim().to_string()),
            )),
            None => out.push((part.to_string(), None)),
        }
    }
    out
}

/// Address header value: optional display name, URI, header parameters.
/// Used by From, To, Contact, Route and Record-Route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAddr {
    pub display_name: Option<String>,
    pub uri: Uri,
    pub params: Vec<(String, Option<String>)>,
}

impl NameAddr {
    pub fn new(uri: Uri) -> Self {
        NameAddr {
            display_name: None,
            uri,
            params: Vec::new(),
        }
    }

    pub fn parse(input: &str) -> Result<NameAddr> {
        let input = input.trim();
        if let Some(open) = input.find('<') {
            let close = input[open..]
                .find('>')
                .map(|c| open + c)
                .ok_or_else(|| Error::ProtocolError(format!("unclosed angle bracket: {}", input)))?;
            let display = input[..open].trim();
            let display_name = if display.is_empty() {
                None
            } else {
                Some(unquote(display).to_string())
            };
            let uri = Uri::parse(&input[open + 1..close]).map_err(Error::ParseError)?;
            let params = parse_semicolon_params(&input[close + 1..]);
            Ok(NameAddr {
                display_name,
                uri,
                params,
            })
        } else {
            // addr-spec form: parameters after the URI belong to the header
            let (uri_str, params) = match input.find(';') {
                Some(sc) => (&input[..sc], parse_semicolon_params(&input[sc + 1..])),
                None => (input, Vec::new()),
            };
            let uri = Uri::parse(uri_str).map_err(Error::ParseError)?;
            Ok(NameAddr {
                display_name: None,
                uri,
                params,
            })
        }
    }

    pub fn param(&self, name: &str) -> Option<Option<&str>> {
        self.params
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_deref())
    }

    pub fn set_param(&mut self, name: &str, value: Option<&str>) {
        if let Some(entry) = self
            .params
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            entry.1 = value.map(|v| v.to_string());
        } else {
            self.params
                .push((name.to_string(), value.map(|v| v.to_string())));
        }
    }

    pub fn tag(&self) -> Option<&str> {
        self.param("tag").flatten()
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        self.set_param("tag", Some(tag));
        self
    }

    /// Contact `;expires` parameter, when present and numeric.
    pub fn expires(&self) -> Option<u32> {
        self.param("expires").flatten().and_then(|v| v.parse().ok())
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.display_name {
            let needs_quotes = !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "-.!%*_+`'~".contains(c));
            if needs_quotes {
                write!(f, "\"{}\" ", name)?;
            } else {
                write!(f, "{} ", name)?;
            }
        }
        write!(f, "<{}>", self.uri)?;
        format_params(f, &self.params)
    }
}

fn unquote(s: &str) -> &str {
    let s = s.trim();
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

/// One Via value: transport token, sent-by, parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Via {
    pub transport: String,
    pub sent_by: String,
    pub params: Vec<(String, Option<String>)>,
}

impl Via {
    pub fn parse(input: &str) -> Result<Via> {
        let input = input.trim();
        let space = input
            .find(|c: char| c.is_ascii_whitespace())
            .ok_or_else(|| Error::ProtocolError(format!("malformed Via: {}", input)))?;
        let protocol = &input[..space];
        let transport = protocol
            .strip_prefix("SIP/2.0/")
            .ok_or_else(|| Error::ProtocolError(format!("malformed Via protocol: {}", protocol)))?;
        let rest = input[space..].trim_start();
        let (sent_by, params) = match rest.find(';') {
            Some(sc) => (
                rest[..sc].trim().to_string(),
                parse_semicolon_params(&rest[sc + 1..]),
            ),
            None => (rest.trim().to_string(), Vec::new()),
        };
        if sent_by.is_empty() {
            return Err(Error::ProtocolError(format!("Via without sent-by: {}", input)));
        }
        Ok(Via {
            transport: transport.to_string(),
            sent_by,
            params,
        })
    }

    pub fn param(&self, name: &str) -> Option<Option<&str>> {
        self.params
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_deref())
    }

    pub fn set_param(&mut self, name: &str, value: Option<&str>) {
        if let Some(entry) = self
            .params
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            entry.1 = value.map(|v| v.to_string());
        } else {
            self.params
                .push((name.to_string(), value.map(|v| v.to_string())));
        }
    }

    pub fn branch(&self) -> Option<&str> {
        self.param("branch").flatten()
    }

    pub fn received(&self) -> Option<&str> {
        self.param("received").flatten()
    }

    pub fn rport(&self) -> Option<u16> {
        self.param("rport").flatten().and_then(|v| v.parse().ok())
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0/{} {}", self.transport, self.sent_by)?;
        format_params(f, &self.params)
    }
}

/// CSeq header value: sequence number plus method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CSeq {
    pub seq: u32,
    pub method: Method,
}

impl CSeq {
    pub fn new(seq: u32, method: Method) -> Self {
        CSeq { seq, method }
    }

    pub fn parse(input: &str) -> Result<CSeq> {
        let mut parts = input.split_whitespace();
        let seq = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| Error::ProtocolError(format!("malformed CSeq: {}", input)))?;
        let method = parts
            .next()
            .ok_or_else(|| Error::ProtocolError(format!("CSeq without method: {}", input)))?
            .parse()?;
        Ok(CSeq { seq, method })
    }
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.seq, self.method)
    }
}
