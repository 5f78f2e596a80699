use super::parser::{ParseError, ParseErrorKind};
use std::fmt;
use std::hash::{Hash, Hasher};

/// URI scheme. Only `sip` and `sips` are carried by this stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Scheme {
    #[default]
    Sip,
    Sips,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Sip => "sip",
            Scheme::Sips => "sips",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Sip => 5060,
            Scheme::Sips => 5061,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A SIP or SIPS URI.
///
/// Parameter and header maps are ordered vectors so serialization is
/// round-trip stable. A port of 0 means "default for the scheme" and
/// compares equal to an absent port.
///
/// Equality follows RFC 3261 section 19.1.4: scheme and host compare
/// case-insensitively, the user part is case-sensitive, and the known
/// parameters (`transport`, `user`, `ttl`, `method`, `maddr`) must agree
/// when either side carries them.
#[derive(Debug, Clone, Default)]
pub struct Uri {
    pub scheme: Scheme,
    pub user: Option<String>,
    pub password: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub params: Vec<(String, Option<String>)>,
    pub headers: Vec<(String, String)>,
}

const KNOWN_PARAMS: [&str; 5] = ["transport", "user", "ttl", "method", "maddr"];

impl Uri {
    pub fn new(scheme: Scheme, user: Option<&str>, host: &str, port: Option<u16>) -> Self {
        Uri {
            scheme,
            user: user.map(|u| u.to_string()),
            password: None,
            host: host.to_string(),
            port,
            params: Vec::new(),
            headers: Vec::new(),
        }
    }

    /// URI for a concrete socket address, bracketing IPv6 hosts.
    pub fn from_socket_addr(
        scheme: Scheme,
        user: Option<&str>,
        addr: std::net::SocketAddr,
    ) -> Self {
        let host = match addr.ip() {
            std::net::IpAddr::V4(ip) => ip.to_string(),
            std::net::IpAddr::V6(ip) => format!("[{}]", ip),
        };
        Uri::new(scheme, user, &host, Some(addr.port()))
    }

    /// Parse a URI from its textual form.
    ///
    /// Offsets in the returned error are relative to the start of `input`;
    /// the message parser rebases them onto the message buffer.
    pub fn parse(input: &str) -> Result<Uri, ParseError> {
        if let Some(pos) = input
            .bytes()
            .position(|b| b == b'\r' || b == b'\n' || b == 0 || b == b' ')
        {
            return Err(ParseError::new(ParseErrorKind::BadUri, pos));
        }
        let colon = input
            .find(':')
            .ok_or_else(|| ParseError::new(ParseErrorKind::UnknownScheme, 0))?;
        let scheme = match input[..colon].to_ascii_lowercase().as_str() {
            "sip" => Scheme::Sip,
            "sips" => Scheme::Sips,
            _ => return Err(ParseError::new(ParseErrorKind::UnknownScheme, 0)),
        };
        let body_start = colon + 1;
        let body = &input[body_start..];

        let (main, headers_str) = match body.find('?') {
            Some(q) => (&body[..q], Some(&body[q + 1..])),
            None => (body, None),
        };

        let (userinfo, hostpart, host_off) = match main.find('@') {
            Some(at) => (Some(&main[..at]), &main[at + 1..], body_start + at + 1),
            None => (None, main, body_start),
        };

        let (user, password) = match userinfo {
            Some(ui) => match ui.find(':') {
                Some(c) => (
                    Some(percent_decode(&ui[..c])),
                    Some(percent_decode(&ui[c + 1..])),
                ),
                None => (Some(percent_decode(ui)), None),
            },
            None => (None, None),
        };

        let (hostport, params_str) = match hostpart.find(';') {
            Some(sc) => (&hostpart[..sc], Some(&hostpart[sc + 1..])),
            None => (hostpart, None),
        };

        let (host, port) = split_host_port(hostport, host_off)?;
        if host.is_empty() {
            return Err(ParseError::new(ParseErrorKind::BadUri, host_off));
        }

        let mut params = Vec::new();
        if let Some(ps) = params_str {
            for part in ps.split(';') {
                if part.is_empty() {
                    continue;
                }
                match part.find('=') {
                    Some(eq) => params.push((
                        percent_decode(&part[..eq]),
                        Some(percent_decode(&part[eq + 1..])),
                    )),
                    None => params.push((percent_decode(part), None)),
                }
            }
        }

        let mut headers = Vec::new();
        if let Some(hs) = headers_str {
            for part in hs.split('&') {
                if part.is_empty() {
                    continue;
                }
                match part.find('=') {
                    Some(eq) => headers.push((
                        percent_decode(&part[..eq]),
                        percent_decode(&part[eq + 1..]),
                    )),
                    None => headers.push((percent_decode(part), String::new())),
                }
            }
        }

        Ok(Uri {
            scheme,
            user,
            password,
            host: host.to_string(),
            port,
            params,
            headers,
        })
    }

    pub fn is_secure(&self) -> bool {
        self.scheme == Scheme::Sips
    }

    /// Port that applies after defaulting: explicit 0 and absence both mean
    /// the scheme default.
    pub fn effective_port(&self) -> u16 {
        match self.port {
            Some(0) | None => self.scheme.default_port(),
            Some(p) => p,
        }
    }

    /// Value of a URI parameter. The outer `Option` is presence, the inner
    /// one distinguishes `;name` from `;name=value`.
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

    pub fn transport_param(&self) -> Option<&str> {
        self.param("transport").flatten()
    }

    /// `host` or `host:port` as it appears on the wire.
    pub fn host_with_port(&self) -> String {
        match self.port {
            Some(p) => format!("{}:{}", self.host, p),
            None => self.host.clone(),
        }
    }
}

fn split_host_port(hostport: &str, off: usize) -> Result<(&str, Option<u16>), ParseError> {
    if let Some(rest) = hostport.strip_prefix('[') {
        // IPv6 reference
        let close = rest
            .find(']')
            .ok_or_else(|| ParseError::new(ParseErrorKind::BadUri, off))?;
        let host = &hostport[..close + 2];
        let after = &hostport[close + 2..];
        if after.is_empty() {
            return Ok((host, None));
        }
        let port_str = after
            .strip_prefix(':')
            .ok_or_else(|| ParseError::new(ParseErrorKind::BadUri, off + close + 2))?;
        let port = port_str
            .parse::<u16>()
            .map_err(|_| ParseError::new(ParseErrorKind::BadUri, off + close + 3))?;
        return Ok((host, Some(port)));
    }
    match hostport.find(':') {
        Some(c) => {
            let port = hostport[c + 1..]
                .parse::<u16>()
                .map_err(|_| ParseError::new(ParseErrorKind::BadUri, off + c + 1))?;
            Ok((&hostport[..c], Some(port)))
        }
        None => Ok((hostport, None)),
    }
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hi = bytes.get(i + 1).and_then(|b| (*b as char).to_digit(16));
            let lo = bytes.get(i + 2).and_then(|b| (*b as char).to_digit(16));
            if let (Some(hi), Some(lo)) = (hi, lo) {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn percent_encode(input: &str, keep: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for b in input.bytes() {
        if b.is_ascii_alphanumeric() || keep.contains(b as char) {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if let Some(user) = &self.user {
            write!(f, "{}", percent_encode(user, "-_.!~*'()&=+$,;?/"))?;
            if let Some(pw) = &self.password {
                write!(f, ":{}", percent_encode(pw, "-_.!~*'()&=+$,"))?;
            }
            write!(f, "@")?;
        }
        write!(f, "{}", self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        for (name, value) in &self.params {
            match value {
                Some(v) => write!(
                    f,
                    ";{}={}",
                    percent_encode(name, "-_.!~*'()[]/:&+$"),
                    percent_encode(v, "-_.!~*'()[]/:&+$")
                )?,
                None => write!(f, ";{}", percent_encode(name, "-_.!~*'()[]/:&+$"))?,
            }
        }
        let mut first = true;
        for (name, value) in &self.headers {
            let sep = if first { '?' } else { '&' };
            first = false;
            write!(
                f,
                "{}{}={}",
                sep,
                percent_encode(name, "-_.!~*'()[]/?:+$"),
                percent_encode(value, "-_.!~*'()[]/?:+$")
            )?;
        }
        Ok(())
    }
}

impl PartialEq for Uri {
    fn eq(&self, other: &Self) -> bool {
        if self.scheme != other.scheme
            || self.user != other.user
            || self.password != other.password
            || !self.host.eq_ignore_ascii_case(&other.host)
            || self.effective_port() != other.effective_port()
        {
            return false;
        }
        // Known parameters must agree whenever either side carries one.
        for name in KNOWN_PARAMS {
            match (self.param(name), other.param(name)) {
                (None, None) => {}
                (Some(a), Some(b)) => {
                    let matches = match (a, b) {
                        (None, None) => true,
                        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
                        _ => false,
                    };
                    if !matches {
                        return false;
                    }
                }
                _ => return false,
            }
        }
        // Any other parameter present in both must match.
        for (name, value) in &self.params {
            if KNOWN_PARAMS.iter().any(|k| name.eq_ignore_ascii_case(k)) {
                continue;
            }
            if let Some(other_value) = other.param(name) {
                let matches = match (value.as_deref(), other_value) {
                    (None, None) => true,
                    (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
                    _ => false,
                };
                if !matches {
                    return false;
                }
            }
        }
        // Header components are never ignored.
        if self.headers.len() != other.headers.len() {
            return false;
        }
        for (name, value) in &self.headers {
            let found = other.headers.iter().any(|(n, v)| {
                n.eq_ignore_ascii_case(name) && v.eq_ignore_ascii_case(value)
            });
            if !found {
                return false;
            }
        }
        true
    }
}

impl Eq for Uri {}

impl Hash for Uri {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.scheme.hash(state);
        self.user.hash(state);
        self.password.hash(state);
        self.host.to_ascii_lowercase().hash(state);
        self.effective_port().hash(state);
    }
}

impl TryFrom<&str> for Uri {
    type Error = crate::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Uri::parse(value).map_err(crate::Error::ParseError)
    }
}

impl std::str::FromStr for Uri {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uri::try_from(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_uri() {
        let uri = Uri::parse("sips:alice:pw@ex.com:5061;transport=tls?x=1").unwrap();
        assert_eq!(uri.scheme, Scheme::Sips);
        assert_eq!(uri.user.as_deref(), Some("alice"));
        assert_eq!(uri.password.as_deref(), Some("pw"));
        assert_eq!(uri.host, "ex.com");
        assert_eq!(uri.port, Some(5061));
        assert_eq!(uri.transport_param(), Some("tls"));
        assert_eq!(uri.headers, vec![("x".to_string(), "1".to_string())]);
    }

    #[test]
    fn round_trip_is_exact() {
        let input = "sips:alice:pw@ex.com:5061;transport=tls?x=1";
        let uri = Uri::parse(input).unwrap();
        assert_eq!(uri.to_string(), input);
        assert_eq!(Uri::parse(&uri.to_string()).unwrap(), uri);
    }

    #[test]
    fn port_zero_means_default() {
        let explicit = Uri::parse("sip:h.example.com:0").unwrap();
        let absent = Uri::parse("sip:h.example.com").unwrap();
        assert_eq!(explicit, absent);
        assert_eq!(explicit.effective_port(), 5060);
        // The explicit zero survives serialization.
        assert_eq!(explicit.to_string(), "sip:h.example.com:0");
    }

    #[test]
    fn host_and_scheme_are_case_insensitive() {
        let a = Uri::parse("sip:alice@EX.com").unwrap();
        let b = Uri::parse("sip:alice@ex.COM").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn user_is_case_sensitive() {
        let a = Uri::parse("sip:alice@ex.com").unwrap();
        let b = Uri::parse("sip:Alice@ex.com").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn one_sided_known_param_never_matches() {
        let a = Uri::parse("sip:ex.com;transport=udp").unwrap();
        let b = Uri::parse("sip:ex.com").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn one_sided_unknown_param_is_ignored() {
        let a = Uri::parse("sip:ex.com;foo=bar").unwrap();
        let b = Uri::parse("sip:ex.com").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_injection() {
        assert!(Uri::parse("sip:al\rice@ex.com").is_err());
        assert!(Uri::parse("sip:alice@ex.com\n").is_err());
        assert!(Uri::parse("http:example.com").is_err());
    }

    #[test]
    fn percent_decoding_applies_to_user() {
        let uri = Uri::parse("sip:ali%63e@ex.com").unwrap();
        assert_eq!(uri.user.as_deref(), Some("alice"));
    }

    #[test]
    fn ipv6_host() {
        let uri = Uri::parse("sip:[2001:db8::1]:5080").unwrap();
        assert_eq!(uri.host, "[2001:db8::1]");
        assert_eq!(uri.port, Some(5080));
        assert_eq!(uri.to_string(), "sip:[2001:db8::1]:5080");
    }
}
