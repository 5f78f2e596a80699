//! Syntactic validation for `application/sdp` bodies.
//!
//! The core treats session descriptions as opaque payload; this hook lets
//! a transaction user reject garbage before acting on an offer or answer.

use super::parser::{ParseError, ParseErrorKind};

/// Check that a body is plausibly RFC 8866 SDP.
///
/// Verifies the line shape (`x=value`), that the description starts with
/// `v=0`, that the mandatory `o=` and `s=` lines are present, and that
/// every `m=` line carries a numeric port. No semantic interpretation.
pub fn validate_sdp(body: &[u8]) -> Result<(), ParseError> {
    let text = std::str::from_utf8(body)
        .map_err(|e| ParseError::new(ParseErrorKind::BadHeaderSyntax, e.valid_up_to()))?;
    let mut offset = 0usize;
    let mut saw_origin = false;
    let mut saw_session_name = false;
    for (index, line) in text.split('\n').enumerate() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            offset += 1;
            continue;
        }
        let mut chars = line.chars();
        let kind = chars.next();
        if chars.next() != Some('=') || !kind.is_some_and(|c| c.is_ascii_lowercase()) {
            return Err(ParseError::new(ParseErrorKind::BadHeaderSyntax, offset));
        }
        let value = &line[2..];
        match kind {
            Some('v') if index == 0 => {
                if value != "0" {
                    return Err(ParseError::new(ParseErrorKind::BadHeaderSyntax, offset));
                }
            }
            Some('v') => {
                return Err(ParseError::new(ParseErrorKind::BadHeaderSyntax, offset));
            }
            Some('o') => saw_origin = true,
            Some('s') => saw_session_name = true,
            Some('m') => {
                // m=<media> <port> <proto> <fmt> ...
                let mut parts = value.split_whitespace();
                let port_ok = parts
                    .nth(1)
                    .map(|p| p.split('/').next().unwrap_or(p))
                    .is_some_and(|p| p.parse::<u32>().is_ok());
                if !port_ok {
                    return Err(ParseError::new(ParseErrorKind::BadHeaderSyntax, offset));
                }
            }
            _ => {}
        }
        if index == 0 && kind != Some('v') {
            return Err(ParseError::new(ParseErrorKind::BadHeaderSyntax, 0));
        }
        offset += line.len() + 1;
    }
    if !saw_origin || !saw_session_name {
        return Err(ParseError::new(ParseErrorKind::BadHeaderSyntax, offset));
    }
    Ok(())
}
