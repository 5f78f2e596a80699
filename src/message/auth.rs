//! Digest authentication header forms and hash computation (RFC 2617,
//! with the SHA-256 algorithm choice of RFC 7616).
//!
//! This module only computes and formats; challenge state (nonce issue,
//! replay windows) lives in the registrar, and the client-side retry flow
//! in the dialog layer.

use crate::{Error, Result};
use rand::{distr::Alphanumeric, Rng};
use sha2::{Digest, Sha256};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DigestAlgorithm {
    #[default]
    Md5,
    Sha256,
}

impl DigestAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestAlgorithm::Md5 => "MD5",
            DigestAlgorithm::Sha256 => "SHA-256",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("md5") {
            Ok(DigestAlgorithm::Md5)
        } else if s.eq_ignore_ascii_case("sha-256") {
            Ok(DigestAlgorithm::Sha256)
        } else {
            Err(Error::AuthError(format!("unsupported algorithm: {}", s)))
        }
    }

    pub fn hash(&self, input: &str) -> String {
        match self {
            DigestAlgorithm::Md5 => format!("{:x}", md5::compute(input.as_bytes())),
            DigestAlgorithm::Sha256 => hex::encode(Sha256::digest(input.as_bytes())),
        }
    }
}

/// Split a `Digest` header payload into its comma-separated parameters,
/// unquoting values.
fn parse_auth_params(input: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut quoted = false;
    let mut start = 0usize;
    let bytes = input.as_bytes();
    let push_part = |part: &str, out: &mut Vec<(String, String)>| {
        let part = part.trim();
        if part.is_empty() {
            return;
        }
        if let Some(eq) = part.find('=') {
            let name = part[..eq].trim().to_string();
            let mut value = part[eq + 1..].trim();
            if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
                value = &value[1..value.len() - 1];
            }
            out.push((name, value.to_string()));
        }
    };
    for (i, b) in bytes.iter().enumerate() {
        match b {
            b'"' => quoted = !quoted,
            b',' if !quoted => {
                push_part(&input[start..i], &mut out);
                start = i + 1;
            }
            _ => {}
        }
    }
    push_part(&input[start..], &mut out);
    out
}

fn strip_digest_prefix(value: &str) -> Result<&str> {
    let trimmed = value.trim();
    if trimmed.len() >= 7 && trimmed[..7].eq_ignore_ascii_case("digest ") {
        Ok(&trimmed[7..])
    } else {
        Err(Error::AuthError(format!(
            "not a Digest header: {}",
            trimmed
        )))
    }
}

/// A `WWW-Authenticate` / `Proxy-Authenticate` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub algorithm: DigestAlgorithm,
    pub qop: Option<String>,
    pub stale: bool,
}

impl DigestChallenge {
    pub fn parse(value: &str) -> Result<DigestChallenge> {
        let params = parse_auth_params(strip_digest_prefix(value)?);
        let mut challenge = DigestChallenge {
            realm: String::new(),
            nonce: String::new(),
            opaque: None,
            algorithm: DigestAlgorithm::Md5,
            qop: None,
            stale: false,
        };
        for (name, value) in params {
            match name.to_ascii_lowercase().as_str() {
                "realm" => challenge.realm = value,
                "nonce" => challenge.nonce = value,
                "opaque" => challenge.opaque = Some(value),
                "algorithm" => challenge.algorithm = DigestAlgorithm::parse(&value)?,
                "qop" => challenge.qop = Some(value),
                "stale" => challenge.stale = value.eq_ignore_ascii_case("true"),
                _ => {}
            }
        }
        if challenge.realm.is_empty() || challenge.nonce.is_empty() {
            return Err(Error::AuthError(
                "challenge missing realm or nonce".to_string(),
            ));
        }
        Ok(challenge)
    }
}

impl fmt::Display for DigestChallenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Digest realm=\"{}\", nonce=\"{}\"",
            self.realm, self.nonce
        )?;
        if let Some(opaque) = &self.opaque {
            write!(f, ", opaque=\"{}\"", opaque)?;
        }
        write!(f, ", algorithm={}", self.algorithm.as_str())?;
        if let Some(qop) = &self.qop {
            write!(f, ", qop=\"{}\"", qop)?;
        }
        if self.stale {
            write!(f, ", stale=true")?;
        }
        Ok(())
    }
}

/// An `Authorization` / `Proxy-Authorization` credential set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestCredentials {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
    pub algorithm: DigestAlgorithm,
    pub cnonce: Option<String>,
    pub nc: Option<String>,
    pub qop: Option<String>,
    pub opaque: Option<String>,
}

impl DigestCredentials {
    pub fn parse(value: &str) -> Result<DigestCredentials> {
        let params = parse_auth_params(strip_digest_prefix(value)?);
        let mut creds = DigestCredentials {
            username: String::new(),
            realm: String::new(),
            nonce: String::new(),
            uri: String::new(),
            response: String::new(),
            algorithm: DigestAlgorithm::Md5,
            cnonce: None,
            nc: None,
            qop: None,
            opaque: None,
        };
        for (name, value) in params {
            match name.to_ascii_lowercase().as_str() {
                "username" => creds.username = value,
                "realm" => creds.realm = value,
                "nonce" => creds.nonce = value,
                "uri" => creds.uri = value,
                "response" => creds.response = value,
                "algorithm" => creds.algorithm = DigestAlgorithm::parse(&value)?,
                "cnonce" => creds.cnonce = Some(value),
                "nc" => creds.nc = Some(value),
                "qop" => creds.qop = Some(value),
                "opaque" => creds.opaque = Some(value),
                _ => {}
            }
        }
        if creds.username.is_empty() || creds.nonce.is_empty() || creds.response.is_empty() {
            return Err(Error::AuthError(
                "credentials missing username, nonce or response".to_string(),
            ));
        }
        Ok(creds)
    }

    /// Nonce count as a number; `nc` is hexadecimal on the wire.
    pub fn nonce_count(&self) -> Option<u32> {
        self.nc
            .as_deref()
            .and_then(|nc| u32::from_str_radix(nc, 16).ok())
    }

    /// Answer a challenge for the given request method and digest URI.
    pub fn answer(
        challenge: &DigestChallenge,
        username: &str,
        password: &str,
        method: &str,
        uri: &str,
        nonce_count: u32,
    ) -> DigestCredentials {
        let qop = challenge.qop.as_deref().map(|q| {
            // The server may offer "auth,auth-int"; we only do "auth".
            if q.split(',').any(|p| p.trim() == "auth") {
                "auth".to_string()
            } else {
                q.to_string()
            }
        });
        let cnonce = qop.is_some().then(make_cnonce);
        let nc = qop.is_some().then(|| format!("{:08x}", nonce_count));
        let response = digest_response(
            challenge.algorithm,
            username,
            &challenge.realm,
            password,
            method,
            uri,
            &challenge.nonce,
            nc.as_deref(),
            cnonce.as_deref(),
            qop.as_deref(),
        );
        DigestCredentials {
            username: username.to_string(),
            realm: challenge.realm.clone(),
            nonce: challenge.nonce.clone(),
            uri: uri.to_string(),
            response,
            algorithm: challenge.algorithm,
            cnonce,
            nc,
            qop,
            opaque: challenge.opaque.clone(),
        }
    }
}

impl fmt::Display for DigestCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\"",
            self.username, self.realm, self.nonce, self.uri, self.response
        )?;
        write!(f, ", algorithm={}", self.algorithm.as_str())?;
        if let Some(cnonce) = &self.cnonce {
            write!(f, ", cnonce=\"{}\"", cnonce)?;
        }
        if let Some(nc) = &self.nc {
            write!(f, ", nc={}", nc)?;
        }
        if let Some(qop) = &self.qop {
            write!(f, ", qop={}", qop)?;
        }
        if let Some(opaque) = &self.opaque {
            write!(f, ", opaque=\"{}\"", opaque)?;
        }
        Ok(())
    }
}

/// HA1 = H(username ":" realm ":" password).
pub fn ha1(algorithm: DigestAlgorithm, username: &str, realm: &str, password: &str) -> String {
    algorithm.hash(&format!("{}:{}:{}", username, realm, password))
}

/// The digest response value. With `qop` present the RFC 2617 form is
/// used, otherwise the RFC 2069 compatibility form.
#[allow(clippy::too_many_arguments)]
pub fn digest_response(
    algorithm: DigestAlgorithm,
    username: &str,
    realm: &str,
    password: &str,
    method: &str,
    uri: &str,
    nonce: &str,
    nc: Option<&str>,
    cnonce: Option<&str>,
    qop: Option<&str>,
) -> String {
    let ha1 = ha1(algorithm, username, realm, password);
    let ha2 = algorithm.hash(&format!("{}:{}", method, uri));
    match (qop, nc, cnonce) {
        (Some(qop), Some(nc), Some(cnonce)) => algorithm.hash(&format!(
            "{}:{}:{}:{}:{}:{}",
            ha1, nonce, nc, cnonce, qop, ha2
        )),
        _ => algorithm.hash(&format!("{}:{}:{}", ha1, nonce, ha2)),
    }
}

pub fn make_cnonce() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

/// Compare two hex digests without early exit.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_round_trip() {
        let challenge = DigestChallenge {
            realm: "ex.com".to_string(),
            nonce: "abc123".to_string(),
            opaque: Some("op".to_string()),
            algorithm: DigestAlgorithm::Md5,
            qop: Some("auth".to_string()),
            stale: true,
        };
        let parsed = DigestChallenge::parse(&challenge.to_string()).unwrap();
        assert_eq!(parsed, challenge);
    }

    #[test]
    fn challenge_requires_realm_and_nonce() {
        assert!(DigestChallenge::parse("Digest realm=\"ex.com\"").is_err());
        assert!(DigestChallenge::parse("Basic realm=\"ex.com\"").is_err());
    }

    #[test]
    fn credentials_parse_handles_quoted_commas() {
        let raw = "Digest username=\"a,b\", realm=\"ex.com\", nonce=\"n1\", uri=\"sip:ex.com\", response=\"00\", nc=00000001, qop=auth, cnonce=\"xyz\"";
        let creds = DigestCredentials::parse(raw).unwrap();
        assert_eq!(creds.username, "a,b");
        assert_eq!(creds.nonce_count(), Some(1));
        assert_eq!(creds.qop.as_deref(), Some("auth"));
    }

    #[test]
    fn answer_verifies_against_server_computation() {
        let challenge = DigestChallenge {
            realm: "ex.com".to_string(),
            nonce: "servernonce".to_string(),
            opaque: None,
            algorithm: DigestAlgorithm::Md5,
            qop: Some("auth".to_string()),
            stale: false,
        };
        let creds = DigestCredentials::answer(
            &challenge,
            "alice",
            "secret",
            "REGISTER",
            "sip:ex.com",
            1,
        );
        let expected = digest_response(
            DigestAlgorithm::Md5,
            "alice",
            "ex.com",
            "secret",
            "REGISTER",
            "sip:ex.com",
            "servernonce",
            creds.nc.as_deref(),
            creds.cnonce.as_deref(),
            creds.qop.as_deref(),
        );
        assert!(constant_time_eq(&creds.response, &expected));
    }

    #[test]
    fn qop_less_challenge_uses_rfc2069_form() {
        let challenge = DigestChallenge {
            realm: "ex.com".to_string(),
            nonce: "n".to_string(),
            opaque: None,
            algorithm: DigestAlgorithm::Md5,
            qop: None,
            stale: false,
        };
        let creds =
            DigestCredentials::answer(&challenge, "bob", "pw", "REGISTER", "sip:ex.com", 1);
        assert!(creds.cnonce.is_none());
        assert!(creds.nc.is_none());
        let expected = digest_response(
            DigestAlgorithm::Md5,
            "bob",
            "ex.com",
            "pw",
            "REGISTER",
            "sip:ex.com",
            "n",
            None,
            None,
            None,
        );
        assert_eq!(creds.response, expected);
    }

    #[test]
    fn sha256_is_selectable() {
        let a = DigestAlgorithm::Sha256.hash("abc");
        assert_eq!(a.len(), 64);
        assert_ne!(a, DigestAlgorithm::Md5.hash("abc"));
    }
}
