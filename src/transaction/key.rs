use crate::message::{Method, Request, Response};
use crate::{Error, Result};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionRole {
    Client,
    Server,
}

/// Identity of a transaction for table lookup (RFC 3261 section 17.2.3).
///
/// Responses match on the top Via branch plus the CSeq method; requests
/// additionally match on the top Via sent-by. An ACK carries the INVITE's
/// method here so it lands on the INVITE transaction; a CANCEL keeps its
/// own method and reaches its INVITE through [`TransactionKey::invite_key`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    pub branch: String,
    pub method: Method,
    pub sent_by: String,
    pub role: TransactionRole,
}

impl TransactionKey {
    pub fn from_request(request: &Request, role: TransactionRole) -> Result<TransactionKey> {
        let via = request.headers.via()?;
        let branch = via
            .branch()
            .ok_or_else(|| Error::ProtocolError("Via without branch".to_string()))?
            .to_string();
        let method = match request.method {
            Method::Ack => Method::Invite,
            m => m,
        };
        Ok(TransactionKey {
            branch,
            method,
            sent_by: via.sent_by,
            role,
        })
    }

    pub fn from_response(response: &Response, role: TransactionRole) -> Result<TransactionKey> {
        let via = response.headers.via()?;
        let branch = via
            .branch()
            .ok_or_else(|| Error::ProtocolError("Via without branch".to_string()))?
            .to_string();
        let cseq = response.headers.cseq()?;
        let method = match cseq.method {
            Method::Ack => Method::Invite,
            m => m,
        };
        Ok(TransactionKey {
            branch,
            method,
            sent_by: via.sent_by,
            role,
        })
    }

    /// The key of the INVITE transaction a CANCEL refers to: same branch
    /// and sent-by, method swapped.
    pub fn invite_key(&self) -> TransactionKey {
        TransactionKey {
            branch: self.branch.clone(),
            method: Method::Invite,
            sent_by: self.sent_by.clone(),
            role: self.role,
        }
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let role = match self.role {
            TransactionRole::Client => "uac",
            TransactionRole::Server => "uas",
        };
        write!(f, "{}:{}:{}:{}", role, self.method, self.branch, self.sent_by)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Header, Headers, StatusCode, Uri, Version};

    fn request(method: Method, branch: &str) -> Request {
        Request {
            method,
            uri: Uri::try_from("sip:bob@ex.com").unwrap(),
            version: Version::V2,
            headers: Headers::from(vec![
                Header::new("Via", format!("SIP/2.0/UDP a.ex.com:5060;branch={}", branch)),
                Header::new("CSeq", format!("1 {}", method)),
                Header::new("Call-ID", "k1"),
            ]),
            body: Vec::new(),
        }
    }

    #[test]
    fn ack_maps_onto_invite_key() {
        let invite = TransactionKey::from_request(
            &request(Method::Invite, "z9hG4bKk"),
            TransactionRole::Server,
        )
        .unwrap();
        let ack = TransactionKey::from_request(
            &request(Method::Ack, "z9hG4bKk"),
            TransactionRole::Server,
        )
        .unwrap();
        assert_eq!(invite, ack);
    }

    #[test]
    fn cancel_keeps_its_own_key_but_references_the_invite() {
        let invite = TransactionKey::from_request(
            &request(Method::Invite, "z9hG4bKk"),
            TransactionRole::Server,
        )
        .unwrap();
        let cancel = TransactionKey::from_request(
            &request(Method::Cancel, "z9hG4bKk"),
            TransactionRole::Server,
        )
        .unwrap();
        assert_ne!(invite, cancel);
        assert_eq!(cancel.invite_key(), invite);
    }

    #[test]
    fn response_matches_on_branch_and_cseq_method() {
        let response = Response {
            status_code: StatusCode::OK,
            reason: None,
            version: Version::V2,
            headers: Headers::from(vec![
                Header::new("Via", "SIP/2.0/UDP a.ex.com:5060;branch=z9hG4bKk"),
                Header::new("CSeq", "1 INVITE"),
            ]),
            body: Vec::new(),
        };
        let from_resp =
            TransactionKey::from_response(&response, TransactionRole::Client).unwrap();
        let from_req = TransactionKey::from_request(
            &request(Method::Invite, "z9hG4bKk"),
            TransactionRole::Client,
        )
        .unwrap();
        assert_eq!(from_resp, from_req);
    }

    #[test]
    fn missing_branch_is_rejected() {
        let mut req = request(Method::Invite, "z9hG4bKk");
        req.headers.unique_push("Via", "SIP/2.0/UDP a.ex.com:5060");
        assert!(TransactionKey::from_request(&req, TransactionRole::Client).is_err());
    }
}
