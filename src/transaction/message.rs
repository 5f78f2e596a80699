use super::endpoint::EndpointInner;
use super::make_call_id;
use crate::message::{
    CSeq, Header, Headers, Method, NameAddr, Request, Response, StatusCode, Uri, Version, Via,
};
use crate::{Error, Result};

impl EndpointInner {
    /// Fabricate a request with the mandatory header set.
    ///
    /// Headers are written in the order Via, Call-ID, From, To, CSeq,
    /// Max-Forwards, User-Agent; the caller adds Contact, Content-Type and
    /// anything method-specific afterwards.
    pub fn make_request(
        &self,
        method: Method,
        req_uri: Uri,
        via: Via,
        from: NameAddr,
        to: NameAddr,
        seq: u32,
    ) -> Request {
        let headers = Headers::from(vec![
            Header::new("Via", via.to_string()),
            Header::new("Call-ID", make_call_id(self.option.callid_suffix.as_deref())),
            Header::new("From", from.to_string()),
            Header::new("To", to.to_string()),
            Header::new("CSeq", CSeq::new(seq, method).to_string()),
            Header::new("Max-Forwards", "70"),
            Header::new("User-Agent", self.user_agent.clone()),
        ]);
        Request {
            method,
            uri: req_uri,
            version: Version::V2,
            headers,
            body: Vec::new(),
        }
    }

    /// Fabricate a response to `req`, copying the headers a response must
    /// mirror (Via chain, Call-ID, From, To, CSeq) and dropping the rest.
    pub fn make_response(
        &self,
        req: &Request,
        status_code: StatusCode,
        body: Option<Vec<u8>>,
    ) -> Response {
        let mut headers = Headers::new();
        for via in req.headers.get_all("Via") {
            headers.push("Via", via);
        }
        for name in ["From", "To", "Call-ID", "CSeq"] {
            if let Some(value) = req.headers.get(name) {
                headers.push(name, value);
            }
        }
        headers.push("User-Agent", self.user_agent.clone());
        Response {
            status_code,
            reason: None,
            version: Version::V2,
            headers,
            body: body.unwrap_or_default(),
        }
    }
}

/// The raw topmost Via value of a request, comma folds split.
pub fn top_via_value(request: &Request) -> Result<String> {
    let raw = request
        .headers
        .get("Via")
        .ok_or_else(|| Error::ProtocolError("request without Via".to_string()))?;
    crate::message::headers::split_comma_values(raw)
        .first()
        .map(|v| v.to_string())
        .ok_or_else(|| Error::ProtocolError("empty Via header".to_string()))
}

/// ACK for a non-2xx final response (RFC 3261 section 17.1.1.3): same
/// Request-URI, same top Via (branch included), CSeq number of the INVITE
/// with method ACK, and the To from the response so its tag is carried.
pub fn make_ack_for_failure(original: &Request, response: &Response) -> Result<Request> {
    let cseq = original.headers.cseq()?;
    let mut headers = Headers::new();
    headers.push("Via", top_via_value(original)?);
    if let Some(from) = original.headers.get("From") {
        headers.push("From", from);
    }
    if let Some(to) = response.headers.get("To") {
        headers.push("To", to);
    }
    headers.push("Call-ID", original.headers.call_id()?);
    headers.push("CSeq", CSeq::new(cseq.seq, Method::Ack).to_string());
    headers.push("Max-Forwards", "70");
    for route in original.headers.get_all("Route") {
        headers.push("Route", route);
    }
    Ok(Request {
        method: Method::Ack,
        uri: original.uri.clone(),
        version: Version::V2,
        headers,
        body: Vec::new(),
    })
}

/// CANCEL for a pending INVITE (RFC 3261 section 9.1): identical
/// Request-URI, top Via (so it matches the INVITE by branch), From, To
/// and Call-ID, with the CSeq method swapped.
pub fn make_cancel(original: &Request) -> Result<Request> {
    let cseq = original.headers.cseq()?;
    let mut headers = Headers::new();
    headers.push("Via", top_via_value(original)?);
    if let Some(from) = original.headers.get("From") {
        headers.push("From", from);
    }
    if let Some(to) = original.headers.get("To") {
        headers.push("To", to);
    }
    headers.push("Call-ID", original.headers.call_id()?);
    headers.push("CSeq", CSeq::new(cseq.seq, Method::Cancel).to_string());
    headers.push("Max-Forwards", "70");
    for route in original.headers.get_all("Route") {
        headers.push("Route", route);
    }
    Ok(Request {
        method: Method::Cancel,
        uri: original.uri.clone(),
        version: Version::V2,
        headers,
        body: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invite() -> Request {
        Request {
            method: Method::Invite,
            uri: Uri::try_from("sip:bob@ex.com").unwrap(),
            version: Version::V2,
            headers: Headers::from(vec![
                Header::new("Via", "SIP/2.0/UDP a.ex.com:5060;branch=z9hG4bKm1"),
                Header::new("From", "<sip:alice@ex.com>;tag=f1"),
                Header::new("To", "<sip:bob@ex.com>"),
                Header::new("Call-ID", "m1"),
                Header::new("CSeq", "3 INVITE"),
                Header::new("Route", "<sip:proxy.ex.com;lr>"),
            ]),
            body: b"v=0".to_vec(),
        }
    }

    #[test]
    fn ack_for_failure_mirrors_invite_and_response() {
        let original = invite();
        let response = Response {
            status_code: StatusCode::BusyHere,
            reason: None,
            version: Version::V2,
            headers: Headers::from(vec![
                Header::new("Via", "SIP/2.0/UDP a.ex.com:5060;branch=z9hG4bKm1"),
                Header::new("To", "<sip:bob@ex.com>;tag=remote9"),
            ]),
            body: Vec::new(),
        };
        let ack = make_ack_for_failure(&original, &response).unwrap();
        assert_eq!(ack.method, Method::Ack);
        assert_eq!(ack.uri, original.uri);
        assert_eq!(ack.headers.cseq().unwrap().seq, 3);
        assert_eq!(ack.headers.cseq().unwrap().method, Method::Ack);
        assert_eq!(ack.headers.to_header().unwrap().tag(), Some("remote9"));
        assert_eq!(
            ack.headers.via().unwrap().branch(),
            Some("z9hG4bKm1"),
        );
        assert_eq!(ack.headers.get_all("Route").len(), 1);
        assert!(ack.body.is_empty());
    }

    #[test]
    fn cancel_shares_the_invite_branch() {
        let original = invite();
        let cancel = make_cancel(&original).unwrap();
        assert_eq!(cancel.method, Method::Cancel);
        assert_eq!(cancel.headers.via().unwrap().branch(), Some("z9hG4bKm1"));
        assert_eq!(cancel.headers.cseq().unwrap().seq, 3);
        assert_eq!(cancel.headers.cseq().unwrap().method, Method::Cancel);
        assert_eq!(cancel.headers.to_header().unwrap().tag(), None);
    }
}
