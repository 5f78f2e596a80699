//! Dialog layer tests.


use crate::message::{Header, Headers, Method, Request, Response, StatusCode, Uri, Version};
use crate::transaction::endpoint::{Endpoint, EndpointBuilder};
use crate::transport::TransportLayer;
use tokio_util::sync::CancellationToken;

pub(crate) fn create_test_endpoint() -> Endpoint {
    let token = CancellationToken::new();
    let transport_layer = TransportLayer::new(token.child_token());
    EndpointBuilder::new()
        .with_user_agent("sipua-test")
        .with_transport_layer(transport_layer)
        .with_cancel_token(token)
        .build()
}

pub(crate) fn create_invite_request(from_tag: &str, to_tag: &str, call_id: &str) -> Request {
    let to = if to_tag.is_empty() {
        "Bob <sip:bob@example.com>".to_string()
    } else {
        format!("Bob <sip:bob@example.com>;tag={}", to_tag)
    };
    Request {
        method: Method::Invite,
        uri: Uri::try_from("sip:bob@example.com:5060").unwrap(),
        version: Version::V2,
        headers: Headers::from(vec![
            Header::new("Via", "SIP/2.0/UDP alice.example.com:5060;branch=z9hG4bKnashds"),
            Header::new("CSeq", "1 INVITE"),
            Header::new(
                "From",
                format!("Alice <sip:alice@example.com>;tag={}", from_tag),
            ),
            Header::new("To", to),
            Header::new("Call-ID", call_id),
            Header::new("Contact", "<sip:alice@alice.example.com:5060>"),
            Header::new("Max-Forwards", "70"),
        ]),
        body: b"v=0\r\no=alice 2890844526 2890844527 IN IP4 host.atlanta.com\r\n".to_vec(),
    }
}

pub(crate) fn response_for(
    request: &Request,
    status_code: StatusCode,
    to_tag: Option<&str>,
) -> Response {
    let mut headers = Headers::new();
    for via in request.headers.get_all("Via") {
        headers.push("Via", via);
    }
    if let Some(from) = request.headers.get("From") {
        headers.push("From", from);
    }
    let to = request.headers.to_header().unwrap();
    let to = match to_tag {
        Some(tag) => to.with_tag(tag),
        None => to,
    };
    headers.push("To", to.to_string());
    headers.push("Call-ID", request.headers.call_id().unwrap());
    if let Some(cseq) = request.headers.get("CSeq") {
        headers.push("CSeq", cseq);
    }
    if status_code.is_success() {
        headers.push("Contact", "<sip:bob@bob.example.com:5060>");
        headers.push("Record-Route", "<sip:p2.example.com;lr>");
        headers.push("Record-Route", "<sip:p1.example.com;lr>");
    }
    Response {
        status_code,
        reason: None,
        version: Version::V2,
        headers,
        body: Vec::new(),
    }
}
