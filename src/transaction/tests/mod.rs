//! Transaction state machine tests.
//!
//! These drive the machines through the event channel directly, with a
//! channel transport capturing everything that would hit the wire.

mod test_client_transaction;
mod test_endpoint_routing;
mod test_server_transaction;

use crate::message::{Header, Headers, Method, Request, Response, StatusCode, Uri, Version};
use crate::transaction::endpoint::{Endpoint, EndpointBuilder};
use crate::transport::channel::ChannelConnection;
use crate::transport::{SipAddr, TransportKind, TransportLayer};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

pub(crate) fn test_addr(port: u16) -> SipAddr {
    SipAddr::new(
        TransportKind::Udp,
        format!("127.0.0.1:{}", port).parse().unwrap(),
    )
}

pub(crate) fn create_test_endpoint() -> Endpoint {
    let token = CancellationToken::new();
    let transport_layer = TransportLayer::new(token.child_token());
    EndpointBuilder::new()
        .with_user_agent("sipua-test")
        .with_transport_layer(transport_layer)
        .with_cancel_token(token)
        .build()
}

pub(crate) fn wire_pair(
    port: u16,
) -> (
    ChannelConnection,
    UnboundedReceiver<(crate::message::SipMessage, SipAddr)>,
) {
    ChannelConnection::new(test_addr(port), false)
}

pub(crate) fn make_request(method: Method, branch: &str, seq: u32) -> Request {
    Request {
        method,
        uri: Uri::try_from("sip:bob@example.com").unwrap(),
        version: Version::V2,
        headers: Headers::from(vec![
            Header::new(
                "Via",
                format!("SIP/2.0/UDP alice.example.com:5060;branch={}", branch),
            ),
            Header::new("From", "<sip:alice@example.com>;tag=from1"),
            Header::new("To", "<sip:bob@example.com>"),
            Header::new("Call-ID", "tx-test-call"),
            Header::new("CSeq", format!("{} {}", seq, method)),
            Header::new("Contact", "<sip:alice@alice.example.com:5060>"),
            Header::new("Max-Forwards", "70"),
        ]),
        body: Vec::new(),
    }
}

pub(crate) fn make_response(
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
    }
    Response {
        status_code,
        reason: None,
        version: Version::V2,
        headers,
        body: Vec::new(),
    }
}
