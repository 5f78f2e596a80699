use super::channel::ChannelConnection;
use super::stream::StreamConnection;
use super::udp::UdpConnection;
use super::{SipAddr, TransportKind};
use crate::message::{Request, Response, SipMessage};
use crate::Result;
use std::fmt;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

/// Four CRLFs: a stream keepalive probe.
pub const KEEPALIVE_REQUEST: &[u8] = b"\r\n\r\n";
/// Two CRLFs: the answer to a keepalive probe.
pub const KEEPALIVE_RESPONSE: &[u8] = b"\r\n";

/// Events a connection pushes to the endpoint.
pub enum TransportEvent {
    /// A message arrived: payload, the connection it came in on, and the
    /// peer address it came from.
    Incoming(SipMessage, SipConnection, SipAddr),
    New(SipConnection),
    Closed(SipConnection),
}

pub type TransportSender = UnboundedSender<TransportEvent>;
pub type TransportReceiver = UnboundedReceiver<TransportEvent>;

/// A transport connection. Enum dispatch keeps the send path monomorphic
/// and lets connections be cloned into tables cheaply.
#[derive(Clone)]
pub enum SipConnection {
    Udp(UdpConnection),
    Stream(StreamConnection),
    Channel(ChannelConnection),
}

impl SipConnection {
    pub fn kind(&self) -> TransportKind {
        match self {
            SipConnection::Udp(_) => TransportKind::Udp,
            SipConnection::Stream(c) => c.local_addr().kind,
            SipConnection::Channel(c) => c.local_addr().kind,
        }
    }

    /// Reliable transports skip the retransmission timers and the wait
    /// states that only exist to absorb datagram duplicates.
    pub fn is_reliable(&self) -> bool {
        match self {
            SipConnection::Udp(_) => false,
            SipConnection::Stream(_) => true,
            SipConnection::Channel(c) => c.is_reliable(),
        }
    }

    pub fn local_addr(&self) -> SipAddr {
        match self {
            SipConnection::Udp(c) => c.local_addr(),
            SipConnection::Stream(c) => c.local_addr(),
            SipConnection::Channel(c) => c.local_addr(),
        }
    }

    /// Serialize and deliver a message. Datagram transports require a
    /// destination; stream transports ignore it.
    pub async fn send(&self, msg: SipMessage, destination: Option<&SipAddr>) -> Result<()> {
        match self {
            SipConnection::Udp(c) => c.send(msg, destination).await,
            SipConnection::Stream(c) => c.send(msg).await,
            SipConnection::Channel(c) => c.send(msg, destination).await,
        }
    }

    /// Receive until the peer goes away or the layer is cancelled.
    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        match self {
            SipConnection::Udp(c) => c.serve_loop(sender).await,
            SipConnection::Stream(c) => c.serve_loop(sender).await,
            SipConnection::Channel(c) => c.serve_loop(sender).await,
        }
    }
}

impl fmt::Display for SipConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.local_addr())
    }
}

impl From<UdpConnection> for SipConnection {
    fn from(c: UdpConnection) -> Self {
        SipConnection::Udp(c)
    }
}

impl From<StreamConnection> for SipConnection {
    fn from(c: StreamConnection) -> Self {
        SipConnection::Stream(c)
    }
}

impl From<ChannelConnection> for SipConnection {
    fn from(c: ChannelConnection) -> Self {
        SipConnection::Channel(c)
    }
}

/// Stamp `received` and `rport` on the topmost Via of an inbound request
/// when the sent-by value does not match where the packet actually came
/// from (RFC 3261 section 18.2.1, RFC 3581).
pub fn patch_via_received(request: &mut Request, source: &SipAddr) {
    let Ok(mut via) = request.headers.via() else {
        return;
    };
    let sent_by_matches = via
        .sent_by
        .parse::<std::net::SocketAddr>()
        .map(|a| a == source.addr)
        .unwrap_or(false);
    if sent_by_matches {
        return;
    }
    via.set_param("received", Some(&source.addr.ip().to_string()));
    if via.param("rport").is_some() {
        via.set_param("rport", Some(&source.addr.port().to_string()));
    }
    replace_top_via(request, &via.to_string());
}

fn replace_top_via(request: &mut Request, new_value: &str) {
    let raw = match request.headers.get("Via") {
        Some(raw) => raw.to_string(),
        None => return,
    };
    let mut values = crate::message::headers::split_comma_values(&raw)
        .into_iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>();
    if values.is_empty() {
        return;
    }
    values[0] = new_value.to_string();
    let joined = values.join(", ");
    // Replace only the first Via entry; later entries are untouched.
    let rest: Vec<String> = request
        .headers
        .get_all("Via")
        .into_iter()
        .skip(1)
        .map(|v| v.to_string())
        .collect();
    request.headers.remove("Via");
    request.headers.push("Via", joined);
    for value in rest {
        request.headers.push("Via", value);
    }
}

/// The public address a server observed for us, read from the topmost
/// Via's `received` and `rport` parameters of a response.
pub fn response_via_received(response: &Response) -> Option<std::net::SocketAddr> {
    let via = response.headers.via().ok()?;
    let ip: std::net::IpAddr = via.received()?.parse().ok()?;
    let port = via.rport().or_else(|| {
        via.sent_by
            .rsplit_once(':')
            .and_then(|(_, p)| p.parse().ok())
    })?;
    Some(std::net::SocketAddr::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Headers, Method, Request, Uri, Version};

    fn request_with_via(via: &str) -> Request {
        let mut headers = Headers::new();
        headers.push("Via", via);
        Request {
            method: Method::Register,
            uri: Uri::try_from("sip:ex.com").unwrap(),
            version: Version::V2,
            headers,
            body: Vec::new(),
        }
    }

    #[test]
    fn received_is_added_when_sent_by_differs() {
        let mut req = request_with_via("SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bK1;rport");
        let source = SipAddr::new(TransportKind::Udp, "203.0.113.9:3301".parse().unwrap());
        patch_via_received(&mut req, &source);
        let via = req.headers.via().unwrap();
        assert_eq!(via.received(), Some("203.0.113.9"));
        assert_eq!(via.rport(), Some(3301));
    }

    #[test]
    fn matching_sent_by_is_left_alone() {
        let mut req = request_with_via("SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bK1");
        let source = SipAddr::new(TransportKind::Udp, "10.0.0.1:5060".parse().unwrap());
        patch_via_received(&mut req, &source);
        assert_eq!(req.headers.via().unwrap().received(), None);
    }
}
