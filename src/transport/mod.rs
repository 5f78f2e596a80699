//! Transport façade: serialized bytes to and from peer addresses.
//!
//! Connections hand inbound messages to the endpoint through a
//! [`TransportEvent`] channel and accept outbound messages from the
//! transaction layer. The dialog and transaction layers never touch
//! sockets directly.

pub mod channel;
pub mod connection;
pub mod stream;
pub mod udp;

pub use connection::{SipConnection, TransportEvent, TransportReceiver, TransportSender};

use crate::message::uri::Uri;
use crate::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tokio::net::lookup_host;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransportKind {
    #[default]
    Udp,
    Tcp,
    Tls,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Udp => "UDP",
            TransportKind::Tcp => "TCP",
            TransportKind::Tls => "TLS",
        }
    }

    pub fn is_reliable(&self) -> bool {
        !matches!(self, TransportKind::Udp)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TransportKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("udp") {
            Ok(TransportKind::Udp)
        } else if s.eq_ignore_ascii_case("tcp") {
            Ok(TransportKind::Tcp)
        } else if s.eq_ignore_ascii_case("tls") {
            Ok(TransportKind::Tls)
        } else {
            Err(Error::Error(format!("unknown transport: {}", s)))
        }
    }
}

/// A resolved peer or local address together with the transport it speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SipAddr {
    pub kind: TransportKind,
    pub addr: SocketAddr,
}

impl SipAddr {
    pub fn new(kind: TransportKind, addr: SocketAddr) -> Self {
        SipAddr { kind, addr }
    }
}

impl fmt::Display for SipAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.addr)
    }
}

struct TransportLayerInner {
    cancel_token: CancellationToken,
    // Local listening points, keyed by their bound address.
    listens: RwLock<HashMap<SipAddr, SipConnection>>,
    // Established stream connections, keyed by remote address.
    connections: RwLock<HashMap<SipAddr, SipConnection>>,
}

/// Owns every connection and resolves request URIs to a connection plus a
/// destination address.
#[derive(Clone)]
pub struct TransportLayer {
    inner: Arc<TransportLayerInner>,
}

impl TransportLayer {
    pub fn new(cancel_token: CancellationToken) -> Self {
        TransportLayer {
            inner: Arc::new(TransportLayerInner {
                cancel_token,
                listens: RwLock::new(HashMap::new()),
                connections: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn add_connection(&self, connection: SipConnection) {
        let addr = connection.local_addr();
        info!("transport added: {}", addr);
        self.inner
            .listens
            .write()
            .unwrap()
            .insert(addr, connection);
    }

    pub fn del_connection(&self, addr: &SipAddr) {
        self.inner.listens.write().unwrap().remove(addr);
        self.inner.connections.write().unwrap().remove(addr);
    }

    /// First local listening address, UDP preferred. Used when fabricating
    /// Via and Contact headers.
    pub fn first_addr(&self) -> Option<SipAddr> {
        let listens = self.inner.listens.read().unwrap();
        listens
            .keys()
            .find(|a| a.kind == TransportKind::Udp)
            .or_else(|| listens.keys().next())
            .copied()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.listens.read().unwrap().is_empty()
    }

    /// Resolve a request URI to a connection and destination address.
    ///
    /// The transport comes from the URI's `transport` parameter, or TLS
    /// for `sips`, or UDP otherwise. Hostnames resolve through the system
    /// resolver; for streams an existing connection to the peer is reused
    /// before dialing a new one.
    pub async fn lookup(&self, uri: &Uri) -> Result<(SipConnection, SipAddr)> {
        let kind = if uri.is_secure() {
            TransportKind::Tls
        } else {
            match uri.transport_param() {
                Some(t) => t.parse()?,
                None => TransportKind::Udp,
            }
        };
        let host = uri.host.trim_start_matches('[').trim_end_matches(']');
        let port = uri.effective_port();
        let addr = match host.parse::<std::net::IpAddr>() {
            Ok(ip) => SocketAddr::new(ip, port),
            Err(_) => lookup_host((host, port))
                .await?
                .next()
                .ok_or_else(|| Error::Error(format!("dns resolution failed: {}", host)))?,
        };
        let target = SipAddr::new(kind, addr);

        match kind {
            TransportKind::Udp => {
                let connection = {
                    let listens = self.inner.listens.read().unwrap();
                    listens
                        .iter()
                        .find(|(a, _)| a.kind == TransportKind::Udp)
                        .map(|(_, c)| c.clone())
                };
                match connection {
                    Some(c) => Ok((c, target)),
                    None => Err(Error::TransportError(
                        "no UDP transport configured".to_string(),
                        target,
                    )),
                }
            }
            TransportKind::Tcp => {
                let existing = self
                    .inner
                    .connections
                    .read()
                    .unwrap()
                    .get(&target)
                    .cloned();
                if let Some(c) = existing {
                    return Ok((c, target));
                }
                let connection: SipConnection =
                    stream::StreamConnection::connect(addr).await?.into();
                self.inner
                    .connections
                    .write()
                    .unwrap()
                    .insert(target, connection.clone());
                Ok((connection, target))
            }
            TransportKind::Tls => Err(Error::TransportError(
                "TLS transport is not implemented".to_string(),
                target,
            )),
        }
    }

    /// Spawn a receive loop for every listening connection, pushing
    /// inbound traffic onto `sender` until the layer is cancelled.
    pub fn serve_listens(&self, sender: TransportSender) {
        let connections: Vec<SipConnection> = self
            .inner
            .listens
            .read()
            .unwrap()
            .values()
            .cloned()
            .collect();
        for connection in connections {
            let sender = sender.clone();
            let token = self.inner.cancel_token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    result = connection.serve_loop(sender) => {
                        if let Err(e) = result {
                            tracing::warn!("transport loop ended: {}", e);
                        }
                    }
                }
            });
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel_token
    }
}
