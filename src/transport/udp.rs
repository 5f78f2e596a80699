use super::connection::{TransportEvent, TransportSender, KEEPALIVE_REQUEST, KEEPALIVE_RESPONSE};
use super::{SipAddr, TransportKind};
use crate::message::parser::{self, Framing, ParseLimits};
use crate::message::SipMessage;
use crate::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, info};

struct UdpInner {
    addr: SipAddr,
    socket: UdpSocket,
    limits: ParseLimits,
}

/// Datagram transport: one message per datagram, shared by every peer.
#[derive(Clone)]
pub struct UdpConnection {
    inner: Arc<UdpInner>,
}

impl UdpConnection {
    pub async fn create_connection(local: SocketAddr) -> Result<UdpConnection> {
        let socket = UdpSocket::bind(local).await?;
        let addr = SipAddr::new(TransportKind::Udp, socket.local_addr()?);
        info!("udp transport bound: {}", addr);
        Ok(UdpConnection {
            inner: Arc::new(UdpInner {
                addr,
                socket,
                limits: ParseLimits::default(),
            }),
        })
    }

    pub fn local_addr(&self) -> SipAddr {
        self.inner.addr
    }

    pub async fn send(&self, msg: SipMessage, destination: Option<&SipAddr>) -> Result<()> {
        let dest = destination.ok_or_else(|| {
            Error::TransportError("udp send without destination".to_string(), self.inner.addr)
        })?;
        let bytes = msg.to_bytes();
        self.inner
            .socket
            .send_to(&bytes, dest.addr)
            .await
            .map_err(|e| Error::TransportError(e.to_string(), *dest))?;
        Ok(())
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let mut buf = vec![0u8; self.inner.limits.max_message_size + 1];
        loop {
            let (len, from) = self.inner.socket.recv_from(&mut buf).await?;
            let data = &buf[..len];
            if data == KEEPALIVE_REQUEST {
                self.inner.socket.send_to(KEEPALIVE_RESPONSE, from).await.ok();
                continue;
            }
            if data == KEEPALIVE_RESPONSE || data.iter().all(|b| *b == b'\r' || *b == b'\n') {
                continue;
            }
            match parser::parse_message(data, Framing::Datagram, &self.inner.limits) {
                Ok((msg, _)) => {
                    let source = SipAddr::new(TransportKind::Udp, from);
                    if sender
                        .send(TransportEvent::Incoming(msg, self.clone().into(), source))
                        .is_err()
                    {
                        return Ok(());
                    }
                }
                Err(e) => {
                    // Datagram transports drop malformed input.
                    debug!("dropped malformed datagram from {}: {}", from, e);
                }
            }
        }
    }
}
