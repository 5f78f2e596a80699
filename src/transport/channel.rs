use super::connection::{TransportEvent, TransportSender};
use super::SipAddr;
use crate::message::SipMessage;
use crate::{Error, Result};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;

struct ChannelInner {
    addr: SipAddr,
    reliable: bool,
    outbound: UnboundedSender<(SipMessage, SipAddr)>,
    inbound_tx: UnboundedSender<(SipMessage, SipAddr)>,
    inbound_rx: Mutex<Option<UnboundedReceiver<(SipMessage, SipAddr)>>>,
}

/// In-process loopback transport.
///
/// Everything sent through the connection lands on the receiver returned
/// by [`ChannelConnection::new`], and [`ChannelConnection::injector`]
/// feeds inbound traffic, so state machines can be exercised without
/// sockets. Defaults to unreliable so the datagram timer paths run.
#[derive(Clone)]
pub struct ChannelConnection {
    inner: Arc<ChannelInner>,
}

impl ChannelConnection {
    pub fn new(
        addr: SipAddr,
        reliable: bool,
    ) -> (ChannelConnection, UnboundedReceiver<(SipMessage, SipAddr)>) {
        let (outbound, wire_rx) = unbounded_channel();
        let (inbound_tx, inbound_rx) = unbounded_channel();
        let connection = ChannelConnection {
            inner: Arc::new(ChannelInner {
                addr,
                reliable,
                outbound,
                inbound_tx,
                inbound_rx: Mutex::new(Some(inbound_rx)),
            }),
        };
        (connection, wire_rx)
    }

    pub fn local_addr(&self) -> SipAddr {
        self.inner.addr
    }

    pub fn is_reliable(&self) -> bool {
        self.inner.reliable
    }

    /// Sender that delivers messages as if they arrived from the wire.
    pub fn injector(&self) -> UnboundedSender<(SipMessage, SipAddr)> {
        self.inner.inbound_tx.clone()
    }

    pub async fn send(&self, msg: SipMessage, destination: Option<&SipAddr>) -> Result<()> {
        let dest = destination.copied().unwrap_or(self.inner.addr);
        self.inner
            .outbound
            .send((msg, dest))
            .map_err(|_| Error::TransportError("channel closed".to_string(), self.inner.addr))
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let mut rx = self
            .inner
            .inbound_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Error("channel already being served".to_string()))?;
        while let Some((msg, source)) = rx.recv().await {
            if sender
                .send(TransportEvent::Incoming(msg, self.clone().into(), source))
                .is_err()
            {
                break;
            }
        }
        Ok(())
    }
}
