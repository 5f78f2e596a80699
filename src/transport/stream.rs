use super::connection::{
    TransportEvent, TransportSender, KEEPALIVE_REQUEST, KEEPALIVE_RESPONSE,
};
use super::{SipAddr, TransportKind, TransportLayer};
use crate::message::parser::{self, Framing, ParseErrorKind, ParseLimits};
use crate::message::SipMessage;
use crate::{Error, Result};
use bytes::{Buf, BufMut, BytesMut};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};
use tracing::{debug, info, warn};

/// Framing codec for stream transports.
///
/// Messages are delimited by parsing: headers up to the blank line, then
/// exactly `Content-Length` body bytes. Keepalive CRLF sequences are
/// recognised and surfaced as their own items so the connection can
/// answer them without involving the endpoint.
pub struct SipCodec {
    limits: ParseLimits,
}

impl SipCodec {
    pub fn new() -> Self {
        Self {
            limits: ParseLimits::default(),
        }
    }
}

impl Default for SipCodec {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub enum SipCodecType {
    Message(SipMessage),
    KeepaliveRequest,
    KeepaliveResponse,
}

impl std::fmt::Display for SipCodecType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SipCodecType::Message(msg) => write!(f, "{}", msg),
            SipCodecType::KeepaliveRequest => write!(f, "Keepalive Request"),
            SipCodecType::KeepaliveResponse => write!(f, "Keepalive Response"),
        }
    }
}

impl Decoder for SipCodec {
    type Item = SipCodecType;
    type Error = crate::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() >= KEEPALIVE_REQUEST.len()
            && &src[..KEEPALIVE_REQUEST.len()] == KEEPALIVE_REQUEST
        {
            src.advance(KEEPALIVE_REQUEST.len());
            return Ok(Some(SipCodecType::KeepaliveRequest));
        }
        if src.len() >= KEEPALIVE_RESPONSE.len()
            && &src[..KEEPALIVE_RESPONSE.len()] == KEEPALIVE_RESPONSE
        {
            src.advance(KEEPALIVE_RESPONSE.len());
            return Ok(Some(SipCodecType::KeepaliveResponse));
        }
        if src.is_empty() {
            return Ok(None);
        }
        match parser::parse_message(src, Framing::Stream, &self.limits) {
            Ok((msg, consumed)) => {
                src.advance(consumed);
                Ok(Some(SipCodecType::Message(msg)))
            }
            Err(e) if e.kind == ParseErrorKind::Truncated => {
                if src.len() > self.limits.max_message_size {
                    return Err(Error::ParseError(e));
                }
                Ok(None)
            }
            // Stream framing is unrecoverable after a parse failure.
            Err(e) => Err(Error::ParseError(e)),
        }
    }
}

impl Encoder<SipMessage> for SipCodec {
    type Error = crate::Error;

    fn encode(&mut self, item: SipMessage, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(&item.to_bytes());
        Ok(())
    }
}

impl Encoder<SipCodecType> for SipCodec {
    type Error = crate::Error;

    fn encode(&mut self, item: SipCodecType, dst: &mut BytesMut) -> Result<()> {
        match item {
            SipCodecType::Message(msg) => dst.extend_from_slice(&msg.to_bytes()),
            SipCodecType::KeepaliveRequest => dst.put_slice(KEEPALIVE_REQUEST),
            SipCodecType::KeepaliveResponse => dst.put_slice(KEEPALIVE_RESPONSE),
        }
        Ok(())
    }
}

pub struct StreamConnectionInner {
    local_addr: SipAddr,
    remote_addr: SipAddr,
    read_half: Mutex<Option<FramedRead<OwnedReadHalf, SipCodec>>>,
    write_half: Mutex<FramedWrite<OwnedWriteHalf, SipCodec>>,
}

/// A connected TCP transport.
#[derive(Clone)]
pub struct StreamConnection {
    inner: Arc<StreamConnectionInner>,
}

impl StreamConnection {
    pub async fn connect(peer: SocketAddr) -> Result<StreamConnection> {
        let stream = TcpStream::connect(peer).await?;
        info!("tcp transport connected: {}", peer);
        Self::from_stream(stream)
    }

    pub fn from_stream(stream: TcpStream) -> Result<StreamConnection> {
        let local_addr = SipAddr::new(TransportKind::Tcp, stream.local_addr()?);
        let remote_addr = SipAddr::new(TransportKind::Tcp, stream.peer_addr()?);
        let (read, write) = stream.into_split();
        Ok(StreamConnection {
            inner: Arc::new(StreamConnectionInner {
                local_addr,
                remote_addr,
                read_half: Mutex::new(Some(FramedRead::new(read, SipCodec::new()))),
                write_half: Mutex::new(FramedWrite::new(write, SipCodec::new())),
            }),
        })
    }

    pub fn local_addr(&self) -> SipAddr {
        self.inner.local_addr
    }

    pub fn remote_addr(&self) -> SipAddr {
        self.inner.remote_addr
    }

    pub async fn send(&self, msg: SipMessage) -> Result<()> {
        let mut write_half = self.inner.write_half.lock().await;
        write_half
            .send(msg)
            .await
            .map_err(|e| Error::TransportError(e.to_string(), self.inner.remote_addr))
    }

    async fn send_keepalive_response(&self) -> Result<()> {
        let mut write_half = self.inner.write_half.lock().await;
        write_half
            .send(SipCodecType::KeepaliveResponse)
            .await
            .map_err(|e| Error::TransportError(e.to_string(), self.inner.remote_addr))
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let mut read_half = self
            .inner
            .read_half
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Error("stream already being served".to_string()))?;
        while let Some(item) = read_half.next().await {
            match item {
                Ok(SipCodecType::Message(msg)) => {
                    if sender
                        .send(TransportEvent::Incoming(
                            msg,
                            self.clone().into(),
                            self.inner.remote_addr,
                        ))
                        .is_err()
                    {
                        break;
                    }
                }
                Ok(SipCodecType::KeepaliveRequest) => {
                    self.send_keepalive_response().await.ok();
                }
                Ok(SipCodecType::KeepaliveResponse) => {}
                Err(e) => {
                    // Unrecoverable framing: close the connection.
                    debug!("closing stream from {}: {}", self.inner.remote_addr, e);
                    break;
                }
            }
        }
        sender
            .send(TransportEvent::Closed(self.clone().into()))
            .ok();
        Ok(())
    }

    /// Accept loop for a TCP listening socket. Each accepted connection is
    /// registered with the transport layer and served until it closes.
    pub async fn serve_listener(
        listener: TcpListener,
        transport_layer: TransportLayer,
        sender: TransportSender,
    ) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let connection = match StreamConnection::from_stream(stream) {
                Ok(c) => c,
                Err(e) => {
                    warn!("rejected stream from {}: {}", peer, e);
                    continue;
                }
            };
            let sip_connection: super::SipConnection = connection.clone().into();
            transport_layer.add_connection(sip_connection.clone());
            sender.send(TransportEvent::New(sip_connection)).ok();
            let sender = sender.clone();
            tokio::spawn(async move { connection.serve_loop(sender).await });
        }
    }
}
