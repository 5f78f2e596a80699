use super::key::{TransactionKey, TransactionRole};
use super::timer::Timer;
use super::transaction::{Transaction, TransactionEvent, TransactionEventSender};
use super::{make_branch, TransactionTimer};
use crate::message::{Method, Request, Response, SipMessage, StatusCode, Via};
use crate::transport::connection::patch_via_received;
use crate::transport::{SipAddr, SipConnection, TransportEvent, TransportLayer};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Tunables for the transaction layer. The RFC defaults are right for
/// production; tests shrink them to keep the clock honest.
#[derive(Debug, Clone)]
pub struct EndpointOption {
    pub t1: Duration,
    pub t2: Duration,
    pub t4: Duration,
    pub t1x64: Duration,
    /// Granularity of the timer wheel poll.
    pub timer_interval: Duration,
    /// Optional `@suffix` for generated Call-IDs.
    pub callid_suffix: Option<String>,
}

impl Default for EndpointOption {
    fn default() -> Self {
        EndpointOption {
            t1: super::T1,
            t2: super::T2,
            t4: super::T4,
            t1x64: super::T1X64,
            timer_interval: Duration::from_millis(20),
            callid_suffix: None,
        }
    }
}

pub type EndpointInnerRef = Arc<EndpointInner>;

/// Shared state behind an [`Endpoint`]: the transaction table, the timer
/// wheel and the transport layer. Transactions hold an `Arc` of this and
/// attach themselves on creation.
pub struct EndpointInner {
    pub user_agent: String,
    pub option: EndpointOption,
    pub timers: Timer<TransactionTimer>,
    pub transport_layer: TransportLayer,
    transactions: RwLock<HashMap<TransactionKey, TransactionEventSender>>,
    incoming_sender: Mutex<Option<UnboundedSender<Transaction>>>,
}

impl EndpointInner {
    pub fn attach_transaction(&self, key: &TransactionKey, sender: TransactionEventSender) {
        self.transactions
            .write()
            .unwrap()
            .insert(key.clone(), sender);
    }

    pub fn detach_transaction(&self, key: &TransactionKey) {
        self.transactions.write().unwrap().remove(key);
    }

    fn lookup_sender(&self, key: &TransactionKey) -> Option<TransactionEventSender> {
        self.transactions.read().unwrap().get(key).cloned()
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.read().unwrap().len()
    }

    /// A Via for an outgoing request: local sent-by, fresh branch unless
    /// one is supplied, `rport` requested.
    pub fn get_via(&self, addr: Option<SipAddr>, branch: Option<String>) -> Result<Via> {
        let addr = addr
            .or_else(|| self.transport_layer.first_addr())
            .ok_or_else(|| Error::Error("no transport configured".to_string()))?;
        Ok(Via {
            transport: addr.kind.as_str().to_string(),
            sent_by: addr.addr.to_string(),
            params: vec![
                ("branch".to_string(), Some(branch.unwrap_or_else(make_branch))),
                ("rport".to_string(), None),
            ],
        })
    }

    /// Drain due timers and deliver them to their transactions.
    pub fn process_timer(&self, now: Instant) {
        for timer in self.timers.poll(now) {
            if let Some(sender) = self.lookup_sender(timer.key()) {
                sender.send(TransactionEvent::Timer(timer)).ok();
            }
        }
    }

    /// Transaction-matching step for everything the transports deliver.
    ///
    /// Responses match a client transaction by branch and CSeq method or
    /// are dropped. Requests match a server transaction, or become a new
    /// one handed to the TU; an ACK that matches nothing is the ACK for a
    /// 2xx and travels to the TU the same way. A CANCEL is answered 481
    /// statelessly unless its INVITE transaction is still alive, in which
    /// case it both becomes its own server transaction and is copied to
    /// the INVITE so the TU can finish it with 487.
    pub async fn on_received_message(
        self: &Arc<Self>,
        msg: SipMessage,
        connection: SipConnection,
        source: SipAddr,
    ) -> Result<()> {
        match msg {
            SipMessage::Request(mut req) => {
                if req.headers.get("Via").is_none() {
                    // Cannot even be answered 400 without a Via to route by.
                    debug!("dropping request without Via from {}", source);
                    return Ok(());
                }
                patch_via_received(&mut req, &source);
                let key = match TransactionKey::from_request(&req, TransactionRole::Server) {
                    Ok(key) => key,
                    Err(e) => {
                        debug!("rejecting unmatchable request from {}: {}", source, e);
                        let resp = self.make_response(&req, StatusCode::BadRequest, None);
                        connection.send(resp.into(), Some(&source)).await.ok();
                        return Ok(());
                    }
                };
                if let Some(sender) = self.lookup_sender(&key) {
                    sender
                        .send(TransactionEvent::Received(req.into(), Some(connection)))
                        .ok();
                    return Ok(());
                }
                if req.method == Method::Cancel {
                    let invite_sender = self.lookup_sender(&key.invite_key());
                    let Some(invite_sender) = invite_sender else {
                        let resp = self.make_response(
                            &req,
                            StatusCode::CallTransactionDoesNotExist,
                            None,
                        );
                        connection.send(resp.into(), Some(&source)).await.ok();
                        return Ok(());
                    };
                    invite_sender
                        .send(TransactionEvent::Received(req.clone().into(), None))
                        .ok();
                    // Fall through: the CANCEL still gets its own server
                    // transaction for its 200.
                }
                let mut tx = Transaction::new_server(key, req, self.clone(), Some(connection));
                tx.destination = Some(source);
                self.deliver_incoming(tx);
            }
            SipMessage::Response(resp) => {
                let key = TransactionKey::from_response(&resp, TransactionRole::Client)?;
                match self.lookup_sender(&key) {
                    Some(sender) => {
                        sender
                            .send(TransactionEvent::Received(resp.into(), Some(connection)))
                            .ok();
                    }
                    None => {
                        debug!("dropping response without transaction: {}", key);
                    }
                }
            }
        }
        Ok(())
    }

    fn deliver_incoming(&self, tx: Transaction) {
        let guard = self.incoming_sender.lock().unwrap();
        match guard.as_ref() {
            Some(sender) => {
                if sender.send(tx).is_err() {
                    warn!("incoming queue closed, transaction dropped");
                }
            }
            None => {
                warn!("no transaction user attached, transaction dropped");
            }
        }
    }
}

/// The transaction-layer endpoint.
///
/// Owns the transaction table, fabricates requests and responses in its
/// own name, and routes between the transport layer and transactions.
/// Everything is reference-counted through [`EndpointInner`], so two
/// endpoints can coexist in one process.
pub struct Endpoint {
    pub inner: EndpointInnerRef,
    cancel_token: CancellationToken,
}

impl Endpoint {
    /// Receiver of server transactions the table did not match: new
    /// requests for the TU to act on. May be taken once.
    pub fn incoming_transactions(&self) -> UnboundedReceiver<Transaction> {
        let (sender, receiver) = unbounded_channel();
        *self.inner.incoming_sender.lock().unwrap() = Some(sender);
        receiver
    }

    /// Drive the endpoint: transport events in, timers out. Runs until
    /// [`Endpoint::shutdown`] or transport teardown.
    pub async fn serve(&self) {
        let (transport_tx, mut transport_rx) = unbounded_channel();
        self.inner.transport_layer.serve_listens(transport_tx);
        let mut ticker = tokio::time::interval(self.inner.option.timer_interval);
        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("endpoint shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.inner.process_timer(Instant::now());
                }
                event = transport_rx.recv() => {
                    match event {
                        Some(TransportEvent::Incoming(msg, connection, source)) => {
                            if let Err(e) =
                                self.inner.on_received_message(msg, connection, source).await
                            {
                                debug!("inbound message rejected: {}", e);
                            }
                        }
                        Some(TransportEvent::New(connection)) => {
                            debug!("transport connected: {}", connection);
                        }
                        Some(TransportEvent::Closed(connection)) => {
                            debug!("transport closed: {}", connection);
                        }
                        None => break,
                    }
                }
            }
        }
        self.inner.timers.clear();
    }

    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }

    /// Send a request through a fresh client transaction and resolve with
    /// its final response, or with `TransactionTimeout` when Timer B or F
    /// fires first. Provisional responses are consumed here; callers that
    /// care about them drive a [`Transaction`] themselves.
    pub async fn send_request(&self, request: Request) -> Result<Response> {
        let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
        let mut tx = Transaction::new_client(key, request, self.inner.clone(), None);
        tx.send().await?;
        while let Some(msg) = tx.receive().await {
            if let SipMessage::Response(resp) = msg {
                if resp.status_code.is_final() {
                    return Ok(resp);
                }
            }
        }
        Err(tx.timeout_error().unwrap_or_else(|| {
            Error::TransactionError(
                "transaction terminated without final response".to_string(),
                tx.key.clone(),
            )
        }))
    }
}

/// Builder for [`Endpoint`], in the shape the rest of the crate expects:
///
/// ```rust,no_run
/// # use sipua::transaction::endpoint::EndpointBuilder;
/// # use sipua::transport::TransportLayer;
/// # use tokio_util::sync::CancellationToken;
/// let token = CancellationToken::new();
/// let endpoint = EndpointBuilder::new()
///     .with_user_agent("sipua/0.1")
///     .with_transport_layer(TransportLayer::new(token.child_token()))
///     .build();
/// ```
pub struct EndpointBuilder {
    user_agent: String,
    transport_layer: Option<TransportLayer>,
    option: EndpointOption,
    cancel_token: Option<CancellationToken>,
}

impl EndpointBuilder {
    pub fn new() -> Self {
        EndpointBuilder {
            user_agent: concat!("sipua/", env!("CARGO_PKG_VERSION")).to_string(),
            transport_layer: None,
            option: EndpointOption::default(),
            cancel_token: None,
        }
    }

    pub fn with_user_agent(mut self, user_agent: &str) -> Self {
        self.user_agent = user_agent.to_string();
        self
    }

    pub fn with_transport_layer(mut self, transport_layer: TransportLayer) -> Self {
        self.transport_layer = Some(transport_layer);
        self
    }

    pub fn with_option(mut self, option: EndpointOption) -> Self {
        self.option = option;
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    pub fn build(self) -> Endpoint {
        let cancel_token = self.cancel_token.unwrap_or_default();
        let transport_layer = self
            .transport_layer
            .unwrap_or_else(|| TransportLayer::new(cancel_token.child_token()));
        Endpoint {
            inner: Arc::new(EndpointInner {
                user_agent: self.user_agent,
                option: self.option,
                timers: Timer::new(),
                transport_layer,
                transactions: RwLock::new(HashMap::new()),
                incoming_sender: Mutex::new(None),
            }),
            cancel_token,
        }
    }
}

impl Default for EndpointBuilder {
    fn default() -> Self {
        Self::new()
    }
}
