use super::endpoint::EndpointInnerRef;
use super::key::TransactionKey;
use super::message::make_ack_for_failure;
use super::{make_tag, TransactionState, TransactionTimer, TransactionType};
use crate::message::{
    Header, Method, Request, Response, SipMessage, StatusCode, StatusKind,
};
use crate::transport::{SipAddr, SipConnection};
use crate::{Error, Result};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info};

pub type TransactionEventReceiver = UnboundedReceiver<TransactionEvent>;
pub type TransactionEventSender = UnboundedSender<TransactionEvent>;

/// Events driving a transaction's state machine.
///
/// * `Received` - a message matched to this transaction arrived
/// * `Timer` - one of the RFC 3261 timers fired
/// * `Respond` - another task asks the server transaction to send a response
/// * `Terminate` - the endpoint is tearing the transaction down
pub enum TransactionEvent {
    Received(SipMessage, Option<SipConnection>),
    Timer(TransactionTimer),
    Respond(Response),
    Terminate,
}

/// One SIP transaction: a request and the responses it produces, bounded
/// by the RFC 3261 section 17 state machines.
///
/// The four machines share this struct; `transaction_type` selects which
/// transitions, timers and retransmission rules apply:
///
/// * `ClientInvite` - Calling, Proceeding, Completed, Terminated with
///   timers A (retransmit), B (timeout) and D (absorb late finals). The
///   ACK for a non-2xx final is generated here, before Completed is
///   entered; the ACK for a 2xx belongs to the transaction user.
/// * `ClientNonInvite` - Trying, Proceeding, Completed, Terminated with
///   timers E, F and K.
/// * `ServerInvite` - Proceeding, Completed, Confirmed, Terminated with
///   timers G, H and I, plus the 200 ms guard that emits 100 Trying when
///   the TU is slow. A 2xx terminates the transaction immediately and
///   retransmission duty moves to the TU.
/// * `ServerNonInvite` - Trying, Proceeding, Completed, Terminated with
///   timer J.
///
/// The owner drives the machine by awaiting [`Transaction::receive`];
/// inbound messages and timer events arrive over the event channel the
/// endpoint holds the sending end of. Messages the TU should see are
/// returned from `receive`; retransmissions and absorbed duplicates are
/// handled internally.
pub struct Transaction {
    pub transaction_type: TransactionType,
    pub key: TransactionKey,
    pub original: Request,
    pub destination: Option<SipAddr>,
    pub state: TransactionState,
    pub endpoint_inner: EndpointInnerRef,
    pub connection: Option<SipConnection>,
    pub last_response: Option<Response>,
    pub last_ack: Option<Request>,
    pub tu_receiver: TransactionEventReceiver,
    pub tu_sender: TransactionEventSender,
    timed_out: bool,
    retransmit_timer: Option<u64>,
    timeout_timer: Option<u64>,
    wait_timer: Option<u64>,
    provision_timer: Option<u64>,
    is_cleaned_up: bool,
}

impl Transaction {
    fn new(
        transaction_type: TransactionType,
        key: TransactionKey,
        original: Request,
        connection: Option<SipConnection>,
        endpoint_inner: EndpointInnerRef,
    ) -> Self {
        let (tu_sender, tu_receiver) = unbounded_channel();
        let state = match transaction_type {
            TransactionType::ClientInvite | TransactionType::ClientNonInvite => {
                TransactionState::Calling
            }
            TransactionType::ServerInvite => TransactionState::Proceeding,
            TransactionType::ServerNonInvite => TransactionState::Trying,
        };
        info!("transaction created {:?} {}", transaction_type, key);
        let mut tx = Self {
            transaction_type,
            endpoint_inner,
            connection,
            key,
            original,
            destination: None,
            state,
            last_response: None,
            last_ack: None,
            timed_out: false,
            retransmit_timer: None,
            timeout_timer: None,
            wait_timer: None,
            provision_timer: None,
            tu_receiver,
            tu_sender,
            is_cleaned_up: false,
        };
        tx.endpoint_inner
            .attach_transaction(&tx.key, tx.tu_sender.clone());
        if transaction_type == TransactionType::ServerInvite && tx.original.method == Method::Invite
        {
            // Emit 100 Trying if the TU stays quiet past 200 ms.
            tx.provision_timer = Some(tx.endpoint_inner.timers.timeout(
                Duration::from_millis(200),
                TransactionTimer::TimerProvision(tx.key.clone()),
            ));
        }
        tx
    }

    pub fn new_client(
        key: TransactionKey,
        original: Request,
        endpoint_inner: EndpointInnerRef,
        connection: Option<SipConnection>,
    ) -> Self {
        let tx_type = match original.method {
            Method::Invite => TransactionType::ClientInvite,
            _ => TransactionType::ClientNonInvite,
        };
        Transaction::new(tx_type, key, original, connection, endpoint_inner)
    }

    pub fn new_server(
        key: TransactionKey,
        original: Request,
        endpoint_inner: EndpointInnerRef,
        connection: Option<SipConnection>,
    ) -> Self {
        let tx_type = match original.method {
            Method::Invite | Method::Ack => TransactionType::ServerInvite,
            _ => TransactionType::ServerNonInvite,
        };
        Transaction::new(tx_type, key, original, connection, endpoint_inner)
    }

    fn is_client(&self) -> bool {
        matches!(
            self.transaction_type,
            TransactionType::ClientInvite | TransactionType::ClientNonInvite
        )
    }

    fn is_reliable(&self) -> bool {
        self.connection.as_ref().map(|c| c.is_reliable()).unwrap_or(true)
    }

    fn require_connection(&self) -> Result<&SipConnection> {
        self.connection.as_ref().ok_or_else(|| {
            Error::TransactionError("no connection found".to_string(), self.key.clone())
        })
    }

    /// Send the client request and arm the initial timers.
    pub async fn send(&mut self) -> Result<()> {
        if !self.is_client() {
            return Err(Error::TransactionError(
                "send is only valid for client transactions".to_string(),
                self.key.clone(),
            ));
        }
        if self.connection.is_none() {
            let (connection, resolved) = self
                .endpoint_inner
                .transport_layer
                .lookup(&self.original.uri)
                .await?;
            self.destination = Some(resolved);
            self.connection = Some(connection);
        }
        let connection = self.require_connection()?.clone();
        connection
            .send(self.original.clone().into(), self.destination.as_ref())
            .await?;

        let unreliable = !self.is_reliable();
        let t1 = self.endpoint_inner.option.t1;
        match self.transaction_type {
            TransactionType::ClientInvite => {
                if unreliable {
                    self.arm_retransmit(TransactionTimer::TimerA(self.key.clone(), t1), t1);
                }
                self.arm_timeout(TransactionTimer::TimerB(self.key.clone()));
            }
            _ => {
                if unreliable {
                    self.arm_retransmit(TransactionTimer::TimerE(self.key.clone(), t1), t1);
                }
                self.arm_timeout(TransactionTimer::TimerF(self.key.clone()));
                self.transition(TransactionState::Trying)?;
            }
        }
        Ok(())
    }

    /// Build and send a response for a server transaction, adding a To-tag
    /// on finals when the request had none.
    pub async fn reply_with(
        &mut self,
        status_code: StatusCode,
        headers: Vec<Header>,
        body: Option<Vec<u8>>,
    ) -> Result<()> {
        if status_code.is_final() {
            let to = self.original.headers.to_header()?;
            if to.tag().is_none() {
                self.original
                    .headers
                    .unique_push("To", to.with_tag(&make_tag()).to_string());
            }
        }
        let mut resp = self
            .endpoint_inner
            .make_response(&self.original, status_code, body);
        for header in headers {
            resp.headers.unique_push(&header.name, header.value);
        }
        self.respond(resp).await
    }

    /// Quick reply with status code only.
    pub async fn reply(&mut self, status_code: StatusCode) -> Result<()> {
        self.reply_with(status_code, vec![], None).await
    }

    /// Send a response on a server transaction and advance the machine.
    pub async fn respond(&mut self, response: Response) -> Result<()> {
        if self.is_client() {
            return Err(Error::TransactionError(
                "respond is only valid for server transactions".to_string(),
                self.key.clone(),
            ));
        }
        let new_state = match response.status_code.kind() {
            StatusKind::Provisional => TransactionState::Proceeding,
            StatusKind::Successful if self.transaction_type == TransactionType::ServerInvite => {
                // 2xx retransmission becomes the TU's duty.
                TransactionState::Terminated
            }
            _ => TransactionState::Completed,
        };
        self.can_transition(&new_state)?;
        if let Some(id) = self.provision_timer.take() {
            self.endpoint_inner.timers.cancel(id);
        }
        let connection = self.require_connection()?.clone();
        debug!("responding {} for {}", response.status_code, self.key);
        connection
            .send(response.clone().into(), self.destination.as_ref())
            .await?;
        self.last_response = Some(response);
        if new_state == self.state {
            return Ok(());
        }
        self.transition(new_state)
    }

    /// Send the ACK for a 2xx final. The INVITE transaction is already
    /// terminated at that point; this is a TU-level send that reuses the
    /// transaction's connection and remembers the ACK for retransmits.
    pub async fn send_ack(&mut self, ack: Request) -> Result<()> {
        if self.transaction_type != TransactionType::ClientInvite {
            return Err(Error::TransactionError(
                "send_ack is only valid for client INVITE transactions".to_string(),
                self.key.clone(),
            ));
        }
        let connection = self.require_connection()?.clone();
        connection
            .send(ack.clone().into(), self.destination.as_ref())
            .await?;
        self.last_ack = Some(ack);
        Ok(())
    }

    /// Drive the machine and yield the next message the TU should see.
    ///
    /// Returns `None` when the transaction terminates; check
    /// [`Transaction::timeout_error`] afterwards to distinguish a timeout
    /// from normal completion.
    pub async fn receive(&mut self) -> Option<SipMessage> {
        while let Some(event) = self.tu_receiver.recv().await {
            match event {
                TransactionEvent::Received(msg, connection) => {
                    let deliver = match msg {
                        SipMessage::Request(req) => {
                            self.on_received_request(req, connection).await
                        }
                        SipMessage::Response(resp) => self.on_received_response(resp).await,
                    };
                    if let Some(msg) = deliver {
                        return Some(msg);
                    }
                }
                TransactionEvent::Timer(t) => {
                    self.on_timer(t).await.ok();
                    if self.timed_out {
                        return None;
                    }
                }
                TransactionEvent::Respond(response) => {
                    self.respond(response).await.ok();
                }
                TransactionEvent::Terminate => {
                    debug!("received terminate event for {}", self.key);
                    return None;
                }
            }
        }
        None
    }

    /// The timeout that ended this transaction, if any.
    pub fn timeout_error(&self) -> Option<Error> {
        self.timed_out
            .then(|| Error::TransactionTimeout(self.key.clone()))
    }

    pub fn is_terminated(&self) -> bool {
        self.state == TransactionState::Terminated
    }
}

impl Transaction {
    async fn on_received_request(
        &mut self,
        req: Request,
        connection: Option<SipConnection>,
    ) -> Option<SipMessage> {
        if self.is_client() {
            return None;
        }
        if self.connection.is_none() && connection.is_some() {
            self.connection = connection;
        }

        if req.method == Method::Cancel {
            // The CANCEL runs as its own server transaction which answers
            // it with 200; here it only tells the TU to finish the INVITE
            // with 487.
            return match self.state {
                TransactionState::Trying | TransactionState::Proceeding => Some(req.into()),
                _ => None,
            };
        }

        match self.state {
            TransactionState::Trying | TransactionState::Proceeding => {
                if req.method == self.original.method {
                    // Request retransmission: replay the last provisional.
                    if let Some(last) = self.last_response.clone() {
                        self.resend(last.into()).await.ok();
                    }
                }
                None
            }
            TransactionState::Completed => {
                if req.method == Method::Ack {
                    self.transition(TransactionState::Confirmed).ok();
                } else if req.method == self.original.method {
                    if let Some(last) = self.last_response.clone() {
                        self.resend(last.into()).await.ok();
                    }
                }
                None
            }
            // Absorb ACK retransmits.
            TransactionState::Confirmed => None,
            _ => None,
        }
    }

    async fn on_received_response(&mut self, resp: Response) -> Option<SipMessage> {
        if !self.is_client() {
            return None;
        }

        match resp.status_code.kind() {
            StatusKind::Provisional => match self.state {
                TransactionState::Calling | TransactionState::Trying => {
                    if self.transaction_type == TransactionType::ClientInvite {
                        // Stop INVITE retransmission on the first 1xx.
                        if let Some(id) = self.retransmit_timer.take() {
                            self.endpoint_inner.timers.cancel(id);
                        }
                    }
                    self.last_response = Some(resp.clone());
                    self.transition(TransactionState::Proceeding).ok()?;
                    Some(resp.into())
                }
                // Each 1xx goes up; the machine no longer moves.
                TransactionState::Proceeding => Some(resp.into()),
                _ => None,
            },
            StatusKind::Successful if self.transaction_type == TransactionType::ClientInvite => {
                match self.state {
                    TransactionState::Calling | TransactionState::Proceeding => {
                        self.last_response = Some(resp.clone());
                        // No Terminate event here: a retransmitted 2xx may
                        // still be queued and must reach the TU too.
                        self.terminate_quietly();
                        Some(resp.into())
                    }
                    // A retransmitted 2xx still reaches the TU, which
                    // answers it with another ACK (RFC 3261 13.2.2.4).
                    TransactionState::Terminated => Some(resp.into()),
                    _ => None,
                }
            }
            _ => match self.transaction_type {
                TransactionType::ClientInvite => match self.state {
                    TransactionState::Calling | TransactionState::Proceeding => {
                        // ACK the failure before entering Completed.
                        match make_ack_for_failure(&self.original, &resp) {
                            Ok(ack) => {
                                if let Ok(connection) = self.require_connection() {
                                    connection
                                        .send(ack.clone().into(), self.destination.as_ref())
                                        .await
                                        .ok();
                                }
                                self.last_ack = Some(ack);
                            }
                            Err(e) => debug!("could not build ACK: {}", e),
                        }
                        self.last_response = Some(resp.clone());
                        self.transition(TransactionState::Completed).ok();
                        Some(resp.into())
                    }
                    TransactionState::Completed => {
                        // Response retransmission: answer with the ACK again.
                        if let Some(ack) = self.last_ack.clone() {
                            self.resend(ack.into()).await.ok();
                        }
                        None
                    }
                    _ => None,
                },
                _ => match self.state {
                    TransactionState::Calling
                    | TransactionState::Trying
                    | TransactionState::Proceeding => {
                        self.last_response = Some(resp.clone());
                        self.transition(TransactionState::Completed).ok();
                        Some(resp.into())
                    }
                    _ => None,
                },
            },
        }
    }

    async fn on_timer(&mut self, timer: TransactionTimer) -> Result<()> {
        match timer {
            TransactionTimer::TimerA(key, interval) => {
                if self.state == TransactionState::Calling {
                    self.resend(self.original.clone().into()).await?;
                    // Doubling, capped at T2.
                    let next = (interval * 2).min(self.endpoint_inner.option.t2);
                    self.arm_retransmit(TransactionTimer::TimerA(key, next), next);
                }
            }
            TransactionTimer::TimerE(key, interval) => match self.state {
                TransactionState::Trying => {
                    self.resend(self.original.clone().into()).await?;
                    let next = (interval * 2).min(self.endpoint_inner.option.t2);
                    self.arm_retransmit(TransactionTimer::TimerE(key, next), next);
                }
                TransactionState::Proceeding => {
                    // Fixed T2 cadence once a provisional arrived.
                    let t2 = self.endpoint_inner.option.t2;
                    self.resend(self.original.clone().into()).await?;
                    self.arm_retransmit(TransactionTimer::TimerE(key, t2), t2);
                }
                _ => {}
            },
            TransactionTimer::TimerB(_) | TransactionTimer::TimerF(_) => {
                if !matches!(
                    self.state,
                    TransactionState::Completed | TransactionState::Terminated
                ) {
                    info!("transaction timeout {}", self.key);
                    self.timed_out = true;
                    self.transition(TransactionState::Terminated)?;
                }
            }
            TransactionTimer::TimerG(key, interval) => {
                if self.state == TransactionState::Completed {
                    if let Some(last) = self.last_response.clone() {
                        self.resend(last.into()).await?;
                    }
                    let next = (interval * 2).min(self.endpoint_inner.option.t2);
                    self.arm_retransmit(TransactionTimer::TimerG(key, next), next);
                }
            }
            TransactionTimer::TimerH(_) => {
                if self.state == TransactionState::Completed {
                    info!("no ACK before timer H for {}", self.key);
                    self.timed_out = true;
                    self.transition(TransactionState::Terminated)?;
                }
            }
            TransactionTimer::TimerD(_)
            | TransactionTimer::TimerI(_)
            | TransactionTimer::TimerJ(_)
            | TransactionTimer::TimerK(_) => {
                self.transition(TransactionState::Terminated)?;
            }
            TransactionTimer::TimerProvision(_) => {
                if self.transaction_type == TransactionType::ServerInvite
                    && self.state == TransactionState::Proceeding
                    && self.last_response.is_none()
                {
                    let trying =
                        self.endpoint_inner
                            .make_response(&self.original, StatusCode::Trying, None);
                    self.respond(trying).await?;
                }
            }
        }
        Ok(())
    }

    async fn resend(&self, msg: SipMessage) -> Result<()> {
        let connection = self.require_connection()?;
        connection.send(msg, self.destination.as_ref()).await
    }

    fn arm_retransmit(&mut self, timer: TransactionTimer, after: Duration) {
        if let Some(id) = self.retransmit_timer.take() {
            self.endpoint_inner.timers.cancel(id);
        }
        self.retransmit_timer = Some(self.endpoint_inner.timers.timeout(after, timer));
    }

    fn arm_timeout(&mut self, timer: TransactionTimer) {
        if let Some(id) = self.timeout_timer.take() {
            self.endpoint_inner.timers.cancel(id);
        }
        self.timeout_timer = Some(
            self.endpoint_inner
                .timers
                .timeout(self.endpoint_inner.option.t1x64, timer),
        );
    }

    fn arm_wait(&mut self, timer: TransactionTimer, after: Duration) {
        if let Some(id) = self.wait_timer.take() {
            self.endpoint_inner.timers.cancel(id);
        }
        self.wait_timer = Some(self.endpoint_inner.timers.timeout(after, timer));
    }

    fn can_transition(&self, target: &TransactionState) -> Result<()> {
        use TransactionState::*;
        match (&self.state, target) {
            (Calling, Trying)
            | (Calling, Proceeding)
            | (Calling, Completed)
            | (Calling, Terminated)
            | (Trying, Proceeding)
            | (Trying, Completed)
            | (Trying, Terminated)
            | (Proceeding, Completed)
            | (Proceeding, Terminated)
            | (Completed, Confirmed)
            | (Completed, Terminated)
            | (Confirmed, Terminated) => Ok(()),
            (current, target) if current == target => Ok(()),
            _ => Err(Error::TransactionError(
                format!(
                    "invalid state transition from {:?} to {:?}",
                    self.state, target
                ),
                self.key.clone(),
            )),
        }
    }

    fn transition(&mut self, state: TransactionState) -> Result<()> {
        if self.state == state {
            return Ok(());
        }
        self.can_transition(&state)?;
        let unreliable = !self.is_reliable();
        let option = self.endpoint_inner.option.clone();
        match state {
            TransactionState::Calling | TransactionState::Trying | TransactionState::Proceeding => {
            }
            TransactionState::Completed => {
                if let Some(id) = self.retransmit_timer.take() {
                    self.endpoint_inner.timers.cancel(id);
                }
                if let Some(id) = self.timeout_timer.take() {
                    self.endpoint_inner.timers.cancel(id);
                }
                match self.transaction_type {
                    TransactionType::ClientInvite => {
                        // Absorb retransmitted finals; unreliable only.
                        let wait = if unreliable { option.t1x64 } else { Duration::ZERO };
                        self.arm_wait(TransactionTimer::TimerD(self.key.clone()), wait);
                    }
                    TransactionType::ClientNonInvite => {
                        let wait = if unreliable { option.t4 } else { Duration::ZERO };
                        self.arm_wait(TransactionTimer::TimerK(self.key.clone()), wait);
                    }
                    TransactionType::ServerInvite => {
                        if unreliable {
                            self.arm_retransmit(
                                TransactionTimer::TimerG(self.key.clone(), option.t1),
                                option.t1,
                            );
                        }
                        self.arm_timeout(TransactionTimer::TimerH(self.key.clone()));
                    }
                    TransactionType::ServerNonInvite => {
                        let wait = if unreliable { option.t1x64 } else { Duration::ZERO };
                        self.arm_wait(TransactionTimer::TimerJ(self.key.clone()), wait);
                    }
                }
            }
            TransactionState::Confirmed => {
                if let Some(id) = self.retransmit_timer.take() {
                    self.endpoint_inner.timers.cancel(id);
                }
                if let Some(id) = self.timeout_timer.take() {
                    self.endpoint_inner.timers.cancel(id);
                }
                let wait = if unreliable { option.t4 } else { Duration::ZERO };
                self.arm_wait(TransactionTimer::TimerI(self.key.clone()), wait);
            }
            TransactionState::Terminated => {
                self.cleanup();
                self.tu_sender.send(TransactionEvent::Terminate).ok();
            }
        }
        debug!("transition {}: {:?} -> {:?}", self.key, self.state, state);
        self.state = state;
        Ok(())
    }

    /// Enter Terminated without notifying the event channel.
    fn terminate_quietly(&mut self) {
        self.cleanup();
        debug!("transition {}: {:?} -> Terminated", self.key, self.state);
        self.state = TransactionState::Terminated;
    }

    fn cleanup(&mut self) {
        if self.is_cleaned_up {
            return;
        }
        self.is_cleaned_up = true;
        for id in [
            self.retransmit_timer.take(),
            self.timeout_timer.take(),
            self.wait_timer.take(),
            self.provision_timer.take(),
        ]
        .into_iter()
        .flatten()
        {
            self.endpoint_inner.timers.cancel(id);
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.cleanup();
        self.endpoint_inner.detach_transaction(&self.key);
        debug!("transaction dropped: {}", self.key);
    }
}
