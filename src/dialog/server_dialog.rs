use super::dialog::{DialogInner, DialogState, TerminatedReason};
use super::DialogId;
use crate::message::{Header, Method, Request, SipMessage, StatusCode};
use crate::transaction::transaction::{Transaction, TransactionEvent};
use crate::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info};

/// UAS side of an INVITE dialog.
///
/// The dialog layer creates one per incoming INVITE and assigns the local
/// To-tag. One task drives [`ServerInviteDialog::serve_invite`] over the
/// INVITE server transaction while the application answers through
/// [`ServerInviteDialog::ringing`], [`ServerInviteDialog::accept`] or
/// [`ServerInviteDialog::reject`]; those post `Respond` events onto the
/// transaction, so no lock is held across a send.
///
/// After the 2xx the transaction is gone (RFC 3261 section 13.3.1.4) and
/// the dialog itself answers INVITE retransmissions with the stored 2xx
/// until the ACK arrives.
#[derive(Clone)]
pub struct ServerInviteDialog {
    pub inner: Arc<DialogInner>,
}

impl ServerInviteDialog {
    pub fn id(&self) -> DialogId {
        self.inner.id()
    }

    /// Drive the INVITE server transaction until it terminates.
    ///
    /// Handles the CANCEL handed over by the endpoint (answers the INVITE
    /// with 487 and terminates the dialog); retransmissions and the ACK
    /// for a failure are absorbed inside the transaction.
    pub async fn serve_invite(&self, mut tx: Transaction) -> Result<()> {
        *self.inner.invite_tx_sender.lock().unwrap() = Some(tx.tu_sender.clone());
        self.inner.transition(DialogState::Trying(self.id()))?;

        while let Some(msg) = tx.receive().await {
            match msg {
                SipMessage::Request(req) if req.method == Method::Cancel => {
                    info!("INVITE cancelled by peer: {}", self.id());
                    let original = tx.original.clone();
                    let resp = self.inner.make_response(
                        &original,
                        StatusCode::RequestTerminated,
                        None,
                    );
                    tx.respond(resp).await.ok();
                    self.inner.transition(DialogState::Terminated(
                        self.id(),
                        TerminatedReason::UacCancel,
                    ))?;
                }
                _ => {}
            }
        }
        *self.inner.invite_tx_sender.lock().unwrap() = None;
        if let Some(e) = tx.timeout_error() {
            // No ACK before Timer H.
            self.inner.transition(DialogState::Terminated(
                self.id(),
                TerminatedReason::Timeout,
            ))?;
            return Err(e);
        }
        Ok(())
    }

    fn post_response(&self, status_code: StatusCode, headers: Vec<Header>, body: Option<Vec<u8>>) -> Result<()> {
        let mut response =
            self.inner
                .make_response(&self.inner.initial_request, status_code, body);
        for header in headers {
            response.headers.unique_push(&header.name, header.value);
        }
        let guard = self.inner.invite_tx_sender.lock().unwrap();
        let sender = guard.as_ref().ok_or_else(|| {
            Error::DialogError("INVITE transaction is not being served".to_string(), self.id())
        })?;
        sender
            .send(TransactionEvent::Respond(response))
            .map_err(|_| {
                Error::DialogError("INVITE transaction is gone".to_string(), self.id())
            })
    }

    /// Send a provisional 180 Ringing.
    pub fn ringing(&self) -> Result<()> {
        self.post_response(StatusCode::Ringing, vec![], None)
    }

    /// Answer the call with a 2xx carrying `answer` (usually SDP). The
    /// dialog confirms, and the 2xx is remembered so INVITE
    /// retransmissions can be answered until the ACK lands.
    pub fn accept(&self, headers: Vec<Header>, answer: Option<Vec<u8>>) -> Result<()> {
        let mut response = self.inner.make_response(
            &self.inner.initial_request,
            StatusCode::OK,
            answer,
        );
        if !response.body.is_empty() {
            response
                .headers
                .unique_push("Content-Type", "application/sdp");
        }
        for header in headers {
            response.headers.unique_push(&header.name, header.value);
        }
        *self.inner.pending_2xx.write().unwrap() = Some(response.clone());
        {
            let guard = self.inner.invite_tx_sender.lock().unwrap();
            let sender = guard.as_ref().ok_or_else(|| {
                Error::DialogError(
                    "INVITE transaction is not being served".to_string(),
                    self.id(),
                )
            })?;
            sender
                .send(TransactionEvent::Respond(response))
                .map_err(|_| {
                    Error::DialogError("INVITE transaction is gone".to_string(), self.id())
                })?;
        }
        self.inner.transition(DialogState::Confirmed(self.id()))?;
        info!("server dialog confirmed: {}", self.id());
        Ok(())
    }

    /// Decline the call with a final failure response.
    pub fn reject(&self, status_code: StatusCode) -> Result<()> {
        self.post_response(status_code, vec![], None)?;
        let reason = match status_code {
            StatusCode::BusyHere | StatusCode::BusyEverywhere => TerminatedReason::UasBusy,
            _ => TerminatedReason::UasDecline,
        };
        self.inner
            .transition(DialogState::Terminated(self.id(), reason))
    }

    /// Hang up a confirmed dialog from the UAS side.
    pub async fn bye(&self) -> Result<()> {
        if !self.inner.is_confirmed() {
            debug!("bye on unconfirmed dialog {} ignored", self.id());
            return Ok(());
        }
        let bye = self.inner.make_request(Method::Bye, None, None)?;
        let result = self.inner.do_request(bye).await;
        self.inner.transition(DialogState::Terminated(
            self.id(),
            TerminatedReason::UasBye,
        ))?;
        result.map(|_| ())
    }

    /// End the dialog: decline the pending INVITE, BYE once confirmed,
    /// no-op when already terminated.
    pub async fn terminate(&self) -> Result<()> {
        if self.inner.is_terminated() {
            Ok(())
        } else if self.inner.is_confirmed() {
            self.bye().await
        } else {
            self.reject(StatusCode::Decline)
        }
    }

    pub(crate) async fn handle_incoming(&self, mut tx: Transaction) -> Result<()> {
        let request = tx.original.clone();
        let cseq = request.headers.cseq()?;
        match request.method {
            Method::Ack => {
                // ACK for our 2xx; the dialog is already confirmed, so a
                // repeat is simply absorbed.
                if !self.inner.is_matching_ack_seq(cseq.seq) {
                    debug!("ACK with unexpected CSeq {} on {}", cseq.seq, self.id());
                }
                Ok(())
            }
            Method::Invite if self.inner.is_matching_ack_seq(cseq.seq) => {
                // Retransmitted INVITE after our 2xx: replay it.
                let pending = self.inner.pending_2xx.read().unwrap().clone();
                if let Some(resp) = pending {
                    tx.respond(resp).await?;
                }
                Ok(())
            }
            Method::Invite | Method::Update => {
                if self.check_remote_seq(&mut tx, cseq.seq).await? {
                    self.inner.update_remote_target(&request);
                    self.inner
                        .transition(DialogState::Updated(self.id(), request.clone()))?;
                    let body = (request.method == Method::Invite)
                        .then(|| {
                            self.inner
                                .pending_2xx
                                .read()
                                .unwrap()
                                .as_ref()
                                .map(|r| r.body.clone())
                                .unwrap_or_default()
                        })
                        .filter(|b| !b.is_empty());
                    let mut resp = self.inner.make_response(&request, StatusCode::OK, body);
                    if !resp.body.is_empty() {
                        resp.headers.unique_push("Content-Type", "application/sdp");
                    }
                    tx.respond(resp).await?;
                }
                Ok(())
            }
            Method::Bye => {
                if self.check_remote_seq(&mut tx, cseq.seq).await? {
                    let resp = self.inner.make_response(&request, StatusCode::OK, None);
                    tx.respond(resp).await?;
                    self.inner.transition(DialogState::Terminated(
                        self.id(),
                        TerminatedReason::UacBye,
                    ))?;
                }
                Ok(())
            }
            Method::Cancel => Ok(()),
            _ => {
                if self.check_remote_seq(&mut tx, cseq.seq).await? {
                    let resp = self.inner.make_response(&request, StatusCode::OK, None);
                    tx.respond(resp).await?;
                }
                Ok(())
            }
        }
    }

    async fn check_remote_seq(&self, tx: &mut Transaction, seq: u32) -> Result<bool> {
        match self.inner.update_remote_seq(seq) {
            Ok(()) => Ok(true),
            Err(e) => {
                debug!("rejecting in-dialog request: {}", e);
                let original = tx.original.clone();
                let resp =
                    self.inner
                        .make_response(&original, StatusCode::ServerInternalError, None);
                tx.respond(resp).await?;
                Ok(false)
            }
        }
    }

    /// The offer carried by the INVITE that created this dialog.
    pub fn initial_offer(&self) -> Option<&[u8]> {
        let body = &self.inner.initial_request.body;
        (!body.is_empty()).then_some(body.as_slice())
    }

    pub fn initial_request(&self) -> &Request {
        &self.inner.initial_request
    }
}
