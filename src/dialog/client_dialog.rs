use super::authenticate::handle_client_authenticate;
use super::dialog::{DialogInner, DialogState, TerminatedReason};
use super::DialogId;
use crate::message::{Method, Response, SipMessage, StatusCode, StatusKind};
use crate::transaction::key::{TransactionKey, TransactionRole};
use crate::transaction::message::make_cancel;
use crate::transaction::transaction::Transaction;
use crate::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info};

/// UAC side of an INVITE dialog.
///
/// Created by the dialog layer when an INVITE is sent; the caller drives
/// [`ClientInviteDialog::process_invite`] to completion and then owns a
/// confirmed dialog it can `bye`, `reinvite` or `update`.
#[derive(Clone)]
pub struct ClientInviteDialog {
    pub inner: Arc<DialogInner>,
}

impl ClientInviteDialog {
    pub fn id(&self) -> DialogId {
        self.inner.id()
    }

    /// Drive the INVITE client transaction.
    ///
    /// Provisional responses with a To-tag move the dialog to Early; a
    /// 2xx confirms it, establishes the route set from the reversed
    /// Record-Route chain, retargets to the 2xx Contact and sends the
    /// ACK. One digest challenge is answered when credentials are
    /// configured. Returns the final dialog id and the final response.
    pub async fn process_invite(
        &self,
        mut tx: Transaction,
    ) -> Result<(DialogId, Option<Response>)> {
        tx.send().await?;
        self.inner.transition(DialogState::Trying(self.id()))?;
        let mut auth_sent = false;

        while let Some(msg) = tx.receive().await {
            let SipMessage::Response(resp) = msg else {
                continue;
            };
            match resp.status_code.kind() {
                StatusKind::Provisional => {
                    if resp.status_code == StatusCode::Trying {
                        continue;
                    }
                    if let Some(tag) = resp.headers.to_header()?.tag() {
                        self.inner.update_remote_tag(tag);
                    }
                    self.inner
                        .transition(DialogState::Early(self.id(), resp.clone()))?;
                }
                StatusKind::Successful => {
                    if let Some(tag) = resp.headers.to_header()?.tag() {
                        self.inner.update_remote_tag(tag);
                    }
                    self.inner.establish_uac(&resp)?;
                    let invite_seq = self.inner.initial_request.headers.cseq()?.seq;
                    let ack = self.inner.make_request(Method::Ack, Some(invite_seq), None)?;
                    tx.send_ack(ack).await?;
                    self.inner.transition(DialogState::Confirmed(self.id()))?;
                    info!("client dialog confirmed: {}", self.id());
                    return Ok((self.id(), Some(resp)));
                }
                _ => {
                    if matches!(
                        resp.status_code,
                        StatusCode::Unauthorized | StatusCode::ProxyAuthenticationRequired
                    ) && !auth_sent
                    {
                        if let Some(credential) = self.inner.credential.clone() {
                            auth_sent = true;
                            let seq = self.inner.increment_local_seq();
                            tx = handle_client_authenticate(seq, tx, resp, &credential).await?;
                            tx.send().await?;
                            continue;
                        }
                    }
                    if let Some(tag) = resp.headers.to_header()?.tag() {
                        self.inner.update_remote_tag(tag);
                    }
                    let reason = match resp.status_code {
                        StatusCode::BusyHere | StatusCode::BusyEverywhere => {
                            TerminatedReason::UasBusy
                        }
                        StatusCode::Decline => TerminatedReason::UasDecline,
                        StatusCode::RequestTerminated => TerminatedReason::UacCancel,
                        code => TerminatedReason::Failure(code),
                    };
                    self.inner
                        .transition(DialogState::Terminated(self.id(), reason))?;
                    return Ok((self.id(), Some(resp)));
                }
            }
        }

        if let Some(e) = tx.timeout_error() {
            self.inner.transition(DialogState::Terminated(
                self.id(),
                TerminatedReason::Timeout,
            ))?;
            return Err(e);
        }
        Err(Error::DialogError(
            "INVITE transaction ended without a final response".to_string(),
            self.id(),
        ))
    }

    /// Cancel the pending INVITE. The CANCEL runs as its own non-INVITE
    /// client transaction sharing the INVITE's branch; the 487 then lands
    /// on the INVITE transaction and terminates the dialog there.
    pub async fn cancel(&self) -> Result<()> {
        let cancel = make_cancel(&self.inner.initial_request)?;
        let key = TransactionKey::from_request(&cancel, TransactionRole::Client)?;
        let mut tx =
            Transaction::new_client(key, cancel, self.inner.endpoint_inner.clone(), None);
        tx.send().await?;
        while let Some(msg) = tx.receive().await {
            if let SipMessage::Response(resp) = msg {
                if resp.status_code.is_final() {
                    debug!("CANCEL answered {} for {}", resp.status_code, self.id());
                    break;
                }
            }
        }
        Ok(())
    }

    /// Hang up a confirmed dialog. Resolves when the BYE transaction gets
    /// its final response or times out on Timer F.
    pub async fn bye(&self) -> Result<()> {
        if !self.inner.is_confirmed() {
            debug!("bye on unconfirmed dialog {} ignored", self.id());
            return Ok(());
        }
        let bye = self.inner.make_request(Method::Bye, None, None)?;
        let result = self.inner.do_request(bye).await;
        self.inner.transition(DialogState::Terminated(
            self.id(),
            TerminatedReason::UacBye,
        ))?;
        result.map(|_| ())
    }

    /// Send a re-INVITE with a new offer, completing its ACK on success.
    pub async fn reinvite(&self, offer: Vec<u8>) -> Result<Option<Response>> {
        if !self.inner.is_confirmed() {
            return Err(Error::DialogError(
                "re-INVITE requires a confirmed dialog".to_string(),
                self.id(),
            ));
        }
        let mut request = self.inner.make_request(Method::Invite, None, Some(offer))?;
        request
            .headers
            .unique_push("Content-Type", "application/sdp");
        let seq = request.headers.cseq()?.seq;
        let response = self.inner.do_request(request).await?;
        if let Some(resp) = &response {
            if resp.status_code.is_success() {
                let ack = self.inner.make_request(Method::Ack, Some(seq), None)?;
                let (connection, destination) = {
                    let target = &ack.uri;
                    self.inner.endpoint_inner.transport_layer.lookup(target).await?
                };
                connection
                    .send(ack.into(), Some(&destination))
                    .await?;
            }
        }
        Ok(response)
    }

    /// Session timer style UPDATE; target refresh without a new offer.
    pub async fn update(&self, body: Option<Vec<u8>>) -> Result<Option<Response>> {
        let request = self.inner.make_request(Method::Update, None, body)?;
        self.inner.do_request(request).await
    }

    /// End the dialog: CANCEL while the INVITE is pending, BYE once
    /// confirmed, no-op when already terminated.
    pub async fn terminate(&self) -> Result<()> {
        if self.inner.is_terminated() {
            Ok(())
        } else if self.inner.is_confirmed() {
            self.bye().await
        } else {
            self.cancel().await
        }
    }

    pub(crate) async fn handle_incoming(&self, mut tx: Transaction) -> Result<()> {
        let request = tx.original.clone();
        let cseq = request.headers.cseq()?;
        match request.method {
            Method::Ack => {
                // ACK retransmit for an answered re-INVITE; nothing to do.
                Ok(())
            }
            Method::Cancel => Ok(()),
            Method::Bye => {
                if self.check_remote_seq(&mut tx, cseq.seq).await? {
                    let resp = self.inner.make_response(&request, StatusCode::OK, None);
                    tx.respond(resp).await?;
                    self.inner.transition(DialogState::Terminated(
                        self.id(),
                        TerminatedReason::UasBye,
                    ))?;
                }
                Ok(())
            }
            Method::Invite | Method::Update => {
                if self.check_remote_seq(&mut tx, cseq.seq).await? {
                    self.inner.update_remote_target(&request);
                    self.inner
                        .transition(DialogState::Updated(self.id(), request.clone()))?;
                    // Answer with the description this side already offered.
                    let body = (request.method == Method::Invite)
                        .then(|| self.inner.initial_request.body.clone())
                        .filter(|b| !b.is_empty());
                    let mut resp = self.inner.make_response(&request, StatusCode::OK, body);
                    if !resp.body.is_empty() {
                        resp.headers.unique_push("Content-Type", "application/sdp");
                    }
                    tx.respond(resp).await?;
                }
                Ok(())
            }
            Method::Refer => {
                if self.check_remote_seq(&mut tx, cseq.seq).await? {
                    let resp = self
                        .inner
                        .make_response(&request, StatusCode::Accepted, None);
                    tx.respond(resp).await?;
                }
                Ok(())
            }
            Method::Options | Method::Info | Method::Message | Method::Notify => {
                if self.check_remote_seq(&mut tx, cseq.seq).await? {
                    let resp = self.inner.make_response(&request, StatusCode::OK, None);
                    tx.respond(resp).await?;
                }
                Ok(())
            }
            _ => {
                let resp = self
                    .inner
                    .make_response(&request, StatusCode::MethodNotAllowed, None);
                tx.respond(resp).await
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
}
