use super::authenticate::{handle_client_authenticate, Credential};
use super::client_dialog::ClientInviteDialog;
use super::server_dialog::ServerInviteDialog;
use super::DialogId;
use crate::message::{
    Method, NameAddr, Request, Response, SipMessage, StatusCode, StatusKind, Uri,
};
use crate::transaction::endpoint::EndpointInnerRef;
use crate::transaction::key::{TransactionKey, TransactionRole};
use crate::transaction::transaction::{Transaction, TransactionEventSender};
use crate::{Error, Result};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Instant;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, info};

pub type DialogStateSender = UnboundedSender<DialogState>;
pub type DialogStateReceiver = UnboundedReceiver<DialogState>;

/// Why a dialog ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminatedReason {
    UacCancel,
    UacBye,
    UasBye,
    UasBusy,
    UasDecline,
    Timeout,
    /// Any other non-2xx final on the creating INVITE.
    Failure(StatusCode),
}

/// Dialog lifecycle, published on the dialog's state channel in
/// transition order.
///
/// `Calling` and `Trying` precede the dialog proper; `Early` corresponds
/// to a 1xx with a To-tag, `Confirmed` to the 2xx exchange, and
/// `Updated` fires on an accepted target-refresh request.
#[derive(Clone)]
pub enum DialogState {
    Calling(DialogId),
    Trying(DialogId),
    Early(DialogId, Response),
    Confirmed(DialogId),
    Updated(DialogId, Request),
    Terminated(DialogId, TerminatedReason),
}

impl DialogState {
    pub fn id(&self) -> &DialogId {
        match self {
            DialogState::Calling(id)
            | DialogState::Trying(id)
            | DialogState::Early(id, _)
            | DialogState::Confirmed(id)
            | DialogState::Updated(id, _)
            | DialogState::Terminated(id, _) => id,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, DialogState::Confirmed(_))
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, DialogState::Terminated(_, _))
    }
}

impl std::fmt::Display for DialogState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DialogState::Calling(id) => write!(f, "Calling({})", id),
            DialogState::Trying(id) => write!(f, "Trying({})", id),
            DialogState::Early(id, resp) => write!(f, "Early({}, {})", id, resp.status_code),
            DialogState::Confirmed(id) => write!(f, "Confirmed({})", id),
            DialogState::Updated(id, req) => write!(f, "Updated({}, {})", id, req.method),
            DialogState::Terminated(id, reason) => {
                write!(f, "Terminated({}, {:?})", id, reason)
            }
        }
    }
}

/// Shared state of one dialog.
///
/// The identifier's To-tag is learned from the first tagged response on
/// the UAC side, so `id` sits behind a lock; everything else that can
/// change over the dialog lifetime (remote target, route set, sequence
/// numbers) has its own cell. The route set is written once when the
/// dialog is established and never after.
pub struct DialogInner {
    pub role: TransactionRole,
    pub id: RwLock<DialogId>,
    pub state: Mutex<DialogState>,

    pub local_seq: AtomicU32,
    pub remote_seq: AtomicU32,

    pub local_uri: NameAddr,
    pub remote_uri: NameAddr,
    pub local_contact: Option<Uri>,
    pub remote_target: RwLock<Option<Uri>>,
    pub route_set: RwLock<Vec<NameAddr>>,
    pub secure: bool,

    pub initial_request: Request,
    pub endpoint_inner: EndpointInnerRef,
    pub state_sender: DialogStateSender,
    pub credential: Option<Credential>,

    pub(crate) terminated_at: RwLock<Option<Instant>>,
    pub(crate) invite_tx_sender: Mutex<Option<TransactionEventSender>>,
    pub(crate) pending_2xx: RwLock<Option<Response>>,
}

impl DialogInner {
    pub fn new(
        role: TransactionRole,
        id: DialogId,
        initial_request: Request,
        endpoint_inner: EndpointInnerRef,
        state_sender: DialogStateSender,
        credential: Option<Credential>,
        local_contact: Option<Uri>,
    ) -> Result<Self> {
        let from = initial_request.headers.from_header()?;
        let to = initial_request.headers.to_header()?;
        let cseq = initial_request.headers.cseq()?;
        let (mut local_uri, mut remote_uri) = match role {
            TransactionRole::Client => (from, to),
            TransactionRole::Server => (to, from),
        };
        // Tags travel in the id, not in the stored address headers.
        local_uri.params.retain(|(n, _)| !n.eq_ignore_ascii_case("tag"));
        remote_uri.params.retain(|(n, _)| !n.eq_ignore_ascii_case("tag"));

        let (local_seq, remote_seq) = match role {
            TransactionRole::Client => (cseq.seq, 0),
            TransactionRole::Server => (0, cseq.seq),
        };
        let remote_target = match role {
            // The UAS learns the peer target from the INVITE's Contact.
            TransactionRole::Server => initial_request
                .headers
                .contact()
                .ok()
                .map(|c| c.uri),
            TransactionRole::Client => None,
        };
        let route_set = match role {
            // The UAS route set is the Record-Route list as received.
            TransactionRole::Server => initial_request.headers.record_routes()?,
            TransactionRole::Client => Vec::new(),
        };

        Ok(DialogInner {
            role,
            state: Mutex::new(DialogState::Calling(id.clone())),
            id: RwLock::new(id),
            local_seq: AtomicU32::new(local_seq),
            remote_seq: AtomicU32::new(remote_seq),
            local_uri,
            remote_uri,
            local_contact,
            remote_target: RwLock::new(remote_target),
            route_set: RwLock::new(route_set),
            secure: initial_request.uri.is_secure(),
            initial_request,
            endpoint_inner,
            state_sender,
            credential,
            terminated_at: RwLock::new(None),
            invite_tx_sender: Mutex::new(None),
            pending_2xx: RwLock::new(None),
        })
    }

    pub fn id(&self) -> DialogId {
        self.id.read().unwrap().clone()
    }

    pub fn update_remote_tag(&self, tag: &str) {
        let mut id = self.id.write().unwrap();
        match self.role {
            TransactionRole::Client => id.to_tag = tag.to_string(),
            TransactionRole::Server => id.from_tag = tag.to_string(),
        }
    }

    fn local_tag(&self) -> String {
        let id = self.id.read().unwrap();
        match self.role {
            TransactionRole::Client => id.from_tag.clone(),
            TransactionRole::Server => id.to_tag.clone(),
        }
    }

    fn remote_tag(&self) -> String {
        let id = self.id.read().unwrap();
        match self.role {
            TransactionRole::Client => id.to_tag.clone(),
            TransactionRole::Server => id.from_tag.clone(),
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.state.lock().unwrap().is_confirmed()
    }

    pub fn is_terminated(&self) -> bool {
        self.state.lock().unwrap().is_terminated()
    }

    pub fn get_local_seq(&self) -> u32 {
        self.local_seq.load(Ordering::Relaxed)
    }

    pub fn increment_local_seq(&self) -> u32 {
        self.local_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Enforce the in-dialog sequence discipline: each request's CSeq must
    /// be strictly greater than anything seen before. The caller answers a
    /// violation with 500 (RFC 3261 section 12.2.2).
    pub fn update_remote_seq(&self, seq: u32) -> Result<()> {
        let mut current = self.remote_seq.load(Ordering::Relaxed);
        loop {
            if current != 0 && seq <= current {
                return Err(Error::DialogError(
                    format!("out of order CSeq {} (highest {})", seq, current),
                    self.id(),
                ));
            }
            match self.remote_seq.compare_exchange(
                current,
                seq,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }

    /// ACK is the one request whose CSeq repeats: it must equal the
    /// INVITE's.
    pub fn is_matching_ack_seq(&self, seq: u32) -> bool {
        seq == self.remote_seq.load(Ordering::Relaxed)
    }

    pub fn transition(&self, state: DialogState) -> Result<()> {
        {
            let mut guard = self.state.lock().unwrap();
            if guard.is_terminated() {
                // A terminated dialog stays terminated.
                return Ok(());
            }
            debug!("dialog transition {}: {}", self.id(), state);
            if state.is_terminated() {
                *self.terminated_at.write().unwrap() = Some(Instant::now());
            }
            *guard = state.clone();
        }
        self.state_sender.send(state).ok();
        Ok(())
    }

    /// Record route set and remote target from the 2xx establishing a UAC
    /// dialog: Record-Route reversed, target from Contact.
    pub(crate) fn establish_uac(&self, response: &Response) -> Result<()> {
        let mut routes = response.headers.record_routes()?;
        routes.reverse();
        *self.route_set.write().unwrap() = routes;
        if let Ok(contact) = response.headers.contact() {
            *self.remote_target.write().unwrap() = Some(contact.uri);
        }
        Ok(())
    }

    pub(crate) fn update_remote_target(&self, request: &Request) {
        if !request.method.is_target_refresh() {
            return;
        }
        if let Ok(contact) = request.headers.contact() {
            debug!("dialog {} remote target refreshed: {}", self.id(), contact.uri);
            *self.remote_target.write().unwrap() = Some(contact.uri);
        }
    }

    /// Build an in-dialog request: Request-URI from the remote target,
    /// Route headers mirroring the stored route set, the dialog's Call-ID
    /// and tags, and a fresh Via branch. `seq` is taken from the local
    /// counter unless pinned (ACK and CANCEL reuse the INVITE's).
    pub fn make_request(
        &self,
        method: Method,
        seq: Option<u32>,
        body: Option<Vec<u8>>,
    ) -> Result<Request> {
        let req_uri = self
            .remote_target
            .read()
            .unwrap()
            .clone()
            .unwrap_or_else(|| self.remote_uri.uri.clone());
        let seq = seq.unwrap_or_else(|| self.increment_local_seq());
        let via = self.endpoint_inner.get_via(None, None)?;

        let from = self.local_uri.clone().with_tag(&self.local_tag());
        let mut to = self.remote_uri.clone();
        let remote_tag = self.remote_tag();
        if !remote_tag.is_empty() {
            to = to.with_tag(&remote_tag);
        }

        let mut request = self
            .endpoint_inner
            .make_request(method, req_uri, via, from, to, seq);
        request
            .headers
            .unique_push("Call-ID", self.id.read().unwrap().call_id.clone());
        for route in self.route_set.read().unwrap().iter() {
            request.headers.push("Route", route.to_string());
        }
        if let Some(contact) = &self.local_contact {
            request
                .headers
                .unique_push("Contact", NameAddr::new(contact.clone()).to_string());
        }
        if let Some(body) = body {
            request.body = body;
        }
        Ok(request)
    }

    /// Build a response within the dialog: endpoint fabrication plus the
    /// dialog's local tag and Contact.
    pub fn make_response(
        &self,
        request: &Request,
        status_code: StatusCode,
        body: Option<Vec<u8>>,
    ) -> Response {
        let mut response = self
            .endpoint_inner
            .make_response(request, status_code, body);
        let local_tag = self.local_tag();
        if !local_tag.is_empty() {
            if let Ok(to) = response.headers.to_header() {
                if to.tag().is_none() {
                    response
                        .headers
                        .unique_push("To", to.with_tag(&local_tag).to_string());
                }
            }
        }
        if let Some(contact) = &self.local_contact {
            response
                .headers
                .unique_push("Contact", NameAddr::new(contact.clone()).to_string());
        }
        response
    }

    /// Send an in-dialog request through its own client transaction and
    /// return the final response, answering one digest challenge along
    /// the way when credentials are configured.
    pub async fn do_request(&self, request: Request) -> Result<Option<Response>> {
        let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
        let mut tx = Transaction::new_client(key, request, self.endpoint_inner.clone(), None);
        tx.send().await?;
        let mut auth_sent = false;
        while let Some(msg) = tx.receive().await {
            let SipMessage::Response(response) = msg else {
                continue;
            };
            match response.status_code.kind() {
                StatusKind::Provisional => continue,
                _ => {
                    if matches!(
                        response.status_code,
                        StatusCode::Unauthorized | StatusCode::ProxyAuthenticationRequired
                    ) && !auth_sent
                    {
                        if let Some(credential) = &self.credential {
                            auth_sent = true;
                            let seq = self.increment_local_seq();
                            tx = handle_client_authenticate(seq, tx, response, credential)
                                .await?;
                            tx.send().await?;
                            continue;
                        }
                    }
                    return Ok(Some(response));
                }
            }
        }
        match tx.timeout_error() {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }
}

/// A dialog of either orientation, as stored in the dialog table.
#[derive(Clone)]
pub enum Dialog {
    ClientInvite(ClientInviteDialog),
    ServerInvite(ServerInviteDialog),
}

impl Dialog {
    pub fn id(&self) -> DialogId {
        match self {
            Dialog::ClientInvite(d) => d.id(),
            Dialog::ServerInvite(d) => d.id(),
        }
    }

    pub(crate) fn inner(&self) -> &std::sync::Arc<DialogInner> {
        match self {
            Dialog::ClientInvite(d) => &d.inner,
            Dialog::ServerInvite(d) => &d.inner,
        }
    }

    /// Route an in-dialog server transaction to the owning dialog.
    pub async fn handle_incoming(&self, tx: Transaction) -> Result<()> {
        info!("dialog {} handling {}", self.id(), tx.original.method);
        match self {
            Dialog::ClientInvite(d) => d.handle_incoming(tx).await,
            Dialog::ServerInvite(d) => d.handle_incoming(tx).await,
        }
    }

    /// End the dialog in whatever way its state calls for: CANCEL while
    /// early, BYE once confirmed, nothing when already terminated.
    pub async fn terminate(&self) -> Result<()> {
        match self {
            Dialog::ClientInvite(d) => d.terminate().await,
            Dialog::ServerInvite(d) => d.terminate().await,
        }
    }
}
