use super::{
    authenticate::Credential,
    client_dialog::ClientInviteDialog,
    dialog::{Dialog, DialogInner, DialogStateSender},
    dialog_layer::DialogLayer,
    DialogId,
};
use crate::message::{Header, NameAddr, Method, Request, Response, Uri};
use crate::transaction::{
    key::{TransactionKey, TransactionRole},
    make_tag,
    transaction::Transaction,
};
use crate::transport::SipAddr;
use crate::Result;
use std::sync::Arc;
use tracing::{debug, info};

/// Everything needed to place a call.
///
/// `caller` and `callee` become From and To; `contact` is this agent's
/// reachable address; `offer` is the SDP carried in the INVITE body; an
/// optional `destination` bypasses URI resolution (for outbound proxies);
/// `headers` override or extend the generated defaults.
#[derive(Default)]
pub struct InviteOption {
    pub caller: Uri,
    pub callee: Uri,
    pub display_name: Option<String>,
    pub destination: Option<SipAddr>,
    pub content_type: Option<String>,
    pub offer: Option<Vec<u8>>,
    pub contact: Uri,
    pub credential: Option<Credential>,
    pub headers: Option<Vec<Header>>,
}

impl DialogLayer {
    /// Build the initial INVITE for `opt`, with a fresh From-tag, branch
    /// and Call-ID and the layer-wide CSeq counter.
    pub fn make_invite_request(&self, opt: &InviteOption) -> Result<Request> {
        let last_seq = self.increment_last_seq();
        let to = NameAddr::new(opt.callee.clone());
        let recipient = to.uri.clone();
        let mut from = NameAddr::new(opt.caller.clone()).with_tag(&make_tag());
        from.display_name = opt.display_name.clone();
        let via = self.endpoint.get_via(None, None)?;
        let mut request =
            self.endpoint
                .make_request(Method::Invite, recipient, via, from, to, last_seq);

        request
            .headers
            .unique_push("Contact", NameAddr::new(opt.contact.clone()).to_string());
        request.headers.unique_push(
            "Content-Type",
            opt.content_type
                .clone()
                .unwrap_or_else(|| "application/sdp".to_string()),
        );
        if let Some(headers) = opt.headers.as_ref() {
            for header in headers {
                request.headers.unique_push(&header.name, header.value.clone());
            }
        }
        Ok(request)
    }

    pub fn create_client_invite_dialog(
        &self,
        opt: InviteOption,
        state_sender: DialogStateSender,
    ) -> Result<(ClientInviteDialog, Transaction)> {
        let mut request = self.make_invite_request(&opt)?;
        request.body = opt.offer.unwrap_or_default();
        let id = DialogId::try_from(&request)?;
        let inner = DialogInner::new(
            TransactionRole::Client,
            id,
            request.clone(),
            self.endpoint.clone(),
            state_sender,
            opt.credential,
            Some(opt.contact),
        )?;
        let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
        let mut tx = Transaction::new_client(key, request, self.endpoint.clone(), None);
        tx.destination = opt.destination;
        let dialog = ClientInviteDialog {
            inner: Arc::new(inner),
        };
        Ok((dialog, tx))
    }

    /// Place a call: send the INVITE, drive it to a final response, and
    /// keep the dialog registered under its confirmed id. Returns the
    /// dialog together with the final response (the response is the place
    /// to read the SDP answer from).
    pub async fn do_invite(
        &self,
        opt: InviteOption,
        state_sender: DialogStateSender,
    ) -> Result<(ClientInviteDialog, Option<Response>)> {
        let (dialog, tx) = self.create_client_invite_dialog(opt, state_sender)?;
        let id = dialog.id();
        self.inner
            .dialogs
            .write()
            .unwrap()
            .insert(id.clone(), Dialog::ClientInvite(dialog.clone()));
        info!("client invite dialog created: {}", id);

        match dialog.process_invite(tx).await {
            Ok((confirmed_id, response)) => {
                debug!("client invite dialog settled: {} => {}", id, confirmed_id);
                self.rekey_dialog(&id, Dialog::ClientInvite(dialog.clone()));
                Ok((dialog, response))
            }
            Err(e) => {
                self.remove_dialog(&id);
                Err(e)
            }
        }
    }
}
