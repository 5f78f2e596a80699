use super::dialog::{Dialog, DialogInner, DialogStateSender};
use super::server_dialog::ServerInviteDialog;
use super::{authenticate::Credential, DialogId};
use crate::message::{Method, Request, StatusCode, Uri};
use crate::transaction::endpoint::EndpointInnerRef;
use crate::transaction::key::TransactionRole;
use crate::transaction::make_tag;
use crate::transaction::transaction::Transaction;
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// How long a terminated dialog stays in the table so straggling
/// retransmissions still find it.
pub const TERMINATED_GRACE: Duration = Duration::from_secs(32);

pub struct DialogLayerInner {
    last_seq: AtomicU32,
    pub(crate) dialogs: RwLock<HashMap<DialogId, Dialog>>,
}

/// Owner of every dialog, keyed by [`DialogId`].
///
/// Cross-references between transactions and dialogs are ids, never
/// reference cycles: transactions find their dialog through
/// [`DialogLayer::match_dialog`], dialogs reach their in-flight INVITE
/// transaction through an event sender.
#[derive(Clone)]
pub struct DialogLayer {
    pub endpoint: EndpointInnerRef,
    pub inner: Arc<DialogLayerInner>,
}

impl DialogLayer {
    pub fn new(endpoint: EndpointInnerRef) -> Self {
        DialogLayer {
            endpoint,
            inner: Arc::new(DialogLayerInner {
                last_seq: AtomicU32::new(0),
                dialogs: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn increment_last_seq(&self) -> u32 {
        self.inner.last_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn len(&self) -> usize {
        self.inner.dialogs.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Create the UAS dialog for an incoming INVITE transaction, assigning
    /// the local To-tag that completes the dialog id.
    pub fn get_or_create_server_invite(
        &self,
        tx: &Transaction,
        state_sender: DialogStateSender,
        credential: Option<Credential>,
        local_contact: Option<Uri>,
    ) -> Result<ServerInviteDialog> {
        let mut id = DialogId::try_from(&tx.original)?;
        if !id.to_tag.is_empty() {
            // Re-INVITE for an existing dialog.
            if let Some(Dialog::ServerInvite(dialog)) = self.match_dialog(&tx.original) {
                return Ok(dialog);
            }
            return Err(Error::DialogError(
                "unknown dialog for in-dialog INVITE".to_string(),
                id,
            ));
        }
        id.to_tag = make_tag();
        let inner = DialogInner::new(
            TransactionRole::Server,
            id.clone(),
            tx.original.clone(),
            self.endpoint.clone(),
            state_sender,
            credential,
            local_contact,
        )?;
        // Wire the INVITE transaction in right away so the application can
        // answer before the serving task has started.
        *inner.invite_tx_sender.lock().unwrap() = Some(tx.tu_sender.clone());
        let dialog = ServerInviteDialog {
            inner: Arc::new(inner),
        };
        self.inner
            .dialogs
            .write()
            .unwrap()
            .insert(id.clone(), Dialog::ServerInvite(dialog.clone()));
        info!("server invite dialog created: {}", id);
        Ok(dialog)
    }

    pub fn get_dialog(&self, id: &DialogId) -> Option<Dialog> {
        let dialogs = self.inner.dialogs.read().unwrap();
        dialogs
            .get(id)
            .or_else(|| dialogs.get(&id.swapped()))
            .cloned()
    }

    /// Find the dialog an incoming request belongs to. Tags arrive in the
    /// peer's orientation, so the swapped id is tried too; a CANCEL has no
    /// To-tag and matches on Call-ID plus From-tag alone.
    pub fn match_dialog(&self, request: &Request) -> Option<Dialog> {
        let id = DialogId::try_from(request).ok()?;
        if let Some(dialog) = self.get_dialog(&id) {
            return Some(dialog);
        }
        if request.method == Method::Cancel {
            let dialogs = self.inner.dialogs.read().unwrap();
            return dialogs
                .iter()
                .find(|(stored, _)| {
                    stored.call_id == id.call_id && stored.from_tag == id.from_tag
                })
                .map(|(_, d)| d.clone());
        }
        None
    }

    /// Route an incoming server transaction.
    ///
    /// In-dialog requests are dispatched to their dialog (a CANCEL is
    /// answered 200 here; its 487 comes from the INVITE transaction the
    /// endpoint already notified). Unknown in-dialog requests are
    /// answered 481. Out-of-dialog work is handed back to the caller.
    pub async fn handle_incoming(&self, mut tx: Transaction) -> Result<Option<Transaction>> {
        if let Some(dialog) = self.match_dialog(&tx.original) {
            if tx.original.method == Method::Cancel {
                let original = tx.original.clone();
                let resp = dialog
                    .inner()
                    .make_response(&original, StatusCode::OK, None);
                tx.respond(resp).await?;
                return Ok(None);
            }
            dialog.handle_incoming(tx).await?;
            return Ok(None);
        }
        let id = DialogId::try_from(&tx.original)?;
        if !id.to_tag.is_empty() && tx.original.method != Method::Invite {
            // In-dialog request for a dialog this endpoint does not know.
            debug!("no dialog for in-dialog request: {}", id);
            tx.reply(StatusCode::CallTransactionDoesNotExist).await?;
            return Ok(None);
        }
        Ok(Some(tx))
    }

    pub fn remove_dialog(&self, id: &DialogId) {
        let mut dialogs = self.inner.dialogs.write().unwrap();
        if dialogs.remove(id).is_none() {
            dialogs.remove(&id.swapped());
        }
    }

    /// Re-key a client dialog once the 2xx fixed the To-tag.
    pub fn rekey_dialog(&self, old_id: &DialogId, dialog: Dialog) {
        let mut dialogs = self.inner.dialogs.write().unwrap();
        dialogs.remove(old_id);
        dialogs.insert(dialog.id(), dialog);
    }

    /// Evict dialogs that have been terminated longer than the grace
    /// period. Meant to run on a periodic sweep.
    pub fn cleanup_terminated(&self, now: Instant) {
        let mut dialogs = self.inner.dialogs.write().unwrap();
        dialogs.retain(|id, dialog| {
            let expired = dialog
                .inner()
                .terminated_at
                .read()
                .unwrap()
                .map(|t| now.duration_since(t) >= TERMINATED_GRACE)
                .unwrap_or(false);
            if expired {
                debug!("garbage collecting dialog {}", id);
            }
            !expired
        });
    }
}
