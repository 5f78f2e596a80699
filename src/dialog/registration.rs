use super::authenticate::{handle_client_authenticate, Credential};
use crate::message::{NameAddr, Method, Request, Response, Scheme, SipMessage, StatusCode, Uri};
use crate::transaction::{
    endpoint::EndpointInnerRef,
    key::{TransactionKey, TransactionRole},
    make_call_id, make_tag,
    transaction::Transaction,
};
use crate::transport::connection::response_via_received;
use crate::{Error, Result};
use get_if_addrs::get_if_addrs;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::{debug, info};

const DEFAULT_EXPIRES: u32 = 3600;

/// SIP registration client.
///
/// Binds this agent's contact to its address-of-record on a registrar:
/// sends REGISTER, answers one digest challenge, recovers from 423
/// Interval Too Brief, and learns the public address the registrar saw
/// (`received`/`rport` on the topmost Via) so subsequent Contacts
/// survive NAT. Refreshing is the caller's loop;
/// [`Registration::refresh_interval`] is half the granted expiry.
///
/// Not thread-safe; drive one registration from one task.
pub struct Registration {
    pub last_seq: u32,
    pub endpoint: EndpointInnerRef,
    pub credential: Option<Credential>,
    pub contact: Option<NameAddr>,
    /// Public address reported by the registrar.
    pub public_address: Option<SocketAddr>,
    call_id: String,
    granted_expires: Option<u32>,
}

impl Registration {
    pub fn new(endpoint: EndpointInnerRef, credential: Option<Credential>) -> Self {
        Self {
            last_seq: 0,
            endpoint,
            credential,
            contact: None,
            public_address: None,
            call_id: make_call_id(None),
            granted_expires: None,
        }
    }

    /// Seconds the registrar granted on the last 200, or the default.
    pub fn expires(&self) -> u32 {
        self.granted_expires.unwrap_or(DEFAULT_EXPIRES)
    }

    /// Refresh at half the granted lifetime.
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.expires()) / 2)
    }

    fn first_non_loopback_interface() -> Result<IpAddr> {
        get_if_addrs()?
            .iter()
            .find(|i| !i.is_loopback())
            .map(|i| match i.addr {
                get_if_addrs::IfAddr::V4(ref addr) => Ok(IpAddr::V4(addr.ip)),
                get_if_addrs::IfAddr::V6(ref addr) => Ok(IpAddr::V6(addr.ip)),
            })
            .unwrap_or_else(|| Err(Error::Error("no usable network interface".to_string())))
    }

    fn local_contact(&self) -> Result<NameAddr> {
        if let Some(contact) = &self.contact {
            return Ok(contact.clone());
        }
        let local = self
            .endpoint
            .transport_layer
            .first_addr()
            .ok_or_else(|| Error::Error("no transport configured".to_string()))?;
        let contact_addr = match self.public_address {
            Some(addr) => addr,
            None => {
                let mut addr = local.addr;
                if addr.ip().is_unspecified() {
                    addr.set_ip(Self::first_non_loopback_interface()?);
                }
                addr
            }
        };
        let user = self.credential.as_ref().map(|c| c.username.as_str());
        let mut uri = Uri::from_socket_addr(Scheme::Sip, user, contact_addr);
        if local.kind != crate::transport::TransportKind::Udp {
            uri.set_param("transport", Some(&local.kind.as_str().to_lowercase()));
        }
        Ok(NameAddr::new(uri))
    }

    fn make_register_request(&mut self, server: &str, expires: u32) -> Result<Request> {
        self.last_seq += 1;
        let mut aor = Uri::try_from(format!("sip:{}", server).as_str())?;
        if let Some(credential) = &self.credential {
            aor.user = Some(credential.username.clone());
        }
        let recipient = Uri::try_from(format!("sip:{}", server).as_str())?;
        let to = NameAddr::new(aor);
        let from = to.clone().with_tag(&make_tag());
        let via = self.endpoint.get_via(None, None)?;
        let mut request =
            self.endpoint
                .make_request(Method::Register, recipient, via, from, to, self.last_seq);
        // One registration keeps one Call-ID across refreshes.
        request.headers.unique_push("Call-ID", self.call_id.clone());
        request
            .headers
            .unique_push("Contact", self.local_contact()?.to_string());
        request.headers.unique_push("Expires", expires.to_string());
        request.headers.unique_push(
            "Allow",
            "INVITE, ACK, BYE, CANCEL, OPTIONS, UPDATE, INFO, REFER, NOTIFY, MESSAGE",
        );
        Ok(request)
    }

    /// Register with `server`, driving challenges and 423 recovery to a
    /// final response.
    pub async fn register(&mut self, server: &str, expires: Option<u32>) -> Result<Response> {
        let requested = expires.unwrap_or(DEFAULT_EXPIRES);
        let request = self.make_register_request(server, requested)?;
        let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
        let mut tx = Transaction::new_client(key, request, self.endpoint.clone(), None);
        tx.send().await?;

        let mut auth_sent = false;
        let mut min_retry_sent = false;
        while let Some(msg) = tx.receive().await {
            let SipMessage::Response(resp) = msg else {
                continue;
            };
            match resp.status_code {
                code if code.is_provisional() => continue,
                StatusCode::Unauthorized | StatusCode::ProxyAuthenticationRequired => {
                    self.learn_public_address(&resp);
                    if auth_sent {
                        debug!("credentials rejected: {}", resp.status_code);
                        return Ok(resp);
                    }
                    let Some(credential) = self.credential.clone() else {
                        debug!("{} without configured credentials", resp.status_code);
                        return Ok(resp);
                    };
                    self.last_seq += 1;
                    tx = handle_client_authenticate(self.last_seq, tx, resp, &credential).await?;
                    tx.send().await?;
                    auth_sent = true;
                }
                StatusCode::IntervalTooBrief if !min_retry_sent => {
                    let min = resp.headers.min_expires().unwrap_or(requested);
                    info!("registrar wants at least {}s, retrying", min);
                    min_retry_sent = true;
                    auth_sent = false;
                    let request = self.make_register_request(server, min)?;
                    let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
                    tx = Transaction::new_client(key, request, self.endpoint.clone(), None);
                    tx.send().await?;
                }
                StatusCode::OK => {
                    self.learn_public_address(&resp);
                    self.granted_expires = Some(self.granted_expires_from(&resp, requested));
                    info!(
                        "registered for {}s (refresh in {:?})",
                        self.expires(),
                        self.refresh_interval()
                    );
                    return Ok(resp);
                }
                _ => {
                    info!("registration answered {}", resp.status_code);
                    return Ok(resp);
                }
            }
        }
        Err(tx.timeout_error().unwrap_or_else(|| {
            Error::Error("registration transaction terminated".to_string())
        }))
    }

    /// Drop the binding (`Expires: 0`).
    pub async fn unregister(&mut self, server: &str) -> Result<Response> {
        let response = self.register(server, Some(0)).await?;
        if response.status_code == StatusCode::OK {
            self.granted_expires = None;
        }
        Ok(response)
    }

    fn learn_public_address(&mut self, response: &Response) {
        let received = response_via_received(response);
        if let Some(addr) = received {
            if self.public_address != Some(addr) {
                info!("public address discovered: {}", addr);
                self.public_address = Some(addr);
                // Rebuild the contact with the public address next time.
                self.contact = None;
            }
        }
    }

    /// The expiry the registrar actually granted: the `;expires` on our
    /// Contact, else the Expires header, else what we asked for.
    fn granted_expires_from(&self, response: &Response, requested: u32) -> u32 {
        if let Ok(contacts) = response.headers.contacts() {
            if let Some(granted) = contacts.iter().find_map(|c| c.expires()) {
                return granted;
            }
        }
        response.headers.expires().unwrap_or(requested)
    }
}
