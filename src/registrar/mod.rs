//! SIP registrar: account table, binding table and digest authentication
//! with per-nonce replay protection.
//!
//! [`SipRegistrar::process_register`] is a pure request-in/response-out
//! function over internally locked state, so the serving task can call it
//! and send the response without holding any lock across the transport.

use crate::message::auth::{
    constant_time_eq, digest_response, DigestAlgorithm, DigestChallenge, DigestCredentials,
};
use crate::message::{Method, Request, Response, StatusCode, Uri, Version};
use crate::transaction::make_tag;
use crate::{Error, Result};
use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// Registrar configuration. Expiry values are seconds.
#[derive(Debug, Clone)]
pub struct RegistrarOption {
    pub realm: String,
    pub default_expires: u32,
    pub max_expires: u32,
    pub min_expires: u32,
    pub nonce_ttl: Duration,
    pub algorithm: DigestAlgorithm,
}

impl RegistrarOption {
    pub fn new(realm: &str) -> Self {
        RegistrarOption {
            realm: realm.to_string(),
            default_expires: 3600,
            max_expires: 86_400,
            min_expires: 60,
            nonce_ttl: Duration::from_secs(300),
            algorithm: DigestAlgorithm::Md5,
        }
    }
}

/// One AOR-to-contact mapping held by the registrar.
#[derive(Debug, Clone)]
pub struct Binding {
    pub contact: Uri,
    pub expires_at: Instant,
    pub user_agent: Option<String>,
}

impl Binding {
    pub fn remaining(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone)]
struct NonceState {
    value: String,
    expires_at: Instant,
    /// Highest accepted nonce-count; replays must exceed it.
    highest_nc: u32,
}

/// A provisioned account with its current bindings and nonce.
#[derive(Debug, Clone)]
pub struct UserAccount {
    pub username: String,
    pub password: String,
    pub realm: String,
    pub display_name: String,
    pub enabled: bool,
    bindings: Vec<Binding>,
    nonce: Option<NonceState>,
}

/// Seam for a future persistence collaborator. The registrar itself keeps
/// everything in memory; an implementation of this trait can snapshot and
/// restore the binding table around restarts.
#[async_trait]
pub trait BindingStore: Send + Sync {
    async fn load(&self) -> Result<Vec<(String, Vec<Binding>)>>;
    async fn save(&self, bindings: Vec<(String, Vec<Binding>)>) -> Result<()>;
}

enum AuthOutcome {
    Verified,
    /// Send a challenge; `stale` marks a nonce problem rather than bad
    /// credentials.
    Challenge { stale: bool },
    BadRequest,
}

/// The registrar.
pub struct SipRegistrar {
    pub option: RegistrarOption,
    secret: [u8; 16],
    nonce_counter: AtomicU64,
    users: RwLock<HashMap<String, UserAccount>>,
}

impl SipRegistrar {
    pub fn new(option: RegistrarOption) -> Self {
        SipRegistrar {
            option,
            secret: rand::rng().random(),
            nonce_counter: AtomicU64::new(1),
            users: RwLock::new(HashMap::new()),
        }
    }

    pub fn add_user(&self, username: &str, password: &str, display_name: Option<&str>) {
        let account = UserAccount {
            username: username.to_string(),
            password: password.to_string(),
            realm: self.option.realm.clone(),
            display_name: display_name.unwrap_or(username).to_string(),
            enabled: true,
            bindings: Vec::new(),
            nonce: None,
        };
        info!("user added: {} ({})", username, account.display_name);
        self.users
            .write()
            .unwrap()
            .insert(username.to_string(), account);
    }

    pub fn remove_user(&self, username: &str) -> bool {
        let removed = self.users.write().unwrap().remove(username).is_some();
        if removed {
            info!("user removed: {}", username);
        }
        removed
    }

    pub fn set_enabled(&self, username: &str, enabled: bool) -> bool {
        let mut users = self.users.write().unwrap();
        match users.get_mut(username) {
            Some(user) => {
                user.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Unexpired bindings for an AOR username.
    pub fn list_bindings(&self, username: &str) -> Vec<Binding> {
        let now = Instant::now();
        self.users
            .read()
            .unwrap()
            .get(username)
            .map(|u| {
                u.bindings
                    .iter()
                    .filter(|b| !b.is_expired(now))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_registered(&self, username: &str) -> bool {
        !self.list_bindings(username).is_empty()
    }

    pub fn registered_users(&self) -> Vec<String> {
        let now = Instant::now();
        self.users
            .read()
            .unwrap()
            .values()
            .filter(|u| u.bindings.iter().any(|b| !b.is_expired(now)))
            .map(|u| u.username.clone())
            .collect()
    }

    /// Process a REGISTER into a response, updating the binding table as a
    /// side effect.
    ///
    /// The AOR comes from the To URI. Unknown users get 404, disabled ones
    /// 403; anything unauthenticated gets 401 with a fresh challenge, with
    /// `stale=true` when only the nonce was at fault. Contacts then drive
    /// the binding delta: wildcard-with-zero clears, zero expiry removes,
    /// anything else upserts with the expiry clamped to the configured
    /// bounds, or 423 below the minimum.
    pub fn process_register(&self, request: &Request) -> Result<Response> {
        if request.method != Method::Register {
            return Ok(self.make_response(request, StatusCode::MethodNotAllowed));
        }
        let aor = request.headers.to_header()?;
        let Some(username) = aor.uri.user.clone() else {
            return Ok(self.make_response(request, StatusCode::BadRequest));
        };
        let now = Instant::now();

        let mut users = self.users.write().unwrap();
        let Some(user) = users.get_mut(&username) else {
            debug!("REGISTER for unknown user {}", username);
            return Ok(self.make_response(request, StatusCode::NotFound));
        };
        if !user.enabled {
            return Ok(self.make_response(request, StatusCode::Forbidden));
        }

        match self.authenticate(user, request, now) {
            AuthOutcome::Verified => {}
            AuthOutcome::Challenge { stale } => {
                let nonce = self.issue_nonce(user, now);
                return Ok(self.challenge_response(request, &nonce, stale));
            }
            AuthOutcome::BadRequest => {
                return Ok(self.make_response(request, StatusCode::BadRequest));
            }
        }

        let header_expires = request.headers.expires();
        if request.headers.has_wildcard_contact() {
            if header_expires != Some(0) {
                return Ok(self.make_response(request, StatusCode::BadRequest));
            }
            info!("all bindings cleared for {}", username);
            user.bindings.clear();
            return Ok(self.make_response(request, StatusCode::OK));
        }

        let contacts = match request.headers.contacts() {
            Ok(contacts) => contacts,
            Err(_) => return Ok(self.make_response(request, StatusCode::BadRequest)),
        };

        // 423 applies before any state changes.
        for contact in &contacts {
            let requested = contact
                .expires()
                .or(header_expires)
                .unwrap_or(self.option.default_expires);
            if requested != 0 && requested < self.option.min_expires {
                let mut resp = self.make_response(request, StatusCode::IntervalTooBrief);
                resp.headers
                    .unique_push("Min-Expires", self.option.min_expires.to_string());
                return Ok(resp);
            }
        }

        let user_agent = request.headers.get("User-Agent").map(|s| s.to_string());
        for contact in contacts {
            let requested = contact
                .expires()
                .or(header_expires)
                .unwrap_or(self.option.default_expires);
            let effective = requested.min(self.option.max_expires);
            if effective == 0 {
                user.bindings.retain(|b| b.contact != contact.uri);
                info!("binding removed: {} -> {}", username, contact.uri);
            } else {
                let expires_at = now + Duration::from_secs(u64::from(effective));
                match user
                    .bindings
                    .iter_mut()
                    .find(|b| b.contact == contact.uri)
                {
                    Some(binding) => {
                        binding.expires_at = expires_at;
                        binding.user_agent = user_agent.clone();
                    }
                    None => user.bindings.push(Binding {
                        contact: contact.uri.clone(),
                        expires_at,
                        user_agent: user_agent.clone(),
                    }),
                }
                info!(
                    "binding registered: {} -> {} for {}s",
                    username, contact.uri, effective
                );
            }
        }

        let mut response = self.make_response(request, StatusCode::OK);
        for binding in user.bindings.iter().filter(|b| !b.is_expired(now)) {
            response.headers.push(
                "Contact",
                format!(
                    "<{}>;expires={}",
                    binding.contact,
                    binding.remaining(now).as_secs()
                ),
            );
        }
        Ok(response)
    }

    fn authenticate(&self, user: &mut UserAccount, request: &Request, now: Instant) -> AuthOutcome {
        let Some(raw) = request.headers.get("Authorization") else {
            return AuthOutcome::Challenge { stale: false };
        };
        let creds = match DigestCredentials::parse(raw) {
            Ok(creds) => creds,
            Err(_) => return AuthOutcome::BadRequest,
        };
        if !creds.realm.eq_ignore_ascii_case(&self.option.realm)
            || creds.username != user.username
        {
            return AuthOutcome::Challenge { stale: false };
        }
        let Some(nonce) = user.nonce.as_mut() else {
            return AuthOutcome::Challenge { stale: true };
        };
        if nonce.value != creds.nonce || now >= nonce.expires_at {
            return AuthOutcome::Challenge { stale: true };
        }
        let nc = match creds.qop.as_deref() {
            Some("auth") => match creds.nonce_count() {
                // Strictly increasing per nonce; a replay never passes.
                Some(nc) if nc > nonce.highest_nc => Some(nc),
                _ => return AuthOutcome::Challenge { stale: true },
            },
            Some(_) => return AuthOutcome::BadRequest,
            None => None,
        };
        let expected = digest_response(
            self.option.algorithm,
            &creds.username,
            &self.option.realm,
            &user.password,
            request.method.as_str(),
            &creds.uri,
            &creds.nonce,
            creds.nc.as_deref(),
            creds.cnonce.as_deref(),
            creds.qop.as_deref(),
        );
        if !constant_time_eq(&expected, &creds.response) {
            debug!("digest mismatch for {}", user.username);
            return AuthOutcome::Challenge { stale: false };
        }
        if let Some(nc) = nc {
            nonce.highest_nc = nc;
        }
        AuthOutcome::Verified
    }

    /// Keyed nonce:
    /// `hex(timestamp) "." hex(seq) "." hex(H(secret | timestamp | seq | realm))`.
    /// The keyed hash binds the nonce to the registrar secret; the
    /// sequence makes every issue distinct even within one second.
    fn issue_nonce(&self, user: &mut UserAccount, now: Instant) -> String {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let seq = self.nonce_counter.fetch_add(1, Ordering::Relaxed);
        let mut keyed = Vec::with_capacity(self.secret.len() + 24 + self.option.realm.len());
        keyed.extend_from_slice(&self.secret);
        keyed.extend_from_slice(&timestamp.to_be_bytes());
        keyed.extend_from_slice(&seq.to_be_bytes());
        keyed.extend_from_slice(self.option.realm.as_bytes());
        let value = format!("{:x}.{:x}.{:x}", timestamp, seq, md5::compute(&keyed));
        user.nonce = Some(NonceState {
            value: value.clone(),
            expires_at: now + self.option.nonce_ttl,
            highest_nc: 0,
        });
        value
    }

    fn challenge_response(&self, request: &Request, nonce: &str, stale: bool) -> Response {
        let challenge = DigestChallenge {
            realm: self.option.realm.clone(),
            nonce: nonce.to_string(),
            opaque: None,
            algorithm: self.option.algorithm,
            qop: Some("auth".to_string()),
            stale,
        };
        let mut response = self.make_response(request, StatusCode::Unauthorized);
        response
            .headers
            .unique_push("WWW-Authenticate", challenge.to_string());
        response
    }

    /// Standalone response fabrication: the registrar answers through the
    /// server transaction it was handed, so it only mirrors the headers a
    /// response must carry.
    fn make_response(&self, request: &Request, status_code: StatusCode) -> Response {
        let mut headers = crate::message::Headers::new();
        for via in request.headers.get_all("Via") {
            headers.push("Via", via);
        }
        if let Some(from) = request.headers.get("From") {
            headers.push("From", from);
        }
        if let Some(to) = request.headers.get("To") {
            match request.headers.to_header() {
                Ok(parsed) if parsed.tag().is_none() => {
                    headers.push("To", parsed.with_tag(&make_tag()).to_string())
                }
                _ => headers.push("To", to),
            }
        }
        for name in ["Call-ID", "CSeq"] {
            if let Some(value) = request.headers.get(name) {
                headers.push(name, value);
            }
        }
        Response {
            status_code,
            reason: None,
            version: Version::V2,
            headers,
            body: Vec::new(),
        }
    }

    /// Periodic sweep: drop expired bindings and expired nonces.
    pub fn cleanup(&self, now: Instant) {
        let mut users = self.users.write().unwrap();
        for user in users.values_mut() {
            let before = user.bindings.len();
            user.bindings.retain(|b| !b.is_expired(now));
            if user.bindings.len() != before {
                debug!(
                    "expired {} binding(s) for {}",
                    before - user.bindings.len(),
                    user.username
                );
            }
            if user
                .nonce
                .as_ref()
                .is_some_and(|n| now >= n.expires_at)
            {
                user.nonce = None;
            }
        }
    }

    /// Snapshot current bindings into a [`BindingStore`].
    pub async fn save_bindings(&self, store: &dyn BindingStore) -> Result<()> {
        let snapshot: Vec<(String, Vec<Binding>)> = {
            let users = self.users.read().unwrap();
            users
                .values()
                .map(|u| (u.username.clone(), u.bindings.clone()))
                .collect()
        };
        store.save(snapshot).await
    }

    /// Restore bindings for already-provisioned users from a store.
    pub async fn load_bindings(&self, store: &dyn BindingStore) -> Result<()> {
        let loaded = store.load().await?;
        let mut users = self.users.write().unwrap();
        for (username, bindings) in loaded {
            if let Some(user) = users.get_mut(&username) {
                user.bindings = bindings;
            } else {
                return Err(Error::RegistrarError(format!(
                    "stored bindings for unknown user {}",
                    username
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Header, Headers, NameAddr};

    fn registrar() -> SipRegistrar {
        let registrar = SipRegistrar::new(RegistrarOption::new("ex.com"));
        registrar.add_user("alice", "secret", Some("Alice"));
        registrar
    }

    fn register_request(expires: Option<u32>, contact: &str) -> Request {
        let mut headers = Headers::from(vec![
            Header::new("Via", "SIP/2.0/UDP 10.0.0.5:5060;branch=z9hG4bKreg1"),
            Header::new("From", "<sip:alice@ex.com>;tag=r1"),
            Header::new("To", "<sip:alice@ex.com>"),
            Header::new("Call-ID", "reg-call-1"),
            Header::new("CSeq", "1 REGISTER"),
            Header::new("Contact", contact),
            Header::new("Max-Forwards", "70"),
            Header::new("User-Agent", "sipua-test"),
        ]);
        if let Some(expires) = expires {
            headers.push("Expires", expires.to_string());
        }
        Request {
            method: Method::Register,
            uri: Uri::try_from("sip:ex.com").unwrap(),
            version: Version::V2,
            headers,
            body: Vec::new(),
        }
    }

    fn authorize(request: &mut Request, challenge: &DigestChallenge, password: &str, nc: u32) {
        let creds = DigestCredentials::answer(
            challenge,
            "alice",
            password,
            "REGISTER",
            "sip:ex.com",
            nc,
        );
        request
            .headers
            .unique_push("Authorization", creds.to_string());
    }

    fn challenge_of(response: &Response) -> DigestChallenge {
        DigestChallenge::parse(response.headers.get("WWW-Authenticate").unwrap()).unwrap()
    }

    #[test]
    fn register_auth_round_trip() {
        let registrar = registrar();
        let request = register_request(Some(600), "<sip:alice@10.0.0.5:5060>");

        let challenge_resp = registrar.process_register(&request).unwrap();
        assert_eq!(challenge_resp.status_code, StatusCode::Unauthorized);
        let challenge = challenge_of(&challenge_resp);
        assert_eq!(challenge.realm, "ex.com");
        assert!(!challenge.stale);
        assert!(registrar.list_bindings("alice").is_empty());

        let mut authed = register_request(Some(600), "<sip:alice@10.0.0.5:5060>");
        authorize(&mut authed, &challenge, "secret", 1);
        let ok = registrar.process_register(&authed).unwrap();
        assert_eq!(ok.status_code, StatusCode::OK);
        let contact = NameAddr::parse(ok.headers.get("Contact").unwrap()).unwrap();
        let granted = contact.expires().unwrap();
        assert!(granted > 0 && granted <= 600);
        assert!(registrar.is_registered("alice"));
    }

    #[test]
    fn replayed_nonce_count_is_rejected_as_stale() {
        let registrar = registrar();
        let request = register_request(Some(600), "<sip:alice@10.0.0.5:5060>");
        let challenge = challenge_of(&registrar.process_register(&request).unwrap());

        let mut authed = register_request(Some(600), "<sip:alice@10.0.0.5:5060>");
        authorize(&mut authed, &challenge, "secret", 1);
        assert_eq!(
            registrar.process_register(&authed).unwrap().status_code,
            StatusCode::OK
        );
        let bindings_before = registrar.list_bindings("alice");

        // Verbatim resubmission: same nonce, same nc.
        let replay = registrar.process_register(&authed).unwrap();
        assert_eq!(replay.status_code, StatusCode::Unauthorized);
        let fresh = challenge_of(&replay);
        assert!(fresh.stale);
        assert_ne!(fresh.nonce, challenge.nonce);
        // No binding state change.
        assert_eq!(
            registrar.list_bindings("alice").len(),
            bindings_before.len()
        );
    }

    #[test]
    fn wrong_password_gets_fresh_challenge_without_stale() {
        let registrar = registrar();
        let request = register_request(Some(600), "<sip:alice@10.0.0.5:5060>");
        let challenge = challenge_of(&registrar.process_register(&request).unwrap());

        let mut authed = register_request(Some(600), "<sip:alice@10.0.0.5:5060>");
        authorize(&mut authed, &challenge, "wrong", 1);
        let resp = registrar.process_register(&authed).unwrap();
        assert_eq!(resp.status_code, StatusCode::Unauthorized);
        assert!(!challenge_of(&resp).stale);
        assert!(!registrar.is_registered("alice"));
    }

    #[test]
    fn wildcard_with_expires_zero_clears_all_bindings() {
        let registrar = registrar();
        let request = register_request(Some(600), "<sip:alice@10.0.0.5:5060>");
        let challenge = challenge_of(&registrar.process_register(&request).unwrap());
        let mut authed = register_request(Some(600), "<sip:alice@10.0.0.5:5060>");
        authorize(&mut authed, &challenge, "secret", 1);
        registrar.process_register(&authed).unwrap();
        assert!(registrar.is_registered("alice"));

        let mut clear = register_request(Some(0), "*");
        authorize(&mut clear, &challenge, "secret", 2);
        let resp = registrar.process_register(&clear).unwrap();
        assert_eq!(resp.status_code, StatusCode::OK);
        assert!(registrar.list_bindings("alice").is_empty());

        // Wildcard without Expires: 0 is malformed.
        let mut bad = register_request(Some(600), "*");
        authorize(&mut bad, &challenge, "secret", 3);
        assert_eq!(
            registrar.process_register(&bad).unwrap().status_code,
            StatusCode::BadRequest
        );
    }

    #[test]
    fn too_brief_interval_gets_423_with_min_expires() {
        let registrar = registrar();
        let request = register_request(Some(30), "<sip:alice@10.0.0.5:5060>");
        let challenge = challenge_of(&registrar.process_register(&request).unwrap());
        let mut authed = register_request(Some(30), "<sip:alice@10.0.0.5:5060>");
        authorize(&mut authed, &challenge, "secret", 1);
        let resp = registrar.process_register(&authed).unwrap();
        assert_eq!(resp.status_code, StatusCode::IntervalTooBrief);
        assert_eq!(resp.headers.get("Min-Expires"), Some("60"));
        assert!(!registrar.is_registered("alice"));
    }

    #[test]
    fn requested_expiry_is_clamped_to_the_maximum() {
        let registrar = registrar();
        let request = register_request(Some(200_000), "<sip:alice@10.0.0.5:5060>");
        let challenge = challenge_of(&registrar.process_register(&request).unwrap());
        let mut authed = register_request(Some(200_000), "<sip:alice@10.0.0.5:5060>");
        authorize(&mut authed, &challenge, "secret", 1);
        let ok = registrar.process_register(&authed).unwrap();
        let contact = NameAddr::parse(ok.headers.get("Contact").unwrap()).unwrap();
        assert!(contact.expires().unwrap() <= 86_400);
    }

    #[test]
    fn unknown_and_disabled_users() {
        let registrar = registrar();
        let mut request = register_request(Some(600), "<sip:alice@10.0.0.5:5060>");
        request
            .headers
            .unique_push("To", "<sip:nobody@ex.com>");
        assert_eq!(
            registrar.process_register(&request).unwrap().status_code,
            StatusCode::NotFound
        );

        registrar.set_enabled("alice", false);
        let request = register_request(Some(600), "<sip:alice@10.0.0.5:5060>");
        assert_eq!(
            registrar.process_register(&request).unwrap().status_code,
            StatusCode::Forbidden
        );
    }

    #[test]
    fn expired_nonce_is_stale() {
        let registrar = SipRegistrar::new(RegistrarOption {
            nonce_ttl: Duration::ZERO,
            ..RegistrarOption::new("ex.com")
        });
        registrar.add_user("alice", "secret", None);
        let request = register_request(Some(600), "<sip:alice@10.0.0.5:5060>");
        let challenge = challenge_of(&registrar.process_register(&request).unwrap());
        let mut authed = register_request(Some(600), "<sip:alice@10.0.0.5:5060>");
        authorize(&mut authed, &challenge, "secret", 1);
        let resp = registrar.process_register(&authed).unwrap();
        assert_eq!(resp.status_code, StatusCode::Unauthorized);
        assert!(challenge_of(&resp).stale);
    }

    #[test]
    fn zero_expiry_removes_a_single_binding() {
        let registrar = registrar();
        let request = register_request(Some(600), "<sip:alice@10.0.0.5:5060>");
        let challenge = challenge_of(&registrar.process_register(&request).unwrap());
        let mut authed = register_request(Some(600), "<sip:alice@10.0.0.5:5060>");
        authorize(&mut authed, &challenge, "secret", 1);
        registrar.process_register(&authed).unwrap();

        let mut remove = register_request(Some(0), "<sip:alice@10.0.0.5:5060>");
        authorize(&mut remove, &challenge, "secret", 2);
        let resp = registrar.process_register(&remove).unwrap();
        assert_eq!(resp.status_code, StatusCode::OK);
        assert!(resp.headers.get("Contact").is_none());
        assert!(!registrar.is_registered("alice"));
    }

    #[test]
    fn cleanup_evicts_expired_bindings() {
        let registrar = registrar();
        let request = register_request(Some(600), "<sip:alice@10.0.0.5:5060>");
        let challenge = challenge_of(&registrar.process_register(&request).unwrap());
        let mut authed = register_request(Some(600), "<sip:alice@10.0.0.5:5060>");
        authorize(&mut authed, &challenge, "secret", 1);
        registrar.process_register(&authed).unwrap();

        registrar.cleanup(Instant::now() + Duration::from_secs(601));
        assert!(registrar.list_bindings("alice").is_empty());
    }
}
