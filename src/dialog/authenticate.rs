use crate::message::auth::{DigestChallenge, DigestCredentials};
use crate::message::{CSeq, Response, StatusCode};
use crate::transaction::key::{TransactionKey, TransactionRole};
use crate::transaction::transaction::Transaction;
use crate::transaction::make_branch;
use crate::{Error, Result};
use tracing::{debug, warn};

/// Credentials a client presents when challenged.
#[derive(Debug, Clone)]
pub struct Credential {
    pub username: String,
    pub password: String,
    /// Expected realm; a challenge for a different realm is refused.
    pub realm: Option<String>,
}

/// Answer a 401 or 407 by rebuilding the challenged request with an
/// `Authorization` (or `Proxy-Authorization`) header, a fresh branch and
/// a bumped CSeq, returning the replacement client transaction ready to
/// send. The exhausted transaction is consumed; dropping it detaches it
/// from the endpoint.
pub async fn handle_client_authenticate(
    new_seq: u32,
    tx: Transaction,
    response: Response,
    credential: &Credential,
) -> Result<Transaction> {
    let (challenge_name, answer_name) =
        if response.status_code == StatusCode::ProxyAuthenticationRequired {
            ("Proxy-Authenticate", "Proxy-Authorization")
        } else {
            ("WWW-Authenticate", "Authorization")
        };
    let raw = response
        .headers
        .get(challenge_name)
        .ok_or_else(|| Error::AuthError(format!("{} without challenge", response.status_code)))?;
    let challenge = DigestChallenge::parse(raw)?;
    if let Some(realm) = &credential.realm {
        if !realm.eq_ignore_ascii_case(&challenge.realm) {
            warn!(
                "challenge realm {} does not match configured realm {}",
                challenge.realm, realm
            );
            return Err(Error::AuthError(format!(
                "unexpected realm: {}",
                challenge.realm
            )));
        }
    }

    let mut request = tx.original.clone();
    let digest_uri = request.uri.to_string();
    let answer = DigestCredentials::answer(
        &challenge,
        &credential.username,
        &credential.password,
        request.method.as_str(),
        &digest_uri,
        1,
    );
    request.headers.unique_push(answer_name, answer.to_string());

    let mut via = request.headers.via()?;
    via.set_param("branch", Some(&make_branch()));
    request.headers.unique_push("Via", via.to_string());
    request
        .headers
        .unique_push("CSeq", CSeq::new(new_seq, request.method).to_string());

    debug!("retrying {} with credentials for {}", request.method, credential.username);
    let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
    let connection = tx.connection.clone();
    let destination = tx.destination;
    let mut new_tx = Transaction::new_client(key, request, tx.endpoint_inner.clone(), connection);
    new_tx.destination = destination;
    Ok(new_tx)
}
