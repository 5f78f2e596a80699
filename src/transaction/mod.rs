//! Transaction layer: the four RFC 3261 state machines, their timers,
//! and the endpoint that owns the transaction table.

pub mod endpoint;
pub mod key;
pub mod message;
pub mod timer;
pub mod transaction;

#[cfg(test)]
mod tests;

use key::TransactionKey;
use rand::{distr::Alphanumeric, Rng};
use std::time::Duration;

/// RFC 3261 round-trip estimate.
pub const T1: Duration = Duration::from_millis(500);
/// Maximum retransmission interval for non-INVITE requests and INVITE
/// responses.
pub const T2: Duration = Duration::from_secs(4);
/// Maximum time a message stays in the network.
pub const T4: Duration = Duration::from_secs(5);
/// 64*T1: the transaction timeout used by Timers B, F, H and J.
pub const T1X64: Duration = Duration::from_millis(64 * 500);

/// Magic cookie every RFC 3261 branch starts with.
pub const BRANCH_MAGIC: &str = "z9hG4bK";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    ClientInvite,
    ClientNonInvite,
    ServerInvite,
    ServerNonInvite,
}

/// One state set covers all four machines; `Transaction::can_transition`
/// enforces which labels each machine may visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Client INVITE before any response.
    Calling,
    /// Client non-INVITE before any response; server initial state.
    Trying,
    Proceeding,
    Completed,
    /// Server INVITE after the ACK for a non-2xx final.
    Confirmed,
    Terminated,
}

/// A scheduled timer event. Retransmission timers carry the interval to
/// double on the next arming.
#[derive(Debug, Clone)]
pub enum TransactionTimer {
    /// INVITE client retransmission.
    TimerA(TransactionKey, Duration),
    /// INVITE client transaction timeout.
    TimerB(TransactionKey),
    /// Wait for response retransmits after a non-2xx final (client INVITE).
    TimerD(TransactionKey),
    /// Non-INVITE client retransmission.
    TimerE(TransactionKey, Duration),
    /// Non-INVITE client transaction timeout.
    TimerF(TransactionKey),
    /// INVITE server final-response retransmission.
    TimerG(TransactionKey, Duration),
    /// Wait for ACK (server INVITE).
    TimerH(TransactionKey),
    /// Wait for ACK retransmits in Confirmed (server INVITE).
    TimerI(TransactionKey),
    /// Wait for request retransmits after a final (server non-INVITE).
    TimerJ(TransactionKey),
    /// Wait for response retransmits after a final (client non-INVITE).
    TimerK(TransactionKey),
    /// 200 ms guard: send 100 Trying if the TU has not responded yet.
    TimerProvision(TransactionKey),
}

impl TransactionTimer {
    pub fn key(&self) -> &TransactionKey {
        match self {
            TransactionTimer::TimerA(key, _)
            | TransactionTimer::TimerB(key)
            | TransactionTimer::TimerD(key)
            | TransactionTimer::TimerE(key, _)
            | TransactionTimer::TimerF(key)
            | TransactionTimer::TimerG(key, _)
            | TransactionTimer::TimerH(key)
            | TransactionTimer::TimerI(key)
            | TransactionTimer::TimerJ(key)
            | TransactionTimer::TimerK(key)
            | TransactionTimer::TimerProvision(key) => key,
        }
    }
}

fn random_token(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// A fresh Via branch with the RFC 3261 magic cookie.
pub fn make_branch() -> String {
    format!("{}{}", BRANCH_MAGIC, random_token(12))
}

pub fn make_tag() -> String {
    random_token(8)
}

pub fn make_call_id(domain: Option<&str>) -> String {
    match domain {
        Some(domain) => format!("{}@{}", random_token(16), domain),
        None => random_token(16),
    }
}
