use super::*;
use crate::message::{Method, SipMessage, StatusCode};
use crate::transaction::key::{TransactionKey, TransactionRole};
use crate::transaction::transaction::{Transaction, TransactionEvent};
use crate::transaction::{TransactionState, TransactionTimer, T1};
use crate::Error;
use std::time::Duration;

fn response_code(msg: &SipMessage) -> StatusCode {
    match msg {
        SipMessage::Response(resp) => resp.status_code,
        _ => panic!("expected response"),
    }
}

#[tokio::test]
async fn invite_happy_path_delivers_each_response() {
    let endpoint = create_test_endpoint();
    let (conn, mut wire) = wire_pair(5090);
    let invite = make_request(Method::Invite, "z9hG4bKct1", 1);
    let key = TransactionKey::from_request(&invite, TransactionRole::Client).unwrap();
    let mut tx = Transaction::new_client(key, invite.clone(), endpoint.inner.clone(), Some(conn.into()));
    tx.destination = Some(test_addr(5070));
    tx.send().await.unwrap();

    let (sent, _) = wire.recv().await.unwrap();
    assert!(matches!(sent, SipMessage::Request(ref r) if r.method == Method::Invite));
    // Timer A (retransmit) and Timer B (timeout) are armed.
    assert_eq!(endpoint.inner.timers.len(), 2);

    let ringing = make_response(&invite, StatusCode::Ringing, Some("t1"));
    tx.tu_sender
        .send(TransactionEvent::Received(ringing.into(), None))
        .unwrap();
    let msg = tx.receive().await.unwrap();
    assert_eq!(response_code(&msg), StatusCode::Ringing);
    assert_eq!(tx.state, TransactionState::Proceeding);

    let ok = make_response(&invite, StatusCode::OK, Some("t1"));
    tx.tu_sender
        .send(TransactionEvent::Received(ok.into(), None))
        .unwrap();
    let msg = tx.receive().await.unwrap();
    assert_eq!(response_code(&msg), StatusCode::OK);
    assert!(tx.is_terminated());
    assert!(tx.timeout_error().is_none());
}

#[tokio::test]
async fn invite_delivers_a_retransmitted_2xx_after_termination() {
    let endpoint = create_test_endpoint();
    let (conn, mut wire) = wire_pair(5091);
    let invite = make_request(Method::Invite, "z9hG4bKct2", 1);
    let key = TransactionKey::from_request(&invite, TransactionRole::Client).unwrap();
    let mut tx = Transaction::new_client(key, invite.clone(), endpoint.inner.clone(), Some(conn.into()));
    tx.send().await.unwrap();
    wire.recv().await.unwrap();

    let ok = make_response(&invite, StatusCode::OK, Some("t1"));
    tx.tu_sender
        .send(TransactionEvent::Received(ok.clone().into(), None))
        .unwrap();
    tx.tu_sender
        .send(TransactionEvent::Received(ok.into(), None))
        .unwrap();

    // The transaction terminates on the first 2xx yet both reach the TU.
    let first = tx.receive().await.unwrap();
    assert_eq!(response_code(&first), StatusCode::OK);
    assert!(tx.is_terminated());
    let second = tx.receive().await.unwrap();
    assert_eq!(response_code(&second), StatusCode::OK);
}

#[tokio::test]
async fn invite_failure_is_acked_before_completed() {
    let endpoint = create_test_endpoint();
    let (conn, mut wire) = wire_pair(5092);
    let invite = make_request(Method::Invite, "z9hG4bKct3", 1);
    let key = TransactionKey::from_request(&invite, TransactionRole::Client).unwrap();
    let mut tx = Transaction::new_client(key.clone(), invite.clone(), endpoint.inner.clone(), Some(conn.into()));
    tx.send().await.unwrap();
    wire.recv().await.unwrap();

    let busy = make_response(&invite, StatusCode::BusyHere, Some("t9"));
    tx.tu_sender
        .send(TransactionEvent::Received(busy.clone().into(), None))
        .unwrap();
    let msg = tx.receive().await.unwrap();
    assert_eq!(response_code(&msg), StatusCode::BusyHere);
    assert_eq!(tx.state, TransactionState::Completed);

    let (ack, _) = wire.recv().await.unwrap();
    match ack {
        SipMessage::Request(req) => {
            assert_eq!(req.method, Method::Ack);
            assert_eq!(req.headers.via().unwrap().branch(), Some("z9hG4bKct3"));
            assert_eq!(req.headers.to_header().unwrap().tag(), Some("t9"));
        }
        _ => panic!("expected ACK on the wire"),
    }

    // A retransmitted final is absorbed and answered with the ACK again,
    // then Timer D ends the transaction.
    tx.tu_sender
        .send(TransactionEvent::Received(busy.into(), None))
        .unwrap();
    tx.tu_sender
        .send(TransactionEvent::Timer(TransactionTimer::TimerD(key)))
        .unwrap();
    assert!(tx.receive().await.is_none());
    assert!(tx.is_terminated());
    assert!(tx.timeout_error().is_none());
    let (ack2, _) = wire.recv().await.unwrap();
    assert!(matches!(ack2, SipMessage::Request(ref r) if r.method == Method::Ack));
}

#[tokio::test]
async fn invite_timer_a_retransmits_and_timer_b_times_out() {
    let endpoint = create_test_endpoint();
    let (conn, mut wire) = wire_pair(5093);
    let invite = make_request(Method::Invite, "z9hG4bKct4", 1);
    let key = TransactionKey::from_request(&invite, TransactionRole::Client).unwrap();
    let mut tx = Transaction::new_client(key.clone(), invite, endpoint.inner.clone(), Some(conn.into()));
    tx.send().await.unwrap();
    wire.recv().await.unwrap();

    for _ in 0..3 {
        tx.tu_sender
            .send(TransactionEvent::Timer(TransactionTimer::TimerA(
                key.clone(),
                T1,
            )))
            .unwrap();
    }
    tx.tu_sender
        .send(TransactionEvent::Timer(TransactionTimer::TimerB(key)))
        .unwrap();

    assert!(tx.receive().await.is_none());
    assert!(tx.is_terminated());
    assert!(matches!(
        tx.timeout_error(),
        Some(Error::TransactionTimeout(_))
    ));
    // One retransmission per Timer A firing.
    for _ in 0..3 {
        let (msg, _) = wire.recv().await.unwrap();
        assert!(matches!(msg, SipMessage::Request(ref r) if r.method == Method::Invite));
    }
}

#[tokio::test]
async fn non_invite_runs_trying_proceeding_completed() {
    let endpoint = create_test_endpoint();
    let (conn, mut wire) = wire_pair(5094);
    let register = make_request(Method::Register, "z9hG4bKct5", 1);
    let key = TransactionKey::from_request(&register, TransactionRole::Client).unwrap();
    let mut tx = Transaction::new_client(key.clone(), register.clone(), endpoint.inner.clone(), Some(conn.into()));
    tx.send().await.unwrap();
    wire.recv().await.unwrap();
    assert_eq!(tx.state, TransactionState::Trying);

    // Timer E retransmits while waiting.
    tx.tu_sender
        .send(TransactionEvent::Timer(TransactionTimer::TimerE(
            key.clone(),
            T1,
        )))
        .unwrap();

    let trying = make_response(&register, StatusCode::Trying, None);
    tx.tu_sender
        .send(TransactionEvent::Received(trying.into(), None))
        .unwrap();
    let msg = tx.receive().await.unwrap();
    assert_eq!(response_code(&msg), StatusCode::Trying);
    assert_eq!(tx.state, TransactionState::Proceeding);

    let ok = make_response(&register, StatusCode::OK, Some("t1"));
    tx.tu_sender
        .send(TransactionEvent::Received(ok.into(), None))
        .unwrap();
    let msg = tx.receive().await.unwrap();
    assert_eq!(response_code(&msg), StatusCode::OK);
    assert_eq!(tx.state, TransactionState::Completed);

    tx.tu_sender
        .send(TransactionEvent::Timer(TransactionTimer::TimerK(key)))
        .unwrap();
    assert!(tx.receive().await.is_none());
    assert!(tx.is_terminated());

    // Original send plus the Timer E retransmission.
    let (first, _) = wire.recv().await.unwrap();
    let (second, _) = wire.recv().await.unwrap();
    for msg in [first, second] {
        assert!(matches!(msg, SipMessage::Request(ref r) if r.method == Method::Register));
    }
}

#[tokio::test]
async fn non_invite_timer_f_surfaces_timeout() {
    let endpoint = create_test_endpoint();
    let (conn, mut wire) = wire_pair(5095);
    let options = make_request(Method::Options, "z9hG4bKct6", 1);
    let key = TransactionKey::from_request(&options, TransactionRole::Client).unwrap();
    let mut tx = Transaction::new_client(key.clone(), options, endpoint.inner.clone(), Some(conn.into()));
    tx.send().await.unwrap();
    wire.recv().await.unwrap();

    tx.tu_sender
        .send(TransactionEvent::Timer(TransactionTimer::TimerF(key)))
        .unwrap();
    assert!(tx.receive().await.is_none());
    assert!(matches!(
        tx.timeout_error(),
        Some(Error::TransactionTimeout(_))
    ));
}

#[tokio::test]
async fn timer_b_does_not_fire_after_termination() {
    let endpoint = create_test_endpoint();
    let (conn, mut wire) = wire_pair(5096);
    let invite = make_request(Method::Invite, "z9hG4bKct7", 1);
    let key = TransactionKey::from_request(&invite, TransactionRole::Client).unwrap();
    let mut tx = Transaction::new_client(key.clone(), invite.clone(), endpoint.inner.clone(), Some(conn.into()));
    tx.send().await.unwrap();
    wire.recv().await.unwrap();

    let ok = make_response(&invite, StatusCode::OK, Some("t1"));
    tx.tu_sender
        .send(TransactionEvent::Received(ok.into(), None))
        .unwrap();
    tx.receive().await.unwrap();
    assert!(tx.is_terminated());

    // A straggling Timer B is a no-op on a terminated transaction.
    tx.tu_sender
        .send(TransactionEvent::Timer(TransactionTimer::TimerB(key)))
        .unwrap();
    let outcome = tokio::time::timeout(Duration::from_millis(50), tx.receive()).await;
    assert!(outcome.is_err(), "terminated transaction produced an event");
    assert!(tx.timeout_error().is_none());
}
