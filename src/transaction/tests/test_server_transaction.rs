use super::*;
use crate::message::{Method, SipMessage, StatusCode};
use crate::transaction::key::{TransactionKey, TransactionRole};
use crate::transaction::transaction::{Transaction, TransactionEvent};
use crate::transaction::{TransactionState, TransactionTimer, TransactionType, T1};
use crate::Error;
use std::time::Duration;

fn new_server_tx(
    endpoint: &crate::transaction::endpoint::Endpoint,
    request: &crate::message::Request,
    conn: crate::transport::channel::ChannelConnection,
) -> Transaction {
    let key = TransactionKey::from_request(request, TransactionRole::Server).unwrap();
    let mut tx = Transaction::new_server(
        key,
        request.clone(),
        endpoint.inner.clone(),
        Some(conn.into()),
    );
    tx.destination = Some(test_addr(5071));
    tx
}

fn sent_status(msg: &SipMessage) -> StatusCode {
    match msg {
        SipMessage::Response(resp) => resp.status_code,
        _ => panic!("expected response"),
    }
}

#[tokio::test]
async fn server_invite_starts_proceeding_and_2xx_terminates() {
    let endpoint = create_test_endpoint();
    let (conn, mut wire) = wire_pair(5080);
    let invite = make_request(Method::Invite, "z9hG4bKst1", 1);
    let mut tx = new_server_tx(&endpoint, &invite, conn);
    assert_eq!(tx.transaction_type, TransactionType::ServerInvite);
    assert_eq!(tx.state, TransactionState::Proceeding);

    tx.reply(StatusCode::Ringing).await.unwrap();
    let (msg, _) = wire.recv().await.unwrap();
    assert_eq!(sent_status(&msg), StatusCode::Ringing);
    assert_eq!(tx.state, TransactionState::Proceeding);

    tx.reply_with(StatusCode::OK, vec![], Some(b"v=0".to_vec()))
        .await
        .unwrap();
    let (msg, _) = wire.recv().await.unwrap();
    assert_eq!(sent_status(&msg), StatusCode::OK);
    match msg {
        SipMessage::Response(resp) => {
            // Finals get a To-tag when the request had none.
            assert!(resp.headers.to_header().unwrap().tag().is_some());
            assert_eq!(resp.body, b"v=0");
        }
        _ => unreachable!(),
    }
    // 2xx retransmission is the TU's job from here.
    assert!(tx.is_terminated());
}

#[tokio::test]
async fn server_invite_failure_retransmits_until_ack() {
    let endpoint = create_test_endpoint();
    let (conn, mut wire) = wire_pair(5081);
    let invite = make_request(Method::Invite, "z9hG4bKst2", 1);
    let key = TransactionKey::from_request(&invite, TransactionRole::Server).unwrap();
    let mut tx = new_server_tx(&endpoint, &invite, conn);

    tx.reply(StatusCode::BusyHere).await.unwrap();
    assert_eq!(tx.state, TransactionState::Completed);
    let (msg, _) = wire.recv().await.unwrap();
    assert_eq!(sent_status(&msg), StatusCode::BusyHere);

    // Timer G fires: the final is retransmitted.
    tx.tu_sender
        .send(TransactionEvent::Timer(TransactionTimer::TimerG(
            key.clone(),
            T1,
        )))
        .unwrap();
    // An INVITE retransmission also triggers a replay.
    tx.tu_sender
        .send(TransactionEvent::Received(invite.clone().into(), None))
        .unwrap();
    let outcome = tokio::time::timeout(Duration::from_millis(50), tx.receive()).await;
    assert!(outcome.is_err(), "retransmissions must not reach the TU");
    let (g, _) = wire.recv().await.unwrap();
    let (replay, _) = wire.recv().await.unwrap();
    assert_eq!(sent_status(&g), StatusCode::BusyHere);
    assert_eq!(sent_status(&replay), StatusCode::BusyHere);

    // ACK confirms; Timer I then terminates.
    let ack = make_request(Method::Ack, "z9hG4bKst2", 1);
    tx.tu_sender
        .send(TransactionEvent::Received(ack.into(), None))
        .unwrap();
    tx.tu_sender
        .send(TransactionEvent::Timer(TransactionTimer::TimerI(key)))
        .unwrap();
    assert!(tx.receive().await.is_none());
    assert!(tx.is_terminated());
    assert!(tx.timeout_error().is_none());
}

#[tokio::test]
async fn server_invite_times_out_without_ack() {
    let endpoint = create_test_endpoint();
    let (conn, mut wire) = wire_pair(5082);
    let invite = make_request(Method::Invite, "z9hG4bKst3", 1);
    let key = TransactionKey::from_request(&invite, TransactionRole::Server).unwrap();
    let mut tx = new_server_tx(&endpoint, &invite, conn);

    tx.reply(StatusCode::Decline).await.unwrap();
    wire.recv().await.unwrap();

    tx.tu_sender
        .send(TransactionEvent::Timer(TransactionTimer::TimerH(key)))
        .unwrap();
    assert!(tx.receive().await.is_none());
    assert!(matches!(
        tx.timeout_error(),
        Some(Error::TransactionTimeout(_))
    ));
}

#[tokio::test]
async fn server_invite_emits_100_when_tu_is_slow() {
    let endpoint = create_test_endpoint();
    let (conn, mut wire) = wire_pair(5083);
    let invite = make_request(Method::Invite, "z9hG4bKst4", 1);
    let key = TransactionKey::from_request(&invite, TransactionRole::Server).unwrap();
    let mut tx = new_server_tx(&endpoint, &invite, conn);

    tx.tu_sender
        .send(TransactionEvent::Timer(TransactionTimer::TimerProvision(
            key,
        )))
        .unwrap();
    let outcome = tokio::time::timeout(Duration::from_millis(50), tx.receive()).await;
    assert!(outcome.is_err());
    let (msg, _) = wire.recv().await.unwrap();
    assert_eq!(sent_status(&msg), StatusCode::Trying);
    assert_eq!(tx.state, TransactionState::Proceeding);
}

#[tokio::test]
async fn server_invite_hands_cancel_to_the_tu() {
    let endpoint = create_test_endpoint();
    let (conn, _wire) = wire_pair(5084);
    let invite = make_request(Method::Invite, "z9hG4bKst5", 1);
    let mut tx = new_server_tx(&endpoint, &invite, conn);

    let cancel = make_request(Method::Cancel, "z9hG4bKst5", 1);
    tx.tu_sender
        .send(TransactionEvent::Received(cancel.into(), None))
        .unwrap();
    match tx.receive().await {
        Some(SipMessage::Request(req)) => assert_eq!(req.method, Method::Cancel),
        other => panic!("expected the CANCEL, got {:?}", other.is_some()),
    }
    // The INVITE machine itself has not moved.
    assert_eq!(tx.state, TransactionState::Proceeding);
}

#[tokio::test]
async fn server_non_invite_replays_and_times_out_on_j() {
    let endpoint = create_test_endpoint();
    let (conn, mut wire) = wire_pair(5085);
    let register = make_request(Method::Register, "z9hG4bKst6", 1);
    let key = TransactionKey::from_request(&register, TransactionRole::Server).unwrap();
    let mut tx = new_server_tx(&endpoint, &register, conn);
    assert_eq!(tx.transaction_type, TransactionType::ServerNonInvite);
    assert_eq!(tx.state, TransactionState::Trying);

    tx.reply(StatusCode::Trying).await.unwrap();
    assert_eq!(tx.state, TransactionState::Proceeding);
    wire.recv().await.unwrap();

    tx.reply(StatusCode::OK).await.unwrap();
    assert_eq!(tx.state, TransactionState::Completed);
    wire.recv().await.unwrap();

    // A request retransmission replays the final.
    tx.tu_sender
        .send(TransactionEvent::Received(register.clone().into(), None))
        .unwrap();
    tx.tu_sender
        .send(TransactionEvent::Timer(TransactionTimer::TimerJ(key)))
        .unwrap();
    assert!(tx.receive().await.is_none());
    assert!(tx.is_terminated());
    let (replayed, _) = wire.recv().await.unwrap();
    assert_eq!(sent_status(&replayed), StatusCode::OK);
}

#[tokio::test]
async fn respond_rejects_illegal_transitions() {
    let endpoint = create_test_endpoint();
    let (conn, mut wire) = wire_pair(5086);
    let register = make_request(Method::Register, "z9hG4bKst7", 1);
    let mut tx = new_server_tx(&endpoint, &register, conn);

    tx.reply(StatusCode::OK).await.unwrap();
    wire.recv().await.unwrap();
    assert_eq!(tx.state, TransactionState::Completed);

    // A provisional after the final is a protocol error.
    assert!(tx.reply(StatusCode::Trying).await.is_err());
}
