use super::*;
use crate::message::{Method, SipMessage, StatusCode};
use crate::transaction::TransactionType;
use std::time::Duration;

#[tokio::test]
async fn new_invite_becomes_a_server_transaction() {
    let endpoint = create_test_endpoint();
    let mut incoming = endpoint.incoming_transactions();
    let (conn, _wire) = wire_pair(5060);
    let invite = make_request(Method::Invite, "z9hG4bKep1", 1);

    endpoint
        .inner
        .on_received_message(invite.into(), conn.into(), test_addr(5061))
        .await
        .unwrap();

    let tx = incoming.recv().await.unwrap();
    assert_eq!(tx.transaction_type, TransactionType::ServerInvite);
    assert_eq!(tx.destination, Some(test_addr(5061)));
}

#[tokio::test]
async fn retransmitted_request_reaches_the_existing_transaction() {
    let endpoint = create_test_endpoint();
    let mut incoming = endpoint.incoming_transactions();
    let (conn, _wire) = wire_pair(5062);
    let invite = make_request(Method::Invite, "z9hG4bKep2", 1);

    let conn2 = conn.clone();
    endpoint
        .inner
        .on_received_message(invite.clone().into(), conn.into(), test_addr(5061))
        .await
        .unwrap();
    let mut tx = incoming.recv().await.unwrap();

    // Same branch again: routed to the existing transaction, not a new one.
    endpoint
        .inner
        .on_received_message(invite.into(), conn2.into(), test_addr(5061))
        .await
        .unwrap();
    assert!(
        tokio::time::timeout(Duration::from_millis(50), incoming.recv())
            .await
            .is_err(),
        "retransmission must not create a second transaction"
    );
    // The retransmission is absorbed inside the transaction.
    assert!(
        tokio::time::timeout(Duration::from_millis(50), tx.receive())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn cancel_without_invite_gets_481_statelessly() {
    let endpoint = create_test_endpoint();
    let _incoming = endpoint.incoming_transactions();
    let (conn, mut wire) = wire_pair(5063);
    let cancel = make_request(Method::Cancel, "z9hG4bKep3", 1);

    endpoint
        .inner
        .on_received_message(cancel.into(), conn.into(), test_addr(5061))
        .await
        .unwrap();

    let (msg, _) = wire.recv().await.unwrap();
    match msg {
        SipMessage::Response(resp) => {
            assert_eq!(resp.status_code, StatusCode::CallTransactionDoesNotExist)
        }
        _ => panic!("expected a 481"),
    }
}

#[tokio::test]
async fn cancel_reaches_both_its_own_and_the_invite_transaction() {
    let endpoint = create_test_endpoint();
    let mut incoming = endpoint.incoming_transactions();
    let (conn, _wire) = wire_pair(5064);
    let invite = make_request(Method::Invite, "z9hG4bKep4", 1);
    let cancel = make_request(Method::Cancel, "z9hG4bKep4", 1);

    let conn2 = conn.clone();
    endpoint
        .inner
        .on_received_message(invite.into(), conn.into(), test_addr(5061))
        .await
        .unwrap();
    let mut invite_tx = incoming.recv().await.unwrap();

    endpoint
        .inner
        .on_received_message(cancel.into(), conn2.into(), test_addr(5061))
        .await
        .unwrap();

    // The CANCEL arrives as its own server transaction.
    let cancel_tx = incoming.recv().await.unwrap();
    assert_eq!(cancel_tx.transaction_type, TransactionType::ServerNonInvite);
    assert_eq!(cancel_tx.original.method, Method::Cancel);

    // And the INVITE transaction is told about it.
    match invite_tx.receive().await {
        Some(SipMessage::Request(req)) => assert_eq!(req.method, Method::Cancel),
        other => panic!("expected the CANCEL, got {:?}", other.is_some()),
    }
}

#[tokio::test]
async fn response_without_transaction_is_dropped() {
    let endpoint = create_test_endpoint();
    let _incoming = endpoint.incoming_transactions();
    let (conn, mut wire) = wire_pair(5065);
    let invite = make_request(Method::Invite, "z9hG4bKep5", 1);
    let stray = make_response(&invite, StatusCode::OK, Some("t1"));

    endpoint
        .inner
        .on_received_message(stray.into(), conn.into(), test_addr(5061))
        .await
        .unwrap();
    assert!(
        tokio::time::timeout(Duration::from_millis(50), wire.recv())
            .await
            .is_err(),
        "a stray response must not produce traffic"
    );
}
