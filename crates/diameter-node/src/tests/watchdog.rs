use crate::tests::result_code;
use crate::tests::RawPeer;
use crate::tests::TestNode;
use crate::tests::TEST_REALM;
use diameter_codec::Avp;
use diameter_codec::Message;
use diameter_codec::APP_COMMON;
use diameter_codec::AVP_ORIGIN_HOST;
use diameter_codec::AVP_ORIGIN_REALM;
use diameter_codec::CMD_DEVICE_WATCHDOG;
use diameter_codec::CMD_DISCONNECT_PEER;
use diameter_codec::RESULT_SUCCESS;
use std::time::Duration;
use tokio::time::Instant;

fn dwa(dwr: &Message) -> Message {
    let mut answer = Message::answer(dwr);
    answer.add(Avp::new_u32(diameter_codec::AVP_RESULT_CODE, RESULT_SUCCESS));
    answer.add(Avp::new_string(AVP_ORIGIN_HOST, "b.example"));
    answer.add(Avp::new_string(AVP_ORIGIN_REALM, TEST_REALM));
    answer
}

/// A peer that goes silent is hard-closed without a DPR once its DWR
/// goes unanswered for a watchdog interval.
#[tokio::test(flavor = "multi_thread")]
async fn silent_peer_is_disconnected_without_dpr() {
    let mut node = TestNode::start("a.example", |settings| {
        settings.watchdog_interval = Duration::from_secs(1);
    });
    let mut peer = RawPeer::handshake(node.port(), "b.example").await;
    node.expect_up().await;

    // Jitter is ±2 s, so the first DWR can take a moment.
    let dwr = peer.recv().await;
    assert_eq!(dwr.header.code, CMD_DEVICE_WATCHDOG);
    assert!(dwr.is_request());

    // Stay silent. The node must give up within one further interval
    // and must not attempt a graceful disconnect.
    let started = Instant::now();
    loop {
        match peer.try_recv(Duration::from_secs(4)).await {
            None => break,
            Some(frame) => {
                assert_ne!(
                    frame.header.code, CMD_DISCONNECT_PEER,
                    "watchdog failure must not send a DPR"
                );
            }
        }
    }
    assert!(started.elapsed() < Duration::from_secs(4));
    node.expect_down().await;
}

/// No DWR may be emitted before the capabilities exchange completes.
#[tokio::test(flavor = "multi_thread")]
async fn no_dwr_before_ready() {
    let node = TestNode::start("a.example", |settings| {
        settings.watchdog_interval = Duration::from_secs(1);
    });
    let mut peer = RawPeer::connect(node.port()).await;

    // The node closes the connection when no CER arrives in time,
    // without ever writing a frame.
    peer.expect_closed_silently(Duration::from_secs(4)).await;
}

/// Answered watchdogs keep an otherwise idle connection alive.
#[tokio::test(flavor = "multi_thread")]
async fn answered_watchdogs_keep_the_connection_up() {
    let mut node = TestNode::start("a.example", |settings| {
        settings.watchdog_interval = Duration::from_secs(1);
    });
    let mut peer = RawPeer::handshake(node.port(), "b.example").await;
    node.expect_up().await;

    let deadline = Instant::now() + Duration::from_millis(3500);
    while Instant::now() < deadline {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, peer.recv()).await {
            Ok(dwr) => {
                assert_eq!(dwr.header.code, CMD_DEVICE_WATCHDOG);
                peer.send(&dwa(&dwr)).await;
            }
            Err(_) => break,
        }
    }

    // Still alive: our own DWR gets answered.
    let mut dwr = Message::request(CMD_DEVICE_WATCHDOG, APP_COMMON);
    dwr.add(Avp::new_string(AVP_ORIGIN_HOST, "b.example"));
    dwr.add(Avp::new_string(AVP_ORIGIN_REALM, TEST_REALM));
    peer.send(&dwr).await;
    loop {
        let frame = peer.recv().await;
        if !frame.is_request() {
            assert_eq!(frame.header.code, CMD_DEVICE_WATCHDOG);
            assert_eq!(result_code(&frame), Some(RESULT_SUCCESS));
            break;
        }
        // A DWR of the node's own crossing ours; answer and go on.
        peer.send(&dwa(&frame)).await;
    }
}
