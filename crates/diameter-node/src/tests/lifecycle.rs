use crate::config::NodeSettings;
use crate::config::Peer;
use crate::config::TransportKind;
use crate::node::connection::ConnectionState;
use crate::node::events::DefaultNodeValidator;
use crate::node::events::NullDispatcher;
use crate::node::events::NullListener;
use crate::node::Node;
use crate::node::NodeError;
use crate::tests::result_code;
use crate::tests::RawPeer;
use crate::tests::TestNode;
use crate::tests::TEST_APP;
use crate::tests::TEST_REALM;
use diameter_codec::Avp;
use diameter_codec::Message;
use diameter_codec::AVP_DISCONNECT_CAUSE;
use diameter_codec::AVP_ORIGIN_HOST;
use diameter_codec::AVP_ORIGIN_REALM;
use diameter_codec::AVP_RESULT_CODE;
use diameter_codec::CMD_DISCONNECT_PEER;
use diameter_codec::DISCONNECT_CAUSE_REBOOTING;
use diameter_codec::RESULT_SUCCESS;
use diameter_codec::RESULT_UNABLE_TO_DELIVER;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Graceful shutdown: the peer sees a DPR with cause REBOOTING, answers
/// it, and only then does the socket close; well within the deadline.
#[tokio::test(flavor = "multi_thread")]
async fn graceful_stop_sends_dpr_and_waits_for_dpa() {
    let mut node = TestNode::start("a.example", |_| {});
    let mut peer = RawPeer::handshake(node.port(), "b.example").await;
    let up = node.expect_up().await;

    let started = Instant::now();
    let stop = node.node.stop(Duration::from_secs(2));
    let peer_side = async {
        let dpr = peer.recv().await;
        assert_eq!(dpr.header.code, CMD_DISCONNECT_PEER);
        assert!(dpr.is_request());
        let cause = dpr
            .find_avp(AVP_DISCONNECT_CAUSE)
            .and_then(|avp| avp.as_u32().ok());
        assert_eq!(cause, Some(DISCONNECT_CAUSE_REBOOTING));

        let mut dpa = Message::answer(&dpr);
        dpa.add(Avp::new_u32(AVP_RESULT_CODE, RESULT_SUCCESS));
        dpa.add(Avp::new_string(AVP_ORIGIN_HOST, "b.example"));
        dpa.add(Avp::new_string(AVP_ORIGIN_REALM, TEST_REALM));
        peer.send(&dpa).await;
        peer.expect_closed(Duration::from_secs(2)).await;
    };
    tokio::join!(stop, peer_side);

    assert!(
        started.elapsed() < Duration::from_millis(1900),
        "stop must not ride out the whole grace period when the peer answers"
    );
    node.expect_down().await;
    assert_eq!(
        node.node.send_message(up.key, Message::request(999, TEST_APP)),
        Err(NodeError::StaleConnection)
    );
    assert_eq!(
        node.node.wait_for_connection().await,
        Err(NodeError::NotRunning)
    );
}

/// The deadline is a hard stop: a peer that never answers the DPR gets
/// cut off when the grace period ends.
#[tokio::test(flavor = "multi_thread")]
async fn stop_does_not_wait_for_a_missing_dpa() {
    let mut node = TestNode::start("a.example", |_| {});
    let mut peer = RawPeer::handshake(node.port(), "b.example").await;
    node.expect_up().await;

    let started = Instant::now();
    let stop = node.node.stop(Duration::from_secs(1));
    let peer_side = async {
        let dpr = peer.recv().await;
        assert_eq!(dpr.header.code, CMD_DISCONNECT_PEER);
        // No DPA; the node must cut us off at the deadline.
        peer.expect_closed(Duration::from_secs(4)).await;
    };
    tokio::join!(stop, peer_side);

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(950), "stopped before the deadline: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(3000), "stop overran the deadline: {elapsed:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn two_nodes_exchange_messages() {
    let mut b = TestNode::start("b.example", |_| {});
    let mut a = TestNode::start("a.example", |_| {});

    let peer = Peer::new("127.0.0.1", b.port());
    assert!(a.node.connect_to_peer(peer.clone(), false).unwrap());
    a.node
        .wait_for_connection_timeout(Duration::from_secs(5))
        .await
        .unwrap();
    b.node
        .wait_for_connection_timeout(Duration::from_secs(5))
        .await
        .unwrap();
    let a_up = a.expect_up().await;
    assert_eq!(a_up.host_id.as_deref(), Some("b.example"));
    b.expect_up().await;

    // Initiating again is a no-op while the connection lives.
    assert!(a.node.connect_to_peer(peer.clone(), false).unwrap());
    assert_eq!(a.node.list_ready_peers().len(), 1);

    let key = a.node.find_connection(&peer).expect("ready connection");
    let mut request = Message::request(999, TEST_APP);
    request.add(Avp::new_string(AVP_ORIGIN_HOST, "a.example"));
    request.add(Avp::new_string(AVP_ORIGIN_REALM, TEST_REALM));
    request.add(Avp::new_u32(diameter_codec::AVP_AUTH_APPLICATION_ID, TEST_APP));
    a.node.send_message(key, request).unwrap();

    let (received, _) = b.dispatched.recv().await.expect("request reaches B");
    assert_eq!(received.header.code, 999);
    assert!(received.is_request());

    // B's dispatcher declined, so A gets UNABLE_TO_DELIVER back, which
    // is dispatched on A's side as a plain answer.
    let (answer, answer_key) = a.dispatched.recv().await.expect("answer reaches A");
    assert_eq!(answer.header.code, 999);
    assert_eq!(result_code(&answer), Some(RESULT_UNABLE_TO_DELIVER));
    assert_eq!(answer_key, key);
}

/// A persistent peer that is down when first dialed comes up later and
/// the reconnect worker picks it up.
#[tokio::test(flavor = "multi_thread")]
async fn persistent_peer_is_reconnected() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let mut a = TestNode::start("a.example", |_| {});
    a.node
        .connect_to_peer(Peer::new("127.0.0.1", port), true)
        .unwrap();

    // Nobody listens yet; the first attempt fails. Boot the peer node
    // on the reserved port and let the worker catch up.
    let mut b = TestNode::start("b.example", |settings| settings.listen_port = port);
    a.node
        .wait_for_connection_timeout(Duration::from_secs(20))
        .await
        .unwrap();
    let up = a.expect_up().await;
    assert_eq!(up.host_id.as_deref(), Some("b.example"));
    b.expect_up().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn start_is_refused_while_running() {
    let node = TestNode::start("a.example", |_| {});

    let err = node.node.start().unwrap_err();
    assert_eq!(
        err.downcast_ref::<NodeError>(),
        Some(&NodeError::AlreadyRunning)
    );
}

#[test]
fn invalid_settings_surface_as_a_typed_error() {
    // No dot in the host-id, so validation fails.
    let settings = NodeSettings::new("localhost", "example.net");

    let err = Node::new(
        settings,
        Arc::new(NullDispatcher),
        Arc::new(NullListener),
        Arc::new(DefaultNodeValidator),
    )
    .unwrap_err();

    assert!(matches!(
        err.downcast_ref::<NodeError>(),
        Some(NodeError::InvalidSettings(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn node_restarts_after_stop() {
    let mut node = TestNode::start("a.example", |_| {});
    node.node.stop(Duration::from_millis(100)).await;
    node.running = None;

    let running = node.node.start().expect("restart");
    node.running = Some(running);
    assert!(node.node.listen_addr(TransportKind::Tcp).is_some());
    node.node.stop(Duration::from_millis(100)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn wait_for_connection_times_out() {
    let node = TestNode::start("a.example", |_| {});

    let result = node
        .node
        .wait_for_connection_timeout(Duration::from_millis(200))
        .await;

    assert_eq!(result, Err(NodeError::WaitTimeout));
}

/// Closing the same connection twice notifies the listener exactly
/// once.
#[tokio::test(flavor = "multi_thread")]
async fn close_is_idempotent() {
    let mut node = TestNode::start("a.example", |_| {});
    let inner = node.node.inner.clone();
    let key = {
        let mut reg = inner.registry.lock();
        let (key, _outbound_rx, _control_rx) =
            inner.new_connection(ConnectionState::ConnectedIn, TransportKind::Tcp, &mut reg);
        let conn = reg.get_mut(key).unwrap();
        conn.state = ConnectionState::Ready;
        conn.announced_up = true;
        conn.host_id = Some("b.example".to_string());
        key
    };

    inner.connection_closed(key);
    inner.connection_closed(key);

    let down = node.expect_down().await;
    assert_eq!(down.host_id.as_deref(), Some("b.example"));
    assert!(node.events.try_recv().is_err(), "down must fire exactly once");
    assert!(!node.node.is_valid_connection(key));
}

#[tokio::test(flavor = "multi_thread")]
async fn session_ids_are_prefixed_and_unique() {
    let node = TestNode::start("a.example", |_| {});

    let first = node.node.make_new_session_id(None);
    let second = node.node.make_new_session_id(Some("app"));

    assert!(first.starts_with("a.example;"));
    assert_ne!(first, second);
    assert!(second.ends_with(";app"));
}
