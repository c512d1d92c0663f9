use crate::config::NodeSettings;
use crate::config::TransportKind;
use crate::config::TransportPolicy;
use crate::node::connection::ConnectionInfo;
use crate::node::connection::ConnectionKey;
use crate::node::events::ConnectionListener;
use crate::node::events::DefaultNodeValidator;
use crate::node::events::MessageDispatcher;
use crate::node::Node;
use crate::node::RunningNode;
use diameter_codec::Avp;
use diameter_codec::Message;
use diameter_codec::APP_COMMON;
use diameter_codec::AVP_AUTH_APPLICATION_ID;
use diameter_codec::AVP_ORIGIN_HOST;
use diameter_codec::AVP_ORIGIN_REALM;
use diameter_codec::AVP_RESULT_CODE;
use diameter_codec::CMD_CAPABILITIES_EXCHANGE;
use diameter_codec::RESULT_SUCCESS;
use std::sync::Arc;
use std::sync::Once;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

#[cfg(feature = "transport-tcp")]
mod lifecycle;
#[cfg(feature = "transport-tcp")]
mod watchdog;

/// The auth application every test node advertises.
pub(crate) const TEST_APP: u32 = 4;

pub(crate) const TEST_REALM: &str = "example.net";

fn init_tracing() {
    static TRACING_TEST_SUBSCRIBER: Once = Once::new();

    TRACING_TEST_SUBSCRIBER.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_test_writer()
            .init()
    })
}

#[derive(Debug)]
pub(crate) enum TestEvent {
    Up(ConnectionInfo),
    Down(ConnectionInfo),
}

struct RecordingListener {
    tx: mpsc::UnboundedSender<TestEvent>,
}

impl ConnectionListener for RecordingListener {
    fn connection_up(&self, info: &ConnectionInfo) {
        let _ = self.tx.send(TestEvent::Up(info.clone()));
    }

    fn connection_down(&self, info: &ConnectionInfo) {
        let _ = self.tx.send(TestEvent::Down(info.clone()));
    }
}

/// Records everything it is handed and declines requests, so tests can
/// observe both the dispatch path and the UNABLE_TO_DELIVER fallback.
struct RecordingDispatcher {
    tx: mpsc::UnboundedSender<(Message, ConnectionKey)>,
}

impl MessageDispatcher for RecordingDispatcher {
    fn dispatch(&self, message: Message, key: ConnectionKey) -> bool {
        let _ = self.tx.send((message, key));
        false
    }
}

pub(crate) struct TestNode {
    pub node: Node,
    pub running: Option<RunningNode>,
    pub events: mpsc::UnboundedReceiver<TestEvent>,
    pub dispatched: mpsc::UnboundedReceiver<(Message, ConnectionKey)>,
}

impl TestNode {
    pub(crate) fn start(host_id: &str, tweak: impl FnOnce(&mut NodeSettings)) -> Self {
        init_tracing();
        let mut settings = NodeSettings::new(host_id, TEST_REALM);
        settings.listen_port = 0;
        settings.use_sctp = TransportPolicy::Disabled;
        settings.capabilities.auth_apps.insert(TEST_APP);
        tweak(&mut settings);
        let (event_tx, events) = mpsc::unbounded_channel();
        let (dispatch_tx, dispatched) = mpsc::unbounded_channel();
        let node = Node::new_unvalidated(
            settings,
            Arc::new(RecordingDispatcher { tx: dispatch_tx }),
            Arc::new(RecordingListener { tx: event_tx }),
            Arc::new(DefaultNodeValidator),
        );
        let running = node.start().expect("node starts");
        TestNode {
            node,
            running: Some(running),
            events,
            dispatched,
        }
    }

    pub(crate) fn port(&self) -> u16 {
        self.node
            .listen_addr(TransportKind::Tcp)
            .expect("tcp driver is listening")
            .port()
    }

    pub(crate) async fn expect_up(&mut self) -> ConnectionInfo {
        match tokio::time::timeout(Duration::from_secs(5), self.events.recv()).await {
            Ok(Some(TestEvent::Up(info))) => info,
            other => panic!("expected an up event, got {other:?}"),
        }
    }

    pub(crate) async fn expect_down(&mut self) -> ConnectionInfo {
        match tokio::time::timeout(Duration::from_secs(8), self.events.recv()).await {
            Ok(Some(TestEvent::Down(info))) => info,
            other => panic!("expected a down event, got {other:?}"),
        }
    }

    pub(crate) async fn expect_event(&mut self) -> TestEvent {
        match tokio::time::timeout(Duration::from_secs(8), self.events.recv()).await {
            Ok(Some(event)) => event,
            other => panic!("expected an event, got {other:?}"),
        }
    }
}

/// A hand-driven remote peer speaking raw frames over a socket; lets
/// the scenarios control exactly what goes onto the wire.
pub(crate) struct RawPeer {
    stream: TcpStream,
}

impl RawPeer {
    pub(crate) async fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port))
            .await
            .expect("connect to node");
        RawPeer { stream }
    }

    /// Connects and completes a capabilities exchange as `host_id`.
    pub(crate) async fn handshake(port: u16, host_id: &str) -> Self {
        let mut peer = Self::connect(port).await;
        peer.send(&cer(host_id)).await;
        let cea = peer.recv().await;
        assert_eq!(result_code(&cea), Some(RESULT_SUCCESS), "handshake CEA");
        peer
    }

    pub(crate) async fn send(&mut self, message: &Message) {
        self.stream
            .write_all(&message.encode())
            .await
            .expect("write frame");
    }

    pub(crate) async fn recv(&mut self) -> Message {
        match self.try_recv(Duration::from_secs(8)).await {
            Some(message) => message,
            None => panic!("peer socket closed while expecting a frame"),
        }
    }

    /// `None` means the connection was closed.
    pub(crate) async fn try_recv(&mut self, limit: Duration) -> Option<Message> {
        let frame = tokio::time::timeout(limit, async {
            let mut prefix = [0u8; 4];
            if self.stream.read_exact(&mut prefix).await.is_err() {
                return None;
            }
            let length = Message::read_length(prefix).expect("valid frame prefix");
            let mut frame = vec![0u8; length];
            frame[..4].copy_from_slice(&prefix);
            self.stream.read_exact(&mut frame[4..]).await.ok()?;
            Some(frame)
        })
        .await
        .expect("timed out waiting for a frame");
        frame.map(|frame| Message::decode(&frame).expect("valid frame"))
    }

    /// Waits for the node to close the socket, tolerating frames that
    /// are still in flight.
    pub(crate) async fn expect_closed(&mut self, limit: Duration) {
        let mut buf = [0u8; 512];
        tokio::time::timeout(limit, async {
            loop {
                match self.stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await
        .expect("timed out waiting for the node to close the connection");
    }

    /// Like [`RawPeer::expect_closed`] but fails on any byte received.
    pub(crate) async fn expect_closed_silently(&mut self, limit: Duration) {
        let mut buf = [0u8; 512];
        tokio::time::timeout(limit, async {
            match self.stream.read(&mut buf).await {
                Ok(0) | Err(_) => {}
                Ok(n) => panic!("expected silence, received {n} bytes"),
            }
        })
        .await
        .expect("timed out waiting for the node to close the connection");
    }
}

/// A minimal valid CER advertising [`TEST_APP`].
pub(crate) fn cer(host_id: &str) -> Message {
    let mut message = Message::request(CMD_CAPABILITIES_EXCHANGE, APP_COMMON);
    message.header.hop_by_hop_id = rand::random();
    message.header.end_to_end_id = rand::random();
    message.add(Avp::new_string(AVP_ORIGIN_HOST, host_id));
    message.add(Avp::new_string(AVP_ORIGIN_REALM, TEST_REALM));
    message.add(Avp::new_u32(AVP_AUTH_APPLICATION_ID, TEST_APP));
    message
}

pub(crate) fn result_code(message: &Message) -> Option<u32> {
    message
        .find_avp(AVP_RESULT_CODE)
        .and_then(|avp| avp.as_u32().ok())
}

pub(crate) fn origin_host(message: &Message) -> Option<String> {
    message
        .find_avp(AVP_ORIGIN_HOST)
        .and_then(|avp| avp.as_str().ok())
        .map(str::to_string)
}
