use crate::config::Capability;
use crate::node::connection::ConnectionInfo;
use crate::node::connection::ConnectionKey;
use diameter_codec::Message;

/// Receives every decoded non-base application message that passed loop
/// detection and application filtering.
///
/// Returning `false` declines the message; the node then answers
/// requests with UNABLE_TO_DELIVER on the caller's behalf.
///
/// Implementations are invoked outside the node's locks and may call
/// back into [`Node::send_message`](crate::Node::send_message).
pub trait MessageDispatcher: Send + Sync {
    fn dispatch(&self, message: Message, key: ConnectionKey) -> bool;
}

/// A dispatcher that declines everything. Useful for nodes that only
/// ever originate requests.
pub struct NullDispatcher;

impl MessageDispatcher for NullDispatcher {
    fn dispatch(&self, message: Message, key: ConnectionKey) -> bool {
        tracing::debug!(
            code = message.header.code,
            %key,
            "No dispatcher configured; declining message"
        );
        false
    }
}

/// Up/down notifications for peer connections.
///
/// `connection_up` fires when a connection reaches ready;
/// `connection_down` fires exactly once when such a connection closes.
/// Connections that never complete the capabilities exchange come and
/// go without the listener hearing about them.
pub trait ConnectionListener: Send + Sync {
    fn connection_up(&self, info: &ConnectionInfo);
    fn connection_down(&self, info: &ConnectionInfo);
}

/// A listener that only logs.
pub struct NullListener;

impl ConnectionListener for NullListener {
    fn connection_up(&self, info: &ConnectionInfo) {
        tracing::info!(key = %info.key, host_id = ?info.host_id, "Peer connection up");
    }

    fn connection_down(&self, info: &ConnectionInfo) {
        tracing::info!(key = %info.key, host_id = ?info.host_id, "Peer connection down");
    }
}

/// Authenticates peers by origin-host and narrows the negotiated
/// capabilities during the capabilities exchange.
///
/// Called while the node holds its registry lock, so implementations
/// must decide from their own data and must not call back into the
/// node.
pub trait NodeValidator: Send + Sync {
    /// `Err` carries the Result-Code to put in the rejecting CEA;
    /// [`diameter_codec::RESULT_UNKNOWN_PEER`] is the conventional
    /// choice.
    fn authenticate_node(&self, host_id: &str, cer: &Message) -> Result<(), u32>;

    /// Derives the capabilities to operate with from our settings and
    /// what the peer reported. Returning an empty capability rejects
    /// the peer with NO_COMMON_APPLICATION.
    fn authorize_node(&self, host_id: &str, ours: &Capability, reported: &Capability)
        -> Capability;
}

/// Accepts every peer and intersects capability sets.
pub struct DefaultNodeValidator;

impl NodeValidator for DefaultNodeValidator {
    fn authenticate_node(&self, _host_id: &str, _cer: &Message) -> Result<(), u32> {
        Ok(())
    }

    fn authorize_node(
        &self,
        _host_id: &str,
        ours: &Capability,
        reported: &Capability,
    ) -> Capability {
        Capability::intersect(ours, reported)
    }
}
