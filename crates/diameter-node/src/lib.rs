//! An RFC 3588 Diameter base-protocol peer node.
//!
//! The node establishes, maintains and tears down transport connections
//! to remote Diameter peers, runs the capabilities-exchange handshake
//! and the device-watchdog keepalive, routes application messages to a
//! [`MessageDispatcher`], and enforces the peer-routing invariants of
//! the base protocol: loop detection, application-id filtering, and
//! election on duplicate connections.
//!
//! Message encoding lives in [`diameter_codec`]; routing across realms,
//! retransmission and request/answer correlation are for layers above
//! this one.

mod networking;

pub mod config;
pub mod node;

pub use config::Capability;
pub use config::JitterPrng;
pub use config::NodeSettings;
pub use config::Peer;
pub use config::TransportKind;
pub use config::TransportPolicy;
pub use diameter_codec;
pub use node::connection::ConnectionInfo;
pub use node::connection::ConnectionKey;
pub use node::connection::ConnectionState;
pub use node::engine::VENDOR_3GPP;
pub use node::events::ConnectionListener;
pub use node::events::DefaultNodeValidator;
pub use node::events::MessageDispatcher;
pub use node::events::NodeValidator;
pub use node::events::NullDispatcher;
pub use node::events::NullListener;
pub use node::Node;
pub use node::NodeError;
pub use node::RunningNode;

#[cfg(test)]
mod tests;
