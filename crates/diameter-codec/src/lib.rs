//! Encoding and decoding of RFC 3588 Diameter messages.
//!
//! A message is a fixed 20-byte header followed by a sequence of AVPs
//! (attribute-value pairs). The first four bytes of the header double as
//! the frame prefix transports use to delimit messages on a stream:
//! one version byte (always 1) and a 24-bit message length.

use thiserror::Error;

pub mod avp;
pub mod message;

pub use avp::Avp;
pub use message::Message;
pub use message::MessageHeader;

/// Capabilities-Exchange-Request/Answer.
pub const CMD_CAPABILITIES_EXCHANGE: u32 = 257;
/// Device-Watchdog-Request/Answer.
pub const CMD_DEVICE_WATCHDOG: u32 = 280;
/// Disconnect-Peer-Request/Answer.
pub const CMD_DISCONNECT_PEER: u32 = 282;

/// The common (base protocol) application id.
pub const APP_COMMON: u32 = 0;

pub const AVP_HOST_IP_ADDRESS: u32 = 257;
pub const AVP_AUTH_APPLICATION_ID: u32 = 258;
pub const AVP_ACCT_APPLICATION_ID: u32 = 259;
pub const AVP_VENDOR_SPECIFIC_APPLICATION_ID: u32 = 260;
pub const AVP_SESSION_ID: u32 = 263;
pub const AVP_ORIGIN_HOST: u32 = 264;
pub const AVP_SUPPORTED_VENDOR_ID: u32 = 265;
pub const AVP_VENDOR_ID: u32 = 266;
pub const AVP_FIRMWARE_REVISION: u32 = 267;
pub const AVP_RESULT_CODE: u32 = 268;
pub const AVP_PRODUCT_NAME: u32 = 269;
pub const AVP_DISCONNECT_CAUSE: u32 = 273;
pub const AVP_ORIGIN_STATE_ID: u32 = 278;
pub const AVP_FAILED_AVP: u32 = 279;
pub const AVP_ERROR_MESSAGE: u32 = 281;
pub const AVP_ROUTE_RECORD: u32 = 282;
pub const AVP_PROXY_INFO: u32 = 284;
pub const AVP_ORIGIN_REALM: u32 = 296;

pub const RESULT_SUCCESS: u32 = 2001;
pub const RESULT_UNABLE_TO_DELIVER: u32 = 3002;
pub const RESULT_LOOP_DETECTED: u32 = 3005;
pub const RESULT_APPLICATION_UNSUPPORTED: u32 = 3007;
pub const RESULT_UNKNOWN_PEER: u32 = 3010;
pub const RESULT_ELECTION_LOST: u32 = 4003;
pub const RESULT_INVALID_AVP_VALUE: u32 = 5004;
pub const RESULT_MISSING_AVP: u32 = 5005;
pub const RESULT_NO_COMMON_APPLICATION: u32 = 5010;
pub const RESULT_INVALID_AVP_LENGTH: u32 = 5014;

pub const DISCONNECT_CAUSE_REBOOTING: u32 = 0;
pub const DISCONNECT_CAUSE_BUSY: u32 = 1;
pub const DISCONNECT_CAUSE_DO_NOT_WANT_TO_TALK_TO_YOU: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("frame truncated: needed {needed} bytes, had {have}")]
    Truncated { needed: usize, have: usize },
    #[error("unsupported Diameter version {0}")]
    BadVersion(u8),
    #[error("message length field {0} is invalid")]
    BadMessageLength(u32),
    #[error("AVP {code} carries invalid length {length}")]
    BadAvpLength { code: u32, length: u32 },
    #[error("AVP {code} payload is {have} bytes, expected {expected}")]
    WrongWidth {
        code: u32,
        expected: usize,
        have: usize,
    },
    #[error("AVP {code} payload is not valid UTF-8")]
    NotUtf8 { code: u32 },
    #[error("AVP {code} carries unknown address family {family}")]
    BadAddressFamily { code: u32, family: u16 },
}
