//! Segment codes identifying each request, reply and push.

use std::fmt;

/// Numeric segment type carried by every transmission.
///
/// Replies use the request code with the high bit set; see
/// [`Segment::reply`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Segment(u16);

impl Segment {
    pub const CONNECT: Self = Self(0x0001);
    pub const CLOSE_CONNECTION: Self = Self(0x0002);
    pub const CREATE_CLONE_CONNECTION: Self = Self(0x0003);
    pub const GET_UNIQUE_ID: Self = Self(0x0004);
    pub const CREATE_CONSUMER_SESS: Self = Self(0x0010);
    pub const CREATE_PRODUCER_SESS: Self = Self(0x0011);
    pub const CREATE_BROWSER_SESS: Self = Self(0x0012);
    pub const CREATE_BIFURCATED_SESS: Self = Self(0x0013);
    pub const CLOSE_CONSUMER_SESS: Self = Self(0x0014);
    pub const CLOSE_PRODUCER_SESS: Self = Self(0x0015);
    pub const CLOSE_BROWSER_SESS: Self = Self(0x0016);
    pub const CREATE_CONSUMER_FOR_DURABLE_SUB: Self = Self(0x0017);
    pub const CREATE_DURABLE_SUB: Self = Self(0x0020);
    pub const DELETE_DURABLE_SUB: Self = Self(0x0021);
    pub const CREATE_TEMP_DESTINATION: Self = Self(0x0022);
    pub const DELETE_TEMP_DESTINATION: Self = Self(0x0023);
    pub const GET_DESTINATION_CONFIGURATION: Self = Self(0x0024);
    pub const SEND_CONN_MSG: Self = Self(0x0030);
    pub const SEND_CONN_MSG_NOREPLY: Self = Self(0x0031);
    pub const SEND_CHUNKED_CONN_MSG: Self = Self(0x0032);
    pub const SEND_CHUNKED_CONN_MSG_NOREPLY: Self = Self(0x0033);
    pub const SEND_SESS_MSG: Self = Self(0x0034);
    pub const SEND_SESS_MSG_NOREPLY: Self = Self(0x0035);
    pub const SEND_CHUNKED_SESS_MSG: Self = Self(0x0036);
    pub const SEND_CHUNKED_SESS_MSG_NOREPLY: Self = Self(0x0037);
    pub const RECEIVE_CONN_MSG: Self = Self(0x0040);
    pub const RECEIVE_SESS_MSG: Self = Self(0x0041);
    pub const START_SESS: Self = Self(0x0042);
    pub const STOP_SESS: Self = Self(0x0043);
    pub const UNLOCK_ALL: Self = Self(0x0044);
    pub const UNLOCK_SET: Self = Self(0x0045);
    pub const DELETE_SET: Self = Self(0x0046);
    pub const READ_SET: Self = Self(0x0047);
    pub const READ_AND_DELETE_SET: Self = Self(0x0048);
    pub const BROWSE_NEXT: Self = Self(0x0049);
    pub const RESET_BROWSE: Self = Self(0x004A);
    pub const CREATE_UCTRANSACTION: Self = Self(0x0050);
    pub const COMMIT_TRANSACTION: Self = Self(0x0051);
    pub const ROLLBACK_TRANSACTION: Self = Self(0x0052);
    pub const XA_OPEN: Self = Self(0x0060);
    pub const XA_START: Self = Self(0x0061);
    pub const XA_END: Self = Self(0x0062);
    pub const XA_PREPARE: Self = Self(0x0063);
    pub const XA_COMMIT: Self = Self(0x0064);
    pub const XA_ROLLBACK: Self = Self(0x0065);
    pub const XA_RECOVER: Self = Self(0x0066);
    pub const XA_FORGET: Self = Self(0x0067);
    pub const CHUNKED_SYNC_CONN_MSG: Self = Self(0x0070);
    pub const CHUNKED_SYNC_SESS_MSG: Self = Self(0x0071);
    pub const PROXY_MESSAGE: Self = Self(0x0072);
    pub const CHUNKED_PROXY_MESSAGE: Self = Self(0x0073);
    pub const ASYNC_SESSION_STOPPED: Self = Self(0x0074);
    pub const ASYNC_EXCEPTION: Self = Self(0x0075);
    pub const EVENT_OCCURRED: Self = Self(0x0076);
    pub const EXCEPTION: Self = Self(0x7FFF);

    const REPLY_BIT: u16 = 0x8000;

    /// Wrap a raw segment code.
    #[must_use]
    pub const fn new(code: u16) -> Self { Self(code) }

    /// Raw numeric code.
    #[must_use]
    pub const fn code(self) -> u16 { self.0 }

    /// Segment code of the reply to this request.
    #[must_use]
    pub const fn reply(self) -> Self { Self(self.0 | Self::REPLY_BIT) }

    /// Returns true when this code denotes a reply.
    #[must_use]
    pub const fn is_reply(self) -> bool { self.0 & Self::REPLY_BIT != 0 }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "Segment({:#06x})", self.0) }
}
