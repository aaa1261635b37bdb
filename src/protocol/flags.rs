//! Bit sets written to, or read from, request and reply fields.

use bitflags::bitflags;

bitflags! {
    /// Feature bits advertised by the peer during the handshake.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct Capabilities: u16 {
        const TRANSACTIONS = 0x0001;
        const RELIABLE_MESSAGES = 0x0002;
        const ASSURED_MESSAGES = 0x0004;
        const REQUIRES_OPTIMIZED_TX = 0x0040;
    }
}

bitflags! {
    /// Consumer creation flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct ConsumerFlags: u16 {
        const READ_AHEAD = 0x0001;
        const NO_LOCAL = 0x0002;
        const MULTI_CONSUMER = 0x0004;
        const UNICAST = 0x0008;
        const BIFURCATABLE = 0x0040;
        const IGNORE_INITIAL_INDOUBTS = 0x0080;
        const ALLOW_GATHERING = 0x0100;
    }
}

bitflags! {
    /// Flags returned by the peer on consumer creation.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct ReplyFlags: u16 {
        const MULTICAST = 0x0010;
    }
}

bitflags! {
    /// Producer creation flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct ProducerFlags: u16 {
        const BIND_TO_QUEUE_POINT = 0x0001;
        const PREFER_LOCAL = 0x0002;
    }
}

bitflags! {
    /// One-byte slice marker for chunked transmissions.
    ///
    /// A slice carrying neither `FIRST` nor `LAST` is a middle slice; senders
    /// also set `MIDDLE` explicitly.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct ChunkFlags: u8 {
        const FIRST = 0x01;
        const MIDDLE = 0x02;
        const LAST = 0x04;
    }
}

bitflags! {
    /// Flags leading an optimized transaction field.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct OptimizedTxFlags: u32 {
        const TRANSACTED = 0x0001;
        const LOCAL = 0x0002;
        const CREATE = 0x0004;
        const END_PREVIOUS = 0x0008;
        const SUBORDINATES_ALLOWED = 0x0010;
    }
}
