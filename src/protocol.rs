//! Protocol vocabulary shared by every proxy: segment codes, negotiated
//! levels, handshake properties and the wire flag sets.

mod flags;
mod handshake;
pub mod level;
mod segment;

pub use flags::{
    Capabilities,
    ChunkFlags,
    ConsumerFlags,
    OptimizedTxFlags,
    ProducerFlags,
    ReplyFlags,
};
pub use handshake::HandshakeProperties;
pub use segment::Segment;

/// Short written where no reliability is specified.
pub const NO_RELIABILITY: i16 = -1;
/// Short written where no destination type is specified.
pub const NO_DESTINATION_TYPE: i16 = -1;
/// Ordering context id written where no context applies.
pub const NO_ORDER_CONTEXT: i16 = 0;
/// Transaction field written where no transaction applies.
pub const NO_TRANSACTION: i32 = 0;
