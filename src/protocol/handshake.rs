//! Properties agreed with the peer when the conversation was established.

use super::{Capabilities, level};
use crate::error::{ProxyError, Result};

/// Negotiated protocol level and capability bits.
///
/// Queried before every conditionally encoded field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandshakeProperties {
    level: u16,
    capabilities: Capabilities,
}

impl HandshakeProperties {
    /// Construct properties for a negotiated `level`.
    #[must_use]
    pub const fn new(level: u16, capabilities: Capabilities) -> Self {
        Self {
            level,
            capabilities,
        }
    }

    /// Negotiated protocol level.
    #[must_use]
    pub const fn level(&self) -> u16 { self.level }

    /// Capability bits advertised by the peer.
    #[must_use]
    pub const fn capabilities(&self) -> Capabilities { self.capabilities }

    /// Returns true when the negotiated level is at least `level`.
    #[must_use]
    pub const fn supports(&self, level: u16) -> bool { self.level >= level }

    /// Returns true when transactions must use the optimized encoding.
    #[must_use]
    pub const fn requires_optimized_transactions(&self) -> bool {
        self.level >= level::OPTIMIZED_TRANSACTIONS
            && self.capabilities.contains(Capabilities::REQUIRES_OPTIMIZED_TX)
    }

    /// Fail with a usage error unless the negotiated level is at least
    /// `required`.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::ProtocolLevel`] when the peer is too old.
    pub fn require(&self, required: u16) -> Result<()> {
        if self.supports(required) {
            Ok(())
        } else {
            Err(ProxyError::ProtocolLevel {
                required,
                negotiated: self.level,
            })
        }
    }
}
