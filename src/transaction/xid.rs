//! Global transaction identifiers and XA flag sets.

use std::fmt;

use bitflags::bitflags;

/// Identifies one branch of a global transaction.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Xid {
    format_id: i32,
    global_transaction_id: Vec<u8>,
    branch_qualifier: Vec<u8>,
}

impl Xid {
    #[must_use]
    pub fn new(format_id: i32, global_transaction_id: Vec<u8>, branch_qualifier: Vec<u8>) -> Self {
        Self {
            format_id,
            global_transaction_id,
            branch_qualifier,
        }
    }

    #[must_use]
    pub fn format_id(&self) -> i32 { self.format_id }

    #[must_use]
    pub fn global_transaction_id(&self) -> &[u8] { &self.global_transaction_id }

    #[must_use]
    pub fn branch_qualifier(&self) -> &[u8] { &self.branch_qualifier }
}

fn write_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for byte in bytes {
        write!(f, "{byte:02x}")?;
    }
    Ok(())
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}:", self.format_id)?;
        write_hex(f, &self.global_transaction_id)?;
        f.write_str(":")?;
        write_hex(f, &self.branch_qualifier)
    }
}

impl fmt::Debug for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "Xid({self})") }
}

bitflags! {
    /// Flags passed to XA operations.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct XaFlags: u32 {
        const NO_FLAGS = 0;
        const JOIN = 0x0020_0000;
        const END_RSCAN = 0x0080_0000;
        const START_RSCAN = 0x0100_0000;
        const SUSPEND = 0x0200_0000;
        const SUCCESS = 0x0400_0000;
        const RESUME = 0x0800_0000;
        const FAIL = 0x2000_0000;
        const ONE_PHASE = 0x4000_0000;
    }
}

/// Outcome of a successful prepare.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum XaVote {
    /// `XA_OK`: the branch is prepared and awaits commit or rollback.
    Ok,
    /// `XA_RDONLY`: the branch made no changes and is already complete.
    ReadOnly,
}

impl XaVote {
    pub(crate) const WIRE_OK: i32 = 0;
    pub(crate) const WIRE_READ_ONLY: i32 = 3;
}
