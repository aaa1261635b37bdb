//! Outbound request builder.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};

use super::{CodecError, NULL_STRING};
use crate::{
    message::{DestinationAddress, MessageHandle, SelectionCriteria},
    transaction::Xid,
};

/// Accumulates the fields of one request in network byte order.
#[derive(Debug, Default)]
pub struct RequestBuffer {
    buf: BytesMut,
}

impl RequestBuffer {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    pub fn put_u8(&mut self, value: u8) { self.buf.put_u8(value); }

    pub fn put_bool(&mut self, value: bool) { self.buf.put_u8(u8::from(value)); }

    pub fn put_i16(&mut self, value: i16) { self.buf.put_i16(value); }

    pub fn put_u16(&mut self, value: u16) { self.buf.put_u16(value); }

    pub fn put_i32(&mut self, value: i32) { self.buf.put_i32(value); }

    pub fn put_u32(&mut self, value: u32) { self.buf.put_u32(value); }

    pub fn put_i64(&mut self, value: i64) { self.buf.put_i64(value); }

    pub fn put_u64(&mut self, value: u64) { self.buf.put_u64(value); }

    /// Write a string with a `u16` length prefix.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::FieldTooLong`] when the string does not fit the
    /// prefix.
    pub fn put_string(&mut self, value: &str) -> Result<(), CodecError> {
        self.put_short_bytes(value.as_bytes())
    }

    /// Write an optional string; `None` is written as a null prefix.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::FieldTooLong`] when the string does not fit the
    /// prefix.
    pub fn put_opt_string(&mut self, value: Option<&str>) -> Result<(), CodecError> {
        match value {
            Some(value) => self.put_string(value),
            None => {
                self.buf.put_u16(NULL_STRING);
                Ok(())
            }
        }
    }

    /// Write bytes with a `u16` length prefix.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::FieldTooLong`] when `value` is 65535 bytes or
    /// longer.
    pub fn put_short_bytes(&mut self, value: &[u8]) -> Result<(), CodecError> {
        let len = u16::try_from(value.len())
            .ok()
            .filter(|len| *len != NULL_STRING)
            .ok_or(CodecError::FieldTooLong { len: value.len() })?;
        self.buf.put_u16(len);
        self.buf.put_slice(value);
        Ok(())
    }

    /// Write a message slice with an `i32` length prefix.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::FieldTooLong`] for slices above `i32::MAX`.
    pub fn put_slice(&mut self, value: &[u8]) -> Result<(), CodecError> {
        let len = i32::try_from(value.len()).map_err(|_| CodecError::FieldTooLong {
            len: value.len(),
        })?;
        self.buf.put_i32(len);
        self.buf.put_slice(value);
        Ok(())
    }

    /// Write a destination address.
    ///
    /// # Errors
    ///
    /// Propagates string encoding failures.
    pub fn put_destination(&mut self, address: &DestinationAddress) -> Result<(), CodecError> {
        self.put_string(&address.name)?;
        self.put_opt_string(address.bus.as_deref())?;
        self.put_opt_string(address.engine_uuid.as_deref())?;
        self.put_bool(address.local_only);
        self.put_bool(address.temporary);
        Ok(())
    }

    /// Write optional selection criteria behind a presence byte.
    ///
    /// # Errors
    ///
    /// Propagates string encoding failures.
    pub fn put_criteria(&mut self, criteria: Option<&SelectionCriteria>) -> Result<(), CodecError> {
        let Some(criteria) = criteria else {
            self.put_bool(false);
            return Ok(());
        };
        self.put_bool(true);
        self.put_opt_string(criteria.discriminator.as_deref())?;
        self.put_opt_string(criteria.selector.as_deref())?;
        self.put_i16(criteria.domain.to_wire());
        Ok(())
    }

    /// Write a counted list of message handles.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::FieldTooLong`] for more than `i32::MAX` handles.
    pub fn put_handles(&mut self, handles: &[MessageHandle]) -> Result<(), CodecError> {
        let count = i32::try_from(handles.len()).map_err(|_| CodecError::FieldTooLong {
            len: handles.len(),
        })?;
        self.put_i32(count);
        for handle in handles {
            self.put_u64(handle.engine_id);
            self.put_u64(handle.value);
        }
        Ok(())
    }

    /// Write a counted string map in key order.
    ///
    /// # Errors
    ///
    /// Propagates string encoding failures.
    pub fn put_properties(&mut self, properties: &HashMap<String, String>) -> Result<(), CodecError> {
        let count = u16::try_from(properties.len()).map_err(|_| CodecError::FieldTooLong {
            len: properties.len(),
        })?;
        self.put_u16(count);
        let mut entries: Vec<_> = properties.iter().collect();
        entries.sort();
        for (key, value) in entries {
            self.put_string(key)?;
            self.put_string(value)?;
        }
        Ok(())
    }

    /// Write a global transaction identifier.
    ///
    /// # Errors
    ///
    /// Propagates length-prefix failures.
    pub fn put_xid(&mut self, xid: &Xid) -> Result<(), CodecError> {
        self.put_i32(xid.format_id());
        self.put_short_bytes(xid.global_transaction_id())?;
        self.put_short_bytes(xid.branch_qualifier())
    }

    /// Number of bytes written so far.
    #[must_use]
    pub fn len(&self) -> usize { self.buf.len() }

    /// Returns true when nothing has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.buf.is_empty() }

    /// Finish the request.
    #[must_use]
    pub fn freeze(self) -> Bytes { self.buf.freeze() }
}
