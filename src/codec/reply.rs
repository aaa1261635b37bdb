//! Inbound reply reader.

use bytes::{Buf, Bytes};

use super::{CodecError, NULL_STRING};
use crate::{
    conversation::Reply,
    message::{DestinationAddress, MessageHandle},
    protocol::Segment,
    transaction::Xid,
};

/// Cursor over the payload of a reply or push.
#[derive(Clone, Debug)]
pub struct ReplyBuffer {
    segment: Segment,
    data: Bytes,
}

impl From<Reply> for ReplyBuffer {
    fn from(reply: Reply) -> Self { Self::new(reply.segment, reply.payload) }
}

impl ReplyBuffer {
    #[must_use]
    pub fn new(segment: Segment, data: Bytes) -> Self { Self { segment, data } }

    /// Segment the payload arrived on.
    #[must_use]
    pub fn segment(&self) -> Segment { self.segment }

    /// Bytes not yet consumed.
    #[must_use]
    pub fn remaining(&self) -> usize { self.data.remaining() }

    /// Borrow the unread bytes without consuming them.
    #[must_use]
    pub fn peek(&self) -> &[u8] { self.data.chunk() }

    fn ensure(&self, need: usize) -> Result<(), CodecError> {
        let have = self.data.remaining();
        if have < need {
            return Err(CodecError::ShortRead { need, have });
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`CodecError::ShortRead`] when the payload is exhausted.
    pub fn get_u8(&mut self) -> Result<u8, CodecError> {
        self.ensure(1)?;
        Ok(self.data.get_u8())
    }

    /// # Errors
    ///
    /// Returns [`CodecError::ShortRead`] when the payload is exhausted.
    pub fn get_bool(&mut self) -> Result<bool, CodecError> { Ok(self.get_u8()? != 0) }

    /// # Errors
    ///
    /// Returns [`CodecError::ShortRead`] when the payload is exhausted.
    pub fn get_i16(&mut self) -> Result<i16, CodecError> {
        self.ensure(2)?;
        Ok(self.data.get_i16())
    }

    /// # Errors
    ///
    /// Returns [`CodecError::ShortRead`] when the payload is exhausted.
    pub fn get_u16(&mut self) -> Result<u16, CodecError> {
        self.ensure(2)?;
        Ok(self.data.get_u16())
    }

    /// # Errors
    ///
    /// Returns [`CodecError::ShortRead`] when the payload is exhausted.
    pub fn get_i32(&mut self) -> Result<i32, CodecError> {
        self.ensure(4)?;
        Ok(self.data.get_i32())
    }

    /// # Errors
    ///
    /// Returns [`CodecError::ShortRead`] when the payload is exhausted.
    pub fn get_u32(&mut self) -> Result<u32, CodecError> {
        self.ensure(4)?;
        Ok(self.data.get_u32())
    }

    /// # Errors
    ///
    /// Returns [`CodecError::ShortRead`] when the payload is exhausted.
    pub fn get_i64(&mut self) -> Result<i64, CodecError> {
        self.ensure(8)?;
        Ok(self.data.get_i64())
    }

    /// # Errors
    ///
    /// Returns [`CodecError::ShortRead`] when the payload is exhausted.
    pub fn get_u64(&mut self) -> Result<u64, CodecError> {
        self.ensure(8)?;
        Ok(self.data.get_u64())
    }

    /// Read bytes behind a `u16` length prefix.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::ShortRead`] when the payload is exhausted.
    pub fn get_short_bytes(&mut self) -> Result<Bytes, CodecError> {
        let len = usize::from(self.get_u16()?);
        self.ensure(len)?;
        Ok(self.data.split_to(len))
    }

    /// Read a string that may be absent.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] on a short read or invalid UTF-8.
    pub fn get_opt_string(&mut self) -> Result<Option<String>, CodecError> {
        let len = self.get_u16()?;
        if len == NULL_STRING {
            return Ok(None);
        }
        let len = usize::from(len);
        self.ensure(len)?;
        let raw = self.data.split_to(len);
        Ok(Some(String::from_utf8(raw.to_vec())?))
    }

    /// Read a string; an absent string reads as empty.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] on a short read or invalid UTF-8.
    pub fn get_string(&mut self) -> Result<String, CodecError> {
        Ok(self.get_opt_string()?.unwrap_or_default())
    }

    /// Read a message slice behind an `i32` length prefix.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::ShortRead`] when the payload is exhausted.
    pub fn get_slice(&mut self) -> Result<Bytes, CodecError> {
        let len = self.get_i32()?;
        let len = usize::try_from(len).map_err(|_| CodecError::FieldTooLong { len: 0 })?;
        self.ensure(len)?;
        Ok(self.data.split_to(len))
    }

    /// Read a destination address.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] on a short read or invalid UTF-8.
    pub fn get_destination(&mut self) -> Result<DestinationAddress, CodecError> {
        Ok(DestinationAddress {
            name: self.get_string()?,
            bus: self.get_opt_string()?,
            engine_uuid: self.get_opt_string()?,
            local_only: self.get_bool()?,
            temporary: self.get_bool()?,
        })
    }

    /// Read a counted list of message handles.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] on a short read.
    pub fn get_handles(&mut self) -> Result<Vec<MessageHandle>, CodecError> {
        let count = usize::try_from(self.get_i32()?).unwrap_or_default();
        let mut handles = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            handles.push(MessageHandle::new(self.get_u64()?, self.get_u64()?));
        }
        Ok(handles)
    }

    /// Read a global transaction identifier.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] on a short read.
    pub fn get_xid(&mut self) -> Result<Xid, CodecError> {
        let format_id = self.get_i32()?;
        let gtrid = self.get_short_bytes()?;
        let bqual = self.get_short_bytes()?;
        Ok(Xid::new(format_id, gtrid.to_vec(), bqual.to_vec()))
    }

    /// Consume and return everything left in the payload.
    #[must_use]
    pub fn take_rest(&mut self) -> Bytes { self.data.split_off(0) }
}
