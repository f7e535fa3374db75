// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client-side support library for ferry.
//!
//! This contains the stream encode/decode helpers a program uses to talk to
//! the engine, and re-exports the contents of the `ferry-abi` crate that gets
//! shared with the engine.
//!
//! The driver boundary is two byte streams per `WriteRead` call: the client
//! assembles a *command stream* (tagged records the engine consumes one at a
//! time) and receives a *return stream* (tagged records the engine produced
//! while the call was inside the driver). [`CommandWriter`] builds the
//! former; [`ReturnReader`] walks the latter. Neither talks to the engine
//! itself -- the embedding program is responsible for placing the bytes in
//! its address space and invoking the ioctl.

pub use ferry_abi::*;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use zerocopy::{FromBytes, IntoBytes};

/// Assembles a command stream for the write half of a `WriteRead` call.
#[derive(Debug, Default)]
pub struct CommandWriter {
    buf: Vec<u8>,
}

impl CommandWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes the writer and returns the assembled stream.
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn tag(&mut self, cmd: Command) -> &mut Self {
        // Writing to a Vec cannot fail.
        self.buf.write_u32::<LittleEndian>(cmd as u32).unwrap();
        self
    }

    fn handle_op(&mut self, cmd: Command, handle: Handle) -> &mut Self {
        self.tag(cmd);
        self.buf.write_u32::<LittleEndian>(handle.0).unwrap();
        self
    }

    /// Weak increment on `handle`.
    pub fn inc_refs(&mut self, handle: Handle) -> &mut Self {
        self.handle_op(Command::IncRefs, handle)
    }

    /// Strong increment on `handle`.
    pub fn acquire(&mut self, handle: Handle) -> &mut Self {
        self.handle_op(Command::Acquire, handle)
    }

    /// Strong decrement on `handle`.
    pub fn release(&mut self, handle: Handle) -> &mut Self {
        self.handle_op(Command::Release, handle)
    }

    /// Weak decrement on `handle`.
    pub fn dec_refs(&mut self, handle: Handle) -> &mut Self {
        self.handle_op(Command::DecRefs, handle)
    }

    pub fn inc_refs_done(&mut self, ptr: ObjPtr, cookie: Cookie) -> &mut Self {
        self.tag(Command::IncRefsDone);
        self.buf.extend_from_slice(NodeRecord { ptr, cookie }.as_bytes());
        self
    }

    pub fn acquire_done(&mut self, ptr: ObjPtr, cookie: Cookie) -> &mut Self {
        self.tag(Command::AcquireDone);
        self.buf.extend_from_slice(NodeRecord { ptr, cookie }.as_bytes());
        self
    }

    /// Returns a delivered payload buffer to the engine's allocator.
    pub fn free_buffer(&mut self, user_ptr: u64) -> &mut Self {
        self.tag(Command::FreeBuffer);
        self.buf.write_u64::<LittleEndian>(user_ptr).unwrap();
        self
    }

    pub fn transaction(&mut self, tr: &TransactionData) -> &mut Self {
        self.tag(Command::Transaction);
        self.buf.extend_from_slice(tr.as_bytes());
        self
    }

    pub fn reply(&mut self, tr: &TransactionData) -> &mut Self {
        self.tag(Command::Reply);
        self.buf.extend_from_slice(tr.as_bytes());
        self
    }

    pub fn transaction_sg(&mut self, tr: &TransactionDataSg) -> &mut Self {
        self.tag(Command::TransactionSg);
        self.buf.extend_from_slice(tr.as_bytes());
        self
    }

    pub fn reply_sg(&mut self, tr: &TransactionDataSg) -> &mut Self {
        self.tag(Command::ReplySg);
        self.buf.extend_from_slice(tr.as_bytes());
        self
    }

    pub fn register_looper(&mut self) -> &mut Self {
        self.tag(Command::RegisterLooper)
    }

    pub fn enter_looper(&mut self) -> &mut Self {
        self.tag(Command::EnterLooper)
    }

    pub fn exit_looper(&mut self) -> &mut Self {
        self.tag(Command::ExitLooper)
    }

    pub fn request_death_notification(
        &mut self,
        handle: Handle,
        cookie: Cookie,
    ) -> &mut Self {
        self.tag(Command::RequestDeathNotification);
        self.buf
            .extend_from_slice(DeathRequest::new(handle, cookie).as_bytes());
        self
    }

    pub fn clear_death_notification(
        &mut self,
        handle: Handle,
        cookie: Cookie,
    ) -> &mut Self {
        self.tag(Command::ClearDeathNotification);
        self.buf
            .extend_from_slice(DeathRequest::new(handle, cookie).as_bytes());
        self
    }

    pub fn dead_binder_done(&mut self, cookie: Cookie) -> &mut Self {
        self.tag(Command::DeadBinderDone);
        self.buf.write_u64::<LittleEndian>(cookie.0).unwrap();
        self
    }
}

/// One decoded record of the return stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReturnRecord {
    Noop,
    Transaction(TransactionData),
    Reply(TransactionData),
    TransactionComplete,
    IncRefs(NodeRecord),
    Acquire(NodeRecord),
    Release(NodeRecord),
    DecRefs(NodeRecord),
    SpawnLooper,
    DeadBinder(Cookie),
    ClearDeathNotificationDone(Cookie),
    DeadReply,
    FailedReply,
    Error(u32),
}

/// Decoding failures. `Truncated` generally means the caller handed the
/// reader more bytes than the engine reported as consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    UnknownTag(u32),
    Truncated,
}

/// Walks the return stream of a completed `WriteRead` call.
#[derive(Debug)]
pub struct ReturnReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ReturnReader<'a> {
    /// Wraps the consumed prefix of a read buffer.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn is_done(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.buf.len() - self.pos < n {
            return Err(DecodeError::Truncated);
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn take_u32(&mut self) -> Result<u32, DecodeError> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    fn take_u64(&mut self) -> Result<u64, DecodeError> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    fn take_struct<T: FromBytes>(&mut self) -> Result<T, DecodeError> {
        let bytes = self.take(core::mem::size_of::<T>())?;
        T::read_from_bytes(bytes).map_err(|_| DecodeError::Truncated)
    }

    /// Decodes the next record, or `None` at end of stream.
    pub fn next(&mut self) -> Result<Option<ReturnRecord>, DecodeError> {
        if self.is_done() {
            return Ok(None);
        }
        let tag = self.take_u32()?;
        let ret =
            Return::try_from(tag).map_err(DecodeError::UnknownTag)?;
        let record = match ret {
            Return::Noop => ReturnRecord::Noop,
            Return::Transaction => {
                ReturnRecord::Transaction(self.take_struct()?)
            }
            Return::Reply => ReturnRecord::Reply(self.take_struct()?),
            Return::TransactionComplete => ReturnRecord::TransactionComplete,
            Return::IncRefs => ReturnRecord::IncRefs(self.take_struct()?),
            Return::Acquire => ReturnRecord::Acquire(self.take_struct()?),
            Return::Release => ReturnRecord::Release(self.take_struct()?),
            Return::DecRefs => ReturnRecord::DecRefs(self.take_struct()?),
            Return::SpawnLooper => ReturnRecord::SpawnLooper,
            Return::DeadBinder => {
                ReturnRecord::DeadBinder(Cookie(self.take_u64()?))
            }
            Return::ClearDeathNotificationDone => {
                ReturnRecord::ClearDeathNotificationDone(Cookie(
                    self.take_u64()?,
                ))
            }
            Return::DeadReply => ReturnRecord::DeadReply,
            Return::FailedReply => ReturnRecord::FailedReply,
            Return::Error => ReturnRecord::Error(self.take_u32()?),
        };
        Ok(Some(record))
    }

    /// Collects every remaining record.
    pub fn collect_all(mut self) -> Result<Vec<ReturnRecord>, DecodeError> {
        let mut out = Vec::new();
        while let Some(r) = self.next()? {
            out.push(r);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_and_reader_agree_on_framing() {
        let mut w = CommandWriter::new();
        w.acquire(Handle(3))
            .free_buffer(0x1000_0040)
            .dead_binder_done(Cookie(0xAA));
        let stream = w.finish();
        // tag + u32, tag + u64, tag + u64
        assert_eq!(stream.len(), 4 + 4 + 4 + 8 + 4 + 8);
        assert_eq!(LittleEndian::read_u32(&stream), Command::Acquire as u32);
    }

    #[test]
    fn return_stream_decodes_in_order() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(Return::Noop as u32).to_le_bytes());
        buf.extend_from_slice(
            &(Return::TransactionComplete as u32).to_le_bytes(),
        );
        buf.extend_from_slice(&(Return::DeadBinder as u32).to_le_bytes());
        buf.extend_from_slice(&0xAAu64.to_le_bytes());

        let records = ReturnReader::new(&buf).collect_all().unwrap();
        assert_eq!(
            records,
            vec![
                ReturnRecord::Noop,
                ReturnRecord::TransactionComplete,
                ReturnRecord::DeadBinder(Cookie(0xAA)),
            ]
        );
    }

    #[test]
    fn unknown_tag_is_an_error() {
        let buf = 99u32.to_le_bytes();
        let mut r = ReturnReader::new(&buf);
        assert_eq!(r.next(), Err(DecodeError::UnknownTag(99)));
    }
}
