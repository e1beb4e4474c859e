//! Messages.
//!
//! A [`Message`] is an owned, move-only buffer. `send` and `free` take it by
//! value, so a message that was sent or freed can no longer be touched.
//! A message sitting in a receive queue is owned by the queue and cannot be
//! freed by anyone else.
//!
//! The buffer keeps a trailing sentinel byte after the payload. The payload
//! accessors never expose it; the byte travels on the wire with the
//! process-external transports and is checked on `free` and on decode.

use crate::alloc::Lease;
use crate::error::{ItcError, Result};
use crate::mbox_id::MailboxId;

/// Size of the hidden header on the wire: flags, receiver, sender, kind, size.
pub const HEADER_SIZE: usize = 20;

/// Bit pattern of the byte following every payload.
pub const SENTINEL: u8 = 0xAA;

/// The hidden header preceding every payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageHeader {
    pub flags: u32,
    pub receiver: MailboxId,
    pub sender: MailboxId,
    pub kind: u32,
    pub size: u32,
}

/// An ITC message.
#[derive(Debug)]
pub struct Message {
    header: MessageHeader,
    /// Payload followed by the sentinel byte.
    buf: Vec<u8>,
    _lease: Lease,
}

impl Message {
    pub(crate) fn new(kind: u32, size: usize, lease: Lease) -> Result<Self> {
        let wire_size = u32::try_from(size).map_err(|_| ItcError::InvalidSize {
            size,
            max: u32::MAX as usize,
        })?;

        let mut buf = Vec::new();
        buf.try_reserve_exact(size + 1)
            .map_err(|_| ItcError::OutOfMemory(size))?;
        buf.resize(size, 0);
        buf.push(SENTINEL);

        Ok(Self {
            header: MessageHeader {
                kind,
                size: wire_size,
                ..MessageHeader::default()
            },
            buf,
            _lease: lease,
        })
    }

    /// Application-defined message kind.
    pub fn kind(&self) -> u32 {
        self.header.kind
    }

    /// Mailbox that sent this message, [`MailboxId::NONE`] before `send`.
    pub fn sender(&self) -> MailboxId {
        self.header.sender
    }

    /// Mailbox this message was sent to, [`MailboxId::NONE`] before `send`.
    pub fn receiver(&self) -> MailboxId {
        self.header.receiver
    }

    /// Payload size in bytes.
    pub fn size(&self) -> usize {
        self.header.size as usize
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[..self.size()]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let size = self.size();
        &mut self.buf[..size]
    }

    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    pub(crate) fn stamp(&mut self, sender: MailboxId, receiver: MailboxId) {
        self.header.sender = sender;
        self.header.receiver = receiver;
    }

    pub(crate) fn set_flags(&mut self, flags: u32) {
        self.header.flags = flags;
    }

    /// The trailing sentinel byte.
    pub(crate) fn sentinel(&self) -> u8 {
        self.buf[self.size()]
    }

    pub(crate) fn check_sentinel(&self) -> Result<()> {
        match self.sentinel() {
            SENTINEL => Ok(()),
            other => Err(ItcError::CorruptMessage(format!(
                "sentinel byte is {:#04x}, expected {:#04x}",
                other, SENTINEL
            ))),
        }
    }

    #[cfg(test)]
    pub(crate) fn corrupt_sentinel(&mut self) {
        let size = self.size();
        self.buf[size] = !SENTINEL;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{AllocScheme, Allocator};

    fn message(kind: u32, size: usize) -> Message {
        let alloc = Allocator::new(&AllocScheme::Malloc);
        Message::new(kind, size, alloc.lease(size + HEADER_SIZE + 1).unwrap()).unwrap()
    }

    #[test]
    fn new_message_is_zeroed_and_unaddressed() {
        let msg = message(7, 16);
        assert_eq!(msg.kind(), 7);
        assert_eq!(msg.size(), 16);
        assert!(msg.payload().iter().all(|b| *b == 0));
        assert!(msg.sender().is_none());
        assert!(msg.receiver().is_none());
        assert_eq!(msg.sentinel(), SENTINEL);
    }

    #[test]
    fn payload_writes_do_not_touch_sentinel() {
        let mut msg = message(1, 4);
        msg.payload_mut().copy_from_slice(&[0xFF; 4]);
        assert_eq!(msg.payload(), &[0xFF; 4]);
        assert!(msg.check_sentinel().is_ok());
    }

    #[test]
    fn zero_sized_payload() {
        let msg = message(1, 0);
        assert!(msg.payload().is_empty());
        assert!(msg.check_sentinel().is_ok());
    }

    #[test]
    fn corrupted_sentinel_is_detected() {
        let mut msg = message(1, 8);
        msg.corrupt_sentinel();
        assert!(matches!(
            msg.check_sentinel(),
            Err(ItcError::CorruptMessage(_))
        ));
    }

    #[test]
    fn stamp_sets_addresses() {
        let mut msg = message(1, 0);
        msg.stamp(MailboxId::from_raw(0x10_0001), MailboxId::from_raw(0x20_0002));
        assert_eq!(msg.sender().as_raw(), 0x10_0001);
        assert_eq!(msg.receiver().as_raw(), 0x20_0002);
    }
}
