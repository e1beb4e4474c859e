//! In-process delivery straight into the destination's queue.

use crate::error::{ItcError, SendError};
use crate::mailbox::{Filter, MailboxQueue};
use crate::mbox_id::MailboxId;
use crate::message::Message;
use crate::transport::{Delivery, Transport};

/// Largest payload the header's size field can describe.
const MAX_LOCAL_MESSAGE: usize = u32::MAX as usize;

#[derive(Debug, Default)]
pub(crate) struct LocalTransport;

impl Transport for LocalTransport {
    fn name(&self) -> &'static str {
        "local"
    }

    fn send(&self, message: Message, to: MailboxId, dest: Option<&mut MailboxQueue>) -> Delivery {
        let Some(queue) = dest else {
            return Delivery::NotMine(message);
        };
        if !queue.is_active() {
            return Delivery::Failed(SendError::new(ItcError::NotActiveMailbox(to), message));
        }
        queue.push_back(message);
        Delivery::Delivered
    }

    fn receive(&self, queue: &mut MailboxQueue, filter: &Filter<'_>) -> Option<Message> {
        queue.take_first(filter)
    }

    fn max_message_size(&self) -> usize {
        MAX_LOCAL_MESSAGE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{AllocScheme, Allocator};
    use crate::mailbox::Mailbox;

    #[test]
    fn foreign_destination_is_not_mine() {
        let alloc = Allocator::new(&AllocScheme::Malloc);
        let msg = Message::new(1, 0, alloc.lease(21).unwrap()).unwrap();
        let to = MailboxId::from_raw(0x0020_0001);
        assert!(matches!(
            LocalTransport.send(msg, to, None),
            Delivery::NotMine(_)
        ));
    }

    #[test]
    fn inactive_destination_fails_with_message_back() {
        let alloc = Allocator::new(&AllocScheme::Malloc);
        let msg = Message::new(9, 0, alloc.lease(21).unwrap()).unwrap();
        let id = MailboxId::from_raw(0x0010_0001);
        let mailbox = Mailbox::new();
        let mut queue = mailbox.lock();

        match LocalTransport.send(msg, id, Some(&mut queue)) {
            Delivery::Failed(err) => {
                assert!(matches!(err.error(), ItcError::NotActiveMailbox(_)));
                assert_eq!(err.into_message().kind(), 9);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn delivered_then_received() {
        let alloc = Allocator::new(&AllocScheme::Malloc);
        let msg = Message::new(3, 0, alloc.lease(21).unwrap()).unwrap();
        let id = MailboxId::from_raw(0x0010_0001);
        let mailbox = Mailbox::new();
        let mut queue = mailbox.lock();
        queue.activate("a");

        assert!(matches!(
            LocalTransport.send(msg, id, Some(&mut queue)),
            Delivery::Delivered
        ));
        let got = LocalTransport.receive(&mut queue, &Filter::ANY).unwrap();
        assert_eq!(got.kind(), 3);
        assert!(LocalTransport.receive(&mut queue, &Filter::ANY).is_none());
    }
}
