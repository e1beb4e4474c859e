//! Mailbox control blocks.

use std::collections::VecDeque;
use std::io;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::mbox_id::MailboxId;
use crate::message::Message;
use crate::notify::{Doorbell, Notifier};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MailboxState {
    Unused,
    InUse,
}

/// Which queued messages a receive may take.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Filter<'a> {
    /// Accepted kinds; empty accepts every kind.
    pub kinds: &'a [u32],
    /// Accepted sender, `None` accepts every sender.
    pub from: Option<MailboxId>,
}

impl Filter<'_> {
    pub(crate) const ANY: Filter<'static> = Filter {
        kinds: &[],
        from: None,
    };

    pub(crate) fn matches(&self, message: &Message) -> bool {
        let kind_ok = self.kinds.is_empty() || self.kinds.contains(&message.kind());
        let from_ok = self.from.map_or(true, |from| message.sender() == from);
        kind_ok && from_ok
    }
}

/// The state guarded by a mailbox's lock.
#[derive(Debug)]
pub(crate) struct MailboxQueue {
    pub(crate) name: String,
    pub(crate) state: MailboxState,
    messages: VecDeque<Message>,
    pending: usize,
    doorbell: Option<Doorbell>,
}

impl MailboxQueue {
    fn new() -> Self {
        Self {
            name: String::new(),
            state: MailboxState::Unused,
            messages: VecDeque::new(),
            pending: 0,
            doorbell: None,
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.state == MailboxState::InUse
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending
    }

    pub(crate) fn push_back(&mut self, message: Message) {
        self.messages.push_back(message);
    }

    /// Remove the oldest message accepted by `filter`.
    pub(crate) fn take_first(&mut self, filter: &Filter<'_>) -> Option<Message> {
        let pos = self.messages.iter().position(|m| filter.matches(m))?;
        self.messages.remove(pos)
    }

    /// Account for one delivered message.
    pub(crate) fn on_delivered(&mut self) {
        self.pending += 1;
        if self.pending == 1 {
            if let Some(bell) = &self.doorbell {
                bell.ring();
            }
        }
    }

    /// Account for one received message.
    pub(crate) fn on_received(&mut self) {
        self.pending = self.pending.saturating_sub(1);
        if self.pending == 0 {
            if let Some(bell) = &self.doorbell {
                bell.drain();
            }
        }
    }

    /// The notifier of this mailbox, creating its doorbell on first use.
    pub(crate) fn notifier(&mut self) -> io::Result<Notifier> {
        if let Some(bell) = &self.doorbell {
            return Ok(bell.notifier());
        }
        let bell = Doorbell::new()?;
        if self.pending > 0 {
            bell.ring();
        }
        let notifier = bell.notifier();
        self.doorbell = Some(bell);
        Ok(notifier)
    }

    pub(crate) fn activate(&mut self, name: &str) {
        self.name = name.to_string();
        self.state = MailboxState::InUse;
        self.pending = 0;
    }

    /// Mark the slot unused, close the doorbell and hand back what is still
    /// queued.
    pub(crate) fn deactivate(&mut self) -> (String, Vec<Message>) {
        self.state = MailboxState::Unused;
        self.pending = 0;
        self.doorbell = None;
        let name = std::mem::take(&mut self.name);
        (name, self.messages.drain(..).collect())
    }
}

/// A mailbox slot: its queue behind a lock plus the signal receivers wait on.
#[derive(Debug)]
pub(crate) struct Mailbox {
    queue: Mutex<MailboxQueue>,
    ready: Condvar,
}

impl Mailbox {
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(MailboxQueue::new()),
            ready: Condvar::new(),
        }
    }

    /// Lock the queue. A poisoned lock is recovered so teardown always runs.
    pub(crate) fn lock(&self) -> MutexGuard<'_, MailboxQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Release the lock until signalled or `timeout` passes.
    pub(crate) fn wait<'a>(
        &self,
        guard: MutexGuard<'a, MailboxQueue>,
        timeout: Option<Duration>,
    ) -> MutexGuard<'a, MailboxQueue> {
        match timeout {
            None => self
                .ready
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner),
            Some(timeout) => match self.ready.wait_timeout(guard, timeout) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            },
        }
    }

    pub(crate) fn signal(&self) {
        self.ready.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{AllocScheme, Allocator};
    use crate::notify::is_readable;

    fn message(alloc: &Allocator, kind: u32, sender: u32) -> Message {
        let mut msg = Message::new(kind, 0, alloc.lease(21).unwrap()).unwrap();
        msg.stamp(MailboxId::from_raw(sender), MailboxId::from_raw(0x10_0000));
        msg
    }

    #[test]
    fn filter_matches_kind_and_sender() {
        let alloc = Allocator::new(&AllocScheme::Malloc);
        let msg = message(&alloc, 5, 0x20_0001);

        assert!(Filter::ANY.matches(&msg));
        assert!(Filter { kinds: &[4, 5], from: None }.matches(&msg));
        assert!(!Filter { kinds: &[4], from: None }.matches(&msg));
        assert!(Filter {
            kinds: &[],
            from: Some(MailboxId::from_raw(0x20_0001))
        }
        .matches(&msg));
        assert!(!Filter {
            kinds: &[5],
            from: Some(MailboxId::from_raw(0x20_0002))
        }
        .matches(&msg));
    }

    #[test]
    fn take_first_skips_non_matching() {
        let alloc = Allocator::new(&AllocScheme::Malloc);
        let mailbox = Mailbox::new();
        let mut queue = mailbox.lock();
        queue.activate("a");
        queue.push_back(message(&alloc, 1, 0x20_0001));
        queue.push_back(message(&alloc, 2, 0x20_0001));
        queue.push_back(message(&alloc, 1, 0x20_0001));

        let filter = Filter { kinds: &[2], from: None };
        assert_eq!(queue.take_first(&filter).unwrap().kind(), 2);
        assert!(queue.take_first(&filter).is_none());
        assert_eq!(queue.take_first(&Filter::ANY).unwrap().kind(), 1);
        assert_eq!(queue.take_first(&Filter::ANY).unwrap().kind(), 1);
    }

    #[test]
    fn doorbell_follows_pending_count() {
        let mailbox = Mailbox::new();
        let mut queue = mailbox.lock();
        queue.activate("a");
        let notifier = queue.notifier().unwrap();
        assert!(!is_readable(&notifier));

        queue.on_delivered();
        queue.on_delivered();
        assert!(is_readable(&notifier));

        queue.on_received();
        assert!(is_readable(&notifier));
        queue.on_received();
        assert!(!is_readable(&notifier));
    }

    #[test]
    fn late_notifier_sees_pending_messages() {
        let mailbox = Mailbox::new();
        let mut queue = mailbox.lock();
        queue.activate("a");
        queue.on_delivered();
        let notifier = queue.notifier().unwrap();
        assert!(is_readable(&notifier));
    }

    #[test]
    fn deactivate_drains_everything() {
        let alloc = Allocator::new(&AllocScheme::Malloc);
        let mailbox = Mailbox::new();
        let mut queue = mailbox.lock();
        queue.activate("svc");
        queue.push_back(message(&alloc, 1, 0x20_0001));
        queue.on_delivered();

        let (name, drained) = queue.deactivate();
        assert_eq!(name, "svc");
        assert_eq!(drained.len(), 1);
        assert!(!queue.is_active());
        assert_eq!(queue.pending(), 0);

        drop(drained);
        assert_eq!(alloc.in_use(), 0);
    }

    #[test]
    fn wait_times_out() {
        let mailbox = Mailbox::new();
        let start = std::time::Instant::now();
        let guard = mailbox.lock();
        let _guard = mailbox.wait(guard, Some(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
