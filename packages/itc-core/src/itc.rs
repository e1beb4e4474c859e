//! The process-wide ITC context.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::alloc::Allocator;
use crate::config::{InitMode, ItcConfig, Timeout};
use crate::error::{ItcError, Result, SendError};
use crate::gateway::Gateway;
use crate::local::LocalTransport;
use crate::lsock::LsockTransport;
use crate::mailbox::Filter;
use crate::mbox_id::{local_mask_for, range_for, MailboxId, COORD_MASK, COORD_RANGE};
use crate::message::{Message, HEADER_SIZE};
use crate::notify::Notifier;
use crate::ownership;
use crate::table::MailboxTable;
use crate::transport::{CoordinatorInfo, Delivery, LocalSink, Setup, Transport};
use crate::wire::{
    LocateReply, LocateRequest, MailboxNotice, ADD_MAILBOX, LOCATE_REPLY, LOCATE_REQUEST,
    RMV_MAILBOX,
};
use crate::MAX_NAME_LEN;

/// Range used when running without a Coordinator.
pub const STANDALONE_RANGE: u32 = range_for(1);

/// Where a located mailbox lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Located {
    pub id: MailboxId,
    /// OS process id of the owner, 0 when unknown.
    pub pid: u32,
    /// The mailbox lives on another host.
    pub external: bool,
    pub namespace: String,
}

pub(crate) struct Shared {
    alive: AtomicBool,
    namespace: String,
    socket_dir: PathBuf,
    info: CoordinatorInfo,
    is_coordinator: bool,
    table: MailboxTable,
    allocator: Allocator,
    transports: Vec<Box<dyn Transport>>,
    max_message_size: usize,
    gateway: RwLock<Option<Arc<dyn Gateway>>>,
}

impl Shared {
    fn check_alive(&self) -> Result<()> {
        if self.alive.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(ItcError::NotInitialized)
        }
    }

    fn shutdown_transports(&self) {
        for transport in self.transports.iter().rev() {
            debug!(transport = transport.name(), "transport exit");
            transport.exit();
        }
    }

    fn new_message(&self, kind: u32, size: usize) -> Result<Message> {
        let lease = self.allocator.lease(size + HEADER_SIZE + 1)?;
        Message::new(kind, size, lease)
    }

    fn build_message(&self, kind: u32, payload: &[u8]) -> Result<Message> {
        let mut message = self.new_message(kind, payload.len())?;
        message.payload_mut().copy_from_slice(payload);
        Ok(message)
    }

    /// Hand `message` to the first transport that claims `to`. When `to` is
    /// a mailbox of this process its lock is held for the whole walk.
    fn dispatch(&self, mut message: Message, to: MailboxId) -> std::result::Result<(), SendError> {
        let mailbox = self.table.lookup(to);
        let mut queue = mailbox.map(|m| m.lock());

        for transport in &self.transports {
            match transport.send(message, to, queue.as_deref_mut()) {
                Delivery::Delivered => {
                    if let (Some(mailbox), Some(queue)) = (mailbox, queue.as_mut()) {
                        queue.on_delivered();
                        mailbox.signal();
                    }
                    return Ok(());
                }
                Delivery::NotMine(returned) => message = returned,
                Delivery::Failed(err) => {
                    debug!(transport = transport.name(), to = %to, error = %err, "send failed");
                    return Err(err);
                }
            }
        }

        Err(SendError::new(ItcError::UnknownDestination(to), message))
    }

    fn receive_from(
        &self,
        id: MailboxId,
        filter: &Filter<'_>,
        timeout: Timeout,
    ) -> Result<Option<Message>> {
        let mailbox = self
            .table
            .lookup(id)
            .ok_or(ItcError::NotActiveMailbox(id))?;
        let deadline = timeout
            .as_duration()
            .and_then(|d| Instant::now().checked_add(d));

        let mut queue = mailbox.lock();
        loop {
            if !queue.is_active() {
                return Err(ItcError::NotActiveMailbox(id));
            }
            for transport in &self.transports {
                if let Some(message) = transport.receive(&mut queue, filter) {
                    queue.on_received();
                    return Ok(Some(message));
                }
            }

            let wait = match deadline {
                None => None,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    Some(deadline - now)
                }
            };
            queue = mailbox.wait(queue, wait);
        }
    }

    /// Tell the Coordinator about a mailbox. Best-effort.
    fn notify_coordinator(&self, kind: u32, id: MailboxId, name: &str) {
        let coord_id = self.info.coord_id;
        if self.is_coordinator || coord_id.is_none() {
            return;
        }

        let notice = MailboxNotice {
            mbox_id: id,
            name: name.to_string(),
        };
        let message = notice
            .encode()
            .map_err(ItcError::from)
            .and_then(|payload| self.build_message(kind, &payload));
        let mut message = match message {
            Ok(message) => message,
            Err(e) => {
                warn!(mbox_id = %id, error = %e, "cannot build coordinator notification");
                return;
            }
        };
        message.stamp(id, coord_id);

        if let Err(e) = self.dispatch(message, coord_id) {
            if e.error().is_transient() {
                debug!(mbox_id = %id, error = %e, "coordinator notification not delivered");
            } else {
                warn!(mbox_id = %id, error = %e, "coordinator notification failed");
            }
        }
    }

    /// The single teardown path for a mailbox of this process.
    pub(crate) fn teardown(&self, id: MailboxId) {
        let Some(mailbox) = self.table.lookup(id) else {
            return;
        };

        let (name, drained) = {
            let mut queue = mailbox.lock();
            if !queue.is_active() {
                return;
            }
            queue.deactivate()
        };

        for transport in &self.transports {
            transport.delete_mailbox(id);
        }
        self.notify_coordinator(RMV_MAILBOX, id, &name);

        if !drained.is_empty() {
            debug!(mbox_id = %id, discarded = drained.len(), "discarding queued messages");
        }
        drop(drained);

        self.table.release_name(&name);
        self.table.release(id);
        debug!(mbox_id = %id, name = %name, "deleted mailbox");
    }
}

impl LocalSink for Shared {
    fn allocate(&self, kind: u32, size: usize) -> Result<Message> {
        self.new_message(kind, size)
    }

    fn deliver(&self, message: Message) -> std::result::Result<(), SendError> {
        let to = message.receiver();
        if self.table.lookup(to).is_none() {
            return Err(SendError::new(ItcError::UnknownDestination(to), message));
        }
        self.dispatch(message, to)
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if self.alive.swap(false, Ordering::AcqRel) {
            self.shutdown_transports();
        }
    }
}

/// Handle to a process's ITC context.
///
/// Cloning is cheap; every clone refers to the same mailbox table. The
/// context shuts down when [`Itc::exit`] succeeds or the last clone drops.
///
/// ```ignore
/// let itc = Itc::init(ItcConfig::from_env()?)?;
/// let me = itc.create_mailbox("worker")?;
///
/// let mut msg = itc.alloc(4, 0x100)?;
/// msg.payload_mut().copy_from_slice(b"ping");
/// itc.send(msg, peer, None, None).map_err(|e| e.into_parts().0)?;
///
/// if let Some(reply) = itc.receive(Timeout::Millis(500))? {
///     itc.free(reply)?;
/// }
/// itc.delete_mailbox(me)?;
/// ```
#[derive(Clone)]
pub struct Itc {
    shared: Arc<Shared>,
}

impl fmt::Debug for Itc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Itc")
            .field("range", &format_args!("{:#010x}", self.shared.info.my_range))
            .field("namespace", &self.shared.namespace)
            .field("coordinator", &self.shared.info.coord_id)
            .finish()
    }
}

fn locate_coordinator(transports: &[Box<dyn Transport>]) -> Result<CoordinatorInfo> {
    for transport in transports {
        if let Some(result) = transport.locate_coordinator() {
            debug!(transport = transport.name(), "located coordinator");
            return result;
        }
    }
    Err(ItcError::InvalidArgument(
        "no transport can reach the coordinator".to_string(),
    ))
}

impl Itc {
    /// Initialize this process's context.
    ///
    /// In coordinated mode this runs the Coordinator handshake first and
    /// builds the mailbox table inside the assigned range.
    pub fn init(config: ItcConfig) -> Result<Self> {
        let local_mask = local_mask_for(config.mailbox_count)?;

        match config.mode {
            InitMode::Standalone => {
                let info = CoordinatorInfo {
                    my_range: STANDALONE_RANGE,
                    coord_mask: COORD_MASK,
                    coord_id: MailboxId::NONE,
                };
                Self::start(config, info, false, local_mask, vec![Box::new(LocalTransport)])
            }
            InitMode::Coordinated => {
                let transports: Vec<Box<dyn Transport>> = vec![
                    Box::new(LocalTransport),
                    Box::new(LsockTransport::new(config.socket_dir.clone())),
                ];
                let info = match locate_coordinator(&transports) {
                    Ok(info) => info,
                    Err(e) => {
                        for transport in &transports {
                            transport.exit();
                        }
                        return Err(e);
                    }
                };
                Self::start(config, info, false, local_mask, transports)
            }
        }
    }

    /// Initialize the Coordinator's own context. Its name-server mailbox is
    /// the first mailbox created.
    pub fn init_coordinator(config: ItcConfig) -> Result<Self> {
        let local_mask = local_mask_for(config.mailbox_count)?;
        let info = CoordinatorInfo {
            my_range: COORD_RANGE,
            coord_mask: COORD_MASK,
            coord_id: MailboxId::new(COORD_RANGE, 0),
        };
        let transports: Vec<Box<dyn Transport>> = vec![
            Box::new(LocalTransport),
            Box::new(LsockTransport::for_coordinator(config.socket_dir.clone())),
        ];
        Self::start(config, info, true, local_mask, transports)
    }

    fn start(
        config: ItcConfig,
        info: CoordinatorInfo,
        is_coordinator: bool,
        local_mask: u32,
        transports: Vec<Box<dyn Transport>>,
    ) -> Result<Self> {
        if local_mask & info.coord_mask != 0 {
            for transport in &transports {
                transport.exit();
            }
            return Err(ItcError::InvalidArgument(format!(
                "mailbox count {} overlaps coordinator mask {:#010x}",
                config.mailbox_count, info.coord_mask
            )));
        }

        let max_message_size = transports
            .iter()
            .map(|t| t.max_message_size())
            .min()
            .unwrap_or(0);

        let shared = Arc::new(Shared {
            alive: AtomicBool::new(true),
            namespace: config.namespace,
            socket_dir: config.socket_dir,
            info,
            is_coordinator,
            table: MailboxTable::new(info.my_range, info.coord_mask, local_mask, config.mailbox_count),
            allocator: Allocator::new(&config.alloc),
            transports,
            max_message_size,
            gateway: RwLock::new(None),
        });

        let weak: Weak<Shared> = Arc::downgrade(&shared);
        let sink: Weak<dyn LocalSink> = weak;
        let setup = Setup {
            my_range: info.my_range,
            coord_mask: info.coord_mask,
            mailbox_count: config.mailbox_count,
            socket_dir: &shared.socket_dir,
        };
        for transport in &shared.transports {
            if let Err(e) = transport.init(&setup, sink.clone()) {
                warn!(transport = transport.name(), error = %e, "transport init failed");
                shared.alive.store(false, Ordering::Release);
                shared.shutdown_transports();
                return Err(e);
            }
        }

        info!(
            range = format_args!("{:#010x}", info.my_range),
            mailboxes = config.mailbox_count,
            namespace = %shared.namespace,
            coordinator = is_coordinator,
            "itc initialized"
        );
        Ok(Self { shared })
    }

    /// Shut the context down. Fails while any mailbox is still open.
    pub fn exit(&self) -> Result<()> {
        // Close first, then count: a create that took a slot before the
        // count is seen here, one that takes it after sees the context closed.
        if !self.shared.alive.swap(false, Ordering::AcqRel) {
            return Err(ItcError::NotInitialized);
        }
        let open = self.shared.table.in_use_count();
        if open > 0 {
            self.shared.alive.store(true, Ordering::Release);
            return Err(ItcError::MailboxesOpen(open));
        }
        self.shared.shutdown_transports();
        info!("itc exited");
        Ok(())
    }

    /// Allocate a zeroed message with `size` payload bytes.
    pub fn alloc(&self, size: usize, kind: u32) -> Result<Message> {
        self.shared.check_alive()?;
        if size > self.shared.max_message_size {
            return Err(ItcError::InvalidSize {
                size,
                max: self.shared.max_message_size,
            });
        }
        self.shared.new_message(kind, size)
    }

    /// Allocate a message holding a copy of `payload`.
    pub fn alloc_with(&self, kind: u32, payload: &[u8]) -> Result<Message> {
        let mut message = self.alloc(payload.len(), kind)?;
        message.payload_mut().copy_from_slice(payload);
        Ok(message)
    }

    /// Release a message. Fails if its trailing sentinel was damaged.
    pub fn free(&self, message: Message) -> Result<()> {
        let checked = message.check_sentinel();
        drop(message);
        self.shared.check_alive()?;
        checked
    }

    /// Create the calling thread's mailbox.
    pub fn create_mailbox(&self, name: &str) -> Result<MailboxId> {
        let shared = &self.shared;
        shared.check_alive()?;

        if name.is_empty() {
            return Err(ItcError::InvalidArgument("mailbox name is empty".to_string()));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(ItcError::NameTooLong {
                len: name.len(),
                max: MAX_NAME_LEN,
            });
        }
        if let Some(id) = ownership::owned(shared) {
            return Err(ItcError::AlreadyOwned(id));
        }

        let index = shared.table.acquire().ok_or(ItcError::NoFreeSlots)?;
        let id = shared.table.id_of(index);
        // A concurrent exit may have closed the context after the first check.
        if let Err(e) = shared.check_alive() {
            shared.table.release(id);
            return Err(e);
        }
        if let Err(e) = shared.table.reserve_name(name, id) {
            shared.table.release(id);
            return Err(e);
        }

        let rollback = |registered: &[Box<dyn Transport>]| {
            for transport in registered {
                transport.delete_mailbox(id);
            }
            shared.table.release_name(name);
            shared.table.release(id);
        };

        for (i, transport) in shared.transports.iter().enumerate() {
            if let Err(e) = transport.create_mailbox(id, name) {
                warn!(transport = transport.name(), mbox_id = %id, error = %e, "mailbox registration failed");
                rollback(&shared.transports[..i]);
                return Err(e);
            }
        }

        if let Some(mailbox) = shared.table.lookup(id) {
            mailbox.lock().activate(name);
        }
        if let Err(e) = ownership::register(shared, id) {
            if let Some(mailbox) = shared.table.lookup(id) {
                drop(mailbox.lock().deactivate());
            }
            rollback(&shared.transports);
            return Err(e);
        }

        shared.notify_coordinator(ADD_MAILBOX, id, name);
        debug!(mbox_id = %id, name, "created mailbox");
        Ok(id)
    }

    /// Delete the calling thread's mailbox, discarding queued messages.
    pub fn delete_mailbox(&self, id: MailboxId) -> Result<()> {
        self.shared.check_alive()?;
        if ownership::release(&self.shared, id) {
            Ok(())
        } else {
            Err(ItcError::NotOwner(id))
        }
    }

    /// Send `message` to `to`.
    ///
    /// `from` must be `None` or the calling thread's own mailbox. A
    /// `namespace` other than the local one routes through the gateway.
    /// On failure the message is returned inside the error.
    pub fn send(
        &self,
        mut message: Message,
        to: MailboxId,
        from: Option<MailboxId>,
        namespace: Option<&str>,
    ) -> std::result::Result<(), SendError> {
        if let Err(e) = self.shared.check_alive() {
            return Err(SendError::new(e, message));
        }

        let sender = match (from, ownership::owned(&self.shared)) {
            (None, Some(me)) => me,
            (Some(from), Some(me)) if from == me => me,
            (Some(from), _) => return Err(SendError::new(ItcError::NotOwner(from), message)),
            (None, None) => return Err(SendError::new(ItcError::NoMailbox, message)),
        };

        if let Some(namespace) = namespace.filter(|ns| *ns != self.shared.namespace) {
            message.stamp(sender, to);
            let gateway = self
                .shared
                .gateway
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            return match gateway {
                Some(gateway) => gateway.forward(namespace, to, message),
                None => Err(SendError::new(
                    ItcError::NoGateway(namespace.to_string()),
                    message,
                )),
            };
        }

        if to == sender {
            return Err(SendError::new(ItcError::SendToSelf(to), message));
        }

        message.stamp(sender, to);
        self.shared.dispatch(message, to)
    }

    /// Receive the oldest message queued for the calling thread's mailbox.
    pub fn receive(&self, timeout: Timeout) -> Result<Option<Message>> {
        self.receive_filtered(&Filter::ANY, timeout)
    }

    /// Receive the oldest message whose kind is in `kinds` (empty accepts
    /// any kind) and, if `from` is set, whose sender is `from`. Other
    /// messages stay queued in order.
    pub fn receive_matching(
        &self,
        kinds: &[u32],
        from: Option<MailboxId>,
        timeout: Timeout,
    ) -> Result<Option<Message>> {
        self.receive_filtered(&Filter { kinds, from }, timeout)
    }

    fn receive_filtered(&self, filter: &Filter<'_>, timeout: Timeout) -> Result<Option<Message>> {
        self.shared.check_alive()?;
        let me = ownership::owned(&self.shared).ok_or(ItcError::NoMailbox)?;
        self.shared.receive_from(me, filter, timeout)
    }

    /// Resolve `name` to a mailbox id.
    ///
    /// Mailboxes of this process are found without a round-trip; anything
    /// else is asked of the Coordinator, waiting up to `timeout` for the
    /// answer. `Ok(None)` means not found. Other messages arriving in the
    /// meantime stay queued.
    pub fn locate(
        &self,
        name: &str,
        timeout: Timeout,
        internal_only: bool,
    ) -> Result<Option<Located>> {
        self.shared.check_alive()?;
        if let Some(id) = self.shared.table.find_by_name(name) {
            return Ok(Some(Located {
                id,
                pid: std::process::id(),
                external: false,
                namespace: self.shared.namespace.clone(),
            }));
        }
        let coord_id = self.shared.info.coord_id;
        if coord_id.is_none() {
            return Ok(None);
        }

        let me = ownership::owned(&self.shared).ok_or(ItcError::NoMailbox)?;
        self.send_locate_request(me, name, timeout, internal_only)?;

        let deadline = timeout
            .as_duration()
            .and_then(|d| Instant::now().checked_add(d));
        loop {
            let remaining = match deadline {
                None => Timeout::Forever,
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    Timeout::Millis(left.as_millis().try_into().unwrap_or(u64::MAX))
                }
            };
            let filter = Filter {
                kinds: &[LOCATE_REPLY],
                from: Some(coord_id),
            };
            let Some(message) = self.shared.receive_from(me, &filter, remaining)? else {
                debug!(name, "locate timed out");
                return Ok(None);
            };

            let reply = LocateReply::decode(message.payload());
            drop(message);
            match reply {
                Ok(reply) if reply.name == name => {
                    return Ok(reply.is_found().then(|| Located {
                        id: reply.mbox_id,
                        pid: reply.pid,
                        external: reply.external,
                        namespace: reply.namespace,
                    }));
                }
                Ok(reply) => debug!(expected = name, got = %reply.name, "discarding stale locate reply"),
                Err(e) => warn!(error = %e, "malformed locate reply"),
            }
        }
    }

    /// Ask the Coordinator to resolve `name` without waiting. The answer
    /// arrives as a [`LOCATE_REPLY`] message; decode it with
    /// [`LocateReply::decode`].
    pub fn locate_async(&self, name: &str, timeout: Timeout, internal_only: bool) -> Result<()> {
        self.shared.check_alive()?;
        let me = ownership::owned(&self.shared).ok_or(ItcError::NoMailbox)?;
        self.send_locate_request(me, name, timeout, internal_only)
    }

    fn send_locate_request(
        &self,
        me: MailboxId,
        name: &str,
        timeout: Timeout,
        internal_only: bool,
    ) -> Result<()> {
        if name.len() > MAX_NAME_LEN {
            return Err(ItcError::NameTooLong {
                len: name.len(),
                max: MAX_NAME_LEN,
            });
        }
        let coord_id = self.shared.info.coord_id;
        if coord_id.is_none() {
            return Err(ItcError::InvalidArgument(
                "running without a coordinator".to_string(),
            ));
        }

        let request = LocateRequest {
            requester: me,
            timeout_ms: timeout.as_wire_millis(),
            internal_only,
            name: name.to_string(),
        };
        let mut message = self.shared.build_message(LOCATE_REQUEST, &request.encode()?)?;
        message.stamp(me, coord_id);
        self.shared
            .dispatch(message, coord_id)
            .map_err(|e| e.into_parts().0)
    }

    /// Install the gateway that carries messages to other namespaces.
    pub fn set_gateway(&self, gateway: Option<Arc<dyn Gateway>>) {
        *self
            .shared
            .gateway
            .write()
            .unwrap_or_else(PoisonError::into_inner) = gateway;
    }

    /// A pollable handle that is readable while the calling thread's mailbox
    /// has pending messages.
    pub fn notifier(&self) -> Result<Notifier> {
        self.shared.check_alive()?;
        let me = ownership::owned(&self.shared).ok_or(ItcError::NoMailbox)?;
        let mailbox = self
            .shared
            .table
            .lookup(me)
            .ok_or(ItcError::NotActiveMailbox(me))?;
        let notifier = mailbox.lock().notifier()?;
        Ok(notifier)
    }

    /// The calling thread's mailbox.
    pub fn current_mailbox(&self) -> Result<MailboxId> {
        self.shared.check_alive()?;
        ownership::owned(&self.shared).ok_or(ItcError::NoMailbox)
    }

    /// Name of a mailbox of this process.
    pub fn mailbox_name(&self, id: MailboxId) -> Result<String> {
        self.shared.check_alive()?;
        let mailbox = self
            .shared
            .table
            .lookup(id)
            .ok_or(ItcError::NotActiveMailbox(id))?;
        let queue = mailbox.lock();
        if !queue.is_active() {
            return Err(ItcError::NotActiveMailbox(id));
        }
        Ok(queue.name.clone())
    }

    /// Number of messages waiting in a mailbox of this process.
    pub fn pending(&self, id: MailboxId) -> Result<usize> {
        self.shared.check_alive()?;
        let mailbox = self
            .shared
            .table
            .lookup(id)
            .ok_or(ItcError::NotActiveMailbox(id))?;
        let queue = mailbox.lock();
        if !queue.is_active() {
            return Err(ItcError::NotActiveMailbox(id));
        }
        Ok(queue.pending())
    }

    /// The Coordinator's name-server mailbox, [`MailboxId::NONE`] when
    /// standalone.
    pub fn coordinator(&self) -> MailboxId {
        self.shared.info.coord_id
    }

    /// This process's identifier range.
    pub fn range(&self) -> u32 {
        self.shared.table.range()
    }

    pub fn coord_mask(&self) -> u32 {
        self.shared.table.coord_mask()
    }

    pub fn namespace(&self) -> &str {
        &self.shared.namespace
    }

    /// Size of the mailbox table.
    pub fn capacity(&self) -> usize {
        self.shared.table.capacity()
    }

    /// Largest payload `alloc` accepts.
    pub fn max_message_size(&self) -> usize {
        self.shared.max_message_size
    }

    /// Bytes held by live messages.
    pub fn allocated_bytes(&self) -> usize {
        self.shared.allocator.in_use()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::AllocScheme;
    use std::sync::mpsc;
    use std::thread;

    fn standalone(count: usize) -> Itc {
        Itc::init(ItcConfig::standalone(count)).unwrap()
    }

    #[test]
    fn standalone_identity() {
        let itc = standalone(8);
        assert_eq!(itc.range(), STANDALONE_RANGE);
        assert!(itc.coordinator().is_none());
        assert_eq!(itc.max_message_size(), u32::MAX as usize);
        itc.exit().unwrap();
    }

    #[test]
    fn one_mailbox_per_thread() {
        let itc = standalone(4);
        let id = itc.create_mailbox("a").unwrap();
        assert!(matches!(
            itc.create_mailbox("b"),
            Err(ItcError::AlreadyOwned(owned)) if owned == id
        ));
        itc.delete_mailbox(id).unwrap();
        itc.exit().unwrap();
    }

    #[test]
    fn ids_fall_inside_range() {
        let itc = standalone(10);
        let id = itc.create_mailbox("a").unwrap();
        assert_eq!(id.process_range(itc.coord_mask()), itc.range());
        assert!((id.local_index(local_mask_for(10).unwrap()) as usize) < 10);
        itc.delete_mailbox(id).unwrap();
    }

    #[test]
    fn name_rules() {
        let itc = standalone(4);
        let long = "x".repeat(MAX_NAME_LEN + 1);
        assert!(matches!(
            itc.create_mailbox(&long),
            Err(ItcError::NameTooLong { .. })
        ));
        assert!(matches!(
            itc.create_mailbox(""),
            Err(ItcError::InvalidArgument(_))
        ));

        let id = itc.create_mailbox("svc").unwrap();
        let other = itc.clone();
        let dup = thread::spawn(move || other.create_mailbox("svc").map(|_| ()))
            .join()
            .unwrap();
        assert!(matches!(dup, Err(ItcError::NameInUse(_))));
        itc.delete_mailbox(id).unwrap();
    }

    #[test]
    fn table_exhaustion() {
        let itc = standalone(1);
        let id = itc.create_mailbox("only").unwrap();
        let other = itc.clone();
        let res = thread::spawn(move || other.create_mailbox("second").map(|_| ()))
            .join()
            .unwrap();
        assert!(matches!(res, Err(ItcError::NoFreeSlots)));
        itc.delete_mailbox(id).unwrap();
    }

    #[test]
    fn delete_requires_ownership() {
        let itc = standalone(4);
        let other = itc.clone();
        let (id_tx, id_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let owner = thread::spawn(move || {
            let id = other.create_mailbox("remote").unwrap();
            id_tx.send(id).unwrap();
            let _ = done_rx.recv();
        });

        let target = id_rx.recv().unwrap();
        assert!(matches!(
            itc.delete_mailbox(target),
            Err(ItcError::NotOwner(_))
        ));
        done_tx.send(()).unwrap();
        owner.join().unwrap();

        // Thread exit released the slot.
        assert_eq!(itc.shared.table.in_use_count(), 0);
        itc.exit().unwrap();
    }

    #[test]
    fn exit_with_open_mailbox_fails() {
        let itc = standalone(4);
        let id = itc.create_mailbox("a").unwrap();
        assert!(matches!(itc.exit(), Err(ItcError::MailboxesOpen(1))));
        itc.delete_mailbox(id).unwrap();
        itc.exit().unwrap();
        assert!(matches!(itc.exit(), Err(ItcError::NotInitialized)));
        assert!(matches!(itc.alloc(1, 1), Err(ItcError::NotInitialized)));
    }

    #[test]
    fn refused_exit_leaves_context_usable() {
        let itc = standalone(4);
        let id = itc.create_mailbox("a").unwrap();
        assert!(matches!(itc.exit(), Err(ItcError::MailboxesOpen(1))));

        let other = itc.clone();
        thread::spawn(move || {
            let me = other.create_mailbox("b").unwrap();
            let msg = other.alloc_with(7, b"hi").unwrap();
            other.send(msg, id, None, None).unwrap();
            other.delete_mailbox(me).unwrap();
        })
        .join()
        .unwrap();

        let got = itc.receive(Timeout::NoWait).unwrap().unwrap();
        assert_eq!(got.kind(), 7);
        assert_eq!(got.payload(), b"hi");
        itc.free(got).unwrap();
        itc.delete_mailbox(id).unwrap();
        itc.exit().unwrap();
    }

    #[test]
    fn exit_and_create_never_both_succeed() {
        for _ in 0..200 {
            let itc = standalone(4);
            let other = itc.clone();
            let (created_tx, created_rx) = mpsc::channel();
            let (done_tx, done_rx) = mpsc::channel::<()>();
            let creator = thread::spawn(move || {
                created_tx.send(other.create_mailbox("racer").is_ok()).unwrap();
                let _ = done_rx.recv();
            });

            let exited = itc.exit().is_ok();
            let created = created_rx.recv().unwrap();
            assert!(!(exited && created), "exit succeeded with a mailbox open");
            if exited {
                assert_eq!(itc.shared.table.in_use_count(), 0);
            }

            done_tx.send(()).unwrap();
            creator.join().unwrap();
            if !exited {
                assert_eq!(itc.shared.table.in_use_count(), 0);
                itc.exit().unwrap();
            }
        }
    }

    #[test]
    fn alloc_limits() {
        let itc = Itc::init(ItcConfig::standalone(4).with_alloc(AllocScheme::Pool { bytes: 100 }))
            .unwrap();
        let a = itc.alloc(50, 1).unwrap();
        assert_eq!(itc.allocated_bytes(), 50 + HEADER_SIZE + 1);
        assert!(matches!(itc.alloc(50, 1), Err(ItcError::OutOfMemory(_))));
        itc.free(a).unwrap();
        assert_eq!(itc.allocated_bytes(), 0);
        assert!(itc.alloc(50, 1).is_ok());
    }

    #[test]
    fn free_detects_corruption() {
        let itc = standalone(4);
        let mut msg = itc.alloc(4, 1).unwrap();
        msg.corrupt_sentinel();
        assert!(matches!(itc.free(msg), Err(ItcError::CorruptMessage(_))));
        assert_eq!(itc.allocated_bytes(), 0);
    }

    #[test]
    fn send_without_mailbox() {
        let itc = standalone(4);
        let msg = itc.alloc(0, 1).unwrap();
        let err = itc
            .send(msg, MailboxId::new(STANDALONE_RANGE, 0), None, None)
            .unwrap_err();
        assert!(matches!(err.error(), ItcError::NoMailbox));
    }

    #[test]
    fn send_from_foreign_mailbox() {
        let itc = standalone(4);
        let me = itc.create_mailbox("me").unwrap();
        let msg = itc.alloc(0, 1).unwrap();
        let err = itc
            .send(msg, me, Some(MailboxId::new(STANDALONE_RANGE, 3)), None)
            .unwrap_err();
        assert!(matches!(err.error(), ItcError::NotOwner(_)));
        itc.delete_mailbox(me).unwrap();
    }

    #[test]
    fn send_to_inactive_slot() {
        let itc = standalone(4);
        let me = itc.create_mailbox("me").unwrap();
        let msg = itc.alloc(0, 1).unwrap();
        let err = itc
            .send(msg, MailboxId::new(STANDALONE_RANGE, 3), None, None)
            .unwrap_err();
        assert!(matches!(err.error(), ItcError::NotActiveMailbox(_)));
        itc.delete_mailbox(me).unwrap();
    }

    #[test]
    fn send_outside_range_is_unknown() {
        let itc = standalone(4);
        let me = itc.create_mailbox("me").unwrap();
        let msg = itc.alloc(0, 1).unwrap();
        let err = itc
            .send(msg, MailboxId::new(range_for(9), 1), None, None)
            .unwrap_err();
        assert!(matches!(err.error(), ItcError::UnknownDestination(_)));
        itc.delete_mailbox(me).unwrap();
    }

    #[test]
    fn locate_local_name() {
        let itc = standalone(4);
        let id = itc.create_mailbox("svc").unwrap();
        let found = itc.locate("svc", Timeout::NoWait, true).unwrap().unwrap();
        assert_eq!(found.id, id);
        assert_eq!(found.pid, std::process::id());
        assert!(!found.external);
        assert!(itc.locate("nope", Timeout::NoWait, true).unwrap().is_none());
        itc.delete_mailbox(id).unwrap();
    }
}
