//! The name server.
//!
//! A dedicated thread owns the Coordinator's `itc_coord` mailbox and
//! answers ADD, RMV and LOCATE messages against the [`NameDirectory`].
//! Lookups that miss locally may be handed to a gateway mailbox registered
//! under [`GATEWAY_MAILBOX_NAME`]; its answers are relayed back to the
//! requester.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use itc_core::wire::{
    GatewayLocateReply, GatewayLocateRequest, LocateReply, LocateRequest, MailboxNotice,
    ADD_MAILBOX, GW_LOCATE_REPLY, GW_LOCATE_REQUEST, LOCATE_REPLY, LOCATE_REQUEST, RMV_MAILBOX,
};
use itc_core::{Itc, MailboxId, Message, Timeout, COORD_RANGE, GATEWAY_MAILBOX_NAME};

use crate::directory::NameDirectory;
use crate::error::{CoordError, Result};
use crate::slots::SlotPools;

/// Name of the Coordinator's own mailbox.
pub const NAME_SERVER_MAILBOX: &str = "itc_coord";

/// How often the thread checks its stop flag.
const POLL_INTERVAL: Timeout = Timeout::Millis(100);

/// Longest a gateway lookup may stay unanswered when the requester waits
/// forever.
const MAX_GATEWAY_WAIT: Duration = Duration::from_secs(60);

/// Handle to the running name-server thread.
pub(crate) struct NameServer {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl NameServer {
    /// Start the thread. The receiver resolves once the mailbox exists and
    /// is registered, or with the reason it could not be.
    pub(crate) fn spawn(
        itc: Itc,
        slots: Arc<SlotPools>,
        directory: Arc<NameDirectory>,
    ) -> Result<(Self, oneshot::Receiver<Result<MailboxId>>)> {
        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = oneshot::channel();

        let state = State {
            pid: std::process::id(),
            namespace: itc.namespace().to_string(),
            itc,
            slots,
            directory,
            pending: HashMap::new(),
            next_tag: 1,
        };
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("itc-name-server".to_string())
            .spawn(move || state.serve(&flag, ready_tx))?;

        Ok((
            Self {
                stop,
                handle: Some(handle),
            },
            ready_rx,
        ))
    }

    /// Stop the thread and wait for it. Blocks for up to one poll interval.
    pub(crate) fn stop(mut self) -> Result<()> {
        self.stop.store(true, Ordering::Release);
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| CoordError::NameServer("thread panicked".to_string())),
            None => Ok(()),
        }
    }
}

impl Drop for NameServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

struct PendingLocate {
    requester: MailboxId,
    name: String,
    deadline: Instant,
}

struct State {
    itc: Itc,
    slots: Arc<SlotPools>,
    directory: Arc<NameDirectory>,
    namespace: String,
    pid: u32,
    /// Gateway lookups in flight, by tag.
    pending: HashMap<u32, PendingLocate>,
    next_tag: u32,
}

impl State {
    fn serve(mut self, stop: &AtomicBool, ready: oneshot::Sender<Result<MailboxId>>) {
        let me = match self.register() {
            Ok(me) => me,
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        };
        info!(mbox_id = %me, "name server ready");
        if ready.send(Ok(me)).is_err() {
            debug!("coordinator gave up waiting for the name server");
        }

        while !stop.load(Ordering::Acquire) {
            match self.itc.receive(POLL_INTERVAL) {
                Ok(Some(message)) => self.handle(message),
                Ok(None) => {}
                Err(e) => {
                    error!(error = %e, "name server cannot receive");
                    break;
                }
            }
            self.expire_pending();
        }

        if let Err(e) = self.directory.remove(NAME_SERVER_MAILBOX, me) {
            debug!(error = %e, "name server entry already gone");
        }
        if let Err(e) = self.itc.delete_mailbox(me) {
            warn!(error = %e, "cannot delete name server mailbox");
        }
        debug!("name server stopped");
    }

    fn register(&self) -> Result<MailboxId> {
        let me = self.itc.create_mailbox(NAME_SERVER_MAILBOX)?;
        if me != self.itc.coordinator() {
            let _ = self.itc.delete_mailbox(me);
            return Err(CoordError::NameServer(format!(
                "mailbox {} is not the advertised coordinator id {}",
                me,
                self.itc.coordinator()
            )));
        }
        self.directory
            .insert(NAME_SERVER_MAILBOX, me)
            .map_err(|e| CoordError::NameServer(e.to_string()))?;
        Ok(me)
    }

    fn handle(&mut self, message: Message) {
        match message.kind() {
            ADD_MAILBOX => self.on_add(&message),
            RMV_MAILBOX => self.on_remove(&message),
            LOCATE_REQUEST => self.on_locate(&message),
            GW_LOCATE_REPLY => self.on_gateway_reply(&message),
            kind => warn!(
                kind = format_args!("{:#010x}", kind),
                from = %message.sender(),
                "unexpected message"
            ),
        }
        if let Err(e) = self.itc.free(message) {
            error!(error = %e, "cannot free message");
        }
    }

    /// The sender must live in the same range as `id`, and that range must
    /// belong to a connected process.
    fn owns(&self, sender: MailboxId, id: MailboxId) -> bool {
        let mask = self.itc.coord_mask();
        let range = id.process_range(mask);
        sender.process_range(mask) == range && self.slots.is_connected(range)
    }

    fn on_add(&self, message: &Message) {
        let notice = match MailboxNotice::decode(message.payload()) {
            Ok(notice) => notice,
            Err(e) => {
                error!(from = %message.sender(), error = %e, "malformed mailbox notice");
                return;
            }
        };
        if !self.owns(message.sender(), notice.mbox_id) {
            error!(
                from = %message.sender(),
                mbox_id = %notice.mbox_id,
                name = %notice.name,
                "ADD from a process without a connected slot"
            );
            return;
        }
        match self.directory.insert(&notice.name, notice.mbox_id) {
            Ok(()) => debug!(mbox_id = %notice.mbox_id, name = %notice.name, "registered"),
            Err(e) => error!(error = %e, "directory integrity error"),
        }
    }

    fn on_remove(&self, message: &Message) {
        let notice = match MailboxNotice::decode(message.payload()) {
            Ok(notice) => notice,
            Err(e) => {
                error!(from = %message.sender(), error = %e, "malformed mailbox notice");
                return;
            }
        };
        if !self.owns(message.sender(), notice.mbox_id) {
            // The slot may already be reclaimed, which purged the entry.
            debug!(
                from = %message.sender(),
                name = %notice.name,
                "RMV from a process without a connected slot"
            );
            return;
        }
        match self.directory.remove(&notice.name, notice.mbox_id) {
            Ok(()) => debug!(mbox_id = %notice.mbox_id, name = %notice.name, "unregistered"),
            Err(e) => error!(error = %e, "directory integrity error"),
        }
    }

    fn on_locate(&mut self, message: &Message) {
        let request = match LocateRequest::decode(message.payload()) {
            Ok(request) => request,
            Err(e) => {
                error!(from = %message.sender(), error = %e, "malformed locate request");
                return;
            }
        };

        if let Some(id) = self.directory.lookup(&request.name) {
            let range = id.process_range(self.itc.coord_mask());
            let pid = if range == COORD_RANGE {
                self.pid
            } else {
                self.slots.pid_of(range).unwrap_or(0)
            };
            self.reply(
                request.requester,
                LocateReply {
                    mbox_id: id,
                    pid,
                    external: false,
                    namespace: self.namespace.clone(),
                    name: request.name,
                },
            );
            return;
        }

        if !request.internal_only && self.forward_to_gateway(&request) {
            return;
        }
        debug!(name = %request.name, "locate miss");
        self.reply(request.requester, LocateReply::not_found(&request.name));
    }

    /// Hand a miss to the gateway. False when there is no gateway or it
    /// cannot be reached.
    fn forward_to_gateway(&mut self, request: &LocateRequest) -> bool {
        let Some(gateway) = self.directory.lookup(GATEWAY_MAILBOX_NAME) else {
            return false;
        };

        let tag = self.next_tag;
        self.next_tag = self.next_tag.wrapping_add(1).max(1);
        let forwarded = GatewayLocateRequest {
            tag,
            timeout_ms: request.timeout_ms,
            name: request.name.clone(),
        };
        let message = forwarded
            .encode()
            .map_err(itc_core::ItcError::from)
            .and_then(|payload| self.itc.alloc_with(GW_LOCATE_REQUEST, &payload));
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "cannot build gateway locate request");
                return false;
            }
        };
        if let Err(e) = self.itc.send(message, gateway, None, None) {
            let (error, message) = e.into_parts();
            warn!(gateway = %gateway, error = %error, "gateway unreachable");
            let _ = self.itc.free(message);
            return false;
        }

        let wait = match request.timeout_ms {
            u32::MAX => MAX_GATEWAY_WAIT,
            ms => Duration::from_millis(u64::from(ms)),
        };
        self.pending.insert(
            tag,
            PendingLocate {
                requester: request.requester,
                name: request.name.clone(),
                deadline: Instant::now() + wait,
            },
        );
        debug!(name = %request.name, tag, "forwarded locate to gateway");
        true
    }

    fn on_gateway_reply(&mut self, message: &Message) {
        let reply = match GatewayLocateReply::decode(message.payload()) {
            Ok(reply) => reply,
            Err(e) => {
                error!(from = %message.sender(), error = %e, "malformed gateway reply");
                return;
            }
        };
        let Some(pending) = self.pending.remove(&reply.tag) else {
            debug!(tag = reply.tag, "gateway reply for an expired lookup");
            return;
        };

        let answer = if reply.mbox_id.is_none() {
            LocateReply::not_found(&pending.name)
        } else {
            LocateReply {
                mbox_id: reply.mbox_id,
                pid: 0,
                external: true,
                namespace: reply.namespace,
                name: pending.name,
            }
        };
        self.reply(pending.requester, answer);
    }

    /// Answer gateway lookups that ran out of time with not-found.
    fn expire_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let now = Instant::now();
        let expired: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in expired {
            if let Some(pending) = self.pending.remove(&tag) {
                debug!(name = %pending.name, tag, "gateway lookup expired");
                self.reply(pending.requester, LocateReply::not_found(&pending.name));
            }
        }
    }

    fn reply(&self, to: MailboxId, reply: LocateReply) {
        let message = reply
            .encode()
            .map_err(itc_core::ItcError::from)
            .and_then(|payload| self.itc.alloc_with(LOCATE_REPLY, &payload));
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                error!(to = %to, error = %e, "cannot build locate reply");
                return;
            }
        };
        if let Err(e) = self.itc.send(message, to, None, None) {
            let (error, message) = e.into_parts();
            if error.is_transient() {
                debug!(to = %to, error = %error, "requester not reachable");
            } else {
                warn!(to = %to, error = %error, "cannot send locate reply");
            }
            let _ = self.itc.free(message);
        }
    }
}
