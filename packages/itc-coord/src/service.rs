//! The handshake service.
//!
//! One task accepts connections on the well-known socket; every handshake
//! becomes a task that owns its slot until the process disconnects or is
//! found dead. A periodic tick drives zombie detection.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{watch, Notify};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use itc_core::paths;
use itc_core::wire::{ConnectAck, LocateCoordReply, LocateCoordRequest};
use itc_core::MailboxId;

use crate::directory::NameDirectory;
use crate::slots::{SlotPools, SlotTicket};

/// Timing knobs of the service loop.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Sweep {
    pub(crate) tick: Duration,
    pub(crate) zombie_ticks: u32,
    pub(crate) low_water: usize,
}

pub(crate) struct Service {
    socket_dir: PathBuf,
    coord_mask: u32,
    coord_id: MailboxId,
    slots: Arc<SlotPools>,
    directory: Arc<NameDirectory>,
    sweep: Sweep,
    /// Wakes the task owning a slot so it reclaims it. Keyed by range.
    cancels: Mutex<HashMap<u32, (u64, Arc<Notify>)>>,
}

fn range_hex(range: u32) -> String {
    format!("{:#010x}", range)
}

impl Service {
    pub(crate) fn new(
        socket_dir: PathBuf,
        coord_mask: u32,
        coord_id: MailboxId,
        slots: Arc<SlotPools>,
        directory: Arc<NameDirectory>,
        sweep: Sweep,
    ) -> Self {
        Self {
            socket_dir,
            coord_mask,
            coord_id,
            slots,
            directory,
            sweep,
            cancels: Mutex::new(HashMap::new()),
        }
    }

    fn cancels(&self) -> MutexGuard<'_, HashMap<u32, (u64, Arc<Notify>)>> {
        self.cancels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Serve until `shutdown` flips to true or its sender goes away.
    pub(crate) async fn run(
        self: Arc<Self>,
        listener: UnixListener,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut tasks = JoinSet::new();
        let mut ticker = tokio::time::interval(self.sweep.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let service = Arc::clone(&self);
                        tasks.spawn(async move { service.handshake(stream).await });
                    }
                    Err(e) => warn!(error = %e, "accept failed on coordinator socket"),
                },
                _ = ticker.tick() => self.sweep_zombies(),
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!(error = %e, "process task panicked");
                        }
                    }
                }
            }
        }

        tasks.shutdown().await;
        drop(listener);
        for range in self.slots.used_ranges() {
            remove_socket(&paths::process_channel_socket(&self.socket_dir, range));
        }
        remove_socket(&paths::coordinator_socket(&self.socket_dir));
        info!("coordinator service stopped");
    }

    async fn handshake(self: Arc<Self>, mut stream: UnixStream) {
        let mut buf = [0u8; LocateCoordRequest::SIZE];
        if let Err(e) = stream.read_exact(&mut buf).await {
            warn!(error = %e, "peer left during handshake");
            return;
        }
        let request = match LocateCoordRequest::decode(&buf) {
            Ok(request) => request,
            Err(e) => {
                error!(error = %e, "malformed locate-coordinator request");
                return;
            }
        };

        let Some(ticket) = self.slots.acquire(request.pid) else {
            warn!(pid = request.pid, "no free process slot");
            let reply = LocateCoordReply::no_slot(self.coord_mask, self.coord_id);
            if let Err(e) = stream.write_all(&reply.encode()).await {
                debug!(error = %e, "cannot send no-slot reply");
            }
            return;
        };

        let path = paths::process_channel_socket(&self.socket_dir, ticket.range);
        let channel = match bind_fresh(&path) {
            Ok(channel) => channel,
            Err(e) => {
                error!(path = %path.display(), error = %e, "cannot open process channel");
                self.reclaim(ticket, "channel bind failed");
                let reply = LocateCoordReply::no_slot(self.coord_mask, self.coord_id);
                let _ = stream.write_all(&reply.encode()).await;
                return;
            }
        };

        let cancel = Arc::new(Notify::new());
        self.cancels()
            .insert(ticket.range, (ticket.generation, Arc::clone(&cancel)));

        let reply = LocateCoordReply {
            my_range: ticket.range,
            coord_mask: self.coord_mask,
            coord_id: self.coord_id,
        };
        if let Err(e) = stream.write_all(&reply.encode()).await {
            warn!(pid = request.pid, error = %e, "peer left before receiving its range");
            drop(channel);
            self.reclaim(ticket, "handshake aborted");
            return;
        }
        drop(stream);

        debug!(
            pid = request.pid,
            range = %range_hex(ticket.range),
            "slot listening"
        );
        self.serve_process(ticket, request.pid, channel, cancel).await;
    }

    async fn serve_process(
        &self,
        ticket: SlotTicket,
        pid: u32,
        channel: UnixListener,
        cancel: Arc<Notify>,
    ) {
        let accepted = tokio::select! {
            _ = cancel.notified() => None,
            accepted = channel.accept() => match accepted {
                Ok((conn, _)) => Some(conn),
                Err(e) => {
                    warn!(range = %range_hex(ticket.range), error = %e, "process channel accept failed");
                    None
                }
            },
        };
        drop(channel);

        let Some(mut conn) = accepted else {
            self.reclaim(ticket, "never connected");
            return;
        };
        remove_socket(&paths::process_channel_socket(&self.socket_dir, ticket.range));

        if !self.slots.mark_connected(ticket) {
            return;
        }
        if let Err(e) = conn.write_all(&ConnectAck.encode()).await {
            warn!(pid, error = %e, "cannot acknowledge process channel");
            self.reclaim(ticket, "acknowledgement failed");
            return;
        }
        info!(pid, range = %range_hex(ticket.range), "process connected");

        let mut scratch = [0u8; 64];
        loop {
            tokio::select! {
                _ = cancel.notified() => break,
                read = conn.read(&mut scratch) => match read {
                    Ok(0) => break,
                    Ok(n) => debug!(pid, bytes = n, "ignoring data on process channel"),
                    Err(e) => {
                        debug!(pid, error = %e, "process channel error");
                        break;
                    }
                },
            }
        }
        self.reclaim(ticket, "disconnected");
    }

    /// Return a slot to the free pool and forget everything about its
    /// process. Only the task owning `ticket` calls this.
    fn reclaim(&self, ticket: SlotTicket, reason: &'static str) {
        {
            let mut cancels = self.cancels();
            let owned = cancels
                .get(&ticket.range)
                .is_some_and(|(generation, _)| *generation == ticket.generation);
            if owned {
                cancels.remove(&ticket.range);
            }
        }
        if !self.slots.is_current(ticket) {
            return;
        }

        // Files go before the slot does; a new owner rebinds them.
        remove_socket(&paths::process_channel_socket(&self.socket_dir, ticket.range));
        remove_socket(&paths::lsock_socket(&self.socket_dir, ticket.range));
        let purged = self.directory.purge_range(ticket.range, self.coord_mask);

        if let Some(slot) = self.slots.release(ticket) {
            info!(
                pid = slot.pid,
                range = %range_hex(ticket.range),
                purged = purged.len(),
                reason,
                "reclaimed process slot"
            );
        }
    }

    /// One service-loop iteration of zombie detection.
    fn sweep_zombies(&self) {
        let due = self
            .slots
            .tick_listening(self.sweep.zombie_ticks, self.sweep.low_water);
        for (ticket, pid) in due {
            if process_alive(pid) {
                continue;
            }
            let cancel = match self.cancels().get(&ticket.range) {
                Some((generation, cancel)) if *generation == ticket.generation => Arc::clone(cancel),
                _ => {
                    debug!(range = %range_hex(ticket.range), "zombie slot has no owner yet");
                    continue;
                }
            };
            warn!(pid, range = %range_hex(ticket.range), "process is gone, reclaiming zombie slot");
            cancel.notify_one();
        }
    }
}

/// Probe `pid` with signal 0.
fn process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(Errno::EPERM) => true,
        Err(e) => {
            warn!(pid, error = %e, "liveness probe failed");
            true
        }
    }
}

/// Bind `path`, replacing a socket file left by an earlier owner.
pub(crate) fn bind_fresh(path: &Path) -> std::io::Result<UnixListener> {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed stale socket"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    UnixListener::bind(path)
}

fn remove_socket(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => debug!(path = %path.display(), error = %e, "cannot remove socket"),
    }
}
