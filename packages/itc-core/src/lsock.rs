//! Local-socket transport: delivery to other processes on the host.
//!
//! Every process listens on `itc_lsock_<range>.sock` in the socket
//! directory. A sender keeps one connection per destination process and
//! writes length-prefixed frames (see [`crate::wire::encode_frame`]). The
//! receiving side runs one reader thread per inbound connection; each frame
//! is copied into a fresh local message and handed to the core, which queues
//! it like an in-process send.
//!
//! One connection per process pair with one reader keeps messages from a
//! single sender in order.

use std::collections::HashMap;
use std::io::{self, ErrorKind, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, trace, warn};

use crate::coord_client::{self, CoordLink};
use crate::error::{ItcError, Result, SendError};
use crate::mailbox::MailboxQueue;
use crate::mbox_id::MailboxId;
use crate::message::Message;
use crate::paths;
use crate::transport::{CoordinatorInfo, Delivery, LocalSink, Setup, Transport};
use crate::wire::{self, MAX_FRAME_PAYLOAD};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy)]
struct Routing {
    my_range: u32,
    coord_mask: u32,
}

/// Open inbound connections by accept sequence number. Each reader removes
/// its own entry when the connection ends.
type Inbound = Arc<Mutex<HashMap<u64, UnixStream>>>;

/// Cached outbound connection. Writers to the same peer serialize on it;
/// writers to other peers do not.
type Peer = Arc<Mutex<UnixStream>>;

#[derive(Debug)]
struct Listening {
    path: PathBuf,
    shutdown: Arc<AtomicBool>,
    inbound: Inbound,
    acceptor: Option<JoinHandle<()>>,
}

#[derive(Debug)]
pub(crate) struct LsockTransport {
    socket_dir: PathBuf,
    /// The Coordinator does not hand itself a range.
    coordinator: bool,
    routing: Mutex<Option<Routing>>,
    listening: Mutex<Option<Listening>>,
    link: Mutex<Option<CoordLink>>,
    peers: Mutex<HashMap<u32, Peer>>,
}

impl LsockTransport {
    pub(crate) fn new(socket_dir: impl Into<PathBuf>) -> Self {
        Self {
            socket_dir: socket_dir.into(),
            coordinator: false,
            routing: Mutex::new(None),
            listening: Mutex::new(None),
            link: Mutex::new(None),
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// The transport of the Coordinator process itself.
    pub(crate) fn for_coordinator(socket_dir: impl Into<PathBuf>) -> Self {
        Self {
            coordinator: true,
            ..Self::new(socket_dir)
        }
    }

    fn connect_peer(&self, range: u32) -> io::Result<UnixStream> {
        UnixStream::connect(paths::lsock_socket(&self.socket_dir, range))
    }

    /// Write `frame` on the cached connection to `range`, reconnecting once
    /// if the cached connection went stale.
    ///
    /// The peer map is only locked to look up or publish a connection.
    /// Connecting happens outside any lock and writing under the peer's own.
    fn write_frame(&self, range: u32, frame: &[u8]) -> io::Result<()> {
        let cached = lock(&self.peers).get(&range).cloned();
        if let Some(peer) = cached {
            let written = lock(&peer).write_all(frame);
            match written {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!(peer = format_args!("{:#010x}", range), error = %e, "stale peer connection");
                    self.forget_peer(range, &peer);
                }
            }
        }

        let fresh = self.connect_peer(range)?;
        // Another sender may have reconnected meanwhile. Use its connection
        // so every sender to this peer shares one ordered stream.
        let peer = Arc::clone(
            lock(&self.peers)
                .entry(range)
                .or_insert_with(|| Arc::new(Mutex::new(fresh))),
        );
        let written = lock(&peer).write_all(frame);
        if written.is_err() {
            self.forget_peer(range, &peer);
        }
        written
    }

    /// Drop the cached connection to `range` if it is still `peer`.
    fn forget_peer(&self, range: u32, peer: &Peer) {
        let mut peers = lock(&self.peers);
        if peers.get(&range).is_some_and(|cached| Arc::ptr_eq(cached, peer)) {
            peers.remove(&range);
        }
    }

    #[cfg(test)]
    fn inbound_count(&self) -> usize {
        lock(&self.listening)
            .as_ref()
            .map_or(0, |listening| lock(&listening.inbound).len())
    }
}

fn spawn_acceptor(
    listener: UnixListener,
    shutdown: Arc<AtomicBool>,
    inbound: Inbound,
    sink: Weak<dyn LocalSink>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("itc-lsock-accept".to_string())
        .spawn(move || {
            let mut next_key = 0u64;
            for conn in listener.incoming() {
                if shutdown.load(Ordering::Acquire) {
                    break;
                }
                let stream = match conn {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(error = %e, "lsock accept failed");
                        continue;
                    }
                };
                let key = next_key;
                next_key += 1;
                match stream.try_clone() {
                    Ok(clone) => {
                        lock(&inbound).insert(key, clone);
                    }
                    Err(e) => {
                        warn!(error = %e, "cannot track inbound connection");
                        continue;
                    }
                }
                let sink = sink.clone();
                let tracked = Arc::clone(&inbound);
                let spawned = thread::Builder::new()
                    .name("itc-lsock-read".to_string())
                    .spawn(move || {
                        read_frames(stream, sink);
                        lock(&tracked).remove(&key);
                    });
                if let Err(e) = spawned {
                    error!(error = %e, "cannot spawn lsock reader");
                    lock(&inbound).remove(&key);
                }
            }
        })
}

/// Read frames until EOF and deliver them.
fn read_frames(mut stream: UnixStream, sink: Weak<dyn LocalSink>) {
    let mut len_buf = [0u8; 4];
    let mut body = Vec::new();

    loop {
        match stream.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => {
                debug!(error = %e, "lsock connection closed");
                break;
            }
        }

        let len = match wire::check_frame_len(u32::from_be_bytes(len_buf)) {
            Ok(len) => len,
            Err(e) => {
                error!(error = %e, "dropping lsock connection on bad frame length");
                break;
            }
        };
        body.resize(len, 0);
        if let Err(e) = stream.read_exact(&mut body) {
            warn!(error = %e, "lsock connection closed mid-frame");
            break;
        }

        let Some(sink) = sink.upgrade() else {
            break;
        };
        if let Err(e) = deliver_frame(sink.as_ref(), &body) {
            warn!(error = %e, "dropping inbound frame");
        }
    }
}

fn deliver_frame(sink: &dyn LocalSink, body: &[u8]) -> Result<()> {
    let frame = wire::decode_frame_body(body)?;
    let header = frame.header;

    let mut message = sink.allocate(header.kind, frame.payload.len())?;
    message.payload_mut().copy_from_slice(frame.payload);
    message.stamp(header.sender, header.receiver);
    message.set_flags(header.flags);

    trace!(
        from = %header.sender,
        to = %header.receiver,
        kind = header.kind,
        "inbound frame"
    );

    sink.deliver(message).map_err(|e| e.into_parts().0)
}

impl Transport for LsockTransport {
    fn name(&self) -> &'static str {
        "lsock"
    }

    fn locate_coordinator(&self) -> Option<Result<CoordinatorInfo>> {
        if self.coordinator {
            return None;
        }
        Some(coord_client::connect(&self.socket_dir).map(|link| {
            let info = link.info;
            *lock(&self.link) = Some(link);
            info
        }))
    }

    fn init(&self, setup: &Setup<'_>, sink: Weak<dyn LocalSink>) -> Result<()> {
        std::fs::create_dir_all(setup.socket_dir)?;
        let path = paths::lsock_socket(setup.socket_dir, setup.my_range);
        remove_stale(&path)?;
        let listener = UnixListener::bind(&path)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let inbound = Arc::new(Mutex::new(HashMap::new()));
        let acceptor = spawn_acceptor(listener, Arc::clone(&shutdown), Arc::clone(&inbound), sink)?;

        debug!(
            path = %path.display(),
            mailboxes = setup.mailbox_count,
            "lsock transport listening"
        );
        *lock(&self.routing) = Some(Routing {
            my_range: setup.my_range,
            coord_mask: setup.coord_mask,
        });
        *lock(&self.listening) = Some(Listening {
            path,
            shutdown,
            inbound,
            acceptor: Some(acceptor),
        });
        Ok(())
    }

    fn exit(&self) {
        *lock(&self.routing) = None;
        lock(&self.peers).clear();

        if let Some(mut listening) = lock(&self.listening).take() {
            listening.shutdown.store(true, Ordering::Release);
            // Wake the acceptor so it sees the flag.
            let _ = UnixStream::connect(&listening.path);
            if let Some(acceptor) = listening.acceptor.take() {
                let _ = acceptor.join();
            }
            for (_, conn) in lock(&listening.inbound).drain() {
                let _ = conn.shutdown(Shutdown::Both);
            }
            if let Err(e) = std::fs::remove_file(&listening.path) {
                debug!(path = %listening.path.display(), error = %e, "cannot remove lsock socket");
            }
        }

        if let Some(link) = lock(&self.link).take() {
            link.close();
        }
    }

    fn send(&self, message: Message, to: MailboxId, _dest: Option<&mut MailboxQueue>) -> Delivery {
        let Some(routing) = *lock(&self.routing) else {
            return Delivery::NotMine(message);
        };
        let range = to.process_range(routing.coord_mask);
        if range == 0 || range == routing.my_range {
            return Delivery::NotMine(message);
        }

        let frame = wire::encode_frame(&message);
        match self.write_frame(range, &frame) {
            Ok(()) => Delivery::Delivered,
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::ConnectionRefused) => {
                debug!(to = %to, "receiver has no lsock channel yet");
                Delivery::Failed(SendError::new(ItcError::ReceiverNotReady(to), message))
            }
            Err(e) => Delivery::Failed(SendError::new(ItcError::Io(e), message)),
        }
    }

    fn max_message_size(&self) -> usize {
        MAX_FRAME_PAYLOAD
    }
}

/// Remove a socket file left behind by a previous owner of the range.
fn remove_stale(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "removed stale socket");
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
