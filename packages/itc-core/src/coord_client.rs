//! Client side of the Coordinator handshake.
//!
//! ```text
//! process                               coordinator
//!    | --- connect itc_coord.sock --------->  |
//!    | --- LOCATE_COORD_REQUEST {pid} ----->  |  slot -> LISTENING
//!    | <-- LOCATE_COORD_REPLY {range,..} ---  |  binds itc_coord_<range>.sock
//!    | --- connect itc_coord_<range>.sock ->  |
//!    | <-- CONNECT_ACK ---------------------  |  slot -> CONNECTED
//! ```
//!
//! The per-process channel stays open for the life of the process; the
//! Coordinator reclaims the slot when it closes.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{ItcError, Result};
use crate::paths;
use crate::transport::CoordinatorInfo;
use crate::wire::{ConnectAck, LocateCoordReply, LocateCoordRequest};

/// How long each handshake read may take.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// An established per-process channel to the Coordinator.
#[derive(Debug)]
pub(crate) struct CoordLink {
    pub(crate) info: CoordinatorInfo,
    channel: UnixStream,
}

impl CoordLink {
    pub(crate) fn close(self) {
        let _ = self.channel.shutdown(std::net::Shutdown::Both);
    }
}

/// Run the handshake against the Coordinator listening in `socket_dir`.
pub(crate) fn connect(socket_dir: &Path) -> Result<CoordLink> {
    let pid = std::process::id();
    let mut stream = UnixStream::connect(paths::coordinator_socket(socket_dir))?;
    stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
    stream.write_all(&LocateCoordRequest { pid }.encode())?;

    let mut buf = [0u8; LocateCoordReply::SIZE];
    stream.read_exact(&mut buf)?;
    let reply = LocateCoordReply::decode(&buf)?;
    if reply.is_no_slot() {
        return Err(ItcError::NoProcessSlot);
    }
    if reply.my_range & !reply.coord_mask != 0 || reply.my_range == 0 {
        return Err(ItcError::InvalidArgument(format!(
            "coordinator assigned malformed range {:#010x}",
            reply.my_range
        )));
    }
    debug!(range = format_args!("{:#010x}", reply.my_range), "assigned range");

    let mut channel =
        UnixStream::connect(paths::process_channel_socket(socket_dir, reply.my_range))?;
    channel.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
    let mut ack = [0u8; ConnectAck::SIZE];
    channel.read_exact(&mut ack)?;
    ConnectAck::decode(&ack)?;
    channel.set_read_timeout(None)?;

    info!(
        pid,
        range = format_args!("{:#010x}", reply.my_range),
        coord_id = %reply.coord_id,
        "connected to coordinator"
    );

    Ok(CoordLink {
        info: CoordinatorInfo {
            my_range: reply.my_range,
            coord_mask: reply.coord_mask,
            coord_id: reply.coord_id,
        },
        channel,
    })
}
