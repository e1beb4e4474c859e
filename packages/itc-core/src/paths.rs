//! Socket paths under the configured socket directory.

use std::path::{Path, PathBuf};

/// The Coordinator's well-known handshake socket.
pub fn coordinator_socket(dir: &Path) -> PathBuf {
    dir.join("itc_coord.sock")
}

/// Per-process channel the Coordinator opens for `range`.
pub fn process_channel_socket(dir: &Path, range: u32) -> PathBuf {
    dir.join(format!("itc_coord_{:08x}.sock", range))
}

/// Listening socket of the local-socket transport of `range`.
pub fn lsock_socket(dir: &Path, range: u32) -> PathBuf {
    dir.join(format!("itc_lsock_{:08x}.sock", range))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names() {
        let dir = Path::new("/tmp/itc");
        assert_eq!(
            coordinator_socket(dir),
            PathBuf::from("/tmp/itc/itc_coord.sock")
        );
        assert_eq!(
            process_channel_socket(dir, 0x0010_0000),
            PathBuf::from("/tmp/itc/itc_coord_00100000.sock")
        );
        assert_eq!(
            lsock_socket(dir, 0xFFF0_0000),
            PathBuf::from("/tmp/itc/itc_lsock_fff00000.sock")
        );
    }
}
