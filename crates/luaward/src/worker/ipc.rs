//! Length-prefixed framing over the raw pipe file descriptors connecting
//! a worker to its parent. Mirrors the framed blocking send/recv helpers
//! used by fork-based worker processes elsewhere in the ecosystem: a
//! 4-byte little-endian length prefix followed by a `bincode`-encoded
//! payload, written/read in full before the next frame is attempted.

use std::os::fd::{AsFd, BorrowedFd};

use nix::unistd::{read, write};
use serde::{de::DeserializeOwned, Serialize};

use crate::types::WorkerError;

const LENGTH_PREFIX_BYTES: usize = 4;

/// Largest single frame this channel accepts. Guards against a corrupted
/// length prefix causing an unbounded allocation.
const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

fn read_exact(fd: BorrowedFd<'_>, buf: &mut [u8]) -> Result<(), WorkerError> {
    let mut read_total = 0;
    while read_total < buf.len() {
        let n = read(fd, &mut buf[read_total..]).map_err(|e| WorkerError::Io(e.to_string()))?;
        if n == 0 {
            return Err(WorkerError::Io("peer closed pipe mid-frame".to_string()));
        }
        read_total += n;
    }
    Ok(())
}

fn write_all(fd: BorrowedFd<'_>, mut buf: &[u8]) -> Result<(), WorkerError> {
    while !buf.is_empty() {
        let n = write(fd, buf).map_err(|e| WorkerError::Io(e.to_string()))?;
        if n == 0 {
            return Err(WorkerError::Io("write returned zero bytes".to_string()));
        }
        buf = &buf[n..];
    }
    Ok(())
}

/// Encodes `value` and writes it as one length-prefixed frame to `fd`.
pub fn send<T: Serialize>(fd: &impl AsFd, value: &T) -> Result<(), WorkerError> {
    let payload = bincode::serialize(value).map_err(|e| WorkerError::Io(e.to_string()))?;
    let len = u32::try_from(payload.len()).map_err(|_| {
        WorkerError::Io(format!("frame of {} bytes exceeds u32 range", payload.len()))
    })?;
    let fd = fd.as_fd();
    write_all(fd, &len.to_le_bytes())?;
    write_all(fd, &payload)?;
    Ok(())
}

/// Reads one length-prefixed frame from `fd` and decodes it.
pub fn recv<T: DeserializeOwned>(fd: &impl AsFd) -> Result<T, WorkerError> {
    let fd = fd.as_fd();
    let mut len_buf = [0u8; LENGTH_PREFIX_BYTES];
    read_exact(fd, &mut len_buf)?;
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(WorkerError::Io(format!(
            "frame length {len} exceeds maximum of {MAX_FRAME_BYTES}"
        )));
    }
    let mut payload = vec![0u8; len as usize];
    read_exact(fd, &mut payload)?;
    bincode::deserialize(&payload).map_err(|e| WorkerError::Io(e.to_string()))
}
