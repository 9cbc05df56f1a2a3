// Copyright (c) 2024 - Lucena contributors.
// All rights reserved.
//
// Use of this software is governed by the BSD 3-Clause License
// included in the LICENSE file.

use zmq::Socket;

use crate::error::Result;

/// Thin helpers over `zmq::Socket` that convert to `LucenaError::Transport`
/// and centralize the HWM/LINGER defaults every internal socket in this
/// workspace is built with.
pub fn configure_internal_socket(socket: &Socket, hwm: i32) -> Result<()> {
    socket.set_sndhwm(hwm)?;
    socket.set_rcvhwm(hwm)?;
    socket.set_linger(0)?;
    Ok(())
}

pub fn send_multipart(socket: &Socket, frames: &[Vec<u8>]) -> Result<()> {
    let parts: Vec<&[u8]> = frames.iter().map(|f| f.as_slice()).collect();
    socket.send_multipart(parts, 0)?;
    Ok(())
}

pub fn recv_multipart(socket: &Socket) -> Result<Vec<Vec<u8>>> {
    Ok(socket.recv_multipart(0)?)
}

/// Polls a single socket for readability, bounded by `timeout_ms`
/// (`-1` blocks indefinitely). Returns `false` on timeout.
pub fn poll_readable(socket: &Socket, timeout_ms: i64) -> Result<bool> {
    let mut items = [socket.as_poll_item(zmq::POLLIN)];
    let rc = zmq::poll(&mut items, timeout_ms)?;
    Ok(rc > 0 && items[0].is_readable())
}
