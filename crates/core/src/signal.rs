// Copyright (c) 2024 - Lucena contributors.
// All rights reserved.
//
// Use of this software is governed by the BSD 3-Clause License
// included in the LICENSE file.

use zmq::{Context, PAIR};

use crate::error::{LucenaError, Result};
use crate::naming::unique_endpoint;

/// A 4-byte control-plane signal carried over a `PAIR` socket. The high byte
/// is always `0x7f`, which is how a receiver on a mixed channel would tell a
/// signal frame apart from a JSON message frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Ready,
    Stop,
}

const SIGNAL_READY: u32 = 0x7f00_0001;
const SIGNAL_STOP: u32 = 0x7f00_0002;

impl Signal {
    fn code(self) -> u32 {
        match self {
            Signal::Ready => SIGNAL_READY,
            Signal::Stop => SIGNAL_STOP,
        }
    }

    fn encode(self) -> [u8; 4] {
        self.code().to_le_bytes()
    }

    fn decode(bytes: &[u8]) -> Result<Signal> {
        if bytes.len() != 4 {
            return Err(LucenaError::ProtocolViolation(format!(
                "signal frame must be 4 bytes, got {}",
                bytes.len()
            )));
        }
        let code = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if bytes[3] != 0x7f {
            return Err(LucenaError::ProtocolViolation(
                "signal frame missing 0x7f marker byte".into(),
            ));
        }
        match code {
            SIGNAL_READY => Ok(Signal::Ready),
            SIGNAL_STOP => Ok(Signal::Stop),
            other => Err(LucenaError::ProtocolViolation(format!(
                "unknown signal code {other:#x}"
            ))),
        }
    }
}

/// One end of a bound `PAIR`/`PAIR` socket pair used for supervisor <->
/// supervised handshakes (worker pool readiness, dispatch-loop stop).
pub struct SignalEndpoint {
    socket: zmq::Socket,
}

impl SignalEndpoint {
    pub fn signal(&self, signal: Signal) -> Result<()> {
        self.socket.send(&signal.encode(), 0)?;
        Ok(())
    }

    /// Blocks (bounded by `timeout_ms`, `-1` for infinite) until a signal
    /// frame arrives. Returns `LucenaError::Timeout` on expiry.
    pub fn wait(&self, timeout_ms: i64) -> Result<Signal> {
        self.socket.set_rcvtimeo(timeout_ms as i32)?;
        let bytes = match self.socket.recv_bytes(0) {
            Ok(b) => b,
            Err(zmq::Error::EAGAIN) => return Err(LucenaError::Timeout),
            Err(e) => return Err(e.into()),
        };
        Signal::decode(&bytes)
    }

    /// Non-blocking poll: `Ok(None)` if nothing is waiting.
    pub fn poll(&self, timeout_ms: i64) -> Result<Option<Signal>> {
        let mut items = [self.socket.as_poll_item(zmq::POLLIN)];
        let rc = zmq::poll(&mut items, timeout_ms)?;
        if rc == 0 || !items[0].is_readable() {
            return Ok(None);
        }
        let bytes = self.socket.recv_bytes(0)?;
        Ok(Some(Signal::decode(&bytes)?))
    }

    pub fn as_raw_socket(&self) -> &zmq::Socket {
        &self.socket
    }
}

/// Binds a fresh `inproc://` endpoint and returns `(bind_side, connect_side)`,
/// mirroring ZeroMQ's inproc requirement that the bind happen before connect.
pub fn signal_pair(context: &Context, hwm: i32) -> Result<(SignalEndpoint, SignalEndpoint)> {
    let endpoint = unique_endpoint();

    let bind_socket = context.socket(PAIR)?;
    bind_socket.set_sndhwm(hwm)?;
    bind_socket.set_rcvhwm(hwm)?;
    bind_socket.set_linger(0)?;
    bind_socket.bind(&endpoint)?;

    let connect_socket = context.socket(PAIR)?;
    connect_socket.set_sndhwm(hwm)?;
    connect_socket.set_rcvhwm(hwm)?;
    connect_socket.set_linger(0)?;
    connect_socket.connect(&endpoint)?;

    Ok((
        SignalEndpoint { socket: bind_socket },
        SignalEndpoint { socket: connect_socket },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert2::check;

    #[test]
    fn round_trips_ready_and_stop() {
        let ctx = Context::new();
        let (a, b) = signal_pair(&ctx, 1000).unwrap();
        a.signal(Signal::Ready).unwrap();
        check!(b.wait(1000).unwrap() == Signal::Ready);
        b.signal(Signal::Stop).unwrap();
        check!(a.wait(1000).unwrap() == Signal::Stop);
    }

    #[test]
    fn wait_times_out_when_idle() {
        let ctx = Context::new();
        let (_a, b) = signal_pair(&ctx, 1000).unwrap();
        assert!(matches!(b.wait(50), Err(LucenaError::Timeout)));
    }
}
