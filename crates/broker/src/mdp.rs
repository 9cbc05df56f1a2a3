// Copyright (c) 2024 - Lucena contributors.
// All rights reserved.
//
// Use of this software is governed by the BSD 3-Clause License
// included in the LICENSE file.

//! Wire constants for the Majordomo-variant broker protocol (spec §4.8,
//! §6). Mirrors ZeroMQ's MDP/0.1: one protocol header per peer class, a
//! single command byte for worker frames.

use lucena_core::error::{LucenaError, Result};

pub const C_CLIENT: &[u8] = b"CLIENT#1";
pub const W_WORKER: &[u8] = b"WORKER#1";

pub const INTERNAL_SERVICE_PREFIX: &str = "mmi.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerCommand {
    Ready,
    Request,
    Reply,
    Heartbeat,
    Disconnect,
}

impl WorkerCommand {
    pub fn to_byte(self) -> u8 {
        match self {
            WorkerCommand::Ready => 0x01,
            WorkerCommand::Request => 0x02,
            WorkerCommand::Reply => 0x03,
            WorkerCommand::Heartbeat => 0x04,
            WorkerCommand::Disconnect => 0x05,
        }
    }

    pub fn from_byte(byte: u8) -> Result<WorkerCommand> {
        match byte {
            0x01 => Ok(WorkerCommand::Ready),
            0x02 => Ok(WorkerCommand::Request),
            0x03 => Ok(WorkerCommand::Reply),
            0x04 => Ok(WorkerCommand::Heartbeat),
            0x05 => Ok(WorkerCommand::Disconnect),
            other => Err(LucenaError::ProtocolViolation(format!(
                "unknown worker command byte {other:#x}"
            ))),
        }
    }
}
