// Copyright (c) 2024 - Lucena contributors.
// All rights reserved.
//
// Use of this software is governed by the BSD 3-Clause License
// included in the LICENSE file.

use thiserror::Error;

/// Every failure mode a Lucena component can surface to its caller.
///
/// `AlreadyStarted`/`NotStarted` are split into worker- and service-flavored
/// variants because the two supervisors have independent lifecycles and a
/// caller should never confuse which one rejected a double `start`.
#[derive(Debug, Error)]
pub enum LucenaError {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("no handler matches message")]
    NoHandler,

    #[error("worker pool already started")]
    WorkerAlreadyStarted,

    #[error("worker pool not started")]
    WorkerNotStarted,

    #[error("service already started")]
    ServiceAlreadyStarted,

    #[error("service not started")]
    ServiceNotStarted,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("timed out waiting for signal")]
    Timeout,

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("transport error: {0}")]
    Transport(#[from] zmq::Error),
}

pub type Result<T> = std::result::Result<T, LucenaError>;
