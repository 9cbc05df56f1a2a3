// Copyright (c) 2024 - Lucena contributors.
// All rights reserved.
//
// Use of this software is governed by the BSD 3-Clause License
// included in the LICENSE file.

use crate::error::{LucenaError, Result};
use crate::message::Message;

const DELIMITER: &[u8] = b"";

/// The envelope shape used wherever a single routing identity is enough:
/// `Client <-> Service` on the external router, and what a Worker's own
/// control socket sends/receives (the worker-pool router's ROUTER side
/// auto-prepends the worker's identity, so the worker itself only ever
/// builds this shorter shape).
///
/// `[identity, delimiter, correlationId, delimiter, json]`
pub fn encode_client_envelope(
    identity: &[u8],
    correlation_id: &[u8],
    message: &Message,
) -> Vec<Vec<u8>> {
    vec![
        identity.to_vec(),
        DELIMITER.to_vec(),
        correlation_id.to_vec(),
        DELIMITER.to_vec(),
        message.to_json_bytes(),
    ]
}

pub fn decode_client_envelope(frames: &[Vec<u8>]) -> Result<(Vec<u8>, Vec<u8>, Message)> {
    if frames.len() != 5 {
        return Err(LucenaError::MalformedEnvelope(format!(
            "expected 5 frames, got {}",
            frames.len()
        )));
    }
    if frames[1] != DELIMITER || frames[3] != DELIMITER {
        return Err(LucenaError::MalformedEnvelope(
            "frame 1 or 3 is not the empty delimiter".into(),
        ));
    }
    let identity = frames[0].clone();
    let correlation_id = frames[2].clone();
    let message = Message::from_json_bytes(&frames[4])?;
    Ok((identity, correlation_id, message))
}

/// The envelope shape the Service dispatch loop uses on its worker-pool
/// router to address a specific worker while keeping both the originating
/// client's identity and its correlation id attached for the reply leg.
///
/// `[workerId, delimiter, clientId, delimiter, correlationId, delimiter, json]`
pub fn encode_worker_envelope(
    worker_id: &[u8],
    client_id: &[u8],
    correlation_id: &[u8],
    message: &Message,
) -> Vec<Vec<u8>> {
    vec![
        worker_id.to_vec(),
        DELIMITER.to_vec(),
        client_id.to_vec(),
        DELIMITER.to_vec(),
        correlation_id.to_vec(),
        DELIMITER.to_vec(),
        message.to_json_bytes(),
    ]
}

pub fn decode_worker_envelope(
    frames: &[Vec<u8>],
) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>, Message)> {
    if frames.len() != 7 {
        return Err(LucenaError::MalformedEnvelope(format!(
            "expected 7 frames, got {}",
            frames.len()
        )));
    }
    if frames[1] != DELIMITER || frames[3] != DELIMITER || frames[5] != DELIMITER {
        return Err(LucenaError::MalformedEnvelope(
            "frame 1, 3 or 5 is not the empty delimiter".into(),
        ));
    }
    let worker_id = frames[0].clone();
    let client_id = frames[2].clone();
    let correlation_id = frames[4].clone();
    let message = Message::from_json_bytes(&frames[6])?;
    Ok((worker_id, client_id, correlation_id, message))
}
