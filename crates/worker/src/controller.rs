// Copyright (c) 2024 - Lucena contributors.
// All rights reserved.
//
// Use of this software is governed by the BSD 3-Clause License
// included in the LICENSE file.

use std::thread::JoinHandle;
use std::time::Duration;

use serde_json::json;
use tracing::{info, warn};

use lucena_core::error::{LucenaError, Result};
use lucena_core::message::Message;
use lucena_core::naming::unique_endpoint;
use lucena_core::socket::{configure_internal_socket, recv_multipart, send_multipart};
use lucena_core::{decode_worker_envelope, encode_worker_envelope};

use crate::worker::{bounded_join, Worker, VOID_CLIENT};

pub type WorkerId = Vec<u8>;
const DEFAULT_STOP_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Spawns N worker loops, handshakes their readiness, routes requests to a
/// chosen worker, and stops them. Holds the single ROUTER endpoint every
/// spawned worker's `REQ` control socket connects to.
pub struct WorkerSupervisor {
    context: zmq::Context,
    router_endpoint: String,
    router: Option<zmq::Socket>,
    workers: Vec<(WorkerId, JoinHandle<()>)>,
}

impl WorkerSupervisor {
    pub fn new(context: zmq::Context) -> Self {
        WorkerSupervisor {
            router_endpoint: unique_endpoint(),
            context,
            router: None,
            workers: Vec::new(),
        }
    }

    pub fn is_started(&self) -> bool {
        self.router.is_some()
    }

    pub fn router_endpoint(&self) -> &str {
        &self.router_endpoint
    }

    /// Spawns `n` worker loops built by `worker_factory`, blocks until each
    /// has sent its `READY` envelope, and returns their identities in
    /// registration order.
    pub fn start<F>(&mut self, n: i64, worker_factory: F) -> Result<Vec<WorkerId>>
    where
        F: Fn() -> Worker,
    {
        if n < 1 {
            return Err(LucenaError::InvalidArgument(
                "worker count must be a positive integer".into(),
            ));
        }
        if self.is_started() {
            return Err(LucenaError::WorkerAlreadyStarted);
        }

        let router = self.context.socket(zmq::ROUTER)?;
        configure_internal_socket(&router, 1000)?;
        router.bind(&self.router_endpoint)?;

        let mut handles = Vec::with_capacity(n as usize);
        for i in 0..n {
            let context = self.context.clone();
            let endpoint = self.router_endpoint.clone();
            let identity = format!("worker-{i}").into_bytes();
            let worker = worker_factory();
            let spawn_identity = identity.clone();
            handles.push(std::thread::spawn(move || {
                if let Err(e) = worker.run(&context, &endpoint, &spawn_identity) {
                    warn!(error = %e, "worker loop exited with error");
                }
            }));
        }

        let mut identities = Vec::with_capacity(n as usize);
        for _ in 0..n {
            let frames = recv_multipart(&router)?;
            let (worker_id, _client, _corr, _ready) = decode_worker_envelope(&frames)?;
            identities.push(worker_id);
        }
        info!(count = n, "worker pool ready");

        self.router = Some(router);
        self.workers = identities.clone().into_iter().zip(handles).collect();
        Ok(identities)
    }

    /// Sends `{$signal:"stop"}` to every worker, awaits its `$rep:"OK"` ack,
    /// then joins its thread with a bounded wait. Idempotent: a second call
    /// on an already-stopped supervisor is a no-op.
    pub fn stop(&mut self, timeout: Option<Duration>) -> Result<()> {
        let Some(router) = self.router.take() else {
            return Ok(());
        };
        let timeout = timeout.unwrap_or(DEFAULT_STOP_ACK_TIMEOUT);

        let stop_message = Message::stop_signal();
        for (worker_id, _) in &self.workers {
            let frames = encode_worker_envelope(worker_id, VOID_CLIENT, b"", &stop_message);
            if let Err(e) = send_multipart(&router, &frames) {
                warn!(error = %e, "failed to send stop to worker, continuing shutdown");
                continue;
            }
            match recv_multipart(&router).and_then(|f| decode_worker_envelope(&f)) {
                Ok((_, _, _, reply)) if reply.get("$rep") == Some(&json!("OK")) => {}
                Ok(_) => warn!("worker did not ack stop with $rep:\"OK\""),
                Err(e) => warn!(error = %e, "failed to read stop ack from worker"),
            }
        }

        for (worker_id, handle) in self.workers.drain(..) {
            if !bounded_join(handle, timeout) {
                warn!(worker = ?String::from_utf8_lossy(&worker_id), "worker thread did not join within timeout");
            }
        }
        drop(router);
        Ok(())
    }

    pub fn send(&self, worker_id: &[u8], client_id: &[u8], correlation_id: &[u8], message: &Message) -> Result<()> {
        let router = self.router.as_ref().ok_or(LucenaError::WorkerNotStarted)?;
        send_multipart(router, &encode_worker_envelope(worker_id, client_id, correlation_id, message))
    }

    pub fn recv(&self) -> Result<(WorkerId, Vec<u8>, Vec<u8>, Message)> {
        let router = self.router.as_ref().ok_or(LucenaError::WorkerNotStarted)?;
        let frames = recv_multipart(router)?;
        decode_worker_envelope(&frames)
    }

    pub fn raw_router(&self) -> Option<&zmq::Socket> {
        self.router.as_ref()
    }
}

impl Drop for WorkerSupervisor {
    fn drop(&mut self) {
        if self.is_started() {
            let _ = self.stop(Some(Duration::from_millis(500)));
        }
    }
}
