// Copyright (c) 2024 - Lucena contributors.
// All rights reserved.
//
// Use of this software is governed by the BSD 3-Clause License
// included in the LICENSE file.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::warn;

use lucena_core::error::{LucenaError, Result};
use lucena_core::message::Message;
use lucena_core::socket::{configure_internal_socket, recv_multipart, send_multipart};
use lucena_core::{signal_pair, IntrospectableState, Signal, SignalEndpoint};
use lucena_worker::{bounded_join, Worker};

use crate::dispatch::DispatchLoop;

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Same lifecycle shape as `WorkerSupervisor` but drives a single Service
/// thread. `resolve` is a local shortcut against the state the dispatch
/// loop shares with this supervisor (see DESIGN.md, introspection path);
/// `send`/`recv` are a convenience pass-through to an internal `DEALER`
/// socket connected to the Service's own external endpoint.
pub struct ServiceSupervisor {
    context: zmq::Context,
    endpoint: Option<String>,
    state: Arc<IntrospectableState>,
    control: Option<SignalEndpoint>,
    thread: Option<JoinHandle<()>>,
    external_endpoint: Option<String>,
    client: Option<zmq::Socket>,
}

impl ServiceSupervisor {
    pub fn new(context: zmq::Context, endpoint: Option<String>) -> Self {
        ServiceSupervisor {
            context,
            endpoint,
            state: Arc::new(IntrospectableState::new()),
            control: None,
            thread: None,
            external_endpoint: None,
            client: None,
        }
    }

    pub fn is_started(&self) -> bool {
        self.thread.is_some()
    }

    pub fn external_endpoint(&self) -> Option<&str> {
        self.external_endpoint.as_deref()
    }

    /// Binds the Service's external router, spawns its dispatch loop on a
    /// dedicated thread, and blocks until the loop signals `Ready`.
    pub fn start<F>(&mut self, n_workers: i64, worker_factory: F) -> Result<()>
    where
        F: Fn() -> Worker + Send + 'static,
    {
        if self.is_started() {
            return Err(LucenaError::ServiceAlreadyStarted);
        }

        let dispatch = DispatchLoop::bind(self.context.clone(), self.endpoint.clone(), self.state.clone())?;
        let external_endpoint = dispatch.external_endpoint().to_string();

        let (supervisor_side, supervised_side) = signal_pair(&self.context, 1000)?;
        let thread = std::thread::spawn(move || {
            if let Err(e) = dispatch.run(supervised_side, n_workers, worker_factory) {
                warn!(error = %e, "service dispatch loop exited with error");
            }
        });

        match supervisor_side.wait(DEFAULT_HANDSHAKE_TIMEOUT.as_millis() as i64) {
            Ok(Signal::Ready) => {}
            Ok(Signal::Stop) => {
                return Err(LucenaError::ProtocolViolation(
                    "dispatch loop signaled STOP during startup".into(),
                ))
            }
            Err(e) => return Err(e),
        }

        let client = self.context.socket(zmq::DEALER)?;
        configure_internal_socket(&client, 1000)?;
        client.connect(&external_endpoint)?;

        self.external_endpoint = Some(external_endpoint);
        self.control = Some(supervisor_side);
        self.thread = Some(thread);
        self.client = Some(client);
        Ok(())
    }

    /// Signals `Stop`, joins the dispatch thread with a bounded wait, and
    /// tears down the internal client socket. Idempotent.
    pub fn stop(&mut self, timeout: Option<Duration>) -> Result<()> {
        let Some(control) = self.control.take() else {
            return Ok(());
        };
        control.signal(Signal::Stop)?;
        if let Some(handle) = self.thread.take() {
            if !bounded_join(handle, timeout.unwrap_or(DEFAULT_STOP_TIMEOUT)) {
                warn!("service dispatch thread did not join within timeout");
            }
        }
        self.client = None;
        self.external_endpoint = None;
        Ok(())
    }

    /// Local, synchronous introspection: reads `$attr` (or every attribute,
    /// if absent) off the state shared with the running dispatch loop. No
    /// wire round trip — see DESIGN.md.
    pub fn resolve(&self, message: &Message) -> Result<Message> {
        if !self.is_started() {
            return Err(LucenaError::ServiceNotStarted);
        }
        let rep = match message.get("$attr").and_then(Value::as_str) {
            Some(name) => self.state.attribute(name).unwrap_or(Value::Null),
            None => json!(self.state.all_attributes()),
        };
        Ok(message.merged([("$rep".to_string(), rep)]))
    }

    /// Sends `message` to this Service's own external endpoint as if from a
    /// remote client, over the internal `DEALER` pass-through.
    pub fn send(&self, correlation_id: &[u8], message: &Message) -> Result<()> {
        let client = self.client.as_ref().ok_or(LucenaError::ServiceNotStarted)?;
        let frames = vec![
            Vec::new(),
            correlation_id.to_vec(),
            Vec::new(),
            message.to_json_bytes(),
        ];
        send_multipart(client, &frames)
    }

    pub fn recv(&self) -> Result<(Vec<u8>, Message)> {
        let client = self.client.as_ref().ok_or(LucenaError::ServiceNotStarted)?;
        let frames = recv_multipart(client)?;
        if frames.len() != 4 || !frames[0].is_empty() || !frames[2].is_empty() {
            return Err(LucenaError::MalformedEnvelope(
                "expected [empty, correlationId, empty, json] from the internal client socket".into(),
            ));
        }
        let correlation_id = frames[1].clone();
        let message = Message::from_json_bytes(&frames[3])?;
        Ok((correlation_id, message))
    }
}

impl Drop for ServiceSupervisor {
    fn drop(&mut self) {
        if self.is_started() {
            let _ = self.stop(Some(Duration::from_millis(500)));
        }
    }
}
