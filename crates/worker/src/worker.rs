// Copyright (c) 2024 - Lucena contributors.
// All rights reserved.
//
// Use of this software is governed by the BSD 3-Clause License
// included in the LICENSE file.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde_json::{json, Value};
use tracing::{debug, trace, warn};

use lucena_core::error::Result;
use lucena_core::handler::{default_handler, Handler, HandlerTable};
use lucena_core::message::Message;
use lucena_core::socket::{configure_internal_socket, poll_readable, recv_multipart, send_multipart};
use lucena_core::{decode_client_envelope, encode_client_envelope, IntrospectableState};

/// Placeholder client identity a worker addresses its control-plane
/// envelopes to — there is no real client on the other end of a `READY`
/// or `stop` exchange.
pub const VOID_CLIENT: &[u8] = b"<void>";
const VOID_CORRELATION: &[u8] = b"";
const POLL_TIMEOUT_MS: i64 = 100;

/// A single-threaded resolver: matches a request against its handler table
/// and returns a reply. A Worker never runs two requests concurrently; pool
/// parallelism is the supervisor's job.
pub struct Worker {
    handlers: HandlerTable,
    state: Arc<IntrospectableState>,
}

impl Worker {
    pub fn new() -> Self {
        let state = Arc::new(IntrospectableState::new());
        let mut handlers = HandlerTable::new();
        handlers.bind(json!({}), true, Arc::new(default_handler) as Handler);

        {
            let state = state.clone();
            handlers.bind(
                json!({"$signal": "stop"}),
                true,
                Arc::new(move |message: &Message| {
                    state.request_stop();
                    message.merged([("$rep".to_string(), Value::String("OK".into()))])
                }) as Handler,
            );
        }

        {
            let state = state.clone();
            handlers.bind(
                json!({"$req": "eval"}),
                true,
                Arc::new(move |message: &Message| {
                    let rep = match message.get("$attr").and_then(Value::as_str) {
                        Some(name) => state.attribute(name).unwrap_or(Value::Null),
                        None => json!(state.all_attributes()),
                    };
                    message.merged([("$rep".to_string(), rep)])
                }) as Handler,
            );
        }

        Worker { handlers, state }
    }

    pub fn bind_handler(&mut self, pattern: Value, handler: Handler) {
        self.handlers.bind(pattern, true, handler);
    }

    pub fn unbind_handler(&mut self, pattern: &Value) -> Result<()> {
        self.handlers.unbind(pattern)
    }

    pub fn resolve(&self, message: &Message) -> Result<Message> {
        self.handlers.resolve(message)
    }

    pub fn state(&self) -> &Arc<IntrospectableState> {
        &self.state
    }

    /// Connects a `REQ` control socket to `router_endpoint`, announces
    /// readiness, then serves requests until `{$signal:"stop"}` flips
    /// `state.stop_requested()`.
    ///
    /// Implements the loop from the component design verbatim: poll with a
    /// short timeout, resolve one request per wakeup, reply, repeat.
    pub fn run(&self, context: &zmq::Context, router_endpoint: &str, identity: &[u8]) -> Result<()> {
        let socket = context.socket(zmq::REQ)?;
        socket.set_identity(identity)?;
        configure_internal_socket(&socket, 1000)?;
        socket.connect(router_endpoint)?;

        let ready = Message::ready_signal();
        send_multipart(
            &socket,
            &encode_client_envelope(VOID_CLIENT, VOID_CORRELATION, &ready),
        )?;
        debug!(identity = ?String::from_utf8_lossy(identity), "worker ready");
        let requests_resolved = counter!("lucena_worker_requests_resolved_total");

        while !self.state.stop_requested() {
            if !poll_readable(&socket, POLL_TIMEOUT_MS)? {
                continue;
            }
            let frames = recv_multipart(&socket)?;
            let (client_id, correlation_id, request) = match decode_client_envelope(&frames) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(error = %e, "dropping malformed worker envelope");
                    continue;
                }
            };
            trace!(?request, "resolving request");
            let reply = self.handlers.resolve(&request).unwrap_or_else(|_| default_handler(&request));
            requests_resolved.increment(1);
            send_multipart(
                &socket,
                &encode_client_envelope(&client_id, &correlation_id, &reply),
            )?;
        }
        debug!(identity = ?String::from_utf8_lossy(identity), "worker stopped");
        Ok(())
    }
}

impl Default for Worker {
    fn default() -> Self {
        Worker::new()
    }
}

/// Polls `handle.is_finished()` against a deadline — `std::thread::JoinHandle`
/// has no native timed join.
pub fn bounded_join(handle: std::thread::JoinHandle<()>, timeout: Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if handle.is_finished() {
            let _ = handle.join();
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    handle.is_finished()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert2::check;
    use serde_json::json;

    #[test]
    fn default_echo_reply_has_no_handler_error() {
        let worker = Worker::new();
        let request = Message::new(json!({"$req": "HELLO"})).unwrap();
        let reply = worker.resolve(&request).unwrap();
        check!(reply.get("$rep") == Some(&Value::Null));
        check!(reply.get("$error") == Some(&json!("No handler match")));
    }

    #[test]
    fn arithmetic_handler_wins_over_default() {
        let mut worker = Worker::new();
        worker.bind_handler(
            json!({"$req": "sum"}),
            Arc::new(|m: &Message| {
                let a = m.get("a").and_then(Value::as_i64).unwrap_or(0);
                let b = m.get("b").and_then(Value::as_i64).unwrap_or(0);
                m.merged([("$rep".to_string(), json!(a + b))])
            }),
        );
        let request = Message::new(json!({"$req": "sum", "a": 100, "b": 20})).unwrap();
        let reply = worker.resolve(&request).unwrap();
        assert_eq!(reply.get("$rep"), Some(&json!(120)));
    }

    #[test]
    fn precedence_prefers_more_specific_pattern() {
        let mut worker = Worker::new();
        worker.bind_handler(
            json!({"$req": "mul", "kind": "int"}),
            Arc::new(|m: &Message| {
                let a = m.get("a").and_then(Value::as_i64).unwrap_or(0);
                let b = m.get("b").and_then(Value::as_i64).unwrap_or(0);
                m.merged([("$rep".to_string(), json!(a * b))])
            }),
        );
        let request = Message::new(json!({"$req": "mul", "kind": "int", "a": 6, "b": 7})).unwrap();
        let reply = worker.resolve(&request).unwrap();
        assert_eq!(reply.get("$rep"), Some(&json!(42)));
    }

    #[test]
    fn stop_handler_sets_stop_requested_and_acks() {
        let worker = Worker::new();
        let request = Message::new(json!({"$signal": "stop"})).unwrap();
        let reply = worker.resolve(&request).unwrap();
        assert_eq!(reply.get("$rep"), Some(&json!("OK")));
        assert!(worker.state().stop_requested());
    }

    #[test]
    fn eval_reads_registered_attribute() {
        let worker = Worker::new();
        worker.state().set_attribute("totalClientRequests", json!(256));
        let request = Message::new(json!({"$req": "eval", "$attr": "totalClientRequests"})).unwrap();
        let reply = worker.resolve(&request).unwrap();
        assert_eq!(reply.get("$rep"), Some(&json!(256)));
    }
}
