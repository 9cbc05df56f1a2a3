// Copyright (c) 2024 - Lucena contributors.
// All rights reserved.
//
// Use of this software is governed by the BSD 3-Clause License
// included in the LICENSE file.

use std::collections::VecDeque;
use std::sync::Arc;

use metrics::{counter, gauge};
use serde_json::json;
use tracing::{debug, info, warn};

use lucena_core::error::Result;
use lucena_core::message::Message;
use lucena_core::naming::unique_endpoint;
use lucena_core::socket::{configure_internal_socket, recv_multipart, send_multipart};
use lucena_core::{
    decode_client_envelope, decode_worker_envelope, encode_client_envelope, IntrospectableState,
    Signal, SignalEndpoint,
};
use lucena_worker::{Worker, WorkerId, WorkerSupervisor};

const POLL_TIMEOUT_MS: i64 = 100;

/// Long-lived I/O loop owning the external client endpoint and the
/// embedded worker pool. One OS thread per running instance.
pub struct DispatchLoop {
    external_endpoint: String,
    external: zmq::Socket,
    workers: WorkerSupervisor,
    ready_workers: VecDeque<WorkerId>,
    pending: i64,
    total_client_requests: i64,
    state: Arc<IntrospectableState>,
}

impl DispatchLoop {
    /// Binds the external router to `endpoint` (or a generated process-local
    /// address if `None`) and prepares (but does not yet start) the
    /// embedded worker pool.
    pub fn bind(
        context: zmq::Context,
        endpoint: Option<String>,
        state: Arc<IntrospectableState>,
    ) -> Result<Self> {
        let external_endpoint = endpoint.unwrap_or_else(unique_endpoint);
        let external = context.socket(zmq::ROUTER)?;
        configure_internal_socket(&external, 1000)?;
        external.bind(&external_endpoint)?;

        let workers = WorkerSupervisor::new(context);

        Ok(DispatchLoop {
            external_endpoint,
            external,
            workers,
            ready_workers: VecDeque::new(),
            pending: 0,
            total_client_requests: 0,
            state,
        })
    }

    pub fn external_endpoint(&self) -> &str {
        &self.external_endpoint
    }

    /// Starts `n_workers`, signals `Ready` on `control`, then runs the
    /// dispatch loop from §4.6 until `control` signals `Stop` and every
    /// in-flight request has been answered.
    pub fn run<F>(mut self, control: SignalEndpoint, n_workers: i64, worker_factory: F) -> Result<()>
    where
        F: Fn() -> Worker,
    {
        let identities = self.workers.start(n_workers, worker_factory)?;
        self.ready_workers = identities.into_iter().collect();
        control.signal(Signal::Ready)?;
        info!(endpoint = %self.external_endpoint, workers = n_workers, "service dispatch loop ready");
        let requests_dispatched = counter!("lucena_service_requests_dispatched_total");
        let pending_gauge = gauge!("lucena_service_pending_requests");

        let mut stop_requested = false;
        loop {
            let has_ready_workers = !self.ready_workers.is_empty();
            let poll_external = has_ready_workers && !stop_requested;

            let control_socket = control.as_raw_socket();
            let worker_socket = self
                .workers
                .raw_router()
                .expect("worker pool started before the loop runs");

            let mut items = vec![
                control_socket.as_poll_item(zmq::POLLIN),
                worker_socket.as_poll_item(zmq::POLLIN),
            ];
            if poll_external {
                items.push(self.external.as_poll_item(zmq::POLLIN));
            }

            zmq::poll(&mut items, POLL_TIMEOUT_MS)?;

            if items[0].is_readable() {
                match control.wait(0) {
                    Ok(Signal::Stop) => {
                        stop_requested = true;
                        debug!("dispatch loop received stop signal");
                    }
                    Ok(Signal::Ready) => warn!("unexpected READY on dispatch control pair"),
                    Err(_) => {}
                }
            }

            if items[1].is_readable() {
                let frames = recv_multipart(worker_socket)?;
                match decode_worker_envelope(&frames) {
                    Ok((worker_id, client_id, correlation_id, reply)) => {
                        self.ready_workers.push_back(worker_id);
                        self.pending -= 1;
                        pending_gauge.set(self.pending as f64);
                        send_multipart(
                            &self.external,
                            &encode_client_envelope(&client_id, &correlation_id, &reply),
                        )?;
                    }
                    Err(e) => warn!(error = %e, "dropping malformed worker-pool envelope"),
                }
            }

            if poll_external && items.len() > 2 && items[2].is_readable() {
                let frames = recv_multipart(&self.external)?;
                match decode_client_envelope(&frames) {
                    Ok((client_id, correlation_id, request)) => {
                        if let Some(worker_id) = self.ready_workers.pop_front() {
                            self.workers
                                .send(&worker_id, &client_id, &correlation_id, &request)?;
                            self.pending += 1;
                            self.total_client_requests += 1;
                            self.state.set_attribute(
                                "totalClientRequests",
                                json!(self.total_client_requests),
                            );
                            requests_dispatched.increment(1);
                            pending_gauge.set(self.pending as f64);
                        }
                    }
                    Err(e) => warn!(error = %e, "dropping malformed client envelope"),
                }
            }

            debug_assert_eq!(self.ready_workers.len() as i64 + self.pending, n_workers);
            if stop_requested && self.pending == 0 {
                break;
            }
        }

        self.workers.stop(None)?;
        drop(self.external);
        info!("service dispatch loop stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert2::check;
    use lucena_core::signal_pair;
    use lucena_worker::Worker;
    use serde_json::Value;
    use serial_test::serial;

    fn raw_dealer(context: &zmq::Context, endpoint: &str) -> zmq::Socket {
        let socket = context.socket(zmq::DEALER).unwrap();
        configure_internal_socket(&socket, 1000).unwrap();
        socket.connect(endpoint).unwrap();
        socket
    }

    fn start_loop<F>(
        n_workers: i64,
        worker_factory: F,
    ) -> (zmq::Context, String, SignalEndpoint, std::thread::JoinHandle<()>)
    where
        F: Fn() -> Worker + Send + 'static,
    {
        let context = zmq::Context::new();
        let state = Arc::new(IntrospectableState::new());
        let dispatch = DispatchLoop::bind(context.clone(), None, state).unwrap();
        let endpoint = dispatch.external_endpoint().to_string();
        let (supervisor_side, supervised_side) = signal_pair(&context, 1000).unwrap();
        let handle = std::thread::spawn(move || {
            dispatch.run(supervised_side, n_workers, worker_factory).unwrap();
        });
        assert_eq!(supervisor_side.wait(2000).unwrap(), Signal::Ready);
        (context, endpoint, supervisor_side, handle)
    }

    #[test]
    #[serial]
    fn echo_round_trip_via_raw_dealer_client() {
        let (context, endpoint, control, handle) = start_loop(1, Worker::new);
        let client = raw_dealer(&context, &endpoint);

        let request = Message::new(json!({"$req": "HELLO"})).unwrap();
        send_multipart(
            &client,
            &[Vec::new(), b"corr-1".to_vec(), Vec::new(), request.to_json_bytes()],
        )
        .unwrap();

        let frames = recv_multipart(&client).unwrap();
        check!(frames[0].is_empty());
        check!(frames[1] == b"corr-1");
        check!(frames[2].is_empty());
        let reply = Message::from_json_bytes(&frames[3]).unwrap();
        check!(reply.get("$error") == Some(&json!("No handler match")));

        control.signal(Signal::Stop).unwrap();
        handle.join().unwrap();
    }

    #[test]
    #[serial]
    fn custom_handler_and_correlation_id_passthrough() {
        let worker_factory = || {
            let mut w = Worker::new();
            w.bind_handler(
                json!({"$req": "sum"}),
                Arc::new(|m: &Message| {
                    let a = m.get("a").and_then(Value::as_i64).unwrap_or(0);
                    let b = m.get("b").and_then(Value::as_i64).unwrap_or(0);
                    m.merged([("$rep".to_string(), json!(a + b))])
                }),
            );
            w
        };
        let (context, endpoint, control, handle) = start_loop(1, worker_factory);
        let client = raw_dealer(&context, &endpoint);

        let request = Message::new(json!({"$req": "sum", "a": 2, "b": 5})).unwrap();
        send_multipart(
            &client,
            &[Vec::new(), b"corr-xyz".to_vec(), Vec::new(), request.to_json_bytes()],
        )
        .unwrap();
        let frames = recv_multipart(&client).unwrap();
        assert_eq!(frames[1], b"corr-xyz");
        let reply = Message::from_json_bytes(&frames[3]).unwrap();
        assert_eq!(reply.get("$rep"), Some(&json!(7)));

        control.signal(Signal::Stop).unwrap();
        handle.join().unwrap();
    }

    #[test]
    #[serial]
    fn two_clients_each_get_their_own_reply() {
        let (context, endpoint, control, handle) = start_loop(2, Worker::new);
        let client_a = raw_dealer(&context, &endpoint);
        let client_b = raw_dealer(&context, &endpoint);

        let req_a = Message::new(json!({"$req": "HELLO", "who": "a"})).unwrap();
        let req_b = Message::new(json!({"$req": "HELLO", "who": "b"})).unwrap();
        send_multipart(&client_a, &[Vec::new(), b"a-1".to_vec(), Vec::new(), req_a.to_json_bytes()]).unwrap();
        send_multipart(&client_b, &[Vec::new(), b"b-1".to_vec(), Vec::new(), req_b.to_json_bytes()]).unwrap();

        let frames_a = recv_multipart(&client_a).unwrap();
        let frames_b = recv_multipart(&client_b).unwrap();
        assert_eq!(frames_a[1], b"a-1");
        assert_eq!(frames_b[1], b"b-1");

        control.signal(Signal::Stop).unwrap();
        handle.join().unwrap();
    }
}
