// Copyright (c) 2024 - Lucena contributors.
// All rights reserved.
//
// Use of this software is governed by the BSD 3-Clause License
// included in the LICENSE file.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use metrics::{counter, gauge};
use tracing::{debug, info, warn};

use lucena_core::error::Result;
use lucena_core::naming::unique_endpoint;
use lucena_core::socket::{configure_internal_socket, recv_multipart, send_multipart};

use crate::mdp::{WorkerCommand, C_CLIENT, INTERNAL_SERVICE_PREFIX, W_WORKER};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(2500);
pub const HEARTBEAT_LIVENESS: u32 = 3;
pub const HEARTBEAT_EXPIRY: Duration = Duration::from_millis(2500 * 3);

struct Worker {
    service: Option<String>,
    expiry: Instant,
}

struct Service {
    requests: VecDeque<Vec<Vec<u8>>>,
    waiting: VecDeque<Vec<u8>>,
}

impl Service {
    fn new() -> Self {
        Service {
            requests: VecDeque::new(),
            waiting: VecDeque::new(),
        }
    }
}

/// A service-aware router mediating between remote clients and remote
/// workers by service name, in the style of the Majordomo broker: one
/// `ROUTER` socket, heartbeated worker liveness, per-service FIFO queues.
pub struct Broker {
    endpoint: String,
    router: zmq::Socket,
    services: HashMap<String, Service>,
    workers: HashMap<Vec<u8>, Worker>,
    waiting: VecDeque<Vec<u8>>,
    heartbeat_at: Instant,
    heartbeat_interval: Duration,
    heartbeat_expiry: Duration,
}

impl Broker {
    pub fn bind(context: zmq::Context, endpoint: Option<String>) -> Result<Self> {
        let endpoint = endpoint.unwrap_or_else(unique_endpoint);
        let router = context.socket(zmq::ROUTER)?;
        configure_internal_socket(&router, 1000)?;
        router.bind(&endpoint)?;
        info!(%endpoint, "broker bound");

        Ok(Broker {
            endpoint,
            router,
            services: HashMap::new(),
            workers: HashMap::new(),
            waiting: VecDeque::new(),
            heartbeat_at: Instant::now() + HEARTBEAT_INTERVAL,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            heartbeat_expiry: HEARTBEAT_EXPIRY,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Overrides the heartbeat timing (test seam — production callers should
    /// use the spec defaults via `bind`).
    pub fn with_heartbeat_timing(mut self, interval: Duration, expiry: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_expiry = expiry;
        self.heartbeat_at = Instant::now() + interval;
        self
    }

    pub fn registered_services(&self) -> Vec<&str> {
        self.services.keys().map(String::as_str).collect()
    }

    /// Runs the mediation loop (spec §4.8) until `stop` is set. Polls with a
    /// timeout of `heartbeat_interval` so liveness and the stop flag are
    /// observed promptly even when idle.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<()> {
        while !stop.load(Ordering::Relaxed) {
            let mut items = [self.router.as_poll_item(zmq::POLLIN)];
            zmq::poll(&mut items, self.heartbeat_interval.as_millis() as i64)?;

            if items[0].is_readable() {
                let frames = recv_multipart(&self.router)?;
                if let Err(e) = self.handle_frame(frames) {
                    warn!(error = %e, "broker dropped malformed frame");
                }
            }

            self.purge_expired_workers()?;
            self.send_heartbeats_if_due()?;
        }
        self.shutdown()
    }

    /// Disconnects every known worker. Called at the end of `run` and from
    /// `Drop`.
    pub fn shutdown(&mut self) -> Result<()> {
        let identities: Vec<Vec<u8>> = self.workers.keys().cloned().collect();
        for identity in identities {
            self.delete_worker(&identity, true)?;
        }
        Ok(())
    }

    fn handle_frame(&mut self, mut frames: Vec<Vec<u8>>) -> Result<()> {
        if frames.len() < 3 {
            warn!("dropping short broker frame");
            return Ok(());
        }
        let sender = frames.remove(0);
        let empty = frames.remove(0);
        if !empty.is_empty() {
            warn!("dropping broker frame missing delimiter");
            return Ok(());
        }
        let header = frames.remove(0);
        if header == C_CLIENT {
            self.process_client(sender, frames)
        } else if header == W_WORKER {
            self.process_worker(sender, frames)
        } else {
            warn!("dropping broker frame with unknown header");
            Ok(())
        }
    }

    /// `body = [serviceName, ...payload]`.
    fn process_client(&mut self, sender: Vec<u8>, mut body: Vec<Vec<u8>>) -> Result<()> {
        if body.is_empty() {
            warn!("dropping client frame missing service name");
            return Ok(());
        }
        let service_name = String::from_utf8_lossy(&body.remove(0)).into_owned();

        let mut envelope = vec![sender, Vec::new()];
        envelope.extend(body);

        if service_name.starts_with(INTERNAL_SERVICE_PREFIX) {
            self.service_internal(&service_name, envelope)
        } else {
            self.dispatch(&service_name, Some(envelope))
        }
    }

    fn service_internal(&mut self, service_name: &str, envelope: Vec<Vec<u8>>) -> Result<()> {
        let mut reply_code = "501";
        if service_name == "mmi.service" {
            let queried = envelope
                .last()
                .map(|v| String::from_utf8_lossy(v).into_owned())
                .unwrap_or_default();
            reply_code = if self.services.contains_key(&queried) {
                "200"
            } else {
                "404"
            };
        }
        let client = envelope[0].clone();
        let empty = envelope[1].clone();
        let frames = vec![
            client,
            empty,
            C_CLIENT.to_vec(),
            service_name.as_bytes().to_vec(),
            reply_code.as_bytes().to_vec(),
        ];
        send_multipart(&self.router, &frames)
    }

    /// `body = [command, ...commandPayload]`.
    fn process_worker(&mut self, sender: Vec<u8>, mut body: Vec<Vec<u8>>) -> Result<()> {
        if body.is_empty() {
            warn!("dropping worker frame missing command");
            return Ok(());
        }
        let command_frame = body.remove(0);
        let Some(&command_byte) = command_frame.first() else {
            warn!("dropping empty worker command frame");
            return Ok(());
        };
        let command = WorkerCommand::from_byte(command_byte)?;
        let worker_known = self.workers.contains_key(&sender);

        match command {
            WorkerCommand::Ready => {
                let service_name = body
                    .first()
                    .map(|v| String::from_utf8_lossy(v).into_owned())
                    .unwrap_or_default();
                if worker_known || service_name.starts_with(INTERNAL_SERVICE_PREFIX) {
                    debug!(?sender, "protocol violation on READY, disconnecting worker");
                    self.delete_worker(&sender, true)?;
                } else {
                    self.workers.insert(
                        sender.clone(),
                        Worker {
                            service: Some(service_name.clone()),
                            expiry: Instant::now() + self.heartbeat_expiry,
                        },
                    );
                    self.services.entry(service_name).or_insert_with(Service::new);
                    self.worker_waiting(sender)?;
                }
            }
            WorkerCommand::Reply => {
                if worker_known && body.len() >= 2 {
                    let client = body.remove(0);
                    let empty = body.remove(0);
                    let service_name = self
                        .workers
                        .get(&sender)
                        .and_then(|w| w.service.clone())
                        .unwrap_or_default();
                    let mut frames = vec![client, empty, C_CLIENT.to_vec(), service_name.into_bytes()];
                    frames.extend(body);
                    send_multipart(&self.router, &frames)?;
                    self.worker_waiting(sender)?;
                } else {
                    self.delete_worker(&sender, true)?;
                }
            }
            WorkerCommand::Heartbeat => {
                if worker_known {
                    if let Some(worker) = self.workers.get_mut(&sender) {
                        worker.expiry = Instant::now() + self.heartbeat_expiry;
                    }
                } else {
                    self.delete_worker(&sender, true)?;
                }
            }
            WorkerCommand::Disconnect => {
                self.delete_worker(&sender, false)?;
            }
            WorkerCommand::Request => {
                warn!(?sender, "worker sent REQUEST, which only the broker originates");
                self.delete_worker(&sender, true)?;
            }
        }
        Ok(())
    }

    /// Queues the worker on its service's idle list and the global idle
    /// list, then attempts to dispatch. Insertion is always at the tail, so
    /// `waiting` expiries are non-decreasing head to tail.
    fn worker_waiting(&mut self, address: Vec<u8>) -> Result<()> {
        let service_name = self.workers.get(&address).and_then(|w| w.service.clone());
        if let Some(worker) = self.workers.get_mut(&address) {
            worker.expiry = Instant::now() + self.heartbeat_expiry;
        }
        self.waiting.push_back(address.clone());
        if let Some(name) = &service_name {
            self.services
                .entry(name.clone())
                .or_insert_with(Service::new)
                .waiting
                .push_back(address);
        }
        if let Some(name) = service_name {
            self.dispatch(&name, None)?;
        }
        Ok(())
    }

    /// Queues `message` (if any), then pairs idle workers with queued
    /// requests for `service_name` until one side runs dry.
    fn dispatch(&mut self, service_name: &str, message: Option<Vec<Vec<u8>>>) -> Result<()> {
        if let Some(message) = message {
            self.services
                .entry(service_name.to_string())
                .or_insert_with(Service::new)
                .requests
                .push_back(message);
        }
        self.purge_expired_workers()?;

        loop {
            let popped = match self.services.get_mut(service_name) {
                Some(service) if !service.waiting.is_empty() && !service.requests.is_empty() => {
                    let worker_id = service.waiting.pop_front().unwrap();
                    let request = service.requests.pop_front().unwrap();
                    Some((worker_id, request))
                }
                _ => None,
            };
            let Some((worker_id, request)) = popped else {
                break;
            };
            self.waiting.retain(|id| id != &worker_id);
            self.send_to_worker(&worker_id, WorkerCommand::Request, None, Some(request))?;
            counter!("lucena_broker_requests_dispatched_total").increment(1);
        }
        gauge!("lucena_broker_workers_idle").set(self.waiting.len() as f64);
        Ok(())
    }

    fn send_heartbeats_if_due(&mut self) -> Result<()> {
        if Instant::now() > self.heartbeat_at {
            let identities: Vec<Vec<u8>> = self.waiting.iter().cloned().collect();
            for identity in identities {
                self.send_to_worker(&identity, WorkerCommand::Heartbeat, None, None)?;
            }
            self.heartbeat_at = Instant::now() + self.heartbeat_interval;
        }
        Ok(())
    }

    /// Idle workers are ordered oldest-to-newest, so this stops at the first
    /// non-expired head.
    fn purge_expired_workers(&mut self) -> Result<()> {
        loop {
            let Some(front) = self.waiting.front().cloned() else {
                break;
            };
            let expired = self
                .workers
                .get(&front)
                .map(|w| w.expiry <= Instant::now())
                .unwrap_or(true);
            if !expired {
                break;
            }
            self.waiting.pop_front();
            debug!(identity = ?String::from_utf8_lossy(&front), "purging expired worker");
            self.delete_worker(&front, false)?;
            counter!("lucena_broker_workers_expired_total").increment(1);
        }
        gauge!("lucena_broker_workers_idle").set(self.waiting.len() as f64);
        Ok(())
    }

    fn delete_worker(&mut self, address: &[u8], disconnect: bool) -> Result<()> {
        if disconnect {
            self.send_to_worker(address, WorkerCommand::Disconnect, None, None)?;
        }
        if let Some(worker) = self.workers.remove(address) {
            if let Some(name) = worker.service {
                if let Some(service) = self.services.get_mut(&name) {
                    service.waiting.retain(|id| id != address);
                }
            }
        }
        self.waiting.retain(|id| id != address);
        Ok(())
    }

    fn send_to_worker(
        &self,
        address: &[u8],
        command: WorkerCommand,
        option: Option<Vec<u8>>,
        message: Option<Vec<Vec<u8>>>,
    ) -> Result<()> {
        let mut frames = vec![
            address.to_vec(),
            Vec::new(),
            W_WORKER.to_vec(),
            vec![command.to_byte()],
        ];
        if let Some(option) = option {
            frames.push(option);
        }
        if let Some(message) = message {
            frames.extend(message);
        }
        send_multipart(&self.router, &frames)
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert2::let_assert;
    use lucena_core::socket::{recv_multipart as recv, send_multipart as send};
    use serial_test::serial;

    fn dealer(context: &zmq::Context, endpoint: &str) -> zmq::Socket {
        let socket = context.socket(zmq::DEALER).unwrap();
        configure_internal_socket(&socket, 1000).unwrap();
        socket.connect(endpoint).unwrap();
        socket
    }

    #[test]
    #[serial]
    fn mmi_service_reports_unregistered_then_registered() {
        let ctx = zmq::Context::new();
        let mut broker = Broker::bind(ctx.clone(), None).unwrap();
        let endpoint = broker.endpoint().to_string();

        let client = dealer(&ctx, &endpoint);
        let worker = dealer(&ctx, &endpoint);

        send(
            &client,
            &[Vec::new(), C_CLIENT.to_vec(), b"mmi.service".to_vec(), b"echo".to_vec()],
        )
        .unwrap();
        broker.handle_frame(recv(&broker.router).unwrap()).unwrap();
        let reply = recv(&client).unwrap();
        assert_eq!(reply.last().unwrap(), b"404");

        send(
            &worker,
            &[Vec::new(), W_WORKER.to_vec(), vec![WorkerCommand::Ready.to_byte()], b"echo".to_vec()],
        )
        .unwrap();
        broker.handle_frame(recv(&broker.router).unwrap()).unwrap();

        send(
            &client,
            &[Vec::new(), C_CLIENT.to_vec(), b"mmi.service".to_vec(), b"echo".to_vec()],
        )
        .unwrap();
        broker.handle_frame(recv(&broker.router).unwrap()).unwrap();
        let reply = recv(&client).unwrap();
        assert_eq!(reply.last().unwrap(), b"200");
    }

    #[test]
    #[serial]
    fn request_is_dispatched_to_registered_worker_and_reply_routed_back() {
        let ctx = zmq::Context::new();
        let mut broker = Broker::bind(ctx.clone(), None).unwrap();
        let endpoint = broker.endpoint().to_string();

        let client = dealer(&ctx, &endpoint);
        let worker = dealer(&ctx, &endpoint);

        send(
            &worker,
            &[Vec::new(), W_WORKER.to_vec(), vec![WorkerCommand::Ready.to_byte()], b"echo".to_vec()],
        )
        .unwrap();
        broker.handle_frame(recv(&broker.router).unwrap()).unwrap();

        send(
            &client,
            &[Vec::new(), C_CLIENT.to_vec(), b"echo".to_vec(), b"hello".to_vec()],
        )
        .unwrap();
        broker.handle_frame(recv(&broker.router).unwrap()).unwrap();

        let request = recv(&worker).unwrap();
        assert_eq!(request[2], W_WORKER);
        assert_eq!(request[3], vec![WorkerCommand::Request.to_byte()]);
        let client_id = request[4].clone();
        assert_eq!(request.last().unwrap(), b"hello");

        send(
            &worker,
            &[
                Vec::new(),
                W_WORKER.to_vec(),
                vec![WorkerCommand::Reply.to_byte()],
                client_id,
                Vec::new(),
                b"world".to_vec(),
            ],
        )
        .unwrap();
        broker.handle_frame(recv(&broker.router).unwrap()).unwrap();

        let reply = recv(&client).unwrap();
        assert_eq!(reply[1], C_CLIENT);
        assert_eq!(reply[2], b"echo");
        assert_eq!(reply.last().unwrap(), b"world");
    }

    #[test]
    #[serial]
    fn expired_worker_is_purged_without_heartbeat() {
        let ctx = zmq::Context::new();
        let broker = Broker::bind(ctx.clone(), None)
            .unwrap()
            .with_heartbeat_timing(Duration::from_millis(20), Duration::from_millis(30));
        let endpoint = broker.endpoint().to_string();
        let mut broker = broker;

        let worker = dealer(&ctx, &endpoint);
        send(
            &worker,
            &[Vec::new(), W_WORKER.to_vec(), vec![WorkerCommand::Ready.to_byte()], b"echo".to_vec()],
        )
        .unwrap();
        broker.handle_frame(recv(&broker.router).unwrap()).unwrap();
        let_assert!(Some(registered) = broker.workers.values().next());
        assert_eq!(registered.service.as_deref(), Some("echo"));

        std::thread::sleep(Duration::from_millis(50));
        broker.purge_expired_workers().unwrap();
        assert!(broker.workers.is_empty());
        assert!(broker.waiting.is_empty());
    }
}
