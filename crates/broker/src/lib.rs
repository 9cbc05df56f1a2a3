// Copyright (c) 2024 - Lucena contributors.
// All rights reserved.
//
// Use of this software is governed by the BSD 3-Clause License
// included in the LICENSE file.

//! A standalone, service-aware router (Majordomo variant) mediating
//! between remote clients and remote workers across process boundaries.

pub mod broker;
pub mod mdp;

pub use broker::{Broker, HEARTBEAT_EXPIRY, HEARTBEAT_INTERVAL, HEARTBEAT_LIVENESS};
pub use mdp::{WorkerCommand, C_CLIENT, W_WORKER};
