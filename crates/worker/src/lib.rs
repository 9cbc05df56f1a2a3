// Copyright (c) 2024 - Lucena contributors.
// All rights reserved.
//
// Use of this software is governed by the BSD 3-Clause License
// included in the LICENSE file.

//! The in-process Worker loop and its pool-level supervisor.

pub mod controller;
pub mod worker;

pub use controller::{WorkerId, WorkerSupervisor};
pub use worker::{bounded_join, Worker, VOID_CLIENT};
