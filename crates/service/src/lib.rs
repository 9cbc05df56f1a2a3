// Copyright (c) 2024 - Lucena contributors.
// All rights reserved.
//
// Use of this software is governed by the BSD 3-Clause License
// included in the LICENSE file.

//! The Service dispatch loop and its supervisor: the component that binds
//! an external client-facing endpoint and fans requests out to an
//! in-process worker pool.

pub mod dispatch;
pub mod supervisor;

pub use dispatch::DispatchLoop;
pub use supervisor::ServiceSupervisor;
