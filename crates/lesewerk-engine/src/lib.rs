// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Lesewerk Engine: mission lifecycle, task queue, worker pool, the shared
// recognition-engine binding, and the loopback control API.  This crate
// drives `lesewerk-output` writers from jobs defined in `lesewerk-core`.

pub mod backends;
pub mod control_client;
pub mod control_server;
pub mod engine;
pub mod mission;
pub mod pool;
pub mod queue;
pub mod registry;
pub mod submission;

#[cfg(test)]
mod test_support;

pub use backends::builtin_catalog;
pub use control_client::ControlClient;
pub use control_server::ControlServer;
pub use engine::{
    CallSettings, EngineBinding, EngineCatalog, EngineSlot, RecognitionBackend, RecognitionRequest,
};
pub use mission::MissionController;
pub use pool::WorkerPool;
pub use queue::TaskQueue;
pub use registry::{EngineInfo, MissionRegistry};
pub use submission::{MissionRequest, SubmitItem};
