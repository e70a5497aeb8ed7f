//! LAN-scoped distributed video transcoding cluster.
//!
//! A single [`controller::Controller`] enumerates Worker nodes over UDP
//! broadcast (see [`discovery`]), dispatches a batch of transcoding tasks to
//! them over a small HTTP protocol, and collects the results. A
//! [`worker::Worker`] executes one task at a time by driving an external
//! `ffmpeg` binary and serving the produced file back.
//!
//! The two binaries (`tc-control`, `tc-worker`) are thin CLI shells over
//! this library.

pub mod config;
pub mod controller;
pub mod discovery;
pub mod logging;
pub mod presets;
pub mod worker;

pub mod sync_ext;

mod timefmt;

pub use crate::config::ClusterConfig;
pub use crate::controller::{Controller, DispatchReport, SchedulerEvent, Task, TaskStatus};
pub use crate::discovery::{DiscoveryService, NodeRecord};
pub use crate::worker::{Capabilities, Worker};
