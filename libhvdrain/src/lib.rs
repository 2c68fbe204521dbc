#![forbid(unsafe_code)]

//! # hvdrain
//!
//! The shared code for hvdrain. Encapsulates the cluster maintenance
//! workflow for CloudStack/Cosmic hypervisor clusters:
//!
//! - Picking landing hosts for workloads and evacuating them
//! - Draining a hypervisor with a bounded pool of migrations
//! - Driving hosts in and out of maintenance mode
//! - Rolling reboots across a whole cluster, one host at a time
//!
//! The control plane, remote command execution and notifications are
//! reached through the traits in [`control`], [`executor`] and [`notify`].

pub mod config;
pub mod context;
pub mod control;
pub mod drain;
pub mod error;
pub mod evacuate;
pub mod executor;
pub mod hypervisor;
pub mod interrupt;
pub mod inventory;
pub mod log;
pub mod maintenance;
pub mod model;
pub mod notify;
pub mod placement;
pub mod plan;
pub mod poll;
pub mod retry;
pub mod rolling;

#[cfg(test)]
pub(crate) mod fake;

pub use context::{DrainContext, RunOptions};
pub use error::DrainError;
