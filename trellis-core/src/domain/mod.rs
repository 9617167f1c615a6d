//! Core domain types
//!
//! These types describe what the harness observes on a cluster. They are
//! shared between the client (which produces them from command output) and
//! the runner and CLI (which act on them).

pub mod gpu;
pub mod host;
pub mod job;
pub mod run;
pub mod slurm;
