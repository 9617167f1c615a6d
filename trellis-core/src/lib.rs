//! Trellis Core
//!
//! Core types and text parsers for the Trellis cluster validation harness.
//!
//! This crate contains:
//! - Domain types: Slurm jobs, GPUs, hosts and run summaries
//! - Parsers for the tool output the harness scrapes (`sacct`, `sbatch`,
//!   `rocm-smi`, `update-alternatives`, `/etc/os-release`)
//!
//! Nothing in here performs I/O. Command execution lives in `trellis-client`.

pub mod domain;
pub mod error;
pub mod shell;

pub use error::ParseError;
