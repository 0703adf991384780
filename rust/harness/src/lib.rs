#![warn(clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions
)]

//! SLURM Sweep Harness
//!
//! Submits training runs to a SLURM cluster, records job accounting once
//! allocated, and launches the trainer with flags rendered from a typed
//! run configuration.

pub mod config;
pub mod job;
pub mod launcher;
pub mod slurm;
pub mod submitter;

pub use config::{LauncherSettings, RunConfig, SweepConfig};
pub use job::JobDescriptor;
pub use launcher::{LaunchOutcome, Launcher};
pub use slurm::Slurm;
pub use submitter::Submitter;
