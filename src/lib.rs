#![deny(
    missing_docs,
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unstable_features,
    unused_imports,
    unused_import_braces,
    unused_qualifications
)]

//! Supervisor server for radiation-beam experiments.
//!
//! A fleet of Devices Under Test (DUTs) runs compute benchmarks inside a
//! radiation beam and streams short status messages over UDP. This crate
//! supervises them: it collects the messages into per-run log files, detects
//! silent or stuck boards, and walks a graduated recovery ladder until they
//! talk again:
//!
//! * **soft-app**: kill and relaunch the benchmark over the remote shell
//! * **soft-OS**: reboot the operating system over the remote shell
//! * **hard**: power cycle the DUT's outlet on a network power switch
//!
//! Each enabled DUT gets one independent [supervisor::DutSupervisor] thread;
//! the `server` binary wires them to the YAML configuration and a shared
//! [shutdown::ShutdownToken].

pub mod commands;
pub mod config;
pub mod dut_log;
pub mod logging;
pub mod shell;
pub mod shutdown;
pub mod supervisor;
pub mod switch;

use commands::CommandError;
use config::ConfigError;
use shell::ShellError;
use switch::SwitchError;

/// Crate-wide result
pub type ServerResult<T> = Result<T, ServerError>;

/// Aggregated server error
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Configuration file error
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Benchmark catalogue error
    #[error(transparent)]
    Commands(#[from] CommandError),
    /// Remote shell error
    #[error(transparent)]
    Shell(#[from] ShellError),
    /// Power switch error
    #[error(transparent)]
    Switch(#[from] SwitchError),
    /// Filesystem or socket error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
