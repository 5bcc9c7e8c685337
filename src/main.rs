//! `server`: orchestrator binary
//!
//! Loads the YAML configuration, starts one supervisor thread per enabled
//! DUT and waits for them. An interrupt fans the shared shutdown token out
//! to every supervisor and the process exits 130; a supervisor thread dying
//! on its own triggers the same fan-out and a distinct exit code.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use log::{error, info, warn};

use rad_supervisor::commands::CommandRotator;
use rad_supervisor::config::{DutConfig, ServerConfig};
use rad_supervisor::shutdown::ShutdownToken;
use rad_supervisor::supervisor::DutSupervisor;
use rad_supervisor::{ServerResult, logging, switch};

/// Exit code after an operator interrupt
const EXIT_INTERRUPT: i32 = 130;
/// Exit code when a supervisor thread died on its own
const EXIT_WORKER_DIED: i32 = 70;

#[derive(Debug, Parser)]
#[command(name = "server", about = "Server to monitor radiation experiments")]
struct Opts {
    /// Path to a YAML file that contains the server parameters
    #[arg(
        short = 'c',
        long = "config",
        value_name = "PATH_YAML_FILE",
        default_value = "./server_parameters.yaml"
    )]
    config: PathBuf,
}

fn main() {
    let opts = Opts::parse();
    match run(&opts) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("fatal: {e}");
            std::process::exit(1);
        }
    }
}

fn run(opts: &Opts) -> ServerResult<i32> {
    let server_cfg = ServerConfig::load(&opts.config)?;
    std::fs::create_dir_all(&server_cfg.server_log_store_dir)?;
    logging::init(&server_cfg.server_log_file)?;

    let shutdown = ShutdownToken::new();
    {
        let token = shutdown.clone();
        ctrlc::set_handler(move || {
            info!("interrupt received, shutting down");
            token.trigger();
        })
        .map_err(std::io::Error::other)?;
    }

    // Every supervisor is built (and its UDP port bound) before any of them
    // starts, so configuration errors abort the whole run cleanly.
    let mut supervisors = Vec::new();
    for machine in &server_cfg.machines {
        if !machine.enabled {
            info!("machine {:?} is disabled, skipping", machine.cfg_file);
            continue;
        }
        let dut = DutConfig::load(&machine.cfg_file)?;
        let rotator = CommandRotator::from_files(&dut.json_files)?;
        let driver = switch::for_model(&dut.power_switch_model, &dut.power_switch_ip)?;
        let log_dir = server_cfg.server_log_store_dir.join(&dut.hostname);
        std::fs::create_dir_all(&log_dir)?;
        supervisors.push(DutSupervisor::new(
            dut,
            &server_cfg.server_ip,
            &log_dir,
            rotator,
            driver,
            shutdown.clone(),
        )?);
    }
    if supervisors.is_empty() {
        warn!("no machine enabled in {:?}, nothing to supervise", opts.config);
        return Ok(0);
    }

    let worker_died = Arc::new(AtomicBool::new(false));
    let mut handles = Vec::new();
    for supervisor in supervisors {
        let died = worker_died.clone();
        let token = shutdown.clone();
        let name = supervisor.hostname().to_owned();
        info!("starting supervisor for {name}");
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let result =
                    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| supervisor.run()));
                if result.is_err() {
                    error!("supervisor {name} died unexpectedly");
                    died.store(true, Ordering::SeqCst);
                    token.trigger();
                }
            })?;
        handles.push(handle);
    }
    info!("{} supervisor(s) running", handles.len());

    for handle in handles {
        let _ = handle.join();
    }

    if worker_died.load(Ordering::SeqCst) {
        return Ok(EXIT_WORKER_DIED);
    }
    if shutdown.is_triggered() {
        return Ok(EXIT_INTERRUPT);
    }
    Ok(0)
}
