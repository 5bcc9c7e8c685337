//! Per-DUT supervisor: the recovery state machine
//!
//! One supervisor owns one DUT: its UDP telemetry endpoint, its current log
//! file, its benchmark rotation and its escalation counters. The machine
//! starts by powering the DUT on, launches a benchmark over the remote
//! shell, then sits in the receive loop. A receive timeout walks the
//! recovery ladder: kill-and-relaunch the benchmark (soft-app), reboot the
//! operating system (soft-OS), power cycle the outlet (hard), until
//! telemetry resumes or the process-wide shutdown fires.

use std::net::{SocketAddr, UdpSocket};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::ServerResult;
use crate::commands::CommandRotator;
use crate::config::DutConfig;
use crate::dut_log::{DutLog, EndStatus};
use crate::shell::{ShellError, ShellResult, ShellSession};
use crate::shutdown::ShutdownToken;
use crate::switch::SwitchDriver;

/// Consecutive soft-app relaunches before escalating to soft-OS
const MAX_SOFT_APP: u32 = 3;
/// Consecutive soft-OS reboots before escalating to hard power cycles
const MAX_SOFT_OS: u32 = 3;
/// Consecutive hard cycles before the extended rest kicks in
const MAX_HARD: u32 = 6;
/// OFF interval of a normal power cycle
const HARD_REST: Duration = Duration::from_secs(2);
/// OFF interval once MAX_HARD consecutive cycles did not help
const HARD_REST_AFTER_OVERFLOW: Duration = Duration::from_secs(1800);
/// Headroom factor on the configured boot time while polling for the DUT
const BOOT_WAIT_FACTOR: f64 = 1.3;
/// Interval between login probes while waiting for a boot
const BOOT_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Login attempts per benchmark launch
const LAUNCH_ATTEMPTS: u32 = 4;
/// Settle time after sending the kill and the run command
const LAUNCH_SETTLE: Duration = Duration::from_secs(1);
/// Upper bound of one receive wait, so shutdown is observed promptly
const RECV_QUANTUM: Duration = Duration::from_secs(1);
/// Maximum datagram size: 1 ECC byte + payload
const UDP_MAX: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
enum State {
    Booting,
    SoftApp,
    Running,
    SoftOs,
    Hard,
    Stopped,
}

/// Supervisor for one DUT.
pub struct DutSupervisor {
    cfg: DutConfig,
    log_dir: PathBuf,
    rotator: CommandRotator,
    switch: Box<dyn SwitchDriver>,
    shutdown: ShutdownToken,
    socket: UdpSocket,
    current_log: Option<DutLog>,
    pending_seal: Option<EndStatus>,
    soft_app_tries: u32,
    soft_os_tries: u32,
    hard_cycles: u32,
    launched_before: bool,
    last_rx: Instant,
    ident: String,
}

impl std::fmt::Debug for DutSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DutSupervisor {}", self.ident)
    }
}

impl DutSupervisor {
    /// Builds a supervisor and binds its UDP endpoint (exactly once for the
    /// supervisor's lifetime) on `bind_ip`:`receive_port`.
    ///
    /// `log_dir` is the directory the per-run DUT logs are written to; it
    /// must already exist.
    pub fn new(
        cfg: DutConfig,
        bind_ip: &str,
        log_dir: &Path,
        rotator: CommandRotator,
        switch: Box<dyn SwitchDriver>,
        shutdown: ShutdownToken,
    ) -> ServerResult<Self> {
        let socket = UdpSocket::bind((bind_ip, cfg.receive_port))?;
        let quantum = RECV_QUANTUM.min(Duration::from_secs(cfg.max_timeout_time.max(1)));
        socket.set_read_timeout(Some(quantum))?;
        let ident = format!(
            "HOSTNAME:{} IP:{} PORT:{}",
            cfg.hostname, cfg.ip, cfg.receive_port
        );
        Ok(Self {
            cfg,
            log_dir: log_dir.to_path_buf(),
            rotator,
            switch,
            shutdown,
            socket,
            current_log: None,
            pending_seal: None,
            soft_app_tries: 0,
            soft_os_tries: 0,
            hard_cycles: 0,
            launched_before: false,
            last_rx: Instant::now(),
            ident,
        })
    }

    /// Local address of the UDP endpoint.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Hostname of the supervised DUT.
    pub fn hostname(&self) -> &str {
        &self.cfg.hostname
    }

    /// Runs the supervisor until the shutdown token fires.
    ///
    /// On exit the current log (if any) is sealed with
    /// [EndStatus::Unknown] and the UDP endpoint is released.
    pub fn run(mut self) {
        info!("{} supervisor started", self.ident);
        let mut state = State::Booting;
        loop {
            if self.shutdown.is_triggered() {
                break;
            }
            let next = match state {
                State::Booting => self.boot(),
                State::SoftApp => self.soft_app(),
                State::Running => self.receive(),
                State::SoftOs => self.soft_os(),
                State::Hard => self.hard(),
                State::Stopped => break,
            };
            if next != state {
                debug!("{} {state} -> {next}", self.ident);
            }
            state = next;
        }
        self.finish();
    }

    /// BOOTING: the DUT must start powered on. A failed power-on is logged
    /// and the ladder continues; the receive timeout will catch a dead
    /// board.
    fn boot(&mut self) -> State {
        info!(
            "{} initial power on, outlet {} on {}",
            self.ident, self.cfg.power_switch_port, self.cfg.power_switch_ip
        );
        if let Err(e) = self.switch.on(self.cfg.power_switch_port) {
            error!("{} initial power on failed: {e}", self.ident);
        }
        State::SoftApp
    }

    /// SOFT_APP: kill and relaunch the benchmark over the shell.
    fn soft_app(&mut self) -> State {
        if self.soft_app_tries >= MAX_SOFT_APP {
            warn!(
                "{} soft-app retry limit reached ({MAX_SOFT_APP}), escalating to OS reboot",
                self.ident
            );
            return State::SoftOs;
        }
        match self.launch_benchmark() {
            Ok(()) => {
                self.last_rx = Instant::now();
                State::Running
            }
            Err(e) => {
                error!("{} benchmark launch failed: {e}", self.ident);
                State::SoftOs
            }
        }
    }

    /// RUNNING: the timed UDP receive loop.
    fn receive(&mut self) -> State {
        let deadline = Duration::from_secs(self.cfg.max_timeout_time);
        let mut buf = [0u8; UDP_MAX];
        loop {
            if self.shutdown.is_triggered() {
                return State::Stopped;
            }
            match self.socket.recv_from(&mut buf) {
                Ok((n, _peer)) if n > 0 => {
                    self.last_rx = Instant::now();
                    let ecc_on = buf[0] != 0;
                    let payload = &buf[1..n];
                    debug!(
                        "{} message: {}",
                        self.ident,
                        String::from_utf8_lossy(payload)
                    );
                    if let Some(log) = self.current_log.as_mut() {
                        log.append(ecc_on, payload);
                    }
                    self.hard_cycles = 0;
                    if payload_has_iteration_tag(payload) {
                        self.soft_app_tries = 0;
                    }
                    if self.rotator.window_expired() {
                        info!("{} command window elapsed, rotating benchmark", self.ident);
                        self.pending_seal = Some(EndStatus::ServerEnd);
                        return State::SoftApp;
                    }
                }
                Ok(_) => debug!("{} empty datagram ignored", self.ident),
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    if self.last_rx.elapsed() >= deadline {
                        warn!(
                            "{} no messages for {}s, starting recovery",
                            self.ident, self.cfg.max_timeout_time
                        );
                        self.pending_seal = Some(EndStatus::DueNotReceiving);
                        return State::SoftApp;
                    }
                }
                Err(e) => {
                    error!("{} receive failed: {e}", self.ident);
                    self.shutdown.sleep(RECV_QUANTUM);
                }
            }
        }
    }

    /// SOFT_OS: reboot the DUT operating system over the shell.
    fn soft_os(&mut self) -> State {
        if self.cfg.disable_os_soft_reboot {
            info!(
                "{} soft-OS rung disabled by configuration, escalating to power cycle",
                self.ident
            );
            return State::Hard;
        }
        if self.soft_os_tries >= MAX_SOFT_OS {
            warn!(
                "{} soft-OS retry limit reached ({MAX_SOFT_OS}), escalating to power cycle",
                self.ident
            );
            return State::Hard;
        }
        self.soft_os_tries += 1;
        info!(
            "{} requesting OS reboot ({}/{MAX_SOFT_OS})",
            self.ident, self.soft_os_tries
        );
        match self.reboot_os() {
            Ok(()) => {
                self.pending_seal = Some(EndStatus::DueSoftOsReboot);
                if let Err(e) = self.wait_for_boot() {
                    warn!("{} proceeding without boot confirmation: {e}", self.ident);
                }
                self.soft_app_tries = 0;
                State::SoftApp
            }
            Err(e) => {
                error!("{} OS reboot failed: {e}", self.ident);
                State::Hard
            }
        }
    }

    /// HARD: power cycle the DUT's outlet.
    fn hard(&mut self) -> State {
        let overflow = self.hard_cycles > MAX_HARD;
        let rest = if overflow {
            warn!(
                "{} {} consecutive power cycles without recovery, next rest {}s",
                self.ident,
                self.hard_cycles,
                HARD_REST_AFTER_OVERFLOW.as_secs()
            );
            HARD_REST_AFTER_OVERFLOW
        } else {
            HARD_REST
        };
        info!(
            "{} power cycling outlet {} on {} (rest {}s)",
            self.ident,
            self.cfg.power_switch_port,
            self.cfg.power_switch_ip,
            rest.as_secs()
        );
        let (off_result, on_result) =
            self.switch
                .cycle(self.cfg.power_switch_port, rest, &self.shutdown);
        // An extended-rest cycle starts the count over.
        self.hard_cycles = if overflow { 0 } else { self.hard_cycles + 1 };
        match (&off_result, &on_result) {
            (Ok(()), Ok(())) => info!("{} power cycle complete", self.ident),
            (off, on) => error!(
                "{} power cycle degraded: off={off:?} on={on:?}",
                self.ident
            ),
        }
        self.pending_seal = Some(EndStatus::DuePowerCycle);
        if let Err(e) = self.wait_for_boot() {
            warn!("{} proceeding without boot confirmation: {e}", self.ident);
        }
        self.soft_app_tries = 0;
        self.soft_os_tries = 0;
        State::SoftApp
    }

    /// Kill + relaunch dialogue: up to [LAUNCH_ATTEMPTS] scoped shell
    /// sessions. On success the previous log is sealed with the pending
    /// reason and replaced by a fresh one for the rotated entry. The very
    /// first launch of a supervisor is not a recovery and does not count
    /// towards `soft_app_tries`.
    fn launch_benchmark(&mut self) -> ShellResult<()> {
        let kill_previous = self.rotator.current_kill();
        let command = self.rotator.next();
        let mut last_err: Option<ShellError> = None;
        for attempt in 1..=LAUNCH_ATTEMPTS {
            if self.shutdown.is_triggered() {
                break;
            }
            match self.try_launch(&kill_previous, &command.run) {
                Ok(()) => {
                    if let Some(mut old) = self.current_log.take() {
                        let reason = self.pending_seal.take().unwrap_or(EndStatus::Unknown);
                        old.seal(reason);
                    }
                    self.pending_seal = None;
                    self.current_log = Some(DutLog::new(
                        &self.log_dir,
                        &command.test_name,
                        &command.test_header,
                        &self.cfg.hostname,
                    ));
                    if self.launched_before {
                        self.soft_app_tries += 1;
                    }
                    self.launched_before = true;
                    info!(
                        "{} launched {} (soft-app tries {}/{MAX_SOFT_APP})",
                        self.ident, command.test_name, self.soft_app_tries
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "{} launch attempt {attempt}/{LAUNCH_ATTEMPTS} failed: {e}",
                        self.ident
                    );
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| ShellError::Shell("launch interrupted".into())))
    }

    /// One scoped kill + run dialogue. The session closes on every exit
    /// path.
    fn try_launch(&self, kill: &[u8], run: &[u8]) -> ShellResult<()> {
        let mut session = self.open_shell()?;
        session.write(kill)?;
        session.drain();
        self.shutdown.sleep(LAUNCH_SETTLE);
        session.write(run)?;
        session.drain();
        self.shutdown.sleep(LAUNCH_SETTLE);
        Ok(())
    }

    fn reboot_os(&self) -> ShellResult<()> {
        let mut session = self.open_shell()?;
        session.write(b"sudo /sbin/reboot\r\n")?;
        session.drain();
        Ok(())
    }

    /// Polls the shell login once per second for up to
    /// [BOOT_WAIT_FACTOR] x `boot_waiting_time`. Host-unreachable probes
    /// are expected while the DUT is down; exhausting the window is an
    /// error the caller may ignore (the next ladder rung will find out).
    fn wait_for_boot(&self) -> ShellResult<()> {
        let window =
            Duration::from_secs_f64(self.cfg.boot_waiting_time as f64 * BOOT_WAIT_FACTOR);
        let begin = Instant::now();
        info!(
            "{} waiting up to {:.0}s for the DUT to boot",
            self.ident,
            window.as_secs_f64()
        );
        while begin.elapsed() < window {
            if self.shutdown.is_triggered() {
                return Err(ShellError::Shell("shutdown during boot wait".into()));
            }
            match self.open_shell() {
                Ok(_session) => {
                    info!(
                        "{} DUT is back after {:.0}s",
                        self.ident,
                        begin.elapsed().as_secs_f64()
                    );
                    return Ok(());
                }
                Err(ShellError::HostUnreachable(e)) => {
                    debug!("{} not booted yet: {e}", self.ident)
                }
                Err(e) => debug!("{} boot probe failed: {e}", self.ident),
            }
            if self.shutdown.sleep(BOOT_POLL_INTERVAL) {
                return Err(ShellError::Shell("shutdown during boot wait".into()));
            }
        }
        Err(ShellError::Shell(format!(
            "DUT did not boot within {:.0}s",
            window.as_secs_f64()
        )))
    }

    fn open_shell(&self) -> ShellResult<ShellSession> {
        ShellSession::login(
            &self.cfg.shell_addr(),
            &self.cfg.username,
            &self.cfg.password,
            Duration::from_secs(self.cfg.max_timeout_time.max(1)),
        )
    }

    fn finish(&mut self) {
        if let Some(mut log) = self.current_log.take() {
            log.seal(EndStatus::Unknown);
        }
        info!("{} supervisor stopped", self.ident);
    }
}

/// The DUTs tag iteration boundary messages with `#IT`; seeing one proves
/// the benchmark is making progress.
fn payload_has_iteration_tag(payload: &[u8]) -> bool {
    payload.windows(3).any(|w| w == b"#IT")
}
