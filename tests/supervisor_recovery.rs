//! End-to-end supervisor tests against in-process peers: a TCP listener
//! playing the DUT shell dialogue, a recording power switch stub and a
//! plain UDP sender standing in for the DUT telemetry.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream, UdpSocket};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rad_supervisor::commands::{BenchmarkEntry, CommandRotator};
use rad_supervisor::config::DutConfig;
use rad_supervisor::shutdown::ShutdownToken;
use rad_supervisor::supervisor::DutSupervisor;
use rad_supervisor::switch::{SwitchDriver, SwitchResult};

/// One recorded switch operation.
#[derive(Debug, Clone)]
struct SwitchEvent {
    op: &'static str,
    outlet: u8,
    at: Instant,
}

/// SwitchDriver stub that records every call.
#[derive(Debug, Clone)]
struct RecordingSwitch {
    events: Arc<Mutex<Vec<SwitchEvent>>>,
}

impl RecordingSwitch {
    fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn events(&self) -> Vec<SwitchEvent> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, op: &'static str, outlet: u8) {
        self.events.lock().unwrap().push(SwitchEvent {
            op,
            outlet,
            at: Instant::now(),
        });
    }
}

impl SwitchDriver for RecordingSwitch {
    fn off(&self, outlet: u8, _rest: Duration) -> SwitchResult<()> {
        self.record("off", outlet);
        Ok(())
    }

    fn on(&self, outlet: u8) -> SwitchResult<()> {
        self.record("on", outlet);
        Ok(())
    }
}

/// Fake DUT shell: accepts any number of connections, plays the login
/// dialogue on each and collects whatever arrives after the prompt until
/// the peer hangs up.
struct FakeShell {
    port: u16,
    sessions: Arc<Mutex<Vec<Vec<u8>>>>,
    connections: Arc<AtomicUsize>,
}

impl FakeShell {
    fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let sessions: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));
        let sessions_acceptor = sessions.clone();
        let connections_acceptor = connections.clone();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                connections_acceptor.fetch_add(1, Ordering::SeqCst);
                let collected = sessions_acceptor.clone();
                std::thread::spawn(move || {
                    if let Ok(received) = serve_session(&mut stream) {
                        collected.lock().unwrap().push(received);
                    }
                });
            }
        });
        Self {
            port,
            sessions,
            connections,
        }
    }

    fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    fn session(&self, idx: usize) -> Vec<u8> {
        self.sessions.lock().unwrap()[idx].clone()
    }

    fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

fn serve_session(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    let mut buf = [0u8; 256];
    stream.write_all(b"dut login: ")?;
    stream.read(&mut buf)?;
    stream.write_all(b"Password: ")?;
    stream.read(&mut buf)?;
    stream.write_all(b"dut:~$ ")?;
    let mut received = Vec::new();
    loop {
        match stream.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => received.extend_from_slice(&buf[..n]),
        }
    }
    Ok(received)
}

fn entry(name: &str, window_seconds: u64) -> BenchmarkEntry {
    BenchmarkEntry {
        exec: format!("run_{name}\r\n"),
        killcmd: format!("pkill {name}\r\n"),
        test_name: name.to_owned(),
        test_header: format!("hdr-{name}"),
        exec_window_seconds: window_seconds,
    }
}

fn dut_config(shell_port: u16, max_timeout_time: u64) -> DutConfig {
    DutConfig {
        ip: "127.0.0.1".to_owned(),
        hostname: "testdut".to_owned(),
        username: "rad".to_owned(),
        password: "beam".to_owned(),
        receive_port: 0,
        boot_waiting_time: 1,
        max_timeout_time,
        power_switch_ip: "127.0.0.1".to_owned(),
        power_switch_port: 4,
        power_switch_model: "default".to_owned(),
        json_files: Vec::new(),
        disable_os_soft_reboot: false,
        shell_port,
    }
}

fn wait_until(what: &str, timeout: Duration, cond: impl Fn() -> bool) {
    let begin = Instant::now();
    while !cond() {
        assert!(
            begin.elapsed() < timeout,
            "gave up waiting for {what} after {timeout:?}"
        );
        std::thread::sleep(Duration::from_millis(50));
    }
}

fn log_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().is_some_and(|e| e == "log"))
        .collect();
    files.sort();
    files
}

fn payload_lines(contents: &str) -> Vec<&str> {
    contents
        .lines()
        .filter(|l| !l.starts_with("#SERVER_"))
        .collect()
}

fn free_tcp_port() -> u16 {
    let sock = TcpListener::bind("127.0.0.1:0").unwrap();
    sock.local_addr().unwrap().port()
}

#[test]
fn happy_path_collects_messages_and_seals_unknown_on_shutdown() {
    let shell = FakeShell::spawn();
    let dir = tempfile::tempdir().unwrap();
    let token = ShutdownToken::new();
    let rotator = CommandRotator::from_entries(vec![entry("a", 3600)]).unwrap();
    let supervisor = DutSupervisor::new(
        dut_config(shell.port, 10),
        "127.0.0.1",
        dir.path(),
        rotator,
        Box::new(RecordingSwitch::new()),
        token.clone(),
    )
    .unwrap();
    let udp_addr = supervisor.local_addr().unwrap();
    let worker = std::thread::spawn(move || supervisor.run());

    // Benchmark launched once the first shell session has been released.
    wait_until("first launch", Duration::from_secs(10), || {
        shell.session_count() >= 1
    });

    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    for _ in 0..10 {
        let mut msg = vec![0u8];
        msg.extend_from_slice(b"hello i");
        sender.send_to(&msg, udp_addr).unwrap();
        std::thread::sleep(Duration::from_millis(100));
    }
    std::thread::sleep(Duration::from_millis(500));
    token.trigger();
    worker.join().unwrap();

    let files = log_files(dir.path());
    assert_eq!(files.len(), 1, "expected exactly one log file");
    let name = files[0].file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.contains("_a_ECC_OFF_testdut"), "bad file name {name}");

    let contents = std::fs::read_to_string(&files[0]).unwrap();
    assert_eq!(contents.lines().next().unwrap(), "#SERVER_HEADER hdr-a");
    assert!(contents.lines().nth(1).unwrap().starts_with("#SERVER_BEGIN Y:"));
    assert_eq!(payload_lines(&contents).len(), 10);
    assert!(payload_lines(&contents).iter().all(|l| *l == "hello i"));
    assert!(
        contents
            .lines()
            .last()
            .unwrap()
            .starts_with("#SERVER_UNKNOWN TIME:")
    );

    // First shell session carried the kill, then the run command.
    let dialogue = shell.session(0);
    let text = String::from_utf8_lossy(&dialogue);
    let kill_at = text.find("pkill a\r\n").expect("kill command sent");
    let run_at = text.find("run_a\r\n").expect("run command sent");
    assert!(kill_at < run_at);
}

#[test]
fn receive_timeout_runs_soft_app_recovery() {
    let shell = FakeShell::spawn();
    let dir = tempfile::tempdir().unwrap();
    let token = ShutdownToken::new();
    let rotator = CommandRotator::from_entries(vec![entry("a", 3600)]).unwrap();
    let supervisor = DutSupervisor::new(
        dut_config(shell.port, 2),
        "127.0.0.1",
        dir.path(),
        rotator,
        Box::new(RecordingSwitch::new()),
        token.clone(),
    )
    .unwrap();
    let udp_addr = supervisor.local_addr().unwrap();
    let worker = std::thread::spawn(move || supervisor.run());

    wait_until("first launch", Duration::from_secs(10), || {
        shell.session_count() >= 1
    });
    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    sender.send_to(&[0u8, b'h', b'i'], udp_addr).unwrap();

    // Silence now; the 2s timeout must drive a kill + relaunch.
    wait_until("soft-app relaunch", Duration::from_secs(15), || {
        shell.session_count() >= 2
    });
    // The DUT talks again, materialising the second log file.
    sender.send_to(&[0u8, b'h', b'i'], udp_addr).unwrap();
    wait_until("second log file", Duration::from_secs(10), || {
        log_files(dir.path()).len() >= 2
    });
    token.trigger();
    worker.join().unwrap();

    let files = log_files(dir.path());
    let first = std::fs::read_to_string(&files[0]).unwrap();
    assert!(
        first
            .lines()
            .last()
            .unwrap()
            .starts_with("#SERVER_DUE:not receiving messages TIME:"),
        "first log not sealed by the timeout: {first}"
    );
    for idx in 0..2 {
        let dialogue = shell.session(idx);
        let text = String::from_utf8_lossy(&dialogue);
        let kill_at = text.find("pkill a\r\n").expect("kill command sent");
        let run_at = text.find("run_a\r\n").expect("run command sent");
        assert!(kill_at < run_at);
    }
}

#[test]
fn dead_shell_escalates_to_power_cycle() {
    // Nothing listens on the shell port: every rung of the ladder fails
    // until the power cycle.
    let shell_port = free_tcp_port();
    let dir = tempfile::tempdir().unwrap();
    let token = ShutdownToken::new();
    let rotator = CommandRotator::from_entries(vec![entry("a", 3600)]).unwrap();
    let switch = RecordingSwitch::new();
    let supervisor = DutSupervisor::new(
        dut_config(shell_port, 2),
        "127.0.0.1",
        dir.path(),
        rotator,
        Box::new(switch.clone()),
        token.clone(),
    )
    .unwrap();
    let worker = std::thread::spawn(move || supervisor.run());

    wait_until("a power cycle", Duration::from_secs(30), || {
        let events = switch.events();
        events.iter().any(|e| e.op == "off") && events.last().is_some_and(|e| e.op == "on")
    });
    token.trigger();
    worker.join().unwrap();

    let events = switch.events();
    // Initial power on comes first, then OFF/ON pairs from hard cycles.
    assert_eq!(events[0].op, "on");
    let off_idx = events.iter().position(|e| e.op == "off").unwrap();
    let off = &events[off_idx];
    let on = &events[off_idx + 1];
    assert_eq!(on.op, "on");
    assert_eq!(off.outlet, 4);
    assert_eq!(on.outlet, 4);
    assert!(
        on.at.duration_since(off.at) >= Duration::from_secs(2),
        "rest interval between OFF and ON was too short"
    );
    // No log file was ever opened: no messages arrived.
    assert!(log_files(dir.path()).is_empty());
}

#[test]
fn window_expiry_rotates_to_the_next_benchmark() {
    let shell = FakeShell::spawn();
    let dir = tempfile::tempdir().unwrap();
    let token = ShutdownToken::new();
    let rotator = CommandRotator::from_entries(vec![entry("a", 1), entry("b", 1)]).unwrap();
    let supervisor = DutSupervisor::new(
        dut_config(shell.port, 10),
        "127.0.0.1",
        dir.path(),
        rotator,
        Box::new(RecordingSwitch::new()),
        token.clone(),
    )
    .unwrap();
    let udp_addr = supervisor.local_addr().unwrap();
    let worker = std::thread::spawn(move || supervisor.run());

    wait_until("first launch", Duration::from_secs(10), || {
        shell.session_count() >= 1
    });
    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    let mut sent = 0usize;
    for i in 0..24 {
        let mut msg = vec![0u8];
        msg.extend_from_slice(format!("beat {i}").as_bytes());
        sender.send_to(&msg, udp_addr).unwrap();
        sent += 1;
        std::thread::sleep(Duration::from_millis(250));
    }
    wait_until("rotation to entry b", Duration::from_secs(15), || {
        log_files(dir.path()).len() >= 2
    });
    // Let a relaunch that may be in flight finish and drain the datagrams
    // buffered while the shell dialogue ran.
    std::thread::sleep(Duration::from_secs(3));
    token.trigger();
    worker.join().unwrap();

    let files = log_files(dir.path());
    assert!(files.len() >= 2, "expected at least two log files");
    let first_name = files[0].file_name().unwrap().to_string_lossy().into_owned();
    let second_name = files[1].file_name().unwrap().to_string_lossy().into_owned();
    assert!(first_name.contains("_a_"), "bad first file {first_name}");
    assert!(second_name.contains("_b_"), "bad second file {second_name}");

    let first = std::fs::read_to_string(&files[0]).unwrap();
    assert!(
        first.lines().last().unwrap().starts_with("#SERVER_END TIME:"),
        "window rotation must seal with #SERVER_END: {first}"
    );

    // No datagram is lost across rotations: buffered ones land in the
    // next run's log.
    let total: usize = files
        .iter()
        .map(|f| payload_lines(&std::fs::read_to_string(f).unwrap()).len())
        .sum();
    assert_eq!(total, sent);
}

#[test]
fn shutdown_mid_soft_app_is_prompt_and_releases_the_endpoint() {
    let shell = FakeShell::spawn();
    let dir = tempfile::tempdir().unwrap();
    let token = ShutdownToken::new();
    let rotator = CommandRotator::from_entries(vec![entry("a", 3600)]).unwrap();
    let supervisor = DutSupervisor::new(
        dut_config(shell.port, 2),
        "127.0.0.1",
        dir.path(),
        rotator,
        Box::new(RecordingSwitch::new()),
        token.clone(),
    )
    .unwrap();
    let udp_addr = supervisor.local_addr().unwrap();
    let worker = std::thread::spawn(move || supervisor.run());

    wait_until("first launch", Duration::from_secs(10), || {
        shell.session_count() >= 1
    });
    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    sender.send_to(&[0u8, b'h', b'i'], udp_addr).unwrap();

    // Silence triggers a soft-app retry; fire the shutdown while the
    // launch dialogue is inside one of its settle sleeps.
    wait_until("soft-app retry begins", Duration::from_secs(15), || {
        shell.connection_count() >= 2
    });
    std::thread::sleep(Duration::from_millis(500));
    let begin = Instant::now();
    token.trigger();
    worker.join().unwrap();
    assert!(
        begin.elapsed() < Duration::from_millis(1500),
        "shutdown took {:?}",
        begin.elapsed()
    );

    // Every file on disk carries a seal, and the UDP endpoint is free
    // again.
    for file in log_files(dir.path()) {
        let contents = std::fs::read_to_string(&file).unwrap();
        let last = contents.lines().last().unwrap();
        assert!(
            last.starts_with("#SERVER_END")
                || last.starts_with("#SERVER_DUE:")
                || last.starts_with("#SERVER_UNKNOWN"),
            "unsealed log {file:?}: {last}"
        );
    }
    UdpSocket::bind(udp_addr).expect("UDP endpoint not released");
}
