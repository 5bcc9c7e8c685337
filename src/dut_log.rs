//! Per-run DUT log files
//!
//! Every benchmark run of a DUT gets one append-only text file. The file is
//! created lazily on the first received message (the ECC state byte of that
//! message is locked into the file name), filled with one line per datagram
//! payload, and sealed exactly once with an end-status sentinel that records
//! why the run ended.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{Datelike, Local, Timelike};
use log::{debug, error};

/// DUT log result
pub type DutLogResult<T> = Result<T, DutLogError>;

/// Error produced by the DUT log file handling
#[derive(Debug, thiserror::Error)]
pub enum DutLogError {
    /// The log file could not be created
    #[error("log file creation failed for {path}: {source}")]
    CreateFailed {
        /// Path that failed to be created
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },
}

/// Why a DUT log was sealed. `Display` yields the exact sentinel written to
/// the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndStatus {
    /// The benchmark ran out its command window
    ServerEnd,
    /// The run ended because the DUT was power cycled
    DuePowerCycle,
    /// The run ended because the DUT stopped sending messages
    DueNotReceiving,
    /// The run ended because the benchmark was killed and relaunched
    DueSoftAppReboot,
    /// The run ended because the DUT operating system was rebooted
    DueSoftOsReboot,
    /// The server cannot tell why the run ended (shutdown, crash)
    Unknown,
}

impl std::fmt::Display for EndStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            EndStatus::ServerEnd => "#SERVER_END",
            EndStatus::DuePowerCycle => "#SERVER_DUE:power cycle",
            EndStatus::DueNotReceiving => "#SERVER_DUE:not receiving messages",
            EndStatus::DueSoftAppReboot => "#SERVER_DUE:soft-app reboot",
            EndStatus::DueSoftOsReboot => "#SERVER_DUE:soft-OS reboot",
            EndStatus::Unknown => "#SERVER_UNKNOWN",
        };
        write!(f, "{tag}")
    }
}

#[derive(Debug)]
enum LogState {
    Unopened,
    Open(File),
    Sealed,
}

/// Append-only log file for one benchmark run of one DUT.
///
/// The file itself is created on the first [DutLog::append]; until then the
/// log is inert and sealing it is a no-op. Once sealed, the log is finished
/// and must be replaced, never appended to again.
#[derive(Debug)]
pub struct DutLog {
    dir: PathBuf,
    test_name: String,
    test_header: String,
    hostname: String,
    path: Option<PathBuf>,
    state: LogState,
}

impl DutLog {
    /// Prepares a log for one run. No file is touched until the first
    /// message arrives.
    pub fn new(dir: &Path, test_name: &str, test_header: &str, hostname: &str) -> Self {
        Self {
            dir: dir.to_path_buf(),
            test_name: test_name.to_owned(),
            test_header: test_header.to_owned(),
            hostname: hostname.to_owned(),
            path: None,
            state: LogState::Unopened,
        }
    }

    /// Appends one datagram payload as a line.
    ///
    /// On the first call the file is created and the header lines written;
    /// `ecc_on` selects the `ECC_ON`/`ECC_OFF` tag of the file name and is
    /// ignored afterwards. A failed creation is logged and retried on the
    /// next message. Payload bytes are written verbatim with a trailing
    /// newline.
    pub fn append(&mut self, ecc_on: bool, payload: &[u8]) {
        if let LogState::Unopened = self.state {
            match self.create(ecc_on) {
                Ok(file) => self.state = LogState::Open(file),
                Err(e) => {
                    error!("{e}");
                    return;
                }
            }
        }
        match &mut self.state {
            LogState::Open(file) => {
                if let Err(e) = file.write_all(payload).and_then(|_| file.write_all(b"\n")) {
                    error!("append to {:?} failed: {e}", self.path);
                } else {
                    let _ = file.flush();
                }
            }
            LogState::Sealed => {
                debug_assert!(false, "append on a sealed DUT log");
                error!("dropped message for sealed log {:?}", self.path);
            }
            LogState::Unopened => unreachable!(),
        }
    }

    /// Seals the log with `status`, closing the file.
    ///
    /// Sealing an unopened log is a no-op; sealing twice writes the sentinel
    /// only once.
    pub fn seal(&mut self, status: EndStatus) {
        match std::mem::replace(&mut self.state, LogState::Sealed) {
            LogState::Open(mut file) => {
                let stamp = Local::now().format("%Y-%m-%d-%H-%M-%S");
                if let Err(e) = writeln!(file, "{status} TIME:{stamp}") {
                    error!("sealing {:?} failed: {e}", self.path);
                }
                debug!("sealed {:?} with {status}", self.path);
            }
            LogState::Unopened => {
                self.state = LogState::Unopened;
            }
            LogState::Sealed => {}
        }
    }

    /// Path of the file, once it has been created.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn create(&mut self, ecc_on: bool) -> DutLogResult<File> {
        let now = Local::now();
        let ecc = if ecc_on { "ON" } else { "OFF" };
        let filename = format!(
            "{}_{}_ECC_{}_{}.log",
            now.format("%Y_%m_%d_%H_%M_%S"),
            self.test_name,
            ecc,
            self.hostname
        );
        let path = self.dir.join(filename);
        let mut file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)
            .map_err(|source| DutLogError::CreateFailed {
                path: path.clone(),
                source,
            })?;
        writeln!(file, "#SERVER_HEADER {}", self.test_header)
            .and_then(|_| {
                writeln!(
                    file,
                    "#SERVER_BEGIN Y:{} M:{} D:{} TIME:{}:{}:{}-{}",
                    now.year(),
                    now.month(),
                    now.day(),
                    now.hour(),
                    now.minute(),
                    now.second(),
                    now.timestamp_subsec_micros()
                )
            })
            .map_err(|source| DutLogError::CreateFailed {
                path: path.clone(),
                source,
            })?;
        debug!("created DUT log {path:?}");
        self.path = Some(path);
        Ok(file)
    }
}

impl Drop for DutLog {
    /// Safety net: a log dropped while open is sealed with
    /// [EndStatus::Unknown].
    fn drop(&mut self) {
        if let LogState::Open(_) = self.state {
            self.seal(EndStatus::Unknown);
        }
    }
}
