//! Benchmark catalogue and command rotation
//!
//! The catalogue is the concatenation of one or more JSON files, each holding
//! a list of benchmark entries. The rotator hands out entries in declared
//! order, wrapping around, and tracks whether the currently running entry has
//! used up its execution window.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{debug, error};
use serde::Deserialize;

/// Command rotation result
pub type CommandResult<T> = Result<T, CommandError>;

/// Error produced while building the command rotator
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// No catalogue entry survived loading
    #[error("no benchmark commands available after loading the catalogue files")]
    NoCommands,
}

/// One benchmark invocation of the catalogue.
///
/// `exec` and `killcmd` are stored verbatim, including their terminating
/// `\r\n`; nothing is appended at send time.
#[derive(Debug, Clone, Deserialize)]
pub struct BenchmarkEntry {
    /// Command line that launches the benchmark on the DUT
    pub exec: String,
    /// Command line that kills a running instance of the benchmark
    pub killcmd: String,
    /// Short test name, embedded in the log file name
    pub test_name: String,
    /// Test header, written as the first line of the log file
    pub test_header: String,
    /// Nominal execution window in seconds before the rotator advances
    pub exec_window_seconds: u64,
}

/// Commands issued by one [CommandRotator::next] call
#[derive(Debug, Clone)]
pub struct IssuedCommand {
    /// ASCII bytes of the launch command
    pub run: Vec<u8>,
    /// ASCII bytes of the kill command
    pub kill: Vec<u8>,
    /// Test name of the entry
    pub test_name: String,
    /// Test header of the entry
    pub test_header: String,
}

/// Cycles through the benchmark catalogue of one DUT.
#[derive(Debug)]
pub struct CommandRotator {
    entries: Vec<BenchmarkEntry>,
    head: usize,
    current: usize,
    window_start: Instant,
}

impl CommandRotator {
    /// Builds a rotator from the concatenation of `files`.
    ///
    /// Files that cannot be read or parsed are logged and skipped; an empty
    /// resulting catalogue fails with [CommandError::NoCommands].
    pub fn from_files(files: &[PathBuf]) -> CommandResult<Self> {
        let mut entries = Vec::new();
        for file in files {
            match load_catalogue(file) {
                Ok(mut list) => entries.append(&mut list),
                Err(e) => error!("skipping catalogue {file:?}: {e}"),
            }
        }
        Self::from_entries(entries)
    }

    /// Builds a rotator directly from `entries`.
    pub fn from_entries(entries: Vec<BenchmarkEntry>) -> CommandResult<Self> {
        if entries.is_empty() {
            return Err(CommandError::NoCommands);
        }
        debug!("command rotator loaded with {} entries", entries.len());
        Ok(Self {
            entries,
            head: 0,
            current: 0,
            window_start: Instant::now(),
        })
    }

    /// Issues the entry at the head, advances the head (wrapping) and stamps
    /// the start of the entry's execution window.
    pub fn next(&mut self) -> IssuedCommand {
        self.current = self.head;
        self.head = (self.head + 1) % self.entries.len();
        self.window_start = Instant::now();
        let entry = &self.entries[self.current];
        IssuedCommand {
            run: entry.exec.as_bytes().to_vec(),
            kill: entry.killcmd.as_bytes().to_vec(),
            test_name: entry.test_name.clone(),
            test_header: entry.test_header.clone(),
        }
    }

    /// Kill command of the most recently issued entry.
    pub fn current_kill(&self) -> Vec<u8> {
        self.entries[self.current].killcmd.as_bytes().to_vec()
    }

    /// True once the most recently issued entry has run for at least its
    /// execution window.
    pub fn window_expired(&self) -> bool {
        let window = Duration::from_secs(self.entries[self.current].exec_window_seconds);
        self.window_start.elapsed() >= window
    }
}

fn load_catalogue(path: &Path) -> std::io::Result<Vec<BenchmarkEntry>> {
    let contents = std::fs::read_to_string(path)?;
    serde_json::from_str(&contents).map_err(std::io::Error::other)
}
