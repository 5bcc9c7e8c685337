//! YAML configuration for the server and the per-DUT records
//!
//! Two schemas exist: the server file (listening address, log locations and
//! the machine roster) and one file per DUT with everything the supervisor
//! needs to monitor and recover that board.

use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Configuration load result
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Error produced when loading a YAML configuration file
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("cannot read config file {path}: {source}")]
    Read {
        /// Path that failed to open
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: io::Error,
    },
    /// The file is not valid YAML for the expected schema
    #[error("cannot parse config file {path}: {source}")]
    Parse {
        /// Path that failed to parse
        path: PathBuf,
        /// Underlying deserializer error
        #[source]
        source: serde_yaml::Error,
    },
}

/// Top level server parameters (`server_parameters.yaml`)
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address the UDP receive sockets bind to
    pub server_ip: String,
    /// File the server's own log lines are appended to
    pub server_log_file: PathBuf,
    /// Directory under which per-DUT log directories are created
    pub server_log_store_dir: PathBuf,
    /// Machine roster; disabled entries are skipped at startup
    pub machines: Vec<MachineEntry>,
}

/// One roster entry of the server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MachineEntry {
    /// Whether a supervisor is started for this DUT
    pub enabled: bool,
    /// Path of the DUT's own YAML configuration
    pub cfg_file: PathBuf,
}

/// Per-DUT configuration, immutable for the supervisor's lifetime
#[derive(Debug, Clone, Deserialize)]
pub struct DutConfig {
    /// DUT address on the beam network
    pub ip: String,
    /// DUT hostname, used for log directories and file names
    pub hostname: String,
    /// Remote shell username
    pub username: String,
    /// Remote shell password
    pub password: String,
    /// Local UDP port this DUT's telemetry arrives on
    pub receive_port: u16,
    /// Nominal boot duration in seconds; wait-for-boot polls for 1.3x this
    pub boot_waiting_time: u64,
    /// Receive timeout in seconds before the recovery ladder starts
    pub max_timeout_time: u64,
    /// Address of the power switch chassis the DUT is plugged into
    pub power_switch_ip: String,
    /// Outlet number on the switch chassis
    pub power_switch_port: u8,
    /// Vendor tag of the switch, e.g. "lindy" or "default"
    pub power_switch_model: String,
    /// Benchmark catalogue files, concatenated in order
    pub json_files: Vec<PathBuf>,
    /// Skip the soft-OS rung of the recovery ladder
    #[serde(default)]
    pub disable_os_soft_reboot: bool,
    /// TCP port of the DUT's remote shell
    #[serde(default = "default_shell_port")]
    pub shell_port: u16,
}

fn default_shell_port() -> u16 {
    23
}

impl ServerConfig {
    /// Loads the server parameters from `path`.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        load_yaml(path)
    }
}

impl DutConfig {
    /// Loads one DUT record from `path`.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        load_yaml(path)
    }

    /// Remote shell endpoint of this DUT.
    pub fn shell_addr(&self) -> String {
        format!("{}:{}", self.ip, self.shell_port)
    }
}

fn load_yaml<T: for<'de> Deserialize<'de>>(path: &Path) -> ConfigResult<T> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_tmp(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn parses_server_config() {
        let file = write_tmp(
            "server_ip: 192.168.1.5\nserver_log_file: server.log\nserver_log_store_dir: logs\nmachines:\n- enabled: true\n  cfg_file: dut1.yaml\n- enabled: false\n  cfg_file: dut2.yaml\n",
        );
        let cfg = ServerConfig::load(file.path()).unwrap();
        assert_eq!(cfg.server_ip, "192.168.1.5");
        assert_eq!(cfg.machines.len(), 2);
        assert!(cfg.machines[0].enabled);
        assert!(!cfg.machines[1].enabled);
    }

    #[test]
    fn parses_dut_config_with_defaults() {
        let file = write_tmp(
            "ip: 10.0.0.5\n\
             hostname: zedboard1\n\
             username: rad\n\
             password: beam\n\
             receive_port: 10100\n\
             boot_waiting_time: 60\n\
             max_timeout_time: 30\n\
             power_switch_ip: 10.0.0.100\n\
             power_switch_port: 3\n\
             power_switch_model: lindy\n\
             json_files:\n\
             - benchmarks.json\n",
        );
        let cfg = DutConfig::load(file.path()).unwrap();
        assert_eq!(cfg.receive_port, 10100);
        assert_eq!(cfg.power_switch_port, 3);
        assert!(!cfg.disable_os_soft_reboot);
        assert_eq!(cfg.shell_port, 23);
        assert_eq!(cfg.shell_addr(), "10.0.0.5:23");
    }

    #[test]
    fn rejects_missing_file() {
        let err = ServerConfig::load(Path::new("/nonexistent/server.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn rejects_malformed_yaml() {
        let file = write_tmp("server_ip: [unclosed\n");
        let err = ServerConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
