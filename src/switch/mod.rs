//! Network-controlled power switch drivers
//!
//! Each DUT is plugged into an outlet of a remotely switchable power
//! chassis. The [SwitchDriver] trait is the capability the supervisor
//! consumes: turn an outlet OFF, ON, or cycle it with a rest interval.
//! Vendors are selected at configuration time by a tag string.
//!
//! Drivers hold no state between calls. Two supervisors may share one
//! chassis on different outlets, so every conversation with a switch
//! address is serialised through a per-address mutex.

pub mod generic;
pub mod lindy;

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use log::debug;

use crate::shutdown::ShutdownToken;

/// Switch driver result
pub type SwitchResult<T> = Result<T, SwitchError>;

/// Error produced by a power switch driver
#[derive(Debug, thiserror::Error)]
pub enum SwitchError {
    /// The switch did not answer, or rejected the conversation
    #[error("switch unreachable: {0}")]
    Unreachable(String),
    /// The configured vendor tag matches no known driver
    #[error("unknown switch model: {0}")]
    UnknownModel(String),
}

/// Supported switch vendors, parsed from the configuration tag string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::EnumString, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum SwitchModel {
    /// Lindy IPower-style chassis, command-line protocol on the telnet port
    Lindy,
    /// Generic `$A3`-style chassis (NP-8601 compatible)
    Default,
}

/// IO timeout for one conversation with a switch
const SWITCH_IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Power control capability for one switch chassis.
pub trait SwitchDriver: Send {
    /// Turns `outlet` off. `rest` is the interval the caller intends to
    /// keep the outlet off; vendors with a timed-off command may latch it,
    /// the current ones switch immediately.
    fn off(&self, outlet: u8, rest: Duration) -> SwitchResult<()>;

    /// Turns `outlet` on.
    fn on(&self, outlet: u8) -> SwitchResult<()>;

    /// Power cycles `outlet`: OFF, a cooperative sleep of `rest`
    /// interruptible through `shutdown`, then ON.
    ///
    /// Both halves are always attempted; their results are returned as a
    /// pair so the caller can log each independently.
    fn cycle(
        &self,
        outlet: u8,
        rest: Duration,
        shutdown: &ShutdownToken,
    ) -> (SwitchResult<()>, SwitchResult<()>) {
        let off_result = self.off(outlet, rest);
        shutdown.sleep(rest);
        let on_result = self.on(outlet);
        (off_result, on_result)
    }
}

/// Builds the driver for `model` against the chassis at `ip`.
///
/// The tag string comes straight from the DUT YAML; anything that is not a
/// known vendor yields [SwitchError::UnknownModel].
pub fn for_model(model: &str, ip: &str) -> SwitchResult<Box<dyn SwitchDriver>> {
    match model.parse::<SwitchModel>() {
        Ok(SwitchModel::Lindy) => Ok(Box::new(lindy::LindySwitch::new(format!(
            "{ip}:{}",
            lindy::LINDY_PORT
        )))),
        Ok(SwitchModel::Default) => Ok(Box::new(generic::GenericSwitch::new(format!(
            "{ip}:{}",
            generic::GENERIC_PORT
        )))),
        Err(_) => Err(SwitchError::UnknownModel(model.to_owned())),
    }
}

/// Serialisation lock for one switch address, shared by every driver that
/// talks to that chassis.
pub(crate) fn address_lock(addr: &str) -> Arc<Mutex<()>> {
    static LOCKS: OnceLock<Mutex<HashMap<String, Arc<Mutex<()>>>>> = OnceLock::new();
    let locks = LOCKS.get_or_init(|| Mutex::new(HashMap::new()));
    locks
        .lock()
        .unwrap()
        .entry(addr.to_owned())
        .or_default()
        .clone()
}

/// Opens a connection to a switch with the module IO timeouts applied.
pub(crate) fn connect(addr: &str) -> SwitchResult<TcpStream> {
    let sock_addr: SocketAddr = addr
        .to_socket_addrs()
        .map_err(|e| SwitchError::Unreachable(format!("{addr}: {e}")))?
        .next()
        .ok_or_else(|| SwitchError::Unreachable(format!("{addr}: no address")))?;
    let stream = TcpStream::connect_timeout(&sock_addr, SWITCH_IO_TIMEOUT)
        .map_err(|e| SwitchError::Unreachable(format!("{addr}: {e}")))?;
    stream
        .set_read_timeout(Some(SWITCH_IO_TIMEOUT))
        .and_then(|_| stream.set_write_timeout(Some(SWITCH_IO_TIMEOUT)))
        .map_err(|e| SwitchError::Unreachable(format!("{addr}: {e}")))?;
    debug!("connected to switch {addr}");
    Ok(stream)
}

/// Writes `command` and reads one reply chunk.
pub(crate) fn command_reply(stream: &mut TcpStream, command: &[u8]) -> SwitchResult<Vec<u8>> {
    stream
        .write_all(command)
        .map_err(|e| SwitchError::Unreachable(format!("write failed: {e}")))?;
    let mut buf = [0u8; 256];
    let n = stream
        .read(&mut buf)
        .map_err(|e| SwitchError::Unreachable(format!("read failed: {e}")))?;
    Ok(buf[..n].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    struct StubSwitch;

    impl SwitchDriver for StubSwitch {
        fn off(&self, _outlet: u8, _rest: Duration) -> SwitchResult<()> {
            Ok(())
        }

        fn on(&self, _outlet: u8) -> SwitchResult<()> {
            Ok(())
        }
    }

    #[test]
    fn factory_rejects_unknown_tag() {
        let err = for_model("acme-3000", "10.0.0.100").err().unwrap();
        assert!(matches!(err, SwitchError::UnknownModel(tag) if tag == "acme-3000"));
    }

    #[test]
    fn factory_knows_both_vendors() {
        assert!(for_model("lindy", "10.0.0.100").is_ok());
        assert!(for_model("default", "10.0.0.100").is_ok());
    }

    #[test]
    fn same_address_shares_one_lock() {
        let a = address_lock("10.0.0.100:23");
        let b = address_lock("10.0.0.100:23");
        let c = address_lock("10.0.0.101:23");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn cycle_respects_rest_interval() {
        let token = ShutdownToken::new();
        let begin = Instant::now();
        let (off, on) = StubSwitch.cycle(1, Duration::from_millis(150), &token);
        assert!(off.is_ok());
        assert!(on.is_ok());
        assert!(begin.elapsed() >= Duration::from_millis(150));
    }

    #[test]
    fn cycle_rest_is_interruptible() {
        let token = ShutdownToken::new();
        token.trigger();
        let begin = Instant::now();
        let (off, on) = StubSwitch.cycle(1, Duration::from_secs(30), &token);
        assert!(off.is_ok());
        assert!(on.is_ok());
        assert!(begin.elapsed() < Duration::from_secs(1));
    }
}
