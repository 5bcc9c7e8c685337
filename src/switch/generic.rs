//! Generic `$A3`-style switch driver (the `"default"` vendor tag)
//!
//! NP-8601 compatible chassis: one `$A3 <outlet> <0|1>` command per
//! connection, acknowledged with `$A0` on success.

use std::time::Duration;

use log::debug;

use super::{SwitchDriver, SwitchError, SwitchResult, address_lock, command_reply, connect};

/// Control port of the chassis
pub const GENERIC_PORT: u16 = 23;

/// Driver for one `$A3`-style chassis.
#[derive(Debug, Clone)]
pub struct GenericSwitch {
    addr: String,
}

impl GenericSwitch {
    /// Creates a driver talking to `addr` (`ip:port`).
    pub fn new(addr: String) -> Self {
        Self { addr }
    }

    fn set_outlet(&self, outlet: u8, state: u8) -> SwitchResult<()> {
        let lock = address_lock(&self.addr);
        let _serialised = lock.lock().unwrap();
        let mut stream = connect(&self.addr)?;
        let command = format!("$A3 {outlet} {state}\r\n");
        let reply = command_reply(&mut stream, command.as_bytes())?;
        if !reply.starts_with(b"$A0") {
            return Err(SwitchError::Unreachable(format!(
                "{} rejected outlet command: {:?}",
                self.addr,
                String::from_utf8_lossy(&reply)
            )));
        }
        debug!("switch {} outlet {outlet} -> {state}", self.addr);
        Ok(())
    }
}

impl SwitchDriver for GenericSwitch {
    fn off(&self, outlet: u8, _rest: Duration) -> SwitchResult<()> {
        self.set_outlet(outlet, 0)
    }

    fn on(&self, outlet: u8) -> SwitchResult<()> {
        self.set_outlet(outlet, 1)
    }
}
