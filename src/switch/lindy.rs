//! Lindy IPower-style switch driver
//!
//! The chassis listens on the telnet port and accepts one command line per
//! connection after printing its banner. Outlets are addressed as `o01` ..
//! `o08`.

use std::time::Duration;

use log::debug;

use super::{SwitchDriver, SwitchResult, address_lock, command_reply, connect};

/// Control port of the chassis
pub const LINDY_PORT: u16 = 23;

/// Driver for one Lindy-style chassis.
#[derive(Debug, Clone)]
pub struct LindySwitch {
    addr: String,
}

impl LindySwitch {
    /// Creates a driver talking to `addr` (`ip:port`).
    pub fn new(addr: String) -> Self {
        Self { addr }
    }

    fn set_outlet(&self, outlet: u8, state: &str) -> SwitchResult<()> {
        let lock = address_lock(&self.addr);
        let _serialised = lock.lock().unwrap();
        let mut stream = connect(&self.addr)?;
        let command = format!("sw o{outlet:02} {state} imme\r\n");
        let reply = command_reply(&mut stream, command.as_bytes())?;
        debug!(
            "lindy {} outlet {outlet} -> {state}: {:?}",
            self.addr,
            String::from_utf8_lossy(&reply)
        );
        Ok(())
    }
}

impl SwitchDriver for LindySwitch {
    fn off(&self, outlet: u8, _rest: Duration) -> SwitchResult<()> {
        self.set_outlet(outlet, "off")
    }

    fn on(&self, outlet: u8) -> SwitchResult<()> {
        self.set_outlet(outlet, "on")
    }
}
