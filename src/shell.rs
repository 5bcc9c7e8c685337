//! Line-oriented remote shell to a DUT
//!
//! The DUTs expose a plaintext remote-terminal service. A session performs
//! the fixed login handshake (`ogin: ` / `assword: ` / `$ `), after which
//! the caller writes raw command bytes and drains whatever the shell echoes
//! back. The session closes its connection when dropped, so every exit path
//! releases it.

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use log::{debug, trace};

/// Shell session result
pub type ShellResult<T> = Result<T, ShellError>;

/// Error produced by a shell session
#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    /// The DUT could not be reached at all
    #[error("host unreachable: {0}")]
    HostUnreachable(#[source] std::io::Error),
    /// The DUT answered but the shell dialogue failed (bad prompt, EOF,
    /// timeout)
    #[error("shell failure: {0}")]
    Shell(String),
}

/// Poll interval while waiting for a prompt
const PROMPT_POLL: Duration = Duration::from_millis(200);

/// An authenticated interactive shell on a DUT.
#[derive(Debug)]
pub struct ShellSession {
    stream: TcpStream,
}

impl ShellSession {
    /// Connects to `addr` and runs the login handshake.
    ///
    /// Every wait of the handshake is bounded by `timeout`. A connection
    /// that cannot be established surfaces [ShellError::HostUnreachable];
    /// everything that goes wrong afterwards is [ShellError::Shell].
    pub fn login(
        addr: &str,
        username: &str,
        password: &str,
        timeout: Duration,
    ) -> ShellResult<Self> {
        let sock_addr = resolve(addr)?;
        let stream = TcpStream::connect_timeout(&sock_addr, timeout)
            .map_err(ShellError::HostUnreachable)?;
        stream
            .set_read_timeout(Some(PROMPT_POLL))
            .map_err(|e| ShellError::Shell(e.to_string()))?;
        let mut session = Self { stream };

        let deadline = Instant::now() + timeout;
        session.wait_for(b"ogin: ", deadline)?;
        session.write(username.as_bytes())?;
        session.write(b"\n")?;
        session.wait_for(b"assword: ", deadline)?;
        session.write(password.as_bytes())?;
        session.write(b"\n")?;
        session.wait_for(b"$ ", deadline)?;
        debug!("shell session to {addr} established");
        Ok(session)
    }

    /// Writes raw bytes to the shell.
    pub fn write(&mut self, bytes: &[u8]) -> ShellResult<()> {
        self.stream
            .write_all(bytes)
            .and_then(|_| self.stream.flush())
            .map_err(|e| ShellError::Shell(format!("write failed: {e}")))
    }

    /// Reads and discards whatever the shell has immediately available.
    pub fn drain(&mut self) {
        if self.stream.set_nonblocking(true).is_err() {
            return;
        }
        let mut buf = [0u8; 512];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => trace!("drained {n} shell bytes"),
            }
        }
        let _ = self.stream.set_nonblocking(false);
        let _ = self.stream.set_read_timeout(Some(PROMPT_POLL));
    }

    /// Accumulates incoming bytes until they end with `pattern`.
    fn wait_for(&mut self, pattern: &[u8], deadline: Instant) -> ShellResult<()> {
        let mut seen: Vec<u8> = Vec::new();
        let mut buf = [0u8; 512];
        while Instant::now() < deadline {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    return Err(ShellError::Shell(format!(
                        "connection closed while waiting for {:?}",
                        String::from_utf8_lossy(pattern)
                    )));
                }
                Ok(n) => {
                    seen.extend_from_slice(&buf[..n]);
                    if seen.ends_with(pattern) {
                        return Ok(());
                    }
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => return Err(ShellError::Shell(format!("read failed: {e}"))),
            }
        }
        Err(ShellError::Shell(format!(
            "timed out waiting for {:?}",
            String::from_utf8_lossy(pattern)
        )))
    }
}

impl Drop for ShellSession {
    fn drop(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

fn resolve(addr: &str) -> ShellResult<SocketAddr> {
    addr.to_socket_addrs()
        .map_err(ShellError::HostUnreachable)?
        .next()
        .ok_or_else(|| ShellError::Shell(format!("address {addr} did not resolve")))
}
