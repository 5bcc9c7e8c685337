//! Server log setup
//!
//! Every log line goes to the console and is appended to the server log
//! file configured in the YAML. The format is one line per record so the
//! file stays greppable during a beam run.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use chrono::Local;
use env_logger::{Builder, Env, Target};

/// Installs the global logger, teeing records to stderr and `log_file`.
///
/// The default level is `debug`; `RUST_LOG` overrides it. Calling this a
/// second time is a no-op (the first logger wins), which keeps it usable
/// from tests.
pub fn init(log_file: &Path) -> std::io::Result<()> {
    let file = OpenOptions::new().create(true).append(true).open(log_file)?;
    let mut builder = Builder::from_env(Env::default().default_filter_or("debug"));
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{} {:<5} {} {}",
                Local::now().format("%d-%m-%y %H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .target(Target::Pipe(Box::new(Tee { file })));
    let _ = builder.try_init();
    Ok(())
}

/// Duplicates everything written through it to stderr and the log file.
struct Tee {
    file: File,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let _ = std::io::stderr().write_all(buf);
        self.file.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let _ = std::io::stderr().flush();
        self.file.flush()
    }
}
