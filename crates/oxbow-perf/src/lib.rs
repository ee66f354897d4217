//! perf-map symbol emission.
//!
//! External profilers resolve JIT code through newline-terminated records
//! of the form `<host-address-hex> <size-hex> <name>` in
//! `/tmp/perf-<pid>.map` (Android's simpleperf looks in
//! `/data/local/tmp` instead). Writes append; the writer survives its
//! descriptor being closed by a remote `close()` by disabling itself on
//! the first EBADF.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PerfMapError {
    #[error("failed to open perf map: {0}")]
    Open(#[from] std::io::Error),
}

/// Buffered symbol records awaiting a flush.
#[derive(Debug, Default)]
pub struct SymbolBuffer {
    buffer: String,
}

impl SymbolBuffer {
    /// Flush once the buffer crosses this size.
    const FLUSH_THRESHOLD: usize = 4096;

    fn should_flush(&self) -> bool {
        self.buffer.len() >= Self::FLUSH_THRESHOLD
    }
}

pub struct JitSymbols {
    file: Option<File>,
}

impl JitSymbols {
    /// Standard perf-map path for this process.
    pub fn default_path() -> PathBuf {
        let pid = std::process::id();
        if cfg!(target_os = "android") {
            PathBuf::from(format!("/data/local/tmp/perf-{pid}.map"))
        } else {
            PathBuf::from(format!("/tmp/perf-{pid}.map"))
        }
    }

    pub fn new() -> Result<Self, PerfMapError> {
        Self::at_path(Self::default_path())
    }

    pub fn at_path(path: PathBuf) -> Result<Self, PerfMapError> {
        // Sequential single-writer stream; starts fresh per process.
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(JitSymbols { file: Some(file) })
    }

    /// Writer that drops every record; for embeddings without profiling.
    pub fn disabled() -> Self {
        JitSymbols { file: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.file.is_some()
    }

    fn write_record(&mut self, record: &str) {
        let Some(file) = &mut self.file else {
            return;
        };
        if let Err(err) = file.write_all(record.as_bytes()) {
            // A remote process may have closed our descriptor; stop
            // writing rather than spraying errors.
            if err.raw_os_error() == Some(9) {
                tracing::debug!("perf map descriptor closed remotely, disabling");
                self.file = None;
            }
        }
    }

    /// Emit one named region.
    pub fn register_named(&mut self, host_addr: usize, size: u32, name: &str) {
        if self.file.is_none() {
            return;
        }
        self.write_record(&format!("{host_addr:x} {size:x} {name}\n"));
    }

    /// Emit one JIT block with the conventional generated name.
    pub fn register_block(&mut self, host_addr: usize, guest_addr: u64, size: u32) {
        if self.file.is_none() {
            return;
        }
        self.write_record(&format!(
            "{host_addr:x} {size:x} JIT_0x{guest_addr:x}_0x{host_addr:x}\n"
        ));
    }

    /// Append a block record to a buffer, flushing when it fills.
    pub fn register_buffered(
        &mut self,
        buffer: &mut SymbolBuffer,
        host_addr: usize,
        guest_addr: u64,
        size: u32,
    ) {
        if self.file.is_none() {
            return;
        }
        use std::fmt::Write as _;
        let _ = writeln!(
            buffer.buffer,
            "{host_addr:x} {size:x} JIT_0x{guest_addr:x}_0x{host_addr:x}"
        );
        if buffer.should_flush() {
            self.flush_buffer(buffer);
        }
    }

    pub fn flush_buffer(&mut self, buffer: &mut SymbolBuffer) {
        if !buffer.buffer.is_empty() {
            let pending = std::mem::take(&mut buffer.buffer);
            self.write_record(&pending);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_have_perf_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perf.map");
        let mut syms = JitSymbols::at_path(path.clone()).unwrap();
        syms.register_named(0x7f00_1000, 0x40, "Dispatcher");
        syms.register_block(0x7f00_2000, 0x401000, 0x80);
        drop(syms);

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], "7f001000 40 Dispatcher");
        assert_eq!(lines[1], "7f002000 80 JIT_0x401000_0x7f002000");
    }

    #[test]
    fn buffered_records_flush_on_demand() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perf.map");
        let mut syms = JitSymbols::at_path(path.clone()).unwrap();
        let mut buffer = SymbolBuffer::default();
        syms.register_buffered(&mut buffer, 0x1000, 0x2000, 0x10);
        // Nothing on disk until the flush.
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
        syms.flush_buffer(&mut buffer);
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "1000 10 JIT_0x2000_0x1000\n");
    }

    #[test]
    fn disabled_writer_drops_records() {
        let mut syms = JitSymbols::disabled();
        assert!(!syms.is_enabled());
        syms.register_named(0x1000, 0x10, "nothing");
    }
}
