use std::fmt::{self, Write};

use log::{Level, Metadata, Record};

use crate::syscall;

fn level_to_str(level: Level) -> &'static str {
    match level {
        Level::Error => "ERR",
        Level::Warn => "WRN",
        Level::Info => "INF",
        Level::Debug => "DBG",
        Level::Trace => "TRC",
    }
}

const LINE_BUFFER_LEN: usize = 1024;

// Formats into a fixed stack buffer; anything past the buffer is dropped.
// The logger must not allocate, since it runs inside the allocator hooks.
struct LineBuffer {
    buffer: [u8; LINE_BUFFER_LEN],
    length: usize,
}

impl LineBuffer {
    fn new() -> Self {
        LineBuffer {
            buffer: [0; LINE_BUFFER_LEN],
            length: 0,
        }
    }

    fn as_slice(&self) -> &[u8] {
        &self.buffer[..self.length]
    }
}

impl Write for LineBuffer {
    fn write_str(&mut self, input: &str) -> fmt::Result {
        let count = input.len().min(LINE_BUFFER_LEN - self.length);
        self.buffer[self.length..self.length + count].copy_from_slice(&input.as_bytes()[..count]);
        self.length += count;
        Ok(())
    }
}

pub struct SyscallLogger {
    level: log::LevelFilter,
    pid: u32,
}

impl SyscallLogger {
    pub const fn empty() -> Self {
        SyscallLogger {
            level: log::LevelFilter::Off,
            pid: 0,
        }
    }

    pub fn initialize(&mut self, level: log::LevelFilter, pid: u32) {
        self.level = level;
        self.pid = pid;
    }
}

impl log::Log for SyscallLogger {
    #[inline]
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    #[inline]
    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let mut line = LineBuffer::new();
            let _ = writeln!(
                line,
                "heapscope: {:04x} {:04x} {} {}",
                self.pid,
                syscall::gettid(),
                level_to_str(record.level()),
                record.args()
            );
            syscall::write(2, line.as_slice());
        }
    }

    #[inline]
    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_buffer_truncates() {
        let mut line = LineBuffer::new();
        for _ in 0..LINE_BUFFER_LEN {
            write!(line, "X").unwrap();
        }
        write!(line, "Y").unwrap();
        assert_eq!(line.as_slice().len(), LINE_BUFFER_LEN);
        assert!(line.as_slice().iter().all(|&byte| byte == b'X'));
    }
}
