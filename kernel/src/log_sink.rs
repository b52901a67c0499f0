//! Structured kernel log sink.
//!
//! Backs the crate-wide `log::info!`/`log::warn!`/etc. macros with a
//! fixed-size, heap-free circular buffer of structured entries, and echoes
//! every record to the serial console as it arrives. [`init`] installs
//! [`KERNEL_LOGGER`] as the global `log` backend; must run once, early,
//! right after [`crate::serial::init`].
//!
//! ```ignore
//! log_sink::init();
//! log::info!("scheduler initialized");
//! let n = log_sink::log_count();
//! ```
//!
//! The buffer holds up to [`LOG_BUFFER_CAPACITY`] entries. Once full it wraps
//! around and silently overwrites the oldest entries.

use log::{Level, LevelFilter, Log, Metadata, Record};
use spin::Mutex;

/// Maximum number of log entries the circular buffer can hold.
const LOG_BUFFER_CAPACITY: usize = 256;

/// Maximum length (in bytes) of a log message stored in a [`LogEntry`].
const LOG_MESSAGE_MAX_LEN: usize = 128;

/// Maximum length (in bytes) of the target tag in a [`LogEntry`].
const LOG_TARGET_MAX_LEN: usize = 16;

/// A single structured log entry, stored without heap allocation so the
/// buffer can be a plain static.
#[derive(Clone, Copy)]
pub struct LogEntry {
    /// Milliseconds since boot.
    pub timestamp_ms: u64,
    pub level: Level,
    target_buf: [u8; LOG_TARGET_MAX_LEN],
    target_len: u8,
    message_buf: [u8; LOG_MESSAGE_MAX_LEN],
    message_len: u8,
}

impl LogEntry {
    const fn empty() -> Self {
        Self {
            timestamp_ms: 0,
            level: Level::Trace,
            target_buf: [0u8; LOG_TARGET_MAX_LEN],
            target_len: 0,
            message_buf: [0u8; LOG_MESSAGE_MAX_LEN],
            message_len: 0,
        }
    }

    pub fn target(&self) -> &str {
        let len = self.target_len as usize;
        core::str::from_utf8(&self.target_buf[..len]).unwrap_or("")
    }

    pub fn message(&self) -> &str {
        let len = self.message_len as usize;
        core::str::from_utf8(&self.message_buf[..len]).unwrap_or("")
    }
}

struct LogBuffer {
    entries: [LogEntry; LOG_BUFFER_CAPACITY],
    head: usize,
    count: usize,
}

impl LogBuffer {
    const fn new() -> Self {
        const EMPTY: LogEntry = LogEntry::empty();
        Self {
            entries: [EMPTY; LOG_BUFFER_CAPACITY],
            head: 0,
            count: 0,
        }
    }

    fn push(&mut self, entry: LogEntry) {
        self.entries[self.head] = entry;
        self.head = (self.head + 1) % LOG_BUFFER_CAPACITY;
        if self.count < LOG_BUFFER_CAPACITY {
            self.count += 1;
        }
    }

    fn tail(&self) -> usize {
        if self.count < LOG_BUFFER_CAPACITY {
            0
        } else {
            self.head
        }
    }

    fn get(&self, i: usize) -> Option<&LogEntry> {
        if i >= self.count {
            return None;
        }
        Some(&self.entries[(self.tail() + i) % LOG_BUFFER_CAPACITY])
    }

    fn clear(&mut self) {
        self.head = 0;
        self.count = 0;
    }
}

/// The crate's `log::Log` backend: a fixed-size structured buffer plus a
/// live echo to [`crate::serial`].
pub struct KernelLogger {
    buffer: Mutex<LogBuffer>,
}

impl KernelLogger {
    const fn new() -> Self {
        Self { buffer: Mutex::new(LogBuffer::new()) }
    }
}

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let timestamp_ms = crate::arch::timer::uptime_ms();

        let target = record.target();
        let mut target_buf = [0u8; LOG_TARGET_MAX_LEN];
        let target_len = target.len().min(LOG_TARGET_MAX_LEN);
        target_buf[..target_len].copy_from_slice(&target.as_bytes()[..target_len]);

        let mut message_buf = [0u8; LOG_MESSAGE_MAX_LEN];
        // `record.args()` is an opaque `fmt::Arguments`; the only way to get
        // its bytes without heap allocation is to format into a fixed-size
        // writer and take whatever fit.
        struct FixedWriter<'a> {
            buf: &'a mut [u8],
            len: usize,
        }
        impl core::fmt::Write for FixedWriter<'_> {
            fn write_str(&mut self, s: &str) -> core::fmt::Result {
                let remaining = self.buf.len() - self.len;
                let n = s.len().min(remaining);
                self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
                self.len += n;
                Ok(())
            }
        }
        let mut writer = FixedWriter { buf: &mut message_buf, len: 0 };
        let _ = core::fmt::write(&mut writer, *record.args());
        let message_len = writer.len;

        crate::serial::_print(format_args!(
            "[{:>8}ms] {:<5} {}: {}\n",
            timestamp_ms,
            record.level(),
            target,
            record.args()
        ));

        self.buffer.lock().push(LogEntry {
            timestamp_ms,
            level: record.level(),
            target_buf,
            target_len: target_len as u8,
            message_buf,
            message_len: message_len as u8,
        });
    }

    fn flush(&self) {}
}

static KERNEL_LOGGER: KernelLogger = KernelLogger::new();

/// Install [`KERNEL_LOGGER`] as the global `log` backend at `level`. Must be
/// called exactly once, before any other subsystem's `init()` logs anything.
pub fn init(level: LevelFilter) {
    log::set_logger(&KERNEL_LOGGER).expect("log_sink::init called twice");
    log::set_max_level(level);
}

/// Iterate over all buffered log entries from oldest to newest.
pub fn log_drain<F: FnMut(&LogEntry)>(mut f: F) -> usize {
    let buffer = KERNEL_LOGGER.buffer.lock();
    for i in 0..buffer.count {
        if let Some(entry) = buffer.get(i) {
            f(entry);
        }
    }
    buffer.count
}

/// Number of entries currently in the log buffer.
pub fn log_count() -> usize {
    KERNEL_LOGGER.buffer.lock().count
}

/// Clear all log entries.
pub fn log_clear() {
    KERNEL_LOGGER.buffer.lock().clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_wraps_after_capacity() {
        let mut buf = LogBuffer::new();
        for i in 0..LOG_BUFFER_CAPACITY + 10 {
            let mut entry = LogEntry::empty();
            entry.timestamp_ms = i as u64;
            buf.push(entry);
        }
        assert_eq!(buf.count, LOG_BUFFER_CAPACITY);
        // Oldest surviving entry is #10, since 10 wrapped past capacity.
        assert_eq!(buf.get(0).unwrap().timestamp_ms, 10);
    }

    #[test]
    fn clear_resets_count() {
        let mut buf = LogBuffer::new();
        buf.push(LogEntry::empty());
        buf.clear();
        assert_eq!(buf.count, 0);
        assert!(buf.get(0).is_none());
    }
}
