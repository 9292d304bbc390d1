//! Sink-agnostic logging facade. The kernel installs one global [`log::Log`]
//! implementation at init; every subsystem logs through `log::{error, warn,
//! info, debug, trace}` instead of writing to a device directly. The actual
//! output device (serial, VGA, framebuffer) is a boot-collaborator concern
//! and is injected as a [`core::fmt::Write`] sink.

use core::fmt::Write;

use log::{Level, LevelFilter, Log, Metadata, Record};
use spin::Mutex;

/// Fixed-size scratch buffer a single log call formats into before handing
/// the bytes to the sink, avoiding a heap allocation per log line.
const LINE_BUF_LEN: usize = 256;

static SINK: Mutex<Option<&'static mut dyn Write>> = Mutex::new(None);

struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let mut guard = SINK.lock();
        let Some(sink) = guard.as_mut() else {
            return;
        };
        let mut buf = LineBuffer::new();
        let _ = write!(buf, "[{:<5}] {}\n", record.level(), record.args());
        let _ = sink.write_str(buf.as_str());
    }

    fn flush(&self) {}
}

struct LineBuffer {
    data: [u8; LINE_BUF_LEN],
    len: usize,
}

impl LineBuffer {
    fn new() -> Self {
        Self {
            data: [0; LINE_BUF_LEN],
            len: 0,
        }
    }

    fn as_str(&self) -> &str {
        core::str::from_utf8(&self.data[..self.len]).unwrap_or("")
    }
}

impl Write for LineBuffer {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let bytes = s.as_bytes();
        let space = LINE_BUF_LEN - self.len;
        let n = bytes.len().min(space);
        self.data[self.len..self.len + n].copy_from_slice(&bytes[..n]);
        self.len += n;
        Ok(())
    }
}

/// Installs the global logger at the given maximum level. Safe to call
/// before a sink is installed: records are simply dropped until one is.
pub fn init(level: LevelFilter) {
    // `set_logger` fails only if called twice; the kernel calls this exactly
    // once during boot, so a repeat call is a programming error worth
    // observing rather than silently ignoring.
    log::set_logger(&LOGGER).expect("logger already installed");
    log::set_max_level(level);
}

/// Installs (or replaces) the sink log records are written to.
pub fn set_sink(sink: &'static mut dyn Write) {
    *SINK.lock() = Some(sink);
}

/// Removes the current sink, reverting to dropping log records.
pub fn clear_sink() {
    *SINK.lock() = None;
}

pub use log::Level as LogLevel;
