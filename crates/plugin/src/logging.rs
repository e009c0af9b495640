//! Log forwarding to the host
//!
//! A guest must not write to the host's stdout or stderr, so the only output
//! is the host's own logger callback. Until the host hands one over, lines
//! are dropped.

use std::ffi::{c_int, c_void, CString};
use std::io;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Once;

use tracing::{Level, Metadata};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use gcap_sdk::symbols::log_level;
use gcap_sdk::LogFn;

/// Environment variable overriding the configured filter
pub const LOG_ENV: &str = "GCAP_LOG";

static HOST_LOGGER: AtomicPtr<c_void> = AtomicPtr::new(std::ptr::null_mut());
static INIT: Once = Once::new();

/// Install or clear the host logger callback
pub fn set_host_logger(logger: Option<LogFn>) {
    let ptr = logger.map_or(std::ptr::null_mut(), |f| f as *mut c_void);
    HOST_LOGGER.store(ptr, Ordering::Release);
}

fn host_logger() -> Option<LogFn> {
    let ptr = HOST_LOGGER.load(Ordering::Acquire);
    if ptr.is_null() {
        None
    } else {
        // SAFETY: only ever stored from a LogFn in set_host_logger
        Some(unsafe { std::mem::transmute::<*mut c_void, LogFn>(ptr) })
    }
}

/// Host log level of a tracing level
pub fn level_code(level: &Level) -> c_int {
    match *level {
        Level::ERROR => log_level::ERROR,
        Level::WARN => log_level::WARN,
        Level::INFO => log_level::INFO,
        Level::DEBUG => log_level::DEBUG,
        Level::TRACE => log_level::TRACE,
    }
}

/// Buffers one formatted event and hands it to the host on drop
pub struct HostLine {
    level: c_int,
    buf: Vec<u8>,
}

impl io::Write for HostLine {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for HostLine {
    fn drop(&mut self) {
        let Some(logger) = host_logger() else {
            return;
        };

        while self.buf.last().is_some_and(|b| *b == b'\n' || *b == b'\r') {
            self.buf.pop();
        }
        self.buf.retain(|b| *b != 0);
        if self.buf.is_empty() {
            return;
        }

        if let Ok(line) = CString::new(std::mem::take(&mut self.buf)) {
            unsafe { logger(self.level, line.as_ptr()) };
        }
    }
}

/// `MakeWriter` producing one [`HostLine`] per event
#[derive(Debug, Default, Clone, Copy)]
pub struct HostWriter;

impl<'a> MakeWriter<'a> for HostWriter {
    type Writer = HostLine;

    fn make_writer(&'a self) -> Self::Writer {
        HostLine {
            level: log_level::INFO,
            buf: Vec::new(),
        }
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        HostLine {
            level: level_code(meta.level()),
            buf: Vec::new(),
        }
    }
}

/// Install the subscriber once per process
///
/// `GCAP_LOG` wins over `default_filter` when set.
pub fn init(default_filter: &str) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env(LOG_ENV)
            .or_else(|_| EnvFilter::try_new(default_filter))
            .unwrap_or_else(|_| EnvFilter::new("info"));

        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(HostWriter)
                    .with_ansi(false)
                    .without_time()
                    .with_target(false),
            )
            .try_init();
    });
}
