//! Bitmask-filtered structured logging.
//!
//! The facility bitmask gates whether a call site does any work at all: a
//! `bitflags!` type for a small closed set of facilities, reused as both a
//! parsed config value and an in-memory filter.

use std::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Facility: u32 {
        const AUTH  = 0b0000_0001;
        const USER  = 0b0000_0010;
        const ERR   = 0b0000_0100;
        const CMD   = 0b0000_1000;
        const SIDE  = 0b0001_0000;
        const DEBUG = 0b0010_0000;
    }
}

impl std::str::FromStr for Facility {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_bits_truncate(s.parse::<u32>()?))
    }
}

static CONFIGURED_LEVEL: AtomicU32 = AtomicU32::new(Facility::ERR.bits());

/// Sets the process-wide configured log level, per `[logging] level` in the
/// server config.
pub fn set_level(level: Facility) {
    CONFIGURED_LEVEL.store(level.bits(), Ordering::Relaxed);
}

#[must_use]
pub fn configured_level() -> Facility {
    Facility::from_bits_truncate(CONFIGURED_LEVEL.load(Ordering::Relaxed))
}

/// Joins `parts` with single spaces and emits to the tracing sink iff
/// `facility & configured_level != 0`. Always returns `false`, so error
/// paths can write `return emit(Facility::ERR, &[...])`.
pub fn emit(facility: Facility, parts: &[&str]) -> bool {
    if (facility & configured_level()).is_empty() {
        return false;
    }

    let message = parts.join(" ");
    if facility.contains(Facility::ERR) {
        tracing::error!(facility = ?facility, "{message}");
    } else if facility.contains(Facility::DEBUG) {
        tracing::debug!(facility = ?facility, "{message}");
    } else {
        tracing::info!(facility = ?facility, "{message}");
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_suppresses_unconfigured_facilities() {
        set_level(Facility::ERR);
        assert!(!emit(Facility::DEBUG, &["should", "not", "appear"]));
        assert!(!emit(Facility::ERR, &["should", "appear"]));
    }

    #[test]
    fn facility_parses_from_bitmask_string() {
        let level: Facility = "9".parse().unwrap();
        assert_eq!(level, Facility::AUTH | Facility::CMD);
    }
}

/// The `[logging] destination = syslog` sink: a
/// `tracing_subscriber::fmt::MakeWriter` that forwards each formatted line to
/// the local syslog daemon via the `syslog` crate's `Logger`, which carries
/// its own framing/priority handling rather than this crate reimplementing
/// RFC 3164 itself.
pub mod syslog_writer {
    use std::io;
    use std::sync::{Arc, Mutex};

    use syslog::{Formatter3164, Logger, LoggerBackend};

    type SyslogLogger = Logger<LoggerBackend, Formatter3164>;

    /// Connects to the local syslog daemon over its Unix socket, tagging
    /// every message with `process` (the `[main] service` config value).
    pub fn connect(process: &str) -> Result<SyslogMakeWriter, crate::error::ArcError> {
        let formatter = Formatter3164 {
            facility: syslog::Facility::LOG_DAEMON,
            hostname: None,
            process: process.to_string(),
            pid: std::process::id() as i32,
        };
        let logger = syslog::unix(formatter)
            .map_err(|e| crate::error::ArcError::Internal(format!("connecting to syslog: {e}")))?;
        Ok(SyslogMakeWriter {
            logger: Arc::new(Mutex::new(logger)),
        })
    }

    /// Hands out a fresh [`SyslogLineWriter`] per `tracing-subscriber` flush,
    /// all sharing the one underlying syslog connection behind a mutex.
    #[derive(Clone)]
    pub struct SyslogMakeWriter {
        logger: Arc<Mutex<SyslogLogger>>,
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SyslogMakeWriter {
        type Writer = SyslogLineWriter;

        fn make_writer(&'a self) -> Self::Writer {
            SyslogLineWriter {
                logger: Arc::clone(&self.logger),
            }
        }
    }

    pub struct SyslogLineWriter {
        logger: Arc<Mutex<SyslogLogger>>,
    }

    impl io::Write for SyslogLineWriter {
        /// Every call `tracing-subscriber` makes here is already one
        /// complete formatted event line, so this forwards it as a single
        /// syslog record at `LOG_INFO` rather than re-splitting on
        /// newlines. Per-event severity (the `ERR` facility vs the rest) is
        /// carried in the formatted text itself, same as the `stderr`
        /// destination.
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let line = String::from_utf8_lossy(buf);
            let line = line.trim_end_matches('\n');
            if !line.is_empty() {
                let mut logger = self
                    .logger
                    .lock()
                    .map_err(|_| io::Error::new(io::ErrorKind::Other, "syslog logger poisoned"))?;
                logger
                    .info(line.to_string())
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}
