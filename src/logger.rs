//! Injected logging capability
//!
//! The engine never logs through global state. A [`Logger`] is passed to the
//! connection constructors; the default discards everything, and
//! [`Logger::forward`] routes to the `tracing` facade.

use std::fmt;
use std::sync::Arc;

/// Receives log lines from the protocol engine.
///
/// A pure side channel with no effect on protocol behavior.
pub trait LogSink: Send + Sync {
    fn debug(&self, message: &str);
    fn info(&self, message: &str);
    fn warn(&self, message: &str);
    fn error(&self, message: &str);
}

/// Clonable logging capability handle.
#[derive(Clone)]
pub struct Logger(Arc<dyn LogSink>);

impl Logger {
    /// Wrap a custom sink.
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Logger(sink)
    }

    /// Discard all log lines. The default, and what tests use.
    pub fn discard() -> Self {
        Logger(Arc::new(Discard))
    }

    /// Forward log lines to the `tracing` facade.
    pub fn forward() -> Self {
        Logger(Arc::new(Forward))
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        self.0
            .debug(message.as_ref());
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.0
            .info(message.as_ref());
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        self.0
            .warn(message.as_ref());
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.0
            .error(message.as_ref());
    }
}

impl Default for Logger {
    fn default() -> Self {
        Logger::discard()
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Logger")
    }
}

struct Discard;

impl LogSink for Discard {
    fn debug(&self, _: &str) {}
    fn info(&self, _: &str) {}
    fn warn(&self, _: &str) {}
    fn error(&self, _: &str) {}
}

struct Forward;

impl LogSink for Forward {
    fn debug(&self, message: &str) {
        tracing::debug!("{message}");
    }
    fn info(&self, message: &str) {
        tracing::info!("{message}");
    }
    fn warn(&self, message: &str) {
        tracing::warn!("{message}");
    }
    fn error(&self, message: &str) {
        tracing::error!("{message}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Capture(Mutex<Vec<String>>);

    impl LogSink for Capture {
        fn debug(&self, message: &str) {
            self.0
                .lock()
                .unwrap()
                .push(format!("debug:{message}"));
        }
        fn info(&self, message: &str) {
            self.0
                .lock()
                .unwrap()
                .push(format!("info:{message}"));
        }
        fn warn(&self, message: &str) {
            self.0
                .lock()
                .unwrap()
                .push(format!("warn:{message}"));
        }
        fn error(&self, message: &str) {
            self.0
                .lock()
                .unwrap()
                .push(format!("error:{message}"));
        }
    }

    #[test]
    fn test_custom_sink_receives_all_levels() {
        let capture = Arc::new(Capture(Mutex::new(Vec::new())));
        let logger = Logger::new(capture.clone());

        logger.debug("a");
        logger.info("b");
        logger.warn("c");
        logger.error("d");

        let lines = capture
            .0
            .lock()
            .unwrap();
        assert_eq!(
            *lines,
            vec!["debug:a", "info:b", "warn:c", "error:d"]
        );
    }

    #[test]
    fn test_discard_is_silent() {
        // Just exercises the no-op paths.
        let logger = Logger::default();
        logger.debug("ignored");
        logger.error("ignored");
    }
}
