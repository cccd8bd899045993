//! Log capture.
//!
//! Every request's log output is returned to the caller in the response
//! `log` field, so each dispatch runs under its own subscriber that writes
//! into a [`LogBuffer`]. The binary additionally installs a global stderr
//! subscriber for startup messages.

use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::Dispatch;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter.
pub const LOG_ENV: &str = "CPI_LOG";

const DEFAULT_FILTER: &str = "info";

fn filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Shared in-memory log sink.
#[derive(Debug, Clone, Default)]
pub struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Captured output so far.
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.lock()).into_owned()
    }
}

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = LogBuffer;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Subscriber for one request: everything goes to `buffer`, and to stderr
/// when `echo_stderr` is set.
pub fn request_dispatch(buffer: &LogBuffer, echo_stderr: bool) -> Dispatch {
    let capture = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_target(false)
        .with_writer(buffer.clone());

    let stderr = echo_stderr.then(|| {
        tracing_subscriber::fmt::layer()
            .compact()
            .with_writer(io::stderr)
    });

    let subscriber = tracing_subscriber::registry()
        .with(filter())
        .with(capture)
        .with(stderr);

    Dispatch::new(subscriber)
}

/// Install the global stderr subscriber.
pub fn init(json: bool) {
    let (compact, json) = if json {
        (None, Some(tracing_subscriber::fmt::layer().json().with_writer(io::stderr)))
    } else {
        (Some(tracing_subscriber::fmt::layer().compact().with_writer(io::stderr)), None)
    };

    tracing_subscriber::registry()
        .with(filter())
        .with(compact)
        .with(json)
        .init();
}

#[cfg(test)]
mod tests {
    use tracing::instrument::WithSubscriber;

    use super::*;

    #[tokio::test]
    async fn test_request_logs_are_captured() {
        let buffer = LogBuffer::new();
        async {
            tracing::info!(vm_id = "i-1", "Creating VM");
        }
        .with_subscriber(request_dispatch(&buffer, false))
        .await;

        let log = buffer.contents();
        assert!(log.contains("Creating VM"));
        assert!(log.contains("i-1"));
    }

    #[tokio::test]
    async fn test_buffers_are_isolated() {
        let first = LogBuffer::new();
        let second = LogBuffer::new();

        async { tracing::info!("one") }
            .with_subscriber(request_dispatch(&first, false))
            .await;
        async { tracing::info!("two") }
            .with_subscriber(request_dispatch(&second, false))
            .await;

        assert!(first.contents().contains("one"));
        assert!(!first.contents().contains("two"));
        assert!(second.contents().contains("two"));
    }
}
