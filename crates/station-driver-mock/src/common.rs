//! State shared by the mock drivers.

use parking_lot::Mutex;
use station_core::error::{StationError, StationResult};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::Instant;

/// Simulated connection state.
///
/// Clones share state, so parameter callbacks can refuse I/O once the
/// instrument has been closed.
#[derive(Debug, Clone, Default)]
pub struct ConnectionState {
    closed: Arc<AtomicBool>,
    closes: Arc<AtomicUsize>,
}

impl ConnectionState {
    /// Mark the connection closed.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.closes.fetch_add(1, Ordering::SeqCst);
    }

    /// True after [`ConnectionState::close`].
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// How many times close was called.
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Fail with a hardware error when the connection is closed.
    pub fn ensure_open(&self, parameter: &str) -> StationResult<()> {
        if self.is_closed() {
            Err(StationError::Hardware {
                parameter: parameter.to_string(),
                message: "instrument connection is closed".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

/// One value written to simulated hardware.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    /// Parameter path written
    pub parameter: String,
    /// Raw value sent to the device
    pub value: f64,
    /// When the write reached the device
    pub at: Instant,
}

/// Append-only record of hardware writes, for asserting ramp and delay
/// behaviour in tests.
#[derive(Debug, Clone, Default)]
pub struct WriteLog {
    entries: Arc<Mutex<Vec<WriteRecord>>>,
}

impl WriteLog {
    /// Record a write.
    pub fn record(&self, parameter: &str, value: f64) {
        self.entries.lock().push(WriteRecord {
            parameter: parameter.to_string(),
            value,
            at: Instant::now(),
        });
    }

    /// All writes so far.
    pub fn entries(&self) -> Vec<WriteRecord> {
        self.entries.lock().clone()
    }

    /// Values written to one parameter, in order.
    pub fn values_for(&self, parameter: &str) -> Vec<f64> {
        self.entries
            .lock()
            .iter()
            .filter(|r| r.parameter == parameter)
            .map(|r| r.value)
            .collect()
    }

    /// Forget all recorded writes.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
