use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const DEFAULT_LOG_INTERVAL: Duration = Duration::from_secs(1);

struct Window {
    last_emit: Instant,
    suppressed: u64,
}

/// Rate-limits repetitive log lines per key.
///
/// The first occurrence of a key is logged immediately. Repeats inside the
/// interval are counted and reported on the next line that gets through.
pub struct ThrottledLog {
    interval: Duration,
    windows: Mutex<HashMap<String, Window>>,
}

impl ThrottledLog {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `Some(suppressed)` when a line for `key` may be emitted now.
    pub fn admit(&self, key: &str) -> Option<u64> {
        self.admit_at(key, Instant::now())
    }

    fn admit_at(&self, key: &str, now: Instant) -> Option<u64> {
        let Ok(mut windows) = self.windows.lock() else {
            return Some(0);
        };
        match windows.get_mut(key) {
            Some(window) if now.duration_since(window.last_emit) < self.interval => {
                window.suppressed += 1;
                None
            }
            Some(window) => {
                let suppressed = window.suppressed;
                window.last_emit = now;
                window.suppressed = 0;
                Some(suppressed)
            }
            None => {
                windows.insert(
                    key.to_string(),
                    Window {
                        last_emit: now,
                        suppressed: 0,
                    },
                );
                Some(0)
            }
        }
    }

    pub fn warn(&self, key: &str, message: impl FnOnce() -> String) {
        if let Some(suppressed) = self.admit(key) {
            if suppressed > 0 {
                log::warn!("{} ({} similar messages suppressed)", message(), suppressed);
            } else {
                log::warn!("{}", message());
            }
        }
    }

    pub fn info(&self, key: &str, message: impl FnOnce() -> String) {
        if let Some(suppressed) = self.admit(key) {
            if suppressed > 0 {
                log::info!("{} ({} similar messages suppressed)", message(), suppressed);
            } else {
                log::info!("{}", message());
            }
        }
    }
}

impl Default for ThrottledLog {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_INTERVAL)
    }
}
