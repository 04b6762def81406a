use serde::{Deserialize, Serialize};

/// Unix timestamp in milliseconds
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn saturating_add_ms(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }

    pub fn saturating_sub_ms(self, ms: u64) -> Self {
        Self(self.0.saturating_sub(ms))
    }

    /// Whole milliseconds elapsed since `earlier`, zero if `earlier` is in the future.
    pub fn since(self, earlier: UnixTimeMs) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

/// Injectable time source. The engine never reads wall-clock time directly;
/// every timestamp and backoff decision goes through this trait so the state
/// machine is testable without timers.
pub trait Clock: Send + Sync {
    fn now(&self) -> UnixTimeMs;
}

/// Wall-clock implementation used by hosts.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> UnixTimeMs {
        UnixTimeMs(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }
}

/// Fixed, manually advanced clock for tests.
#[derive(Debug)]
pub struct FixedClock {
    now: std::sync::atomic::AtomicU64,
}

impl FixedClock {
    pub fn new(now: UnixTimeMs) -> Self {
        Self {
            now: std::sync::atomic::AtomicU64::new(now.0),
        }
    }

    pub fn advance_ms(&self, ms: u64) {
        self.now.fetch_add(ms, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn set(&self, now: UnixTimeMs) {
        self.now.store(now.0, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> UnixTimeMs {
        UnixTimeMs(self.now.load(std::sync::atomic::Ordering::SeqCst))
    }
}
