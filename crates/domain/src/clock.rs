use chrono::{DateTime, Local, Utc};
use parking_lot::Mutex;
use std::sync::Arc;

/// Wall-clock time source, injected so persistence and scheduling code can
/// be driven by a fixed clock in tests (see [`FixedClock`]).
///
/// `now_iso8601` is the stable local-offset `YYYY-MM-DDThh:mm:ss.SSS±HH:MM`
/// form the spec requires for everything written to disk.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn now_iso8601(&self) -> String {
        self.now()
            .with_timezone(&Local)
            .format("%Y-%m-%dT%H:%M:%S%.3f%:z")
            .to_string()
    }
}

/// The real clock, backed by `Utc::now()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock fixed to an explicit instant, for deterministic tests. Call
/// [`FixedClock::advance`] to move it forward between assertions.
#[derive(Debug, Clone)]
pub struct FixedClock {
    at: Arc<Mutex<DateTime<Utc>>>,
}

impl FixedClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            at: Arc::new(Mutex::new(at)),
        }
    }

    pub fn advance(&self, delta: chrono::Duration) {
        let mut at = self.at.lock();
        *at += delta;
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.at.lock() = at;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.at.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iso8601_has_local_offset_and_millis() {
        let clock = FixedClock::new(Utc::now());
        let s = clock.now_iso8601();
        assert!(s.contains('T'));
        assert!(s.contains('.'));
        assert!(s.contains('+') || s.matches('-').count() >= 3);
    }

    #[test]
    fn advance_moves_time_forward() {
        let start = Utc::now();
        let clock = FixedClock::new(start);
        clock.advance(chrono::Duration::seconds(5));
        assert_eq!(clock.now(), start + chrono::Duration::seconds(5));
    }
}
