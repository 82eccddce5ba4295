//! Receipt Clock
//!
//! Sinks stamp each committed row with the time the batch was received.
//! Going through this trait keeps those stamps controllable in simulation:
//!
//! - `SystemClock`: wall-clock UTC
//! - `SimulatedClock`: virtual time that only moves when told to

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Source of receipt timestamps
pub trait ReceiptClock: Send + Sync + Clone + 'static {
    fn now(&self) -> DateTime<Utc>;

    /// Calendar day (UTC) used to group receipts
    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

/// Wall-clock time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl ReceiptClock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Virtual time for deterministic tests. Clones share the same time.
#[derive(Debug, Clone)]
pub struct SimulatedClock {
    millis: Arc<AtomicI64>,
}

impl Default for SimulatedClock {
    fn default() -> Self {
        Self::new(0)
    }
}

impl SimulatedClock {
    /// Start at `start_ms` milliseconds after the Unix epoch
    pub fn new(start_ms: i64) -> Self {
        SimulatedClock {
            millis: Arc::new(AtomicI64::new(start_ms)),
        }
    }

    /// Start at midnight UTC of the given day
    pub fn at_date(date: NaiveDate) -> Self {
        let start = date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc().timestamp_millis());
        Self::new(start.unwrap_or(0))
    }

    pub fn advance(&self, duration: Duration) {
        let ms = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        self.millis.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn advance_days(&self, days: i64) {
        self.millis.fetch_add(days * 86_400_000, Ordering::SeqCst);
    }

    pub fn current_ms(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}

impl ReceiptClock for SimulatedClock {
    fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.current_ms())
            .single()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulated_clock_does_not_move_on_its_own() {
        let clock = SimulatedClock::new(1_000);
        assert_eq!(clock.now(), clock.now());
        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.current_ms(), 1_250);
    }

    #[test]
    fn test_simulated_clock_clones_share_time() {
        let clock = SimulatedClock::default();
        let other = clock.clone();
        clock.advance_days(1);
        assert_eq!(other.today(), NaiveDate::from_ymd_opt(1970, 1, 2).unwrap());
    }

    #[test]
    fn test_at_date_starts_at_midnight() {
        let day = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        let clock = SimulatedClock::at_date(day);
        assert_eq!(clock.today(), day);
        clock.advance(Duration::from_secs(86_399));
        assert_eq!(clock.today(), day);
        clock.advance(Duration::from_secs(1));
        assert_eq!(clock.today(), day.succ_opt().unwrap());
    }

    #[test]
    fn test_system_clock_is_recent() {
        assert!(SystemClock.now().timestamp() > 1_600_000_000);
    }
}
