use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

/// Millisecond clock shared by the interception path and the releaser.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// CLOCK_MONOTONIC, immune to wall-clock steps.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now_ms(&self) -> i64 {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: ts is a valid, writable timespec.
        unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        ts.tv_sec as i64 * 1000 + ts.tv_nsec as i64 / 1_000_000
    }
}

/// Settable clock for simulated runs. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock(Arc<AtomicI64>);

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self(Arc::new(AtomicI64::new(start_ms)))
    }

    pub fn set(&self, ms: i64) {
        self.0.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: i64) {
        self.0.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

pub fn calibrate(recorded_time: i64, local_time: i64) -> i64 {
    recorded_time.saturating_sub(local_time)
}

/// Trace time on the signed millisecond scale; out-of-range times saturate.
pub fn trace_ms(release_time: u64) -> i64 {
    i64::try_from(release_time).unwrap_or(i64::MAX)
}

/// Offset between trace time and local time, fixed once per activation
/// window. Written by the interception path, read by the releaser.
#[derive(Debug, Default)]
pub struct ClockCalibrator {
    offset: AtomicI64,
    calibrated: AtomicBool,
}

impl ClockCalibrator {
    /// Stores the offset only if this window has not been calibrated yet.
    /// Returns the offset in effect.
    pub fn calibrate_once(&self, recorded_time: i64, local_time: i64) -> i64 {
        if !self.calibrated.load(Ordering::Acquire) {
            self.offset
                .store(calibrate(recorded_time, local_time), Ordering::Release);
            self.calibrated.store(true, Ordering::Release);
        }
        self.offset.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.calibrated.store(false, Ordering::Release);
    }

    pub fn is_calibrated(&self) -> bool {
        self.calibrated.load(Ordering::Acquire)
    }

    pub fn offset(&self) -> i64 {
        self.offset.load(Ordering::Acquire)
    }

    /// Local-clock deadline for a record released at `release_time`.
    pub fn deadline(&self, release_time: u64) -> i64 {
        trace_ms(release_time).saturating_sub(self.offset())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_is_fixed_after_first_calibration() {
        let cal = ClockCalibrator::default();
        let clock = ManualClock::new(5_000);

        assert_eq!(cal.calibrate_once(100, clock.now_ms()), -4_900);
        clock.advance(37);
        assert_eq!(cal.calibrate_once(150, clock.now_ms()), -4_900);
        assert_eq!(cal.deadline(150), 5_050);

        cal.reset();
        assert!(!cal.is_calibrated());
        assert_eq!(cal.calibrate_once(150, clock.now_ms()), 150 - 5_037);
    }

    #[test]
    fn out_of_range_times_saturate() {
        assert_eq!(calibrate(i64::MAX, -5), i64::MAX);
        assert_eq!(calibrate(i64::MIN, 5), i64::MIN);
        assert_eq!(trace_ms(u64::MAX), i64::MAX);

        let cal = ClockCalibrator::default();
        cal.calibrate_once(-10, 0);
        assert_eq!(cal.deadline(u64::MAX), i64::MAX);
    }

    #[test]
    fn monotonic_clock_does_not_go_backwards() {
        let c = MonotonicClock;
        let a = c.now_ms();
        let b = c.now_ms();
        assert!(b >= a);
    }
}
