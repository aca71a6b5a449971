//! # Monotonic deadlines shared with the coordinator.
//!
//! The coordinator expresses deadlines as `(sec, nsec)` of the host's
//! `CLOCK_MONOTONIC`. Both processes run on the same host, so the value is
//! meaningful here; [`WireDeadline::to_instant`] maps it onto a local
//! [`tokio::time::Instant`] by measuring the remaining time once.
//!
//! ```text
//! coordinator: now_c ─────────────── deadline (sec, nsec)
//! this module:        now_m ── remaining ──► Instant::now() + remaining
//! ```

use std::time::Duration;

use tokio::time::Instant;

/// Absolute point on the host monotonic clock.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct WireDeadline {
    /// Whole seconds.
    pub sec: u64,
    /// Nanoseconds past `sec`.
    pub nsec: u64,
}

impl WireDeadline {
    pub fn new(sec: u64, nsec: u64) -> Self {
        Self { sec, nsec }
    }

    /// Deadline `after` from now.
    pub fn after(after: Duration) -> Self {
        Self::from_duration(monotonic_now().saturating_add(after))
    }

    /// Builds a deadline from an offset since the monotonic epoch.
    pub fn from_duration(d: Duration) -> Self {
        Self {
            sec: d.as_secs(),
            nsec: u64::from(d.subsec_nanos()),
        }
    }

    /// Offset since the monotonic epoch. Out-of-range nanoseconds carry into seconds.
    pub fn as_duration(&self) -> Duration {
        let carry = self.nsec / 1_000_000_000;
        let nanos = (self.nsec % 1_000_000_000) as u32;
        Duration::new(self.sec.saturating_add(carry), nanos)
    }

    /// Time left until the deadline; zero if it already passed.
    pub fn remaining(&self) -> Duration {
        self.as_duration().saturating_sub(monotonic_now())
    }

    /// Maps the deadline onto the local runtime clock.
    ///
    /// Deadlines too far out to represent saturate at [`deadline_after`]'s ceiling.
    pub fn to_instant(&self) -> Instant {
        deadline_after(self.remaining())
    }
}

/// Roughly 30 years; stands in for "never" when a deadline does not fit an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `Instant::now() + d`, saturating at a far-future instant instead of overflowing.
pub(crate) fn deadline_after(d: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(d.min(FAR_FUTURE))
        .or_else(|| now.checked_add(Duration::from_secs(86_400)))
        .unwrap_or(now)
}

/// Current value of the host monotonic clock.
#[cfg(unix)]
pub fn monotonic_now() -> Duration {
    // SAFETY: timespec is plain old data; all-zero is a valid value.
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    // SAFETY: `ts` is a valid, writable timespec and CLOCK_MONOTONIC is always supported.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if rc != 0 {
        return Duration::ZERO;
    }
    Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
}

/// Current value of the process-local monotonic clock.
#[cfg(not(unix))]
pub fn monotonic_now() -> Duration {
    use std::sync::OnceLock;
    static EPOCH: OnceLock<std::time::Instant> = OnceLock::new();
    EPOCH.get_or_init(std::time::Instant::now).elapsed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nanos_carry_into_seconds() {
        let d = WireDeadline::new(3, 2_500_000_000).as_duration();
        assert_eq!(d, Duration::new(5, 500_000_000));
    }

    #[test]
    fn past_deadline_has_no_time_left() {
        assert_eq!(WireDeadline::new(0, 0).remaining(), Duration::ZERO);
    }

    #[tokio::test]
    async fn unrepresentable_deadline_saturates() {
        let now = Instant::now();
        let at = WireDeadline::new(u64::MAX, u64::MAX).to_instant();
        assert!(at > now + Duration::from_secs(86_400 * 365));

        let capped = deadline_after(Duration::MAX);
        assert!(capped <= Instant::now() + FAR_FUTURE);
    }

    #[tokio::test]
    async fn future_deadline_maps_forward() {
        let wire = WireDeadline::after(Duration::from_secs(5));
        let left = wire.to_instant() - Instant::now();
        assert!(left > Duration::from_secs(4));
        assert!(left <= Duration::from_secs(5));
    }
}
