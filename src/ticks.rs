//! Monotonic time for timeslice accounting.
use rustix::time::{clock_gettime, ClockId};

/// Returns the current monotonic time in ticks (nanoseconds).
///
/// All timeslice accounting (EWMA samples, wait projections) is performed in
/// these units. A `timeslice_start` of zero is reserved to mean "never been
/// scheduled", which in practice can't collide with a real reading.
pub fn ticks() -> u64 {
    let time = clock_gettime(ClockId::Monotonic);

    (time.tv_sec as u64).wrapping_mul(1_000_000_000).wrapping_add(time.tv_nsec as u64)
}
