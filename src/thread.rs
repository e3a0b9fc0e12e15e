//! Guest thread handles as consumed by the scheduler.
use crate::config::MAX_CORES;
use crate::signal::YIELD_SIGNAL;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicI8, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// A shared handle to a guest thread.
pub type ThreadRef = Arc<GuestThread>;

/// The set of virtual cores a thread may be scheduled on.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct AffinityMask {
    bits: u64,
}

impl AffinityMask {
    /// Returns a mask admitting cores `0` up to (excluding) `cores`.
    pub fn all(cores: u8) -> AffinityMask {
        if cores >= MAX_CORES {
            AffinityMask { bits: u64::MAX }
        } else {
            AffinityMask { bits: (1 << cores) - 1 }
        }
    }

    /// Returns a mask admitting only the given core.
    pub fn only(core: u8) -> AffinityMask {
        AffinityMask { bits: 1 << core }
    }

    /// Returns this mask with the given core also admitted.
    pub fn with(self, core: u8) -> AffinityMask {
        AffinityMask { bits: self.bits | 1 << core }
    }

    pub fn test(&self, core: u8) -> bool {
        core < MAX_CORES && self.bits & 1 << core != 0
    }

    pub fn count(&self) -> u32 {
        self.bits.count_ones()
    }
}

#[cfg(target_os = "linux")]
mod timer {
    use crate::signal::YIELD_SIGNAL;
    use std::mem::zeroed;
    use std::ptr::null_mut;
    use std::time::Duration;

    /// A one-shot POSIX timer that raises the yield signal on the host
    /// thread it was created for.
    pub(super) struct PreemptionTimer {
        raw: libc::timer_t,
    }

    // The timer ID is a kernel handle; arming and deleting it from a thread
    // other than the one it signals is allowed.
    unsafe impl Send for PreemptionTimer {}
    unsafe impl Sync for PreemptionTimer {}

    impl PreemptionTimer {
        /// Creates a timer that signals the calling thread.
        pub(super) fn new() -> Option<PreemptionTimer> {
            let tid = rustix::thread::gettid().as_raw_nonzero().get();
            let mut event: libc::sigevent = unsafe { zeroed() };

            event.sigev_notify = libc::SIGEV_THREAD_ID;
            event.sigev_signo = YIELD_SIGNAL;
            event.sigev_notify_thread_id = tid;

            let mut raw: libc::timer_t = null_mut();
            let result = unsafe {
                libc::timer_create(libc::CLOCK_MONOTONIC, &mut event, &mut raw)
            };

            if result == 0 {
                Some(PreemptionTimer { raw })
            } else {
                None
            }
        }

        pub(super) fn arm(&self, timeslice: Duration) {
            self.set(libc::timespec {
                tv_sec: timeslice.as_secs() as libc::time_t,
                tv_nsec: timeslice.subsec_nanos() as _,
            });
        }

        pub(super) fn disarm(&self) {
            self.set(libc::timespec { tv_sec: 0, tv_nsec: 0 });
        }

        fn set(&self, value: libc::timespec) {
            let spec = libc::itimerspec {
                it_interval: libc::timespec { tv_sec: 0, tv_nsec: 0 },
                it_value: value,
            };

            unsafe {
                libc::timer_settime(self.raw, 0, &spec, null_mut());
            }
        }
    }

    impl Drop for PreemptionTimer {
        fn drop(&mut self) {
            unsafe {
                libc::timer_delete(self.raw);
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod timer {
    use std::time::Duration;

    /// Timer-driven preemption is only implemented for Linux at this time.
    pub(super) struct PreemptionTimer;

    impl PreemptionTimer {
        pub(super) fn new() -> Option<PreemptionTimer> {
            None
        }

        pub(super) fn arm(&self, _timeslice: Duration) {}

        pub(super) fn disarm(&self) {}
    }
}

use timer::PreemptionTimer;

/// Host-thread state needed to interrupt a guest thread asynchronously.
struct HostBinding {
    host: libc::pthread_t,
    timer: Option<PreemptionTimer>,
}

/// A guest thread as seen by the scheduler.
///
/// Each guest thread is backed one-to-one by a host OS thread; the scheduler
/// blocks and wakes those host threads so that at most one guest thread per
/// virtual core runs at any instant.
pub struct GuestThread {
    /// The thread's ID, used for diagnostics only.
    pub id: u64,

    /// The scheduling priority; a lower value means a higher priority. Read
    /// lock-free during load-balance projections, written by the
    /// priority-change path.
    pub priority: AtomicI8,

    /// The cores this thread may be scheduled on. Immutable while the thread
    /// is scheduled.
    pub affinity: AffinityMask,

    /// The core this thread currently belongs to, or `PARKED_CORE_ID` while
    /// it sits on the parked queue. Written only under `migration_lock`,
    /// except by a waker claiming its core for this thread while parked.
    pub core_id: AtomicU8,

    /// Serializes cross-core moves of this thread. Taken before any core
    /// mutex.
    pub migration_lock: Mutex<()>,

    /// Exponentially weighted moving average of this thread's timeslice
    /// durations, in ticks.
    pub average_timeslice: AtomicU64,

    /// The tick at which this thread last became the head of a core's
    /// queue, or zero if it never has.
    pub timeslice_start: AtomicU64,

    /// Whether the preemption timer is armed.
    pub preempted: AtomicBool,

    /// Set by a peer that repositioned this thread within its queue on its
    /// behalf; cleared by this thread in its next rotate.
    pub force_yield: AtomicBool,

    /// Signalled when this thread may have become the head of its queue.
    ///
    /// Only the owning host thread ever waits on this, with whichever mutex
    /// guards the queue the thread currently occupies. With a single waiter,
    /// re-associating the condition with a new mutex after a migration is
    /// sound.
    pub wake: Condvar,

    /// The backing host thread, set once by `bind_host()`.
    host: OnceLock<HostBinding>,
}

impl GuestThread {
    pub fn new(
        id: u64,
        priority: i8,
        affinity: AffinityMask,
        core_id: u8,
    ) -> ThreadRef {
        Arc::new(GuestThread {
            id,
            priority: AtomicI8::new(priority),
            affinity,
            core_id: AtomicU8::new(core_id),
            migration_lock: Mutex::new(()),
            average_timeslice: AtomicU64::new(0),
            timeslice_start: AtomicU64::new(0),
            preempted: AtomicBool::new(false),
            force_yield: AtomicBool::new(false),
            wake: Condvar::new(),
            host: OnceLock::new(),
        })
    }

    /// Binds this guest thread to the calling host thread.
    ///
    /// This records the signal destination and creates the preemption timer
    /// against the calling thread. Must be called on the host thread that
    /// runs the guest code, before the thread is first scheduled; without a
    /// binding, signal delivery and timer arming are no-ops.
    pub fn bind_host(&self) {
        let _ = self.host.set(HostBinding {
            host: unsafe { libc::pthread_self() },
            timer: PreemptionTimer::new(),
        });
    }

    /// Delivers the yield signal to the backing host thread.
    pub fn send_signal(&self) {
        if let Some(binding) = self.host.get() {
            unsafe {
                libc::pthread_kill(binding.host, YIELD_SIGNAL);
            }
        }
    }

    /// Arms the preemption timer for a single timeslice.
    pub(crate) fn arm_preemption(&self, timeslice: Duration) {
        if let Some(timer) = self.host.get().and_then(|b| b.timer.as_ref()) {
            timer.arm(timeslice);
        }

        self.preempted.store(true, Ordering::Release);
    }

    /// Disarms the preemption timer.
    pub(crate) fn disarm_preemption(&self) {
        if let Some(timer) = self.host.get().and_then(|b| b.timer.as_ref()) {
            timer.disarm();
        }

        self.preempted.store(false, Ordering::Release);
    }
}
