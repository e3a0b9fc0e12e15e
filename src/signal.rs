//! Delivery and handling of the asynchronous yield signal.
use crate::scheduler::Scheduler;
use crate::thread::{GuestThread, ThreadRef};
use libc::{c_int, c_void, siginfo_t, SIGURG};
use std::cell::Cell;
use std::mem::{zeroed, ManuallyDrop};
use std::process::abort;
use std::ptr::null_mut;
use std::sync::Arc;

/// The signal used to preempt or rotate a running guest thread.
///
/// We use SIGURG as it's not commonly (if ever) used, isn't handled
/// explicitly by debuggers, and is ignored by default instead of terminating
/// the program, so a delivery that races with a thread that hasn't installed
/// the handler yet is harmless.
pub const YIELD_SIGNAL: c_int = SIGURG;

thread_local! {
    /// The scheduler and guest thread bound to the calling host thread.
    ///
    /// Stored as raw pointers so the signal handler can read them without
    /// synchronisation. The binding owns a reference to the guest thread;
    /// the scheduler must outlive the binding.
    static CURRENT: Cell<Option<(*const Scheduler, *const GuestThread)>> =
        const { Cell::new(None) };

    /// Set when a yield arrived at a point where it couldn't be acted upon,
    /// so the thread yields at its next safe point instead.
    static YIELD_PENDING: Cell<bool> = const { Cell::new(false) };
}

/// Binds the calling host thread to a guest thread, allowing the yield
/// handler to rotate it.
///
/// The emulator's execution loop calls this before running guest code, and
/// `unbind()` once the thread leaves guest execution for good.
pub fn bind(scheduler: &Scheduler, thread: &ThreadRef) {
    unbind();
    CURRENT.set(Some((
        scheduler as *const _,
        Arc::into_raw(thread.clone()),
    )));
}

/// Releases the calling host thread's guest binding, if any.
pub fn unbind() {
    if let Some((_, thread)) = CURRENT.replace(None) {
        unsafe { drop(Arc::from_raw(thread)) };
    }
}

/// Returns true if the given thread is the one bound to the calling host
/// thread.
pub(crate) fn current_is(thread: &GuestThread) -> bool {
    CURRENT
        .get()
        .is_some_and(|(_, current)| std::ptr::eq(current, thread))
}

/// Returns true if a yield is due at the next safe point.
pub fn yield_pending() -> bool {
    YIELD_PENDING.get()
}

pub(crate) fn set_yield_pending(pending: bool) {
    YIELD_PENDING.set(pending);
}

/// Installs the process-wide handler for the yield signal.
pub fn install_yield_handler() {
    unsafe {
        let mut action: libc::sigaction = zeroed();

        action.sa_sigaction = handle_yield as usize;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(YIELD_SIGNAL, &action, null_mut());
    }
}

/// The handler for the yield signal.
///
/// With a guest thread bound, the interrupted thread is rotated out of its
/// core's head spot and then waits until it's entitled to run again, so the
/// signal effectively suspends it in place while the next thread takes over.
/// Without a bound thread all we can do is remember that a yield is due.
///
/// Must only be reachable while the interrupted thread holds no scheduler
/// lock; embedders keep the signal masked outside guest execution.
extern "C" fn handle_yield(
    _signal: c_int,
    _info: *mut siginfo_t,
    _context: *mut c_void,
) {
    if let Some((scheduler, thread)) = CURRENT.get() {
        let scheduler = unsafe { &*scheduler };
        // Borrow the binding's reference without touching the count, as the
        // handler must not drop (or leak) anything.
        let thread = unsafe { ManuallyDrop::new(Arc::from_raw(thread)) };

        if scheduler.rotate(&thread, false).is_err() {
            // The queues are corrupted and there's no way to report that
            // from a signal handler.
            abort();
        }

        YIELD_PENDING.set(false);
        scheduler.wait_schedule(&thread, false);
    } else {
        YIELD_PENDING.set(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::new_thread;
    use crate::Config;

    #[test]
    fn test_bind_and_unbind() {
        let scheduler = Scheduler::new(&Config::new());
        let thread = new_thread(1, 40, 0);

        assert!(!current_is(&thread));

        bind(&scheduler, &thread);
        assert!(current_is(&thread));

        unbind();
        assert!(!current_is(&thread));
    }

    #[test]
    fn test_yield_pending() {
        set_yield_pending(true);
        assert!(yield_pending());

        set_yield_pending(false);
        assert!(!yield_pending());
    }

    #[test]
    fn test_handler_without_binding_defers() {
        install_yield_handler();
        set_yield_pending(false);

        unsafe {
            libc::pthread_kill(libc::pthread_self(), YIELD_SIGNAL);
        }

        assert!(yield_pending());
        set_yield_pending(false);
    }
}
