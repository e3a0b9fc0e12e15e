//! Scheduling of guest threads onto virtual cores.
pub(crate) mod queue;

use crate::config::{Config, PARKED_CORE_ID};
use crate::error::Error;
use crate::scheduler::queue::RunQueue;
use crate::signal;
use crate::thread::{GuestThread, ThreadRef};
use crate::ticks::ticks;
use log::debug;
use parking_lot::Mutex;
use std::cmp::min;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The scheduling state of one virtual core.
pub struct CoreContext {
    pub id: u8,

    /// The priority band at which a resident thread runs under a preemption
    /// timer rather than until it yields.
    pub preemption_priority: i8,

    /// The core's ready queue. The head is the thread entitled to execute
    /// on this core; every other resident is blocked on its wake condition.
    pub(crate) queue: Mutex<RunQueue>,
}

/// A fixed-priority preemptive scheduler for guest threads.
///
/// Guest threads are backed one-to-one by host OS threads. The scheduler
/// multiplexes them onto a fixed set of virtual cores so that at most one
/// guest thread per core is unblocked at any instant. Within a core, threads
/// run in strict priority order and FIFO within a priority band; across
/// cores, threads migrate based on projected wait times.
///
/// Lock order: a thread's migration lock before any core mutex, the parked
/// mutex before a core mutex, and never more than one core mutex at a time.
pub struct Scheduler {
    /// The virtual cores, indexed by core ID.
    cores: Vec<CoreContext>,

    /// Threads with no admissible core, ordered by priority.
    parked: Mutex<RunQueue>,

    /// The interval a thread in a core's preemption band may run before its
    /// preemption timer raises the yield signal.
    timeslice: Duration,
}

impl Scheduler {
    pub fn new(config: &Config) -> Scheduler {
        let cores = (0..config.cores)
            .map(|id| CoreContext {
                id,
                preemption_priority: config.preemption_priorities
                    [id as usize],
                queue: Mutex::new(RunQueue::new()),
            })
            .collect();

        Scheduler {
            cores,
            parked: Mutex::new(RunQueue::new()),
            timeslice: config.preemptive_timeslice,
        }
    }

    pub fn core_count(&self) -> u8 {
        self.cores.len() as u8
    }

    pub fn core(&self, id: u8) -> &CoreContext {
        &self.cores[id as usize]
    }

    /// Inserts a thread into the ready queue of its current core.
    ///
    /// The caller must not hold any core mutex, and the thread must not
    /// already be on a queue.
    pub fn insert_thread(&self, thread: &ThreadRef) {
        let core =
            &self.cores[thread.core_id.load(Ordering::Acquire) as usize];
        let mut queue = core.queue.lock();
        let priority = thread.priority.load(Ordering::Acquire);
        let target = queue.upper_bound(priority);

        if target == 0 {
            if !queue.is_empty() {
                // The new thread outranks the currently running head.
                if signal::current_is(thread) {
                    // The current thread is inserting itself, so we can
                    // yield the head on its behalf right now rather than
                    // serialize on a signal round-trip. This is only safe
                    // when the inserter is the thread entering the front.
                    if let Some(head) = queue.front() {
                        head.force_yield.store(true, Ordering::Release);
                    }

                    queue.rotate_front();
                    queue.push_front(thread.clone());
                } else {
                    // Slot in right behind the head; it's scheduled the
                    // moment the head yields on receiving the signal.
                    queue.insert(1, thread.clone());
                }

                if let Some(head) = queue.front() {
                    if signal::current_is(head) {
                        signal::set_yield_pending(true);
                    } else {
                        head.send_signal();
                    }
                }
            } else {
                queue.push_front(thread.clone());
            }

            if !signal::current_is(thread) {
                thread.wake.notify_one();
            }
        } else {
            queue.insert(target, thread.clone());
        }
    }

    /// Yields the calling thread's spot at the head of its core's queue,
    /// round-robining it to the tail of its own priority band.
    ///
    /// `cooperative` is false when the rotate was forced by the yield
    /// signal. A thread that was already repositioned by a peer on its
    /// behalf (`force_yield`) only settles its accounting here.
    pub fn rotate(
        &self,
        thread: &GuestThread,
        cooperative: bool,
    ) -> Result<(), Error> {
        let core =
            &self.cores[thread.core_id.load(Ordering::Acquire) as usize];
        let mut queue = core.queue.lock();

        let result = if queue.is_front(thread) {
            Self::update_average(thread);
            queue.rotate_front();

            if let Some(head) = queue.front() {
                if !std::ptr::eq(Arc::as_ptr(head), thread) {
                    head.wake.notify_one();
                }
            }

            self.settle_preemption(thread, cooperative);
            Ok(())
        } else if thread.force_yield.load(Ordering::Acquire) {
            // A peer moved us out of the head spot on our behalf; we must
            // still be somewhere within our own priority band.
            let (lower, upper) =
                queue.equal_range(thread.priority.load(Ordering::Acquire));
            let found = (lower..upper).any(|index| {
                queue.get(index).is_some_and(|queued| {
                    std::ptr::eq(Arc::as_ptr(queued), thread)
                })
            });

            if found {
                Self::update_average(thread);
                self.settle_preemption(thread, cooperative);
                Ok(())
            } else {
                Err(Error::InvalidSchedulerState {
                    thread: thread.id,
                    core: core.id,
                })
            }
        } else {
            Err(Error::InvalidSchedulerState {
                thread: thread.id,
                core: core.id,
            })
        };

        thread.force_yield.store(false, Ordering::Release);
        result
    }

    /// Blocks the calling thread until it's the head of its core's queue,
    /// then starts its timeslice.
    ///
    /// With `load_balance` set and more than one admissible core, the wait
    /// is chunked: a thread left unscheduled past twice the preemptive
    /// timeslice goes looking for a better core, with the threshold
    /// doubling on every attempt so it doesn't thrash between cores.
    pub fn wait_schedule(&self, thread: &ThreadRef, load_balance: bool) {
        let mut core =
            &self.cores[thread.core_id.load(Ordering::Acquire) as usize];
        let mut queue = core.queue.lock();

        if load_balance && thread.affinity.count() > 1 {
            let mut threshold = self.timeslice * 2;

            while !queue.is_front(thread) {
                let deadline = Instant::now() + threshold;
                let mut timed_out = false;

                while !queue.is_front(thread) && !timed_out {
                    timed_out = thread
                        .wake
                        .wait_until(&mut queue, deadline)
                        .timed_out();
                }

                if queue.is_front(thread) {
                    break;
                }

                drop(queue);

                // Can't fail: the waiting thread is the caller.
                let _ = self.load_balance_inner(thread, false, true);

                core = &self.cores
                    [thread.core_id.load(Ordering::Acquire) as usize];
                queue = core.queue.lock();
                threshold *= 2;
            }
        } else {
            while !queue.is_front(thread) {
                thread.wake.wait(&mut queue);
            }
        }

        self.begin_timeslice(core, thread);
    }

    /// As `wait_schedule` without load balancing, but bounded: returns
    /// whether the thread became the head within the timeout. On a timeout
    /// the thread stays queued; removing it is the caller's business.
    pub fn timed_wait_schedule(
        &self,
        thread: &GuestThread,
        timeout: Duration,
    ) -> bool {
        let core =
            &self.cores[thread.core_id.load(Ordering::Acquire) as usize];
        let mut queue = core.queue.lock();
        let deadline = Instant::now() + timeout;

        while !queue.is_front(thread) {
            if thread.wake.wait_until(&mut queue, deadline).timed_out() {
                if queue.is_front(thread) {
                    break;
                }

                return false;
            }
        }

        self.begin_timeslice(core, thread);
        true
    }

    /// Repositions a thread within its core's queue after its priority
    /// changed.
    pub fn update_priority(&self, thread: &ThreadRef) {
        let _migration = thread.migration_lock.lock();
        let core =
            &self.cores[thread.core_id.load(Ordering::Acquire) as usize];
        let mut queue = core.queue.lock();

        let Some(current) = queue.position_of(thread) else {
            // Not queued; the next insertion picks up the new priority.
            return;
        };
        let priority = thread.priority.load(Ordering::Acquire);

        if current == 0 {
            // The running head: make it yield if it's now outranked by the
            // thread behind it, or arm its timer if the new priority is the
            // core's preemption band.
            if queue.get(1).is_some_and(|next| {
                next.priority.load(Ordering::Acquire) < priority
            }) {
                thread.send_signal();
            } else if !thread.preempted.load(Ordering::Acquire)
                && priority == core.preemption_priority
            {
                thread.arm_preemption(self.timeslice);
            }

            return;
        }

        if queue.upper_bound(priority) == current {
            return;
        }

        queue.remove(thread);

        if thread.preempted.load(Ordering::Acquire)
            && priority != core.preemption_priority
        {
            thread.disarm_preemption();
        }

        let target = queue.upper_bound(priority);

        if target == 0 && !queue.is_empty() {
            // Dethroning the running head is deferred until it yields on
            // receiving the signal.
            queue.insert(1, thread.clone());

            if let Some(head) = queue.front() {
                head.send_signal();
            }
        } else {
            queue.insert(target, thread.clone());
        }
    }

    /// Moves a thread to the admissible core with the shortest projected
    /// wait, preferring its current core on a tie as migration isn't free.
    ///
    /// With `always_insert` the thread is (re)inserted even when it stays
    /// put; without it, only the calling thread itself may be migrated, as
    /// anything else would leave a thread dangling off every queue.
    pub fn load_balance(
        &self,
        thread: &ThreadRef,
        always_insert: bool,
    ) -> Result<u8, Error> {
        self.load_balance_inner(
            thread,
            always_insert,
            signal::current_is(thread),
        )
    }

    fn load_balance_inner(
        &self,
        thread: &ThreadRef,
        always_insert: bool,
        is_caller: bool,
    ) -> Result<u8, Error> {
        let _migration = thread.migration_lock.lock();
        let current_id = thread.core_id.load(Ordering::Acquire);

        if self.cores[current_id as usize].queue.lock().is_empty()
            || thread.affinity.count() == 1
        {
            if always_insert {
                self.insert_thread(thread);
            }

            debug!("load balancing T{}: C{} (early)", thread.id, current_id);
            return Ok(current_id);
        }

        let priority = thread.priority.load(Ordering::Acquire);
        let mut optimal = current_id;
        let mut shortest: Option<u64> = None;

        for candidate in &self.cores {
            if !thread.affinity.test(candidate.id) {
                continue;
            }

            let projected = Self::projected_wait(candidate, priority);
            let better = match shortest {
                None => true,
                Some(shortest) => {
                    projected < shortest
                        || (projected == shortest
                            && candidate.id == current_id)
                }
            };

            if better {
                optimal = candidate.id;
                shortest = Some(projected);
            }
        }

        if optimal != current_id {
            if !always_insert {
                if is_caller {
                    self.remove_thread(thread);
                } else {
                    return Err(Error::ExternalMigrationRequiresInsert {
                        thread: thread.id,
                    });
                }
            }

            thread.core_id.store(optimal, Ordering::Release);
            self.insert_thread(thread);
            debug!(
                "load balancing T{}: C{} -> C{}",
                thread.id, current_id, optimal
            );
        } else {
            if always_insert {
                self.insert_thread(thread);
            }

            debug!("load balancing T{}: C{} (late)", thread.id, current_id);
        }

        Ok(optimal)
    }

    /// Estimates how long a thread of the given priority would wait on the
    /// core before running, in ticks, based on the residents' average
    /// timeslices. Projections race with the residents updating their own
    /// accounting; they're heuristics, not promises.
    fn projected_wait(core: &CoreContext, priority: i8) -> u64 {
        let queue = core.queue.lock();
        let Some(head) = queue.front() else { return 0 };

        let average = head.average_timeslice.load(Ordering::Acquire);
        let start = head.timeslice_start.load(Ordering::Acquire);
        let mut projected = if average > 0 {
            // The head's remaining time may already have elapsed, in which
            // case the wrapped difference clamps to a single tick.
            min(average.wrapping_sub(ticks().wrapping_sub(start)), 1)
        } else if start > 0 {
            ticks() - start
        } else {
            1
        };

        for resident in queue.iter().skip(1) {
            if resident.priority.load(Ordering::Acquire) <= priority {
                let average =
                    resident.average_timeslice.load(Ordering::Acquire);

                projected += if average > 0 { average } else { 1 };
            }
        }

        projected
    }

    /// Parks the calling thread when no admissible core can run it,
    /// blocking until another thread hands it a core. If some admissible
    /// core would run it immediately, this is just a migration to it.
    pub fn park_thread(&self, thread: &ThreadRef) {
        let _migration = thread.migration_lock.lock();

        self.remove_thread(thread);

        let original = thread.core_id.load(Ordering::Acquire);
        let priority = thread.priority.load(Ordering::Acquire);
        let mut target = PARKED_CORE_ID;

        // Claim the first other admissible core that would run us straight
        // away.
        for core in &self.cores {
            if core.id == original || !thread.affinity.test(core.id) {
                continue;
            }

            let queue = core.queue.lock();
            let idle = queue.front().map_or(true, |head| {
                head.priority.load(Ordering::Acquire) > priority
            });

            if idle {
                target = core.id;
                break;
            }
        }

        thread.core_id.store(target, Ordering::Release);

        if target == PARKED_CORE_ID {
            let mut parked = self.parked.lock();

            parked.insert_ordered(thread.clone());
            debug!("parking T{}", thread.id);

            while !(parked.is_front(thread)
                && thread.core_id.load(Ordering::Acquire) != PARKED_CORE_ID)
            {
                thread.wake.wait(&mut parked);
            }

            // A waker claimed its core for us; leave the parked queue
            // before entering that core's.
            parked.remove(thread);
        }

        self.insert_thread(thread);
    }

    /// Offers the calling thread's core to the parked queue's head. Called
    /// by a running thread that has just advanced its queue.
    ///
    /// The core is only handed over if the parked head outranks the caller,
    /// or ties with it and would have been scheduled before whatever thread
    /// is next in line on this core.
    pub fn wake_parked_thread(&self, current: &GuestThread) {
        let parked = self.parked.lock();
        let Some(parked_head) = parked.front().cloned() else { return };

        let core =
            &self.cores[current.core_id.load(Ordering::Acquire) as usize];
        let queue = core.queue.lock();
        let current_priority = current.priority.load(Ordering::Acquire);
        let parked_priority = parked_head.priority.load(Ordering::Acquire);

        // Only the next thread at the caller's own priority competes with
        // the parked head; anything below wouldn't be scheduled next.
        let next = queue.get(1).filter(|next| {
            next.priority.load(Ordering::Acquire) == current_priority
        });

        let preferred = parked_priority < current_priority
            || (parked_priority == current_priority
                && next.map_or(true, |next| {
                    parked_head.timeslice_start.load(Ordering::Acquire)
                        < next.timeslice_start.load(Ordering::Acquire)
                }));

        if preferred {
            parked_head.core_id.store(core.id, Ordering::Release);
            debug!("waking parked T{} onto C{}", parked_head.id, core.id);
            drop(queue);
            drop(parked);
            parked_head.wake.notify_one();
        }
    }

    /// Removes the calling thread from its core, accounting its cut-short
    /// timeslice and waking the next head if it was running.
    pub fn remove_thread(&self, thread: &GuestThread) {
        let core =
            &self.cores[thread.core_id.load(Ordering::Acquire) as usize];

        {
            let mut queue = core.queue.lock();

            if let Some(index) = queue.remove(thread) {
                if index == 0 {
                    if thread.timeslice_start.load(Ordering::Acquire) > 0 {
                        Self::update_average(thread);
                    }

                    if let Some(head) = queue.front() {
                        head.wake.notify_one();
                    }
                }
            }
        }

        if thread.preempted.load(Ordering::Acquire) {
            thread.disarm_preemption();
        }

        signal::set_yield_pending(false);
    }

    /// Arms preemption when the new head runs in the core's preemption
    /// band, and stamps the start of its timeslice.
    fn begin_timeslice(&self, core: &CoreContext, thread: &GuestThread) {
        if thread.priority.load(Ordering::Acquire) == core.preemption_priority
        {
            thread.arm_preemption(self.timeslice);
        }

        thread.timeslice_start.store(ticks(), Ordering::Release);
    }

    fn settle_preemption(&self, thread: &GuestThread, cooperative: bool) {
        if cooperative && thread.preempted.load(Ordering::Acquire) {
            // A preemptive thread yielded on its own; its timer is still
            // ticking and has to be disarmed.
            thread.disarm_preemption();
        } else {
            thread.preempted.store(false, Ordering::Release);
        }
    }

    // avg <- 0.25 * previous + 0.75 * last timeslice, in ticks.
    fn update_average(thread: &GuestThread) {
        let start = thread.timeslice_start.load(Ordering::Acquire);
        let average = thread.average_timeslice.load(Ordering::Acquire);
        let sample = ticks().saturating_sub(start);

        thread
            .average_timeslice
            .store(average / 4 + 3 * sample / 4, Ordering::Release);
    }
}
