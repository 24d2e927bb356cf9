//! Scheduling state machine and the unschedule fence queue.
//!
//! ```text
//!            set_scheduled(false)            set_scheduled(false)
//!   ┌───────────┐  0 → 1   ┌─────────────┐  n → n+1
//!   │ Scheduled │ ───────► │ Unscheduled │ ◄──────┐
//!   │ count = 0 │ ◄─────── │  count > 0  │ ───────┘
//!   └───────────┘  1 → 0   └─────────────┘  set_scheduled(true), n → n-1
//!         ▲   set_scheduled(true)   │
//!         └──── forced reschedule ──┘  (liveness deadline expired)
//! ```
//!
//! Every reason to wait (a pending fence, an external busy signal) adds one
//! to the unscheduled count; work resumes only when all of them clear. The
//! observer is told about the 0→1 and 1→0 edges only.
//!
//! [`SchedulingCore`] lives behind an `Rc` so that a decoder can defer work
//! through a [`SchedulerHandle`] while the scheduler is in the middle of a
//! drain. No `RefCell` borrow is ever held across a call out to user code
//! (deferred tasks, observers), so those may call back into the handle.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace, warn};

use crate::clock::Clock;
use crate::fence::{Fence, GpuSync};
use crate::liveness::LivenessPolicy;

/// Single-invocation task run once its fence retires.
pub type DeferredTask = Box<dyn FnOnce()>;

/// Observer of scheduled/unscheduled edges.
pub type SchedulingChangedCallback = Rc<dyn Fn(bool)>;

enum FrontStatus {
    Empty,
    /// Backend has no fences; only a full sync can retire this.
    Unfenced,
    Completed,
    TimedOut,
    Pending,
}

struct UnscheduleFence {
    /// `None` when the backend has no fence support.
    fence: Option<Box<dyn Fence>>,
    issue_time: Instant,
    task: DeferredTask,
}

/// Monotonic counters describing what the scheduler has done.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub drain_calls: u64,
    pub commands_processed: u64,
    pub commands_deferred: u64,
    /// Number of times the preemption flag was observed going up.
    pub preemptions: u64,
    pub fences_retired: u64,
    /// Fences retired because they aged out, not because they signaled.
    pub fence_timeouts: u64,
    pub full_syncs: u64,
    pub forced_reschedules: u64,
    /// Real reschedules swallowed after a forced reschedule.
    pub absorbed_reschedules: u64,
    pub parse_errors: u64,
    pub context_losses: u64,
}

/// Unscheduled/rescheduled counters plus the fence queue.
pub struct SchedulingCore {
    unscheduled_count: Cell<u32>,
    rescheduled_count: Cell<u32>,
    liveness: Box<dyn LivenessPolicy>,
    scheduling_changed: RefCell<Option<SchedulingChangedCallback>>,
    fences: RefCell<VecDeque<UnscheduleFence>>,
    gpu_sync: Rc<dyn GpuSync>,
    clock: Rc<dyn Clock>,
    fence_timeout: Duration,
    stats: Cell<SchedulerStats>,
}

impl std::fmt::Debug for SchedulingCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulingCore")
            .field("unscheduled_count", &self.unscheduled_count.get())
            .field("rescheduled_count", &self.rescheduled_count.get())
            .field("pending_fences", &self.fences.borrow().len())
            .field("fence_timeout", &self.fence_timeout)
            .finish_non_exhaustive()
    }
}

impl SchedulingCore {
    #[must_use]
    pub fn new(
        gpu_sync: Rc<dyn GpuSync>,
        clock: Rc<dyn Clock>,
        liveness: Box<dyn LivenessPolicy>,
        fence_timeout: Duration,
    ) -> Self {
        Self {
            unscheduled_count: Cell::new(0),
            rescheduled_count: Cell::new(0),
            liveness,
            scheduling_changed: RefCell::new(None),
            fences: RefCell::new(VecDeque::new()),
            gpu_sync,
            clock,
            fence_timeout,
            stats: Cell::new(SchedulerStats::default()),
        }
    }

    #[must_use]
    pub fn is_scheduled(&self) -> bool {
        self.unscheduled_count.get() == 0
    }

    #[must_use]
    pub fn unscheduled_count(&self) -> u32 {
        self.unscheduled_count.get()
    }

    #[must_use]
    pub fn rescheduled_count(&self) -> u32 {
        self.rescheduled_count.get()
    }

    #[must_use]
    pub fn pending_fences(&self) -> usize {
        self.fences.borrow().len()
    }

    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        self.stats.get()
    }

    pub(crate) fn record(&self, f: impl FnOnce(&mut SchedulerStats)) {
        let mut stats = self.stats.get();
        f(&mut stats);
        self.stats.set(stats);
    }

    /// Replace the observer. Last registration wins.
    pub fn set_scheduling_changed_callback(&self, callback: Option<SchedulingChangedCallback>) {
        *self.scheduling_changed.borrow_mut() = callback;
    }

    fn notify_scheduling_changed(&self, scheduled: bool) {
        let callback = self.scheduling_changed.borrow().clone();
        if let Some(callback) = callback {
            callback(scheduled);
        }
    }

    /// `false` adds a reason to wait; `true` clears one.
    pub fn set_scheduled(&self, scheduled: bool) {
        if scheduled {
            // A forced reschedule already cleared the reason this call is
            // for; swallow it instead of decrementing twice.
            let rescheduled = self.rescheduled_count.get();
            if rescheduled > 0 {
                self.rescheduled_count.set(rescheduled - 1);
                self.record(|s| s.absorbed_reschedules += 1);
                trace!(
                    rescheduled_count = rescheduled - 1,
                    "Absorbed reschedule after forced reschedule"
                );
                return;
            }

            let count = self.unscheduled_count.get();
            debug_assert!(count > 0, "set_scheduled(true) while already scheduled");
            if count == 0 {
                error!("set_scheduled(true) while already scheduled; ignoring");
                return;
            }
            let count = count - 1;
            self.unscheduled_count.set(count);
            trace!(unscheduled_count = count, "Scheduling reason cleared");

            if count == 0 {
                self.liveness.disarm();
                debug!("Scheduler rescheduled");
                self.notify_scheduling_changed(true);
            }
        } else {
            let count = self.unscheduled_count.get() + 1;
            self.unscheduled_count.set(count);
            trace!(unscheduled_count = count, "Scheduling reason added");

            if count == 1 {
                debug!(pending_fences = self.pending_fences(), "Scheduler unscheduled");
                self.notify_scheduling_changed(false);
                self.liveness.arm(self.clock.now());
            }
        }
    }

    /// Force the scheduler back to scheduled, remembering how many real
    /// reschedules are still owed so they can be absorbed later.
    pub fn reschedule_time_out(&self) {
        let pending_real = self.unscheduled_count.get() + self.rescheduled_count.get();
        warn!(
            unscheduled_count = self.unscheduled_count.get(),
            rescheduled_count = self.rescheduled_count.get(),
            "Scheduler stayed unscheduled past the reschedule timeout; forcing reschedule"
        );

        self.rescheduled_count.set(0);
        while self.unscheduled_count.get() > 0 {
            self.set_scheduled(true);
        }
        self.rescheduled_count.set(pending_real);
        self.record(|s| s.forced_reschedules += 1);
    }

    /// Fire the liveness deadline if it has passed. Returns true if a forced
    /// reschedule happened.
    pub fn run_due_timers(&self) -> bool {
        if self.liveness.take_expired(self.clock.now()) {
            self.reschedule_time_out();
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.liveness.deadline()
    }

    /// Queue `task` behind a fence at the current point of the GPU stream and
    /// unschedule until it retires.
    pub fn defer_to_fence(&self, task: DeferredTask) {
        let fence = self.gpu_sync.create_fence();
        let issue_time = self.clock.now();
        self.fences.borrow_mut().push_back(UnscheduleFence {
            fence,
            issue_time,
            task,
        });
        self.set_scheduled(false);
    }

    /// Retire fences from the front of the queue.
    ///
    /// Returns true once the queue is empty, false if the front fence is
    /// still pending. Entries retire strictly in issue order. A fence older
    /// than the fence timeout retires even if it has not signaled.
    pub fn poll_unschedule_fences(&self) -> bool {
        let now = self.clock.now();
        loop {
            let timed_out = match self.front_status(now) {
                FrontStatus::Empty => return true,
                FrontStatus::Pending => return false,
                FrontStatus::Unfenced => {
                    self.finish_and_drain();
                    return true;
                }
                FrontStatus::Completed => false,
                FrontStatus::TimedOut => true,
            };

            let Some(entry) = self.fences.borrow_mut().pop_front() else {
                return true;
            };
            if timed_out {
                warn!(
                    age_ms = now.saturating_duration_since(entry.issue_time).as_millis() as u64,
                    timeout_ms = self.fence_timeout.as_millis() as u64,
                    "Unschedule fence timed out; running deferred task anyway"
                );
                self.record(|s| s.fence_timeouts += 1);
            }
            self.retire(entry);
        }
    }

    fn front_status(&self, now: Instant) -> FrontStatus {
        let fences = self.fences.borrow();
        let Some(front) = fences.front() else {
            return FrontStatus::Empty;
        };
        match &front.fence {
            None => FrontStatus::Unfenced,
            Some(fence) if fence.has_completed() => FrontStatus::Completed,
            Some(_) if now.saturating_duration_since(front.issue_time) > self.fence_timeout => {
                FrontStatus::TimedOut
            }
            Some(_) => FrontStatus::Pending,
        }
    }

    /// No fence objects: block on a full sync once, then treat every queued
    /// deferral as satisfied.
    fn finish_and_drain(&self) {
        debug!(
            pending_fences = self.pending_fences(),
            "Backend has no fences; performing full sync"
        );
        self.gpu_sync.finish();
        self.record(|s| s.full_syncs += 1);
        loop {
            let Some(entry) = self.fences.borrow_mut().pop_front() else {
                break;
            };
            self.retire(entry);
        }
    }

    fn retire(&self, entry: UnscheduleFence) {
        let UnscheduleFence { fence, task, .. } = entry;
        drop(fence);
        task();
        self.record(|s| s.fences_retired += 1);
        self.set_scheduled(true);
    }

    /// Drop every pending task without running it. Returns how many there were.
    pub(crate) fn discard_pending(&self) -> usize {
        let pending = std::mem::take(&mut *self.fences.borrow_mut());
        let count = pending.len();
        drop(pending);
        count
    }
}

/// Cloneable handle to a scheduler's scheduling state.
///
/// Decoders keep one so they can unschedule from inside `do_command`.
#[derive(Clone, Debug)]
pub struct SchedulerHandle {
    core: Rc<SchedulingCore>,
}

impl SchedulerHandle {
    pub(crate) fn new(core: Rc<SchedulingCore>) -> Self {
        Self { core }
    }

    /// Run `task` once the GPU has passed the current point, and keep the
    /// scheduler unscheduled until then.
    pub fn defer_to_fence(&self, task: impl FnOnce() + 'static) {
        self.core.defer_to_fence(Box::new(task));
    }

    pub fn set_scheduled(&self, scheduled: bool) {
        self.core.set_scheduled(scheduled);
    }

    #[must_use]
    pub fn is_scheduled(&self) -> bool {
        self.core.is_scheduled()
    }

    #[must_use]
    pub fn pending_fences(&self) -> usize {
        self.core.pending_fences()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::fence::ManualGpuSync;
    use crate::liveness::{ForcedReschedule, NoLiveness};

    const FENCE_TIMEOUT: Duration = Duration::from_millis(10_000);

    struct Fixture {
        core: Rc<SchedulingCore>,
        sync: Rc<ManualGpuSync>,
        clock: Rc<ManualClock>,
        transitions: Rc<RefCell<Vec<bool>>>,
    }

    fn fixture_with(sync: ManualGpuSync, liveness: Box<dyn LivenessPolicy>) -> Fixture {
        let sync = Rc::new(sync);
        let clock = Rc::new(ManualClock::new());
        let core = Rc::new(SchedulingCore::new(
            sync.clone(),
            clock.clone(),
            liveness,
            FENCE_TIMEOUT,
        ));
        let transitions = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&transitions);
        core.set_scheduling_changed_callback(Some(Rc::new(move |scheduled| {
            sink.borrow_mut().push(scheduled);
        })));
        Fixture {
            core,
            sync,
            clock,
            transitions,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(ManualGpuSync::new(), Box::new(NoLiveness))
    }

    fn recorder() -> (Rc<RefCell<Vec<&'static str>>>, impl Fn(&'static str) -> DeferredTask) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&log);
        let make = move |name: &'static str| -> DeferredTask {
            let sink = Rc::clone(&sink);
            Box::new(move || sink.borrow_mut().push(name))
        };
        (log, make)
    }

    #[test]
    fn nested_unschedules_notify_only_on_edges() {
        let f = fixture();
        f.core.set_scheduled(false);
        f.core.set_scheduled(false);
        assert_eq!(f.core.unscheduled_count(), 2);
        f.core.set_scheduled(true);
        assert!(!f.core.is_scheduled());
        f.core.set_scheduled(true);
        assert!(f.core.is_scheduled());
        assert_eq!(*f.transitions.borrow(), vec![false, true]);
    }

    #[test]
    fn forced_reschedule_absorbs_late_real_reschedules() {
        let f = fixture_with(
            ManualGpuSync::new(),
            Box::new(ForcedReschedule::new(Duration::from_millis(1_000))),
        );
        f.core.set_scheduled(false);
        f.core.set_scheduled(false);
        assert!(f.core.next_deadline().is_some());

        f.clock.advance(Duration::from_millis(999));
        assert!(!f.core.run_due_timers());
        f.clock.advance(Duration::from_millis(1));
        assert!(f.core.run_due_timers());

        assert!(f.core.is_scheduled());
        assert_eq!(f.core.rescheduled_count(), 2);
        assert!(f.core.next_deadline().is_none());

        f.core.set_scheduled(true);
        f.core.set_scheduled(true);
        assert_eq!(f.core.unscheduled_count(), 0);
        assert_eq!(f.core.rescheduled_count(), 0);
        assert_eq!(*f.transitions.borrow(), vec![false, true]);

        let stats = f.core.stats();
        assert_eq!(stats.forced_reschedules, 1);
        assert_eq!(stats.absorbed_reschedules, 2);
    }

    #[test]
    fn forced_reschedule_carries_over_outstanding_absorptions() {
        let f = fixture_with(
            ManualGpuSync::new(),
            Box::new(ForcedReschedule::new(Duration::from_millis(5))),
        );
        f.core.set_scheduled(false);
        f.clock.advance(Duration::from_millis(5));
        assert!(f.core.run_due_timers());
        assert_eq!(f.core.rescheduled_count(), 1);

        // New reason arrives before the old real reschedule does.
        f.core.set_scheduled(false);
        f.clock.advance(Duration::from_millis(5));
        assert!(f.core.run_due_timers());
        assert_eq!(f.core.rescheduled_count(), 2);

        f.core.set_scheduled(true);
        f.core.set_scheduled(true);
        assert_eq!(
            (f.core.unscheduled_count(), f.core.rescheduled_count()),
            (0, 0)
        );
    }

    #[test]
    fn rescheduling_cancels_the_liveness_deadline() {
        let f = fixture_with(
            ManualGpuSync::new(),
            Box::new(ForcedReschedule::new(Duration::from_millis(5))),
        );
        f.core.set_scheduled(false);
        f.core.set_scheduled(true);
        f.clock.advance(Duration::from_secs(1));
        assert!(!f.core.run_due_timers());
        assert_eq!(f.core.rescheduled_count(), 0);
    }

    #[test]
    fn fences_retire_in_fifo_order() {
        let f = fixture();
        let (log, task) = recorder();
        f.core.defer_to_fence(task("a"));
        f.core.defer_to_fence(task("b"));
        assert_eq!(f.core.unscheduled_count(), 2);

        // b signals first, but a still blocks the queue.
        f.sync.signal(1);
        assert!(!f.core.poll_unschedule_fences());
        assert!(log.borrow().is_empty());

        f.sync.signal(0);
        assert!(f.core.poll_unschedule_fences());
        assert_eq!(*log.borrow(), vec!["a", "b"]);
        assert!(f.core.is_scheduled());
        assert_eq!(f.core.stats().fences_retired, 2);
    }

    #[test]
    fn stale_fence_retires_after_timeout() {
        let f = fixture();
        let (log, task) = recorder();
        f.core.defer_to_fence(task("late"));

        f.clock.advance(FENCE_TIMEOUT);
        assert!(!f.core.poll_unschedule_fences());

        f.clock.advance(Duration::from_millis(1));
        assert!(f.core.poll_unschedule_fences());
        assert_eq!(*log.borrow(), vec!["late"]);
        assert_eq!(f.core.stats().fence_timeouts, 1);
        assert!(f.core.is_scheduled());
    }

    #[test]
    fn missing_fences_fall_back_to_one_full_sync() {
        let f = fixture_with(ManualGpuSync::without_fences(), Box::new(NoLiveness));
        let (log, task) = recorder();
        f.core.defer_to_fence(task("x"));
        f.core.defer_to_fence(task("y"));
        f.core.defer_to_fence(task("z"));

        assert!(f.core.poll_unschedule_fences());
        assert_eq!(f.sync.finish_calls(), 1);
        assert_eq!(*log.borrow(), vec!["x", "y", "z"]);
        assert!(f.core.is_scheduled());

        assert!(f.core.poll_unschedule_fences());
        assert_eq!(f.sync.finish_calls(), 1);
    }

    #[test]
    fn task_may_defer_again_while_being_retired() {
        let f = fixture();
        let handle = SchedulerHandle::new(Rc::clone(&f.core));
        let (log, task) = recorder();
        let inner = task("second");
        let outer_log = Rc::clone(&log);
        f.core.defer_to_fence(Box::new(move || {
            outer_log.borrow_mut().push("first");
            handle.defer_to_fence(inner);
        }));

        f.sync.signal(0);
        assert!(!f.core.poll_unschedule_fences());
        assert_eq!(*log.borrow(), vec!["first"]);
        assert_eq!(f.core.unscheduled_count(), 1);

        f.sync.signal(1);
        assert!(f.core.poll_unschedule_fences());
        assert_eq!(*log.borrow(), vec!["first", "second"]);
        assert!(f.core.is_scheduled());
    }

    #[test]
    fn observer_may_query_state_during_notification() {
        let f = fixture();
        let core = Rc::downgrade(&f.core);
        let seen = Rc::new(Cell::new(None));
        let sink = Rc::clone(&seen);
        f.core
            .set_scheduling_changed_callback(Some(Rc::new(move |scheduled| {
                let count = core.upgrade().map(|c| c.unscheduled_count());
                sink.set(Some((scheduled, count)));
            })));
        f.core.set_scheduled(false);
        assert_eq!(seen.get(), Some((false, Some(1))));
    }

    #[test]
    fn discard_pending_drops_tasks_unrun() {
        let f = fixture();
        let (log, task) = recorder();
        f.core.defer_to_fence(task("never"));
        assert_eq!(f.core.discard_pending(), 1);
        assert_eq!(f.core.pending_fences(), 0);
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn stats_serialize_to_json() {
        let stats = SchedulerStats {
            commands_processed: 3,
            ..SchedulerStats::default()
        };
        let value = serde_json::to_value(stats).unwrap();
        assert_eq!(value["commands_processed"], 3);
        assert_eq!(value["fence_timeouts"], 0);
    }
}
