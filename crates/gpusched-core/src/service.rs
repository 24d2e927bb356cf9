//! Async driver for a [`Scheduler`].
//!
//! The scheduler itself never blocks or sleeps; something has to call back
//! in while fences are pending, queries are outstanding, or a liveness
//! deadline is armed. [`run`] is that something: a loop on the current
//! thread that reacts to producer notifications and otherwise sleeps until
//! the next thing worth checking.
//!
//! The scheduler is `!Send`, so the loop must run on a current-thread
//! runtime or inside a `LocalSet`. Build the scheduler with a
//! [`TokioClock`](crate::clock::TokioClock) so that its deadlines line up
//! with tokio's timers.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, trace};

use crate::scheduler::Scheduler;

/// Messages from the producer side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceEvent {
    /// The put offset may have moved.
    PutChanged,
    /// Stop the loop.
    Shutdown,
}

/// Why [`run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceExit {
    Shutdown,
    /// Every sender was dropped.
    ChannelClosed,
}

/// Drive `scheduler` until shutdown.
///
/// While the scheduler reports more work the loop wakes every
/// `idle_poll_interval`; otherwise it sleeps until the next liveness
/// deadline or event.
pub async fn run(
    scheduler: &mut Scheduler,
    mut events: mpsc::UnboundedReceiver<ServiceEvent>,
    idle_poll_interval: Duration,
) -> ServiceExit {
    info!(
        idle_poll_interval_ms = idle_poll_interval.as_millis() as u64,
        "Scheduler service started"
    );

    loop {
        let wake = next_wake(scheduler, idle_poll_interval);
        let wake_at = wake.unwrap_or_else(Instant::now);

        tokio::select! {
            event = events.recv() => match event {
                Some(ServiceEvent::PutChanged) => {
                    trace!("Put changed");
                    scheduler.notify_producer_offset_changed();
                }
                Some(ServiceEvent::Shutdown) => {
                    info!(
                        pending_fences = scheduler.pending_fences(),
                        "Scheduler service shutting down"
                    );
                    return ServiceExit::Shutdown;
                }
                None => {
                    debug!("Event channel closed");
                    return ServiceExit::ChannelClosed;
                }
            },
            () = sleep_until(wake_at), if wake.is_some() => {
                poll_work(scheduler);
            }
        }
    }
}

/// Earliest of the liveness deadline and, while there is more work, the
/// next idle poll.
fn next_wake(scheduler: &Scheduler, idle_poll_interval: Duration) -> Option<Instant> {
    let deadline = scheduler.next_deadline().map(Instant::from_std);
    let idle = scheduler
        .has_more_work()
        .then(|| Instant::now() + idle_poll_interval);
    match (deadline, idle) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// One round of background work: fire due timers, retire fences, run idle
/// work once nothing is fenced, and pick up any commands that were waiting.
pub fn poll_work(scheduler: &mut Scheduler) {
    if scheduler.run_due_timers() {
        debug!("Forced reschedule fired");
    }
    if !scheduler.poll_unschedule_fences() {
        return;
    }
    if scheduler.has_more_idle_work() {
        scheduler.perform_idle_work();
    }
    scheduler.notify_producer_offset_changed();
}
