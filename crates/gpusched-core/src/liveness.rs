//! Liveness policies: bounded-time recovery from a scheduler that never
//! gets rescheduled.
//!
//! Some platforms have scheduling primitives that can silently fail to
//! signal "ready". [`ForcedReschedule`] arms a one-shot deadline when the
//! scheduler goes from scheduled to unscheduled and disarms it on the way
//! back. If the deadline passes first, the scheduler forces itself back to
//! scheduled and absorbs the late real reschedules.
//!
//! The state machine only calls into the policy on the 0→1 and 1→0
//! transitions of its unscheduled count.

use std::cell::Cell;
use std::time::{Duration, Instant};

use crate::config::{LivenessMode, SchedulerConfig};

pub trait LivenessPolicy {
    /// The scheduler just became unscheduled.
    fn arm(&self, now: Instant);

    /// The scheduler just became scheduled again.
    fn disarm(&self);

    /// When the forced reschedule fires, if armed.
    fn deadline(&self) -> Option<Instant>;

    /// One-shot: true exactly once per expired arming.
    fn take_expired(&self, now: Instant) -> bool {
        match self.deadline() {
            Some(deadline) if now >= deadline => {
                self.disarm();
                true
            }
            _ => false,
        }
    }
}

/// Never forces a reschedule.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLiveness;

impl LivenessPolicy for NoLiveness {
    fn arm(&self, _now: Instant) {}

    fn disarm(&self) {}

    fn deadline(&self) -> Option<Instant> {
        None
    }
}

/// Forces a reschedule after `delay` of continuous unscheduling.
#[derive(Debug)]
pub struct ForcedReschedule {
    delay: Duration,
    deadline: Cell<Option<Instant>>,
}

impl ForcedReschedule {
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            deadline: Cell::new(None),
        }
    }

    #[must_use]
    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl LivenessPolicy for ForcedReschedule {
    fn arm(&self, now: Instant) {
        self.deadline.set(Some(now + self.delay));
    }

    fn disarm(&self) {
        self.deadline.set(None);
    }

    fn deadline(&self) -> Option<Instant> {
        self.deadline.get()
    }
}

/// Build the policy selected by `config.liveness`.
#[must_use]
pub fn policy_for(config: &SchedulerConfig) -> Box<dyn LivenessPolicy> {
    match config.liveness {
        LivenessMode::Disabled => Box::new(NoLiveness),
        LivenessMode::ForcedReschedule => {
            Box::new(ForcedReschedule::new(config.reschedule_timeout()))
        }
    }
}
