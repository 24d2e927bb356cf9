//! Cross-scheduler preemption flag.
//!
//! A higher-priority scheduler sets the flag; lower-priority schedulers poll
//! it once per command and yield while it is set. The flag is the only piece
//! of scheduler state written from outside the scheduler's own thread, so it
//! is an atomic shared through an `Arc`.

use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
pub struct PreemptionFlag {
    flag: AtomicBool,
}

impl PreemptionFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn reset(&self) {
        self.flag.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}
