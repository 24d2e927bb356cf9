//! GPU fences and the blocking full-sync fallback.
//!
//! A [`Fence`] marks a point in the GPU's execution stream. Backends that
//! cannot create fences return `None` from [`GpuSync::create_fence`]; the
//! scheduler then falls back to [`GpuSync::finish`], which blocks until the
//! GPU is idle.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

pub trait Fence {
    /// Has the GPU passed this point?
    fn has_completed(&self) -> bool;
}

pub trait GpuSync {
    /// Insert a fence at the current point of the command stream.
    fn create_fence(&self) -> Option<Box<dyn Fence>>;

    /// Block until all submitted GPU work has completed.
    fn finish(&self);
}

/// Backend without fence support.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFences;

impl GpuSync for NoFences {
    fn create_fence(&self) -> Option<Box<dyn Fence>> {
        None
    }

    fn finish(&self) {}
}

/// Fence signaled by hand through [`ManualGpuSync`].
#[derive(Debug, Clone)]
pub struct ManualFence {
    signaled: Rc<Cell<bool>>,
}

impl Fence for ManualFence {
    fn has_completed(&self) -> bool {
        self.signaled.get()
    }
}

/// Deterministic [`GpuSync`] for tests and fuzzing.
///
/// Fences are numbered in creation order. `finish` signals every fence, as
/// an idle GPU has passed all of them.
#[derive(Debug, Default)]
pub struct ManualGpuSync {
    unsupported: bool,
    fences: RefCell<Vec<Rc<Cell<bool>>>>,
    finish_calls: Cell<u32>,
}

impl ManualGpuSync {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend whose `create_fence` always returns `None`.
    #[must_use]
    pub fn without_fences() -> Self {
        Self {
            unsupported: true,
            ..Self::default()
        }
    }

    /// Signal the `index`-th created fence. Returns false if no such fence.
    pub fn signal(&self, index: usize) -> bool {
        self.fences.borrow().get(index).is_some_and(|f| {
            f.set(true);
            true
        })
    }

    pub fn signal_all(&self) {
        for fence in self.fences.borrow().iter() {
            fence.set(true);
        }
    }

    #[must_use]
    pub fn fences_created(&self) -> usize {
        self.fences.borrow().len()
    }

    #[must_use]
    pub fn finish_calls(&self) -> u32 {
        self.finish_calls.get()
    }
}

impl GpuSync for ManualGpuSync {
    fn create_fence(&self) -> Option<Box<dyn Fence>> {
        if self.unsupported {
            return None;
        }
        let signaled = Rc::new(Cell::new(false));
        self.fences.borrow_mut().push(Rc::clone(&signaled));
        Some(Box::new(ManualFence { signaled }))
    }

    fn finish(&self) {
        self.finish_calls.set(self.finish_calls.get() + 1);
        self.signal_all();
    }
}
