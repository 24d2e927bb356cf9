//! Shared test infrastructure for gpusched-core integration tests.
//!
//! Import from integration test files with:
//! ```ignore
//! mod common;
//! use common::{Rig, ScriptedDecoder, Step};
//! ```

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use gpusched_core::clock::ManualClock;
use gpusched_core::command_buffer::{
    CommandBuffer, CommandBufferService, CommandBufferState, TransferBuffer,
};
use gpusched_core::config::SchedulerConfig;
use gpusched_core::decoder::CommandDecoder;
use gpusched_core::error::{CommandError, ContextLostReason};
use gpusched_core::fence::ManualGpuSync;
use gpusched_core::parser::CommandOutcome;
use gpusched_core::scheduler::Scheduler;
use gpusched_core::scheduling::SchedulerHandle;

/// What the decoder does the next time it sees a given command id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Ok,
    /// Defer behind a fresh fence and ask to be retried.
    Defer,
    Fail(CommandError),
}

/// Decoder driven by per-command scripts. Unscripted commands succeed.
#[derive(Default)]
pub struct ScriptedDecoder {
    pub handle: Option<SchedulerHandle>,
    pub seen: Vec<(u32, Vec<u32>)>,
    script: HashMap<u32, VecDeque<Step>>,
    pub context_lost: Option<ContextLostReason>,
    pub pending_queries: u32,
    pub idle_work: u32,
    pub drains: u32,
    pub processing_time: Duration,
}

impl ScriptedDecoder {
    pub fn script(&mut self, command: u32, steps: impl IntoIterator<Item = Step>) {
        self.script.entry(command).or_default().extend(steps);
    }

    pub fn seen_ids(&self) -> Vec<u32> {
        self.seen.iter().map(|(id, _)| *id).collect()
    }
}

impl CommandDecoder for ScriptedDecoder {
    fn do_command(&mut self, command: u32, args: &[u32]) -> CommandOutcome {
        self.seen.push((command, args.to_vec()));
        let step = self
            .script
            .get_mut(&command)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Step::Ok);
        match step {
            Step::Ok => CommandOutcome::Ok,
            Step::Defer => {
                let handle = self.handle.as_ref().expect("decoder has no scheduler handle");
                handle.defer_to_fence(|| {});
                CommandOutcome::DeferUntilLater
            }
            Step::Fail(error) => CommandOutcome::Fatal(error),
        }
    }

    fn end_decoding(&mut self) {
        self.drains += 1;
    }

    fn process_pending_queries(&mut self) -> bool {
        self.pending_queries = self.pending_queries.saturating_sub(1);
        self.pending_queries > 0
    }

    fn has_more_idle_work(&self) -> bool {
        self.idle_work > 0
    }

    fn perform_idle_work(&mut self) {
        self.idle_work = self.idle_work.saturating_sub(1);
    }

    fn was_context_lost(&self) -> bool {
        self.context_lost.is_some()
    }

    fn context_lost_reason(&self) -> ContextLostReason {
        self.context_lost.unwrap_or_default()
    }

    fn add_processing_time(&mut self, elapsed: Duration) {
        self.processing_time += elapsed;
    }
}

/// A scheduler wired to an in-process command buffer, a scripted decoder,
/// hand-signaled fences and a manual clock.
pub struct Rig {
    pub service: Rc<CommandBufferService>,
    pub decoder: Rc<RefCell<ScriptedDecoder>>,
    pub sync: Rc<ManualGpuSync>,
    pub clock: Rc<ManualClock>,
    pub ring: TransferBuffer,
    pub put: usize,
    pub scheduler: Scheduler,
}

impl Rig {
    pub fn new(entries: usize) -> Self {
        Self::with(entries, ManualGpuSync::new(), SchedulerConfig::default())
    }

    pub fn with(entries: usize, sync: ManualGpuSync, config: SchedulerConfig) -> Self {
        let service = Rc::new(CommandBufferService::new());
        let (id, ring) = service.create_transfer_buffer(entries);
        let decoder = Rc::new(RefCell::new(ScriptedDecoder::default()));
        let sync = Rc::new(sync);
        let clock = Rc::new(ManualClock::new());
        let mut scheduler = Scheduler::builder(service.clone(), decoder.clone())
            .gpu_sync(sync.clone())
            .clock(clock.clone())
            .config(config)
            .build();
        decoder.borrow_mut().handle = Some(scheduler.handle());
        assert!(scheduler.bind_transfer_buffer(id));
        Self {
            service,
            decoder,
            sync,
            clock,
            ring,
            put: 0,
            scheduler,
        }
    }

    /// Write one command at the producer cursor without publishing it.
    pub fn push(&mut self, command: u32, args: &[u32]) {
        self.put = self
            .ring
            .write_command(self.put, command, args)
            .expect("command does not fit in the ring");
        if self.put == self.ring.len() {
            self.put = 0;
        }
    }

    /// Publish everything pushed so far and notify the scheduler.
    pub fn flush(&mut self) {
        self.service.flush(self.put as i32);
        self.scheduler.notify_producer_offset_changed();
    }

    /// Push argument-less commands and flush.
    pub fn submit(&mut self, commands: &[u32]) {
        for &command in commands {
            self.push(command, &[]);
        }
        self.flush();
    }

    pub fn state(&self) -> CommandBufferState {
        self.service.state()
    }

    pub fn seen_ids(&self) -> Vec<u32> {
        self.decoder.borrow().seen_ids()
    }
}
