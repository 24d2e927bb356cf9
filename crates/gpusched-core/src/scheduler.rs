//! The command scheduler.
//!
//! [`Scheduler`] drains a ring buffer of commands through a
//! [`CommandDecoder`], pausing whenever something the GPU has not finished
//! yet must complete first, and yielding to a higher-priority scheduler when
//! the shared [`PreemptionFlag`] is raised.
//!
//! Everything here runs on one thread. The owner drives the scheduler by
//! calling [`Scheduler::notify_producer_offset_changed`] whenever the
//! producer may have written more commands, and by polling fences and
//! timers while the scheduler reports more work (see [`crate::service`]).
//!
//! Fatal conditions are never returned to the caller of the drain. They are
//! latched on the command buffer's error slot, where the producer side sees
//! them, and the scheduler stops reading that buffer for good.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, instrument, trace, warn};

use crate::clock::{Clock, SystemClock};
use crate::command_buffer::{CommandBuffer, CommandBufferState, TransferBuffer};
use crate::config::SchedulerConfig;
use crate::decoder::CommandDecoder;
use crate::error::{CommandError, Error, Result};
use crate::fence::{GpuSync, NoFences};
use crate::liveness::{self, LivenessPolicy};
use crate::parser::{CommandOutcome, CommandParser};
use crate::preemption::PreemptionFlag;
use crate::scheduling::{SchedulerHandle, SchedulerStats, SchedulingCore};

/// Callback invoked after every command that did not defer.
pub type CommandProcessedCallback = Box<dyn FnMut()>;

/// Builder for [`Scheduler`].
///
/// The command buffer and decoder are required; everything else has a
/// default (no fences, the system clock, [`SchedulerConfig::default`]).
pub struct SchedulerBuilder {
    command_buffer: Rc<dyn CommandBuffer>,
    decoder: Rc<RefCell<dyn CommandDecoder>>,
    gpu_sync: Option<Rc<dyn GpuSync>>,
    clock: Option<Rc<dyn Clock>>,
    liveness: Option<Box<dyn LivenessPolicy>>,
    preemption_flag: Option<Arc<PreemptionFlag>>,
    config: SchedulerConfig,
}

impl SchedulerBuilder {
    #[must_use]
    pub fn gpu_sync(mut self, gpu_sync: Rc<dyn GpuSync>) -> Self {
        self.gpu_sync = Some(gpu_sync);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Rc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Override the liveness policy selected by the config.
    #[must_use]
    pub fn liveness(mut self, policy: Box<dyn LivenessPolicy>) -> Self {
        self.liveness = Some(policy);
        self
    }

    #[must_use]
    pub fn preemption_flag(mut self, flag: Arc<PreemptionFlag>) -> Self {
        self.preemption_flag = Some(flag);
        self
    }

    #[must_use]
    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn build(self) -> Scheduler {
        let gpu_sync = self.gpu_sync.unwrap_or_else(|| Rc::new(NoFences));
        let clock = self.clock.unwrap_or_else(|| Rc::new(SystemClock));
        let liveness = self
            .liveness
            .unwrap_or_else(|| liveness::policy_for(&self.config));
        let core = Rc::new(SchedulingCore::new(
            gpu_sync,
            Rc::clone(&clock),
            liveness,
            self.config.fence_timeout(),
        ));

        debug!(
            fence_timeout_ms = self.config.fence_timeout_ms,
            liveness = ?self.config.liveness,
            "Scheduler created"
        );

        Scheduler {
            command_buffer: self.command_buffer,
            decoder: self.decoder,
            parser: None,
            core,
            clock,
            preemption_flag: self.preemption_flag,
            was_preempted: false,
            command_processed: None,
        }
    }
}

/// Drains a command buffer through a decoder.
pub struct Scheduler {
    command_buffer: Rc<dyn CommandBuffer>,
    decoder: Rc<RefCell<dyn CommandDecoder>>,
    /// Created lazily by the first successful [`Scheduler::bind_transfer_buffer`].
    parser: Option<CommandParser>,
    core: Rc<SchedulingCore>,
    clock: Rc<dyn Clock>,
    preemption_flag: Option<Arc<PreemptionFlag>>,
    was_preempted: bool,
    command_processed: Option<CommandProcessedCallback>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("parser", &self.parser)
            .field("core", &self.core)
            .field("was_preempted", &self.was_preempted)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Start building a scheduler over `command_buffer` and `decoder`.
    #[must_use]
    pub fn builder(
        command_buffer: Rc<dyn CommandBuffer>,
        decoder: Rc<RefCell<dyn CommandDecoder>>,
    ) -> SchedulerBuilder {
        SchedulerBuilder {
            command_buffer,
            decoder,
            gpu_sync: None,
            clock: None,
            liveness: None,
            preemption_flag: None,
            config: SchedulerConfig::default(),
        }
    }

    /// Process whatever the producer has made available.
    ///
    /// Stops early when an error is latched, a fence is still pending, the
    /// scheduler is unscheduled, or the preemption flag is up.
    #[instrument(name = "put_changed", level = "debug", skip(self))]
    pub fn notify_producer_offset_changed(&mut self) {
        self.core.record(|s| s.drain_calls += 1);
        let state = self.command_buffer.state();

        let Some(mut parser) = self.parser.take() else {
            if state.get_offset != state.put_offset {
                warn!(
                    get_offset = state.get_offset,
                    put_offset = state.put_offset,
                    "Producer advanced before a ring buffer was bound"
                );
            }
            return;
        };

        self.drain(&mut parser, state);
        self.parser = Some(parser);
    }

    fn drain(&mut self, parser: &mut CommandParser, state: CommandBufferState) {
        parser.set_put(state.put_offset);
        if let Some(error) = state.error {
            trace!(%error, "Error already latched; not processing");
            return;
        }
        // Past the ring the wrapped cursor can never reach put.
        let put = state.put_offset;
        if put != 0 && !(0..parser.entry_count()).contains(&put) {
            warn!(
                put_offset = put,
                entry_count = parser.entry_count(),
                "Put offset outside the ring buffer"
            );
            self.command_buffer.set_parse_error(CommandError::OutOfBounds);
            self.core.record(|s| s.parse_errors += 1);
            return;
        }

        if !self.core.poll_unschedule_fences() {
            trace!(pending_fences = self.core.pending_fences(), "Waiting on fences");
            return;
        }
        // A retired fence task may have unscheduled us again.
        if !self.core.is_scheduled() {
            trace!(
                unscheduled_count = self.core.unscheduled_count(),
                "Unscheduled; not processing"
            );
            return;
        }

        let begin = self.clock.now();
        self.decoder.borrow_mut().begin_decoding();

        let mut outcome = CommandOutcome::Ok;
        while !parser.is_empty() {
            if self.is_preempted() {
                break;
            }

            debug_assert!(self.core.is_scheduled());
            debug_assert_eq!(self.core.pending_fences(), 0);

            outcome = parser.process_command(&mut *self.decoder.borrow_mut());

            if outcome == CommandOutcome::DeferUntilLater {
                self.core.record(|s| s.commands_deferred += 1);
                debug_assert!(
                    !self.core.is_scheduled(),
                    "decoder deferred a command without unscheduling"
                );
                if self.core.is_scheduled() {
                    error!(
                        get_offset = parser.get(),
                        "Decoder deferred a command without unscheduling"
                    );
                }
                break;
            }

            self.command_buffer.set_get_offset(parser.get());

            if let CommandOutcome::Fatal(error) = outcome {
                let reason = self.decoder.borrow().context_lost_reason();
                warn!(%error, %reason, get_offset = parser.get(), "Fatal command error");
                self.command_buffer.set_context_lost_reason(reason);
                self.command_buffer.set_parse_error(error);
                self.core.record(|s| {
                    s.parse_errors += 1;
                    if error == CommandError::LostContext {
                        s.context_losses += 1;
                    }
                });
                break;
            }

            self.core.record(|s| s.commands_processed += 1);
            if let Some(callback) = self.command_processed.as_mut() {
                callback();
            }

            if !self.core.is_scheduled() {
                break;
            }
        }

        let (context_lost, reason) = {
            let decoder = self.decoder.borrow();
            (decoder.was_context_lost(), decoder.context_lost_reason())
        };
        if !outcome.is_fatal() && context_lost {
            warn!(%reason, "Context lost");
            self.command_buffer.set_context_lost_reason(reason);
            self.command_buffer.set_parse_error(CommandError::LostContext);
            self.core.record(|s| s.context_losses += 1);
        }

        let elapsed = self.clock.now().saturating_duration_since(begin);
        let mut decoder = self.decoder.borrow_mut();
        decoder.end_decoding();
        decoder.add_processing_time(elapsed);
        trace!(
            get_offset = parser.get(),
            elapsed_us = elapsed.as_micros() as u64,
            "Drain finished"
        );
    }

    /// Bind transfer buffer `id` as the ring buffer. Returns false if no
    /// such buffer exists.
    pub fn bind_transfer_buffer(&mut self, id: i32) -> bool {
        self.try_bind_transfer_buffer(id).is_ok()
    }

    /// Bind transfer buffer `id` as the ring buffer, creating the parser on
    /// first use. Both cursors restart at 0.
    pub fn try_bind_transfer_buffer(&mut self, id: i32) -> Result<()> {
        let buffer = self
            .command_buffer
            .transfer_buffer(id)
            .ok_or(Error::UnknownTransferBuffer(id))?;
        let entries = buffer.len();
        self.parser
            .get_or_insert_with(CommandParser::new)
            .set_buffer(buffer, 0, entries);
        self.command_buffer.set_get_offset(0);
        info!(id, entries, "Ring buffer bound");
        Ok(())
    }

    /// Move the consumer cursor. Returns false if out of range or no ring
    /// buffer is bound.
    pub fn set_get_offset(&mut self, offset: i32) -> bool {
        self.try_set_get_offset(offset).is_ok()
    }

    pub fn try_set_get_offset(&mut self, offset: i32) -> Result<()> {
        let parser = self.parser.as_mut().ok_or(Error::NoRingBuffer)?;
        if !parser.set_get(offset) {
            return Err(Error::InvalidGetOffset {
                offset,
                entry_count: parser.entry_count(),
            });
        }
        self.command_buffer.set_get_offset(parser.get());
        Ok(())
    }

    /// Current consumer cursor, if a ring buffer is bound.
    #[must_use]
    pub fn get_offset(&self) -> Option<i32> {
        self.parser.as_ref().map(CommandParser::get)
    }

    pub fn set_token(&self, token: i32) {
        self.command_buffer.set_token(token);
    }

    #[must_use]
    pub fn transfer_buffer(&self, id: i32) -> Option<TransferBuffer> {
        self.command_buffer.transfer_buffer(id)
    }

    pub fn set_scheduled(&self, scheduled: bool) {
        self.core.set_scheduled(scheduled);
    }

    #[must_use]
    pub fn is_scheduled(&self) -> bool {
        self.core.is_scheduled()
    }

    /// Run `task` once the GPU passes the current point; unscheduled until then.
    pub fn defer_to_fence(&self, task: impl FnOnce() + 'static) {
        self.core.defer_to_fence(Box::new(task));
    }

    /// Retire completed (or timed out) fences. True once none are pending.
    pub fn poll_unschedule_fences(&self) -> bool {
        self.core.poll_unschedule_fences()
    }

    /// Whether the owner should keep calling back in: fences pending,
    /// queries outstanding, or idle work available.
    ///
    /// Advances the decoder's pending queries as a side effect.
    pub fn has_more_work(&self) -> bool {
        self.core.pending_fences() > 0 || self.process_pending_queries() || self.has_more_idle_work()
    }

    pub fn process_pending_queries(&self) -> bool {
        self.decoder.borrow_mut().process_pending_queries()
    }

    #[must_use]
    pub fn has_more_idle_work(&self) -> bool {
        self.decoder.borrow().has_more_idle_work()
    }

    pub fn perform_idle_work(&self) {
        self.decoder.borrow_mut().perform_idle_work();
    }

    /// Reads the shared preemption flag, tracing on/off transitions.
    pub fn is_preempted(&mut self) -> bool {
        let Some(flag) = &self.preemption_flag else {
            return false;
        };
        let preempted = flag.is_set();
        if preempted != self.was_preempted {
            self.was_preempted = preempted;
            if preempted {
                self.core.record(|s| s.preemptions += 1);
                debug!("Preempted");
            } else {
                debug!("Preemption cleared");
            }
        }
        preempted
    }

    /// Attach or detach the shared preemption flag.
    pub fn set_preemption_flag(&mut self, flag: Option<Arc<PreemptionFlag>>) {
        self.preemption_flag = flag;
        self.was_preempted = false;
    }

    /// Observer of scheduled/unscheduled edges. Replaces any previous one.
    pub fn set_scheduling_changed_callback(&self, callback: impl Fn(bool) + 'static) {
        self.core
            .set_scheduling_changed_callback(Some(Rc::new(callback)));
    }

    pub fn clear_scheduling_changed_callback(&self) {
        self.core.set_scheduling_changed_callback(None);
    }

    /// Called after each processed command. Replaces any previous one.
    pub fn set_command_processed_callback(&mut self, callback: impl FnMut() + 'static) {
        self.command_processed = Some(Box::new(callback));
    }

    /// Handle for decoders that need to defer work from inside `do_command`.
    #[must_use]
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle::new(Rc::clone(&self.core))
    }

    /// Fire the liveness deadline if due. True if a forced reschedule ran.
    pub fn run_due_timers(&self) -> bool {
        self.core.run_due_timers()
    }

    /// Next liveness deadline, if one is armed.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.core.next_deadline()
    }

    #[must_use]
    pub fn unscheduled_count(&self) -> u32 {
        self.core.unscheduled_count()
    }

    #[must_use]
    pub fn rescheduled_count(&self) -> u32 {
        self.core.rescheduled_count()
    }

    #[must_use]
    pub fn pending_fences(&self) -> usize {
        self.core.pending_fences()
    }

    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        self.core.stats()
    }

    /// Stats as a JSON object.
    pub fn stats_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.stats())?)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.core.set_scheduling_changed_callback(None);
        let dropped = self.core.discard_pending();
        if dropped > 0 {
            warn!(
                pending_fences = dropped,
                "Scheduler dropped with pending fence tasks; they will not run"
            );
        }
    }
}
