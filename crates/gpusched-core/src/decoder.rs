//! The command decoder capability.
//!
//! A decoder executes one command at a time on behalf of the parser and
//! answers the handful of questions the scheduler needs for idle work and
//! context-loss handling. Concrete decoders (a graphics API interpreter, a
//! replay tool, a test double) live outside this crate.
//!
//! A decoder that must wait for the GPU before a command may complete keeps
//! a [`SchedulerHandle`](crate::scheduling::SchedulerHandle) and calls
//! `defer_to_fence` from inside [`CommandDecoder::do_command`].

use std::time::Duration;

use crate::error::ContextLostReason;
use crate::parser::CommandOutcome;

pub trait CommandDecoder {
    /// Execute one command. `args` excludes the header.
    fn do_command(&mut self, command: u32, args: &[u32]) -> CommandOutcome;

    /// Called before a batch of commands is processed.
    fn begin_decoding(&mut self) {}

    /// Called after a batch of commands is processed.
    fn end_decoding(&mut self) {}

    /// Advance asynchronous queries. Returns true while some are still pending.
    fn process_pending_queries(&mut self) -> bool {
        false
    }

    fn has_more_idle_work(&self) -> bool {
        false
    }

    fn perform_idle_work(&mut self) {}

    fn was_context_lost(&self) -> bool {
        false
    }

    fn context_lost_reason(&self) -> ContextLostReason {
        ContextLostReason::Unknown
    }

    /// Diagnostics: time spent inside one drain of the ring buffer.
    fn add_processing_time(&mut self, _elapsed: Duration) {}
}
