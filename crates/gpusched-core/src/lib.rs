//! gpusched-core: cooperative GPU command scheduling
//!
//! This crate drains a ring buffer of encoded commands, written by a producer
//! on one side of a shared-memory channel, through a pluggable decoder on the
//! GPU service side. It gates progress on GPU fences, yields to a
//! higher-priority scheduler through a shared preemption flag, and latches
//! fatal parse errors and context loss where the producer can see them.
//!
//! # Architecture
//!
//! ```text
//! Producer ──put──► CommandBuffer ◄──get── Scheduler ──► CommandParser ──► CommandDecoder
//!                                             │                               │
//!                                             ▼                               │
//!                                     SchedulingCore ◄── SchedulerHandle ◄────┘
//!                                     (counters, fence queue, liveness)
//! ```
//!
//! # Modules
//!
//! - `scheduler`: the drain loop and owner-facing operations
//! - `scheduling`: scheduled/unscheduled state machine and fence queue
//! - `parser`: command header decoding and cursor management
//! - `command_buffer`: shared ring buffer state and transfer buffers
//! - `decoder`: the command decoder capability
//! - `fence`: GPU fences and the full-sync fallback
//! - `liveness`: forced-reschedule policies
//! - `preemption`: cross-scheduler preemption flag
//! - `clock`: injectable time source
//! - `service`: async driver loop (tokio)
//! - `config`: Configuration management
//! - `logging`: tracing subscriber setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod clock;
pub mod command_buffer;
pub mod config;
pub mod decoder;
pub mod error;
pub mod fence;
pub mod liveness;
pub mod logging;
pub mod parser;
pub mod preemption;
pub mod scheduler;
pub mod scheduling;
pub mod service;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
