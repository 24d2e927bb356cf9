#![no_main]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use gpusched_core::clock::ManualClock;
use gpusched_core::command_buffer::{CommandBuffer, CommandBufferService, TransferBuffer};
use gpusched_core::config::{LivenessMode, SchedulerConfig};
use gpusched_core::decoder::CommandDecoder;
use gpusched_core::error::CommandError;
use gpusched_core::fence::ManualGpuSync;
use gpusched_core::parser::CommandOutcome;
use gpusched_core::preemption::PreemptionFlag;
use gpusched_core::scheduler::Scheduler;
use gpusched_core::scheduling::SchedulerHandle;
use libfuzzer_sys::fuzz_target;

const RING_ENTRIES: usize = 64;

/// Decoder whose behavior for each command comes from the fuzz input.
#[derive(Default)]
struct FuzzDecoder {
    handle: Option<SchedulerHandle>,
    outcomes: VecDeque<u8>,
    context_lost: bool,
}

impl CommandDecoder for FuzzDecoder {
    fn do_command(&mut self, _command: u32, _args: &[u32]) -> CommandOutcome {
        match self.outcomes.pop_front().unwrap_or(0) % 16 {
            0..=11 => CommandOutcome::Ok,
            12 | 13 => {
                if let Some(handle) = &self.handle {
                    handle.defer_to_fence(|| {});
                }
                CommandOutcome::DeferUntilLater
            }
            14 => CommandOutcome::Fatal(CommandError::InvalidArguments),
            _ => {
                self.context_lost = true;
                CommandOutcome::Ok
            }
        }
    }

    fn was_context_lost(&self) -> bool {
        self.context_lost
    }
}

fn write_commands(ring: &TransferBuffer, put: &mut usize, count: u8, arg_bits: u8) {
    for i in 0..count {
        let args = vec![u32::from(i); usize::from((arg_bits >> (i % 4)) & 3)];
        // No padding command exists to skip the tail, so stop at the end.
        if *put + args.len() + 1 > RING_ENTRIES {
            return;
        }
        if let Some(next) = ring.write_command(*put, u32::from(i), &args) {
            *put = next % RING_ENTRIES;
        }
    }
}

fuzz_target!(|data: &[u8]| {
    if data.len() > 16_384 || data.is_empty() {
        return;
    }

    let liveness = if data[0] & 1 == 0 {
        LivenessMode::Disabled
    } else {
        LivenessMode::ForcedReschedule
    };
    let config = SchedulerConfig {
        liveness,
        fence_timeout_ms: 100,
        reschedule_timeout_ms: 20,
        ..SchedulerConfig::default()
    };
    let sync = if data[0] & 2 == 0 {
        ManualGpuSync::new()
    } else {
        ManualGpuSync::without_fences()
    };

    let service = Rc::new(CommandBufferService::new());
    let (id, ring) = service.create_transfer_buffer(RING_ENTRIES);
    let decoder = Rc::new(RefCell::new(FuzzDecoder::default()));
    let sync = Rc::new(sync);
    let clock = Rc::new(ManualClock::new());
    let flag = Arc::new(PreemptionFlag::new());
    let mut scheduler = Scheduler::builder(service.clone(), decoder.clone())
        .gpu_sync(sync.clone())
        .clock(clock.clone())
        .preemption_flag(Arc::clone(&flag))
        .config(config)
        .build();
    decoder.borrow_mut().handle = Some(scheduler.handle());
    assert!(scheduler.bind_transfer_buffer(id));

    let mut put = 0usize;
    let mut external = 0u32;
    let mut parser_calls_after_error = None;

    for chunk in data[1..].chunks(3) {
        let [op, a, b] = match chunk {
            [op, a, b] => [*op, *a, *b],
            _ => break,
        };

        match op % 9 {
            0 => {
                write_commands(&ring, &mut put, a % 8, b);
                decoder.borrow_mut().outcomes.extend([a, b, a ^ b, b.rotate_left(3)]);
                // Occasionally publish a put outside the ring.
                let published = match a >> 6 {
                    3 if b & 1 == 0 => -1 - i32::from(b >> 1),
                    3 => RING_ENTRIES as i32 + i32::from(b >> 1),
                    _ => put as i32,
                };
                service.flush(published);
            }
            1 => scheduler.notify_producer_offset_changed(),
            2 => {
                scheduler.set_scheduled(false);
                external += 1;
            }
            3 => {
                if external > 0 {
                    scheduler.set_scheduled(true);
                    external -= 1;
                }
            }
            4 => {
                sync.signal(usize::from(a));
            }
            5 => clock.advance(Duration::from_millis(u64::from(a))),
            6 => {
                scheduler.poll_unschedule_fences();
            }
            7 => {
                scheduler.run_due_timers();
            }
            _ => {
                if a & 1 == 0 {
                    flag.reset();
                } else {
                    flag.set();
                }
            }
        }

        let state = service.state();
        assert!((0..RING_ENTRIES as i32).contains(&state.get_offset));
        assert_eq!(
            scheduler.unscheduled_count() + scheduler.rescheduled_count(),
            external + scheduler.pending_fences() as u32,
            "scheduling counters drifted from outstanding reasons"
        );
        assert_eq!(scheduler.is_scheduled(), scheduler.unscheduled_count() == 0);
        if liveness == LivenessMode::Disabled {
            assert_eq!(scheduler.rescheduled_count(), 0);
        }

        if state.error.is_some() {
            let stats = scheduler.stats();
            let calls = stats.commands_processed + stats.commands_deferred + stats.parse_errors;
            match parser_calls_after_error {
                None => parser_calls_after_error = Some(calls),
                Some(before) => assert_eq!(before, calls, "parser ran after error was latched"),
            }
        }
    }
});
