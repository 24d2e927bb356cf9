//! Shared ring buffer state and transfer buffers.
//!
//! The [`CommandBuffer`] trait is the scheduler's view of the state it shares
//! with the producer: the producer advances `put_offset`, the scheduler
//! advances `get_offset`, and fatal conditions are latched in the error slot
//! where the producer side can see them.
//!
//! [`CommandBufferService`] is an in-process implementation. Everything is
//! single-threaded, so interior mutability uses `Cell`/`RefCell`.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::error::{CommandError, ContextLostReason};
use crate::parser::CommandHeader;

/// One 32-bit word of the ring buffer.
pub type CommandBufferEntry = u32;

/// Snapshot of the shared ring buffer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommandBufferState {
    /// Consumer cursor, in entries.
    pub get_offset: i32,
    /// Producer cursor, in entries.
    pub put_offset: i32,
    /// Last token written by a `set_token` command.
    pub token: i32,
    /// Latched fatal error, `None` while the buffer is healthy.
    pub error: Option<CommandError>,
    pub context_lost_reason: ContextLostReason,
    /// Bumped on every state change so pollers can detect progress.
    pub generation: u32,
}

/// Shared-memory region holding command buffer entries.
///
/// Cloning yields another handle to the same memory.
#[derive(Debug, Clone, Default)]
pub struct TransferBuffer {
    entries: Rc<RefCell<Vec<CommandBufferEntry>>>,
}

impl TransferBuffer {
    /// Allocate a zeroed buffer of `len` entries.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            entries: Rc::new(RefCell::new(vec![0; len])),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Read one entry; `None` past the end.
    #[must_use]
    pub fn read(&self, index: usize) -> Option<CommandBufferEntry> {
        self.entries.borrow().get(index).copied()
    }

    /// Copy `len` entries starting at `start` into `out`, replacing its
    /// contents. Returns false if the range is out of bounds.
    pub fn read_into(&self, start: usize, len: usize, out: &mut Vec<CommandBufferEntry>) -> bool {
        out.clear();
        let entries = self.entries.borrow();
        match entries.get(start..start.saturating_add(len)) {
            Some(slice) => {
                out.extend_from_slice(slice);
                true
            }
            None => false,
        }
    }

    /// Write raw entries at `offset`. Returns false if they would not fit.
    pub fn write(&self, offset: usize, data: &[CommandBufferEntry]) -> bool {
        let mut entries = self.entries.borrow_mut();
        match entries.get_mut(offset..offset.saturating_add(data.len())) {
            Some(dst) => {
                dst.copy_from_slice(data);
                true
            }
            None => false,
        }
    }

    /// Encode a command (header plus `args`) at `offset`.
    ///
    /// Returns the offset just past the command, or `None` if it does not fit.
    pub fn write_command(&self, offset: usize, command: u32, args: &[u32]) -> Option<usize> {
        let size = u32::try_from(args.len() + 1).ok()?;
        let header = CommandHeader::new(command, size).encode();
        let mut words = Vec::with_capacity(args.len() + 1);
        words.push(header);
        words.extend_from_slice(args);
        self.write(offset, &words)
            .then_some(offset + words.len())
    }
}

/// The scheduler's view of the shared ring buffer.
///
/// Methods take `&self`: the state is shared with the producer and the
/// scheduler only holds a reference to it.
pub trait CommandBuffer {
    fn state(&self) -> CommandBufferState;
    fn set_get_offset(&self, offset: i32);
    fn set_token(&self, token: i32);
    /// Latch a fatal error. The first latched error wins.
    fn set_parse_error(&self, error: CommandError);
    fn set_context_lost_reason(&self, reason: ContextLostReason);
    fn transfer_buffer(&self, id: i32) -> Option<TransferBuffer>;
}

/// In-process command buffer with a transfer buffer registry.
#[derive(Debug, Default)]
pub struct CommandBufferService {
    state: Cell<CommandBufferState>,
    buffers: RefCell<HashMap<i32, TransferBuffer>>,
    next_id: Cell<i32>,
}

impl CommandBufferService {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, f: impl FnOnce(&mut CommandBufferState)) {
        let mut state = self.state.get();
        f(&mut state);
        state.generation = state.generation.wrapping_add(1);
        self.state.set(state);
    }

    /// Allocate and register a new transfer buffer of `entries` entries.
    pub fn create_transfer_buffer(&self, entries: usize) -> (i32, TransferBuffer) {
        let mut buffers = self.buffers.borrow_mut();
        let mut id = self.next_id.get();
        while buffers.contains_key(&id) {
            id += 1;
        }
        self.next_id.set(id + 1);
        let buffer = TransferBuffer::new(entries);
        buffers.insert(id, buffer.clone());
        (id, buffer)
    }

    /// Register an existing buffer under `id`. Fails for negative or taken ids.
    pub fn register_transfer_buffer(&self, id: i32, buffer: TransferBuffer) -> bool {
        if id < 0 {
            return false;
        }
        let mut buffers = self.buffers.borrow_mut();
        if buffers.contains_key(&id) {
            return false;
        }
        buffers.insert(id, buffer);
        true
    }

    pub fn destroy_transfer_buffer(&self, id: i32) {
        self.buffers.borrow_mut().remove(&id);
    }

    /// Producer side: publish a new put offset.
    ///
    /// A negative offset is never valid and latches `OutOfBounds` instead of
    /// moving put. The upper bound depends on the bound ring buffer and is
    /// checked by the scheduler. The owner is expected to notify the
    /// scheduler afterwards.
    pub fn flush(&self, put_offset: i32) {
        if put_offset < 0 {
            tracing::warn!(put_offset, "Negative put offset");
            self.set_parse_error(CommandError::OutOfBounds);
            return;
        }
        self.update(|s| s.put_offset = put_offset);
    }
}

impl CommandBuffer for CommandBufferService {
    fn state(&self) -> CommandBufferState {
        self.state.get()
    }

    fn set_get_offset(&self, offset: i32) {
        self.update(|s| s.get_offset = offset);
    }

    fn set_token(&self, token: i32) {
        self.update(|s| s.token = token);
    }

    fn set_parse_error(&self, error: CommandError) {
        if self.state.get().error.is_none() {
            self.update(|s| s.error = Some(error));
        }
    }

    fn set_context_lost_reason(&self, reason: ContextLostReason) {
        self.update(|s| s.context_lost_reason = reason);
    }

    fn transfer_buffer(&self, id: i32) -> Option<TransferBuffer> {
        self.buffers.borrow().get(&id).cloned()
    }
}
