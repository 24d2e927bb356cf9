//! Command parser: walks the ring buffer one command at a time.
//!
//! Each command starts with a 32-bit header:
//!
//! ```text
//!  31           21 20                    0
//! ┌───────────────┬───────────────────────┐
//! │ command (11)  │ size in entries (21)  │
//! └───────────────┴───────────────────────┘
//! ```
//!
//! `size` counts the header itself, so a command with no arguments has
//! size 1. The parser never interprets arguments; it hands
//! `(command, args)` to a [`CommandDecoder`].

use serde::{Deserialize, Serialize};

use crate::command_buffer::{CommandBufferEntry, TransferBuffer};
use crate::decoder::CommandDecoder;
use crate::error::CommandError;

const SIZE_BITS: u32 = 21;
const SIZE_MASK: u32 = (1 << SIZE_BITS) - 1;
const COMMAND_MASK: u32 = (1 << (32 - SIZE_BITS)) - 1;

/// Largest encodable command size, in entries.
pub const MAX_COMMAND_SIZE: u32 = SIZE_MASK;
/// Largest encodable command id.
pub const MAX_COMMAND_ID: u32 = COMMAND_MASK;

/// Decoded command header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    pub command: u32,
    pub size: u32,
}

impl CommandHeader {
    #[must_use]
    pub const fn new(command: u32, size: u32) -> Self {
        Self { command, size }
    }

    /// Pack into one entry. Out-of-range fields are truncated.
    #[must_use]
    pub const fn encode(self) -> CommandBufferEntry {
        (self.size & SIZE_MASK) | ((self.command & COMMAND_MASK) << SIZE_BITS)
    }

    #[must_use]
    pub const fn decode(entry: CommandBufferEntry) -> Self {
        Self {
            command: entry >> SIZE_BITS,
            size: entry & SIZE_MASK,
        }
    }
}

/// Result of executing one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "error", rename_all = "snake_case")]
pub enum CommandOutcome {
    /// The command ran; move on to the next one.
    Ok,
    /// The command cannot run yet. The cursor stays on it and the decoder
    /// has registered a reason to unschedule.
    DeferUntilLater,
    /// The buffer is unusable from here on.
    Fatal(CommandError),
}

impl CommandOutcome {
    #[must_use]
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Cursor over a bound ring buffer.
#[derive(Debug, Default)]
pub struct CommandParser {
    buffer: TransferBuffer,
    base: usize,
    entry_count: i32,
    get: i32,
    put: i32,
    error_count: u32,
    args: Vec<CommandBufferEntry>,
}

impl CommandParser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Point the parser at `size` entries of `buffer` starting at `offset`.
    ///
    /// Both cursors reset to 0. The window is clamped to the buffer.
    pub fn set_buffer(&mut self, buffer: TransferBuffer, offset: usize, size: usize) {
        let available = buffer.len().saturating_sub(offset);
        let size = size.min(available);
        self.buffer = buffer;
        self.base = offset;
        self.entry_count = i32::try_from(size).unwrap_or(i32::MAX);
        self.get = 0;
        self.put = 0;
    }

    #[must_use]
    pub fn get(&self) -> i32 {
        self.get
    }

    #[must_use]
    pub fn put(&self) -> i32 {
        self.put
    }

    #[must_use]
    pub fn entry_count(&self) -> i32 {
        self.entry_count
    }

    /// Number of fatal results seen since construction.
    #[must_use]
    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    /// Move the consumer cursor. Rejects offsets outside `0..entry_count`.
    pub fn set_get(&mut self, get: i32) -> bool {
        if (0..self.entry_count).contains(&get) {
            self.get = get;
            true
        } else {
            false
        }
    }

    pub fn set_put(&mut self, put: i32) {
        self.put = put;
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.get == self.put
    }

    /// Decode and execute the command under the cursor.
    pub fn process_command(&mut self, decoder: &mut dyn CommandDecoder) -> CommandOutcome {
        let get = self.get;
        if get == self.put {
            return CommandOutcome::Ok;
        }

        let Some(entry) = usize::try_from(get)
            .ok()
            .filter(|_| get < self.entry_count)
            .and_then(|g| self.buffer.read(self.base + g))
        else {
            self.error_count += 1;
            return CommandOutcome::Fatal(CommandError::OutOfBounds);
        };

        let header = CommandHeader::decode(entry);
        if header.size == 0 {
            tracing::debug!(get_offset = get, "Zero sized command in command buffer");
            self.error_count += 1;
            return CommandOutcome::Fatal(CommandError::InvalidSize);
        }
        let size = header.size as i32;
        // A command may not run past the end of the buffer, nor past put
        // when put is ahead of us.
        let available = if self.put >= get {
            self.put - get
        } else {
            self.entry_count - get
        };
        if size > available {
            tracing::debug!(
                get_offset = get,
                put_offset = self.put,
                size,
                entry_count = self.entry_count,
                "Command runs past the available entries"
            );
            self.error_count += 1;
            return CommandOutcome::Fatal(CommandError::OutOfBounds);
        }

        let args_start = self.base + get as usize + 1;
        let arg_count = header.size as usize - 1;
        if !self.buffer.read_into(args_start, arg_count, &mut self.args) {
            self.error_count += 1;
            return CommandOutcome::Fatal(CommandError::OutOfBounds);
        }

        let outcome = decoder.do_command(header.command, &self.args);
        if outcome.is_fatal() {
            self.error_count += 1;
        }
        if outcome != CommandOutcome::DeferUntilLater {
            self.get = (get + size) % self.entry_count;
        }
        outcome
    }
}
