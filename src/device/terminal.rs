//! Terminal writer: prints a ring buffer held in its own 256-word memory.
//!
//! The controlling processor maps block 0, writes text two bytes per word
//! (high byte first) and then moves the buffer end pointer. Each tick the
//! terminal drains everything between start and end.

use std::sync::{Arc, Mutex};

use tracing::warn;

use super::{DeviceBehavior, DeviceType, Memory};

/// Terminal memory is a single 256-word block.
pub const TERMINAL_ADDRESS_WIDTH: u8 = 8;

const BUFFER_START: u8 = 6;
const BUFFER_END: u8 = 7;

/// Host side of a terminal: collects everything printed.
#[derive(Debug, Clone, Default)]
pub struct TerminalOutput {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl TerminalOutput {
    /// Take everything printed since the last call.
    pub fn take(&self) -> Vec<u8> {
        let mut bytes = self.bytes.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::take(&mut *bytes)
    }

    fn extend(&self, chunk: &[u8]) {
        self.bytes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend_from_slice(chunk);
    }
}

#[derive(Debug)]
pub struct TerminalWriter {
    buffer_start: u8,
    buffer_end: u8,
    output: TerminalOutput,
}

impl TerminalWriter {
    pub fn new() -> (Self, TerminalOutput) {
        let output = TerminalOutput::default();
        let writer = Self {
            buffer_start: 0,
            buffer_end: 0,
            output: output.clone(),
        };
        (writer, output)
    }
}

impl DeviceBehavior for TerminalWriter {
    fn device_type(&self) -> DeviceType {
        DeviceType::Terminal
    }

    fn read_control(&mut self, slot: u8, _memory: &Memory, _peek: bool) -> u16 {
        match slot {
            BUFFER_START => u16::from(self.buffer_start),
            BUFFER_END => u16::from(self.buffer_end),
            _ => 0,
        }
    }

    fn write_control(&mut self, slot: u8, value: u16, _memory: &mut Memory) {
        match slot {
            BUFFER_START => self.buffer_start = (value & 0xFF) as u8,
            BUFFER_END => self.buffer_end = (value & 0xFF) as u8,
            _ => {}
        }
    }

    fn tick(&mut self, _nanos: u64, memory: &Memory) {
        if memory.is_empty() {
            if self.buffer_start != self.buffer_end {
                warn!("terminal has no memory to print from");
                self.buffer_start = self.buffer_end;
            }
            return;
        }

        let mut chunk = Vec::new();
        while self.buffer_start != self.buffer_end {
            let [high, low] = memory.read(u16::from(self.buffer_start)).to_be_bytes();
            chunk.extend([high, low].into_iter().filter(|byte| *byte != 0));
            self.buffer_start = self.buffer_start.wrapping_add(1);
        }
        if !chunk.is_empty() {
            self.output.extend(&chunk);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prints_between_start_and_end() {
        let mut mem = Memory::new(TERMINAL_ADDRESS_WIDTH).unwrap();
        mem.write(0, u16::from_be_bytes(*b"He"));
        mem.write(1, u16::from_be_bytes(*b"ll"));
        mem.write(2, u16::from_be_bytes([b'o', 0]));

        let (mut term, output) = TerminalWriter::new();
        term.write_control(BUFFER_END, 3, &mut mem);
        term.tick(0, &mem);

        assert_eq!(output.take(), b"Hello".to_vec());
        assert_eq!(term.read_control(BUFFER_START, &mem, false), 3);
        assert!(output.take().is_empty());
    }

    #[test]
    fn test_buffer_wraps() {
        let mut mem = Memory::new(TERMINAL_ADDRESS_WIDTH).unwrap();
        mem.write(255, u16::from_be_bytes(*b"ab"));
        mem.write(0, u16::from_be_bytes(*b"cd"));

        let (mut term, output) = TerminalWriter::new();
        term.write_control(BUFFER_START, 255, &mut mem);
        term.write_control(BUFFER_END, 1, &mut mem);
        term.tick(0, &mem);

        assert_eq!(output.take(), b"abcd".to_vec());
    }
}
