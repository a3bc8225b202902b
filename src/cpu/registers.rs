//! uCISC processor registers.
//!
//! - pc: current instruction address, `next` is where execution goes after
//!   the current instruction retires
//! - r1-r6: general registers; r1-r3 address local memory, r4-r6 the bus
//! - flags: zero, negative, carry, overflow, error, interrupt pending and
//!   the signed arithmetic mode bit
//! - overflow: wide part of the last arithmetic or shift result
//!
//! The interrupt handler address lives in the device control block
//! (slot 5), not here.

use std::fmt;

use serde::{Serialize, Deserialize};

use crate::device::{DeviceBehavior, DeviceType, Memory};

/// The flags register.
#[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Flags(u16);

impl Flags {
    pub const ZERO: u16 = 0x0001;
    pub const NEGATIVE: u16 = 0x0002;
    pub const CARRY: u16 = 0x0004;
    pub const OVERFLOW: u16 = 0x0008;
    pub const ERROR: u16 = 0x0010;
    pub const INTERRUPT: u16 = 0x0020;
    /// Arithmetic and right shifts treat operands as two's complement.
    pub const SIGNED: u16 = 0x0100;

    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    #[inline]
    pub const fn contains(self, mask: u16) -> bool {
        self.0 & mask == mask
    }

    /// Copy of these flags with `mask` set or cleared.
    #[inline]
    pub const fn with(self, mask: u16, on: bool) -> Self {
        if on {
            Self(self.0 | mask)
        } else {
            Self(self.0 & !mask)
        }
    }

    pub fn set(&mut self, mask: u16, on: bool) {
        *self = self.with(mask, on);
    }

    pub const fn zero(self) -> bool {
        self.contains(Self::ZERO)
    }

    pub const fn negative(self) -> bool {
        self.contains(Self::NEGATIVE)
    }

    pub const fn carry(self) -> bool {
        self.contains(Self::CARRY)
    }

    pub const fn overflow(self) -> bool {
        self.contains(Self::OVERFLOW)
    }

    pub const fn error(self) -> bool {
        self.contains(Self::ERROR)
    }

    pub const fn interrupt_pending(self) -> bool {
        self.contains(Self::INTERRUPT)
    }

    pub const fn signed(self) -> bool {
        self.contains(Self::SIGNED)
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bit = |on: bool, c: char| if on { c } else { '-' };
        write!(
            f,
            "{}{}{}{}{}{}{} ({:#06x})",
            bit(self.signed(), 'S'),
            bit(self.interrupt_pending(), 'I'),
            bit(self.error(), 'E'),
            bit(self.overflow(), 'O'),
            bit(self.carry(), 'C'),
            bit(self.negative(), 'N'),
            bit(self.zero(), 'Z'),
            self.0
        )
    }
}

/// Number of general registers.
pub const GENERAL_REGISTERS: usize = 6;

/// The uCISC register file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registers {
    pc: u16,
    next: u16,
    general: [u16; GENERAL_REGISTERS],
    /// Status flags.
    pub flags: Flags,
    /// Carry, high word, remainder or shifted-out bits of the last operation.
    pub overflow: u16,
    /// Control address of the device with a pending interrupt, 0 if none.
    pending_interrupt: u16,
}

impl Registers {
    /// Reset state: everything zero, signed mode on.
    pub fn new() -> Self {
        Self {
            pc: 0,
            next: 2,
            general: [0; GENERAL_REGISTERS],
            flags: Flags::from_bits(Flags::SIGNED),
            overflow: 0,
            pending_interrupt: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn pc(&self) -> u16 {
        self.pc
    }

    /// Set the pc; the fall-through address follows it.
    pub fn set_pc(&mut self, pc: u16) {
        self.pc = pc;
        self.next = pc.wrapping_add(2);
    }

    pub fn next(&self) -> u16 {
        self.next
    }

    /// Override where execution continues after this instruction.
    pub fn set_next(&mut self, next: u16) {
        self.next = next;
    }

    /// Move to the next instruction.
    pub fn retire(&mut self) {
        self.set_pc(self.next);
    }

    /// Read general register `n` (1-6).
    ///
    /// # Panics
    /// Panics if `n` is not a register number.
    #[inline]
    pub fn get(&self, n: u8) -> u16 {
        assert!((1..=6).contains(&n), "register r{} does not exist", n);
        self.general[usize::from(n - 1)]
    }

    /// Write general register `n` (1-6).
    ///
    /// # Panics
    /// Panics if `n` is not a register number.
    #[inline]
    pub fn set(&mut self, n: u8, value: u16) {
        assert!((1..=6).contains(&n), "register r{} does not exist", n);
        self.general[usize::from(n - 1)] = value;
    }

    pub fn pending_interrupt(&self) -> u16 {
        self.pending_interrupt
    }

    /// Record an interrupt from the device whose control block starts at
    /// `pointer` and raise the interrupt-pending flag.
    pub fn raise_interrupt(&mut self, pointer: u16) {
        self.pending_interrupt = pointer;
        self.flags.set(Flags::INTERRUPT, true);
    }

    /// Clear the pending interrupt.
    pub fn acknowledge_interrupt(&mut self) {
        self.pending_interrupt = 0;
        self.flags.set(Flags::INTERRUPT, false);
    }
}

impl Default for Registers {
    fn default() -> Self {
        Self::new()
    }
}

/// Processor introspection slots, usable by the processor itself and by
/// its init device while it is halted:
///
/// - 0x6 - max local memory block (MSB)
/// - 0x7 - pending interrupt pointer (write acknowledges)
/// - 0x8 - pc
/// - 0x9 to 0xE - r1 to r6
/// - 0xF - flags
impl DeviceBehavior for Registers {
    fn device_type(&self) -> DeviceType {
        DeviceType::Processor
    }

    fn executes_code(&self) -> bool {
        true
    }

    fn read_control(&mut self, slot: u8, memory: &Memory, _peek: bool) -> u16 {
        match slot {
            6 => (memory.len().saturating_sub(1) & 0xFF00) as u16,
            7 => self.pending_interrupt,
            8 => self.pc,
            9..=14 => self.get(slot - 8),
            15 => self.flags.bits(),
            _ => 0,
        }
    }

    fn write_control(&mut self, slot: u8, value: u16, _memory: &mut Memory) {
        match slot {
            7 => self.acknowledge_interrupt(),
            8 => self.set_pc(value),
            9..=14 => self.set(slot - 8, value),
            15 => self.flags = Flags::from_bits(value),
            _ => {}
        }
    }
}
