//! The uCISC arithmetic logic unit.
//!
//! [`compute`] is a pure function of the opcode, both operands, the flags
//! and the overflow register. Flag rules by group:
//!
//! - copy: nothing changes
//! - every other op: zero, negative, carry, overflow
//! - shifts: overflow register gets shifted-out bits
//! - add, sub, mul: overflow register gets the high word; overflow flag on
//!   out-of-range results
//! - div: remainder in the overflow register, error on divide by zero
//!
//! Carry always mirrors bit 0 of the new overflow register. The overflow
//! flag is only ever raised by arithmetic; other ops clear it.

use serde::{Serialize, Deserialize};

use crate::cpu::registers::Flags;

/// ALU operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AluOp {
    Copy,
    And,
    Or,
    Xor,
    Invert,
    ShiftLeft,
    ShiftRight,
    SwapBytes,
    HighByte,
    LowByte,
    Add,
    Subtract,
    Multiply,
    Divide,
    /// Start of the 4-word aligned page holding the source address.
    PageMask,
    /// Source masked by the overflow register.
    OverflowAnd,
}

impl AluOp {
    /// Decode the low nibble of `code`.
    pub fn from_code(code: u16) -> Self {
        match code & 0xF {
            0x0 => AluOp::Copy,
            0x1 => AluOp::And,
            0x2 => AluOp::Or,
            0x3 => AluOp::Xor,
            0x4 => AluOp::Invert,
            0x5 => AluOp::ShiftLeft,
            0x6 => AluOp::ShiftRight,
            0x7 => AluOp::SwapBytes,
            0x8 => AluOp::HighByte,
            0x9 => AluOp::LowByte,
            0xA => AluOp::Add,
            0xB => AluOp::Subtract,
            0xC => AluOp::Multiply,
            0xD => AluOp::Divide,
            0xE => AluOp::PageMask,
            _ => AluOp::OverflowAnd,
        }
    }

    pub fn code(self) -> u16 {
        match self {
            AluOp::Copy => 0x0,
            AluOp::And => 0x1,
            AluOp::Or => 0x2,
            AluOp::Xor => 0x3,
            AluOp::Invert => 0x4,
            AluOp::ShiftLeft => 0x5,
            AluOp::ShiftRight => 0x6,
            AluOp::SwapBytes => 0x7,
            AluOp::HighByte => 0x8,
            AluOp::LowByte => 0x9,
            AluOp::Add => 0xA,
            AluOp::Subtract => 0xB,
            AluOp::Multiply => 0xC,
            AluOp::Divide => 0xD,
            AluOp::PageMask => 0xE,
            AluOp::OverflowAnd => 0xF,
        }
    }

    /// Assembler mnemonic.
    pub fn mnemonic(self) -> &'static str {
        match self {
            AluOp::Copy => "copy",
            AluOp::And => "and",
            AluOp::Or => "or",
            AluOp::Xor => "xor",
            AluOp::Invert => "inv",
            AluOp::ShiftLeft => "shl",
            AluOp::ShiftRight => "shr",
            AluOp::SwapBytes => "swap",
            AluOp::HighByte => "msb",
            AluOp::LowByte => "lsb",
            AluOp::Add => "add",
            AluOp::Subtract => "sub",
            AluOp::Multiply => "mult",
            AluOp::Divide => "div",
            AluOp::PageMask => "page",
            AluOp::OverflowAnd => "oflw",
        }
    }
}

/// Result of one ALU operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AluOutput {
    pub value: u16,
    pub flags: Flags,
    pub overflow: u16,
}

/// Flags touched by each group.
const RESULT_FLAGS: u16 = Flags::ZERO | Flags::NEGATIVE;

/// Run `op` with `src` as the source and `dst` as the destination operand.
pub fn compute(op: AluOp, src: u16, dst: u16, flags: Flags, overflow: u16) -> AluOutput {
    let signed = flags.signed();
    let logic = |value: u16| AluOutput {
        value,
        flags: fresh_flags(flags, value, overflow),
        overflow,
    };

    match op {
        AluOp::Copy => AluOutput { value: src, flags, overflow },

        // ==================== Bit and byte ops ====================

        AluOp::And => logic(src & dst),
        AluOp::Or => logic(src | dst),
        AluOp::Xor => logic(src ^ dst),
        AluOp::Invert => logic(!src),
        AluOp::SwapBytes => logic(src.swap_bytes()),
        AluOp::HighByte => logic(src & 0xFF00),
        AluOp::LowByte => logic(src & 0x00FF),
        AluOp::PageMask => logic(src & 0x0FFC),
        AluOp::OverflowAnd => logic(src & overflow),

        // ==================== Shifts ====================

        AluOp::ShiftLeft => {
            let wide = u64::from(dst) << u32::from(src).min(32);
            shifted(flags, wide as u16, (wide >> 16) as u16)
        }

        AluOp::ShiftRight => {
            // The low 16 bits of `wide` collect what falls off bit 0
            let amount = u32::from(src).min(32);
            let wide = if signed {
                (i64::from(dst as i16) << 16) >> amount
            } else {
                ((u64::from(dst) << 16) >> amount) as i64
            };
            shifted(flags, (wide >> 16) as u16, wide as u16)
        }

        // ==================== Arithmetic ====================

        AluOp::Add | AluOp::Subtract | AluOp::Multiply => {
            let (a, b) = (widen(dst, signed), widen(src, signed));
            let full = match op {
                AluOp::Add => a + b,
                AluOp::Subtract => a - b,
                _ => a * b,
            };
            let out_of_range = if signed {
                full < i64::from(i16::MIN) || full > i64::from(i16::MAX)
            } else {
                !(0..=0xFFFF).contains(&full)
            };
            arithmetic(flags, full, out_of_range)
        }

        AluOp::Divide => {
            if src == 0 {
                let flags = fresh_flags(flags, dst, overflow).with(Flags::ERROR, true);
                return AluOutput { value: dst, flags, overflow };
            }
            let (a, b) = (widen(dst, signed), widen(src, signed));
            let quotient = a / b;
            let out_of_range = signed && quotient > i64::from(i16::MAX);
            let mut out = arithmetic(flags, quotient, out_of_range);
            out.overflow = (a % b) as u16;
            out.flags = out.flags
                .with(Flags::CARRY, out.overflow & 1 == 1)
                .with(Flags::ERROR, false);
            out
        }
    }
}

fn widen(value: u16, signed: bool) -> i64 {
    if signed {
        i64::from(value as i16)
    } else {
        i64::from(value)
    }
}

fn result_flags(flags: Flags, value: u16) -> Flags {
    Flags::from_bits(flags.bits() & !RESULT_FLAGS)
        .with(Flags::ZERO, value == 0)
        .with(Flags::NEGATIVE, value & 0x8000 != 0)
}

/// Zero, negative and carry from this result; overflow cleared.
fn fresh_flags(flags: Flags, value: u16, overflow: u16) -> Flags {
    result_flags(flags, value)
        .with(Flags::CARRY, overflow & 1 == 1)
        .with(Flags::OVERFLOW, false)
}

fn shifted(flags: Flags, value: u16, overflow: u16) -> AluOutput {
    AluOutput {
        value,
        flags: fresh_flags(flags, value, overflow),
        overflow,
    }
}

fn arithmetic(flags: Flags, full: i64, out_of_range: bool) -> AluOutput {
    let value = full as u16;
    let overflow = (full >> 16) as u16;
    AluOutput {
        value,
        flags: fresh_flags(flags, value, overflow).with(Flags::OVERFLOW, out_of_range),
        overflow,
    }
}
