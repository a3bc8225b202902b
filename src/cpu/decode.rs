//! Instruction decoder for uCISC.
//!
//! Every instruction is two 16-bit words:
//!
//! ```text
//! word 1: SSSS DDDD I EEE AAAA   source, destination, increment, effect, alu
//! word 2: OOOO MMMM MMMM MMMM    memory-class destination: offset + 12-bit immediate
//!         MMMM MMMM MMMM MMMM    otherwise: 16-bit immediate
//! ```
//!
//! The 12-bit immediate is sign-extended unless the source is itself a
//! memory operand, in which case it is a plain positive displacement.

use std::fmt;

use serde::{Serialize, Deserialize};

use crate::cpu::alu::AluOp;
use crate::cpu::registers::Flags;

/// Where an operand lives, after folding the alias codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operand {
    /// Program counter (code 0).
    Pc,
    /// Own memory addressed by r1-r3 (codes 1-3).
    Local(u8),
    /// Register value r1-r6 (codes 5-7, 13-15).
    Register(u8),
    /// Bus address held in r4-r6 (codes 9-11).
    Banked(u8),
    /// Literal immediate (source code 4).
    Immediate,
    /// Flags register (code 8, destination code 4).
    Flags,
    /// Interrupt handler address (code 12).
    Interrupt,
}

impl Operand {
    /// Decode a source operand code.
    pub fn source(code: u8) -> Self {
        match code & 0xF {
            4 => Operand::Immediate,
            code => Self::common(code),
        }
    }

    /// Decode a destination operand code. There is nothing to store into
    /// an immediate, so code 4 addresses the flags.
    pub fn destination(code: u8) -> Self {
        match code & 0xF {
            4 => Operand::Flags,
            code => Self::common(code),
        }
    }

    fn common(code: u8) -> Self {
        match code {
            0 => Operand::Pc,
            1..=3 => Operand::Local(code),
            5..=7 => Operand::Register(code - 4),
            9..=11 => Operand::Banked(code - 5),
            12 => Operand::Interrupt,
            13..=15 => Operand::Register(code - 9),
            _ => Operand::Flags,
        }
    }

    /// True for operands that go through memory (local or bus).
    pub fn is_memory(self) -> bool {
        matches!(self, Operand::Local(_) | Operand::Banked(_))
    }

    /// Register tied to this operand, if any.
    pub fn register(self) -> Option<u8> {
        match self {
            Operand::Local(n) | Operand::Register(n) | Operand::Banked(n) => Some(n),
            _ => None,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Pc => write!(f, "pc"),
            Operand::Local(n) => write!(f, "mem[r{}]", n),
            Operand::Register(n) => write!(f, "r{}", n),
            Operand::Banked(n) => write!(f, "bus[r{}]", n),
            Operand::Immediate => write!(f, "val"),
            Operand::Flags => write!(f, "flags"),
            Operand::Interrupt => write!(f, "int"),
        }
    }
}

/// True if a raw operand code is memory-class.
#[inline]
pub fn is_memory_code(code: u8) -> bool {
    matches!(code & 0xF, 1..=3 | 9..=11)
}

/// Condition under which a result is committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Effect {
    Zero,
    NotZero,
    Negative,
    /// Compute and set flags, store nothing.
    Never,
    Always,
    Overflow,
    Error,
    Interrupt,
}

impl Effect {
    /// Decode the low three bits of `code`.
    pub fn from_code(code: u16) -> Self {
        match code & 0x7 {
            0 => Effect::Zero,
            1 => Effect::NotZero,
            2 => Effect::Negative,
            3 => Effect::Never,
            4 => Effect::Always,
            5 => Effect::Overflow,
            6 => Effect::Error,
            _ => Effect::Interrupt,
        }
    }

    pub fn code(self) -> u16 {
        match self {
            Effect::Zero => 0,
            Effect::NotZero => 1,
            Effect::Negative => 2,
            Effect::Never => 3,
            Effect::Always => 4,
            Effect::Overflow => 5,
            Effect::Error => 6,
            Effect::Interrupt => 7,
        }
    }

    /// Should the result be stored given these flags?
    pub fn should_store(self, flags: Flags) -> bool {
        match self {
            Effect::Zero => flags.zero(),
            Effect::NotZero => !flags.zero(),
            Effect::Negative => flags.negative(),
            Effect::Never => false,
            Effect::Always => true,
            Effect::Overflow => flags.overflow(),
            Effect::Error => flags.error(),
            Effect::Interrupt => flags.interrupt_pending(),
        }
    }

    fn label(self) -> &'static str {
        match self {
            Effect::Zero => "zero",
            Effect::NotZero => "!zero",
            Effect::Negative => "negative",
            Effect::Never => "never",
            Effect::Always => "always",
            Effect::Overflow => "overflow",
            Effect::Error => "error",
            Effect::Interrupt => "interrupt",
        }
    }
}

/// A decoded uCISC instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    /// Raw 4-bit source code.
    pub source: u8,
    /// Raw 4-bit destination code.
    pub destination: u8,
    /// Push (memory destination) or pop (memory source) flag.
    pub increment: bool,
    pub effect: Effect,
    pub alu: AluOp,
    /// Source displacement or literal, already sign-extended.
    pub immediate: u16,
    /// Signed destination displacement, only non-zero for memory destinations.
    pub offset: i8,
}

impl Instruction {
    /// Build an instruction, clipping `immediate` and `offset` to what the
    /// encoding can hold for this source/destination pair.
    pub fn new(
        source: u8,
        destination: u8,
        alu: AluOp,
        effect: Effect,
        increment: bool,
        immediate: u16,
        offset: i8,
    ) -> Self {
        let (source, destination) = (source & 0xF, destination & 0xF);
        let (immediate, offset) = if is_memory_code(destination) {
            (
                extend_immediate(immediate & 0x0FFF, is_memory_code(source)),
                sign_extend_nibble(offset as u8),
            )
        } else {
            (immediate, 0)
        };
        Self { source, destination, increment, effect, alu, immediate, offset }
    }

    pub fn source_operand(&self) -> Operand {
        Operand::source(self.source)
    }

    pub fn destination_operand(&self) -> Operand {
        Operand::destination(self.destination)
    }

    /// Memory destination with increment: store at `R + offset - 1` and
    /// decrement R.
    pub fn is_push(&self) -> bool {
        self.increment && is_memory_code(self.destination)
    }

    /// Memory source, register-class destination, with increment:
    /// increment the source register after the store.
    pub fn is_pop(&self) -> bool {
        self.increment && is_memory_code(self.source) && !is_memory_code(self.destination)
    }

    /// True for the `pc <- pc + 0` shape; halts when it commits.
    pub fn is_self_jump(&self) -> bool {
        self.source == 0 && self.destination == 0
    }
}

/// Sign-extend a 4-bit field.
fn sign_extend_nibble(nibble: u8) -> i8 {
    ((nibble << 4) as i8) >> 4
}

fn extend_immediate(low12: u16, source_is_memory: bool) -> u16 {
    if !source_is_memory && low12 & 0x0800 != 0 {
        low12 | 0xF000
    } else {
        low12
    }
}

/// Decode an instruction from its two words.
pub fn decode(high: u16, low: u16) -> Instruction {
    let source = (high >> 12) as u8;
    let destination = ((high >> 8) & 0xF) as u8;
    let (immediate, offset) = if is_memory_code(destination) {
        (
            extend_immediate(low & 0x0FFF, is_memory_code(source)),
            sign_extend_nibble((low >> 12) as u8),
        )
    } else {
        (low, 0)
    };

    Instruction {
        source,
        destination,
        increment: high & 0x0080 != 0,
        effect: Effect::from_code(high >> 4),
        alu: AluOp::from_code(high),
        immediate,
        offset,
    }
}

/// Encode an instruction into its two words.
pub fn encode(instr: &Instruction) -> (u16, u16) {
    let high = (u16::from(instr.source & 0xF) << 12)
        | (u16::from(instr.destination & 0xF) << 8)
        | if instr.increment { 0x0080 } else { 0 }
        | (instr.effect.code() << 4)
        | instr.alu.code();
    let low = if is_memory_code(instr.destination) {
        (u16::from(instr.offset as u8 & 0xF) << 12) | (instr.immediate & 0x0FFF)
    } else {
        instr.immediate
    };
    (high, low)
}

impl fmt::Display for Instruction {
    /// `add val 0x0042 -> mem[r1]-1 push [always]`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let src = self.source_operand();
        write!(f, "{} {}", self.alu.mnemonic(), src)?;
        match src {
            Operand::Flags | Operand::Interrupt => {}
            Operand::Immediate => write!(f, " {:#06x}", self.immediate)?,
            _ if self.immediate != 0 => write!(f, "{:+}", self.immediate as i16)?,
            _ => {}
        }

        write!(f, " -> {}", self.destination_operand())?;
        if self.offset != 0 {
            write!(f, "{:+}", self.offset)?;
        }
        if self.is_push() {
            write!(f, " push")?;
        } else if self.is_pop() {
            write!(f, " pop")?;
        }
        write!(f, " [{}]", self.effect.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_operand_classes() {
        assert_eq!(Operand::source(0), Operand::Pc);
        assert_eq!(Operand::source(2), Operand::Local(2));
        assert_eq!(Operand::source(4), Operand::Immediate);
        assert_eq!(Operand::destination(4), Operand::Flags);
        assert_eq!(Operand::source(7), Operand::Register(3));
        assert_eq!(Operand::source(8), Operand::Flags);
        assert_eq!(Operand::source(9), Operand::Banked(4));
        assert_eq!(Operand::source(11), Operand::Banked(6));
        assert_eq!(Operand::source(12), Operand::Interrupt);
        assert_eq!(Operand::source(13), Operand::Register(4));
        assert_eq!(Operand::source(15), Operand::Register(6));

        let memory: Vec<u8> = (0..16).filter(|c| Operand::source(*c).is_memory()).collect();
        assert_eq!(memory, vec![1, 2, 3, 9, 10, 11]);
    }

    #[test]
    fn test_decode_push_immediate() {
        // copy val 0x42 -> mem[r1] push, always
        let instr = decode(0x41C0, 0x0042);
        assert_eq!(instr.source_operand(), Operand::Immediate);
        assert_eq!(instr.destination_operand(), Operand::Local(1));
        assert_eq!(instr.alu, AluOp::Copy);
        assert_eq!(instr.effect, Effect::Always);
        assert!(instr.is_push());
        assert!(!instr.is_pop());
        assert_eq!(instr.immediate, 0x0042);
        assert_eq!(instr.offset, 0);
    }

    #[test]
    fn test_immediate_sign_extension() {
        // Non-memory source: 12-bit immediate is signed
        let instr = decode(0x410A, 0xFFFF);
        assert_eq!(instr.immediate, 0xFFFF);
        assert_eq!(instr.offset, -1);

        // Memory source: plain displacement
        let instr = decode(0x210A, 0x1800);
        assert_eq!(instr.immediate, 0x0800);
        assert_eq!(instr.offset, 1);

        // Non-memory destination: full 16-bit immediate, no offset
        let instr = decode(0x450A, 0x8001);
        assert_eq!(instr.immediate, 0x8001);
        assert_eq!(instr.offset, 0);
    }

    #[test]
    fn test_pop_shape() {
        let instr = decode(0x15C0, 0);
        assert!(instr.is_pop());
        assert!(!instr.is_push());

        // Increment with nothing in memory is neither
        let instr = decode(0x56C0, 0);
        assert!(!instr.is_pop());
        assert!(!instr.is_push());
    }

    #[test]
    fn test_new_clips_to_encoding() {
        let instr = Instruction::new(4, 1, AluOp::Add, Effect::Always, false, 0x1FFF, 9);
        assert_eq!(instr.immediate, 0xFFFF);
        assert_eq!(instr.offset, -7);

        let instr = Instruction::new(4, 5, AluOp::Add, Effect::Always, false, 0x1FFF, 9);
        assert_eq!(instr.immediate, 0x1FFF);
        assert_eq!(instr.offset, 0);
    }

    #[test]
    fn test_effects() {
        let zero = Flags::from_bits(Flags::ZERO);
        assert!(Effect::Zero.should_store(zero));
        assert!(!Effect::NotZero.should_store(zero));
        assert!(!Effect::Never.should_store(Flags::from_bits(0xFFFF)));
        assert!(Effect::Always.should_store(Flags::default()));
        assert!(Effect::Interrupt.should_store(Flags::from_bits(Flags::INTERRUPT)));

        let signed = Flags::from_bits(Flags::SIGNED);
        for (effect, bit) in [
            (Effect::Negative, Flags::NEGATIVE),
            (Effect::Overflow, Flags::OVERFLOW),
            (Effect::Error, Flags::ERROR),
        ] {
            assert!(!effect.should_store(signed), "{:?} without its flag", effect);
            assert!(effect.should_store(signed.with(bit, true)), "{:?} with its flag", effect);
            assert!(!effect.should_store(Flags::from_bits(!bit)), "{:?} with every other flag", effect);
        }
        for code in 0..8 {
            assert_eq!(Effect::from_code(code).code(), code);
        }
    }

    #[test]
    fn test_display() {
        let instr = decode(0x41CA, 0x0042);
        assert_eq!(instr.to_string(), "add val 0x0042 -> mem[r1] push [always]");

        let instr = decode(0x1530, 0x0003);
        assert_eq!(instr.to_string(), "copy mem[r1]+3 -> r1 [never]");
    }

    fn any_instruction() -> impl Strategy<Value = Instruction> {
        (0u8..16, 0u8..16, 0u16..16, 0u16..8, any::<bool>(), any::<u16>(), -8i8..8).prop_map(
            |(src, dst, alu, effect, inc, imm, off)| {
                Instruction::new(src, dst, AluOp::from_code(alu), Effect::from_code(effect), inc, imm, off)
            },
        )
    }

    proptest! {
        #[test]
        fn encode_decode_roundtrip(instr in any_instruction()) {
            let (high, low) = encode(&instr);
            prop_assert_eq!(decode(high, low), instr);
        }

        #[test]
        fn decode_encode_roundtrip(high: u16, low: u16) {
            prop_assert_eq!(encode(&decode(high, low)), (high, low));
        }
    }
}
