//! CPU emulation for uCISC.
//!
//! This module implements the processor side of the architecture:
//! - 16-bit words, two-word instructions
//! - pc, six general registers, flags and an overflow register
//! - a 16-operation ALU and conditional commit of every result

pub mod alu;
pub mod registers;
pub mod decode;
pub mod execute;

pub use alu::{AluOp, AluOutput};
pub use registers::{Flags, Registers};
pub use decode::{Instruction, Operand, Effect};
pub use execute::{Processor, CpuError, CpuState, Snapshot};
