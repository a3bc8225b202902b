//! # uCISC Emulator
//!
//! An emulator for the uCISC 16-bit instruction set: a processor with a
//! single two-word instruction format, push/pop pointer registers and
//! conditional effects, talking to its devices over a banked bus.
//!
//! The usual entry point is a [`Machine`], built from a [`MachineConfig`],
//! loaded with one or more [`Program`]s and run until it halts.

pub mod cpu;
pub mod device;
pub mod program;
pub mod machine;
pub mod debugger;

// Re-export commonly used types
pub use cpu::{AluOp, CpuError, CpuState, Effect, Flags, Instruction, Operand, Processor, Registers, Snapshot};
pub use device::{Device, DeviceBehavior, DeviceError, DeviceKind, DeviceType, Memory, SerialPort, TerminalOutput};
pub use program::{disassemble, load_file, parse_image, run_tests, ImageError, Program, TestOutcome};
pub use machine::{DeviceConfig, DeviceKindConfig, Machine, MachineConfig, MachineError, ProcessorConfig, RunOutcome};
pub use debugger::{DebugOutcome, Debugger};
