//! uCISC execution engine.
//!
//! Implements the fetch-decode-execute cycle: fetch two words at pc, read
//! source then destination, run the ALU, commit per the effect, retire.

use serde::{Serialize, Deserialize};
use thiserror::Error;
use tracing::{info, trace};

use crate::cpu::alu;
use crate::cpu::decode::{self, Instruction, Operand};
use crate::cpu::registers::{Flags, Registers};
use crate::device::{Device, DeviceError, DeviceType};

/// Simulated time one instruction takes, used to tick the bus.
pub const DEFAULT_NANOS_PER_INSTRUCTION: u64 = 100;

/// Processor execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpuState {
    Running,
    /// Stopped on a self-jump. `code` is the word r1 pointed at.
    Halted { code: u16 },
}

/// A uCISC processor: a device whose type-specific state is the register
/// file, plus the run loop.
pub struct Processor {
    device: Device<Registers>,
    state: CpuState,
    cycles: u64,
    nanos_per_instruction: u64,
    last_instr: Option<Instruction>,
}

impl Processor {
    /// Create a running processor with `2^address_width` words of memory.
    pub fn new(id: u16, address_width: u8) -> Result<Self, DeviceError> {
        if address_width == 0 {
            return Err(DeviceError::InvalidAddressWidth(0));
        }
        let mut device = Device::new(id, Registers::new(), address_width)?;
        device.set_halted(false);
        Ok(Self {
            device,
            state: CpuState::Running,
            cycles: 0,
            nanos_per_instruction: DEFAULT_NANOS_PER_INSTRUCTION,
            last_instr: None,
        })
    }

    /// Reset registers and state. Memory and the bus are kept.
    pub fn reset(&mut self) {
        self.device.kind_mut().reset();
        self.device.set_halted(false);
        self.state = CpuState::Running;
        self.cycles = 0;
        self.last_instr = None;
    }

    /// Load a program at address 0.
    pub fn load_program(&mut self, program: &[u16]) -> Result<(), DeviceError> {
        self.device.memory_mut().load_program(program)
    }

    /// Load a program at address 0 and write-protect it.
    pub fn load_rom(&mut self, program: &[u16]) -> Result<(), DeviceError> {
        self.device.memory_mut().load_rom(program)
    }

    /// Load a big-endian byte image at address 0.
    pub fn load_bytes(&mut self, bytes: &[u8]) -> Result<(), DeviceError> {
        self.device.memory_mut().load_bytes(bytes)
    }

    /// Attach a device to this processor's bus.
    pub fn connect(&mut self, index: u8, device: Device) -> Result<(), DeviceError> {
        self.device.connect(index, device)
    }

    pub fn set_nanos_per_instruction(&mut self, nanos: u64) {
        self.nanos_per_instruction = nanos;
    }

    pub fn id(&self) -> u16 {
        self.device.id()
    }

    pub fn regs(&self) -> &Registers {
        self.device.kind()
    }

    pub fn regs_mut(&mut self) -> &mut Registers {
        self.device.kind_mut()
    }

    pub fn device(&self) -> &Device<Registers> {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut Device<Registers> {
        &mut self.device
    }

    pub fn state(&self) -> CpuState {
        self.state
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Flag an interrupt from the device whose control block is at `pointer`.
    pub fn raise_interrupt(&mut self, pointer: u16) {
        trace!(pointer, "interrupt raised");
        self.regs_mut().raise_interrupt(pointer);
    }

    /// Execute a single instruction.
    ///
    /// Returns the instruction that was executed.
    pub fn step(&mut self) -> Result<Instruction, CpuError> {
        if self.state != CpuState::Running {
            return Err(CpuError::NotRunning(self.state));
        }

        // Fetch
        let pc = self.regs().pc();
        let high = self.device.read_local(pc);
        let low = self.device.read_local(pc.wrapping_add(1));

        // Decode
        let instr = decode::decode(high, low);
        trace!(pc, %instr, "execute");

        // Execute
        self.execute(&instr);
        if self.state == CpuState::Running {
            self.regs_mut().retire();
        }

        self.device.tick(self.nanos_per_instruction);
        self.cycles += 1;
        self.last_instr = Some(instr);

        Ok(instr)
    }

    /// Run until halt. Returns the halt code.
    pub fn run(&mut self) -> Result<u16, CpuError> {
        loop {
            if let CpuState::Halted { code } = self.state {
                return Ok(code);
            }
            self.step()?;
        }
    }

    /// Run for at most `max_cycles` instructions.
    ///
    /// Returns the number of instructions executed.
    pub fn run_limited(&mut self, max_cycles: u64) -> Result<u64, CpuError> {
        let start_cycles = self.cycles;
        let limit = self.cycles.saturating_add(max_cycles);

        while self.state == CpuState::Running && self.cycles < limit {
            self.step()?;
        }

        Ok(self.cycles - start_cycles)
    }

    /// Continue past a halting instruction.
    pub fn resume(&mut self) {
        if let CpuState::Halted { .. } = self.state {
            let regs = self.device.kind_mut();
            let pc = regs.pc();
            regs.set_pc(pc.wrapping_add(2));
            self.device.set_halted(false);
            self.state = CpuState::Running;
        }
    }

    /// Read what a source operand `code` would yield, without side effects.
    pub fn peek(&mut self, code: u8) -> u16 {
        self.load(Operand::source(code), 0, true)
    }

    /// Apply one decoded instruction.
    fn execute(&mut self, instr: &Instruction) {
        let src = instr.source_operand();
        let dst = instr.destination_operand();
        let offset = instr.offset as i16 as u16;

        let source_value = self.load(src, instr.immediate, false);
        let destination_value = self.load(dst, offset, false);

        let out = {
            let regs = self.regs();
            alu::compute(instr.alu, source_value, destination_value, regs.flags, regs.overflow)
        };
        {
            let regs = self.regs_mut();
            regs.flags = out.flags;
            regs.overflow = out.overflow;
        }

        if !instr.effect.should_store(out.flags) {
            return;
        }

        if instr.is_pop() {
            if let Some(n) = src.register() {
                let regs = self.regs_mut();
                let popped = regs.get(n).wrapping_add(1);
                regs.set(n, popped);
            }
        }
        self.store(instr, dst, offset, out.value);
    }

    /// Read an operand. `displacement` is the immediate for sources and the
    /// offset for destinations.
    fn load(&mut self, operand: Operand, displacement: u16, peek: bool) -> u16 {
        let regs = self.device.kind();
        match operand {
            Operand::Pc => regs.pc().wrapping_add(displacement),
            Operand::Local(n) => {
                let address = regs.get(n).wrapping_add(displacement);
                self.device.read_local(address)
            }
            Operand::Register(n) => regs.get(n).wrapping_add(displacement),
            Operand::Banked(n) => {
                let address = regs.get(n).wrapping_add(displacement);
                self.device.bus_read(address, peek)
            }
            Operand::Immediate => displacement,
            Operand::Flags => regs.flags.bits(),
            Operand::Interrupt => self.device.interrupt_handler(),
        }
    }

    fn store(&mut self, instr: &Instruction, dst: Operand, offset: u16, value: u16) {
        match dst {
            Operand::Pc => {
                let pc = self.regs().pc();
                if instr.is_self_jump() && value == pc {
                    self.halt();
                } else {
                    self.regs_mut().set_next(value);
                }
            }
            Operand::Local(n) | Operand::Banked(n) => {
                let address = self.push_address(instr, n, offset);
                if let Operand::Local(_) = dst {
                    self.device.write_local(address, value);
                } else {
                    self.device.bus_write(address, value);
                }
            }
            Operand::Register(n) => self.regs_mut().set(n, value),
            Operand::Flags => self.regs_mut().flags = Flags::from_bits(value),
            Operand::Interrupt => self.device.set_interrupt_handler(value),
            Operand::Immediate => {}
        }
    }

    /// Effective store address for a memory destination, applying the
    /// push pre-decrement to the register.
    fn push_address(&mut self, instr: &Instruction, n: u8, offset: u16) -> u16 {
        let regs = self.regs_mut();
        let base = regs.get(n);
        let address = base.wrapping_add(offset);
        if instr.is_push() {
            regs.set(n, base.wrapping_sub(1));
            address.wrapping_sub(1)
        } else {
            address
        }
    }

    fn halt(&mut self) {
        let pointer = self.regs().get(1);
        let code = self.device.read_local(pointer);
        info!(
            processor = self.device.id(),
            pc = self.regs().pc(),
            code,
            cycles = self.cycles + 1,
            "processor halted"
        );
        self.state = CpuState::Halted { code };
        self.device.set_halted(true);
    }

    /// Get the last executed instruction.
    pub fn last_instruction(&self) -> Option<Instruction> {
        self.last_instr
    }

    /// The instruction at pc, decoded but not executed.
    pub fn current_instruction(&self) -> Instruction {
        let pc = self.regs().pc();
        decode::decode(self.device.read_local(pc), self.device.read_local(pc.wrapping_add(1)))
    }

    pub fn is_halted(&self) -> bool {
        matches!(self.state, CpuState::Halted { .. })
    }

    pub fn is_running(&self) -> bool {
        self.state == CpuState::Running
    }

    /// Serialisable copy of the processor state.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            id: self.device.id(),
            device_type: self.device.device_type(),
            state: self.state,
            cycles: self.cycles,
            registers: self.regs().clone(),
            interrupt_handler: self.device.interrupt_handler(),
            init_device: self.device.init_device(),
            memory: self.device.memory().words().to_vec(),
        }
    }
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("id", &self.device.id())
            .field("state", &self.state)
            .field("cycles", &self.cycles)
            .field("regs", self.regs())
            .finish()
    }
}

/// Processor state as written by `--dump`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: u16,
    pub device_type: DeviceType,
    pub state: CpuState,
    pub cycles: u64,
    pub registers: Registers,
    pub interrupt_handler: u16,
    pub init_device: u16,
    pub memory: Vec<u16>,
}

/// Errors that can occur during CPU execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CpuError {
    #[error("processor not running: {0:?}")]
    NotRunning(CpuState),

    #[error("device error: {0}")]
    Device(#[from] DeviceError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::alu::AluOp;
    use crate::cpu::decode::{encode, Effect};
    use crate::device::{BlockMemory, DeviceKind};

    fn make_program(instructions: &[Instruction]) -> Vec<u16> {
        instructions
            .iter()
            .flat_map(|i| {
                let (high, low) = encode(i);
                [high, low]
            })
            .collect()
    }

    fn op(src: u8, dst: u8, alu: AluOp, effect: Effect, imm: u16) -> Instruction {
        Instruction::new(src, dst, alu, effect, false, imm, 0)
    }

    fn halt() -> Instruction {
        op(0, 0, AluOp::Copy, Effect::Always, 0)
    }

    fn cpu_with(instructions: &[Instruction]) -> Processor {
        let mut cpu = Processor::new(1, 16).unwrap();
        cpu.load_program(&make_program(instructions)).unwrap();
        cpu
    }

    #[test]
    fn test_cpu_halt() {
        let mut cpu = cpu_with(&[halt()]);
        cpu.regs_mut().set(1, 0x40);
        cpu.device_mut().write_local(0x40, 0xBEEF);

        assert_eq!(cpu.run().unwrap(), 0xBEEF);
        assert!(cpu.is_halted());
        assert!(cpu.device().is_halted());
        assert_eq!(cpu.cycles(), 1);
        assert_eq!(cpu.regs().pc(), 0);
        assert_eq!(cpu.step(), Err(CpuError::NotRunning(CpuState::Halted { code: 0xBEEF })));
    }

    #[test]
    fn test_push_immediate() {
        let push = Instruction::new(4, 1, AluOp::Copy, Effect::Always, true, 0x0042, 0);
        let mut cpu = cpu_with(&[push, halt()]);
        cpu.regs_mut().set(1, 0x0010);

        cpu.step().unwrap();

        assert_eq!(cpu.device().read_local(0x000F), 0x0042);
        assert_eq!(cpu.regs().get(1), 0x000F);
        assert_eq!(cpu.regs().pc(), 2);
        assert_eq!(cpu.run().unwrap(), 0x0042);
    }

    #[test]
    fn test_push_reads_before_decrement() {
        // add 1 to the word at r1 and push the sum below it
        let push = Instruction::new(4, 1, AluOp::Add, Effect::Always, true, 1, 0);
        let mut cpu = cpu_with(&[push]);
        cpu.regs_mut().set(1, 0x0100);
        cpu.device_mut().write_local(0x0100, 41);

        cpu.step().unwrap();

        assert_eq!(cpu.device().read_local(0x00FF), 42);
        assert_eq!(cpu.device().read_local(0x0100), 41);
    }

    #[test]
    fn test_pop() {
        let pop = Instruction::new(2, 7, AluOp::Copy, Effect::Always, true, 0, 0);
        let mut cpu = cpu_with(&[pop]);
        cpu.regs_mut().set(2, 0x20);
        cpu.device_mut().write_local(0x20, 7);

        cpu.step().unwrap();

        assert_eq!(cpu.regs().get(3), 7);
        assert_eq!(cpu.regs().get(2), 0x21);
    }

    #[test]
    fn test_increment_without_memory_does_nothing() {
        let instr = Instruction::new(5, 6, AluOp::Copy, Effect::Always, true, 0, 0);
        let mut cpu = cpu_with(&[instr]);
        cpu.regs_mut().set(1, 9);

        cpu.step().unwrap();

        assert_eq!(cpu.regs().get(1), 9);
        assert_eq!(cpu.regs().get(2), 9);
    }

    #[test]
    fn test_never_sets_flags_only() {
        let mut cpu = cpu_with(&[
            op(4, 5, AluOp::Subtract, Effect::Never, 5),
            op(4, 5, AluOp::Copy, Effect::Always, 3),
        ]);
        cpu.regs_mut().set(1, 5);

        cpu.step().unwrap();
        assert_eq!(cpu.regs().get(1), 5);
        assert!(cpu.regs().flags.zero());

        cpu.step().unwrap();
        assert_eq!(cpu.regs().get(1), 3);
    }

    #[test]
    fn test_countdown_loop() {
        let mut cpu = cpu_with(&[
            op(4, 5, AluOp::Copy, Effect::Always, 3),
            op(4, 5, AluOp::Subtract, Effect::Always, 1),
            op(0, 0, AluOp::Copy, Effect::NotZero, (-2i16) as u16),
            halt(),
        ]);

        cpu.run().unwrap();

        assert_eq!(cpu.regs().get(1), 0);
        assert_eq!(cpu.cycles(), 8);
        assert_eq!(cpu.regs().pc(), 6);
    }

    #[test]
    fn test_divide_by_zero_keeps_destination() {
        let mut cpu = cpu_with(&[op(4, 5, AluOp::Divide, Effect::Always, 0)]);
        cpu.regs_mut().set(1, 100);

        cpu.step().unwrap();

        assert_eq!(cpu.regs().get(1), 100);
        assert!(cpu.regs().flags.error());
        assert!(cpu.is_running());
    }

    #[test]
    fn test_negative_and_error_effects() {
        let mut cpu = cpu_with(&[
            // r1 <- 2 - 5, then r2 <- 1 only if that went negative
            op(4, 5, AluOp::Copy, Effect::Always, 2),
            op(4, 5, AluOp::Subtract, Effect::Always, 5),
            op(4, 6, AluOp::Copy, Effect::Negative, 1),
            // r1 / 0 keeps r1 and flags an error, then r3 <- 1
            op(4, 5, AluOp::Divide, Effect::Always, 0),
            op(4, 7, AluOp::Copy, Effect::Error, 1),
            // a good divide clears the error: r3 stays 1
            op(4, 5, AluOp::Divide, Effect::Always, 1),
            op(4, 7, AluOp::Copy, Effect::Error, 2),
        ]);
        cpu.run_limited(7).unwrap();

        assert_eq!(cpu.regs().get(1) as i16, -3);
        assert_eq!(cpu.regs().get(2), 1);
        assert_eq!(cpu.regs().get(3), 1);
        assert!(!cpu.regs().flags.error());
    }

    #[test]
    fn test_overflow_effect_sees_only_this_result() {
        let mut cpu = cpu_with(&[
            // 0x7FFF + 1 overflows; the overflow effect commits
            op(4, 5, AluOp::Copy, Effect::Always, 0x7FFF),
            op(4, 5, AluOp::Add, Effect::Overflow, 1),
            // an and right after must not inherit that overflow
            op(4, 6, AluOp::Copy, Effect::Always, 0x0F0F),
            op(4, 6, AluOp::And, Effect::Overflow, 0x00FF),
        ]);
        cpu.run_limited(4).unwrap();

        assert_eq!(cpu.regs().get(1), 0x8000);
        assert_eq!(cpu.regs().get(2), 0x0F0F);
        assert!(!cpu.regs().flags.overflow());
    }

    #[test]
    fn test_flags_and_interrupt_destinations() {
        let mut cpu = cpu_with(&[
            op(4, 12, AluOp::Copy, Effect::Always, 0x0200),
            op(4, 4, AluOp::Copy, Effect::Always, Flags::ZERO),
            op(12, 5, AluOp::Copy, Effect::Zero, 0),
        ]);
        cpu.run_limited(3).unwrap();

        assert_eq!(cpu.device().interrupt_handler(), 0x0200);
        assert_eq!(cpu.regs().flags.bits(), Flags::ZERO);
        assert_eq!(cpu.regs().get(1), 0x0200);
    }

    #[test]
    fn test_interrupt_effect() {
        let mut cpu = cpu_with(&[
            op(4, 5, AluOp::Copy, Effect::Interrupt, 7),
            op(4, 5, AluOp::Copy, Effect::Interrupt, 7),
            // acknowledge through our own control slot 7
            op(4, 9, AluOp::Copy, Effect::Always, 0),
        ]);
        cpu.regs_mut().set(4, 0x0007);

        cpu.step().unwrap();
        assert_eq!(cpu.regs().get(1), 0);

        cpu.raise_interrupt(0x0100);
        cpu.step().unwrap();
        assert_eq!(cpu.regs().get(1), 7);
        assert_eq!(cpu.regs().pending_interrupt(), 0x0100);

        cpu.step().unwrap();
        assert_eq!(cpu.regs().pending_interrupt(), 0);
        assert!(!cpu.regs().flags.interrupt_pending());
    }

    #[test]
    fn test_bus_claim_and_block_write() {
        let mut cpu = cpu_with(&[
            op(4, 9, AluOp::Copy, Effect::Always, 1),
            op(4, 10, AluOp::Copy, Effect::Always, 0x0123),
            op(10, 6, AluOp::Copy, Effect::Always, 0),
        ]);
        let memory = Device::new(20, DeviceKind::Memory(BlockMemory), 8).unwrap();
        cpu.connect(16, memory).unwrap();
        cpu.regs_mut().set(4, 0x0102);
        cpu.regs_mut().set(5, 0x1005);

        cpu.run_limited(3).unwrap();

        let memory = cpu.device().connected(16).unwrap();
        assert_eq!(memory.init_device(), 1);
        assert_eq!(memory.read_local(5), 0x0123);
        assert_eq!(cpu.regs().get(2), 0x0123);
    }

    #[test]
    fn test_resume_skips_halt() {
        let mut cpu = cpu_with(&[halt(), op(4, 5, AluOp::Copy, Effect::Always, 9), halt()]);
        cpu.run().unwrap();
        assert_eq!(cpu.regs().pc(), 0);

        cpu.resume();
        assert!(cpu.is_running());
        cpu.run().unwrap();
        assert_eq!(cpu.regs().get(1), 9);
        assert_eq!(cpu.regs().pc(), 4);
    }

    #[test]
    fn test_peek_has_no_side_effects() {
        let mut cpu = cpu_with(&[halt()]);
        cpu.regs_mut().set(1, 0x30);
        cpu.device_mut().write_local(0x30, 0x1234);

        assert_eq!(cpu.peek(1), 0x1234);
        assert_eq!(cpu.peek(5), 0x30);
        assert_eq!(cpu.peek(8), Flags::SIGNED);
        assert_eq!(cpu.cycles(), 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let mut cpu = cpu_with(&[halt()]);
        cpu.run().unwrap();
        let snapshot = cpu.snapshot();
        assert_eq!(snapshot.state, CpuState::Halted { code: snapshot.memory[0] });

        let json = serde_json::to_string(&snapshot).unwrap();
        let back: Snapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snapshot);
    }

    #[test]
    fn test_processor_needs_memory() {
        assert!(matches!(Processor::new(1, 0), Err(DeviceError::InvalidAddressWidth(0))));
    }

    #[test]
    fn test_load_bytes_then_reset() {
        let mut cpu = Processor::new(1, 8).unwrap();
        // r1 <- 0x10, halt
        cpu.load_bytes(&[0x45, 0x40, 0x00, 0x10, 0x00, 0x40, 0x00, 0x00]).unwrap();
        assert_eq!(cpu.load_bytes(&[0x45]), Err(DeviceError::MalformedStream(1)));

        cpu.run().unwrap();
        assert_eq!(cpu.regs().get(1), 0x10);
        assert_eq!(cpu.last_instruction().map(|i| i.is_self_jump()), Some(true));

        cpu.reset();
        assert!(cpu.is_running());
        assert!(!cpu.device().is_halted());
        assert_eq!(cpu.cycles(), 0);
        assert_eq!(cpu.regs().get(1), 0);
        assert_eq!(cpu.last_instruction(), None);
        // memory survives a reset
        assert_eq!(cpu.device().read_local(0), 0x4540);
    }
}
