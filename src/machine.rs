//! Machine composition from a JSON configuration.
//!
//! A machine is one root processor plus the device tree hanging off its
//! bus. The default layout is a 16-bit processor (id 1) with a serial line
//! (id 100) at bus index 16 and a terminal writer (id 101) at index 17.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::Path;

use serde::{Serialize, Deserialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::cpu::{CpuError, Flags, Processor, Registers};
use crate::device::{
    BlockMemory, Device, DeviceError, DeviceKind, LedBank, NoDataFill, SerialLine, SerialPort,
    TerminalOutput, TerminalWriter, serial::DEFAULT_BAUD, terminal::TERMINAL_ADDRESS_WIDTH,
};
use crate::program::{ImageError, Program};

/// Instructions run between output pumps.
const PUMP_INTERVAL: u64 = 256;

/// Top-level machine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    pub processor: ProcessorConfig,
    pub devices: Vec<DeviceConfig>,
    /// Stop after this many instructions.
    pub max_cycles: Option<u64>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            processor: ProcessorConfig::default(),
            devices: vec![
                DeviceConfig {
                    index: 16,
                    id: 100,
                    kind: DeviceKindConfig::Serial {
                        baud: DEFAULT_BAUD,
                        fill: NoDataFill::default(),
                    },
                    connected: Vec::new(),
                },
                DeviceConfig {
                    index: 17,
                    id: 101,
                    kind: DeviceKindConfig::Terminal,
                    connected: Vec::new(),
                },
            ],
            max_cycles: None,
        }
    }
}

impl MachineConfig {
    /// Load a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, MachineError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn to_json(&self) -> Result<String, MachineError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// The root processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    pub id: u16,
    pub address_width: u8,
    pub start_pc: u16,
    /// Simulated nanoseconds per instruction.
    pub nanos_per_instruction: u64,
    /// Reset value of the signed arithmetic mode bit.
    pub signed: bool,
    /// Load programs as write-protected boot ROM.
    pub rom: bool,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            id: 1,
            address_width: 16,
            start_pc: 0,
            nanos_per_instruction: crate::cpu::execute::DEFAULT_NANOS_PER_INSTRUCTION,
            signed: true,
            rom: false,
        }
    }
}

/// One device on a bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub index: u8,
    pub id: u16,
    #[serde(flatten)]
    pub kind: DeviceKindConfig,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connected: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceKindConfig {
    Serial {
        #[serde(default = "default_baud")]
        baud: u32,
        #[serde(default)]
        fill: NoDataFill,
    },
    Terminal,
    Led,
    Memory { address_width: u8 },
    Processor { address_width: u8 },
}

fn default_baud() -> u32 {
    DEFAULT_BAUD
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Halted { code: u16 },
    CycleLimit { cycles: u64 },
}

/// A composed machine and the host-side handles to its devices.
#[derive(Debug)]
pub struct Machine {
    processor: Processor,
    serial_ports: BTreeMap<u16, SerialPort>,
    terminals: BTreeMap<u16, TerminalOutput>,
    max_cycles: Option<u64>,
    start_pc: u16,
    rom: bool,
}

impl Machine {
    /// Build the processor and its device tree.
    pub fn from_config(config: &MachineConfig) -> Result<Self, MachineError> {
        let cpu = &config.processor;
        let mut processor = Processor::new(cpu.id, cpu.address_width)?;
        processor.set_nanos_per_instruction(cpu.nanos_per_instruction);
        let flags = &mut processor.regs_mut().flags;
        flags.set(Flags::SIGNED, cpu.signed);

        let mut machine = Self {
            processor,
            serial_ports: BTreeMap::new(),
            terminals: BTreeMap::new(),
            max_cycles: config.max_cycles,
            start_pc: cpu.start_pc,
            rom: cpu.rom,
        };
        for device_config in &config.devices {
            let device = machine.build_device(device_config)?;
            machine.processor.connect(device_config.index, device)?;
        }
        machine.processor.regs_mut().set_pc(cpu.start_pc);
        debug!(
            processor = cpu.id,
            devices = config.devices.len(),
            "machine composed"
        );
        Ok(machine)
    }

    fn build_device(&mut self, config: &DeviceConfig) -> Result<Device, MachineError> {
        let mut device = match &config.kind {
            DeviceKindConfig::Serial { baud, fill } => {
                let (line, port) = SerialLine::new(*baud, *fill);
                self.serial_ports.insert(config.id, port);
                Device::new(config.id, DeviceKind::Serial(line), 0)?
            }
            DeviceKindConfig::Terminal => {
                let (writer, output) = TerminalWriter::new();
                self.terminals.insert(config.id, output);
                Device::new(config.id, DeviceKind::Terminal(writer), TERMINAL_ADDRESS_WIDTH)?
            }
            DeviceKindConfig::Led => Device::new(config.id, DeviceKind::Led(LedBank::new()), 0)?,
            DeviceKindConfig::Memory { address_width } => {
                Device::new(config.id, DeviceKind::Memory(BlockMemory), *address_width)?
            }
            DeviceKindConfig::Processor { address_width } => {
                Device::new(config.id, DeviceKind::Processor(Registers::new()), *address_width)?
            }
        };
        for child in &config.connected {
            let built = self.build_device(child)?;
            device.connect(child.index, built)?;
        }
        Ok(device)
    }

    /// Load a program and point pc at the configured start.
    pub fn load(&mut self, program: &Program) -> Result<(), MachineError> {
        if self.rom {
            self.processor.load_rom(&program.words)?;
        } else {
            self.processor.load_program(&program.words)?;
        }
        self.processor.regs_mut().set_pc(self.start_pc);
        Ok(())
    }

    pub fn processor(&self) -> &Processor {
        &self.processor
    }

    pub fn processor_mut(&mut self) -> &mut Processor {
        &mut self.processor
    }

    pub fn max_cycles(&self) -> Option<u64> {
        self.max_cycles
    }

    pub fn set_max_cycles(&mut self, max_cycles: Option<u64>) {
        self.max_cycles = max_cycles;
    }

    /// Host handle of the serial line with the lowest id.
    pub fn serial(&self) -> Option<&SerialPort> {
        self.serial_ports.values().next()
    }

    pub fn serial_port(&self, id: u16) -> Option<&SerialPort> {
        self.serial_ports.get(&id)
    }

    pub fn terminal(&self, id: u16) -> Option<&TerminalOutput> {
        self.terminals.get(&id)
    }

    /// Move device output to the host: the first serial line to `serial`,
    /// every terminal to `terminal`. Other serial lines are drained and logged.
    pub fn pump(&self, serial: &mut dyn Write, terminal: &mut dyn Write) -> io::Result<()> {
        for (n, (id, port)) in self.serial_ports.iter().enumerate() {
            let bytes = port.drain();
            if bytes.is_empty() {
                continue;
            }
            if n == 0 {
                serial.write_all(&bytes)?;
            } else {
                debug!(device = id, bytes = bytes.len(), "serial output dropped");
            }
        }
        for output in self.terminals.values() {
            let bytes = output.take();
            if !bytes.is_empty() {
                terminal.write_all(&bytes)?;
            }
        }
        serial.flush()?;
        terminal.flush()
    }

    /// Run until the processor halts or the cycle limit is hit.
    pub fn run(
        &mut self,
        serial: &mut dyn Write,
        terminal: &mut dyn Write,
    ) -> Result<RunOutcome, MachineError> {
        let start = self.processor.cycles();
        loop {
            let budget = match self.max_cycles {
                Some(max) => {
                    let used = self.processor.cycles() - start;
                    if used >= max {
                        self.pump(serial, terminal)?;
                        info!(cycles = used, "cycle limit reached");
                        return Ok(RunOutcome::CycleLimit { cycles: used });
                    }
                    PUMP_INTERVAL.min(max - used)
                }
                None => PUMP_INTERVAL,
            };
            self.processor.run_limited(budget)?;
            self.pump(serial, terminal)?;
            if let crate::cpu::CpuState::Halted { code } = self.processor.state() {
                return Ok(RunOutcome::Halted { code });
            }
        }
    }
}

/// Errors raised while composing or driving a machine.
#[derive(Debug, Error)]
pub enum MachineError {
    #[error("configuration error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Cpu(#[from] CpuError),

    #[error(transparent)]
    Image(#[from] ImageError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::decode::{encode, Effect, Instruction};
    use crate::cpu::AluOp;

    fn words(instructions: &[Instruction]) -> Vec<u16> {
        instructions
            .iter()
            .flat_map(|i| {
                let (high, low) = encode(i);
                [high, low]
            })
            .collect()
    }

    fn copy(src: u8, dst: u8, imm: u16) -> Instruction {
        Instruction::new(src, dst, AluOp::Copy, Effect::Always, false, imm, 0)
    }

    #[test]
    fn test_default_layout() {
        let machine = Machine::from_config(&MachineConfig::default()).unwrap();
        let cpu = machine.processor().device();
        assert_eq!(cpu.id(), 1);
        assert_eq!(cpu.memory().len(), 1 << 16);
        assert_eq!(cpu.connected(16).unwrap().id(), 100);
        assert_eq!(cpu.connected(17).unwrap().id(), 101);
        assert!(machine.serial().is_some());
        assert!(machine.terminal(101).is_some());
    }

    #[test]
    fn test_config_json() {
        let json = r#"{
            "processor": { "id": 5, "address_width": 12, "signed": false },
            "devices": [
                { "index": 1, "id": 6, "type": "led" },
                { "index": 2, "id": 7, "type": "serial", "baud": 9600,
                  "fill": { "mode": "seeded", "value": 42 } },
                { "index": 3, "id": 8, "type": "processor", "address_width": 8,
                  "connected": [ { "index": 1, "id": 9, "type": "memory", "address_width": 8 } ] }
            ],
            "max_cycles": 1000
        }"#;
        let config: MachineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.processor.start_pc, 0);
        assert_eq!(config.max_cycles, Some(1000));

        let machine = Machine::from_config(&config).unwrap();
        let cpu = machine.processor();
        assert!(!cpu.regs().flags.signed());
        assert_eq!(cpu.device().memory().len(), 1 << 12);
        let nested = cpu.device().connected(3).unwrap().connected(1).unwrap();
        assert_eq!(nested.id(), 9);

        let back: MachineConfig = serde_json::from_str(&config.to_json().unwrap()).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let mut config = MachineConfig::default();
        config.devices[1].id = 100;
        assert!(matches!(
            Machine::from_config(&config),
            Err(MachineError::Device(DeviceError::DuplicateId(100)))
        ));
    }

    #[test]
    fn test_serial_echo_reaches_host() {
        // Claim the serial line (index 16 -> 0x100, slot 2), then write 'A'
        // to its transmit slot 8
        let program = Program::from_words(words(&[
            copy(4, 13, 0x0102),
            copy(4, 9, 1),
            copy(4, 13, 0x0108),
            copy(4, 9, u16::from(b'A')),
            copy(0, 0, 0),
        ]));
        let mut machine = Machine::from_config(&MachineConfig::default()).unwrap();
        machine.load(&program).unwrap();

        let (mut serial, mut terminal) = (Vec::new(), Vec::new());
        let outcome = machine.run(&mut serial, &mut terminal).unwrap();

        assert!(matches!(outcome, RunOutcome::Halted { .. }));
        assert_eq!(serial, b"A".to_vec());
        assert!(terminal.is_empty());
    }

    #[test]
    fn test_cycle_limit() {
        // Tight loop: jump back to the start
        let program = Program::from_words(words(&[
            copy(4, 5, 0),
            copy(0, 0, (-2i16) as u16),
        ]));
        let mut config = MachineConfig::default();
        config.max_cycles = Some(1000);
        let mut machine = Machine::from_config(&config).unwrap();
        machine.load(&program).unwrap();

        let outcome = machine.run(&mut io::sink(), &mut io::sink()).unwrap();
        assert_eq!(outcome, RunOutcome::CycleLimit { cycles: 1000 });
    }

    #[test]
    fn test_rom_is_write_protected() {
        let mut config = MachineConfig::default();
        config.processor.rom = true;
        // Try to overwrite our own first word through r1
        let program = Program::from_words(words(&[
            Instruction::new(4, 1, AluOp::Copy, Effect::Always, false, 0x0FFF, 0),
            copy(0, 0, 0),
        ]));
        let mut machine = Machine::from_config(&config).unwrap();
        machine.load(&program).unwrap();
        machine.run(&mut io::sink(), &mut io::sink()).unwrap();

        assert_eq!(machine.processor().device().read_local(0), program.words[0]);
    }
}
