//! Addressable devices and the banked device bus.
//!
//! Every device exposes the same 16-slot control block:
//!
//! | Slot | Meaning                                         |
//! |------|-------------------------------------------------|
//! | 0    | Device id (read only)                           |
//! | 1    | Bank index (MSB) \| device type (LSB), read only |
//! | 2    | Init device id, claimable while 0               |
//! | 3    | Mapped block selector                           |
//! | 4    | Device status byte                              |
//! | 5    | Interrupt handler address                       |
//! | 6-F  | Device type specific                            |
//!
//! A device that masters the bus (a processor) reaches the rest of the
//! system through two address spaces. Below `0x1000` is control space:
//! `address >> 4` picks a connected device (0 is the device itself) and
//! `address & 0xF` picks a control slot. From `0x1000` up is block space:
//! `address >> 8` picks a connected device and `address & 0xFF` is an
//! offset into the 256-word block that device has mapped via slot 3.
//!
//! Accesses that fail the gating rules are dropped: reads yield 0 and
//! writes do nothing.

pub mod memory;
pub mod serial;
pub mod terminal;
pub mod led;

use std::collections::BTreeMap;

use serde::{Serialize, Deserialize};
use thiserror::Error;
use tracing::{debug, trace};

use crate::cpu::Registers;

pub use memory::{Memory, words_from_bytes};
pub use serial::{SerialLine, SerialPort, NoDataFill};
pub use terminal::{TerminalWriter, TerminalOutput};
pub use led::LedBank;

/// First address of block space.
pub const BLOCK_SPACE_START: u16 = 0x1000;

/// Control slot numbers shared by every device.
pub mod slot {
    pub const ID: u8 = 0;
    pub const TYPE: u8 = 1;
    pub const INIT_DEVICE: u8 = 2;
    pub const MAPPED_BLOCK: u8 = 3;
    pub const STATUS: u8 = 4;
    pub const INTERRUPT_HANDLER: u8 = 5;
}

/// Device type codes reported in the low byte of control slot 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceType {
    Invalid,
    Processor,
    BlockMemory,
    BlockIo,
    Serial,
    Hid,
    Terminal,
    PinIo,
}

impl DeviceType {
    /// The on-bus type code.
    pub fn code(self) -> u8 {
        match self {
            DeviceType::Invalid => 0,
            DeviceType::Processor => 1,
            DeviceType::BlockMemory => 2,
            DeviceType::BlockIo => 3,
            DeviceType::Serial => 4,
            DeviceType::Hid => 5,
            DeviceType::Terminal => 6,
            DeviceType::PinIo => 7,
        }
    }

    /// Look a type up by its code.
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => DeviceType::Processor,
            2 => DeviceType::BlockMemory,
            3 => DeviceType::BlockIo,
            4 => DeviceType::Serial,
            5 => DeviceType::Hid,
            6 => DeviceType::Terminal,
            7 => DeviceType::PinIo,
            _ => DeviceType::Invalid,
        }
    }
}

/// Type-specific behaviour plugged into the shared [`Device`] logic.
///
/// Implementors only see slots 6 through 15; identity, gating, the
/// generic slots and bus routing are handled by [`Device`].
pub trait DeviceBehavior {
    /// Type code reported in control slot 1.
    fn device_type(&self) -> DeviceType;

    /// Read a type-specific control slot. `peek` reads must not have side
    /// effects (the debugger uses them).
    fn read_control(&mut self, _slot: u8, _memory: &Memory, _peek: bool) -> u16 {
        0
    }

    /// Write a type-specific control slot.
    fn write_control(&mut self, _slot: u8, _value: u16, _memory: &mut Memory) {}

    /// Advance simulated time.
    fn tick(&mut self, _nanos: u64, _memory: &Memory) {}

    /// Does this device run its own code? Devices that don't are passive:
    /// they stay halted so their init device can always drive them.
    fn executes_code(&self) -> bool {
        false
    }
}

/// A plain block of memory with no type-specific slots.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockMemory;

impl DeviceBehavior for BlockMemory {
    fn device_type(&self) -> DeviceType {
        DeviceType::BlockMemory
    }
}

/// The closed set of device kinds that can sit on a bus.
#[derive(Debug)]
pub enum DeviceKind {
    Processor(Registers),
    Memory(BlockMemory),
    Serial(SerialLine),
    Terminal(TerminalWriter),
    Led(LedBank),
}

impl DeviceBehavior for DeviceKind {
    fn device_type(&self) -> DeviceType {
        match self {
            DeviceKind::Processor(regs) => regs.device_type(),
            DeviceKind::Memory(block) => block.device_type(),
            DeviceKind::Serial(serial) => serial.device_type(),
            DeviceKind::Terminal(terminal) => terminal.device_type(),
            DeviceKind::Led(leds) => leds.device_type(),
        }
    }

    fn read_control(&mut self, slot: u8, memory: &Memory, peek: bool) -> u16 {
        match self {
            DeviceKind::Processor(regs) => regs.read_control(slot, memory, peek),
            DeviceKind::Memory(block) => block.read_control(slot, memory, peek),
            DeviceKind::Serial(serial) => serial.read_control(slot, memory, peek),
            DeviceKind::Terminal(terminal) => terminal.read_control(slot, memory, peek),
            DeviceKind::Led(leds) => leds.read_control(slot, memory, peek),
        }
    }

    fn write_control(&mut self, slot: u8, value: u16, memory: &mut Memory) {
        match self {
            DeviceKind::Processor(regs) => regs.write_control(slot, value, memory),
            DeviceKind::Memory(block) => block.write_control(slot, value, memory),
            DeviceKind::Serial(serial) => serial.write_control(slot, value, memory),
            DeviceKind::Terminal(terminal) => terminal.write_control(slot, value, memory),
            DeviceKind::Led(leds) => leds.write_control(slot, value, memory),
        }
    }

    fn tick(&mut self, nanos: u64, memory: &Memory) {
        match self {
            DeviceKind::Processor(regs) => regs.tick(nanos, memory),
            DeviceKind::Memory(block) => block.tick(nanos, memory),
            DeviceKind::Serial(serial) => serial.tick(nanos, memory),
            DeviceKind::Terminal(terminal) => terminal.tick(nanos, memory),
            DeviceKind::Led(leds) => leds.tick(nanos, memory),
        }
    }

    fn executes_code(&self) -> bool {
        match self {
            DeviceKind::Processor(regs) => regs.executes_code(),
            DeviceKind::Memory(block) => block.executes_code(),
            DeviceKind::Serial(serial) => serial.executes_code(),
            DeviceKind::Terminal(terminal) => terminal.executes_code(),
            DeviceKind::Led(leds) => leds.executes_code(),
        }
    }
}

/// Generic control words held by every device.
#[derive(Debug, Clone, Default)]
struct ControlBlock {
    bank_index: u8,
    init_device: u16,
    mapped_block: u8,
    status: u8,
    interrupt_handler: u16,
}

/// An addressable device: identity, control block, local memory and the
/// devices connected to its bus.
pub struct Device<K = DeviceKind> {
    id: u16,
    kind: K,
    memory: Memory,
    control: ControlBlock,
    halted: bool,
    connected: BTreeMap<u8, Device>,
}

impl<K: DeviceBehavior> Device<K> {
    /// Create a device. Devices come out of reset halted.
    pub fn new(id: u16, kind: K, address_width: u8) -> Result<Self, DeviceError> {
        if id == 0 {
            return Err(DeviceError::InvalidId);
        }
        Ok(Self {
            id,
            kind,
            memory: Memory::new(address_width)?,
            control: ControlBlock::default(),
            halted: true,
            connected: BTreeMap::new(),
        })
    }

    /// System-wide device id.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Type code of this device.
    pub fn device_type(&self) -> DeviceType {
        self.kind.device_type()
    }

    pub fn kind(&self) -> &K {
        &self.kind
    }

    pub fn kind_mut(&mut self) -> &mut K {
        &mut self.kind
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    /// Device id that claimed this device, 0 when unclaimed.
    pub fn init_device(&self) -> u16 {
        self.control.init_device
    }

    pub fn mapped_block(&self) -> u8 {
        self.control.mapped_block
    }

    pub fn status(&self) -> u8 {
        self.control.status
    }

    pub fn interrupt_handler(&self) -> u16 {
        self.control.interrupt_handler
    }

    pub fn set_interrupt_handler(&mut self, address: u16) {
        self.control.interrupt_handler = address;
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Mark the device halted or running. Only a halted device can be
    /// driven by its init device. Passive devices ignore this and stay
    /// halted.
    pub fn set_halted(&mut self, halted: bool) {
        if !self.kind.executes_code() {
            trace!(device = self.id, "passive device stays halted");
            return;
        }
        if self.halted != halted {
            debug!(device = self.id, halted, "device halt state changed");
        }
        self.halted = halted;
    }

    /// Attach `device` to this device's bus at `index`.
    ///
    /// Index 0 addresses the device itself and cannot be used. Device ids
    /// must stay unique across the composed tree.
    pub fn connect(&mut self, index: u8, mut device: Device) -> Result<(), DeviceError> {
        if index == 0 {
            return Err(DeviceError::ReservedIndex);
        }
        if self.connected.contains_key(&index) {
            return Err(DeviceError::IndexInUse(index));
        }
        let mut existing = Vec::new();
        self.collect_ids(&mut existing);
        let mut incoming = Vec::new();
        device.collect_ids(&mut incoming);
        if let Some(dup) = incoming.iter().find(|id| existing.contains(id)) {
            return Err(DeviceError::DuplicateId(*dup));
        }

        device.control.bank_index = index;
        debug!(parent = self.id, device = device.id, index, "device connected");
        self.connected.insert(index, device);
        Ok(())
    }

    fn collect_ids(&self, ids: &mut Vec<u16>) {
        ids.push(self.id);
        for device in self.connected.values() {
            device.collect_ids(ids);
        }
    }

    /// Device connected at `index`.
    pub fn connected(&self, index: u8) -> Option<&Device> {
        self.connected.get(&index)
    }

    pub fn connected_mut(&mut self, index: u8) -> Option<&mut Device> {
        self.connected.get_mut(&index)
    }

    /// True if `source` may touch gated slots and the mapped block.
    fn is_controller(&self, source: u16) -> bool {
        source == self.id
            || (self.control.init_device != 0
                && source == self.control.init_device
                && self.halted)
    }

    /// Read control slot `slot` on behalf of device `source`.
    ///
    /// Slots 0-2 identify the device and are readable by anyone.
    pub fn read_control(&mut self, source: u16, slot: u8, peek: bool) -> u16 {
        let slot = slot & 0xF;
        if slot > slot::INIT_DEVICE && !self.is_controller(source) {
            trace!(device = self.id, source, slot, "control read dropped");
            return 0;
        }
        match slot {
            slot::ID => self.id,
            slot::TYPE => {
                (u16::from(self.control.bank_index) << 8) | u16::from(self.kind.device_type().code())
            }
            slot::INIT_DEVICE => self.control.init_device,
            slot::MAPPED_BLOCK => u16::from(self.control.mapped_block),
            slot::STATUS => u16::from(self.control.status),
            slot::INTERRUPT_HANDLER => self.control.interrupt_handler,
            _ => self.kind.read_control(slot, &self.memory, peek),
        }
    }

    /// Write control slot `slot` on behalf of device `source`.
    pub fn write_control(&mut self, source: u16, slot: u8, value: u16) {
        let slot = slot & 0xF;
        match slot {
            slot::ID | slot::TYPE => {
                trace!(device = self.id, source, slot, "write to read-only slot dropped");
            }
            slot::INIT_DEVICE => {
                let claimed = if self.is_controller(source) {
                    Some(value)
                } else if self.control.init_device == 0 {
                    Some(source)
                } else {
                    None
                };
                match claimed {
                    Some(init) => {
                        debug!(device = self.id, init, "init device set");
                        self.control.init_device = init;
                    }
                    None => trace!(device = self.id, source, "claim of owned device dropped"),
                }
            }
            _ if !self.is_controller(source) => {
                trace!(device = self.id, source, slot, "control write dropped");
            }
            slot::MAPPED_BLOCK => self.control.mapped_block = (value & 0xFF) as u8,
            slot::STATUS => self.control.status = (value & 0xFF) as u8,
            slot::INTERRUPT_HANDLER => self.control.interrupt_handler = value,
            _ => self.kind.write_control(slot, value, &mut self.memory),
        }
    }

    /// Local address reached through block offset `offset`.
    fn block_address(&self, offset: u8) -> u16 {
        (u16::from(self.control.mapped_block) << 8) | u16::from(offset)
    }

    /// Read a word of the mapped block on behalf of device `source`.
    pub fn read_block(&self, source: u16, offset: u8) -> u16 {
        if !self.is_controller(source) {
            trace!(device = self.id, source, offset, "block read dropped");
            return 0;
        }
        self.memory.read(self.block_address(offset))
    }

    /// Write a word of the mapped block on behalf of device `source`.
    pub fn write_block(&mut self, source: u16, offset: u8, value: u16) {
        if !self.is_controller(source) {
            trace!(device = self.id, source, offset, "block write dropped");
            return;
        }
        let address = self.block_address(offset);
        self.memory.write(address, value);
    }

    /// Read own memory.
    pub fn read_local(&self, address: u16) -> u16 {
        self.memory.read(address)
    }

    /// Write own memory, honouring the ROM region.
    pub fn write_local(&mut self, address: u16, value: u16) {
        self.memory.write(address, value);
    }

    /// Read `address` through this device's bus, as this device.
    pub fn bus_read(&mut self, address: u16, peek: bool) -> u16 {
        let source = self.id;
        if address < BLOCK_SPACE_START {
            let (index, slot) = ((address >> 4) as u8, (address & 0xF) as u8);
            if index == 0 {
                return self.read_control(source, slot, peek);
            }
            match self.connected.get_mut(&index) {
                Some(device) => device.read_control(source, slot, peek),
                None => 0,
            }
        } else {
            let (index, offset) = ((address >> 8) as u8, (address & 0xFF) as u8);
            match self.connected.get(&index) {
                Some(device) => device.read_block(source, offset),
                None => 0,
            }
        }
    }

    /// Write `value` to `address` through this device's bus, as this device.
    pub fn bus_write(&mut self, address: u16, value: u16) {
        let source = self.id;
        if address < BLOCK_SPACE_START {
            let (index, slot) = ((address >> 4) as u8, (address & 0xF) as u8);
            if index == 0 {
                self.write_control(source, slot, value);
            } else if let Some(device) = self.connected.get_mut(&index) {
                device.write_control(source, slot, value);
            } else {
                trace!(device = self.id, address, "write to empty bus index dropped");
            }
        } else {
            let (index, offset) = ((address >> 8) as u8, (address & 0xFF) as u8);
            if let Some(device) = self.connected.get_mut(&index) {
                device.write_block(source, offset, value);
            } else {
                trace!(device = self.id, address, "write to empty bus index dropped");
            }
        }
    }

    /// Advance simulated time on this device and everything below it.
    pub fn tick(&mut self, nanos: u64) {
        self.kind.tick(nanos, &self.memory);
        for device in self.connected.values_mut() {
            device.tick(nanos);
        }
    }
}

impl<K: DeviceBehavior> std::fmt::Debug for Device<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("type", &self.kind.device_type())
            .field("init_device", &self.control.init_device)
            .field("halted", &self.halted)
            .field("memory", &self.memory)
            .field("connected", &self.connected.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Errors raised while building or loading devices.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("address width {0} is not 0 or between 8 and 16")]
    InvalidAddressWidth(u8),

    #[error("device id 0 is reserved")]
    InvalidId,

    #[error("program size {size} exceeds available space {available}")]
    ProgramTooLarge { size: usize, available: usize },

    #[error("byte stream of length {0} does not hold whole 16-bit words")]
    MalformedStream(usize),

    #[error("bus index 0 addresses the device itself")]
    ReservedIndex,

    #[error("bus index {0} is already in use")]
    IndexInUse(u8),

    #[error("device id {0} is already present on this bus")]
    DuplicateId(u16),
}
