//! Device-local memory.
//!
//! Every device owns a flat array of 16-bit words sized by its address
//! width (2^width words). A width of 0 means the device has no local
//! memory at all. The words below `rom_end` form a read-only boot region.

use serde::{Serialize, Deserialize};

use super::DeviceError;

/// Smallest non-zero address width a device may declare.
pub const MIN_ADDRESS_WIDTH: u8 = 8;
/// Largest address width a device may declare.
pub const MAX_ADDRESS_WIDTH: u8 = 16;

/// A device's private word array.
#[derive(Clone, Serialize, Deserialize)]
pub struct Memory {
    width: u8,
    cells: Vec<u16>,
    rom_end: usize,
}

impl Memory {
    /// Create a zeroed memory of 2^width words.
    ///
    /// Width 0 yields an empty memory; anything else outside 8..=16 is a
    /// misconfigured device.
    pub fn new(width: u8) -> Result<Self, DeviceError> {
        let size = match width {
            0 => 0,
            MIN_ADDRESS_WIDTH..=MAX_ADDRESS_WIDTH => 1usize << width,
            _ => return Err(DeviceError::InvalidAddressWidth(width)),
        };
        Ok(Self {
            width,
            cells: vec![0; size],
            rom_end: 0,
        })
    }

    /// Address width this memory was built with.
    pub fn width(&self) -> u8 {
        self.width
    }

    /// Number of words.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// True when the device has no local memory.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// First writable address.
    pub fn rom_end(&self) -> usize {
        self.rom_end
    }

    /// Read a word. Addresses wrap modulo the memory size.
    #[inline]
    pub fn read(&self, addr: u16) -> u16 {
        if self.cells.is_empty() {
            return 0;
        }
        self.cells[addr as usize % self.cells.len()]
    }

    /// Write a word. Writes into the ROM region are ignored.
    #[inline]
    pub fn write(&mut self, addr: u16, value: u16) {
        if self.cells.is_empty() {
            return;
        }
        let index = addr as usize % self.cells.len();
        if index >= self.rom_end {
            self.cells[index] = value;
        }
    }

    /// Load a program at address 0, leaving the region writable.
    pub fn load_program(&mut self, program: &[u16]) -> Result<(), DeviceError> {
        if program.len() > self.cells.len() {
            return Err(DeviceError::ProgramTooLarge {
                size: program.len(),
                available: self.cells.len(),
            });
        }
        self.cells[..program.len()].copy_from_slice(program);
        Ok(())
    }

    /// Load a program at address 0 and protect it as the boot ROM.
    pub fn load_rom(&mut self, program: &[u16]) -> Result<(), DeviceError> {
        self.rom_end = 0;
        self.load_program(program)?;
        self.rom_end = program.len();
        Ok(())
    }

    /// Pack a big-endian byte stream into words and load it at address 0.
    pub fn load_bytes(&mut self, bytes: &[u8]) -> Result<(), DeviceError> {
        let words = words_from_bytes(bytes)?;
        self.load_program(&words)
    }

    /// All words, for snapshots and debugging.
    pub fn words(&self) -> &[u16] {
        &self.cells
    }
}

/// Pack big-endian bytes into 16-bit words.
pub fn words_from_bytes(bytes: &[u8]) -> Result<Vec<u16>, DeviceError> {
    if bytes.len() % 2 != 0 {
        return Err(DeviceError::MalformedStream(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

impl std::fmt::Debug for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Only count non-zero cells
        let non_zero = self.cells.iter().filter(|cell| **cell != 0).count();

        f.debug_struct("Memory")
            .field("width", &self.width)
            .field("non_zero_cells", &non_zero)
            .field("rom_end", &self.rom_end)
            .finish()
    }
}
