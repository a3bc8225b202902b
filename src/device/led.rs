//! A bank of 32 LEDs driven through two control slots.

use tracing::debug;

use super::{DeviceBehavior, DeviceType, Memory};

const LOW_WORD: u8 = 6;
const HIGH_WORD: u8 = 7;

#[derive(Debug, Clone, Copy, Default)]
pub struct LedBank {
    state: u32,
}

impl LedBank {
    pub fn new() -> Self {
        Self::default()
    }

    /// Is LED `index` (0-31) on?
    pub fn lit(&self, index: u8) -> bool {
        index < 32 && (self.state >> index) & 1 == 1
    }

    /// All 32 LEDs as a bit mask.
    pub fn state(&self) -> u32 {
        self.state
    }
}

impl DeviceBehavior for LedBank {
    fn device_type(&self) -> DeviceType {
        DeviceType::PinIo
    }

    fn read_control(&mut self, slot: u8, _memory: &Memory, _peek: bool) -> u16 {
        match slot {
            LOW_WORD => (self.state & 0xFFFF) as u16,
            HIGH_WORD => (self.state >> 16) as u16,
            _ => 0,
        }
    }

    fn write_control(&mut self, slot: u8, value: u16, _memory: &mut Memory) {
        let state = match slot {
            LOW_WORD => (self.state & 0xFFFF_0000) | u32::from(value),
            HIGH_WORD => (u32::from(value) << 16) | (self.state & 0xFFFF),
            _ => return,
        };
        if state != self.state {
            debug!(leds = state, "led bank changed");
        }
        self.state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_halves_are_independent() {
        let mut mem = Memory::new(0).unwrap();
        let mut leds = LedBank::new();
        leds.write_control(LOW_WORD, 0x0005, &mut mem);
        leds.write_control(HIGH_WORD, 0x8000, &mut mem);

        assert!(leds.lit(0));
        assert!(!leds.lit(1));
        assert!(leds.lit(2));
        assert!(leds.lit(31));
        assert!(!leds.lit(40));
        assert_eq!(leds.read_control(LOW_WORD, &mem, false), 0x0005);
        assert_eq!(leds.read_control(HIGH_WORD, &mem, false), 0x8000);
    }
}
