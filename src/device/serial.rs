//! Baud-limited serial line.
//!
//! Control slots:
//! - 0x7 - `(2 << 8) | tx slots free` (read)
//! - 0x8 - transmit byte (write)
//! - 0x9 - `(2 << 8) | rx bytes ready` (read)
//! - 0xA - receive byte (read, consumes it)
//!
//! Byte arrival and transmit completion are simulated: the host advances
//! the line with [`SerialLine::tick`] and one byte moves per byte period
//! at the configured baud rate (10 bits per byte: start, 8 data, stop).
//! The queues themselves are shared with a [`SerialPort`] handle so a host
//! thread reading a real file can feed bytes in while the processor runs.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Serialize, Deserialize};

use super::{DeviceBehavior, DeviceType, Memory};

/// Default line speed.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Both directions buffer at most this many bytes.
const BUFFER_DEPTH: u16 = 2;

const TX_STATUS: u8 = 7;
const TX_DATA: u8 = 8;
const RX_STATUS: u8 = 9;
const RX_DATA: u8 = 10;

/// What a receive read returns when no byte is ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "value", rename_all = "snake_case")]
pub enum NoDataFill {
    /// Always the same byte.
    Fixed(u8),
    /// Pseudo-random garbage from a seeded generator.
    Seeded(u64),
}

impl Default for NoDataFill {
    fn default() -> Self {
        NoDataFill::Fixed(0)
    }
}

#[derive(Debug)]
enum Filler {
    Fixed(u8),
    Random(StdRng),
}

impl Filler {
    fn next(&mut self) -> u8 {
        match self {
            Filler::Fixed(byte) => *byte,
            Filler::Random(rng) => rng.gen(),
        }
    }

    /// What a side-effect free read shows: the fixed byte, or 0 for a
    /// generator, which is left untouched.
    fn peek(&self) -> u8 {
        match self {
            Filler::Fixed(byte) => *byte,
            Filler::Random(_) => 0,
        }
    }
}

#[derive(Debug, Default)]
struct Queues {
    inbound: VecDeque<u8>,
    outbound: VecDeque<u8>,
}

/// Host side of a serial line.
#[derive(Debug, Clone)]
pub struct SerialPort {
    queues: Arc<Mutex<Queues>>,
}

impl SerialPort {
    /// Queue bytes arriving from the outside world.
    pub fn feed(&self, bytes: &[u8]) {
        lock(&self.queues).inbound.extend(bytes.iter().copied());
    }

    /// Take every byte the device has transmitted so far.
    pub fn drain(&self) -> Vec<u8> {
        lock(&self.queues).outbound.drain(..).collect()
    }

    /// Bytes fed but not yet read by the device.
    pub fn pending_inbound(&self) -> usize {
        lock(&self.queues).inbound.len()
    }
}

fn lock(queues: &Arc<Mutex<Queues>>) -> MutexGuard<'_, Queues> {
    // A panicked feeder thread leaves the queues intact
    queues.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Device side of a serial line.
#[derive(Debug)]
pub struct SerialLine {
    baud: u32,
    queues: Arc<Mutex<Queues>>,
    rx_available: u16,
    tx_available: u16,
    elapsed: u64,
    filler: Filler,
}

impl SerialLine {
    /// Create a line and the port handle the host uses to talk to it.
    pub fn new(baud: u32, fill: NoDataFill) -> (Self, SerialPort) {
        let queues = Arc::new(Mutex::new(Queues::default()));
        let filler = match fill {
            NoDataFill::Fixed(byte) => Filler::Fixed(byte),
            NoDataFill::Seeded(seed) => Filler::Random(StdRng::seed_from_u64(seed)),
        };
        let line = Self {
            baud: baud.max(10),
            queues: Arc::clone(&queues),
            rx_available: 0,
            tx_available: BUFFER_DEPTH,
            elapsed: 0,
            filler,
        };
        (line, SerialPort { queues })
    }

    pub fn baud(&self) -> u32 {
        self.baud
    }

    /// Simulated time needed to move one byte.
    pub fn nanos_per_byte(&self) -> u64 {
        1_000_000_000 / u64::from(self.baud / 10)
    }

    fn receive(&mut self, peek: bool) -> u16 {
        let mut queues = lock(&self.queues);
        if self.rx_available == 0 {
            drop(queues);
            let byte = if peek { self.filler.peek() } else { self.filler.next() };
            return u16::from(byte);
        }
        if peek {
            return queues.inbound.front().copied().map_or(0, u16::from);
        }
        match queues.inbound.pop_front() {
            Some(byte) => {
                self.rx_available -= 1;
                u16::from(byte)
            }
            None => {
                self.rx_available = 0;
                drop(queues);
                u16::from(self.filler.next())
            }
        }
    }

    fn transmit(&mut self, value: u16) {
        let byte = (value & 0xFF) as u8;
        let mut queues = lock(&self.queues);
        if self.tx_available == 0 {
            // Line still busy: the new byte lands before the old one goes out
            match queues.outbound.back_mut() {
                Some(last) => *last = byte,
                None => queues.outbound.push_back(byte),
            }
        } else {
            self.tx_available -= 1;
            queues.outbound.push_back(byte);
        }
    }
}

impl DeviceBehavior for SerialLine {
    fn device_type(&self) -> DeviceType {
        DeviceType::Serial
    }

    fn read_control(&mut self, slot: u8, _memory: &Memory, peek: bool) -> u16 {
        match slot {
            TX_STATUS => (BUFFER_DEPTH << 8) | self.tx_available,
            RX_STATUS => (BUFFER_DEPTH << 8) | self.rx_available,
            RX_DATA => self.receive(peek),
            _ => 0,
        }
    }

    fn write_control(&mut self, slot: u8, value: u16, _memory: &mut Memory) {
        if slot == TX_DATA {
            self.transmit(value);
        }
    }

    fn tick(&mut self, nanos: u64, _memory: &Memory) {
        let period = self.nanos_per_byte();
        self.elapsed += nanos;
        while self.elapsed >= period {
            self.elapsed -= period;
            let queued = lock(&self.queues).inbound.len();
            if self.rx_available < BUFFER_DEPTH && usize::from(self.rx_available) < queued {
                self.rx_available += 1;
            }
            if self.tx_available < BUFFER_DEPTH {
                self.tx_available += 1;
            }
            if self.rx_available == BUFFER_DEPTH && self.tx_available == BUFFER_DEPTH {
                // Nothing left to move this tick
                self.elapsed %= period;
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty() -> Memory {
        Memory::new(0).unwrap()
    }

    #[test]
    fn test_bytes_arrive_at_baud_rate() {
        let mem = empty();
        let (mut line, port) = SerialLine::new(9600, NoDataFill::Fixed(0xEE));
        port.feed(b"hi!");

        assert_eq!(line.read_control(RX_STATUS, &mem, false), 0x0200);
        assert_eq!(line.read_control(RX_DATA, &mem, false), 0xEE);

        let period = line.nanos_per_byte();
        line.tick(period, &mem);
        assert_eq!(line.read_control(RX_STATUS, &mem, false), 0x0201);
        line.tick(period * 5, &mem);
        assert_eq!(line.read_control(RX_STATUS, &mem, false), 0x0202);

        assert_eq!(line.read_control(RX_DATA, &mem, true), u16::from(b'h'));
        assert_eq!(line.read_control(RX_DATA, &mem, false), u16::from(b'h'));
        assert_eq!(line.read_control(RX_DATA, &mem, false), u16::from(b'i'));
        assert_eq!(line.read_control(RX_DATA, &mem, false), 0xEE);
        assert_eq!(port.pending_inbound(), 1);
    }

    #[test]
    fn test_transmit_is_rate_limited() {
        let mut mem = empty();
        let (mut line, port) = SerialLine::new(9600, NoDataFill::default());

        line.write_control(TX_DATA, u16::from(b'a'), &mut mem);
        line.write_control(TX_DATA, u16::from(b'b'), &mut mem);
        assert_eq!(line.read_control(TX_STATUS, &mem, false), 0x0200);
        // No free slot: overwrites the last byte
        line.write_control(TX_DATA, u16::from(b'c'), &mut mem);
        assert_eq!(port.drain(), b"ac".to_vec());

        line.tick(line.nanos_per_byte(), &mem);
        assert_eq!(line.read_control(TX_STATUS, &mem, false), 0x0201);
        line.write_control(TX_DATA, u16::from(b'd'), &mut mem);
        assert_eq!(port.drain(), b"d".to_vec());
    }

    #[test]
    fn test_seeded_filler_is_reproducible() {
        let mem = empty();
        let (mut a, _) = SerialLine::new(DEFAULT_BAUD, NoDataFill::Seeded(7));
        let (mut b, _) = SerialLine::new(DEFAULT_BAUD, NoDataFill::Seeded(7));
        let left: Vec<u16> = (0..8).map(|_| a.read_control(RX_DATA, &mem, false)).collect();
        let right: Vec<u16> = (0..8).map(|_| b.read_control(RX_DATA, &mem, false)).collect();
        assert_eq!(left, right);
    }

    #[test]
    fn test_peek_leaves_filler_alone() {
        let mem = empty();
        let (mut peeked, _) = SerialLine::new(DEFAULT_BAUD, NoDataFill::Seeded(7));
        let (mut untouched, _) = SerialLine::new(DEFAULT_BAUD, NoDataFill::Seeded(7));

        assert_eq!(peeked.read_control(RX_DATA, &mem, true), 0);
        assert_eq!(peeked.read_control(RX_DATA, &mem, true), 0);
        assert_eq!(
            peeked.read_control(RX_DATA, &mem, false),
            untouched.read_control(RX_DATA, &mem, false)
        );

        let (mut fixed, _) = SerialLine::new(DEFAULT_BAUD, NoDataFill::Fixed(0xEE));
        assert_eq!(fixed.read_control(RX_DATA, &mem, true), 0xEE);
    }

    #[test]
    fn test_feed_from_another_thread() {
        let mem = empty();
        let (mut line, port) = SerialLine::new(DEFAULT_BAUD, NoDataFill::default());
        let feeder = port.clone();
        std::thread::spawn(move || feeder.feed(b"xyz")).join().unwrap();

        line.tick(line.nanos_per_byte() * 2, &mem);
        assert_eq!(line.read_control(RX_DATA, &mem, false), u16::from(b'x'));
    }
}
