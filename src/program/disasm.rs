//! Disassembler for uCISC programs.
//!
//! Converts instruction words back to readable text, two words at a time.

use crate::cpu::decode::decode;

/// Disassemble a single instruction to text.
pub fn disassemble_instruction(high: u16, low: u16) -> String {
    decode(high, low).to_string()
}

/// Disassemble a word list loaded at address 0.
pub fn disassemble(words: &[u16]) -> String {
    let mut output = String::new();
    output.push_str("; uCISC disassembly\n");
    output.push_str("; ------------------\n\n");

    for (i, pair) in words.chunks(2).enumerate() {
        let addr = i * 2;
        match *pair {
            [high, low] => output.push_str(&format!(
                "{:04x}: {:04x} {:04x}  {}\n",
                addr,
                high,
                low,
                disassemble_instruction(high, low)
            )),
            // Trailing data word
            [word] => output.push_str(&format!("{:04x}: {:04x}       .word\n", addr, word)),
            _ => {}
        }
    }

    output
}
