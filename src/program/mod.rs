//! Program images for uCISC.
//!
//! This module provides:
//! - [`Program`], a flat word list plus its conformance expectations
//! - text and binary image loaders
//! - a disassembler (words → readable text)
//! - the conformance runner

pub mod image;
pub mod disasm;
pub mod conformance;

use std::collections::BTreeMap;

pub use image::{load_image, parse_image, save_image, format_image, load_binary, load_file, ImageError};
pub use disasm::{disassemble, disassemble_instruction};
pub use conformance::{run_tests, TestOutcome};

/// An assembled program.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Program {
    /// Instruction and data words, loaded at address 0.
    pub words: Vec<u16>,
    /// Start offset → expected halt code.
    pub tests: BTreeMap<u16, u16>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_words(words: Vec<u16>) -> Self {
        Self {
            words,
            tests: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Append `other` after this program, moving its test offsets along.
    pub fn append(&mut self, other: Program) {
        let base = self.words.len() as u16;
        self.words.extend(other.words);
        self.tests.extend(
            other
                .tests
                .into_iter()
                .map(|(offset, expected)| (offset.wrapping_add(base), expected)),
        );
    }

    /// Concatenate programs in order.
    pub fn concat(programs: impl IntoIterator<Item = Program>) -> Program {
        programs.into_iter().fold(Program::new(), |mut all, program| {
            all.append(program);
            all
        })
    }
}
