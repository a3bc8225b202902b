//! Conformance runner.
//!
//! Each `test <offset> <expected>` entry of a program runs on a fresh
//! machine: load, jump to the offset, run to the halt and compare the
//! halt code.

use std::io;

use tracing::{debug, warn};

use crate::machine::{Machine, MachineConfig, MachineError, RunOutcome};
use super::Program;

/// Cycle limit used when the configuration sets none, so a broken test
/// cannot spin forever.
pub const DEFAULT_TEST_CYCLES: u64 = 1_000_000;

/// Result of one conformance entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestOutcome {
    pub offset: u16,
    pub expected: u16,
    /// Halt code, or `None` if the cycle limit ran out first.
    pub actual: Option<u16>,
}

impl TestOutcome {
    pub fn passed(&self) -> bool {
        self.actual == Some(self.expected)
    }
}

/// Run every test entry of `program`.
pub fn run_tests(program: &Program, config: &MachineConfig) -> Result<Vec<TestOutcome>, MachineError> {
    let mut outcomes = Vec::with_capacity(program.tests.len());
    for (&offset, &expected) in &program.tests {
        let mut machine = Machine::from_config(config)?;
        machine.load(program)?;
        machine.processor_mut().regs_mut().set_pc(offset);
        if machine.max_cycles().is_none() {
            machine.set_max_cycles(Some(DEFAULT_TEST_CYCLES));
        }

        let actual = match machine.run(&mut io::sink(), &mut io::sink())? {
            RunOutcome::Halted { code } => Some(code),
            RunOutcome::CycleLimit { cycles } => {
                warn!(offset, cycles, "test did not halt");
                None
            }
        };
        let outcome = TestOutcome { offset, expected, actual };
        debug!(offset, expected, ?actual, passed = outcome.passed(), "test finished");
        outcomes.push(outcome);
    }
    Ok(outcomes)
}
