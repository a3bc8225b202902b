//! Line-oriented interactive debugger.
//!
//! A halt becomes a breakpoint: the debugger prints the processor state,
//! reads commands until one of them resumes execution, then continues past
//! the halting instruction.
//!
//! Commands:
//! - `c`, `continue`: run to the next halt
//! - empty line, `n`, `next`, `s`, `step`: execute one instruction
//! - `p`, `print`: print the processor state again
//! - `peek <code>`: show what source operand `code` (0-15) reads
//! - `e`, `exit`: stop debugging (end of input does the same)

use std::io::{self, BufRead, Write};

use tracing::debug;

use crate::machine::{Machine, MachineError};

/// A parsed debugger command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Continue,
    Step,
    Print,
    Peek(u8),
    Exit,
    Unknown(String),
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        let mut words = line.split_whitespace();
        let name = words.next().unwrap_or("").to_ascii_lowercase();
        match name.as_str() {
            "c" | "continue" => Command::Continue,
            "" | "n" | "next" | "s" | "step" => Command::Step,
            "p" | "print" => Command::Print,
            "e" | "exit" | "q" | "quit" => Command::Exit,
            "peek" => match words.next().and_then(parse_code) {
                Some(code) => Command::Peek(code),
                None => Command::Unknown(line.to_string()),
            },
            _ => Command::Unknown(line.to_string()),
        }
    }
}

fn parse_code(token: &str) -> Option<u8> {
    let code = match token.strip_prefix("0x") {
        Some(hex) => u8::from_str_radix(hex, 16).ok()?,
        None => token.parse().ok()?,
    };
    (code < 16).then_some(code)
}

/// How a debugging session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugOutcome {
    Exited,
    CycleLimit { cycles: u64 },
}

/// Debugger state.
pub struct Debugger<R, W> {
    input: R,
    output: W,
    /// Stop after every instruction, not just on halts.
    stepping: bool,
}

impl<R: BufRead, W: Write> Debugger<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self {
            input,
            output,
            stepping: false,
        }
    }

    pub fn output(&self) -> &W {
        &self.output
    }

    /// Drive `machine` until the user exits or the cycle limit runs out.
    /// Device output is written to the debugger's output.
    pub fn run(&mut self, machine: &mut Machine) -> Result<DebugOutcome, MachineError> {
        let start = machine.processor().cycles();
        loop {
            if self.stepping || machine.processor().is_halted() {
                self.print_state(machine)?;
                if !self.prompt(machine)? {
                    return Ok(DebugOutcome::Exited);
                }
                machine.processor_mut().resume();
            }

            let used = machine.processor().cycles() - start;
            if machine.max_cycles().is_some_and(|max| used >= max) {
                writeln!(self.output, "cycle limit reached after {} instructions", used)?;
                return Ok(DebugOutcome::CycleLimit { cycles: used });
            }

            machine.processor_mut().step()?;
            self.pump(machine)?;
        }
    }

    /// Read commands until one resumes execution. Returns false to exit.
    fn prompt(&mut self, machine: &mut Machine) -> Result<bool, MachineError> {
        loop {
            write!(self.output, "> ")?;
            self.output.flush()?;

            let mut line = String::new();
            if self.input.read_line(&mut line)? == 0 {
                writeln!(self.output)?;
                return Ok(false);
            }

            let command = Command::parse(&line);
            debug!(?command, "debugger command");
            match command {
                Command::Continue => {
                    self.stepping = false;
                    return Ok(true);
                }
                Command::Step => {
                    self.stepping = true;
                    return Ok(true);
                }
                Command::Print => self.print_state(machine)?,
                Command::Peek(code) => {
                    let value = machine.processor_mut().peek(code);
                    writeln!(self.output, "peek {} = {:#06x}", code, value)?;
                }
                Command::Exit => return Ok(false),
                Command::Unknown(text) => {
                    writeln!(self.output, "unknown command '{}' (c, n, p, peek <code>, e)", text)?;
                }
            }
        }
    }

    fn print_state(&mut self, machine: &Machine) -> io::Result<()> {
        let cpu = machine.processor();
        let regs = cpu.regs();
        if let crate::cpu::CpuState::Halted { code } = cpu.state() {
            writeln!(self.output, "halted with code {:#06x}", code)?;
        }
        writeln!(
            self.output,
            "pc={:#06x} next={:#06x} flags={:?} overflow={:#06x} int={:#06x} cycles={}",
            regs.pc(),
            regs.next(),
            regs.flags,
            regs.overflow,
            cpu.device().interrupt_handler(),
            cpu.cycles()
        )?;
        let general: Vec<String> = (1..=6)
            .map(|n| format!("r{}={:#06x}", n, regs.get(n)))
            .collect();
        writeln!(self.output, "{}", general.join(" "))?;
        writeln!(self.output, "{:04x}: {}", regs.pc(), cpu.current_instruction())
    }

    fn pump(&mut self, machine: &Machine) -> io::Result<()> {
        let (mut serial, mut terminal) = (Vec::new(), Vec::new());
        machine.pump(&mut serial, &mut terminal)?;
        self.output.write_all(&serial)?;
        self.output.write_all(&terminal)
    }
}
