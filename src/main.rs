//! uCISC Emulator - CLI Entry Point
//!
//! Commands:
//! - `ucisc-emu run <program>...` - Run programs until they halt
//! - `ucisc-emu test <program>...` - Run the `test` entries of each program
//! - `ucisc-emu disasm <program>` - Disassemble an image
//! - `ucisc-emu dump-config` - Print the machine configuration as JSON

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::thread;

use clap::{Parser, Subcommand};
use tracing::{debug, warn};

use ucisc::{
    disassemble, load_file, run_tests, DebugOutcome, Debugger, Machine, MachineConfig, Program,
    RunOutcome, SerialPort,
};

#[derive(Parser)]
#[command(name = "ucisc-emu")]
#[command(version)]
#[command(about = "An emulator for the uCISC 16-bit instruction set")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run programs until the processor halts
    Run {
        /// Images to load, concatenated in order (`.bin` files are raw words)
        #[arg(required = true)]
        programs: Vec<PathBuf>,
        /// Stop at every halt and read debugger commands from stdin
        #[arg(short, long)]
        debug: bool,
        /// Machine configuration (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Bytes fed to the first serial line
        #[arg(long)]
        rx: Option<PathBuf>,
        /// Where the first serial line's output goes (default: stdout)
        #[arg(long)]
        tx: Option<PathBuf>,
        /// Maximum number of instructions to run
        #[arg(short, long)]
        max_cycles: Option<u64>,
        /// Log every executed instruction
        #[arg(short, long)]
        trace: bool,
        /// Write a JSON snapshot of the processor here after the run
        #[arg(long)]
        dump: Option<PathBuf>,
    },
    /// Run the conformance tests embedded in programs
    Test {
        #[arg(required = true)]
        programs: Vec<PathBuf>,
        /// Machine configuration (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Disassemble an image to readable text
    Disasm {
        program: PathBuf,
    },
    /// Print the machine configuration (default, or `--config` normalised)
    DumpConfig {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();

    let trace = matches!(cli.command, Commands::Run { trace: true, .. });
    init_logging(trace);

    match cli.command {
        Commands::Run { programs, debug, config, rx, tx, max_cycles, trace: _, dump } => {
            let options = RunOptions { debug, rx, tx, max_cycles, dump };
            run_programs(&programs, config.as_deref(), options);
        }
        Commands::Test { programs, config } => {
            test_programs(&programs, config.as_deref());
        }
        Commands::Disasm { program } => {
            disassemble_file(&program);
        }
        Commands::DumpConfig { config } => {
            let config = load_config(config.as_deref());
            match config.to_json() {
                Ok(json) => println!("{}", json),
                Err(e) => fail(format!("Failed to render configuration: {}", e)),
            }
        }
    }
}

/// Logs go to stderr; stdout carries device output.
fn init_logging(trace: bool) {
    let default = if trace { "ucisc=trace" } else { "ucisc=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_writer(io::stderr)
        .init();
}

fn fail(message: String) -> ! {
    eprintln!("error: {}", message);
    std::process::exit(1);
}

fn load_config(path: Option<&Path>) -> MachineConfig {
    match path {
        Some(path) => MachineConfig::load(path)
            .unwrap_or_else(|e| fail(format!("Failed to load {}: {}", path.display(), e))),
        None => MachineConfig::default(),
    }
}

fn load_programs(paths: &[PathBuf]) -> Program {
    let programs = paths.iter().map(|path| {
        let program = load_file(path)
            .unwrap_or_else(|e| fail(format!("Failed to load {}: {}", path.display(), e)));
        debug!(path = %path.display(), words = program.len(), "program loaded");
        program
    });
    let program = Program::concat(programs.collect::<Vec<_>>());
    if program.is_empty() {
        fail("No instructions to execute".to_string());
    }
    program
}

struct RunOptions {
    debug: bool,
    rx: Option<PathBuf>,
    tx: Option<PathBuf>,
    max_cycles: Option<u64>,
    dump: Option<PathBuf>,
}

fn run_programs(paths: &[PathBuf], config: Option<&Path>, options: RunOptions) {
    let config = load_config(config);
    let program = load_programs(paths);

    let mut machine = Machine::from_config(&config)
        .unwrap_or_else(|e| fail(format!("Failed to build machine: {}", e)));
    if options.max_cycles.is_some() {
        machine.set_max_cycles(options.max_cycles);
    }
    if let Err(e) = machine.load(&program) {
        fail(format!("Failed to load program: {}", e));
    }

    if let Some(rx) = &options.rx {
        match machine.serial() {
            Some(port) => spawn_feeder(rx, port.clone()),
            None => warn!("--rx given but the machine has no serial line"),
        }
    }

    if options.debug {
        let stdin = io::stdin();
        let mut debugger = Debugger::new(stdin.lock(), io::stdout());
        match debugger.run(&mut machine) {
            Ok(DebugOutcome::Exited) => {}
            Ok(DebugOutcome::CycleLimit { cycles }) => {
                eprintln!("Reached max cycles limit ({}). Use --max-cycles to increase.", cycles);
            }
            Err(e) => fail(format!("Debugger error: {}", e)),
        }
    } else {
        let mut serial: Box<dyn Write> = match &options.tx {
            Some(path) => match File::create(path) {
                Ok(file) => Box::new(file),
                Err(e) => fail(format!("Failed to open {}: {}", path.display(), e)),
            },
            None => Box::new(io::stdout()),
        };
        let mut terminal = io::stdout();

        match machine.run(&mut serial, &mut terminal) {
            Ok(RunOutcome::Halted { code }) => {
                eprintln!(
                    "Halted at pc={:#06x} with code {:#06x} after {} cycles",
                    machine.processor().regs().pc(),
                    code,
                    machine.processor().cycles()
                );
            }
            Ok(RunOutcome::CycleLimit { cycles }) => {
                eprintln!("Reached max cycles limit ({}). Use --max-cycles to increase.", cycles);
            }
            Err(e) => fail(format!("Execution error: {}", e)),
        }
    }

    if let Some(path) = &options.dump {
        write_snapshot(&machine, path);
    }
}

/// Feed a byte stream into a serial line from its own thread, so a blocking
/// file descriptor (a FIFO, a tty) never stalls the processor.
fn spawn_feeder(path: &Path, port: SerialPort) {
    let file = File::open(path)
        .unwrap_or_else(|e| fail(format!("Failed to open {}: {}", path.display(), e)));
    let name = path.display().to_string();
    thread::spawn(move || {
        let mut reader = BufReader::new(file);
        let mut buf = [0u8; 256];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => port.feed(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(file = %name, error = %e, "serial input stopped");
                    break;
                }
            }
        }
        debug!(file = %name, "serial input finished");
    });
}

fn write_snapshot(machine: &Machine, path: &Path) {
    let snapshot = machine.processor().snapshot();
    let json = serde_json::to_string_pretty(&snapshot)
        .unwrap_or_else(|e| fail(format!("Failed to serialise snapshot: {}", e)));
    if let Err(e) = std::fs::write(path, json) {
        fail(format!("Failed to write {}: {}", path.display(), e));
    }
}

fn test_programs(paths: &[PathBuf], config: Option<&Path>) {
    let config = load_config(config);

    let mut passed = 0;
    let mut failed = 0;
    for path in paths {
        let program = load_file(path)
            .unwrap_or_else(|e| fail(format!("Failed to load {}: {}", path.display(), e)));
        if program.tests.is_empty() {
            println!("{}: no tests", path.display());
            continue;
        }

        let outcomes = run_tests(&program, &config)
            .unwrap_or_else(|e| fail(format!("Failed to run {}: {}", path.display(), e)));
        for outcome in outcomes {
            let actual = match outcome.actual {
                Some(code) => format!("{:#06x}", code),
                None => "no halt".to_string(),
            };
            if outcome.passed() {
                println!("{} @ {:#06x}... ok", path.display(), outcome.offset);
                passed += 1;
            } else {
                println!(
                    "{} @ {:#06x}... FAILED (expected {:#06x}, got {})",
                    path.display(),
                    outcome.offset,
                    outcome.expected,
                    actual
                );
                failed += 1;
            }
        }
    }

    println!();
    println!("Results: {} passed, {} failed", passed, failed);
    if failed > 0 {
        std::process::exit(1);
    }
}

fn disassemble_file(path: &Path) {
    let program = load_file(path)
        .unwrap_or_else(|e| fail(format!("Failed to load {}: {}", path.display(), e)));
    println!("{}", disassemble(&program.words));
}
