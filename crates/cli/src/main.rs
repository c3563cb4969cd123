//! rv32sim: command-line RV32I simulator.

use clap::Parser;
use rv32sim_executor::{
    ElfLoader, Executor, ExecutorError, FdTable, Memory, NopTracer, RunOutcome, TextTracer,
};
use std::path::PathBuf;
use std::process;
use tracing::debug;

/// RV32I instruction set simulator.
///
/// Loads a statically linked 32-bit little-endian RISC-V ELF executable,
/// sets the program counter to its `_start` symbol, and interprets
/// instructions until the guest exits through the HTIF channel, an error
/// occurs, or the cycle limit is reached. The process exit code is the
/// guest's exit value (or 1 on any simulator error).
#[derive(Parser)]
#[command(name = "rv32sim", version)]
struct Cli {
    /// ELF file to execute
    elf: PathBuf,

    /// Enable instruction tracing
    #[arg(short = 't', long)]
    trace: bool,

    /// Limit the number of simulation cycles (0 = unlimited)
    #[arg(long, value_name = "N", default_value_t = 0)]
    max_cycles: u64,

    /// Memory base address in bytes
    #[arg(long, value_name = "ADDR", value_parser = parse_u32, default_value = "0x10000")]
    mem_base: u32,

    /// Memory size in bytes
    #[arg(long, value_name = "BYTES", value_parser = parse_u32, default_value = "0x40000")]
    mem_size: u32,

    /// Verbose load/syscall diagnostics
    #[arg(short, long)]
    verbose: bool,
}

/// Parse a decimal or `0x`-prefixed hex integer.
fn parse_u32(s: &str) -> Result<u32, String> {
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        s.parse()
    };
    parsed.map_err(|e| format!("invalid number '{}': {}", s, e))
}

fn simulate(args: &Cli) -> Result<RunOutcome, ExecutorError> {
    let elf_data = std::fs::read(&args.elf)?;
    let loader = ElfLoader::parse(&elf_data)?;
    debug!("entry point: {:#x}", loader.entry_point());
    let (low, high) = loader.memory_bounds();
    debug!("image bounds: {:#x} - {:#x}", low, high);

    let mut memory = Memory::new(args.mem_base, args.mem_size);
    loader.load_into(&mut memory)?;

    let symbols = loader.symbol_table();
    let entry = symbols
        .address_of("_start")
        .ok_or_else(|| ExecutorError::SymbolNotFound("_start".to_string()))?;

    if args.trace {
        let tracer = TextTracer::new(std::io::stdout(), symbols);
        let mut executor = Executor::with_io(memory, tracer, FdTable::from_host_stdio()?);
        executor.state.pc = entry;
        executor.run(args.max_cycles)
    } else {
        let mut executor = Executor::with_io(memory, NopTracer, FdTable::from_host_stdio()?);
        executor.state.pc = entry;
        executor.run(args.max_cycles)
    }
}

fn main() {
    let args = Cli::parse();

    let level = if args.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match simulate(&args) {
        Ok(RunOutcome::Exit(code)) => process::exit(code as i32),
        Ok(RunOutcome::CycleLimit) => {
            debug!("cycle limit reached after {} cycles", args.max_cycles);
            process::exit(0);
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}
