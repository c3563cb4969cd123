//! RV32I instruction set executor.
//!
//! This crate provides:
//! - A base-RV32I hart model (registers, PC, cycle counter)
//! - Byte-addressable guest memory with sub-word packing
//! - The fetch/decode/dispatch execution core
//! - The HTIF syscall channel (read/write/exit) to host stdio
//! - An optional per-instruction text trace
//! - An ELF32 loader with symbol lookup

pub mod bits;
pub mod cpu;
pub mod decode;
pub mod elf;
pub mod error;
pub mod hart;
pub mod memory;
pub mod syscall;
pub mod trace;

pub use cpu::{Executor, RunOutcome, StepOutcome};
pub use elf::{ElfLoader, SymbolTable};
pub use error::ExecutorError;
pub use hart::HartState;
pub use memory::Memory;
pub use syscall::FdTable;
pub use trace::{NopTracer, TextTracer, Tracer};
