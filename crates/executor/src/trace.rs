//! Per-instruction textual trace.
//!
//! Each executed instruction emits one line: cycle count, fetch PC, the
//! nearest symbol (when known), the mnemonic, then operand fields rendered
//! by kind. The executor is generic over [`Tracer`], so the disabled path
//! ([`NopTracer`]) monomorphises to empty inlined calls and carries no
//! formatting cost.

use crate::elf::SymbolTable;
use crate::hart::register_name;
use std::io::Write;

/// One operand of a traced instruction.
#[derive(Debug, Clone, Copy)]
pub enum TraceOperand {
    /// Destination register index.
    RegDst(u8),
    /// Source register index with the value read at dispatch.
    RegSrc(u8, u32),
    /// Immediate, rendered as signed decimal.
    Imm(i32),
    /// Syscall argument, rendered as unsigned decimal.
    Arg(u64),
}

/// Sink for per-instruction trace records.
///
/// All methods default to no-ops; an implementation overrides the ones it
/// renders. `insn` opens a record, the write/read hooks append effects,
/// `end` closes the line.
pub trait Tracer {
    fn insn(&mut self, _cycle: u64, _pc: u32, _mnemonic: &str, _operands: &[TraceOperand]) {}
    fn reg_write(&mut self, _reg: u8, _value: u32) {}
    fn mem_write(&mut self, _addr: u32, _value: u32) {}
    fn mem_read(&mut self, _reg: u8, _addr: u32, _value: u32) {}
    fn end(&mut self) {}
}

/// Tracer that renders nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NopTracer;

impl Tracer for NopTracer {}

/// Text tracer writing one line per instruction.
pub struct TextTracer<W: Write> {
    out: W,
    symbols: SymbolTable,
}

impl<W: Write> TextTracer<W> {
    pub fn new(out: W, symbols: SymbolTable) -> Self {
        Self { out, symbols }
    }

    /// Consume the tracer and return the underlying writer.
    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> Tracer for TextTracer<W> {
    fn insn(&mut self, cycle: u64, pc: u32, mnemonic: &str, operands: &[TraceOperand]) {
        let _ = write!(self.out, "{:<8} 0x{:<8X} ", cycle, pc);
        if let Some(name) = self.symbols.nearest(pc) {
            let _ = write!(self.out, "{:<16} ", name);
        }
        let _ = write!(self.out, "{:<7} ", mnemonic);
        for operand in operands {
            match *operand {
                TraceOperand::RegDst(reg) => {
                    let _ = write!(self.out, "{} ", register_name(reg));
                }
                TraceOperand::RegSrc(reg, value) => {
                    let _ = write!(self.out, "{} ({:#x}) ", register_name(reg), value);
                }
                TraceOperand::Imm(value) => {
                    let _ = write!(self.out, "{} ", value);
                }
                TraceOperand::Arg(value) => {
                    let _ = write!(self.out, "{} ", value);
                }
            }
        }
    }

    fn reg_write(&mut self, reg: u8, value: u32) {
        let _ = write!(self.out, "{}={:#x} ", register_name(reg), value);
    }

    fn mem_write(&mut self, addr: u32, value: u32) {
        let _ = write!(self.out, "mem[{:#x}]={:#x} ", addr, value);
    }

    fn mem_read(&mut self, reg: u8, addr: u32, value: u32) {
        let _ = write!(
            self.out,
            "{}={:#x} from mem[{:#x}] ",
            register_name(reg),
            value,
            addr
        );
    }

    fn end(&mut self) {
        let _ = writeln!(self.out);
    }
}
