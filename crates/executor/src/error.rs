//! Executor errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("unknown opcode at pc={pc:#x}: {bits:#010x}")]
    UnknownOpcode { pc: u32, bits: u32 },

    #[error("unknown funct at pc={pc:#x}: {bits:#010x}")]
    UnknownFunct { pc: u32, bits: u32 },

    #[error("unknown sys immediate: {imm}")]
    UnknownSysImm { imm: u32 },

    #[error("unknown syscall: {id}")]
    UnknownSyscall { id: u64 },

    #[error("invalid file descriptor: {fd}")]
    InvalidFileDescriptor { fd: u64 },

    #[error("misaligned {access} access at address {addr:#x}")]
    MisalignedAccess { addr: u32, access: &'static str },

    #[error("memory access out of bounds: address {addr:#x}")]
    OutOfBounds { addr: u32 },

    #[error("invalid ELF: {0}")]
    InvalidElf(String),

    #[error("symbol not found: {0}")]
    SymbolNotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
