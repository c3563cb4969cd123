//! Host-target interface (HTIF) syscall channel.
//!
//! Guest programs hand commands to the simulator through a pair of
//! memory-mapped doublewords: the guest writes the address of an
//! 8-doubleword command block to `tohost`, the simulator services the
//! command, writes the return value to `fromhost`, and clears `tohost`.
//! The command block is `{ id, arg[7] }`, little-endian.

use crate::error::ExecutorError;
use crate::memory::Memory;
use std::fs::File;
use std::io::{stderr, stdin, stdout};
use std::os::fd::AsFd;

/// Guest address of the HTIF `tohost` doubleword.
pub const HTIF_TOHOST_ADDRESS: u32 = 0x2000;

/// Guest address of the HTIF `fromhost` doubleword.
pub const HTIF_FROMHOST_ADDRESS: u32 = 0x2008;

/// Recognised HTIF command ids (Linux syscall numbering).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum SyscallCode {
    /// Read from a host file descriptor into guest memory.
    /// args: fd, buffer address, length. Returns bytes read.
    Read = 63,
    /// Write guest memory to a host file descriptor.
    /// args: fd, buffer address, length. Returns bytes written.
    Write = 64,
    /// Terminate the guest. args: exit code.
    Exit = 93,
}

impl SyscallCode {
    pub fn from_u64(id: u64) -> Option<Self> {
        match id {
            63 => Some(Self::Read),
            64 => Some(Self::Write),
            93 => Some(Self::Exit),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Read => "READ",
            Self::Write => "WRITE",
            Self::Exit => "EXIT",
        }
    }
}

/// An HTIF command block read out of guest memory.
#[derive(Debug, Clone, Copy)]
pub struct HtifCommand {
    pub id: u64,
    pub args: [u64; 7],
}

impl HtifCommand {
    /// Read the 8-doubleword block at `addr`.
    pub fn read_from(memory: &Memory, addr: u32) -> Result<Self, ExecutorError> {
        let id = memory.read_dword(addr)?;
        let mut args = [0u64; 7];
        for (i, arg) in args.iter_mut().enumerate() {
            *arg = memory.read_dword(addr + 8 * (i as u32 + 1))?;
        }
        Ok(Self { id, args })
    }
}

/// Host file descriptors available to the guest, indexed by slot.
///
/// Slots hold owned duplicates of host descriptors; each is closed when
/// the table is dropped.
pub struct FdTable {
    files: Vec<File>,
}

impl FdTable {
    /// An empty table. Slots can be added with [`FdTable::add`].
    pub fn new() -> Self {
        Self { files: Vec::new() }
    }

    /// Slots 0/1/2 duplicate the process stdin/stdout/stderr.
    pub fn from_host_stdio() -> Result<Self, ExecutorError> {
        let mut table = Self::new();
        table.add(File::from(stdin().as_fd().try_clone_to_owned()?));
        table.add(File::from(stdout().as_fd().try_clone_to_owned()?));
        table.add(File::from(stderr().as_fd().try_clone_to_owned()?));
        Ok(table)
    }

    /// Append a file, returning its slot index.
    pub fn add(&mut self, file: File) -> u64 {
        self.files.push(file);
        (self.files.len() - 1) as u64
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Look up a slot for I/O.
    pub fn get_mut(&mut self, slot: u64) -> Result<&mut File, ExecutorError> {
        let index = usize::try_from(slot)
            .map_err(|_| ExecutorError::InvalidFileDescriptor { fd: slot })?;
        self.files
            .get_mut(index)
            .ok_or(ExecutorError::InvalidFileDescriptor { fd: slot })
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}
