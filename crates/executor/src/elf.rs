//! RISC-V ELF32 binary loader.
//!
//! Parses statically linked little-endian ELF32 executables for RISC-V,
//! copies their `PT_LOAD` segments into guest memory, and exposes the
//! symbol table for entry-point lookup and trace annotation.
//!
//! Validation: ELF magic, 32-bit class, little-endian encoding, `ET_EXEC`
//! type, `EM_RISCV` machine, version 1, and that every loaded segment's
//! data lies within the file and fits in the configured memory region.

use crate::error::ExecutorError;
use crate::memory::Memory;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// ELF magic number: 0x7f 'E' 'L' 'F'.
const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

/// ELF class: 32-bit.
const ELFCLASS32: u8 = 1;

/// ELF data encoding: little-endian.
const ELFDATA2LSB: u8 = 1;

/// Current ELF version.
const EV_CURRENT: u8 = 1;

/// ELF type: executable file.
const ET_EXEC: u16 = 2;

/// ELF machine type: RISC-V.
const EM_RISCV: u16 = 243;

/// Program header type: loadable segment.
const PT_LOAD: u32 = 1;

/// Section type: symbol table.
const SHT_SYMTAB: u32 = 2;

/// Section type: string table.
const SHT_STRTAB: u32 = 3;

/// Section type: dynamic symbol table.
const SHT_DYNSYM: u32 = 11;

/// ELF header size for 32-bit.
const ELF32_HEADER_SIZE: usize = 52;

/// Program header size for 32-bit.
const ELF32_PHDR_SIZE: usize = 32;

/// Section header size for 32-bit.
const ELF32_SHDR_SIZE: usize = 40;

/// Symbol table entry size for 32-bit.
const ELF32_SYM_SIZE: usize = 16;

#[inline]
fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

#[inline]
fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

/// ELF file header (32-bit).
#[derive(Debug, Clone)]
pub struct Elf32Header {
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub entry: u32,
    pub phoff: u32,
    pub shoff: u32,
    pub flags: u32,
    pub ehsize: u16,
    pub phentsize: u16,
    pub phnum: u16,
    pub shentsize: u16,
    pub shnum: u16,
    pub shstrndx: u16,
}

/// Program header (32-bit). `PT_LOAD` entries describe the memory image.
#[derive(Debug, Clone)]
pub struct Elf32ProgramHeader {
    pub p_type: u32,
    pub p_offset: u32,
    pub p_vaddr: u32,
    pub p_paddr: u32,
    pub p_filesz: u32,
    pub p_memsz: u32,
    pub p_flags: u32,
    pub p_align: u32,
}

/// Section header (32-bit). Only symbol/string table sections are consumed.
#[derive(Debug, Clone)]
pub struct Elf32SectionHeader {
    pub sh_name: u32,
    pub sh_type: u32,
    pub sh_flags: u32,
    pub sh_addr: u32,
    pub sh_offset: u32,
    pub sh_size: u32,
    pub sh_link: u32,
    pub sh_info: u32,
    pub sh_addralign: u32,
    pub sh_entsize: u32,
}

/// Symbol table entry (32-bit).
#[derive(Debug, Clone)]
pub struct Elf32Symbol {
    pub st_name: u32,
    pub st_value: u32,
    pub st_size: u32,
    pub st_info: u8,
    pub st_other: u8,
    pub st_shndx: u16,
}

/// Name → address and address → nearest-symbol lookup.
///
/// `nearest` returns the symbol with the greatest address at or below the
/// queried address, which is how the trace labels instruction fetches that
/// fall inside a function body.
#[derive(Debug, Default, Clone)]
pub struct SymbolTable {
    by_name: HashMap<String, u32>,
    by_address: BTreeMap<u32, String>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: &str, address: u32) {
        self.by_name.insert(name.to_string(), address);
        self.by_address.insert(address, name.to_string());
    }

    /// Address of a symbol by exact name.
    pub fn address_of(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).copied()
    }

    /// Symbol with the greatest address at or below `address`.
    pub fn nearest(&self, address: u32) -> Option<&str> {
        self.by_address
            .range(..=address)
            .next_back()
            .map(|(_, name)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

/// Parsed ELF executable, ready to be copied into guest memory.
#[derive(Debug)]
pub struct ElfLoader {
    data: Vec<u8>,
    header: Elf32Header,
    program_headers: Vec<Elf32ProgramHeader>,
    section_headers: Vec<Elf32SectionHeader>,
    symbols: Vec<Elf32Symbol>,
    symbol_names: Option<Vec<u8>>,
}

impl ElfLoader {
    /// Parse and validate an ELF image from raw bytes.
    pub fn parse(data: &[u8]) -> Result<Self, ExecutorError> {
        if data.len() < ELF32_HEADER_SIZE {
            return Err(ExecutorError::InvalidElf(format!(
                "file too small: {} bytes (need at least {})",
                data.len(),
                ELF32_HEADER_SIZE
            )));
        }

        if data[0..4] != ELF_MAGIC {
            return Err(ExecutorError::InvalidElf(format!(
                "invalid magic: {:02x} {:02x} {:02x} {:02x}",
                data[0], data[1], data[2], data[3]
            )));
        }
        if data[4] != ELFCLASS32 {
            return Err(ExecutorError::InvalidElf(format!(
                "not a 32-bit ELF (class: {})",
                data[4]
            )));
        }
        if data[5] != ELFDATA2LSB {
            return Err(ExecutorError::InvalidElf(format!(
                "not little-endian (encoding: {})",
                data[5]
            )));
        }
        if data[6] != EV_CURRENT {
            return Err(ExecutorError::InvalidElf(format!(
                "unsupported ELF version in ident: {}",
                data[6]
            )));
        }

        let e_type = read_u16(data, 16);
        let e_machine = read_u16(data, 18);
        let e_version = read_u32(data, 20);

        if e_type != ET_EXEC {
            return Err(ExecutorError::InvalidElf(format!(
                "not an executable (type: {})",
                e_type
            )));
        }
        if e_machine != EM_RISCV {
            return Err(ExecutorError::InvalidElf(format!(
                "not RISC-V (machine: {})",
                e_machine
            )));
        }
        if e_version != 1 {
            return Err(ExecutorError::InvalidElf(format!(
                "unsupported ELF version: {}",
                e_version
            )));
        }

        let header = Elf32Header {
            e_type,
            e_machine,
            e_version,
            entry: read_u32(data, 24),
            phoff: read_u32(data, 28),
            shoff: read_u32(data, 32),
            flags: read_u32(data, 36),
            ehsize: read_u16(data, 40),
            phentsize: read_u16(data, 42),
            phnum: read_u16(data, 44),
            shentsize: read_u16(data, 46),
            shnum: read_u16(data, 48),
            shstrndx: read_u16(data, 50),
        };

        if header.ehsize as usize != ELF32_HEADER_SIZE {
            return Err(ExecutorError::InvalidElf(format!(
                "invalid ELF header size: {}",
                header.ehsize
            )));
        }

        let program_headers = Self::parse_program_headers(data, &header)?;
        let section_headers = Self::parse_section_headers(data, &header)?;
        let (symbols, symbol_names) = Self::parse_symbol_table(data, &section_headers);

        Ok(Self {
            data: data.to_vec(),
            header,
            program_headers,
            section_headers,
            symbols,
            symbol_names,
        })
    }

    fn parse_program_headers(
        data: &[u8],
        header: &Elf32Header,
    ) -> Result<Vec<Elf32ProgramHeader>, ExecutorError> {
        let phentsize = header.phentsize as usize;
        if header.phnum > 0 && phentsize < ELF32_PHDR_SIZE {
            return Err(ExecutorError::InvalidElf(format!(
                "program header size too small: {}",
                phentsize
            )));
        }

        let mut headers = Vec::with_capacity(header.phnum as usize);
        for i in 0..header.phnum as usize {
            let offset = header.phoff as usize + i * phentsize;
            if offset + ELF32_PHDR_SIZE > data.len() {
                return Err(ExecutorError::InvalidElf(format!(
                    "program header {} out of bounds (offset {})",
                    i, offset
                )));
            }
            headers.push(Elf32ProgramHeader {
                p_type: read_u32(data, offset),
                p_offset: read_u32(data, offset + 4),
                p_vaddr: read_u32(data, offset + 8),
                p_paddr: read_u32(data, offset + 12),
                p_filesz: read_u32(data, offset + 16),
                p_memsz: read_u32(data, offset + 20),
                p_flags: read_u32(data, offset + 24),
                p_align: read_u32(data, offset + 28),
            });
        }
        Ok(headers)
    }

    fn parse_section_headers(
        data: &[u8],
        header: &Elf32Header,
    ) -> Result<Vec<Elf32SectionHeader>, ExecutorError> {
        // Section headers are optional (stripped binaries).
        if header.shoff == 0 || header.shnum == 0 {
            return Ok(Vec::new());
        }

        let shentsize = header.shentsize as usize;
        if shentsize < ELF32_SHDR_SIZE {
            return Err(ExecutorError::InvalidElf(format!(
                "section header size too small: {}",
                shentsize
            )));
        }

        let mut headers = Vec::with_capacity(header.shnum as usize);
        for i in 0..header.shnum as usize {
            let offset = header.shoff as usize + i * shentsize;
            if offset + ELF32_SHDR_SIZE > data.len() {
                break;
            }
            headers.push(Elf32SectionHeader {
                sh_name: read_u32(data, offset),
                sh_type: read_u32(data, offset + 4),
                sh_flags: read_u32(data, offset + 8),
                sh_addr: read_u32(data, offset + 12),
                sh_offset: read_u32(data, offset + 16),
                sh_size: read_u32(data, offset + 20),
                sh_link: read_u32(data, offset + 24),
                sh_info: read_u32(data, offset + 28),
                sh_addralign: read_u32(data, offset + 32),
                sh_entsize: read_u32(data, offset + 36),
            });
        }
        Ok(headers)
    }

    fn parse_symbol_table(
        data: &[u8],
        sections: &[Elf32SectionHeader],
    ) -> (Vec<Elf32Symbol>, Option<Vec<u8>>) {
        let symtab = match sections
            .iter()
            .find(|s| s.sh_type == SHT_SYMTAB || s.sh_type == SHT_DYNSYM)
        {
            Some(s) => s,
            None => return (Vec::new(), None),
        };

        // Associated string table via sh_link.
        let strtab = sections.get(symtab.sh_link as usize).and_then(|s| {
            if s.sh_type != SHT_STRTAB {
                return None;
            }
            let start = s.sh_offset as usize;
            let size = s.sh_size as usize;
            if start + size <= data.len() {
                Some(data[start..start + size].to_vec())
            } else {
                None
            }
        });

        let start = symtab.sh_offset as usize;
        let size = symtab.sh_size as usize;
        let entsize = if symtab.sh_entsize > 0 {
            symtab.sh_entsize as usize
        } else {
            ELF32_SYM_SIZE
        };
        if entsize < ELF32_SYM_SIZE || start + size > data.len() {
            return (Vec::new(), strtab);
        }

        let mut symbols = Vec::new();
        for i in 0..size / entsize {
            let offset = start + i * entsize;
            symbols.push(Elf32Symbol {
                st_name: read_u32(data, offset),
                st_value: read_u32(data, offset + 4),
                st_size: read_u32(data, offset + 8),
                st_info: data[offset + 12],
                st_other: data[offset + 13],
                st_shndx: read_u16(data, offset + 14),
            });
        }
        (symbols, strtab)
    }

    /// Entry point address from the ELF header.
    pub fn entry_point(&self) -> u32 {
        self.header.entry
    }

    pub fn header(&self) -> &Elf32Header {
        &self.header
    }

    pub fn program_headers(&self) -> &[Elf32ProgramHeader] {
        &self.program_headers
    }

    pub fn section_headers(&self) -> &[Elf32SectionHeader] {
        &self.section_headers
    }

    /// All loadable (`PT_LOAD`) segments.
    pub fn loadable_segments(&self) -> impl Iterator<Item = &Elf32ProgramHeader> {
        self.program_headers.iter().filter(|ph| ph.p_type == PT_LOAD)
    }

    /// Lowest and highest guest addresses touched by loadable segments.
    pub fn memory_bounds(&self) -> (u32, u32) {
        let mut low = u32::MAX;
        let mut high = 0u32;
        for ph in self.loadable_segments() {
            low = low.min(ph.p_paddr);
            high = high.max(ph.p_paddr.saturating_add(ph.p_memsz));
        }
        if low == u32::MAX {
            (0, 0)
        } else {
            (low, high)
        }
    }

    /// Copy all `PT_LOAD` segments into `memory` at their physical
    /// addresses and zero-fill BSS tails (`memsz > filesz`). Returns the
    /// entry point.
    pub fn load_into(&self, memory: &mut Memory) -> Result<u32, ExecutorError> {
        let mut segments: Vec<_> = self.loadable_segments().collect();
        segments.sort_by_key(|s| s.p_paddr);

        for ph in segments {
            let file_offset = ph.p_offset as usize;
            let file_size = ph.p_filesz as usize;
            let mem_size = ph.p_memsz as usize;

            if file_size > 0 && file_offset.saturating_add(file_size) > self.data.len() {
                return Err(ExecutorError::InvalidElf(format!(
                    "segment at {:#010x}: data out of bounds",
                    ph.p_paddr
                )));
            }
            if mem_size < file_size {
                return Err(ExecutorError::InvalidElf(format!(
                    "segment at {:#010x}: memsz < filesz",
                    ph.p_paddr
                )));
            }

            if file_size > 0 {
                let segment = &self.data[file_offset..file_offset + file_size];
                memory
                    .write_block(ph.p_paddr, segment)
                    .map_err(|_| segment_fit_error(ph))?;
                debug!(
                    "loaded {} bytes at {:#x} (flags {:#x})",
                    file_size, ph.p_paddr, ph.p_flags
                );
            }
            if mem_size > file_size {
                let bss_start = ph.p_paddr.saturating_add(file_size as u32);
                let zeros = vec![0u8; mem_size - file_size];
                memory
                    .write_block(bss_start, &zeros)
                    .map_err(|_| segment_fit_error(ph))?;
                debug!("zeroed {} bss bytes at {:#x}", zeros.len(), bss_start);
            }
        }

        Ok(self.entry_point())
    }

    /// Resolve a symbol name offset against the string table.
    pub fn symbol_name(&self, st_name: u32) -> Option<&str> {
        let strtab = self.symbol_names.as_ref()?;
        let start = st_name as usize;
        if start >= strtab.len() {
            return None;
        }
        let end = strtab[start..]
            .iter()
            .position(|&b| b == 0)
            .map(|pos| start + pos)
            .unwrap_or(strtab.len());
        std::str::from_utf8(&strtab[start..end]).ok()
    }

    /// Build the name/address lookup from the parsed symbol table.
    pub fn symbol_table(&self) -> SymbolTable {
        let mut table = SymbolTable::new();
        for sym in &self.symbols {
            if let Some(name) = self.symbol_name(sym.st_name) {
                if !name.is_empty() {
                    table.add(name, sym.st_value);
                }
            }
        }
        table
    }
}

fn segment_fit_error(ph: &Elf32ProgramHeader) -> ExecutorError {
    ExecutorError::InvalidElf(format!(
        "segment at {:#010x} ({} bytes) does not fit in memory",
        ph.p_paddr, ph.p_memsz
    ))
}

// ============================================================================
// Test ELF builders
// ============================================================================

/// Segment flag: executable.
pub const PF_X: u32 = 0x1;
/// Segment flag: writable.
pub const PF_W: u32 = 0x2;
/// Segment flag: readable.
pub const PF_R: u32 = 0x4;

fn push_ehdr(elf: &mut Vec<u8>, entry: u32, phnum: u16, shoff: u32, shnum: u16, shstrndx: u16) {
    elf.extend_from_slice(&ELF_MAGIC);
    elf.push(ELFCLASS32);
    elf.push(ELFDATA2LSB);
    elf.push(EV_CURRENT);
    elf.push(0); // OS/ABI (SYSV)
    elf.extend_from_slice(&[0u8; 8]); // padding
    elf.extend_from_slice(&ET_EXEC.to_le_bytes());
    elf.extend_from_slice(&EM_RISCV.to_le_bytes());
    elf.extend_from_slice(&1u32.to_le_bytes()); // e_version
    elf.extend_from_slice(&entry.to_le_bytes());
    elf.extend_from_slice(&(ELF32_HEADER_SIZE as u32).to_le_bytes()); // e_phoff
    elf.extend_from_slice(&shoff.to_le_bytes());
    elf.extend_from_slice(&0u32.to_le_bytes()); // e_flags
    elf.extend_from_slice(&(ELF32_HEADER_SIZE as u16).to_le_bytes());
    elf.extend_from_slice(&(ELF32_PHDR_SIZE as u16).to_le_bytes());
    elf.extend_from_slice(&phnum.to_le_bytes());
    elf.extend_from_slice(&(ELF32_SHDR_SIZE as u16).to_le_bytes());
    elf.extend_from_slice(&shnum.to_le_bytes());
    elf.extend_from_slice(&shstrndx.to_le_bytes());
}

fn push_phdr(elf: &mut Vec<u8>, offset: u32, paddr: u32, filesz: u32, memsz: u32, flags: u32) {
    elf.extend_from_slice(&PT_LOAD.to_le_bytes());
    elf.extend_from_slice(&offset.to_le_bytes());
    elf.extend_from_slice(&paddr.to_le_bytes()); // p_vaddr
    elf.extend_from_slice(&paddr.to_le_bytes()); // p_paddr
    elf.extend_from_slice(&filesz.to_le_bytes());
    elf.extend_from_slice(&memsz.to_le_bytes());
    elf.extend_from_slice(&flags.to_le_bytes());
    elf.extend_from_slice(&4u32.to_le_bytes()); // p_align
}

#[allow(clippy::too_many_arguments)]
fn push_shdr(
    elf: &mut Vec<u8>,
    name: u32,
    sh_type: u32,
    offset: u32,
    size: u32,
    link: u32,
    info: u32,
    entsize: u32,
) {
    elf.extend_from_slice(&name.to_le_bytes());
    elf.extend_from_slice(&sh_type.to_le_bytes());
    elf.extend_from_slice(&0u32.to_le_bytes()); // sh_flags
    elf.extend_from_slice(&0u32.to_le_bytes()); // sh_addr
    elf.extend_from_slice(&offset.to_le_bytes());
    elf.extend_from_slice(&size.to_le_bytes());
    elf.extend_from_slice(&link.to_le_bytes());
    elf.extend_from_slice(&info.to_le_bytes());
    elf.extend_from_slice(&1u32.to_le_bytes()); // sh_addralign
    elf.extend_from_slice(&entsize.to_le_bytes());
}

/// Build a minimal ELF32 RISC-V executable: one `PT_LOAD` segment holding
/// `code` at `load_addr`, entry at `entry`. No section headers.
pub fn build_test_elf(code: &[u8], entry: u32, load_addr: u32) -> Vec<u8> {
    let code_offset = (ELF32_HEADER_SIZE + ELF32_PHDR_SIZE) as u32;
    let mut elf = Vec::new();
    push_ehdr(&mut elf, entry, 1, 0, 0, 0);
    push_phdr(
        &mut elf,
        code_offset,
        load_addr,
        code.len() as u32,
        code.len() as u32,
        PF_R | PF_X,
    );
    elf.extend_from_slice(code);
    while elf.len() % 4 != 0 {
        elf.push(0);
    }
    elf
}

/// Build an ELF with code + data + BSS segments.
pub fn build_test_elf_with_data(
    code: &[u8],
    data: &[u8],
    bss_size: u32,
    entry: u32,
    code_addr: u32,
    data_addr: u32,
) -> Vec<u8> {
    let code_offset = (ELF32_HEADER_SIZE + 2 * ELF32_PHDR_SIZE) as u32;
    let data_offset = code_offset + ((code.len() as u32 + 3) & !3);

    let mut elf = Vec::new();
    push_ehdr(&mut elf, entry, 2, 0, 0, 0);
    push_phdr(
        &mut elf,
        code_offset,
        code_addr,
        code.len() as u32,
        code.len() as u32,
        PF_R | PF_X,
    );
    push_phdr(
        &mut elf,
        data_offset,
        data_addr,
        data.len() as u32,
        data.len() as u32 + bss_size,
        PF_R | PF_W,
    );
    elf.extend_from_slice(code);
    while (elf.len() as u32) < data_offset {
        elf.push(0);
    }
    elf.extend_from_slice(data);
    elf
}

/// Build an ELF with one code segment and a symbol table mapping each
/// `(name, address)` pair, for exercising symbol lookup.
pub fn build_test_elf_with_symbols(
    code: &[u8],
    entry: u32,
    load_addr: u32,
    symbols: &[(&str, u32)],
) -> Vec<u8> {
    let code_offset = (ELF32_HEADER_SIZE + ELF32_PHDR_SIZE) as u32;
    let code_padded = (code.len() as u32 + 3) & !3;

    // String table: leading NUL, then the symbol names.
    let mut strtab = vec![0u8];
    let mut name_offsets = Vec::new();
    for (name, _) in symbols {
        name_offsets.push(strtab.len() as u32);
        strtab.extend_from_slice(name.as_bytes());
        strtab.push(0);
    }

    // Symbol table: leading null entry, then one global entry per symbol.
    let mut symtab = vec![0u8; ELF32_SYM_SIZE];
    for ((_, addr), name_offset) in symbols.iter().zip(&name_offsets) {
        symtab.extend_from_slice(&name_offset.to_le_bytes());
        symtab.extend_from_slice(&addr.to_le_bytes());
        symtab.extend_from_slice(&0u32.to_le_bytes()); // st_size
        symtab.push(0x12); // STB_GLOBAL, STT_FUNC
        symtab.push(0); // st_other
        symtab.extend_from_slice(&1u16.to_le_bytes()); // st_shndx
    }

    // Section name table for .symtab/.strtab/.shstrtab.
    let shstrtab: &[u8] = b"\0.symtab\0.strtab\0.shstrtab\0";

    let symtab_offset = code_offset + code_padded;
    let strtab_offset = symtab_offset + symtab.len() as u32;
    let shstrtab_offset = strtab_offset + strtab.len() as u32;
    let shoff = shstrtab_offset + shstrtab.len() as u32;

    let mut elf = Vec::new();
    push_ehdr(&mut elf, entry, 1, shoff, 4, 3);
    push_phdr(
        &mut elf,
        code_offset,
        load_addr,
        code.len() as u32,
        code.len() as u32,
        PF_R | PF_X,
    );
    elf.extend_from_slice(code);
    while (elf.len() as u32) < symtab_offset {
        elf.push(0);
    }
    elf.extend_from_slice(&symtab);
    elf.extend_from_slice(&strtab);
    elf.extend_from_slice(shstrtab);

    // Section headers: null, .symtab, .strtab, .shstrtab.
    push_shdr(&mut elf, 0, 0, 0, 0, 0, 0, 0);
    push_shdr(
        &mut elf,
        1,
        SHT_SYMTAB,
        symtab_offset,
        symtab.len() as u32,
        2, // sh_link → .strtab
        1,
        ELF32_SYM_SIZE as u32,
    );
    push_shdr(&mut elf, 9, SHT_STRTAB, strtab_offset, strtab.len() as u32, 0, 0, 0);
    push_shdr(
        &mut elf,
        17,
        SHT_STRTAB,
        shstrtab_offset,
        shstrtab.len() as u32,
        0,
        0,
        0,
    );
    elf
}
