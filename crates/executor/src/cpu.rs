//! RV32I execution core.
//!
//! Implements the base integer instruction set (40 instructions):
//!
//! **Arithmetic/logic** (11): ADD, SUB, ADDI, LUI, AUIPC, AND, OR, XOR,
//! ANDI, ORI, XORI
//! **Shifts** (6): SLL, SRL, SRA, SLLI, SRLI, SRAI
//! **Comparisons** (4): SLT, SLTU, SLTI, SLTIU
//! **Branches** (6): BEQ, BNE, BLT, BGE, BLTU, BGEU
//! **Jumps** (2): JAL, JALR
//! **Loads** (5): LB, LH, LW, LBU, LHU
//! **Stores** (3): SB, SH, SW
//! **System** (2): ECALL, EBREAK (decode-only no-ops)
//! **Fence** (1): FENCE (no-op; single hart, strongly ordered)
//!
//! # Execution model
//!
//! Each [`Executor::step`] fetches the word at PC, dispatches on the
//! opcode and funct fields, services a pending HTIF command, then either
//! consumes the branch-taken flag or advances PC by 4, and increments the
//! cycle counter. System calls are not delivered through ECALL but through
//! the memory-mapped HTIF channel (see [`crate::syscall`]): the guest
//! writes a command-block pointer to `tohost`, and the step loop services
//! it after the instruction completes.
//!
//! Guest exit is a value, not an unwind: `step` returns
//! [`StepOutcome::Exit`] and [`Executor::run`] surfaces it as
//! [`RunOutcome::Exit`].
//!
//! # Tracing
//!
//! The executor is generic over [`Tracer`]. Instantiating it with
//! [`NopTracer`] monomorphises every trace call to an empty inlined body,
//! so the untraced step path pays nothing for the instrumentation.

use crate::decode::{
    branch_funct3, funct7, load_funct3, op_funct3, op_imm_funct3, opcode, store_funct3, sys_imm,
    DecodedInstr,
};
use crate::error::ExecutorError;
use crate::hart::{HartState, PC};
use crate::memory::Memory;
use crate::syscall::{
    FdTable, HtifCommand, SyscallCode, HTIF_FROMHOST_ADDRESS, HTIF_TOHOST_ADDRESS,
};
use crate::trace::{NopTracer, TraceOperand, Tracer};
use std::io::{Read, Write};
use tracing::debug;

/// Result of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Keep stepping.
    Continue,
    /// The guest requested termination with the given return value.
    Exit(u32),
}

/// Result of a [`Executor::run`] loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The guest exited with the given return value.
    Exit(u32),
    /// The cycle limit tripped before the guest exited.
    CycleLimit,
}

/// The instruction executor. Owns the hart state, the guest memory, the
/// host file-descriptor table, and the tracer for its whole lifetime.
pub struct Executor<T: Tracer = NopTracer> {
    pub state: HartState,
    pub memory: Memory,
    fds: FdTable,
    tracer: T,
}

impl Executor<NopTracer> {
    /// Untraced executor with fd slots 0/1/2 bound to the host stdio.
    pub fn new(memory: Memory) -> Result<Self, ExecutorError> {
        Ok(Self::with_io(memory, NopTracer, FdTable::from_host_stdio()?))
    }
}

impl<T: Tracer> Executor<T> {
    /// Traced executor with fd slots 0/1/2 bound to the host stdio.
    pub fn with_tracer(memory: Memory, tracer: T) -> Result<Self, ExecutorError> {
        Ok(Self::with_io(memory, tracer, FdTable::from_host_stdio()?))
    }

    /// Executor with an explicit fd table.
    pub fn with_io(memory: Memory, tracer: T, fds: FdTable) -> Self {
        Self {
            state: HartState::new(),
            memory,
            fds,
            tracer,
        }
    }

    /// Consume the executor and return its tracer.
    pub fn into_tracer(self) -> T {
        self.tracer
    }

    /// Execute a single instruction cycle.
    pub fn step(&mut self) -> Result<StepOutcome, ExecutorError> {
        self.state.fetch_address = self.state.pc;
        let bits = self.memory.read_word(self.state.pc)?;
        self.dispatch(bits)?;
        if let Some(exit_code) = self.poll_htif()? {
            return Ok(StepOutcome::Exit(exit_code));
        }
        if self.state.branch_taken {
            self.state.branch_taken = false;
        } else {
            self.state.pc = self.state.pc.wrapping_add(4);
        }
        self.state.cycle_count += 1;
        Ok(StepOutcome::Continue)
    }

    /// Step until guest exit, an error, or `max_cycles` (0 = unlimited).
    pub fn run(&mut self, max_cycles: u64) -> Result<RunOutcome, ExecutorError> {
        loop {
            if let StepOutcome::Exit(code) = self.step()? {
                return Ok(RunOutcome::Exit(code));
            }
            if max_cycles > 0 && self.state.cycle_count >= max_cycles {
                return Ok(RunOutcome::CycleLimit);
            }
        }
    }

    fn unknown_funct(&self, bits: u32) -> ExecutorError {
        ExecutorError::UnknownFunct {
            pc: self.state.pc,
            bits,
        }
    }

    /// Decode and execute one instruction word.
    fn dispatch(&mut self, bits: u32) -> Result<(), ExecutorError> {
        let instr = DecodedInstr::decode(bits);
        let cycle = self.state.cycle_count;
        let pc = self.state.pc;

        match instr.opcode {
            opcode::LUI => {
                // rd = imm20 << 12, low 12 bits zero.
                let result = instr.imm as u32;
                self.tracer.insn(
                    cycle,
                    pc,
                    "LUI",
                    &[
                        TraceOperand::RegDst(instr.rd),
                        TraceOperand::Imm((result >> 12) as i32),
                    ],
                );
                self.state.write_reg(instr.rd, result);
                self.tracer.reg_write(instr.rd, result);
                self.tracer.end();
            }

            opcode::AUIPC => {
                // rd = pc + (imm20 << 12)
                let result = pc.wrapping_add(instr.imm as u32);
                self.tracer.insn(
                    cycle,
                    pc,
                    "AUIPC",
                    &[
                        TraceOperand::RegDst(instr.rd),
                        TraceOperand::Imm(((instr.imm as u32) >> 12) as i32),
                    ],
                );
                self.state.write_reg(instr.rd, result);
                self.tracer.reg_write(instr.rd, result);
                self.tracer.end();
            }

            opcode::JAL => {
                // rd = pc + 4; pc += offset
                let result = pc.wrapping_add(4);
                self.tracer.insn(
                    cycle,
                    pc,
                    "JAL",
                    &[
                        TraceOperand::RegDst(instr.rd),
                        TraceOperand::Imm(instr.imm),
                    ],
                );
                self.state.write_reg(instr.rd, result);
                self.state.pc = pc.wrapping_add(instr.imm as u32);
                self.state.branch_taken = true;
                self.tracer.reg_write(instr.rd, result);
                self.tracer.reg_write(PC, self.state.pc);
                self.tracer.end();
            }

            opcode::JALR => {
                // rd = pc + 4; pc = (rs1 + imm) with bit 0 masked
                let base = self.state.read_reg(instr.rs1);
                let target = base.wrapping_add(instr.imm as u32) & !1;
                let result = pc.wrapping_add(4);
                self.tracer.insn(
                    cycle,
                    pc,
                    "JALR",
                    &[
                        TraceOperand::RegDst(instr.rd),
                        TraceOperand::RegSrc(instr.rs1, base),
                        TraceOperand::Imm(instr.imm),
                    ],
                );
                self.state.write_reg(instr.rd, result);
                self.state.pc = target;
                self.state.branch_taken = true;
                self.tracer.reg_write(instr.rd, result);
                self.tracer.reg_write(PC, target);
                self.tracer.end();
            }

            opcode::BRANCH => {
                let rs1_val = self.state.read_reg(instr.rs1);
                let rs2_val = self.state.read_reg(instr.rs2);
                let (mnemonic, taken) = match instr.funct3 {
                    branch_funct3::BEQ => ("BEQ", rs1_val == rs2_val),
                    branch_funct3::BNE => ("BNE", rs1_val != rs2_val),
                    branch_funct3::BLT => ("BLT", (rs1_val as i32) < (rs2_val as i32)),
                    branch_funct3::BGE => ("BGE", (rs1_val as i32) >= (rs2_val as i32)),
                    branch_funct3::BLTU => ("BLTU", rs1_val < rs2_val),
                    branch_funct3::BGEU => ("BGEU", rs1_val >= rs2_val),
                    _ => return Err(self.unknown_funct(bits)),
                };
                self.tracer.insn(
                    cycle,
                    pc,
                    mnemonic,
                    &[
                        TraceOperand::RegSrc(instr.rs1, rs1_val),
                        TraceOperand::RegSrc(instr.rs2, rs2_val),
                        TraceOperand::Imm(instr.imm),
                    ],
                );
                if taken {
                    self.state.pc = pc.wrapping_add(instr.imm as u32);
                    self.state.branch_taken = true;
                    self.tracer.reg_write(PC, self.state.pc);
                }
                self.tracer.end();
            }

            opcode::LOAD => {
                let rs1_val = self.state.read_reg(instr.rs1);
                let addr = rs1_val.wrapping_add(instr.imm as u32);
                let (mnemonic, result) = match instr.funct3 {
                    load_funct3::LB => ("LB", (self.memory.read_byte(addr)? as i8) as i32 as u32),
                    load_funct3::LH => ("LH", (self.memory.read_half(addr)? as i16) as i32 as u32),
                    load_funct3::LW => ("LW", self.memory.read_word(addr)?),
                    load_funct3::LBU => ("LBU", self.memory.read_byte(addr)? as u32),
                    load_funct3::LHU => ("LHU", self.memory.read_half(addr)? as u32),
                    _ => return Err(self.unknown_funct(bits)),
                };
                self.tracer.insn(
                    cycle,
                    pc,
                    mnemonic,
                    &[
                        TraceOperand::RegDst(instr.rd),
                        TraceOperand::RegSrc(instr.rs1, rs1_val),
                        TraceOperand::Imm(instr.imm),
                    ],
                );
                self.state.write_reg(instr.rd, result);
                self.tracer.mem_read(instr.rd, addr, result);
                self.tracer.end();
            }

            opcode::STORE => {
                let rs1_val = self.state.read_reg(instr.rs1);
                let rs2_val = self.state.read_reg(instr.rs2);
                let addr = rs1_val.wrapping_add(instr.imm as u32);
                let mnemonic = match instr.funct3 {
                    store_funct3::SB => {
                        self.memory.write_byte(addr, rs2_val as u8)?;
                        "SB"
                    }
                    store_funct3::SH => {
                        self.memory.write_half(addr, rs2_val as u16)?;
                        "SH"
                    }
                    store_funct3::SW => {
                        self.memory.write_word(addr, rs2_val)?;
                        "SW"
                    }
                    _ => return Err(self.unknown_funct(bits)),
                };
                self.tracer.insn(
                    cycle,
                    pc,
                    mnemonic,
                    &[
                        TraceOperand::RegSrc(instr.rs2, rs2_val),
                        TraceOperand::RegSrc(instr.rs1, rs1_val),
                        TraceOperand::Imm(instr.imm),
                    ],
                );
                self.tracer.mem_write(addr, rs2_val);
                self.tracer.end();
            }

            opcode::OP_IMM => {
                let rs1_val = self.state.read_reg(instr.rs1);
                let imm = instr.imm as u32;
                let (mnemonic, result, trace_imm) = match instr.funct3 {
                    op_imm_funct3::ADDI => ("ADDI", rs1_val.wrapping_add(imm), instr.imm),
                    op_imm_funct3::SLTI => {
                        // Signed compare.
                        ("SLTI", ((rs1_val as i32) < instr.imm) as u32, instr.imm)
                    }
                    op_imm_funct3::SLTIU => {
                        // Sign-extend, then unsigned compare.
                        ("SLTIU", (rs1_val < imm) as u32, instr.imm)
                    }
                    op_imm_funct3::XORI => ("XORI", rs1_val ^ imm, instr.imm),
                    op_imm_funct3::ORI => ("ORI", rs1_val | imm, instr.imm),
                    op_imm_funct3::ANDI => ("ANDI", rs1_val & imm, instr.imm),
                    op_imm_funct3::SLLI => {
                        if instr.funct7 != funct7::BASE {
                            return Err(self.unknown_funct(bits));
                        }
                        ("SLLI", rs1_val << instr.shamt(), instr.shamt() as i32)
                    }
                    op_imm_funct3::SRLI_SRAI => match instr.funct7 {
                        funct7::BASE => ("SRLI", rs1_val >> instr.shamt(), instr.shamt() as i32),
                        funct7::SUB_SRA => (
                            "SRAI",
                            ((rs1_val as i32) >> instr.shamt()) as u32,
                            instr.shamt() as i32,
                        ),
                        _ => return Err(self.unknown_funct(bits)),
                    },
                    _ => return Err(self.unknown_funct(bits)),
                };
                self.tracer.insn(
                    cycle,
                    pc,
                    mnemonic,
                    &[
                        TraceOperand::RegDst(instr.rd),
                        TraceOperand::RegSrc(instr.rs1, rs1_val),
                        TraceOperand::Imm(trace_imm),
                    ],
                );
                self.state.write_reg(instr.rd, result);
                self.tracer.reg_write(instr.rd, result);
                self.tracer.end();
            }

            opcode::OP => {
                let rs1_val = self.state.read_reg(instr.rs1);
                let rs2_val = self.state.read_reg(instr.rs2);
                let shift = rs2_val & 0x1F;
                let (mnemonic, result) = match (instr.funct3, instr.funct7) {
                    (op_funct3::ADD_SUB, funct7::BASE) => ("ADD", rs1_val.wrapping_add(rs2_val)),
                    (op_funct3::ADD_SUB, funct7::SUB_SRA) => {
                        ("SUB", rs1_val.wrapping_sub(rs2_val))
                    }
                    (op_funct3::SLL, funct7::BASE) => ("SLL", rs1_val << shift),
                    (op_funct3::SLT, funct7::BASE) => {
                        ("SLT", ((rs1_val as i32) < (rs2_val as i32)) as u32)
                    }
                    (op_funct3::SLTU, funct7::BASE) => ("SLTU", (rs1_val < rs2_val) as u32),
                    (op_funct3::XOR, funct7::BASE) => ("XOR", rs1_val ^ rs2_val),
                    (op_funct3::SRL_SRA, funct7::BASE) => ("SRL", rs1_val >> shift),
                    (op_funct3::SRL_SRA, funct7::SUB_SRA) => {
                        ("SRA", ((rs1_val as i32) >> shift) as u32)
                    }
                    (op_funct3::OR, funct7::BASE) => ("OR", rs1_val | rs2_val),
                    (op_funct3::AND, funct7::BASE) => ("AND", rs1_val & rs2_val),
                    _ => return Err(self.unknown_funct(bits)),
                };
                self.tracer.insn(
                    cycle,
                    pc,
                    mnemonic,
                    &[
                        TraceOperand::RegDst(instr.rd),
                        TraceOperand::RegSrc(instr.rs1, rs1_val),
                        TraceOperand::RegSrc(instr.rs2, rs2_val),
                    ],
                );
                self.state.write_reg(instr.rd, result);
                self.tracer.reg_write(instr.rd, result);
                self.tracer.end();
            }

            // Single hart, strongly ordered memory.
            opcode::FENCE => {}

            opcode::SYSTEM => match instr.imm as u32 {
                // Syscalls arrive via HTIF, so ECALL itself does nothing.
                sys_imm::ECALL => {}
                sys_imm::EBREAK => {}
                imm => return Err(ExecutorError::UnknownSysImm { imm }),
            },

            _ => {
                return Err(ExecutorError::UnknownOpcode {
                    pc: self.state.pc,
                    bits,
                })
            }
        }

        Ok(())
    }

    /// Service a pending HTIF command, if the channel is mapped and armed.
    /// Returns the guest's exit value when the command is EXIT.
    fn poll_htif(&mut self) -> Result<Option<u32>, ExecutorError> {
        if !self.memory.contains(HTIF_TOHOST_ADDRESS, 8) {
            return Ok(None);
        }
        let command_ptr = self.memory.read_dword(HTIF_TOHOST_ADDRESS)?;
        if command_ptr == 0 {
            return Ok(None);
        }
        let block_addr = u32::try_from(command_ptr)
            .map_err(|_| ExecutorError::OutOfBounds { addr: u32::MAX })?;
        let command = HtifCommand::read_from(&self.memory, block_addr)?;

        let ret = match SyscallCode::from_u64(command.id) {
            Some(SyscallCode::Exit) => return Ok(Some(self.syscall_exit(&command))),
            Some(SyscallCode::Read) => self.syscall_read(&command)?,
            Some(SyscallCode::Write) => self.syscall_write(&command)?,
            None => return Err(ExecutorError::UnknownSyscall { id: command.id }),
        };
        self.memory.write_dword(HTIF_FROMHOST_ADDRESS, ret)?;
        self.memory.write_dword(HTIF_TOHOST_ADDRESS, 0)?;
        Ok(None)
    }

    fn syscall_exit(&mut self, command: &HtifCommand) -> u32 {
        let value = command.args[0];
        debug!("htif exit: value={}", value);
        self.tracer.insn(
            self.state.cycle_count,
            self.state.fetch_address,
            "ECALL EXIT",
            &[TraceOperand::Arg(value)],
        );
        self.tracer.end();
        value as u32
    }

    fn syscall_read(&mut self, command: &HtifCommand) -> Result<u64, ExecutorError> {
        let [fd, buf, len, ..] = command.args;
        let mut buffer = vec![0u8; len as usize];
        let count = self.fds.get_mut(fd)?.read(&mut buffer)?;
        if count > 0 {
            self.memory.write_block(buf as u32, &buffer[..count])?;
        }
        debug!("htif read: fd={} buf={:#x} len={} -> {}", fd, buf, len, count);
        self.tracer.insn(
            self.state.cycle_count,
            self.state.fetch_address,
            "ECALL READ",
            &[
                TraceOperand::Arg(fd),
                TraceOperand::Arg(buf),
                TraceOperand::Arg(len),
            ],
        );
        self.tracer.end();
        Ok(count as u64)
    }

    fn syscall_write(&mut self, command: &HtifCommand) -> Result<u64, ExecutorError> {
        let [fd, buf, len, ..] = command.args;
        let buffer = self.memory.read_block(buf as u32, len as usize)?;
        let count = self.fds.get_mut(fd)?.write(&buffer)?;
        debug!("htif write: fd={} buf={:#x} len={} -> {}", fd, buf, len, count);
        self.tracer.insn(
            self.state.cycle_count,
            self.state.fetch_address,
            "ECALL WRITE",
            &[
                TraceOperand::Arg(fd),
                TraceOperand::Arg(buf),
                TraceOperand::Arg(len),
            ],
        );
        self.tracer.end();
        Ok(count as u64)
    }
}

// ============================================================================
// Instruction assembler helpers (for tests)
// ============================================================================

/// Assemble an R-type instruction.
pub fn assemble_r(opcode: u8, rd: u8, funct3: u8, rs1: u8, rs2: u8, funct7: u8) -> u32 {
    ((funct7 as u32) << 25)
        | ((rs2 as u32) << 20)
        | ((rs1 as u32) << 15)
        | ((funct3 as u32) << 12)
        | ((rd as u32) << 7)
        | (opcode as u32)
}

/// Assemble an I-type instruction.
pub fn assemble_i(opcode: u8, rd: u8, funct3: u8, rs1: u8, imm: i32) -> u32 {
    (((imm as u32) & 0xFFF) << 20)
        | ((rs1 as u32) << 15)
        | ((funct3 as u32) << 12)
        | ((rd as u32) << 7)
        | (opcode as u32)
}

/// Assemble an S-type instruction.
pub fn assemble_s(opcode: u8, funct3: u8, rs1: u8, rs2: u8, imm: i32) -> u32 {
    let imm = imm as u32;
    (((imm >> 5) & 0x7F) << 25)
        | ((rs2 as u32) << 20)
        | ((rs1 as u32) << 15)
        | ((funct3 as u32) << 12)
        | ((imm & 0x1F) << 7)
        | (opcode as u32)
}

/// Assemble a B-type instruction. `imm` is the byte offset (LSB ignored).
pub fn assemble_b(opcode: u8, funct3: u8, rs1: u8, rs2: u8, imm: i32) -> u32 {
    let imm = imm as u32;
    (((imm >> 12) & 1) << 31)
        | (((imm >> 5) & 0x3F) << 25)
        | ((rs2 as u32) << 20)
        | ((rs1 as u32) << 15)
        | ((funct3 as u32) << 12)
        | (((imm >> 1) & 0xF) << 8)
        | (((imm >> 11) & 1) << 7)
        | (opcode as u32)
}

/// Assemble a U-type instruction. `imm` supplies bits 31:12.
pub fn assemble_u(opcode: u8, rd: u8, imm: u32) -> u32 {
    (imm & 0xFFFF_F000) | ((rd as u32) << 7) | (opcode as u32)
}

/// Assemble a J-type instruction. `imm` is the byte offset (LSB ignored).
pub fn assemble_j(opcode: u8, rd: u8, imm: i32) -> u32 {
    let imm = imm as u32;
    (((imm >> 20) & 1) << 31)
        | (((imm >> 1) & 0x3FF) << 21)
        | (((imm >> 11) & 1) << 20)
        | (((imm >> 12) & 0xFF) << 12)
        | ((rd as u32) << 7)
        | (opcode as u32)
}

pub fn assemble_add(rd: u8, rs1: u8, rs2: u8) -> u32 {
    assemble_r(opcode::OP, rd, 0b000, rs1, rs2, 0x00)
}

pub fn assemble_sub(rd: u8, rs1: u8, rs2: u8) -> u32 {
    assemble_r(opcode::OP, rd, 0b000, rs1, rs2, 0x20)
}

pub fn assemble_addi(rd: u8, rs1: u8, imm: i32) -> u32 {
    assemble_i(opcode::OP_IMM, rd, 0b000, rs1, imm)
}

pub fn assemble_lui(rd: u8, imm: u32) -> u32 {
    assemble_u(opcode::LUI, rd, imm)
}

pub fn assemble_auipc(rd: u8, imm: u32) -> u32 {
    assemble_u(opcode::AUIPC, rd, imm)
}

pub fn assemble_jal(rd: u8, imm: i32) -> u32 {
    assemble_j(opcode::JAL, rd, imm)
}

pub fn assemble_jalr(rd: u8, rs1: u8, imm: i32) -> u32 {
    assemble_i(opcode::JALR, rd, 0b000, rs1, imm)
}

pub fn assemble_beq(rs1: u8, rs2: u8, imm: i32) -> u32 {
    assemble_b(opcode::BRANCH, 0b000, rs1, rs2, imm)
}

pub fn assemble_bne(rs1: u8, rs2: u8, imm: i32) -> u32 {
    assemble_b(opcode::BRANCH, 0b001, rs1, rs2, imm)
}

pub fn assemble_lw(rd: u8, rs1: u8, imm: i32) -> u32 {
    assemble_i(opcode::LOAD, rd, 0b010, rs1, imm)
}

pub fn assemble_lbu(rd: u8, rs1: u8, imm: i32) -> u32 {
    assemble_i(opcode::LOAD, rd, 0b100, rs1, imm)
}

pub fn assemble_sw(rs1: u8, rs2: u8, imm: i32) -> u32 {
    assemble_s(opcode::STORE, 0b010, rs1, rs2, imm)
}

pub fn assemble_sb(rs1: u8, rs2: u8, imm: i32) -> u32 {
    assemble_s(opcode::STORE, 0b000, rs1, rs2, imm)
}

pub fn assemble_srli(rd: u8, rs1: u8, shamt: u8) -> u32 {
    assemble_r(opcode::OP_IMM, rd, 0b101, rs1, shamt, 0x00)
}

pub fn assemble_srai(rd: u8, rs1: u8, shamt: u8) -> u32 {
    assemble_r(opcode::OP_IMM, rd, 0b101, rs1, shamt, 0x20)
}

pub fn assemble_nop() -> u32 {
    assemble_addi(0, 0, 0)
}

pub fn assemble_ecall() -> u32 {
    0x00000073
}

pub fn assemble_fence() -> u32 {
    0x0FF0000F
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: u32 = 0x10000;

    /// Executor over a small region at the default base, program at BASE.
    fn executor_with_program(program: &[u32]) -> Executor {
        let mut memory = Memory::new(BASE, 0x1000);
        for (i, word) in program.iter().enumerate() {
            memory.write_word(BASE + 4 * i as u32, *word).unwrap();
        }
        let mut exec = Executor::with_io(memory, NopTracer, FdTable::new());
        exec.state.pc = BASE;
        exec
    }

    fn step_n(exec: &mut Executor, n: usize) {
        for _ in 0..n {
            assert_eq!(exec.step().unwrap(), StepOutcome::Continue);
        }
    }

    #[test]
    fn test_lui_addi_add_chain() {
        let mut exec = executor_with_program(&[
            assemble_lui(1, 0x12345000),
            assemble_addi(1, 1, 0x678),
            assemble_addi(2, 0, -1),
            assemble_add(3, 1, 2),
        ]);
        step_n(&mut exec, 4);
        assert_eq!(exec.state.read_reg(1), 0x12345678);
        assert_eq!(exec.state.read_reg(2), 0xFFFFFFFF);
        assert_eq!(exec.state.read_reg(3), 0x12345677);
    }

    #[test]
    fn test_addi_negative() {
        let mut exec = executor_with_program(&[assemble_addi(1, 0, -1)]);
        step_n(&mut exec, 1);
        assert_eq!(exec.state.read_reg(1), 0xFFFFFFFF);
    }

    #[test]
    fn test_x0_write_ignored() {
        let mut exec = executor_with_program(&[assemble_addi(0, 0, 42)]);
        step_n(&mut exec, 1);
        assert_eq!(exec.state.read_reg(0), 0);
    }

    #[test]
    fn test_sub() {
        let mut exec = executor_with_program(&[
            assemble_addi(1, 0, 100),
            assemble_addi(2, 0, 30),
            assemble_sub(3, 1, 2),
        ]);
        step_n(&mut exec, 3);
        assert_eq!(exec.state.read_reg(3), 70);
    }

    #[test]
    fn test_auipc() {
        let mut exec = executor_with_program(&[assemble_auipc(1, 0x1000)]);
        step_n(&mut exec, 1);
        assert_eq!(exec.state.read_reg(1), BASE + 0x1000);
    }

    #[test]
    fn test_jal() {
        let mut exec = executor_with_program(&[assemble_jal(1, 8)]);
        step_n(&mut exec, 1);
        assert_eq!(exec.state.read_reg(1), BASE + 4);
        assert_eq!(exec.state.pc, BASE + 8);
        // Flag consumed by the step loop.
        assert!(!exec.state.branch_taken);
    }

    #[test]
    fn test_jal_backward() {
        let mut exec = executor_with_program(&[assemble_nop(), assemble_jal(0, -4)]);
        step_n(&mut exec, 2);
        assert_eq!(exec.state.pc, BASE);
    }

    #[test]
    fn test_jalr_masks_bit0() {
        let mut exec = executor_with_program(&[assemble_jalr(0, 1, 0)]);
        exec.state.write_reg(1, 0x20001);
        step_n(&mut exec, 1);
        assert_eq!(exec.state.pc, 0x20000);
        assert_eq!(exec.state.pc & 1, 0);
    }

    #[test]
    fn test_jalr_link_before_jump() {
        // rd == rs1: the link value must not feed the target.
        let mut exec = executor_with_program(&[assemble_jalr(1, 1, 4)]);
        exec.state.write_reg(1, 0x10200);
        step_n(&mut exec, 1);
        assert_eq!(exec.state.pc, 0x10204);
        assert_eq!(exec.state.read_reg(1), BASE + 4);
    }

    #[test]
    fn test_bne_taken_backward() {
        let mut exec = executor_with_program(&[
            assemble_addi(1, 0, 1),
            assemble_addi(2, 0, 2),
            assemble_bne(1, 2, -4),
        ]);
        step_n(&mut exec, 3);
        assert_eq!(exec.state.pc, BASE + 4);
        assert!(!exec.state.branch_taken);
    }

    #[test]
    fn test_beq_taken_and_not_taken() {
        let mut exec = executor_with_program(&[
            assemble_addi(1, 0, 5),
            assemble_addi(2, 0, 5),
            assemble_beq(1, 2, 8),
        ]);
        step_n(&mut exec, 3);
        assert_eq!(exec.state.pc, BASE + 8 + 8);

        let mut exec = executor_with_program(&[
            assemble_addi(1, 0, 5),
            assemble_addi(2, 0, 10),
            assemble_beq(1, 2, 8),
        ]);
        step_n(&mut exec, 3);
        assert_eq!(exec.state.pc, BASE + 12);
    }

    #[test]
    fn test_blt_signed_vs_bltu_unsigned() {
        // -5 < 5 signed: taken.
        let mut exec = executor_with_program(&[
            assemble_addi(1, 0, -5),
            assemble_addi(2, 0, 5),
            assemble_b(opcode::BRANCH, 0b100, 1, 2, 8),
        ]);
        step_n(&mut exec, 3);
        assert_eq!(exec.state.pc, BASE + 8 + 8);

        // 0xFFFFFFFB > 5 unsigned: not taken.
        let mut exec = executor_with_program(&[
            assemble_addi(1, 0, -5),
            assemble_addi(2, 0, 5),
            assemble_b(opcode::BRANCH, 0b110, 1, 2, 8),
        ]);
        step_n(&mut exec, 3);
        assert_eq!(exec.state.pc, BASE + 12);
    }

    #[test]
    fn test_byte_packed_store_load() {
        let mut exec = executor_with_program(&[
            assemble_addi(1, 0, 0xAB),
            assemble_sb(2, 1, 0x103),
            assemble_lbu(3, 2, 0x103),
            assemble_lw(4, 2, 0x100),
        ]);
        exec.state.write_reg(2, BASE);
        step_n(&mut exec, 4);
        assert_eq!(exec.state.read_reg(3), 0x000000AB);
        // The stored byte lands in byte 3 of the containing word.
        assert_eq!(exec.state.read_reg(4), 0xAB000000);
    }

    #[test]
    fn test_load_byte_sign_extension() {
        let mut exec = executor_with_program(&[
            assemble_i(opcode::LOAD, 1, 0b000, 2, 0x100),
            assemble_lbu(3, 2, 0x100),
        ]);
        exec.memory.write_byte(BASE + 0x100, 0xFF).unwrap();
        exec.state.write_reg(2, BASE);
        step_n(&mut exec, 2);
        assert_eq!(exec.state.read_reg(1), 0xFFFFFFFF);
        assert_eq!(exec.state.read_reg(3), 0xFF);
    }

    #[test]
    fn test_load_half_sign_extension() {
        let mut exec = executor_with_program(&[
            assemble_i(opcode::LOAD, 1, 0b001, 2, 0x100),
            assemble_i(opcode::LOAD, 3, 0b101, 2, 0x100),
        ]);
        exec.memory.write_half(BASE + 0x100, 0x8000).unwrap();
        exec.state.write_reg(2, BASE);
        step_n(&mut exec, 2);
        assert_eq!(exec.state.read_reg(1), 0xFFFF8000);
        assert_eq!(exec.state.read_reg(3), 0x8000);
    }

    #[test]
    fn test_sw_lw_word_path() {
        let mut exec = executor_with_program(&[
            assemble_sw(2, 1, 0x100),
            assemble_lw(3, 2, 0x100),
        ]);
        exec.state.write_reg(1, 0xDEADBEEF);
        exec.state.write_reg(2, BASE);
        step_n(&mut exec, 2);
        assert_eq!(exec.state.read_reg(3), 0xDEADBEEF);
    }

    #[test]
    fn test_srai_vs_srli_negative() {
        let mut exec = executor_with_program(&[
            assemble_lui(1, 0x80000000),
            assemble_srai(2, 1, 1),
            assemble_srli(3, 1, 1),
        ]);
        step_n(&mut exec, 3);
        assert_eq!(exec.state.read_reg(2), 0xC0000000);
        assert_eq!(exec.state.read_reg(3), 0x40000000);
    }

    #[test]
    fn test_slti_signed_sltiu_unsigned() {
        let mut exec = executor_with_program(&[
            assemble_addi(1, 0, 5),
            assemble_i(opcode::OP_IMM, 2, 0b010, 1, -1), // SLTI: 5 < -1 signed?
            assemble_i(opcode::OP_IMM, 3, 0b011, 1, -1), // SLTIU: 5 < 0xFFFFFFFF?
        ]);
        step_n(&mut exec, 3);
        assert_eq!(exec.state.read_reg(2), 0);
        assert_eq!(exec.state.read_reg(3), 1);
    }

    #[test]
    fn test_slt_sltu_register() {
        let mut exec = executor_with_program(&[
            assemble_addi(1, 0, -1),
            assemble_addi(2, 0, 1),
            assemble_r(opcode::OP, 3, 0b010, 1, 2, 0x00), // SLT
            assemble_r(opcode::OP, 4, 0b011, 1, 2, 0x00), // SLTU
        ]);
        step_n(&mut exec, 4);
        assert_eq!(exec.state.read_reg(3), 1); // -1 < 1 signed
        assert_eq!(exec.state.read_reg(4), 0); // 0xFFFFFFFF > 1 unsigned
    }

    #[test]
    fn test_sll_masks_shift_amount() {
        let mut exec = executor_with_program(&[
            assemble_addi(1, 0, 1),
            assemble_addi(2, 0, 36), // 36 & 0x1F == 4
            assemble_r(opcode::OP, 3, 0b001, 1, 2, 0x00),
        ]);
        step_n(&mut exec, 3);
        assert_eq!(exec.state.read_reg(3), 16);
    }

    #[test]
    fn test_xori_ori_andi_sign_extend() {
        let mut exec = executor_with_program(&[
            assemble_i(opcode::OP_IMM, 1, 0b100, 0, -1), // XORI x1, x0, -1
            assemble_addi(2, 0, 0x0F0),
            assemble_i(opcode::OP_IMM, 3, 0b111, 2, -1), // ANDI x3, x2, -1
            assemble_i(opcode::OP_IMM, 4, 0b110, 0, -16), // ORI x4, x0, -16
        ]);
        step_n(&mut exec, 4);
        assert_eq!(exec.state.read_reg(1), 0xFFFFFFFF);
        assert_eq!(exec.state.read_reg(3), 0x0F0);
        assert_eq!(exec.state.read_reg(4), 0xFFFFFFF0);
    }

    #[test]
    fn test_fence_and_ecall_are_nops() {
        let mut exec = executor_with_program(&[assemble_fence(), assemble_ecall()]);
        step_n(&mut exec, 2);
        assert_eq!(exec.state.pc, BASE + 8);
    }

    #[test]
    fn test_ebreak_is_nop() {
        let mut exec = executor_with_program(&[0x00100073]);
        step_n(&mut exec, 1);
        assert_eq!(exec.state.pc, BASE + 4);
    }

    #[test]
    fn test_cycle_count_tracks_steps() {
        let mut exec = executor_with_program(&[assemble_nop(); 5]);
        assert_eq!(exec.state.cycle_count, 0);
        step_n(&mut exec, 5);
        assert_eq!(exec.state.cycle_count, 5);
    }

    #[test]
    fn test_unknown_opcode() {
        let mut exec = executor_with_program(&[0x0000007F]);
        assert!(matches!(
            exec.step(),
            Err(ExecutorError::UnknownOpcode { .. })
        ));
    }

    #[test]
    fn test_unknown_funct() {
        // OP with funct7 = 0x7F has no mapping.
        let mut exec = executor_with_program(&[assemble_r(opcode::OP, 1, 0b000, 2, 3, 0x7F)]);
        assert!(matches!(
            exec.step(),
            Err(ExecutorError::UnknownFunct { .. })
        ));
    }

    #[test]
    fn test_unknown_sys_imm() {
        let mut exec = executor_with_program(&[assemble_i(opcode::SYSTEM, 0, 0, 0, 2)]);
        assert!(matches!(
            exec.step(),
            Err(ExecutorError::UnknownSysImm { imm: 2 })
        ));
    }

    #[test]
    fn test_fetch_out_of_bounds() {
        let mut exec = executor_with_program(&[]);
        exec.state.pc = 0x8000;
        assert!(matches!(exec.step(), Err(ExecutorError::OutOfBounds { .. })));
    }

    #[test]
    fn test_htif_exit() {
        // Region covers the HTIF doublewords and the program.
        let mut memory = Memory::new(0x2000, 0x10000);
        memory.write_word(0x8000, assemble_nop()).unwrap();
        // Command block: EXIT with value 42.
        memory.write_dword(0x3000, 93).unwrap();
        memory.write_dword(0x3008, 42).unwrap();
        memory.write_dword(HTIF_TOHOST_ADDRESS, 0x3000).unwrap();

        let mut exec = Executor::with_io(memory, NopTracer, FdTable::new());
        exec.state.pc = 0x8000;
        assert_eq!(exec.step().unwrap(), StepOutcome::Exit(42));
    }

    #[test]
    fn test_htif_unknown_syscall() {
        let mut memory = Memory::new(0x2000, 0x10000);
        memory.write_word(0x8000, assemble_nop()).unwrap();
        memory.write_dword(0x3000, 1234).unwrap();
        memory.write_dword(HTIF_TOHOST_ADDRESS, 0x3000).unwrap();

        let mut exec = Executor::with_io(memory, NopTracer, FdTable::new());
        exec.state.pc = 0x8000;
        assert!(matches!(
            exec.step(),
            Err(ExecutorError::UnknownSyscall { id: 1234 })
        ));
    }

    #[test]
    fn test_htif_not_polled_outside_region() {
        // Default base leaves the HTIF channel unmapped; stepping works.
        let mut exec = executor_with_program(&[assemble_nop()]);
        step_n(&mut exec, 1);
        assert_eq!(exec.state.pc, BASE + 4);
    }

    #[test]
    fn test_run_exit() {
        let mut memory = Memory::new(0x2000, 0x10000);
        memory.write_word(0x8000, assemble_nop()).unwrap();
        memory.write_dword(0x3000, 93).unwrap();
        memory.write_dword(0x3008, 7).unwrap();
        memory.write_dword(HTIF_TOHOST_ADDRESS, 0x3000).unwrap();
        let mut exec = Executor::with_io(memory, NopTracer, FdTable::new());
        exec.state.pc = 0x8000;
        assert_eq!(exec.run(0).unwrap(), RunOutcome::Exit(7));
    }

    #[test]
    fn test_run_cycle_limit() {
        let mut exec = executor_with_program(&[
            assemble_jal(0, 0), // jump-to-self
        ]);
        assert_eq!(exec.run(10).unwrap(), RunOutcome::CycleLimit);
        assert_eq!(exec.state.cycle_count, 10);
    }
}
