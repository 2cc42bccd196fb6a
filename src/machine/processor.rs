//! The simulated processor: registers, physical memory, address
//! translation, and a compact fixed-width guest instruction set.
//!
//! Instructions are 64-bit words: `[op u8][rd u8][rs u8][_ u8][imm u32]`,
//! little-endian. The processor executes one instruction per `step`,
//! charging one clock tick with interrupts enabled between
//! instructions, and reports exceptions to the caller instead of
//! handling them — the kernel's dispatch loop owns that.

use std::sync::Arc;

use bit_field::BitField;
use lazy_static::lazy_static;
use spin::Mutex;

use super::interrupt;

/// Size of a page, in bytes.
pub const PAGE_SIZE: usize = 1024;
/// Size of one instruction, in bytes.
pub const INSTR_SIZE: u32 = 8;

/// Guest-visible registers.
pub const REG_V0: usize = 0;
pub const REG_A0: usize = 1;
pub const REG_A1: usize = 2;
pub const REG_A2: usize = 3;
pub const REG_A3: usize = 4;
pub const REG_SP: usize = 5;
/// Privileged registers, invisible to guest code.
pub const REG_PC: usize = 6;
pub const REG_NEXT_PC: usize = 7;
pub const REG_BAD_VADDR: usize = 8;
pub const REG_CAUSE: usize = 9;
pub const NUM_REGS: usize = 10;

const NUM_GUEST_REGS: u8 = 6;

/// Exception causes, reported to the kernel's dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    Syscall = 0,
    PageFault = 1,
    TlbMiss = 2,
    ReadOnly = 3,
    BusError = 4,
    AddressError = 5,
    Overflow = 6,
    IllegalInstruction = 7,
}

/// One page-table entry, as the processor sees it.
#[derive(Debug, Clone, Copy)]
pub struct TranslationEntry {
    pub vpn: u32,
    pub ppn: u32,
    pub valid: bool,
    pub read_only: bool,
    pub used: bool,
    pub dirty: bool,
}

impl TranslationEntry {
    pub fn invalid(vpn: u32) -> TranslationEntry {
        TranslationEntry {
            vpn,
            ppn: 0,
            valid: false,
            read_only: false,
            used: false,
            dirty: false,
        }
    }
}

/// Guest opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// `rd = imm`
    Li = 1,
    /// `rd = rs`
    Mov = 2,
    /// `rd = rs + imm` (wrapping)
    Addi = 3,
    /// `rd = mem32[rs + imm]`
    Lw = 4,
    /// `mem32[rd + imm] = rs`
    Sw = 5,
    /// `pc = imm`
    J = 6,
    /// `if rd != rs { pc = imm }`
    Bne = 7,
    /// Raise `Exception::Syscall`; number in V0, args in A0–A3.
    Sys = 8,
}

impl Opcode {
    fn decode(op: u8) -> Option<Opcode> {
        match op {
            1 => Some(Opcode::Li),
            2 => Some(Opcode::Mov),
            3 => Some(Opcode::Addi),
            4 => Some(Opcode::Lw),
            5 => Some(Opcode::Sw),
            6 => Some(Opcode::J),
            7 => Some(Opcode::Bne),
            8 => Some(Opcode::Sys),
            _ => None,
        }
    }
}

/// Pack one instruction word.
pub fn encode(op: Opcode, rd: u8, rs: u8, imm: u32) -> u64 {
    let mut word = 0u64;
    word.set_bits(0..8, op as u64);
    word.set_bits(8..16, rd as u64);
    word.set_bits(16..24, rs as u64);
    word.set_bits(32..64, imm as u64);
    word
}

struct Processor {
    registers: [i32; NUM_REGS],
    memory: Vec<u8>,
    page_table: Option<Arc<Mutex<Vec<TranslationEntry>>>>,
}

lazy_static! {
    static ref PROCESSOR: Mutex<Processor> = Mutex::new(Processor {
        registers: [0; NUM_REGS],
        memory: Vec::new(),
        page_table: None,
    });
}

/// Reset the processor with `num_phys_pages` pages of zeroed memory.
pub fn init(num_phys_pages: usize) {
    let mut cpu = PROCESSOR.lock();
    cpu.registers = [0; NUM_REGS];
    cpu.memory = vec![0; num_phys_pages * PAGE_SIZE];
    cpu.page_table = None;
}

pub fn num_phys_pages() -> usize {
    PROCESSOR.lock().memory.len() / PAGE_SIZE
}

pub fn read_register(reg: usize) -> i32 {
    PROCESSOR.lock().registers[reg]
}

pub fn write_register(reg: usize, value: i32) {
    PROCESSOR.lock().registers[reg] = value;
}

/// `PC = NEXT_PC; NEXT_PC += INSTR_SIZE`. The syscall handler calls
/// this so the trapping instruction is not re-executed.
pub fn advance_pc() {
    let mut cpu = PROCESSOR.lock();
    let next = cpu.registers[REG_NEXT_PC];
    cpu.registers[REG_PC] = next;
    cpu.registers[REG_NEXT_PC] = next.wrapping_add(INSTR_SIZE as i32);
}

pub fn save_registers() -> [i32; NUM_REGS] {
    PROCESSOR.lock().registers
}

pub fn load_registers(registers: &[i32; NUM_REGS]) {
    PROCESSOR.lock().registers = *registers;
}

/// Point translation at a process's page table. The handle is shared,
/// so entries the kernel flips valid become visible immediately.
pub fn set_page_table(table: Arc<Mutex<Vec<TranslationEntry>>>) {
    PROCESSOR.lock().page_table = Some(table);
}

pub fn clear_page_table() {
    PROCESSOR.lock().page_table = None;
}

/// Bounded copy out of physical memory. Returns bytes copied.
pub fn read_phys(paddr: usize, buf: &mut [u8]) -> usize {
    let cpu = PROCESSOR.lock();
    if paddr >= cpu.memory.len() {
        return 0;
    }
    let amount = buf.len().min(cpu.memory.len() - paddr);
    buf[..amount].copy_from_slice(&cpu.memory[paddr..paddr + amount]);
    amount
}

/// Bounded copy into physical memory. Returns bytes copied.
pub fn write_phys(paddr: usize, buf: &[u8]) -> usize {
    let mut cpu = PROCESSOR.lock();
    if paddr >= cpu.memory.len() {
        return 0;
    }
    let amount = buf.len().min(cpu.memory.len() - paddr);
    cpu.memory[paddr..paddr + amount].copy_from_slice(&buf[..amount]);
    amount
}

/// Execute one instruction of the current process. `Err` reports the
/// exception to the kernel with `CAUSE` (and `BAD_VADDR` where
/// relevant) already staged; the program counter still addresses the
/// trapping instruction so a repaired fault simply re-executes.
pub fn step() -> Result<(), Exception> {
    interrupt::tick(interrupt::USER_TICK);
    let mut cpu = PROCESSOR.lock();
    let result = cpu.execute_one();
    if let Err(exception) = result {
        cpu.registers[REG_CAUSE] = exception as i32;
    }
    result
}

impl Processor {
    fn execute_one(&mut self) -> Result<(), Exception> {
        let pc = self.registers[REG_PC] as u32;
        if pc % INSTR_SIZE != 0 {
            return self.address_error(pc);
        }
        let mut raw = [0u8; INSTR_SIZE as usize];
        let paddr = self.translate(pc, false)?;
        raw.copy_from_slice(&self.memory[paddr..paddr + INSTR_SIZE as usize]);
        let word = u64::from_le_bytes(raw);

        let op = Opcode::decode(word.get_bits(0..8) as u8).ok_or(Exception::IllegalInstruction)?;
        let rd = word.get_bits(8..16) as u8;
        let rs = word.get_bits(16..24) as u8;
        let imm = word.get_bits(32..64) as u32;

        match op {
            Opcode::Li => {
                self.set_guest_reg(rd, imm as i32)?;
                self.advance();
            }
            Opcode::Mov => {
                let value = self.guest_reg(rs)?;
                self.set_guest_reg(rd, value)?;
                self.advance();
            }
            Opcode::Addi => {
                let value = self.guest_reg(rs)?.wrapping_add(imm as i32);
                self.set_guest_reg(rd, value)?;
                self.advance();
            }
            Opcode::Lw => {
                let vaddr = (self.guest_reg(rs)? as u32).wrapping_add(imm);
                let value = self.load_word(vaddr)?;
                self.set_guest_reg(rd, value)?;
                self.advance();
            }
            Opcode::Sw => {
                let vaddr = (self.guest_reg(rd)? as u32).wrapping_add(imm);
                let value = self.guest_reg(rs)?;
                self.store_word(vaddr, value)?;
                self.advance();
            }
            Opcode::J => {
                self.jump(imm);
            }
            Opcode::Bne => {
                if self.guest_reg(rd)? != self.guest_reg(rs)? {
                    self.jump(imm);
                } else {
                    self.advance();
                }
            }
            Opcode::Sys => {
                return Err(Exception::Syscall);
            }
        }
        Ok(())
    }

    fn advance(&mut self) {
        let next = self.registers[REG_NEXT_PC];
        self.registers[REG_PC] = next;
        self.registers[REG_NEXT_PC] = next.wrapping_add(INSTR_SIZE as i32);
    }

    fn jump(&mut self, target: u32) {
        self.registers[REG_PC] = target as i32;
        self.registers[REG_NEXT_PC] = target.wrapping_add(INSTR_SIZE) as i32;
    }

    fn guest_reg(&self, reg: u8) -> Result<i32, Exception> {
        if reg >= NUM_GUEST_REGS {
            return Err(Exception::IllegalInstruction);
        }
        Ok(self.registers[reg as usize])
    }

    fn set_guest_reg(&mut self, reg: u8, value: i32) -> Result<(), Exception> {
        if reg >= NUM_GUEST_REGS {
            return Err(Exception::IllegalInstruction);
        }
        self.registers[reg as usize] = value;
        Ok(())
    }

    fn load_word(&mut self, vaddr: u32) -> Result<i32, Exception> {
        if vaddr % 4 != 0 {
            return self.address_error(vaddr);
        }
        let paddr = self.translate(vaddr, false)?;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.memory[paddr..paddr + 4]);
        Ok(i32::from_le_bytes(raw))
    }

    fn store_word(&mut self, vaddr: u32, value: i32) -> Result<(), Exception> {
        if vaddr % 4 != 0 {
            return self.address_error(vaddr);
        }
        let paddr = self.translate(vaddr, true)?;
        self.memory[paddr..paddr + 4].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    fn address_error<T>(&mut self, vaddr: u32) -> Result<T, Exception> {
        self.registers[REG_BAD_VADDR] = vaddr as i32;
        Err(Exception::AddressError)
    }

    /// Translate a virtual address, flagging `used` (and `dirty` for
    /// writes). Accesses never straddle a page: callers are word- or
    /// instruction-aligned and the page size is a multiple of both.
    fn translate(&mut self, vaddr: u32, write: bool) -> Result<usize, Exception> {
        let Some(table) = self.page_table.clone() else {
            self.registers[REG_BAD_VADDR] = vaddr as i32;
            return Err(Exception::BusError);
        };
        let vpn = vaddr as usize / PAGE_SIZE;
        let offset = vaddr as usize % PAGE_SIZE;
        let mut table = table.lock();
        if vpn >= table.len() {
            return self.address_error(vaddr);
        }
        let entry = &mut table[vpn];
        if !entry.valid {
            self.registers[REG_BAD_VADDR] = vaddr as i32;
            return Err(Exception::PageFault);
        }
        if write && entry.read_only {
            self.registers[REG_BAD_VADDR] = vaddr as i32;
            return Err(Exception::ReadOnly);
        }
        entry.used = true;
        if write {
            entry.dirty = true;
        }
        let paddr = entry.ppn as usize * PAGE_SIZE + offset;
        if paddr >= self.memory.len() {
            self.registers[REG_BAD_VADDR] = vaddr as i32;
            return Err(Exception::BusError);
        }
        Ok(paddr)
    }
}
