//! Shared test harness: serialized kernel boots (the kernel is global
//! state, so scenarios take turns) and a tiny assembler for guest
//! programs.

#![allow(dead_code)]

use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use churro_os::config::{KernelConfig, SchedulerPolicy};
use churro_os::machine::filesys::MemFileSystem;
use churro_os::machine::processor::{encode, Opcode};
use churro_os::machine::MachineConfig;
use churro_os::userprog::ExitStatus;

/// Guest register operands.
pub const V0: u8 = 0;
pub const A0: u8 = 1;
pub const A1: u8 = 2;
pub const A2: u8 = 3;
pub const A3: u8 = 4;
pub const SP: u8 = 5;

fn kernel_turn() -> MutexGuard<'static, ()> {
    static TURN: OnceLock<Mutex<()>> = OnceLock::new();
    TURN.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A booted kernel. Holds the turn lock, so at most one lives at a
/// time; drop it to let the next scenario boot.
pub struct Kernel {
    pub fs: Arc<MemFileSystem>,
    _turn: MutexGuard<'static, ()>,
}

pub fn boot(policy: SchedulerPolicy) -> Kernel {
    boot_with(policy, 64, 1)
}

pub fn boot_with(policy: SchedulerPolicy, pages: usize, seed: u64) -> Kernel {
    let turn = kernel_turn();
    let fs = Arc::new(MemFileSystem::new());
    let config = KernelConfig {
        machine: MachineConfig {
            num_phys_pages: pages,
            seed,
            mirror_console: false,
        },
        policy,
        program: String::new(),
        args: Vec::new(),
        file_system: Some(fs.clone()),
    };
    churro_os::boot(&config);
    Kernel { fs, _turn: turn }
}

/// Boot and run `program` as the root process, returning its exit
/// status once the machine halts.
pub fn run_program(
    policy: SchedulerPolicy,
    fs: Arc<MemFileSystem>,
    program: &str,
    args: &[&str],
) -> (Option<ExitStatus>, MutexGuard<'static, ()>) {
    let turn = kernel_turn();
    let config = KernelConfig {
        machine: MachineConfig {
            num_phys_pages: 64,
            seed: 1,
            mirror_console: false,
        },
        policy,
        program: program.to_string(),
        args: args.iter().map(|a| a.to_string()).collect(),
        file_system: Some(fs),
    };
    let status = churro_os::run(&config).expect("root program failed to load");
    (status, turn)
}

/// Assembles guest code; `pos` tracks the next byte so data labels
/// can be computed while emitting.
pub struct Asm {
    bytes: Vec<u8>,
}

impl Asm {
    pub fn new() -> Asm {
        Asm { bytes: Vec::new() }
    }

    pub fn pos(&self) -> u32 {
        self.bytes.len() as u32
    }

    fn emit(&mut self, op: Opcode, rd: u8, rs: u8, imm: u32) -> &mut Asm {
        self.bytes.extend_from_slice(&encode(op, rd, rs, imm).to_le_bytes());
        self
    }

    pub fn li(&mut self, rd: u8, imm: u32) -> &mut Asm {
        self.emit(Opcode::Li, rd, 0, imm)
    }

    pub fn mov(&mut self, rd: u8, rs: u8) -> &mut Asm {
        self.emit(Opcode::Mov, rd, rs, 0)
    }

    pub fn addi(&mut self, rd: u8, rs: u8, imm: u32) -> &mut Asm {
        self.emit(Opcode::Addi, rd, rs, imm)
    }

    pub fn lw(&mut self, rd: u8, rs: u8, imm: u32) -> &mut Asm {
        self.emit(Opcode::Lw, rd, rs, imm)
    }

    pub fn sw(&mut self, rd: u8, rs: u8, imm: u32) -> &mut Asm {
        self.emit(Opcode::Sw, rd, rs, imm)
    }

    pub fn jmp(&mut self, target: u32) -> &mut Asm {
        self.emit(Opcode::J, 0, 0, target)
    }

    pub fn bne(&mut self, rd: u8, rs: u8, target: u32) -> &mut Asm {
        self.emit(Opcode::Bne, rd, rs, target)
    }

    pub fn sys(&mut self) -> &mut Asm {
        self.emit(Opcode::Sys, 0, 0, 0)
    }

    pub fn data(&mut self, bytes: &[u8]) -> &mut Asm {
        self.bytes.extend_from_slice(bytes);
        self
    }

    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.bytes)
    }
}

impl Default for Asm {
    fn default() -> Asm {
        Asm::new()
    }
}
