//! User processes: a paged address space, a file-descriptor table,
//! parent/child bookkeeping, and the ten-call syscall surface.

use std::collections::HashMap;
use std::sync::Arc;

use spin::Mutex;

use crate::machine::filesys::{self, OpenFile};
use crate::machine::object_file::{LoadError, ObjectFile, Section};
use crate::machine::processor::{
    self, TranslationEntry, INSTR_SIZE, PAGE_SIZE, REG_A0, REG_A1, REG_NEXT_PC, REG_PC, REG_SP,
};
use crate::machine::console;
use crate::threads::KThread;
use crate::userprog::{frame_pool, kernel};

/// Syscall numbers, as guest code places them in `V0`.
pub const SYS_HALT: i32 = 0;
pub const SYS_EXIT: i32 = 1;
pub const SYS_EXEC: i32 = 2;
pub const SYS_JOIN: i32 = 3;
pub const SYS_CREATE: i32 = 4;
pub const SYS_OPEN: i32 = 5;
pub const SYS_READ: i32 = 6;
pub const SYS_WRITE: i32 = 7;
pub const SYS_CLOSE: i32 = 8;
pub const SYS_UNLINK: i32 = 9;

/// Longest name or argument string a syscall will read from user
/// memory, NUL terminator excluded.
pub const MAX_STRING_LENGTH: usize = 256;

pub const ROOT_PID: u32 = 0;

/// How a process ended: its status code and whether it got there via
/// `exit` rather than a fatal exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: i32,
    pub normal: bool,
}

/// What the kernel's dispatch loop should do after a syscall.
#[derive(Debug, PartialEq, Eq)]
pub enum SyscallOutcome {
    Return(i32),
    Exit,
}

/// What the dispatch loop should do after any exception.
#[derive(Debug, PartialEq, Eq)]
pub enum Action {
    Resume,
    Exit,
}

/// A child the parent can still join.
pub struct ChildRecord {
    pub thread: KThread,
    pub status: Arc<Mutex<Option<ExitStatus>>>,
}

pub struct UserProcess {
    pid: u32,
    name: String,
    page_table: Arc<Mutex<Vec<TranslationEntry>>>,
    owned_frames: Vec<u32>,
    files: HashMap<i32, Box<dyn OpenFile>>,
    next_fd: i32,
    children: HashMap<u32, ChildRecord>,
    exit_record: Arc<Mutex<Option<ExitStatus>>>,
    init_registers: [i32; processor::NUM_REGS],
}

impl UserProcess {
    /// A fresh process for the named executable, fd 0 and 1 wired to
    /// the console. Nothing is mapped until `load`.
    pub fn new(name: &str) -> UserProcess {
        let num_pages = processor::num_phys_pages();
        let table = (0..num_pages as u32).map(TranslationEntry::invalid).collect();
        let mut files: HashMap<i32, Box<dyn OpenFile>> = HashMap::new();
        files.insert(0, console::stdin_file());
        files.insert(1, console::stdout_file());
        UserProcess {
            pid: kernel::next_pid(),
            name: name.to_string(),
            page_table: Arc::new(Mutex::new(table)),
            owned_frames: Vec::new(),
            files,
            next_fd: 2,
            children: HashMap::new(),
            exit_record: Arc::new(Mutex::new(None)),
            init_registers: [0; processor::NUM_REGS],
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn page_table(&self) -> Arc<Mutex<Vec<TranslationEntry>>> {
        self.page_table.clone()
    }

    pub(crate) fn exit_record(&self) -> Arc<Mutex<Option<ExitStatus>>> {
        self.exit_record.clone()
    }

    pub(crate) fn initial_registers(&self) -> [i32; processor::NUM_REGS] {
        self.init_registers
    }

    /// Place the executable in memory: one frame per section page,
    /// loaded and mapped; the argument page mapped last-numbered and
    /// filled per the argv layout; registers staged for first entry.
    pub fn load(&mut self, args: &[String]) -> Result<(), LoadError> {
        let file = filesys::file_system()
            .open(&self.name, false)
            .ok_or(LoadError::NotFound)?;
        let mut object = ObjectFile::open(file)?;

        let num_pages = processor::num_phys_pages();
        let argv_vpn = num_pages - 1;
        if object.num_pages() as usize > argv_vpn {
            return Err(LoadError::TooLarge);
        }

        let sections: Vec<Section> = object.sections().to_vec();
        for (index, section) in sections.iter().enumerate() {
            for page in 0..section.num_pages {
                let vpn = section.first_vpn + page;
                let frame = match frame_pool::try_allocate() {
                    Some(frame) => frame,
                    None => {
                        self.unwind_load();
                        return Err(LoadError::OutOfFrames);
                    }
                };
                self.owned_frames.push(frame);
                if let Err(error) = object.load_page(index, page, frame) {
                    self.unwind_load();
                    return Err(error);
                }
                self.page_table.lock()[vpn as usize] = TranslationEntry {
                    vpn,
                    ppn: frame,
                    valid: true,
                    read_only: section.read_only,
                    used: false,
                    dirty: false,
                };
            }
        }

        let argv_frame = match frame_pool::try_allocate() {
            Some(frame) => frame,
            None => {
                self.unwind_load();
                return Err(LoadError::OutOfFrames);
            }
        };
        self.owned_frames.push(argv_frame);
        self.page_table.lock()[argv_vpn] = TranslationEntry {
            vpn: argv_vpn as u32,
            ppn: argv_frame,
            valid: true,
            read_only: false,
            used: false,
            dirty: false,
        };

        let argv_base = (argv_vpn * PAGE_SIZE) as u32;
        if let Err(error) = self.write_arguments(argv_base, args) {
            self.unwind_load();
            return Err(error);
        }

        self.init_registers = [0; processor::NUM_REGS];
        self.init_registers[REG_PC] = object.entry() as i32;
        self.init_registers[REG_NEXT_PC] = (object.entry() + INSTR_SIZE) as i32;
        self.init_registers[REG_SP] = argv_base as i32;
        self.init_registers[REG_A0] = args.len() as i32;
        self.init_registers[REG_A1] = argv_base as i32;

        log::debug!(
            "process {}: loaded '{}', {} section pages + argv page",
            self.pid,
            self.name,
            object.num_pages()
        );
        Ok(())
    }

    fn unwind_load(&mut self) {
        let frames = std::mem::take(&mut self.owned_frames);
        let mut table = self.page_table.lock();
        for entry in table.iter_mut() {
            *entry = TranslationEntry::invalid(entry.vpn);
        }
        drop(table);
        if !frames.is_empty() {
            frame_pool::release(&frames);
        }
    }

    /// The argv layout: `argc` four-byte little-endian pointers at
    /// the base of the page, each addressing one of the
    /// NUL-terminated strings that follow.
    fn write_arguments(&mut self, argv_base: u32, args: &[String]) -> Result<(), LoadError> {
        let pointer_bytes = 4 * args.len();
        let string_bytes: usize = args.iter().map(|a| a.len() + 1).sum();
        if pointer_bytes + string_bytes > PAGE_SIZE {
            return Err(LoadError::ArgumentsTooLarge);
        }

        let mut block = Vec::with_capacity(pointer_bytes + string_bytes);
        let mut string_vaddr = argv_base + pointer_bytes as u32;
        for arg in args {
            block.extend_from_slice(&string_vaddr.to_le_bytes());
            string_vaddr += arg.len() as u32 + 1;
        }
        for arg in args {
            block.extend_from_slice(arg.as_bytes());
            block.push(0);
        }
        if self.write_virtual_memory(argv_base, &block) != block.len() {
            return Err(LoadError::ArgumentsTooLarge);
        }
        Ok(())
    }

    /// Copy from user memory into `buf`, page by page, stopping at
    /// the first invalid mapping. Returns bytes moved; never panics
    /// on a bad address.
    pub fn read_virtual_memory(&self, vaddr: u32, buf: &mut [u8]) -> usize {
        let mut done = 0usize;
        while done < buf.len() {
            let addr = vaddr as usize + done;
            let vpn = addr / PAGE_SIZE;
            let offset = addr % PAGE_SIZE;
            let Some(ppn) = self.lookup(vpn, false) else { break };
            let amount = (buf.len() - done).min(PAGE_SIZE - offset);
            let paddr = ppn as usize * PAGE_SIZE + offset;
            let moved = processor::read_phys(paddr, &mut buf[done..done + amount]);
            done += moved;
            if moved < amount {
                break;
            }
        }
        done
    }

    /// Copy `buf` into user memory. Read-only pages stop the copy.
    pub fn write_virtual_memory(&self, vaddr: u32, buf: &[u8]) -> usize {
        let mut done = 0usize;
        while done < buf.len() {
            let addr = vaddr as usize + done;
            let vpn = addr / PAGE_SIZE;
            let offset = addr % PAGE_SIZE;
            let Some(ppn) = self.lookup(vpn, true) else { break };
            let amount = (buf.len() - done).min(PAGE_SIZE - offset);
            let paddr = ppn as usize * PAGE_SIZE + offset;
            let moved = processor::write_phys(paddr, &buf[done..done + amount]);
            done += moved;
            if moved < amount {
                break;
            }
        }
        done
    }

    /// Look up a valid mapping, flagging `used` (and `dirty` when
    /// writing). `None` for out-of-range, invalid, or read-only
    /// violations.
    fn lookup(&self, vpn: usize, write: bool) -> Option<u32> {
        let mut table = self.page_table.lock();
        let entry = table.get_mut(vpn)?;
        if !entry.valid || (write && entry.read_only) {
            return None;
        }
        entry.used = true;
        if write {
            entry.dirty = true;
        }
        Some(entry.ppn)
    }

    /// Read a NUL-terminated string of at most `MAX_STRING_LENGTH`
    /// bytes. `None` if the terminator never shows up or the memory
    /// is bad.
    pub fn read_virtual_memory_string(&self, vaddr: u32) -> Option<String> {
        let mut bytes = vec![0u8; MAX_STRING_LENGTH + 1];
        let got = self.read_virtual_memory(vaddr, &mut bytes);
        let nul = bytes[..got].iter().position(|&b| b == 0)?;
        String::from_utf8(bytes[..nul].to_vec()).ok()
    }

    /// Fault-in one page, blocking until a frame is available.
    /// `false` when the vpn is outside the address space.
    pub fn allocate_page(&mut self, vpn: usize) -> bool {
        {
            let table = self.page_table.lock();
            match table.get(vpn) {
                None => return false,
                Some(entry) if entry.valid => return true,
                Some(_) => {}
            }
        }
        let frame = frame_pool::allocate_or_wait();
        self.owned_frames.push(frame);
        self.page_table.lock()[vpn] = TranslationEntry {
            vpn: vpn as u32,
            ppn: frame,
            valid: true,
            read_only: false,
            used: false,
            dirty: false,
        };
        true
    }

    /// Kernel entry for every user exception.
    pub fn handle_exception(&mut self, cause: processor::Exception) -> Action {
        match cause {
            processor::Exception::Syscall => {
                let number = processor::read_register(processor::REG_V0);
                let args = [
                    processor::read_register(REG_A0),
                    processor::read_register(REG_A1),
                    processor::read_register(processor::REG_A2),
                    processor::read_register(processor::REG_A3),
                ];
                match self.handle_syscall(number, args) {
                    SyscallOutcome::Return(value) => {
                        processor::write_register(processor::REG_V0, value);
                        processor::advance_pc();
                        Action::Resume
                    }
                    SyscallOutcome::Exit => Action::Exit,
                }
            }
            processor::Exception::PageFault => {
                let bad = processor::read_register(processor::REG_BAD_VADDR) as u32;
                if self.allocate_page(bad as usize / PAGE_SIZE) {
                    Action::Resume
                } else {
                    self.handle_exit(cause as i32, false);
                    Action::Exit
                }
            }
            _ => {
                log::warn!(
                    "process {}: fatal exception {:?}, terminating",
                    self.pid,
                    cause
                );
                self.handle_exit(cause as i32, false);
                Action::Exit
            }
        }
    }

    /// The ten-call syscall table. Failures come back as −1; only
    /// `halt` (by root) and `exit` end the calling process.
    pub fn handle_syscall(&mut self, number: i32, args: [i32; 4]) -> SyscallOutcome {
        match number {
            SYS_HALT => {
                if self.pid != ROOT_PID {
                    return SyscallOutcome::Return(-1);
                }
                crate::machine::halt();
                self.handle_exit(0, true);
                SyscallOutcome::Exit
            }
            SYS_EXIT => {
                self.handle_exit(args[0], true);
                SyscallOutcome::Exit
            }
            SYS_EXEC => {
                SyscallOutcome::Return(self.handle_exec(args[0] as u32, args[1], args[2] as u32))
            }
            SYS_JOIN => SyscallOutcome::Return(self.handle_join(args[0], args[1] as u32)),
            SYS_CREATE => SyscallOutcome::Return(self.handle_open(args[0] as u32, true)),
            SYS_OPEN => SyscallOutcome::Return(self.handle_open(args[0] as u32, false)),
            SYS_READ => {
                SyscallOutcome::Return(self.handle_read(args[0], args[1] as u32, args[2]))
            }
            SYS_WRITE => {
                SyscallOutcome::Return(self.handle_write(args[0], args[1] as u32, args[2]))
            }
            SYS_CLOSE => SyscallOutcome::Return(self.handle_close(args[0])),
            SYS_UNLINK => SyscallOutcome::Return(self.handle_unlink(args[0] as u32)),
            _ => {
                log::warn!("process {}: unknown syscall {}", self.pid, number);
                SyscallOutcome::Return(-1)
            }
        }
    }

    fn handle_open(&mut self, name_ptr: u32, create: bool) -> i32 {
        let Some(name) = self.read_virtual_memory_string(name_ptr) else {
            return -1;
        };
        let Some(file) = filesys::file_system().open(&name, create) else {
            return -1;
        };
        let fd = self.next_fd;
        // Ids are monotonic, so a collision cannot happen; the check
        // stays because the table must never overwrite an entry.
        if self.files.contains_key(&fd) {
            return -1;
        }
        self.files.insert(fd, file);
        self.next_fd += 1;
        fd
    }

    fn handle_read(&mut self, fd: i32, buf_ptr: u32, size: i32) -> i32 {
        if size < 0 {
            return -1;
        }
        let Some(file) = self.files.get_mut(&fd) else {
            return -1;
        };
        let mut buf = vec![0u8; size as usize];
        let got = file.read(&mut buf);
        let put = self.write_virtual_memory(buf_ptr, &buf[..got]);
        if put < got {
            return -1;
        }
        got as i32
    }

    fn handle_write(&mut self, fd: i32, buf_ptr: u32, size: i32) -> i32 {
        if size < 0 {
            return -1;
        }
        if !self.files.contains_key(&fd) {
            return -1;
        }
        let mut buf = vec![0u8; size as usize];
        if self.read_virtual_memory(buf_ptr, &mut buf) < size as usize {
            return -1;
        }
        let file = self.files.get_mut(&fd).unwrap();
        // A short write is an error, not a partial success.
        if file.write(&buf) < size as usize {
            return -1;
        }
        size
    }

    fn handle_close(&mut self, fd: i32) -> i32 {
        match self.files.remove(&fd) {
            Some(_) => 0,
            None => -1,
        }
    }

    fn handle_unlink(&mut self, name_ptr: u32) -> i32 {
        let Some(name) = self.read_virtual_memory_string(name_ptr) else {
            return -1;
        };
        if filesys::file_system().remove(&name) {
            0
        } else {
            -1
        }
    }

    fn handle_exec(&mut self, name_ptr: u32, argc: i32, argv_ptr: u32) -> i32 {
        let Some(name) = self.read_virtual_memory_string(name_ptr) else {
            return -1;
        };
        if argc < 0 {
            return -1;
        }
        let mut args = Vec::with_capacity(argc as usize);
        for index in 0..argc as u32 {
            let mut pointer = [0u8; 4];
            if self.read_virtual_memory(argv_ptr + 4 * index, &mut pointer) < 4 {
                return -1;
            }
            let Some(arg) = self.read_virtual_memory_string(u32::from_le_bytes(pointer)) else {
                return -1;
            };
            args.push(arg);
        }

        let mut child = UserProcess::new(&name);
        if let Err(error) = child.load(&args) {
            log::debug!("process {}: exec '{}' failed: {}", self.pid, name, error);
            return -1;
        }
        let (pid, record) = kernel::launch(child);
        self.children.insert(pid, record);
        pid as i32
    }

    fn handle_join(&mut self, pid: i32, status_ptr: u32) -> i32 {
        if pid < 0 {
            return -1;
        }
        // Only direct children may be joined, and only once: the
        // record is consumed here.
        let Some(record) = self.children.remove(&(pid as u32)) else {
            return -1;
        };
        record.thread.join();
        let status = *record.status.lock();
        let Some(status) = status else {
            return 0;
        };
        if self.write_virtual_memory(status_ptr, &status.code.to_le_bytes()) < 4 {
            return -1;
        }
        if status.normal && status.code == 0 {
            1
        } else {
            0
        }
    }

    /// Exit path, shared by the `exit` syscall and fatal exceptions:
    /// close every descriptor, return frames (waking frame-starved
    /// threads), record the status, and unregister the pid — halting
    /// the machine when no process remains. All of it tolerates being
    /// run on a partially torn-down process.
    pub fn handle_exit(&mut self, code: i32, normal: bool) {
        log::debug!(
            "process {}: exit code {} ({})",
            self.pid,
            code,
            if normal { "normal" } else { "killed" }
        );
        self.files.clear();

        let frames = std::mem::take(&mut self.owned_frames);
        {
            let mut table = self.page_table.lock();
            for entry in table.iter_mut() {
                *entry = TranslationEntry::invalid(entry.vpn);
            }
        }
        if !frames.is_empty() {
            frame_pool::release(&frames);
        }

        *self.exit_record.lock() = Some(ExitStatus { code, normal });
        if kernel::unregister(self.pid) {
            crate::machine::halt();
        }
    }
}
