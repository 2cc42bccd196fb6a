//! File-system seam between the kernel and its storage.
//!
//! The kernel only ever sees [`FileSystem`] and [`OpenFile`]; two
//! backends implement them. [`MemFileSystem`] keeps named byte vectors
//! in memory and is the default under test. [`HostFileSystem`] passes
//! through to a directory on the host and backs the simulator binary.

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;

use lazy_static::lazy_static;
use spin::Mutex;

/// An open file with a private cursor. Reads and writes are
/// best-effort and return the number of bytes moved.
pub trait OpenFile: Send {
    fn read(&mut self, buf: &mut [u8]) -> usize;
    fn write(&mut self, buf: &[u8]) -> usize;
    fn read_at(&mut self, pos: usize, buf: &mut [u8]) -> usize;
    fn write_at(&mut self, pos: usize, buf: &[u8]) -> usize;
    fn length(&self) -> usize;
}

pub trait FileSystem: Send + Sync {
    /// Open `name`, creating it first when `create` is set. `None` on
    /// a missing file or a failed create.
    fn open(&self, name: &str, create: bool) -> Option<Box<dyn OpenFile>>;
    /// Remove `name`. Handles already open keep their data.
    fn remove(&self, name: &str) -> bool;
}

lazy_static! {
    static ref FILE_SYSTEM: Mutex<Option<Arc<dyn FileSystem>>> = Mutex::new(None);
}

/// Mount the kernel-wide file system.
pub fn mount(fs: Arc<dyn FileSystem>) {
    *FILE_SYSTEM.lock() = Some(fs);
}

pub fn file_system() -> Arc<dyn FileSystem> {
    FILE_SYSTEM
        .lock()
        .clone()
        .expect("filesys: no file system mounted")
}

// ── In-memory backend ──────────────────────────────────────────────

#[derive(Default)]
pub struct MemFileSystem {
    files: Mutex<HashMap<String, Arc<Mutex<Vec<u8>>>>>,
}

impl MemFileSystem {
    pub fn new() -> MemFileSystem {
        MemFileSystem::default()
    }

    /// Seed a file with contents, as a loader or test fixture would.
    pub fn install(&self, name: &str, data: Vec<u8>) {
        self.files
            .lock()
            .insert(name.to_string(), Arc::new(Mutex::new(data)));
    }

    /// Snapshot of a file's current bytes, if it exists.
    pub fn contents(&self, name: &str) -> Option<Vec<u8>> {
        self.files.lock().get(name).map(|data| data.lock().clone())
    }
}

impl FileSystem for MemFileSystem {
    fn open(&self, name: &str, create: bool) -> Option<Box<dyn OpenFile>> {
        let mut files = self.files.lock();
        let data = match files.get(name) {
            Some(data) => data.clone(),
            None if create => {
                let data = Arc::new(Mutex::new(Vec::new()));
                files.insert(name.to_string(), data.clone());
                data
            }
            None => return None,
        };
        Some(Box::new(MemFile { data, pos: 0 }))
    }

    fn remove(&self, name: &str) -> bool {
        self.files.lock().remove(name).is_some()
    }
}

struct MemFile {
    data: Arc<Mutex<Vec<u8>>>,
    pos: usize,
}

impl OpenFile for MemFile {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        let moved = self.read_at(self.pos, buf);
        self.pos += moved;
        moved
    }

    fn write(&mut self, buf: &[u8]) -> usize {
        let moved = self.write_at(self.pos, buf);
        self.pos += moved;
        moved
    }

    fn read_at(&mut self, pos: usize, buf: &mut [u8]) -> usize {
        let data = self.data.lock();
        if pos >= data.len() {
            return 0;
        }
        let amount = buf.len().min(data.len() - pos);
        buf[..amount].copy_from_slice(&data[pos..pos + amount]);
        amount
    }

    fn write_at(&mut self, pos: usize, buf: &[u8]) -> usize {
        let mut data = self.data.lock();
        if data.len() < pos + buf.len() {
            data.resize(pos + buf.len(), 0);
        }
        data[pos..pos + buf.len()].copy_from_slice(buf);
        buf.len()
    }

    fn length(&self) -> usize {
        self.data.lock().len()
    }
}

// ── Host pass-through backend ──────────────────────────────────────

pub struct HostFileSystem {
    root: PathBuf,
}

impl HostFileSystem {
    pub fn new(root: impl Into<PathBuf>) -> HostFileSystem {
        HostFileSystem { root: root.into() }
    }
}

impl FileSystem for HostFileSystem {
    fn open(&self, name: &str, create: bool) -> Option<Box<dyn OpenFile>> {
        let path = self.root.join(name);
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(path)
            .ok()?;
        Some(Box::new(HostFile { file }))
    }

    fn remove(&self, name: &str) -> bool {
        fs::remove_file(self.root.join(name)).is_ok()
    }
}

struct HostFile {
    file: fs::File,
}

impl OpenFile for HostFile {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        self.file.read(buf).unwrap_or(0)
    }

    fn write(&mut self, buf: &[u8]) -> usize {
        self.file.write(buf).unwrap_or(0)
    }

    fn read_at(&mut self, pos: usize, buf: &mut [u8]) -> usize {
        if self.file.seek(SeekFrom::Start(pos as u64)).is_err() {
            return 0;
        }
        self.file.read(buf).unwrap_or(0)
    }

    fn write_at(&mut self, pos: usize, buf: &[u8]) -> usize {
        if self.file.seek(SeekFrom::Start(pos as u64)).is_err() {
            return 0;
        }
        self.file.write(buf).unwrap_or(0)
    }

    fn length(&self) -> usize {
        self.file.metadata().map(|m| m.len() as usize).unwrap_or(0)
    }
}
