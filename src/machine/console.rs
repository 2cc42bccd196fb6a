//! The console device.
//!
//! A pair of byte channels exposed as [`OpenFile`] handles; processes
//! see them as fd 0 and fd 1. Tests feed the input side and inspect
//! the output side; the simulator binary mirrors output to the real
//! stdout as it arrives.

use std::collections::VecDeque;
use std::io::{self, Write};

use lazy_static::lazy_static;
use spin::Mutex;

use super::filesys::OpenFile;

struct Console {
    input: VecDeque<u8>,
    output: Vec<u8>,
    mirror: bool,
}

lazy_static! {
    static ref CONSOLE: Mutex<Console> = Mutex::new(Console {
        input: VecDeque::new(),
        output: Vec::new(),
        mirror: false,
    });
}

/// Reset both channels. `mirror` echoes output to host stdout.
pub fn init(mirror: bool) {
    let mut console = CONSOLE.lock();
    console.input.clear();
    console.output.clear();
    console.mirror = mirror;
}

/// Queue bytes for the guest to read from fd 0.
pub fn feed_input(bytes: &[u8]) {
    CONSOLE.lock().input.extend(bytes);
}

/// Drain everything the guest has written to fd 1 so far.
pub fn take_output() -> Vec<u8> {
    std::mem::take(&mut CONSOLE.lock().output)
}

pub fn stdin_file() -> Box<dyn OpenFile> {
    Box::new(ConsoleFile { readable: true })
}

pub fn stdout_file() -> Box<dyn OpenFile> {
    Box::new(ConsoleFile { readable: false })
}

struct ConsoleFile {
    readable: bool,
}

impl OpenFile for ConsoleFile {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        if !self.readable {
            return 0;
        }
        let mut console = CONSOLE.lock();
        let amount = buf.len().min(console.input.len());
        for slot in buf[..amount].iter_mut() {
            *slot = console.input.pop_front().unwrap();
        }
        amount
    }

    fn write(&mut self, buf: &[u8]) -> usize {
        if self.readable {
            return 0;
        }
        let mut console = CONSOLE.lock();
        console.output.extend_from_slice(buf);
        if console.mirror {
            let mut stdout = io::stdout();
            let _ = stdout.write_all(buf);
            let _ = stdout.flush();
        }
        buf.len()
    }

    fn read_at(&mut self, _pos: usize, buf: &mut [u8]) -> usize {
        self.read(buf)
    }

    fn write_at(&mut self, _pos: usize, buf: &[u8]) -> usize {
        self.write(buf)
    }

    fn length(&self) -> usize {
        0
    }
}
