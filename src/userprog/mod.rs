//! The user-process subsystem: paged address spaces over the
//! kernel-wide frame pool, the syscall surface, and process
//! lifecycle.

pub mod frame_pool;
pub mod kernel;
pub mod process;

pub use process::{ExitStatus, SyscallOutcome, UserProcess};
