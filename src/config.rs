//! Kernel configuration, built from the command line by the
//! simulator binary or directly by tests.

use std::sync::Arc;

use crate::machine::filesys::FileSystem;
use crate::machine::MachineConfig;

/// Which scheduling policy the kernel boots with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulerPolicy {
    RoundRobin,
    #[default]
    Priority,
    Lottery,
}

impl SchedulerPolicy {
    pub fn parse(name: &str) -> Option<SchedulerPolicy> {
        match name {
            "rr" | "round-robin" => Some(SchedulerPolicy::RoundRobin),
            "priority" => Some(SchedulerPolicy::Priority),
            "lottery" => Some(SchedulerPolicy::Lottery),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct KernelConfig {
    pub machine: MachineConfig,
    pub policy: SchedulerPolicy,
    /// Shell program and its arguments, from `-x prog args…`.
    pub program: String,
    pub args: Vec<String>,
    /// File system to mount; in-memory when unset.
    pub file_system: Option<Arc<dyn FileSystem>>,
}

impl Default for KernelConfig {
    fn default() -> KernelConfig {
        KernelConfig {
            machine: MachineConfig::default(),
            policy: SchedulerPolicy::default(),
            program: String::new(),
            args: Vec::new(),
            file_system: None,
        }
    }
}
