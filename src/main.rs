//! The simulator binary: parse the command line, boot the kernel,
//! run the shell program, report its status.

use std::sync::Arc;

use clap::Parser;
use log::{Level, LevelFilter, Metadata, Record};

use churro_os::config::{KernelConfig, SchedulerPolicy};
use churro_os::machine::filesys::HostFileSystem;
use churro_os::machine::MachineConfig;

#[derive(Parser)]
#[command(name = "churro", about = "ChurroOS machine simulator")]
struct Cli {
    /// Shell program and its arguments; the next `-` flag ends the list.
    #[arg(short = 'x', value_name = "PROG [ARGS]", num_args = 1..)]
    exec: Vec<String>,

    /// Physical pages of simulated memory.
    #[arg(short = 'p', default_value_t = 64, value_name = "PAGES")]
    pages: usize,

    /// Scheduling policy: rr, priority, or lottery.
    #[arg(short = 'S', default_value = "priority", value_name = "POLICY")]
    scheduler: String,

    /// Seed for the machine's random stream.
    #[arg(short = 's', default_value_t = 0, value_name = "SEED")]
    seed: u64,

    /// Log level: off, error, warn, info, debug, trace.
    #[arg(short = 'd', default_value = "warn", value_name = "LEVEL")]
    debug: String,
}

struct ConsoleLogger;

static LOGGER: ConsoleLogger = ConsoleLogger;

impl log::Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let tag = match record.level() {
                Level::Error => "ERROR",
                Level::Warn => "WARN",
                Level::Info => "INFO",
                Level::Debug => "DEBUG",
                Level::Trace => "TRACE",
            };
            eprintln!("[{}] {}", tag, record.args());
        }
    }

    fn flush(&self) {}
}

fn main() {
    let cli = Cli::parse();

    let level = cli
        .debug
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::Warn);
    log::set_logger(&LOGGER).expect("logger already installed");
    log::set_max_level(level);

    let Some(policy) = SchedulerPolicy::parse(&cli.scheduler) else {
        eprintln!("unknown scheduler '{}'", cli.scheduler);
        std::process::exit(2);
    };
    if cli.exec.is_empty() {
        eprintln!("no shell program; pass -x <prog> [args...]");
        std::process::exit(2);
    }

    let config = KernelConfig {
        machine: MachineConfig {
            num_phys_pages: cli.pages,
            seed: cli.seed,
            mirror_console: true,
        },
        policy,
        program: cli.exec[0].clone(),
        args: cli.exec[1..].to_vec(),
        file_system: Some(Arc::new(HostFileSystem::new("."))),
    };

    match churro_os::run(&config) {
        Ok(status) => {
            let code = match status {
                Some(status) if status.normal => status.code,
                Some(status) => {
                    eprintln!("root process killed, cause {}", status.code);
                    1
                }
                None => 1,
            };
            std::process::exit(code.clamp(0, 255));
        }
        Err(error) => {
            eprintln!("cannot run '{}': {}", config.program, error);
            std::process::exit(1);
        }
    }
}
