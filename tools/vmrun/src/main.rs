//! vmrun - boots the vmk runtime on the host and runs a built-in program.

mod demos;
mod logger;

use anyhow::{bail, Context, Result};
use clap::Parser;
use mach::{Clock, HostMachine, MachineConfig};
use vmk::{VmConfig, DEFAULT_STACK_SIZE};

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a program on the vmk cooperative thread runtime")]
struct Opts {
    /// Tick length in milliseconds
    #[arg(long, default_value_t = 10, value_name = "MS")]
    tick: u32,

    /// Advance time only when every thread is blocked
    #[arg(long = "virtual")]
    virtual_clock: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// List the built-in programs and exit
    #[arg(long)]
    list: bool,

    /// Program to run followed by its arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "PROGRAM")]
    argv: Vec<String>,
}

impl Opts {
    fn machine_config(&self) -> MachineConfig {
        MachineConfig {
            clock: if self.virtual_clock {
                Clock::Virtual
            } else {
                Clock::Realtime
            },
            min_stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    logger::init(logger::level_for(opts.verbose)).context("installing logger")?;

    let registry = demos::registry();
    if opts.list {
        for name in registry.names() {
            println!("{name}");
        }
        return Ok(());
    }
    if opts.argv.is_empty() {
        bail!("no program given (try --list)");
    }

    let config = VmConfig::builder()
        .name("vmrun")
        .tick_ms(opts.tick)
        .build()
        .context("invalid runtime configuration")?;
    let machine = HostMachine::new(opts.machine_config());

    vmk::start(machine, config, &registry, &opts.argv)
        .with_context(|| format!("running {}", opts.argv[0]))?;
    Ok(())
}
