use std::io::Write;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use cow_probe::platform::simulated::{SIMULATED_MODULE_NAME, SimulatedPlatform};
use cow_probe::utils::Target;
use cow_probe::{CowProbe, MemoryPlatform, ProbeError, Step, inspect, regions};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Run against a simulated process holding one shared module.
    #[arg(long, global = true)]
    simulate: bool,

    /// Log every platform call to stderr.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Widen, write and re-inspect TARGET, printing the three protection
    /// codes one per line.
    Probe {
        /// Hex address or module!symbol. Defaults to a function in this binary.
        target: Option<Target>,
    },
    /// Describe the region containing TARGET.
    Query { target: Target },
    /// List every region of the process.
    Regions,
    /// List the modules loaded in the process.
    Modules,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let level = if args.verbose { "debug" } else { "warn" };
    let env = env_logger::Env::default().default_filter_or(level);
    env_logger::Builder::from_env(env).init();

    if args.simulate {
        let default = Target::Symbol {
            module: SIMULATED_MODULE_NAME.to_string(),
            symbol: "probe_target".to_string(),
        };
        return run(SimulatedPlatform::shared_module(), args.command, default);
    }
    run_host(args.command)
}

#[cfg(any(windows, target_os = "linux"))]
fn run_host(command: Command) -> anyhow::Result<()> {
    let default = Target::Address(cow_probe::probe::probe_target_address());
    run(cow_probe::platform::host(), command, default)
}

#[cfg(not(any(windows, target_os = "linux")))]
fn run_host(_command: Command) -> anyhow::Result<()> {
    bail!("this platform has no memory query backend; try --simulate")
}

fn run<P: MemoryPlatform>(platform: P, command: Command, default: Target) -> anyhow::Result<()> {
    match command {
        Command::Probe { target } => probe(CowProbe::new(platform), target.unwrap_or(default)),
        Command::Query { target } => {
            let address = target.resolve(&platform)?;
            let descriptor = inspect(&platform, address)?;
            println!("{}", descriptor);
            Ok(())
        }
        Command::Regions => {
            let regions = regions(&platform);
            if regions.is_empty() {
                bail!("no regions could be queried");
            }
            for region in regions {
                println!("{}", region);
            }
            Ok(())
        }
        Command::Modules => {
            for module in platform.modules()? {
                println!(
                    "{:#014x} {:>#10x} {}",
                    module.base_address, module.size, module.name
                );
            }
            Ok(())
        }
    }
}

fn probe<P: MemoryPlatform>(probe: CowProbe<P>, target: Target) -> anyhow::Result<()> {
    let address = target
        .resolve(probe.platform())
        .with_context(|| format!("resolving {:?}", target))?;
    report(&probe, address, &mut std::io::stdout())
}

/// Runs the demonstration and writes each protection code to `out` as soon
/// as it is observed, so earlier lines survive a later failure.
fn report<P: MemoryPlatform, W: Write>(
    probe: &CowProbe<P>,
    address: usize,
    out: &mut W,
) -> anyhow::Result<()> {
    let mut observed = 0usize;
    let mut write_error: Option<std::io::Error> = None;
    // SAFETY: the default target is never called while it is probed; for
    // user-supplied targets the user vouches for the same.
    let result = unsafe {
        probe.demonstrate_with(address, |_, descriptor| {
            observed += 1;
            if write_error.is_some() {
                return;
            }
            let line = writeln!(out, "{:#x}", descriptor.protection_code);
            if let Err(e) = line.and_then(|_| out.flush()) {
                write_error = Some(e);
            }
        })
    };

    if let Err(e) = result {
        let failed = match e {
            ProbeError::UnmappedAddress { .. } => Step::Initial,
            _ => Step::ALL[observed.min(Step::ALL.len() - 1)],
        };
        let code = e
            .os_code()
            .map_or_else(|| "none".to_string(), |code| code.to_string());
        let message = format!("{failed} of {address:#x} failed (platform code {code})");
        return Err(e).context(message);
    }
    match write_error {
        Some(e) => Err(e).context("writing protection codes"),
        None => Ok(()),
    }
}
