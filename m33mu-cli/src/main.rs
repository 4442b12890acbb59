mod gdbstub;

use anyhow::{bail, Context, Result};
use clap::Parser;
use m33mu_core::config::{Diagnostics, SocConfig};
use m33mu_core::peripherals::{DebugConsole, Uart};
use m33mu_core::{Emulator, FlashImage};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Command-line frontend for the m33mu-core ARMv8-M emulator.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Flash image to load, optionally `@OFFSET` (hex with `0x` or decimal).
    #[arg(long = "image", value_name = "PATH[@OFFSET]")]
    images: Vec<String>,

    /// Turn the first unhandled HardFault into a non-zero process exit.
    #[arg(long)]
    quit_on_faults: bool,

    /// Cross-check the decoder against Capstone (requires the
    /// `capstone-crosscheck` feature).
    #[arg(long)]
    capstone: bool,

    /// Start the GDB remote-serial-protocol stub on this address and halt
    /// at reset, awaiting a client.
    #[arg(long, value_name = "ADDR")]
    gdb: Option<String>,

    /// Increase log verbosity; repeatable. `RUST_LOG` always overrides.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Maximum number of instructions to run before exiting (0 = unbounded).
    #[arg(long, default_value_t = 0)]
    max_steps: u64,
}

fn parse_image_arg(raw: &str) -> Result<(PathBuf, u32)> {
    match raw.split_once('@') {
        Some((path, off)) => {
            let offset = if let Some(hex) = off.strip_prefix("0x") {
                u32::from_str_radix(hex, 16)
            } else {
                off.parse::<u32>()
            }
            .with_context(|| format!("invalid offset in --image {raw}"))?;
            Ok((PathBuf::from(path), offset))
        }
        None => Ok((PathBuf::from(raw), 0)),
    }
}

/// `M33MU_PROT_TRACE` independently raises the log level of the access-gate
/// module (`m33mu_core::scs`), so protection tracing can be turned on
/// without cranking `--verbose` for the whole run.
fn init_logging(verbose: u8, prot_trace: u8) {
    let default_filter = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    if std::env::var_os("RUST_LOG").is_none() {
        let prot_level = match prot_trace {
            0 => None,
            1 => Some("info"),
            2 => Some("debug"),
            _ => Some("trace"),
        };
        if let Some(level) = prot_level {
            if let Ok(directive) = format!("m33mu_core::scs={level}").parse() {
                filter = filter.add_directive(directive);
            }
        }
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> Result<()> {
    let args = Args::parse();
    let diagnostics = Diagnostics::from_env();
    init_logging(args.verbose, diagnostics.prot_trace);

    if args.capstone && !cfg!(feature = "capstone-crosscheck") {
        bail!("--capstone requires building m33mu-core with the capstone-crosscheck feature");
    }

    let config = SocConfig {
        diagnostics,
        ..SocConfig::generic()
    };

    let mut images = Vec::new();
    for raw in &args.images {
        let (path, offset) = parse_image_arg(raw)?;
        images.push(FlashImage::from_file(&path, offset).map_err(|e| anyhow::anyhow!(e))?);
    }
    if images.is_empty() {
        bail!("at least one --image is required");
    }

    let mut emu = Emulator::new(config, &images).map_err(|e| anyhow::anyhow!(e))?;
    emu.register_mmio(0x4000_0000, 0x1000, Box::new(Uart::new(Box::new(std::io::stdout()))))
        .map_err(|e| anyhow::anyhow!(e))?;
    emu.register_mmio(
        0x4000_1000,
        0x10,
        Box::new(DebugConsole::new(Box::new(std::io::stdout()))),
    )
    .map_err(|e| anyhow::anyhow!(e))?;

    tracing::info!(pc = emu.cpu.pc, sp = emu.cpu.secure.msp, "reset complete");

    if let Some(addr) = &args.gdb {
        return gdbstub::serve(addr, emu);
    }

    let mut steps: u64 = 0;
    loop {
        if args.max_steps != 0 && steps >= args.max_steps {
            break;
        }
        emu.step();
        steps += 1;

        if args.quit_on_faults && emu.scs.faults(emu.cpu.security).hfsr != 0 {
            tracing::error!(pc = emu.cpu.pc, "unhandled HardFault, exiting");
            std::process::exit(1);
        }
    }

    Ok(())
}
