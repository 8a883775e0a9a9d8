use {
    anyhow::{bail, Context, Result},
    std::io::{self, BufRead, Write},
};

mod config;
mod engine;
mod journal;
mod worker;
use crate::config::{BackendKind, Command};

fn prompt_swaps() -> Result<u32> {
    print!("Enter the number of swaps you want each process to perform. ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("failed to read the number of swaps")?;
    let swaps: u32 = line
        .trim()
        .parse()
        .with_context(|| format!("'{}' is not a number of swaps", line.trim()))?;
    if swaps == 0 {
        bail!("the number of swaps must be positive");
    }
    Ok(swaps)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match config::parse(std::env::args().skip(1))? {
        Command::Help => {
            print!("{}", config::USAGE);
            return Ok(());
        }
        Command::Run(config) => config,
    };
    let swaps = match config.swaps {
        Some(swaps) => swaps,
        None => prompt_swaps()?,
    };
    log::info!(
        "{:?} variant, {} workers x {} swaps, {:?} backend",
        config.variant,
        config.workers,
        swaps,
        config.backend
    );

    let report = match config.backend {
        BackendKind::Process => {
            let ctx = ipc::sysv_context().context("failed to set up System V backend")?;
            engine::run(&ctx, &config, swaps)?
        }
        BackendKind::Thread => engine::run(&ipc::thread_context(), &config, swaps)?,
    };
    report.log();
    if let Some(entries) = &report.journal {
        if config.permits == 1 || config.variant == config::Variant::Ring {
            let overlap = journal::max_overlap(entries);
            if overlap > 1 {
                log::error!("{} critical sections overlapped", overlap);
                std::process::exit(1);
            }
        }
    }
    if !report.success() {
        std::process::exit(1);
    }
    Ok(())
}
