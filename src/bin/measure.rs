//! Standalone timing probe: allocates memory the same way the main
//! harness does and prints raw row-conflict timing samples for a
//! candidate address pair, without running a fill/hammer/check experiment.
//! Useful for picking `conflict_th_us` before writing a full config.

use anyhow::{Context, Result};
use clap::Parser;

use hammer_kit::cli::Args;
use hammer_kit::timing::{hammer, HammerAddr};
use hammer_kit::{memory, params, util};

fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();
    let p = params::read_config(&args.config).context("loading config")?;
    params::print_config(&p);

    util::set_affinity(p.cpus[0]).context("pinning thread")?;

    let mem = memory::alloc(&p).context("allocating hammer arena")?;
    log::info!("Allocated {} bytes @{mem:p}", p.size);

    let base = HammerAddr(mem as *const u8);
    let target = HammerAddr(unsafe { mem.add(p.offset0 as usize) } as *const u8);

    log::info!("offset (from base)\ttime (us)");
    let mut off = p.offset0;
    while off < p.size {
        let candidate = HammerAddr(unsafe { mem.add(off as usize) } as *const u8);
        let t = hammer(&[base, candidate], p.cached, p.delay_iters, p.measure_loops / 5, 5);
        log::info!("{off:#010x}\t{}", t / 1000);
        off += p.find_step.max(*util::PAGE_SIZE as u64);
    }

    // A single extra sample against the first offset, useful when eyeballing
    // whether `conflict_th_us` in the config is set sensibly.
    let t = hammer(&[base, target], p.cached, p.delay_iters, p.measure_loops / 5, 5);
    log::info!("reference sample at offset0: {} us", t / 1000);

    Ok(())
}
