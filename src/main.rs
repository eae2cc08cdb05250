use anyhow::{Context, Result};
use clap::Parser;

use hammer_kit::cli::Args;
use hammer_kit::driver::Driver;
use hammer_kit::pagemap::PageMap;
use hammer_kit::pool::HammerPool;
use hammer_kit::{memory, params, util};

fn run() -> Result<u64> {
    env_logger::init();

    let args = Args::parse();
    let p = params::read_config(&args.config).context("loading config")?;
    params::print_config(&p);

    let available = num_cpus::get();
    if let Some(&bad) = p.cpus.iter().find(|&&c| c >= available) {
        log::warn!("cpu={bad} requested but only {available} logical CPUs are online");
    }

    util::set_affinity(p.cpus[0]).context("pinning main thread")?;
    util::set_fifo_priority(p.sched_fifo).context("setting realtime priority")?;

    let mem = memory::alloc(&p).context("allocating hammer arena")?;

    let pagemap = if p.pagemap {
        Some(PageMap::open().context("opening pagemap oracle")?)
    } else {
        None
    };

    let mem = hammer_kit::linearize::linearize_alloc(p.pagemap, pagemap.as_ref(), mem, p.size)
        .context("linearizing allocation")?;
    log::info!("Allocated {} bytes @{mem:p}", p.size);

    let pool = if p.cpus.len() >= 2 {
        Some(HammerPool::new(&p.cpus).context("starting hammer pool")?)
    } else {
        None
    };

    let mut driver = Driver::new(&p, mem, pool.as_ref(), pagemap.as_ref());
    let src = unsafe { mem.add(p.src_offset as usize) };
    let max_addr = unsafe { mem.add(p.size as usize) };
    driver.run_hammer(src, max_addr, 0);

    Ok(driver.counters().total_flips)
}

fn main() {
    match run() {
        Ok(total_flips) => std::process::exit(if total_flips > 0 { 1 } else { 0 }),
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(2);
        }
    }
}
