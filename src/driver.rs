//! The experiment driver: nested address-loop sweep, fill/hammer/check
//! cycle, and aggressor-row selection (hammer.c: `run_hammer`,
//! `run_hammer_once`, `select_and_hammer_aggr`).

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use smallvec::SmallVec;

use crate::discovery::{self, Row};
use crate::fill::{self, check, fill};
use crate::pagemap::PageMap;
use crate::params::{AddrLoop, Params, Pattern};
use crate::pool::HammerPool;
use crate::timing::{ns, HammerAddr};

/// Aggregate results of a run, owned by the driver rather than kept as
/// process-wide statics.
#[derive(Default, Debug, Clone, Copy)]
pub struct Counters {
    pub total_tries: u64,
    pub total_flips: u64,
    pub flips_from_repeats: u64,
}

pub struct Driver<'a> {
    params: &'a Params,
    base: *mut u8,
    pool: Option<&'a HammerPool>,
    pagemap: Option<&'a PageMap>,
    rng: StdRng,
    counters: Counters,
}

impl<'a> Driver<'a> {
    pub fn new(params: &'a Params, base: *mut u8, pool: Option<&'a HammerPool>, pagemap: Option<&'a PageMap>) -> Self {
        let seed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Driver {
            params,
            base,
            pool,
            pagemap,
            rng: StdRng::seed_from_u64(seed),
            counters: Counters::default(),
        }
    }

    pub fn counters(&self) -> Counters {
        self.counters
    }

    /// Entry point: recurses through the configured nested address loops,
    /// running one experiment at each leaf (hammer.c:run_hammer).
    pub fn run_hammer(&mut self, mem: *mut u8, max_addr: *mut u8, depth: usize) {
        let loop_spec = self.params.addr_loops.get(depth).copied().unwrap_or(AddrLoop { count: 0, step: 0 });

        if loop_spec.step == 0 {
            log::info!("Running at {:#x}", mem as u64 - self.base as u64);
            let len = self.params.size - (mem as u64 - self.base as u64);
            self.run_hammer_once(mem, len);
            return;
        }

        let mut cur = mem;
        let mut count = 0u64;
        while (cur as usize) < (max_addr as usize) && (loop_spec.count == 0 || count < loop_spec.count) {
            self.run_hammer(cur, max_addr, depth + 1);
            count += 1;
            cur = unsafe { cur.add(loop_spec.step as usize) };
        }
    }

    fn run_hammer_once(&mut self, mem: *mut u8, len: u64) {
        let p = self.params;
        let rows: Vec<Row> = match p.alt_row_find {
            false => match discovery::find_rows_in_same_bank(p, self.pagemap, mem, p.find_step, len, p.n_rows) {
                Ok(r) => r,
                Err(e) => {
                    log::warn!("row discovery failed: {e}");
                    return;
                }
            },
            true => match discovery::find_rows_alt(p, mem, len, p.n_rows) {
                Ok(r) => r,
                Err(e) => {
                    log::warn!("row discovery failed: {e}");
                    return;
                }
            },
        };

        if rows.len() != p.n_rows {
            log::warn!("Can't find enough rows!");
            return;
        }

        let (rowstart, rowend) = fill::get_row_range(&rows);

        if p.check_rest {
            let _ = fill(self.base, mem, rowstart as usize - mem as usize, p.cached);
            let tail_len = len as usize - (rowend as usize - mem as usize);
            let _ = fill(self.base, rowend, tail_len, p.cached);
        }

        let stride = if p.mod_stride { p.modulus } else { 1 };

        for shift in 0..stride {
            if fill::fill_rows(p, self.base, &rows, shift).is_err() {
                log::warn!("fill_rows failed for shift {shift}");
                continue;
            }

            let mut try_idx = shift;
            while try_idx < p.n_tries {
                self.counters.total_tries += 1;

                let mut rep = 0u32;
                let mut first_try = true;
                let seed = if p.repeat_flips > 0 {
                    Some(std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0))
                } else {
                    None
                };

                loop {
                    if !first_try && p.repeat_flips > 0 {
                        log::info!("Repeating: {rep}");
                    }

                    let time_taken = self.select_and_hammer_aggr(try_idx, &rows, seed);

                    let flips = match fill::check_rows(p, self.base, &rows, shift, self.pagemap) {
                        Ok(f) => f,
                        Err(e) => {
                            log::warn!("check_rows failed: {e}");
                            Vec::new()
                        }
                    };
                    for flip in &flips {
                        log::info!("{flip}");
                    }

                    if first_try {
                        self.counters.total_flips += flips.len() as u64;
                    } else {
                        self.counters.flips_from_repeats += flips.len() as u64;
                    }

                    log::info!("(time: {time_taken})");
                    log::info!(
                        "{} tries, {} flips, {} flips from repeats",
                        self.counters.total_tries,
                        self.counters.total_flips,
                        self.counters.flips_from_repeats
                    );

                    rep += 1;
                    if !flips.is_empty() || p.always_refill {
                        let _ = fill::fill_rows(p, self.base, &rows, shift);
                    }
                    if first_try && flips.is_empty() {
                        break;
                    }
                    first_try = false;
                    if !(p.repeat_flips > 0 && rep < p.repeat_flips) {
                        break;
                    }
                }

                try_idx += stride;
            }
        }

        if p.check_rest {
            if let Ok(flips) = check(self.base, mem, rowstart as usize - mem as usize, p.cached, self.pagemap) {
                self.counters.total_flips += flips.len() as u64;
            }
            let tail_len = len as usize - (rowend as usize - mem as usize);
            if let Ok(flips) = check(self.base, rowend, tail_len, p.cached, self.pagemap) {
                self.counters.total_flips += flips.len() as u64;
            }
        }
    }

    /// Picks `n_aggr` aggressor rows per the configured pattern and
    /// hammers them in parallel. `try_idx` salts pattern selection; `seed`
    /// reseeds the RNG when `repeat_flips` wants determinism across the
    /// repeat loop.
    fn select_and_hammer_aggr(&mut self, try_idx: u64, rows: &[Row], seed: Option<u64>) -> u64 {
        let p = self.params;
        if let Some(seed) = seed {
            self.rng = StdRng::seed_from_u64(seed);
        }

        let span = (p.max_aggr - p.min_aggr + 1) as u64;
        let n_aggr = p.min_aggr + (try_idx % span) as usize;

        // Aggressor sets are small (bounded by max_aggr); avoid a heap
        // allocation per try in the common case.
        let mut aggr: SmallVec<[HammerAddr; 8]> = SmallVec::with_capacity(n_aggr);
        for i in 0..n_aggr {
            let row = match p.pattern {
                Pattern::Random => self.rng.random_range(0..p.n_rows),
                Pattern::Even => (try_idx as usize + i * 2) % p.n_rows,
                Pattern::TrrespassAssistedDouble => {
                    if i == n_aggr - 1 {
                        // Signed to mirror the C `int` arithmetic: n_aggr - 2
                        // goes negative when n_aggr < 2 (e.g. min_aggr == 1),
                        // which must not underflow/panic in usize.
                        let last = try_idx as i64
                            + (n_aggr as i64 - 2) * 2
                            + p.assisted_double_dist as i64;
                        last.rem_euclid(p.n_rows as i64) as usize
                    } else {
                        (try_idx as usize + i * 2) % p.n_rows
                    }
                }
            };
            log::info!(
                "@Picking {row} {:#010x} (phys: {:#010x})",
                rows[row].start as u64 - self.base as u64,
                self.pagemap.and_then(|pm| pm.physical_address(rows[row].start).ok()).unwrap_or(0)
            );
            aggr.push(HammerAddr(rows[row].start as *const u8));
        }

        match self.pool {
            Some(pool) => pool.parallel_hammer(&aggr, p.hammer_loops / n_aggr as u64, 1, p.cached, p.delay_iters),
            None => {
                let start = ns();
                crate::timing::hammer(&aggr, p.cached, p.delay_iters, p.hammer_loops / n_aggr as u64, 1);
                ns() - start
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn even_pattern_wraps_around_row_count() {
        let n_rows = 4usize;
        let try_idx = 3usize;
        let i = 2usize;
        assert_eq!((try_idx + i * 2) % n_rows, 3);
    }

    #[test]
    fn assisted_double_last_aggressor_uses_extra_distance() {
        let n_aggr = 3i64;
        let try_idx = 0i64;
        let dist = 7i64;
        let n_rows = 100i64;
        let last = (try_idx + (n_aggr - 2) * 2 + dist).rem_euclid(n_rows);
        assert_eq!(last, 9);
    }

    #[test]
    fn assisted_double_last_aggressor_does_not_underflow_for_small_n_aggr() {
        // min_aggr == 1 makes n_aggr - 2 negative; this must not panic and
        // must still land in [0, n_rows).
        let n_aggr = 1i64;
        let try_idx = 0i64;
        let dist = 7i64;
        let n_rows = 16i64;
        let last = (try_idx + (n_aggr - 2) * 2 + dist).rem_euclid(n_rows);
        assert!((0..n_rows).contains(&last));
        assert_eq!(last, 5);
    }

    #[test]
    fn n_aggr_stays_within_configured_bounds() {
        let min_aggr = 2usize;
        let max_aggr = 5usize;
        let span = (max_aggr - min_aggr + 1) as u64;
        for try_idx in 0..20u64 {
            let n = min_aggr + (try_idx % span) as usize;
            assert!(n >= min_aggr && n <= max_aggr);
        }
    }
}
