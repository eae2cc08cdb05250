//! Filling rows with known patterns and checking them back for flips
//! (lib.c: `fill`/`check`, hammer.c: `fill_rows_mod_k`/`check_rows_mod_k`).

use thiserror::Error;

use crate::constants::BYTES_IN_WORD;
use crate::discovery::Row;
use crate::pagemap::PageMap;
use crate::params::{FillType, Params};
use crate::timing::{flush, myrand32_r};

#[derive(Debug, Error)]
pub enum FillError {
    #[error("length {0} is not divisible by {BYTES_IN_WORD}")]
    Unaligned(usize),
    #[error("invalid shift {shift} for modulus {modulus}")]
    InvalidShift { shift: u64, modulus: u64 },
}

/// One detected bit flip, ready for diagnostic printing.
pub struct Flip {
    pub offset_from_base: u64,
    pub physical: Option<u64>,
    pub got: u32,
    pub expect: u32,
}

impl std::fmt::Display for Flip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "@FLIP {:#010x} (phys: {:#010x}) {:#010x}->{:#010x}",
            self.offset_from_base,
            self.physical.unwrap_or(0),
            self.expect,
            self.got
        )
    }
}

fn seed_for(mem: *const u8) -> u64 {
    let addr = mem as u64;
    addr ^ (addr >> 32)
}

/// Fills `len` bytes at `mem` with a PRNG stream seeded from `mem`'s own
/// address, so `check` can regenerate the same stream independently. When
/// `cached` is set, each written word is flushed from cache so the write
/// reaches DRAM before hammering starts (lib.c:324-328).
pub fn fill(base: *const u8, mem: *mut u8, len: usize, cached: bool) -> Result<(), FillError> {
    if len % BYTES_IN_WORD != 0 {
        return Err(FillError::Unaligned(len));
    }
    log::info!("Filling {len} bytes at {:#010x}.", mem as u64 - base as u64);

    let mut state = seed_for(mem);
    let words = len / BYTES_IN_WORD;
    let mem32 = mem as *mut u32;
    for i in 0..words {
        let value = myrand32_r(&mut state);
        let word_addr = unsafe { mem32.add(i) };
        unsafe { std::ptr::write_volatile(word_addr, value) };
        if cached {
            flush(word_addr as *const u8);
        }
    }
    Ok(())
}

/// Regenerates the same PRNG stream `fill` wrote and reports every word
/// that no longer matches. When `cached` is set, each word is flushed
/// before it's read so the read is forced back to DRAM (lib.c:344-347).
pub fn check(
    base: *const u8,
    mem: *const u8,
    len: usize,
    cached: bool,
    pagemap: Option<&PageMap>,
) -> Result<Vec<Flip>, FillError> {
    if len % BYTES_IN_WORD != 0 {
        return Err(FillError::Unaligned(len));
    }
    log::info!("Checking {len} bytes at {:#010x}.", mem as u64 - base as u64);

    let mut state = seed_for(mem);
    let words = len / BYTES_IN_WORD;
    let mem32 = mem as *const u32;
    let mut flips = Vec::new();

    for i in 0..words {
        let expect = myrand32_r(&mut state);
        let word_addr = unsafe { mem32.add(i) };
        if cached {
            flush(word_addr as *const u8);
        }
        let got = unsafe { std::ptr::read_volatile(word_addr) };
        if got != expect {
            let word_addr = word_addr as *const u8;
            flips.push(Flip {
                offset_from_base: word_addr as u64 - base as u64,
                physical: pagemap.and_then(|pm| pm.physical_address(word_addr).ok()),
                got,
                expect,
            });
        }
    }
    Ok(flips)
}

/// Pattern for row `idx` under the mod-k discipline: victim if bit `mod`
/// of `victim_mask` is set, else its bitwise complement.
fn mod_k_pattern(p: &Params, idx: usize, shift: u64) -> u32 {
    let m = (idx as u64 + p.modulus - shift) % p.modulus;
    if p.victim_mask & (1u64 << m) != 0 {
        p.victim_data_pattern
    } else {
        !p.victim_data_pattern
    }
}

pub fn fill_rows_mod_k(p: &Params, rows: &[Row], shift: u64) -> Result<(), FillError> {
    if shift >= p.modulus {
        return Err(FillError::InvalidShift {
            shift,
            modulus: p.modulus,
        });
    }
    for row in rows {
        let pattern = mod_k_pattern(p, row.idx, shift);
        let words = row.len as usize / BYTES_IN_WORD;
        let mem32 = row.start as *mut u32;
        for j in 0..words {
            let word_addr = unsafe { mem32.add(j) };
            unsafe { std::ptr::write_volatile(word_addr, pattern) };
            if p.cached {
                flush(word_addr as *const u8);
            }
        }
    }
    Ok(())
}

pub fn check_rows_mod_k(p: &Params, base: *const u8, rows: &[Row], shift: u64, pagemap: Option<&PageMap>) -> Vec<Flip> {
    let mut flips = Vec::new();
    for row in rows {
        let pattern = mod_k_pattern(p, row.idx, shift);
        let words = row.len as usize / BYTES_IN_WORD;
        let mem32 = row.start as *const u32;
        for j in 0..words {
            let word_addr = unsafe { mem32.add(j) };
            if p.cached {
                flush(word_addr as *const u8);
            }
            let got = unsafe { std::ptr::read_volatile(word_addr) };
            if got != pattern {
                let word_addr = word_addr as *const u8;
                flips.push(Flip {
                    offset_from_base: word_addr as u64 - base as u64,
                    physical: pagemap.and_then(|pm| pm.physical_address(word_addr).ok()),
                    got,
                    expect: pattern,
                });
            }
        }
    }
    flips
}

/// Tightest `[start, end)` spanning every discovered row — the range
/// fill/check need to touch for the RANDOM fill discipline.
pub fn get_row_range(rows: &[Row]) -> (*mut u8, *mut u8) {
    let mut start = usize::MAX as *mut u8;
    let mut end = std::ptr::null_mut::<u8>();
    for row in rows {
        if (row.start as usize) < start as usize {
            start = row.start;
        }
        let row_end = unsafe { row.start.add(row.len as usize) };
        if row_end as usize > end as usize {
            end = row_end;
        }
    }
    (start, end)
}

pub fn fill_rows(p: &Params, base: *const u8, rows: &[Row], shift: u64) -> Result<(), FillError> {
    match p.fill_type {
        FillType::Random => {
            let (start, end) = get_row_range(rows);
            fill(base, start, end as usize - start as usize, p.cached)
        }
        FillType::Mod => fill_rows_mod_k(p, rows, shift),
    }
}

pub fn check_rows(
    p: &Params,
    base: *const u8,
    rows: &[Row],
    shift: u64,
    pagemap: Option<&PageMap>,
) -> Result<Vec<Flip>, FillError> {
    match p.fill_type {
        FillType::Random => {
            let (start, end) = get_row_range(rows);
            check(base, start, end as usize - start as usize, p.cached, pagemap)
        }
        FillType::Mod => Ok(check_rows_mod_k(p, base, rows, shift, pagemap)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_then_check_round_trips_with_no_flips() {
        let mut buf = vec![0u8; 64];
        let base = buf.as_ptr();
        fill(base, buf.as_mut_ptr(), buf.len(), false).unwrap();
        let flips = check(base, buf.as_ptr(), buf.len(), false, None).unwrap();
        assert!(flips.is_empty());
    }

    #[test]
    fn fill_then_check_round_trips_with_no_flips_when_cached() {
        let mut buf = vec![0u8; 64];
        let base = buf.as_ptr();
        fill(base, buf.as_mut_ptr(), buf.len(), true).unwrap();
        let flips = check(base, buf.as_ptr(), buf.len(), true, None).unwrap();
        assert!(flips.is_empty());
    }

    #[test]
    fn check_reports_corrupted_word() {
        let mut buf = vec![0u8; 16];
        let base = buf.as_ptr();
        fill(base, buf.as_mut_ptr(), buf.len(), false).unwrap();
        buf[4] ^= 0xff;
        let flips = check(base, buf.as_ptr(), buf.len(), false, None).unwrap();
        assert_eq!(flips.len(), 1);
        assert_eq!(flips[0].offset_from_base, 4);
    }

    #[test]
    fn rejects_unaligned_length() {
        let buf = vec![0u8; 6];
        assert!(matches!(
            check(buf.as_ptr(), buf.as_ptr(), 6, false, None),
            Err(FillError::Unaligned(6))
        ));
    }

    #[test]
    fn mod_k_pattern_selects_victim_vs_complement() {
        let mut p = Params::default();
        p.modulus = 4;
        p.victim_mask = 0b0010;
        p.victim_data_pattern = 0xffff_ffff;

        // idx=1, shift=0 -> mod = 1 -> bit set -> victim pattern.
        assert_eq!(mod_k_pattern(&p, 1, 0), 0xffff_ffff);
        // idx=0, shift=0 -> mod = 0 -> bit clear -> complement.
        assert_eq!(mod_k_pattern(&p, 0, 0), !0xffff_ffffu32);
    }
}
