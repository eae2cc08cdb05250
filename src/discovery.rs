//! Bank/row discovery: locating which offsets from a base address land in
//! the same DRAM bank, using row-buffer-conflict timing (hammer.c).

use thiserror::Error;

use crate::constants::MAX_BANKS;
use crate::pagemap::PageMap;
use crate::params::Params;
use crate::timing::{hammer, HammerAddr};

#[derive(Debug, Clone, Copy)]
pub struct Row {
    pub idx: usize,
    pub start: *mut u8,
    pub len: u32,
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("unknown row finding method")]
    UnknownMethod,
    #[error("sort_rows requires pagemap")]
    SortRequiresPagemap,
}

/// Row-bit remapping from "Defeating Software Mitigations against
/// Rowhammer: a Surgical Precision Hammer" §3.1 Remapping.
fn physaddr_to_row(addr: u64, sort_rows_shift: u32) -> u32 {
    let row = (addr >> sort_rows_shift) & 0xffff;
    let bit3 = (row & (1 << 3)) >> 3;
    let row = row ^ (bit3 << 2);
    let row = row ^ (bit3 << 1);
    row as u32
}

fn conflict(p: &Params, addr: [*const u8; 2]) -> bool {
    let addrs = [HammerAddr(addr[0]), HammerAddr(addr[1])];
    let t = hammer(&addrs, p.cached, p.delay_iters, p.measure_loops / 5, 5);
    t / 1000 > p.conflict_th_us
}

/// Finds rows in `[mem + offset0, mem + len)` that conflict with `mem`
/// itself (same bank), walking forward in `step`-sized strides with an
/// optional fuzz window per candidate (hammer.c:find_rows_in_same_bank).
pub fn find_rows_in_same_bank(
    p: &Params,
    pagemap: Option<&PageMap>,
    mem: *mut u8,
    step: u64,
    len: u64,
    rows_len: usize,
) -> Result<Vec<Row>, DiscoveryError> {
    let mut rows: Vec<Row> = Vec::with_capacity(rows_len);
    let mut off = p.offset0;

    'outer: while off < len {
        let mut target = unsafe { mem.add(off as usize) };
        let mut is_bank_conflict = false;
        let mut fuzz = 0u64;
        while fuzz <= p.max_fuzz {
            is_bank_conflict = conflict(p, [mem as *const u8, target as *const u8]);
            if is_bank_conflict {
                break;
            }
            fuzz += p.fuzz_step;
            target = unsafe { target.add(p.fuzz_step as usize) };
        }

        if !is_bank_conflict {
            off += step;
            continue;
        }

        if let Some(last) = rows.last_mut() {
            last.len = (target as u64 - last.start as u64) as u32;
        }
        rows.push(Row {
            idx: rows.len(),
            start: target,
            len: 0,
        });
        if rows.len() == rows_len {
            break 'outer;
        }
        off += step;
    }

    if rows.len() >= 2 {
        let n = rows.len();
        rows[n - 1].len = rows[n - 2].len;
    }

    if p.sort_rows {
        let pagemap = pagemap.ok_or(DiscoveryError::SortRequiresPagemap)?;
        rows.sort_by_key(|r| {
            let phys = pagemap.physical_address(r.start).unwrap_or(0);
            physaddr_to_row(phys, p.sort_rows_shift)
        });
        for (i, r) in rows.iter_mut().enumerate() {
            r.idx = i;
        }
    }

    Ok(rows)
}

/// Alternative discovery strategy: walks in `atomic_unit` steps, first
/// identifying `nr_banks` bank representatives, then gathering
/// `row_size`-many conflicting atomic units per row against a rotating
/// bank reference (hammer.c:find_rows_alt).
pub fn find_rows_alt(
    p: &Params,
    mem: *mut u8,
    len: u64,
    rows_len: usize,
) -> Result<Vec<Row>, DiscoveryError> {
    let mut bank = [std::ptr::null_mut::<u8>(); MAX_BANKS];
    bank[0] = mem;
    let mut found_banks = 1usize;
    let mut phase = 0u8;

    let mut off = p.bank_find_step;
    while off < len && found_banks < p.nr_banks as usize {
        let target = unsafe { mem.add(off as usize) };

        if phase == 0 {
            if conflict(p, [bank[found_banks - 1] as *const u8, target as *const u8]) {
                phase = 1;
            }
            off += p.atomic_unit;
            continue;
        }

        let mut i = 0;
        while i < found_banks {
            if conflict(p, [bank[i] as *const u8, target as *const u8]) {
                break;
            }
            i += 1;
        }

        if i == found_banks {
            bank[found_banks] = target;
            found_banks += 1;
            off += p.bank_find_step;
            phase = 0;
        }
        off += p.atomic_unit;
    }

    let mut rows: Vec<Row> = Vec::with_capacity(rows_len);
    let mut cur_bank_ref = bank[0];
    let mut nr_atomic_units = 0u64;
    let mut row_start = mem;
    let mut set_row = 0u64;
    let mut cur_bank = 0usize;

    let mut off = p.offset0;
    while off < len {
        let target = unsafe { mem.add(off as usize) };
        if !conflict(p, [cur_bank_ref as *const u8, target as *const u8]) {
            off += p.atomic_unit;
            continue;
        }

        if nr_atomic_units == 0 {
            row_start = target;
        }
        nr_atomic_units += 1;

        if nr_atomic_units == p.row_size {
            nr_atomic_units = 0;
            if let Some(last) = rows.last_mut() {
                last.len = (row_start as u64 - last.start as u64) as u32;
            }
            rows.push(Row {
                idx: rows.len(),
                start: row_start,
                len: 0,
            });
            set_row += 1;
            if set_row == p.rows_per_set {
                cur_bank += 1;
                set_row = 0;
            }
            if cur_bank == p.nr_banks as usize {
                cur_bank = 0;
            }
            cur_bank_ref = bank[cur_bank];
            if rows.len() == rows_len {
                break;
            }
        }
        off += p.atomic_unit;
    }

    if rows.len() >= 2 {
        let n = rows.len();
        rows[n - 1].len = rows[n - 2].len;
    }

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn physaddr_to_row_folds_bit3() {
        // bit3 set -> bits 1,2 flip.
        let addr_with_bit3 = 0b1000u64 << 15;
        let row = physaddr_to_row(addr_with_bit3, 15);
        assert_eq!(row, 0b1000 ^ 0b0100 ^ 0b0010);
    }

    #[test]
    fn physaddr_to_row_noop_without_bit3() {
        let addr = 0b0001u64 << 15;
        assert_eq!(physaddr_to_row(addr, 15), 0b0001);
    }
}
