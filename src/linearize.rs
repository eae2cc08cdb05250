//! Remaps physically scattered pages into one virtually-and-physically
//! contiguous range (mm.c: `get_contig_ranges` / `linearize_ranges`).

use anyhow::{Context, Result};

use crate::pagemap::PageMap;
use crate::util;

struct Page {
    virt: *mut u8,
    phys: u64,
}

/// A maximal run of physically consecutive pages, in ascending virtual
/// order as originally mapped.
struct Range {
    virt_addrs: Vec<*mut u8>,
}

/// Builds the sorted-by-physical-address page list, then folds it into
/// maximal consecutive runs (the `consec_len` dynamic-programming pass in
/// `get_contig_ranges`), returning runs sorted largest-first.
fn get_contig_ranges(pagemap: &PageMap, virtual_address: *mut u8, len: u64) -> Result<Vec<Range>> {
    let page_size = *util::PAGE_SIZE as u64;
    anyhow::ensure!(len % page_size == 0, "len is not page aligned");
    let page_count = (len / page_size) as usize;

    let mut pages = Vec::with_capacity(page_count);
    for page_idx in 0..page_count {
        let offset = page_idx as u64 * page_size;
        let virt = unsafe { virtual_address.add(offset as usize) };
        let phys = pagemap
            .physical_address(virt)
            .with_context(|| format!("translating page {page_idx}"))?;
        pages.push(Page { virt, phys });
    }

    pages.sort_by_key(|p| p.phys);

    // consec_len[j]: length of the run ending at j; runs that turn out to
    // be a prefix of a longer run are zeroed out, same as the original.
    let mut consec_len = vec![0u32; page_count];
    if page_count > 0 {
        consec_len[0] = 1;
    }
    for i in 1..page_count {
        if pages[i].phys == pages[i - 1].phys + page_size {
            consec_len[i] = consec_len[i - 1] + 1;
            consec_len[i - 1] = 0;
        } else {
            consec_len[i] = 1;
        }
    }

    let mut ranges: Vec<Range> = Vec::new();
    let mut i = page_count;
    while i > 0 {
        i -= 1;
        let len = consec_len[i];
        if len > 0 {
            let start = i + 1 - len as usize;
            let virt_addrs = pages[start..=i].iter().map(|p| p.virt).collect();
            ranges.push(Range { virt_addrs });
        }
    }

    ranges.sort_by_key(|r| std::cmp::Reverse(r.virt_addrs.len()));
    Ok(ranges)
}

/// Allocates a fresh region and `mremap`s every page of every range into
/// it in range order, so physically contiguous runs land virtually
/// contiguous too.
fn linearize_ranges(ranges: &[Range], len: u64) -> Result<*mut u8> {
    let page_size = *util::PAGE_SIZE as u64;
    anyhow::ensure!(len % page_size == 0, "len not divisible by page size");

    let new_range = util::mmap_anon(len as usize)?;
    log::info!("Number of linear ranges: {}", ranges.len());
    if let Some(first) = ranges.first() {
        log::info!(
            "Largest linear range: {}",
            first.virt_addrs.len() as u64 * page_size
        );
    }

    let mut offset: u64 = 0;
    for range in ranges {
        for &virt in &range.virt_addrs {
            let dst = unsafe { new_range.add(offset as usize) };
            util::mremap_fixed(virt, page_size as usize, dst)
                .with_context(|| format!("remapping page at offset {offset}"))?;
            offset += page_size;
        }
    }

    Ok(new_range)
}

/// Linearizes `mem` if the pagemap oracle is enabled and more than one
/// physical run exists; otherwise returns `mem` untouched (mm.c:linearize_alloc).
pub fn linearize_alloc(pagemap_enabled: bool, pagemap: Option<&PageMap>, mem: *mut u8, len: u64) -> Result<*mut u8> {
    if !pagemap_enabled {
        return Ok(mem);
    }
    let pagemap = pagemap.context("pagemap enabled but oracle unavailable")?;

    let ranges = get_contig_ranges(pagemap, mem, len)?;
    if ranges.len() <= 1 {
        return Ok(mem);
    }
    linearize_ranges(&ranges, len)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Exercises the consecutive-run DP directly against a synthetic
    /// physical-address layout, without touching real pagemap state.
    fn group_consecutive(phys: &[u64], page_size: u64) -> Vec<usize> {
        let mut idx: Vec<usize> = (0..phys.len()).collect();
        idx.sort_by_key(|&i| phys[i]);

        let mut consec_len = vec![0u32; phys.len()];
        if !phys.is_empty() {
            consec_len[0] = 1;
        }
        for i in 1..idx.len() {
            if phys[idx[i]] == phys[idx[i - 1]] + page_size {
                consec_len[i] = consec_len[i - 1] + 1;
                consec_len[i - 1] = 0;
            } else {
                consec_len[i] = 1;
            }
        }
        consec_len.into_iter().map(|l| l as usize).collect()
    }

    #[test]
    fn groups_scattered_pages_into_runs() {
        let page = 4096u64;
        // Two runs of lengths 3 and 2, interleaved out of virtual order.
        let phys = vec![0, page, 2 * page, 10 * page, 11 * page];
        let lens = group_consecutive(&phys, page);
        let run_count = lens.iter().filter(|&&l| l > 0).count();
        assert_eq!(run_count, 2);
        assert_eq!(lens.iter().sum::<usize>(), 3 + 2);
    }

    #[test]
    fn single_run_collapses_to_one_group() {
        let page = 4096u64;
        let phys = vec![0, page, 2 * page, 3 * page];
        let lens = group_consecutive(&phys, page);
        assert_eq!(lens.iter().filter(|&&l| l > 0).count(), 1);
        assert_eq!(*lens.iter().find(|&&l| l > 0).unwrap(), 4);
    }
}
