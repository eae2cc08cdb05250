//! Physical-address oracle via `/proc/{pid}/pagemap` (lib.c:physical_address).
//!
//! Only valid for memory that cannot be swapped out: ION/CMA allocations,
//! or anonymous memory that has been `mlock`'d.

use std::fs::File;
use std::os::unix::fs::FileExt;

use thiserror::Error;

const PTE_PRESENT: u64 = 1 << 63;
const PTE_SWAP: u64 = 1 << 62;
const PTE_PFN_MASK: u64 = (1 << 55) - 1;

#[derive(Debug, Error)]
pub enum PagemapError {
    #[error("could not open {0}: {1}")]
    Open(String, std::io::Error),
    #[error("pagemap read failed at offset {0}: {1}")]
    Read(u64, std::io::Error),
    #[error("page not present at virtual address {0:#x}")]
    NotPresent(usize),
    #[error("page swapped out at virtual address {0:#x}")]
    SwappedOut(usize),
}

/// Opens and queries `/proc/self/pagemap` for the physical address behind
/// a virtual one. Kept open for the lifetime of the harness, as repeated
/// `open()`/`close()` per lookup would dominate discovery-phase overhead.
pub struct PageMap {
    file: File,
    page_size: u64,
}

impl PageMap {
    pub fn open() -> Result<Self, PagemapError> {
        let path = format!("/proc/{}/pagemap", std::process::id());
        let file = File::open(&path).map_err(|e| PagemapError::Open(path, e))?;
        Ok(PageMap {
            file,
            page_size: *crate::util::PAGE_SIZE as u64,
        })
    }

    /// Translates a virtual address into a physical one. Panics path from
    /// the original (`die()` on non-present/swapped pages) is instead a
    /// typed error here.
    pub fn physical_address(&self, virtual_address: *const u8) -> Result<u64, PagemapError> {
        let addr = virtual_address as u64;
        let page_number = addr / self.page_size;
        let page_offset = addr % self.page_size;
        let pagemap_offset = page_number * 8;

        let mut pte_bytes = [0u8; 8];
        self.file
            .read_exact_at(&mut pte_bytes, pagemap_offset)
            .map_err(|e| PagemapError::Read(pagemap_offset, e))?;
        let pte = u64::from_ne_bytes(pte_bytes);

        if pte & PTE_PRESENT == 0 {
            return Err(PagemapError::NotPresent(virtual_address as usize));
        }
        if pte & PTE_SWAP != 0 {
            return Err(PagemapError::SwappedOut(virtual_address as usize));
        }

        Ok((pte & PTE_PFN_MASK) * self.page_size + page_offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translates_own_stack_address() {
        let pm = PageMap::open().expect("pagemap should be readable under test");
        let x: u8 = 0;
        // Stack pages aren't guaranteed present/mapped uniformly across
        // environments, so we only assert the call doesn't panic and, if
        // it succeeds, that the result is page-aligned-plus-offset sane.
        if let Ok(phys) = pm.physical_address(&x as *const u8) {
            assert_eq!(phys % pm.page_size, (&x as *const u8 as u64) % pm.page_size);
        }
    }
}
