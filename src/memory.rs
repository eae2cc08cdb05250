//! Allocation of the hammering arena (mm.c:alloc).
//!
//! Two paths: a plain anonymous `mlock`'d mapping for the non-contiguous
//! cached case, and a contiguous-heap path (ION/CMA on Android kernels)
//! for everything else.

use anyhow::Result;
use thiserror::Error;

use crate::params::Params;
use crate::util;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("mmap/mlock failed: {0}")]
    Mmap(#[from] anyhow::Error),
    #[error(
        "contig=true requires a contiguous-memory heap, which isn't available on this build \
         (rebuild with --features contig-ion on a kernel exposing /dev/ion)"
    )]
    ContigUnavailable,
    #[error("no suitable ion heap of type {0} found")]
    NoSuitableHeap(u32),
    #[error("ion alloc failed: {0}")]
    IonAlloc(std::io::Error),
}

/// Abstraction over a contiguous-memory heap, matching the ION ioctl
/// contract used by the original tool: enumerate heaps by type, allocate
/// a buffer, hand back an mmap'able fd.
pub trait ContiguousHeap {
    fn alloc(&self, size: u64, contig: bool, cached: bool) -> Result<libc::c_int, MemoryError>;
}

#[cfg(all(target_os = "android", feature = "contig-ion"))]
pub mod ion {
    use super::*;
    use std::fs::OpenOptions;
    use std::os::unix::io::AsRawFd;

    const ION_MAX_HEAPS: usize = 16;
    const ION_HEAP_TYPE_SYSTEM: u32 = 0;
    const ION_HEAP_TYPE_DMA: u32 = 2;
    const ION_FLAG_CACHED: u32 = 1;
    const ION_IOC_HEAP_QUERY: u64 = 0x8080_6907;
    const ION_IOC_ALLOC: u64 = 0xc028_6900;

    #[repr(C)]
    struct IonHeapData {
        name: [u8; 64],
        kind: u32,
        heap_id: u32,
        reserved0: u32,
        reserved1: u32,
        reserved2: u32,
    }

    #[repr(C)]
    struct IonHeapQuery {
        cnt: u32,
        reserved0: u32,
        heaps: u64,
        reserved1: u64,
        reserved2: u64,
    }

    #[repr(C)]
    struct IonAllocationData {
        len: u64,
        heap_id_mask: u32,
        flags: u32,
        fd: i32,
        unused: i32,
    }

    /// Drives `/dev/ion`'s heap-query + alloc ioctls (mm.c:alloc's ION path).
    pub struct IonHeap;

    impl ContiguousHeap for IonHeap {
        fn alloc(&self, size: u64, contig: bool, cached: bool) -> Result<libc::c_int, MemoryError> {
            let dev = OpenOptions::new()
                .read(true)
                .open("/dev/ion")
                .map_err(MemoryError::IonAlloc)?;
            let fd = dev.as_raw_fd();

            let mut heaps: [IonHeapData; ION_MAX_HEAPS] = unsafe { std::mem::zeroed() };
            let mut query = IonHeapQuery {
                cnt: ION_MAX_HEAPS as u32,
                reserved0: 0,
                heaps: heaps.as_mut_ptr() as u64,
                reserved1: 0,
                reserved2: 0,
            };
            if unsafe { libc::ioctl(fd, ION_IOC_HEAP_QUERY as _, &mut query) } != 0 {
                return Err(MemoryError::IonAlloc(std::io::Error::last_os_error()));
            }

            let want_type = if contig {
                ION_HEAP_TYPE_DMA
            } else {
                ION_HEAP_TYPE_SYSTEM
            };
            let heap_id = heaps[..query.cnt as usize]
                .iter()
                .find(|h| h.kind == want_type)
                .map(|h| h.heap_id)
                .ok_or(MemoryError::NoSuitableHeap(want_type))?;

            let mut alloc = IonAllocationData {
                len: size,
                heap_id_mask: 1 << heap_id,
                flags: if cached { ION_FLAG_CACHED } else { 0 },
                fd: -1,
                unused: 0,
            };
            if unsafe { libc::ioctl(fd, ION_IOC_ALLOC as _, &mut alloc) } != 0 {
                return Err(MemoryError::IonAlloc(std::io::Error::last_os_error()));
            }
            if alloc.fd < 0 || alloc.len < size {
                return Err(MemoryError::IonAlloc(std::io::Error::last_os_error()));
            }

            Ok(alloc.fd)
        }
    }
}

/// Allocates `p.size` bytes per the config's `contig`/`cached` selection.
pub fn alloc(p: &Params) -> Result<*mut u8, MemoryError> {
    let page_size = *util::PAGE_SIZE;
    let aligned_size = util::align_up(p.size as usize, page_size);

    if !p.contig && p.cached {
        return util::mmap_anon_populated(aligned_size).map_err(MemoryError::Mmap);
    }

    #[cfg(all(target_os = "android", feature = "contig-ion"))]
    {
        let heap = ion::IonHeap;
        let fd = heap.alloc(p.size, p.contig, p.cached)?;
        return util::mmap_shared_fd(p.size as usize, fd).map_err(MemoryError::Mmap);
    }

    #[cfg(not(all(target_os = "android", feature = "contig-ion")))]
    {
        Err(MemoryError::ContigUnavailable)
    }
}
