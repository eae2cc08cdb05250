//! Small libc wrappers shared by the memory provider, linearizer and pool.

use anyhow::{Context, Result};
use once_cell::sync::Lazy;

pub static PAGE_SIZE: Lazy<usize> = Lazy::new(|| {
    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    assert!(ret > 0, "sysconf(_SC_PAGESIZE) failed");
    ret as usize
});

pub fn align_up(x: usize, align: usize) -> usize {
    (x + align - 1) & !(align - 1)
}

pub fn align_down(x: usize, align: usize) -> usize {
    x & !(align - 1)
}

fn last_os_error(what: &'static str) -> anyhow::Error {
    anyhow::Error::new(std::io::Error::last_os_error()).context(what)
}

/// Anonymous, populated, page-locked mapping. Used by the non-contiguous
/// cached allocation path (mm.c:alloc's `!contig && cached` branch).
pub fn mmap_anon_populated(size: usize) -> Result<*mut u8> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_POPULATE,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(last_os_error("mmap failed"));
    }
    if unsafe { libc::mlock(ptr, size) } != 0 {
        return Err(last_os_error("mlock failed"));
    }
    Ok(ptr as *mut u8)
}

/// Plain anonymous mapping, not populated or locked. Used as the
/// destination of the linearizer's remap (mm.c:linearize_ranges
/// deliberately avoids MAP_POPULATE to skip an extra allocation).
pub fn mmap_anon(size: usize) -> Result<*mut u8> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(last_os_error("mmap failed"));
    }
    Ok(ptr as *mut u8)
}

/// Maps `fd` shared, populated - the tail of the ION/CMA allocation path.
pub fn mmap_shared_fd(size: usize, fd: libc::c_int) -> Result<*mut u8> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_POPULATE,
            fd,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(last_os_error("mmap failed"));
    }
    Ok(ptr as *mut u8)
}

pub fn munmap(ptr: *mut u8, size: usize) -> Result<()> {
    if unsafe { libc::munmap(ptr as *mut libc::c_void, size) } != 0 {
        return Err(last_os_error("munmap failed"));
    }
    Ok(())
}

/// Atomically remaps one page from `old` into `new` (MREMAP_FIXED |
/// MREMAP_MAYMOVE), as used by the linearizer to slot pages into the
/// fresh region in physical order.
pub fn mremap_fixed(old: *mut u8, old_size: usize, new: *mut u8) -> Result<*mut u8> {
    let ret = unsafe {
        libc::mremap(
            old as *mut libc::c_void,
            old_size,
            old_size,
            libc::MREMAP_FIXED | libc::MREMAP_MAYMOVE,
            new as *mut libc::c_void,
        )
    };
    if ret == libc::MAP_FAILED {
        return Err(last_os_error("mremap failed"));
    }
    if ret != new as *mut libc::c_void {
        anyhow::bail!("mremap returned unexpected address");
    }
    Ok(ret as *mut u8)
}

/// Pins the calling thread to a single CPU.
pub fn set_affinity(cpu: usize) -> Result<()> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(last_os_error("sched_setaffinity failed"))
                .with_context(|| format!("pinning to cpu {cpu}"));
        }
    }
    Ok(())
}

/// Switches the calling thread to the SCHED_FIFO realtime scheduler at
/// the given priority. A priority of 0 is a no-op (sched_fifo=0 disables
/// this in the config).
pub fn set_fifo_priority(priority: i32) -> Result<()> {
    if priority == 0 {
        return Ok(());
    }
    unsafe {
        let param = libc::sched_param {
            sched_priority: priority,
        };
        if libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) != 0 {
            return Err(last_os_error("sched_setscheduler failed"));
        }
    }
    Ok(())
}
