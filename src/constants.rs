pub const LOG_BYTES_IN_GBYTE: u8 = 30;
pub const BYTES_IN_GBYTE: u64 = 1 << LOG_BYTES_IN_GBYTE;

pub const LOG_BYTES_IN_MBYTE: u8 = 20;
pub const BYTES_IN_MBYTE: u64 = 1 << LOG_BYTES_IN_MBYTE;

pub const LOG_BYTES_IN_KBYTE: u8 = 10;
pub const BYTES_IN_KBYTE: u64 = 1 << LOG_BYTES_IN_KBYTE;

/// Fill/check operate in 32-bit words; `len` must be a multiple of this.
pub const BYTES_IN_WORD: usize = 4;

/// Practical upper bound on the number of worker CPUs, mirroring the
/// original `MAX_CPUS` in params.h (kept as a validation bound, not a
/// fixed-size array, since `Params::cpus` is a `Vec`).
pub const MAX_CPUS: usize = 64;

/// Upper bound on the number of `step=` entries accepted by the config
/// loader (params.h: `MAX_ADDR_LOOPS`).
pub const MAX_ADDR_LOOPS: usize = 8;

/// Upper bound on discovered banks for the alternative row finder
/// (hammer.c: `MAX_BANKS`).
pub const MAX_BANKS: usize = 16;
