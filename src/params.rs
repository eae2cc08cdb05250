//! Experiment configuration: the `Params` struct and its line-oriented
//! `key=value` config-file loader (spec.md §6).

use std::fs;
use std::path::Path;
use std::str::FromStr;

use thiserror::Error;

use crate::constants::{
    BYTES_IN_GBYTE, BYTES_IN_KBYTE, BYTES_IN_MBYTE, MAX_ADDR_LOOPS, MAX_CPUS,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("can't open config file {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("bad line {line_no}: '{line}'")]
    BadLine { line_no: usize, line: String },
    #[error("bad value ('{0}')")]
    BadValue(String),
    #[error("bad name ('{0}')")]
    BadName(String),
    #[error("bad pattern value ('{0}')")]
    BadPattern(String),
    #[error("bad fill type value ('{0}')")]
    BadFillType(String),
    #[error("too many step= entries (max {MAX_ADDR_LOOPS})")]
    TooManySteps,
    #[error("invalid step: '{0}'")]
    InvalidStep(String),
    #[error("too many cpu= entries (max {MAX_CPUS})")]
    TooManyCpus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
    /// Draw each aggressor row index uniformly at random.
    Random,
    /// Deterministic even-row progression.
    Even,
    /// EVEN, with the final aggressor at an extra configurable distance.
    TrrespassAssistedDouble,
}

impl FromStr for Pattern {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "random" => Ok(Pattern::Random),
            "even" => Ok(Pattern::Even),
            "trrespass_assisted_double" => Ok(Pattern::TrrespassAssistedDouble),
            other => Err(ConfigError::BadPattern(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillType {
    /// Pseudo-random data (seeded from the row's address).
    Random,
    /// Generic modulus fill rule, configured via `mod`/`victim_mask`.
    Mod,
}

impl FromStr for FillType {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "random" => Ok(FillType::Random),
            "mod" => Ok(FillType::Mod),
            other => Err(ConfigError::BadFillType(other.to_string())),
        }
    }
}

/// One level of the nested address-loop sweep (spec.md §4.7).
/// `count == 0` means "until end of region".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AddrLoop {
    pub count: u64,
    pub step: u64,
}

#[derive(Debug, Clone)]
pub struct Params {
    pub cpus: Vec<usize>,

    pub alt_row_find: bool,
    pub atomic_unit: u64,
    pub row_size: u64,
    pub rows_per_set: u64,
    pub bank_find_step: u64,
    pub nr_banks: u64,

    pub delay_iters: u64,

    pub size: u64,
    pub cached: bool,
    pub contig: bool,
    pub pagemap: bool,

    pub sort_rows: bool,
    pub sort_rows_shift: u32,

    pub sched_fifo: i32,

    pub fill_type: FillType,

    pub check_rest: bool,

    pub modulus: u64,
    pub mod_stride: bool,
    pub victim_mask: u64,
    pub victim_data_pattern: u32,

    pub always_refill: bool,

    pub max_fuzz: u64,
    pub fuzz_step: u64,

    pub measure_loops: u64,
    pub offset0: u64,
    pub src_offset: u64,

    pub conflict_th_us: u64,
    pub find_step: u64,
    pub n_rows: usize,
    pub min_aggr: usize,
    pub max_aggr: usize,

    pub hammer_loops: u64,

    pub repeat_flips: u32,

    pub n_tries: u64,

    pub assisted_double_dist: u64,

    pub addr_loops: Vec<AddrLoop>,

    pub pattern: Pattern,
}

impl Default for Params {
    /// Mirrors `params.c:set_defaults`.
    fn default() -> Self {
        Params {
            cpus: Vec::new(),
            alt_row_find: false,
            atomic_unit: 0,
            row_size: 0,
            rows_per_set: 1,
            bank_find_step: 512 * BYTES_IN_KBYTE,
            nr_banks: 1,
            delay_iters: 1000,
            size: 128 * BYTES_IN_MBYTE,
            cached: false,
            contig: true,
            pagemap: false,
            sort_rows: false,
            sort_rows_shift: 15,
            sched_fifo: 0,
            fill_type: FillType::Random,
            check_rest: true,
            modulus: 1,
            mod_stride: true,
            victim_mask: 0,
            victim_data_pattern: 0xffff_ffff,
            always_refill: false,
            max_fuzz: 0,
            fuzz_step: 64,
            measure_loops: 250_000,
            offset0: 16 * BYTES_IN_MBYTE,
            src_offset: 0,
            conflict_th_us: 0,
            find_step: 0,
            n_rows: 0,
            min_aggr: 0,
            max_aggr: 0,
            hammer_loops: 0,
            repeat_flips: 0,
            n_tries: 0,
            assisted_double_dist: 7,
            addr_loops: Vec::new(),
            pattern: Pattern::Random,
        }
    }
}

/// Parses an integer with an optional K/M/G (base-1024) suffix.
fn parse_sized(value: &str) -> Result<u64, ConfigError> {
    let (digits, mult) = match value.as_bytes().last() {
        Some(b'K') => (&value[..value.len() - 1], BYTES_IN_KBYTE),
        Some(b'M') => (&value[..value.len() - 1], BYTES_IN_MBYTE),
        Some(b'G') => (&value[..value.len() - 1], BYTES_IN_GBYTE),
        _ => (value, 1),
    };
    let base: u64 = digits
        .parse()
        .map_err(|_| ConfigError::BadValue(value.to_string()))?;
    Ok(base * mult)
}

fn parse_hex(value: &str) -> Result<u64, ConfigError> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    u64::from_str_radix(digits, 16).map_err(|_| ConfigError::BadValue(value.to_string()))
}

fn parse_bool(value: &str) -> Result<bool, ConfigError> {
    match value {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => Err(ConfigError::BadValue(value.to_string())),
    }
}

fn parse_step(p: &mut Params, value: &str) -> Result<(), ConfigError> {
    let (count, step) = value
        .split_once(':')
        .ok_or_else(|| ConfigError::InvalidStep(value.to_string()))?;
    if p.addr_loops.len() >= MAX_ADDR_LOOPS {
        return Err(ConfigError::TooManySteps);
    }
    let count = parse_sized(count)?;
    let step = parse_sized(step)?;
    if step == 0 {
        return Err(ConfigError::InvalidStep(value.to_string()));
    }
    p.addr_loops.push(AddrLoop { count, step });
    Ok(())
}

fn set(p: &mut Params, name: &str, value: &str) -> Result<(), ConfigError> {
    match name {
        "cpu" => {
            if p.cpus.len() >= MAX_CPUS {
                return Err(ConfigError::TooManyCpus);
            }
            p.cpus.push(parse_sized(value)? as usize);
        }
        "alt_row_find" => p.alt_row_find = parse_bool(value)?,
        "atomic_unit" => p.atomic_unit = parse_sized(value)?,
        "rows_per_set" => p.rows_per_set = parse_sized(value)?,
        "nr_banks" => p.nr_banks = parse_sized(value)?,
        "row_size" => p.row_size = parse_sized(value)?,
        "bank_find_step" => p.bank_find_step = parse_sized(value)?,
        "delay_iters" => p.delay_iters = parse_sized(value)?,
        "pagemap" => p.pagemap = parse_bool(value)?,
        "sort_rows" => p.sort_rows = parse_bool(value)?,
        "sort_rows_shift" => p.sort_rows_shift = parse_sized(value)? as u32,
        "check_rest" => p.check_rest = parse_bool(value)?,
        "fill_type" => p.fill_type = value.parse()?,
        "mod" => p.modulus = parse_sized(value)?,
        "mod_stride" => p.mod_stride = parse_bool(value)?,
        "victim_mask" => p.victim_mask = parse_hex(value)?,
        "victim_data_pattern" => p.victim_data_pattern = parse_hex(value)? as u32,
        "size" => p.size = parse_sized(value)?,
        "contig" => p.contig = parse_bool(value)?,
        "cached" => p.cached = parse_bool(value)?,
        "measure_loops" => p.measure_loops = parse_sized(value)?,
        "offset0" => p.offset0 = parse_sized(value)?,
        "src_offset" => p.src_offset = parse_sized(value)?,
        "conflict_th_us" => p.conflict_th_us = parse_sized(value)?,
        "find_step" => p.find_step = parse_sized(value)?,
        "fuzz_step" => p.fuzz_step = parse_sized(value)?,
        "max_fuzz" => p.max_fuzz = parse_sized(value)?,
        "n_rows" => p.n_rows = parse_sized(value)? as usize,
        "min_aggr" => p.min_aggr = parse_sized(value)? as usize,
        "max_aggr" => p.max_aggr = parse_sized(value)? as usize,
        "hammer_loops" => p.hammer_loops = parse_sized(value)?,
        "repeat_flips" => p.repeat_flips = parse_sized(value)? as u32,
        "n_tries" => p.n_tries = parse_sized(value)?,
        "assisted_double_dist" => p.assisted_double_dist = parse_sized(value)?,
        "step" => parse_step(p, value)?,
        "pattern" => p.pattern = value.parse()?,
        "always_refill" => p.always_refill = parse_bool(value)?,
        "sched_fifo" => p.sched_fifo = parse_sized(value)? as i32,
        other => return Err(ConfigError::BadName(other.to_string())),
    }
    Ok(())
}

/// Reads and parses a config file (spec.md §6 grammar).
pub fn read_config(path: impl AsRef<Path>) -> Result<Params, ConfigError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Open {
        path: path.display().to_string(),
        source,
    })?;

    let mut p = Params::default();
    for (line_no, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim_end();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (name, value) = line
            .split_once('=')
            .ok_or_else(|| ConfigError::BadLine {
                line_no: line_no + 1,
                line: line.to_string(),
            })?;
        set(&mut p, name, value)?;
    }

    if p.cpus.is_empty() {
        p.cpus.push(0);
    }

    Ok(p)
}

/// Echoes the loaded configuration, matching `params.c:print_config`'s
/// intent (the exact `cpu=0` cosmetic branch for an empty cpu list is
/// not a correctness contract, spec.md §9).
pub fn print_config(p: &Params) {
    log::info!("Configuration:");
    let cpus = p
        .cpus
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(",");
    log::info!("cpu={cpus}");
    log::info!("size={}", p.size);
    log::info!("contig={}", p.contig as u8);
    log::info!("cached={}", p.cached as u8);
    log::info!("measure_loops={}", p.measure_loops);
    log::info!("offset0={}", p.offset0);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn defaults_match_original_tool() {
        let p = Params::default();
        assert_eq!(p.size, 128 * BYTES_IN_MBYTE);
        assert!(p.contig);
        assert!(!p.cached);
        assert_eq!(p.offset0, 16 * BYTES_IN_MBYTE);
        assert_eq!(p.measure_loops, 250_000);
        assert!(p.cpus.is_empty());
    }

    #[test]
    fn cpu_defaults_to_zero_when_unset_in_file() {
        let f = write_config("size=4M\n");
        let p = read_config(f.path()).unwrap();
        assert_eq!(p.cpus, vec![0]);
    }

    #[test]
    fn cpu_lines_accumulate_in_order() {
        let f = write_config("cpu=2\ncpu=5\n");
        let p = read_config(f.path()).unwrap();
        assert_eq!(p.cpus, vec![2, 5]);
    }

    #[test]
    fn parses_suffixed_sizes_and_comments() {
        let f = write_config(
            "# a comment\n\
             size=4M\n\
             \n\
             offset0=16K\n\
             cached=1\n",
        );
        let p = read_config(f.path()).unwrap();
        assert_eq!(p.size, 4 * BYTES_IN_MBYTE);
        assert_eq!(p.offset0, 16 * BYTES_IN_KBYTE);
        assert!(p.cached);
    }

    #[test]
    fn parses_hex_masks() {
        let f = write_config("victim_mask=0x1\nvictim_data_pattern=0xdeadbeef\n");
        let p = read_config(f.path()).unwrap();
        assert_eq!(p.victim_mask, 1);
        assert_eq!(p.victim_data_pattern, 0xdeadbeef);
    }

    #[test]
    fn accumulates_repeated_step_entries() {
        let f = write_config("step=0:4096\nstep=3:1024\n");
        let p = read_config(f.path()).unwrap();
        assert_eq!(
            p.addr_loops,
            vec![
                AddrLoop { count: 0, step: 4096 },
                AddrLoop { count: 3, step: 1024 },
            ]
        );
    }

    #[test]
    fn rejects_unknown_key() {
        let f = write_config("bogus=1\n");
        assert!(matches!(
            read_config(f.path()),
            Err(ConfigError::BadName(_))
        ));
    }

    #[test]
    fn rejects_too_many_steps() {
        let mut contents = String::new();
        for i in 0..=MAX_ADDR_LOOPS {
            contents.push_str(&format!("step={i}:4096\n"));
        }
        let f = write_config(&contents);
        assert!(matches!(
            read_config(f.path()),
            Err(ConfigError::TooManySteps)
        ));
    }

    #[test]
    fn rejects_malformed_step() {
        let f = write_config("step=nocolon\n");
        assert!(matches!(
            read_config(f.path()),
            Err(ConfigError::InvalidStep(_))
        ));
    }
}
