pub mod cli;
pub mod constants;
pub mod discovery;
pub mod driver;
pub mod fill;
pub mod linearize;
pub mod memory;
pub mod pagemap;
pub mod params;
pub mod pool;
pub mod timing;
pub mod util;

pub use crate::driver::{Counters, Driver};
pub use crate::params::Params;
