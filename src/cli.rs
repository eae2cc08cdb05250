//! Command-line surface, shared by the main harness and the `measure` tool.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to a harness config file (key=value grammar).
    pub config: PathBuf,
}
