//! The command line interface of the fuzzer

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(about = "Greylop: a coverage-guided grey-box fuzzer")]
pub struct Cli {
    #[arg(
        help = "Path to the fuzzing session config file",
        short = 'c',
        long = "config",
        required = true
    )]
    pub config: PathBuf,
}
