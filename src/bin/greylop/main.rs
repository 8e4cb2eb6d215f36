mod cli;

use clap::Parser;
use libafl_bolts::Error;

use greylop::{config::Config, fuzzer::Fuzzer};

fn main() -> Result<(), Error> {
    env_logger::init();

    let cli = cli::Cli::parse();
    let config = Config::load(&cli.config)?;
    log::info!("fuzzing {} with config {:?}", config.target.display(), cli.config);

    let mut fuzzer = Fuzzer::new(config)?;
    fuzzer.run()
}
