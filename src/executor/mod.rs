//! Running the target: fork-server plumbing and the per-execution driver.

pub mod forkserver;

use std::{ffi::OsString, time::Duration};

use libafl_bolts::{fs::InputFile, Error};
use nix::sys::signal::Signal;

pub use forkserver::{Execution, ExitKind, Forkserver, TIMEOUT_STATUS_CODE};

use crate::{config::Config, coverage::SHM_ENV_VAR};

/// Drives one target execution at a time: writes the test case to the
/// scratch input file, wakes the fork server and reports the outcome.
#[derive(Debug)]
pub struct TargetExecutor {
    forkserver: Forkserver,
    input_file: InputFile,
    timeout: Duration,
}

impl TargetExecutor {
    /// Spawns the fork server for the configured target and completes the
    /// startup handshake.
    ///
    /// Every `@@` in the argument list is substituted with the scratch input
    /// path; without one, the scratch file backs the target's stdin.
    pub fn new(config: &Config, shm_id: &str) -> Result<Self, Error> {
        let input_file = InputFile::create(&config.current_input)?;
        let use_stdin = config.use_stdin();
        let args: Vec<OsString> = config
            .target_args
            .iter()
            .map(|arg| {
                if arg == "@@" {
                    config.current_input.clone().into_os_string()
                } else {
                    OsString::from(arg)
                }
            })
            .collect();
        let envs = vec![(OsString::from(SHM_ENV_VAR), OsString::from(shm_id))];

        let mut forkserver = Forkserver::new(
            config.target.as_os_str(),
            &args,
            &envs,
            input_file.as_raw_fd(),
            use_stdin,
            config.debug_child,
            Signal::SIGKILL,
        )?;
        forkserver.handshake()?;

        Ok(Self {
            forkserver,
            input_file,
            timeout: Duration::from_millis(config.timeout_ms),
        })
    }

    /// Runs the target once against `input`.
    pub fn run(&mut self, input: &[u8]) -> Result<Execution, Error> {
        self.input_file.write_buf(input)?;
        self.forkserver.run(self.timeout)
    }
}
