//! The AFL-style fork-server channel.
//!
//! The fuzzer spawns the instrumented target once. The target's
//! instrumentation bootstrap takes over at the start of `main`, reports in
//! over the status pipe and from then on forks one short-lived child per
//! execution request. The pipes are remapped in the child to the well-known
//! descriptors 198 (control) and 199 (status) before `exec`.

use std::{
    ffi::{OsStr, OsString},
    io::{self, Read, Write},
    os::{
        fd::{AsRawFd, BorrowedFd, RawFd},
        unix::process::CommandExt,
    },
    process::{Child, Command, Stdio},
    time::{Duration, Instant},
};

use libafl_bolts::Error;
use nix::{
    errno::Errno,
    libc,
    sys::{
        select::{pselect, FdSet},
        signal::{kill, SigSet, Signal},
        time::TimeSpec,
    },
    unistd::Pid,
};
use os_pipe::{PipeReader, PipeWriter};

/// Descriptor the target's fork server reads control messages from. Status
/// flows back on the next descriptor up.
pub const FORKSRV_FD: RawFd = 198;

/// Status code reported for executions that hit the timeout.
pub const TIMEOUT_STATUS_CODE: i32 = 9;

/// Termination signals classified as crashes: abort, floating-point
/// exception, segfault.
const CRASH_SIGNALS: [i32; 3] = [6, 8, 11];

/// How long to wait for the wait-status after killing a stuck child.
const POST_KILL_GRACE: Duration = Duration::from_secs(2);

/// Configure the target process, borrowed in spirit from the `Angora`
/// fuzzer's command setup.
pub trait ConfigTarget {
    /// Moves the child into its own session.
    fn setsid(&mut self) -> &mut Self;
    /// Redirects stdin to the scratch input file, if stdin input is used.
    fn setstdin(&mut self, fd: RawFd, use_stdin: bool) -> &mut Self;
    /// Remaps the fork-server pipes onto the well-known descriptors.
    fn setpipe(
        &mut self,
        st_read: RawFd,
        st_write: RawFd,
        ctl_read: RawFd,
        ctl_write: RawFd,
    ) -> &mut Self;
}

impl ConfigTarget for Command {
    fn setsid(&mut self) -> &mut Self {
        let func = move || {
            unsafe {
                libc::setsid();
            };
            Ok(())
        };
        unsafe { self.pre_exec(func) }
    }

    fn setstdin(&mut self, fd: RawFd, use_stdin: bool) -> &mut Self {
        if !use_stdin {
            return self;
        }
        let func = move || {
            if unsafe { libc::dup2(fd, libc::STDIN_FILENO) } < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        };
        unsafe { self.pre_exec(func) }
    }

    fn setpipe(
        &mut self,
        st_read: RawFd,
        st_write: RawFd,
        ctl_read: RawFd,
        ctl_write: RawFd,
    ) -> &mut Self {
        let func = move || {
            if unsafe { libc::dup2(ctl_read, FORKSRV_FD) } < 0 {
                return Err(io::Error::last_os_error());
            }
            if unsafe { libc::dup2(st_write, FORKSRV_FD + 1) } < 0 {
                return Err(io::Error::last_os_error());
            }
            unsafe {
                libc::close(st_read);
                libc::close(st_write);
                libc::close(ctl_read);
                libc::close(ctl_write);
            }
            Ok(())
        };
        unsafe { self.pre_exec(func) }
    }
}

/// The outcome of a single target execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Execution {
    /// The terminating signal number, [`TIMEOUT_STATUS_CODE`] for a timeout,
    /// or 0 for a clean exit.
    pub status_code: i32,
    /// Wall time from the wake signal to the status report.
    pub exec_time: Duration,
}

impl Execution {
    pub fn exec_time_us(&self) -> u64 {
        self.exec_time.as_micros() as u64
    }

    pub fn exit_kind(&self) -> ExitKind {
        if self.status_code == TIMEOUT_STATUS_CODE {
            ExitKind::Timeout
        } else if CRASH_SIGNALS.contains(&self.status_code) {
            ExitKind::Crash
        } else {
            ExitKind::Ok
        }
    }
}

/// Classification of an execution for the fuzzing loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Clean exit, including nonzero exit codes.
    Ok,
    /// Terminated by a crash signal.
    Crash,
    /// Ran into the execution timeout.
    Timeout,
}

/// Extracts the status code from a raw wait-status: the terminating signal
/// if there was one, else 0.
fn wait_status_code(wait_status: i32) -> i32 {
    if libc::WIFSIGNALED(wait_status) {
        libc::WTERMSIG(wait_status)
    } else {
        0
    }
}

/// The communication channel with the fork server hosted in the target.
///
/// State machine: after the handshake every [`Forkserver::run`] walks
/// request, pid, wait-status; protocol violations are fatal.
#[derive(Debug)]
pub struct Forkserver {
    /// The fork-server process we spawned in the target.
    fsrv_handle: Child,
    /// Status pipe, read end.
    st_pipe: PipeReader,
    /// Control pipe, write end.
    ctl_pipe: PipeWriter,
    /// Pid of the forked child during an execution.
    child_pid: Option<Pid>,
    /// Whether the previous run timed out; relayed in the next wake signal.
    last_run_timed_out: bool,
    /// Signal used to kill stuck children.
    kill_signal: Signal,
}

impl Drop for Forkserver {
    fn drop(&mut self) {
        log::debug!("shutting down the fork server");
        self.kill_child();
        if let Err(err) = self.fsrv_handle.kill() {
            log::warn!("failed to kill the fork server process: {err}");
        } else if let Err(err) = self.fsrv_handle.wait() {
            log::warn!("failed to reap the fork server process: {err}");
        }
    }
}

impl Forkserver {
    /// Spawns the target with the fork-server pipes in place.
    ///
    /// The child's stdout and stderr go to the null device unless
    /// `debug_output` is set.
    pub fn new(
        target: &OsStr,
        args: &[OsString],
        envs: &[(OsString, OsString)],
        input_fd: RawFd,
        use_stdin: bool,
        debug_output: bool,
        kill_signal: Signal,
    ) -> Result<Self, Error> {
        let (st_rx, st_tx) = os_pipe::pipe()?;
        let (ctl_rx, ctl_tx) = os_pipe::pipe()?;

        let (stdout, stderr) = if debug_output {
            (Stdio::inherit(), Stdio::inherit())
        } else {
            (Stdio::null(), Stdio::null())
        };

        let mut command = Command::new(target);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .env("LD_BIND_NOW", "1")
            .envs(envs.iter().cloned())
            .setsid()
            .setstdin(input_fd, use_stdin)
            .setpipe(
                st_rx.as_raw_fd(),
                st_tx.as_raw_fd(),
                ctl_rx.as_raw_fd(),
                ctl_tx.as_raw_fd(),
            );

        let fsrv_handle = command.spawn().map_err(|err| {
            Error::illegal_state(format!("could not spawn the fork server: {err}"))
        })?;

        // The child has duplicated its ends onto the fork-server
        // descriptors; the parent keeps only the status read end and the
        // control write end.
        drop(st_tx);
        drop(ctl_rx);

        Ok(Self {
            fsrv_handle,
            st_pipe: st_rx,
            ctl_pipe: ctl_tx,
            child_pid: None,
            last_run_timed_out: false,
            kill_signal,
        })
    }

    /// Waits for the four hello bytes the fork server sends once it is
    /// ready. Anything short of that is fatal.
    pub fn handshake(&mut self) -> Result<(), Error> {
        let mut buf = [0_u8; 4];
        self.st_pipe
            .read_exact(&mut buf)
            .map_err(|err| Error::unknown(format!("fork server handshake failed: {err}")))?;
        log::info!("all right, the fork server is up");
        Ok(())
    }

    /// Requests one execution of the target against the current input file
    /// and waits for its outcome.
    pub fn run(&mut self, timeout: Duration) -> Result<Execution, Error> {
        let start = Instant::now();

        // Any four bytes wake the server; like AFL we pass along whether the
        // previous run timed out.
        self.write_ctl(u32::from(self.last_run_timed_out))?;
        self.last_run_timed_out = false;

        let pid = self.read_st()?;
        if pid <= 0 {
            return Err(Error::unknown("fork server sent an invalid child pid"));
        }
        self.child_pid = Some(Pid::from_raw(pid));

        let (wait_status, status_code) =
            match self.read_st_timed(&TimeSpec::from_duration(timeout))? {
                Some(wait_status) => (wait_status, wait_status_code(wait_status)),
                None => {
                    // The child is stuck. Kill it and drain the status the
                    // fork server reports for the kill, so the pipe stays in
                    // sync for the next request.
                    self.last_run_timed_out = true;
                    self.kill_child();
                    let wait_status = self
                        .read_st_timed(&TimeSpec::from_duration(POST_KILL_GRACE))?
                        .ok_or_else(|| {
                            Error::unknown(
                                "fork server sent no status after a stuck child was killed",
                            )
                        })?;
                    (wait_status, TIMEOUT_STATUS_CODE)
                }
            };
        let exec_time = start.elapsed();

        if !libc::WIFSTOPPED(wait_status) {
            self.child_pid = None;
        }

        Ok(Execution {
            status_code,
            exec_time,
        })
    }

    fn kill_child(&mut self) {
        if let Some(pid) = self.child_pid {
            match kill(pid, self.kill_signal) {
                // The child being gone already is fine.
                Ok(()) | Err(Errno::ESRCH) => (),
                Err(err) => log::warn!("failed to deliver kill signal to child {pid}: {err}"),
            }
        }
    }

    /// Blocking read of one four-byte value from the status pipe.
    fn read_st(&mut self) -> Result<i32, Error> {
        let mut buf = [0_u8; 4];
        self.st_pipe
            .read_exact(&mut buf)
            .map_err(|err| Error::unknown(format!("failed to read from the fork server: {err}")))?;
        Ok(i32::from_ne_bytes(buf))
    }

    /// Writes one four-byte value to the control pipe.
    fn write_ctl(&mut self, value: u32) -> Result<(), Error> {
        self.ctl_pipe
            .write_all(&value.to_ne_bytes())
            .map_err(|err| Error::unknown(format!("failed to write to the fork server: {err}")))?;
        Ok(())
    }

    /// Reads one four-byte value from the status pipe, giving up after
    /// `timeout`. Returns `None` on expiry.
    fn read_st_timed(&mut self, timeout: &TimeSpec) -> Result<Option<i32>, Error> {
        // The descriptor stays valid for as long as the pipe lives.
        let st_read = unsafe { BorrowedFd::borrow_raw(self.st_pipe.as_raw_fd()) };
        loop {
            let mut readfds = FdSet::new();
            readfds.insert(st_read);
            match pselect(
                None,
                &mut readfds,
                None,
                None,
                Some(timeout),
                Some(&SigSet::empty()),
            ) {
                Ok(ret) if ret > 0 => {
                    let mut buf = [0_u8; 4];
                    self.st_pipe.read_exact(&mut buf).map_err(|_| {
                        Error::unknown("lost contact with the fork server (OOM?)")
                    })?;
                    return Ok(Some(i32::from_ne_bytes(buf)));
                }
                Ok(_) => return Ok(None),
                // A user signal lands here; keep waiting, the loop above us
                // checks the shutdown flag between executions.
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    return Err(Error::unknown(format!(
                        "waiting on the fork server failed: {err}"
                    )))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_terminations_yield_the_signal_number() {
        // A signaled process carries the signal in the low bits of the raw
        // wait-status.
        assert_eq!(wait_status_code(11), 11);
        assert_eq!(wait_status_code(6), 6);
    }

    #[test]
    fn clean_exits_yield_zero() {
        // Exit codes live in the second byte of the wait-status.
        assert_eq!(wait_status_code(0), 0);
        assert_eq!(wait_status_code(1 << 8), 0);
        assert_eq!(wait_status_code(77 << 8), 0);
    }

    #[test]
    fn exit_kind_classification() {
        let run = |status_code| Execution {
            status_code,
            exec_time: Duration::from_micros(100),
        };
        assert_eq!(run(0).exit_kind(), ExitKind::Ok);
        assert_eq!(run(6).exit_kind(), ExitKind::Crash);
        assert_eq!(run(8).exit_kind(), ExitKind::Crash);
        assert_eq!(run(11).exit_kind(), ExitKind::Crash);
        assert_eq!(run(TIMEOUT_STATUS_CODE).exit_kind(), ExitKind::Timeout);
        // Any other nonzero status counts as a clean exit.
        assert_eq!(run(15).exit_kind(), ExitKind::Ok);
    }
}
