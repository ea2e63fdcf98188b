//! Subprocess spawning and signaling.
//!
//! The controller tracks raw PIDs; children are reaped by a detached wait
//! task so a killed daemon never lingers as a zombie.

use nix::sys::signal::{Signal, kill};
use nix::unistd;
use tokio::process::Command;

use std::process::Stdio;

use super::Error;

pub type Pid = i32;

pub trait ProcessOps: Send + Sync {
    /// Spawn a child and return its PID. With `inherit_output` the child
    /// writes to our stdout/stderr, otherwise output is discarded.
    fn spawn(&self, program: &str, args: &[String], inherit_output: bool) -> Result<Pid, Error>;
    /// Signal-0 liveness probe.
    fn alive(&self, pid: Pid) -> bool;
    /// SIGKILL. Callers probe with [`ProcessOps::alive`] first.
    fn kill(&self, pid: Pid) -> Result<(), Error>;
}

pub struct RealProcessOps;

impl ProcessOps for RealProcessOps {
    fn spawn(&self, program: &str, args: &[String], inherit_output: bool) -> Result<Pid, Error> {
        let (stdout, stderr) = if inherit_output {
            (Stdio::inherit(), Stdio::inherit())
        } else {
            (Stdio::null(), Stdio::null())
        };
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| Error::Process(format!("{program} exited before a pid was known")))?;

        // reap the child whenever it exits
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => tracing::debug!(%status, "child exited"),
                Err(e) => tracing::warn!(error = ?e, "waiting on child"),
            }
        });

        Ok(pid as Pid)
    }

    fn alive(&self, pid: Pid) -> bool {
        kill(unistd::Pid::from_raw(pid), None).is_ok()
    }

    fn kill(&self, pid: Pid) -> Result<(), Error> {
        kill(unistd::Pid::from_raw(pid), Signal::SIGKILL)?;
        Ok(())
    }
}
