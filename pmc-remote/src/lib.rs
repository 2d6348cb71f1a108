mod connection;
mod process;

pub use connection::{adb_command, ssh_command, Connection};
pub use process::MonitorProcess;

use std::io::Read;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("empty command line")]
    EmptyCommand,
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("command has no output pipe")]
    MissingStdout,
    #[error("'{command}' failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
    #[error("remote machine is unreachable: {0}")]
    Unreachable(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Stop,
    Cont,
    Kill,
}

impl Signal {
    /// Name accepted by `kill -s`.
    pub fn name(&self) -> &'static str {
        match self {
            Signal::Stop => "STOP",
            Signal::Cont => "CONT",
            Signal::Kill => "KILL",
        }
    }

    pub fn number(&self) -> libc::c_int {
        match self {
            Signal::Stop => libc::SIGSTOP,
            Signal::Cont => libc::SIGCONT,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

/// What a pause or resume directive applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// The monitoring subsystem itself, in system-wide mode.
    SystemWide,
    /// A process on the monitored machine.
    Process(u32),
}

/// A running command whose stdout is consumed while it executes.
pub struct Spawned {
    pub stdout: Box<dyn Read + Send>,
    pub stderr: Box<dyn Read + Send>,
    pub process: Box<dyn ProcessHandle>,
}

impl std::fmt::Debug for Spawned {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Spawned")
            .field("pid", &self.process.id())
            .finish_non_exhaustive()
    }
}

pub trait ProcessHandle: Send {
    fn id(&self) -> u32;
    /// Forcibly terminates the process, which closes its output streams.
    fn kill(&mut self) -> Result<(), std::io::Error>;
    /// Reaps the process, returning its exit code if it exited normally.
    fn wait(&mut self) -> Result<Option<i32>, std::io::Error>;
}

pub trait Executor: Send + Sync {
    fn execute(&self, command: &[String]) -> Result<Spawned, Error>;
}

/// Pause, resume and kill processes on the monitored machine.
pub trait RemoteProcessController: Send + Sync {
    fn pause(&self, target: Target) -> Result<(), Error>;
    fn resume(&self, target: Target) -> Result<(), Error>;
    /// Kills a monitored subject, leaving the monitoring command to report
    /// its exit and end the stream.
    fn kill(&self, pid: u32) -> Result<(), Error>;
}
