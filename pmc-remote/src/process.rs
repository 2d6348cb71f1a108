use std::process::{Child, Command, Stdio};

use crate::{Error, ProcessHandle, Signal, Spawned};

/// A locally spawned command whose output is read while it runs. For remote
/// targets this is the `ssh`/`adb` client process.
#[derive(Debug)]
pub struct MonitorProcess {
    child: Child,
}

impl MonitorProcess {
    pub fn spawn(args: &[String]) -> Result<Spawned, Error> {
        let (program, rest) = args.split_first().ok_or(Error::EmptyCommand)?;

        let mut child = Command::new(program)
            .args(rest)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| Error::Spawn {
                program: program.clone(),
                source,
            })?;

        let stdout = child.stdout.take().ok_or(Error::MissingStdout)?;
        let stderr = child.stderr.take().ok_or(Error::MissingStdout)?;

        Ok(Spawned {
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            process: Box::new(MonitorProcess { child }),
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }
}

impl ProcessHandle for MonitorProcess {
    fn id(&self) -> u32 {
        self.pid()
    }

    fn kill(&mut self) -> Result<(), std::io::Error> {
        signal_local(self.pid(), Signal::Kill)
    }

    fn wait(&mut self) -> Result<Option<i32>, std::io::Error> {
        Ok(self.child.wait()?.code())
    }
}

pub(crate) fn signal_local(pid: u32, signal: Signal) -> Result<(), std::io::Error> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;

    if unsafe { libc::kill(pid, signal.number()) } == -1 {
        return Err(std::io::Error::last_os_error());
    }

    Ok(())
}
