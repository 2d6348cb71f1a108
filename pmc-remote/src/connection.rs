use std::process::{Command, Output, Stdio};

use pmc_data::{AdbTarget, Machine, SshTarget};
use tracing::debug;

use crate::{
    process::{signal_local, MonitorProcess},
    Error, Executor, RemoteProcessController, Signal, Spawned, Target,
};

const SYSWIDE_ENABLE: &str = "/proc/pmc/enable";

/// Runs commands on the monitored machine: directly when local, through an
/// `ssh` or `adb shell` client otherwise.
#[derive(Debug, Clone)]
pub struct Connection {
    machine: Machine,
    prefix: Vec<String>,
}

impl Connection {
    pub fn new(machine: Machine) -> Self {
        let prefix = match &machine {
            Machine::Local => vec![],
            Machine::Ssh(target) => ssh_command(target),
            Machine::Adb(target) => adb_command(target),
        };

        Connection { machine, prefix }
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    /// Full argument vector that runs `command` on the target with its
    /// diagnostics folded into stdout.
    pub fn monitoring_command(&self, command: &[String]) -> Vec<String> {
        match &self.machine {
            Machine::Local => command.to_vec(),
            Machine::Ssh(_) => {
                let mut args = self.prefix.clone();
                args.push("-t".to_string());
                args.push(format!("{} 2>&1", command.join(" ")));
                args
            }
            Machine::Adb(_) => {
                let mut args = self.prefix.clone();
                args.push(format!("{} 2>&1", command.join(" ")));
                args
            }
        }
    }

    fn shell_command(&self, script: &str) -> Vec<String> {
        let mut args = if self.machine.is_remote() {
            self.prefix.clone()
        } else {
            vec!["sh".to_string(), "-c".to_string()]
        };
        args.push(script.to_string());
        args
    }

    fn run(&self, args: &[String]) -> Result<Output, Error> {
        let (program, rest) = args.split_first().ok_or(Error::EmptyCommand)?;
        debug!(command = %args.join(" "), "running");

        Command::new(program)
            .args(rest)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| Error::Spawn {
                program: program.clone(),
                source,
            })
    }

    fn run_shell(&self, script: &str) -> Result<Output, Error> {
        let output = self.run(&self.shell_command(script))?;
        if !output.status.success() {
            return Err(Error::CommandFailed {
                command: script.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }

    pub fn check_file_exists(&self, path: &str) -> bool {
        let path = path.trim();
        if path.is_empty() || path.contains('#') {
            return false;
        }

        if self.machine.is_remote() {
            self.run_shell(&format!("test -e {path}")).is_ok()
        } else {
            std::path::Path::new(path).exists()
        }
    }

    /// Whether `name` is on the `PATH` of the target (`remote`) or of this host.
    pub fn check_package_installed(&self, name: &str, remote: bool) -> bool {
        if remote && self.machine.is_remote() {
            self.run_shell(&format!("command -v {name}")).is_ok()
        } else {
            which::which(name).is_ok()
        }
    }

    /// Verifies that the remote shell accepts commands. Local machines are
    /// always reachable.
    pub fn check_connectivity(&self) -> Result<(), Error> {
        let expected_user = match &self.machine {
            Machine::Local => return Ok(()),
            Machine::Ssh(target) => Some(target.user.as_str()),
            Machine::Adb(_) => None,
        };

        let output = self.run(&self.shell_command("whoami"))?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let reachable = match expected_user {
            Some(user) => stdout.starts_with(user),
            None => output.status.success(),
        };

        if reachable {
            Ok(())
        } else {
            Err(Error::Unreachable(connectivity_message(
                &String::from_utf8_lossy(&output.stderr),
            )))
        }
    }

    pub fn read_file(&self, path: &str) -> Result<String, Error> {
        if self.machine.is_remote() {
            let output = self.run_shell(&format!("cat {path}"))?;
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Ok(std::fs::read_to_string(path)?)
        }
    }

    pub fn send_signal(&self, pid: u32, signal: Signal) -> Result<(), Error> {
        debug!(pid, signal = signal.name(), remote = self.machine.is_remote(), "sending signal");
        if self.machine.is_remote() {
            self.run_shell(&format!("kill -s {} {pid}", signal.name()))?;
        } else {
            signal_local(pid, signal)?;
        }
        Ok(())
    }

    pub fn kill_process(&self, pid: u32) -> Result<(), Error> {
        self.send_signal(pid, Signal::Kill)
    }

    fn syswide(&self, directive: &str) -> Result<(), Error> {
        debug!(directive, "toggling system-wide monitoring");
        if self.machine.is_remote() {
            self.run_shell(&format!("echo -n syswide {directive} > {SYSWIDE_ENABLE}"))?;
        } else {
            std::fs::write(SYSWIDE_ENABLE, format!("syswide {directive}"))?;
        }
        Ok(())
    }
}

impl Executor for Connection {
    fn execute(&self, command: &[String]) -> Result<Spawned, Error> {
        MonitorProcess::spawn(&self.monitoring_command(command))
    }
}

impl RemoteProcessController for Connection {
    fn pause(&self, target: Target) -> Result<(), Error> {
        match target {
            Target::SystemWide => self.syswide("pause"),
            Target::Process(pid) => self.send_signal(pid, Signal::Stop),
        }
    }

    fn resume(&self, target: Target) -> Result<(), Error> {
        match target {
            Target::SystemWide => self.syswide("resume"),
            Target::Process(pid) => self.send_signal(pid, Signal::Cont),
        }
    }

    fn kill(&self, pid: u32) -> Result<(), Error> {
        self.kill_process(pid)
    }
}

pub fn ssh_command(target: &SshTarget) -> Vec<String> {
    let mut args: Vec<String> = vec![];

    match target.password.as_deref().filter(|pw| !pw.is_empty()) {
        Some(password) => {
            args.extend(["sshpass", "-p", password].map(String::from));
            args.extend(ssh_base_options());
        }
        None => {
            args.extend(ssh_base_options());
            args.extend(["-o", "NumberOfPasswordPrompts=0"].map(String::from));
            if let Some(key) = &target.key_path {
                args.push("-i".to_string());
                args.push(key.display().to_string());
            }
        }
    }

    if target.port != 22 {
        args.push("-p".to_string());
        args.push(target.port.to_string());
    }

    args.push("-l".to_string());
    args.push(target.user.clone());
    args.push(target.address.clone());
    args
}

fn ssh_base_options() -> Vec<String> {
    [
        "ssh",
        "-o",
        "ConnectTimeout=8",
        "-o",
        "StrictHostKeyChecking=no",
    ]
    .map(String::from)
    .to_vec()
}

pub fn adb_command(target: &AdbTarget) -> Vec<String> {
    vec![
        "adb".to_string(),
        "-H".to_string(),
        target.address.clone(),
        "-P".to_string(),
        target.port.to_string(),
        "shell".to_string(),
    ]
}

fn connectivity_message(stderr: &str) -> String {
    if stderr.contains("publickey,password") {
        "The SSH key provided is invalid.".to_string()
    } else if stderr.contains("ermission denied") {
        "The username or password are incorrect.".to_string()
    } else if stderr.contains("timed out") {
        "Connection timed out.".to_string()
    } else if stderr.contains("service not known") {
        "Remote machine not found.".to_string()
    } else {
        stderr.trim().to_string()
    }
}
