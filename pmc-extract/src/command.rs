use std::fmt;

use itertools::Itertools;
use pmc_data::{Application, Experiment, SessionConfig};

pub const MONITOR_PROGRAM: &str = "pmctrack";

/// Invocation of the monitoring tool for one application.
///
/// Input is assumed to be validated by whoever produced the configuration:
/// general-purpose counters carry an event code, flag values are well formed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    args: Vec<String>,
}

impl CommandLine {
    pub fn build(config: &SessionConfig, app: &Application) -> Self {
        let mut args: Vec<String> = vec![MONITOR_PROGRAM.into(), "-L".into(), "-r".into()];

        args.push("-T".into());
        args.push(format!("{:.2}", config.period_ms as f64 / 1000.0));

        if config.system_wide {
            args.push("-S".into());
        }

        if let Some(cpu) = &config.cpu {
            args.push("-b".into());
            args.push(cpu.to_string());
        }

        for exp in &config.experiments {
            let spec = experiment_spec(exp);
            if !spec.is_empty() {
                args.push("-c".into());
                args.push(spec);
            }
        }

        if config.buffer_size > 0 {
            args.push("-k".into());
            args.push(config.buffer_size.to_string());
        }

        if !config.virtual_counters.is_empty() {
            args.push("-V".into());
            args.push(
                config
                    .virtual_counters
                    .iter()
                    .map(|n| format!("virt{n}"))
                    .join(","),
            );
        }

        match app {
            Application::Launch(command) => args.extend(command.iter().cloned()),
            Application::Attach(pid) => {
                args.push("-p".into());
                args.push(pid.to_string());
            }
        }

        CommandLine { args }
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.args.join(" "))
    }
}

/// Counter assignment of one experiment, e.g. `pmc0,pmc3=0x2e,umask3=0x41,ebs0=500000`.
pub fn experiment_spec(exp: &Experiment) -> String {
    let mut parts = vec![];

    for event in &exp.events {
        match (&event.code, event.fixed) {
            (Some(code), false) => parts.push(format!("pmc{}=0x{:x}", event.counter, code.0)),
            _ => parts.push(format!("pmc{}", event.counter)),
        }

        if !event.fixed {
            parts.extend(
                event
                    .flags
                    .iter()
                    .map(|(flag, value)| format!("{flag}{}={value}", event.counter)),
            );
        }
    }

    if let Some(ebs) = &exp.ebs {
        parts.push(format!("ebs{}={}", ebs.counter, ebs.threshold));
    }

    parts.join(",")
}
