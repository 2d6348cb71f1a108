use anyhow::{bail, Result};
use comfy_table::Table;
use pmc_data::{Application, SessionConfig};
use pmc_extract::MONITOR_PROGRAM;
use pmc_remote::Connection;

const PMC_INFO: &str = "/proc/pmc/info";

pub fn do_check(config: &SessionConfig) -> Result<()> {
    let connection = Connection::new(config.machine.clone());
    let remote = config.machine.is_remote();

    let mut table = Table::new();
    table.set_header(vec!["Check", "Result"]);
    let mut failed = 0;
    let mut report = |check: &str, result: Result<String, String>| {
        let text = match result {
            Ok(detail) => format!("ok {detail}"),
            Err(reason) => {
                failed += 1;
                format!("failed: {reason}")
            }
        };
        table.add_row(vec![check.to_string(), text.trim_end().to_string()]);
    };

    let connectivity = connection.check_connectivity();
    let reachable = connectivity.is_ok();
    report(
        &format!("connect to {}", config.machine.label()),
        connectivity.map(|_| String::new()).map_err(|err| err.to_string()),
    );

    if reachable {
        report(
            &format!("{MONITOR_PROGRAM} installed"),
            if connection.check_package_installed(MONITOR_PROGRAM, remote) {
                Ok(String::new())
            } else {
                Err(format!("{MONITOR_PROGRAM} is not on the PATH"))
            },
        );

        let module = if connection.check_file_exists(PMC_INFO) {
            connection
                .read_file(PMC_INFO)
                .map(|info| {
                    info.lines()
                        .next()
                        .map(|line| format!("({line})"))
                        .unwrap_or_default()
                })
                .map_err(|err| err.to_string())
        } else {
            Err(format!("{PMC_INFO} not found, is the kernel module loaded?"))
        };
        report("kernel module", module);
    }

    if reachable {
        for app in &config.applications {
            // Bare program names are resolved through the PATH of the target.
            let Application::Launch(args) = app else {
                continue;
            };
            let Some(program) = args.first().filter(|program| program.contains('/')) else {
                continue;
            };
            report(
                &format!("program {program}"),
                if connection.check_file_exists(program) {
                    Ok(String::new())
                } else {
                    Err("no such file".to_string())
                },
            );
        }
    }

    if let Some(logs) = config.logs.as_ref().filter(|logs| logs.enabled()) {
        report(
            "log directory",
            if logs.directory.is_dir() {
                Ok(format!("({})", logs.directory.display()))
            } else {
                Err(format!("{} is not a directory", logs.directory.display()))
            },
        );
    }

    println!("{table}");

    if failed > 0 {
        bail!("{failed} check(s) failed");
    }
    Ok(())
}
