use std::{collections::HashMap, time::Duration};

use anyhow::{Context, Result};
use comfy_table::Table;
use num_format::{Locale, ToFormattedString};
use pmc_data::SessionConfig;
use pmc_extract::{SampleStore, Session};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Samples already printed, per application, subject and experiment.
#[derive(Default)]
struct Printed {
    counts: HashMap<(String, String, usize), usize>,
}

impl Printed {
    fn print_new(&mut self, config: &SessionConfig, store: &SampleStore) {
        let label = config.subject_label();

        for app in store.applications() {
            for subject in store.subjects(&app) {
                for (exp_idx, exp) in config.experiments.iter().enumerate() {
                    if exp.metrics.is_empty() {
                        continue;
                    }

                    let from = self
                        .counts
                        .entry((app.clone(), subject.clone(), exp_idx))
                        .or_default();
                    let columns: Vec<Vec<f64>> = (0..exp.metrics.len())
                        .map(|metric| store.samples_since(&app, &subject, exp_idx, metric, *from))
                        .collect();
                    let new = columns.iter().map(Vec::len).min().unwrap_or(0);

                    for sample in 0..new {
                        let values = exp
                            .metrics
                            .iter()
                            .zip(&columns)
                            .map(|(metric, column)| format!("{}={:.3}", metric.name(), column[sample]))
                            .collect::<Vec<_>>()
                            .join(" ");
                        println!("{app} [{label} {subject}] #{} {values}", *from + sample + 1);
                    }
                    *from += new;
                }
            }
        }
    }
}

pub async fn do_monitor(config: SessionConfig) -> Result<()> {
    let session = Session::connect(config.clone()).context("starting monitoring session")?;
    info!(
        session = %session.id(),
        "monitoring, SIGUSR1 pauses, SIGUSR2 resumes and SIGQUIT kills the monitored program"
    );

    let mut pause = signal(SignalKind::user_defined1()).context("installing SIGUSR1 handler")?;
    let mut resume = signal(SignalKind::user_defined2()).context("installing SIGUSR2 handler")?;
    let mut quit = signal(SignalKind::quit()).context("installing SIGQUIT handler")?;
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    let mut printed = Printed::default();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                printed.print_new(&config, session.store());
                if session.is_finished() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT, killing monitoring command");
                session.kill_monitoring().context("killing monitoring command")?;
            }
            _ = pause.recv() => {
                if let Err(err) = session.stop_monitoring() {
                    warn!(error = %err, "pause failed");
                }
            }
            _ = resume.recv() => {
                if let Err(err) = session.resume_monitoring() {
                    warn!(error = %err, "resume failed");
                }
            }
            _ = quit.recv() => {
                if let Err(err) = session.kill_subject() {
                    warn!(error = %err, "killing the monitored program failed");
                }
            }
        }
    }

    let error = session.error();
    let summary = summary(session.store());
    session.join();
    println!("{summary}");

    match error {
        Some(err) => Err(err).context("monitoring failed"),
        None => Ok(()),
    }
}

fn summary(store: &SampleStore) -> Table {
    let mut table = Table::new();
    table.set_header(vec!["Application", "State", "Subjects", "Rows", "Skipped"]);

    for app in store.applications() {
        let Some(run) = store.snapshot(&app) else {
            continue;
        };
        table.add_row(vec![
            run.name().to_string(),
            run.state().to_string(),
            run.subjects().len().to_string(),
            run.rows().to_formatted_string(&Locale::en),
            run.skipped_rows().to_formatted_string(&Locale::en),
        ]);
    }

    table
}
