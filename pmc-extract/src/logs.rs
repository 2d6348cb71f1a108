//! Optional per-application log files mirroring the sample stream.

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Local};
use pmc_data::{LogConfig, SessionConfig};
use tracing::warn;

use crate::parser::RowSample;

pub const LOG_PREFIX: &str = "pmcview";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    Counters,
    Metrics,
}

impl LogKind {
    fn suffix(&self) -> &'static str {
        match self {
            LogKind::Counters => "counters",
            LogKind::Metrics => "metrics",
        }
    }
}

/// `pmcview_<application>_<machine>_<dd.mm.yy-HH.MM.SS>_<kind>.log`
///
/// The whole application name goes into the file name so that jobs of the
/// same program in one session do not share a log.
pub fn log_file_name(app: &str, machine: &str, started: &DateTime<Local>, kind: LogKind) -> String {
    format!(
        "{LOG_PREFIX}_{}_{machine}_{}_{}.log",
        file_stem(app),
        started.format("%d.%m.%y-%H.%M.%S"),
        kind.suffix()
    )
}

/// Runs of characters other than `[A-Za-z0-9.-]` become a single `_`.
fn file_stem(app: &str) -> String {
    let mut stem = String::with_capacity(app.len());
    for c in app.chars() {
        if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
            stem.push(c);
        } else if !stem.is_empty() && !stem.ends_with('_') {
            stem.push('_');
        }
    }
    if stem.ends_with('_') {
        stem.pop();
    }
    stem
}

pub fn banner(started: &DateTime<Local>, machine: &str, command: &str) -> String {
    format!(
        "Generated by {LOG_PREFIX} on {}\n\nCommand launched on '{machine}':\n{command}\n\n",
        started.format("%c")
    )
}

/// Formula legend followed by the column heading line of the metrics log.
pub fn metrics_legend(config: &SessionConfig) -> String {
    let mut legend = String::new();
    let mut heading = format!("{SAMPLE_HEADING} {:>6} ", config.subject_label());

    for (exp_idx, exp) in config.experiments.iter().enumerate() {
        for metric in &exp.metrics {
            legend.push_str(&format!(
                "{} = {} [Experiment {}]\n",
                metric.name(),
                metric.formula().text(),
                exp_idx + 1
            ));
            heading.push_str(&format!("{:>13} ", metric.name()));
        }
    }

    legend.push('\n');
    legend.push_str(&heading);
    legend.push('\n');
    legend
}

const SAMPLE_HEADING: &str = "nsample";

/// One metrics log line. Experiments other than the row's own get a `-` per metric.
pub fn format_metrics_row(sample: &RowSample, layout: &[usize]) -> String {
    let mut line = format!("{:>7} {:>6} ", sample.nsample, sample.subject);

    for (exp_idx, &metrics) in layout.iter().enumerate() {
        if exp_idx == sample.experiment {
            for value in &sample.values {
                line.push_str(&format!("{value:>13.3} "));
            }
        } else {
            for _ in 0..metrics {
                line.push_str(&format!("{:>13} ", "-"));
            }
        }
    }

    line.push('\n');
    line
}

struct LogFile {
    path: PathBuf,
    out: BufWriter<File>,
}

impl LogFile {
    fn create(path: PathBuf, preamble: &str) -> Option<LogFile> {
        let result = File::create(&path).and_then(|file| {
            let mut out = BufWriter::new(file);
            out.write_all(preamble.as_bytes())?;
            Ok(out)
        });

        match result {
            Ok(out) => Some(LogFile { path, out }),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "cannot create log file");
                None
            }
        }
    }
}

/// Counter and metric logs of one application, opened once its header has
/// been accepted and closed at the end of its stream.
///
/// A log that fails to write is dropped with a warning; the stream keeps
/// being processed.
pub struct LogWriter {
    counters: Option<LogFile>,
    metrics: Option<LogFile>,
    layout: Vec<usize>,
}

pub struct LogContext<'a> {
    pub app: &'a str,
    pub machine: &'a str,
    pub command: &'a str,
    pub header: &'a str,
    pub started: &'a DateTime<Local>,
}

impl LogWriter {
    pub fn open(logs: &LogConfig, config: &SessionConfig, ctx: &LogContext<'_>) -> LogWriter {
        let banner = banner(ctx.started, ctx.machine, ctx.command);
        let path = |kind| log_path(&logs.directory, ctx, kind);

        let counters = logs.counters.then(|| {
            let mut preamble = banner.clone();
            preamble.push_str(ctx.header);
            if !ctx.header.ends_with('\n') {
                preamble.push('\n');
            }
            LogFile::create(path(LogKind::Counters), &preamble)
        });

        let metrics = logs.metrics.then(|| {
            let preamble = format!("{banner}{}", metrics_legend(config));
            LogFile::create(path(LogKind::Metrics), &preamble)
        });

        LogWriter {
            counters: counters.flatten(),
            metrics: metrics.flatten(),
            layout: config.metric_layout(),
        }
    }

    /// Echoes a raw data line to the counters log.
    pub fn write_counters(&mut self, line: &str) {
        if let Some(log) = self.counters.as_mut() {
            let result = log
                .out
                .write_all(line.as_bytes())
                .and_then(|_| log.out.write_all(b"\n"));
            if let Err(err) = result {
                warn!(path = %log.path.display(), error = %err, "counters log disabled");
                self.counters = None;
            }
        }
    }

    pub fn write_metrics(&mut self, sample: &RowSample) {
        if let Some(log) = self.metrics.as_mut() {
            let line = format_metrics_row(sample, &self.layout);
            if let Err(err) = log.out.write_all(line.as_bytes()) {
                warn!(path = %log.path.display(), error = %err, "metrics log disabled");
                self.metrics = None;
            }
        }
    }

    pub fn paths(&self) -> Vec<&Path> {
        self.counters
            .iter()
            .chain(self.metrics.iter())
            .map(|log| log.path.as_path())
            .collect()
    }

    pub fn close(self) {
        for mut log in self.counters.into_iter().chain(self.metrics) {
            if let Err(err) = log.out.flush() {
                warn!(path = %log.path.display(), error = %err, "failed to flush log");
            }
        }
    }
}

fn log_path(directory: &Path, ctx: &LogContext<'_>, kind: LogKind) -> PathBuf {
    directory.join(log_file_name(ctx.app, ctx.machine, ctx.started, kind))
}
