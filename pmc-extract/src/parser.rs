//! Column-positioned parsing of the monitoring command's output.

use hashbrown::HashMap;
use pmc_data::{BoundFormula, EvalError, SessionConfig};
use smallvec::SmallVec;
use thiserror::Error;

use crate::SessionError;

/// Informational line some targets print before the header.
pub const PID_FOUND: &str = "PID found";
pub const SAMPLE_COLUMN: &str = "nsample";
pub const EVENT_COLUMN: &str = "event";
pub const EXPERIMENT_COLUMN: &str = "expid";
const ERROR_PREFIX: &str = "pmctrack: ";

/// Column name to zero-based position, taken from the header row.
#[derive(Debug, Clone)]
pub struct Header {
    line: String,
    columns: HashMap<String, usize>,
}

impl Header {
    pub fn parse(line: &str, subject_label: &str) -> Result<Header, SessionError> {
        let is_header = line.contains(SAMPLE_COLUMN)
            && line.contains(subject_label)
            && line.contains(EVENT_COLUMN);
        if !is_header {
            return Err(SessionError::HeaderRejected(rejection_message(line)));
        }

        let columns = line
            .split_whitespace()
            .enumerate()
            .map(|(pos, name)| (name.to_string(), pos))
            .collect();

        Ok(Header {
            line: line.to_string(),
            columns,
        })
    }

    pub fn position(&self, column: &str) -> Option<usize> {
        self.columns.get(column).copied()
    }

    pub fn line(&self) -> &str {
        &self.line
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Message shown for a line that is not a header: the tool's own error text
/// when it carries the `pmctrack: ` prefix, the whole line otherwise.
pub fn rejection_message(line: &str) -> String {
    let message = match line.split_once(ERROR_PREFIX) {
        Some((_, rest)) => rest.lines().next().unwrap_or_default(),
        None => line,
    };
    message.trim_end_matches(['\r', '\n']).to_string()
}

/// One evaluated data row.
#[derive(Debug, Clone, PartialEq)]
pub struct RowSample {
    pub nsample: String,
    pub subject: String,
    pub experiment: usize,
    /// Metric values of `experiment`, in configuration order.
    pub values: SmallVec<[f64; 8]>,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RowError {
    #[error("row has no '{0}' field")]
    MissingField(&'static str),
    #[error("invalid experiment id '{0}'")]
    InvalidExperiment(String),
    #[error("metric '{metric}': {source}")]
    Metric {
        metric: String,
        #[source]
        source: EvalError,
    },
}

/// Turns data rows of one application's stream into [`RowSample`]s using
/// the formulas bound against its header.
#[derive(Debug)]
pub struct RowParser {
    nsample: usize,
    subject: usize,
    expid: Option<usize>,
    experiments: Vec<Vec<(String, BoundFormula)>>,
}

impl RowParser {
    pub fn new(header: &Header, config: &SessionConfig) -> Result<Self, SessionError> {
        let missing = |column: &str| {
            SessionError::HeaderRejected(format!(
                "header '{}' has no '{column}' column",
                header.line().trim()
            ))
        };

        let subject_label = config.subject_label();
        let nsample = header
            .position(SAMPLE_COLUMN)
            .ok_or_else(|| missing(SAMPLE_COLUMN))?;
        let subject = header
            .position(subject_label)
            .ok_or_else(|| missing(subject_label))?;
        let expid = if config.experiments.len() > 1 {
            Some(
                header
                    .position(EXPERIMENT_COLUMN)
                    .ok_or_else(|| missing(EXPERIMENT_COLUMN))?,
            )
        } else {
            None
        };

        let mut experiments = Vec::with_capacity(config.experiments.len());
        for (exp_idx, exp) in config.experiments.iter().enumerate() {
            let mut bound = Vec::with_capacity(exp.metrics.len());
            for metric in &exp.metrics {
                let formula = metric
                    .formula()
                    .bind(|column| header.position(column))
                    .map_err(|counter| SessionError::MetricEvaluation {
                        metric: metric.name().to_string(),
                        experiment: exp_idx,
                        reason: format!(
                            "column '{counter}' is not reported by the monitoring command"
                        ),
                    })?;
                bound.push((metric.name().to_string(), formula));
            }
            experiments.push(bound);
        }

        Ok(RowParser {
            nsample,
            subject,
            expid,
            experiments,
        })
    }

    pub fn parse(&self, line: &str) -> Result<RowSample, RowError> {
        let fields: SmallVec<[&str; 16]> = line.split_whitespace().collect();
        let field = |pos: usize, name: &'static str| {
            fields
                .get(pos)
                .copied()
                .ok_or(RowError::MissingField(name))
        };

        let nsample = field(self.nsample, SAMPLE_COLUMN)?;
        let subject = field(self.subject, "subject")?;

        let experiment = match self.expid {
            Some(pos) => {
                let raw = field(pos, EXPERIMENT_COLUMN)?;
                raw.parse::<usize>()
                    .ok()
                    .filter(|idx| *idx < self.experiments.len())
                    .ok_or_else(|| RowError::InvalidExperiment(raw.to_string()))?
            }
            None => 0,
        };

        let mut values = SmallVec::new();
        if let Some(metrics) = self.experiments.get(experiment) {
            for (name, formula) in metrics {
                let value = match formula.evaluate(&fields) {
                    Ok(value) => value,
                    Err(EvalError::DivideByZero) => 0.0,
                    Err(source) => {
                        return Err(RowError::Metric {
                            metric: name.clone(),
                            source,
                        })
                    }
                };
                values.push(value);
            }
        }

        Ok(RowSample {
            nsample: nsample.to_string(),
            subject: subject.to_string(),
            experiment,
            values,
        })
    }
}
