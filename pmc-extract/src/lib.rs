//! Live extraction of hardware counter samples from the `pmctrack`
//! monitoring command.

mod command;
mod error;
mod logs;
mod parser;
mod session;
mod store;

pub use command::{experiment_spec, CommandLine, MONITOR_PROGRAM};
pub use error::{ControlError, SessionError};
pub use logs::{banner, format_metrics_row, log_file_name, metrics_legend, LogContext, LogKind, LogWriter};
pub use parser::{rejection_message, Header, RowError, RowParser, RowSample};
pub use session::Session;
pub use store::{ApplicationRun, ApplicationState, SampleStore, SubjectSeries};
