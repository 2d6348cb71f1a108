pub mod arith_parser;

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize, de};
use thiserror::Error;

pub use arith_parser::{BoundFormula, Counter, EvalError, Formula, FormulaError};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read session file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid session description: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Formula(#[from] FormulaError),
}

/// Where the monitoring command runs.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Machine {
    #[default]
    Local,
    Ssh(SshTarget),
    Adb(AdbTarget),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SshTarget {
    pub address: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub key_path: Option<PathBuf>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdbTarget {
    pub address: String,
    #[serde(default = "default_adb_port")]
    pub port: u16,
}

const fn default_ssh_port() -> u16 {
    22
}

const fn default_adb_port() -> u16 {
    5037
}

impl Machine {
    pub fn is_remote(&self) -> bool {
        !matches!(self, Machine::Local)
    }

    /// Short label used in log banners and log file names.
    pub fn label(&self) -> &str {
        match self {
            Machine::Local => "local",
            Machine::Ssh(target) => &target.address,
            Machine::Adb(target) => &target.address,
        }
    }
}

/// Raw event code, written as a `0x`-prefixed hexadecimal string.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventCode(pub u64);

impl Serialize for EventCode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serialize_hex(&self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for EventCode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserialize_hex(deserializer).map(EventCode)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HwEvent {
    pub counter: u32,
    /// Fixed-function counters take no event code.
    #[serde(default)]
    pub fixed: bool,
    #[serde(default)]
    pub code: Option<EventCode>,
    /// Extra per-counter flags such as `umask`, emitted as `<flag><counter>=<value>`.
    #[serde(default)]
    pub flags: BTreeMap<String, String>,
}

/// Event-based sampling: collect after `threshold` occurrences on `counter`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ebs {
    pub counter: u32,
    pub threshold: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(try_from = "MetricDesc", into = "MetricDesc")]
pub struct Metric {
    name: String,
    formula: Formula,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct MetricDesc {
    name: String,
    formula: String,
}

impl TryFrom<MetricDesc> for Metric {
    type Error = FormulaError;

    fn try_from(desc: MetricDesc) -> Result<Self, Self::Error> {
        Metric::new(desc.name, &desc.formula)
    }
}

impl From<Metric> for MetricDesc {
    fn from(metric: Metric) -> Self {
        MetricDesc {
            formula: metric.formula.text().to_string(),
            name: metric.name,
        }
    }
}

impl Metric {
    /// Compiles the formula; this is the only place formula text is parsed.
    pub fn new(name: impl Into<String>, formula: &str) -> Result<Self, FormulaError> {
        Ok(Metric {
            name: name.into(),
            formula: Formula::compile(formula)?,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn formula(&self) -> &Formula {
        &self.formula
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Experiment {
    #[serde(default)]
    pub events: Vec<HwEvent>,
    #[serde(default)]
    pub metrics: Vec<Metric>,
    #[serde(default)]
    pub ebs: Option<Ebs>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CpuBinding {
    Core(u32),
    Mask(String),
}

impl std::fmt::Display for CpuBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CpuBinding::Core(core) => write!(f, "{core}"),
            CpuBinding::Mask(mask) => f.write_str(mask),
        }
    }
}

/// A monitoring target: a program to launch, or a process that already runs.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Application {
    Launch(Vec<String>),
    Attach(u32),
}

impl Application {
    /// Program file name followed by its arguments, or `pid<N>` for attached processes.
    pub fn name(&self) -> String {
        match self {
            Application::Launch(args) => {
                let mut parts = args.iter();
                let program = parts
                    .next()
                    .map(|path| path.rsplit('/').next().unwrap_or(path).to_string())
                    .unwrap_or_default();
                std::iter::once(program)
                    .chain(parts.cloned())
                    .collect::<Vec<_>>()
                    .join(" ")
            }
            Application::Attach(pid) => format!("pid{pid}"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogConfig {
    pub directory: PathBuf,
    #[serde(default)]
    pub counters: bool,
    #[serde(default)]
    pub metrics: bool,
}

impl LogConfig {
    pub fn enabled(&self) -> bool {
        self.counters || self.metrics
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    #[serde(default)]
    pub machine: Machine,
    /// Time between samples in milliseconds.
    pub period_ms: u64,
    /// Sample buffer size in bytes, 0 leaves it to the monitoring tool.
    #[serde(default)]
    pub buffer_size: u64,
    #[serde(default)]
    pub system_wide: bool,
    #[serde(default)]
    pub cpu: Option<CpuBinding>,
    pub experiments: Vec<Experiment>,
    #[serde(default)]
    pub virtual_counters: Vec<u32>,
    pub applications: Vec<Application>,
    #[serde(default)]
    pub logs: Option<LogConfig>,
}

impl SessionConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json(&data)
    }

    pub fn from_json(data: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(data)?)
    }

    /// Column label identifying the subject of each sample row.
    pub fn subject_label(&self) -> &'static str {
        if self.system_wide { "cpu" } else { "pid" }
    }

    /// Application names in configuration order; repeated names get a ` (n)` suffix.
    pub fn application_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::with_capacity(self.applications.len());
        for app in &self.applications {
            let base = app.name();
            let mut name = base.clone();
            let mut n = 2;
            while names.contains(&name) {
                name = format!("{base} ({n})");
                n += 1;
            }
            names.push(name);
        }
        names
    }

    /// Number of metrics per experiment, in experiment order.
    pub fn metric_layout(&self) -> Vec<usize> {
        self.experiments.iter().map(|exp| exp.metrics.len()).collect()
    }
}

fn serialize_hex<S>(v: &u64, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    let string = format!("0x{:x}", v);
    serializer.serialize_str(&string)
}

fn deserialize_hex<'a, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'a>,
{
    struct Visitor;

    impl de::Visitor<'_> for Visitor {
        type Value = u64;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a string containing a hexadecimal number starting with '0x'")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            let Some(hex_only) = v.strip_prefix("0x").or_else(|| v.strip_prefix("0X")) else {
                return Err(E::custom("does not start with '0x'"));
            };

            u64::from_str_radix(hex_only, 16).map_err(E::custom)
        }
    }

    deserializer.deserialize_str(Visitor)
}
