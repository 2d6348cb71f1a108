use std::fmt;

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::{parser::RowSample, SessionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplicationState {
    Waiting,
    Running,
    Stopped,
    Killed,
    Finished,
}

impl ApplicationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ApplicationState::Killed | ApplicationState::Finished)
    }
}

impl fmt::Display for ApplicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ApplicationState::Waiting => "waiting",
            ApplicationState::Running => "running",
            ApplicationState::Stopped => "stopped",
            ApplicationState::Killed => "killed",
            ApplicationState::Finished => "finished",
        })
    }
}

/// Samples of one subject, indexed `[experiment][metric][sample]`.
#[derive(Debug, Clone)]
pub struct SubjectSeries {
    key: String,
    samples: Vec<Vec<Vec<f64>>>,
}

impl SubjectSeries {
    fn new(key: &str, layout: &[usize]) -> Self {
        SubjectSeries {
            key: key.to_string(),
            samples: layout.iter().map(|&n| vec![vec![]; n]).collect(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn series(&self, experiment: usize, metric: usize) -> Option<&[f64]> {
        self.samples
            .get(experiment)?
            .get(metric)
            .map(|values| values.as_slice())
    }
}

/// Everything observed for one application of the batch.
#[derive(Debug, Clone)]
pub struct ApplicationRun {
    name: String,
    state: ApplicationState,
    pid: Option<String>,
    subjects: Vec<SubjectSeries>,
    index: HashMap<String, usize>,
    rows: u64,
    skipped_rows: u64,
}

impl ApplicationRun {
    fn new(name: &str) -> Self {
        ApplicationRun {
            name: name.to_string(),
            state: ApplicationState::Waiting,
            pid: None,
            subjects: vec![],
            index: HashMap::new(),
            rows: 0,
            skipped_rows: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ApplicationState {
        self.state
    }

    /// First subject seen in per-thread mode.
    pub fn pid(&self) -> Option<&str> {
        self.pid.as_deref()
    }

    /// Subjects in the order they first appeared.
    pub fn subjects(&self) -> &[SubjectSeries] {
        &self.subjects
    }

    pub fn subject(&self, key: &str) -> Option<&SubjectSeries> {
        self.index.get(key).map(|&i| &self.subjects[i])
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn skipped_rows(&self) -> u64 {
        self.skipped_rows
    }
}

struct StoreInner {
    apps: Vec<ApplicationRun>,
    error: Option<SessionError>,
}

/// Samples and application states of a session.
///
/// The extraction thread is the only writer apart from control requests,
/// which apply state transitions. Readers copy what they need under a short
/// read lock.
pub struct SampleStore {
    layout: Vec<usize>,
    per_thread: bool,
    inner: RwLock<StoreInner>,
}

impl SampleStore {
    pub fn new(names: &[String], layout: Vec<usize>, per_thread: bool) -> Self {
        SampleStore {
            layout,
            per_thread,
            inner: RwLock::new(StoreInner {
                apps: names.iter().map(|name| ApplicationRun::new(name)).collect(),
                error: None,
            }),
        }
    }

    pub fn applications(&self) -> Vec<String> {
        self.inner
            .read()
            .apps
            .iter()
            .map(|app| app.name.clone())
            .collect()
    }

    pub fn state(&self, app: &str) -> Option<ApplicationState> {
        self.with_application(app, |run| run.state)
    }

    pub fn states(&self) -> Vec<(String, ApplicationState)> {
        self.inner
            .read()
            .apps
            .iter()
            .map(|app| (app.name.clone(), app.state))
            .collect()
    }

    pub fn subjects(&self, app: &str) -> Vec<String> {
        self.with_application(app, |run| {
            run.subjects.iter().map(|s| s.key.clone()).collect()
        })
        .unwrap_or_default()
    }

    pub fn samples(
        &self,
        app: &str,
        subject: &str,
        experiment: usize,
        metric: usize,
    ) -> Option<Vec<f64>> {
        self.with_application(app, |run| {
            run.subject(subject)?
                .series(experiment, metric)
                .map(|values| values.to_vec())
        })
        .flatten()
    }

    /// Samples appended after the first `from` ones.
    pub fn samples_since(
        &self,
        app: &str,
        subject: &str,
        experiment: usize,
        metric: usize,
        from: usize,
    ) -> Vec<f64> {
        self.with_application(app, |run| {
            run.subject(subject)
                .and_then(|s| s.series(experiment, metric))
                .and_then(|values| values.get(from..))
                .map(|values| values.to_vec())
        })
        .flatten()
        .unwrap_or_default()
    }

    /// Copy of one application's data.
    pub fn snapshot(&self, app: &str) -> Option<ApplicationRun> {
        self.with_application(app, |run| run.clone())
    }

    pub fn with_application<T>(&self, app: &str, f: impl FnOnce(&ApplicationRun) -> T) -> Option<T> {
        let inner = self.inner.read();
        inner.apps.iter().find(|run| run.name == app).map(f)
    }

    pub fn error(&self) -> Option<SessionError> {
        self.inner.read().error.clone()
    }

    pub(crate) fn state_at(&self, app: usize) -> ApplicationState {
        self.inner.read().apps[app].state
    }

    pub(crate) fn pid_at(&self, app: usize) -> Option<String> {
        self.inner.read().apps[app].pid.clone()
    }

    /// Moves `app` to `to` if it currently is in one of `from`. Returns the
    /// resulting state.
    pub(crate) fn transition(
        &self,
        app: usize,
        from: &[ApplicationState],
        to: ApplicationState,
    ) -> ApplicationState {
        let mut inner = self.inner.write();
        let run = &mut inner.apps[app];
        if from.contains(&run.state) {
            run.state = to;
        }
        run.state
    }

    /// Appends one evaluated row. Returns true if the row introduced a new subject.
    pub(crate) fn record(&self, app: usize, sample: &RowSample) -> bool {
        let mut inner = self.inner.write();
        let run = &mut inner.apps[app];
        run.rows += 1;

        let (slot, is_new) = match run.index.get(sample.subject.as_str()) {
            Some(&slot) => (slot, false),
            None => {
                if self.per_thread && run.pid.is_none() {
                    run.pid = Some(sample.subject.clone());
                }
                run.subjects
                    .push(SubjectSeries::new(&sample.subject, &self.layout));
                let slot = run.subjects.len() - 1;
                run.index.insert(sample.subject.clone(), slot);
                (slot, true)
            }
        };

        if let Some(metrics) = run.subjects[slot].samples.get_mut(sample.experiment) {
            for (series, value) in metrics.iter_mut().zip(sample.values.iter()) {
                series.push(*value);
            }
        }

        is_new
    }

    pub(crate) fn count_skipped(&self, app: usize) {
        self.inner.write().apps[app].skipped_rows += 1;
    }

    /// Keeps the first error; later ones are dropped.
    pub(crate) fn set_error(&self, error: SessionError) {
        let mut inner = self.inner.write();
        if inner.error.is_none() {
            inner.error = Some(error);
        }
    }
}
