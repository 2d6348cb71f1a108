use std::{
    io::{self, BufRead, BufReader, Read},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use pmc_data::{Application, SessionConfig};
use pmc_remote::{Connection, Executor, ProcessHandle, RemoteProcessController, Spawned, Target};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    command::CommandLine,
    logs::{LogContext, LogWriter},
    parser::{rejection_message, Header, RowParser, PID_FOUND},
    store::{ApplicationState, SampleStore},
    ControlError, SessionError,
};

use ApplicationState::*;

const NO_OUTPUT: &str = "monitoring command exited without output";

struct RunningCommand {
    app: usize,
    process: Box<dyn ProcessHandle>,
}

struct Shared {
    id: Uuid,
    config: SessionConfig,
    names: Vec<String>,
    store: Arc<SampleStore>,
    executor: Arc<dyn Executor>,
    controller: Arc<dyn RemoteProcessController>,
    machine: String,
    started: DateTime<Local>,
    running: Mutex<Option<RunningCommand>>,
    kill_requested: AtomicBool,
}

/// One monitoring run over the configured applications.
///
/// A background thread launches the monitoring command for each application
/// in turn and feeds its output into the [`SampleStore`]. Callers poll the
/// store and drive the run with [`Session::stop_monitoring`],
/// [`Session::resume_monitoring`] and [`Session::kill_monitoring`].
pub struct Session {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl Session {
    pub fn start(
        config: SessionConfig,
        executor: Arc<dyn Executor>,
        controller: Arc<dyn RemoteProcessController>,
    ) -> io::Result<Session> {
        let names = config.application_names();
        let store = Arc::new(SampleStore::new(
            &names,
            config.metric_layout(),
            !config.system_wide,
        ));

        let shared = Arc::new(Shared {
            id: Uuid::now_v7(),
            machine: config.machine.label().to_string(),
            config,
            names,
            store,
            executor,
            controller,
            started: Local::now(),
            running: Mutex::new(None),
            kill_requested: AtomicBool::new(false),
        });

        let worker = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("pmc-extract".into())
                .spawn(move || shared.run())?
        };

        Ok(Session {
            shared,
            worker: Some(worker),
        })
    }

    /// Starts a session on the machine named by the configuration.
    pub fn connect(config: SessionConfig) -> io::Result<Session> {
        let connection = Arc::new(Connection::new(config.machine.clone()));
        Session::start(config, connection.clone(), connection)
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn store(&self) -> &Arc<SampleStore> {
        &self.shared.store
    }

    pub fn error(&self) -> Option<SessionError> {
        self.shared.store.error()
    }

    pub fn states(&self) -> Vec<(String, ApplicationState)> {
        self.shared.store.states()
    }

    /// Application whose monitoring command is currently alive.
    pub fn current_application(&self) -> Option<String> {
        self.shared
            .current()
            .map(|app| self.shared.names[app].clone())
    }

    /// Pauses the current application. Does nothing until its PID is known
    /// (per-thread mode), once it is no longer running, or when the subject
    /// has already exited.
    pub fn stop_monitoring(&self) -> Result<(), ControlError> {
        let Some((app, target)) = self.shared.control_target(&[Running, Stopped]) else {
            return Ok(());
        };
        if delivered(target, self.shared.controller.pause(target))? {
            self.shared.store.transition(app, &[Running], Stopped);
        }
        Ok(())
    }

    pub fn resume_monitoring(&self) -> Result<(), ControlError> {
        let Some((app, target)) = self.shared.control_target(&[Running, Stopped]) else {
            return Ok(());
        };
        if delivered(target, self.shared.controller.resume(target))? {
            self.shared.store.transition(app, &[Stopped], Running);
        }
        Ok(())
    }

    /// Kills the monitored program of the current application. The monitoring
    /// command then ends its stream and the batch moves on. Nothing to do in
    /// system-wide mode or before the subject is known.
    pub fn kill_subject(&self) -> Result<(), ControlError> {
        let Some((app, target @ Target::Process(pid))) =
            self.shared.control_target(&[Running, Stopped])
        else {
            return Ok(());
        };
        info!(app = %self.shared.names[app], pid, "killing monitored program");
        delivered(target, self.shared.controller.kill(pid))?;
        Ok(())
    }

    /// Kills the monitoring command itself, which ends its output stream.
    /// Applications that have not started yet are never launched.
    pub fn kill_monitoring(&self) -> Result<(), ControlError> {
        self.shared.kill_requested.store(true, Ordering::SeqCst);

        let mut running = self.shared.running.lock();
        if let Some(command) = running.as_mut() {
            self.shared
                .store
                .transition(command.app, &[Waiting, Running, Stopped], Killed);
            info!(
                app = %self.shared.names[command.app],
                pid = command.process.id(),
                "killing monitoring command"
            );
            command.process.kill()?;
        }
        Ok(())
    }

    /// True once every application has been processed or the batch was abandoned.
    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().map_or(true, |worker| worker.is_finished())
    }

    /// Waits for the extraction thread to process the whole batch.
    pub fn join(mut self) {
        self.join_worker();
    }

    fn join_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!(session = %self.shared.id, "extraction thread panicked");
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.is_finished() {
            if let Err(err) = self.kill_monitoring() {
                warn!(error = %err, "failed to kill monitoring command");
            }
        }
        self.join_worker();
    }
}

/// Whether a directive reached its target. A subject that already exited
/// cannot be signalled, which is not an error; the subsystem switch can fail
/// for real.
fn delivered(target: Target, result: Result<(), pmc_remote::Error>) -> Result<bool, ControlError> {
    match (target, result) {
        (_, Ok(())) => Ok(true),
        (Target::Process(pid), Err(err)) => {
            debug!(pid, error = %err, "subject not signalled");
            Ok(false)
        }
        (Target::SystemWide, Err(err)) => Err(err.into()),
    }
}

impl Shared {
    fn current(&self) -> Option<usize> {
        self.running.lock().as_ref().map(|command| command.app)
    }

    fn control_target(&self, states: &[ApplicationState]) -> Option<(usize, Target)> {
        let app = self.current()?;
        if !states.contains(&self.store.state_at(app)) {
            return None;
        }

        if self.config.system_wide {
            return Some((app, Target::SystemWide));
        }

        let pid = self.store.pid_at(app)?.parse().ok()?;
        Some((app, Target::Process(pid)))
    }

    fn run(&self) {
        info!(
            session = %self.id,
            machine = %self.machine,
            applications = self.names.len(),
            "monitoring session started"
        );

        for (idx, app) in self.config.applications.iter().enumerate() {
            if self.kill_requested.load(Ordering::SeqCst) {
                break;
            }

            match self.monitor(idx, app) {
                Ok(state) => {
                    info!(app = %self.names[idx], %state, "application done");
                    if state == Killed {
                        break;
                    }
                }
                Err(_) if self.kill_requested.load(Ordering::SeqCst) => {
                    self.store.transition(idx, &[Waiting, Running, Stopped], Killed);
                    break;
                }
                Err(err) => {
                    warn!(session = %self.id, app = %self.names[idx], error = %err, "monitoring abandoned");
                    self.store.set_error(err);
                    break;
                }
            }
        }

        info!(session = %self.id, "monitoring session ended");
    }

    fn monitor(&self, idx: usize, app: &Application) -> Result<ApplicationState, SessionError> {
        let command = CommandLine::build(&self.config, app);
        info!(app = %self.names[idx], command = %command, "launching monitoring command");

        let Spawned {
            stdout,
            stderr,
            process,
        } = self
            .executor
            .execute(command.args())
            .map_err(|err| SessionError::Spawn(err.to_string()))?;

        let stderr = drain(stderr);
        self.publish(idx, process);

        let result = self.stream(idx, &command, stdout, stderr);

        let finished = self.running.lock().take();
        if let Some(mut command) = finished {
            if result.is_err() {
                if let Err(err) = command.process.kill() {
                    debug!(error = %err, "monitoring command already gone");
                }
            }
            match command.process.wait() {
                Ok(code) => debug!(app = %self.names[idx], ?code, "monitoring command exited"),
                Err(err) => warn!(app = %self.names[idx], error = %err, "failed to reap monitoring command"),
            }
        }

        match result {
            Ok(()) => Ok(self.store.transition(idx, &[Running, Stopped], Finished)),
            Err(err) => {
                self.store.transition(idx, &[Running, Stopped], Finished);
                Err(err)
            }
        }
    }

    fn publish(&self, app: usize, mut process: Box<dyn ProcessHandle>) {
        let mut running = self.running.lock();
        if self.kill_requested.load(Ordering::SeqCst) {
            if let Err(err) = process.kill() {
                debug!(error = %err, "monitoring command already gone");
            }
        }
        *running = Some(RunningCommand { app, process });
    }

    fn stream(
        &self,
        idx: usize,
        command: &CommandLine,
        stdout: Box<dyn Read + Send>,
        stderr: JoinHandle<String>,
    ) -> Result<(), SessionError> {
        let name = &self.names[idx];
        let mut lines = Lines::new(stdout);

        let mut first = lines.next_line()?;
        if first.as_deref().is_some_and(|line| line.contains(PID_FOUND)) {
            first = lines.next_line()?;
        }

        let Some(header_line) = first else {
            let stderr = stderr.join().unwrap_or_default();
            let message = rejection_message(stderr.trim());
            return Err(SessionError::HeaderRejected(if message.is_empty() {
                NO_OUTPUT.to_string()
            } else {
                message
            }));
        };

        let header = Header::parse(&header_line, self.config.subject_label())?;
        let parser = RowParser::new(&header, &self.config)?;
        self.store.transition(idx, &[Waiting], Running);
        info!(app = %name, columns = header.len(), "header accepted");

        let mut logs = self
            .config
            .logs
            .as_ref()
            .filter(|logs| logs.enabled())
            .map(|logs| {
                let command = command.to_string();
                LogWriter::open(
                    logs,
                    &self.config,
                    &LogContext {
                        app: name,
                        machine: &self.machine,
                        command: &command,
                        header: header.line(),
                        started: &self.started,
                    },
                )
            });

        let result = self.read_rows(idx, &parser, &mut lines, logs.as_mut());

        if let Some(logs) = logs {
            logs.close();
        }
        result
    }

    fn read_rows(
        &self,
        idx: usize,
        parser: &RowParser,
        lines: &mut Lines,
        mut logs: Option<&mut LogWriter>,
    ) -> Result<(), SessionError> {
        let name = &self.names[idx];

        while let Some(line) = lines.next_line()? {
            if line.trim().is_empty() {
                continue;
            }

            if let Some(logs) = logs.as_deref_mut() {
                logs.write_counters(&line);
            }

            match parser.parse(&line) {
                Ok(sample) => {
                    if let Some(logs) = logs.as_deref_mut() {
                        logs.write_metrics(&sample);
                    }
                    if self.store.record(idx, &sample) {
                        info!(app = %name, subject = %sample.subject, "new subject");
                    }
                }
                Err(err) => {
                    warn!(app = %name, error = %err, line = %line, "skipping malformed row");
                    self.store.count_skipped(idx);
                }
            }
        }

        Ok(())
    }
}

/// Collects the command's stderr so the pipe never fills up. Its text is
/// only used when stdout closes without producing anything.
fn drain(mut stderr: Box<dyn Read + Send>) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = vec![];
        if let Err(err) = stderr.read_to_end(&mut buf) {
            debug!(error = %err, "stderr of monitoring command unreadable");
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

struct Lines {
    reader: BufReader<Box<dyn Read + Send>>,
    buf: Vec<u8>,
}

impl Lines {
    fn new(reader: Box<dyn Read + Send>) -> Self {
        Lines {
            reader: BufReader::new(reader),
            buf: Vec::with_capacity(256),
        }
    }

    /// Next line without its terminator, `None` at end of stream.
    fn next_line(&mut self) -> Result<Option<String>, SessionError> {
        self.buf.clear();
        let read = self
            .reader
            .read_until(b'\n', &mut self.buf)
            .map_err(|err| SessionError::StreamIo(err.to_string()))?;
        if read == 0 {
            return Ok(None);
        }

        let line = String::from_utf8_lossy(&self.buf);
        Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
    }
}
