use std::{
    collections::VecDeque,
    io::{self, Cursor, Read},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{channel, Receiver, Sender},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use pmc_data::{Metric, SessionConfig};
use pmc_extract::{ApplicationState, Session, SessionError};
use pmc_remote::{Error, Executor, ProcessHandle, RemoteProcessController, Spawned, Target};

use ApplicationState::*;

/// Output stream of a scripted command, fed line by line from the test.
#[derive(Clone)]
struct Feed {
    tx: Arc<Mutex<Option<Sender<Vec<u8>>>>>,
}

impl Feed {
    fn line(&self, line: &str) -> &Self {
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(format!("{line}\n").into_bytes());
        }
        self
    }

    fn close(&self) {
        self.tx.lock().take();
    }
}

struct ChannelReader {
    rx: Receiver<Vec<u8>>,
    chunk: Cursor<Vec<u8>>,
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let n = self.chunk.read(buf)?;
            if n > 0 {
                return Ok(n);
            }
            match self.rx.recv() {
                Ok(chunk) => self.chunk = Cursor::new(chunk),
                Err(_) => return Ok(0),
            }
        }
    }
}

fn feed() -> (Feed, ChannelReader) {
    let (tx, rx) = channel();
    (
        Feed {
            tx: Arc::new(Mutex::new(Some(tx))),
        },
        ChannelReader {
            rx,
            chunk: Cursor::new(vec![]),
        },
    )
}

struct FakeProcess {
    feed: Feed,
    killed: Arc<Mutex<bool>>,
    exit: Option<Receiver<()>>,
    reaping: Arc<AtomicBool>,
}

impl ProcessHandle for FakeProcess {
    fn id(&self) -> u32 {
        4000
    }

    fn kill(&mut self) -> io::Result<()> {
        *self.killed.lock() = true;
        self.feed.close();
        Ok(())
    }

    fn wait(&mut self) -> io::Result<Option<i32>> {
        self.reaping.store(true, Ordering::SeqCst);
        if let Some(exit) = self.exit.take() {
            let _ = exit.recv();
        }
        Ok(Some(0))
    }
}

struct Script {
    feed: Feed,
    stdout: ChannelReader,
    stderr: String,
}

#[derive(Default)]
struct ScriptedExecutor {
    scripts: Mutex<VecDeque<Script>>,
    commands: Mutex<Vec<String>>,
    killed: Arc<Mutex<bool>>,
    exit: Mutex<Option<Receiver<()>>>,
    reaping: Arc<AtomicBool>,
}

impl ScriptedExecutor {
    /// Queues the output of the next command and returns its live feed.
    fn script(&self, stderr: &str) -> Feed {
        let (feed, stdout) = feed();
        self.scripts.lock().push_back(Script {
            feed: feed.clone(),
            stdout,
            stderr: stderr.to_string(),
        });
        feed
    }

    fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    fn killed(&self) -> bool {
        *self.killed.lock()
    }

    /// Makes the next command block in `wait` until the returned sender fires.
    fn hold_exit(&self) -> Sender<()> {
        let (tx, rx) = channel();
        *self.exit.lock() = Some(rx);
        tx
    }

    fn reaping(&self) -> bool {
        self.reaping.load(Ordering::SeqCst)
    }
}

impl Executor for ScriptedExecutor {
    fn execute(&self, command: &[String]) -> Result<Spawned, Error> {
        self.commands.lock().push(command.join(" "));
        let script = self.scripts.lock().pop_front().ok_or(Error::EmptyCommand)?;

        Ok(Spawned {
            stdout: Box::new(script.stdout),
            stderr: Box::new(Cursor::new(script.stderr.into_bytes())),
            process: Box::new(FakeProcess {
                feed: script.feed,
                killed: self.killed.clone(),
                exit: self.exit.lock().take(),
                reaping: self.reaping.clone(),
            }),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Directive {
    Pause(Target),
    Resume(Target),
    Kill(u32),
}

#[derive(Default)]
struct RecordingController {
    directives: Mutex<Vec<Directive>>,
}

impl RecordingController {
    fn directives(&self) -> Vec<Directive> {
        self.directives.lock().clone()
    }
}

impl RemoteProcessController for RecordingController {
    fn pause(&self, target: Target) -> Result<(), Error> {
        self.directives.lock().push(Directive::Pause(target));
        Ok(())
    }

    fn resume(&self, target: Target) -> Result<(), Error> {
        self.directives.lock().push(Directive::Resume(target));
        Ok(())
    }

    fn kill(&self, pid: u32) -> Result<(), Error> {
        self.directives.lock().push(Directive::Kill(pid));
        Ok(())
    }
}

/// Controller for a subject that has already exited.
struct GoneController;

impl GoneController {
    fn gone() -> Error {
        Error::Io(io::Error::new(io::ErrorKind::NotFound, "No such process"))
    }
}

impl RemoteProcessController for GoneController {
    fn pause(&self, _: Target) -> Result<(), Error> {
        Err(GoneController::gone())
    }

    fn resume(&self, _: Target) -> Result<(), Error> {
        Err(GoneController::gone())
    }

    fn kill(&self, _: u32) -> Result<(), Error> {
        Err(GoneController::gone())
    }
}

fn config(extra: &str) -> SessionConfig {
    let json = format!(
        r#"{{
            "period_ms": 1000,
            "experiments": [
                {{
                    "events": [ {{ "counter": 0, "fixed": true }}, {{ "counter": 1, "fixed": true }} ],
                    "metrics": [ {{ "name": "IPC", "formula": "pmc1 / pmc0" }} ]
                }}
            ],
            {extra}
        }}"#
    );
    SessionConfig::from_json(&json).unwrap()
}

fn one_app() -> SessionConfig {
    config(r#""applications": [ { "launch": ["./bench"] } ]"#)
}

fn two_apps() -> SessionConfig {
    config(r#""applications": [ { "launch": ["./bench", "-n", "1"] }, { "attach": 812 } ]"#)
}

/// Starts a session once every command output has been scripted.
fn start(
    config: SessionConfig,
    executor: &Arc<ScriptedExecutor>,
) -> (Session, Arc<RecordingController>) {
    let controller = Arc::new(RecordingController::default());
    let session = Session::start(config, executor.clone(), controller.clone()).unwrap();
    (session, controller)
}

fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

const HEADER: &str = "nsample    pid      event          pmc0          pmc1";

#[test]
fn pause_resume_and_finish() {
    let executor = Arc::new(ScriptedExecutor::default());
    let out = executor.script("");
    let (session, controller) = start(one_app(), &executor);
    let store = session.store().clone();

    assert_eq!(store.state("bench"), Some(Waiting));
    // Nothing to signal before the header and the first subject arrive.
    session.stop_monitoring().unwrap();
    assert!(controller.directives().is_empty());

    out.line(HEADER).line("1 100 tick 1000 2500");
    wait_until("first sample", || !store.subjects("bench").is_empty());
    assert_eq!(store.state("bench"), Some(Running));
    assert_eq!(session.current_application().as_deref(), Some("bench"));

    session.stop_monitoring().unwrap();
    assert_eq!(store.state("bench"), Some(Stopped));
    session.resume_monitoring().unwrap();
    assert_eq!(store.state("bench"), Some(Running));
    assert_eq!(
        controller.directives(),
        vec![
            Directive::Pause(Target::Process(100)),
            Directive::Resume(Target::Process(100))
        ]
    );

    out.line("2 100 tick 1000 500");
    out.close();
    session.join();

    assert_eq!(store.state("bench"), Some(Finished));
    assert_eq!(store.samples("bench", "100", 0, 0), Some(vec![2.5, 0.5]));
    assert_eq!(store.error(), None);
    assert!(!executor.killed());
}

#[test]
fn kill_ends_the_batch() {
    let executor = Arc::new(ScriptedExecutor::default());
    let out = executor.script("");
    executor.script("");
    let (session, _) = start(two_apps(), &executor);
    let store = session.store().clone();

    out.line(HEADER).line("1 100 tick 10 20");
    wait_until("first sample", || !store.subjects("bench -n 1").is_empty());

    session.kill_monitoring().unwrap();
    session.join();

    assert!(executor.killed());
    assert_eq!(
        store.states(),
        vec![
            ("bench -n 1".to_string(), Killed),
            ("pid812".to_string(), Waiting)
        ]
    );
    assert_eq!(executor.commands().len(), 1);
    assert_eq!(store.error(), None);
}

#[test]
fn rejected_header_is_the_session_error() {
    let executor = Arc::new(ScriptedExecutor::default());
    executor
        .script("")
        .line("pmctrack: Can't open /proc/pmc/config")
        .close();
    executor.script("").line(HEADER).close();
    let (session, _) = start(two_apps(), &executor);
    let store = session.store().clone();
    session.join();

    assert_eq!(
        store.error(),
        Some(SessionError::HeaderRejected(
            "Can't open /proc/pmc/config".into()
        ))
    );
    assert_eq!(store.state("bench -n 1"), Some(Waiting));
    assert!(store.subjects("bench -n 1").is_empty());
    assert_eq!(executor.commands().len(), 1);
}

#[test]
fn stderr_explains_silent_commands() {
    let executor = Arc::new(ScriptedExecutor::default());
    executor
        .script("ssh: connect to host board.lan port 22: Connection refused\n")
        .close();
    let (session, _) = start(one_app(), &executor);
    let store = session.store().clone();
    session.join();

    assert_eq!(
        store.error(),
        Some(SessionError::HeaderRejected(
            "ssh: connect to host board.lan port 22: Connection refused".into()
        ))
    );
}

#[test]
fn missing_command_is_a_spawn_error() {
    let executor = Arc::new(ScriptedExecutor::default());
    let (session, _) = start(one_app(), &executor);
    let store = session.store().clone();
    session.join();

    assert!(matches!(store.error(), Some(SessionError::Spawn(_))));
    assert_eq!(store.state("bench"), Some(Waiting));
}

#[test]
fn interleaved_subjects_stay_apart() {
    let executor = Arc::new(ScriptedExecutor::default());
    executor
        .script("")
        .line("PID found")
        .line(HEADER)
        .line("1 100 tick 10 10")
        .line("1 200 tick 10 20")
        .line("2 100 tick 10 30")
        .line("")
        .line("2 200 tick 10 40")
        .line("3 200 tick 0 40")
        .close();
    let (session, _) = start(one_app(), &executor);
    let store = session.store().clone();
    session.join();

    let run = store.snapshot("bench").unwrap();
    assert_eq!(run.state(), Finished);
    assert_eq!(run.pid(), Some("100"));
    assert_eq!(store.subjects("bench"), vec!["100", "200"]);
    assert_eq!(store.samples("bench", "100", 0, 0), Some(vec![1.0, 3.0]));
    assert_eq!(store.samples("bench", "200", 0, 0), Some(vec![2.0, 4.0, 0.0]));
    assert_eq!(run.rows(), 5);
    assert_eq!(run.skipped_rows(), 0);
}

#[test]
fn malformed_rows_are_skipped() {
    let executor = Arc::new(ScriptedExecutor::default());
    executor
        .script("")
        .line(HEADER)
        .line("1 100 tick 10 n/a")
        .line("2 100")
        .line("3 100 tick 10 50")
        .close();
    let (session, _) = start(one_app(), &executor);
    let store = session.store().clone();
    session.join();

    let run = store.snapshot("bench").unwrap();
    assert_eq!(run.skipped_rows(), 2);
    assert_eq!(store.samples("bench", "100", 0, 0), Some(vec![5.0]));
    assert_eq!(store.error(), None);
}

#[test]
fn applications_run_in_order() {
    let executor = Arc::new(ScriptedExecutor::default());
    executor.script("").line(HEADER).line("1 100 tick 1 2").close();
    executor.script("").line(HEADER).line("1 812 tick 4 2").close();
    let (session, _) = start(two_apps(), &executor);
    let store = session.store().clone();
    session.join();

    assert_eq!(
        executor.commands(),
        vec![
            "pmctrack -L -r -T 1.00 -c pmc0,pmc1 ./bench -n 1",
            "pmctrack -L -r -T 1.00 -c pmc0,pmc1 -p 812"
        ]
    );
    assert_eq!(
        store.states(),
        vec![
            ("bench -n 1".to_string(), Finished),
            ("pid812".to_string(), Finished)
        ]
    );
    assert_eq!(store.samples("pid812", "812", 0, 0), Some(vec![0.5]));
}

#[test]
fn unreported_counter_aborts_the_session() {
    let mut cfg = config(
        r#""virtual_counters": [0],
           "applications": [ { "launch": ["./bench"] } ]"#,
    );
    cfg.experiments[0]
        .metrics
        .push(Metric::new("VIRT", "virt0 * 2").unwrap());

    let executor = Arc::new(ScriptedExecutor::default());
    executor.script("").line(HEADER);
    let (session, _) = start(cfg, &executor);
    let store = session.store().clone();
    session.join();

    assert!(executor.killed());
    assert!(matches!(
        store.error(),
        Some(SessionError::MetricEvaluation { metric, experiment: 0, .. }) if metric == "VIRT"
    ));
    assert_eq!(store.state("bench"), Some(Waiting));
}

#[test]
fn system_wide_pause_targets_the_subsystem() {
    let cfg = config(
        r#""system_wide": true,
           "applications": [ { "launch": ["./bench"] } ]"#,
    );
    let executor = Arc::new(ScriptedExecutor::default());
    let out = executor.script("");
    let (session, controller) = start(cfg, &executor);
    let store = session.store().clone();

    out.line("nsample    cpu      event          pmc0          pmc1")
        .line("1 0 tick 10 10")
        .line("1 1 tick 10 30");
    wait_until("both cpus", || store.subjects("bench").len() == 2);

    session.stop_monitoring().unwrap();
    session.resume_monitoring().unwrap();
    assert_eq!(
        controller.directives(),
        vec![
            Directive::Pause(Target::SystemWide),
            Directive::Resume(Target::SystemWide)
        ]
    );
    assert_eq!(store.snapshot("bench").unwrap().pid(), None);

    out.close();
    session.join();
    assert_eq!(store.samples("bench", "1", 0, 0), Some(vec![3.0]));
}

#[test]
fn logs_mirror_the_stream() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&format!(
        r#""applications": [ {{ "launch": ["./bench"] }} ],
           "logs": {{ "directory": {:?}, "counters": true, "metrics": true }}"#,
        dir.path().display().to_string()
    ));
    let executor = Arc::new(ScriptedExecutor::default());
    executor
        .script("")
        .line(HEADER)
        .line("1 100 tick 1000 2500")
        .close();
    let (session, _) = start(cfg, &executor);
    session.join();

    let mut names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names.len(), 2);
    assert!(names[0].starts_with("pmcview_bench_local_") && names[0].ends_with("_counters.log"));
    assert!(names[1].ends_with("_metrics.log"));

    let counters = std::fs::read_to_string(dir.path().join(&names[0])).unwrap();
    assert!(counters.ends_with(&format!("{HEADER}\n1 100 tick 1000 2500\n")));

    let metrics = std::fs::read_to_string(dir.path().join(&names[1])).unwrap();
    assert!(metrics.contains("IPC = pmc1 / pmc0 [Experiment 1]\n"));
    assert!(metrics.ends_with(&format!("{:>7} {:>6} {:>13} \n", "1", "100", "2.500")));
}

#[test]
fn dropping_a_session_kills_its_command() {
    let executor = Arc::new(ScriptedExecutor::default());
    executor.script("").line(HEADER);
    let (session, _) = start(one_app(), &executor);
    let store = session.store().clone();
    wait_until("header", || store.state("bench") == Some(Running));

    drop(session);
    assert!(executor.killed());
    assert_eq!(store.state("bench"), Some(Killed));
}

#[test]
fn exited_subject_ignores_pause_and_resume() {
    let executor = Arc::new(ScriptedExecutor::default());
    let out = executor.script("");
    let session =
        Session::start(one_app(), executor.clone(), Arc::new(GoneController)).unwrap();
    let store = session.store().clone();

    out.line(HEADER).line("1 100 tick 10 20");
    wait_until("first sample", || !store.subjects("bench").is_empty());

    session.stop_monitoring().unwrap();
    assert_eq!(store.state("bench"), Some(Running));
    session.resume_monitoring().unwrap();
    session.kill_subject().unwrap();
    assert_eq!(store.state("bench"), Some(Running));

    out.close();
    session.join();
    assert_eq!(store.state("bench"), Some(Finished));
    assert_eq!(store.error(), None);
}

#[test]
fn failed_subsystem_switch_is_reported() {
    let cfg = config(
        r#""system_wide": true,
           "applications": [ { "launch": ["./bench"] } ]"#,
    );
    let executor = Arc::new(ScriptedExecutor::default());
    let out = executor.script("");
    let session = Session::start(cfg, executor.clone(), Arc::new(GoneController)).unwrap();
    let store = session.store().clone();

    out.line("nsample    cpu      event          pmc0          pmc1")
        .line("1 0 tick 10 10");
    wait_until("first cpu", || !store.subjects("bench").is_empty());

    assert!(session.stop_monitoring().is_err());
    assert_eq!(store.state("bench"), Some(Running));

    out.close();
    session.join();
}

#[test]
fn kill_subject_targets_the_monitored_program() {
    let executor = Arc::new(ScriptedExecutor::default());
    let out = executor.script("");
    let (session, controller) = start(one_app(), &executor);
    let store = session.store().clone();

    // Unknown subject yet.
    session.kill_subject().unwrap();
    assert!(controller.directives().is_empty());

    out.line(HEADER).line("1 100 tick 10 20");
    wait_until("first sample", || !store.subjects("bench").is_empty());
    session.kill_subject().unwrap();
    assert_eq!(controller.directives(), vec![Directive::Kill(100)]);

    out.close();
    session.join();
    assert_eq!(store.state("bench"), Some(Finished));
    assert!(!executor.killed());
}

#[test]
fn controls_stay_responsive_while_the_command_is_reaped() {
    let executor = Arc::new(ScriptedExecutor::default());
    let exit = executor.hold_exit();
    executor
        .script("")
        .line(HEADER)
        .line("1 100 tick 10 20")
        .close();
    let (session, _) = start(one_app(), &executor);
    let store = session.store().clone();
    wait_until("reaping", || executor.reaping());

    let (tx, rx) = channel();
    thread::scope(|scope| {
        let session = &session;
        scope.spawn(move || {
            let current = session.current_application();
            session.stop_monitoring().unwrap();
            session.kill_monitoring().unwrap();
            let _ = tx.send(current);
        });

        let current = rx.recv_timeout(Duration::from_secs(5));
        let _ = exit.send(());
        assert_eq!(current, Ok(None));
    });

    session.join();
    assert_eq!(store.state("bench"), Some(Finished));
}

#[test]
fn same_program_gets_separate_logs() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&format!(
        r#""applications": [ {{ "launch": ["./bench", "-n", "1"] }}, {{ "launch": ["./bench", "-n", "2"] }} ],
           "logs": {{ "directory": {:?}, "counters": true, "metrics": true }}"#,
        dir.path().display().to_string()
    ));
    let executor = Arc::new(ScriptedExecutor::default());
    executor.script("").line(HEADER).line("1 100 tick 10 20").close();
    executor.script("").line(HEADER).line("1 200 tick 10 40").close();
    let (session, _) = start(cfg, &executor);
    let store = session.store().clone();
    session.join();
    assert_eq!(store.error(), None);

    let mut names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names.len(), 4, "{names:?}");

    let counters = |job: &str| {
        let name = names
            .iter()
            .find(|name| {
                name.starts_with(&format!("pmcview_bench_-n_{job}_local_"))
                    && name.ends_with("_counters.log")
            })
            .unwrap();
        std::fs::read_to_string(dir.path().join(name)).unwrap()
    };
    assert!(counters("1").ends_with("1 100 tick 10 20\n"));
    assert!(counters("2").ends_with("1 200 tick 10 40\n"));
}
