//! Streaming gateway: runs a named pipeline stage as a subprocess and streams
//! its output as ordered events.
//!
//! Each [`StageRunner::open`] creates an independent session:
//!
//! ```text
//! running ──(stdout+stderr at EOF)──▶ draining ──(exit status)──▶ closed
//!    │                                    │
//!    └────────(consumer gone: kill)───────┴──────────────────────▶ closed
//! ```
//!
//! The event sequence is finite and ends with exactly one
//! [`StageEvent::Done`]. Dropping or cancelling the [`StageStream`] before
//! `Done` kills the subprocess.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::str::FromStr;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use mcpinsider_shared::{InsiderError, Result, StagesConfig};

const READ_BUF_SIZE: usize = 4096;

/// Exit code reported when the subprocess was terminated by a signal.
pub const SIGNAL_EXIT_CODE: i32 = -1;

// ---------------------------------------------------------------------------
// Stage names
// ---------------------------------------------------------------------------

/// A named, independently invocable pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Collect,
    Analyze,
    Deploy,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Collect, Stage::Analyze, Stage::Deploy];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Collect => "collect",
            Self::Analyze => "analyze",
            Self::Deploy => "deploy",
        }
    }

    /// Append-only log file the stage tees into, relative to the data dir.
    pub fn log_file_name(&self) -> Option<&'static str> {
        match self {
            Self::Collect => Some("collector.log"),
            Self::Analyze => Some("analyzer.log"),
            Self::Deploy => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = InsiderError;

    fn from_str(s: &str) -> Result<Self> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| {
                InsiderError::validation(format!(
                    "unknown stage '{s}' (expected collect, analyze or deploy)"
                ))
            })
    }
}

// ---------------------------------------------------------------------------
// Events + sessions
// ---------------------------------------------------------------------------

/// One item of a stage's output sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StageEvent {
    Output { text: String },
    ErrorOutput { text: String },
    Done { code: i32 },
}

impl StageEvent {
    /// Event name used on the wire (SSE `event:` field).
    pub fn name(&self) -> &'static str {
        match self {
            Self::Output { .. } => "output",
            Self::ErrorOutput { .. } => "error_output",
            Self::Done { .. } => "done",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// The subprocess is producing output.
    Running,
    /// Both pipes reached EOF; waiting for the exit status.
    Draining,
    Closed,
}

/// Consumer side of one stage session.
pub struct StageStream {
    session_id: Uuid,
    stage: Stage,
    pid: Option<u32>,
    rx: mpsc::UnboundedReceiver<StageEvent>,
    state: watch::Receiver<SessionState>,
    finished: bool,
}

impl StageStream {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// OS process id of the subprocess, if it was still known at spawn.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn session_state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Next event, or `None` after `Done` or cancellation.
    pub async fn next(&mut self) -> Option<StageEvent> {
        if self.finished {
            return None;
        }
        let event = self.rx.recv().await;
        if matches!(event, Some(StageEvent::Done { .. }) | None) {
            self.finished = true;
        }
        event
    }

    /// Stop consuming. A still-running subprocess is killed and no further
    /// events are observable.
    pub fn cancel(&mut self) {
        self.finished = true;
        self.rx.close();
    }

    /// Wait until the session reaches [`SessionState::Closed`].
    pub async fn closed(&mut self) {
        // A dropped sender means the pump task is gone, which is also closed.
        let _ = self.state.wait_for(|s| *s == SessionState::Closed).await;
    }

    /// Adapt into a `Stream`; dropping the stream cancels the session.
    pub fn into_stream(self) -> impl Stream<Item = StageEvent> + Send {
        futures::stream::unfold(self, |mut session| async move {
            let event = session.next().await?;
            Some((event, session))
        })
    }
}

// ---------------------------------------------------------------------------
// Command table
// ---------------------------------------------------------------------------

/// Program + arguments for one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl StageCommand {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Build from an argv array; the first element is the program.
    pub fn from_argv(argv: &[String]) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| InsiderError::config("stage command is empty"))?;
        Ok(Self::new(program.clone(), args.iter().cloned()))
    }
}

/// Fixed stage → command table.
#[derive(Debug, Clone)]
pub struct StageMap {
    commands: HashMap<Stage, StageCommand>,
    working_dir: Option<PathBuf>,
}

impl StageMap {
    /// Commands from `[stages]`, falling back to this binary's own
    /// `collect`/`analyze` subcommands and `./deploy.sh`.
    pub fn from_config(stages: &StagesConfig, exe: &Path, config_path: &Path) -> Result<Self> {
        let own = |sub: &str| {
            StageCommand::new(
                exe.display().to_string(),
                ["--config".to_string(), config_path.display().to_string(), sub.to_string()],
            )
        };

        let pick = |configured: &Option<Vec<String>>, default: StageCommand| match configured {
            Some(argv) => StageCommand::from_argv(argv),
            None => Ok(default),
        };

        let mut commands = HashMap::new();
        commands.insert(Stage::Collect, pick(&stages.collect, own("collect"))?);
        commands.insert(Stage::Analyze, pick(&stages.analyze, own("analyze"))?);
        commands.insert(
            Stage::Deploy,
            pick(&stages.deploy, StageCommand::new("./deploy.sh", Vec::<String>::new()))?,
        );

        Ok(Self {
            commands,
            working_dir: stages.working_dir.clone(),
        })
    }

    /// Replace the command for one stage.
    pub fn with_command(mut self, stage: Stage, command: StageCommand) -> Self {
        self.commands.insert(stage, command);
        self
    }

    pub fn command(&self, stage: Stage) -> Option<&StageCommand> {
        self.commands.get(&stage)
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Opens stage sessions.
#[async_trait]
pub trait StageRunner: Send + Sync {
    async fn open(&self, stage: Stage) -> Result<StageStream>;
}

/// Validate `name` and open a session. Nothing is spawned for an unknown name.
pub async fn open_stage(runner: &dyn StageRunner, name: &str) -> Result<StageStream> {
    let stage: Stage = name.parse()?;
    runner.open(stage).await
}

/// Runs stages as local subprocesses.
pub struct SubprocessRunner {
    stages: StageMap,
}

impl SubprocessRunner {
    pub fn new(stages: StageMap) -> Self {
        Self { stages }
    }
}

#[async_trait]
impl StageRunner for SubprocessRunner {
    async fn open(&self, stage: Stage) -> Result<StageStream> {
        let cmd = self
            .stages
            .command(stage)
            .ok_or_else(|| InsiderError::Stage(format!("no command configured for {stage}")))?;

        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .env("FORCE_COLOR", "1")
            .env("CLICOLOR_FORCE", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.stages.working_dir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|e| InsiderError::Stage(format!("failed to start {stage} ({}): {e}", cmd.program)))?;
        let pid = child.id();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| InsiderError::Stage(format!("{stage}: stdout not captured")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| InsiderError::Stage(format!("{stage}: stderr not captured")))?;

        let session_id = Uuid::now_v7();
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Running);

        info!(%stage, %session_id, ?pid, program = %cmd.program, "stage started");
        tokio::spawn(pump(
            Session {
                stage,
                session_id,
                tx,
                state: state_tx,
            },
            child,
            stdout,
            stderr,
        ));

        Ok(StageStream {
            session_id,
            stage,
            pid,
            rx,
            state: state_rx,
            finished: false,
        })
    }
}

/// Producer side of a session.
struct Session {
    stage: Stage,
    session_id: Uuid,
    tx: mpsc::UnboundedSender<StageEvent>,
    state: watch::Sender<SessionState>,
}

impl Session {
    /// Returns false once the consumer is gone.
    fn emit(&self, event: StageEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    async fn kill(&self, child: &mut Child) {
        info!(stage = %self.stage, session_id = %self.session_id, "consumer disconnected, killing stage");
        if let Err(e) = child.start_kill() {
            debug!(error = %e, "kill failed, process already exited");
        }
        let _ = child.wait().await;
        self.state.send_replace(SessionState::Closed);
    }
}

fn exit_code(status: std::io::Result<ExitStatus>) -> i32 {
    match status {
        Ok(status) => status.code().unwrap_or(SIGNAL_EXIT_CODE),
        Err(e) => {
            warn!(error = %e, "failed to collect exit status");
            SIGNAL_EXIT_CODE
        }
    }
}

async fn pump(session: Session, mut child: Child, mut stdout: ChildStdout, mut stderr: ChildStderr) {
    let mut out_buf = [0u8; READ_BUF_SIZE];
    let mut err_buf = [0u8; READ_BUF_SIZE];
    let mut out_chunks = Utf8Chunker::default();
    let mut err_chunks = Utf8Chunker::default();
    let mut out_open = true;
    let mut err_open = true;

    while out_open || err_open {
        let delivered = tokio::select! {
            _ = session.tx.closed() => false,
            read = stdout.read(&mut out_buf), if out_open => match read {
                Ok(n) if n > 0 => out_chunks
                    .push(&out_buf[..n])
                    .is_none_or(|text| session.emit(StageEvent::Output { text })),
                _ => {
                    out_open = false;
                    out_chunks
                        .finish()
                        .is_none_or(|text| session.emit(StageEvent::Output { text }))
                }
            },
            read = stderr.read(&mut err_buf), if err_open => match read {
                Ok(n) if n > 0 => err_chunks
                    .push(&err_buf[..n])
                    .is_none_or(|text| session.emit(StageEvent::ErrorOutput { text })),
                _ => {
                    err_open = false;
                    err_chunks
                        .finish()
                        .is_none_or(|text| session.emit(StageEvent::ErrorOutput { text }))
                }
            },
        };
        if !delivered {
            session.kill(&mut child).await;
            return;
        }
    }

    session.state.send_replace(SessionState::Draining);
    let code = tokio::select! {
        _ = session.tx.closed() => {
            session.kill(&mut child).await;
            return;
        }
        status = child.wait() => exit_code(status),
    };

    info!(stage = %session.stage, session_id = %session.session_id, code, "stage finished");
    session.emit(StageEvent::Done { code });
    session.state.send_replace(SessionState::Closed);
}

/// Buffers raw pipe bytes so emitted chunks never split a UTF-8 sequence.
#[derive(Debug, Default)]
struct Utf8Chunker {
    pending: Vec<u8>,
}

impl Utf8Chunker {
    /// Append bytes and take the longest complete prefix, if any.
    fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(bytes);
        let complete = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            // Incomplete trailing sequence: hold it back for the next read.
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            // Genuinely invalid bytes: pass everything through lossily.
            Err(_) => return self.finish(),
        };
        let rest = self.pending.split_off(complete);
        let chunk = std::mem::replace(&mut self.pending, rest);
        into_text(chunk)
    }

    /// Flush whatever is buffered at EOF.
    fn finish(&mut self) -> Option<String> {
        into_text(std::mem::take(&mut self.pending))
    }
}

fn into_text(bytes: Vec<u8>) -> Option<String> {
    if bytes.is_empty() {
        return None;
    }
    Some(String::from_utf8(bytes).unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned()))
}

// ---------------------------------------------------------------------------
// Detached mode
// ---------------------------------------------------------------------------

/// Acknowledgement for a fire-and-forget stage run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Accepted {
    pub accepted: bool,
    pub stage: Stage,
    pub session_id: Uuid,
}

/// Start a stage and return immediately; output goes to the log.
pub async fn spawn_detached(runner: &dyn StageRunner, stage: Stage) -> Result<Accepted> {
    let mut stream = runner.open(stage).await?;
    let session_id = stream.session_id();

    tokio::spawn(async move {
        while let Some(event) = stream.next().await {
            match event {
                StageEvent::Output { text } => {
                    for line in text.lines().filter(|l| !l.trim().is_empty()) {
                        info!(%stage, %session_id, "{line}");
                    }
                }
                StageEvent::ErrorOutput { text } => {
                    for line in text.lines().filter(|l| !l.trim().is_empty()) {
                        warn!(%stage, %session_id, "{line}");
                    }
                }
                StageEvent::Done { code } => {
                    info!(%stage, %session_id, code, "detached stage exited");
                }
            }
        }
    });

    Ok(Accepted {
        accepted: true,
        stage,
        session_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use futures::StreamExt;

    fn runner_with(stage: Stage, script: &str) -> SubprocessRunner {
        let map = StageMap::from_config(
            &StagesConfig::default(),
            Path::new("/usr/bin/mcpinsider"),
            Path::new("/tmp/mcpinsider.toml"),
        )
        .unwrap()
        .with_command(stage, StageCommand::new("sh", ["-c", script]));
        SubprocessRunner::new(map)
    }

    async fn collect_all(mut stream: StageStream) -> Vec<StageEvent> {
        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }
        events
    }

    fn joined(events: &[StageEvent], stderr: bool) -> String {
        events
            .iter()
            .filter_map(|e| match (e, stderr) {
                (StageEvent::Output { text }, false) => Some(text.as_str()),
                (StageEvent::ErrorOutput { text }, true) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn stage_names_parse() {
        assert_eq!("deploy".parse::<Stage>().unwrap(), Stage::Deploy);
        let err = "publish".parse::<Stage>().unwrap_err();
        assert!(matches!(err, InsiderError::Validation { .. }));
    }

    #[test]
    fn default_commands_use_own_subcommands() {
        let map = StageMap::from_config(
            &StagesConfig::default(),
            Path::new("/opt/mcpinsider"),
            Path::new("/etc/mi.toml"),
        )
        .unwrap();
        let collect = map.command(Stage::Collect).unwrap();
        assert_eq!(collect.program, "/opt/mcpinsider");
        assert_eq!(collect.args, vec!["--config", "/etc/mi.toml", "collect"]);
        assert_eq!(map.command(Stage::Deploy).unwrap().program, "./deploy.sh");
    }

    #[test]
    fn configured_command_overrides_default() {
        let stages = StagesConfig {
            deploy: Some(vec!["./publish.sh".into(), "--prod".into()]),
            ..StagesConfig::default()
        };
        let map = StageMap::from_config(&stages, Path::new("x"), Path::new("y")).unwrap();
        assert_eq!(
            map.command(Stage::Deploy).unwrap(),
            &StageCommand::new("./publish.sh", ["--prod"])
        );

        let empty = StagesConfig {
            collect: Some(vec![]),
            ..StagesConfig::default()
        };
        assert!(StageMap::from_config(&empty, Path::new("x"), Path::new("y")).is_err());
    }

    #[test]
    fn chunker_holds_split_sequences() {
        let bytes = "héllo".as_bytes();
        let mut chunker = Utf8Chunker::default();
        // Split inside the two-byte 'é'.
        assert_eq!(chunker.push(&bytes[..2]).as_deref(), Some("h"));
        assert_eq!(chunker.push(&bytes[2..]).as_deref(), Some("éllo"));
        assert!(chunker.finish().is_none());

        assert_eq!(chunker.push(&[0xE3, 0x81]), None);
        assert_eq!(chunker.finish().as_deref(), Some("\u{FFFD}"));
    }

    #[tokio::test]
    async fn unknown_stage_spawns_nothing() {
        let runner = runner_with(Stage::Collect, "echo hi");
        let err = open_stage(&runner, "nope").await.err().expect("should fail");
        assert!(matches!(err, InsiderError::Validation { .. }));
    }

    #[tokio::test]
    async fn missing_program_is_a_stage_error() {
        let map = StageMap::from_config(&StagesConfig::default(), Path::new("x"), Path::new("y"))
            .unwrap()
            .with_command(Stage::Deploy, StageCommand::new("/nonexistent/mcpinsider-stage", Vec::<String>::new()));
        let err = SubprocessRunner::new(map).open(Stage::Deploy).await.err().expect("should fail");
        assert!(matches!(err, InsiderError::Stage(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn streams_output_then_done() {
        let runner = runner_with(Stage::Collect, "echo one; echo two; echo oops >&2; exit 3");
        let mut stream = open_stage(&runner, "collect").await.unwrap();
        assert_eq!(stream.stage(), Stage::Collect);

        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }
        assert!(stream.next().await.is_none());

        assert_eq!(joined(&events, false), "one\ntwo\n");
        assert_eq!(joined(&events, true), "oops\n");
        assert_eq!(events.last(), Some(&StageEvent::Done { code: 3 }));
        assert_eq!(
            events.iter().filter(|e| matches!(e, StageEvent::Done { .. })).count(),
            1
        );

        tokio::time::timeout(Duration::from_secs(5), stream.closed())
            .await
            .expect("session closes");
        assert_eq!(stream.session_state(), SessionState::Closed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn forces_color_in_child_env() {
        let runner = runner_with(Stage::Analyze, "printf '%s%s' \"$FORCE_COLOR\" \"$CLICOLOR_FORCE\"");
        let events = collect_all(runner.open(Stage::Analyze).await.unwrap()).await;
        assert_eq!(joined(&events, false), "11");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn killed_by_signal_reports_minus_one() {
        let runner = runner_with(Stage::Deploy, "kill -9 $$");
        let events = collect_all(runner.open(Stage::Deploy).await.unwrap()).await;
        assert_eq!(events.last(), Some(&StageEvent::Done { code: SIGNAL_EXIT_CODE }));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn dropping_stream_kills_subprocess() {
        let runner = runner_with(Stage::Deploy, "echo started; exec sleep 30");
        let mut stream = runner.open(Stage::Deploy).await.unwrap();
        let pid = stream.pid().expect("pid");

        let first = stream.next().await;
        assert!(matches!(first, Some(StageEvent::Output { .. })));
        drop(stream);

        let proc_path = format!("/proc/{pid}");
        let gone = tokio::time::timeout(Duration::from_secs(5), async {
            while Path::new(&proc_path).exists() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(gone.is_ok(), "subprocess {pid} still alive after disconnect");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancel_closes_session_and_stops_events() {
        let runner = runner_with(Stage::Deploy, "echo started; exec sleep 30");
        let mut stream = runner.open(Stage::Deploy).await.unwrap();
        assert!(stream.next().await.is_some());

        stream.cancel();
        assert!(stream.next().await.is_none());
        tokio::time::timeout(Duration::from_secs(5), stream.closed())
            .await
            .expect("session closes after cancel");
        assert_eq!(stream.session_state(), SessionState::Closed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn into_stream_ends_after_done() {
        let runner = runner_with(Stage::Collect, "echo hi");
        let stream = runner.open(Stage::Collect).await.unwrap().into_stream();
        let events: Vec<_> = stream.collect().await;
        assert_eq!(events.last(), Some(&StageEvent::Done { code: 0 }));
        assert_eq!(joined(&events, false), "hi\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn detached_run_is_accepted() {
        let runner = runner_with(Stage::Deploy, "echo deployed");
        let accepted = spawn_detached(&runner, Stage::Deploy).await.unwrap();
        assert!(accepted.accepted);
        assert_eq!(accepted.stage, Stage::Deploy);

        let json = serde_json::to_value(&accepted).unwrap();
        assert_eq!(json["stage"], "deploy");
        assert!(json["session_id"].is_string());
    }

    #[test]
    fn events_serialize_with_wire_names() {
        let done = serde_json::to_value(StageEvent::Done { code: 2 }).unwrap();
        assert_eq!(done, serde_json::json!({"event": "done", "code": 2}));
        let err = StageEvent::ErrorOutput { text: "x".into() };
        assert_eq!(err.name(), "error_output");
        assert_eq!(serde_json::to_value(&err).unwrap()["event"], "error_output");
    }
}
