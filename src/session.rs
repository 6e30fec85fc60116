// ABOUTME: Process session wiring one bounded relay per output channel
// ABOUTME: Coordinates spawn, kill, limit enforcement, tail capture, and the final result
//
// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 dravr.ai

//! # Process Session
//!
//! A [`ProcessSession`] runs one command. Standard output and standard error
//! each get a [`StreamRelay`] limited to `max_output_bytes`; when a combined
//! channel is requested, both relays also feed an internal pipe read by a
//! third relay. Every relay shares the session's sticky limit flag: the first
//! relay to exceed its ceiling records a limit error and asks the process to
//! terminate, and that error is reported even if the process also fails.
//!
//! ```rust,no_run
//! use procrelay::{Destination, ProcessSession, SessionConfig, SessionIo};
//!
//! # async fn example() -> Result<(), procrelay::SessionError> {
//! let config = SessionConfig::new("echo")
//!     .with_args(vec!["hello".to_owned()])
//!     .with_max_output_bytes(1024);
//! let session = ProcessSession::new(config)?;
//! let result = session
//!     .run(SessionIo::new().with_stdout(Destination::new(tokio::io::sink())))
//!     .await?;
//! assert_eq!(result.exit_code, Some(0));
//! assert_eq!(session.stdout_tail(), "hello\n");
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::io::AsyncRead;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::combined::combined_pipe;
use crate::config::SessionConfig;
use crate::process::{build_command, supervise, terminate_group, ExitReport, KillCause};
use crate::relay::{BoxedSink, Destination, RelayReport, StreamRelay};
use crate::tail::TailBuffer;
use crate::types::{
    exit_code_name, most_severe, Channel, ProcessResult, SessionError, SessionPhase,
};

/// Boxed readable source used as process input
pub type BoxedSource = Box<dyn AsyncRead + Send + Unpin>;

/// Generate a 16 hex character session label
#[must_use]
pub fn default_session_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}

/// Input source and destination sinks for one run
#[derive(Default)]
pub struct SessionIo {
    input: Option<BoxedSource>,
    stdout: Vec<Destination>,
    stderr: Vec<Destination>,
    combined: Vec<Destination>,
}

impl SessionIo {
    /// No input and no destinations; output is only captured in the tails
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed `source` to the process's standard input
    #[must_use]
    pub fn with_input(mut self, source: impl AsyncRead + Send + Unpin + 'static) -> Self {
        self.input = Some(Box::new(source));
        self
    }

    /// Add a standard output destination
    #[must_use]
    pub fn with_stdout(mut self, destination: Destination) -> Self {
        self.stdout.push(destination);
        self
    }

    /// Add a standard error destination
    #[must_use]
    pub fn with_stderr(mut self, destination: Destination) -> Self {
        self.stderr.push(destination);
        self
    }

    /// Add a combined-channel destination
    #[must_use]
    pub fn with_combined(mut self, destination: Destination) -> Self {
        self.combined.push(destination);
        self
    }
}

impl fmt::Debug for SessionIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionIo")
            .field("input", &self.input.is_some())
            .field("stdout", &self.stdout)
            .field("stderr", &self.stderr)
            .field("combined", &self.combined)
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between the session handle and its relay callbacks
struct Shared {
    id: String,
    limit: Option<u64>,
    phase: Mutex<SessionPhase>,
    limit_reached: AtomicBool,
    canceled: AtomicBool,
    exited: AtomicBool,
    stdout_tail: Mutex<TailBuffer>,
    stderr_tail: Mutex<TailBuffer>,
    combined_tail: Mutex<TailBuffer>,
    terminal_error: Mutex<Option<SessionError>>,
    result: Mutex<Option<ProcessResult>>,
    retained: Mutex<HashMap<Channel, Vec<BoxedSink>>>,
    kill_tx: watch::Sender<Option<KillCause>>,
}

impl Shared {
    fn tail(&self, channel: Channel) -> &Mutex<TailBuffer> {
        match channel {
            Channel::Stdout => &self.stdout_tail,
            Channel::Stderr => &self.stderr_tail,
            Channel::Combined => &self.combined_tail,
        }
    }

    fn capture(&self, channel: Channel, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        lock(self.tail(channel)).push(&String::from_utf8_lossy(chunk));
    }

    /// Record `err` unless a terminal error already exists
    fn record_error(&self, err: SessionError) {
        let mut slot = lock(&self.terminal_error);
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn request_kill(&self, cause: KillCause) -> bool {
        self.kill_tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(cause);
            true
        })
    }

    /// Flip the sticky limit flag; only the first caller records and kills
    fn mark_limit_reached(&self, channel: Channel) {
        if self
            .limit_reached
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(session = %self.id, %channel, "Limit already reached on another channel");
            return;
        }
        let limit = self.limit.unwrap_or_default();
        warn!(session = %self.id, %channel, limit, "Output limit reached, killing process");
        self.record_error(SessionError::limit_reached(limit));
        self.request_kill(KillCause::Limit);
    }
}

/// One process invocation with bounded output relays
pub struct ProcessSession {
    config: SessionConfig,
    shared: Arc<Shared>,
}

impl ProcessSession {
    /// Create a session, generating an id when the config has none
    pub fn new(config: SessionConfig) -> Result<Self, SessionError> {
        Self::with_id_generator(config, default_session_id)
    }

    /// Create a session using `generate` for the id when the config has none
    pub fn with_id_generator(
        config: SessionConfig,
        generate: impl FnOnce() -> String,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let id = config.id.clone().unwrap_or_else(generate);
        let (kill_tx, _) = watch::channel(None);
        let capacity = config.tail_capacity;

        let shared = Arc::new(Shared {
            id,
            limit: config.max_output_bytes,
            phase: Mutex::new(SessionPhase::Idle),
            limit_reached: AtomicBool::new(false),
            canceled: AtomicBool::new(false),
            exited: AtomicBool::new(false),
            stdout_tail: Mutex::new(TailBuffer::new(capacity)),
            stderr_tail: Mutex::new(TailBuffer::new(capacity)),
            combined_tail: Mutex::new(TailBuffer::new(capacity)),
            terminal_error: Mutex::new(None),
            result: Mutex::new(None),
            retained: Mutex::new(HashMap::new()),
            kill_tx,
        });

        Ok(Self { config, shared })
    }

    /// Correlation label
    #[must_use]
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Configuration this session was built from
    #[must_use]
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Current lifecycle phase
    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        *lock(&self.shared.phase)
    }

    /// Whether any channel reached the output ceiling
    #[must_use]
    pub fn has_reached_limit(&self) -> bool {
        self.shared.limit_reached.load(Ordering::SeqCst)
    }

    /// Captured tail of `channel`
    #[must_use]
    pub fn tail(&self, channel: Channel) -> String {
        lock(self.shared.tail(channel)).materialize()
    }

    /// Captured tail of standard output
    #[must_use]
    pub fn stdout_tail(&self) -> String {
        self.tail(Channel::Stdout)
    }

    /// Captured tail of standard error
    #[must_use]
    pub fn stderr_tail(&self) -> String {
        self.tail(Channel::Stderr)
    }

    /// Captured tail of the combined channel
    #[must_use]
    pub fn combined_tail(&self) -> String {
        self.tail(Channel::Combined)
    }

    /// Terminal error recorded so far, without failing
    #[must_use]
    pub fn check_error(&self) -> Option<SessionError> {
        lock(&self.shared.terminal_error).clone()
    }

    /// Final result, once the run finished
    #[must_use]
    pub fn result(&self) -> Option<ProcessResult> {
        lock(&self.shared.result).clone()
    }

    /// Take back the destinations of `channel` that were not finalized
    pub fn take_retained(&self, channel: Channel) -> Vec<BoxedSink> {
        lock(&self.shared.retained)
            .remove(&channel)
            .unwrap_or_default()
    }

    /// Ask the running process to terminate
    ///
    /// Returns whether a request was issued. Outside of a run, or once the
    /// process has exited, this is a no-op. Any abnormal exit it causes is
    /// reported through the result of [`run`](Self::run).
    pub fn kill(&self) -> bool {
        if self.phase() != SessionPhase::Running || self.shared.exited.load(Ordering::SeqCst) {
            debug!(session = %self.shared.id, "Kill ignored, process not running");
            return false;
        }
        self.shared.canceled.store(true, Ordering::SeqCst);
        let issued = self.shared.request_kill(KillCause::Caller);
        info!(session = %self.shared.id, issued, "Kill requested");
        issued
    }

    /// Spawn the process, relay its output, and wait for everything to finish
    ///
    /// Returns the terminal error when one was recorded (limit reached,
    /// timeout, abnormal exit, stream failure, spawn failure); the full
    /// [`ProcessResult`] stays available through [`result`](Self::result).
    pub async fn run(&self, io: SessionIo) -> Result<ProcessResult, SessionError> {
        self.begin()?;
        let started = Instant::now();
        let id = self.shared.id.clone();
        info!(
            session = %id,
            command = %self.config.command,
            args = ?self.config.args,
            "Spawn process"
        );

        let SessionIo {
            input,
            stdout,
            stderr,
            combined,
        } = io;

        let mut child = match build_command(&self.config, input.is_some()).and_then(|mut cmd| {
            cmd.spawn()
                .map_err(|e| SessionError::spawn(format!("Failed to spawn process: {e}")))
        }) {
            Ok(child) => child,
            Err(err) => return Err(self.finish_without_exit(err, started)),
        };

        let (Some(stdout_src), Some(stderr_src)) = (child.stdout.take(), child.stderr.take())
        else {
            let err = SessionError::spawn("Process output pipes unavailable");
            return Err(self.finish_without_exit(err, started));
        };

        let stdin_task = match (input, child.stdin.take()) {
            (Some(mut source), Some(mut stdin)) => {
                let id = id.clone();
                Some(tokio::spawn(async move {
                    match tokio::io::copy(&mut source, &mut stdin).await {
                        Ok(bytes) => debug!(session = %id, bytes, "Input forwarded"),
                        Err(e) => debug!(session = %id, error = %e, "Input forwarding stopped"),
                    }
                }))
            }
            _ => None,
        };

        let with_combined = self.config.capture_combined || !combined.is_empty();
        let (mut stdout_dests, mut stderr_dests) = (stdout, stderr);
        let combined_relay = if with_combined {
            let (mut taps, reader) = combined_pipe(2);
            if let (Some(err_tap), Some(out_tap)) = (taps.pop(), taps.pop()) {
                stdout_dests.push(Destination::new(out_tap));
                stderr_dests.push(Destination::new(err_tap));
            }
            // The combined input is already bounded by the two channel limits
            Some(self.channel_relay(Channel::Combined, None).start(reader, combined))
        } else {
            None
        };

        let limit = self.config.max_output_bytes;
        let stdout_relay = self
            .channel_relay(Channel::Stdout, limit)
            .start(stdout_src, stdout_dests);
        let stderr_relay = self
            .channel_relay(Channel::Stderr, limit)
            .start(stderr_src, stderr_dests);

        let group = child.id();
        let exit = supervise(
            child,
            self.shared.kill_tx.subscribe(),
            self.config.timeout,
            started,
        )
        .await;
        self.shared.exited.store(true, Ordering::SeqCst);
        if let Some(task) = stdin_task {
            task.abort();
        }

        // Descendants may still hold the output pipes open after the child exits
        let stragglers = group.map(|pid| {
            let mut kill_rx = self.shared.kill_tx.subscribe();
            let id = id.clone();
            tokio::spawn(async move {
                if kill_rx.wait_for(Option::is_some).await.is_ok() {
                    let delivered = terminate_group(pid);
                    debug!(session = %id, pid, delivered, "Terminated remaining process group");
                }
            })
        });

        let mut relay_error = None;
        let mut outcomes = vec![
            (Channel::Stdout, join_relay(&id, Channel::Stdout, stdout_relay).await),
            (Channel::Stderr, join_relay(&id, Channel::Stderr, stderr_relay).await),
        ];
        if let Some(handle) = combined_relay {
            outcomes.push((
                Channel::Combined,
                join_relay(&id, Channel::Combined, handle).await,
            ));
        }
        if let Some(task) = stragglers {
            task.abort();
        }
        for (channel, outcome) in outcomes {
            match outcome {
                Ok(report) => {
                    if !report.retained.is_empty() {
                        lock(&self.shared.retained).insert(channel, report.retained);
                    }
                }
                Err(err) => {
                    warn!(session = %id, %channel, error = %err, "Relay failed");
                    relay_error.get_or_insert(err);
                }
            }
        }

        match exit {
            Ok(exit) => self.finish(&exit, relay_error),
            Err(err) => Err(self.finish_without_exit(err, started)),
        }
    }

    fn begin(&self) -> Result<(), SessionError> {
        let mut phase = lock(&self.shared.phase);
        if *phase != SessionPhase::Idle {
            return Err(SessionError::config(format!(
                "session {} cannot run from phase {:?}",
                self.shared.id, *phase
            )));
        }
        *phase = SessionPhase::Running;
        Ok(())
    }

    fn channel_relay(&self, channel: Channel, limit: Option<u64>) -> StreamRelay {
        let tail = Arc::clone(&self.shared);
        let flag = Arc::clone(&self.shared);
        StreamRelay::new(format!("{}:{channel}", self.shared.id), limit)
            .on_data(move |chunk| tail.capture(channel, chunk))
            .on_limit(move || flag.mark_limit_reached(channel))
    }

    /// Aggregate the exit descriptor and relay outcome into the final result
    fn finish(
        &self,
        exit: &ExitReport,
        relay_error: Option<SessionError>,
    ) -> Result<ProcessResult, SessionError> {
        let command = self.config.command_line();
        let limit_reached = self.has_reached_limit();
        let canceled = self.shared.canceled.load(Ordering::SeqCst);
        let killed = exit.signal_delivered && !exit.success;

        let timed_out = exit
            .timed_out
            .then_some(self.config.timeout)
            .flatten()
            .map(SessionError::timed_out);
        let abnormal = (!exit.success)
            .then(|| SessionError::abnormal_exit(&command, exit.exit_code, exit.signal));
        if let Some(err) = most_severe([timed_out, abnormal, relay_error]) {
            self.shared.record_error(err);
        }
        let error = self.check_error();

        let phase = if limit_reached {
            SessionPhase::LimitAborted
        } else if canceled && killed {
            SessionPhase::Killed
        } else if error.is_some() {
            SessionPhase::Failed
        } else {
            SessionPhase::Succeeded
        };

        let result = ProcessResult {
            command,
            exit_code: exit.exit_code,
            exit_code_name: exit_code_name(exit.exit_code, exit.signal_name.as_deref()),
            failed: !exit.success || error.is_some(),
            timed_out: exit.timed_out,
            killed,
            canceled,
            signal: exit.signal,
            signal_name: exit.signal_name.clone(),
            duration: exit.duration,
            error: error.clone(),
        };
        self.complete(phase, result.clone());

        info!(
            session = %self.shared.id,
            ?phase,
            exit_code = ?result.exit_code,
            signal = ?result.signal_name,
            killed,
            limit_reached,
            duration = ?result.duration,
            "Process finished"
        );

        match error {
            Some(err) => Err(err),
            None => Ok(result),
        }
    }

    /// Finish a run that never produced an exit status
    fn finish_without_exit(&self, err: SessionError, started: Instant) -> SessionError {
        warn!(session = %self.shared.id, error = %err, "Error on run");
        self.shared.record_error(err);
        let error = self.check_error();
        let result = ProcessResult {
            command: self.config.command_line(),
            exit_code: None,
            exit_code_name: exit_code_name(None, None),
            failed: true,
            timed_out: false,
            killed: false,
            canceled: self.shared.canceled.load(Ordering::SeqCst),
            signal: None,
            signal_name: None,
            duration: started.elapsed(),
            error: error.clone(),
        };
        let phase = if self.has_reached_limit() {
            SessionPhase::LimitAborted
        } else {
            SessionPhase::Failed
        };
        self.complete(phase, result);
        error.unwrap_or_else(|| SessionError::spawn("process did not start"))
    }

    fn complete(&self, phase: SessionPhase, result: ProcessResult) {
        *lock(&self.shared.result) = Some(result);
        *lock(&self.shared.phase) = phase;
    }
}

impl fmt::Debug for ProcessSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessSession")
            .field("id", &self.shared.id)
            .field("command", &self.config.command)
            .field("phase", &self.phase())
            .field("limit_reached", &self.has_reached_limit())
            .finish_non_exhaustive()
    }
}

async fn join_relay(
    id: &str,
    channel: Channel,
    handle: JoinHandle<Result<RelayReport, SessionError>>,
) -> Result<RelayReport, SessionError> {
    handle.await.unwrap_or_else(|e| {
        Err(SessionError::stream(
            format!("{id}:{channel}"),
            format!("relay task failed: {e}"),
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ErrorKind;

    #[test]
    fn test_default_session_id_shape() {
        let id = default_session_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_injected_id_generator() {
        let session =
            ProcessSession::with_id_generator(SessionConfig::new("echo"), || "fixed".to_owned())
                .unwrap();
        assert_eq!(session.id(), "fixed");
    }

    #[test]
    fn test_config_id_wins_over_generator() {
        let config = SessionConfig::new("echo").with_id("mine");
        let session =
            ProcessSession::with_id_generator(config, || unreachable!("id was given")).unwrap();
        assert_eq!(session.id(), "mine");
    }

    #[test]
    fn test_invalid_config_fails_fast() {
        let err = ProcessSession::new(SessionConfig::new("")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Config);
    }

    #[test]
    fn test_accessors_before_run() {
        let session = ProcessSession::new(SessionConfig::new("echo")).unwrap();
        assert_eq!(session.phase(), SessionPhase::Idle);
        assert!(!session.has_reached_limit());
        assert_eq!(session.stdout_tail(), "");
        assert_eq!(session.stderr_tail(), "");
        assert_eq!(session.combined_tail(), "");
        assert!(session.check_error().is_none());
        assert!(session.result().is_none());
        assert!(session.take_retained(Channel::Stdout).is_empty());
    }

    #[test]
    fn test_kill_before_run_is_noop() {
        let session = ProcessSession::new(SessionConfig::new("echo")).unwrap();
        assert!(!session.kill());
        assert_eq!(session.phase(), SessionPhase::Idle);
    }

    #[test]
    fn test_limit_flag_is_sticky_and_set_once() {
        let session =
            ProcessSession::new(SessionConfig::new("echo").with_max_output_bytes(4)).unwrap();
        session.shared.mark_limit_reached(Channel::Stdout);
        session.shared.mark_limit_reached(Channel::Stderr);
        assert!(session.has_reached_limit());
        assert_eq!(
            session.check_error().map(|e| e.kind),
            Some(ErrorKind::LimitReached { limit: 4 })
        );
        assert_eq!(*session.shared.kill_tx.borrow(), Some(KillCause::Limit));
    }

    #[test]
    fn test_first_terminal_error_is_kept() {
        let session = ProcessSession::new(SessionConfig::new("echo")).unwrap();
        session.shared.record_error(SessionError::limit_reached(1));
        session
            .shared
            .record_error(SessionError::abnormal_exit("echo", Some(1), None));
        assert!(session.check_error().unwrap().is_limit_reached());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_terminal() {
        let session =
            ProcessSession::new(SessionConfig::new("definitely-not-a-real-binary-xyz123")).unwrap();
        let err = session.run(SessionIo::new()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Spawn);
        assert_eq!(session.phase(), SessionPhase::Failed);
        assert_eq!(session.check_error(), Some(err));
        let result = session.result().unwrap();
        assert!(result.failed);
        assert_eq!(result.exit_code, None);

        let again = session.run(SessionIo::new()).await.unwrap_err();
        assert_eq!(again.kind, ErrorKind::Config);
        assert_eq!(session.phase(), SessionPhase::Failed);
    }
}
