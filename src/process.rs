// ABOUTME: Subprocess construction, termination delivery, and exit supervision
// ABOUTME: Wraps tokio::process with environment whitelisting, deadlines, and kill requests
//
// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 dravr.ai

use std::env;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::SessionConfig;
use crate::types::SessionError;

/// Why the session asked the process to terminate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KillCause {
    /// The caller invoked `kill()`
    Caller,
    /// A channel reached its output ceiling
    Limit,
}

/// Exit descriptor produced by [`supervise`]
#[derive(Debug, Clone)]
pub(crate) struct ExitReport {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub signal_name: Option<String>,
    pub success: bool,
    /// A termination signal reached the process while it was still running
    pub signal_delivered: bool,
    pub timed_out: bool,
    pub duration: Duration,
}

/// Resolve the program to execute
///
/// Bare names are looked up on `PATH` with `which`; anything containing a path
/// separator is used as given.
pub(crate) fn resolve_program(command: &str) -> Result<PathBuf, SessionError> {
    let path = Path::new(command);
    if path.components().count() > 1 || path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    which::which(command)
        .map_err(|e| SessionError::spawn(format!("Binary '{command}' not found on PATH: {e}")))
}

/// Build the command for a session, applying working directory and environment policy
///
/// On Unix the child leads its own process group so termination reaches
/// anything it spawns.
pub(crate) fn build_command(
    config: &SessionConfig,
    with_input: bool,
) -> Result<Command, SessionError> {
    let program = resolve_program(&config.command)?;
    let mut cmd = Command::new(&program);
    cmd.args(&config.args)
        .stdin(if with_input {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    if let Some(keys) = &config.allowed_env_keys {
        cmd.env_clear();
        let mut missing = Vec::new();
        for key in keys {
            match env::var(key) {
                Ok(value) => {
                    cmd.env(key, value);
                }
                Err(_) => missing.push(key.as_str()),
            }
        }
        debug!(
            passed = keys.len() - missing.len(),
            ?missing,
            "Applied environment whitelist"
        );
    }

    if let Some(dir) = &config.working_directory {
        cmd.current_dir(dir);
    }

    debug!(program = %program.display(), args = ?config.args, "Built command");
    Ok(cmd)
}

#[cfg(unix)]
fn send_sigterm(target: i32) -> nix::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    kill(Pid::from_raw(target), Signal::SIGTERM)
}

/// Send SIGTERM to the process group led by `pid`
#[cfg(unix)]
pub(crate) fn terminate_group(pid: u32) -> bool {
    match send_sigterm(-(pid as i32)) {
        Ok(()) => true,
        Err(e) => {
            debug!(pid, error = %e, "Process group not signalled");
            false
        }
    }
}

#[cfg(not(unix))]
pub(crate) fn terminate_group(_pid: u32) -> bool {
    false
}

/// Ask a running child and its process group to terminate
///
/// Returns whether the signal was handed to a still-running process. A child
/// that has already been reaped is left alone; the child alone is signalled
/// when its group cannot be.
#[cfg(unix)]
fn deliver_termination(child: &mut Child) -> bool {
    if matches!(child.try_wait(), Ok(Some(_))) {
        return false;
    }
    let Some(pid) = child.id() else {
        return false;
    };
    if terminate_group(pid) {
        return true;
    }
    match send_sigterm(pid as i32) {
        Ok(()) => true,
        Err(e) => {
            debug!(pid, error = %e, "SIGTERM not delivered");
            false
        }
    }
}

#[cfg(not(unix))]
fn deliver_termination(child: &mut Child) -> bool {
    if matches!(child.try_wait(), Ok(Some(_))) {
        return false;
    }
    child.start_kill().is_ok()
}

#[cfg(unix)]
fn signal_of(status: ExitStatus) -> (Option<i32>, Option<String>) {
    use std::os::unix::process::ExitStatusExt;

    let Some(sig) = status.signal() else {
        return (None, None);
    };
    let name = nix::sys::signal::Signal::try_from(sig)
        .map_or_else(|_| format!("SIG{sig}"), |s| s.as_str().to_owned());
    (Some(sig), Some(name))
}

#[cfg(not(unix))]
fn signal_of(_status: ExitStatus) -> (Option<i32>, Option<String>) {
    (None, None)
}

/// Wait for `child` to exit while honoring kill requests and the deadline
///
/// Termination is delivered at most once; later requests only wait for exit.
pub(crate) async fn supervise(
    mut child: Child,
    mut kill_rx: watch::Receiver<Option<KillCause>>,
    timeout: Option<Duration>,
    started: Instant,
) -> Result<ExitReport, SessionError> {
    let deadline = tokio::time::sleep(timeout.unwrap_or(Duration::MAX));
    tokio::pin!(deadline);

    let mut watching_kills = true;
    let mut terminated = false;
    let mut signal_delivered = false;
    let mut timed_out = false;

    let status = loop {
        tokio::select! {
            status = child.wait() => {
                break status.map_err(|e| {
                    SessionError::spawn(format!("Failed to wait for process: {e}"))
                })?;
            }
            requested = kill_rx.wait_for(Option::is_some), if watching_kills => {
                watching_kills = false;
                // An error means the session dropped its sender without asking
                if let Ok(cause) = requested.map(|cause| *cause) {
                    if !terminated {
                        terminated = true;
                        signal_delivered = deliver_termination(&mut child);
                    }
                    debug!(?cause, signal_delivered, "Termination requested");
                }
            }
            () = &mut deadline, if timeout.is_some() && !timed_out => {
                timed_out = true;
                warn!(?timeout, "Process timed out, terminating");
                if !terminated {
                    terminated = true;
                    signal_delivered = deliver_termination(&mut child);
                }
            }
        }
    };

    let (signal, signal_name) = signal_of(status);
    let report = ExitReport {
        exit_code: status.code(),
        signal,
        signal_name,
        success: status.success(),
        signal_delivered,
        timed_out,
        duration: started.elapsed(),
    };
    debug!(
        exit_code = ?report.exit_code,
        signal = ?report.signal,
        duration = ?report.duration,
        "Process exited"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_program_keeps_paths() {
        assert_eq!(
            resolve_program("./script.sh").unwrap(),
            PathBuf::from("./script.sh")
        );
        assert_eq!(resolve_program("/bin/sh").unwrap(), PathBuf::from("/bin/sh"));
    }

    #[test]
    fn test_resolve_program_missing_binary() {
        let err = resolve_program("definitely-not-a-real-binary-xyz123").unwrap_err();
        assert_eq!(err.kind, crate::types::ErrorKind::Spawn);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_supervise_natural_exit() {
        let config =
            SessionConfig::new("sh").with_args(vec!["-c".to_owned(), "exit 3".to_owned()]);
        let child = build_command(&config, false).unwrap().spawn().unwrap();
        let (_tx, rx) = watch::channel(None);

        let report = supervise(child, rx, None, Instant::now()).await.unwrap();
        assert_eq!(report.exit_code, Some(3));
        assert!(!report.success);
        assert!(!report.signal_delivered);
        assert!(!report.timed_out);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_supervise_kill_request() {
        let config = SessionConfig::new("sleep").with_args(vec!["30".to_owned()]);
        let child = build_command(&config, false).unwrap().spawn().unwrap();
        let (tx, rx) = watch::channel(None);

        tx.send_replace(Some(KillCause::Caller));
        let report = supervise(child, rx, None, Instant::now()).await.unwrap();
        assert!(report.signal_delivered);
        assert_eq!(report.signal_name.as_deref(), Some("SIGTERM"));
        assert_eq!(report.exit_code, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_supervise_deadline() {
        let config = SessionConfig::new("sleep").with_args(vec!["30".to_owned()]);
        let child = build_command(&config, false).unwrap().spawn().unwrap();
        let (_tx, rx) = watch::channel(None);

        let report = supervise(child, rx, Some(Duration::from_millis(100)), Instant::now())
            .await
            .unwrap();
        assert!(report.timed_out);
        assert!(report.signal_delivered);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_request_reaches_grandchildren() {
        let config = SessionConfig::new("sh")
            .with_args(vec!["-c".to_owned(), "sleep 30 & wait".to_owned()]);
        let mut child = build_command(&config, false).unwrap().spawn().unwrap();
        let mut stdout = child.stdout.take().unwrap();
        let (tx, rx) = watch::channel(None);

        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send_replace(Some(KillCause::Caller));
        let report = supervise(child, rx, None, Instant::now()).await.unwrap();
        assert!(report.signal_delivered);

        // The pipe only reaches end-of-stream once the background sleep is gone too
        let mut rest = Vec::new();
        let drained = tokio::time::timeout(
            Duration::from_secs(5),
            tokio::io::AsyncReadExt::read_to_end(&mut stdout, &mut rest),
        )
        .await;
        assert!(drained.is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_env_whitelist_applies() {
        let config = SessionConfig::new("sh").with_allowed_env_keys(vec!["PATH".to_owned()]);
        let cmd = build_command(&config, false).unwrap();
        let envs: Vec<_> = cmd.as_std().get_envs().collect();
        assert!(envs.iter().all(|(k, _)| *k == "PATH"));
    }
}
