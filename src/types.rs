// ABOUTME: Core types for bounded process sessions: errors, channels, phases, results
// ABOUTME: Provides SessionError with categorized kinds and the structured ProcessResult
//
// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 dravr.ai

//! # Core Types
//!
//! Self-contained definitions shared by the relay and the session layer.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ============================================================================
// Error Type
// ============================================================================

/// Error type for process session operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionError {
    /// Error category
    pub kind: ErrorKind,
    /// Human-readable error message
    pub message: String,
}

/// Categories of errors produced by a process session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A monitored channel tried to transfer more than the configured ceiling
    LimitReached {
        /// Configured ceiling in bytes
        limit: u64,
    },
    /// The session deadline elapsed and the process was terminated
    TimedOut {
        /// Configured deadline in milliseconds
        timeout_ms: u64,
    },
    /// The process exited with a non-zero code or was terminated by a signal
    AbnormalExit {
        /// Exit code, if the process exited normally
        exit_code: Option<i32>,
        /// Terminating signal, if any
        signal: Option<i32>,
    },
    /// The process could not be started
    Spawn,
    /// A source or destination stream failed while relaying
    Stream,
    /// Invalid configuration or misuse of the session lifecycle
    Config,
}

impl ErrorKind {
    /// Rank used to pick the reported terminal error; higher wins
    pub(crate) const fn precedence(self) -> u8 {
        match self {
            Self::LimitReached { .. } => 5,
            Self::Spawn => 4,
            Self::TimedOut { .. } => 3,
            Self::AbnormalExit { .. } => 2,
            Self::Stream => 1,
            Self::Config => 0,
        }
    }
}

/// Highest-precedence error among `candidates`, if any
pub(crate) fn most_severe(
    candidates: impl IntoIterator<Item = Option<SessionError>>,
) -> Option<SessionError> {
    candidates
        .into_iter()
        .flatten()
        .max_by_key(|err| err.kind.precedence())
}

impl SessionError {
    /// Create a limit-reached error for the given ceiling
    pub fn limit_reached(limit: u64) -> Self {
        Self {
            kind: ErrorKind::LimitReached { limit },
            message: format!("Max output size reached: {limit}"),
        }
    }

    /// Create a timeout error
    pub fn timed_out(timeout: Duration) -> Self {
        Self {
            kind: ErrorKind::TimedOut {
                timeout_ms: timeout.as_millis() as u64,
            },
            message: format!("Process timed out after {timeout:?}"),
        }
    }

    /// Create an abnormal-exit error
    pub fn abnormal_exit(command: &str, exit_code: Option<i32>, signal: Option<i32>) -> Self {
        let message = match (exit_code, signal) {
            (_, Some(sig)) => format!("Command was killed with signal {sig}: {command}"),
            (Some(code), None) => format!("Command failed with exit code {code}: {command}"),
            (None, None) => format!("Command terminated abnormally: {command}"),
        };
        Self {
            kind: ErrorKind::AbnormalExit { exit_code, signal },
            message,
        }
    }

    /// Create a spawn error
    pub fn spawn(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Spawn,
            message: message.into(),
        }
    }

    /// Create a stream error attributed to a relay label
    pub fn stream(label: impl fmt::Display, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Stream,
            message: format!("{label}: {}", message.into()),
        }
    }

    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Config,
            message: message.into(),
        }
    }

    /// Whether this error reports a reached output limit
    #[must_use]
    pub const fn is_limit_reached(&self) -> bool {
        matches!(self.kind, ErrorKind::LimitReached { .. })
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for SessionError {}

// ============================================================================
// Channels
// ============================================================================

/// Output channel monitored by a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
    /// Standard output and standard error interleaved in arrival order
    Combined,
}

impl Channel {
    /// Convert to string representation for log fields
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::Combined => "combined",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Session Lifecycle
// ============================================================================

/// Lifecycle phase of a process session
///
/// `Idle -> Running -> {Succeeded, Failed, LimitAborted, Killed}`; the four
/// right-hand phases are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// Constructed, not yet run
    Idle,
    /// Process spawned, relays active
    Running,
    /// Process exited successfully and no error was recorded
    Succeeded,
    /// Process failed to spawn, exited abnormally, timed out, or a stream failed
    Failed,
    /// A channel reached its output ceiling
    LimitAborted,
    /// The caller terminated the process and no limit was hit
    Killed,
}

impl SessionPhase {
    /// Whether no further transition can leave this phase
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Idle | Self::Running)
    }
}

// ============================================================================
// Process Result
// ============================================================================

/// Structured outcome of one process invocation
#[derive(Debug, Clone)]
pub struct ProcessResult {
    /// Command line that was executed (program and arguments)
    pub command: String,
    /// Exit code, absent when the process was terminated by a signal
    pub exit_code: Option<i32>,
    /// Symbolic name for the exit code or terminating signal
    pub exit_code_name: String,
    /// Whether the process did not succeed or a terminal error was recorded
    pub failed: bool,
    /// Whether the session deadline elapsed
    pub timed_out: bool,
    /// Whether a termination signal was delivered and the process then exited unsuccessfully
    pub killed: bool,
    /// Whether the caller requested termination through `kill()`
    pub canceled: bool,
    /// Terminating signal number, if any
    pub signal: Option<i32>,
    /// Terminating signal name, if any
    pub signal_name: Option<String>,
    /// Wall-clock duration from spawn to exit
    pub duration: Duration,
    /// Terminal error, if any
    pub error: Option<SessionError>,
}

/// Symbolic name for an exit code or terminating signal
pub(crate) fn exit_code_name(exit_code: Option<i32>, signal_name: Option<&str>) -> String {
    match (exit_code, signal_name) {
        (_, Some(name)) => name.to_owned(),
        (Some(0), None) => "SUCCESS".to_owned(),
        (Some(code), None) => format!("EXIT_{code}"),
        (None, None) => "UNKNOWN".to_owned(),
    }
}
