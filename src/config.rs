// ABOUTME: Session configuration with documented defaults and fail-fast validation
// ABOUTME: Defines output limits, tail capacity, deadlines, and spawn environment policy
//
// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 dravr.ai

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::tail::DEFAULT_TAIL_CAPACITY;
use crate::types::SessionError;

/// Configuration for a single process session
///
/// Defaults: no arguments, unlimited output, a 10 000 character tail per
/// channel, no deadline, no combined channel unless destinations ask for it,
/// inherited working directory and environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Program to execute; bare names are resolved on `PATH`
    pub command: String,
    /// Arguments passed to the program
    pub args: Vec<String>,
    /// Label used to correlate log lines; generated when absent
    pub id: Option<String>,
    /// Per-channel ceiling on forwarded bytes (`None` = unlimited)
    pub max_output_bytes: Option<u64>,
    /// Characters retained in memory per channel
    pub tail_capacity: usize,
    /// Terminate the process once this much time has passed
    #[serde(with = "optional_millis")]
    pub timeout: Option<Duration>,
    /// Relay the combined channel even without combined destinations
    pub capture_combined: bool,
    /// Working directory for the subprocess
    pub working_directory: Option<PathBuf>,
    /// When set, the environment is cleared and only these keys pass through
    pub allowed_env_keys: Option<Vec<String>>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            id: None,
            max_output_bytes: None,
            tail_capacity: DEFAULT_TAIL_CAPACITY,
            timeout: None,
            capture_combined: false,
            working_directory: None,
            allowed_env_keys: None,
        }
    }
}

impl SessionConfig {
    /// Create a configuration for `command` with defaults
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    /// Set the program arguments
    #[must_use]
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Set the correlation label
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the per-channel output ceiling in bytes
    #[must_use]
    pub const fn with_max_output_bytes(mut self, limit: u64) -> Self {
        self.max_output_bytes = Some(limit);
        self
    }

    /// Set the tail capacity in characters
    #[must_use]
    pub const fn with_tail_capacity(mut self, capacity: usize) -> Self {
        self.tail_capacity = capacity;
        self
    }

    /// Set the process deadline
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Always relay the combined channel
    #[must_use]
    pub const fn with_combined_capture(mut self, enabled: bool) -> Self {
        self.capture_combined = enabled;
        self
    }

    /// Set the working directory for the subprocess
    #[must_use]
    pub fn with_working_directory(mut self, dir: PathBuf) -> Self {
        self.working_directory = Some(dir);
        self
    }

    /// Clear the environment and pass through only `keys`
    #[must_use]
    pub fn with_allowed_env_keys(mut self, keys: Vec<String>) -> Self {
        self.allowed_env_keys = Some(keys);
        self
    }

    /// Reject configurations that cannot run
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.command.trim().is_empty() {
            return Err(SessionError::config("command must not be empty"));
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(SessionError::config("timeout must be greater than zero"));
        }
        if let Some(dir) = &self.working_directory {
            if !dir.is_dir() {
                return Err(SessionError::config(format!(
                    "working directory does not exist: {}",
                    dir.display()
                )));
            }
        }
        if self.id.as_deref().is_some_and(str::is_empty) {
            return Err(SessionError::config("session id must not be empty"));
        }
        Ok(())
    }

    /// Program and arguments joined for display
    #[must_use]
    pub fn command_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Parse a configuration from a TOML document
    #[cfg(feature = "config-file")]
    pub fn from_toml_str(input: &str) -> Result<Self, SessionError> {
        let config: Self = toml::from_str(input)
            .map_err(|e| SessionError::config(format!("invalid session config: {e}")))?;
        config.validate()?;
        Ok(config)
    }
}

/// Serialize `Option<Duration>` as optional milliseconds
mod optional_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(value: &Option<Duration>, ser: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => ser.serialize_some(&(d.as_millis() as u64)),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(de)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ErrorKind;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::new("echo");
        assert_eq!(config.command, "echo");
        assert!(config.args.is_empty());
        assert_eq!(config.max_output_bytes, None);
        assert_eq!(config.tail_capacity, 10_000);
        assert!(config.timeout.is_none());
        assert!(!config.capture_combined);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_chain() {
        let config = SessionConfig::new("echo")
            .with_args(vec!["hi".to_owned()])
            .with_id("abc")
            .with_max_output_bytes(10)
            .with_tail_capacity(9)
            .with_timeout(Duration::from_secs(2))
            .with_combined_capture(true);
        assert_eq!(config.id.as_deref(), Some("abc"));
        assert_eq!(config.max_output_bytes, Some(10));
        assert_eq!(config.tail_capacity, 9);
        assert_eq!(config.timeout, Some(Duration::from_secs(2)));
        assert!(config.capture_combined);
        assert_eq!(config.command_line(), "echo hi");
    }

    #[test]
    fn test_validate_rejects_empty_command() {
        let err = SessionConfig::new("  ").validate().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Config);
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let err = SessionConfig::new("echo")
            .with_timeout(Duration::ZERO)
            .validate()
            .unwrap_err();
        assert!(err.message.contains("timeout"));
    }

    #[test]
    fn test_validate_rejects_missing_working_directory() {
        let err = SessionConfig::new("echo")
            .with_working_directory(PathBuf::from("/nonexistent/path/xyz123"))
            .validate()
            .unwrap_err();
        assert!(err.message.contains("working directory"));
    }

    #[test]
    fn test_deserialize_partial_json() {
        let config: SessionConfig = serde_json::from_str(
            r#"{"command": "sh", "args": ["-c", "true"], "max_output_bytes": 13, "timeout": 1500}"#,
        )
        .unwrap();
        assert_eq!(config.args, vec!["-c", "true"]);
        assert_eq!(config.max_output_bytes, Some(13));
        assert_eq!(config.timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.tail_capacity, DEFAULT_TAIL_CAPACITY);
    }

    #[test]
    fn test_negative_limit_rejected_by_type() {
        let parsed =
            serde_json::from_str::<SessionConfig>(r#"{"command": "sh", "max_output_bytes": -1}"#);
        assert!(parsed.is_err());
    }

    #[cfg(feature = "config-file")]
    #[test]
    fn test_from_toml_str() {
        let config = SessionConfig::from_toml_str(
            "command = \"echo\"\nargs = [\"hi\"]\nmax_output_bytes = 10\ntail_capacity = 9\n",
        )
        .unwrap();
        assert_eq!(config.command_line(), "echo hi");
        assert_eq!(config.tail_capacity, 9);
    }
}
