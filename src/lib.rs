// ABOUTME: Bounded subprocess output relay library
// ABOUTME: Re-exports sessions, relays, tail buffers, configuration, and result types
//
// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 dravr.ai

//! # Procrelay — Bounded Process Output Relays
//!
//! Runs an external process and relays its standard output and standard
//! error to any number of sinks while enforcing a per-channel ceiling on
//! transferred bytes, keeping a bounded in-memory tail of each channel, and
//! terminating the process when a ceiling is hit or the caller asks.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use procrelay::{Destination, ProcessSession, SessionConfig, SessionIo};
//!
//! # async fn example() -> Result<(), procrelay::SessionError> {
//! let config = SessionConfig::new("sh")
//!     .with_args(vec!["-c".to_owned(), "yes | head -c 100000".to_owned()])
//!     .with_max_output_bytes(10)
//!     .with_tail_capacity(4);
//! let session = ProcessSession::new(config)?;
//! let io = SessionIo::new().with_stdout(Destination::new(tokio::io::stdout()));
//!
//! match session.run(io).await {
//!     Ok(result) => println!("exit code {:?}", result.exit_code),
//!     Err(err) if err.is_limit_reached() => println!("truncated: {}", session.stdout_tail()),
//!     Err(err) => return Err(err),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`types`] — Errors, channels, lifecycle phases, and the process result
//! - [`config`] — Session configuration and validation
//! - [`tail`] — Bounded tail buffer
//! - [`relay`] — Limit-enforcing stream relay with fan-out and backpressure
//! - [`session`] — Process session coordinating spawn, relays, and kill

/// Core types: errors, channels, phases, results
pub mod types;

/// In-process pipe feeding the combined channel
mod combined;
/// Session configuration
pub mod config;
/// Subprocess construction and exit supervision
mod process;
/// Bounded stream relay
pub mod relay;
/// Process session lifecycle
pub mod session;
/// Bounded tail buffer
pub mod tail;

pub use config::SessionConfig;
pub use relay::{BoxedSink, Destination, RelayReport, StreamRelay};
pub use session::{default_session_id, BoxedSource, ProcessSession, SessionIo};
pub use tail::TailBuffer;
pub use types::{Channel, ErrorKind, ProcessResult, SessionError, SessionPhase};
