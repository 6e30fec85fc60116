// ABOUTME: Bounded stream relay pumping one source into many destinations
// ABOUTME: Enforces a shared transfer limit, feeds tail capture, and propagates backpressure
//
// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 dravr.ai

//! # Stream Relay
//!
//! A [`StreamRelay`] reads chunks from a single [`AsyncRead`] source and
//! writes each admitted chunk to every [`Destination`] in order. Writes to a
//! destination are awaited before the next one starts, and the next source
//! read only happens once every destination accepted the previous chunk, so
//! the slowest destination governs the pace.
//!
//! The transfer limit is shared across all destinations: a chunk that would
//! push the transferred total past the limit is truncated to fill the
//! remaining allowance, the limit callback fires once, and the relay stops
//! reading and finalizes its destinations.

use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::types::SessionError;

/// Read chunk size for the source
const CHUNK_SIZE: usize = 8192;

/// Boxed writable sink accepted as a relay destination
pub type BoxedSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Callback invoked with every forwarded chunk
pub type DataCallback = Box<dyn FnMut(&[u8]) + Send>;

/// Callback invoked once when the transfer limit is reached
pub type LimitCallback = Box<dyn FnOnce() + Send>;

/// A sink the relay writes to, with its finalize-on-completion flag
pub struct Destination {
    sink: BoxedSink,
    finalize: bool,
}

impl Destination {
    /// Destination that is shut down when the relay finishes
    pub fn new(sink: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            sink: Box::new(sink),
            finalize: true,
        }
    }

    /// Destination left open when the relay finishes and handed back in
    /// [`RelayReport::retained`]
    pub fn retained(sink: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            sink: Box::new(sink),
            finalize: false,
        }
    }

    /// Whether the relay shuts this destination down on completion
    #[must_use]
    pub const fn finalizes(&self) -> bool {
        self.finalize
    }
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Destination")
            .field("finalize", &self.finalize)
            .finish_non_exhaustive()
    }
}

/// Relay state machine, traced on every transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelayState {
    /// Waiting for the next source chunk
    Streaming,
    /// Waiting for destinations to accept a chunk
    Draining,
    /// Source done; finalizing destinations
    Ending,
    /// All destinations finished
    Closed,
    /// A source or destination failed
    Errored,
}

impl RelayState {
    const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Errored)
    }
}

/// Outcome of a completed relay
pub struct RelayReport {
    /// Bytes forwarded to every destination
    pub transferred: u64,
    /// Whether the source carried more than the limit allowed
    pub limit_reached: bool,
    /// Destinations flagged not to be finalized, still open
    pub retained: Vec<BoxedSink>,
}

impl fmt::Debug for RelayReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayReport")
            .field("transferred", &self.transferred)
            .field("limit_reached", &self.limit_reached)
            .field("retained", &self.retained.len())
            .finish()
    }
}

/// Split a chunk of `len` bytes against the remaining allowance
///
/// Returns how many bytes may be forwarded and whether the chunk as received
/// would have exceeded the limit.
#[must_use]
pub fn admit(transferred: u64, limit: Option<u64>, len: usize) -> (usize, bool) {
    let Some(limit) = limit else {
        return (len, false);
    };
    let remaining = limit.saturating_sub(transferred);
    if len as u64 > remaining {
        (remaining as usize, true)
    } else {
        (len, false)
    }
}

/// Pumps one source into zero or more destinations under a byte limit
pub struct StreamRelay {
    label: String,
    limit: Option<u64>,
    transferred: u64,
    state: RelayState,
    on_data: Option<DataCallback>,
    on_limit: Option<LimitCallback>,
}

impl StreamRelay {
    /// Create a relay; `limit = None` means unlimited
    pub fn new(label: impl Into<String>, limit: Option<u64>) -> Self {
        Self {
            label: label.into(),
            limit,
            transferred: 0,
            state: RelayState::Streaming,
            on_data: None,
            on_limit: None,
        }
    }

    /// Receive every forwarded chunk (exactly the bytes written to destinations)
    pub fn on_data(mut self, callback: impl FnMut(&[u8]) + Send + 'static) -> Self {
        self.on_data = Some(Box::new(callback));
        self
    }

    /// Run `callback` once when the source exceeds the limit
    pub fn on_limit(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_limit = Some(Box::new(callback));
        self
    }

    /// Spawn the relay on the runtime; the handle resolves on completion
    pub fn start<R>(
        self,
        source: R,
        destinations: Vec<Destination>,
    ) -> JoinHandle<Result<RelayReport, SessionError>>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        tokio::spawn(self.run(source, destinations))
    }

    /// Pump `source` into `destinations` until end-of-stream, limit, or error
    pub async fn run<R>(
        mut self,
        mut source: R,
        mut destinations: Vec<Destination>,
    ) -> Result<RelayReport, SessionError>
    where
        R: AsyncRead + Unpin,
    {
        debug!(
            relay = %self.label,
            limit = ?self.limit,
            destinations = destinations.len(),
            "Relay started"
        );

        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut limit_reached = false;

        loop {
            let read = match source.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => return Err(self.fail(&format!("source read failed: {e}"))),
            };

            let (allowed, exceeded) = admit(self.transferred, self.limit, read);
            let forwarded = &buf[..allowed];

            if !forwarded.is_empty() {
                self.transition(RelayState::Draining);
                for destination in &mut destinations {
                    if let Err(e) = destination.sink.write_all(forwarded).await {
                        return Err(self.fail(&format!("destination write failed: {e}")));
                    }
                }
                self.transition(RelayState::Streaming);
            }

            self.transferred += allowed as u64;
            if let Some(callback) = self.on_data.as_mut() {
                callback(forwarded);
            }

            if exceeded {
                limit_reached = true;
                debug!(relay = %self.label, transferred = self.transferred, "Relay limit reached");
                if let Some(callback) = self.on_limit.take() {
                    callback();
                }
                break;
            }
        }

        // Stop consuming before finalizing so a blocked writer sees a closed pipe
        drop(source);
        self.transition(RelayState::Ending);

        let mut retained = Vec::new();
        for mut destination in destinations {
            let outcome = if destination.finalize {
                destination.sink.shutdown().await
            } else {
                destination.sink.flush().await
            };
            if let Err(e) = outcome {
                return Err(self.fail(&format!("destination finalize failed: {e}")));
            }
            if !destination.finalize {
                retained.push(destination.sink);
            }
        }

        self.transition(RelayState::Closed);
        debug!(
            relay = %self.label,
            transferred = self.transferred,
            limit_reached,
            "Relay finished"
        );

        Ok(RelayReport {
            transferred: self.transferred,
            limit_reached,
            retained,
        })
    }

    fn transition(&mut self, next: RelayState) {
        if self.state.is_terminal() {
            return;
        }
        trace!(relay = %self.label, from = ?self.state, to = ?next, "Relay transition");
        self.state = next;
    }

    fn fail(&mut self, message: &str) -> SessionError {
        self.transition(RelayState::Errored);
        warn!(relay = %self.label, transferred = self.transferred, "{message}");
        SessionError::stream(&self.label, message)
    }
}
