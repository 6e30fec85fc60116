// ABOUTME: Fixed-capacity text accumulator that keeps only the newest characters
// ABOUTME: Captures the tail of a relayed output channel without unbounded growth
//
// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 dravr.ai

use std::collections::VecDeque;

/// Default tail capacity in characters
pub const DEFAULT_TAIL_CAPACITY: usize = 10_000;

/// Bounded text buffer retaining the most recently pushed characters
///
/// Once the retained length would exceed `capacity`, the oldest characters
/// are evicted so that exactly the newest `capacity` characters remain.
#[derive(Debug, Clone)]
pub struct TailBuffer {
    capacity: usize,
    content: VecDeque<char>,
}

impl TailBuffer {
    /// Create an empty buffer holding at most `capacity` characters
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            content: VecDeque::with_capacity(capacity.min(DEFAULT_TAIL_CAPACITY)),
        }
    }

    /// Maximum number of retained characters
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of characters currently retained
    #[must_use]
    pub fn len(&self) -> usize {
        self.content.len()
    }

    /// Whether nothing is retained
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Append `text`, evicting from the front to stay within capacity
    pub fn push(&mut self, text: &str) {
        if self.capacity == 0 || text.is_empty() {
            return;
        }

        let incoming = text.chars().count();
        if incoming >= self.capacity {
            // Only the suffix of `text` can survive
            self.content.clear();
            self.content.extend(text.chars().skip(incoming - self.capacity));
            return;
        }

        let overflow = (self.content.len() + incoming).saturating_sub(self.capacity);
        self.content.drain(..overflow);
        self.content.extend(text.chars());
    }

    /// Current retained content as a string
    #[must_use]
    pub fn materialize(&self) -> String {
        self.content.iter().collect()
    }
}

impl Default for TailBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_TAIL_CAPACITY)
    }
}
