// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Newline-delimited record buffer shared by producers and the delivery loop.
//!
//! Producers append arbitrary byte slices. Complete records (terminated by
//! `\n`) are queued; bytes after the last newline wait as a pending fragment
//! until their newline arrives. The delivery loop pops one record at a time,
//! and a popped record is gone from the buffer whatever happens to it next.
//!
//! The lock is a `std::sync::Mutex` held only for the queue operation itself,
//! never across an await, so appending never waits on the network.

use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::warn;

use crate::errors::ConfigError;

/// Longest unterminated fragment a bounded buffer holds. Beyond it the
/// fragment is queued as a record of its own and a fresh fragment starts.
pub const MAX_PENDING_LEN: usize = 64 * 1024;

/// What to do with a record that arrives while a bounded buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Evict the oldest queued record to make room.
    #[default]
    DropOldest,
    /// Discard the incoming record.
    DropNewest,
}

impl FromStr for OverflowPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "drop-oldest" | "drop_oldest" => Ok(OverflowPolicy::DropOldest),
            "drop-newest" | "drop_newest" => Ok(OverflowPolicy::DropNewest),
            other => Err(ConfigError::Invalid(format!(
                "unknown overflow policy '{other}', expected drop-oldest or drop-newest"
            ))),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    records: VecDeque<Vec<u8>>,
    pending: Vec<u8>,
    capacity: Option<usize>,
    overflow: OverflowPolicy,
    dropped: u64,
}

impl Inner {
    fn push_record(&mut self, record: Vec<u8>) {
        if let Some(capacity) = self.capacity {
            if self.records.len() >= capacity {
                self.dropped += 1;
                match self.overflow {
                    OverflowPolicy::DropOldest => {
                        self.records.pop_front();
                    }
                    OverflowPolicy::DropNewest => return,
                }
            }
        }
        self.records.push_back(record);
    }
}

/// Cloneable handle to the shared record buffer.
#[derive(Debug, Clone, Default)]
pub struct LineBuffer {
    inner: Arc<Mutex<Inner>>,
}

impl LineBuffer {
    /// A buffer that grows without limit.
    #[must_use]
    pub fn unbounded() -> Self {
        LineBuffer::default()
    }

    /// A buffer holding at most `capacity` complete records.
    ///
    /// The pending fragment is capped at [`MAX_PENDING_LEN`] bytes as well.
    #[must_use]
    pub fn bounded(capacity: usize, overflow: OverflowPolicy) -> Self {
        LineBuffer {
            inner: Arc::new(Mutex::new(Inner {
                capacity: Some(capacity),
                overflow,
                ..Inner::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // a panicking producer leaves the queue structurally intact
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends `bytes` and returns how many were accepted, always `bytes.len()`.
    pub fn append(&self, bytes: &[u8]) -> usize {
        let mut inner = self.lock();
        let dropped_before = inner.dropped;

        let mut rest = bytes;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let (line, tail) = rest.split_at(pos + 1);
            let mut record = std::mem::take(&mut inner.pending);
            record.extend_from_slice(line);
            inner.push_record(record);
            rest = tail;
        }
        inner.pending.extend_from_slice(rest);
        if inner.capacity.is_some() {
            while inner.pending.len() > MAX_PENDING_LEN {
                let tail = inner.pending.split_off(MAX_PENDING_LEN);
                let record = std::mem::replace(&mut inner.pending, tail);
                inner.push_record(record);
            }
        }

        let newly_dropped = inner.dropped - dropped_before;
        drop(inner);
        if newly_dropped > 0 {
            warn!(dropped = newly_dropped, "line buffer full, records dropped");
        }
        bytes.len()
    }

    /// Removes and returns the oldest complete record, newline included.
    pub fn pop_record(&self) -> Option<Vec<u8>> {
        self.lock().records.pop_front()
    }

    /// Number of complete records waiting.
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    /// Bytes received after the last newline.
    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Records discarded by the overflow policy since creation.
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }
}
