// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Exponential backoff between failed delivery attempts.

use std::time::Duration;

/// Lower bound of the backoff delay.
pub const DEFAULT_BACKOFF_FLOOR: Duration = Duration::from_millis(16);
/// Upper bound of the backoff delay.
pub const DEFAULT_BACKOFF_CEILING: Duration = Duration::from_millis(1024);

/// Running backoff delay shared by every failure kind.
///
/// Each failure doubles the current delay, clamped to `[floor, ceiling]`.
/// Starting from zero the sequence is 16, 32, 64, ... 1024, 1024 ms with the
/// default bounds.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    floor: Duration,
    ceiling: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::new(DEFAULT_BACKOFF_FLOOR, DEFAULT_BACKOFF_CEILING)
    }
}

impl Backoff {
    #[must_use]
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        Backoff {
            current: Duration::ZERO,
            floor,
            ceiling: ceiling.max(floor),
        }
    }

    /// Records a failure and returns the delay to wait before the next attempt.
    pub fn next(&mut self) -> Duration {
        self.current = self
            .current
            .saturating_mul(2)
            .clamp(self.floor, self.ceiling);
        self.current
    }

    /// The delay applied by the most recent failure, zero if none yet.
    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn reset(&mut self) {
        self.current = Duration::ZERO;
    }
}
