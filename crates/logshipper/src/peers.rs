// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Peer rotation.
//!
//! The ring is shuffled once when delivery starts, then the head moves to the
//! tail after every delivery cycle whatever its outcome. Consecutive records
//! therefore go to different peers even while every peer is healthy.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::address::PeerAddr;
use crate::errors::ConfigError;

/// Non-empty, rotating list of peers.
#[derive(Debug, Clone)]
pub struct PeerRing {
    peers: VecDeque<PeerAddr>,
}

impl PeerRing {
    /// Parses every spec. Fails on the first malformed one, or on an empty list.
    pub fn from_specs<S: AsRef<str>>(specs: &[S], default_port: u16) -> Result<Self, ConfigError> {
        let peers = specs
            .iter()
            .map(|spec| PeerAddr::parse(spec.as_ref(), default_port))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(peers)
    }

    pub fn new(peers: Vec<PeerAddr>) -> Result<Self, ConfigError> {
        if peers.is_empty() {
            return Err(ConfigError::NoPeers);
        }
        Ok(PeerRing {
            peers: peers.into(),
        })
    }

    /// Shuffles the ring with a random source seeded from the current time.
    pub fn shuffle(&mut self) {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos() as u64)
            .unwrap_or_default();
        self.shuffle_with_seed(seed);
    }

    pub fn shuffle_with_seed(&mut self, seed: u64) {
        let mut rng = fastrand::Rng::with_seed(seed);
        rng.shuffle(self.peers.make_contiguous());
    }

    /// The peer the next delivery cycle targets.
    pub fn current(&self) -> &PeerAddr {
        // never empty, see `new`
        &self.peers[0]
    }

    /// Moves the current head to the tail.
    pub fn advance(&mut self) {
        self.peers.rotate_left(1);
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerAddr> {
        self.peers.iter()
    }
}
