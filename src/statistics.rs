// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Running counts of transaction outcomes seen by one
/// [crate::TransactionAgent]. Shared by all clones of the agent.
#[derive(Default)]
pub(crate) struct AgentStatistics {
    started: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
    in_doubt: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    pub started: u64,
    pub committed: u64,
    pub aborted: u64,
    pub in_doubt: u64,
}

impl AgentStatistics {
    pub(crate) fn track_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn track_committed(&self) {
        self.committed.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn track_aborted(&self) {
        self.aborted.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn track_in_doubt(&self) {
        self.in_doubt.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            started: self.started.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            in_doubt: self.in_doubt.load(Ordering::Relaxed),
        }
    }
}
