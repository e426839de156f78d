// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{ParticipantId, TransactionInfo};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Picks the participant that acts as transaction manager (TM) for a
/// transaction with at least one write. `writers` is never empty and is
/// ordered by [ParticipantId]; the result should be one of them.
///
/// Any `Fn(&TransactionInfo, &[ParticipantId]) -> ParticipantId` closure is
/// a `TmSelector`.
pub trait TmSelector: Send + Sync + 'static {
    fn select(&self, info: &TransactionInfo, writers: &[ParticipantId]) -> ParticipantId;
}

impl<F> TmSelector for F
where
    F: Fn(&TransactionInfo, &[ParticipantId]) -> ParticipantId + Send + Sync + 'static,
{
    fn select(&self, info: &TransactionInfo, writers: &[ParticipantId]) -> ParticipantId {
        self(info, writers)
    }
}

/// Always the first write participant.
pub struct FirstWriter;
impl TmSelector for FirstWriter {
    fn select(&self, _info: &TransactionInfo, writers: &[ParticipantId]) -> ParticipantId {
        writers[0].clone()
    }
}

/// The candidate that reported the largest batch via
/// [TransactionInfo::nominate_tm], provided it actually wrote; otherwise the
/// first write participant.
pub struct LargestBatchCandidate;
impl TmSelector for LargestBatchCandidate {
    fn select(&self, info: &TransactionInfo, writers: &[ParticipantId]) -> ParticipantId {
        match &info.tm_candidate {
            Some(candidate) if writers.contains(candidate) => candidate.clone(),
            _ => writers[0].clone(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TmSelection {
    FirstWriter,
    LargestBatchCandidate,
}

impl Default for TmSelection {
    fn default() -> Self {
        TmSelection::FirstWriter
    }
}

/// Configuration for a [crate::TransactionAgent]. Deserializable so it can be
/// embedded in whatever configuration format the hosting process uses.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentOptions {
    /// Timeout given to transactions started without an explicit one.
    pub default_timeout: Duration,

    /// Which built-in [TmSelector] the agent starts with.
    pub tm_selection: TmSelection,
}

impl Default for AgentOptions {
    fn default() -> Self {
        AgentOptions {
            default_timeout: Duration::from_secs(10),
            tm_selection: TmSelection::default(),
        }
    }
}
