// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! A [TransactionInfo] is the context a transaction accumulates as
//! application code runs it: which participants were touched and how, the
//! highest timestamp observed along the way, and the participant nominated to
//! act as commit coordinator. It is owned by the calling context for the life
//! of one transaction, travels (as a fork) with every call made inside the
//! transaction, and is consumed by [crate::TransactionAgent::commit] or
//! [crate::TransactionAgent::abort].

use crate::{Error, Timestamp, TransactionError, TransactionalStatus};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, time::Duration};
use uuid::Uuid;

/// Globally unique transaction identifier, assigned at start and immutable
/// for the transaction's lifetime.
#[derive(Clone, Copy, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub Uuid);

impl TransactionId {
    pub fn new() -> Self {
        TransactionId(Uuid::new_v4())
    }
}

impl std::fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("txn:{}", self.0))
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// Identifies one transactional resource: a named piece of state owned by a
/// particular actor. An actor holding several named states is several
/// participants.
#[derive(Clone, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParticipantId {
    pub actor: String,
    pub name: String,
}

impl ParticipantId {
    pub fn new(actor: impl Into<String>, name: impl Into<String>) -> Self {
        ParticipantId {
            actor: actor.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Debug for ParticipantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{}/{}", self.actor, self.name))
    }
}

/// How a transaction has accessed one participant so far.
#[derive(Clone, Copy, Debug, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccessCounter {
    pub reads: u32,
    pub writes: u32,
}

impl AccessCounter {
    pub fn is_write(&self) -> bool {
        self.writes > 0
    }

    pub fn add(&mut self, other: &AccessCounter) {
        self.reads = self.reads.saturating_add(other.reads);
        self.writes = self.writes.saturating_add(other.writes);
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInfo {
    pub id: TransactionId,

    /// Snapshot time of the transaction; only ever moves upward, as
    /// participants and the agent merge their clocks into it.
    pub timestamp: Timestamp,

    pub is_read_only: bool,

    /// Bound on every awaited call the agent makes while committing.
    pub timeout: Duration,

    pub participants: BTreeMap<ParticipantId, AccessCounter>,

    /// The participant nominated to coordinate the commit, and the size of
    /// the batch it reported when nominating itself. A larger batch wins.
    pub tm_candidate: Option<ParticipantId>,
    pub tm_batch_size: u32,

    /// Becomes true exactly once, when the agent first sends any prepare or
    /// read-only commit message. From then on only the commit protocol may
    /// decide the outcome and [crate::TransactionAgent::abort] does nothing.
    pub prepare_messages_sent: bool,

    /// The first reason recorded for aborting, if any.
    pub abort_reason: Option<String>,

    /// Forks of this info sent out with calls that have not yet been joined
    /// back.
    pub pending_calls: i32,
}

impl TransactionInfo {
    pub fn new(id: TransactionId, timestamp: Timestamp, is_read_only: bool, timeout: Duration) -> Self {
        TransactionInfo {
            id,
            timestamp,
            is_read_only,
            timeout,
            participants: BTreeMap::new(),
            tm_candidate: None,
            tm_batch_size: 0,
            prepare_messages_sent: false,
            abort_reason: None,
            pending_calls: 0,
        }
    }

    pub fn record_read(&mut self, participant: ParticipantId) {
        self.participants.entry(participant).or_default().reads += 1;
    }

    pub fn record_write(&mut self, participant: ParticipantId) -> Result<(), Error> {
        if self.is_read_only {
            return Err(Error::WriteInReadOnlyTransaction);
        }
        self.participants.entry(participant).or_default().writes += 1;
        Ok(())
    }

    /// Offers `participant` as commit coordinator. It replaces the current
    /// candidate only if its batch is larger.
    pub fn nominate_tm(&mut self, participant: ParticipantId, batch_size: u32) {
        if self.tm_candidate.is_none() || batch_size > self.tm_batch_size {
            self.tm_candidate = Some(participant);
            self.tm_batch_size = batch_size;
        }
    }

    pub fn write_participants(&self) -> Vec<ParticipantId> {
        self.participants
            .iter()
            .filter(|(_, access)| access.is_write())
            .map(|(p, _)| p.clone())
            .collect()
    }

    /// Makes the copy of this info that travels with an outgoing call. It
    /// shares identity and timestamp but starts with no participants; the
    /// callee's accesses come back via [TransactionInfo::join].
    pub fn fork(&mut self) -> TransactionInfo {
        self.pending_calls += 1;
        TransactionInfo {
            participants: BTreeMap::new(),
            pending_calls: 0,
            ..self.clone()
        }
    }

    /// Folds the info returned from a call back into this one.
    pub fn join(&mut self, other: &TransactionInfo) {
        debug_assert_eq!(self.id, other.id);
        self.pending_calls -= 1;
        if other.timestamp > self.timestamp {
            self.timestamp = other.timestamp;
        }
        for (p, access) in other.participants.iter() {
            self.participants.entry(p.clone()).or_default().add(access);
        }
        if let Some(candidate) = &other.tm_candidate {
            self.nominate_tm(candidate.clone(), other.tm_batch_size);
        }
        if let Some(reason) = &other.abort_reason {
            self.record_abort(reason.clone());
        }
        self.pending_calls += other.pending_calls;
    }

    /// Records why the transaction must abort. Only the first reason is
    /// kept.
    pub fn record_abort(&mut self, reason: impl Into<String>) {
        if self.abort_reason.is_none() {
            self.abort_reason = Some(reason.into());
        }
    }

    /// Calls that went out with a fork but never came back leave us unable to
    /// know what they touched, so the transaction has to abort.
    pub fn reconcile_pending(&mut self) {
        if self.pending_calls != 0 {
            let n = self.pending_calls;
            self.record_abort(format!("{} orphaned call(s) did not return", n));
        }
    }

    /// Returns the error to raise instead of committing, if anything recorded
    /// so far forces an abort.
    pub fn must_abort(&self) -> Option<TransactionError> {
        self.abort_reason.as_ref().map(|reason| TransactionError::Aborted {
            id: self.id,
            status: TransactionalStatus::UserAbort,
            reason: reason.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> TransactionInfo {
        TransactionInfo::new(
            TransactionId::new(),
            Timestamp::new(100, 0),
            false,
            Duration::from_secs(1),
        )
    }

    #[test]
    fn test_record_accesses() {
        let mut i = info();
        let a = ParticipantId::new("a", "s");
        let b = ParticipantId::new("b", "s");
        i.record_read(a.clone());
        i.record_write(a.clone()).unwrap();
        i.record_read(b.clone());
        assert_eq!(i.participants[&a], AccessCounter { reads: 1, writes: 1 });
        assert_eq!(i.participants[&b], AccessCounter { reads: 1, writes: 0 });
        assert_eq!(i.write_participants(), vec![a]);
    }

    #[test]
    fn test_write_in_read_only() {
        let mut i = TransactionInfo::new(TransactionId::new(), Timestamp::default(), true, Duration::from_secs(1));
        assert_eq!(
            i.record_write(ParticipantId::new("a", "s")),
            Err(Error::WriteInReadOnlyTransaction)
        );
        assert!(i.participants.is_empty());
    }

    #[test]
    fn test_nominate_tm_by_batch_size() {
        let mut i = info();
        let a = ParticipantId::new("a", "s");
        let b = ParticipantId::new("b", "s");
        i.nominate_tm(a.clone(), 3);
        i.nominate_tm(b.clone(), 2);
        assert_eq!(i.tm_candidate, Some(a));
        i.nominate_tm(b.clone(), 4);
        assert_eq!(i.tm_candidate, Some(b));
        assert_eq!(i.tm_batch_size, 4);
    }

    #[test]
    fn test_fork_and_join() {
        let mut i = info();
        let a = ParticipantId::new("a", "s");
        let b = ParticipantId::new("b", "s");
        i.record_read(a.clone());

        let mut f = i.fork();
        assert_eq!(i.pending_calls, 1);
        assert!(f.participants.is_empty());
        assert_eq!(f.id, i.id);

        f.record_write(a.clone()).unwrap();
        f.record_write(b.clone()).unwrap();
        f.timestamp = Timestamp::new(200, 0);
        f.nominate_tm(b.clone(), 7);

        i.join(&f);
        i.reconcile_pending();
        assert_eq!(i.pending_calls, 0);
        assert_eq!(i.timestamp, Timestamp::new(200, 0));
        assert_eq!(i.participants[&a], AccessCounter { reads: 1, writes: 1 });
        assert_eq!(i.participants[&b], AccessCounter { reads: 0, writes: 1 });
        assert_eq!(i.tm_candidate, Some(b));
        assert!(i.must_abort().is_none());
    }

    #[test]
    fn test_orphaned_fork_forces_abort() {
        let mut i = info();
        let _lost = i.fork();
        i.reconcile_pending();
        match i.must_abort() {
            Some(TransactionError::Aborted { id, .. }) => assert_eq!(id, i.id),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_first_abort_reason_wins() {
        let mut i = info();
        let mut f = i.fork();
        f.record_abort("callee failed");
        i.record_abort("caller failed");
        i.join(&f);
        assert_eq!(i.abort_reason.as_deref(), Some("caller failed"));
    }
}
