// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Each participant persists every named piece of transactional state as a
//! single [TransactionalStateRecord]: the last committed value plus an
//! ordered log of pending (prepared but not yet committed) versions.
//!
//! A participant's resource manager drives the log through
//! [TransactionalStateStorage::store], which in one atomic read-modify-write
//! can prune aborted versions from the tail, append newly prepared ones, and
//! promote a prefix of the log to committed. The log performs no locking of
//! its own beyond the ETag check: callers serialize their own access per
//! `(participant, state name)`.

use crate::{Error, ETag, ParticipantId, StateKey, StateStore, Timestamp, TransactionId};
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use tracing::{debug, instrument, warn};

/// One tentatively written version of a participant's state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTransactionState<T> {
    pub sequence_id: u64,
    pub transaction_id: TransactionId,
    pub timestamp: Timestamp,

    /// The TM coordinating the transaction that wrote this version, or `None`
    /// if this participant is itself the TM.
    pub transaction_manager: Option<ParticipantId>,

    pub state: T,
}

/// The durable form of one participant's named state.
///
/// `pending_states` is sorted ascending by `sequence_id`, contains no
/// duplicates, and every entry's `sequence_id` is greater than
/// `committed_sequence_id`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionalStateRecord<T> {
    pub committed_state: T,
    pub committed_sequence_id: u64,
    pub metadata: String,
    pub pending_states: Vec<PendingTransactionState<T>>,
}

impl<T> TransactionalStateRecord<T> {
    /// Drops every pending entry after `abort_after`.
    fn abort_after(&mut self, abort_after: u64) {
        if let Some(pos) = self
            .pending_states
            .iter()
            .position(|p| p.sequence_id > abort_after)
        {
            debug!(
                "aborting {} pending state(s) after {}",
                self.pending_states.len() - pos,
                abort_after
            );
            self.pending_states.truncate(pos);
        }
    }

    /// Appends `states`, first discarding any existing entries they
    /// overwrite: a retried prepare replaces what the earlier attempt wrote.
    /// Entries already committed, or below `obsolete_before`, are skipped.
    fn prepare(&mut self, states: Vec<PendingTransactionState<T>>, obsolete_before: u64) {
        let committed = self.committed_sequence_id;
        let offered = states.len();
        let states: Vec<_> = states
            .into_iter()
            .filter(|s| s.sequence_id > committed && s.sequence_id >= obsolete_before)
            .collect();
        if states.len() < offered {
            debug!("skipping {} obsolete state(s)", offered - states.len());
        }
        let first = match states.first() {
            None => return,
            Some(s) => s.sequence_id,
        };
        while let Some(last) = self.pending_states.last() {
            if last.sequence_id >= first {
                self.pending_states.pop();
            } else {
                break;
            }
        }
        debug!("preparing {} state(s) from {}", states.len(), first);
        self.pending_states.extend(states);
    }

    /// Makes the pending entry numbered `commit_up_to` the committed state,
    /// dropping it and everything before it from the log. Ids at or below the
    /// committed one are already done; anything else must be pending.
    fn commit_up_to(&mut self, commit_up_to: u64) -> Result<(), Error> {
        match self
            .pending_states
            .iter()
            .position(|p| p.sequence_id == commit_up_to)
        {
            Some(pos) => {
                debug!("committing {} state(s) up to {}", pos + 1, commit_up_to);
                let mut committed: Vec<_> = self.pending_states.drain(..=pos).collect();
                if let Some(last) = committed.pop() {
                    self.committed_sequence_id = last.sequence_id;
                    self.committed_state = last.state;
                }
                Ok(())
            }
            None if commit_up_to > self.committed_sequence_id => {
                warn!("no pending state {} to commit", commit_up_to);
                Err(Error::MissingPendingState {
                    sequence_id: commit_up_to,
                })
            }
            None => Ok(()),
        }
    }
}

/// A snapshot of a [TransactionalStateRecord] as of `etag`. The `etag` is
/// `None` if nothing has been stored yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadResponse<T> {
    pub etag: Option<ETag>,
    pub committed_state: T,
    pub committed_sequence_id: u64,
    pub metadata: String,
    pub pending_states: Vec<PendingTransactionState<T>>,
}

/// The transactional state log of one participant identity, over a
/// [StateStore] that holds its records.
pub struct TransactionalStateStorage<T, S> {
    identity: String,
    store: S,
    _state: PhantomData<fn() -> T>,
}

impl<T, S> TransactionalStateStorage<T, S>
where
    T: Clone + Default + Send + Sync + 'static,
    S: StateStore<TransactionalStateRecord<T>>,
{
    pub fn new(identity: impl Into<String>, store: S) -> Self {
        TransactionalStateStorage {
            identity: identity.into(),
            store,
            _state: PhantomData,
        }
    }

    fn key(&self, state_name: &str) -> StateKey {
        StateKey::new(self.identity.clone(), state_name)
    }

    async fn read(&self, state_name: &str) -> Result<(TransactionalStateRecord<T>, Option<ETag>), Error> {
        Ok(match self.store.read(&self.key(state_name)).await? {
            Some((record, etag)) => (record, Some(etag)),
            None => (TransactionalStateRecord::default(), None),
        })
    }

    /// Reads the named record, or an empty one if it has never been stored.
    #[instrument(skip(self))]
    pub async fn load(&self, state_name: &str) -> Result<LoadResponse<T>, Error> {
        let (record, etag) = self.read(state_name).await?;
        debug!(
            "loaded at {:?}: committed {}, {} pending",
            etag,
            record.committed_sequence_id,
            record.pending_states.len()
        );
        Ok(LoadResponse {
            etag,
            committed_state: record.committed_state,
            committed_sequence_id: record.committed_sequence_id,
            metadata: record.metadata,
            pending_states: record.pending_states,
        })
    }

    /// Atomically applies, in order: pruning of pending entries after
    /// `abort_after`, appending of `states_to_prepare` (replacing any entries
    /// they overlap), and promotion of pending entry `commit_up_to` to
    /// committed. `metadata` is always replaced. Entries of
    /// `states_to_prepare` that are already committed, or that `commit_up_to`
    /// makes obsolete, are skipped.
    ///
    /// The whole call fails without effect if `expected_etag` is not the
    /// record's current ETag, if `states_to_prepare` is not strictly
    /// ascending, or if `commit_up_to` names a state that is neither committed
    /// nor pending.
    #[instrument(skip(self, metadata, states_to_prepare))]
    pub async fn store(
        &self,
        state_name: &str,
        expected_etag: Option<ETag>,
        metadata: String,
        states_to_prepare: Vec<PendingTransactionState<T>>,
        commit_up_to: Option<u64>,
        abort_after: Option<u64>,
    ) -> Result<ETag, Error> {
        let (mut record, etag) = self.read(state_name).await?;
        if etag != expected_etag {
            return Err(Error::ETagMismatch {
                expected: expected_etag,
                actual: etag,
            });
        }
        validate_prepare(&states_to_prepare)?;

        record.metadata = metadata;
        if let Some(abort_after) = abort_after {
            record.abort_after(abort_after);
        }
        let obsolete_before = commit_up_to.unwrap_or(record.committed_sequence_id);
        record.prepare(states_to_prepare, obsolete_before);
        if let Some(commit_up_to) = commit_up_to {
            record.commit_up_to(commit_up_to)?;
        }

        let new_etag = self.store.write(&self.key(state_name), record, etag).await?;
        debug!("stored, new etag {}", new_etag);
        Ok(new_etag)
    }
}

fn validate_prepare<T>(states: &[PendingTransactionState<T>]) -> Result<(), Error> {
    for pair in states.windows(2) {
        if pair[1].sequence_id <= pair[0].sequence_id {
            return Err(Error::InvalidPendingStates {
                sequence_id: pair[1].sequence_id,
                floor: pair[0].sequence_id,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;
    use async_std::task;

    type Storage = TransactionalStateStorage<String, MemoryStore<TransactionalStateRecord<String>>>;

    fn pending(seq: u64, state: &str) -> PendingTransactionState<String> {
        PendingTransactionState {
            sequence_id: seq,
            transaction_id: TransactionId::new(),
            timestamp: Timestamp::new(seq, 0),
            transaction_manager: None,
            state: state.to_string(),
        }
    }

    fn seqs(states: &[PendingTransactionState<String>]) -> Vec<u64> {
        states.iter().map(|s| s.sequence_id).collect()
    }

    fn storage() -> Storage {
        TransactionalStateStorage::new("actor-1", MemoryStore::new())
    }

    #[test]
    fn test_first_load_is_empty() {
        task::block_on(async {
            let s = storage();
            let r = s.load("balance").await.unwrap();
            assert_eq!(r.etag, None);
            assert_eq!(r.committed_sequence_id, 0);
            assert_eq!(r.committed_state, String::new());
            assert_eq!(r.metadata, "");
            assert!(r.pending_states.is_empty());
        });
    }

    #[test]
    fn test_store_metadata_only() {
        task::block_on(async {
            let s = storage();
            let e1 = s.store("balance", None, "m1".into(), vec![], None, None).await.unwrap();
            let r = s.load("balance").await.unwrap();
            assert_eq!(r.etag, Some(e1.clone()));
            assert_eq!(r.metadata, "m1");

            let e2 = s
                .store("balance", Some(e1), "m2".into(), vec![], None, None)
                .await
                .unwrap();
            let r = s.load("balance").await.unwrap();
            assert_eq!(r.etag, Some(e2));
            assert_eq!(r.metadata, "m2");
            assert_eq!(r.committed_sequence_id, 0);
            assert!(r.pending_states.is_empty());
        });
    }

    #[test]
    fn test_wrong_etag_has_no_effect() {
        task::block_on(async {
            let s = storage();
            let bad = Some(ETag("wrong".into()));
            let res = s.store("balance", bad, "m".into(), vec![pending(1, "x")], None, None).await;
            assert!(matches!(res, Err(Error::ETagMismatch { .. })));
            assert_eq!(s.load("balance").await.unwrap().etag, None);

            let e1 = s
                .store("balance", None, "m".into(), vec![pending(1, "a")], None, None)
                .await
                .unwrap();
            // Stale (absent) etag after the first write.
            let res = s.store("balance", None, "n".into(), vec![], Some(1), None).await;
            assert!(matches!(res, Err(Error::ETagMismatch { .. })));

            let r = s.load("balance").await.unwrap();
            assert_eq!(r.etag, Some(e1));
            assert_eq!(r.metadata, "m");
            assert_eq!(r.committed_sequence_id, 0);
            assert_eq!(seqs(&r.pending_states), vec![1]);
        });
    }

    #[test]
    fn test_prepare_then_commit() {
        task::block_on(async {
            let s = storage();
            let p = pending(1, "a");
            let e1 = s.store("st", None, "".into(), vec![p.clone()], None, None).await.unwrap();
            let r = s.load("st").await.unwrap();
            assert_eq!(r.pending_states, vec![p]);

            s.store("st", Some(e1), "".into(), vec![], Some(1), None).await.unwrap();
            let r = s.load("st").await.unwrap();
            assert_eq!(r.committed_sequence_id, 1);
            assert_eq!(r.committed_state, "a");
            assert!(r.pending_states.is_empty());
        });
    }

    #[test]
    fn test_prepare_and_commit_in_one_step() {
        task::block_on(async {
            let s = storage();
            let states: Vec<_> = (1..=5).map(|i| pending(i, &format!("v{}", i))).collect();
            s.store("st", None, "".into(), states, Some(5), None).await.unwrap();
            let r = s.load("st").await.unwrap();
            assert_eq!(r.committed_sequence_id, 5);
            assert_eq!(r.committed_state, "v5");
            assert!(r.pending_states.is_empty());
        });
    }

    #[test]
    fn test_cancel_all() {
        task::block_on(async {
            let s = storage();
            let states: Vec<_> = (1..=3).map(|i| pending(i, "x")).collect();
            let e1 = s.store("st", None, "".into(), states, None, None).await.unwrap();
            s.store("st", Some(e1), "".into(), vec![], None, Some(0)).await.unwrap();
            let r = s.load("st").await.unwrap();
            assert_eq!(r.committed_sequence_id, 0);
            assert_eq!(r.committed_state, "");
            assert!(r.pending_states.is_empty());
        });
    }

    #[test]
    fn test_commit_one_cancel_one() {
        task::block_on(async {
            let s = storage();
            let e1 = s
                .store("st", None, "".into(), vec![pending(1, "a"), pending(2, "b")], None, None)
                .await
                .unwrap();
            s.store("st", Some(e1), "".into(), vec![], Some(1), Some(1)).await.unwrap();
            let r = s.load("st").await.unwrap();
            assert_eq!(r.committed_sequence_id, 1);
            assert_eq!(r.committed_state, "a");
            assert!(r.pending_states.is_empty());
        });
    }

    #[test]
    fn test_retried_prepare_overwrites_tail() {
        task::block_on(async {
            let s = storage();
            let first: Vec<_> = (4..=7).map(|i| pending(i, &i.to_string())).collect();
            let mut e = s.store("st", None, "".into(), first, Some(4), None).await.unwrap();
            let r = s.load("st").await.unwrap();
            assert_eq!(r.committed_sequence_id, 4);
            assert_eq!(seqs(&r.pending_states), vec![5, 6, 7]);

            e = s
                .store(
                    "st",
                    Some(e),
                    "".into(),
                    vec![pending(6, "6'"), pending(7, "7'"), pending(8, "8'")],
                    None,
                    None,
                )
                .await
                .unwrap();
            let r = s.load("st").await.unwrap();
            assert_eq!(seqs(&r.pending_states), vec![5, 6, 7, 8]);
            assert_eq!(r.pending_states[0].state, "5");
            assert_eq!(r.pending_states[1].state, "6'");
            assert_eq!(r.pending_states[2].state, "7'");

            s.store("st", Some(e), "".into(), vec![], Some(6), None).await.unwrap();
            let r = s.load("st").await.unwrap();
            assert_eq!(r.committed_sequence_id, 6);
            assert_eq!(r.committed_state, "6'");
            assert_eq!(seqs(&r.pending_states), vec![7, 8]);
            assert_eq!(r.pending_states[0].state, "7'");
            assert_eq!(r.pending_states[1].state, "8'");
        });
    }

    #[test]
    fn test_growing_batch() {
        task::block_on(async {
            let s = storage();
            let e = s
                .store(
                    "st",
                    None,
                    "".into(),
                    vec![pending(1, "1"), pending(2, "2"), pending(3, "3a"), pending(4, "4a")],
                    None,
                    None,
                )
                .await
                .unwrap();
            let batch = vec![
                pending(3, "3b"),
                pending(4, "4b"),
                pending(5, "5"),
                pending(6, "6"),
                pending(7, "7"),
                pending(8, "8"),
            ];
            s.store("st", Some(e), "".into(), batch, Some(6), None).await.unwrap();
            let r = s.load("st").await.unwrap();
            assert_eq!(r.committed_sequence_id, 6);
            assert_eq!(r.committed_state, "6");
            assert_eq!(seqs(&r.pending_states), vec![7, 8]);
        });
    }

    #[test]
    fn test_shrinking_batch() {
        task::block_on(async {
            let s = storage();
            let all: Vec<_> = (1..=8).map(|i| pending(i, &format!("{}a", i))).collect();
            let e = s.store("st", None, "".into(), all, None, None).await.unwrap();
            s.store(
                "st",
                Some(e),
                "".into(),
                vec![pending(3, "3b"), pending(4, "4b")],
                Some(3),
                Some(4),
            )
            .await
            .unwrap();
            let r = s.load("st").await.unwrap();
            assert_eq!(r.committed_sequence_id, 3);
            assert_eq!(r.committed_state, "3b");
            assert_eq!(seqs(&r.pending_states), vec![4]);
            assert_eq!(r.pending_states[0].state, "4b");
        });
    }

    #[test]
    fn test_invalid_prepare_rejected() {
        task::block_on(async {
            let s = storage();
            let e = s
                .store("st", None, "".into(), vec![pending(1, "a")], Some(1), None)
                .await
                .unwrap();
            let res = s
                .store("st", Some(e.clone()), "".into(), vec![pending(3, "c"), pending(2, "d")], None, None)
                .await;
            assert!(matches!(res, Err(Error::InvalidPendingStates { sequence_id: 2, floor: 3 })));
            let res = s
                .store("st", Some(e.clone()), "".into(), vec![pending(2, "c"), pending(2, "d")], None, None)
                .await;
            assert!(matches!(res, Err(Error::InvalidPendingStates { .. })));
            assert_eq!(s.load("st").await.unwrap().etag, Some(e));
        });
    }

    #[test]
    fn test_committed_entries_in_prepare_are_skipped() {
        task::block_on(async {
            let s = storage();
            let first: Vec<_> = (1..=4).map(|i| pending(i, &i.to_string())).collect();
            let e = s.store("st", None, "".into(), first, Some(4), None).await.unwrap();

            // A retried batch still carrying 3, which is already committed.
            let e = s
                .store("st", Some(e), "".into(), vec![pending(3, "3'"), pending(5, "5")], None, None)
                .await
                .unwrap();
            let r = s.load("st").await.unwrap();
            assert_eq!(r.committed_sequence_id, 4);
            assert_eq!(r.committed_state, "4");
            assert_eq!(seqs(&r.pending_states), vec![5]);

            // Entries below the commit point are obsolete too.
            let batch = vec![pending(6, "6"), pending(7, "7"), pending(8, "8")];
            s.store("st", Some(e), "".into(), batch, Some(7), None).await.unwrap();
            let r = s.load("st").await.unwrap();
            assert_eq!(r.committed_sequence_id, 7);
            assert_eq!(r.committed_state, "7");
            assert_eq!(seqs(&r.pending_states), vec![8]);
        });
    }

    #[test]
    fn test_commit_of_missing_state_fails() {
        task::block_on(async {
            let s = storage();
            let e = s
                .store("st", None, "m".into(), vec![pending(1, "a"), pending(2, "b")], Some(1), None)
                .await
                .unwrap();
            let res = s.store("st", Some(e.clone()), "n".into(), vec![], Some(5), None).await;
            assert_eq!(res, Err(Error::MissingPendingState { sequence_id: 5 }));
            // Aborting the target in the same call leaves nothing to commit.
            let res = s.store("st", Some(e.clone()), "n".into(), vec![], Some(2), Some(1)).await;
            assert_eq!(res, Err(Error::MissingPendingState { sequence_id: 2 }));

            let r = s.load("st").await.unwrap();
            assert_eq!(r.etag, Some(e.clone()));
            assert_eq!(r.metadata, "m");
            assert_eq!(seqs(&r.pending_states), vec![2]);

            // Re-committing something already committed is harmless.
            s.store("st", Some(e), "n".into(), vec![], Some(1), None).await.unwrap();
            let r = s.load("st").await.unwrap();
            assert_eq!(r.committed_sequence_id, 1);
            assert_eq!(seqs(&r.pending_states), vec![2]);
        });
    }

    #[test]
    fn test_states_are_separate() {
        task::block_on(async {
            let s = storage();
            s.store("one", None, "1".into(), vec![], None, None).await.unwrap();
            let r = s.load("two").await.unwrap();
            assert_eq!(r.etag, None);
            assert_eq!(r.metadata, "");
        });
    }
}
