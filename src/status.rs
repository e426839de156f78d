// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The closed set of outcomes a participant or coordinator can report for an
//! attempt to commit, and the single mapping from those outcomes onto the
//! errors callers of [crate::TransactionAgent::commit] observe.
//!
//! Outcomes fall into two classes that callers must never confuse:
//!
//!   - _Definitely aborted_: nothing was committed anywhere. It is safe to
//!     clean up (the agent cancels the remaining write participants) and to
//!     retry the transaction from scratch.
//!
//!   - _In doubt_: some participant may have irrevocably committed. The
//!     transaction must not be blindly retried.

use crate::TransactionId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionalStatus {
    Ok,

    // Definite aborts.
    PrepareTimeout,
    CascadingAbort,
    BrokenLock,
    LockValidationFailed,
    UserAbort,

    // Everything else leaves the outcome ambiguous.
    ParticipantResponseTimeout,
    TMResponseTimeout,
    StorageConflict,
    PresumedAbort,
    UnknownException,
    CommitFailure,
}

impl Default for TransactionalStatus {
    fn default() -> Self {
        TransactionalStatus::Ok
    }
}

impl std::fmt::Display for TransactionalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

impl TransactionalStatus {
    pub fn is_ok(&self) -> bool {
        *self == TransactionalStatus::Ok
    }

    /// True if this outcome guarantees that no participant committed.
    pub fn definitely_aborted(&self) -> bool {
        match self {
            TransactionalStatus::PrepareTimeout
            | TransactionalStatus::CascadingAbort
            | TransactionalStatus::BrokenLock
            | TransactionalStatus::LockValidationFailed
            | TransactionalStatus::UserAbort => true,
            _ => false,
        }
    }

    /// Maps a protocol outcome onto the error a caller should see. Returns
    /// `None` for [TransactionalStatus::Ok]. This is the only place protocol
    /// outcomes are translated into errors.
    pub fn into_user_error(self, id: TransactionId) -> Option<TransactionError> {
        match self {
            TransactionalStatus::Ok => None,
            TransactionalStatus::PrepareTimeout => Some(TransactionError::PrepareTimeout(id)),
            TransactionalStatus::CascadingAbort => Some(TransactionError::CascadingAbort(id)),
            TransactionalStatus::BrokenLock => Some(TransactionError::BrokenLock {
                id,
                situation: "before prepare".to_string(),
            }),
            TransactionalStatus::LockValidationFailed => Some(TransactionError::BrokenLock {
                id,
                situation: "when validating accesses during prepare".to_string(),
            }),
            status => Some(TransactionError::InDoubt { id, status }),
        }
    }
}

/// The error raised by a failed [crate::TransactionAgent::commit]. Exactly
/// one is raised per failed commit, and it says whether the transaction
/// definitely did not commit or is in doubt.
#[derive(Error, Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionError {
    #[error("Transaction {0} aborted because prepare phase did not complete within timeout")]
    PrepareTimeout(TransactionId),
    #[error("Transaction {0} aborted because a dependent transaction aborted")]
    CascadingAbort(TransactionId),
    #[error("Transaction {id} aborted because a broken lock was detected {situation}")]
    BrokenLock { id: TransactionId, situation: String },
    #[error("Transaction {id} aborted ({status}): {reason}")]
    Aborted {
        id: TransactionId,
        status: TransactionalStatus,
        reason: String,
    },
    #[error("Transaction {id} is in doubt ({status}); its outcome is unknown")]
    InDoubt {
        id: TransactionId,
        status: TransactionalStatus,
    },
}

impl TransactionError {
    pub fn transaction_id(&self) -> TransactionId {
        match self {
            TransactionError::PrepareTimeout(id)
            | TransactionError::CascadingAbort(id)
            | TransactionError::BrokenLock { id, .. }
            | TransactionError::Aborted { id, .. }
            | TransactionError::InDoubt { id, .. } => *id,
        }
    }

    pub fn is_in_doubt(&self) -> bool {
        match self {
            TransactionError::InDoubt { .. } => true,
            _ => false,
        }
    }

    pub fn is_definitely_aborted(&self) -> bool {
        !self.is_in_doubt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::TransactionalStatus::*;

    const ALL: [TransactionalStatus; 12] = [
        Ok,
        PrepareTimeout,
        CascadingAbort,
        BrokenLock,
        LockValidationFailed,
        UserAbort,
        ParticipantResponseTimeout,
        TMResponseTimeout,
        StorageConflict,
        PresumedAbort,
        UnknownException,
        CommitFailure,
    ];

    #[test]
    fn test_definitely_aborted() {
        let aborted: Vec<_> = ALL.iter().filter(|s| s.definitely_aborted()).collect();
        assert_eq!(
            aborted,
            vec![
                &PrepareTimeout,
                &CascadingAbort,
                &BrokenLock,
                &LockValidationFailed,
                &UserAbort
            ]
        );
    }

    #[test]
    fn test_user_error_mapping() {
        let id = TransactionId::new();
        assert_eq!(Ok.into_user_error(id), None);
        assert_eq!(
            PrepareTimeout.into_user_error(id),
            Some(TransactionError::PrepareTimeout(id))
        );
        assert_eq!(
            CascadingAbort.into_user_error(id),
            Some(TransactionError::CascadingAbort(id))
        );
        match BrokenLock.into_user_error(id) {
            Some(TransactionError::BrokenLock { situation, .. }) => {
                assert_eq!(situation, "before prepare")
            }
            other => panic!("unexpected {:?}", other),
        }
        match LockValidationFailed.into_user_error(id) {
            Some(TransactionError::BrokenLock { situation, .. }) => {
                assert!(situation.contains("during prepare"))
            }
            other => panic!("unexpected {:?}", other),
        }
        for s in &[
            UserAbort,
            ParticipantResponseTimeout,
            TMResponseTimeout,
            StorageConflict,
            PresumedAbort,
            UnknownException,
            CommitFailure,
        ] {
            let err = s.into_user_error(id);
            assert_eq!(err, Some(TransactionError::InDoubt { id, status: *s }));
            assert!(err.map(|e| e.is_in_doubt()).unwrap_or(false));
        }
    }

    #[test]
    fn test_error_carries_id() {
        let id = TransactionId::new();
        let err = CascadingAbort.into_user_error(id).unwrap();
        assert_eq!(err.transaction_id(), id);
        assert!(err.is_definitely_aborted());
    }
}
