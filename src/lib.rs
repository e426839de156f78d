// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! # Overview
//!
//! This crate implements the core of a protocol for ACID transactions spanning
//! many independently-hosted actors ("participants"), each owning a private
//! piece of durable state, without any central lock manager. It consists of:
//!
//!   - A [TransactionAgent], the client-side coordinator that starts
//!     transactions and drives them to commit or abort.
//!
//!   - A [CausalClock] (a hybrid logical clock) issuing the timestamps that
//!     order transactions across participants.
//!
//!   - The [TransactionalStatus] taxonomy of commit outcomes, and its mapping
//!     onto [TransactionError].
//!
//!   - The [TransactionalStateStorage] log each participant uses to persist
//!     pending and committed versions of its state over an ETag-guarded
//!     [StateStore].
//!
//! Participants themselves (their locking, queueing and validation), the RPC
//! transport, and concrete durable stores are supplied by the client through
//! the [TransactionParticipant] and [StateStore] traits.
//!
//! ## Summary
//!
//! The short version of the protocol is:
//!
//!   - A transaction is started by the agent, which assigns it a unique id and
//!     a timestamp from its clock.
//!
//!   - As application code touches participants, each access is recorded in
//!     the transaction's [TransactionInfo], along with any timestamps from the
//!     future observed along the way.
//!
//!   - If nothing was written, commit just asks every participant to validate
//!     its reads, in parallel.
//!
//!   - Otherwise one write participant becomes transaction manager (TM). It
//!     alone is awaited; all other participants prepare and vote directly to
//!     it. If the TM reports a definite abort, the other writers are told to
//!     cancel.
//!
//!   - Any outcome the agent cannot be sure of (a TM timeout, say) is reported
//!     as in doubt, never as an abort, so callers don't retry a transaction
//!     that may have committed.
//!
//! ## Caveats
//!
//!  - One-way protocol messages are fire-and-forget. Their delivery, retry
//!    and idempotence are the participants' responsibility.
//!
//!  - There's no deadlock detection here; participants break deadlocks with
//!    lock timeouts, which surface as [TransactionalStatus::PrepareTimeout] or
//!    [TransactionalStatus::BrokenLock].

use futures::Future;
use serde::{Deserialize, Serialize};
use std::{fmt::Debug, pin::Pin};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Error {
    #[error("Networking error")]
    NetworkingError,
    #[error("Unknown participant {0:?}")]
    UnknownParticipant(ParticipantId),
    #[error("Storage conflict")]
    StorageConflict,
    #[error("ETag does not match: expected {expected:?}, found {actual:?}")]
    ETagMismatch {
        expected: Option<ETag>,
        actual: Option<ETag>,
    },
    #[error("Pending state {sequence_id} is not above {floor}")]
    InvalidPendingStates { sequence_id: u64, floor: u64 },
    #[error("No pending state {sequence_id} to commit")]
    MissingPendingState { sequence_id: u64 },
    #[error("Write attempted in a read-only transaction")]
    WriteInReadOnlyTransaction,
}

mod agent;
mod clock;
mod options;
mod participant;
mod state_log;
mod statistics;
mod status;
mod storage;
mod timestamp;
mod transaction;


// We define a BoxFuture-like wrapper type here and use it at every trait seam
// where the client supplies asynchronous behaviour (participants and stores):
// it costs an extra heap allocation per call, but keeps those traits object
// safe without compiler support for async trait methods.
//
// We don't use the standard BoxFuture type because we want our boxed futures to
// also implement Sync, which the standard one doesn't.
pub type SyncBoxFuture<T> = Pin<Box<dyn Future<Output = T> + 'static + Send + Sync>>;

pub use agent::TransactionAgent;
pub use clock::{CausalClock, Clock, ManualClock, RealClock, TestClock};
pub use options::{AgentOptions, FirstWriter, LargestBatchCandidate, TmSelection, TmSelector};
pub use participant::TransactionParticipant;
pub use state_log::{
    LoadResponse, PendingTransactionState, TransactionalStateRecord, TransactionalStateStorage,
};
pub use statistics::StatisticsSnapshot;
pub use status::{TransactionError, TransactionalStatus};
pub use storage::{ETag, MemoryStore, StateKey, StateStore};
pub use timestamp::Timestamp;
pub use transaction::{AccessCounter, ParticipantId, TransactionId, TransactionInfo};
