// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{AccessCounter, Error, ParticipantId, SyncBoxFuture, Timestamp, TransactionId, TransactionalStatus};

/// The contract every transactional resource exposes to the
/// [crate::TransactionAgent]. Implementations typically forward each call over
/// some RPC transport to the actor that owns the resource, whose resource
/// manager does the actual locking, validation and logging.
///
/// Every method returns a boxed future; the agent calls the method
/// synchronously and then either awaits the future (request/response calls)
/// or spawns it onto a background task and discards its result (one-way
/// calls). Implementations should therefore do nothing observable until
/// the future is polled, other than capturing their arguments.
///
/// An `Err` from any future means the message could not be delivered or
/// answered; protocol outcomes are always carried as a
/// [TransactionalStatus].
pub trait TransactionParticipant: Send + Sync + 'static {
    /// Validates and releases the participant's read locks for a transaction
    /// that wrote nothing anywhere.
    fn commit_read_only(
        &self,
        id: TransactionId,
        access: AccessCounter,
        timestamp: Timestamp,
    ) -> SyncBoxFuture<Result<TransactionalStatus, Error>>;

    /// One-way. Asks the participant to prepare and report its vote to `tm`.
    fn prepare(
        &self,
        id: TransactionId,
        access: AccessCounter,
        timestamp: Timestamp,
        tm: ParticipantId,
    ) -> SyncBoxFuture<Result<(), Error>>;

    /// Makes this participant the transaction manager: it prepares locally,
    /// collects `participant_count - 1` votes from the other participants,
    /// decides, and durably commits or aborts on behalf of
    /// `write_participants`.
    fn prepare_and_commit(
        &self,
        id: TransactionId,
        access: AccessCounter,
        timestamp: Timestamp,
        write_participants: Vec<ParticipantId>,
        participant_count: usize,
    ) -> SyncBoxFuture<Result<TransactionalStatus, Error>>;

    /// One-way. Tells a prepared write participant the transaction aborted.
    fn cancel(
        &self,
        id: TransactionId,
        timestamp: Timestamp,
        status: TransactionalStatus,
    ) -> SyncBoxFuture<Result<(), Error>>;

    /// One-way. Releases whatever the transaction holds before it prepared.
    fn abort(&self, id: TransactionId) -> SyncBoxFuture<Result<(), Error>>;
}
