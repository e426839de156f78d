// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The transaction agent is the client-side coordinator. It hands out
//! [TransactionInfo]s stamped by its [CausalClock], and when asked to commit
//! it looks at what the transaction touched and drives one of two protocols:
//!
//!   - _Read-only_: no participant was written, so there's nothing to make
//!     durable. Every participant gets a `commit_read_only` concurrently and
//!     the transaction succeeds iff all of them answer `Ok`.
//!
//!   - _Two-phase_: one write participant is chosen as transaction manager
//!     (TM) and sent `prepare_and_commit`; every other participant is sent a
//!     one-way `prepare` naming the TM, and reports its vote to the TM rather
//!     than to us. We wait only on the TM, which makes the decision.
//!
//! The agent holds no per-transaction state. Its only shared mutable state is
//! the clock, locked briefly to take a reading and never across an await, so
//! any number of starts, commits and aborts can run concurrently.

use crate::{
    AccessCounter, AgentOptions, CausalClock, Clock, Error, FirstWriter, LargestBatchCandidate,
    ParticipantId, StatisticsSnapshot, SyncBoxFuture, TmSelection, TmSelector, TransactionError,
    TransactionId, TransactionInfo, TransactionParticipant, TransactionalStatus,
};
use crate::statistics::AgentStatistics;
use async_std::{
    future,
    sync::{Arc, Mutex, RwLock},
    task,
};
use futures::future::join_all;
use std::{collections::HashMap, time::Duration};
use tracing::{debug, debug_span, instrument, warn, Instrument};

type Resolved = (ParticipantId, AccessCounter, Arc<dyn TransactionParticipant>);

#[derive(Clone)]
pub struct TransactionAgent {
    pub(crate) clock: Arc<Mutex<CausalClock>>,

    /// Routes from participant identity to something we can send protocol
    /// messages to.
    pub(crate) participants: Arc<RwLock<HashMap<ParticipantId, Arc<dyn TransactionParticipant>>>>,

    pub(crate) tm_selector: Arc<dyn TmSelector>,

    pub(crate) options: AgentOptions,

    pub(crate) statistics: Arc<AgentStatistics>,
}

impl TransactionAgent {
    /// Construct a new agent drawing wall-clock time from `clock`.
    pub fn new(clock: Box<dyn Clock>, options: AgentOptions) -> Self {
        let tm_selector: Arc<dyn TmSelector> = match options.tm_selection {
            TmSelection::FirstWriter => Arc::new(FirstWriter),
            TmSelection::LargestBatchCandidate => Arc::new(LargestBatchCandidate),
        };
        TransactionAgent {
            clock: Arc::new(Mutex::new(CausalClock::new(clock))),
            participants: Arc::new(RwLock::new(HashMap::new())),
            tm_selector,
            options,
            statistics: Arc::new(AgentStatistics::default()),
        }
    }

    /// Replaces the TM selection policy chosen by [AgentOptions].
    pub fn with_tm_selector<T: TmSelector>(mut self, selector: T) -> Self {
        self.tm_selector = Arc::new(selector);
        self
    }

    /// Registers the endpoint protocol messages for `id` are sent to.
    pub async fn connect(&self, id: ParticipantId, participant: Arc<dyn TransactionParticipant>) {
        debug!("connecting participant {:?}", id);
        self.participants.write().await.insert(id, participant);
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.statistics.snapshot()
    }

    /// Starts a transaction: a fresh id, stamped with a clock reading, with no
    /// participants yet. `timeout` bounds each wait during commit and
    /// defaults to [AgentOptions::default_timeout].
    #[instrument(skip(self))]
    pub async fn start_transaction(&self, read_only: bool, timeout: Option<Duration>) -> TransactionInfo {
        let id = TransactionId::new();
        let timestamp = self.clock.lock().await.read_clock();
        let timeout = timeout.unwrap_or(self.options.default_timeout);
        self.statistics.track_started();
        debug!("started transaction {:?} at {:?}", id, timestamp);
        TransactionInfo::new(id, timestamp, read_only, timeout)
    }

    /// Commits the transaction described by `info`. On failure the error says
    /// whether the transaction definitely aborted or is in doubt; an in-doubt
    /// transaction must not be retried as though it had aborted.
    pub async fn commit(&self, info: &mut TransactionInfo) -> Result<(), TransactionError> {
        let span = debug_span!("commit", tid=?info.id);
        let res = self.commit_(info).instrument(span).await;
        match &res {
            Ok(()) => self.statistics.track_committed(),
            Err(e) if e.is_in_doubt() => self.statistics.track_in_doubt(),
            Err(_) => self.statistics.track_aborted(),
        }
        res
    }

    async fn commit_(&self, info: &mut TransactionInfo) -> Result<(), TransactionError> {
        info.timestamp = self
            .clock
            .lock()
            .await
            .merge_and_read_clock(info.timestamp);
        debug!("begin commit at {:?}", info.timestamp);

        let resolved = match self.resolve(info).await {
            Ok(r) => r,
            Err(e) => {
                return Err(TransactionError::Aborted {
                    id: info.id,
                    status: TransactionalStatus::PresumedAbort,
                    reason: e.to_string(),
                })
            }
        };
        let writers = info.write_participants();
        if writers.is_empty() {
            self.commit_read_only(info, resolved).await
        } else {
            self.commit_read_write(info, writers, resolved).await
        }
    }

    async fn resolve(&self, info: &TransactionInfo) -> Result<Vec<Resolved>, Error> {
        let guard = self.participants.read().await;
        info.participants
            .iter()
            .map(|(id, access)| match guard.get(id) {
                Some(p) => Ok((id.clone(), *access, p.clone())),
                None => Err(Error::UnknownParticipant(id.clone())),
            })
            .collect()
    }

    async fn commit_read_only(
        &self,
        info: &mut TransactionInfo,
        resolved: Vec<Resolved>,
    ) -> Result<(), TransactionError> {
        debug!("read-only commit across {} participant(s)", resolved.len());
        let (id, ts) = (info.id, info.timestamp);
        let futs: Vec<_> = resolved
            .iter()
            .map(|(_, access, p)| p.commit_read_only(id, *access, ts))
            .collect();
        info.prepare_messages_sent = true;

        let results = match future::timeout(info.timeout, join_all(futs)).await {
            Ok(results) => results,
            Err(_) => {
                debug!("read-only participants did not answer within {:?}", info.timeout);
                return Err(TransactionError::Aborted {
                    id,
                    status: TransactionalStatus::ParticipantResponseTimeout,
                    reason: format!("no response from participants within {:?}", info.timeout),
                });
            }
        };
        for ((p, _, _), res) in resolved.iter().zip(results) {
            match res {
                Ok(TransactionalStatus::Ok) => (),
                Ok(status) => {
                    debug!("{:?} response from {:?}", status, p);
                    return Err(user_error(status, id));
                }
                Err(e) => {
                    debug!("read-only commit at {:?} failed: {}", p, e);
                    return Err(TransactionError::Aborted {
                        id,
                        status: TransactionalStatus::PresumedAbort,
                        reason: format!("participant {:?} failed: {}", p, e),
                    });
                }
            }
        }
        debug!("read-only commit succeeded");
        Ok(())
    }

    async fn commit_read_write(
        &self,
        info: &mut TransactionInfo,
        writers: Vec<ParticipantId>,
        resolved: Vec<Resolved>,
    ) -> Result<(), TransactionError> {
        let (id, ts) = (info.id, info.timestamp);
        let mut tm = self.tm_selector.select(info, &writers);
        if !writers.contains(&tm) {
            warn!("TM selector chose non-writer {:?}, using first writer", tm);
            tm = writers[0].clone();
        }
        debug!(
            "two-phase commit: tm={:?}, {} writer(s), {} participant(s)",
            tm,
            writers.len(),
            resolved.len()
        );

        let mut tm_fut = None;
        for (p, access, endpoint) in resolved.iter() {
            if *p == tm {
                tm_fut = Some(endpoint.prepare_and_commit(
                    id,
                    *access,
                    ts,
                    writers.clone(),
                    resolved.len(),
                ));
            } else {
                let fut = endpoint.prepare(id, *access, ts, tm.clone());
                self.dispatch_one_way("prepare", id, p.clone(), fut);
            }
        }
        info.prepare_messages_sent = true;

        // Writers are drawn from the same map as `resolved`, so the TM is
        // always found there.
        let tm_fut = match tm_fut {
            Some(f) => f,
            None => {
                return Err(TransactionError::InDoubt {
                    id,
                    status: TransactionalStatus::UnknownException,
                })
            }
        };

        let status = match future::timeout(info.timeout, tm_fut).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                warn!("TM {:?} failed during prepare_and_commit: {}", tm, e);
                return Err(TransactionError::InDoubt {
                    id,
                    status: TransactionalStatus::UnknownException,
                });
            }
            Err(_) => {
                warn!("TM {:?} did not answer within {:?}", tm, info.timeout);
                return Err(TransactionError::InDoubt {
                    id,
                    status: TransactionalStatus::TMResponseTimeout,
                });
            }
        };

        if status.is_ok() {
            debug!("committed");
            return Ok(());
        }
        if status.definitely_aborted() {
            debug!("TM aborted with {:?}, cancelling other writers", status);
            for (p, _, endpoint) in resolved.iter() {
                if *p != tm && writers.contains(p) {
                    let fut = endpoint.cancel(id, ts, status);
                    self.dispatch_one_way("cancel", id, p.clone(), fut);
                }
            }
        } else {
            warn!("TM returned {:?}, outcome unknown", status);
        }
        Err(user_error(status, id))
    }

    /// Aborts a transaction that has not started committing, telling every
    /// participant touched so far to release what it holds. Once commit has
    /// sent any prepare this does nothing: from that point only the commit
    /// protocol may decide the outcome.
    pub async fn abort(&self, info: &mut TransactionInfo, reason: &str) {
        let span = debug_span!("abort", tid=?info.id);
        async move {
            info.record_abort(reason);
            if info.prepare_messages_sent {
                debug!("prepare already sent, leaving outcome to commit protocol");
                return;
            }
            debug!(
                "aborting across {} participant(s): {}",
                info.participants.len(),
                reason
            );
            self.statistics.track_aborted();
            let guard = self.participants.read().await;
            for p in info.participants.keys() {
                match guard.get(p) {
                    Some(endpoint) => {
                        let fut = endpoint.abort(info.id);
                        self.dispatch_one_way("abort", info.id, p.clone(), fut);
                    }
                    None => warn!("cannot abort at unknown participant {:?}", p),
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Sends a one-way message on a background task. Its result is logged and
    /// otherwise ignored; redelivery is the receiving side's problem.
    fn dispatch_one_way(
        &self,
        msg: &'static str,
        id: TransactionId,
        to: ParticipantId,
        fut: SyncBoxFuture<Result<(), Error>>,
    ) {
        let span = debug_span!("one-way", msg = msg, tid=?id, participant=?to);
        task::spawn(
            async move {
                match fut.await {
                    Ok(()) => debug!("delivered"),
                    Err(e) => warn!("one-way {} to {:?} failed: {}", msg, to, e),
                }
            }
            .instrument(span),
        );
    }
}

fn user_error(status: TransactionalStatus, id: TransactionId) -> TransactionError {
    status
        .into_user_error(id)
        .unwrap_or(TransactionError::InDoubt { id, status })
}
