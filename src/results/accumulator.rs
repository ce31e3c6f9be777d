//! Transactional accumulation of submitted result rows.

use std::sync::Arc;

use chrono::Utc;

use crate::codec;
use crate::error::{SessionError, SessionResult};
use crate::results::data::{ResultBatch, ResultRow, ResultSubmission};
use crate::session::store::{read_session, write_session};
use crate::session::SessionId;
use crate::store::{Collection, SessionDb};
use crate::sweeper::FlushSignal;

/// What a single append did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Rows added to the batch.
    pub appended: usize,
    /// The session's task count after this append.
    pub task_count: u32,
    /// Whether this append used up the session's task quota and expired it.
    pub quota_reached: bool,
    /// Whether an undecodable stored batch was discarded and started afresh.
    pub replaced_corrupt: bool,
}

/// Merges submitted rows into each session's result batch.
#[derive(Debug, Clone)]
pub struct ResultAccumulator {
    db: Arc<SessionDb>,
    max_tasks: Option<u32>,
    flush_signal: Option<FlushSignal>,
}

impl ResultAccumulator {
    /// Creates an accumulator without a task quota.
    #[must_use]
    pub fn new(db: Arc<SessionDb>) -> Self {
        Self {
            db,
            max_tasks: None,
            flush_signal: None,
        }
    }

    /// Expire a session once it has submitted `max_tasks` batches.
    #[must_use]
    pub fn with_task_quota(mut self, max_tasks: Option<u32>) -> Self {
        self.max_tasks = max_tasks;
        self
    }

    /// Set the signal raised when the quota expires a session.
    #[must_use]
    pub fn with_flush_signal(mut self, signal: FlushSignal) -> Self {
        self.flush_signal = Some(signal);
        self
    }

    /// Appends `rows` to the batch of session `id`.
    ///
    /// The session record and its batch are read, merged, and written back in
    /// one transaction, and the session's task count goes up by one. A stored
    /// batch that fails to decode is logged and replaced instead of blocking
    /// every later submission for the session.
    ///
    /// # Errors
    ///
    /// `NotFound`, `Expired`, or `Corrupt` for the session record itself;
    /// `Persistence` if the transaction fails.
    pub fn append(&self, id: &SessionId, rows: Vec<ResultRow>) -> SessionResult<AppendOutcome> {
        self.merge(id, None, rows)
    }

    /// Appends a front-end submission, using its header task as a fallback
    /// task label.
    pub fn append_submission(
        &self,
        id: &SessionId,
        submission: ResultSubmission,
    ) -> SessionResult<AppendOutcome> {
        let task = submission.task();
        self.merge(id, task, submission.data)
    }

    /// Returns the full batch accumulated for session `id`.
    pub fn get(&self, id: &SessionId) -> SessionResult<ResultBatch> {
        let bytes = self
            .db
            .view(|txn| txn.get(Collection::Results, id.as_str()))?
            .ok_or_else(|| SessionError::NotFound(id.clone()))?;
        codec::decode_results(&bytes)
            .map_err(|e| SessionError::corrupt(Collection::Results, id.as_str(), e))
    }

    fn merge(
        &self,
        id: &SessionId,
        header_task: Option<String>,
        rows: Vec<ResultRow>,
    ) -> SessionResult<AppendOutcome> {
        let outcome = self.db.update(|txn| -> SessionResult<AppendOutcome> {
            let mut session = read_session(txn, id)?;
            let now = Utc::now();
            if session.is_expired_at(now) {
                return Err(SessionError::Expired(id.clone()));
            }

            let mut replaced_corrupt = false;
            let mut batch = match txn.get(Collection::Results, id.as_str())? {
                None => ResultBatch::new(),
                Some(bytes) => codec::decode_results(&bytes).unwrap_or_else(|e| {
                    log::warn!("Replacing corrupt result batch {}: {}", id, e);
                    replaced_corrupt = true;
                    ResultBatch::new()
                }),
            };

            let appended = batch.append_rows(rows);
            if let Some(task) = &header_task {
                batch.seed_task(task);
            }
            let bytes = codec::encode_results(&batch).map_err(SessionError::Encode)?;
            txn.put(Collection::Results, id.as_str(), &bytes)?;

            session.task_count = session.task_count.saturating_add(1);
            let quota_reached = self
                .max_tasks
                .is_some_and(|max| session.task_count >= max);
            if quota_reached {
                session.expiration = now;
            }
            write_session(txn, &session)?;

            Ok(AppendOutcome {
                appended,
                task_count: session.task_count,
                quota_reached,
                replaced_corrupt,
            })
        })?;

        log::debug!(
            "Appended {} row(s) to session {} (task {})",
            outcome.appended,
            id,
            outcome.task_count
        );
        if outcome.quota_reached {
            log::info!(
                "Session {} reached its task quota after {} task(s)",
                id,
                outcome.task_count
            );
            if let Some(signal) = &self.flush_signal {
                signal.request();
            }
        }
        Ok(outcome)
    }
}
