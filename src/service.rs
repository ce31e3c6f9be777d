//! The session service: store, accumulator, and sweeper wired together.
//!
//! [`SessionService`] owns one database handle and shares it between the
//! [`SessionStore`], the [`ResultAccumulator`], and the [`ExpirySweeper`].
//! Logout and task-quota expiry raise the shared flush signal, which wakes
//! the background sweeper if it has been started.
//!
//! # Example
//!
//! ```rust,no_run
//! use activebrain::config::Config;
//! use activebrain::results::ResultRow;
//! use activebrain::service::SessionService;
//!
//! let service = SessionService::open(&Config::default())?;
//! let session = service.create_session("alice")?;
//! service.append_results(&session.id, vec![ResultRow::new().with("rt", 512)])?;
//! service.expire_session(&session)?;
//! service.sweep_now()?;
//! service.close()?;
//! # Ok::<(), activebrain::error::SessionError>(())
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::auth::Authenticator;
use crate::config::Config;
use crate::error::{SessionError, SessionResult};
use crate::results::{AppendOutcome, ResultAccumulator, ResultBatch, ResultRow, ResultSubmission};
use crate::session::{SequenceCarryOver, Session, SessionEntry, SessionId, SessionStore};
use crate::signal::ShutdownHandler;
use crate::store::SessionDb;
use crate::sweeper::{flush_channel, ExpirySweeper, FlushReceiver, SweepReport, SweeperHandle};

/// Facade over the whole session lifecycle.
#[derive(Debug)]
pub struct SessionService {
    db: Arc<SessionDb>,
    sessions: SessionStore,
    results: ResultAccumulator,
    sweeper: ExpirySweeper,
    receiver: Mutex<Option<FlushReceiver>>,
    handle: Option<SweeperHandle>,
    sweep_interval: Duration,
}

impl SessionService {
    /// Opens the database named in `config` and builds the service.
    ///
    /// The background sweeper is not started; call
    /// [`start_sweeper`](Self::start_sweeper) for that.
    pub fn open(config: &Config) -> SessionResult<Self> {
        let db = SessionDb::open(&config.database_path)?;
        Ok(Self::with_db(Arc::new(db), config))
    }

    /// Builds the service over an already opened database.
    #[must_use]
    pub fn with_db(db: Arc<SessionDb>, config: &Config) -> Self {
        let (signal, receiver) = flush_channel();
        let sessions = SessionStore::new(Arc::clone(&db), config.token_ttl())
            .with_scope(config.sequence_scope)
            .with_flush_signal(signal.clone());
        let results = ResultAccumulator::new(Arc::clone(&db))
            .with_task_quota(config.max_tasks_per_session)
            .with_flush_signal(signal);
        let sweeper = ExpirySweeper::new(Arc::clone(&db), config.output_dir.clone());
        Self {
            db,
            sessions,
            results,
            sweeper,
            receiver: Mutex::new(Some(receiver)),
            handle: None,
            sweep_interval: config.sweep_interval(),
        }
    }

    /// Consults `carry_over` when numbering new sessions.
    #[must_use]
    pub fn with_carry_over(mut self, carry_over: Arc<dyn SequenceCarryOver>) -> Self {
        self.sessions = self.sessions.with_carry_over(carry_over);
        self
    }

    /// Checks credentials and creates a session on success.
    ///
    /// # Errors
    ///
    /// `Unauthorized` if `authenticator` rejects the credentials.
    pub fn login(
        &self,
        authenticator: &dyn Authenticator,
        username: &str,
        password: &str,
    ) -> SessionResult<Session> {
        if !authenticator.challenge(username, password) {
            log::info!("Rejected login for {}", username);
            return Err(SessionError::Unauthorized(username.to_string()));
        }
        self.create_session(username)
    }

    /// Creates a session for `user`.
    pub fn create_session(&self, user: &str) -> SessionResult<Session> {
        self.sessions.create(user)
    }

    /// Looks up a valid session.
    pub fn get_session(&self, id: &SessionId) -> SessionResult<Session> {
        self.sessions.get(id)
    }

    /// Logs `session` out. Its results are flushed by the next sweep, which
    /// the running sweeper starts right away.
    pub fn expire_session(&self, session: &Session) -> SessionResult<Session> {
        self.sessions.expire(session)
    }

    /// Lists every stored session, including expired and corrupt ones.
    pub fn list_sessions(&self) -> SessionResult<Vec<SessionEntry>> {
        self.sessions.scan()
    }

    /// Appends result rows to a session's batch.
    pub fn append_results(&self, id: &SessionId, rows: Vec<ResultRow>) -> SessionResult<AppendOutcome> {
        self.results.append(id, rows)
    }

    /// Appends a portal upload body to a session's batch.
    pub fn append_submission(
        &self,
        id: &SessionId,
        submission: ResultSubmission,
    ) -> SessionResult<AppendOutcome> {
        self.results.append_submission(id, submission)
    }

    /// Returns the batch accumulated so far for a session.
    pub fn get_results(&self, id: &SessionId) -> SessionResult<ResultBatch> {
        self.results.get(id)
    }

    /// Runs one sweep on the calling thread.
    pub fn sweep_now(&self) -> SessionResult<SweepReport> {
        Ok(self.sweeper.sweep_once()?)
    }

    /// Starts the background sweeper.
    ///
    /// Returns `Ok(false)` if it was already started.
    pub fn start_sweeper(&mut self, shutdown: ShutdownHandler) -> std::io::Result<bool> {
        let slot = match self.receiver.get_mut() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(receiver) = slot.take() else {
            return Ok(false);
        };
        let handle = self
            .sweeper
            .clone()
            .spawn(self.sweep_interval, receiver, shutdown)?;
        self.handle = Some(handle);
        Ok(true)
    }

    /// Whether the background sweeper thread is running.
    #[must_use]
    pub fn is_sweeper_running(&self) -> bool {
        self.handle.as_ref().is_some_and(SweeperHandle::is_running)
    }

    /// Stops the sweeper, waiting for an in-progress sweep, and closes the
    /// database.
    pub fn close(self) -> SessionResult<()> {
        let Self {
            db,
            sessions,
            results,
            sweeper,
            handle,
            ..
        } = self;
        if let Some(handle) = handle {
            handle.stop();
        }
        drop((sessions, results, sweeper));

        match Arc::try_unwrap(db) {
            Ok(db) => db.close()?,
            Err(_) => log::debug!("Database handle still shared, closing on last drop"),
        }
        log::debug!("Session service closed");
        Ok(())
    }
}
