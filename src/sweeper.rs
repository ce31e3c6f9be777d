//! Background expiry sweeper.
//!
//! A sweep walks every stored session in id order and, for each one:
//!
//! 1. deletes it together with its result batch if the record is corrupt;
//! 2. leaves it alone if it has not expired;
//! 3. otherwise writes its result batch (if any) to a CSV file and then
//!    deletes both records.
//!
//! Each session is handled in its own short transaction, so foreground
//! requests interleave with a long sweep instead of waiting for it. If the
//! CSV write fails the transaction rolls back and both records stay in place
//! for the next sweep.
//!
//! The background thread sweeps once per interval, or immediately when a
//! [`FlushSignal`] is raised (logout, task quota). At most one signal is
//! buffered: a signal that arrives mid-sweep causes exactly one more sweep.

use std::fmt;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::codec;
use crate::output::{self, FlushError};
use crate::signal::ShutdownHandler;
use crate::store::{Collection, SessionDb, StoreError};

/// Sender half of the immediate-flush signal.
#[derive(Debug, Clone)]
pub struct FlushSignal {
    tx: SyncSender<()>,
}

impl FlushSignal {
    /// Requests a sweep as soon as possible.
    ///
    /// Returns `false` only if the sweeper has shut down. A request made
    /// while one is already pending is absorbed by the pending one.
    pub fn request(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => true,
            Err(TrySendError::Disconnected(())) => false,
        }
    }
}

/// Receiver half of the immediate-flush signal.
#[derive(Debug)]
pub struct FlushReceiver {
    rx: Receiver<()>,
    // Keeps the channel open and lets the sweeper handle wake the loop.
    wake: SyncSender<()>,
}

impl FlushReceiver {
    /// Consumes a pending request without blocking.
    pub fn try_take(&self) -> bool {
        self.rx.try_recv().is_ok()
    }

    fn waker(&self) -> FlushSignal {
        FlushSignal {
            tx: self.wake.clone(),
        }
    }
}

/// Creates a linked signal/receiver pair with room for one pending request.
#[must_use]
pub fn flush_channel() -> (FlushSignal, FlushReceiver) {
    let (tx, rx) = mpsc::sync_channel(1);
    (
        FlushSignal { tx: tx.clone() },
        FlushReceiver { rx, wake: tx },
    )
}

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Sessions examined.
    pub scanned: usize,
    /// Sessions still valid and left in place.
    pub live: usize,
    /// Expired sessions whose results were written out and removed.
    pub flushed: usize,
    /// Expired sessions without results, removed.
    pub removed_empty: usize,
    /// Undecodable records removed.
    pub corrupt: usize,
    /// Expired sessions left in place because flushing failed.
    pub failed: usize,
}

impl SweepReport {
    /// Whether the sweep changed nothing.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.flushed == 0 && self.removed_empty == 0 && self.corrupt == 0 && self.failed == 0
    }
}

impl fmt::Display for SweepReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "scanned {}, live {}, flushed {}, removed {} empty, {} corrupt, {} failed",
            self.scanned, self.live, self.flushed, self.removed_empty, self.corrupt, self.failed
        )
    }
}

/// What happened to one session during a sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Disposition {
    Gone,
    Live,
    Flushed(PathBuf),
    RemovedEmpty,
    Corrupt,
}

#[derive(Debug, thiserror::Error)]
enum SweepError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("flush failed: {0}")]
    Flush(#[from] FlushError),
}

/// Flushes and removes expired sessions.
#[derive(Debug, Clone)]
pub struct ExpirySweeper {
    db: Arc<SessionDb>,
    output_dir: PathBuf,
}

impl ExpirySweeper {
    /// Creates a sweeper writing flushed batches into `output_dir`.
    #[must_use]
    pub fn new(db: Arc<SessionDb>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            db,
            output_dir: output_dir.into(),
        }
    }

    /// Runs one full sweep now.
    ///
    /// # Errors
    ///
    /// Only if the session keys cannot be listed. Failures on individual
    /// sessions are logged and counted in the report.
    pub fn sweep_once(&self) -> Result<SweepReport, StoreError> {
        let keys = self.db.view(|txn| txn.keys(Collection::Sessions))?;
        let mut report = SweepReport::default();

        for key in keys {
            match self.process(&key, Utc::now()) {
                Ok(Disposition::Gone) => continue,
                Ok(Disposition::Live) => report.live += 1,
                Ok(Disposition::Flushed(path)) => {
                    log::info!("Wrote results file {}", path.display());
                    report.flushed += 1;
                }
                Ok(Disposition::RemovedEmpty) => report.removed_empty += 1,
                Ok(Disposition::Corrupt) => report.corrupt += 1,
                Err(e) => {
                    log::error!("Failed to flush session {}: {}", key, e);
                    report.failed += 1;
                }
            }
            report.scanned += 1;
        }

        if report.is_idle() {
            log::debug!("Sweep finished: {}", report);
        } else {
            log::info!("Sweep finished: {}", report);
        }
        Ok(report)
    }

    /// Handles one session in its own transaction.
    fn process(&self, key: &str, now: DateTime<Utc>) -> Result<Disposition, SweepError> {
        self.db.update(|txn| -> Result<Disposition, SweepError> {
            // Removed since the key listing was taken (logout race).
            let Some(bytes) = txn.get(Collection::Sessions, key)? else {
                return Ok(Disposition::Gone);
            };

            let session = match codec::decode_session(key, &bytes) {
                Ok(session) => session,
                Err(e) => {
                    log::warn!("Deleting session {} and its results, record corrupt: {}", key, e);
                    txn.delete(Collection::Results, key)?;
                    txn.delete(Collection::Sessions, key)?;
                    return Ok(Disposition::Corrupt);
                }
            };

            if !session.is_expired_at(now) {
                return Ok(Disposition::Live);
            }

            let disposition = match txn.get(Collection::Results, key)? {
                None => Disposition::RemovedEmpty,
                Some(bytes) => match codec::decode_results(&bytes) {
                    Ok(batch) => {
                        Disposition::Flushed(output::write_file(&self.output_dir, &session, &batch)?)
                    }
                    Err(e) => {
                        log::warn!("Deleting session {} data, results corrupt: {}", key, e);
                        Disposition::Corrupt
                    }
                },
            };

            txn.delete(Collection::Results, key)?;
            txn.delete(Collection::Sessions, key)?;
            Ok(disposition)
        })
    }

    /// Starts the background sweep loop.
    ///
    /// The loop sweeps immediately, then again after every `interval` or
    /// whenever a request arrives on `signals`, until `shutdown` is
    /// requested or the returned handle is stopped.
    pub fn spawn(
        self,
        interval: Duration,
        signals: FlushReceiver,
        shutdown: ShutdownHandler,
    ) -> std::io::Result<SweeperHandle> {
        let waker = signals.waker();
        let stop = shutdown.clone();
        let thread = thread::Builder::new()
            .name("expiry-sweeper".to_string())
            .spawn(move || self.run(interval, &signals, &stop))?;
        Ok(SweeperHandle {
            shutdown,
            waker,
            thread: Some(thread),
        })
    }

    fn run(&self, interval: Duration, signals: &FlushReceiver, shutdown: &ShutdownHandler) {
        log::debug!(
            "Expiry sweeper started (interval {:?}, output {})",
            interval,
            self.output_dir.display()
        );
        while !shutdown.is_shutdown_requested() {
            if let Err(e) = self.sweep_once() {
                log::error!("Sweep aborted: {}", e);
            }
            match signals.rx.recv_timeout(interval) {
                Ok(()) => log::debug!("Sweep requested"),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        log::debug!("Expiry sweeper stopped");
    }
}

/// Handle to the running sweeper thread. Stops the thread on drop.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: ShutdownHandler,
    waker: FlushSignal,
    thread: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Whether the sweeper thread is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stops the sweeper and waits for the current sweep to finish.
    pub fn stop(mut self) {
        self.stop_inner();
    }

    fn stop_inner(&mut self) {
        self.shutdown.request_shutdown();
        self.waker.request();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Expiry sweeper thread panicked");
            }
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.stop_inner();
    }
}
