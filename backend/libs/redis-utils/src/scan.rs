//! Incremental prefix deletion over `SCAN`.
//!
//! Redis has no delete-by-prefix, and `KEYS` blocks the server for the length
//! of the keyspace. [`KeySweep`] walks the keyspace with a cursor in small
//! batches and deletes each batch before asking for the next one, so a sweep
//! can be stopped at any batch boundary and picked up again from
//! [`KeySweep::cursor`]. Deleting a key that is already gone is a no-op, so
//! re-running a partially finished sweep is safe.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use crate::{with_timeout, DEFAULT_OPERATION_TIMEOUT};

pub const DEFAULT_SCAN_BATCH_SIZE: usize = 50;
pub const DEFAULT_MAX_SCAN_ITERATIONS: u32 = 1000;

/// Progress of a sweep. Returned on success and carried by every interruption.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Keys actually removed by this sweep.
    pub deleted: u64,
    /// `SCAN` round trips performed.
    pub iterations: u32,
    /// Cursor to resume from. Zero once the sweep has finished.
    pub cursor: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error("redis error during key sweep: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("key sweep cancelled after deleting {} keys", .0.deleted)]
    Cancelled(SweepReport),

    #[error("key sweep deadline exceeded after deleting {} keys", .0.deleted)]
    DeadlineExceeded(SweepReport),

    #[error("key sweep exceeded {limit} scan iterations after deleting {} keys", .report.deleted)]
    IterationLimitExceeded { limit: u32, report: SweepReport },
}

impl SweepError {
    /// Progress made before the sweep stopped, if any was tracked.
    pub fn report(&self) -> Option<SweepReport> {
        match self {
            SweepError::Redis(_) => None,
            SweepError::Cancelled(report) | SweepError::DeadlineExceeded(report) => Some(*report),
            SweepError::IterationLimitExceeded { report, .. } => Some(*report),
        }
    }
}

/// Caller-side stop conditions, checked between batches.
#[derive(Debug, Clone, Default)]
pub struct SweepControl {
    deadline: Option<Instant>,
    cancel: Option<watch::Receiver<bool>>,
}

impl SweepControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, budget: Duration) -> Self {
        self.with_deadline(Instant::now() + budget)
    }

    /// Stop once the watched value flips to `true`.
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn interruption(&self, report: SweepReport) -> Option<SweepError> {
        if let Some(cancel) = &self.cancel {
            if *cancel.borrow() {
                return Some(SweepError::Cancelled(report));
            }
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                Some(SweepError::DeadlineExceeded(report))
            }
            _ => None,
        }
    }
}

/// Lazy, resumable cursor over the keys matching one pattern.
#[derive(Debug, Clone)]
pub struct KeySweep {
    pattern: String,
    batch_size: usize,
    max_iterations: u32,
    op_timeout: Duration,
    cursor: u64,
    iterations: u32,
    deleted: u64,
    finished: bool,
}

impl KeySweep {
    /// Sweep every key matching a raw `SCAN MATCH` glob.
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            batch_size: DEFAULT_SCAN_BATCH_SIZE,
            max_iterations: DEFAULT_MAX_SCAN_ITERATIONS,
            op_timeout: DEFAULT_OPERATION_TIMEOUT,
            cursor: 0,
            iterations: 0,
            deleted: 0,
            finished: false,
        }
    }

    /// Sweep every key starting with `prefix`, taken literally.
    pub fn for_prefix(prefix: &str) -> Self {
        Self::new(format!("{}*", escape_glob(prefix)))
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    pub fn op_timeout(mut self, op_timeout: Duration) -> Self {
        self.op_timeout = op_timeout;
        self
    }

    /// Continue an interrupted sweep from the cursor it reported.
    pub fn resume_from(mut self, cursor: u64) -> Self {
        self.cursor = cursor;
        self
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn report(&self) -> SweepReport {
        SweepReport {
            deleted: self.deleted,
            iterations: self.iterations,
            cursor: self.cursor,
        }
    }

    /// Advance the cursor by one `SCAN` call.
    ///
    /// Returns `None` once the server has reported the end of the keyspace.
    /// A batch may be empty while the cursor is still live.
    pub async fn next_batch(
        &mut self,
        conn: &mut ConnectionManager,
    ) -> Result<Option<Vec<String>>, SweepError> {
        if self.finished {
            return Ok(None);
        }
        if self.iterations >= self.max_iterations {
            return Err(SweepError::IterationLimitExceeded {
                limit: self.max_iterations,
                report: self.report(),
            });
        }

        let (next_cursor, keys): (u64, Vec<String>) = with_timeout(
            self.op_timeout,
            redis::cmd("SCAN")
                .arg(self.cursor)
                .arg("MATCH")
                .arg(&self.pattern)
                .arg("COUNT")
                .arg(self.batch_size)
                .query_async(conn),
        )
        .await?;

        self.iterations += 1;
        self.cursor = next_cursor;
        if next_cursor == 0 {
            self.finished = true;
        }

        Ok(Some(keys))
    }

    /// Scan one batch and delete it. Returns the number of keys removed, or
    /// `None` when nothing is left to scan.
    pub async fn delete_next(
        &mut self,
        conn: &mut ConnectionManager,
    ) -> Result<Option<u64>, SweepError> {
        let Some(keys) = self.next_batch(conn).await? else {
            return Ok(None);
        };
        if keys.is_empty() {
            return Ok(Some(0));
        }

        let removed: u64 = with_timeout(self.op_timeout, conn.del(&keys)).await?;
        self.deleted += removed;

        debug!(
            pattern = %self.pattern,
            batch = keys.len(),
            removed,
            cursor = self.cursor,
            "key sweep batch deleted"
        );

        Ok(Some(removed))
    }

    /// Drive the sweep to completion, honouring `control` between batches.
    pub async fn run(
        &mut self,
        conn: &mut ConnectionManager,
        control: &SweepControl,
    ) -> Result<SweepReport, SweepError> {
        loop {
            if let Some(interrupted) = control.interruption(self.report()) {
                return Err(interrupted);
            }
            if self.delete_next(conn).await?.is_none() {
                return Ok(self.report());
            }
        }
    }
}

/// Escape `SCAN MATCH` glob metacharacters so `value` matches only itself.
pub fn escape_glob(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}
