use std::fmt::Display;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CancelReason {
    /// [`CancelToken::cancel`] was called.
    Cancelled,
    /// The token's deadline passed.
    DeadlineExceeded,
}

impl Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::Cancelled => write!(f, "cancelled by caller"),
            CancelReason::DeadlineExceeded => write!(f, "deadline exceeded"),
        }
    }
}

/// Cooperative cancellation handle for one fetch.
///
/// Clones share the cancellation flag, so a caller keeps one clone and hands
/// another to the request. A token may also carry a deadline.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        CancelToken {
            cancelled: Arc::default(),
            deadline: Some(deadline),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// `Err` once cancelled or past the deadline; explicit cancellation wins.
    pub fn check(&self) -> Result<(), CancelReason> {
        if self.cancelled.load(Ordering::Acquire) {
            Err(CancelReason::Cancelled)
        } else if self.deadline.map(|deadline| Instant::now() >= deadline).unwrap_or(false) {
            Err(CancelReason::DeadlineExceeded)
        } else {
            Ok(())
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.check().is_err()
    }
}
