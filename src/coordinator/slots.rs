use crate::coordinator::cancel::CancelReason;
use crate::coordinator::cancel::CancelToken;
use parking_lot::Condvar;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

/// Longest uninterrupted wait, so cancellation is noticed while queued.
const WAIT_SLICE: Duration = Duration::from_millis(10);

struct Shared {
    active: Mutex<usize>,
    released: Condvar,
}

/// Counting gate over section reads.
///
/// The capacity is asked for at every acquisition, so a governor policy change
/// applies to the next caller without resizing anything.
pub(crate) struct WorkerSlots {
    shared: Arc<Shared>,
    capacity: Box<dyn Fn() -> usize + Send + Sync>,
}

/// One taken slot, released on drop.
pub(crate) struct SlotPermit {
    shared: Arc<Shared>,
}

impl WorkerSlots {
    pub(crate) fn new<F>(capacity: F) -> Self
    where
        F: Fn() -> usize + Send + Sync + 'static,
    {
        WorkerSlots {
            shared: Arc::new(Shared {
                active: Mutex::new(0),
                released: Condvar::new(),
            }),
            capacity: Box::new(capacity),
        }
    }

    /// Waits for a free slot. A token cancelled while waiting never takes one.
    pub(crate) fn acquire(&self, cancel: &CancelToken) -> Result<SlotPermit, CancelReason> {
        let mut active = self.shared.active.lock();
        loop {
            cancel.check()?;
            if *active < (self.capacity)().max(1) {
                *active += 1;
                return Ok(self.permit());
            }
            let wait = cancel
                .deadline()
                .map(|deadline| deadline.saturating_duration_since(Instant::now()).min(WAIT_SLICE))
                .unwrap_or(WAIT_SLICE);
            self.shared.released.wait_for(&mut active, wait);
        }
    }

    /// Takes a slot only if one is free right now.
    pub(crate) fn try_acquire(&self) -> Option<SlotPermit> {
        let mut active = self.shared.active.lock();
        if *active < (self.capacity)().max(1) {
            *active += 1;
            Some(self.permit())
        } else {
            None
        }
    }

    #[cfg(test)]
    pub(crate) fn active(&self) -> usize {
        *self.shared.active.lock()
    }

    fn permit(&self) -> SlotPermit {
        SlotPermit {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        *self.shared.active.lock() -= 1;
        self.shared.released.notify_one();
    }
}
