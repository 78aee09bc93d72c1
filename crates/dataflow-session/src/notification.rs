//! One-shot notification.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Default)]
pub struct Notification {
    notified: Mutex<bool>,
    cv: Condvar,
}

impl Notification {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wakes every waiter. Later calls have no effect.
    pub fn notify(&self) {
        let mut notified = self.notified.lock();
        if !*notified {
            *notified = true;
            self.cv.notify_all();
        }
    }

    pub fn has_been_notified(&self) -> bool {
        *self.notified.lock()
    }

    pub fn wait(&self) {
        let mut notified = self.notified.lock();
        while !*notified {
            self.cv.wait(&mut notified);
        }
    }

    /// Returns whether the notification fired before `timeout` elapsed.
    pub fn wait_for_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut notified = self.notified.lock();
        while !*notified {
            if self.cv.wait_until(&mut notified, deadline).timed_out() {
                return *notified;
            }
        }
        true
    }
}
