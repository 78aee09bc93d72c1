//! Cancellation managers.
//!
//! A session owns one manager that `close()` cancels. Every step creates its
//! own manager and hooks it into the session's with a callback, so a session
//! cancel reaches all live steps while a step timeout cancels only that step.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

pub type CancellationToken = u64;

pub type CancelCallback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct State {
    cancelling: bool,
    cancelled: bool,
    callbacks: HashMap<CancellationToken, CancelCallback>,
}

#[derive(Default)]
pub struct CancellationManager {
    next_token: AtomicU64,
    state: Mutex<State>,
    cancelled_cv: Condvar,
}

impl CancellationManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_cancellation_token(&self) -> CancellationToken {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers `callback` to run on cancellation. Returns false, without
    /// keeping the callback, if cancellation has already started.
    pub fn register_callback(&self, token: CancellationToken, callback: CancelCallback) -> bool {
        let mut state = self.state.lock();
        if state.cancelling || state.cancelled {
            return false;
        }
        state.callbacks.insert(token, callback);
        true
    }

    /// Removes a callback. Returns false if cancellation already started, in
    /// which case this waits for every callback to finish before returning.
    pub fn deregister_callback(&self, token: CancellationToken) -> bool {
        let mut state = self.state.lock();
        if state.cancelled {
            return false;
        }
        if state.cancelling {
            while !state.cancelled {
                self.cancelled_cv.wait(&mut state);
            }
            return false;
        }
        state.callbacks.remove(&token);
        true
    }

    /// Like [`deregister_callback`](Self::deregister_callback) but never blocks,
    /// so it is safe to call from inside a cancellation callback.
    pub fn try_deregister_callback(&self, token: CancellationToken) -> bool {
        let mut state = self.state.lock();
        if state.cancelling || state.cancelled {
            return false;
        }
        state.callbacks.remove(&token);
        true
    }

    /// Runs every registered callback once. Callbacks run without the lock held.
    pub fn start_cancel(&self) {
        let callbacks = {
            let mut state = self.state.lock();
            if state.cancelling || state.cancelled {
                return;
            }
            state.cancelling = true;
            std::mem::take(&mut state.callbacks)
        };
        debug!(callbacks = callbacks.len(), "cancelling");
        for (_, callback) in callbacks {
            callback();
        }
        let mut state = self.state.lock();
        state.cancelling = false;
        state.cancelled = true;
        self.cancelled_cv.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    /// True once `start_cancel` has been called, even if callbacks are still running.
    pub fn is_cancelling(&self) -> bool {
        let state = self.state.lock();
        state.cancelling || state.cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_callbacks_run_once() {
        let cm = CancellationManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let hits = hits.clone();
            let token = cm.get_cancellation_token();
            assert!(cm.register_callback(
                token,
                Box::new(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                })
            ));
        }
        cm.start_cancel();
        cm.start_cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert!(cm.is_cancelled());
    }

    #[test]
    fn test_register_after_cancel_fails() {
        let cm = CancellationManager::new();
        cm.start_cancel();
        let token = cm.get_cancellation_token();
        assert!(!cm.register_callback(token, Box::new(|| {})));
        assert!(!cm.deregister_callback(token));
    }

    #[test]
    fn test_deregistered_callback_is_skipped() {
        let cm = CancellationManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let token = cm.get_cancellation_token();
        let h = hits.clone();
        cm.register_callback(
            token,
            Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert!(cm.deregister_callback(token));
        cm.start_cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_callback_may_cancel_another_manager() {
        let session = CancellationManager::new();
        let step = Arc::new(CancellationManager::new());
        let s = step.clone();
        let token = session.get_cancellation_token();
        session.register_callback(token, Box::new(move || s.start_cancel()));
        session.start_cancel();
        assert!(step.is_cancelled());
    }
}
