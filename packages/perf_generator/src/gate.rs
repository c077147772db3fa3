use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Condvar, Mutex, PoisonError,
    },
    time::Duration,
};

/// One-shot readiness signal. Producers wait on it before their first request.
#[derive(Default)]
pub struct EvaluationGate {
    ready: Mutex<bool>,
    changed: Condvar,
}

impl EvaluationGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the gate. Returns `true` only for the call which actually opened it.
    pub fn open(&self) -> bool {
        let mut ready = self.ready.lock().unwrap_or_else(PoisonError::into_inner);
        if *ready {
            return false;
        }
        *ready = true;
        self.changed.notify_all();
        true
    }

    pub fn is_open(&self) -> bool {
        *self.ready.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until the gate is open or `stop` is raised. Returns `true` when the gate is open.
    ///
    /// `stop` is re-checked at least every `poll`, [`Self::wake_all`] makes it immediate.
    pub fn wait(&self, stop: &AtomicBool, poll: Duration) -> bool {
        let mut ready = self.ready.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if *ready {
                return true;
            }
            if stop.load(Ordering::Acquire) {
                return false;
            }
            ready = self.changed.wait_timeout(ready, poll).unwrap_or_else(PoisonError::into_inner).0;
        }
    }

    /// Wakes every waiter so it can re-check the stop flag.
    pub fn wake_all(&self) {
        let _guard = self.ready.lock().unwrap_or_else(PoisonError::into_inner);
        self.changed.notify_all();
    }
}
