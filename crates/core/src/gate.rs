//! Binary gate: a shared open/closed signal threads can poll or wait on.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Manual-reset gate. Opening it releases every waiter until it is closed again.
#[derive(Debug, Default)]
pub struct Gate {
    open: Mutex<bool>,
    changed: Condvar,
}

impl Gate {
    pub fn new(open: bool) -> Self {
        Self {
            open: Mutex::new(open),
            changed: Condvar::new(),
        }
    }

    pub fn open(&self) {
        let mut open = self.open.lock();
        *open = true;
        self.changed.notify_all();
    }

    pub fn close(&self) {
        *self.open.lock() = false;
    }

    /// Non-blocking poll.
    pub fn is_open(&self) -> bool {
        *self.open.lock()
    }

    /// Block until open or until `timeout` elapses. Returns whether the gate is open.
    pub fn wait_until_open(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut open = self.open.lock();
        while !*open {
            if self.changed.wait_until(&mut open, deadline).timed_out() {
                return *open;
            }
        }
        true
    }

    /// Block until open.
    pub fn wait(&self) {
        let mut open = self.open.lock();
        while !*open {
            self.changed.wait(&mut open);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_open_close() {
        let gate = Gate::new(false);
        assert!(!gate.is_open());
        gate.open();
        assert!(gate.is_open());
        gate.close();
        assert!(!gate.is_open());
    }

    #[test]
    fn test_wait_times_out() {
        let gate = Gate::new(false);
        let started = Instant::now();
        assert!(!gate.wait_until_open(Duration::from_millis(20)));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_wait_released_by_other_thread() {
        let gate = Arc::new(Gate::new(false));
        let opener = {
            let gate = gate.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                gate.open();
            })
        };

        assert!(gate.wait_until_open(Duration::from_secs(5)));
        opener.join().unwrap();
    }

    #[test]
    fn test_open_gate_returns_immediately() {
        let gate = Gate::new(true);
        assert!(gate.wait_until_open(Duration::ZERO));
        gate.wait();
    }
}
