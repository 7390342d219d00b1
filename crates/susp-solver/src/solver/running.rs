//! Re-entrancy guard with a completion signal

use parking_lot::{Condvar, Mutex};

/// `true` while a solve is in flight
#[derive(Debug, Default)]
pub struct RunningFlag {
    running: Mutex<bool>,
    idle: Condvar,
}

impl RunningFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a solve as started; `None` if one is already running
    pub fn try_begin(&self) -> Option<RunningGuard<'_>> {
        let mut running = self.running.lock();
        if *running {
            return None;
        }
        *running = true;
        Some(RunningGuard { flag: self })
    }

    pub fn is_running(&self) -> bool {
        *self.running.lock()
    }

    /// Block until no solve is running
    pub fn wait_idle(&self) {
        let mut running = self.running.lock();
        while *running {
            self.idle.wait(&mut running);
        }
    }
}

/// Clears the flag and wakes waiters when dropped
pub struct RunningGuard<'a> {
    flag: &'a RunningFlag,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        *self.flag.running.lock() = false;
        self.flag.idle.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_second_begin_is_rejected() {
        let flag = RunningFlag::new();
        let guard = flag.try_begin();
        assert!(guard.is_some());
        assert!(flag.is_running());
        assert!(flag.try_begin().is_none());
        drop(guard);
        assert!(!flag.is_running());
        assert!(flag.try_begin().is_some());
    }

    #[test]
    fn test_wait_idle_returns_after_release() {
        let flag = Arc::new(RunningFlag::new());
        let worker = Arc::clone(&flag);
        let (tx, rx) = std::sync::mpsc::channel();
        let handle = thread::spawn(move || {
            let _guard = worker.try_begin();
            tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(20));
        });
        rx.recv().unwrap();
        flag.wait_idle();
        assert!(!flag.is_running());
        handle.join().unwrap();
    }
}
