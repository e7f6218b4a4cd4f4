use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Lock a mutex, recovering the data if a previous holder panicked.
///
/// Registry and supervisor state stay structurally valid across a panic in
/// a single worker, so poisoning is not a reason to take the agent down.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A one-shot flag that can be waited on with a timeout.
#[derive(Debug, Default)]
pub(crate) struct Latch {
    set: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set(&self) {
        *lock(&self.set) = true;
        self.cond.notify_all();
    }

    /// Wait until set or `timeout` elapses. Returns whether the latch is set.
    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut set = lock(&self.set);
        while !*set {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            set = match self.cond.wait_timeout(set, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn latch_times_out_when_unset() {
        let latch = Latch::new();
        assert!(!latch.wait(Duration::from_millis(20)));
        assert!(!latch.wait(Duration::ZERO));
    }

    #[test]
    fn latch_wakes_waiter() {
        let latch = Arc::new(Latch::new());
        let setter = {
            let latch = latch.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                latch.set();
            })
        };
        assert!(latch.wait(Duration::from_secs(5)));
        setter.join().unwrap();
        // Stays set
        assert!(latch.wait(Duration::ZERO));
    }
}
