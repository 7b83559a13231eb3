// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Small synchronization primitives shared by the pool threads.

use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};

/// A counting semaphore used as the dispatcher and collector wake-up
/// barrier. `post` is a short uncontended lock plus a notify, which keeps
/// it usable from the render thread.
pub struct Semaphore {
    count: Mutex<usize>,
    condvar: Condvar,
}

impl Semaphore {
    /// Creates a semaphore with the given initial count.
    pub fn new(initial: usize) -> Self {
        Self {
            count: Mutex::new(initial),
            condvar: Condvar::new(),
        }
    }

    /// Increments the count and wakes one waiter.
    pub fn post(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.condvar.notify_one();
    }

    /// Blocks until the count is positive, then decrements it.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.condvar.wait(&mut count);
        }
        *count -= 1;
    }

    /// Like `wait`, but gives up after `timeout`. Returns whether a unit
    /// was consumed.
    pub fn timed_wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count == 0 {
            if self.condvar.wait_until(&mut count, deadline).timed_out() {
                if *count > 0 {
                    break;
                }
                return false;
            }
        }
        *count -= 1;
        true
    }

    /// Consumes a unit if one is available without blocking.
    pub fn try_wait(&self) -> bool {
        let mut count = self.count.lock();
        if *count > 0 {
            *count -= 1;
            true
        } else {
            false
        }
    }
}

static CLOCK_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic microseconds since the process-wide epoch. Cheap enough to
/// call from a holder drop on the render thread.
pub fn now_micros() -> u64 {
    CLOCK_EPOCH.elapsed().as_micros() as u64
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn test_post_then_wait() {
        let sem = Semaphore::new(0);
        sem.post();
        sem.post();
        sem.wait();
        assert!(sem.try_wait());
        assert!(!sem.try_wait());
    }

    #[test]
    fn test_timed_wait_times_out() {
        let sem = Semaphore::new(0);
        assert!(!sem.timed_wait(Duration::from_millis(10)));
    }

    #[test]
    fn test_post_wakes_blocked_waiter() {
        let sem = Arc::new(Semaphore::new(0));
        let waiter = {
            let sem = sem.clone();
            thread::spawn(move || sem.wait())
        };
        sem.post();
        assert!(waiter.join().is_ok());
    }

    #[test]
    fn test_clock_is_monotonic() {
        let a = now_micros();
        let b = now_micros();
        assert!(b >= a);
    }
}
