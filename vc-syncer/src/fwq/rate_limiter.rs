//! Per-item exponential backoff for rate-limited re-adds, reusing the
//! full-jitter formula from `vc_common::wait::backoff_full_jitter`
//! rather than reimplementing it.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use tokio::time::Duration;

const BASE: Duration = Duration::from_millis(250);
const CAP: Duration = Duration::from_secs(120);

pub struct RateLimiter<T: Eq + Hash> {
    attempts: Mutex<HashMap<T, u32>>,
}

impl<T: Eq + Hash + Clone> RateLimiter<T> {
    pub fn new() -> Self {
        Self {
            attempts: Mutex::new(HashMap::new()),
        }
    }

    pub fn next_backoff(&self, item: &T) -> Duration {
        let mut attempts = self.attempts.lock().unwrap();
        let count = attempts.entry(item.clone()).or_insert(0);
        let delay = vc_common::wait::backoff_full_jitter(BASE, CAP, *count as usize);
        *count += 1;
        delay
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        *self.attempts.lock().unwrap().get(item).unwrap_or(&0)
    }

    pub fn forget(&self, item: &T) {
        self.attempts.lock().unwrap().remove(item);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_with_attempts_and_forget_resets() {
        let rl: RateLimiter<&str> = RateLimiter::new();
        assert_eq!(rl.num_requeues(&"x"), 0);
        rl.next_backoff(&"x");
        rl.next_backoff(&"x");
        assert_eq!(rl.num_requeues(&"x"), 2);
        rl.forget(&"x");
        assert_eq!(rl.num_requeues(&"x"), 0);
    }
}
