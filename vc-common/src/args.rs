use clap::Parser;
use std::time::Duration;

/// Syncer-wide tuning knobs, following the `*Args` flatten pattern used
/// throughout the teacher's `common::args`. Every item in spec.md §6's
/// "Configuration recognized" list is represented here.
#[derive(Parser, Debug, Clone)]
pub struct QueueArgs {
    /// FIFO whose last activity is older than this and whose length is 0
    /// is garbage-collected by the idle-queue sweep.
    #[arg(long, env = "QUEUE_EXPIRE_DURATION", default_value = "15m", value_parser = parse_duration_arg)]
    pub queue_expire_duration: Duration,

    /// How often the idle-queue GC sweep runs.
    #[arg(long, env = "IDLE_QUEUE_CHECK_PERIOD", default_value = "2m", value_parser = parse_duration_arg)]
    pub idle_queue_check_period: Duration,

    /// Upper bound on how long `AddAfter`'s waiting loop sleeps before
    /// re-checking its heap, even with no pending entries.
    #[arg(long, env = "QUEUE_MAX_WAIT", default_value = "10s", value_parser = parse_duration_arg)]
    pub max_wait: Duration,
}

impl Default for QueueArgs {
    fn default() -> Self {
        Self {
            queue_expire_duration: Duration::from_secs(15 * 60),
            idle_queue_check_period: Duration::from_secs(2 * 60),
            max_wait: Duration::from_secs(10),
        }
    }
}

fn parse_duration_arg(s: &str) -> Result<Duration, String> {
    parse_duration::parse(s).map_err(|e| e.to_string())
}

#[derive(Parser, Debug, Clone)]
pub struct ReconcileArgs {
    /// Reconcile worker goroutines per resource kind.
    #[arg(long, env = "MAX_CONCURRENT_RECONCILES", default_value_t = 1)]
    pub max_concurrent_reconciles: usize,

    /// Items exceeding this many retries are dropped rather than requeued.
    #[arg(long, env = "MAX_RECONCILE_RETRY_ATTEMPTS", default_value_t = 15)]
    pub max_reconcile_retry_attempts: u32,
}

impl Default for ReconcileArgs {
    fn default() -> Self {
        Self {
            max_concurrent_reconciles: 1,
            max_reconcile_retry_attempts: 15,
        }
    }
}
