//! Injectable time source.
//!
//! All waiting in the agent is sleep-and-retry on the calling task at
//! 1-second granularity. Components never call `tokio::time::sleep`
//! directly — they go through a [`Clock`] handed in at construction, so
//! tests can run retry loops without real delays.

use std::time::{Duration, Instant};

use async_trait::async_trait;

/// Capability object for sleeping and reading monotonic time.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Suspend the calling task.
    async fn sleep(&self, duration: Duration);

    /// Current monotonic instant.
    fn now(&self) -> Instant;
}

/// Production clock backed by the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[cfg(test)]
pub mod test_support {
    //! Fake clock for retry-loop tests.

    use super::*;
    use std::sync::Mutex;

    /// Clock that returns immediately from `sleep` while advancing a
    /// virtual offset, so timeout loops terminate instantly in tests.
    pub struct ManualClock {
        base: Instant,
        offset: Mutex<Duration>,
        pub sleeps: Mutex<Vec<Duration>>,
    }

    impl ManualClock {
        pub fn new() -> Self {
            Self {
                base: Instant::now(),
                offset: Mutex::new(Duration::ZERO),
                sleeps: Mutex::new(Vec::new()),
            }
        }

        pub fn slept(&self) -> usize {
            self.sleeps.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Clock for ManualClock {
        async fn sleep(&self, duration: Duration) {
            *self.offset.lock().unwrap() += duration;
            self.sleeps.lock().unwrap().push(duration);
        }

        fn now(&self) -> Instant {
            self.base + *self.offset.lock().unwrap()
        }
    }
}
