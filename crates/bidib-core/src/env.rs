//! Environment abstraction for deterministic testing.
//!
//! Decouples protocol logic (watchdog timers, POM/programming timeouts,
//! diagnostic ids) from real system resources so the same logic can run
//! against a virtual clock in tests and real time in production.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

/// Abstract environment providing time and a monotonic id source.
///
/// # Safety
///
/// Implementations MUST guarantee `now()` never goes backwards within a
/// single execution context.
pub trait Environment: Clone + Send + Sync + 'static {
    /// The specific instant type used by this environment.
    ///
    /// Production environments use `std::time::Instant`; test environments
    /// use a virtual clock they can advance by hand.
    type Instant: Copy + Ord + Send + Sync + std::ops::Sub<Output = Duration>;

    /// Current time (monotonic).
    fn now(&self) -> Self::Instant;

    /// Sleeps for the specified duration.
    ///
    /// This is the only async method in the trait; only driver/executor code
    /// should call it, never the pure dispatch logic.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Returns a fresh, process-unique id for tagging an in-flight
    /// diagnostic (POM message id, pending request correlation, and so on).
    fn next_id(&self) -> u64;
}

/// Production environment using system time and a real sleep.
#[derive(Clone, Default)]
pub struct SystemEnv {
    counter: std::sync::Arc<AtomicU64>,
}

impl SystemEnv {
    /// Creates a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Environment for SystemEnv {
    type Instant = std::time::Instant;

    #[allow(clippy::disallowed_methods)]
    fn now(&self) -> Self::Instant {
        std::time::Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    fn next_id(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }
}

pub use test_clock::TestEnv;

/// A virtual clock, usable both by this crate's own tests and by downstream
/// integration tests (`bidib-host`'s scenario tests run real driver logic
/// against a [`TestEnv`] rather than real time).
mod test_clock {
    use std::sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    };

    use super::{Duration, Environment};

    /// A virtual clock and id source for deterministic tests.
    ///
    /// Time only moves when [`TestEnv::advance`] is called; [`Environment::sleep`]
    /// resolves as soon as the clock has been advanced past its deadline.
    #[derive(Clone, Default)]
    pub struct TestEnv {
        now: Arc<Mutex<Duration>>,
        counter: Arc<AtomicU64>,
    }

    impl TestEnv {
        /// Creates a clock starting at time zero.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Moves the virtual clock forward.
        pub fn advance(&self, by: Duration) {
            let mut now = self.now.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            *now += by;
        }
    }

    impl Environment for TestEnv {
        type Instant = Duration;

        fn now(&self) -> Self::Instant {
            *self.now.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
        }

        async fn sleep(&self, duration: Duration) {
            let deadline = self.now() + duration;
            while self.now() < deadline {
                tokio::task::yield_now().await;
            }
        }

        fn next_id(&self) -> u64 {
            self.counter.fetch_add(1, Ordering::Relaxed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_env_time_advances() {
        let env = SystemEnv::new();
        let t1 = env.now();
        std::thread::sleep(Duration::from_millis(5));
        let t2 = env.now();
        assert!(t2 > t1);
    }

    #[test]
    fn system_env_ids_are_unique() {
        let env = SystemEnv::new();
        let a = env.next_id();
        let b = env.next_id();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_env_sleep_resolves_after_advance() {
        let env = TestEnv::new();
        let env2 = env.clone();
        let handle = tokio::spawn(async move {
            env2.sleep(Duration::from_secs(10)).await;
        });
        tokio::task::yield_now().await;
        env.advance(Duration::from_secs(10));
        handle.await.unwrap();
    }
}
