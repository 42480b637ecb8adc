//! When the `fake_time` feature is disabled, this module just re-exports [std::time::SystemTime].
//!
//! When the `fake_time` feature is enabled, an alternative fake [SystemTime] is exported. Inside a future wrapped by
//! [with_fake_time] the clock starts at the unix epoch and only moves when [advance] is called. Outside such a scope
//! the real clock is used. This allows tests to run the attestation timers in a fully deterministic way.

#[cfg(not(feature = "fake_time"))]
pub type SystemTime = std::time::SystemTime;

#[cfg(not(feature = "fake_time"))]
pub async fn with_fake_time<F: std::future::Future>(f: F) -> F::Output {
    f.await
}

#[cfg(feature = "fake_time")]
pub use time_impl::*;

#[cfg(feature = "fake_time")]
mod time_impl {
    use std::{
        future::Future,
        ops::Add,
        sync::{Arc, Mutex},
        time::Duration,
    };

    tokio::task_local! {
        /// Duration between the fake "now" and the `UNIX_EPOCH`, shared by everything running in the scope.
        static FAKE_NOW: Arc<Mutex<Duration>>;
    }

    /// A fake implementation of [std::time::SystemTime]. The value of `SystemTime::now` can be controlled with
    /// [advance].
    #[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct SystemTime(std::time::SystemTime);

    impl SystemTime {
        pub const UNIX_EPOCH: SystemTime = SystemTime(std::time::SystemTime::UNIX_EPOCH);

        pub fn now() -> Self {
            FAKE_NOW
                .try_with(|now| {
                    let offset = *now.lock().unwrap();
                    SystemTime(std::time::SystemTime::UNIX_EPOCH + offset)
                })
                .unwrap_or_else(|_| SystemTime(std::time::SystemTime::now()))
        }

        pub fn elapsed(&self) -> Result<Duration, SystemTimeError> {
            SystemTime::now().duration_since(*self)
        }

        pub fn duration_since(&self, earlier: SystemTime) -> Result<Duration, SystemTimeError> {
            self.0
                .duration_since(earlier.0)
                .map_err(|e| SystemTimeError(e.duration()))
        }
    }

    impl Add<Duration> for SystemTime {
        type Output = SystemTime;

        fn add(self, rhs: Duration) -> SystemTime {
            SystemTime(self.0 + rhs)
        }
    }

    #[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
    pub struct SystemTimeError(Duration);

    impl SystemTimeError {
        pub fn duration(&self) -> Duration {
            self.0
        }
    }

    /// Run `f` with a fake clock paused at the unix epoch.
    pub async fn with_fake_time<F: Future>(f: F) -> F::Output {
        FAKE_NOW.scope(Arc::new(Mutex::new(Duration::ZERO)), f).await
    }

    /// Advance the fake time by this duration. Panics if called outside [with_fake_time].
    pub fn advance(delta: Duration) {
        FAKE_NOW
            .try_with(|now| *now.lock().unwrap() += delta)
            .expect("time is not faked in this task");
    }
}

#[cfg(all(test, feature = "fake_time"))]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn fake_clock_only_moves_when_advanced() {
        with_fake_time(async {
            let start = SystemTime::now();
            assert_eq!(start, SystemTime::UNIX_EPOCH);
            advance(Duration::from_secs(30));
            assert_eq!(start.elapsed().unwrap(), Duration::from_secs(30));
        })
        .await;
    }
}
