//! Stat fetching with bounded retries
//!
//! Wraps a [`StatSource`] so that an unreachable kubelet degrades the cycle
//! instead of failing it: after the configured retries the fetcher returns
//! an empty stat list together with a CRITICAL status.

use super::StatSource;
use crate::config::CollectorConfig;
use crate::models::{CheckTarget, FetchStatus, RawContainerStat, ServiceCheckResult};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry behaviour for stat fetches
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first failed attempt
    pub retries: u32,
    /// Fixed delay between attempts
    pub delay: Duration,
    /// Stop retrying once a fetch has succeeded
    pub startup_only: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            delay: Duration::from_secs(1),
            startup_only: false,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &CollectorConfig) -> Self {
        Self {
            retries: config.retries,
            delay: config.retry_delay,
            startup_only: config.retry_startup_only,
        }
    }
}

/// Stat fetcher for one kubelet
pub struct StatFetcher {
    source: Arc<dyn StatSource>,
    policy: RetryPolicy,
    /// Set after the first successful fetch
    has_succeeded: bool,
}

impl StatFetcher {
    pub fn new(source: Arc<dyn StatSource>, policy: RetryPolicy) -> Self {
        Self {
            source,
            policy,
            has_succeeded: false,
        }
    }

    /// Fetch raw stats for this cycle.
    ///
    /// Blocks for at most `retries x delay` plus request timeouts. Never
    /// fails: unreachability is reported through the returned status.
    pub async fn fetch(&mut self) -> (Vec<RawContainerStat>, FetchStatus) {
        if !self.source.stats_enabled() {
            return (Vec::new(), FetchStatus::disabled());
        }

        let retries = if self.policy.startup_only && self.has_succeeded {
            0
        } else {
            self.policy.retries
        };

        let mut attempts = 0u32;
        loop {
            attempts += 1;

            match self.source.fetch_stats().await {
                Ok(stats) => {
                    self.has_succeeded = true;
                    debug!(containers = stats.len(), attempts, "Fetched kubelet stats");
                    return (stats, FetchStatus::ok(attempts));
                }
                Err(e) if e.is_transient() && attempts <= retries => {
                    warn!(
                        error = %e,
                        attempt = attempts,
                        retries,
                        delay_ms = self.policy.delay.as_millis() as u64,
                        "Kubelet stats fetch failed, retrying"
                    );
                    tokio::time::sleep(self.policy.delay).await;
                }
                Err(e) if e.is_transient() => {
                    warn!(error = %e, attempts, "Kubelet unreachable, giving up for this cycle");
                    return (Vec::new(), FetchStatus::critical(e.to_string(), attempts));
                }
                Err(e) => {
                    warn!(error = %e, attempts, "Kubelet stats fetch failed");
                    return (Vec::new(), FetchStatus::warning(e.to_string(), attempts));
                }
            }
        }
    }

    /// Check kubelet liveness
    pub async fn health_check(&self) -> ServiceCheckResult {
        match self.source.check_health().await {
            Ok(()) => ServiceCheckResult::ok(CheckTarget::Kubelet),
            Err(e) if e.is_transient() => {
                ServiceCheckResult::critical(CheckTarget::Kubelet, e.to_string())
            }
            Err(e) => ServiceCheckResult::warning(CheckTarget::Kubelet, e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CollectorError;
    use crate::models::ServiceCheckStatus;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scripted source: pops one result per call, repeating the last
    struct ScriptedSource {
        calls: AtomicUsize,
        script: Mutex<Vec<Result<usize, bool>>>,
        enabled: bool,
    }

    impl ScriptedSource {
        /// `Ok(n)` yields n stats, `Err(true)` a transient error, `Err(false)` a permanent one
        fn new(script: Vec<Result<usize, bool>>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                script: Mutex::new(script),
                enabled: true,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StatSource for ScriptedSource {
        async fn fetch_stats(&self) -> Result<Vec<RawContainerStat>, CollectorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().unwrap();
            let next = if script.len() > 1 {
                script.remove(0)
            } else {
                script[0]
            };
            match next {
                Ok(n) => Ok(vec![RawContainerStat::default(); n]),
                Err(true) => Err(CollectorError::unreachable("http://kubelet", "connection refused")),
                Err(false) => Err(CollectorError::Status {
                    endpoint: "http://kubelet".into(),
                    status: 401,
                }),
            }
        }

        async fn check_health(&self) -> Result<(), CollectorError> {
            Ok(())
        }

        fn stats_enabled(&self) -> bool {
            self.enabled
        }
    }

    fn policy(retries: u32, startup_only: bool) -> RetryPolicy {
        RetryPolicy {
            retries,
            delay: Duration::from_millis(1),
            startup_only,
        }
    }

    #[tokio::test]
    async fn test_success_first_attempt() {
        let source = Arc::new(ScriptedSource::new(vec![Ok(3)]));
        let mut fetcher = StatFetcher::new(source.clone(), policy(2, false));

        let (stats, status) = fetcher.fetch().await;
        assert_eq!(stats.len(), 3);
        assert_eq!(status, FetchStatus::ok(1));
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_recovers_within_retries() {
        let source = Arc::new(ScriptedSource::new(vec![Err(true), Ok(2)]));
        let mut fetcher = StatFetcher::new(source.clone(), policy(2, false));

        let (stats, status) = fetcher.fetch().await;
        assert_eq!(stats.len(), 2);
        assert_eq!(status.status, ServiceCheckStatus::Ok);
        assert_eq!(status.retries(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_every_cycle_retries_exactly() {
        let source = Arc::new(ScriptedSource::new(vec![Err(true)]));
        let mut fetcher = StatFetcher::new(source.clone(), policy(2, false));

        for cycle in 1..=3 {
            let (stats, status) = fetcher.fetch().await;
            assert!(stats.is_empty());
            assert!(status.is_critical());
            assert_eq!(status.retries(), 2);
            assert_eq!(source.calls(), cycle * 3);
        }
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let source = Arc::new(ScriptedSource::new(vec![Err(false)]));
        let mut fetcher = StatFetcher::new(source.clone(), policy(5, false));

        let (stats, status) = fetcher.fetch().await;
        assert!(stats.is_empty());
        assert_eq!(status.status, ServiceCheckStatus::Warning);
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_startup_only_stops_retrying_after_success() {
        let source = Arc::new(ScriptedSource::new(vec![Ok(1), Err(true)]));
        let mut fetcher = StatFetcher::new(source.clone(), policy(2, true));

        let (_, status) = fetcher.fetch().await;
        assert_eq!(status.status, ServiceCheckStatus::Ok);

        let (_, status) = fetcher.fetch().await;
        assert!(status.is_critical());
        assert_eq!(status.attempts, 1);
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_disabled_source_is_not_called() {
        let mut source = ScriptedSource::new(vec![Ok(1)]);
        source.enabled = false;
        let source = Arc::new(source);
        let mut fetcher = StatFetcher::new(source.clone(), policy(2, false));

        let (stats, status) = fetcher.fetch().await;
        assert!(stats.is_empty());
        assert_eq!(status, FetchStatus::disabled());
        assert_eq!(source.calls(), 0);
    }
}
