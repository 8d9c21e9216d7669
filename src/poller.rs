//! Bounded-retry polling of a proxy's administrative stats
//!
//! Proxies apply configuration asynchronously, so every wait here polls the
//! stats endpoint at a fixed interval until a predicate holds or the
//! wall-clock budget runs out. There is no cancellation besides the deadline.

use crate::admin::AdminClient;
use crate::config::TimingConfig;
use crate::error::{HarnessError, Result};
use crate::matcher::{check_warmed, Observed, StatExpectation, StatsEndpoint};
use crate::stats::{parse_prometheus, StatsSnapshot};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

/// Interval, budget and initial settle delay of a wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub budget: Duration,
    pub settle: Duration,
}

impl RetryPolicy {
    pub fn new(interval: Duration, budget: Duration) -> Self {
        Self {
            interval,
            budget,
            settle: Duration::ZERO,
        }
    }

    /// Delay before the first attempt (builder pattern)
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Upper bound on attempts within the budget, at least one
    pub fn attempts(&self) -> u32 {
        if self.interval.is_zero() {
            return 1;
        }
        let n = self.budget.as_millis() / self.interval.as_millis().max(1);
        u32::try_from(n).unwrap_or(u32::MAX).max(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(200), Duration::from_secs(3))
    }
}

/// Run `attempt` until it succeeds, the policy's attempts are spent, or the
/// budget's deadline passes.
///
/// Returns the first success immediately. The deadline also cuts off an
/// attempt still in flight, so a hung endpoint can not stretch the wait. On
/// exhaustion the error carries the last failure reason.
pub async fn poll_until<T, F, Fut>(what: &str, policy: RetryPolicy, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, String>>,
{
    if !policy.settle.is_zero() {
        sleep(policy.settle).await;
    }

    let max_attempts = policy.attempts();
    let start = Instant::now();
    let deadline = start + policy.budget;
    let mut last = String::from("no attempt made");
    let mut attempts = 0;

    while attempts < max_attempts {
        attempts += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, attempt()).await {
            Ok(Ok(value)) => {
                debug!(what, attempt = attempts, elapsed_ms = start.elapsed().as_millis(), "Poll satisfied");
                return Ok(value);
            }
            Ok(Err(reason)) => {
                debug!(what, attempt = attempts, %reason, "Poll not yet satisfied");
                last = reason;
            }
            Err(_) => {
                let cut = format!("attempt {} unanswered at the {:?} deadline", attempts, policy.budget);
                last = if attempts == 1 { cut } else { format!("{}; {}", last, cut) };
                break;
            }
        }
        if attempts == max_attempts || Instant::now() + policy.interval > deadline {
            break;
        }
        sleep(policy.interval).await;
    }

    warn!(what, attempts, elapsed_ms = start.elapsed().as_millis(), last = %last, "Poll budget exhausted");
    Err(HarnessError::Convergence {
        what: what.to_string(),
        attempts,
        last,
    })
}

/// Polls one proxy's administrative endpoint
#[derive(Debug, Clone)]
pub struct StatsPoller {
    admin: AdminClient,
    policy: RetryPolicy,
    ready_settle: Duration,
}

impl StatsPoller {
    pub fn new(admin: AdminClient, policy: RetryPolicy) -> Self {
        Self {
            admin,
            policy,
            ready_settle: Duration::ZERO,
        }
    }

    pub fn from_timing(admin: AdminClient, timing: &TimingConfig) -> Self {
        Self {
            admin,
            policy: RetryPolicy::new(timing.poll_interval(), timing.poll_budget()),
            ready_settle: timing.ready_settle(),
        }
    }

    /// Settle delay applied before the first readiness probe (builder pattern)
    pub fn with_ready_settle(mut self, settle: Duration) -> Self {
        self.ready_settle = settle;
        self
    }

    pub fn admin(&self) -> &AdminClient {
        &self.admin
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Wait until the proxy reports no warming listeners or clusters
    pub async fn wait_ready(&self) -> Result<()> {
        let what = format!("readiness of admin port {}", self.admin.port());
        let policy = self.policy.with_settle(self.ready_settle);
        poll_until(&what, policy, || async {
            let snapshot = self.fetch_flat().await?;
            check_warmed(&snapshot).map_err(|m| m.to_string())
        })
        .await?;
        info!(admin_port = self.admin.port(), "Proxy ready");
        Ok(())
    }

    /// Poll until `expectation` holds
    pub async fn verify(&self, expectation: &StatExpectation) -> Result<()> {
        let what = format!("stats on admin port {}", self.admin.port());
        poll_until(&what, self.policy, || async {
            match expectation.endpoint() {
                StatsEndpoint::Json => {
                    let snapshot = self.fetch_flat().await?;
                    expectation
                        .evaluate(Observed::Flat(&snapshot))
                        .map_err(|m| m.to_string())
                }
                StatsEndpoint::Prometheus => {
                    let body = self
                        .admin
                        .stats_prometheus()
                        .await
                        .map_err(|e| e.to_string())?;
                    let families = parse_prometheus(&body).map_err(|e| e.to_string())?;
                    expectation
                        .evaluate(Observed::Families(&families))
                        .map_err(|m| m.to_string())
                }
            }
        })
        .await?;
        info!(admin_port = self.admin.port(), "Stats matched");
        Ok(())
    }

    /// Fetch the flat stats listing once
    pub async fn fetch_stats(&self) -> Result<StatsSnapshot> {
        let body = self.admin.stats_json().await?;
        StatsSnapshot::parse_json(&body)
    }

    /// Sleep for `wait` to let the proxy update stats, then fetch the raw listing once
    pub async fn wait_for_stats_update_and_get_stats(&self, wait: Duration) -> Result<String> {
        sleep(wait).await;
        self.admin.stats_json().await
    }

    async fn fetch_flat(&self) -> std::result::Result<StatsSnapshot, String> {
        let body = self.admin.stats_json().await.map_err(|e| e.to_string())?;
        StatsSnapshot::parse_json(&body).map_err(|e| e.to_string())
    }
}

/// Assert `name < bound` against an already-fetched JSON listing, without polling
pub fn verify_stats_less_than(stats_json: &str, name: &str, bound: i64) -> Result<()> {
    let snapshot = StatsSnapshot::parse_json(stats_json)?;
    StatExpectation::less_than(name, bound).evaluate(Observed::Flat(&snapshot))?;
    info!(name, bound, "Stat below bound");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::Stat;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const READY: &str = r#"{"stats":[{"name":"listener_manager.total_listeners_warming","value":0},{"name":"cluster_manager.warming_clusters","value":0},{"name":"a","value":5}]}"#;
    const WARMING: &str = r#"{"stats":[{"name":"listener_manager.total_listeners_warming","value":1},{"name":"cluster_manager.warming_clusters","value":0}]}"#;

    /// Serve `bodies[min(i, len-1)]` on the i-th request
    async fn scripted_admin(bodies: Vec<&'static str>) -> (u16, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 2048];
                let _ = stream.read(&mut buf).await;
                let i = counter.fetch_add(1, Ordering::SeqCst);
                let body = bodies[i.min(bodies.len() - 1)];
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });
        (port, hits)
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(20), Duration::from_millis(200))
    }

    fn poller(port: u16) -> StatsPoller {
        StatsPoller::new(AdminClient::new(port, Duration::from_secs(1)).unwrap(), fast_policy())
    }

    #[test]
    fn test_reference_policy_makes_fifteen_attempts() {
        assert_eq!(RetryPolicy::default().attempts(), 15);
        assert_eq!(
            RetryPolicy::new(Duration::from_secs(1), Duration::ZERO).attempts(),
            1
        );
    }

    #[tokio::test]
    async fn test_poll_until_returns_first_success() {
        let calls = AtomicUsize::new(0);
        let value = poll_until("counter", fast_policy(), || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n >= 2 {
                Ok(n)
            } else {
                Err(format!("only {}", n))
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_poll_until_reports_last_reason() {
        let calls = AtomicUsize::new(0);
        let err = poll_until("never", fast_policy(), || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(format!("attempt {}", n))
        })
        .await
        .unwrap_err();

        match err {
            HarnessError::Convergence { attempts, last, .. } => {
                let made = calls.load(Ordering::SeqCst);
                assert!((2..=10).contains(&made), "made {} attempts", made);
                assert_eq!(attempts as usize, made);
                assert_eq!(last, format!("attempt {}", made - 1));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_wait_ready_on_ready_proxy_returns_immediately() {
        let (port, hits) = scripted_admin(vec![READY]).await;
        let poller = StatsPoller::new(
            AdminClient::new(port, Duration::from_secs(1)).unwrap(),
            RetryPolicy::new(Duration::from_millis(200), Duration::from_secs(3)),
        );

        let start = Instant::now();
        poller.wait_ready().await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(500));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wait_ready_after_warming() {
        let (port, hits) = scripted_admin(vec![WARMING, WARMING, READY]).await;
        poller(port).wait_ready().await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_wait_ready_times_out_with_last_state() {
        let (port, _) = scripted_admin(vec![WARMING]).await;
        let err = poller(port).wait_ready().await.unwrap_err();

        assert!(matches!(err, HarnessError::Convergence { .. }));
        assert!(err.to_string().contains("still warming: listeners 1"));
    }

    #[tokio::test]
    async fn test_settle_delay_precedes_first_probe() {
        let (port, _) = scripted_admin(vec![READY]).await;
        let poller = poller(port).with_ready_settle(Duration::from_millis(150));

        let start = Instant::now();
        poller.wait_ready().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_verify_exact_and_mismatch() {
        let (port, _) = scripted_admin(vec![READY]).await;
        let poller = poller(port);

        poller
            .verify(&StatExpectation::exact([("a", 5), ("c", 0)]))
            .await
            .unwrap();

        let err = poller
            .verify(&StatExpectation::exact([("a", 6)]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("stat a does not match"));
    }

    #[tokio::test]
    async fn test_verify_prometheus_labels() {
        let (port, _) = scripted_admin(vec![
            "# TYPE requests_total counter\nrequests_total{method=\"GET\"} 3\n",
        ])
        .await;
        let poller = poller(port);

        poller
            .verify(&StatExpectation::labeled([(
                "requests_total",
                Stat::new(3).with_label("method", "GET"),
            )]))
            .await
            .unwrap();

        let err = poller
            .verify(&StatExpectation::labeled([(
                "requests_total",
                Stat::new(3).with_label("method", "POST"),
            )]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("label method differs"));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_keeps_polling_until_budget() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let start = Instant::now();
        let err = poller(port).wait_ready().await.unwrap_err();

        assert!(matches!(err, HarnessError::Convergence { attempts, .. } if attempts >= 2));
        assert!(start.elapsed() >= Duration::from_millis(150));
        assert!(start.elapsed() < Duration::from_millis(600));
    }

    #[tokio::test]
    async fn test_fetch_and_wait_for_stats_update() {
        let (port, _) = scripted_admin(vec![READY]).await;
        let poller = poller(port);

        let snapshot = poller.fetch_stats().await.unwrap();
        assert_eq!(snapshot.get("a"), Some(5));

        let raw = poller
            .wait_for_stats_update_and_get_stats(Duration::from_millis(10))
            .await
            .unwrap();
        verify_stats_less_than(&raw, "a", 6).unwrap();
        assert!(verify_stats_less_than(&raw, "a", 5).is_err());
    }

    /// Accepts connections and never answers
    async fn silent_admin() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        port
    }

    #[tokio::test]
    async fn test_hanging_endpoint_is_bounded_by_budget() {
        let port = silent_admin().await;
        let poller = StatsPoller::new(
            AdminClient::new(port, Duration::from_secs(2)).unwrap(),
            RetryPolicy::new(Duration::from_millis(50), Duration::from_millis(300)),
        );

        let start = Instant::now();
        let err = poller.wait_ready().await.unwrap_err();
        let elapsed = start.elapsed();

        assert!(elapsed < Duration::from_secs(1), "waited {:?}", elapsed);
        match err {
            HarnessError::Convergence { attempts, last, .. } => {
                assert_eq!(attempts, 1);
                assert!(last.contains("unanswered at the 300ms deadline"), "{}", last);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_deadline_cuts_slow_attempt_after_failures() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy::new(Duration::from_millis(20), Duration::from_millis(200));

        let start = Instant::now();
        let err = poll_until("slow", policy, || async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err::<(), _>("first".to_string())
            } else {
                sleep(Duration::from_secs(5)).await;
                Ok(())
            }
        })
        .await
        .unwrap_err();

        assert!(start.elapsed() < Duration::from_millis(600));
        let msg = err.to_string();
        assert!(msg.contains("first; attempt 2 unanswered"), "{}", msg);
    }
}
