//! End-to-end retry and failover behavior through the async rotator.

mod common;

use common::{proxies, proxy, MockTransport, Step};
use std::sync::Arc;
use std::time::Duration;
use whirligig::{
    AttemptOutcome, InstantSleeper, RequestOptions, RetryPolicy, Rotator, RotatorError,
    StrategyKind, TransportErrorKind,
};

fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::builder()
        .max_attempts(max_attempts)
        .unwrap()
        .base_delay(Duration::from_millis(1))
        .unwrap()
        .build()
}

async fn rotator_with(
    transport: Arc<MockTransport>,
    proxies: Vec<whirligig::Proxy>,
    policy: RetryPolicy,
) -> Rotator {
    Rotator::builder()
        .proxies(proxies)
        .strategy_kind(StrategyKind::RoundRobin)
        .retry_policy(policy)
        .transport(transport)
        .sleeper(Arc::new(InstantSleeper))
        .build()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn retries_across_two_proxies_and_succeeds() {
    let pool = proxies(&["p1", "p2"]);
    let transport = Arc::new(
        MockTransport::new()
            .script("p1", [Step::Fail(TransportErrorKind::Connect, "connection refused")])
            .script("p2", [Step::Status(503)]),
    );
    let rotator = rotator_with(Arc::clone(&transport), pool.clone(), fast_policy(3)).await;

    let response = rotator.get("https://httpbin.org/ip", RequestOptions::new()).await.unwrap();

    assert_eq!(response.status.as_u16(), 200);
    assert_eq!(transport.calls(), 3, "three attempts total");

    // Both proxies took a failure; the success landed on one of them.
    let snapshot = rotator.proxies();
    let p1 = snapshot.iter().find(|p| p.host == "p1").unwrap();
    let p2 = snapshot.iter().find(|p| p.host == "p2").unwrap();
    assert!(p1.total_failures >= 1);
    assert!(p2.total_failures >= 1);
    assert_eq!(p1.total_successes + p2.total_successes, 1);

    // Exactly one attempt record per attempt, ordered by attempt number.
    let metrics = rotator.metrics();
    assert_eq!(metrics.attempt_count(), 3);
    let per_proxy = metrics.per_proxy(1);
    let total: u64 = per_proxy.values().map(|s| s.total_attempts).sum();
    assert_eq!(total, 3);

    rotator.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn authentication_error_surfaces_immediately() {
    let pool = vec![proxy("p1")];
    let transport = Arc::new(MockTransport::new().script("p1", [Step::Status(407)]));
    let rotator = rotator_with(Arc::clone(&transport), pool, fast_policy(5)).await;

    let err = rotator.get("https://httpbin.org/ip", RequestOptions::new()).await.unwrap_err();

    assert!(err.is_authentication());
    assert_eq!(transport.calls(), 1, "no retries after an auth failure");

    let metrics = rotator.metrics();
    assert_eq!(metrics.attempt_count(), 1);
    let summary = metrics.summary();
    assert_eq!(summary.total_attempts, 1);
    assert!(summary.failure_by_reason.keys().any(|r| r.contains("authentication")));

    rotator.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn non_idempotent_post_gets_raw_response_back() {
    let pool = vec![proxy("p1")];
    let transport = Arc::new(MockTransport::new().script("p1", [Step::Status(503)]));
    let rotator = rotator_with(Arc::clone(&transport), pool, fast_policy(3)).await;

    let response = rotator
        .post("https://httpbin.org/post", RequestOptions::new().body(b"payload".to_vec()))
        .await
        .unwrap();

    assert_eq!(response.status.as_u16(), 503, "caller sees the raw response");
    assert_eq!(transport.calls(), 1, "POST executes exactly once");
    assert_eq!(rotator.proxies()[0].total_failures, 1);
    assert_eq!(rotator.metrics().attempt_count(), 1);

    rotator.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn exhaustion_reports_attempt_count_and_cause() {
    let pool = vec![proxy("p1")];
    let transport = Arc::new(MockTransport::new().script(
        "p1",
        [
            Step::Fail(TransportErrorKind::Connect, "connection refused"),
            Step::Fail(TransportErrorKind::Connect, "connection refused"),
            Step::Fail(TransportErrorKind::Connect, "connection refused"),
        ],
    ));
    let rotator = rotator_with(Arc::clone(&transport), pool, fast_policy(3)).await;

    let err = rotator.get("https://httpbin.org/ip", RequestOptions::new()).await.unwrap_err();

    assert!(err.is_connection());
    assert!(err.to_string().contains("failed after 3 attempts"));
    let source = std::error::Error::source(&err).expect("last cause attached");
    assert!(source.to_string().contains("refused"));

    rotator.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn non_retryable_transport_error_wraps_cause() {
    let pool = vec![proxy("p1")];
    let transport = Arc::new(
        MockTransport::new().script("p1", [Step::Fail(TransportErrorKind::Decode, "bad gzip")]),
    );
    let rotator = rotator_with(Arc::clone(&transport), pool, fast_policy(5)).await;

    let err = rotator.get("https://httpbin.org/ip", RequestOptions::new()).await.unwrap_err();

    assert!(err.is_non_retryable());
    assert_eq!(transport.calls(), 1);

    rotator.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_pool_raises_pool_empty() {
    let transport = Arc::new(MockTransport::new());
    let rotator = rotator_with(transport, Vec::new(), fast_policy(3)).await;

    let err = rotator.get("https://httpbin.org/ip", RequestOptions::new()).await.unwrap_err();
    assert!(err.is_pool_empty());

    rotator.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn expired_proxies_are_skipped_during_selection() {
    let fresh = proxy("fresh");
    let stale = proxy("stale").with_ttl(0);
    let transport = Arc::new(MockTransport::new());
    let rotator =
        rotator_with(Arc::clone(&transport), vec![stale, fresh], fast_policy(3)).await;

    for _ in 0..4 {
        let picked = rotator.get_proxy().await.unwrap();
        assert_eq!(picked.host, "fresh");
    }

    rotator.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn all_expired_pool_reports_distinct_reason() {
    let transport = Arc::new(MockTransport::new());
    let rotator =
        rotator_with(transport, vec![proxy("a").with_ttl(0), proxy("b").with_ttl(0)], fast_policy(3))
            .await;

    let err = rotator.get_proxy().await.unwrap_err();
    assert!(err.is_pool_empty());
    assert!(err.to_string().contains("expired"));

    rotator.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn whole_call_timeout_interrupts_slow_attempt() {
    let pool = vec![proxy("slow")];
    let transport = Arc::new(MockTransport::new().script(
        "slow",
        [Step::SlowStatus(Duration::from_secs(30), 200)],
    ));
    let policy = RetryPolicy::builder()
        .max_attempts(3)
        .unwrap()
        .timeout(Duration::from_millis(80))
        .unwrap()
        .build();
    let rotator = rotator_with(Arc::clone(&transport), pool, policy).await;

    let started = std::time::Instant::now();
    let err = rotator.get("https://httpbin.org/delay/30", RequestOptions::new()).await.unwrap_err();

    assert!(err.is_connection());
    assert!(err.to_string().contains("timed out"));
    assert!(started.elapsed() < Duration::from_secs(5));

    let metrics = rotator.metrics();
    let events: Vec<_> = metrics.per_proxy(1).into_values().collect();
    assert_eq!(events.len(), 1);

    rotator.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn per_request_policy_override_applies() {
    let pool = vec![proxy("p1")];
    let transport = Arc::new(MockTransport::new().script(
        "p1",
        [
            Step::Fail(TransportErrorKind::Connect, "refused"),
            Step::Fail(TransportErrorKind::Connect, "refused"),
        ],
    ));
    // Global policy would retry 5 times; the override allows only one
    // attempt.
    let rotator = rotator_with(Arc::clone(&transport), pool, fast_policy(5)).await;

    let err = rotator
        .get(
            "https://httpbin.org/ip",
            RequestOptions::new().policy(fast_policy(1)),
        )
        .await
        .unwrap_err();

    assert!(err.is_connection());
    assert!(err.to_string().contains("failed after 1 attempts"));
    assert_eq!(transport.calls(), 1);

    rotator.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn attempt_outcomes_distinguish_status_and_transport_failures() {
    let pool = proxies(&["p1", "p2"]);
    let transport = Arc::new(
        MockTransport::new()
            .script("p1", [Step::Fail(TransportErrorKind::Reset, "connection reset")])
            .script("p2", [Step::Status(502)]),
    );
    let rotator = rotator_with(Arc::clone(&transport), pool, fast_policy(3)).await;

    rotator.get("https://httpbin.org/ip", RequestOptions::new()).await.unwrap();

    let summary = rotator.metrics().summary();
    assert!(summary.failure_by_reason.contains_key("connection reset"));
    assert!(summary.failure_by_reason.contains_key("status 502"));
    assert_eq!(summary.success_by_attempt.values().sum::<u64>(), 1);
    let _ = AttemptOutcome::Success; // outcome enum is part of the public API

    rotator.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn bootstrap_hook_runs_exactly_once() {
    let transport = Arc::new(MockTransport::new());
    let hook_calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let hook_counter = Arc::clone(&hook_calls);

    let rotator = Rotator::builder()
        .retry_policy(fast_policy(3))
        .transport(Arc::clone(&transport) as Arc<dyn whirligig::Transport>)
        .sleeper(Arc::new(InstantSleeper))
        .bootstrap(move || {
            let counter = Arc::clone(&hook_counter);
            async move {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                vec![proxy("bootstrapped")]
            }
        })
        .build()
        .unwrap();

    // First request triggers the hook and then succeeds.
    let response = rotator.get("https://httpbin.org/ip", RequestOptions::new()).await.unwrap();
    assert_eq!(response.status.as_u16(), 200);
    rotator.get("https://httpbin.org/ip", RequestOptions::new()).await.unwrap();
    assert_eq!(hook_calls.load(std::sync::atomic::Ordering::SeqCst), 1);

    rotator.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn exhausted_bootstrap_is_never_reinvoked() {
    let transport = Arc::new(MockTransport::new());
    let hook_calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let hook_counter = Arc::clone(&hook_calls);

    let rotator = Rotator::builder()
        .retry_policy(fast_policy(3))
        .transport(Arc::clone(&transport) as Arc<dyn whirligig::Transport>)
        .bootstrap(move || {
            let counter = Arc::clone(&hook_counter);
            async move {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Vec::new()
            }
        })
        .build()
        .unwrap();

    for _ in 0..3 {
        let err = rotator.get("https://httpbin.org/ip", RequestOptions::new()).await.unwrap_err();
        assert!(matches!(err, RotatorError::PoolEmpty { .. }));
    }
    assert_eq!(
        hook_calls.load(std::sync::atomic::Ordering::SeqCst),
        1,
        "an exhausted bootstrap source must not be retried"
    );

    rotator.close().await;
}
