//! Tower middleware that admits or rejects HTTP requests before the handler.
//!
//! Admitted responses carry the standard quota headers. Denied requests are
//! answered with 429 and never reach the inner service. When the counter store
//! fails, [`FailMode`] decides between forwarding and a 503.

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use http::header::{HeaderName, HeaderValue, RETRY_AFTER};
use http::{HeaderMap, Request, Response, StatusCode};
use tower_layer::Layer;
use tower_service::Service;
use tracing::{debug, error, warn};

use crate::clock::{system_clock, SharedClock};
use crate::config::FailMode;
use crate::context::CallContext;
use crate::ratelimit::{Algorithm, Decision, KeyDeriver, Limiter};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
pub const X_RATELIMIT_WINDOW: HeaderName = HeaderName::from_static("x-ratelimit-window");

/// Quota headers for a decision.
///
/// `X-RateLimit-Window` (whole seconds, rounded up) is only included when
/// `include_window` is set.
pub fn quota_headers(decision: &Decision, include_window: bool) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(decision.reset_unix()));
    if include_window {
        let window = decision.window;
        let secs = window.as_secs() + u64::from(window.subsec_nanos() != 0);
        headers.insert(X_RATELIMIT_WINDOW, HeaderValue::from(secs));
    }
    headers
}

/// Layer that wraps a service with admission control.
#[derive(Clone)]
pub struct AdmissionLayer {
    limiter: Arc<dyn Limiter>,
    deriver: Arc<KeyDeriver>,
    fail_mode: FailMode,
    call_timeout: Option<Duration>,
    clock: SharedClock,
}

impl AdmissionLayer {
    /// Create a layer using the default key deriver, fail-open, no call timeout.
    pub fn new(limiter: Arc<dyn Limiter>) -> Self {
        Self {
            limiter,
            deriver: Arc::new(KeyDeriver::default()),
            fail_mode: FailMode::default(),
            call_timeout: None,
            clock: system_clock(),
        }
    }

    pub fn with_deriver(mut self, deriver: KeyDeriver) -> Self {
        self.deriver = Arc::new(deriver);
        self
    }

    pub fn with_fail_mode(mut self, fail_mode: FailMode) -> Self {
        self.fail_mode = fail_mode;
        self
    }

    /// Bound each admission check. `None` leaves it unbounded.
    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Clock used to compute `Retry-After`.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AdmissionService {
            inner,
            layer: self.clone(),
        }
    }
}

/// Service produced by [`AdmissionLayer`].
#[derive(Clone)]
pub struct AdmissionService<S> {
    inner: S,
    layer: AdmissionLayer,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for AdmissionService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send,
    ReqBody: Send + 'static,
    ResBody: Default + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        // Take the service that was polled ready and leave a fresh clone behind
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let layer = self.layer.clone();
        let key = layer.deriver.derive(&request);

        Box::pin(async move {
            let ctx = match layer.call_timeout {
                Some(timeout) => CallContext::with_timeout(timeout),
                None => CallContext::background(),
            };

            match layer.limiter.admit(&ctx, &key).await {
                Ok(decision) if decision.allowed => {
                    let mut response = inner.call(request).await?;
                    let include_window = decision.algorithm == Algorithm::Sliding;
                    response
                        .headers_mut()
                        .extend(quota_headers(&decision, include_window));
                    Ok(response)
                }
                Ok(decision) => {
                    debug!(
                        key = %key,
                        policy = %decision.policy,
                        limit = decision.limit,
                        "Request rejected by rate limit"
                    );

                    let retry_after = decision.retry_after(layer.clock.now());
                    let mut response = Response::new(ResBody::default());
                    *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
                    let headers = response.headers_mut();
                    let include_window = decision.algorithm == Algorithm::Sliding;
                    headers.extend(quota_headers(&decision, include_window));
                    headers.insert(RETRY_AFTER, HeaderValue::from(retry_after.as_secs()));
                    Ok(response)
                }
                Err(e) => match layer.fail_mode {
                    FailMode::Open => {
                        warn!(key = %key, error = %e, "Admission check failed, allowing request");
                        inner.call(request).await
                    }
                    FailMode::Closed => {
                        error!(key = %key, error = %e, "Admission check failed, rejecting request");
                        let mut response = Response::new(ResBody::default());
                        *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
                        Ok(response)
                    }
                },
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::{AdmissionError, StoreError};
    use crate::ratelimit::{
        FixedWindowLimiter, RateLimitKey, SlidingWindowLimiter, TimeWindow, WindowPolicy,
    };
    use crate::store::{CounterStore, MemoryCounterStore};
    use async_trait::async_trait;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::{service_fn, ServiceExt};

    const T0: i64 = 1_700_000_000_250;

    struct Harness {
        clock: ManualClock,
        shared: SharedClock,
        store: Arc<dyn CounterStore>,
        handled: Arc<AtomicUsize>,
    }

    impl Harness {
        fn new() -> Self {
            let clock = ManualClock::at_millis(T0);
            let shared: SharedClock = Arc::new(clock.clone());
            let store: Arc<dyn CounterStore> =
                Arc::new(MemoryCounterStore::with_clock(shared.clone()));
            Self {
                clock,
                shared,
                store,
                handled: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn fixed(&self, limit: u64) -> AdmissionLayer {
            let policy = WindowPolicy::per(TimeWindow::Second, limit).unwrap();
            let limiter = FixedWindowLimiter::new(self.store.clone(), policy)
                .with_clock(self.shared.clone());
            AdmissionLayer::new(Arc::new(limiter)).with_clock(self.shared.clone())
        }

        async fn send(&self, layer: &AdmissionLayer, request: Request<()>) -> Response<String> {
            let handled = self.handled.clone();
            let service = layer.layer(service_fn(move |_req: Request<()>| {
                let handled = handled.clone();
                async move {
                    handled.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, Infallible>(Response::new("ok".to_string()))
                }
            }));
            service.oneshot(request).await.unwrap()
        }
    }

    fn from_ip(ip: &str) -> Request<()> {
        Request::builder()
            .uri("/orders")
            .header("x-forwarded-for", ip)
            .body(())
            .unwrap()
    }

    struct BrokenLimiter;

    #[async_trait]
    impl Limiter for BrokenLimiter {
        async fn admit(
            &self,
            _ctx: &CallContext,
            _key: &RateLimitKey,
        ) -> Result<Decision, AdmissionError> {
            Err(StoreError::Unavailable("connection refused".to_string()).into())
        }

        async fn describe(
            &self,
            _ctx: &CallContext,
            _key: &RateLimitKey,
        ) -> Result<Decision, AdmissionError> {
            Err(StoreError::Unavailable("connection refused".to_string()).into())
        }
    }

    #[tokio::test]
    async fn test_admitted_response_has_quota_headers() {
        let harness = Harness::new();
        let layer = harness.fixed(3);

        let response = harness.send(&layer, from_ip("203.0.113.9")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body(), "ok");

        let headers = response.headers();
        assert_eq!(headers[X_RATELIMIT_LIMIT], "3");
        assert_eq!(headers[X_RATELIMIT_REMAINING], "2");
        assert_eq!(headers[X_RATELIMIT_RESET], "1700000001");
        assert!(headers.get(X_RATELIMIT_WINDOW).is_none());
    }

    #[tokio::test]
    async fn test_denied_request_never_reaches_handler() {
        let harness = Harness::new();
        let layer = harness.fixed(2);

        for _ in 0..2 {
            let response = harness.send(&layer, from_ip("203.0.113.9")).await;
            assert_eq!(response.status(), StatusCode::OK);
        }

        harness.clock.advance(Duration::from_millis(100));
        let response = harness.send(&layer, from_ip("203.0.113.9")).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[X_RATELIMIT_REMAINING], "0");
        assert_eq!(response.headers()[RETRY_AFTER], "1");
        assert!(response.body().is_empty());
        assert_eq!(harness.handled.load(Ordering::SeqCst), 2);

        // Other callers are unaffected
        let response = harness.send(&layer, from_ip("198.51.100.7")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_sliding_decision_includes_window_header() {
        let harness = Harness::new();
        let policy = WindowPolicy::per(TimeWindow::Minute, 10).unwrap();
        let limiter = SlidingWindowLimiter::new(harness.store.clone(), policy)
            .with_clock(harness.shared.clone());
        let layer = AdmissionLayer::new(Arc::new(limiter));

        let response = harness.send(&layer, from_ip("203.0.113.9")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[X_RATELIMIT_WINDOW], "60");
    }

    #[tokio::test]
    async fn test_fail_open_forwards() {
        let harness = Harness::new();
        let layer = AdmissionLayer::new(Arc::new(BrokenLimiter)).with_fail_mode(FailMode::Open);

        let response = harness.send(&layer, from_ip("203.0.113.9")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(X_RATELIMIT_LIMIT).is_none());
        assert_eq!(harness.handled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fail_closed_rejects() {
        let harness = Harness::new();
        let layer = AdmissionLayer::new(Arc::new(BrokenLimiter)).with_fail_mode(FailMode::Closed);

        let response = harness.send(&layer, from_ip("203.0.113.9")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(harness.handled.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_api_key_callers_share_quota_across_addresses() {
        let harness = Harness::new();
        let layer = harness.fixed(1);

        let request = |ip: &str| {
            Request::builder()
                .header("x-api-key", "svc-key-123456")
                .header("x-forwarded-for", ip)
                .body(())
                .unwrap()
        };

        assert_eq!(harness.send(&layer, request("10.0.0.1")).await.status(), StatusCode::OK);
        assert_eq!(
            harness.send(&layer, request("10.0.0.2")).await.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[test]
    fn test_quota_headers_round_window_up() {
        let policy = WindowPolicy::new("burst", 4, Duration::from_millis(1_500)).unwrap();
        let limiter_decision = Decision {
            allowed: true,
            limit: 4,
            remaining: 1,
            reset: chrono::DateTime::from_timestamp_millis(3_000).unwrap(),
            window: policy.window(),
            policy: policy.name().to_string(),
            algorithm: Algorithm::Sliding,
        };

        let headers = quota_headers(&limiter_decision, true);
        assert_eq!(headers[X_RATELIMIT_WINDOW], "2");
        assert_eq!(headers[X_RATELIMIT_RESET], "3");

        let headers = quota_headers(&limiter_decision, false);
        assert_eq!(headers.len(), 3);
    }
}
