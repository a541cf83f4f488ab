//! Rate-limit coordinator
//!
//! Owns the route→queue and bucket-hash→queue maps plus the global
//! cooldown, and dispatches raw HTTP calls through the right queue.

use crate::config::RestConfig;
use crate::error::RestError;
use crate::metrics;
use crate::rest::bucket::{RateLimitBucket, RateLimitHeaders};
use crate::rest::queue::RequestQueue;
use crate::rest::request::{RestRequest, RestResponse};
use crate::rest::route::{resolve_route, RouteKey};
use crate::timer;

use dashmap::DashMap;
use parking_lot::Mutex;
use reqwest::header::{HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

const NOTICE_CAPACITY: usize = 64;

/// Published on every 429 received
#[derive(Debug, Clone)]
pub struct RateLimitNotice {
    pub route: String,
    pub bucket: Option<String>,
    pub global: bool,
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    pub retry_after: Duration,
}

#[derive(Debug, Default, Deserialize)]
struct RateLimitBody {
    retry_after: Option<f64>,
    global: Option<bool>,
}

/// Process-wide cooldown owned by one coordinator
#[derive(Debug, Default)]
struct GlobalCooldown {
    until: Mutex<Option<Instant>>,
}

impl GlobalCooldown {
    fn trip(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        let mut until = self.until.lock();
        if until.map_or(true, |current| current < deadline) {
            *until = Some(deadline);
        }
    }

    fn remaining(&self) -> Option<Duration> {
        let mut until = self.until.lock();
        let left = until.and_then(timer::until);
        if left.is_none() {
            *until = None;
        }
        left
    }

    async fn wait(&self) {
        while let Some(left) = self.remaining() {
            trace!(?left, "Waiting out global cooldown");
            tokio::time::sleep(left).await;
        }
    }
}

/// Rate-limit aware REST dispatcher
///
/// Cheap to clone; clones share queues and the global cooldown.
#[derive(Debug, Clone)]
pub struct RateLimitCoordinator {
    inner: Arc<CoordinatorInner>,
}

#[derive(Debug)]
struct CoordinatorInner {
    http: reqwest::Client,
    config: RestConfig,
    routes: DashMap<RouteKey, Arc<RequestQueue>>,
    buckets: DashMap<String, Arc<RequestQueue>>,
    global: GlobalCooldown,
    notices: broadcast::Sender<RateLimitNotice>,
}

impl RateLimitCoordinator {
    /// Build a coordinator with its own HTTP client
    pub fn new(config: RestConfig) -> Result<Self, RestError> {
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(RestError::Transport)?;
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);

        Ok(Self {
            inner: Arc::new(CoordinatorInner {
                http,
                config,
                routes: DashMap::new(),
                buckets: DashMap::new(),
                global: GlobalCooldown::default(),
                notices,
            }),
        })
    }

    pub fn config(&self) -> &RestConfig {
        &self.inner.config
    }

    /// Resolve the route for `request` and enqueue it
    pub async fn request(&self, request: RestRequest) -> Result<RestResponse, RestError> {
        let route = resolve_route(&request.method, &request.path);
        self.enqueue(route, request).await
    }

    /// Queue `request` behind every earlier call on the same route/bucket
    ///
    /// Resolves once the call has executed. 429s are retried internally and
    /// never reach the caller.
    pub async fn enqueue(&self, route: RouteKey, request: RestRequest) -> Result<RestResponse, RestError> {
        let queue = self.queue_for(&route);
        let this = self.clone();
        let task_queue = Arc::clone(&queue);
        let task_route = route.clone();

        queue
            .pipeline()
            .push(async move { this.dispatch(task_queue, task_route, request).await })
            .await
            .map_err(|_| RestError::QueueClosed {
                route: route.to_string(),
            })?
    }

    /// Remaining global cooldown, if one is active
    pub fn global_cooldown(&self) -> Option<Duration> {
        self.inner.global.remaining()
    }

    /// Snapshot of the bucket a route currently resolves to
    pub fn bucket(&self, route: &RouteKey) -> Option<RateLimitBucket> {
        self.inner.routes.get(route).map(|q| q.snapshot())
    }

    /// Whether two routes have been migrated onto the same shared bucket
    pub fn shares_bucket(&self, a: &RouteKey, b: &RouteKey) -> bool {
        let a = self.inner.routes.get(a).map(|q| Arc::clone(q.value()));
        let b = self.inner.routes.get(b).map(|q| Arc::clone(q.value()));
        match (a, b) {
            (Some(a), Some(b)) => Arc::ptr_eq(&a, &b),
            _ => false,
        }
    }

    /// Subscribe to 429 notices
    pub fn subscribe_ratelimits(&self) -> broadcast::Receiver<RateLimitNotice> {
        self.inner.notices.subscribe()
    }

    fn queue_for(&self, route: &RouteKey) -> Arc<RequestQueue> {
        self.inner
            .routes
            .entry(route.clone())
            .or_insert_with(|| Arc::new(RequestQueue::new(route.clone())))
            .clone()
    }

    /// Queue whose bucket currently governs `route` (shared after migration)
    fn governing_queue(&self, route: &RouteKey, fallback: &Arc<RequestQueue>) -> Arc<RequestQueue> {
        self.inner
            .routes
            .get(route)
            .map(|q| Arc::clone(q.value()))
            .unwrap_or_else(|| Arc::clone(fallback))
    }

    /// Map `route` onto the shared queue for `hash`
    ///
    /// A new hash claims the route's current queue while that queue has no
    /// hash yet; otherwise the hash gets a fresh queue. One queue never
    /// carries two server buckets.
    fn migrate(&self, route: &RouteKey, queue: &Arc<RequestQueue>, hash: Option<&str>) -> Arc<RequestQueue> {
        let current = self.governing_queue(route, queue);
        let Some(hash) = hash else {
            return current;
        };

        let shared = self
            .inner
            .buckets
            .entry(hash.to_owned())
            .or_insert_with(|| {
                let mut bucket = current.bucket().lock();
                if bucket.hash().is_none() {
                    bucket.set_hash(hash);
                    return Arc::clone(&current);
                }
                let fresh = Arc::new(RequestQueue::new(route.clone()));
                fresh.bucket().lock().set_hash(hash);
                fresh
            })
            .clone();

        if !Arc::ptr_eq(&current, &shared) {
            debug!(route = %route, bucket = hash, "Route migrated to shared bucket");
            self.inner.routes.insert(route.clone(), Arc::clone(&shared));
        }
        shared
    }

    async fn dispatch(
        &self,
        queue: Arc<RequestQueue>,
        route: RouteKey,
        request: RestRequest,
    ) -> Result<RestResponse, RestError> {
        loop {
            self.inner.global.wait().await;

            let governing = self.governing_queue(&route, &queue);
            let cooldown = governing.bucket().lock().cooldown(Instant::now());
            if let Some(delay) = cooldown {
                debug!(route = %route, ?delay, "Bucket exhausted, waiting for reset");
                tokio::time::sleep(delay).await;
            }

            queue.lock();
            let result = self.execute(&route, &request).await;
            queue.unlock();
            let response = result?;

            let headers = RateLimitHeaders::parse(&response.headers);
            let target = self.migrate(&route, &queue, headers.bucket.as_deref());
            target
                .bucket()
                .lock()
                .update(&headers, Instant::now(), SystemTime::now());

            if response.status == StatusCode::TOO_MANY_REQUESTS {
                self.on_ratelimited(&route, &target, &headers, &response.body);
                continue;
            }

            if !response.status.is_success() {
                return Err(RestError::from_response(response.status.as_u16(), &response.body));
            }

            return Ok(response);
        }
    }

    fn on_ratelimited(&self, route: &RouteKey, target: &RequestQueue, headers: &RateLimitHeaders, body: &[u8]) {
        let body: RateLimitBody = serde_json::from_slice(body).unwrap_or_default();
        let global = headers.global || body.global.unwrap_or(false);
        let retry_after = body
            .retry_after
            .filter(|v| v.is_finite() && *v >= 0.0)
            .map(Duration::from_secs_f64)
            .or(headers.retry_after)
            .or(headers.reset_after)
            .unwrap_or(Duration::from_secs(1));

        if global {
            self.inner.global.trip(retry_after);
        } else {
            let mut bucket = target.bucket().lock();
            if !bucket.is_ratelimited(Instant::now()) {
                bucket.exhaust_for(retry_after, Instant::now());
            }
        }

        warn!(
            route = %route,
            bucket = ?headers.bucket,
            global,
            ?retry_after,
            "Rate limited, requeueing request"
        );
        metrics::record_ratelimit(route.as_str(), global);

        let _ = self.inner.notices.send(RateLimitNotice {
            route: route.to_string(),
            bucket: headers.bucket.clone(),
            global,
            limit: headers.limit,
            remaining: headers.remaining,
            retry_after,
        });
    }

    async fn execute(&self, route: &RouteKey, request: &RestRequest) -> Result<RestResponse, RestError> {
        let config = &self.inner.config;
        let path = request.path.trim_start_matches('/');
        let url = format!(
            "{}/v{}/{}",
            config.api_base.trim_end_matches('/'),
            config.api_version,
            path
        );

        let mut builder = self
            .inner
            .http
            .request(request.method.clone(), url)
            .timeout(config.request_timeout);

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if !request.skip_auth {
            builder = builder.header(AUTHORIZATION, format!("Bot {}", config.token));
        }
        if let Some(reason) = &request.reason {
            builder = builder.header("x-audit-log-reason", header_value("x-audit-log-reason", reason)?);
        }
        for (name, value) in &request.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| RestError::InvalidHeader { name: name.clone() })?;
            builder = builder.header(header_name, header_value(name, value)?);
        }

        if !request.files.is_empty() {
            let mut form = Form::new();
            for (index, file) in request.files.iter().enumerate() {
                let part = Part::bytes(file.data.to_vec()).file_name(file.name.clone());
                form = form.part(format!("files[{index}]"), part);
            }
            if let Some(body) = &request.body {
                form = form.text("payload_json", body.to_string());
            }
            builder = builder.multipart(form);
        } else if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        trace!(route = %route, method = %request.method, path = %request.path, "Sending request");
        let started = Instant::now();

        let response = builder.send().await.map_err(|e| self.transport_error(route, e))?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(|e| self.transport_error(route, e))?;

        metrics::record_rest_request(route.as_str(), status.as_u16(), started.elapsed());
        debug!(route = %route, status = status.as_u16(), "Request completed");

        Ok(RestResponse { status, headers, body })
    }

    fn transport_error(&self, route: &RouteKey, error: reqwest::Error) -> RestError {
        if error.is_timeout() {
            RestError::Timeout {
                route: route.to_string(),
                after: self.inner.config.request_timeout,
            }
        } else {
            RestError::Transport(error)
        }
    }
}

fn header_value(name: &str, value: &str) -> Result<HeaderValue, RestError> {
    HeaderValue::from_str(value).map_err(|_| RestError::InvalidHeader { name: name.to_string() })
}
