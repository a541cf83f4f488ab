//! Per-bucket request queue

use crate::pipeline::TaskPipeline;
use crate::rest::bucket::RateLimitBucket;
use crate::rest::route::RouteKey;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Serializes every call that shares one bucket
///
/// At most one call is in flight (`locked`); queued calls run FIFO on the
/// underlying [`TaskPipeline`].
#[derive(Debug)]
pub struct RequestQueue {
    route: RouteKey,
    bucket: Mutex<RateLimitBucket>,
    pipeline: TaskPipeline,
    locked: AtomicBool,
}

impl RequestQueue {
    pub fn new(route: RouteKey) -> Self {
        Self {
            route,
            bucket: Mutex::new(RateLimitBucket::new()),
            pipeline: TaskPipeline::new("rest"),
            locked: AtomicBool::new(false),
        }
    }

    /// Route that created this queue
    pub fn route(&self) -> &RouteKey {
        &self.route
    }

    pub fn bucket(&self) -> &Mutex<RateLimitBucket> {
        &self.bucket
    }

    pub fn snapshot(&self) -> RateLimitBucket {
        self.bucket.lock().clone()
    }

    pub(crate) fn pipeline(&self) -> &TaskPipeline {
        &self.pipeline
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    pub(crate) fn lock(&self) {
        self.locked.store(true, Ordering::Release);
    }

    pub(crate) fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}
