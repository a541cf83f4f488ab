//! Rate-limited REST client
//!
//! Requests are grouped by route, routes are migrated onto the bucket the
//! server assigns them, and every bucket is drained by a single ordered
//! queue.

pub mod bucket;
pub mod coordinator;
pub mod queue;
pub mod request;
pub mod route;

pub use bucket::{RateLimitBucket, RateLimitHeaders};
pub use coordinator::{RateLimitCoordinator, RateLimitNotice};
pub use queue::RequestQueue;
pub use request::{RequestFile, RestRequest, RestResponse};
pub use route::{resolve_route, RouteKey};
