//! Rate-limit bucket state
//!
//! Pure quota bookkeeping for one server-assigned bucket. No I/O.

use chrono::DateTime;
use reqwest::header::HeaderMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
pub const HEADER_RESET: &str = "x-ratelimit-reset";
pub const HEADER_RESET_AFTER: &str = "x-ratelimit-reset-after";
pub const HEADER_BUCKET: &str = "x-ratelimit-bucket";
pub const HEADER_GLOBAL: &str = "x-ratelimit-global";
pub const HEADER_RETRY_AFTER: &str = "retry-after";

/// Rate-limit headers extracted from one response
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitHeaders {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    /// Absolute reset, seconds since the epoch (server clock)
    pub reset: Option<f64>,
    pub reset_after: Option<Duration>,
    pub bucket: Option<String>,
    pub global: bool,
    pub retry_after: Option<Duration>,
    /// Server `date` header, used to correct for clock skew
    pub date: Option<SystemTime>,
}

impl RateLimitHeaders {
    pub fn parse(headers: &HeaderMap) -> Self {
        let text = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
        let seconds = |name: &str| {
            text(name)
                .and_then(|v| v.parse::<f64>().ok())
                .filter(|v| v.is_finite() && *v >= 0.0)
        };

        Self {
            limit: text(HEADER_LIMIT).and_then(|v| v.parse().ok()),
            remaining: text(HEADER_REMAINING).and_then(|v| v.parse().ok()),
            reset: seconds(HEADER_RESET),
            reset_after: seconds(HEADER_RESET_AFTER).map(Duration::from_secs_f64),
            bucket: text(HEADER_BUCKET).map(str::to_owned),
            global: text(HEADER_GLOBAL).is_some_and(|v| !v.eq_ignore_ascii_case("false")),
            retry_after: seconds(HEADER_RETRY_AFTER).map(Duration::from_secs_f64),
            date: text("date")
                .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
                .map(SystemTime::from),
        }
    }
}

/// Quota state for one bucket
///
/// `ratelimited` holds exactly when `remaining < 1` and the reset deadline
/// is still ahead.
#[derive(Debug, Clone)]
pub struct RateLimitBucket {
    hash: Option<String>,
    limit: u32,
    remaining: u32,
    reset_at: Option<Instant>,
    reset_after: Duration,
}

impl Default for RateLimitBucket {
    fn default() -> Self {
        Self {
            hash: None,
            limit: 1,
            remaining: 1,
            reset_at: None,
            reset_after: Duration::ZERO,
        }
    }
}

impl RateLimitBucket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hash(&self) -> Option<&str> {
        self.hash.as_deref()
    }

    pub fn set_hash(&mut self, hash: &str) {
        self.hash = Some(hash.to_owned());
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn reset_after(&self) -> Duration {
        self.reset_after
    }

    pub fn reset_at(&self) -> Option<Instant> {
        self.reset_at
    }

    pub fn is_ratelimited(&self, now: Instant) -> bool {
        self.remaining < 1 && self.reset_at.is_some_and(|reset| now < reset)
    }

    /// How long the next call must wait, if the bucket is exhausted
    pub fn cooldown(&self, now: Instant) -> Option<Duration> {
        if !self.is_ratelimited(now) {
            return None;
        }
        if self.reset_after > Duration::ZERO {
            return Some(self.reset_after);
        }
        self.reset_at.map(|reset| reset - now)
    }

    /// Apply headers from a response
    ///
    /// `now`/`wall_now` are the local monotonic and wall clocks at receipt.
    /// The absolute reset is shifted by the server/local clock difference
    /// taken from the `date` header.
    pub fn update(&mut self, headers: &RateLimitHeaders, now: Instant, wall_now: SystemTime) {
        if let Some(limit) = headers.limit {
            self.limit = limit;
        }
        self.remaining = headers.remaining.unwrap_or(1);
        self.reset_after = headers.reset_after.unwrap_or(Duration::ZERO);

        let server_now = headers.date.unwrap_or(wall_now);
        self.reset_at = match headers.reset {
            Some(reset) => {
                let server_now = server_now
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs_f64();
                Some(now + Duration::from_secs_f64((reset - server_now).max(0.0)))
            }
            None => match headers.reset_after {
                Some(after) => Some(now + after),
                None => Some(now),
            },
        };
    }

    /// Force the bucket into cooldown (429 without usable bucket headers)
    pub fn exhaust_for(&mut self, retry_after: Duration, now: Instant) {
        self.remaining = 0;
        self.reset_after = retry_after;
        self.reset_at = Some(now + retry_after);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn test_defaults_are_conservative() {
        let bucket = RateLimitBucket::new();
        assert_eq!(bucket.limit(), 1);
        assert_eq!(bucket.remaining(), 1);
        assert!(bucket.hash().is_none());
        assert!(!bucket.is_ratelimited(Instant::now()));
    }

    #[test]
    fn test_parse_headers() {
        let parsed = RateLimitHeaders::parse(&headers(&[
            (HEADER_LIMIT, "5"),
            (HEADER_REMAINING, "0"),
            (HEADER_RESET, "1470173023.123"),
            (HEADER_RESET_AFTER, "1.5"),
            (HEADER_BUCKET, "abcd1234"),
            (HEADER_GLOBAL, "true"),
            ("date", "Tue, 02 Aug 2016 21:23:42 GMT"),
        ]));

        assert_eq!(parsed.limit, Some(5));
        assert_eq!(parsed.remaining, Some(0));
        assert_eq!(parsed.reset_after, Some(Duration::from_millis(1500)));
        assert_eq!(parsed.bucket.as_deref(), Some("abcd1234"));
        assert!(parsed.global);
        assert_eq!(
            parsed.date,
            Some(UNIX_EPOCH + Duration::from_secs(1_470_173_022))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_bucket_reports_reset_after() {
        let now = Instant::now();
        let mut bucket = RateLimitBucket::new();
        bucket.update(
            &RateLimitHeaders {
                limit: Some(5),
                remaining: Some(0),
                reset_after: Some(Duration::from_secs(2)),
                ..Default::default()
            },
            now,
            SystemTime::now(),
        );

        assert!(bucket.is_ratelimited(now));
        assert_eq!(bucket.cooldown(now), Some(Duration::from_secs(2)));
        assert!(!bucket.is_ratelimited(now + Duration::from_secs(2)));
        assert_eq!(bucket.cooldown(now + Duration::from_secs(3)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_corrects_for_clock_skew() {
        let now = Instant::now();
        let server_now = UNIX_EPOCH + Duration::from_secs(1_000_000);
        // Local wall clock runs 30s ahead of the server
        let wall_now = server_now + Duration::from_secs(30);

        let mut bucket = RateLimitBucket::new();
        bucket.update(
            &RateLimitHeaders {
                remaining: Some(0),
                reset: Some(1_000_004.0),
                date: Some(server_now),
                ..Default::default()
            },
            now,
            wall_now,
        );

        assert_eq!(bucket.reset_at(), Some(now + Duration::from_secs(4)));
        assert_eq!(bucket.cooldown(now), Some(Duration::from_secs(4)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_headers_leave_bucket_open() {
        let now = Instant::now();
        let mut bucket = RateLimitBucket::new();
        bucket.exhaust_for(Duration::from_secs(1), now);
        assert!(bucket.is_ratelimited(now));

        bucket.update(&RateLimitHeaders::default(), now, SystemTime::now());
        assert_eq!(bucket.remaining(), 1);
        assert!(!bucket.is_ratelimited(now));
    }
}
