//! Plan-aware sliding-window rate limiter over the shared store.
//!
//! Each identity owns an ordered log of request timestamps. A check evicts
//! entries older than the window, inserts the current request and admits it
//! when the post-insert count is within the plan's quota. Store failures
//! fail open and are flagged `degraded` on the decision.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::{PlanLimit, PlanLimits, WINDOW_TTL_GRACE_SECONDS};
use crate::errors::{VigilError, VigilResult};
use crate::models::{Identity, Plan, RateLimitView};
use crate::store::Store;

const MICROS_PER_SECOND: i64 = 1_000_000;
const IP_KEY_PREFIX: &str = "rate_limit:ip:";
const USER_KEY_PREFIX: &str = "rate_limit:user:";
/// Analytics inspect at most this many keys per class.
const ANALYTICS_KEY_SCAN: usize = 100;
const HIGH_USAGE_IP_THRESHOLD: u32 = 5;
const HIGH_USAGE_USER_THRESHOLD: u32 = 20;

fn micros_to_utc(us: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_micros(us).single()
}

fn seconds_to_micros(seconds: u64) -> i64 {
    i64::try_from(seconds)
        .unwrap_or(i64::MAX / MICROS_PER_SECOND)
        .saturating_mul(MICROS_PER_SECOND)
}

// ---------------------------------------------------------------------------
// Decision / status types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub current_count: u32,
    pub limit: u32,
    pub remaining: u32,
    pub reset_time: Option<DateTime<Utc>>,
    pub window_seconds: u64,
    pub plan: Plan,
    /// The store was unreachable and the request was admitted unchecked.
    pub degraded: bool,
}

impl RateLimitDecision {
    pub fn view(&self) -> RateLimitView {
        RateLimitView {
            plan: self.plan,
            limit: self.limit,
            remaining: self.remaining,
            reset_time: self.reset_time,
            degraded: self.degraded,
        }
    }

    pub fn to_error(&self) -> VigilError {
        VigilError::AdmissionDenied {
            plan: self.plan,
            limit: self.limit,
            remaining: self.remaining,
            reset_time: self.reset_time,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RateLimitStatus {
    pub current_count: u32,
    pub oldest_request: Option<DateTime<Utc>>,
    pub newest_request: Option<DateTime<Utc>>,
    pub window_span_seconds: Option<f64>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct UsageEntry {
    /// Anonymous digest or user id, without the key prefix.
    pub identity: String,
    pub request_count: u32,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RateLimitAnalytics {
    pub total_ip_limits: usize,
    pub total_user_limits: usize,
    pub high_usage_ips: Vec<UsageEntry>,
    pub high_usage_users: Vec<UsageEntry>,
}

// ---------------------------------------------------------------------------
// RateLimiter
// ---------------------------------------------------------------------------

pub struct RateLimiter {
    store: Arc<dyn Store>,
    plans: PlanLimits,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn Store>, plans: PlanLimits) -> Self {
        Self { store, plans }
    }

    pub fn limit_for(&self, plan: Plan) -> PlanLimit {
        self.plans.for_plan(plan)
    }

    pub fn check(&self, identity: &Identity) -> RateLimitDecision {
        self.check_at(identity, Utc::now())
    }

    /// Record one request for `identity` at `now` and decide admission.
    pub fn check_at(&self, identity: &Identity, now: DateTime<Utc>) -> RateLimitDecision {
        let plan = identity.plan();
        let limit = self.plans.for_plan(plan);
        let key = identity.rate_limit_key();
        let window_us = seconds_to_micros(limit.window_seconds);
        let ttl_us = seconds_to_micros(limit.window_seconds + WINDOW_TTL_GRACE_SECONDS);

        match self
            .store
            .record_hit(&key, now.timestamp_micros(), window_us, ttl_us)
        {
            Ok(snap) => {
                let allowed = snap.count <= limit.requests;
                let decision = RateLimitDecision {
                    allowed,
                    current_count: snap.count,
                    limit: limit.requests,
                    remaining: limit.requests.saturating_sub(snap.count),
                    reset_time: snap.oldest_us.and_then(|us| micros_to_utc(us + window_us)),
                    window_seconds: limit.window_seconds,
                    plan,
                    degraded: false,
                };
                if !allowed {
                    warn!(
                        target: "vigil::security",
                        event = "RATE_LIMIT_EXCEEDED",
                        key = %key,
                        plan = %plan,
                        count = snap.count,
                        limit = limit.requests,
                        "Rate limit exceeded"
                    );
                }
                decision
            }
            Err(e) => {
                warn!(
                    target: "vigil::security",
                    event = "STORE_UNAVAILABLE",
                    backend = self.store.backend(),
                    error = %e,
                    "Rate limit store unavailable, admitting request"
                );
                RateLimitDecision {
                    allowed: true,
                    current_count: 0,
                    limit: limit.requests,
                    remaining: limit.requests,
                    reset_time: None,
                    window_seconds: limit.window_seconds,
                    plan,
                    degraded: true,
                }
            }
        }
    }

    /// Inspect an identity's window without recording a request.
    pub fn status(&self, identity: &Identity) -> VigilResult<RateLimitStatus> {
        self.status_at(identity, Utc::now())
    }

    pub fn status_at(&self, identity: &Identity, now: DateTime<Utc>) -> VigilResult<RateLimitStatus> {
        let limit = self.plans.for_plan(identity.plan());
        let snap = self.store.window_status(
            &identity.rate_limit_key(),
            now.timestamp_micros(),
            seconds_to_micros(limit.window_seconds),
        )?;
        let span = match (snap.oldest_us, snap.newest_us) {
            (Some(oldest), Some(newest)) => Some((newest - oldest) as f64 / MICROS_PER_SECOND as f64),
            _ => None,
        };
        Ok(RateLimitStatus {
            current_count: snap.count,
            oldest_request: snap.oldest_us.and_then(micros_to_utc),
            newest_request: snap.newest_us.and_then(micros_to_utc),
            window_span_seconds: span,
            expires_at: snap.expires_us.and_then(micros_to_utc),
        })
    }

    /// Administrative reset. True when the identity had a window.
    pub fn reset(&self, identity: &Identity) -> VigilResult<bool> {
        let key = identity.rate_limit_key();
        let removed = self.store.reset(&key)?;
        info!(key = %key, removed, "Reset rate limit");
        Ok(removed)
    }

    pub fn analytics(&self) -> VigilResult<RateLimitAnalytics> {
        self.analytics_at(Utc::now())
    }

    /// Key totals per class plus the identities above the high-usage marks.
    pub fn analytics_at(&self, now: DateTime<Utc>) -> VigilResult<RateLimitAnalytics> {
        let now_us = now.timestamp_micros();
        let ip_keys = self.store.active_keys(IP_KEY_PREFIX, now_us, usize::MAX)?;
        let user_keys = self.store.active_keys(USER_KEY_PREFIX, now_us, usize::MAX)?;
        Ok(RateLimitAnalytics {
            total_ip_limits: ip_keys.len(),
            total_user_limits: user_keys.len(),
            high_usage_ips: self.high_usage(
                &ip_keys,
                IP_KEY_PREFIX,
                self.plans.anonymous.window_seconds,
                HIGH_USAGE_IP_THRESHOLD,
                now_us,
            )?,
            high_usage_users: self.high_usage(
                &user_keys,
                USER_KEY_PREFIX,
                self.widest_window(),
                HIGH_USAGE_USER_THRESHOLD,
                now_us,
            )?,
        })
    }

    fn high_usage(
        &self,
        keys: &[String],
        prefix: &str,
        window_seconds: u64,
        threshold: u32,
        now_us: i64,
    ) -> VigilResult<Vec<UsageEntry>> {
        let window_us = seconds_to_micros(window_seconds);
        let mut out = Vec::new();
        for key in keys.iter().take(ANALYTICS_KEY_SCAN) {
            let snap = self.store.window_status(key, now_us, window_us)?;
            if snap.count > threshold {
                out.push(UsageEntry {
                    identity: key.trim_start_matches(prefix).to_string(),
                    request_count: snap.count,
                    expires_at: snap.expires_us.and_then(micros_to_utc),
                });
            }
        }
        Ok(out)
    }

    /// User keys carry no plan, so they are read over the longest window.
    fn widest_window(&self) -> u64 {
        Plan::ALL
            .into_iter()
            .map(|plan| self.plans.for_plan(plan).window_seconds)
            .max()
            .unwrap_or(crate::config::DEFAULT_WINDOW_SECONDS)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use proptest::prelude::*;

    use super::*;
    use crate::store::test_support::UnavailableStore;
    use crate::store::MemoryStore;

    fn limiter() -> RateLimiter {
        RateLimiter::new(Arc::new(MemoryStore::new()), PlanLimits::default())
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn user(id: &str, plan: Plan) -> Identity {
        Identity::User {
            user_id: id.to_string(),
            plan,
            client_ip: "10.0.0.9".to_string(),
        }
    }

    #[test]
    fn test_eleventh_anonymous_request_denied() {
        let limiter = limiter();
        let anon = Identity::anonymous("192.168.1.100");
        for i in 0..10 {
            let decision = limiter.check_at(&anon, t0() + Duration::seconds(i));
            assert!(decision.allowed, "request {}", i + 1);
            assert_eq!(decision.remaining, 9 - i as u32);
        }
        let denied = limiter.check_at(&anon, t0() + Duration::seconds(10));
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.current_count, 11);
        assert_eq!(denied.reset_time, Some(t0() + Duration::seconds(60)));
        assert!(!denied.degraded);
        assert!(matches!(denied.to_error(), VigilError::AdmissionDenied { limit: 10, .. }));
    }

    #[test]
    fn test_window_slides() {
        let limiter = limiter();
        let anon = Identity::anonymous("10.1.1.1");
        for i in 0..10 {
            assert!(limiter.check_at(&anon, t0() + Duration::seconds(i)).allowed);
        }
        assert!(!limiter.check_at(&anon, t0() + Duration::seconds(30)).allowed);
        // entries from t0..t0+9 have left the window
        let later = limiter.check_at(&anon, t0() + Duration::seconds(70));
        assert!(later.allowed);
        assert_eq!(later.current_count, 2);
    }

    #[test]
    fn test_plans_get_their_own_quota() {
        let limiter = limiter();
        let pro = user("u-pro", Plan::Pro);
        let mut last = None;
        for i in 0..200 {
            last = Some(limiter.check_at(&pro, t0() + Duration::milliseconds(i)));
        }
        let last = last.unwrap();
        assert!(last.allowed);
        assert_eq!(last.limit, 200);
        assert_eq!(last.remaining, 0);
        assert!(!limiter.check_at(&pro, t0() + Duration::seconds(1)).allowed);
        // separate identity, separate window
        assert!(limiter.check_at(&user("u-free", Plan::Free), t0()).allowed);
    }

    #[test]
    fn test_store_outage_fails_open() {
        let limiter = RateLimiter::new(Arc::new(UnavailableStore), PlanLimits::default());
        let decision = limiter.check_at(&Identity::anonymous("10.0.0.1"), t0());
        assert!(decision.allowed);
        assert!(decision.degraded);
        assert_eq!(decision.remaining, 10);
        assert!(decision.view().degraded);
        assert!(limiter.status(&Identity::anonymous("10.0.0.1")).is_err());
    }

    #[test]
    fn test_status_does_not_record() {
        let limiter = limiter();
        let anon = Identity::anonymous("10.0.0.2");
        limiter.check_at(&anon, t0());
        limiter.check_at(&anon, t0() + Duration::seconds(4));
        let status = limiter.status_at(&anon, t0() + Duration::seconds(5)).unwrap();
        let again = limiter.status_at(&anon, t0() + Duration::seconds(5)).unwrap();
        assert_eq!(status, again);
        assert_eq!(status.current_count, 2);
        assert_eq!(status.window_span_seconds, Some(4.0));
        assert_eq!(status.oldest_request, Some(t0()));
    }

    #[test]
    fn test_reset_clears_window() {
        let limiter = limiter();
        let anon = Identity::anonymous("10.0.0.3");
        for i in 0..11 {
            limiter.check_at(&anon, t0() + Duration::seconds(i));
        }
        assert!(limiter.reset(&anon).unwrap());
        assert!(limiter.check_at(&anon, t0() + Duration::seconds(12)).allowed);
    }

    #[test]
    fn test_analytics_flags_heavy_identities() {
        let limiter = limiter();
        let heavy_ip = Identity::anonymous("10.0.0.4");
        let light_ip = Identity::anonymous("10.0.0.5");
        let heavy_user = user("heavy", Plan::Enterprise);
        for i in 0..6 {
            limiter.check_at(&heavy_ip, t0() + Duration::seconds(i));
        }
        limiter.check_at(&light_ip, t0());
        for i in 0..21 {
            limiter.check_at(&heavy_user, t0() + Duration::seconds(i));
        }
        let analytics = limiter.analytics_at(t0() + Duration::seconds(30)).unwrap();
        assert_eq!(analytics.total_ip_limits, 2);
        assert_eq!(analytics.total_user_limits, 1);
        assert_eq!(analytics.high_usage_ips.len(), 1);
        assert_eq!(analytics.high_usage_ips[0].request_count, 6);
        assert_eq!(analytics.high_usage_ips[0].identity, crate::models::anonymous_key("10.0.0.4"));
        assert_eq!(analytics.high_usage_users[0].identity, "heavy");
        assert_eq!(analytics.high_usage_users[0].request_count, 21);
    }

    proptest! {
        #[test]
        fn prop_admitted_never_exceeds_quota(gaps in prop::collection::vec(0u32..15_000, 1..120)) {
            let limiter = limiter();
            let anon = Identity::anonymous("172.16.0.1");
            let mut now = t0();
            let mut admitted: Vec<DateTime<Utc>> = Vec::new();
            for gap in gaps {
                now += Duration::milliseconds(i64::from(gap));
                if limiter.check_at(&anon, now).allowed {
                    admitted.push(now);
                }
                let window_start = now - Duration::seconds(60);
                let in_window = admitted.iter().filter(|t| **t > window_start).count();
                prop_assert!(in_window <= 10);
            }
        }

        #[test]
        fn prop_remaining_is_quota_minus_count(n in 1u32..40) {
            let limiter = limiter();
            let free = user("p", Plan::Free);
            let mut decision = None;
            for i in 0..n {
                decision = Some(limiter.check_at(&free, t0() + Duration::milliseconds(i64::from(i))));
            }
            let decision = decision.unwrap();
            prop_assert_eq!(decision.current_count, n);
            prop_assert_eq!(decision.remaining, 50u32.saturating_sub(n));
        }
    }
}
