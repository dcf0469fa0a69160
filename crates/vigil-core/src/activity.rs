//! Per-identity activity ledger and suspicion scoring.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Timelike, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::errors::VigilResult;
use crate::models::{anonymous_key, ActivityKind, ActivityRecord, Identity};
use crate::store::Store;

const HIGH_VOLUME: usize = 100;
const DANGEROUS_ATTEMPTS: usize = 3;
const RATE_LIMIT_VIOLATIONS: usize = 5;
const OVERNIGHT_REQUESTS: usize = 10;
/// Overnight window, inclusive UTC hours.
const OVERNIGHT_HOURS: std::ops::RangeInclusive<u32> = 2..=6;

/// Metadata field holding the digest of the caller's address.
pub const CLIENT_DIGEST_FIELD: &str = "client_digest";

pub fn day_key(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d").to_string()
}

// ---------------------------------------------------------------------------
// Suspicion
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SuspicionIndicators {
    pub request_volume: usize,
    pub dangerous_code_attempts: usize,
    pub rate_limit_violations: usize,
    pub overnight_requests: usize,
    pub distinct_ips: usize,
}

impl SuspicionIndicators {
    /// Weighted score in tenths, 0..=10.
    fn score_tenths(&self) -> u32 {
        let mut tenths = 0;
        if self.request_volume > HIGH_VOLUME {
            tenths += 3;
        }
        if self.dangerous_code_attempts > DANGEROUS_ATTEMPTS {
            tenths += 4;
        }
        if self.rate_limit_violations > RATE_LIMIT_VIOLATIONS {
            tenths += 2;
        }
        if self.overnight_requests > OVERNIGHT_REQUESTS {
            tenths += 1;
        }
        tenths
    }

    pub fn score(&self) -> f64 {
        f64::from(self.score_tenths()) / 10.0
    }

    pub fn recommendation(&self) -> Recommendation {
        match self.score_tenths() {
            t if t > 7 => Recommendation::Block,
            t if t > 3 => Recommendation::Monitor,
            _ => Recommendation::Normal,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Normal,
    Monitor,
    #[serde(rename = "block_user")]
    Block,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SuspicionReport {
    pub user_id: String,
    pub score: f64,
    pub indicators: SuspicionIndicators,
    pub recommendation: Recommendation,
}

pub fn indicators_for(records: &[ActivityRecord]) -> SuspicionIndicators {
    let mut clients = HashSet::new();
    let mut indicators = SuspicionIndicators {
        request_volume: records.len(),
        ..Default::default()
    };
    for record in records {
        match record.activity_type {
            ActivityKind::DangerousCodeDetected => indicators.dangerous_code_attempts += 1,
            ActivityKind::RateLimitExceeded => indicators.rate_limit_violations += 1,
            _ => {}
        }
        if let Some(client) = record.metadata.get(CLIENT_DIGEST_FIELD).and_then(|v| v.as_str()) {
            clients.insert(client.to_string());
        }
        if OVERNIGHT_HOURS.contains(&record.timestamp.hour()) {
            indicators.overnight_requests += 1;
        }
    }
    indicators.distinct_ips = clients.len();
    indicators
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

pub struct ActivityLedger {
    store: Arc<dyn Store>,
    retention: Duration,
}

impl ActivityLedger {
    pub fn new(store: Arc<dyn Store>, retention_days: i64) -> Self {
        Self {
            store,
            retention: Duration::days(retention_days),
        }
    }

    pub fn record(&self, identity: &Identity, kind: ActivityKind, metadata: serde_json::Value) {
        self.record_at(identity, kind, metadata, Utc::now());
    }

    /// Best-effort append for a resolved user. Anonymous callers and store
    /// failures are skipped; the request itself never fails here.
    pub fn record_at(
        &self,
        identity: &Identity,
        kind: ActivityKind,
        mut metadata: serde_json::Value,
        now: DateTime<Utc>,
    ) {
        let Some(user_id) = identity.user_id() else {
            return;
        };
        if let Some(map) = metadata.as_object_mut() {
            map.insert(
                CLIENT_DIGEST_FIELD.to_string(),
                serde_json::Value::String(anonymous_key(identity.client_ip())),
            );
        }
        let record = ActivityRecord {
            activity_type: kind,
            metadata,
            timestamp: now,
        };
        let expires_us = (now + self.retention).timestamp_micros();
        if let Err(e) = self
            .store
            .append_activity(user_id, &day_key(now), &record, expires_us)
        {
            debug!(user_id, activity = kind.as_str(), error = %e, "Activity not recorded");
        }
    }

    /// Records from the last `days` UTC days, newest day first.
    pub fn recent(&self, user_id: &str, days: u32, now: DateTime<Utc>) -> VigilResult<Vec<ActivityRecord>> {
        let now_us = now.timestamp_micros();
        let mut records = Vec::new();
        for offset in 0..days {
            let day = day_key(now - Duration::days(i64::from(offset)));
            records.extend(self.store.activities(user_id, &day, now_us)?);
        }
        Ok(records)
    }

    pub fn suspicion(&self, user_id: &str) -> VigilResult<SuspicionReport> {
        self.suspicion_at(user_id, Utc::now())
    }

    /// Score today's bucket for one user.
    pub fn suspicion_at(&self, user_id: &str, now: DateTime<Utc>) -> VigilResult<SuspicionReport> {
        let records = self.recent(user_id, 1, now)?;
        let indicators = indicators_for(&records);
        let report = SuspicionReport {
            user_id: user_id.to_string(),
            score: indicators.score(),
            indicators,
            recommendation: indicators.recommendation(),
        };
        info!(
            target: "vigil::security",
            event = "SUSPICION_COMPUTED",
            user_id,
            score = report.score,
            recommendation = ?report.recommendation,
            "Computed suspicion score"
        );
        Ok(report)
    }
}
