//! Request-level entry point: identity → admission → validation →
//! analysis → activity.

use std::sync::Arc;

use serde_json::json;
use tracing::info;

use crate::activity::{ActivityLedger, SuspicionReport};
use crate::analysis::orchestrator::Orchestrator;
use crate::config::VigilConfig;
use crate::errors::{VigilError, VigilResult};
use crate::identity::TokenManager;
use crate::limiter::{RateLimitAnalytics, RateLimitStatus, RateLimiter};
use crate::models::{ActivityKind, AnalysisResponse, Identity, Plan};
use crate::store::{open_store, Store};

#[derive(Clone, Debug, Default)]
pub struct AnalysisRequest {
    pub code: String,
    pub language: String,
    /// Bearer token, with or without the `Bearer ` prefix.
    pub token: Option<String>,
    pub client_ip: String,
}

pub struct AnalysisService {
    orchestrator: Orchestrator,
    limiter: RateLimiter,
    tokens: TokenManager,
    ledger: ActivityLedger,
    store: Arc<dyn Store>,
}

impl AnalysisService {
    pub fn new(config: VigilConfig) -> VigilResult<Self> {
        config.validate()?;
        let store = open_store(&config.store)?;
        Self::with_store(config, store)
    }

    /// Build over an existing store, e.g. one shared with other services.
    pub fn with_store(config: VigilConfig, store: Arc<dyn Store>) -> VigilResult<Self> {
        config.validate()?;
        info!(
            backend = store.backend(),
            execution = ?config.execution,
            budget_ms = config.analysis_budget_ms,
            "Analysis service ready"
        );
        Ok(Self {
            orchestrator: Orchestrator::new(&config)?,
            limiter: RateLimiter::new(Arc::clone(&store), config.plans.clone()),
            tokens: TokenManager::from_config(&config),
            ledger: ActivityLedger::new(Arc::clone(&store), config.activity_retention_days),
            store,
        })
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn store_backend(&self) -> &'static str {
        self.store.backend()
    }

    pub fn resolve(&self, token: Option<&str>, client_ip: &str) -> Identity {
        self.tokens.resolve(token, client_ip)
    }

    pub fn analyze(&self, request: &AnalysisRequest) -> VigilResult<AnalysisResponse> {
        let identity = self.resolve(request.token.as_deref(), &request.client_ip);

        let decision = self.limiter.check(&identity);
        if !decision.allowed {
            self.ledger.record(
                &identity,
                ActivityKind::RateLimitExceeded,
                json!({"limit": decision.limit, "count": decision.current_count}),
            );
            return Err(decision.to_error());
        }

        let unit = match self.orchestrator.validate(&request.code, &request.language) {
            Ok(unit) => unit,
            Err(rejection) => {
                if rejection.is_dangerous() {
                    self.ledger.record(
                        &identity,
                        ActivityKind::DangerousCodeDetected,
                        json!({"language": request.language.trim().to_ascii_lowercase()}),
                    );
                }
                return Err(VigilError::from(rejection));
            }
        };

        let result = self.orchestrator.analyze(&unit)?;
        self.ledger.record(
            &identity,
            ActivityKind::CodeAnalysis,
            json!({
                "language": result.language.as_str(),
                "bytes": unit.byte_len,
                "findings": result.findings.len(),
                "elapsed_ms": result.elapsed_ms,
            }),
        );
        Ok(AnalysisResponse::from_result(result, Some(decision.view())))
    }

    pub fn issue_token(&self, user_id: &str, plan: Plan, client_ip: &str) -> VigilResult<String> {
        let token = self.tokens.issue(user_id, plan)?;
        let identity = Identity::User {
            user_id: user_id.to_string(),
            plan,
            client_ip: client_ip.to_string(),
        };
        self.ledger
            .record(&identity, ActivityKind::UserRegistration, json!({"plan": plan.as_str()}));
        Ok(token)
    }

    pub fn suspicion(&self, user_id: &str) -> VigilResult<SuspicionReport> {
        self.ledger.suspicion(user_id)
    }

    pub fn rate_limit_status(&self, token: Option<&str>, client_ip: &str) -> VigilResult<RateLimitStatus> {
        self.limiter.status(&self.resolve(token, client_ip))
    }

    pub fn reset_rate_limit(&self, identity: &Identity) -> VigilResult<bool> {
        self.limiter.reset(identity)
    }

    pub fn rate_limit_analytics(&self) -> VigilResult<RateLimitAnalytics> {
        self.limiter.analytics()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::store::test_support::UnavailableStore;

    fn service() -> AnalysisService {
        AnalysisService::new(VigilConfig::default().with_secret("service-secret")).unwrap()
    }

    fn request(code: &str) -> AnalysisRequest {
        AnalysisRequest {
            code: code.to_string(),
            language: "python".to_string(),
            token: None,
            client_ip: "198.51.100.1".to_string(),
        }
    }

    #[test]
    fn test_anonymous_analysis_reports_quota() {
        let service = service();
        assert_eq!(service.store_backend(), "memory");
        let response = service.analyze(&request("def f(): return 1")).unwrap();
        assert_eq!(response.metrics.function_count, 1);
        let rate = response.rate_limit.unwrap();
        assert_eq!(rate.plan, Plan::Anonymous);
        assert_eq!(rate.remaining, 9);
        assert!(!rate.degraded);
    }

    #[test]
    fn test_eleventh_request_denied() {
        let service = service();
        for _ in 0..10 {
            service.analyze(&request("x = 1\n")).unwrap();
        }
        let err = service.analyze(&request("x = 1\n")).unwrap_err();
        assert_eq!(err.status_code(), 429);
        assert!(matches!(err, VigilError::AdmissionDenied { remaining: 0, .. }));
    }

    #[test]
    fn test_rejections_count_against_quota_and_ledger() {
        let service = service();
        let token = service.issue_token("erin", Plan::Free, "198.51.100.2").unwrap();
        let mut req = request("import os");
        req.token = Some(token);
        for _ in 0..4 {
            let err = service.analyze(&req).unwrap_err();
            assert_eq!(err.status_code(), 400);
        }
        let report = service.suspicion("erin").unwrap();
        assert_eq!(report.indicators.dangerous_code_attempts, 4);
        assert!((report.score - 0.4).abs() < 1e-9);
        // registration plus four rejections
        assert_eq!(report.indicators.request_volume, 5);
    }

    #[test]
    fn test_token_grants_plan_and_bad_token_downgrades() {
        let service = service();
        let token = service.issue_token("frank", Plan::Pro, "198.51.100.3").unwrap();
        let mut req = request("x = 1\n");
        req.token = Some(format!("Bearer {token}"));
        let response = service.analyze(&req).unwrap();
        assert_eq!(response.rate_limit.unwrap().plan, Plan::Pro);

        req.token = Some("forged.token.value".into());
        let response = service.analyze(&req).unwrap();
        assert_eq!(response.rate_limit.unwrap().plan, Plan::Anonymous);
    }

    #[test]
    fn test_store_outage_is_visible_but_not_fatal() {
        let service = AnalysisService::with_store(
            VigilConfig::default().with_secret("s"),
            Arc::new(UnavailableStore),
        )
        .unwrap();
        let token = service.issue_token("gina", Plan::Free, "198.51.100.4").unwrap();
        let mut req = request("x = 1\n");
        req.token = Some(token);
        let response = service.analyze(&req).unwrap();
        assert!(response.rate_limit.unwrap().degraded);
        assert!(service.suspicion("gina").is_err());
    }

    #[test]
    fn test_shared_store_across_services() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = VigilConfig::default().with_secret("shared");
        config.store = StoreConfig::Shared {
            path: dir.path().join("vigil.db"),
            busy_timeout_ms: 2_000,
        };
        let a = AnalysisService::new(config.clone()).unwrap();
        let b = AnalysisService::new(config).unwrap();
        assert_eq!(a.store_backend(), "sqlite");
        for _ in 0..5 {
            a.analyze(&request("x = 1\n")).unwrap();
            b.analyze(&request("x = 1\n")).unwrap();
        }
        assert!(a.analyze(&request("x = 1\n")).is_err());
        let status = b.rate_limit_status(None, "198.51.100.1").unwrap();
        assert_eq!(status.current_count, 11);
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(matches!(
            AnalysisService::new(VigilConfig::default()),
            Err(VigilError::Config(_))
        ));
    }
}
