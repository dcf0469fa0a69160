//! Pluggable test-coverage figure attached to results.

use rand::Rng;

use crate::config::CoverageMode;
use crate::models::{CoverageMetric, SourceUnit};

pub trait CoverageSource: Send + Sync {
    /// `None` leaves the field out of the result entirely.
    fn measure(&self, unit: &SourceUnit) -> Option<CoverageMetric>;
}

/// Default source: no coverage is reported.
pub struct NoCoverage;

impl CoverageSource for NoCoverage {
    fn measure(&self, _unit: &SourceUnit) -> Option<CoverageMetric> {
        None
    }
}

/// Random placeholder in `[center - spread, center + spread]`, labelled
/// `"simulated"` so it can never pass for a measured figure.
pub struct SimulatedCoverage {
    center: f64,
    spread: f64,
}

impl SimulatedCoverage {
    pub const SOURCE: &'static str = "simulated";

    pub fn new(center: f64, spread: f64) -> Self {
        Self {
            center,
            spread: spread.abs(),
        }
    }
}

impl Default for SimulatedCoverage {
    fn default() -> Self {
        Self::new(85.0, 5.0)
    }
}

impl CoverageSource for SimulatedCoverage {
    fn measure(&self, _unit: &SourceUnit) -> Option<CoverageMetric> {
        let offset = if self.spread > 0.0 {
            rand::thread_rng().gen_range(-self.spread..=self.spread)
        } else {
            0.0
        };
        let percent = ((self.center + offset).clamp(0.0, 100.0) * 10.0).round() / 10.0;
        Some(CoverageMetric {
            percent,
            source: Self::SOURCE.to_string(),
        })
    }
}

pub fn coverage_source(mode: CoverageMode) -> Box<dyn CoverageSource> {
    match mode {
        CoverageMode::Disabled => Box::new(NoCoverage),
        CoverageMode::Simulated => Box::new(SimulatedCoverage::default()),
    }
}
