pub mod budget;
pub mod coverage;
pub mod detectors;
pub mod external;
pub mod guards;
pub mod metrics;
pub mod orchestrator;
pub mod rules;
pub mod suggestions;
