// Pipeline processing: cleaning, deduplication, fusion, analytics and the validation gate

pub mod cleaning;
pub mod dedup;
pub mod fusion;
pub mod outliers;
pub mod revenue;
pub mod validation_gate;

use crate::error::Result;
use crate::pipeline::storage::PipelineStore;
use crate::pipeline::StageName;
use validation_gate::GateCheck;

/// Relations written by one stage execution, with their row counts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageOutcome {
    pub written: Vec<(String, usize)>,
}

/// One step of the pipeline.
///
/// A stage reads its inputs from the store, writes every relation it owns in
/// a single transaction, and declares the invariants its outputs must satisfy.
pub trait Stage {
    fn name(&self) -> StageName;

    /// Relations read by this stage
    fn inputs(&self) -> &'static [&'static str];

    /// Relations owned (replaced) by this stage
    fn outputs(&self) -> &'static [&'static str];

    fn run(&self, store: &mut PipelineStore) -> Result<StageOutcome>;

    /// Invariants checked against the outputs once `run` has committed.
    fn gate_checks(&self) -> Vec<GateCheck>;
}

/// Round half away from zero to two decimals.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round2() {
        assert_eq!(round2(50.0), 50.0);
        assert_eq!(round2(12.346), 12.35);
        assert_eq!(round2(-1.004), -1.0);
        assert_eq!(round2(24.2 * 3.0), 72.6);
        assert_eq!(round2(0.0), 0.0);
    }
}
