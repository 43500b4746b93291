// Data processing pipeline: ingestion, staged processing, storage and reporting

pub mod export;
pub mod ingestion;
pub mod processing;
pub mod storage;
pub mod summary;

use metrics::{counter, histogram};
use serde::Serialize;
use std::fmt;
use std::time::Instant;
use tracing::{error, info, instrument, warn};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use processing::cleaning::CleaningStage;
use processing::dedup::DeduplicationStage;
use processing::fusion::FusionStage;
use processing::outliers::OutlierDetectionStage;
use processing::revenue::RevenueAggregationStage;
use processing::validation_gate::{StoreValidationGate, ValidationGate};
use processing::{Stage, StageOutcome};
use storage::PipelineStore;

pub const STATUS_RUNNING: &str = "running";
pub const STATUS_SUCCEEDED: &str = "succeeded";
pub const STATUS_FAILED: &str = "failed";

/// The pipeline stages, in execution order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum StageName {
    Clean,
    Dedup,
    Fuse,
    Revenue,
    Outliers,
}

impl StageName {
    pub const ALL: [StageName; 5] = [
        StageName::Clean,
        StageName::Dedup,
        StageName::Fuse,
        StageName::Revenue,
        StageName::Outliers,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Clean => "clean",
            StageName::Dedup => "dedup",
            StageName::Fuse => "fuse",
            StageName::Revenue => "revenue",
            StageName::Outliers => "outliers",
        }
    }

    /// Stage whose outputs this stage reads. Cleaning reads the loader's raw relations.
    pub fn upstream(&self) -> Option<StageName> {
        match self {
            StageName::Clean => None,
            StageName::Dedup => Some(StageName::Clean),
            StageName::Fuse => Some(StageName::Dedup),
            StageName::Revenue | StageName::Outliers => Some(StageName::Fuse),
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Result of one successful stage execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageSummary {
    pub stage: StageName,
    pub run_id: String,
    pub written: Vec<(String, usize)>,
    pub invariants_checked: usize,
    pub duration_ms: u128,
}

/// Runs stages against a store: stage body, then the validation gate, with
/// every execution recorded in the store's run ledger.
pub struct Pipeline {
    config: PipelineConfig,
    gate: Box<dyn ValidationGate>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self::with_gate(config, Box::new(StoreValidationGate::new()))
    }

    pub fn with_gate(config: PipelineConfig, gate: Box<dyn ValidationGate>) -> Self {
        Self { config, gate }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Build the configured implementation of a stage.
    pub fn stage(&self, name: StageName) -> Box<dyn Stage> {
        let rules = &self.config.rules;
        let expected = &self.config.expected;
        match name {
            StageName::Clean => Box::new(CleaningStage::new()),
            StageName::Dedup => Box::new(DeduplicationStage::new(
                rules.erp_reconciliation,
                rules.sellable_post_type.clone(),
            )),
            StageName::Fuse => Box::new(FusionStage::new(expected.fused_rows)),
            StageName::Revenue => Box::new(RevenueAggregationStage::new(
                rules.in_stock_status.clone(),
                expected.revenue_rows,
                expected.revenue_total,
            )),
            StageName::Outliers => Box::new(OutlierDetectionStage::new(
                rules.outlier_z_threshold,
                expected.outlier_rows,
            )),
        }
    }

    /// Run stages `from..=to` in order, stopping at the first failure.
    pub fn run(
        &self,
        store: &mut PipelineStore,
        from: Option<StageName>,
        to: Option<StageName>,
    ) -> Result<Vec<StageSummary>> {
        let from = from.unwrap_or(StageName::Clean);
        let to = to.unwrap_or(StageName::Outliers);
        if from > to {
            return Err(PipelineError::Config(format!(
                "--from {} comes after --to {}",
                from, to
            )));
        }

        info!("🚀 Running pipeline from {} to {}", from, to);
        let started = Instant::now();
        let mut summaries = Vec::new();
        for name in StageName::ALL.into_iter().filter(|s| *s >= from && *s <= to) {
            summaries.push(self.run_stage(store, name)?);
        }
        info!(
            stages = summaries.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "✅ Pipeline run completed"
        );
        Ok(summaries)
    }

    /// Run a single stage followed by its gate.
    #[instrument(skip(self, store), fields(stage = %name))]
    pub fn run_stage(&self, store: &mut PipelineStore, name: StageName) -> Result<StageSummary> {
        self.check_upstream(store, name)?;
        let stage = self.stage(name);
        self.execute(store, stage.as_ref())
    }

    fn execute(&self, store: &mut PipelineStore, stage: &dyn Stage) -> Result<StageSummary> {
        let name = stage.name();
        let run_id = store.begin_stage_run(name.as_str())?;
        let started = Instant::now();
        info!(run_id = %run_id, inputs = ?stage.inputs(), "Stage started");

        let result = match stage.run(store) {
            Ok(outcome) => match check_declared_outputs(stage, &outcome) {
                Ok(()) => self
                    .gate
                    .check(store, name, &stage.gate_checks())
                    .map(|report| (outcome, report)),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        let elapsed = started.elapsed();
        histogram!("pipeline_stage_duration_seconds", "stage" => name.to_string())
            .record(elapsed.as_secs_f64());

        match result {
            Ok((outcome, report)) => {
                store.finish_stage_run(&run_id, STATUS_SUCCEEDED, None)?;
                counter!(
                    "pipeline_stage_runs_total",
                    "stage" => name.to_string(),
                    "status" => STATUS_SUCCEEDED
                )
                .increment(1);
                info!(
                    run_id = %run_id,
                    outputs = ?stage.outputs(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Stage succeeded"
                );
                Ok(StageSummary {
                    stage: name,
                    run_id,
                    written: outcome.written,
                    invariants_checked: report.invariants_checked,
                    duration_ms: elapsed.as_millis(),
                })
            }
            Err(e) => {
                let message = e.to_string();
                if let Err(ledger_err) =
                    store.finish_stage_run(&run_id, STATUS_FAILED, Some(&message))
                {
                    warn!("Could not record failure of run {}: {}", run_id, ledger_err);
                }
                counter!(
                    "pipeline_stage_runs_total",
                    "stage" => name.to_string(),
                    "status" => STATUS_FAILED
                )
                .increment(1);
                error!(run_id = %run_id, error = %message, "Stage failed");
                Err(e)
            }
        }
    }

    /// Refuse to run a stage whose upstream stage's latest run did not succeed.
    fn check_upstream(&self, store: &PipelineStore, name: StageName) -> Result<()> {
        let Some(upstream) = name.upstream() else {
            return Ok(());
        };
        let relation = self.stage(upstream).outputs()[0];
        match store.last_stage_run(upstream.as_str())? {
            Some(run) if run.status != STATUS_SUCCEEDED => Err(PipelineError::ingestion(
                relation,
                format!(
                    "upstream stage {} did not succeed (run {} is {}{})",
                    upstream,
                    run.run_id,
                    run.status,
                    run.message.map(|m| format!(": {}", m)).unwrap_or_default()
                ),
            )),
            // Never ran: the input reads decide whether the relations exist
            _ => Ok(()),
        }
    }
}

/// A stage may only write the relations it declares as outputs.
fn check_declared_outputs(stage: &dyn Stage, outcome: &StageOutcome) -> Result<()> {
    match outcome
        .written
        .iter()
        .find(|(relation, _)| !stage.outputs().contains(&relation.as_str()))
    {
        Some((relation, _)) => Err(PipelineError::UndeclaredOutput {
            stage: stage.name(),
            relation: relation.clone(),
        }),
        None => Ok(()),
    }
}
