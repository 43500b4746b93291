use serde::Serialize;
use std::fmt::Write as _;
use tracing::info;

use crate::constants::{get_pipeline_relations, REVENUE_TOTAL};
use crate::error::Result;
use crate::pipeline::storage::{PipelineStore, RelationInfo, StageRun};
use crate::types::RevenueTotal;

/// Snapshot of the store's contents for the `summary` command.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineSummary {
    /// Cataloged pipeline relations, in stage order
    pub relations: Vec<RelationInfo>,
    pub revenue_total: Option<RevenueTotal>,
    pub recent_runs: Vec<StageRun>,
}

impl PipelineSummary {
    pub fn collect(store: &PipelineStore, recent_runs: usize) -> Result<Self> {
        let mut relations = Vec::new();
        for name in get_pipeline_relations() {
            if let Some(info) = store.relation_info(name)? {
                relations.push(info);
            }
        }

        let revenue_total = if store.exists(REVENUE_TOTAL)? {
            store.read::<RevenueTotal>(REVENUE_TOTAL)?.into_iter().next()
        } else {
            None
        };

        let summary = Self {
            relations,
            revenue_total,
            recent_runs: store.stage_runs(recent_runs)?,
        };
        summary.log();
        Ok(summary)
    }

    fn log(&self) {
        for r in &self.relations {
            info!(relation = %r.name, owner = %r.owner, rows = r.row_count, "Relation summary");
        }
        if let Some(total) = &self.revenue_total {
            info!(total = total.total, products = total.product_count, "Revenue total");
        }
    }

    /// Plain-text table for terminal output.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<22} {:<10} {:>8}  {}",
            "RELATION", "OWNER", "ROWS", "FINGERPRINT"
        );
        for r in &self.relations {
            let _ = writeln!(
                out,
                "{:<22} {:<10} {:>8}  {}",
                r.name,
                r.owner,
                r.row_count,
                &r.fingerprint[..12.min(r.fingerprint.len())]
            );
        }
        if let Some(total) = &self.revenue_total {
            let _ = writeln!(
                out,
                "\nRevenue total: {:.2} over {} products",
                total.total, total.product_count
            );
        }
        if !self.recent_runs.is_empty() {
            let _ = writeln!(out, "\nRecent stage runs:");
            for run in &self.recent_runs {
                let _ = writeln!(
                    out,
                    "  {:<9} {:<10} {}{}",
                    run.stage,
                    run.status,
                    run.started_at,
                    run.message
                        .as_deref()
                        .map(|m| format!("  ({})", m))
                        .unwrap_or_default()
                );
            }
        }
        out
    }
}
