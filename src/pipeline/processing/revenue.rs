use tracing::{info, instrument};

use crate::constants::{FUSION, REVENUE_BY_PRODUCT, REVENUE_TOTAL};
use crate::error::{GateViolation, Result};
use crate::pipeline::processing::validation_gate::{GateCheck, Invariant};
use crate::pipeline::processing::{round2, Stage, StageOutcome};
use crate::pipeline::storage::PipelineStore;
use crate::pipeline::StageName;
use crate::types::{FusedProduct, RevenueLine, RevenueTotal};

/// Per-product revenue for sellable, in-stock products, plus the rounded total.
pub fn compute_revenue(
    products: &[FusedProduct],
    in_stock_status: &str,
) -> (Vec<RevenueLine>, RevenueTotal) {
    let lines: Vec<RevenueLine> = products
        .iter()
        .filter(|p| p.stock_quantity > 0 && p.stock_status == in_stock_status)
        .map(|p| RevenueLine {
            product_id: p.product_id,
            post_title: p.post_title.clone(),
            price: p.price,
            stock_quantity: p.stock_quantity,
            revenue: round2(p.price * p.stock_quantity as f64),
        })
        .collect();

    let total = RevenueTotal {
        total: round2(lines.iter().map(|l| l.revenue).sum()),
        product_count: lines.len() as i64,
    };
    (lines, total)
}

/// Mean and median of the line revenues. `None` for an empty slice.
pub fn revenue_distribution(lines: &[RevenueLine]) -> Option<(f64, f64)> {
    if lines.is_empty() {
        return None;
    }
    let mut values: Vec<f64> = lines.iter().map(|l| l.revenue).collect();
    values.sort_by(|a, b| a.total_cmp(b));
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let mid = values.len() / 2;
    let median = if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    };
    Some((mean, median))
}

#[derive(Debug, Clone)]
pub struct RevenueAggregationStage {
    in_stock_status: String,
    expected_rows: Option<usize>,
    expected_total: Option<f64>,
}

impl RevenueAggregationStage {
    pub fn new(
        in_stock_status: impl Into<String>,
        expected_rows: Option<usize>,
        expected_total: Option<f64>,
    ) -> Self {
        Self {
            in_stock_status: in_stock_status.into(),
            expected_rows,
            expected_total,
        }
    }
}

impl Stage for RevenueAggregationStage {
    fn name(&self) -> StageName {
        StageName::Revenue
    }

    fn inputs(&self) -> &'static [&'static str] {
        &[FUSION]
    }

    fn outputs(&self) -> &'static [&'static str] {
        &[REVENUE_BY_PRODUCT, REVENUE_TOTAL]
    }

    #[instrument(skip_all, fields(stage = "revenue"))]
    fn run(&self, store: &mut PipelineStore) -> Result<StageOutcome> {
        let products: Vec<FusedProduct> = store.read(FUSION)?;
        let (lines, total) = compute_revenue(&products, &self.in_stock_status);

        if lines.is_empty() {
            return Err(GateViolation::empty(self.name(), REVENUE_BY_PRODUCT).into());
        }

        if let Some((mean, median)) = revenue_distribution(&lines) {
            info!(
                products = lines.len(),
                total = total.total,
                mean = round2(mean),
                median = round2(median),
                "Revenue aggregated"
            );
        }
        if let Some(top) = lines.iter().max_by(|a, b| a.revenue.total_cmp(&b.revenue)) {
            info!(
                product_id = top.product_id,
                title = top.post_title.as_deref().unwrap_or(""),
                revenue = top.revenue,
                "Top product by revenue"
            );
        }

        let mut writer = store.writer(self.name().as_str())?;
        writer.replace(REVENUE_BY_PRODUCT, &lines)?;
        writer.replace(REVENUE_TOTAL, &[total])?;
        let written = writer.commit()?;
        Ok(StageOutcome { written })
    }

    fn gate_checks(&self) -> Vec<GateCheck> {
        let mut line_checks = vec![
            Invariant::NonEmpty,
            Invariant::UniqueKey(vec!["product_id"]),
            Invariant::NotNull(vec!["product_id", "price", "stock_quantity", "revenue"]),
            Invariant::NonNegative(vec!["price", "stock_quantity", "revenue"]),
            Invariant::Finite(vec!["revenue"]),
            Invariant::AtMostRowsOf(FUSION),
            Invariant::KeysReference {
                column: "product_id",
                target: FUSION,
                target_column: "product_id",
            },
        ];
        if let Some(n) = self.expected_rows {
            line_checks.push(Invariant::ExactCardinality(n));
        }

        let mut total_checks = vec![
            Invariant::ExactCardinality(1),
            Invariant::NotNull(vec!["total", "product_count"]),
            Invariant::NonNegative(vec!["total"]),
            Invariant::Finite(vec!["total"]),
            Invariant::SumMatches {
                column: "total",
                lines: REVENUE_BY_PRODUCT,
                lines_column: "revenue",
            },
        ];
        if let Some(expected) = self.expected_total {
            total_checks.push(Invariant::ValueEquals {
                column: "total",
                expected,
            });
        }

        vec![
            GateCheck::new(REVENUE_BY_PRODUCT, line_checks),
            GateCheck::new(REVENUE_TOTAL, total_checks),
        ]
    }
}
