use tracing::{info, instrument, warn};

use crate::constants::{FUSION, ORDINARY_PRODUCTS, OUTLIER_PRODUCTS};
use crate::error::{PipelineError, Result};
use crate::pipeline::processing::validation_gate::{GateCheck, Invariant};
use crate::pipeline::processing::{Stage, StageOutcome};
use crate::pipeline::storage::PipelineStore;
use crate::pipeline::StageName;
use crate::types::{FusedProduct, OutlierClassification, Segment};

/// Population statistics of a price column.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceStats {
    pub mean: f64,
    pub std_dev: f64,
}

/// Population mean and standard deviation. Fails when the deviation cannot
/// be used as a divisor (empty input, a single distinct price, or overflow).
pub fn price_stats(prices: &[f64]) -> Result<PriceStats> {
    let precondition = |message: String| PipelineError::ArithmeticPrecondition {
        stage: StageName::Outliers,
        relation: FUSION.to_string(),
        message,
    };

    if prices.is_empty() {
        return Err(precondition("no prices to standardize".to_string()));
    }
    let (min, max) = prices
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), p| {
            (lo.min(*p), hi.max(*p))
        });
    if min == max {
        return Err(precondition(format!(
            "every one of {} products has price {}",
            prices.len(),
            min
        )));
    }

    let n = prices.len() as f64;
    let mean = prices.iter().sum::<f64>() / n;
    let variance = prices.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / n;
    let std_dev = variance.sqrt();

    if !std_dev.is_finite() {
        return Err(precondition(format!("standard deviation of price is {}", std_dev)));
    }
    // Rounding residue from the mean, not a real spread
    if std_dev <= f64::EPSILON * mean.abs().max(1.0) {
        return Err(precondition(format!(
            "standard deviation of price is {:e} over {} products",
            std_dev,
            prices.len()
        )));
    }
    Ok(PriceStats { mean, std_dev })
}

/// Split products into outliers (z > threshold) and ordinary ones, both
/// ordered by product_id.
pub fn classify(
    products: &[FusedProduct],
    stats: PriceStats,
    threshold: f64,
) -> (Vec<OutlierClassification>, Vec<OutlierClassification>) {
    let mut sorted: Vec<&FusedProduct> = products.iter().collect();
    sorted.sort_by_key(|p| p.product_id);

    sorted
        .into_iter()
        .map(|p| {
            let z_score = (p.price - stats.mean) / stats.std_dev;
            OutlierClassification {
                product_id: p.product_id,
                post_title: p.post_title.clone(),
                price: p.price,
                z_score,
                segment: if z_score > threshold {
                    Segment::Outlier
                } else {
                    Segment::Ordinary
                },
            }
        })
        .partition(|c| c.segment == Segment::Outlier)
}

#[derive(Debug, Clone)]
pub struct OutlierDetectionStage {
    threshold: f64,
    expected_rows: Option<usize>,
}

impl OutlierDetectionStage {
    pub fn new(threshold: f64, expected_rows: Option<usize>) -> Self {
        Self {
            threshold,
            expected_rows,
        }
    }
}

impl Stage for OutlierDetectionStage {
    fn name(&self) -> StageName {
        StageName::Outliers
    }

    fn inputs(&self) -> &'static [&'static str] {
        &[FUSION]
    }

    fn outputs(&self) -> &'static [&'static str] {
        &[OUTLIER_PRODUCTS, ORDINARY_PRODUCTS]
    }

    #[instrument(skip_all, fields(stage = "outliers", threshold = self.threshold))]
    fn run(&self, store: &mut PipelineStore) -> Result<StageOutcome> {
        let products: Vec<FusedProduct> = store.read(FUSION)?;
        let prices: Vec<f64> = products.iter().map(|p| p.price).collect();
        let stats = price_stats(&prices)?;

        let (outliers, ordinary) = classify(&products, stats, self.threshold);
        info!(
            mean = stats.mean,
            std_dev = stats.std_dev,
            outliers = outliers.len(),
            ordinary = ordinary.len(),
            "Classified prices"
        );
        if outliers.is_empty() {
            warn!("No product above z = {}", self.threshold);
        }

        let mut writer = store.writer(self.name().as_str())?;
        writer.replace(OUTLIER_PRODUCTS, &outliers)?;
        writer.replace(ORDINARY_PRODUCTS, &ordinary)?;
        let written = writer.commit()?;
        Ok(StageOutcome { written })
    }

    fn gate_checks(&self) -> Vec<GateCheck> {
        let mut outlier_checks = vec![
            Invariant::UniqueKey(vec!["product_id"]),
            Invariant::NotNull(vec!["product_id", "segment"]),
            Invariant::Finite(vec!["price", "z_score"]),
            Invariant::KeysReference {
                column: "product_id",
                target: FUSION,
                target_column: "product_id",
            },
            Invariant::PartitionOf {
                key: "product_id",
                sibling: ORDINARY_PRODUCTS,
                whole: FUSION,
            },
        ];
        if let Some(n) = self.expected_rows {
            outlier_checks.push(Invariant::ExactCardinality(n));
        }

        vec![
            GateCheck::new(OUTLIER_PRODUCTS, outlier_checks),
            GateCheck::new(
                ORDINARY_PRODUCTS,
                vec![
                    Invariant::UniqueKey(vec!["product_id"]),
                    Invariant::NotNull(vec!["product_id", "segment"]),
                    Invariant::Finite(vec!["price", "z_score"]),
                    Invariant::KeysReference {
                        column: "product_id",
                        target: FUSION,
                        target_column: "product_id",
                    },
                ],
            ),
        ]
    }
}
