use serde::Serialize;
use std::fmt;
use tracing::{info, instrument, warn};

use crate::constants::{
    CLEANING_EXCLUSIONS, ERP_CLEAN, ERP_RAW, LIAISON_CLEAN, LIAISON_RAW, SOURCE_ERP,
    SOURCE_LIAISON, SOURCE_WEB, WEB_CLEAN, WEB_RAW,
};
use crate::error::Result;
use crate::pipeline::processing::validation_gate::{GateCheck, Invariant};
use crate::pipeline::processing::{Stage, StageOutcome};
use crate::pipeline::storage::PipelineStore;
use crate::pipeline::StageName;
use crate::types::{
    ErpRecord, ExcludedRecord, LiaisonRecord, RawErpRecord, RawLiaisonRecord, RawWebRecord,
    WebRecord,
};

/// Why a raw row was rejected. Only the first failing predicate is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExclusionReason {
    MissingProductId,
    MissingOnsaleWeb,
    MissingPrice,
    NonPositivePrice,
    MissingStockQuantity,
    MissingStockStatus,
    MissingSku,
    MissingIdWeb,
}

impl ExclusionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExclusionReason::MissingProductId => "missing_product_id",
            ExclusionReason::MissingOnsaleWeb => "missing_onsale_web",
            ExclusionReason::MissingPrice => "missing_price",
            ExclusionReason::NonPositivePrice => "non_positive_price",
            ExclusionReason::MissingStockQuantity => "missing_stock_quantity",
            ExclusionReason::MissingStockStatus => "missing_stock_status",
            ExclusionReason::MissingSku => "missing_sku",
            ExclusionReason::MissingIdWeb => "missing_id_web",
        }
    }
}

impl fmt::Display for ExclusionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rows kept by a predicate, plus the audit trail of rejected rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Cleaned<T> {
    pub kept: Vec<T>,
    pub excluded: Vec<ExcludedRecord>,
}

impl<T> Cleaned<T> {
    fn new() -> Self {
        Self {
            kept: Vec::new(),
            excluded: Vec::new(),
        }
    }
}

pub fn erp_predicate(raw: &RawErpRecord) -> std::result::Result<ErpRecord, ExclusionReason> {
    let product_id = raw.product_id.ok_or(ExclusionReason::MissingProductId)?;
    let onsale_web = raw.onsale_web.ok_or(ExclusionReason::MissingOnsaleWeb)?;
    let price = raw.price.ok_or(ExclusionReason::MissingPrice)?;
    // NaN fails this comparison too
    if !(price > 0.0) {
        return Err(ExclusionReason::NonPositivePrice);
    }
    let stock_quantity = raw.stock_quantity.ok_or(ExclusionReason::MissingStockQuantity)?;
    let stock_status = raw
        .stock_status
        .clone()
        .ok_or(ExclusionReason::MissingStockStatus)?;
    Ok(ErpRecord {
        product_id,
        onsale_web,
        price,
        stock_quantity,
        stock_status,
    })
}

pub fn web_predicate(raw: &RawWebRecord) -> std::result::Result<WebRecord, ExclusionReason> {
    let sku = raw.sku.clone().ok_or(ExclusionReason::MissingSku)?;
    Ok(WebRecord {
        sku,
        post_title: raw.post_title.clone(),
        post_excerpt: raw.post_excerpt.clone(),
        post_status: raw.post_status.clone(),
        post_type: raw.post_type.clone(),
        post_date: raw.post_date,
        average_rating: raw.average_rating,
        total_sales: raw.total_sales,
    })
}

pub fn liaison_predicate(
    raw: &RawLiaisonRecord,
) -> std::result::Result<LiaisonRecord, ExclusionReason> {
    let product_id = raw.product_id.ok_or(ExclusionReason::MissingProductId)?;
    let id_web = raw.id_web.clone().ok_or(ExclusionReason::MissingIdWeb)?;
    Ok(LiaisonRecord { product_id, id_web })
}

/// Apply `predicate` to every raw row, keeping source order.
pub fn clean_with<R, T, F>(source: &str, rows: &[R], predicate: F) -> Result<Cleaned<T>>
where
    R: Serialize,
    F: Fn(&R) -> std::result::Result<T, ExclusionReason>,
{
    let mut cleaned = Cleaned::new();
    for row in rows {
        match predicate(row) {
            Ok(kept) => cleaned.kept.push(kept),
            Err(reason) => cleaned.excluded.push(ExcludedRecord {
                source: source.to_string(),
                reason: reason.as_str().to_string(),
                record: serde_json::to_string(row)?,
            }),
        }
    }
    Ok(cleaned)
}

/// Applies the per-source completeness predicates to the raw relations.
#[derive(Debug, Default)]
pub struct CleaningStage;

impl CleaningStage {
    pub fn new() -> Self {
        Self
    }
}

impl Stage for CleaningStage {
    fn name(&self) -> StageName {
        StageName::Clean
    }

    fn inputs(&self) -> &'static [&'static str] {
        &[ERP_RAW, WEB_RAW, LIAISON_RAW]
    }

    fn outputs(&self) -> &'static [&'static str] {
        &[ERP_CLEAN, WEB_CLEAN, LIAISON_CLEAN, CLEANING_EXCLUSIONS]
    }

    #[instrument(skip_all, fields(stage = "clean"))]
    fn run(&self, store: &mut PipelineStore) -> Result<StageOutcome> {
        // Read everything first: a missing relation or column aborts before any write
        let erp_raw: Vec<RawErpRecord> = store.read(ERP_RAW)?;
        let web_raw: Vec<RawWebRecord> = store.read(WEB_RAW)?;
        let liaison_raw: Vec<RawLiaisonRecord> = store.read(LIAISON_RAW)?;

        let erp = clean_with(SOURCE_ERP, &erp_raw, erp_predicate)?;
        let web = clean_with(SOURCE_WEB, &web_raw, web_predicate)?;
        let liaison = clean_with(SOURCE_LIAISON, &liaison_raw, liaison_predicate)?;

        log_source(SOURCE_ERP, erp_raw.len(), &erp);
        log_source(SOURCE_WEB, web_raw.len(), &web);
        log_source(SOURCE_LIAISON, liaison_raw.len(), &liaison);

        let exclusions: Vec<ExcludedRecord> = erp
            .excluded
            .iter()
            .chain(&web.excluded)
            .chain(&liaison.excluded)
            .cloned()
            .collect();

        let mut writer = store.writer(self.name().as_str())?;
        writer.replace(ERP_CLEAN, &erp.kept)?;
        writer.replace(WEB_CLEAN, &web.kept)?;
        writer.replace(LIAISON_CLEAN, &liaison.kept)?;
        writer.replace(CLEANING_EXCLUSIONS, &exclusions)?;
        let written = writer.commit()?;

        Ok(StageOutcome { written })
    }

    fn gate_checks(&self) -> Vec<GateCheck> {
        vec![
            GateCheck::new(
                ERP_CLEAN,
                vec![
                    Invariant::NonEmpty,
                    Invariant::AtMostRowsOf(ERP_RAW),
                    Invariant::NotNull(vec![
                        "product_id",
                        "onsale_web",
                        "price",
                        "stock_quantity",
                        "stock_status",
                    ]),
                    Invariant::Positive(vec!["price"]),
                ],
            ),
            GateCheck::new(
                WEB_CLEAN,
                vec![
                    Invariant::NonEmpty,
                    Invariant::AtMostRowsOf(WEB_RAW),
                    Invariant::NotNull(vec!["sku"]),
                ],
            ),
            GateCheck::new(
                LIAISON_CLEAN,
                vec![
                    Invariant::NonEmpty,
                    Invariant::AtMostRowsOf(LIAISON_RAW),
                    Invariant::NotNull(vec!["product_id", "id_web"]),
                ],
            ),
            GateCheck::new(
                CLEANING_EXCLUSIONS,
                vec![Invariant::NotNull(vec!["source", "reason", "record"])],
            ),
        ]
    }
}

fn log_source<T>(source: &str, raw: usize, cleaned: &Cleaned<T>) {
    info!(
        source,
        raw,
        kept = cleaned.kept.len(),
        excluded = cleaned.excluded.len(),
        "Cleaned source"
    );
    if !cleaned.excluded.is_empty() {
        let mut reasons: Vec<&str> = cleaned.excluded.iter().map(|e| e.reason.as_str()).collect();
        reasons.sort_unstable();
        reasons.dedup();
        warn!("{} - {} rows excluded ({})", source, cleaned.excluded.len(), reasons.join(", "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_erp(product_id: Option<i64>, price: Option<f64>) -> RawErpRecord {
        RawErpRecord {
            product_id,
            onsale_web: Some(1),
            price,
            stock_quantity: Some(3),
            stock_status: Some("instock".to_string()),
        }
    }

    #[test]
    fn test_erp_predicate_reasons() {
        assert!(erp_predicate(&raw_erp(Some(1), Some(10.0))).is_ok());
        assert_eq!(
            erp_predicate(&raw_erp(None, Some(10.0))).unwrap_err(),
            ExclusionReason::MissingProductId
        );
        assert_eq!(
            erp_predicate(&raw_erp(Some(1), None)).unwrap_err(),
            ExclusionReason::MissingPrice
        );
        assert_eq!(
            erp_predicate(&raw_erp(Some(1), Some(0.0))).unwrap_err(),
            ExclusionReason::NonPositivePrice
        );
        assert_eq!(
            erp_predicate(&raw_erp(Some(1), Some(-4.5))).unwrap_err(),
            ExclusionReason::NonPositivePrice
        );
        assert_eq!(
            erp_predicate(&raw_erp(Some(1), Some(f64::NAN))).unwrap_err(),
            ExclusionReason::NonPositivePrice
        );

        let mut no_status = raw_erp(Some(1), Some(10.0));
        no_status.stock_status = None;
        assert_eq!(
            erp_predicate(&no_status).unwrap_err(),
            ExclusionReason::MissingStockStatus
        );
    }

    #[test]
    fn test_clean_with_records_exclusions_in_order() {
        let rows = vec![
            raw_erp(Some(1), Some(10.0)),
            raw_erp(Some(2), Some(0.0)),
            raw_erp(Some(3), Some(5.0)),
            raw_erp(None, Some(5.0)),
        ];
        let cleaned = clean_with(SOURCE_ERP, &rows, erp_predicate).unwrap();

        let kept: Vec<i64> = cleaned.kept.iter().map(|r| r.product_id).collect();
        assert_eq!(kept, vec![1, 3]);
        assert_eq!(cleaned.excluded.len(), 2);
        assert_eq!(cleaned.excluded[0].reason, "non_positive_price");
        assert_eq!(cleaned.excluded[1].reason, "missing_product_id");
        assert!(cleaned.excluded[0].record.contains("\"product_id\":2"));
        // Cleaning only removes rows
        assert!(cleaned.kept.len() + cleaned.excluded.len() == rows.len());
    }

    #[test]
    fn test_web_and_liaison_predicates() {
        let web = RawWebRecord {
            sku: None,
            post_title: Some("Orphan".to_string()),
            post_excerpt: None,
            post_status: None,
            post_type: Some("product".to_string()),
            post_date: None,
            average_rating: None,
            total_sales: None,
        };
        assert_eq!(web_predicate(&web).unwrap_err(), ExclusionReason::MissingSku);

        let liaison = RawLiaisonRecord {
            product_id: Some(4000),
            id_web: None,
        };
        assert_eq!(
            liaison_predicate(&liaison).unwrap_err(),
            ExclusionReason::MissingIdWeb
        );
    }

    #[test]
    fn test_gate_rejects_zero_price_in_clean_erp() {
        use crate::error::PipelineError;
        use crate::pipeline::ingestion::LOADER_OWNER;
        use crate::pipeline::processing::validation_gate::{StoreValidationGate, ValidationGate};

        let mut store = PipelineStore::open_in_memory().unwrap();
        let mut writer = store.writer(LOADER_OWNER).unwrap();
        writer
            .replace(ERP_RAW, &[raw_erp(Some(1), Some(10.0)), raw_erp(Some(2), Some(0.0))])
            .unwrap();
        writer
            .replace(
                WEB_RAW,
                &[RawWebRecord {
                    sku: Some("W1".to_string()),
                    post_title: None,
                    post_excerpt: None,
                    post_status: None,
                    post_type: Some("product".to_string()),
                    post_date: None,
                    average_rating: None,
                    total_sales: None,
                }],
            )
            .unwrap();
        writer
            .replace(
                LIAISON_RAW,
                &[RawLiaisonRecord {
                    product_id: Some(1),
                    id_web: Some("W1".to_string()),
                }],
            )
            .unwrap();
        writer.commit().unwrap();

        let stage = CleaningStage::new();
        let gate = StoreValidationGate::new();
        stage.run(&mut store).unwrap();
        gate.check(&store, StageName::Clean, &stage.gate_checks()).unwrap();

        // A zero price that slipped past the predicate is caught by the gate
        let zero = ErpRecord {
            product_id: 2,
            onsale_web: 1,
            price: 0.0,
            stock_quantity: 3,
            stock_status: "instock".to_string(),
        };
        store.replace("clean", ERP_CLEAN, &[zero]).unwrap();
        let err = gate
            .check(&store, StageName::Clean, &stage.gate_checks())
            .unwrap_err();
        match err {
            PipelineError::Gate(v) => {
                assert_eq!(v.relation, ERP_CLEAN);
                assert_eq!(v.invariant, "positive(price)");
                assert_eq!(v.observed, "1 non-positive values in price");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
