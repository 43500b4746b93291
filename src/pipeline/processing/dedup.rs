use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{info, instrument};

use crate::constants::{
    ERP_CLEAN, ERP_DEDUP, LIAISON_CLEAN, LIAISON_DEDUP, SOURCE_ERP, SOURCE_LIAISON, SOURCE_WEB,
    WEB_CLEAN, WEB_DEDUP,
};
use crate::error::{GateViolation, Result};
use crate::pipeline::processing::validation_gate::{GateCheck, Invariant};
use crate::pipeline::processing::{Stage, StageOutcome};
use crate::pipeline::storage::PipelineStore;
use crate::pipeline::StageName;
use crate::types::{ErpRecord, LiaisonRecord, WebRecord};

/// How duplicate ERP rows sharing a product_id collapse into one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReconcileStrategy {
    /// Column-wise maximum across the group
    #[default]
    TakeMax,
    /// Last row of the group in source order
    TakeLatest,
    /// First row of the group in source order
    TakeFirst,
}

impl ReconcileStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileStrategy::TakeMax => "take-max",
            ReconcileStrategy::TakeLatest => "take-latest",
            ReconcileStrategy::TakeFirst => "take-first",
        }
    }

    /// Fold `next` into the accumulated row for the same product.
    pub fn reconcile(&self, acc: &mut ErpRecord, next: &ErpRecord) {
        match self {
            ReconcileStrategy::TakeMax => {
                acc.onsale_web = acc.onsale_web.max(next.onsale_web);
                acc.price = acc.price.max(next.price);
                acc.stock_quantity = acc.stock_quantity.max(next.stock_quantity);
                if next.stock_status > acc.stock_status {
                    acc.stock_status = next.stock_status.clone();
                }
            }
            ReconcileStrategy::TakeLatest => *acc = next.clone(),
            ReconcileStrategy::TakeFirst => {}
        }
    }
}

impl fmt::Display for ReconcileStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row per product_id, ordered by product_id.
pub fn dedup_erp(rows: &[ErpRecord], strategy: ReconcileStrategy) -> Vec<ErpRecord> {
    let mut groups: BTreeMap<i64, ErpRecord> = BTreeMap::new();
    for row in rows {
        match groups.get_mut(&row.product_id) {
            Some(acc) => strategy.reconcile(acc, row),
            None => {
                groups.insert(row.product_id, row.clone());
            }
        }
    }
    groups.into_values().collect()
}

/// One mapping per product_id, keeping the smallest id_web.
pub fn dedup_liaison(rows: &[LiaisonRecord]) -> Vec<LiaisonRecord> {
    let mut groups: BTreeMap<i64, &str> = BTreeMap::new();
    for row in rows {
        groups
            .entry(row.product_id)
            .and_modify(|current| {
                if row.id_web.as_str() < *current {
                    *current = row.id_web.as_str();
                }
            })
            .or_insert(row.id_web.as_str());
    }
    groups
        .into_iter()
        .map(|(product_id, id_web)| LiaisonRecord {
            product_id,
            id_web: id_web.to_string(),
        })
        .collect()
}

/// Sellable rows only, one per sku: the most recent post_date wins.
pub fn dedup_web(rows: &[WebRecord], sellable_post_type: &str) -> Vec<WebRecord> {
    let mut groups: BTreeMap<&str, &WebRecord> = BTreeMap::new();
    for row in rows
        .iter()
        .filter(|r| r.post_type.as_deref() == Some(sellable_post_type))
    {
        match groups.get_mut(row.sku.as_str()) {
            // Option ordering puts None below any date; equal dates keep the earlier row
            Some(current) if row.post_date > current.post_date => *current = row,
            Some(_) => {}
            None => {
                groups.insert(row.sku.as_str(), row);
            }
        }
    }
    groups.into_values().cloned().collect()
}

/// Collapses each cleaned relation to one row per natural key.
#[derive(Debug, Clone)]
pub struct DeduplicationStage {
    strategy: ReconcileStrategy,
    sellable_post_type: String,
}

impl DeduplicationStage {
    pub fn new(strategy: ReconcileStrategy, sellable_post_type: impl Into<String>) -> Self {
        Self {
            strategy,
            sellable_post_type: sellable_post_type.into(),
        }
    }
}

impl Stage for DeduplicationStage {
    fn name(&self) -> StageName {
        StageName::Dedup
    }

    fn inputs(&self) -> &'static [&'static str] {
        &[ERP_CLEAN, WEB_CLEAN, LIAISON_CLEAN]
    }

    fn outputs(&self) -> &'static [&'static str] {
        &[ERP_DEDUP, WEB_DEDUP, LIAISON_DEDUP]
    }

    #[instrument(skip_all, fields(stage = "dedup", strategy = %self.strategy))]
    fn run(&self, store: &mut PipelineStore) -> Result<StageOutcome> {
        let erp_clean: Vec<ErpRecord> = store.read(ERP_CLEAN)?;
        let web_clean: Vec<WebRecord> = store.read(WEB_CLEAN)?;
        let liaison_clean: Vec<LiaisonRecord> = store.read(LIAISON_CLEAN)?;

        let erp = dedup_erp(&erp_clean, self.strategy);
        let web = dedup_web(&web_clean, &self.sellable_post_type);
        let liaison = dedup_liaison(&liaison_clean);

        for (source, before, after) in [
            (SOURCE_ERP, erp_clean.len(), erp.len()),
            (SOURCE_WEB, web_clean.len(), web.len()),
            (SOURCE_LIAISON, liaison_clean.len(), liaison.len()),
        ] {
            info!(source, before, after, dropped = before - after, "Deduplicated source");
        }

        // An empty output would leave nothing to fuse; refuse before replacing anything
        for (relation, len) in [
            (ERP_DEDUP, erp.len()),
            (WEB_DEDUP, web.len()),
            (LIAISON_DEDUP, liaison.len()),
        ] {
            if len == 0 {
                return Err(GateViolation::empty(self.name(), relation).into());
            }
        }

        let mut writer = store.writer(self.name().as_str())?;
        writer.replace(ERP_DEDUP, &erp)?;
        writer.replace(WEB_DEDUP, &web)?;
        writer.replace(LIAISON_DEDUP, &liaison)?;
        let written = writer.commit()?;

        Ok(StageOutcome { written })
    }

    fn gate_checks(&self) -> Vec<GateCheck> {
        vec![
            GateCheck::new(
                ERP_DEDUP,
                vec![
                    Invariant::NonEmpty,
                    Invariant::UniqueKey(vec!["product_id"]),
                    Invariant::NotNull(vec!["product_id", "price", "stock_quantity"]),
                    Invariant::Positive(vec!["price"]),
                    Invariant::AtMostRowsOf(ERP_CLEAN),
                ],
            ),
            GateCheck::new(
                WEB_DEDUP,
                vec![
                    Invariant::NonEmpty,
                    Invariant::UniqueKey(vec!["sku"]),
                    Invariant::NotNull(vec!["sku"]),
                    Invariant::AtMostRowsOf(WEB_CLEAN),
                ],
            ),
            GateCheck::new(
                LIAISON_DEDUP,
                vec![
                    Invariant::NonEmpty,
                    Invariant::UniqueKey(vec!["product_id"]),
                    Invariant::NotNull(vec!["product_id", "id_web"]),
                    Invariant::AtMostRowsOf(LIAISON_CLEAN),
                ],
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::types::parse_post_date;

    fn erp(product_id: i64, price: f64, stock_quantity: i64) -> ErpRecord {
        ErpRecord {
            product_id,
            onsale_web: 1,
            price,
            stock_quantity,
            stock_status: "instock".to_string(),
        }
    }

    fn web(sku: &str, title: &str, post_type: &str, date: Option<&str>) -> WebRecord {
        WebRecord {
            sku: sku.to_string(),
            post_title: Some(title.to_string()),
            post_excerpt: None,
            post_status: Some("publish".to_string()),
            post_type: Some(post_type.to_string()),
            post_date: date.and_then(parse_post_date),
            average_rating: None,
            total_sales: Some(0),
        }
    }

    #[test]
    fn test_take_max_is_column_wise() {
        let rows = vec![erp(101, 10.0, 5), erp(101, 12.0, 3)];
        let out = dedup_erp(&rows, ReconcileStrategy::TakeMax);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].price, 12.0);
        assert_eq!(out[0].stock_quantity, 5);
    }

    #[test]
    fn test_take_latest_and_take_first() {
        let rows = vec![erp(101, 10.0, 5), erp(101, 12.0, 3)];
        let latest = dedup_erp(&rows, ReconcileStrategy::TakeLatest);
        assert_eq!((latest[0].price, latest[0].stock_quantity), (12.0, 3));
        let first = dedup_erp(&rows, ReconcileStrategy::TakeFirst);
        assert_eq!((first[0].price, first[0].stock_quantity), (10.0, 5));
    }

    #[test]
    fn test_erp_output_sorted_by_key() {
        let rows = vec![erp(30, 1.0, 1), erp(10, 1.0, 1), erp(20, 1.0, 1), erp(10, 2.0, 1)];
        let ids: Vec<i64> = dedup_erp(&rows, ReconcileStrategy::TakeMax)
            .iter()
            .map(|r| r.product_id)
            .collect();
        assert_eq!(ids, vec![10, 20, 30]);
    }

    #[test]
    fn test_liaison_keeps_smallest_id_web() {
        let rows = vec![
            LiaisonRecord { product_id: 7, id_web: "B2".to_string() },
            LiaisonRecord { product_id: 7, id_web: "A9".to_string() },
            LiaisonRecord { product_id: 3, id_web: "Z".to_string() },
        ];
        let out = dedup_liaison(&rows);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].product_id, 3);
        assert_eq!(out[1].id_web, "A9");
    }

    #[test]
    fn test_web_keeps_latest_sellable_row() {
        let rows = vec![
            web("ABC", "Old", "product", Some("2024-01-01 00:00:00")),
            web("ABC", "New", "product", Some("2024-06-01 00:00:00")),
            web("ABC", "Image", "attachment", Some("2025-01-01 00:00:00")),
        ];
        let out = dedup_web(&rows, "product");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].post_title.as_deref(), Some("New"));
    }

    #[test]
    fn test_web_null_date_ranks_last_and_ties_keep_first() {
        let rows = vec![
            web("A", "Undated", "product", None),
            web("A", "Dated", "product", Some("2020-01-01")),
            web("B", "First", "product", Some("2021-03-03")),
            web("B", "Second", "product", Some("2021-03-03")),
            web("C", "OnlyUndated", "product", None),
        ];
        let out = dedup_web(&rows, "product");
        let titles: Vec<&str> = out.iter().filter_map(|r| r.post_title.as_deref()).collect();
        assert_eq!(titles, vec!["Dated", "First", "OnlyUndated"]);
    }

    #[test]
    fn test_stage_refuses_empty_output() {
        let mut store = PipelineStore::open_in_memory().unwrap();
        store.replace("clean", ERP_CLEAN, &[erp(1, 5.0, 1)]).unwrap();
        store
            .replace("clean", WEB_CLEAN, &[web("1", "Attachment only", "attachment", None)])
            .unwrap();
        store
            .replace(
                "clean",
                LIAISON_CLEAN,
                &[LiaisonRecord { product_id: 1, id_web: "1".to_string() }],
            )
            .unwrap();

        let stage = DeduplicationStage::new(ReconcileStrategy::TakeMax, "product");
        let err = stage.run(&mut store).unwrap_err();
        match err {
            PipelineError::Gate(v) => assert_eq!(v.relation, WEB_DEDUP),
            other => panic!("unexpected error: {other}"),
        }
        assert!(!store.exists(ERP_DEDUP).unwrap());
    }

    #[test]
    fn test_strategy_parses_from_kebab_case() {
        #[derive(Deserialize)]
        struct Wrapper {
            strategy: ReconcileStrategy,
        }
        let w: Wrapper = toml::from_str("strategy = \"take-latest\"").unwrap();
        assert_eq!(w.strategy, ReconcileStrategy::TakeLatest);
    }
}
