use std::collections::HashMap;
use tracing::{info, instrument, warn};

use crate::constants::{ERP_DEDUP, FUSION, LIAISON_DEDUP, WEB_DEDUP};
use crate::error::{GateViolation, Result};
use crate::pipeline::processing::validation_gate::{GateCheck, Invariant};
use crate::pipeline::processing::{Stage, StageOutcome};
use crate::pipeline::storage::PipelineStore;
use crate::pipeline::StageName;
use crate::types::{ErpRecord, FusedProduct, LiaisonRecord, WebRecord};

/// Join counters, used for the unmatched-row log lines.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FusionStats {
    pub erp_without_mapping: usize,
    pub mapping_without_web: usize,
}

/// Inner join ERP ⋈ liaison on product_id, then ⋈ web on id_web = sku.
///
/// Inputs are expected to be deduplicated, so every product appears at most once.
/// Output is ordered by product_id.
pub fn fuse(
    erp: &[ErpRecord],
    liaison: &[LiaisonRecord],
    web: &[WebRecord],
) -> (Vec<FusedProduct>, FusionStats) {
    let id_web_by_product: HashMap<i64, &str> = liaison
        .iter()
        .map(|l| (l.product_id, l.id_web.as_str()))
        .collect();
    let web_by_sku: HashMap<&str, &WebRecord> = web.iter().map(|w| (w.sku.as_str(), w)).collect();

    let mut stats = FusionStats::default();
    let mut fused = Vec::new();
    for e in erp {
        let Some(id_web) = id_web_by_product.get(&e.product_id) else {
            stats.erp_without_mapping += 1;
            continue;
        };
        let Some(w) = web_by_sku.get(id_web) else {
            stats.mapping_without_web += 1;
            continue;
        };
        fused.push(FusedProduct {
            product_id: e.product_id,
            onsale_web: e.onsale_web,
            price: e.price,
            stock_quantity: e.stock_quantity,
            stock_status: e.stock_status.clone(),
            post_title: w.post_title.clone(),
            post_excerpt: w.post_excerpt.clone(),
            post_status: w.post_status.clone(),
            post_type: w.post_type.clone(),
            average_rating: w.average_rating,
            total_sales: w.total_sales,
        });
    }
    fused.sort_by_key(|p| p.product_id);
    (fused, stats)
}

/// Joins the three deduplicated relations into the `fusion` relation.
#[derive(Debug, Clone, Default)]
pub struct FusionStage {
    expected_rows: Option<usize>,
}

impl FusionStage {
    pub fn new(expected_rows: Option<usize>) -> Self {
        Self { expected_rows }
    }
}

impl Stage for FusionStage {
    fn name(&self) -> StageName {
        StageName::Fuse
    }

    fn inputs(&self) -> &'static [&'static str] {
        &[ERP_DEDUP, LIAISON_DEDUP, WEB_DEDUP]
    }

    fn outputs(&self) -> &'static [&'static str] {
        &[FUSION]
    }

    #[instrument(skip_all, fields(stage = "fuse"))]
    fn run(&self, store: &mut PipelineStore) -> Result<StageOutcome> {
        let erp: Vec<ErpRecord> = store.read(ERP_DEDUP)?;
        let liaison: Vec<LiaisonRecord> = store.read(LIAISON_DEDUP)?;
        let web: Vec<WebRecord> = store.read(WEB_DEDUP)?;

        let (fused, stats) = fuse(&erp, &liaison, &web);
        info!(
            erp = erp.len(),
            liaison = liaison.len(),
            web = web.len(),
            fused = fused.len(),
            "Fused sources"
        );
        if stats.erp_without_mapping > 0 {
            warn!("{} ERP products have no liaison mapping", stats.erp_without_mapping);
        }
        if stats.mapping_without_web > 0 {
            warn!("{} mapped products have no catalog entry", stats.mapping_without_web);
        }

        if fused.is_empty() {
            return Err(GateViolation::empty(self.name(), FUSION).into());
        }

        let mut writer = store.writer(self.name().as_str())?;
        writer.replace(FUSION, &fused)?;
        let written = writer.commit()?;
        Ok(StageOutcome { written })
    }

    fn gate_checks(&self) -> Vec<GateCheck> {
        let mut invariants = vec![
            Invariant::NonEmpty,
            Invariant::UniqueKey(vec!["product_id"]),
            Invariant::NotNull(vec!["product_id", "price", "stock_quantity", "stock_status"]),
            Invariant::AtMostRowsOf(ERP_DEDUP),
            Invariant::KeysReference {
                column: "product_id",
                target: ERP_DEDUP,
                target_column: "product_id",
            },
            Invariant::KeysReference {
                column: "product_id",
                target: LIAISON_DEDUP,
                target_column: "product_id",
            },
            Invariant::KeysReferenceVia {
                column: "product_id",
                via: LIAISON_DEDUP,
                via_key: "product_id",
                via_column: "id_web",
                target: WEB_DEDUP,
                target_column: "sku",
            },
        ];
        invariants.push(match self.expected_rows {
            Some(n) => Invariant::ExactCardinality(n),
            None => Invariant::MinCardinality(1),
        });
        vec![GateCheck::new(FUSION, invariants)]
    }
}
