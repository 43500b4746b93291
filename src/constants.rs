/// Relation names shared by the stages, the gate and the CLI.
/// Each relation is written by exactly one stage (or by the loader, for raw relations).

// Raw relations (written by the loader)
pub const ERP_RAW: &str = "erp_raw";
pub const WEB_RAW: &str = "web_raw";
pub const LIAISON_RAW: &str = "liaison_raw";

// Cleaning
pub const ERP_CLEAN: &str = "erp_clean";
pub const WEB_CLEAN: &str = "web_clean";
pub const LIAISON_CLEAN: &str = "liaison_clean";
pub const CLEANING_EXCLUSIONS: &str = "cleaning_exclusions";

// Deduplication
pub const ERP_DEDUP: &str = "erp_dedup";
pub const WEB_DEDUP: &str = "web_dedup";
pub const LIAISON_DEDUP: &str = "liaison_dedup";

// Fusion
pub const FUSION: &str = "fusion";

// Analytics
pub const REVENUE_BY_PRODUCT: &str = "revenue_by_product";
pub const REVENUE_TOTAL: &str = "revenue_total";
pub const OUTLIER_PRODUCTS: &str = "outlier_products";
pub const ORDINARY_PRODUCTS: &str = "ordinary_products";

// Source file names expected in the raw directory
pub const ERP_CSV: &str = "erp.csv";
pub const WEB_CSV: &str = "web.csv";
pub const LIAISON_CSV: &str = "liaison.csv";

// Source tags used in the exclusion audit
pub const SOURCE_ERP: &str = "erp";
pub const SOURCE_WEB: &str = "web";
pub const SOURCE_LIAISON: &str = "liaison";

/// Timestamp layout for `post_date` as stored in the pipeline store.
pub const POST_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Get every relation the pipeline produces, in stage order
pub fn get_pipeline_relations() -> Vec<&'static str> {
    vec![
        ERP_RAW,
        WEB_RAW,
        LIAISON_RAW,
        ERP_CLEAN,
        WEB_CLEAN,
        LIAISON_CLEAN,
        CLEANING_EXCLUSIONS,
        ERP_DEDUP,
        WEB_DEDUP,
        LIAISON_DEDUP,
        FUSION,
        REVENUE_BY_PRODUCT,
        REVENUE_TOTAL,
        OUTLIER_PRODUCTS,
        ORDINARY_PRODUCTS,
    ]
}
