use std::fs;
use std::path::Path;

use catalog_fusion::config::PipelineConfig;
use catalog_fusion::constants::*;
use catalog_fusion::error::PipelineError;
use catalog_fusion::pipeline::export::export_all;
use catalog_fusion::pipeline::ingestion::load_raw_sources;
use catalog_fusion::pipeline::storage::PipelineStore;
use catalog_fusion::pipeline::summary::PipelineSummary;
use catalog_fusion::pipeline::{Pipeline, StageName, STATUS_FAILED, STATUS_SUCCEEDED};
use catalog_fusion::types::{
    ExcludedRecord, FusedProduct, OutlierClassification, RevenueLine, RevenueTotal,
};
use tempfile::{tempdir, TempDir};

const ERP: &str = "\
product_id,onsale_web,price,stock_quantity,stock_status
101,1,10.0,5,instock
101,1,12.0,3,instock
102,1,20.0,0,outofstock
103,1,15.5,2,instock
104,1,8.0,4,instock
105,0,,3,instock
,1,5.0,1,instock
106,1,0,1,instock
107,1,30.0,1,instock
";

const WEB: &str = "\
sku,virtual,post_title,post_excerpt,post_status,post_type,post_date,average_rating,total_sales
W101,0,Bordeaux,Red,publish,product,2020-01-01 10:00:00,4.5,10
W101,0,Bordeaux (image),,inherit,attachment,2021-01-01 10:00:00,,0
W102,0,Chablis,White,publish,product,2020-02-01 10:00:00,,3
W103,0,Sancerre Old,White,publish,product,2019-01-01 10:00:00,,1
W103,0,Sancerre,White,publish,product,2022-01-01 10:00:00,,2
W104,0,Muscadet,White,publish,product,,3.0,0
,0,Nameless,,publish,product,,,
";

const LIAISON: &str = "\
product_id,id_web
101,W101
102,W102
103,W103
104,W104B
104,W104
108,
";

struct Fixture {
    dir: TempDir,
    store: PipelineStore,
}

fn fixture() -> Fixture {
    let dir = tempdir().unwrap();
    let raw = dir.path().join("raw");
    fs::create_dir_all(&raw).unwrap();
    fs::write(raw.join(ERP_CSV), ERP).unwrap();
    fs::write(raw.join(WEB_CSV), WEB).unwrap();
    fs::write(raw.join(LIAISON_CSV), LIAISON).unwrap();

    let mut store = PipelineStore::open(dir.path().join("store").join("pipeline.sqlite")).unwrap();
    load_raw_sources(&mut store, &raw).unwrap();
    Fixture { dir, store }
}

fn fingerprints(store: &PipelineStore, relations: &[&str]) -> Vec<String> {
    relations
        .iter()
        .map(|r| store.relation_info(r).unwrap().unwrap().fingerprint)
        .collect()
}

#[test]
fn test_full_run_produces_consistent_relations() {
    let mut fx = fixture();
    let pipeline = Pipeline::new(PipelineConfig::default());
    let summaries = pipeline.run(&mut fx.store, None, None).unwrap();
    assert_eq!(summaries.len(), 5);

    let exclusions: Vec<ExcludedRecord> = fx.store.read(CLEANING_EXCLUSIONS).unwrap();
    let reasons: Vec<&str> = exclusions.iter().map(|e| e.reason.as_str()).collect();
    assert_eq!(
        reasons,
        vec![
            "missing_price",
            "missing_product_id",
            "non_positive_price",
            "missing_sku",
            "missing_id_web"
        ]
    );

    let fused: Vec<FusedProduct> = fx.store.read(FUSION).unwrap();
    let ids: Vec<i64> = fused.iter().map(|p| p.product_id).collect();
    assert_eq!(ids, vec![101, 102, 103, 104]);
    // Duplicate ERP rows reconcile column-wise
    assert_eq!((fused[0].price, fused[0].stock_quantity), (12.0, 5));
    // Latest dated catalog row wins, attachments never do
    assert_eq!(fused[0].post_title.as_deref(), Some("Bordeaux"));
    assert_eq!(fused[2].post_title.as_deref(), Some("Sancerre"));
    // Smallest id_web mapping is kept
    assert_eq!(fused[3].post_title.as_deref(), Some("Muscadet"));

    let lines: Vec<RevenueLine> = fx.store.read(REVENUE_BY_PRODUCT).unwrap();
    let revenue: Vec<(i64, f64)> = lines.iter().map(|l| (l.product_id, l.revenue)).collect();
    assert_eq!(revenue, vec![(101, 60.0), (103, 31.0), (104, 32.0)]);
    let total: Vec<RevenueTotal> = fx.store.read(REVENUE_TOTAL).unwrap();
    assert_eq!(total[0].total, 123.0);
    assert_eq!(total[0].product_count, 3);

    let outliers: Vec<OutlierClassification> = fx.store.read(OUTLIER_PRODUCTS).unwrap();
    let ordinary: Vec<OutlierClassification> = fx.store.read(ORDINARY_PRODUCTS).unwrap();
    assert!(outliers.is_empty());
    assert_eq!(ordinary.len(), fused.len());

    for run in fx.store.stage_runs(10).unwrap() {
        assert_eq!(run.status, STATUS_SUCCEEDED);
    }
}

#[test]
fn test_rerun_yields_identical_fingerprints() {
    let mut fx = fixture();
    let pipeline = Pipeline::new(PipelineConfig::default());
    let tracked = [
        ERP_CLEAN,
        WEB_CLEAN,
        LIAISON_CLEAN,
        ERP_DEDUP,
        WEB_DEDUP,
        LIAISON_DEDUP,
        FUSION,
    ];

    pipeline.run(&mut fx.store, None, Some(StageName::Fuse)).unwrap();
    let first = fingerprints(&fx.store, &tracked);
    pipeline.run(&mut fx.store, None, Some(StageName::Fuse)).unwrap();
    let second = fingerprints(&fx.store, &tracked);
    assert_eq!(first, second);
}

#[test]
fn test_restart_from_stage_reuses_stored_relations() {
    let mut fx = fixture();
    let pipeline = Pipeline::new(PipelineConfig::default());
    pipeline.run(&mut fx.store, None, Some(StageName::Fuse)).unwrap();
    let fusion_before = fx.store.relation_info(FUSION).unwrap().unwrap();

    let summaries = pipeline
        .run(&mut fx.store, Some(StageName::Revenue), None)
        .unwrap();
    let stages: Vec<StageName> = summaries.iter().map(|s| s.stage).collect();
    assert_eq!(stages, vec![StageName::Revenue, StageName::Outliers]);

    // Upstream relations were not touched
    let fusion_after = fx.store.relation_info(FUSION).unwrap().unwrap();
    assert_eq!(fusion_before, fusion_after);
}

#[test]
fn test_fixture_expectation_mismatch_halts_pipeline() {
    let mut fx = fixture();
    let mut config = PipelineConfig::default();
    config.expected.fused_rows = Some(714);
    let pipeline = Pipeline::new(config);

    let err = pipeline.run(&mut fx.store, None, None).unwrap_err();
    match err {
        PipelineError::Gate(v) => {
            assert_eq!(v.stage, StageName::Fuse);
            assert_eq!(v.relation, FUSION);
            assert_eq!(v.invariant, "exact_cardinality(714)");
            assert_eq!(v.observed, "4 rows");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!fx.store.exists(REVENUE_BY_PRODUCT).unwrap());
    assert_eq!(
        fx.store.last_stage_run("fuse").unwrap().unwrap().status,
        STATUS_FAILED
    );

    // Downstream stages refuse to build on the failed stage
    let err = pipeline
        .run_stage(&mut fx.store, StageName::Revenue)
        .unwrap_err();
    assert!(matches!(err, PipelineError::Ingestion { .. }));
}

#[test]
fn test_revenue_total_expectation() {
    let mut fx = fixture();
    let mut config = PipelineConfig::default();
    config.expected.revenue_total = Some(123.0);
    config.expected.revenue_rows = Some(3);
    Pipeline::new(config)
        .run(&mut fx.store, None, Some(StageName::Revenue))
        .unwrap();

    let mut config = PipelineConfig::default();
    config.expected.revenue_total = Some(387837.60);
    let err = Pipeline::new(config)
        .run_stage(&mut fx.store, StageName::Revenue)
        .unwrap_err();
    assert!(matches!(err, PipelineError::Gate(ref v) if v.relation == REVENUE_TOTAL));
}

#[test]
fn test_snapshot_and_export() {
    let mut fx = fixture();
    Pipeline::new(PipelineConfig::default())
        .run(&mut fx.store, None, None)
        .unwrap();

    let snapshot = fx.dir.path().join("snapshots").join("copy.sqlite");
    fx.store.snapshot_to(&snapshot).unwrap();
    assert!(fx.store.snapshot_to(&snapshot).is_err());

    let copy = PipelineStore::open(&snapshot).unwrap();
    assert_eq!(copy.count(FUSION).unwrap(), 4);
    assert_eq!(
        copy.relation_info(FUSION).unwrap().unwrap().fingerprint,
        fx.store.fingerprint(FUSION).unwrap()
    );

    let out = fx.dir.path().join("outputs");
    let exported = export_all(&fx.store, &out).unwrap();
    assert_eq!(exported.len(), get_pipeline_relations().len());
    let revenue_csv = fs::read_to_string(out.join("revenue_by_product.csv")).unwrap();
    assert!(revenue_csv.starts_with("product_id,post_title,price,stock_quantity,revenue"));

    let summary = PipelineSummary::collect(&fx.store, 5).unwrap();
    assert_eq!(summary.revenue_total.map(|t| t.total), Some(123.0));
}

#[test]
fn test_missing_source_column_is_rejected_on_load() {
    let dir = tempdir().unwrap();
    let raw = dir.path();
    fs::write(raw.join(ERP_CSV), "product_id,price\n1,2.0\n").unwrap();
    fs::write(raw.join(WEB_CSV), WEB).unwrap();
    fs::write(raw.join(LIAISON_CSV), LIAISON).unwrap();

    let mut store = PipelineStore::open_in_memory().unwrap();
    let err = load_raw_sources(&mut store, Path::new(raw)).unwrap_err();
    assert!(matches!(
        err,
        PipelineError::SchemaViolation { ref relation, ref column }
            if relation == ERP_RAW && column == "onsale_web"
    ));
    assert!(!store.exists(ERP_RAW).unwrap());
}
