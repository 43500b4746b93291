// Pipeline ingestion: loads the converter's CSV files into the raw relations

use serde::de::DeserializeOwned;
use std::path::Path;
use tracing::{info, instrument, warn};

use crate::constants::{ERP_CSV, ERP_RAW, LIAISON_CSV, LIAISON_RAW, WEB_CSV, WEB_RAW};
use crate::error::{PipelineError, Result};
use crate::pipeline::storage::{PipelineStore, Relation};
use crate::types::{RawErpRecord, RawLiaisonRecord, RawWebRecord};
use rusqlite::types::Value;

/// Owner tag recorded in the catalog for raw relations.
pub const LOADER_OWNER: &str = "load";

/// Row counts observed while loading one source file.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadReport {
    pub relation: String,
    pub rows: usize,
    /// Rows in which every required column is empty
    pub blank_rows: usize,
}

/// Load erp.csv, web.csv and liaison.csv from `raw_dir` into the store.
///
/// All three files are parsed before anything is written, so a bad file
/// leaves the previous raw relations untouched.
#[instrument(skip(store))]
pub fn load_raw_sources(store: &mut PipelineStore, raw_dir: &Path) -> Result<Vec<LoadReport>> {
    let erp: Vec<RawErpRecord> = read_csv(&raw_dir.join(ERP_CSV), ERP_RAW)?;
    let web: Vec<RawWebRecord> = read_csv(&raw_dir.join(WEB_CSV), WEB_RAW)?;
    let liaison: Vec<RawLiaisonRecord> = read_csv(&raw_dir.join(LIAISON_CSV), LIAISON_RAW)?;

    let reports = vec![
        report(ERP_RAW, &erp),
        report(WEB_RAW, &web),
        report(LIAISON_RAW, &liaison),
    ];

    let mut writer = store.writer(LOADER_OWNER)?;
    writer.replace(ERP_RAW, &erp)?;
    writer.replace(WEB_RAW, &web)?;
    writer.replace(LIAISON_RAW, &liaison)?;
    writer.commit()?;

    for r in &reports {
        info!(
            relation = %r.relation,
            rows = r.rows,
            blank_rows = r.blank_rows,
            "Loaded raw relation"
        );
        if r.blank_rows > 0 {
            warn!("{} contains {} blank rows", r.relation, r.blank_rows);
        }
    }
    Ok(reports)
}

/// Parse one CSV file into typed raw rows.
///
/// Every column of `R` must appear in the header; extra columns are ignored.
pub fn read_csv<R>(path: &Path, relation: &str) -> Result<Vec<R>>
where
    R: Relation + DeserializeOwned,
{
    if !path.exists() {
        return Err(PipelineError::ingestion(
            relation,
            format!("source file '{}' not found", path.display()),
        ));
    }

    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::Headers)
        .from_path(path)
        .map_err(|e| {
            PipelineError::ingestion(relation, format!("cannot open '{}': {}", path.display(), e))
        })?;

    let headers = reader.headers()?.clone();
    for column in R::COLUMNS {
        if !headers.iter().any(|h| h == column.name) {
            return Err(PipelineError::schema(relation, column.name));
        }
    }

    let mut rows = Vec::new();
    for (idx, result) in reader.deserialize::<R>().enumerate() {
        // +2: one for the header line, one for 1-based numbering
        let row = result.map_err(|e| {
            PipelineError::ingestion(relation, format!("line {}: {}", idx + 2, e))
        })?;
        rows.push(row);
    }
    Ok(rows)
}

fn report<R: Relation>(relation: &str, rows: &[R]) -> LoadReport {
    let blank_rows = rows
        .iter()
        .filter(|r| r.to_values().iter().all(|v| matches!(v, Value::Null)))
        .count();
    LoadReport {
        relation: relation.to_string(),
        rows: rows.len(),
        blank_rows,
    }
}
