use rusqlite::types::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, instrument};

use crate::error::Result;
use crate::pipeline::storage::PipelineStore;

/// Write one relation to `out` as CSV with a header row. Returns the row count.
#[instrument(skip(store))]
pub fn export_relation(store: &PipelineStore, relation: &str, out: &Path) -> Result<usize> {
    let table = store.read_table(relation)?;
    if let Some(parent) = out.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut writer = csv::Writer::from_path(out)?;
    writer.write_record(&table.columns)?;
    for row in &table.rows {
        writer.write_record(row.iter().map(render_value))?;
    }
    writer.flush()?;

    info!(relation, rows = table.rows.len(), path = %out.display(), "Exported relation");
    Ok(table.rows.len())
}

/// Export every cataloged relation to `<dir>/<relation>.csv`.
pub fn export_all(store: &PipelineStore, dir: &Path) -> Result<Vec<(String, PathBuf, usize)>> {
    let mut exported = Vec::new();
    for info in store.relations()? {
        let path = dir.join(format!("{}.csv", info.name));
        let rows = export_relation(store, &info.name, &path)?;
        exported.push((info.name, path, rows));
    }
    Ok(exported)
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Integer(v) => v.to_string(),
        Value::Real(v) => v.to_string(),
        Value::Text(s) => s.clone(),
        Value::Blob(b) => hex::encode(b),
    }
}
