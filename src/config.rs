use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, Result};
use crate::pipeline::processing::dedup::ReconcileStrategy;

/// Default config file looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "catalog_fusion.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// SQLite file holding every named relation
    pub store_path: PathBuf,
    /// Directory containing erp.csv, web.csv and liaison.csv
    pub raw_dir: PathBuf,
    /// Directory receiving CSV exports
    pub export_dir: PathBuf,
    /// Directory receiving rolling JSON logs
    pub log_dir: PathBuf,
    pub rules: RuleConfig,
    pub expected: ExpectedCounts,
}

/// Business rules applied by the stages.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuleConfig {
    /// `stock_status` value that marks a product as sellable
    pub in_stock_status: String,
    /// `post_type` value that marks a catalog entry as a product
    pub sellable_post_type: String,
    /// z-score above which a product is classified as an outlier
    pub outlier_z_threshold: f64,
    pub erp_reconciliation: ReconcileStrategy,
}

/// Fixture-bound expectations. Every field is optional; when unset the gate
/// falls back to shape invariants only.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExpectedCounts {
    pub fused_rows: Option<usize>,
    pub revenue_rows: Option<usize>,
    pub revenue_total: Option<f64>,
    pub outlier_rows: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("data/pipeline.sqlite"),
            raw_dir: PathBuf::from("data/raw"),
            export_dir: PathBuf::from("data/outputs"),
            log_dir: PathBuf::from("logs"),
            rules: RuleConfig::default(),
            expected: ExpectedCounts::default(),
        }
    }
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            in_stock_status: "instock".to_string(),
            sellable_post_type: "product".to_string(),
            outlier_z_threshold: 2.0,
            erp_reconciliation: ReconcileStrategy::TakeMax,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from `path`, or from `catalog_fusion.toml` if it exists,
    /// then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: PipelineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        let overrides: [(&str, &mut PathBuf); 4] = [
            ("CATALOG_FUSION_STORE", &mut self.store_path),
            ("CATALOG_FUSION_RAW_DIR", &mut self.raw_dir),
            ("CATALOG_FUSION_EXPORT_DIR", &mut self.export_dir),
            ("CATALOG_FUSION_LOG_DIR", &mut self.log_dir),
        ];
        for (key, slot) in overrides {
            if let Ok(value) = std::env::var(key) {
                if !value.trim().is_empty() {
                    *slot = PathBuf::from(value.trim());
                }
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.rules.in_stock_status.trim().is_empty() {
            return Err(PipelineError::Config(
                "rules.in_stock_status must not be empty".to_string(),
            ));
        }
        if self.rules.sellable_post_type.trim().is_empty() {
            return Err(PipelineError::Config(
                "rules.sellable_post_type must not be empty".to_string(),
            ));
        }
        if !self.rules.outlier_z_threshold.is_finite() {
            return Err(PipelineError::Config(
                "rules.outlier_z_threshold must be a finite number".to_string(),
            ));
        }
        if let Some(total) = self.expected.revenue_total {
            if !total.is_finite() || total < 0.0 {
                return Err(PipelineError::Config(format!(
                    "expected.revenue_total must be a non-negative number, got {}",
                    total
                )));
            }
        }
        Ok(())
    }
}
