use std::fmt;

use thiserror::Error;

use crate::pipeline::StageName;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Ingestion failed for relation '{relation}': {message}")]
    Ingestion { relation: String, message: String },

    #[error("Schema violation in relation '{relation}': missing required column '{column}'")]
    SchemaViolation { relation: String, column: String },

    #[error(transparent)]
    Gate(#[from] GateViolation),

    #[error("Arithmetic precondition violated in stage {stage} on '{relation}': {message}")]
    ArithmeticPrecondition {
        stage: StageName,
        relation: String,
        message: String,
    },

    #[error("Relation '{relation}' is owned by '{owner}' and cannot be written by '{writer}'")]
    Ownership {
        relation: String,
        owner: String,
        writer: String,
    },

    #[error("Stage {stage} wrote '{relation}', which is not one of its declared outputs")]
    UndeclaredOutput { stage: StageName, relation: String },

    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// A failed invariant, tagged with the stage whose output was inspected.
#[derive(Error, Debug, Clone, PartialEq)]
#[error(
    "Gate violation after stage {stage}: {invariant} failed on '{relation}' \
     (expected {expected}, observed {observed})"
)]
pub struct GateViolation {
    pub stage: StageName,
    pub relation: String,
    pub invariant: String,
    pub expected: String,
    pub observed: String,
}

impl GateViolation {
    pub fn new(
        stage: StageName,
        relation: &str,
        invariant: impl fmt::Display,
        expected: impl fmt::Display,
        observed: impl fmt::Display,
    ) -> Self {
        Self {
            stage,
            relation: relation.to_string(),
            invariant: invariant.to_string(),
            expected: expected.to_string(),
            observed: observed.to_string(),
        }
    }

    /// Shorthand for a stage that produced no rows.
    pub fn empty(stage: StageName, relation: &str) -> Self {
        Self::new(stage, relation, "non_empty", "at least 1 row", "0 rows")
    }
}

impl PipelineError {
    pub fn ingestion(relation: &str, message: impl Into<String>) -> Self {
        Self::Ingestion {
            relation: relation.to_string(),
            message: message.into(),
        }
    }

    pub fn ownership(relation: &str, owner: &str, writer: &str) -> Self {
        Self::Ownership {
            relation: relation.to_string(),
            owner: owner.to_string(),
            writer: writer.to_string(),
        }
    }

    pub fn schema(relation: &str, column: &str) -> Self {
        Self::SchemaViolation {
            relation: relation.to_string(),
            column: column.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
