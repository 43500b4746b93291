use metrics::counter;
use rusqlite::OptionalExtension;
use std::fmt;
use tracing::{debug, error, info};

use crate::error::{GateViolation, PipelineError, Result};
use crate::pipeline::processing::round2;
use crate::pipeline::storage::{quote_ident, PipelineStore};
use crate::pipeline::StageName;

/// Largest finite double; anything beyond it (in either direction) is infinite.
const F64_MAX_LITERAL: &str = "1.7976931348623157e308";

/// Tolerance for comparing values that were rounded to cents.
const CENT_TOLERANCE: f64 = 0.005 + 1e-9;

/// One invariant evaluated against a stored relation.
#[derive(Debug, Clone, PartialEq)]
pub enum Invariant {
    /// At least one row
    NonEmpty,
    /// Exactly `n` rows (fixture-bound checks)
    ExactCardinality(usize),
    /// At least `n` rows
    MinCardinality(usize),
    /// No more rows than `relation` (filters and reductions only remove rows)
    AtMostRowsOf(&'static str),
    /// No two rows share the same values in these columns
    UniqueKey(Vec<&'static str>),
    /// No NULL in any of these columns
    NotNull(Vec<&'static str>),
    /// No value below zero in any of these columns
    NonNegative(Vec<&'static str>),
    /// No value at or below zero in any of these columns
    Positive(Vec<&'static str>),
    /// No NULL, NaN or ±∞ in any of these columns
    Finite(Vec<&'static str>),
    /// Every value of `column` exists in `target.target_column`
    KeysReference {
        column: &'static str,
        target: &'static str,
        target_column: &'static str,
    },
    /// Every row finds its `column` in `via.via_key`, and that row's
    /// `via_column` exists in `target.target_column`
    KeysReferenceVia {
        column: &'static str,
        via: &'static str,
        via_key: &'static str,
        via_column: &'static str,
        target: &'static str,
        target_column: &'static str,
    },
    /// Singleton `column` equals round(Σ `lines.lines_column`, 2)
    SumMatches {
        column: &'static str,
        lines: &'static str,
        lines_column: &'static str,
    },
    /// Singleton `column` equals `expected` to the cent
    ValueEquals { column: &'static str, expected: f64 },
    /// This relation and `sibling` share no `key` and together have as many
    /// rows as `whole`
    PartitionOf {
        key: &'static str,
        sibling: &'static str,
        whole: &'static str,
    },
}

impl fmt::Display for Invariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Invariant::NonEmpty => write!(f, "non_empty"),
            Invariant::ExactCardinality(n) => write!(f, "exact_cardinality({})", n),
            Invariant::MinCardinality(n) => write!(f, "min_cardinality({})", n),
            Invariant::AtMostRowsOf(other) => write!(f, "at_most_rows_of({})", other),
            Invariant::UniqueKey(cols) => write!(f, "unique_key({})", cols.join(", ")),
            Invariant::NotNull(cols) => write!(f, "not_null({})", cols.join(", ")),
            Invariant::NonNegative(cols) => write!(f, "non_negative({})", cols.join(", ")),
            Invariant::Positive(cols) => write!(f, "positive({})", cols.join(", ")),
            Invariant::Finite(cols) => write!(f, "finite({})", cols.join(", ")),
            Invariant::KeysReference { column, target, target_column } => {
                write!(f, "keys_reference({} -> {}.{})", column, target, target_column)
            }
            Invariant::KeysReferenceVia {
                column,
                via,
                via_key,
                via_column,
                target,
                target_column,
            } => write!(
                f,
                "keys_reference_via({} -> {}.{}, {}.{} -> {}.{})",
                column, via, via_key, via, via_column, target, target_column
            ),
            Invariant::SumMatches { column, lines, lines_column } => {
                write!(f, "sum_matches({} = sum({}.{}))", column, lines, lines_column)
            }
            Invariant::ValueEquals { column, expected } => {
                write!(f, "value_equals({} = {:.2})", column, expected)
            }
            Invariant::PartitionOf { key, sibling, whole } => {
                write!(f, "partition_of({} with {} over {})", key, sibling, whole)
            }
        }
    }
}

/// The invariants to apply to one relation.
#[derive(Debug, Clone, PartialEq)]
pub struct GateCheck {
    pub relation: &'static str,
    pub invariants: Vec<Invariant>,
}

impl GateCheck {
    pub fn new(relation: &'static str, invariants: Vec<Invariant>) -> Self {
        Self { relation, invariants }
    }
}

/// Outcome of a passed gate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GateReport {
    pub relations_checked: usize,
    pub invariants_checked: usize,
}

/// Fatal-on-violation check run after each stage. Implementations never
/// mutate the store.
pub trait ValidationGate {
    fn check(
        &self,
        store: &PipelineStore,
        stage: StageName,
        checks: &[GateCheck],
    ) -> Result<GateReport>;
}

/// Gate that evaluates every invariant with SQL against the store.
#[derive(Debug, Default)]
pub struct StoreValidationGate;

impl StoreValidationGate {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate one invariant; `Ok(None)` means it holds.
    fn evaluate(
        &self,
        store: &PipelineStore,
        stage: StageName,
        relation: &str,
        invariant: &Invariant,
    ) -> Result<Option<GateViolation>> {
        let conn = store.connection();
        let table = quote_ident(relation)?;
        let violation = |expected: String, observed: String| {
            Some(GateViolation::new(stage, relation, invariant, expected, observed))
        };

        let outcome = match invariant {
            Invariant::NonEmpty => {
                let n = store.count(relation)?;
                if n == 0 {
                    violation("at least 1 row".to_string(), "0 rows".to_string())
                } else {
                    None
                }
            }
            Invariant::ExactCardinality(expected) => {
                let n = store.count(relation)?;
                if n != *expected {
                    violation(format!("{} rows", expected), format!("{} rows", n))
                } else {
                    None
                }
            }
            Invariant::MinCardinality(min) => {
                let n = store.count(relation)?;
                if n < *min {
                    violation(format!("at least {} rows", min), format!("{} rows", n))
                } else {
                    None
                }
            }
            Invariant::AtMostRowsOf(other) => {
                let n = store.count(relation)?;
                let bound = store.count(other)?;
                if n > bound {
                    violation(
                        format!("at most {} rows ({})", bound, other),
                        format!("{} rows", n),
                    )
                } else {
                    None
                }
            }
            Invariant::UniqueKey(cols) => {
                let key = quote_all(cols)?;
                let sql = format!(
                    "SELECT COUNT(*) FROM (SELECT 1 FROM {} GROUP BY {} HAVING COUNT(*) > 1)",
                    table, key
                );
                let dupes: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
                if dupes > 0 {
                    violation(
                        "0 duplicated keys".to_string(),
                        format!("{} duplicated keys", dupes),
                    )
                } else {
                    None
                }
            }
            Invariant::NotNull(cols) => self
                .first_offending_column(store, relation, cols, |col| format!("{} IS NULL", col))?
                .and_then(|(col, n)| {
                    violation(format!("0 nulls in {}", col), format!("{} nulls in {}", n, col))
                }),
            Invariant::NonNegative(cols) => self
                .first_offending_column(store, relation, cols, |col| format!("{} < 0", col))?
                .and_then(|(col, n)| {
                    violation(
                        format!("0 negative values in {}", col),
                        format!("{} negative values in {}", n, col),
                    )
                }),
            Invariant::Positive(cols) => self
                .first_offending_column(store, relation, cols, |col| format!("{} <= 0", col))?
                .and_then(|(col, n)| {
                    violation(
                        format!("0 non-positive values in {}", col),
                        format!("{} non-positive values in {}", n, col),
                    )
                }),
            Invariant::Finite(cols) => {
                self.first_offending_column(store, relation, cols, |col| {
                    format!(
                        "{col} IS NULL OR {col} > {max} OR {col} < -{max}",
                        col = col,
                        max = F64_MAX_LITERAL
                    )
                })?
                .and_then(|(col, n)| {
                    violation(
                        format!("0 non-finite values in {}", col),
                        format!("{} non-finite values in {}", n, col),
                    )
                })
            }
            Invariant::KeysReference { column, target, target_column } => {
                store.require(target)?;
                let sql = format!(
                    "SELECT COUNT(*) FROM {t} s \
                     WHERE NOT EXISTS (SELECT 1 FROM {tt} x WHERE x.{tc} = s.{c})",
                    t = table,
                    tt = quote_ident(target)?,
                    tc = quote_ident(target_column)?,
                    c = quote_ident(column)?,
                );
                let dangling: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
                if dangling > 0 {
                    violation(
                        format!("every {} present in {}.{}", column, target, target_column),
                        format!("{} dangling keys", dangling),
                    )
                } else {
                    None
                }
            }
            Invariant::KeysReferenceVia {
                column,
                via,
                via_key,
                via_column,
                target,
                target_column,
            } => {
                store.require(via)?;
                store.require(target)?;
                // A row with no link, or whose link points nowhere, dangles
                let sql = format!(
                    "SELECT COUNT(*) FROM {t} s LEFT JOIN {v} v ON v.{vk} = s.{c} \
                     WHERE v.{vk} IS NULL \
                     OR NOT EXISTS (SELECT 1 FROM {tt} x WHERE x.{tc} = v.{vc})",
                    t = table,
                    v = quote_ident(via)?,
                    vk = quote_ident(via_key)?,
                    vc = quote_ident(via_column)?,
                    tt = quote_ident(target)?,
                    tc = quote_ident(target_column)?,
                    c = quote_ident(column)?,
                );
                let dangling: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
                if dangling > 0 {
                    violation(
                        format!(
                            "every {} linked through {}.{} to {}.{}",
                            column, via, via_column, target, target_column
                        ),
                        format!("{} dangling links", dangling),
                    )
                } else {
                    None
                }
            }
            Invariant::SumMatches { column, lines, lines_column } => {
                store.require(lines)?;
                let total = match self.singleton_value(store, relation, column)? {
                    Ok(total) => total,
                    Err(observed) => {
                        return Ok(violation("exactly 1 row".to_string(), observed));
                    }
                };
                let sql = format!(
                    "SELECT TOTAL({}) FROM {}",
                    quote_ident(lines_column)?,
                    quote_ident(lines)?
                );
                let sum: f64 = conn.query_row(&sql, [], |row| row.get(0))?;
                let expected = round2(sum);
                if (expected - total).abs() > CENT_TOLERANCE {
                    violation(format!("{:.2}", expected), format!("{:.2}", total))
                } else {
                    None
                }
            }
            Invariant::ValueEquals { column, expected } => {
                match self.singleton_value(store, relation, column)? {
                    Ok(value) if (value - expected).abs() <= CENT_TOLERANCE => None,
                    Ok(value) => {
                        violation(format!("{:.2}", expected), format!("{:.2}", value))
                    }
                    Err(observed) => violation("exactly 1 row".to_string(), observed),
                }
            }
            Invariant::PartitionOf { key, sibling, whole } => {
                let own = store.count(relation)?;
                let other = store.count(sibling)?;
                let total = store.count(whole)?;
                let sql = format!(
                    "SELECT COUNT(*) FROM {a} a JOIN {b} b ON a.{k} = b.{k}",
                    a = table,
                    b = quote_ident(sibling)?,
                    k = quote_ident(key)?,
                );
                let overlap: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
                if overlap > 0 {
                    violation(
                        format!("no {} shared with {}", key, sibling),
                        format!("{} shared keys", overlap),
                    )
                } else if own + other != total {
                    violation(
                        format!("{} rows across {} and {}", total, relation, sibling),
                        format!("{} rows", own + other),
                    )
                } else {
                    None
                }
            }
        };
        Ok(outcome)
    }

    /// First column (in order) with rows matching `predicate`, with the count.
    fn first_offending_column(
        &self,
        store: &PipelineStore,
        relation: &str,
        cols: &[&'static str],
        predicate: impl Fn(&str) -> String,
    ) -> Result<Option<(&'static str, i64)>> {
        let table = quote_ident(relation)?;
        for col in cols {
            let quoted = quote_ident(col)?;
            let sql = format!("SELECT COUNT(*) FROM {} WHERE {}", table, predicate(&quoted));
            let n: i64 = store.connection().query_row(&sql, [], |row| row.get(0))?;
            if n > 0 {
                return Ok(Some((*col, n)));
            }
        }
        Ok(None)
    }

    /// Value of `column` in a single-row relation, or a description of why
    /// the relation is not a singleton.
    fn singleton_value(
        &self,
        store: &PipelineStore,
        relation: &str,
        column: &str,
    ) -> Result<std::result::Result<f64, String>> {
        let n = store.count(relation)?;
        if n != 1 {
            return Ok(Err(format!("{} rows", n)));
        }
        let sql = format!("SELECT {} FROM {}", quote_ident(column)?, quote_ident(relation)?);
        let value: Option<f64> = store
            .connection()
            .query_row(&sql, [], |row| row.get::<_, Option<f64>>(0))
            .optional()?
            .flatten();
        Ok(value.ok_or_else(|| "NULL".to_string()))
    }
}

impl ValidationGate for StoreValidationGate {
    fn check(
        &self,
        store: &PipelineStore,
        stage: StageName,
        checks: &[GateCheck],
    ) -> Result<GateReport> {
        let mut report = GateReport::default();
        for check in checks {
            for invariant in &check.invariants {
                counter!("pipeline_gate_checks_total", "stage" => stage.to_string()).increment(1);
                if let Some(v) = self.evaluate(store, stage, check.relation, invariant)? {
                    counter!("pipeline_gate_violations_total", "stage" => stage.to_string())
                        .increment(1);
                    error!(
                        stage = %stage,
                        relation = %v.relation,
                        invariant = %v.invariant,
                        expected = %v.expected,
                        observed = %v.observed,
                        "Validation gate violated"
                    );
                    return Err(PipelineError::Gate(v));
                }
                debug!(
                    stage = %stage,
                    relation = check.relation,
                    invariant = %invariant,
                    "Invariant holds"
                );
                report.invariants_checked += 1;
            }
            report.relations_checked += 1;
        }
        info!(
            stage = %stage,
            relations = report.relations_checked,
            invariants = report.invariants_checked,
            "Validation gate passed"
        );
        Ok(report)
    }
}

fn quote_all(cols: &[&'static str]) -> Result<String> {
    Ok(cols
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Result<Vec<_>>>()?
        .join(", "))
}
