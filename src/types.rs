use chrono::NaiveDateTime;
use rusqlite::types::{Type, Value};
use rusqlite::Row;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::constants::POST_DATE_FORMAT;
use crate::pipeline::storage::{Column, Relation};

// ---------------------------------------------------------------------------
// Raw relations: every field nullable, exactly as delivered by ingestion
// ---------------------------------------------------------------------------

/// One inventory entry from the ERP extract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawErpRecord {
    pub product_id: Option<i64>,
    pub onsale_web: Option<i64>,
    pub price: Option<f64>,
    pub stock_quantity: Option<i64>,
    pub stock_status: Option<String>,
}

/// One catalog entry from the web extract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawWebRecord {
    pub sku: Option<String>,
    pub post_title: Option<String>,
    pub post_excerpt: Option<String>,
    pub post_status: Option<String>,
    pub post_type: Option<String>,
    #[serde(with = "post_date_serde", default)]
    pub post_date: Option<NaiveDateTime>,
    pub average_rating: Option<f64>,
    pub total_sales: Option<i64>,
}

/// One inventory ↔ catalog mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawLiaisonRecord {
    pub product_id: Option<i64>,
    pub id_web: Option<String>,
}

// ---------------------------------------------------------------------------
// Cleaned and deduplicated relations
// ---------------------------------------------------------------------------

/// ERP row whose predicate columns are all present. Used for both the
/// cleaned and the deduplicated relation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErpRecord {
    pub product_id: i64,
    pub onsale_web: i64,
    pub price: f64,
    pub stock_quantity: i64,
    pub stock_status: String,
}

/// Web row with a known sku.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebRecord {
    pub sku: String,
    pub post_title: Option<String>,
    pub post_excerpt: Option<String>,
    pub post_status: Option<String>,
    pub post_type: Option<String>,
    #[serde(serialize_with = "post_date_serde::serialize")]
    pub post_date: Option<NaiveDateTime>,
    pub average_rating: Option<f64>,
    pub total_sales: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiaisonRecord {
    pub product_id: i64,
    pub id_web: String,
}

/// A raw row rejected by a cleaning predicate, kept for audit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExcludedRecord {
    pub source: String,
    pub reason: String,
    /// JSON rendering of the raw row
    pub record: String,
}

// ---------------------------------------------------------------------------
// Fusion and analytics
// ---------------------------------------------------------------------------

/// One product present in all three sources.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FusedProduct {
    pub product_id: i64,
    pub onsale_web: i64,
    pub price: f64,
    pub stock_quantity: i64,
    pub stock_status: String,
    pub post_title: Option<String>,
    pub post_excerpt: Option<String>,
    pub post_status: Option<String>,
    pub post_type: Option<String>,
    pub average_rating: Option<f64>,
    pub total_sales: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RevenueLine {
    pub product_id: i64,
    pub post_title: Option<String>,
    pub price: f64,
    pub stock_quantity: i64,
    pub revenue: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RevenueTotal {
    pub total: f64,
    pub product_count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Segment {
    Outlier,
    Ordinary,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutlierClassification {
    pub product_id: i64,
    pub post_title: Option<String>,
    pub price: f64,
    pub z_score: f64,
    pub segment: Segment,
}

impl Segment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Segment::Outlier => "outlier",
            Segment::Ordinary => "ordinary",
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Segment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "outlier" => Ok(Segment::Outlier),
            "ordinary" => Ok(Segment::Ordinary),
            other => Err(format!("unknown segment '{}'", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// post_date handling
// ---------------------------------------------------------------------------

/// Parse a catalog timestamp. Accepts `YYYY-MM-DD HH:MM:SS`, the ISO `T`
/// separator, and bare dates (midnight).
pub fn parse_post_date(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    NaiveDateTime::parse_from_str(s, POST_DATE_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S"))
        .ok()
        .or_else(|| {
            chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

pub fn format_post_date(dt: &NaiveDateTime) -> String {
    dt.format(POST_DATE_FORMAT).to_string()
}

mod post_date_serde {
    use super::*;

    pub fn serialize<S: Serializer>(
        value: &Option<NaiveDateTime>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(dt) => serializer.serialize_some(&format_post_date(dt)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<NaiveDateTime>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw {
            None => Ok(None),
            Some(s) if s.trim().is_empty() => Ok(None),
            Some(s) => parse_post_date(&s)
                .map(Some)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid post_date '{}'", s))),
        }
    }
}

fn get_post_date(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<NaiveDateTime>> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        None => Ok(None),
        Some(s) => parse_post_date(&s).map(Some).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                Type::Text,
                format!("invalid post_date '{}'", s).into(),
            )
        }),
    }
}

fn post_date_value(value: &Option<NaiveDateTime>) -> Value {
    value.as_ref().map(format_post_date).into()
}

// ---------------------------------------------------------------------------
// Relation mappings
// ---------------------------------------------------------------------------

const ERP_COLUMNS: &[Column] = &[
    Column::integer("product_id"),
    Column::integer("onsale_web"),
    Column::real("price"),
    Column::integer("stock_quantity"),
    Column::text("stock_status"),
];

const WEB_COLUMNS: &[Column] = &[
    Column::text("sku"),
    Column::text("post_title"),
    Column::text("post_excerpt"),
    Column::text("post_status"),
    Column::text("post_type"),
    Column::text("post_date"),
    Column::real("average_rating"),
    Column::integer("total_sales"),
];

const LIAISON_COLUMNS: &[Column] = &[Column::integer("product_id"), Column::text("id_web")];

impl Relation for RawErpRecord {
    const COLUMNS: &'static [Column] = ERP_COLUMNS;

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            product_id: row.get(0)?,
            onsale_web: row.get(1)?,
            price: row.get(2)?,
            stock_quantity: row.get(3)?,
            stock_status: row.get(4)?,
        })
    }

    fn to_values(&self) -> Vec<Value> {
        vec![
            self.product_id.into(),
            self.onsale_web.into(),
            self.price.into(),
            self.stock_quantity.into(),
            self.stock_status.clone().into(),
        ]
    }
}

impl Relation for ErpRecord {
    const COLUMNS: &'static [Column] = ERP_COLUMNS;

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            product_id: row.get(0)?,
            onsale_web: row.get(1)?,
            price: row.get(2)?,
            stock_quantity: row.get(3)?,
            stock_status: row.get(4)?,
        })
    }

    fn to_values(&self) -> Vec<Value> {
        vec![
            self.product_id.into(),
            self.onsale_web.into(),
            self.price.into(),
            self.stock_quantity.into(),
            self.stock_status.clone().into(),
        ]
    }
}

impl Relation for RawWebRecord {
    const COLUMNS: &'static [Column] = WEB_COLUMNS;

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            sku: row.get(0)?,
            post_title: row.get(1)?,
            post_excerpt: row.get(2)?,
            post_status: row.get(3)?,
            post_type: row.get(4)?,
            post_date: get_post_date(row, 5)?,
            average_rating: row.get(6)?,
            total_sales: row.get(7)?,
        })
    }

    fn to_values(&self) -> Vec<Value> {
        vec![
            self.sku.clone().into(),
            self.post_title.clone().into(),
            self.post_excerpt.clone().into(),
            self.post_status.clone().into(),
            self.post_type.clone().into(),
            post_date_value(&self.post_date),
            self.average_rating.into(),
            self.total_sales.into(),
        ]
    }
}

impl Relation for WebRecord {
    const COLUMNS: &'static [Column] = WEB_COLUMNS;

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            sku: row.get(0)?,
            post_title: row.get(1)?,
            post_excerpt: row.get(2)?,
            post_status: row.get(3)?,
            post_type: row.get(4)?,
            post_date: get_post_date(row, 5)?,
            average_rating: row.get(6)?,
            total_sales: row.get(7)?,
        })
    }

    fn to_values(&self) -> Vec<Value> {
        vec![
            self.sku.clone().into(),
            self.post_title.clone().into(),
            self.post_excerpt.clone().into(),
            self.post_status.clone().into(),
            self.post_type.clone().into(),
            post_date_value(&self.post_date),
            self.average_rating.into(),
            self.total_sales.into(),
        ]
    }
}

impl Relation for RawLiaisonRecord {
    const COLUMNS: &'static [Column] = LIAISON_COLUMNS;

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            product_id: row.get(0)?,
            id_web: row.get(1)?,
        })
    }

    fn to_values(&self) -> Vec<Value> {
        vec![self.product_id.into(), self.id_web.clone().into()]
    }
}

impl Relation for LiaisonRecord {
    const COLUMNS: &'static [Column] = LIAISON_COLUMNS;

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            product_id: row.get(0)?,
            id_web: row.get(1)?,
        })
    }

    fn to_values(&self) -> Vec<Value> {
        vec![self.product_id.into(), self.id_web.clone().into()]
    }
}

impl Relation for ExcludedRecord {
    const COLUMNS: &'static [Column] = &[
        Column::text("source"),
        Column::text("reason"),
        Column::text("record"),
    ];

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            source: row.get(0)?,
            reason: row.get(1)?,
            record: row.get(2)?,
        })
    }

    fn to_values(&self) -> Vec<Value> {
        vec![
            self.source.clone().into(),
            self.reason.clone().into(),
            self.record.clone().into(),
        ]
    }
}

impl Relation for FusedProduct {
    const COLUMNS: &'static [Column] = &[
        Column::integer("product_id"),
        Column::integer("onsale_web"),
        Column::real("price"),
        Column::integer("stock_quantity"),
        Column::text("stock_status"),
        Column::text("post_title"),
        Column::text("post_excerpt"),
        Column::text("post_status"),
        Column::text("post_type"),
        Column::real("average_rating"),
        Column::integer("total_sales"),
    ];

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            product_id: row.get(0)?,
            onsale_web: row.get(1)?,
            price: row.get(2)?,
            stock_quantity: row.get(3)?,
            stock_status: row.get(4)?,
            post_title: row.get(5)?,
            post_excerpt: row.get(6)?,
            post_status: row.get(7)?,
            post_type: row.get(8)?,
            average_rating: row.get(9)?,
            total_sales: row.get(10)?,
        })
    }

    fn to_values(&self) -> Vec<Value> {
        vec![
            self.product_id.into(),
            self.onsale_web.into(),
            self.price.into(),
            self.stock_quantity.into(),
            self.stock_status.clone().into(),
            self.post_title.clone().into(),
            self.post_excerpt.clone().into(),
            self.post_status.clone().into(),
            self.post_type.clone().into(),
            self.average_rating.into(),
            self.total_sales.into(),
        ]
    }
}

impl Relation for RevenueLine {
    const COLUMNS: &'static [Column] = &[
        Column::integer("product_id"),
        Column::text("post_title"),
        Column::real("price"),
        Column::integer("stock_quantity"),
        Column::real("revenue"),
    ];

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            product_id: row.get(0)?,
            post_title: row.get(1)?,
            price: row.get(2)?,
            stock_quantity: row.get(3)?,
            revenue: row.get(4)?,
        })
    }

    fn to_values(&self) -> Vec<Value> {
        vec![
            self.product_id.into(),
            self.post_title.clone().into(),
            self.price.into(),
            self.stock_quantity.into(),
            self.revenue.into(),
        ]
    }
}

impl Relation for RevenueTotal {
    const COLUMNS: &'static [Column] = &[Column::real("total"), Column::integer("product_count")];

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            total: row.get(0)?,
            product_count: row.get(1)?,
        })
    }

    fn to_values(&self) -> Vec<Value> {
        vec![self.total.into(), self.product_count.into()]
    }
}

impl Relation for OutlierClassification {
    const COLUMNS: &'static [Column] = &[
        Column::integer("product_id"),
        Column::text("post_title"),
        Column::real("price"),
        Column::real("z_score"),
        Column::text("segment"),
    ];

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let segment: String = row.get(4)?;
        Ok(Self {
            product_id: row.get(0)?,
            post_title: row.get(1)?,
            price: row.get(2)?,
            z_score: row.get(3)?,
            segment: segment.parse().map_err(|e: String| {
                rusqlite::Error::FromSqlConversionFailure(4, Type::Text, e.into())
            })?,
        })
    }

    fn to_values(&self) -> Vec<Value> {
        vec![
            self.product_id.into(),
            self.post_title.clone().into(),
            self.price.into(),
            self.z_score.into(),
            self.segment.as_str().to_string().into(),
        ]
    }
}
