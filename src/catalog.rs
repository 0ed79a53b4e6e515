//! Product catalog loaded from a CSV price list.
//!
//! The file is owner-maintained and small, so it is re-read on every
//! polling cycle and any malformed cost aborts the load instead of being
//! papered over.

use crate::config::CatalogConfig;
use crate::error::{Error, Result};
use regex::Regex;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tracing::warn;

/// One product row: display name plus authoritative unit cost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub name: String,
    pub unit_cost: Decimal,
}

/// In-memory price list keyed by normalized product name.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    entries: BTreeMap<String, CatalogEntry>,
}

impl Catalog {
    /// Read the catalog CSV, resolving columns by header name.
    pub fn load(cfg: &CatalogConfig) -> Result<Self> {
        let mut reader = csv::Reader::from_path(&cfg.path)
            .map_err(|e| Error::CatalogLoad(format!("{}: {e}", cfg.path)))?;

        let headers = reader
            .headers()
            .map_err(|e| Error::CatalogLoad(e.to_string()))?
            .clone();
        let name_idx = column_index(&headers, &cfg.name_column)?;
        let cost_idx = column_index(&headers, &cfg.cost_column)?;

        let mut entries = BTreeMap::new();
        for record in reader.records() {
            let record = record.map_err(|e| Error::CatalogLoad(e.to_string()))?;
            let name = record.get(name_idx).unwrap_or("").trim();
            if name.is_empty() {
                warn!("skipping catalog row without a product name");
                continue;
            }
            let raw_cost = record.get(cost_idx).unwrap_or("");
            let unit_cost = parse_money(raw_cost).ok_or_else(|| {
                Error::CatalogLoad(format!("unreadable cost {raw_cost:?} for {name:?}"))
            })?;
            if unit_cost.is_sign_negative() {
                return Err(Error::CatalogLoad(format!(
                    "negative cost {raw_cost:?} for {name:?}"
                )));
            }
            let key = normalize_name(name);
            if let Some(previous) = entries.insert(
                key,
                CatalogEntry {
                    name: name.to_string(),
                    unit_cost,
                },
            ) {
                warn!(product = %previous.name, "duplicate catalog row, keeping the last one");
            }
        }

        if entries.is_empty() {
            return Err(Error::CatalogLoad(format!(
                "{}: no usable product rows",
                cfg.path
            )));
        }
        Ok(Self { entries })
    }

    /// Build a catalog directly from entries. Handy for tests.
    pub fn from_entries(items: impl IntoIterator<Item = CatalogEntry>) -> Self {
        let entries = items
            .into_iter()
            .map(|e| (normalize_name(&e.name), e))
            .collect();
        Self { entries }
    }

    /// Case- and whitespace-insensitive lookup by product name.
    pub fn lookup(&self, name: &str) -> Option<&CatalogEntry> {
        self.entries.get(&normalize_name(name))
    }

    pub fn entries(&self) -> impl Iterator<Item = &CatalogEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Uppercase and collapse internal whitespace so `" widget "` and
/// `"Widget"` address the same entry.
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

/// Pull the first numeric amount out of a price cell.
///
/// Accepts plain numbers as well as formatted values like `"$1,800.00"`.
pub fn parse_money(raw: &str) -> Option<Decimal> {
    let re = Regex::new(r"[-+]?\d[\d,]*(?:\.\d+)?").ok()?;
    let matched = re.find(raw)?.as_str().replace(',', "");
    matched.parse().ok()
}

/// Render an amount with two decimal places, the way it appears on the
/// invoice and in prompts.
pub fn format_money(value: Decimal) -> String {
    let mut scaled = value;
    scaled.rescale(2);
    scaled.to_string()
}

fn column_index(headers: &csv::StringRecord, wanted: &str) -> Result<usize> {
    headers
        .iter()
        .position(|h| h.trim().eq_ignore_ascii_case(wanted))
        .ok_or_else(|| {
            let available: Vec<&str> = headers.iter().collect();
            Error::CatalogLoad(format!(
                "column {wanted:?} not found, headers are {available:?}"
            ))
        })
}
