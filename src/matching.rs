//! Second pipeline stage: map requested product names onto catalog
//! entries.
//!
//! The model only resolves names. Every figure it echoes back is checked
//! against the catalog and the original request, so a hallucinated price
//! or quantity can never reach the invoice.

use crate::catalog::{Catalog, normalize_name, parse_money};
use crate::error::{Error, Result};
use crate::extract::{RequestedItem, parse_quantity};
use crate::llm::{ChatCompletion, clean_payload};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Instructs the model to resolve requested names against the catalog.
const MATCH_PROMPT: &str = r#"Se te dara un catalogo de productos con costos y una lista de productos solicitados. Debes encontrar cada producto solicitado dentro del catalogo, aunque su nombre este incompleto o escrito distinto. Responde UNICAMENTE con JSON valido, sin comentarios adicionales, en este formato:
{"productos": [{"nombre": "nombre exacto en el catalogo", "cantidad": 1, "costo": "costo del catalogo", "solicitado": "nombre tal como fue solicitado"}]}

Incluye solamente los productos solicitados que realmente existan en el catalogo."#;

/// One invoice line: a requested product resolved to a catalog entry.
///
/// `unit_cost` and `total_cost` are computed locally from the catalog.
/// The cost the model echoed is kept in `quoted_unit_cost` for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedItem {
    pub catalog_name: String,
    pub quantity: u32,
    pub unit_cost: Decimal,
    pub total_cost: Decimal,
    pub quoted_unit_cost: Option<Decimal>,
}

/// Result of the matching stage for one email.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchOutcome {
    pub items: Vec<MatchedItem>,
    /// Requested names that did not resolve to any catalog entry, in
    /// request order.
    pub unmatched: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawMatches {
    #[serde(default)]
    productos: Vec<RawMatch>,
}

#[derive(Debug, Deserialize)]
struct RawMatch {
    #[serde(default)]
    nombre: String,
    #[serde(default)]
    cantidad: Value,
    #[serde(default)]
    costo: Value,
    #[serde(default)]
    solicitado: String,
}

/// Matching stage over any [`ChatCompletion`] backend.
pub struct MatchingClient<'a> {
    chat: &'a dyn ChatCompletion,
}

impl<'a> MatchingClient<'a> {
    pub fn new(chat: &'a dyn ChatCompletion) -> Self {
        Self { chat }
    }

    /// Resolve requested items against the catalog.
    pub async fn match_items(
        &self,
        requested: &[RequestedItem],
        catalog: &Catalog,
    ) -> Result<MatchOutcome> {
        let catalog_json = Value::Array(
            catalog
                .entries()
                .map(|e| {
                    json!({
                        "nombre": e.name,
                        "costo": crate::catalog::format_money(e.unit_cost),
                    })
                })
                .collect(),
        );
        let requested_json = Value::Array(
            requested
                .iter()
                .map(|r| json!({"nombre": r.raw_name, "cantidad": r.quantity}))
                .collect(),
        );
        let user = format!(
            "Este es el catalogo de productos: {catalog_json} y estos son los productos de la orden de pedido: {requested_json}"
        );

        let answer = self.chat.complete(MATCH_PROMPT, &user).await?;
        let outcome = parse_matches(&answer, requested, catalog)?;
        debug!(
            matched = outcome.items.len(),
            unmatched = outcome.unmatched.len(),
            "matching answer reconciled"
        );
        Ok(outcome)
    }
}

/// Reconcile the model answer with the request and the catalog.
///
/// Each answer record must name a product that exists in the catalog and
/// claim one of the requested items, either through its `solicitado` echo
/// or through its own name. Records that claim nothing are dropped, and
/// requested items nobody claimed end up in `unmatched`.
pub fn parse_matches(
    answer: &str,
    requested: &[RequestedItem],
    catalog: &Catalog,
) -> Result<MatchOutcome> {
    let payload = clean_payload(answer).map_err(Error::MatchingParse)?;
    let raw: RawMatches = serde_json::from_str(payload)
        .map_err(|e| Error::MatchingParse(format!("{e}; payload: {payload}")))?;

    let requested_index: HashMap<String, usize> = requested
        .iter()
        .enumerate()
        .map(|(i, r)| (normalize_name(&r.raw_name), i))
        .collect();

    let mut lines: Vec<Option<MatchedItem>> = vec![None; requested.len()];
    for record in raw.productos {
        let name = record.nombre.trim();
        if name.is_empty() {
            return Err(Error::MatchingParse(
                "match record without a product name".to_string(),
            ));
        }
        let echoed_quantity = parse_quantity(&record.cantidad).ok_or_else(|| {
            Error::MatchingParse(format!(
                "unreadable quantity {:?} for {name:?}",
                record.cantidad
            ))
        })?;

        let claimed = requested_index
            .get(&normalize_name(&record.solicitado))
            .or_else(|| requested_index.get(&normalize_name(name)));
        let Some(&req_idx) = claimed else {
            warn!(product = %name, "match record claims nothing that was requested, dropping it");
            continue;
        };
        if lines[req_idx].is_some() {
            warn!(product = %name, "requested item already matched, dropping duplicate record");
            continue;
        }
        let Some(entry) = catalog.lookup(name) else {
            debug!(product = %name, "matched name is not in the catalog");
            continue;
        };

        let quantity = requested[req_idx].quantity;
        if echoed_quantity != quantity {
            warn!(
                product = %entry.name,
                echoed = echoed_quantity,
                requested = quantity,
                "model echoed a different quantity, keeping the requested one"
            );
        }
        let quoted_unit_cost = parse_cost(&record.costo);
        if let Some(quoted) = quoted_unit_cost {
            if quoted != entry.unit_cost {
                warn!(
                    product = %entry.name,
                    quoted = %quoted,
                    catalog = %entry.unit_cost,
                    "model quoted a different cost, keeping the catalog one"
                );
            }
        }

        lines[req_idx] = Some(MatchedItem {
            catalog_name: entry.name.clone(),
            quantity,
            unit_cost: entry.unit_cost,
            total_cost: Decimal::from(quantity) * entry.unit_cost,
            quoted_unit_cost,
        });
    }

    let mut outcome = MatchOutcome::default();
    for (slot, request) in lines.into_iter().zip(requested) {
        match slot {
            Some(item) => outcome.items.push(item),
            None => outcome.unmatched.push(request.raw_name.clone()),
        }
    }
    Ok(outcome)
}

fn parse_cost(value: &Value) -> Option<Decimal> {
    match value {
        Value::String(s) => parse_money(s),
        Value::Number(n) => parse_money(&n.to_string()),
        _ => None,
    }
}
