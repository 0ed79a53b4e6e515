//! First pipeline stage: turn a free-text order email into a list of
//! requested products.

use crate::error::{Error, Result};
use crate::llm::{ChatCompletion, clean_payload};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

/// Instructs the model to extract the ordered products as JSON.
const EXTRACT_PROMPT: &str = r#"Extrae los productos de la siguiente orden de pedido y responde UNICAMENTE con JSON valido, sin texto adicional, con los nombres en mayusculas, en este formato:
{"productos": [{"nombre": "NOMBRE DEL PRODUCTO", "cantidad": 1}]}

Si el correo no contiene ningun pedido de productos, responde exactamente:
{"productos": []}"#;

/// Very long bodies are cut before being sent to the model.
const MAX_BODY_CHARS: usize = 12_000;

/// One product the customer asked for, exactly as the model read it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestedItem {
    pub raw_name: String,
    pub quantity: u32,
}

#[derive(Debug, Deserialize)]
struct RawProducts {
    #[serde(default)]
    productos: Vec<RawProduct>,
}

#[derive(Debug, Deserialize)]
struct RawProduct {
    #[serde(default)]
    nombre: String,
    #[serde(default)]
    cantidad: Value,
}

/// Extraction stage over any [`ChatCompletion`] backend.
pub struct ExtractionClient<'a> {
    chat: &'a dyn ChatCompletion,
}

impl<'a> ExtractionClient<'a> {
    pub fn new(chat: &'a dyn ChatCompletion) -> Self {
        Self { chat }
    }

    /// Ask the model which products the email orders.
    ///
    /// An empty list is a valid answer and means the email carries no
    /// order at all.
    pub async fn extract(&self, body: &str) -> Result<Vec<RequestedItem>> {
        let answer = self.chat.complete(EXTRACT_PROMPT, truncate_body(body)).await?;
        let items = parse_items(&answer)?;
        debug!(items = items.len(), "extraction answer parsed");
        Ok(items)
    }
}

/// Parse the model answer into requested items.
///
/// Strict on purpose: a product without a readable name or a positive
/// whole quantity fails the whole email rather than silently inventing
/// an order line.
pub fn parse_items(answer: &str) -> Result<Vec<RequestedItem>> {
    let payload = clean_payload(answer).map_err(Error::ExtractionParse)?;
    let raw: RawProducts = serde_json::from_str(payload)
        .map_err(|e| Error::ExtractionParse(format!("{e}; payload: {payload}")))?;

    let mut items = Vec::with_capacity(raw.productos.len());
    for product in raw.productos {
        let name = product.nombre.trim();
        if name.is_empty() {
            return Err(Error::ExtractionParse(
                "product entry without a name".to_string(),
            ));
        }
        let quantity = parse_quantity(&product.cantidad).ok_or_else(|| {
            Error::ExtractionParse(format!(
                "unreadable quantity {:?} for {name:?}",
                product.cantidad
            ))
        })?;
        items.push(RequestedItem {
            raw_name: name.to_string(),
            quantity,
        });
    }
    Ok(items)
}

/// Read a quantity that may arrive as a JSON number or a numeric string.
pub(crate) fn parse_quantity(value: &Value) -> Option<u32> {
    let quantity = match value {
        Value::Number(n) => {
            if let Some(q) = n.as_u64() {
                u32::try_from(q).ok()
            } else {
                n.as_f64()
                    .filter(|f| f.fract() == 0.0 && *f >= 0.0 && *f <= f64::from(u32::MAX))
                    .map(|f| f as u32)
            }
        }
        Value::String(s) => s.trim().parse::<u32>().ok(),
        _ => None,
    };
    quantity.filter(|q| *q >= 1)
}

fn truncate_body(body: &str) -> &str {
    if body.len() <= MAX_BODY_CHARS {
        return body;
    }
    let mut end = MAX_BODY_CHARS;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}
