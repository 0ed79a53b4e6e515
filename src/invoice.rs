//! Invoice model and PDF rendering.
//!
//! The document is built directly from lopdf primitives: one content
//! stream of text operations per page, Helvetica with WinAnsi encoding so
//! accented Spanish product names survive. Streams are left uncompressed.

use crate::config::InvoiceConfig;
use crate::error::{Error, Result};
use crate::matching::MatchedItem;
use lopdf::content::{Content, Operation};
use lopdf::{Document, Object, Stream, StringFormat, dictionary};
use rust_decimal::Decimal;
use time::OffsetDateTime;
use time::macros::format_description;

use crate::catalog::format_money;

const PAGE_WIDTH: i64 = 612;
const PAGE_HEIGHT: i64 = 792;
const MARGIN: i64 = 72;
const TOP: i64 = 720;
const BOTTOM: i64 = 90;
const ROW_STEP: i64 = 18;

const COL_PRODUCT: i64 = MARGIN;
const COL_QUANTITY: i64 = 320;
const COL_UNIT: i64 = 390;
const COL_TOTAL: i64 = 490;

const REGULAR: &str = "F1";
const BOLD: &str = "F2";

/// A priced order ready to be rendered and sent.
#[derive(Debug, Clone)]
pub struct Invoice {
    pub items: Vec<MatchedItem>,
    /// Sum of all line totals, before tax.
    pub grand_total: Decimal,
    /// Customer mailbox the invoice goes back to.
    pub recipient: String,
    pub recipient_name: String,
    pub generated_at: OffsetDateTime,
}

impl Invoice {
    pub fn new(
        items: Vec<MatchedItem>,
        recipient: impl Into<String>,
        recipient_name: impl Into<String>,
    ) -> Self {
        let grand_total = items.iter().map(|i| i.total_cost).sum();
        Self {
            items,
            grand_total,
            recipient: recipient.into(),
            recipient_name: recipient_name.into(),
            generated_at: OffsetDateTime::now_utc(),
        }
    }

    /// Render the invoice as a single PDF document.
    pub fn render_pdf(&self, cfg: &InvoiceConfig) -> Result<Vec<u8>> {
        let date = self
            .generated_at
            .format(format_description!("[day]/[month]/[year]"))
            .map_err(|e| Error::Render(e.to_string()))?;

        let mut pages: Vec<Vec<Operation>> = Vec::new();
        let mut page = PageText::new(TOP);

        page.write(BOLD, 18, MARGIN, &cfg.business_name);
        page.advance(26);
        page.write(BOLD, 12, MARGIN, "Factura");
        page.advance(18);
        page.write(REGULAR, 11, MARGIN, &format!("Fecha: {date}"));
        page.advance(16);
        page.write(
            REGULAR,
            11,
            MARGIN,
            &format!("Cliente: {} <{}>", self.recipient_name, self.recipient),
        );
        page.advance(28);
        table_header(&mut page);

        for item in &self.items {
            if page.y < BOTTOM {
                pages.push(page.finish());
                page = PageText::new(TOP);
                table_header(&mut page);
            }
            page.write(REGULAR, 11, COL_PRODUCT, &item.catalog_name);
            page.write(REGULAR, 11, COL_QUANTITY, &item.quantity.to_string());
            page.write(REGULAR, 11, COL_UNIT, &money(item.unit_cost));
            page.write(REGULAR, 11, COL_TOTAL, &money(item.total_cost));
            page.advance(ROW_STEP);
        }

        if page.y < BOTTOM + 5 * ROW_STEP {
            pages.push(page.finish());
            page = PageText::new(TOP);
        }
        let iva = (self.grand_total * cfg.tax_rate).round_dp(2);
        let percent = (cfg.tax_rate * Decimal::from(100)).normalize();
        page.advance(4);
        page.rule();
        page.advance(ROW_STEP);
        page.write(REGULAR, 11, COL_UNIT, "Subtotal");
        page.write(REGULAR, 11, COL_TOTAL, &money(self.grand_total));
        page.advance(ROW_STEP);
        page.write(REGULAR, 11, COL_UNIT, &format!("IVA ({percent}%)"));
        page.write(REGULAR, 11, COL_TOTAL, &money(iva));
        page.advance(ROW_STEP);
        page.write(BOLD, 12, COL_UNIT, "Total");
        page.write(BOLD, 12, COL_TOTAL, &money(self.grand_total + iva));
        pages.push(page.finish());

        build_document(pages)
    }
}

fn money(value: Decimal) -> String {
    format!("${}", format_money(value))
}

fn table_header(page: &mut PageText) {
    page.write(BOLD, 11, COL_PRODUCT, "Producto");
    page.write(BOLD, 11, COL_QUANTITY, "Cantidad");
    page.write(BOLD, 11, COL_UNIT, "Precio");
    page.write(BOLD, 11, COL_TOTAL, "Total");
    page.advance(6);
    page.rule();
    page.advance(ROW_STEP);
}

/// Text operations for one page, written top to bottom.
struct PageText {
    ops: Vec<Operation>,
    y: i64,
}

impl PageText {
    fn new(top: i64) -> Self {
        Self {
            ops: Vec::new(),
            y: top,
        }
    }

    fn write(&mut self, font: &str, size: i64, x: i64, text: &str) {
        self.ops.push(Operation::new("BT", vec![]));
        self.ops
            .push(Operation::new("Tf", vec![font.into(), size.into()]));
        self.ops
            .push(Operation::new("Td", vec![x.into(), self.y.into()]));
        self.ops.push(Operation::new(
            "Tj",
            vec![Object::String(winansi(text), StringFormat::Literal)],
        ));
        self.ops.push(Operation::new("ET", vec![]));
    }

    fn rule(&mut self) {
        self.ops
            .push(Operation::new("m", vec![MARGIN.into(), self.y.into()]));
        self.ops.push(Operation::new(
            "l",
            vec![(PAGE_WIDTH - MARGIN).into(), self.y.into()],
        ));
        self.ops.push(Operation::new("S", vec![]));
    }

    fn advance(&mut self, dy: i64) {
        self.y -= dy;
    }

    fn finish(self) -> Vec<Operation> {
        self.ops
    }
}

/// Map text to WinAnsi bytes. Latin-1 covers the Spanish alphabet, and
/// anything outside it becomes a question mark.
fn winansi(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| {
            let code = c as u32;
            if code <= 0xFF { code as u8 } else { b'?' }
        })
        .collect()
}

fn build_document(pages: Vec<Vec<Operation>>) -> Result<Vec<u8>> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();

    let regular_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
        "Encoding" => "WinAnsiEncoding",
    });
    let bold_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica-Bold",
        "Encoding" => "WinAnsiEncoding",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! {
            REGULAR => regular_id,
            BOLD => bold_id,
        },
    });

    let mut kids: Vec<Object> = Vec::new();
    let page_count = pages.len();
    for operations in pages {
        let content = Content { operations };
        let encoded = content.encode().map_err(|e| Error::Render(e.to_string()))?;
        let content_id = doc.add_object(Stream::new(dictionary! {}, encoded));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        kids.push(page_id.into());
    }

    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => page_count as i64,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), PAGE_WIDTH.into(), PAGE_HEIGHT.into()],
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes)
        .map_err(|e| Error::Render(e.to_string()))?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::MatchedItem;

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    fn line(name: &str, quantity: u32, unit: &str) -> MatchedItem {
        let unit_cost: Decimal = unit.parse().unwrap();
        MatchedItem {
            catalog_name: name.to_string(),
            quantity,
            unit_cost,
            total_cost: Decimal::from(quantity) * unit_cost,
            quoted_unit_cost: None,
        }
    }

    fn test_cfg() -> InvoiceConfig {
        InvoiceConfig {
            output_path: "invoice.pdf".to_string(),
            business_name: "Facturador".to_string(),
            tax_rate: Decimal::new(16, 2),
        }
    }

    #[test]
    fn renders_a_pdf_with_totals() {
        let invoice = Invoice::new(
            vec![line("Widget", 3, "10.00"), line("Gadget", 2, "20.00")],
            "cliente@example.com",
            "Cliente",
        );
        assert_eq!(invoice.grand_total, "70.00".parse().unwrap());

        let bytes = invoice.render_pdf(&test_cfg()).unwrap();
        assert!(bytes.starts_with(b"%PDF"));
        assert!(contains(&bytes, b"(Widget)"));
        assert!(contains(&bytes, b"(Gadget)"));
        assert!(contains(&bytes, b"(Subtotal)"));
        assert!(contains(&bytes, b"($70.00)"));
        assert!(contains(&bytes, b"(IVA \\(16%\\))") || contains(&bytes, b"(IVA (16%))"));
        assert!(contains(&bytes, b"($11.20)"));
        assert!(contains(&bytes, b"($81.20)"));
    }

    #[test]
    fn long_invoices_paginate() {
        let items: Vec<MatchedItem> = (0..100).map(|i| line(&format!("Producto {i}"), 1, "10.00")).collect();
        let invoice = Invoice::new(items, "cliente@example.com", "Cliente");
        let bytes = invoice.render_pdf(&test_cfg()).unwrap();
        assert!(contains(&bytes, b"/Count 4") || contains(&bytes, b"/Count 3"));
        assert!(contains(&bytes, b"(Producto 99)"));
        assert!(contains(&bytes, b"($1000.00)"));
    }

    #[test]
    fn accented_names_survive_encoding() {
        assert_eq!(winansi("Cañón"), vec![b'C', b'a', 0xF1, 0xF3, b'n']);
        assert_eq!(winansi("日本"), vec![b'?', b'?']);
    }

    #[test]
    fn recipient_appears_on_the_invoice() {
        let invoice = Invoice::new(vec![line("Widget", 1, "10.00")], "ana@example.com", "Ana");
        let bytes = invoice.render_pdf(&test_cfg()).unwrap();
        assert!(contains(&bytes, b"(Cliente: Ana <ana@example.com>)"));
    }
}
