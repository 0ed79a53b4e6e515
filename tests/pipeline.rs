//! End-to-end pipeline tests with a canned chat backend.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use facturador::catalog::{Catalog, CatalogEntry};
use facturador::config::{CatalogConfig, Config, InvoiceConfig, LlmConfig, MailConfig};
use facturador::error::Error;
use facturador::llm::ChatCompletion;
use facturador::mail::FetchedOrder;
use facturador::pipeline::{OrderDecision, Pipeline};
use facturador::store::ProcessedStore;
use rust_decimal::Decimal;

/// Hands out pre-recorded answers in order, one per chat call.
struct StubChat {
    answers: Mutex<VecDeque<String>>,
}

impl StubChat {
    fn new(answers: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            answers: Mutex::new(answers.iter().map(|s| s.to_string()).collect()),
        })
    }
}

#[async_trait]
impl ChatCompletion for StubChat {
    async fn complete(&self, _system: &str, _user: &str) -> facturador::Result<String> {
        self.answers
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::Llm("stub has no answer left".to_string()))
    }
}

fn test_config(dir: &tempfile::TempDir) -> Config {
    Config {
        mail: MailConfig {
            imap_host: "localhost".to_string(),
            imap_port: 993,
            smtp_host: "localhost".to_string(),
            smtp_port: 587,
            user: "ventas@example.com".to_string(),
            password: "secret".to_string(),
            subject_filter: "orden de pedido".to_string(),
            outgoing_subject: "Factura - orden de pedido".to_string(),
        },
        llm: LlmConfig {
            base_url: "http://localhost:9999/v1".to_string(),
            model: "test-model".to_string(),
            api_key: "test-key".to_string(),
            timeout: Duration::from_secs(5),
            retries: 0,
        },
        catalog: CatalogConfig {
            path: dir.path().join("products.csv").to_string_lossy().into_owned(),
            name_column: "Nombre".to_string(),
            cost_column: "Costo".to_string(),
        },
        invoice: InvoiceConfig {
            output_path: dir.path().join("invoice.pdf").to_string_lossy().into_owned(),
            business_name: "Facturador".to_string(),
            tax_rate: Decimal::new(16, 2),
        },
        store_path: dir.path().join("ledger.db").to_string_lossy().into_owned(),
        poll_interval: Duration::from_secs(180),
        fetch_limit: 10,
        max_attempts: 3,
    }
}

fn pipeline(dir: &tempfile::TempDir, chat: Arc<StubChat>) -> Pipeline {
    let config = test_config(dir);
    let store = ProcessedStore::open(dir.path().join("ledger.db")).unwrap();
    Pipeline::new(config, chat, store)
}

fn catalog() -> Catalog {
    Catalog::from_entries([
        CatalogEntry {
            name: "Widget".to_string(),
            unit_cost: "10.00".parse().unwrap(),
        },
        CatalogEntry {
            name: "Gadget".to_string(),
            unit_cost: "20.00".parse().unwrap(),
        },
    ])
}

fn order(body: &str) -> FetchedOrder {
    FetchedOrder {
        uid: 1,
        message_id: "pedido-1@example.com".to_string(),
        date: "1755770400".to_string(),
        from_addr: "cliente@example.com".to_string(),
        from_name: "Cliente".to_string(),
        subject: "orden de pedido".to_string(),
        body: body.to_string(),
    }
}

const TWO_PRODUCT_EXTRACTION: &str = r#"{"productos": [
    {"nombre": "WIDGETS", "cantidad": "3"},
    {"nombre": "GADGETS", "cantidad": "2"}
]}"#;

const TWO_PRODUCT_MATCH: &str = r#"{"productos": [
    {"nombre": "Widget", "cantidad": 3, "costo": "$10.00", "solicitado": "WIDGETS"},
    {"nombre": "Gadget", "cantidad": 2, "costo": "$20.00", "solicitado": "GADGETS"}
]}"#;

#[tokio::test]
async fn two_product_order_becomes_a_priced_invoice() {
    let dir = tempfile::tempdir().unwrap();
    let chat = StubChat::new(&[TWO_PRODUCT_EXTRACTION, TWO_PRODUCT_MATCH]);
    let pipeline = pipeline(&dir, chat);

    let decision = pipeline
        .evaluate_order(&catalog(), &order("Necesito 3 widgets y 2 gadgets."))
        .await
        .unwrap();

    let OrderDecision::Invoice { invoice, unmatched } = decision else {
        panic!("expected an invoice decision");
    };
    assert!(unmatched.is_empty());
    assert_eq!(invoice.items.len(), 2);
    assert_eq!(invoice.items[0].catalog_name, "Widget");
    assert_eq!(invoice.items[0].total_cost, "30.00".parse().unwrap());
    assert_eq!(invoice.items[1].catalog_name, "Gadget");
    assert_eq!(invoice.items[1].total_cost, "40.00".parse().unwrap());
    assert_eq!(invoice.grand_total, "70.00".parse().unwrap());
    assert_eq!(invoice.recipient, "cliente@example.com");

    let body = pipeline.compose_invoice_body(&invoice, &unmatched);
    assert!(body.contains("Hola Cliente"));
    assert!(body.contains("$70.00"));
}

#[tokio::test]
async fn greeting_email_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let chat = StubChat::new(&[r#"{"productos": []}"#]);
    let pipeline = pipeline(&dir, chat);

    let decision = pipeline
        .evaluate_order(&catalog(), &order("Hola! Solo queria saludar."))
        .await
        .unwrap();
    assert!(matches!(decision, OrderDecision::Skip));
}

#[tokio::test]
async fn conversational_answer_fails_the_order() {
    let dir = tempfile::tempdir().unwrap();
    let chat = StubChat::new(&["Claro que si! Veo que el cliente quiere varios productos."]);
    let pipeline = pipeline(&dir, chat);

    let err = pipeline
        .evaluate_order(&catalog(), &order("Necesito 3 widgets."))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ExtractionParse(_)));
}

#[tokio::test]
async fn unknown_products_produce_a_notice_decision() {
    let dir = tempfile::tempdir().unwrap();
    let chat = StubChat::new(&[
        r#"{"productos": [{"nombre": "TELESCOPIO", "cantidad": 1}]}"#,
        r#"{"productos": []}"#,
    ]);
    let pipeline = pipeline(&dir, chat);

    let decision = pipeline
        .evaluate_order(&catalog(), &order("Quiero un telescopio."))
        .await
        .unwrap();
    let OrderDecision::NoMatches { unmatched } = decision else {
        panic!("expected a no-matches decision");
    };
    assert_eq!(unmatched, vec!["TELESCOPIO"]);

    let body = pipeline.compose_notice_body("Cliente", &unmatched);
    assert!(body.contains("TELESCOPIO"));
    assert!(body.contains("no encontramos ninguno"));
}

#[tokio::test]
async fn model_arithmetic_is_recomputed_from_the_catalog() {
    let dir = tempfile::tempdir().unwrap();
    let chat = StubChat::new(&[
        r#"{"productos": [{"nombre": "WIDGETS", "cantidad": 3}]}"#,
        r#"{"productos": [{"nombre": "Widget", "cantidad": 3, "costo": "$99.99", "solicitado": "WIDGETS"}]}"#,
    ]);
    let pipeline = pipeline(&dir, chat);

    let decision = pipeline
        .evaluate_order(&catalog(), &order("Necesito 3 widgets."))
        .await
        .unwrap();
    let OrderDecision::Invoice { invoice, .. } = decision else {
        panic!("expected an invoice decision");
    };
    assert_eq!(invoice.items[0].unit_cost, "10.00".parse().unwrap());
    assert_eq!(invoice.grand_total, "30.00".parse().unwrap());
    assert_eq!(
        invoice.items[0].quoted_unit_cost,
        Some("99.99".parse().unwrap())
    );
}

#[tokio::test]
async fn partially_matched_orders_list_the_missing_products() {
    let dir = tempfile::tempdir().unwrap();
    let chat = StubChat::new(&[
        r#"{"productos": [
            {"nombre": "WIDGETS", "cantidad": 3},
            {"nombre": "TELESCOPIO", "cantidad": 1}
        ]}"#,
        r#"{"productos": [{"nombre": "Widget", "cantidad": 3, "costo": "$10.00", "solicitado": "WIDGETS"}]}"#,
    ]);
    let pipeline = pipeline(&dir, chat);

    let decision = pipeline
        .evaluate_order(&catalog(), &order("Necesito 3 widgets y un telescopio."))
        .await
        .unwrap();
    let OrderDecision::Invoice { invoice, unmatched } = decision else {
        panic!("expected an invoice decision");
    };
    assert_eq!(invoice.grand_total, "30.00".parse().unwrap());
    assert_eq!(unmatched, vec!["TELESCOPIO"]);

    let body = pipeline.compose_invoice_body(&invoice, &unmatched);
    assert!(body.contains("TELESCOPIO"));
    assert!(body.contains("no aparecen en la factura"));
}

#[tokio::test]
async fn identical_answers_give_identical_invoices() {
    let dir = tempfile::tempdir().unwrap();
    let first = {
        let pipeline = pipeline(&dir, StubChat::new(&[TWO_PRODUCT_EXTRACTION, TWO_PRODUCT_MATCH]));
        pipeline
            .evaluate_order(&catalog(), &order("Necesito 3 widgets y 2 gadgets."))
            .await
            .unwrap()
    };
    let second = {
        let pipeline = pipeline(&dir, StubChat::new(&[TWO_PRODUCT_EXTRACTION, TWO_PRODUCT_MATCH]));
        pipeline
            .evaluate_order(&catalog(), &order("Necesito 3 widgets y 2 gadgets."))
            .await
            .unwrap()
    };

    let (OrderDecision::Invoice { invoice: a, .. }, OrderDecision::Invoice { invoice: b, .. }) =
        (first, second)
    else {
        panic!("expected two invoice decisions");
    };
    assert_eq!(a.items, b.items);
    assert_eq!(a.grand_total, b.grand_total);
}

#[tokio::test]
async fn chat_transport_failure_is_reported_as_llm_error() {
    let dir = tempfile::tempdir().unwrap();
    let chat = StubChat::new(&[]);
    let pipeline = pipeline(&dir, chat);

    let err = pipeline
        .evaluate_order(&catalog(), &order("Necesito 3 widgets."))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Llm(_)));
}

#[test]
fn rendered_invoice_pdf_carries_the_order() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let items = vec![facturador::matching::MatchedItem {
        catalog_name: "Widget".to_string(),
        quantity: 3,
        unit_cost: "10.00".parse().unwrap(),
        total_cost: "30.00".parse().unwrap(),
        quoted_unit_cost: None,
    }];
    let invoice = facturador::invoice::Invoice::new(items, "cliente@example.com", "Cliente");
    let bytes = invoice.render_pdf(&config.invoice).unwrap();

    assert!(bytes.starts_with(b"%PDF"));
    let contains = |needle: &[u8]| bytes.windows(needle.len()).any(|w| w == needle);
    assert!(contains(b"(Widget)"));
    assert!(contains(b"($30.00)"));
}
