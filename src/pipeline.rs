//! The order-to-invoice pipeline.
//!
//! One cycle: load the catalog, pull unhandled order emails, and walk
//! each through extraction, matching, rendering and delivery. Failures
//! are scoped to the email they happened on; only a missing catalog or
//! an unreachable mailbox aborts the whole cycle.

use crate::catalog::{Catalog, format_money};
use crate::config::Config;
use crate::error::Result;
use crate::extract::ExtractionClient;
use crate::invoice::Invoice;
use crate::llm::ChatCompletion;
use crate::mail::{FetchedOrder, MailGateway};
use crate::matching::MatchingClient;
use crate::store::ProcessedStore;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// What one order email should turn into.
#[derive(Debug)]
pub enum OrderDecision {
    /// The email orders nothing, leave it alone.
    Skip,
    /// At least one product matched the catalog.
    Invoice {
        invoice: Invoice,
        unmatched: Vec<String>,
    },
    /// Products were requested but none matched the catalog.
    NoMatches { unmatched: Vec<String> },
}

/// Outcome counts for one polling cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub fetched: usize,
    pub already_done: usize,
    pub sent: usize,
    pub skipped: usize,
    pub notices: usize,
    pub failed: usize,
}

pub struct Pipeline {
    config: Config,
    chat: Arc<dyn ChatCompletion>,
    store: ProcessedStore,
}

impl Pipeline {
    pub fn new(config: Config, chat: Arc<dyn ChatCompletion>, store: ProcessedStore) -> Self {
        Self {
            config,
            chat,
            store,
        }
    }

    /// Run one polling cycle.
    ///
    /// The catalog is re-read every cycle so price edits take effect
    /// without a restart.
    pub async fn run_cycle(&self) -> Result<CycleStats> {
        let catalog = Catalog::load(&self.config.catalog)?;
        info!(products = catalog.len(), "catalog loaded");

        let gateway = MailGateway::new(&self.config.mail);
        let orders = gateway.fetch_orders(self.config.fetch_limit)?;

        let mut stats = CycleStats {
            fetched: orders.len(),
            ..CycleStats::default()
        };
        for order in orders {
            let fingerprint = ProcessedStore::fingerprint(
                &order.message_id,
                &order.date,
                &self.config.mail.user,
            );
            if self.store.is_finished(&fingerprint)? {
                stats.already_done += 1;
                continue;
            }

            let span = tracing::info_span!("order", uid = order.uid, from = %order.from_addr);
            let _guard = span.enter();
            match self.evaluate_order(&catalog, &order).await {
                Ok(OrderDecision::Skip) => {
                    info!("no products requested, skipping");
                    self.store.record_skipped(&fingerprint)?;
                    stats.skipped += 1;
                }
                Ok(OrderDecision::NoMatches { unmatched }) => {
                    let body = self.compose_notice_body(&order.from_name, &unmatched);
                    match gateway.send_notice(&order.from_addr, &body) {
                        Ok(()) => {
                            info!(unmatched = unmatched.len(), "nothing matched, notice sent");
                            self.store.record_skipped(&fingerprint)?;
                            stats.notices += 1;
                        }
                        Err(e) => {
                            warn!(error = %e, "notice delivery failed");
                            self.store.record_failure(
                                &fingerprint,
                                &e.to_string(),
                                self.config.max_attempts,
                            )?;
                            stats.failed += 1;
                        }
                    }
                }
                Ok(OrderDecision::Invoice { invoice, unmatched }) => {
                    match self.deliver_invoice(&gateway, &invoice, &unmatched) {
                        Ok(()) => {
                            self.store.record_done(&fingerprint)?;
                            stats.sent += 1;
                        }
                        Err(e) => {
                            warn!(error = %e, "invoice delivery failed");
                            self.store.record_failure(
                                &fingerprint,
                                &e.to_string(),
                                self.config.max_attempts,
                            )?;
                            stats.failed += 1;
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "order processing failed");
                    self.store.record_failure(
                        &fingerprint,
                        &e.to_string(),
                        self.config.max_attempts,
                    )?;
                    stats.failed += 1;
                }
            }
        }
        Ok(stats)
    }

    /// Decide what a single order email should turn into, without
    /// touching the mailbox or the ledger.
    pub async fn evaluate_order(
        &self,
        catalog: &Catalog,
        order: &FetchedOrder,
    ) -> Result<OrderDecision> {
        let requested = ExtractionClient::new(self.chat.as_ref())
            .extract(&order.body)
            .await?;
        if requested.is_empty() {
            return Ok(OrderDecision::Skip);
        }
        info!(requested = requested.len(), "products extracted");

        let outcome = MatchingClient::new(self.chat.as_ref())
            .match_items(&requested, catalog)
            .await?;
        if outcome.items.is_empty() {
            return Ok(OrderDecision::NoMatches {
                unmatched: outcome.unmatched,
            });
        }

        let invoice = Invoice::new(
            outcome.items,
            order.from_addr.clone(),
            order.from_name.clone(),
        );
        Ok(OrderDecision::Invoice {
            invoice,
            unmatched: outcome.unmatched,
        })
    }

    fn deliver_invoice(
        &self,
        gateway: &MailGateway,
        invoice: &Invoice,
        unmatched: &[String],
    ) -> Result<()> {
        let pdf = invoice.render_pdf(&self.config.invoice)?;
        std::fs::write(&self.config.invoice.output_path, &pdf)?;

        let body = self.compose_invoice_body(invoice, unmatched);
        gateway.send_invoice(&invoice.recipient, &body, pdf, &self.attachment_name())?;
        info!(
            items = invoice.items.len(),
            total = %format_money(invoice.grand_total),
            "invoice sent"
        );
        Ok(())
    }

    /// Body of the email the invoice is attached to.
    pub fn compose_invoice_body(&self, invoice: &Invoice, unmatched: &[String]) -> String {
        let mut body = format!(
            "Hola {},\n\nGracias por su orden de pedido. Adjuntamos la factura con los productos solicitados, por un total de ${}.\n",
            invoice.recipient_name,
            format_money(invoice.grand_total),
        );
        if !unmatched.is_empty() {
            body.push_str("\nNo encontramos estos productos en nuestro catalogo, por lo que no aparecen en la factura:\n");
            for name in unmatched {
                body.push_str(&format!("- {name}\n"));
            }
        }
        body.push_str(&format!("\nSaludos,\n{}\n", self.config.invoice.business_name));
        body
    }

    /// Body of the reply sent when no requested product matched.
    pub fn compose_notice_body(&self, recipient_name: &str, unmatched: &[String]) -> String {
        let mut body = format!(
            "Hola {recipient_name},\n\nRecibimos su orden de pedido, pero no encontramos ninguno de los productos solicitados en nuestro catalogo:\n",
        );
        for name in unmatched {
            body.push_str(&format!("- {name}\n"));
        }
        body.push_str(&format!(
            "\nPor favor revise los nombres e intente de nuevo.\n\nSaludos,\n{}\n",
            self.config.invoice.business_name
        ));
        body
    }

    fn attachment_name(&self) -> String {
        Path::new(&self.config.invoice.output_path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("invoice.pdf")
            .to_string()
    }
}
