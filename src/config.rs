//! Process configuration.
//!
//! Everything is read from the environment exactly once, in
//! [`Config::from_env`], and handed to the rest of the crate as a plain
//! struct. No other module touches `std::env`.

use crate::error::{Error, Result};
use rust_decimal::Decimal;
use std::time::Duration;

/// Default poll interval between mailbox checks, in seconds.
const DEFAULT_INTERVAL_SECS: u64 = 180;

/// Full application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub mail: MailConfig,
    pub llm: LlmConfig,
    pub catalog: CatalogConfig,
    pub invoice: InvoiceConfig,
    /// SQLite file recording terminally processed messages.
    pub store_path: String,
    /// Pause between polling cycles.
    pub poll_interval: Duration,
    /// Maximum messages pulled per cycle, newest first.
    pub fetch_limit: usize,
    /// Failed messages are retried on later cycles up to this many times.
    pub max_attempts: u32,
}

/// IMAP/SMTP endpoints and credentials.
#[derive(Debug, Clone)]
pub struct MailConfig {
    pub imap_host: String,
    pub imap_port: u16,
    pub smtp_host: String,
    pub smtp_port: u16,
    /// Mailbox address, also used as the SMTP sender.
    pub user: String,
    pub password: String,
    /// Subject line that marks an incoming order email.
    pub subject_filter: String,
    /// Subject line for the outgoing invoice email.
    pub outgoing_subject: String,
}

/// Chat-completions endpoint settings.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// OpenAI-compatible base URL, without the `/chat/completions` suffix.
    pub base_url: String,
    pub model: String,
    pub api_key: String,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Extra attempts after a transport-level failure. Parse failures are
    /// never retried here.
    pub retries: u32,
}

/// Product catalog source.
#[derive(Debug, Clone)]
pub struct CatalogConfig {
    pub path: String,
    pub name_column: String,
    pub cost_column: String,
}

/// Invoice rendering settings.
#[derive(Debug, Clone)]
pub struct InvoiceConfig {
    /// Where the rendered PDF is written before being attached.
    pub output_path: String,
    /// Business name printed on the invoice header.
    pub business_name: String,
    /// Tax rate applied on top of the net total in the rendered document.
    pub tax_rate: Decimal,
}

impl Config {
    /// Build the configuration from environment variables.
    ///
    /// `EMAIL_USER`, `EMAIL_PASSWORD` and `LLM_API_KEY` are required;
    /// everything else falls back to a default.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            mail: MailConfig {
                imap_host: var_or("IMAP_HOST", "imap.gmail.com"),
                imap_port: parsed_var("IMAP_PORT", 993),
                smtp_host: var_or("SMTP_HOST", "smtp.gmail.com"),
                smtp_port: parsed_var("SMTP_PORT", 587),
                user: required("EMAIL_USER")?,
                password: required("EMAIL_PASSWORD")?,
                subject_filter: var_or("ORDER_SUBJECT", "orden de pedido"),
                outgoing_subject: var_or("INVOICE_SUBJECT", "Factura - orden de pedido"),
            },
            llm: LlmConfig {
                base_url: var_or("LLM_BASE_URL", "https://api.openai.com/v1"),
                model: var_or("LLM_MODEL", "gpt-4o"),
                api_key: required("LLM_API_KEY")?,
                timeout: Duration::from_secs(parsed_var("LLM_TIMEOUT_SECS", 60)),
                retries: parsed_var("LLM_RETRIES", 1),
            },
            catalog: CatalogConfig {
                path: var_or("CATALOG_PATH", "products.csv"),
                name_column: var_or("CATALOG_NAME_COLUMN", "Nombre"),
                cost_column: var_or("CATALOG_COST_COLUMN", "Costo"),
            },
            invoice: InvoiceConfig {
                output_path: var_or("INVOICE_OUTPUT", "invoice.pdf"),
                business_name: var_or("BUSINESS_NAME", "Facturador"),
                tax_rate: std::env::var("IVA_RATE")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_else(|| Decimal::new(16, 2)),
            },
            store_path: var_or("STORE_PATH", "facturador.db"),
            poll_interval: Duration::from_secs(parsed_var(
                "CHECKING_INTERVAL",
                DEFAULT_INTERVAL_SECS,
            )),
            fetch_limit: parsed_var("FETCH_LIMIT", 10),
            max_attempts: parsed_var("MAX_ATTEMPTS", 3),
        })
    }
}

fn required(name: &str) -> Result<String> {
    std::env::var(name).map_err(|_| Error::Config(format!("{name} is not set")))
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parsed_var<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
