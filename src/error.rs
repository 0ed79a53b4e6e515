//! Error types for the order-to-invoice pipeline.

use thiserror::Error;

/// Main error type for the facturador pipeline.
///
/// The two parse variants are *expected* failure modes: the upstream
/// text-generation service is free-form and occasionally answers with
/// commentary instead of data. They abort the current email, never the
/// polling loop.
#[derive(Error, Debug)]
pub enum Error {
    /// The product catalog could not be loaded. Fatal to the cycle.
    #[error("catalog load failed: {0}")]
    CatalogLoad(String),

    /// The IMAP session could not be established or queried. Fatal to
    /// the cycle; the next cycle reconnects.
    #[error("mail connection failed: {0}")]
    MailConnection(String),

    /// The extraction response was not the requested JSON.
    #[error("extraction response unusable: {0}")]
    ExtractionParse(String),

    /// The matching response was not the requested JSON.
    #[error("matching response unusable: {0}")]
    MatchingParse(String),

    /// The invoice PDF could not be produced.
    #[error("invoice render failed: {0}")]
    Render(String),

    /// The outgoing message was rejected or never accepted.
    #[error("mail send failed: {0}")]
    Send(String),

    /// Transport-level failure talking to the chat completions endpoint
    /// (distinct from the parse variants above, and retried once).
    #[error("chat service error: {0}")]
    Llm(String),

    /// Processed-order store failure.
    #[error("state store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// Startup configuration problem.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for the facturador pipeline.
pub type Result<T> = std::result::Result<T, Error>;
