//! Mailbox access: IMAP for incoming orders, SMTP for outgoing invoices.
//!
//! Connections are short-lived. Each polling cycle opens a fresh IMAP
//! session, and each outgoing email opens a fresh SMTP transport, so a
//! dropped connection never outlives the cycle that saw it.

use crate::config::MailConfig;
use crate::error::{Error, Result};
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use mail_parser::MessageParser;
use tracing::{debug, info, warn};

/// One order email pulled from the inbox, already parsed.
#[derive(Debug, Clone)]
pub struct FetchedOrder {
    pub uid: u32,
    /// Message-ID header, or a UID-derived stand-in when absent.
    pub message_id: String,
    /// Date header as a unix timestamp string, empty when absent.
    pub date: String,
    pub from_addr: String,
    pub from_name: String,
    pub subject: String,
    pub body: String,
}

pub struct MailGateway {
    config: MailConfig,
}

impl MailGateway {
    pub fn new(config: &MailConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Pull order emails matching the configured subject, newest first.
    ///
    /// Messages that cannot be parsed or carry no plain-text body are
    /// logged and dropped. Deciding whether a message was already
    /// handled is the caller's job.
    pub fn fetch_orders(&self, limit: usize) -> Result<Vec<FetchedOrder>> {
        let client = imap::ClientBuilder::new(self.config.imap_host.as_str(), self.config.imap_port)
            .connect()
            .map_err(|e| Error::MailConnection(e.to_string()))?;
        let mut session = client
            .login(&self.config.user, &self.config.password)
            .map_err(|(e, _)| Error::MailConnection(e.to_string()))?;

        session
            .select("INBOX")
            .map_err(|e| Error::MailConnection(e.to_string()))?;

        let query = format!("SUBJECT \"{}\"", self.config.subject_filter);
        let uids = session
            .uid_search(&query)
            .map_err(|e| Error::MailConnection(e.to_string()))?;
        let mut uids: Vec<u32> = uids.into_iter().collect();
        uids.sort_unstable_by(|a, b| b.cmp(a));
        uids.truncate(limit);

        let mut orders = Vec::new();
        for uid in uids {
            let fetches = session
                .uid_fetch(uid.to_string(), "RFC822")
                .map_err(|e| Error::MailConnection(e.to_string()))?;
            for fetch in fetches.iter() {
                let Some(raw) = fetch.body() else {
                    warn!(uid, "fetch returned no message body");
                    continue;
                };
                match parse_order(uid, raw) {
                    Some(order) => orders.push(order),
                    None => warn!(uid, "message has no usable sender or text body"),
                }
            }
        }

        if let Err(e) = session.logout() {
            debug!(error = %e, "imap logout failed");
        }
        info!(count = orders.len(), "order emails fetched");
        Ok(orders)
    }

    /// Email the rendered invoice back to the customer.
    pub fn send_invoice(
        &self,
        to: &str,
        body: &str,
        pdf: Vec<u8>,
        attachment_name: &str,
    ) -> Result<()> {
        let content_type =
            ContentType::parse("application/pdf").map_err(|e| Error::Send(e.to_string()))?;
        let email = Message::builder()
            .from(mailbox(&self.config.user)?)
            .to(mailbox(to)?)
            .subject(self.config.outgoing_subject.clone())
            .multipart(
                MultiPart::mixed()
                    .singlepart(SinglePart::plain(body.to_string()))
                    .singlepart(Attachment::new(attachment_name.to_string()).body(pdf, content_type)),
            )
            .map_err(|e| Error::Send(e.to_string()))?;

        self.transport()?
            .send(&email)
            .map_err(|e| Error::Send(e.to_string()))?;
        info!(to, "invoice email sent");
        Ok(())
    }

    /// Plain-text reply for orders that produced no invoice.
    pub fn send_notice(&self, to: &str, body: &str) -> Result<()> {
        let email = Message::builder()
            .from(mailbox(&self.config.user)?)
            .to(mailbox(to)?)
            .subject(self.config.outgoing_subject.clone())
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .map_err(|e| Error::Send(e.to_string()))?;

        self.transport()?
            .send(&email)
            .map_err(|e| Error::Send(e.to_string()))?;
        info!(to, "notice email sent");
        Ok(())
    }

    fn transport(&self) -> Result<SmtpTransport> {
        Ok(SmtpTransport::starttls_relay(&self.config.smtp_host)
            .map_err(|e| Error::Send(e.to_string()))?
            .port(self.config.smtp_port)
            .credentials(Credentials::new(
                self.config.user.clone(),
                self.config.password.clone(),
            ))
            .build())
    }
}

fn mailbox(raw: &str) -> Result<Mailbox> {
    raw.parse()
        .map_err(|e| Error::Send(format!("bad address {raw:?}: {e}")))
}

/// Parse a raw RFC822 message into the fields the pipeline needs.
///
/// Returns None when there is no sender address or no plain-text body,
/// since such a message can be neither processed nor answered.
fn parse_order(uid: u32, raw: &[u8]) -> Option<FetchedOrder> {
    let parsed = MessageParser::default().parse(raw)?;

    let from = parsed.from().and_then(|addrs| addrs.first())?;
    let from_addr = from.address().map(|a| a.to_string())?;
    let from_name = from
        .name()
        .map(|n| n.to_string())
        .unwrap_or_else(|| from_addr.split('@').next().unwrap_or_default().to_string());
    let body = parsed.body_text(0)?.to_string();
    let message_id = parsed
        .message_id()
        .map(|m| m.to_string())
        .unwrap_or_else(|| format!("uid-{uid}"));
    let date = parsed
        .date()
        .map(|dt| dt.to_timestamp().to_string())
        .unwrap_or_default();
    let subject = parsed.subject().unwrap_or_default().to_string();

    Some(FetchedOrder {
        uid,
        message_id,
        date,
        from_addr,
        from_name,
        subject,
        body,
    })
}
