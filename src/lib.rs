//! Watches a mailbox for order emails, prices them against a CSV
//! catalog with the help of a chat model, and replies to each customer
//! with a PDF invoice.
//!
//! Per email the pipeline extracts the requested products, matches them
//! to catalog entries, recomputes every amount locally, renders the
//! invoice and mails it back. See [`pipeline::Pipeline::run_cycle`].

pub mod catalog;
pub mod config;
pub mod error;
pub mod extract;
pub mod invoice;
pub mod llm;
pub mod mail;
pub mod matching;
pub mod pipeline;
pub mod store;

pub use error::{Error, Result};
