//! Mailbox access
//!
//! The orchestrator only sees the [`Mailbox`] trait; [`GraphClient`] is the
//! Microsoft Graph implementation.

mod graph;
mod inline;

pub use graph::*;
pub use inline::*;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::Email;

/// Source of messages and their inline images
#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Fetch messages page by page until `max_count` are collected or the
    /// listing is exhausted. `None` means no cap.
    async fn fetch_messages(&self, max_count: Option<usize>) -> Result<Vec<Email>>;

    /// Fetch the raw bytes of the requested inline attachments of a message
    async fn fetch_inline_images(
        &self,
        message_id: &str,
        content_ids: &[String],
    ) -> Result<BTreeMap<String, Vec<u8>>>;
}
