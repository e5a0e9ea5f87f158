//! Email data structures

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Email address with optional display name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    /// Display name (e.g., "John Doe")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Email address (e.g., "john@example.com")
    pub email: String,
}

impl Address {
    /// Create a new address with just an email
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            name: None,
            email: email.into(),
        }
    }

    /// Create a new address with name and email
    pub fn with_name(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            email: email.into(),
        }
    }

    /// Domain part of the address, the substring after the last `@`
    pub fn host(&self) -> Option<&str> {
        self.email
            .trim()
            .rsplit_once('@')
            .map(|(_, host)| host)
            .filter(|host| !host.is_empty())
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} <{}>", name, self.email),
            None => write!(f, "{}", self.email),
        }
    }
}

/// Body format as reported by the mailbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyType {
    #[default]
    Html,
    Text,
}

/// An email message fetched from the mailbox
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Email {
    /// Provider message id
    pub id: String,

    /// Sender, absent for drafts and some system messages
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<Address>,

    /// Subject line
    pub subject: String,

    /// Body content as delivered (HTML unless `body_type` says otherwise)
    pub body: String,

    #[serde(default)]
    pub body_type: BodyType,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub received_at: Option<DateTime<Utc>>,

    /// Whether the provider reports any attachment on the message
    #[serde(default)]
    pub has_attachments: bool,

    /// Inline images resolved from `cid:` references, keyed by content-id
    #[serde(skip)]
    pub inline_images: BTreeMap<String, Vec<u8>>,
}

impl Email {
    /// Sender address if the message has a non-empty one
    pub fn sender_address(&self) -> Option<&str> {
        self.from
            .as_ref()
            .map(|a| a.email.trim())
            .filter(|email| !email.is_empty())
    }

    /// Sender host used by the allow/deny filter
    pub fn sender_host(&self) -> Option<&str> {
        self.from.as_ref().and_then(|a| a.host())
    }

    /// Body rendered as plain text for prompting
    pub fn body_text(&self) -> String {
        match self.body_type {
            BodyType::Text => self.body.clone(),
            BodyType::Html => html2text::from_read(self.body.as_bytes(), 120)
                .unwrap_or_else(|_| self.body.clone()),
        }
    }

    /// Attach resolved inline images
    pub fn attach_inline_images(&mut self, images: BTreeMap<String, Vec<u8>>) {
        self.inline_images.extend(images);
    }

    /// Raw bytes of every resolved inline image, in content-id order
    pub fn image_bytes(&self) -> Vec<Vec<u8>> {
        self.inline_images.values().cloned().collect()
    }
}
