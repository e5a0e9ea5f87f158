//! Sigminer Core Library
//!
//! Pulls messages from a Microsoft Graph mailbox, asks an LLM to extract
//! configured metadata fields from each one and merges the answers into a
//! CSV contact list.

pub mod auth;
pub mod config;
pub mod error;
pub mod extraction;
pub mod llm;
pub mod mail;
pub mod models;
pub mod rate_limiter;
pub mod store;

pub use config::Config;
pub use error::{Error, Result};
pub use models::*;

/// Application name for config paths
pub const APP_NAME: &str = "sigminer";

/// Column that keys every contact row
pub const EMAIL_ADDRESS_COLUMN: &str = "email_address";
