//! Contact rows accumulated across runs

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{normalize_value, FieldConfig};
use crate::EMAIL_ADDRESS_COLUMN;

/// One row of the exported contact list, keyed by sender address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    email_address: String,

    /// Every other column, stored exactly as read or extracted
    #[serde(flatten)]
    values: BTreeMap<String, String>,
}

impl Contact {
    /// Create an empty row for a sender
    pub fn new(email_address: impl Into<String>) -> Self {
        Self {
            email_address: email_address.into(),
            values: BTreeMap::new(),
        }
    }

    /// Build a row from CSV headers and one record. Returns `None` when the
    /// record has no sender address.
    pub fn from_record<'a>(
        headers: impl IntoIterator<Item = &'a str>,
        record: impl IntoIterator<Item = &'a str>,
    ) -> Option<Self> {
        let mut email_address = None;
        let mut values = BTreeMap::new();
        for (header, value) in headers.into_iter().zip(record) {
            if header == EMAIL_ADDRESS_COLUMN {
                email_address = Some(value.trim().to_string());
            } else {
                values.insert(header.to_string(), value.to_string());
            }
        }
        email_address
            .filter(|address| !address.is_empty())
            .map(|email_address| Self { email_address, values })
    }

    pub fn email_address(&self) -> &str {
        &self.email_address
    }

    /// Value of a column, `None` when missing or an absent sentinel
    pub fn get(&self, column: &str) -> Option<&str> {
        if column == EMAIL_ADDRESS_COLUMN {
            return Some(&self.email_address);
        }
        self.values.get(column).and_then(|v| normalize_value(v))
    }

    /// Stored text of a column, sentinels included
    pub fn raw(&self, column: &str) -> Option<&str> {
        if column == EMAIL_ADDRESS_COLUMN {
            return Some(&self.email_address);
        }
        self.values.get(column).map(String::as_str)
    }

    /// Set a column. The sender address is fixed at creation and is never
    /// replaced; returns false if that was attempted.
    pub fn set(&mut self, column: impl Into<String>, value: impl Into<String>) -> bool {
        let column = column.into();
        if column == EMAIL_ADDRESS_COLUMN {
            return false;
        }
        self.values.insert(column, value.into());
        true
    }

    /// Whether this field should be sent to the model for this row
    pub fn needs_extraction(&self, field: &FieldConfig) -> bool {
        field.can_be_overwritten || self.get(&field.field_name).is_none()
    }

    /// Column names present on this row, sender address first
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        std::iter::once(EMAIL_ADDRESS_COLUMN).chain(self.values.keys().map(String::as_str))
    }

    /// Cells for the given header order, empty where a column is missing
    pub fn to_row(&self, fieldnames: &[String]) -> Vec<String> {
        fieldnames
            .iter()
            .map(|name| self.raw(name).unwrap_or_default().to_string())
            .collect()
    }
}
