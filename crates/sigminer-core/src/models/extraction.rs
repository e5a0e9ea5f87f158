//! Extraction presets and answers

use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::EMAIL_ADDRESS_COLUMN;

/// Values that mean "nothing was extracted" in exported CSVs and model answers.
///
/// Kept for compatibility with files written by earlier versions; inside the
/// crate absence is always an `Option::None` produced by [`normalize_value`].
pub const ABSENT_SENTINELS: [&str; 3] = ["", "0", "null"];

/// Map a raw stored or returned value to `None` when it is an absent sentinel
pub fn normalize_value(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    if ABSENT_SENTINELS.contains(&trimmed) {
        None
    } else {
        Some(raw)
    }
}

/// One metadata field to extract from every email
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldConfig {
    /// Identifier and CSV column name
    #[serde(deserialize_with = "trimmed")]
    pub field_name: String,

    /// Free-text instruction narrowing how the field is extracted
    #[serde(default)]
    pub guideline: String,

    /// Whether an existing value may be replaced by a fresh extraction
    #[serde(default)]
    pub can_be_overwritten: bool,
}

impl FieldConfig {
    pub fn new(field_name: impl Into<String>, guideline: impl Into<String>) -> Self {
        let field_name: String = field_name.into();
        Self {
            field_name: field_name.trim().to_string(),
            guideline: guideline.into(),
            can_be_overwritten: false,
        }
    }

    pub fn overwritable(mut self) -> Self {
        self.can_be_overwritten = true;
        self
    }
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

fn trimmed<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    let raw = String::deserialize(deserializer)?;
    Ok(raw.trim().to_string())
}

/// Accepts a count, a numeric string, `""` or `null`; the desktop app stored
/// the text of its input box verbatim.
fn email_cap<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<usize>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Cap {
        Count(usize),
        Text(String),
    }

    match Option::<Cap>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Cap::Count(count)) => Ok(Some(count)),
        Some(Cap::Text(text)) => {
            let text = text.trim();
            if text.is_empty() {
                return Ok(None);
            }
            text.parse()
                .map(Some)
                .map_err(|_| de::Error::custom(format!("invalid max_emails '{}'", text)))
        }
    }
}

/// Everything one extraction run needs. Saved by name as a preset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LauncherConfig {
    /// Fields to extract, in column order
    #[serde(default)]
    pub fields: Vec<FieldConfig>,

    /// Hosts for the allow/deny filter
    #[serde(default)]
    pub excluded_hosts: BTreeSet<String>,

    /// true = only listed hosts are processed, false = listed hosts are skipped
    #[serde(default)]
    pub include_mode: bool,

    /// Destination CSV, checked by [`LauncherConfig::validate`] before a run
    #[serde(default)]
    pub file_path: PathBuf,

    /// Cap on fetched emails, `None` or 0 for no cap
    #[serde(default, deserialize_with = "email_cap")]
    pub max_emails: Option<usize>,

    /// LLM model identifier
    #[serde(default = "default_model")]
    pub model: String,
}

impl LauncherConfig {
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        Self {
            fields: Vec::new(),
            excluded_hosts: BTreeSet::new(),
            include_mode: false,
            file_path: file_path.into(),
            max_emails: None,
            model: default_model(),
        }
    }

    /// Effective email cap (0 means unbounded)
    pub fn email_limit(&self) -> Option<usize> {
        self.max_emails.filter(|max| *max > 0)
    }

    /// Field names in configured order
    pub fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.field_name.clone()).collect()
    }

    /// Whether an email from `host` should be skipped by the allow/deny policy
    pub fn skips_host(&self, host: &str) -> bool {
        if self.excluded_hosts.is_empty() {
            return false;
        }
        let listed = self
            .excluded_hosts
            .iter()
            .any(|h| h.trim().eq_ignore_ascii_case(host.trim()));
        if self.include_mode {
            !listed
        } else {
            listed
        }
    }

    /// Reject presets that cannot produce a sensible export
    pub fn validate(&self) -> Result<()> {
        if self.fields.is_empty() {
            return Err(Error::InvalidConfig {
                field: "fields".to_string(),
                reason: "at least one field is required".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for field in &self.fields {
            let name = field.field_name.as_str();
            if name.trim().is_empty() {
                return Err(Error::InvalidConfig {
                    field: "fields".to_string(),
                    reason: "field names must not be empty".to_string(),
                });
            }
            if name.trim() != name {
                return Err(Error::InvalidConfig {
                    field: "fields".to_string(),
                    reason: format!("field name '{}' has surrounding whitespace", name),
                });
            }
            if name == EMAIL_ADDRESS_COLUMN {
                return Err(Error::InvalidConfig {
                    field: "fields".to_string(),
                    reason: format!("'{}' is reserved for the sender address", EMAIL_ADDRESS_COLUMN),
                });
            }
            if !seen.insert(name) {
                return Err(Error::InvalidConfig {
                    field: "fields".to_string(),
                    reason: format!("duplicate field '{}'", name),
                });
            }
        }

        if self.file_path.as_os_str().is_empty() {
            return Err(Error::InvalidConfig {
                field: "file_path".to_string(),
                reason: "a destination CSV path is required".to_string(),
            });
        }

        if self.model.trim().is_empty() {
            return Err(Error::InvalidConfig {
                field: "model".to_string(),
                reason: "a model identifier is required".to_string(),
            });
        }

        Ok(())
    }
}

/// Structured answer returned by the model for one (email, field) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionAnswer {
    /// Rationale, requested to improve answers but never exported
    #[serde(rename = "thoughtProcess", default)]
    pub thought_process: String,

    /// Extracted value or the literal "null"
    pub answer: String,
}

impl ExtractionAnswer {
    /// The answer, or `None` when the model reported nothing usable
    pub fn value(&self) -> Option<&str> {
        normalize_value(&self.answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn preset(hosts: &[&str], include_mode: bool) -> LauncherConfig {
        let mut config = LauncherConfig::new("contacts.csv");
        config.fields.push(FieldConfig::new("company", "Company of the sender"));
        config.excluded_hosts = hosts.iter().map(|h| h.to_string()).collect();
        config.include_mode = include_mode;
        config
    }

    #[test]
    fn test_sentinels_are_absent() {
        for raw in ["", "0", "null", " null "] {
            assert_eq!(normalize_value(raw), None, "{raw:?} should be absent");
        }
        assert_eq!(normalize_value("Acme"), Some("Acme"));
        assert_eq!(normalize_value("00"), Some("00"));
    }

    #[test]
    fn test_deny_list() {
        let config = preset(&["gmail.com"], false);
        assert!(config.skips_host("gmail.com"));
        assert!(!config.skips_host("biolevate.com"));
    }

    #[test]
    fn test_allow_list() {
        let config = preset(&["gmail.com"], true);
        assert!(!config.skips_host("gmail.com"));
        assert!(config.skips_host("biolevate.com"));
    }

    #[test]
    fn test_empty_host_set_keeps_everything() {
        let config = preset(&[], true);
        assert!(!config.skips_host("anything.org"));
    }

    #[test]
    fn test_email_limit_zero_is_unbounded() {
        let mut config = preset(&[], false);
        config.max_emails = Some(0);
        assert_eq!(config.email_limit(), None);
        config.max_emails = Some(25);
        assert_eq!(config.email_limit(), Some(25));
    }

    #[test]
    fn test_validate() {
        assert!(preset(&[], false).validate().is_ok());

        let mut config = preset(&[], false);
        config.fields.push(FieldConfig::new("company", "again"));
        assert!(matches!(config.validate(), Err(Error::InvalidConfig { .. })));

        let mut config = preset(&[], false);
        config.fields = vec![FieldConfig::new(EMAIL_ADDRESS_COLUMN, "")];
        assert!(config.validate().is_err());

        let mut config = preset(&[], false);
        config.fields.clear();
        assert!(config.validate().is_err());

        let mut config = preset(&[], false);
        config.file_path = PathBuf::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_field_names_are_trimmed() {
        assert_eq!(FieldConfig::new(" company ", "").field_name, "company");

        let field: FieldConfig = serde_json::from_str(r#"{"field_name": "company "}"#).unwrap();
        assert_eq!(field.field_name, "company");

        let mut config = preset(&[], false);
        config.fields.push(FieldConfig {
            field_name: "company ".to_string(),
            guideline: String::new(),
            can_be_overwritten: false,
        });
        assert!(matches!(config.validate(), Err(Error::InvalidConfig { .. })));

        let mut config = preset(&[], false);
        config.fields = vec![FieldConfig {
            field_name: " job_title".to_string(),
            guideline: String::new(),
            can_be_overwritten: false,
        }];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_max_emails_accepts_text() {
        let parse = |raw: &str| -> LauncherConfig {
            serde_json::from_str(&format!(
                r#"{{"fields": [], "file_path": "c.csv", "max_emails": {}}}"#,
                raw
            ))
            .unwrap()
        };
        assert_eq!(parse(r#""""#).max_emails, None);
        assert_eq!(parse(r#"" 100 ""#).max_emails, Some(100));
        assert_eq!(parse("100").max_emails, Some(100));
        assert_eq!(parse("null").max_emails, None);
        assert_eq!(parse(r#""0""#).email_limit(), None);

        let bad = serde_json::from_str::<LauncherConfig>(r#"{"file_path": "c.csv", "max_emails": "lots"}"#);
        assert!(bad.is_err());
    }

    #[test]
    fn test_missing_file_path_loads() {
        let config: LauncherConfig =
            serde_json::from_str(r#"{"fields": [{"field_name": "company"}]}"#).unwrap();
        assert!(config.file_path.as_os_str().is_empty());
        assert_eq!(config.max_emails, None);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_preset_json_shape() {
        let json = r#"{
            "fields": [{"field_name": "company", "guideline": "Legal name", "can_be_overwritten": true}],
            "excluded_hosts": ["gmail.com"],
            "include_mode": false,
            "file_path": "/tmp/contacts.csv",
            "max_emails": 50,
            "model": "gpt-4o-mini"
        }"#;
        let config: LauncherConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.fields[0], FieldConfig::new("company", "Legal name").overwritable());
        assert_eq!(config.email_limit(), Some(50));
        assert_eq!(config.model, "gpt-4o-mini");
    }

    #[test]
    fn test_answer_value() {
        let answer: ExtractionAnswer =
            serde_json::from_str(r#"{"thoughtProcess": "signature block", "answer": "null"}"#)
                .unwrap();
        assert_eq!(answer.value(), None);
    }
}
