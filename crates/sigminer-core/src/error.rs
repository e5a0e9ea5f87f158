//! Error types for Sigminer

use thiserror::Error;

/// Result type alias using Sigminer's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Sigminer
#[derive(Error, Debug)]
pub enum Error {
    // Authentication errors
    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("No valid token for {account}, sign in again")]
    TokenExpired { account: String },

    #[error("Token refresh failed for {account}: {reason}")]
    TokenRefreshFailed { account: String, reason: String },

    #[error("Token storage error: {0}")]
    Token(String),

    // Mailbox errors
    #[error("Transport error: {status} from {url}: {body}")]
    Transport {
        status: u16,
        url: String,
        body: String,
    },

    #[error("Invalid mailbox response: {0}")]
    InvalidResponse(String),

    // Extraction errors
    #[error("Extraction error: {0}")]
    Extraction(String),

    #[error("Extraction rejected by {model}: {status} - {message}")]
    ExtractionRejected {
        model: String,
        status: u16,
        message: String,
    },

    // Contact store errors
    #[error("Malformed contact file {path}: {reason}")]
    MalformedStore { path: String, reason: String },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Preset not found: {0}")]
    PresetNotFound(String),

    // Run control
    #[error("Extraction run cancelled")]
    Cancelled,

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Generic errors
    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    /// Returns true if this error indicates the user needs to sign in again
    pub fn requires_reauth(&self) -> bool {
        matches!(
            self,
            Error::TokenExpired { .. } | Error::TokenRefreshFailed { .. }
        ) || matches!(self, Error::Transport { status: 401, .. })
    }

    /// Returns a stable error code for structured output
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Auth(_)
            | Error::TokenExpired { .. }
            | Error::TokenRefreshFailed { .. }
            | Error::Token(_) => "AUTH_ERROR",
            Error::Transport { .. } | Error::InvalidResponse(_) | Error::Http(_) => {
                "TRANSPORT_ERROR"
            }
            Error::Extraction(_) | Error::ExtractionRejected { .. } => "EXTRACTION_ERROR",
            Error::MalformedStore { .. } | Error::Csv(_) => "STORE_ERROR",
            Error::Config(_) | Error::InvalidConfig { .. } => "CONFIG_ERROR",
            Error::PresetNotFound(_) => "PRESET_NOT_FOUND",
            Error::Cancelled => "CANCELLED",
            _ => "INTERNAL_ERROR",
        }
    }

    /// Returns a user-friendly action message for recoverable errors
    pub fn action_hint(&self) -> Option<&'static str> {
        if self.requires_reauth() {
            return Some("Run `sigminer auth login` to sign in again");
        }
        match self {
            Error::InvalidConfig { .. } => Some("Check `sigminer config show` and your preset"),
            Error::PresetNotFound(_) => Some("List saved presets with `sigminer preset list`"),
            Error::ExtractionRejected { status: 401, .. } => {
                Some("Set a valid API key with `sigminer config set-api-key`")
            }
            Error::Transport { .. } | Error::Http(_) => Some("Check your network connection"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unauthorized_transport_requires_reauth() {
        let err = Error::Transport {
            status: 401,
            url: "https://graph.microsoft.com/v1.0/me/messages".to_string(),
            body: String::new(),
        };
        assert!(err.requires_reauth());
        assert_eq!(err.error_code(), "TRANSPORT_ERROR");

        let err = Error::Transport {
            status: 503,
            url: "https://graph.microsoft.com/v1.0/me/messages".to_string(),
            body: String::new(),
        };
        assert!(!err.requires_reauth());
        assert_eq!(err.action_hint(), Some("Check your network connection"));
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::Cancelled.error_code(), "CANCELLED");
        assert_eq!(
            Error::TokenExpired { account: "me".to_string() }.error_code(),
            "AUTH_ERROR"
        );
        assert_eq!(Error::Extraction("boom".to_string()).error_code(), "EXTRACTION_ERROR");
    }
}
