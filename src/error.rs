// src/error.rs

//! Unified error handling for the indexer.

use std::fmt;

use thiserror::Error;

/// Result type alias for indexer operations.
pub type Result<T> = std::result::Result<T, AppError>;

/// Unified application error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing failed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// URL parsing failed
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Data validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// An upstream service answered badly or not at all
    #[error("Upstream error for {context}: {message}")]
    Upstream { context: String, message: String },

    /// No rule in the active set matched. The catch-all rule is missing.
    #[error("No restriction rule matches '{url}'")]
    NoMatchingRule { url: String },

    /// Rules could not be refreshed and evaluation is locked down
    #[error("Restriction rules are out of date: {0}")]
    RulesOutOfDate(String),

    /// A rule reconciliation run was aborted
    #[error("Reconciliation aborted: {0}")]
    Reconcile(String),

    /// A single document failed inside a pipeline stage
    #[error("{stage} stage failed for {doc_id}: {message}")]
    Stage {
        doc_id: String,
        stage: String,
        message: String,
    },
}

impl AppError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create an upstream error with context.
    pub fn upstream(context: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Upstream {
            context: context.into(),
            message: message.to_string(),
        }
    }

    /// Create a missing-rule error.
    pub fn no_matching_rule(url: impl Into<String>) -> Self {
        Self::NoMatchingRule { url: url.into() }
    }

    /// Create a rules-out-of-date error.
    pub fn rules_out_of_date(message: impl Into<String>) -> Self {
        Self::RulesOutOfDate(message.into())
    }

    /// Create a reconciliation error.
    pub fn reconcile(message: impl fmt::Display) -> Self {
        Self::Reconcile(message.to_string())
    }

    /// Create a stage error for one document.
    pub fn stage(
        doc_id: impl Into<String>,
        stage: impl fmt::Display,
        message: impl fmt::Display,
    ) -> Self {
        Self::Stage {
            doc_id: doc_id.into(),
            stage: stage.to_string(),
            message: message.to_string(),
        }
    }

    /// Whether the failure came from the network or disk and is worth a
    /// short pause and retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Http(_) | Self::Upstream { .. })
    }

    /// Whether the failure means the rule set cannot be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::NoMatchingRule { .. } | Self::RulesOutOfDate(_))
    }
}
