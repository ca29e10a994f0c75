//! Input/output DTOs
//!
//! Defines the request bodies, query strings and response payloads of the
//! HTTP surface, plus the request-side `OutgoingMessage` consumed by the
//! composer.

use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset};
use lettre::Address;
use serde::{Deserialize, Deserializer, Serialize};

use crate::errors::{AppError, AppResult};

/// Maximum subject length in characters
const MAX_SUBJECT_CHARS: usize = 255;

/// Message summary for folder listings
///
/// Built from the header section and flags only; never holds the body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageSummary {
    /// Message UID within the folder
    pub uid: String,
    /// Decoded Subject header (empty when absent)
    pub subject: String,
    /// Bare sender address, display name stripped
    #[serde(rename = "from")]
    pub sender_address: Option<String>,
    /// Parsed Date header; absent when missing or malformed
    #[serde(rename = "date")]
    pub sent_at: Option<DateTime<FixedOffset>>,
    /// Whether the `\Seen` flag is set
    pub seen: bool,
}

/// A validated message ready for composition
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutgoingMessage {
    /// Recipient addresses (at least one)
    pub recipients: Vec<String>,
    /// Subject line (1..=255 characters)
    pub subject: String,
    /// HTML body (non-empty)
    pub body: String,
    /// Remote files to download and attach
    pub attachment_urls: Vec<String>,
    /// Headers applied after the standard ones, e.g. `In-Reply-To`
    pub extra_headers: BTreeMap<String, String>,
}

impl OutgoingMessage {
    /// Check recipients, subject and body shape
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` describing the first violated rule.
    pub fn validate(&self) -> AppResult<()> {
        if self.recipients.is_empty() {
            return Err(AppError::invalid("at least one recipient is required"));
        }
        for addr in &self.recipients {
            addr.parse::<Address>().map_err(|e| {
                AppError::InvalidInput(format!("invalid recipient address '{addr}': {e}"))
            })?;
        }

        let subject_chars = self.subject.chars().count();
        if subject_chars == 0 || subject_chars > MAX_SUBJECT_CHARS {
            return Err(AppError::InvalidInput(format!(
                "subject must be 1..{MAX_SUBJECT_CHARS} characters"
            )));
        }
        if self.subject.contains(['\r', '\n']) {
            return Err(AppError::invalid("subject must not contain line breaks"));
        }
        if self.body.is_empty() {
            return Err(AppError::invalid("body must not be empty"));
        }
        Ok(())
    }
}

/// Input: send a new message or store a draft
#[derive(Debug, Clone, Deserialize)]
pub struct SendEmailRequest {
    /// Recipient email addresses
    pub to_addresses: Vec<String>,
    /// Subject of the email
    pub subject: String,
    /// HTML body of the email
    pub body: String,
    /// URLs of files to download and attach (list or comma-separated string)
    #[serde(default, deserialize_with = "deserialize_file_urls")]
    pub file_urls: Option<Vec<String>>,
}

impl SendEmailRequest {
    /// Convert into a validated `OutgoingMessage`
    pub fn into_outgoing(self) -> AppResult<OutgoingMessage> {
        let message = OutgoingMessage {
            recipients: trim_all(self.to_addresses),
            subject: self.subject,
            body: self.body,
            attachment_urls: self.file_urls.unwrap_or_default(),
            extra_headers: BTreeMap::new(),
        };
        message.validate()?;
        Ok(message)
    }
}

/// Input: reply to or forward an existing message
///
/// Subject and body fall back to the original message when absent.
#[derive(Debug, Clone, Deserialize)]
pub struct ThreadedEmailRequest {
    /// Recipient email addresses
    pub to_addresses: Vec<String>,
    /// Subject override
    #[serde(default)]
    pub subject: Option<String>,
    /// Body text to send (reply) or prepend (forward)
    #[serde(default)]
    pub body: Option<String>,
    /// URLs of files to download and attach
    #[serde(default, deserialize_with = "deserialize_file_urls")]
    pub file_urls: Option<Vec<String>>,
}

impl ThreadedEmailRequest {
    /// Subject override, treating blank as absent
    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref().filter(|s| !s.is_empty())
    }

    /// Body text, treating blank as absent
    pub fn body(&self) -> Option<&str> {
        self.body.as_deref().filter(|s| !s.is_empty())
    }

    /// Trimmed recipient list
    pub fn recipients(&self) -> Vec<String> {
        trim_all(self.to_addresses.clone())
    }
}

/// Query: list message summaries
#[derive(Debug, Clone, Deserialize)]
pub struct ListEmailsQuery {
    /// Mail folder to read from
    #[serde(default = "default_folder")]
    pub folder: String,
    /// Maximum number of emails to return (must be > 0)
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Only fetch unread emails
    #[serde(default)]
    pub unread: bool,
}

/// Query: operations scoped to one folder
#[derive(Debug, Clone, Deserialize)]
pub struct FolderQuery {
    /// Folder containing the email
    #[serde(default = "default_folder")]
    pub folder: String,
}

/// Query: move a message
#[derive(Debug, Clone, Deserialize)]
pub struct MoveQuery {
    /// Destination folder
    pub folder: String,
    /// Source folder
    #[serde(default = "default_folder")]
    pub source_folder: String,
}

/// Human-readable confirmation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageResponse {
    /// Response message
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Folder listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FoldersResponse {
    /// Folder names as reported by the server
    pub folders: Vec<String>,
}

/// Full message read-out
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailBody {
    /// Plain-text body
    pub body: String,
    /// Decoded Subject header
    pub subject: String,
    /// Bare sender address
    pub from: Option<String>,
    /// Message-ID header
    pub message_id: Option<String>,
    /// Parsed Date header
    pub date: Option<DateTime<FixedOffset>>,
    /// Sanitized HTML body, when the message has one
    pub html: Option<String>,
}

/// Default value for folder fields
pub fn default_folder() -> String {
    "INBOX".to_owned()
}

/// Default value for `limit` in listings
fn default_limit() -> usize {
    10
}

fn trim_all(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
        .collect()
}

/// Accept `file_urls` as a list or as one comma-separated string
fn deserialize_file_urls<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        One(String),
        Many(Vec<String>),
    }

    let urls = match Option::<Raw>::deserialize(deserializer)? {
        None => return Ok(None),
        Some(Raw::One(joined)) => joined
            .split(',')
            .map(|u| u.trim().to_owned())
            .filter(|u| !u.is_empty())
            .collect::<Vec<_>>(),
        Some(Raw::Many(list)) => trim_all(list),
    };
    Ok((!urls.is_empty()).then_some(urls))
}
