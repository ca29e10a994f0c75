//! Configuration module for the mailbox account and server settings
//!
//! All configuration is loaded from environment variables once at startup and
//! never mutated afterwards. Account settings use the `ACCOUNT_*` variables;
//! transport timeouts use `MAIL_*_TIMEOUT_MS`.

use std::env;
use std::env::VarError;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use lettre::Address;
use secrecy::SecretString;

use crate::errors::{AppError, AppResult};

/// Default location of the static signature block
pub const DEFAULT_SIGNATURE_PATH: &str = "config/signature.txt";

/// Mailbox account configuration
///
/// Holds SMTP/IMAP endpoints, credentials and the outgoing identity for the
/// single configured account. Passwords are stored using `SecretString` to
/// prevent accidental logging.
#[derive(Debug, Clone)]
pub struct MailboxConfig {
    /// SMTP server hostname
    pub smtp_host: String,
    /// SMTP server port (typically 587 for STARTTLS)
    pub smtp_port: u16,
    /// IMAP server hostname
    pub imap_host: String,
    /// IMAP server port (typically 993 for TLS)
    pub imap_port: u16,
    /// Account address, used as login and as the From address
    pub account_address: String,
    /// Password stored in a type that prevents accidental logging
    pub account_password: SecretString,
    /// Display name placed in front of the From address (may be empty)
    pub display_name: String,
    /// Optional Reply-To address for outgoing mail
    pub reply_to: Option<String>,
    /// Whether SMTP sessions are upgraded with STARTTLS
    pub start_tls: bool,
    /// Maximum number of attachment downloads in flight per send
    pub attachment_concurrency: usize,
    /// Static signature appended to every outgoing body (may be empty)
    pub signature_text: String,
    /// TCP connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// IMAP greeting/TLS handshake/login timeout in milliseconds
    pub greeting_timeout_ms: u64,
    /// Per-command IMAP I/O timeout in milliseconds
    pub socket_timeout_ms: u64,
    /// Per-download attachment timeout in milliseconds
    pub attachment_timeout_ms: u64,
}

/// Server-wide configuration
///
/// Wraps the mailbox snapshot and HTTP-boundary settings. Shared with request
/// handlers via `Arc`.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// The single configured mailbox
    pub mailbox: MailboxConfig,
    /// Bearer key required on every route when present
    pub api_key: Option<SecretString>,
}

impl ServerConfig {
    /// Load all configuration from environment variables
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if required environment variables are missing
    /// or malformed. The process must refuse to start in that case.
    ///
    /// # Example Environment
    ///
    /// ```text
    /// ACCOUNT_EMAIL=user@example.com
    /// ACCOUNT_PASSWORD=app-password
    /// ACCOUNT_SMTP_SERVER=smtp.example.com
    /// ACCOUNT_IMAP_SERVER=imap.example.com
    /// FROM_NAME=Example User
    /// API_KEY=secret
    /// ```
    pub fn load_from_env() -> AppResult<Self> {
        Self::load_with(|key| env::var(key))
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn load_with<F>(lookup: F) -> AppResult<Self>
    where
        F: Fn(&str) -> Result<String, VarError>,
    {
        let vars = Vars { lookup };

        let account_address = vars.required("ACCOUNT_EMAIL")?.trim().to_owned();
        validate_address("ACCOUNT_EMAIL", &account_address)?;
        let account_password = vars.required("ACCOUNT_PASSWORD")?;
        let smtp_host = vars.required("ACCOUNT_SMTP_SERVER")?.trim().to_owned();
        let imap_host = vars.required("ACCOUNT_IMAP_SERVER")?.trim().to_owned();

        let reply_to = vars
            .optional("ACCOUNT_REPLY_TO")?
            .map(|addr| addr.trim().to_owned());
        if let Some(addr) = &reply_to {
            validate_address("ACCOUNT_REPLY_TO", addr)?;
        }

        let attachment_concurrency = vars.parse_or("ATTACHMENT_CONCURRENCY", 3usize)?;
        if attachment_concurrency == 0 {
            return Err(AppError::InvalidInput(
                "ATTACHMENT_CONCURRENCY must be a positive integer".to_owned(),
            ));
        }

        let signature_path = vars
            .optional("SIGNATURE_PATH")?
            .map_or_else(|| PathBuf::from(DEFAULT_SIGNATURE_PATH), PathBuf::from);

        let mailbox = MailboxConfig {
            smtp_host,
            smtp_port: vars.parse_or("ACCOUNT_SMTP_PORT", 587u16)?,
            imap_host,
            imap_port: vars.parse_or("ACCOUNT_IMAP_PORT", 993u16)?,
            account_address,
            account_password: SecretString::new(account_password.into()),
            display_name: vars.optional("FROM_NAME")?.unwrap_or_default(),
            reply_to,
            start_tls: vars.bool_or("START_TLS", true)?,
            attachment_concurrency,
            signature_text: load_signature(&signature_path)?,
            connect_timeout_ms: vars.parse_or("MAIL_CONNECT_TIMEOUT_MS", 30_000u64)?,
            greeting_timeout_ms: vars.parse_or("MAIL_GREETING_TIMEOUT_MS", 15_000u64)?,
            socket_timeout_ms: vars.parse_or("MAIL_SOCKET_TIMEOUT_MS", 300_000u64)?,
            attachment_timeout_ms: vars.parse_or("ATTACHMENT_TIMEOUT_MS", 10_000u64)?,
        };

        Ok(Self {
            mailbox,
            api_key: vars
                .optional("API_KEY")?
                .map(|key| SecretString::new(key.into())),
        })
    }
}

/// Read the signature block, treating a missing file as an empty signature
pub fn load_signature(path: &Path) -> AppResult<String> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(text),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no signature file; using empty signature");
            Ok(String::new())
        }
        Err(e) => Err(AppError::Internal(format!(
            "cannot read signature file {}: {e}",
            path.display()
        ))),
    }
}

fn validate_address(key: &str, value: &str) -> AppResult<()> {
    value.parse::<Address>().map(|_| ()).map_err(|e| {
        AppError::InvalidInput(format!("{key} is not a valid email address: {e}"))
    })
}

/// Typed accessors over a variable lookup
struct Vars<F> {
    lookup: F,
}

impl<F> Vars<F>
where
    F: Fn(&str) -> Result<String, VarError>,
{
    /// Read a variable, mapping blank values to `None`
    fn optional(&self, key: &str) -> AppResult<Option<String>> {
        match (self.lookup)(key) {
            Ok(v) if v.trim().is_empty() => Ok(None),
            Ok(v) => Ok(Some(v)),
            Err(VarError::NotPresent) => Ok(None),
            Err(VarError::NotUnicode(_)) => Err(AppError::InvalidInput(format!(
                "environment variable {key} contains non-unicode data"
            ))),
        }
    }

    /// Read a required variable, returning error if missing or empty
    fn required(&self, key: &str) -> AppResult<String> {
        self.optional(key)?.ok_or_else(|| {
            AppError::InvalidInput(format!("missing required environment variable {key}"))
        })
    }

    /// Parse a numeric variable with default fallback
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the variable is set but does not parse.
    fn parse_or<T: std::str::FromStr>(&self, key: &str, default: T) -> AppResult<T> {
        match self.optional(key)? {
            Some(v) => v.trim().parse::<T>().map_err(|_| {
                AppError::InvalidInput(format!("invalid numeric environment variable {key}: '{v}'"))
            }),
            None => Ok(default),
        }
    }

    /// Parse a boolean variable with flexible values
    ///
    /// Accepts: `1`, `true`, `yes`, `y`, `on` (truthy) or `0`, `false`, `no`,
    /// `n`, `off` (falsy). Case-insensitive. Returns `default` if unset.
    fn bool_or(&self, key: &str, default: bool) -> AppResult<bool> {
        match self.optional(key)? {
            Some(v) => parse_bool_value(&v).ok_or_else(|| {
                AppError::InvalidInput(format!("invalid boolean environment variable {key}: '{v}'"))
            }),
            None => Ok(default),
        }
    }
}

fn parse_bool_value(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}
