//! Outbound message composition and SMTP delivery
//!
//! [`Composer`] turns an [`OutgoingMessage`] into a MIME document using the
//! account's identity, downloads any remote attachments and hands the result
//! to a [`MailTransport`]. Reply and forward derivation from a fetched
//! message also lives here.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::{ContentTransferEncoding, ContentType, HeaderName, HeaderValue};
use lettre::message::{Attachment, Body, Mailbox, MessageBuilder, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use secrecy::ExposeSecret;

use crate::attachments::{self, AttachmentFetcher, DownloadedAttachment};
use crate::config::MailboxConfig;
use crate::errors::{AppError, AppResult};
use crate::mime::MessageContent;
use crate::models::{OutgoingMessage, ThreadedEmailRequest};

/// Delivers a finished message
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, message: Message) -> AppResult<()>;
}

/// SMTP delivery through `lettre`
///
/// Uses STARTTLS on the configured port when enabled, implicit TLS otherwise.
/// Every send opens and closes its own connection.
#[derive(Clone)]
pub struct SmtpTransport {
    inner: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpTransport {
    /// Build the transport from mailbox settings
    ///
    /// # Errors
    ///
    /// - `InvalidInput` if the SMTP host cannot be used for TLS
    pub fn new(config: &MailboxConfig) -> AppResult<Self> {
        let builder = if config.start_tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_host)
        }
        .map_err(|e| AppError::InvalidInput(format!("invalid SMTP host: {e}")))?;

        let credentials = Credentials::new(
            config.account_address.clone(),
            config.account_password.expose_secret().to_owned(),
        );
        let inner = builder
            .port(config.smtp_port)
            .credentials(credentials)
            .timeout(Some(Duration::from_millis(config.socket_timeout_ms)))
            .build();
        Ok(Self { inner })
    }
}

#[async_trait]
impl MailTransport for SmtpTransport {
    async fn send(&self, message: Message) -> AppResult<()> {
        self.inner.send(message).await.map(|_| ()).map_err(|e| {
            let code = e.status().map(|code| code.to_string());
            if matches!(code.as_deref(), Some("535" | "534" | "530")) {
                AppError::AuthFailed(format!("SMTP authentication failed: {e}"))
            } else if e.is_timeout() {
                AppError::Timeout(format!("SMTP send timed out: {e}"))
            } else {
                AppError::Upstream(format!("SMTP send failed: {e}"))
            }
        })
    }
}

/// Builds and sends outgoing mail for the configured account
#[derive(Clone)]
pub struct Composer {
    config: Arc<MailboxConfig>,
    fetcher: Arc<dyn AttachmentFetcher>,
    transport: Arc<dyn MailTransport>,
}

impl Composer {
    pub fn new(
        config: Arc<MailboxConfig>,
        fetcher: Arc<dyn AttachmentFetcher>,
        transport: Arc<dyn MailTransport>,
    ) -> Self {
        Self {
            config,
            fetcher,
            transport,
        }
    }

    /// Compose and deliver a message
    ///
    /// The HTML body is `body` followed by the signature. Attachments are
    /// downloaded and size-checked before the transport is touched, so a
    /// rejected attachment never results in an SMTP session.
    ///
    /// # Errors
    ///
    /// - `InvalidInput` for shape violations or rejected attachment URLs
    /// - `AttachmentTooLarge` when a size cap is exceeded
    /// - transport errors as returned by [`MailTransport::send`]
    pub async fn send(&self, message: &OutgoingMessage) -> AppResult<()> {
        message.validate()?;
        let downloaded = attachments::download_all(
            self.fetcher.as_ref(),
            &message.attachment_urls,
            self.config.attachment_concurrency,
        )
        .await?;

        let email = self.build_message(message, &downloaded)?;
        self.transport.send(email).await?;
        tracing::info!(
            recipients = message.recipients.len(),
            attachments = downloaded.len(),
            "message sent"
        );
        Ok(())
    }

    /// Build the MIME message delivered by [`Composer::send`]
    pub fn build_message(
        &self,
        message: &OutgoingMessage,
        downloaded: &[DownloadedAttachment],
    ) -> AppResult<Message> {
        let body = format!("{}{}", message.body, self.config.signature_text);
        let mut parts = MultiPart::mixed().singlepart(SinglePart::html(body));
        for attachment in downloaded {
            let content_type = ContentType::parse(attachment.content_type).map_err(|e| {
                AppError::Internal(format!("bad content type {}: {e}", attachment.content_type))
            })?;
            let encoded = Body::new_with_encoding(
                attachment.bytes.clone(),
                ContentTransferEncoding::Base64,
            )
            .map_err(|_| AppError::Internal("cannot base64-encode attachment".to_owned()))?;
            parts = parts.singlepart(
                Attachment::new(attachment.filename.clone()).body(encoded, content_type),
            );
        }

        let extra = extra_headers(message)?;
        let mut email = self
            .headers(message)?
            .multipart(parts)
            .map_err(|e| AppError::Internal(format!("failed to build message: {e}")))?;
        for header in extra {
            email.headers_mut().insert_raw(header);
        }
        Ok(email)
    }

    /// Format a draft: HTML body only, no signature and no attachments
    pub fn build_draft(&self, message: &OutgoingMessage) -> AppResult<Vec<u8>> {
        message.validate()?;
        let extra = extra_headers(message)?;
        let mut draft = self
            .headers(message)?
            .singlepart(SinglePart::html(message.body.clone()))
            .map_err(|e| AppError::Internal(format!("failed to build draft: {e}")))?;
        for header in extra {
            draft.headers_mut().insert_raw(header);
        }
        Ok(draft.formatted())
    }

    /// From, To, Subject and Reply-To
    fn headers(&self, message: &OutgoingMessage) -> AppResult<MessageBuilder> {
        let address: Address = self
            .config
            .account_address
            .parse()
            .map_err(|e| AppError::Internal(format!("invalid account address: {e}")))?;
        let display_name =
            Some(self.config.display_name.clone()).filter(|name| !name.trim().is_empty());

        let mut builder = Message::builder()
            .from(Mailbox::new(display_name, address))
            .subject(message.subject.clone());

        for recipient in &message.recipients {
            let to: Address = recipient.parse().map_err(|e| {
                AppError::InvalidInput(format!("invalid recipient address '{recipient}': {e}"))
            })?;
            builder = builder.to(Mailbox::new(None, to));
        }

        if let Some(reply_to) = &self.config.reply_to {
            let reply_to: Address = reply_to
                .parse()
                .map_err(|e| AppError::Internal(format!("invalid reply-to address: {e}")))?;
            builder = builder.reply_to(Mailbox::new(None, reply_to));
        }

        Ok(builder)
    }
}

/// Validate and convert caller-supplied headers
///
/// # Errors
///
/// `InvalidInput` for an invalid header name or a value containing CR/LF.
fn extra_headers(message: &OutgoingMessage) -> AppResult<Vec<HeaderValue>> {
    message
        .extra_headers
        .iter()
        .map(|(name, value)| {
            if value.contains(['\r', '\n']) {
                return Err(AppError::InvalidInput(format!(
                    "header {name} must not contain line breaks"
                )));
            }
            let header_name = HeaderName::new_from_ascii(name.clone())
                .map_err(|_| AppError::InvalidInput(format!("invalid header name '{name}'")))?;
            Ok(HeaderValue::new(header_name, value.clone()))
        })
        .collect()
}

/// Threading headers pointing at the original message
fn threading_headers(original: &MessageContent) -> Vec<(String, String)> {
    original
        .message_id
        .iter()
        .flat_map(|id| {
            [
                ("In-Reply-To".to_owned(), id.clone()),
                ("References".to_owned(), id.clone()),
            ]
        })
        .collect()
}

/// Derive a reply to `original`
///
/// Subject defaults to `Re: <original subject>` and the body to the original
/// text body.
pub fn reply_message(
    original: &MessageContent,
    request: &ThreadedEmailRequest,
) -> AppResult<OutgoingMessage> {
    let subject = match request.subject() {
        Some(subject) => subject.to_owned(),
        None if original.subject.to_ascii_lowercase().starts_with("re:") => {
            original.subject.clone()
        }
        None => format!("Re: {}", original.subject),
    };
    let body = request
        .body()
        .map(str::to_owned)
        .unwrap_or_else(|| original.text_body());

    let message = OutgoingMessage {
        recipients: request.recipients(),
        subject,
        body,
        attachment_urls: request.file_urls.clone().unwrap_or_default(),
        extra_headers: threading_headers(original).into_iter().collect(),
    };
    message.validate()?;
    Ok(message)
}

/// Derive a forward of `original`
///
/// The request body, when present, is placed above the original text body.
/// Subject defaults to the original subject.
pub fn forward_message(
    original: &MessageContent,
    request: &ThreadedEmailRequest,
) -> AppResult<OutgoingMessage> {
    let original_body = original.text_body();
    let body = match request.body() {
        Some(intro) => format!("{intro}\n\n{original_body}"),
        None => original_body,
    };

    let message = OutgoingMessage {
        recipients: request.recipients(),
        subject: request
            .subject()
            .map(str::to_owned)
            .unwrap_or_else(|| original.subject.clone()),
        body,
        attachment_urls: request.file_urls.clone().unwrap_or_default(),
        extra_headers: threading_headers(original).into_iter().collect(),
    };
    message.validate()?;
    Ok(message)
}
