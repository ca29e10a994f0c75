//! Remote attachment download
//!
//! URLs are validated against a scheme and filename-extension allow-list
//! before any request is made. Accepted URLs are fetched concurrently under a
//! counting permit into a per-request scratch directory, size-checked, then
//! read back in request order.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::try_join_all;
use reqwest::{Client, Url};
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::errors::{AppError, AppResult};

/// Per-file and per-request attachment size cap
pub const MAX_ATTACHMENT_BYTES: u64 = 20 * 1024 * 1024;

/// Filename extensions accepted for download
const ALLOWED_EXTENSIONS: &[&str] = &[
    "zip", "txt", "docx", "png", "webp", "jpg", "jpeg", "pdf", "rtf",
];

/// Downloads one URL into a local file
#[async_trait]
pub trait AttachmentFetcher: Send + Sync {
    /// Stream the body of `url` into `destination`
    async fn fetch(&self, url: &Url, destination: &Path) -> AppResult<()>;
}

/// A URL accepted for download and the filename it will be attached under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentPlan {
    pub url: Url,
    pub filename: String,
}

/// Downloaded attachment ready to be placed into a MIME part
#[derive(Debug, Clone)]
pub struct DownloadedAttachment {
    pub filename: String,
    pub content_type: &'static str,
    pub bytes: Vec<u8>,
}

/// Validate a URL and derive its attachment filename
///
/// # Errors
///
/// `InvalidInput` when the URL is malformed, not http(s), has no filename,
/// contains a traversal segment, or carries an extension outside the
/// allow-list.
pub fn plan_attachment(raw: &str) -> AppResult<AttachmentPlan> {
    let url = Url::parse(raw.trim())
        .map_err(|e| AppError::InvalidInput(format!("invalid attachment URL '{raw}': {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(AppError::InvalidInput(format!(
            "attachment URL must use http or https: {raw}"
        )));
    }

    let segment = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or_default();
    let filename = urlencoding::decode(segment)
        .map_err(|e| AppError::InvalidInput(format!("undecodable filename in '{raw}': {e}")))?
        .into_owned();

    if filename.is_empty() || filename == "." {
        return Err(AppError::InvalidInput(format!(
            "attachment URL has no filename: {raw}"
        )));
    }
    if filename.contains("..") || filename.contains(['/', '\\', '\0']) {
        return Err(AppError::InvalidInput(format!(
            "attachment filename is not allowed: {filename}"
        )));
    }

    let extension = extension_of(&filename);
    if !ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
        return Err(AppError::InvalidInput(format!(
            "attachment file type not allowed: {filename}"
        )));
    }

    Ok(AttachmentPlan { url, filename })
}

/// MIME type inferred from the filename extension
pub fn mime_type_for(filename: &str) -> &'static str {
    match extension_of(filename).as_str() {
        "zip" => "application/zip",
        "txt" => "text/plain",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "png" => "image/png",
        "webp" => "image/webp",
        "jpg" | "jpeg" => "image/jpeg",
        "pdf" => "application/pdf",
        "rtf" => "application/rtf",
        _ => "application/octet-stream",
    }
}

fn extension_of(filename: &str) -> String {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default()
}

/// Per-request download directory
///
/// [`ScratchDir::remove`] deletes it without blocking the runtime. Drop only
/// covers a cancelled download that never reached `remove`.
struct ScratchDir {
    path: PathBuf,
    removed: bool,
}

impl ScratchDir {
    async fn create() -> AppResult<Self> {
        let path = std::env::temp_dir().join(format!("mailbox-relay-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| AppError::Internal(format!("cannot create scratch directory: {e}")))?;
        Ok(Self {
            path,
            removed: false,
        })
    }

    async fn remove(mut self) {
        if let Err(e) = tokio::fs::remove_dir_all(&self.path).await {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to remove scratch directory");
        }
        self.removed = true;
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to remove scratch directory");
        }
    }
}

/// Validate, download and size-check every attachment URL
///
/// At most `concurrency` fetches run at once. Results keep request order.
/// The first failure drops the remaining fetches. The scratch directory is
/// removed on every exit path; an empty URL list touches neither network nor
/// disk.
///
/// # Errors
///
/// - `InvalidInput` for any rejected URL (before any request)
/// - `AttachmentTooLarge` if one file or the total exceeds [`MAX_ATTACHMENT_BYTES`]
/// - fetcher errors as returned
pub async fn download_all(
    fetcher: &dyn AttachmentFetcher,
    urls: &[String],
    concurrency: usize,
) -> AppResult<Vec<DownloadedAttachment>> {
    let plans = urls
        .iter()
        .map(|url| plan_attachment(url))
        .collect::<AppResult<Vec<_>>>()?;
    if plans.is_empty() {
        return Ok(Vec::new());
    }

    let scratch = ScratchDir::create().await?;
    let result = download_into(fetcher, &scratch.path, plans, concurrency).await;
    scratch.remove().await;
    result
}

/// Fetch every planned attachment into `scratch`, then apply the size caps
async fn download_into(
    fetcher: &dyn AttachmentFetcher,
    scratch: &Path,
    plans: Vec<AttachmentPlan>,
    concurrency: usize,
) -> AppResult<Vec<DownloadedAttachment>> {
    let permits = Arc::new(Semaphore::new(concurrency.max(1)));

    let downloads = plans.iter().enumerate().map(|(index, plan)| {
        let permits = Arc::clone(&permits);
        let destination = scratch.join(format!("{index}-{}", plan.filename));
        async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|e| AppError::Internal(format!("download permit unavailable: {e}")))?;
            tracing::debug!(url = %plan.url, "fetching attachment");
            fetcher.fetch(&plan.url, &destination).await?;
            Ok::<_, AppError>(destination)
        }
    });
    let paths = try_join_all(downloads).await?;

    let mut total: u64 = 0;
    for (plan, path) in plans.iter().zip(&paths) {
        let size = tokio::fs::metadata(path)
            .await
            .map_err(|e| AppError::Internal(format!("cannot stat {}: {e}", plan.filename)))?
            .len();
        if size > MAX_ATTACHMENT_BYTES {
            return Err(AppError::AttachmentTooLarge(format!(
                "{} is {size} bytes; limit is {MAX_ATTACHMENT_BYTES}",
                plan.filename
            )));
        }
        total += size;
    }
    if total > MAX_ATTACHMENT_BYTES {
        return Err(AppError::AttachmentTooLarge(format!(
            "attachments total {total} bytes; limit is {MAX_ATTACHMENT_BYTES}"
        )));
    }

    let mut attachments = Vec::with_capacity(plans.len());
    for (plan, path) in plans.into_iter().zip(paths) {
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| AppError::Internal(format!("cannot read {}: {e}", plan.filename)))?;
        attachments.push(DownloadedAttachment {
            content_type: mime_type_for(&plan.filename),
            filename: plan.filename,
            bytes,
        });
    }
    tracing::info!(count = attachments.len(), total_bytes = total, "attachments downloaded");
    Ok(attachments)
}

/// HTTP(S) fetcher with a per-request timeout
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Build a fetcher whose requests each time out after `timeout`
    pub fn new(timeout: Duration) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Internal(format!("cannot build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

fn request_error(url: &Url, e: reqwest::Error) -> AppError {
    if e.is_timeout() {
        AppError::Timeout(format!("download of {url} timed out"))
    } else {
        AppError::Upstream(format!("download of {url} failed: {e}"))
    }
}

#[async_trait]
impl AttachmentFetcher for HttpFetcher {
    async fn fetch(&self, url: &Url, destination: &Path) -> AppResult<()> {
        let mut response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| request_error(url, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Upstream(format!(
                "attachment host returned {status} for {url}"
            )));
        }

        let mut file = tokio::fs::File::create(destination)
            .await
            .map_err(|e| AppError::Internal(format!("cannot create download file: {e}")))?;
        let mut written: u64 = 0;
        while let Some(chunk) = response.chunk().await.map_err(|e| request_error(url, e))? {
            written += chunk.len() as u64;
            // Stop streaming once over the cap; the size check reports it.
            if written > MAX_ATTACHMENT_BYTES {
                break;
            }
            file.write_all(&chunk)
                .await
                .map_err(|e| AppError::Internal(format!("cannot write download file: {e}")))?;
        }
        file.flush()
            .await
            .map_err(|e| AppError::Internal(format!("cannot flush download file: {e}")))?;

        if written > MAX_ATTACHMENT_BYTES {
            return Err(AppError::AttachmentTooLarge(format!(
                "{url} exceeds {MAX_ATTACHMENT_BYTES} bytes"
            )));
        }
        Ok(())
    }
}
