//! IMAP transport and mailbox operations
//!
//! Provides timeout-bounded wrappers around `async-imap` operations and the
//! [`ImapMailbox`] implementation of [`Mailbox`]. Every operation opens a fresh
//! TLS session, performs one unit of work and logs out on every exit path.
//! Everything after the TLS handshake is generic over the stream.

use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_imap::error::Error as ImapError;
use async_imap::types::{Fetch, Flag, Name};
use async_imap::{Client, Session};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use rustls::ClientConfig;
use rustls::RootCertStore;
use rustls_pki_types::ServerName;
use secrecy::ExposeSecret;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use crate::config::MailboxConfig;
use crate::errors::{AppError, AppResult};
use crate::mime::{self, MessageContent};
use crate::models::MessageSummary;

/// Type alias for authenticated IMAP session over TLS
pub type ImapSession = Session<tokio_rustls::client::TlsStream<TcpStream>>;

/// Byte stream an IMAP session can run over
pub trait ImapStream: AsyncRead + AsyncWrite + Unpin + Debug + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Debug + Send> ImapStream for T {}

/// Mailbox operations over the configured account
///
/// Each call authenticates, runs its command sequence and closes the session
/// before returning.
#[async_trait]
pub trait Mailbox: Send + Sync {
    /// List folder display names
    async fn list_folders(&self) -> AppResult<Vec<String>>;

    /// Summarize at most `limit` of the highest-UID messages in `folder`
    async fn fetch_summaries(
        &self,
        folder: &str,
        limit: usize,
        unread_only: bool,
    ) -> AppResult<Vec<MessageSummary>>;

    /// Fetch and parse one complete message
    async fn fetch_full_message(&self, uid: u32, folder: &str) -> AppResult<MessageContent>;

    /// Copy to `destination_folder`, mark deleted, expunge `source_folder`
    async fn move_message(
        &self,
        uid: u32,
        source_folder: &str,
        destination_folder: &str,
    ) -> AppResult<()>;

    /// Mark deleted and expunge
    async fn delete_message(&self, uid: u32, folder: &str) -> AppResult<()>;

    /// Append a formatted message to `folder` as a draft
    async fn append_draft(&self, folder: &str, message: &[u8]) -> AppResult<()>;
}

/// Production [`Mailbox`] backed by a per-operation IMAP session
#[derive(Debug, Clone)]
pub struct ImapMailbox {
    config: Arc<MailboxConfig>,
}

impl ImapMailbox {
    pub fn new(config: Arc<MailboxConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Mailbox for ImapMailbox {
    async fn list_folders(&self) -> AppResult<Vec<String>> {
        let session = connect_authenticated(&self.config).await?;
        list_folders_then_close(&self.config, session).await
    }

    async fn fetch_summaries(
        &self,
        folder: &str,
        limit: usize,
        unread_only: bool,
    ) -> AppResult<Vec<MessageSummary>> {
        let session = connect_authenticated(&self.config).await?;
        summaries_then_close(&self.config, session, folder, limit, unread_only).await
    }

    async fn fetch_full_message(&self, uid: u32, folder: &str) -> AppResult<MessageContent> {
        let session = connect_authenticated(&self.config).await?;
        full_message_then_close(&self.config, session, uid, folder).await
    }

    async fn move_message(
        &self,
        uid: u32,
        source_folder: &str,
        destination_folder: &str,
    ) -> AppResult<()> {
        let session = connect_authenticated(&self.config).await?;
        move_then_close(&self.config, session, uid, source_folder, destination_folder).await
    }

    async fn delete_message(&self, uid: u32, folder: &str) -> AppResult<()> {
        let session = connect_authenticated(&self.config).await?;
        delete_then_close(&self.config, session, uid, folder).await
    }

    async fn append_draft(&self, folder: &str, message: &[u8]) -> AppResult<()> {
        let session = connect_authenticated(&self.config).await?;
        append_then_close(&self.config, session, folder, message).await
    }
}

async fn list_folders_then_close<S: ImapStream>(
    config: &MailboxConfig,
    mut session: Session<S>,
) -> AppResult<Vec<String>> {
    let result = list_folder_names(config, &mut session).await;
    close(config, session).await;
    if let Ok(names) = &result {
        tracing::debug!(count = names.len(), "listed folders");
    }
    result
}

async fn summaries_then_close<S: ImapStream>(
    config: &MailboxConfig,
    mut session: Session<S>,
    folder: &str,
    limit: usize,
    unread_only: bool,
) -> AppResult<Vec<MessageSummary>> {
    let result = summaries_in(config, &mut session, folder, limit, unread_only).await;
    close(config, session).await;
    if let Ok(summaries) = &result {
        tracing::debug!(folder, count = summaries.len(), unread_only, "fetched summaries");
    }
    result
}

async fn full_message_then_close<S: ImapStream>(
    config: &MailboxConfig,
    mut session: Session<S>,
    uid: u32,
    folder: &str,
) -> AppResult<MessageContent> {
    let result = async {
        select_mailbox(config, &mut session, folder).await?;
        fetch_raw_message(config, &mut session, uid).await
    }
    .await;
    close(config, session).await;
    mime::parse_message(&result?)
}

async fn move_then_close<S: ImapStream>(
    config: &MailboxConfig,
    mut session: Session<S>,
    uid: u32,
    source_folder: &str,
    destination_folder: &str,
) -> AppResult<()> {
    let result = async {
        select_mailbox(config, &mut session, source_folder).await?;
        uid_copy(config, &mut session, uid, destination_folder).await?;
        // Not transactional: a failure past this point leaves a copy in both folders.
        uid_store(config, &mut session, uid, "+FLAGS.SILENT (\\Deleted)").await?;
        expunge(config, &mut session).await
    }
    .await;
    close(config, session).await;
    if result.is_ok() {
        tracing::info!(uid, source_folder, destination_folder, "moved message");
    }
    result
}

async fn delete_then_close<S: ImapStream>(
    config: &MailboxConfig,
    mut session: Session<S>,
    uid: u32,
    folder: &str,
) -> AppResult<()> {
    let result = async {
        select_mailbox(config, &mut session, folder).await?;
        uid_store(config, &mut session, uid, "+FLAGS.SILENT (\\Deleted)").await?;
        expunge(config, &mut session).await
    }
    .await;
    close(config, session).await;
    if result.is_ok() {
        tracing::info!(uid, folder, "deleted message");
    }
    result
}

async fn append_then_close<S: ImapStream>(
    config: &MailboxConfig,
    mut session: Session<S>,
    folder: &str,
    message: &[u8],
) -> AppResult<()> {
    let result = append(config, &mut session, folder, message).await;
    close(config, session).await;
    if result.is_ok() {
        tracing::info!(folder, size_bytes = message.len(), "appended draft");
    }
    result
}

/// Get socket timeout duration from mailbox config
fn socket_timeout(config: &MailboxConfig) -> Duration {
    Duration::from_millis(config.socket_timeout_ms)
}

/// Whether the server answered NO/BAD rather than the connection failing
fn is_server_refusal(err: &ImapError) -> bool {
    matches!(err, ImapError::No(_) | ImapError::Bad(_))
}

/// Run one IMAP command future under the socket timeout
///
/// Both server refusals and I/O failures surface as `Upstream` with the
/// protocol error text.
async fn bounded<T, F>(config: &MailboxConfig, label: &str, fut: F) -> AppResult<T>
where
    F: Future<Output = Result<T, ImapError>>,
{
    timeout(socket_timeout(config), fut)
        .await
        .map_err(|_| AppError::Timeout(format!("{label} timed out")))?
        .map_err(|e| {
            let verb = if is_server_refusal(&e) { "rejected" } else { "failed" };
            AppError::Upstream(format!("{label} {verb}: {e}"))
        })
}

/// Connect to IMAP server and authenticate
///
/// Performs full connection sequence with timeouts:
/// 1. TCP connect
/// 2. TLS handshake with bundled root certificates
/// 3. Read IMAP greeting
/// 4. LOGIN authentication
///
/// # Errors
///
/// - `InvalidInput` if the hostname is invalid for TLS SNI
/// - `Timeout` if any connection phase times out
/// - `AuthFailed` if authentication fails
/// - `Upstream` for TCP, TLS, or greeting failures
pub async fn connect_authenticated(config: &MailboxConfig) -> AppResult<ImapSession> {
    let connect_duration = Duration::from_millis(config.connect_timeout_ms);
    let greeting_duration = Duration::from_millis(config.greeting_timeout_ms);

    let tcp = timeout(
        connect_duration,
        TcpStream::connect((config.imap_host.as_str(), config.imap_port)),
    )
    .await
    .map_err(|_| AppError::Timeout("tcp connect timeout".to_owned()))
    .and_then(|r| r.map_err(|e| AppError::Upstream(format!("tcp connect failed: {e}"))))?;

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(tls_config));

    let server_name = ServerName::try_from(config.imap_host.clone())
        .map_err(|_| AppError::InvalidInput("invalid IMAP host for TLS SNI".to_owned()))?;
    let tls_stream = timeout(greeting_duration, connector.connect(server_name, tcp))
        .await
        .map_err(|_| AppError::Timeout("TLS handshake timeout".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Upstream(format!("TLS handshake failed: {e}"))))?;

    greet_and_login(config, Client::new(tls_stream)).await
}

/// Read the server greeting, then LOGIN with the account credentials
async fn greet_and_login<S: ImapStream>(
    config: &MailboxConfig,
    mut client: Client<S>,
) -> AppResult<Session<S>> {
    let greeting_duration = Duration::from_millis(config.greeting_timeout_ms);
    let greeting = timeout(greeting_duration, client.read_response())
        .await
        .map_err(|_| AppError::Timeout("IMAP greeting timeout".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Upstream(format!("IMAP greeting failed: {e}"))))?;

    if greeting.is_none() {
        return Err(AppError::Upstream(
            "IMAP server closed connection before greeting".to_owned(),
        ));
    }

    let pass = config.account_password.expose_secret();
    timeout(
        greeting_duration,
        client.login(config.account_address.as_str(), pass),
    )
    .await
    .map_err(|_| AppError::Timeout("IMAP login timeout".to_owned()))
    .and_then(|r| {
        r.map_err(|(e, _)| {
            let msg = e.to_string();
            if matches!(e, ImapError::No(_))
                || msg.to_ascii_lowercase().contains("auth")
                || msg.contains("LOGIN")
            {
                AppError::AuthFailed(msg)
            } else {
                AppError::Upstream(msg)
            }
        })
    })
}

/// Log out, swallowing failures
///
/// The unit of work has already produced its result; a failed LOGOUT only
/// leaves a server-side session to time out.
pub async fn close<S: ImapStream>(config: &MailboxConfig, mut session: Session<S>) {
    match timeout(socket_timeout(config), session.logout()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "IMAP logout failed"),
        Err(_) => tracing::warn!("IMAP logout timed out"),
    }
}

/// List every folder and decode its name for display
///
/// A NO/BAD answer yields an empty list; transport failures propagate.
async fn list_folder_names<S: ImapStream>(
    config: &MailboxConfig,
    session: &mut Session<S>,
) -> AppResult<Vec<String>> {
    let stream = match timeout(socket_timeout(config), session.list(Some(""), Some("*"))).await {
        Err(_) => return Err(AppError::Timeout("LIST timed out".to_owned())),
        Ok(Err(e)) if is_server_refusal(&e) => {
            tracing::warn!(error = %e, "server refused LIST");
            return Ok(Vec::new());
        }
        Ok(Err(e)) => return Err(AppError::Upstream(format!("LIST failed: {e}"))),
        Ok(Ok(stream)) => stream,
    };
    let names: Vec<Name> = bounded(config, "LIST stream", stream.try_collect()).await?;

    Ok(names.iter().map(|name| display_name(name.name())).collect())
}

/// Decode a listed mailbox name for display
///
/// The parser hands quoted names back still escaped, so `\"` and `\\` are
/// undone before modified UTF-7 decoding.
pub fn display_name(raw: &str) -> String {
    let mut unescaped = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => unescaped.extend(chars.next()),
            other => unescaped.push(other),
        }
    }
    utf7_imap::decode_utf7_imap(unescaped)
}

/// Select mailbox in read-write mode
///
/// # Errors
///
/// - `NotFound` if the server refuses to select the folder
pub async fn select_mailbox<S: ImapStream>(
    config: &MailboxConfig,
    session: &mut Session<S>,
    mailbox: &str,
) -> AppResult<()> {
    let encoded = utf7_imap::encode_utf7_imap(mailbox.to_owned());
    timeout(socket_timeout(config), session.select(&encoded))
        .await
        .map_err(|_| AppError::Timeout(format!("SELECT timed out for mailbox '{mailbox}'")))?
        .map_err(|e| {
            if is_server_refusal(&e) {
                AppError::NotFound(format!("cannot select mailbox '{mailbox}': {e}"))
            } else {
                AppError::Upstream(format!("SELECT failed for mailbox '{mailbox}': {e}"))
            }
        })?;
    Ok(())
}

/// Select, search and summarize the tail of the matching UIDs
async fn summaries_in<S: ImapStream>(
    config: &MailboxConfig,
    session: &mut Session<S>,
    folder: &str,
    limit: usize,
    unread_only: bool,
) -> AppResult<Vec<MessageSummary>> {
    select_mailbox(config, session, folder).await?;

    let criteria = if unread_only { "UNSEEN" } else { "ALL" };
    let uids = uid_search(config, session, criteria).await?;

    let mut summaries = Vec::new();
    for uid in newest_uids(&uids, limit) {
        match fetch_headers_and_flags(config, session, *uid).await {
            Ok((header_bytes, seen)) => summaries.push(mime::summarize(*uid, &header_bytes, seen)?),
            Err(AppError::NotFound(_)) => {
                tracing::debug!(uid, folder, "message vanished between search and fetch");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(summaries)
}

/// Take at most `limit` highest UIDs from an ascending list
///
/// UID order approximates arrival order; it is not a receipt timestamp.
/// A zero limit keeps everything.
pub fn newest_uids(uids_asc: &[u32], limit: usize) -> &[u32] {
    if limit == 0 {
        return uids_asc;
    }
    &uids_asc[uids_asc.len().saturating_sub(limit)..]
}

/// Search for messages matching criteria
///
/// Runs `UID SEARCH` and returns matching UIDs in ascending order. A NO/BAD
/// answer is treated as no matches; transport failures propagate.
pub async fn uid_search<S: ImapStream>(
    config: &MailboxConfig,
    session: &mut Session<S>,
    query: &str,
) -> AppResult<Vec<u32>> {
    let set = match timeout(socket_timeout(config), session.uid_search(query)).await {
        Err(_) => return Err(AppError::Timeout("UID SEARCH timed out".to_owned())),
        Ok(Err(e)) if is_server_refusal(&e) => {
            tracing::warn!(query, error = %e, "server refused search");
            return Ok(Vec::new());
        }
        Ok(Err(e)) => return Err(AppError::Upstream(format!("UID SEARCH failed: {e}"))),
        Ok(Ok(set)) => set,
    };
    let mut uids: Vec<u32> = set.into_iter().collect();
    uids.sort_unstable();
    Ok(uids)
}

/// Fetch a single message with custom query
///
/// # Errors
///
/// - `NotFound` if UID does not exist in mailbox
/// - `Timeout` or `Upstream` for network/protocol errors
pub async fn fetch_one<S: ImapStream>(
    config: &MailboxConfig,
    session: &mut Session<S>,
    uid: u32,
    query: &str,
) -> AppResult<Fetch> {
    let stream = bounded(config, "UID FETCH", session.uid_fetch(uid.to_string(), query)).await?;
    let fetches: Vec<Fetch> = bounded(config, "UID FETCH stream", stream.try_collect()).await?;

    fetches
        .into_iter()
        .next()
        .ok_or_else(|| AppError::NotFound(format!("message uid {uid} not found")))
}

/// Fetch full RFC822 message source
pub async fn fetch_raw_message<S: ImapStream>(
    config: &MailboxConfig,
    session: &mut Session<S>,
    uid: u32,
) -> AppResult<Vec<u8>> {
    let fetch = fetch_one(config, session, uid, "(UID RFC822)").await?;
    let body = fetch
        .body()
        .filter(|body| !body.is_empty())
        .ok_or_else(|| AppError::NotFound(format!("message uid {uid} has no content")))?;
    Ok(body.to_vec())
}

/// Fetch the header section and the `\Seen` flag
///
/// Uses `BODY.PEEK` so listing never marks messages as read.
pub async fn fetch_headers_and_flags<S: ImapStream>(
    config: &MailboxConfig,
    session: &mut Session<S>,
    uid: u32,
) -> AppResult<(Vec<u8>, bool)> {
    let fetch = fetch_one(config, session, uid, "(UID FLAGS BODY.PEEK[HEADER])").await?;
    let header_bytes = fetch
        .header()
        .or_else(|| fetch.body())
        .ok_or_else(|| AppError::Upstream(format!("headers of message uid {uid} not returned")))?
        .to_vec();
    Ok((header_bytes, is_seen(&fetch)))
}

/// Whether the fetch carries the `\Seen` flag
fn is_seen(fetch: &Fetch) -> bool {
    fetch.flags().any(|flag| matches!(flag, Flag::Seen))
}

/// Store flags on a message
///
/// Runs `UID STORE` with a flag query string such as `+FLAGS.SILENT (\Deleted)`.
pub async fn uid_store<S: ImapStream>(
    config: &MailboxConfig,
    session: &mut Session<S>,
    uid: u32,
    query: &str,
) -> AppResult<()> {
    let stream = bounded(config, "UID STORE", session.uid_store(uid.to_string(), query)).await?;
    let _: Vec<Fetch> = bounded(config, "UID STORE stream", stream.try_collect()).await?;
    Ok(())
}

/// Copy message to another mailbox
pub async fn uid_copy<S: ImapStream>(
    config: &MailboxConfig,
    session: &mut Session<S>,
    uid: u32,
    mailbox: &str,
) -> AppResult<()> {
    let encoded = utf7_imap::encode_utf7_imap(mailbox.to_owned());
    bounded(config, "UID COPY", session.uid_copy(uid.to_string(), encoded)).await
}

/// Permanently remove every message marked `\Deleted` in the selected mailbox
pub async fn expunge<S: ImapStream>(
    config: &MailboxConfig,
    session: &mut Session<S>,
) -> AppResult<()> {
    let stream = bounded(config, "EXPUNGE", session.expunge()).await?;
    let _: Vec<u32> = bounded(config, "EXPUNGE stream", stream.try_collect()).await?;
    Ok(())
}

/// Append a formatted message to a mailbox as a draft
///
/// The message carries the `\Draft` flag and the current time as its
/// internal date.
pub async fn append<S: ImapStream>(
    config: &MailboxConfig,
    session: &mut Session<S>,
    mailbox: &str,
    content: &[u8],
) -> AppResult<()> {
    let encoded = utf7_imap::encode_utf7_imap(mailbox.to_owned());
    let internal_date = append_date(Utc::now());
    bounded(
        config,
        "APPEND",
        session.append(&encoded, Some("(\\Draft)"), Some(internal_date.as_str()), content),
    )
    .await
}

/// Quoted `date-time` for APPEND, e.g. `"18-Oct-2026 22:02:46 +0000"`
fn append_date(now: DateTime<Utc>) -> String {
    format!("\"{}\"", now.format("%d-%b-%Y %H:%M:%S %z"))
}


#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};

    use async_imap::{Client, Session};
    use chrono::{TimeZone, Utc};
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};

    use super::{
        append_date, append_then_close, delete_then_close, display_name, full_message_then_close,
        greet_and_login, list_folders_then_close, move_then_close, newest_uids,
        summaries_then_close,
    };
    use crate::compose::tests::test_config;
    use crate::errors::{AppError, AppResult};

    /// Canned answers for the scripted server
    #[derive(Debug, Default)]
    struct Script {
        missing_folders: Vec<&'static str>,
        refuse_login: bool,
        refuse_search: bool,
        search_uids: Vec<u32>,
        /// uid -> (seen, raw message)
        messages: BTreeMap<u32, (bool, &'static str)>,
    }

    #[derive(Debug, Default)]
    struct Transcript {
        /// Client commands with their tags stripped
        commands: Vec<String>,
        appended: Vec<Vec<u8>>,
    }

    /// Single-connection plaintext IMAP server answering from a [`Script`]
    struct ScriptedServer {
        addr: SocketAddr,
        transcript: Arc<Mutex<Transcript>>,
    }

    impl ScriptedServer {
        async fn start(script: Script) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
            let addr = listener.local_addr().expect("local addr");
            let transcript = Arc::new(Mutex::new(Transcript::default()));
            let recorded = Arc::clone(&transcript);
            tokio::spawn(async move {
                let (socket, _) = listener.accept().await.expect("accept");
                converse(socket, &script, &recorded).await;
            });
            Self { addr, transcript }
        }

        async fn login(&self) -> AppResult<Session<TcpStream>> {
            let tcp = TcpStream::connect(self.addr).await.expect("connect");
            greet_and_login(&test_config(), Client::new(tcp)).await
        }

        async fn session(&self) -> Session<TcpStream> {
            self.login().await.expect("login succeeds")
        }

        fn commands(&self) -> Vec<String> {
            self.transcript
                .lock()
                .expect("transcript lock")
                .commands
                .clone()
        }

        fn appended(&self) -> Vec<Vec<u8>> {
            self.transcript
                .lock()
                .expect("transcript lock")
                .appended
                .clone()
        }

        /// Commands after LOGIN, which carries the password
        fn commands_after_login(&self) -> Vec<String> {
            self.commands().into_iter().skip(1).collect()
        }
    }

    async fn converse(socket: TcpStream, script: &Script, transcript: &Mutex<Transcript>) {
        let (read_half, mut writer) = socket.into_split();
        let mut reader = BufReader::new(read_half);
        writer
            .write_all(b"* OK scripted IMAP ready\r\n")
            .await
            .expect("greeting");

        loop {
            let mut raw = String::new();
            if reader.read_line(&mut raw).await.unwrap_or(0) == 0 {
                return;
            }
            let line = raw.trim_end();
            let (tag, command) = line.split_once(' ').unwrap_or((line, ""));
            transcript
                .lock()
                .expect("transcript lock")
                .commands
                .push(command.to_owned());

            if command.starts_with("APPEND ") {
                writer
                    .write_all(b"+ Ready for literal data\r\n")
                    .await
                    .expect("continuation");
                let mut content = vec![0; literal_size(command)];
                reader.read_exact(&mut content).await.expect("literal");
                let mut terminator = String::new();
                reader
                    .read_line(&mut terminator)
                    .await
                    .expect("literal terminator");
                transcript
                    .lock()
                    .expect("transcript lock")
                    .appended
                    .push(content);
            }

            let reply = reply_to(script, tag, command);
            writer.write_all(reply.as_bytes()).await.expect("reply");
            if command == "LOGOUT" {
                return;
            }
        }
    }

    fn literal_size(command: &str) -> usize {
        command
            .rsplit_once('{')
            .and_then(|(_, rest)| rest.strip_suffix('}'))
            .and_then(|size| size.parse().ok())
            .expect("APPEND ends with a literal size")
    }

    fn reply_to(script: &Script, tag: &str, command: &str) -> String {
        if command.starts_with("LOGIN ") {
            return if script.refuse_login {
                format!("{tag} NO [AUTHENTICATIONFAILED] Invalid credentials\r\n")
            } else {
                format!("{tag} OK LOGIN completed\r\n")
            };
        }
        if let Some(folder) = command.strip_prefix("SELECT ") {
            let folder = folder.trim_matches('"');
            if script.missing_folders.contains(&folder) {
                return format!("{tag} NO Mailbox doesn't exist: {folder}\r\n");
            }
            return format!(
                "* 3 EXISTS\r\n* 0 RECENT\r\n* FLAGS (\\Seen \\Deleted \\Draft)\r\n* OK [UIDVALIDITY 7] UIDs valid\r\n{tag} OK [READ-WRITE] SELECT completed\r\n"
            );
        }
        if command.starts_with("LIST ") {
            return format!(
                concat!(
                    "* LIST (\\HasNoChildren) \"/\" \"INBOX\"\r\n",
                    "* LIST (\\HasNoChildren) \"/\" \"My Stuff\"\r\n",
                    "* LIST (\\HasNoChildren) \".\" \"Say \\\"hi\\\" later\"\r\n",
                    "* LIST () \"/\" {{8}}\r\nOld Mail\r\n",
                    "* LIST (\\HasNoChildren) \"/\" \"&AOk-t&AOk-\"\r\n",
                    "{tag} OK LIST completed\r\n",
                ),
                tag = tag
            );
        }
        if command.starts_with("UID SEARCH ") {
            if script.refuse_search {
                return format!("{tag} NO search refused\r\n");
            }
            let uids: Vec<String> = script.search_uids.iter().map(u32::to_string).collect();
            return format!("* SEARCH {}\r\n{tag} OK SEARCH completed\r\n", uids.join(" "));
        }
        if let Some(rest) = command.strip_prefix("UID FETCH ") {
            let (set, query) = rest.split_once(' ').unwrap_or((rest, ""));
            let uid: u32 = set.parse().expect("single uid");
            let Some((seen, raw)) = script.messages.get(&uid) else {
                return format!("{tag} OK FETCH completed\r\n");
            };
            let flags = if *seen { "\\Seen" } else { "" };
            let data = if query.contains("BODY.PEEK[HEADER]") {
                let end = raw.find("\r\n\r\n").map_or(raw.len(), |at| at + 4);
                let header = &raw[..end];
                format!("FLAGS ({flags}) BODY[HEADER] {{{}}}\r\n{header}", header.len())
            } else {
                format!("RFC822 {{{}}}\r\n{raw}", raw.len())
            };
            return format!("* 1 FETCH (UID {uid} {data})\r\n{tag} OK FETCH completed\r\n");
        }
        if command.starts_with("UID COPY ") || command.starts_with("UID STORE ") {
            return format!("{tag} OK completed\r\n");
        }
        if command.starts_with("APPEND ") {
            return format!("{tag} OK APPEND completed\r\n");
        }
        match command {
            "EXPUNGE" => format!("* 2 EXPUNGE\r\n{tag} OK EXPUNGE completed\r\n"),
            "LOGOUT" => format!("* BYE logging out\r\n{tag} OK LOGOUT completed\r\n"),
            _ => format!("{tag} BAD unexpected command\r\n"),
        }
    }

    const REPORT: &str = concat!(
        "From: Ann <ann@example.com>\r\n",
        "To: me@example.com, Bob <bob@example.com>\r\n",
        "Subject: Report\r\n",
        "Date: Mon, 02 Oct 2023 13:00:00 +0200\r\n",
        "Message-ID: <report@example.com>\r\n",
        "\r\n",
        "Numbers attached.\r\n",
    );

    fn assert_logged_out(server: &ScriptedServer) {
        assert_eq!(server.commands().last().map(String::as_str), Some("LOGOUT"));
    }

    #[tokio::test]
    async fn folders_are_listed_and_utf7_decoded() {
        let server = ScriptedServer::start(Script::default()).await;
        let names = list_folders_then_close(&test_config(), server.session().await)
            .await
            .expect("list succeeds");

        assert_eq!(
            names,
            vec!["INBOX", "My Stuff", "Say \"hi\" later", "Old Mail", "été"]
        );
        assert_eq!(server.commands_after_login(), vec!["LIST \"\" *", "LOGOUT"]);
    }

    #[tokio::test]
    async fn summaries_take_newest_uids_and_report_seen() {
        let server = ScriptedServer::start(Script {
            search_uids: vec![12, 3, 7],
            messages: BTreeMap::from([(7, (false, REPORT)), (12, (true, REPORT))]),
            ..Script::default()
        })
        .await;
        let summaries =
            summaries_then_close(&test_config(), server.session().await, "INBOX", 2, false)
                .await
                .expect("summaries succeed");

        let uids: Vec<_> = summaries.iter().map(|s| s.uid.as_str()).collect();
        assert_eq!(uids, vec!["7", "12"]);
        assert!(!summaries[0].seen);
        assert!(summaries[1].seen);
        assert_eq!(summaries[0].subject, "Report");
        assert_eq!(summaries[0].sender_address.as_deref(), Some("ann@example.com"));
        assert!(summaries[0].sent_at.is_some());

        let commands = server.commands_after_login();
        assert!(commands.contains(&"UID SEARCH ALL".to_owned()));
        assert!(commands.contains(&"UID FETCH 7 (UID FLAGS BODY.PEEK[HEADER])".to_owned()));
        assert!(!commands.iter().any(|c| c.starts_with("UID FETCH 3 ")));
        assert_logged_out(&server);
    }

    #[tokio::test]
    async fn refused_search_is_empty_and_still_logs_out() {
        let server = ScriptedServer::start(Script {
            refuse_search: true,
            ..Script::default()
        })
        .await;
        let summaries =
            summaries_then_close(&test_config(), server.session().await, "INBOX", 10, true)
                .await
                .expect("refusal is not an error");

        assert!(summaries.is_empty());
        assert!(server.commands().contains(&"UID SEARCH UNSEEN".to_owned()));
        assert_logged_out(&server);
    }

    #[tokio::test]
    async fn full_message_is_fetched_and_parsed() {
        let server = ScriptedServer::start(Script {
            messages: BTreeMap::from([(3, (true, REPORT))]),
            ..Script::default()
        })
        .await;
        let message = full_message_then_close(&test_config(), server.session().await, 3, "INBOX")
            .await
            .expect("message fetched");

        assert_eq!(message.subject, "Report");
        assert_eq!(message.from.as_deref(), Some("ann@example.com"));
        assert_eq!(message.to, vec!["me@example.com", "bob@example.com"]);
        assert_eq!(message.message_id.as_deref(), Some("<report@example.com>"));
        assert_eq!(message.text_body().trim(), "Numbers attached.");
        assert_eq!(
            server.commands_after_login(),
            vec!["SELECT \"INBOX\"", "UID FETCH 3 (UID RFC822)", "LOGOUT"]
        );
    }

    #[tokio::test]
    async fn missing_folder_is_not_found_and_still_logs_out() {
        let server = ScriptedServer::start(Script {
            missing_folders: vec!["Nope"],
            ..Script::default()
        })
        .await;
        let err = full_message_then_close(&test_config(), server.session().await, 3, "Nope")
            .await
            .expect_err("select refused");

        assert!(matches!(err, AppError::NotFound(_)), "got {err:?}");
        assert_eq!(server.commands_after_login(), vec!["SELECT \"Nope\"", "LOGOUT"]);
    }

    #[tokio::test]
    async fn message_without_content_is_not_found_and_still_logs_out() {
        let server = ScriptedServer::start(Script::default()).await;
        let err = full_message_then_close(&test_config(), server.session().await, 5, "INBOX")
            .await
            .expect_err("no such uid");

        assert!(matches!(err, AppError::NotFound(_)), "got {err:?}");
        assert!(server.commands().contains(&"UID FETCH 5 (UID RFC822)".to_owned()));
        assert_logged_out(&server);
    }

    #[tokio::test]
    async fn move_copies_then_flags_and_expunges() {
        let server = ScriptedServer::start(Script::default()).await;
        move_then_close(&test_config(), server.session().await, 7, "INBOX", "Archive")
            .await
            .expect("move succeeds");

        assert_eq!(
            server.commands_after_login(),
            vec![
                "SELECT \"INBOX\"",
                "UID COPY 7 \"Archive\"",
                "UID STORE 7 +FLAGS.SILENT (\\Deleted)",
                "EXPUNGE",
                "LOGOUT",
            ]
        );
    }

    #[tokio::test]
    async fn move_out_of_missing_folder_copies_nothing() {
        let server = ScriptedServer::start(Script {
            missing_folders: vec!["Gone"],
            ..Script::default()
        })
        .await;
        let err = move_then_close(&test_config(), server.session().await, 7, "Gone", "Archive")
            .await
            .expect_err("select refused");

        assert!(matches!(err, AppError::NotFound(_)), "got {err:?}");
        assert_eq!(server.commands_after_login(), vec!["SELECT \"Gone\"", "LOGOUT"]);
    }

    #[tokio::test]
    async fn delete_flags_and_expunges() {
        let server = ScriptedServer::start(Script::default()).await;
        delete_then_close(&test_config(), server.session().await, 9, "INBOX")
            .await
            .expect("delete succeeds");

        assert_eq!(
            server.commands_after_login(),
            vec![
                "SELECT \"INBOX\"",
                "UID STORE 9 +FLAGS.SILENT (\\Deleted)",
                "EXPUNGE",
                "LOGOUT",
            ]
        );
    }

    #[tokio::test]
    async fn draft_append_sends_flag_list_and_quoted_date() {
        let server = ScriptedServer::start(Script::default()).await;
        let message = b"Subject: Draft\r\n\r\nbody";
        append_then_close(&test_config(), server.session().await, "Drafts", message)
            .await
            .expect("append succeeds");

        let commands = server.commands_after_login();
        let append = &commands[0];
        assert!(
            append.starts_with("APPEND \"Drafts\" (\\Draft) \""),
            "got {append}"
        );
        assert!(
            append.ends_with(&format!(" +0000\" {{{}}}", message.len())),
            "got {append}"
        );
        assert_eq!(server.appended(), vec![message.to_vec()]);
        assert_logged_out(&server);
    }

    #[tokio::test]
    async fn rejected_login_is_auth_failed() {
        let server = ScriptedServer::start(Script {
            refuse_login: true,
            ..Script::default()
        })
        .await;
        let err = server.login().await.expect_err("login refused");
        assert!(matches!(err, AppError::AuthFailed(_)), "got {err:?}");
    }

    #[test]
    fn display_name_unescapes_and_decodes() {
        assert_eq!(display_name("My Stuff"), "My Stuff");
        assert_eq!(display_name(r#"Say \"hi\" later"#), r#"Say "hi" later"#);
        assert_eq!(display_name(r"back\\slash"), r"back\slash");
        assert_eq!(display_name("&AOk-t&AOk-"), "été");
    }

    #[test]
    fn append_date_is_quoted_rfc3501_date_time() {
        let now = Utc
            .with_ymd_and_hms(2026, 10, 8, 22, 2, 46)
            .single()
            .expect("valid instant");
        assert_eq!(append_date(now), "\"08-Oct-2026 22:02:46 +0000\"");
    }

    #[test]
    fn newest_uids_takes_highest_tail() {
        let uids = [3, 5, 9, 12, 40];
        assert_eq!(newest_uids(&uids, 2), &[12, 40]);
        assert_eq!(newest_uids(&uids, 10), &uids);
        assert_eq!(newest_uids(&uids, 0), &uids);
        assert!(newest_uids(&[], 5).is_empty());
    }
}
