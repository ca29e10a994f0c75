//! Message parsing and header decoding
//!
//! Pure helpers over `mailparse`: RFC 2047 encoded-word decoding, sender
//! address reduction, date parsing, summary shaping from a header
//! section, and body extraction from a full RFC 822 message. Nothing here
//! performs I/O.

use chrono::{DateTime, FixedOffset};
use mailparse::{DispositionType, MailAddr, MailHeaderMap, ParsedMail};

use crate::errors::{AppError, AppResult};
use crate::models::MessageSummary;

/// Wrap width used when rendering an HTML-only body as text
const HTML_TEXT_WIDTH: usize = 100;

/// Parsed message representation
///
/// Contains the headers the relay acts on and both body renditions.
#[derive(Debug, Clone, Default)]
pub struct MessageContent {
    /// Decoded Subject header (empty when absent)
    pub subject: String,
    /// Bare sender address
    pub from: Option<String>,
    /// Bare addresses from the To header, groups flattened
    pub to: Vec<String>,
    /// Message-ID header, verbatim
    pub message_id: Option<String>,
    /// Parsed Date header
    pub date: Option<DateTime<FixedOffset>>,
    /// First non-attachment text/plain part
    pub body_text: Option<String>,
    /// First non-attachment text/html part (unsanitized)
    pub body_html: Option<String>,
}

impl MessageContent {
    /// Plain-text body, rendering the HTML part when no text part exists
    pub fn text_body(&self) -> String {
        if let Some(text) = &self.body_text {
            return text.clone();
        }
        self.body_html
            .as_deref()
            .and_then(|html| html2text::from_read(html.as_bytes(), HTML_TEXT_WIDTH).ok())
            .unwrap_or_default()
    }

    /// HTML body with scripts, styles and unsafe attributes removed
    pub fn sanitized_html(&self) -> Option<String> {
        self.body_html.as_deref().map(ammonia::clean)
    }
}

/// Reduce an address header to the first bare address
///
/// `"Jane Doe <jane@example.com>"` becomes `jane@example.com`. Returns `None`
/// when no address can be found.
pub fn sender_address(value: &str) -> Option<String> {
    let list = mailparse::addrparse(value).ok()?;
    let addr = list.iter().find_map(|entry| match entry {
        MailAddr::Single(info) => Some(info.addr.clone()),
        MailAddr::Group(group) => group.addrs.first().map(|info| info.addr.clone()),
    })?;
    let addr = addr.trim().to_owned();
    (!addr.is_empty()).then_some(addr)
}

/// Every bare address in an address-list header
pub fn recipient_addresses(value: &str) -> Vec<String> {
    let Ok(list) = mailparse::addrparse(value) else {
        return Vec::new();
    };
    list.iter()
        .flat_map(|entry| match entry {
            MailAddr::Single(info) => vec![info.addr.trim().to_owned()],
            MailAddr::Group(group) => group
                .addrs
                .iter()
                .map(|info| info.addr.trim().to_owned())
                .collect(),
        })
        .filter(|addr| !addr.is_empty())
        .collect()
}

/// Parse a Date header, returning `None` when missing or malformed
///
/// Accepts RFC 2822 and RFC 3339 and keeps the sender's offset. Anything
/// else is treated as absent rather than guessed at.
pub fn parse_date(value: &str) -> Option<DateTime<FixedOffset>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc2822(value)
        .or_else(|_| DateTime::parse_from_rfc3339(value))
        .ok()
}

/// Build a summary from a fetched header section and seen flag
///
/// # Errors
///
/// - `Internal` if the header block cannot be tokenized at all
pub fn summarize(uid: u32, header_bytes: &[u8], seen: bool) -> AppResult<MessageSummary> {
    let (headers, _) = mailparse::parse_headers(header_bytes)
        .map_err(|e| AppError::Internal(format!("failed to parse message headers: {e}")))?;

    Ok(MessageSummary {
        uid: uid.to_string(),
        subject: headers.get_first_value("Subject").unwrap_or_default(),
        sender_address: headers
            .get_first_value("From")
            .and_then(|from| sender_address(&from)),
        sent_at: headers
            .get_first_value("Date")
            .and_then(|date| parse_date(&date)),
        seen,
    })
}

/// Parse a full RFC 822 message
///
/// # Errors
///
/// - `Internal` if `mailparse` fails
pub fn parse_message(raw: &[u8]) -> AppResult<MessageContent> {
    let parsed = mailparse::parse_mail(raw)
        .map_err(|e| AppError::Internal(format!("failed to parse RFC822 message: {e}")))?;

    let headers = &parsed.headers;
    let mut content = MessageContent {
        subject: headers.get_first_value("Subject").unwrap_or_default(),
        from: headers
            .get_first_value("From")
            .and_then(|from| sender_address(&from)),
        to: headers
            .get_first_value("To")
            .map(|to| recipient_addresses(&to))
            .unwrap_or_default(),
        message_id: headers
            .get_first_value("Message-ID")
            .map(|id| id.trim().to_owned())
            .filter(|id| !id.is_empty()),
        date: headers
            .get_first_value("Date")
            .and_then(|date| parse_date(&date)),
        ..MessageContent::default()
    };

    walk_parts(&parsed, &mut content);
    Ok(content)
}

/// Walk MIME part tree recursively, keeping the first text and HTML bodies
fn walk_parts(part: &ParsedMail<'_>, content: &mut MessageContent) {
    if !part.subparts.is_empty() {
        for sub in &part.subparts {
            walk_parts(sub, content);
        }
        return;
    }

    let disp = part.get_content_disposition();
    let is_attachment = disp.disposition == DispositionType::Attachment
        || disp.params.contains_key("filename")
        || part.ctype.params.contains_key("name");
    if is_attachment {
        return;
    }

    match part.ctype.mimetype.to_ascii_lowercase().as_str() {
        "text/plain" if content.body_text.is_none() => {
            content.body_text = part.get_body().ok();
        }
        "text/html" if content.body_html.is_none() => {
            content.body_html = part.get_body().ok();
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_date, parse_message, recipient_addresses, sender_address, summarize};

    fn subject_of(raw: &str) -> String {
        let headers = format!("Subject: {raw}\r\n\r\n");
        summarize(1, headers.as_bytes(), false)
            .expect("summary builds")
            .subject
    }

    #[test]
    fn decodes_base64_encoded_word() {
        assert_eq!(subject_of("=?utf-8?B?VGVzdA==?="), "Test");
    }

    #[test]
    fn joins_multi_part_encoded_header() {
        let raw = "=?utf-8?Q?Caf=C3=A9?= =?iso-8859-1?Q?_cr=E8me?= and plain";
        assert_eq!(subject_of(raw), "Café crème and plain");
    }

    #[test]
    fn plain_header_passes_through() {
        assert_eq!(subject_of("Quarterly report"), "Quarterly report");
    }

    #[test]
    fn sender_is_reduced_to_bare_address() {
        assert_eq!(
            sender_address("\"Doe, Jane\" <jane@example.com>").as_deref(),
            Some("jane@example.com")
        );
        assert_eq!(
            sender_address("bob@example.com").as_deref(),
            Some("bob@example.com")
        );
        assert_eq!(sender_address(""), None);
    }

    #[test]
    fn recipients_keep_every_address() {
        assert_eq!(
            recipient_addresses("Ann <ann@example.com>, bob@example.com"),
            vec!["ann@example.com", "bob@example.com"]
        );
        assert_eq!(
            recipient_addresses("team: c@example.com, d@example.com;"),
            vec!["c@example.com", "d@example.com"]
        );
        assert!(recipient_addresses("").is_empty());
    }

    #[test]
    fn rfc3339_date_is_accepted() {
        let parsed = parse_date("2023-10-02T13:00:00+02:00").expect("rfc3339 parses");
        assert_eq!(parsed.to_rfc3339(), "2023-10-02T13:00:00+02:00");
    }

    #[test]
    fn malformed_or_missing_date_is_absent() {
        assert!(parse_date("").is_none());
        assert!(parse_date("not a date").is_none());
        assert!(parse_date("garbage").is_none());
        assert!(parse_date("Tuesday").is_none());
        assert!(parse_date("hello world 12").is_none());
        let parsed = parse_date("Mon, 02 Oct 2023 13:00:00 +0200").expect("valid date parses");
        assert_eq!(parsed.to_rfc3339(), "2023-10-02T13:00:00+02:00");
    }

    #[test]
    fn summary_decodes_headers_and_tolerates_bad_date() {
        let headers = b"Subject: =?utf-8?B?VGVzdA==?=\r\nFrom: Sender Name <test@example.com>\r\nDate: garbage\r\n\r\n";
        let summary = summarize(42, headers, true).expect("summary builds");
        assert_eq!(summary.uid, "42");
        assert_eq!(summary.subject, "Test");
        assert_eq!(summary.sender_address.as_deref(), Some("test@example.com"));
        assert!(summary.sent_at.is_none());
        assert!(summary.seen);
    }

    #[test]
    fn summary_without_subject_has_empty_subject() {
        let summary = summarize(1, b"From: a@example.com\r\n\r\n", false).expect("summary builds");
        assert_eq!(summary.subject, "");
        assert!(!summary.seen);
    }

    #[test]
    fn multipart_prefers_plain_text_part() {
        let raw = concat!(
            "From: a@example.com\r\n",
            "To: Bee <b@example.com>\r\n",
            "Subject: Hi\r\n",
            "Message-ID: <1@example.com>\r\n",
            "Content-Type: multipart/alternative; boundary=\"b\"\r\n",
            "\r\n",
            "--b\r\n",
            "Content-Type: text/plain\r\n\r\n",
            "plain\r\n",
            "--b\r\n",
            "Content-Type: text/html\r\n\r\n",
            "<b>html</b><script>x()</script>\r\n",
            "--b--\r\n",
        );
        let parsed = parse_message(raw.as_bytes()).expect("parse should succeed");
        assert_eq!(parsed.text_body().trim(), "plain");
        assert_eq!(parsed.message_id.as_deref(), Some("<1@example.com>"));
        assert_eq!(parsed.to, vec!["b@example.com"]);
        let html = parsed.sanitized_html().expect("html part present");
        assert!(html.contains("<b>html</b>"));
        assert!(!html.contains("script"));
    }

    #[test]
    fn html_only_body_is_rendered_as_text() {
        let raw = b"Subject: Hi\r\nContent-Type: text/html\r\n\r\n<p>Hello <b>there</b></p>";
        let parsed = parse_message(raw).expect("parse should succeed");
        assert!(parsed.body_text.is_none());
        assert!(parsed.text_body().contains("Hello"));
        assert!(parsed.message_id.is_none());
    }

    #[test]
    fn attachment_parts_are_not_bodies() {
        let raw = concat!(
            "Subject: Files\r\n",
            "Content-Type: multipart/mixed; boundary=\"b\"\r\n",
            "\r\n",
            "--b\r\n",
            "Content-Type: text/plain\r\n",
            "Content-Disposition: attachment; filename=\"notes.txt\"\r\n\r\n",
            "attached\r\n",
            "--b\r\n",
            "Content-Type: text/plain\r\n\r\n",
            "inline body\r\n",
            "--b--\r\n",
        );
        let parsed = parse_message(raw.as_bytes()).expect("parse should succeed");
        assert_eq!(parsed.text_body().trim(), "inline body");
    }
}
