use chrono::{DateTime, Utc};
use mailparse::{dateparse, parse_mail, DispositionType, MailHeaderMap, ParsedMail};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("message body is empty")]
    Empty,
    #[error("cannot parse message: {0}")]
    Parse(#[from] mailparse::MailParseError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAttachment {
    pub filename: Option<String>,
    pub content_type: String,
    pub size: usize,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedMessage {
    pub subject: Option<String>,
    pub from: Option<String>,
    pub date: Option<DateTime<Utc>>,
    pub html_body: Option<String>,
    pub text_body: Option<String>,
    pub attachments: Vec<DecodedAttachment>,
}

/// Turns raw RFC 5322 bytes into headers, bodies and attachment parts.
pub trait MessageDecoder: Send + Sync {
    fn decode(&self, raw: &[u8]) -> Result<DecodedMessage, DecodeError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MailparseDecoder;

/// Parses a Date header value, RFC 2822 first and mailparse's lenient parser
/// second. `None` when the value is not a date.
pub fn parse_date_header(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(date) = DateTime::parse_from_rfc2822(value) {
        return Some(date.with_timezone(&Utc));
    }
    match dateparse(value) {
        // dateparse answers 0 for input it cannot read
        Ok(0) | Err(_) => None,
        Ok(timestamp) => DateTime::from_timestamp(timestamp, 0),
    }
}

fn collect_parts(part: &ParsedMail, decoded: &mut DecodedMessage) -> Result<(), DecodeError> {
    if !part.subparts.is_empty() {
        for subpart in &part.subparts {
            collect_parts(subpart, decoded)?;
        }
        return Ok(());
    }

    let mimetype = part.ctype.mimetype.to_ascii_lowercase();
    let disposition = part.get_content_disposition();
    let filename = disposition
        .params
        .get("filename")
        .or_else(|| part.ctype.params.get("name"))
        .cloned();

    let is_attachment = disposition.disposition == DispositionType::Attachment
        || filename.is_some()
        || !(mimetype.starts_with("text/") || mimetype.starts_with("multipart/"));

    if is_attachment {
        let content = part.get_body_raw()?;
        decoded.attachments.push(DecodedAttachment {
            filename,
            content_type: mimetype,
            size: content.len(),
            content,
        });
    } else if mimetype == "text/html" {
        if decoded.html_body.is_none() {
            decoded.html_body = Some(part.get_body()?);
        }
    } else if mimetype == "text/plain" && decoded.text_body.is_none() {
        decoded.text_body = Some(part.get_body()?);
    }

    Ok(())
}

impl MessageDecoder for MailparseDecoder {
    fn decode(&self, raw: &[u8]) -> Result<DecodedMessage, DecodeError> {
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Err(DecodeError::Empty);
        }

        let parsed_mail = parse_mail(raw)?;

        let mut decoded = DecodedMessage {
            subject: parsed_mail.headers.get_first_value("Subject"),
            from: parsed_mail.headers.get_first_value("From"),
            date: parsed_mail
                .headers
                .get_first_value("Date")
                .and_then(|d| parse_date_header(&d)),
            ..Default::default()
        };

        collect_parts(&parsed_mail, &mut decoded)?;
        Ok(decoded)
    }
}
