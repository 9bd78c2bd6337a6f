use std::collections::HashMap;
use std::sync::OnceLock;

use chrono::{DateTime, NaiveDate, Utc};
use futures::TryStreamExt;
use log::{debug, info, warn};
use mailparse::parse_headers;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mail_reader::decode::parse_date_header;
use crate::mail_reader::invoice::InvoiceClassifier;
use crate::mail_reader::message_uid::encode_message_uid;
use crate::mail_reader::search_criteria::build_criteria;
use crate::mail_reader::session::{
    MailSession, MessageAttributes, PartKind, SessionResult, SummaryEvent,
};
use crate::mail_reader::structure::has_attachments;

pub const SUMMARY_HEADER_FIELDS: [&str; 4] = ["FROM", "TO", "SUBJECT", "DATE"];
pub const NO_SUBJECT: &str = "(Sin asunto)";

const PREVIEW_CHARS: usize = 300;
const SNIPPET_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailSummary {
    pub message_uid: String,
    pub subject: String,
    pub from_name: String,
    pub from_email: String,
    pub received_at: DateTime<Utc>,
    pub snippet: String,
    pub has_attachments: bool,
    pub is_possible_invoice: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SummaryOptions {
    /// Zero means no limit.
    pub limit: usize,
    pub received_after: Option<NaiveDate>,
    pub received_before: Option<NaiveDate>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FinalizeError {
    #[error("message {0} has no UID attribute")]
    MissingUid(u32),
    #[error("message {0} has neither a Date header nor an internal date")]
    MissingDate(u32),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Sender {
    pub name: String,
    pub email: String,
}

type HeaderMap = HashMap<String, Vec<String>>;

fn from_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"^\s*(?:"?([^"<]*?)"?\s*<([^<>\s]+@[^<>\s]+)>|<?([^<>\s]+@[^<>\s]+)>?)\s*$"#)
            .expect("from pattern is valid")
    })
}

fn tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"<[^>]*>").expect("tag pattern is valid"))
}

fn whitespace_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\s+").expect("whitespace pattern is valid"))
}

/// Splits a single-address From value into display name and address.
///
/// Only handles `Name <addr>`, `"Name" <addr>`, `<addr>` and bare `addr`.
/// Quoted names containing `<` or `"`, group syntax and address lists fall
/// through to the raw value being used as the address.
pub fn parse_from_header(raw: &str) -> Sender {
    match from_pattern().captures(raw) {
        Some(captures) => {
            let name = captures.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
            let email = captures
                .get(2)
                .or_else(|| captures.get(3))
                .map(|m| m.as_str().trim())
                .unwrap_or(raw);
            Sender {
                name: name.to_string(),
                email: email.to_string(),
            }
        }
        None => Sender {
            name: String::new(),
            email: raw.trim().to_string(),
        },
    }
}

/// Strips tag-like markup, collapses whitespace and truncates to the snippet length.
pub fn clean_snippet(preview: &str) -> String {
    let without_tags = tag_pattern().replace_all(preview, "");
    let collapsed = whitespace_pattern().replace_all(&without_tags, " ");
    collapsed.trim().chars().take(SNIPPET_CHARS).collect()
}

/// The `limit` numerically highest UIDs, most recent first.
pub fn select_recent(uids: &[u32], limit: usize) -> Vec<u32> {
    let mut sorted = uids.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    let take = if limit == 0 { sorted.len() } else { limit };
    sorted.into_iter().rev().take(take).collect()
}

fn parse_header_date(value: &str) -> Option<DateTime<Utc>> {
    let parsed = parse_date_header(value);
    if parsed.is_none() {
        debug!("Unparseable Date header {:?}", value);
    }
    parsed
}

/// Accumulator for one in-flight message of a summary fetch.
#[derive(Debug, Default)]
struct PendingMessage {
    header_bytes: Vec<u8>,
    text_bytes: Vec<u8>,
    headers: HeaderMap,
    preview: String,
    attributes: MessageAttributes,
}

impl PendingMessage {
    fn push_fragment(&mut self, part: PartKind, bytes: &[u8]) {
        match part {
            PartKind::Header => self.header_bytes.extend_from_slice(bytes),
            PartKind::Text => self.text_bytes.extend_from_slice(bytes),
        }
    }

    fn complete_part(&mut self, seq: u32, part: PartKind) {
        match part {
            PartKind::Header => {
                let raw = std::mem::take(&mut self.header_bytes);
                match parse_headers(&raw) {
                    Ok((headers, _)) => {
                        for header in headers {
                            self.headers
                                .entry(header.get_key().to_ascii_lowercase())
                                .or_default()
                                .push(header.get_value());
                        }
                    }
                    Err(e) => warn!("Cannot parse headers of message {}: {}", seq, e),
                }
            }
            PartKind::Text => {
                let raw = std::mem::take(&mut self.text_bytes);
                self.preview = String::from_utf8_lossy(&raw).chars().take(PREVIEW_CHARS).collect();
            }
        }
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    fn finalize(
        self,
        seq: u32,
        classifier: &InvoiceClassifier,
        uid_tag: &str,
    ) -> Result<EmailSummary, FinalizeError> {
        let uid = self.attributes.uid.ok_or(FinalizeError::MissingUid(seq))?;

        let sender = parse_from_header(self.header("from").unwrap_or_default());

        let subject = self
            .header("subject")
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(NO_SUBJECT)
            .to_string();

        let received_at = self
            .header("date")
            .and_then(parse_header_date)
            .or_else(|| self.attributes.date.map(|d| d.with_timezone(&Utc)))
            .ok_or(FinalizeError::MissingDate(seq))?;

        let snippet = clean_snippet(&self.preview);
        let has_attachments = has_attachments(self.attributes.structure.as_ref());
        let is_possible_invoice =
            classifier.is_possible_invoice(&subject, &snippet, &sender.email, has_attachments);

        Ok(EmailSummary {
            message_uid: encode_message_uid(uid, uid_tag),
            subject,
            from_name: sender.name,
            from_email: sender.email,
            received_at,
            snippet,
            has_attachments,
            is_possible_invoice,
        })
    }
}

/// Routes fragments to per-message accumulators and collects finished summaries.
struct SummaryAggregator<'a> {
    classifier: &'a InvoiceClassifier,
    uid_tag: &'a str,
    request_order: HashMap<u32, usize>,
    pending: HashMap<u32, PendingMessage>,
    finished: Vec<(usize, EmailSummary)>,
}

impl<'a> SummaryAggregator<'a> {
    fn new(classifier: &'a InvoiceClassifier, uid_tag: &'a str, requested: &[u32]) -> Self {
        SummaryAggregator {
            classifier,
            uid_tag,
            request_order: requested.iter().enumerate().map(|(i, uid)| (*uid, i)).collect(),
            pending: HashMap::new(),
            finished: Vec::new(),
        }
    }

    fn slot(&mut self, seq: u32) -> &mut PendingMessage {
        self.pending.entry(seq).or_insert_with(|| {
            warn!("Fragment for message {} arrived before its start", seq);
            PendingMessage::default()
        })
    }

    fn handle(&mut self, event: SummaryEvent) {
        match event {
            SummaryEvent::Start(seq) => {
                if self.pending.insert(seq, PendingMessage::default()).is_some() {
                    warn!("Message {} started twice, discarding earlier fragments", seq);
                }
            }
            SummaryEvent::BodyFragment { seq, part, bytes } => {
                self.slot(seq).push_fragment(part, &bytes);
            }
            SummaryEvent::BodyPartEnd { seq, part } => {
                self.slot(seq).complete_part(seq, part);
            }
            SummaryEvent::Attributes { seq, attributes } => {
                debug!("Message {} uid {:?} flags {:?}", seq, attributes.uid, attributes.flags);
                self.slot(seq).attributes = attributes;
            }
            SummaryEvent::MessageEnd(seq) => {
                let Some(message) = self.pending.remove(&seq) else {
                    warn!("End of unknown message {}", seq);
                    return;
                };
                let position = message
                    .attributes
                    .uid
                    .and_then(|uid| self.request_order.get(&uid).copied())
                    .unwrap_or(usize::MAX);
                match message.finalize(seq, self.classifier, self.uid_tag) {
                    Ok(summary) => self.finished.push((position, summary)),
                    Err(e) => warn!("Skipping message: {}", e),
                }
            }
        }
    }

    /// Summaries in request order, whatever order the messages completed in.
    fn finish(mut self) -> Vec<EmailSummary> {
        if !self.pending.is_empty() {
            warn!("{} messages never completed and were dropped", self.pending.len());
        }
        self.finished.sort_by_key(|(position, _)| *position);
        self.finished.into_iter().map(|(_, summary)| summary).collect()
    }
}

async fn collect_summaries<S: MailSession>(
    session: &mut S,
    classifier: &InvoiceClassifier,
    uid_tag: &str,
    options: &SummaryOptions,
) -> SessionResult<Vec<EmailSummary>> {
    let criteria = build_criteria(options.received_after, options.received_before);
    info!("Search criteria: {}", criteria.to_imap_query());

    let uids = session.search(&criteria).await?;
    info!("Found {} matching messages", uids.len());
    if uids.is_empty() {
        return Ok(Vec::new());
    }

    let selected = select_recent(&uids, options.limit);
    info!("Fetching {} messages", selected.len());

    let mut aggregator = SummaryAggregator::new(classifier, uid_tag, &selected);
    let mut fragments = session
        .fetch_summary_fragments(&selected, &SUMMARY_HEADER_FIELDS)
        .await?;
    while let Some(event) = fragments.try_next().await? {
        aggregator.handle(event);
    }

    let summaries = aggregator.finish();
    info!("Fetched {} emails successfully", summaries.len());
    Ok(summaries)
}

/// Lists summaries for the requested date range and closes the session,
/// whether or not the fetch succeeded.
pub async fn fetch_summaries<S: MailSession>(
    mut session: S,
    classifier: &InvoiceClassifier,
    uid_tag: &str,
    options: &SummaryOptions,
) -> SessionResult<Vec<EmailSummary>> {
    let outcome = collect_summaries(&mut session, classifier, uid_tag, options).await;
    if let Err(e) = session.close().await {
        warn!("Cannot close session: {}", e);
    }
    outcome
}
