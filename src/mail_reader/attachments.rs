use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use log::{debug, error, info, warn};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::sync::mpsc;

use crate::mail_reader::decode::{DecodedMessage, MessageDecoder};
use crate::mail_reader::message_uid::{decode_message_uids, encode_message_uid};
use crate::mail_reader::session::{MailSession, RawEvent, SessionResult};
use crate::mail_reader::structure::{is_interesting_attachment, StructureNode};

const DEFAULT_FILENAME: &str = "attachment";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentRecord {
    pub filename: String,
    #[serde(rename = "contentType")]
    pub content_type: String,
    pub size: usize,
    #[serde(serialize_with = "to_base64", deserialize_with = "from_base64")]
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullMessage {
    pub message_uid: String,
    pub subject: String,
    pub from: String,
    pub date: Option<DateTime<Utc>>,
    pub html_body: Option<String>,
    pub text_body: Option<String>,
    pub attachments: Vec<AttachmentRecord>,
}

fn to_base64<S: Serializer>(content: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&BASE64.encode(content))
}

fn from_base64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    BASE64.decode(encoded).map_err(serde::de::Error::custom)
}

/// Everything the decode stage needs besides the raw bytes.
#[derive(Clone)]
pub struct ExtractionContext {
    pub decoder: Arc<dyn MessageDecoder>,
    pub uid_tag: String,
    pub decode_timeout: Duration,
}

/// Countdown of per-message decodes still outstanding for one fetch batch.
///
/// The batch is complete only when this reaches zero; the end of the fetch
/// stream means the bytes have arrived, not that they have been decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingExtraction {
    remaining: usize,
}

impl PendingExtraction {
    pub fn new(expected: usize) -> Self {
        PendingExtraction { remaining: expected }
    }

    /// One decode reported in, successfully or not.
    pub fn settle(&mut self) {
        self.settle_many(1);
    }

    pub fn settle_many(&mut self, count: usize) {
        self.remaining = self.remaining.saturating_sub(count);
    }

    pub fn expect_more(&mut self, count: usize) {
        self.remaining += count;
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn is_complete(&self) -> bool {
        self.remaining == 0
    }
}

/// Keeps only the parts invoice processing cares about.
pub fn filter_attachments(decoded: &DecodedMessage) -> Vec<AttachmentRecord> {
    decoded
        .attachments
        .iter()
        .filter(|att| is_interesting_attachment(&att.content_type, att.filename.as_deref()))
        .map(|att| {
            let filename = att.filename.clone().unwrap_or_else(|| DEFAULT_FILENAME.to_string());
            info!("Found attachment: {} ({}, {} bytes)", filename, att.content_type, att.size);
            AttachmentRecord {
                filename,
                content_type: att.content_type.clone(),
                size: att.size,
                content: att.content.clone(),
            }
        })
        .collect()
}

pub fn assemble_full_message(uid: u32, uid_tag: &str, decoded: DecodedMessage) -> FullMessage {
    let attachments = filter_attachments(&decoded);
    FullMessage {
        message_uid: encode_message_uid(uid, uid_tag),
        subject: decoded.subject.unwrap_or_default(),
        from: decoded.from.unwrap_or_default(),
        date: decoded.date,
        html_body: decoded.html_body.filter(|b| !b.is_empty()),
        text_body: decoded.text_body.filter(|b| !b.is_empty()),
        attachments,
    }
}

#[derive(Debug, Default)]
struct RawMessage {
    position: usize,
    uid: Option<u32>,
    structure: Option<StructureNode>,
    bytes: Vec<u8>,
}

struct DecodeOutcome {
    position: usize,
    message: Option<FullMessage>,
}

/// Labels of the attachments the structure advertised that are missing from
/// the decoded message.
fn undecoded_parts(structure: Option<&StructureNode>, kept: &[AttachmentRecord]) -> Vec<String> {
    let Some(structure) = structure else {
        return Vec::new();
    };
    let mut unmatched: Vec<&AttachmentRecord> = kept.iter().collect();
    let mut missing = Vec::new();
    for part in structure.interesting_parts() {
        let mime_type = part.mime_type();
        let found = unmatched.iter().position(|record| match part.filename() {
            Some(filename) => record.filename == filename,
            None => record.content_type.eq_ignore_ascii_case(&mime_type),
        });
        match found {
            Some(index) => {
                unmatched.remove(index);
            }
            None => missing.push(part.filename().map(str::to_string).unwrap_or(mime_type)),
        }
    }
    missing
}

fn spawn_decode(
    raw: RawMessage,
    uid: u32,
    context: &ExtractionContext,
    outcomes: mpsc::UnboundedSender<DecodeOutcome>,
) {
    let decoder = Arc::clone(&context.decoder);
    let uid_tag = context.uid_tag.clone();
    let position = raw.position;
    let structure = raw.structure;
    let bytes = raw.bytes;

    tokio::spawn(async move {
        let decoded = tokio::task::spawn_blocking(move || decoder.decode(&bytes)).await;
        let message = match decoded {
            Ok(Ok(decoded)) => {
                let message = assemble_full_message(uid, &uid_tag, decoded);
                let missing = undecoded_parts(structure.as_ref(), &message.attachments);
                if !missing.is_empty() {
                    warn!("Message {} advertised attachments that did not decode: {:?}", uid, missing);
                }
                Some(message)
            }
            Ok(Err(e)) => {
                error!("Error parsing message {}: {}", uid, e);
                None
            }
            Err(e) => {
                error!("Decode task for message {} failed: {}", uid, e);
                None
            }
        };
        // the receiver is gone only if the batch already gave up
        let _ = outcomes.send(DecodeOutcome { position, message });
    });
}

async fn extract<S: MailSession>(
    session: &mut S,
    context: &ExtractionContext,
    uids: &[u32],
) -> SessionResult<Vec<FullMessage>> {
    let mut pending = PendingExtraction::new(uids.len());
    let (sender, mut outcomes) = mpsc::unbounded_channel();
    let mut in_flight: HashMap<u32, RawMessage> = HashMap::new();
    let mut started = 0usize;
    let mut dispatched = 0usize;

    let mut fragments = session.fetch_raw(uids).await?;
    while let Some(event) = fragments.try_next().await? {
        match event {
            RawEvent::Start(seq) => {
                in_flight.insert(seq, RawMessage { position: started, ..Default::default() });
                started += 1;
            }
            RawEvent::BodyFragment { seq, bytes } => {
                in_flight.entry(seq).or_default().bytes.extend_from_slice(&bytes);
            }
            RawEvent::Attributes { seq, uid, structure } => {
                let raw = in_flight.entry(seq).or_default();
                raw.uid = uid;
                raw.structure = structure;
            }
            RawEvent::MessageEnd(seq) => {
                let Some(raw) = in_flight.remove(&seq) else {
                    warn!("End of unknown message {}", seq);
                    continue;
                };
                dispatched += 1;
                match raw.uid {
                    Some(uid) => spawn_decode(raw, uid, context, sender.clone()),
                    None => {
                        warn!("Message {} arrived without a UID, skipping", seq);
                        pending.settle();
                    }
                }
            }
        }
    }
    drop(fragments);
    drop(sender);

    if !in_flight.is_empty() {
        warn!("{} messages never completed and were dropped", in_flight.len());
    }
    if dispatched < uids.len() {
        let missing = uids.len() - dispatched;
        warn!("{} requested messages were not delivered", missing);
        pending.settle_many(missing);
    } else if dispatched > uids.len() {
        pending.expect_more(dispatched - uids.len());
    }

    let mut results: Vec<(usize, FullMessage)> = Vec::new();
    let barrier = async {
        while !pending.is_complete() {
            let Some(outcome) = outcomes.recv().await else {
                break;
            };
            pending.settle();
            debug!("Decode finished, {} outstanding", pending.remaining());
            if let Some(message) = outcome.message {
                results.push((outcome.position, message));
            }
        }
    };
    if tokio::time::timeout(context.decode_timeout, barrier).await.is_err() {
        warn!(
            "Gave up waiting for {} message decodes after {:?}",
            pending.remaining(),
            context.decode_timeout
        );
    }

    results.sort_by_key(|(position, _)| *position);
    info!("Fetched {} messages with attachments", results.len());
    Ok(results.into_iter().map(|(_, message)| message).collect())
}

/// Downloads and decodes the requested messages, then closes the session once
/// every decode has reported in (or the decode timeout expired).
pub async fn fetch_full_messages<S: MailSession>(
    mut session: S,
    context: &ExtractionContext,
    message_uids: &[String],
) -> SessionResult<Vec<FullMessage>> {
    let uids = decode_message_uids(message_uids);
    let outcome = if uids.is_empty() {
        Ok(Vec::new())
    } else {
        info!("Looking for UIDs: {:?}", uids);
        extract(&mut session, context, &uids).await
    };

    if let Err(e) = session.close().await {
        warn!("Cannot close session: {}", e);
    }
    outcome
}
