use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

pub mod attachments;
pub mod decode;
pub mod display;
pub mod imap;
pub mod invoice;
pub mod message_uid;
pub mod search_criteria;
pub mod session;
pub mod structure;
pub mod summary;

use crate::mail_reader::attachments::{fetch_full_messages, ExtractionContext, FullMessage};
use crate::mail_reader::decode::{MailparseDecoder, MessageDecoder};
use crate::mail_reader::imap::{Credentials, ImapSession};
use crate::mail_reader::invoice::invoice_settings::{
    load_invoice_classifier_settings, InvoiceClassifierSettings,
};
use crate::mail_reader::invoice::InvoiceClassifier;
use crate::mail_reader::session::{MailSession, SessionResult};
use crate::mail_reader::summary::{fetch_summaries, EmailSummary, SummaryOptions};
use crate::settings::Config;

/// The list and detail pipelines, configured once and shared by every request.
#[derive(Clone)]
pub struct MailReader {
    classifier: InvoiceClassifier,
    extraction: ExtractionContext,
}

impl MailReader {
    pub fn new(
        classifier: InvoiceClassifier,
        decoder: Arc<dyn MessageDecoder>,
        uid_tag: &str,
        decode_timeout: Duration,
    ) -> Self {
        MailReader {
            classifier,
            extraction: ExtractionContext {
                decoder,
                uid_tag: uid_tag.to_string(),
                decode_timeout,
            },
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let classifier_settings = match &config.classifier_settings {
            Some(path) => load_invoice_classifier_settings(path)?,
            None => InvoiceClassifierSettings::default(),
        };

        Ok(MailReader::new(
            InvoiceClassifier::new(classifier_settings),
            Arc::new(MailparseDecoder),
            &config.imap.uid_tag,
            Duration::from_secs(config.fetch.decode_timeout_seconds),
        ))
    }

    pub fn uid_tag(&self) -> &str {
        &self.extraction.uid_tag
    }

    pub async fn list_summaries<S: MailSession>(
        &self,
        session: S,
        options: &SummaryOptions,
    ) -> SessionResult<Vec<EmailSummary>> {
        fetch_summaries(session, &self.classifier, self.uid_tag(), options).await
    }

    pub async fn fetch_attachments<S: MailSession>(
        &self,
        session: S,
        message_uids: &[String],
    ) -> SessionResult<Vec<FullMessage>> {
        fetch_full_messages(session, &self.extraction, message_uids).await
    }
}

pub async fn print_summaries(config: &Config, credentials: &Credentials, options: &SummaryOptions) -> Result<()> {
    let reader = MailReader::from_config(config)?;
    let session = ImapSession::open(&config.imap, credentials, config.fetch.preview_bytes).await?;
    let summaries = reader.list_summaries(session, options).await?;
    display::display_as_json(&summaries);
    Ok(())
}

pub async fn print_full_messages(config: &Config, credentials: &Credentials, message_uids: &[String]) -> Result<()> {
    let reader = MailReader::from_config(config)?;
    let session = ImapSession::open(&config.imap, credentials, config.fetch.preview_bytes).await?;
    let messages = reader.fetch_attachments(session, message_uids).await?;
    display::display_as_json(&messages);
    Ok(())
}
