use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{FixedOffset, TimeZone};
use futures::stream::{self, StreamExt};

use crate::mail_reader::decode::tests::INVOICE_MAIL;
use crate::mail_reader::decode::{DecodeError, DecodedMessage, MailparseDecoder, MessageDecoder};
use crate::mail_reader::invoice::InvoiceClassifier;
use crate::mail_reader::search_criteria::{SearchCriteria, SearchTerm};
use crate::mail_reader::session::{
    EventStream, MailSession, MessageAttributes, PartKind, RawEvent, SessionError, SessionResult,
    SummaryEvent,
};
use crate::mail_reader::structure::{PartInfo, StructureNode};
use crate::mail_reader::summary::SummaryOptions;
use crate::mail_reader::MailReader;

const TAG: &str = "yahoo.imap";

/// Scripted mailbox that records what the pipeline asked of it.
#[derive(Default)]
struct FakeSession {
    search_uids: Vec<u32>,
    fail_search: bool,
    summary_events: Vec<SummaryEvent>,
    raw_events: Vec<RawEvent>,
    searches: Arc<Mutex<Vec<SearchCriteria>>>,
    fetched: Arc<Mutex<Vec<Vec<u32>>>>,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl MailSession for FakeSession {
    async fn search(&mut self, criteria: &SearchCriteria) -> SessionResult<Vec<u32>> {
        self.searches.lock().unwrap().push(criteria.clone());
        if self.fail_search {
            return Err(SessionError::Protocol("SEARCH rejected".to_string()));
        }
        Ok(self.search_uids.clone())
    }

    async fn fetch_summary_fragments<'a>(
        &'a mut self,
        uids: &[u32],
        _header_fields: &[&str],
    ) -> SessionResult<EventStream<'a, SummaryEvent>> {
        self.fetched.lock().unwrap().push(uids.to_vec());
        let events = std::mem::take(&mut self.summary_events);
        Ok(stream::iter(events.into_iter().map(Ok)).boxed())
    }

    async fn fetch_raw<'a>(&'a mut self, uids: &[u32]) -> SessionResult<EventStream<'a, RawEvent>> {
        self.fetched.lock().unwrap().push(uids.to_vec());
        let events = std::mem::take(&mut self.raw_events);
        Ok(stream::iter(events.into_iter().map(Ok)).boxed())
    }

    async fn close(&mut self) -> SessionResult<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Delegates to the real decoder after a pause, so decodes finish well after
/// the fetch stream has ended.
struct SlowDecoder(Duration);

impl MessageDecoder for SlowDecoder {
    fn decode(&self, raw: &[u8]) -> Result<DecodedMessage, DecodeError> {
        std::thread::sleep(self.0);
        MailparseDecoder.decode(raw)
    }
}

fn reader() -> MailReader {
    reader_with(Arc::new(MailparseDecoder), Duration::from_secs(5))
}

fn reader_with(decoder: Arc<dyn MessageDecoder>, decode_timeout: Duration) -> MailReader {
    MailReader::new(InvoiceClassifier::default(), decoder, TAG, decode_timeout)
}

fn summary_message(seq: u32, uid: Option<u32>, from: &str, subject: &str, text: &str) -> Vec<SummaryEvent> {
    let header = format!(
        "From: {}\r\nSubject: {}\r\nDate: Mon, 05 Feb 2024 09:30:00 +0000\r\n\r\n",
        from, subject
    );
    let attributes = MessageAttributes {
        uid,
        flags: vec!["\\Seen".to_string()],
        date: FixedOffset::east_opt(0).and_then(|tz| tz.with_ymd_and_hms(2024, 2, 5, 9, 31, 0).single()),
        structure: Some(StructureNode::Group(vec![
            StructureNode::Leaf(PartInfo::new("text", "plain")),
            StructureNode::Leaf(PartInfo::new("application", "pdf").with_disposition("attachment")),
        ])),
    };
    vec![
        SummaryEvent::Start(seq),
        SummaryEvent::BodyFragment { seq, part: PartKind::Header, bytes: header.into_bytes() },
        SummaryEvent::BodyPartEnd { seq, part: PartKind::Header },
        SummaryEvent::BodyFragment { seq, part: PartKind::Text, bytes: text.as_bytes().to_vec() },
        SummaryEvent::BodyPartEnd { seq, part: PartKind::Text },
        SummaryEvent::Attributes { seq, attributes },
        SummaryEvent::MessageEnd(seq),
    ]
}

fn raw_message(seq: u32, uid: u32, body: &str) -> Vec<RawEvent> {
    let (head, tail) = body.split_at(body.len() / 2);
    vec![
        RawEvent::Start(seq),
        RawEvent::BodyFragment { seq, bytes: head.as_bytes().to_vec() },
        RawEvent::BodyFragment { seq, bytes: tail.as_bytes().to_vec() },
        RawEvent::Attributes { seq, uid: Some(uid), structure: None },
        RawEvent::MessageEnd(seq),
    ]
}

#[tokio::test]
async fn test_summaries_skip_message_without_uid() {
    let closed = Arc::new(AtomicUsize::new(0));
    let session = FakeSession {
        search_uids: vec![10, 11, 12],
        summary_events: [
            summary_message(1, Some(10), "\"Netflix\" <info@netflix.com>", "Your receipt", "<p>Thanks</p>"),
            summary_message(2, None, "someone@example.com", "Lost", "gone"),
            summary_message(3, Some(12), "friend@example.com", "", "See   you\r\n soon"),
        ]
        .concat(),
        closed: Arc::clone(&closed),
        ..Default::default()
    };

    let summaries = reader()
        .list_summaries(session, &SummaryOptions { limit: 100, ..Default::default() })
        .await
        .unwrap();

    assert_eq!(summaries.len(), 2);
    // most recent first, as requested
    assert_eq!(summaries[0].message_uid, "<12@yahoo.imap>");
    assert_eq!(summaries[0].subject, "(Sin asunto)");
    assert_eq!(summaries[0].snippet, "See you soon");
    assert_eq!(summaries[1].message_uid, "<10@yahoo.imap>");
    assert_eq!(summaries[1].from_name, "Netflix");
    assert_eq!(summaries[1].from_email, "info@netflix.com");
    assert_eq!(summaries[1].snippet, "Thanks");
    assert!(summaries[1].has_attachments);
    assert!(summaries[1].is_possible_invoice);
    assert_eq!(summaries[1].received_at.to_rfc3339(), "2024-02-05T09:30:00+00:00");
    assert_eq!(closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_summaries_request_most_recent_uids() {
    let fetched = Arc::new(Mutex::new(Vec::new()));
    let session = FakeSession {
        search_uids: (1..=250).collect(),
        fetched: Arc::clone(&fetched),
        ..Default::default()
    };

    let summaries = reader()
        .list_summaries(session, &SummaryOptions { limit: 100, ..Default::default() })
        .await
        .unwrap();

    assert!(summaries.is_empty());
    let fetched = fetched.lock().unwrap();
    assert_eq!(fetched.len(), 1);
    assert_eq!(fetched[0], (151..=250).rev().collect::<Vec<u32>>());
}

#[tokio::test]
async fn test_summaries_search_uses_date_range() {
    let searches = Arc::new(Mutex::new(Vec::new()));
    let fetched = Arc::new(Mutex::new(Vec::new()));
    let session = FakeSession {
        searches: Arc::clone(&searches),
        fetched: Arc::clone(&fetched),
        ..Default::default()
    };
    let options = SummaryOptions {
        limit: 10,
        received_after: chrono::NaiveDate::from_ymd_opt(2024, 1, 1),
        received_before: chrono::NaiveDate::from_ymd_opt(2024, 1, 31),
    };

    let summaries = reader().list_summaries(session, &options).await.unwrap();

    assert!(summaries.is_empty());
    // no matches means no fetch at all
    assert!(fetched.lock().unwrap().is_empty());
    let searches = searches.lock().unwrap();
    assert!(searches[0].terms().contains(&SearchTerm::All));
    assert_eq!(searches[0].to_imap_query(), "ALL SINCE 1-Jan-2024 BEFORE 1-Feb-2024");
}

#[tokio::test]
async fn test_session_closed_when_search_fails() {
    let closed = Arc::new(AtomicUsize::new(0));
    let session = FakeSession {
        fail_search: true,
        closed: Arc::clone(&closed),
        ..Default::default()
    };

    let outcome = reader().list_summaries(session, &SummaryOptions::default()).await;

    assert!(matches!(outcome, Err(SessionError::Protocol(_))));
    assert_eq!(closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_attachments_skip_undecodable_message() {
    let closed = Arc::new(AtomicUsize::new(0));
    let fetched = Arc::new(Mutex::new(Vec::new()));
    let session = FakeSession {
        raw_events: [
            raw_message(1, 7, INVOICE_MAIL),
            raw_message(2, 8, "   "),
            raw_message(3, 9, INVOICE_MAIL),
        ]
        .concat(),
        fetched: Arc::clone(&fetched),
        closed: Arc::clone(&closed),
        ..Default::default()
    };
    let requested = ["<7@yahoo.imap>", "<8@yahoo.imap>", "<9@yahoo.imap>", "not-an-id", "<7@yahoo.imap>"]
        .map(str::to_string);

    let messages = reader().fetch_attachments(session, &requested).await.unwrap();

    assert_eq!(fetched.lock().unwrap()[0], vec![7, 8, 9]);
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].message_uid, "<7@yahoo.imap>");
    assert_eq!(messages[1].message_uid, "<9@yahoo.imap>");

    let invoice = &messages[0];
    assert_eq!(invoice.subject, "Tu factura de enero");
    assert_eq!(invoice.attachments.len(), 2);
    assert_eq!(invoice.attachments[0].filename, "factura.pdf");
    assert_eq!(invoice.attachments[0].content, b"%PDF-1.4\n".to_vec());
    assert_eq!(invoice.attachments[1].filename, "attachment");
    assert_eq!(invoice.attachments[1].content_type, "image/png");
    assert_eq!(closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_attachments_wait_for_slow_decodes() {
    let closed = Arc::new(AtomicUsize::new(0));
    let session = FakeSession {
        raw_events: [raw_message(1, 1, INVOICE_MAIL), raw_message(2, 2, INVOICE_MAIL)].concat(),
        closed: Arc::clone(&closed),
        ..Default::default()
    };
    let slow = reader_with(Arc::new(SlowDecoder(Duration::from_millis(200))), Duration::from_secs(10));

    let messages = slow
        .fetch_attachments(session, &["<1@yahoo.imap>".to_string(), "<2@yahoo.imap>".to_string()])
        .await
        .unwrap();

    assert_eq!(messages.len(), 2);
    assert_eq!(closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_attachments_give_up_after_decode_timeout() {
    let closed = Arc::new(AtomicUsize::new(0));
    let session = FakeSession {
        raw_events: raw_message(1, 1, INVOICE_MAIL),
        closed: Arc::clone(&closed),
        ..Default::default()
    };
    let stuck = reader_with(Arc::new(SlowDecoder(Duration::from_millis(500))), Duration::from_millis(20));

    let messages = stuck.fetch_attachments(session, &["<1@yahoo.imap>".to_string()]).await.unwrap();

    assert!(messages.is_empty());
    assert_eq!(closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_attachments_tolerate_missing_deliveries() {
    let session = FakeSession {
        raw_events: raw_message(1, 5, INVOICE_MAIL),
        ..Default::default()
    };

    let messages = reader()
        .fetch_attachments(session, &["<5@yahoo.imap>".to_string(), "<6@yahoo.imap>".to_string()])
        .await
        .unwrap();

    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].message_uid, "<5@yahoo.imap>");
}

#[tokio::test]
async fn test_invalid_ids_close_without_fetching() {
    let closed = Arc::new(AtomicUsize::new(0));
    let fetched = Arc::new(Mutex::new(Vec::new()));
    let session = FakeSession {
        fetched: Arc::clone(&fetched),
        closed: Arc::clone(&closed),
        ..Default::default()
    };

    let messages = reader()
        .fetch_attachments(session, &["12@yahoo.imap".to_string(), "<x@yahoo.imap>".to_string()])
        .await
        .unwrap();

    assert!(messages.is_empty());
    assert!(fetched.lock().unwrap().is_empty());
    assert_eq!(closed.load(Ordering::SeqCst), 1);
}
