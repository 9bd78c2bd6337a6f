//! The mailbox session as seen by the retrieval pipeline.
//!
//! A session is opened per request, already positioned on the mailbox, and
//! delivers fetch results as a stream of per-message fragments. The stream
//! ending is the batch-level "all messages delivered" signal.

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use futures::stream::BoxStream;
use thiserror::Error;

use crate::mail_reader::search_criteria::SearchCriteria;
use crate::mail_reader::structure::StructureNode;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("cannot connect to {server}: {reason}")]
    Connection { server: String, reason: String },
    #[error("{stage} timed out after {seconds}s")]
    Timeout { stage: &'static str, seconds: u64 },
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("IMAP error: {0}")]
    Protocol(String),
    #[error("session is closed")]
    Closed,
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Which requested body section a fragment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartKind {
    Header,
    Text,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageAttributes {
    pub uid: Option<u32>,
    pub flags: Vec<String>,
    pub date: Option<DateTime<FixedOffset>>,
    pub structure: Option<StructureNode>,
}

/// Fragments of a summary fetch, correlated by sequence number.
#[derive(Debug, Clone, PartialEq)]
pub enum SummaryEvent {
    Start(u32),
    BodyFragment { seq: u32, part: PartKind, bytes: Vec<u8> },
    BodyPartEnd { seq: u32, part: PartKind },
    Attributes { seq: u32, attributes: MessageAttributes },
    MessageEnd(u32),
}

/// Fragments of a full raw-message fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum RawEvent {
    Start(u32),
    BodyFragment { seq: u32, bytes: Vec<u8> },
    Attributes { seq: u32, uid: Option<u32>, structure: Option<StructureNode> },
    MessageEnd(u32),
}

pub type EventStream<'a, T> = BoxStream<'a, SessionResult<T>>;

#[async_trait]
pub trait MailSession: Send {
    /// UIDs matching the criteria, ascending.
    async fn search(&mut self, criteria: &SearchCriteria) -> SessionResult<Vec<u32>>;

    async fn fetch_summary_fragments<'a>(
        &'a mut self,
        uids: &[u32],
        header_fields: &[&str],
    ) -> SessionResult<EventStream<'a, SummaryEvent>>;

    /// Full message bytes, addressed by UID rather than sequence number.
    async fn fetch_raw<'a>(&'a mut self, uids: &[u32]) -> SessionResult<EventStream<'a, RawEvent>>;

    async fn close(&mut self) -> SessionResult<()>;
}
