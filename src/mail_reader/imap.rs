use std::borrow::Cow;
use std::fmt;
use std::time::Duration;

use async_imap::imap_proto::types::{BodyContentCommon, BodyStructure};
use async_imap::types::{Fetch, Flag};
use async_imap::{Client, Session};
use async_trait::async_trait;
use futures::{stream, StreamExt, TryStreamExt};
use itertools::Itertools;
use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_native_tls::TlsStream;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

use crate::mail_reader::search_criteria::SearchCriteria;
use crate::mail_reader::session::{
    EventStream, MailSession, MessageAttributes, PartKind, RawEvent, SessionError, SessionResult,
    SummaryEvent,
};
use crate::mail_reader::structure::{PartInfo, StructureNode};
use crate::settings::ImapConfig;

type ImapStream = Compat<TlsStream<TcpStream>>;

// body sections are handed on in chunks of this size
const FRAGMENT_SIZE: usize = 16 * 1024;

/// Per-request mailbox credentials. The password never shows up in logs.
#[derive(Clone)]
pub struct Credentials {
    pub email: String,
    pub app_password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("app_password", &"<redacted>")
            .finish()
    }
}

impl From<async_imap::error::Error> for SessionError {
    fn from(err: async_imap::error::Error) -> Self {
        match err {
            async_imap::error::Error::Io(e) => SessionError::Connection {
                server: "IMAP server".to_string(),
                reason: e.to_string(),
            },
            other => SessionError::Protocol(other.to_string()),
        }
    }
}

fn connection_error(config: &ImapConfig, reason: impl fmt::Display) -> SessionError {
    SessionError::Connection {
        server: format!("{}:{}", config.server, config.port),
        reason: reason.to_string(),
    }
}

// Establish a TLS-encrypted connection to the IMAP server
async fn connect_to_server(config: &ImapConfig) -> SessionResult<TlsStream<TcpStream>> {
    let seconds = config.connect_timeout_seconds;
    let connect = async {
        let tcp_stream = TcpStream::connect((config.server.as_str(), config.port))
            .await
            .map_err(|e| connection_error(config, e))?;
        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|e| connection_error(config, e))?;
        tokio_native_tls::TlsConnector::from(connector)
            .connect(&config.server, tcp_stream)
            .await
            .map_err(|e| connection_error(config, e))
    };

    let tls_stream = timeout(Duration::from_secs(seconds), connect)
        .await
        .map_err(|_| SessionError::Timeout { stage: "connect", seconds })??;

    info!("-- connected to {}:{}", config.server, config.port);
    Ok(tls_stream)
}

// Login to the IMAP server and return an authenticated session
async fn login_to_server(
    config: &ImapConfig,
    client: Client<ImapStream>,
    credentials: &Credentials,
) -> SessionResult<Session<ImapStream>> {
    let seconds = config.auth_timeout_seconds;
    let imap_session = timeout(
        Duration::from_secs(seconds),
        client.login(&credentials.email, &credentials.app_password),
    )
    .await
    .map_err(|_| SessionError::Timeout { stage: "login", seconds })?
    .map_err(|(e, _client)| SessionError::Authentication(e.to_string()))?;

    info!("-- logged in as {}", credentials.email);
    Ok(imap_session)
}

fn flag_name(flag: &Flag<'_>) -> String {
    match flag {
        Flag::Seen => "\\Seen".to_string(),
        Flag::Answered => "\\Answered".to_string(),
        Flag::Flagged => "\\Flagged".to_string(),
        Flag::Deleted => "\\Deleted".to_string(),
        Flag::Draft => "\\Draft".to_string(),
        Flag::Recent => "\\Recent".to_string(),
        Flag::MayCreate => "\\*".to_string(),
        Flag::Custom(name) => name.to_string(),
    }
}

fn param_value(params: Option<&[(Cow<'_, str>, Cow<'_, str>)]>, key: &str) -> Option<String> {
    params?
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(key))
        .map(|(_, value)| value.to_string())
}

fn leaf_from_common(common: &BodyContentCommon<'_>) -> StructureNode {
    let disposition = common.disposition.as_ref();
    StructureNode::Leaf(PartInfo {
        content_type: common.ty.ty.to_string(),
        subtype: common.ty.subtype.to_string(),
        disposition: disposition.map(|d| d.ty.to_string()),
        disposition_filename: disposition.and_then(|d| param_value(d.params.as_deref(), "filename")),
        name: param_value(common.ty.params.as_deref(), "name"),
    })
}

/// Converts a BODYSTRUCTURE into the walker's tree. An embedded
/// message/rfc822 becomes a group of its own part followed by its body.
pub fn structure_from_imap(structure: &BodyStructure<'_>) -> StructureNode {
    match structure {
        BodyStructure::Multipart { bodies, .. } => {
            StructureNode::Group(bodies.iter().map(structure_from_imap).collect())
        }
        BodyStructure::Message { common, body, .. } => {
            StructureNode::Group(vec![leaf_from_common(common), structure_from_imap(body)])
        }
        BodyStructure::Basic { common, .. } | BodyStructure::Text { common, .. } => {
            leaf_from_common(common)
        }
    }
}

fn push_fragments<F>(events: &mut Vec<F>, data: &[u8], fragment: impl Fn(Vec<u8>) -> F) {
    events.extend(data.chunks(FRAGMENT_SIZE).map(|chunk| fragment(chunk.to_vec())));
}

fn summary_events(fetch: &Fetch) -> Vec<SummaryEvent> {
    let seq = fetch.message;
    let mut events = vec![SummaryEvent::Start(seq)];

    for (part, data) in [(PartKind::Header, fetch.header()), (PartKind::Text, fetch.text())] {
        if let Some(data) = data {
            push_fragments(&mut events, data, |bytes| SummaryEvent::BodyFragment { seq, part, bytes });
            events.push(SummaryEvent::BodyPartEnd { seq, part });
        }
    }

    events.push(SummaryEvent::Attributes {
        seq,
        attributes: MessageAttributes {
            uid: fetch.uid,
            flags: fetch.flags().map(|flag| flag_name(&flag)).collect(),
            date: fetch.internal_date(),
            structure: fetch.bodystructure().map(structure_from_imap),
        },
    });
    events.push(SummaryEvent::MessageEnd(seq));
    events
}

fn raw_events(fetch: &Fetch) -> Vec<RawEvent> {
    let seq = fetch.message;
    let mut events = vec![RawEvent::Start(seq)];
    if let Some(body) = fetch.body() {
        push_fragments(&mut events, body, |bytes| RawEvent::BodyFragment { seq, bytes });
    }
    events.push(RawEvent::Attributes {
        seq,
        uid: fetch.uid,
        structure: fetch.bodystructure().map(structure_from_imap),
    });
    events.push(RawEvent::MessageEnd(seq));
    events
}

/// An authenticated IMAP session over TLS. Logging out happens in `close`,
/// which is idempotent.
pub struct ImapSession {
    session: Option<Session<ImapStream>>,
    preview_bytes: u32,
}

impl ImapSession {
    pub async fn connect(config: &ImapConfig, credentials: &Credentials, preview_bytes: u32) -> SessionResult<Self> {
        let tls_stream = connect_to_server(config).await?;
        let client = Client::new(tls_stream.compat());
        let session = login_to_server(config, client, credentials).await?;
        Ok(ImapSession {
            session: Some(session),
            preview_bytes,
        })
    }

    /// Connects and opens the configured mailbox read-only.
    pub async fn open(config: &ImapConfig, credentials: &Credentials, preview_bytes: u32) -> SessionResult<Self> {
        let mut imap_session = Self::connect(config, credentials, preview_bytes).await?;
        if let Err(e) = imap_session.examine(&config.mailbox).await {
            let _ = imap_session.close().await;
            return Err(e);
        }
        Ok(imap_session)
    }

    fn session_mut(&mut self) -> SessionResult<&mut Session<ImapStream>> {
        self.session.as_mut().ok_or(SessionError::Closed)
    }

    async fn examine(&mut self, mailbox: &str) -> SessionResult<()> {
        let mailbox_data = self.session_mut()?.examine(mailbox).await?;
        info!("-- {} selected, {} messages", mailbox, mailbox_data.exists);
        Ok(())
    }

    pub async fn list_folders(&mut self) -> SessionResult<Vec<String>> {
        let names: Vec<_> = self
            .session_mut()?
            .list(Some(""), Some("*"))
            .await?
            .try_collect()
            .await?;
        Ok(names.iter().map(|name| name.name().to_string()).collect())
    }
}

#[async_trait]
impl MailSession for ImapSession {
    async fn search(&mut self, criteria: &SearchCriteria) -> SessionResult<Vec<u32>> {
        let query = criteria.to_imap_query();
        let mut uids: Vec<u32> = self.session_mut()?.uid_search(&query).await?.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    async fn fetch_summary_fragments<'a>(
        &'a mut self,
        uids: &[u32],
        header_fields: &[&str],
    ) -> SessionResult<EventStream<'a, SummaryEvent>> {
        let query = format!(
            "(UID FLAGS INTERNALDATE BODYSTRUCTURE BODY.PEEK[HEADER.FIELDS ({})] BODY.PEEK[TEXT]<0.{}>)",
            header_fields.join(" "),
            self.preview_bytes
        );
        let uid_set = uids.iter().join(",");
        debug!("UID FETCH {} {}", uid_set, query);

        let fetches = self.session_mut()?.uid_fetch(uid_set, query).await?;
        Ok(fetches
            .map_err(SessionError::from)
            .map_ok(|fetch| stream::iter(summary_events(&fetch).into_iter().map(Ok)))
            .try_flatten()
            .boxed())
    }

    async fn fetch_raw<'a>(&'a mut self, uids: &[u32]) -> SessionResult<EventStream<'a, RawEvent>> {
        let uid_set = uids.iter().join(",");
        let fetches = self
            .session_mut()?
            .uid_fetch(uid_set, "(UID BODYSTRUCTURE BODY.PEEK[])")
            .await?;
        Ok(fetches
            .map_err(SessionError::from)
            .map_ok(|fetch| stream::iter(raw_events(&fetch).into_iter().map(Ok)))
            .try_flatten()
            .boxed())
    }

    async fn close(&mut self) -> SessionResult<()> {
        if let Some(mut session) = self.session.take() {
            // Be nice to the server and log out
            session.logout().await?;
            info!("-- logged out");
        }
        Ok(())
    }
}

/// Opens a session just long enough to list the account's folders.
pub async fn list_mailbox_folders(config: &ImapConfig, credentials: &Credentials) -> SessionResult<Vec<String>> {
    let mut imap_session = ImapSession::connect(config, credentials, 0).await?;
    let folders = imap_session.list_folders().await;
    if let Err(e) = imap_session.close().await {
        warn!("Cannot close session: {}", e);
    }
    folders
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_imap::imap_proto::types::{
        BodyContentSinglePart, BodyParams, ContentDisposition, ContentEncoding, ContentType, Envelope,
    };

    fn params<'a>(key: &'a str, value: Option<&'a str>) -> BodyParams<'a> {
        value.map(|v| vec![(Cow::Borrowed(key), Cow::Borrowed(v))])
    }

    fn common<'a>(
        ty: &'a str,
        subtype: &'a str,
        name: Option<&'a str>,
        disposition: Option<&'a str>,
        filename: Option<&'a str>,
    ) -> BodyContentCommon<'a> {
        BodyContentCommon {
            ty: ContentType {
                ty: Cow::Borrowed(ty),
                subtype: Cow::Borrowed(subtype),
                params: params("name", name),
            },
            disposition: disposition.map(|d| ContentDisposition {
                ty: Cow::Borrowed(d),
                params: params("filename", filename),
            }),
            language: None,
            location: None,
        }
    }

    fn single_part() -> BodyContentSinglePart<'static> {
        BodyContentSinglePart {
            id: None,
            md5: None,
            description: None,
            transfer_encoding: ContentEncoding::Base64,
            octets: 2048,
        }
    }

    fn basic(common: BodyContentCommon<'_>) -> BodyStructure<'_> {
        BodyStructure::Basic { common, other: single_part(), extension: None }
    }

    fn text(subtype: &str) -> BodyStructure<'_> {
        BodyStructure::Text {
            common: common("TEXT", subtype, None, None, None),
            other: single_part(),
            lines: 4,
            extension: None,
        }
    }

    fn multipart<'a>(subtype: &'a str, bodies: Vec<BodyStructure<'a>>) -> BodyStructure<'a> {
        BodyStructure::Multipart {
            common: common("MULTIPART", subtype, None, None, None),
            bodies,
            extension: None,
        }
    }

    fn envelope() -> Envelope<'static> {
        Envelope {
            date: None,
            subject: None,
            from: None,
            sender: None,
            reply_to: None,
            to: None,
            cc: None,
            bcc: None,
            in_reply_to: None,
            message_id: None,
        }
    }

    #[test]
    fn test_structure_with_inline_pdf() {
        let structure = multipart(
            "MIXED",
            vec![
                multipart("ALTERNATIVE", vec![text("PLAIN"), text("HTML")]),
                basic(common("APPLICATION", "PDF", None, Some("INLINE"), Some("factura.pdf"))),
            ],
        );

        let tree = structure_from_imap(&structure);

        assert_eq!(
            tree,
            StructureNode::Group(vec![
                StructureNode::Group(vec![
                    StructureNode::Leaf(PartInfo::new("TEXT", "PLAIN")),
                    StructureNode::Leaf(PartInfo::new("TEXT", "HTML")),
                ]),
                StructureNode::Leaf(
                    PartInfo::new("APPLICATION", "PDF")
                        .with_disposition("INLINE")
                        .with_filename("factura.pdf")
                ),
            ])
        );
        assert!(tree.has_attachment());
        assert_eq!(tree.interesting_parts().len(), 1);
    }

    #[test]
    fn test_structure_with_named_pdf_only() {
        let structure = multipart(
            "MIXED",
            vec![text("PLAIN"), basic(common("APPLICATION", "OCTET-STREAM", Some("scan.PDF"), None, None))],
        );

        let tree = structure_from_imap(&structure);

        assert_eq!(
            tree,
            StructureNode::Group(vec![
                StructureNode::Leaf(PartInfo::new("TEXT", "PLAIN")),
                StructureNode::Leaf(PartInfo::new("APPLICATION", "OCTET-STREAM").with_name("scan.PDF")),
            ])
        );
        assert!(tree.has_attachment());
    }

    #[test]
    fn test_structure_of_plain_text_has_no_attachment() {
        let tree = structure_from_imap(&multipart("ALTERNATIVE", vec![text("PLAIN"), text("HTML")]));
        assert!(!tree.has_attachment());
    }

    #[test]
    fn test_structure_with_forwarded_message() {
        let forwarded = multipart(
            "MIXED",
            vec![
                text("PLAIN"),
                basic(common("APPLICATION", "PDF", Some("a.pdf"), Some("ATTACHMENT"), Some("a.pdf"))),
            ],
        );
        let structure = multipart(
            "MIXED",
            vec![
                text("PLAIN"),
                BodyStructure::Message {
                    common: common("MESSAGE", "RFC822", None, None, None),
                    other: single_part(),
                    envelope: envelope(),
                    body: Box::new(forwarded),
                    lines: 20,
                    extension: None,
                },
            ],
        );

        let tree = structure_from_imap(&structure);

        let StructureNode::Group(children) = &tree else {
            panic!("multipart should become a group");
        };
        assert_eq!(children.len(), 2);
        assert_eq!(
            children[1],
            StructureNode::Group(vec![
                StructureNode::Leaf(PartInfo::new("MESSAGE", "RFC822")),
                StructureNode::Group(vec![
                    StructureNode::Leaf(PartInfo::new("TEXT", "PLAIN")),
                    StructureNode::Leaf(
                        PartInfo::new("APPLICATION", "PDF")
                            .with_disposition("ATTACHMENT")
                            .with_filename("a.pdf")
                            .with_name("a.pdf")
                    ),
                ]),
            ])
        );
        assert!(tree.has_attachment());
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let credentials = Credentials {
            email: "me@yahoo.com".to_string(),
            app_password: "hunter2".to_string(),
        };
        let printed = format!("{:?}", credentials);
        assert!(printed.contains("me@yahoo.com"));
        assert!(!printed.contains("hunter2"));
    }

    #[test]
    fn test_param_lookup_ignores_case() {
        let params = vec![(Cow::Borrowed("NAME"), Cow::Borrowed("Factura.pdf"))];
        assert_eq!(param_value(Some(params.as_slice()), "name"), Some("Factura.pdf".to_string()));
        assert_eq!(param_value(Some(params.as_slice()), "filename"), None);
        assert_eq!(param_value(None, "name"), None);
    }

    #[test]
    fn test_push_fragments_splits_large_sections() {
        let data = vec![b'a'; FRAGMENT_SIZE * 2 + 10];
        let mut events = Vec::new();
        push_fragments(&mut events, &data, |bytes| RawEvent::BodyFragment { seq: 1, bytes });
        assert_eq!(events.len(), 3);
    }
}
