/// One body part as reported in the server's BODYSTRUCTURE.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PartInfo {
    pub content_type: String,
    pub subtype: String,
    pub disposition: Option<String>,
    pub disposition_filename: Option<String>,
    pub name: Option<String>,
}

impl PartInfo {
    pub fn new(content_type: &str, subtype: &str) -> Self {
        PartInfo {
            content_type: content_type.to_string(),
            subtype: subtype.to_string(),
            ..Default::default()
        }
    }

    pub fn with_disposition(mut self, disposition: &str) -> Self {
        self.disposition = Some(disposition.to_string());
        self
    }

    pub fn with_filename(mut self, filename: &str) -> Self {
        self.disposition_filename = Some(filename.to_string());
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn mime_type(&self) -> String {
        format!("{}/{}", self.content_type, self.subtype).to_ascii_lowercase()
    }

    /// The disposition filename, falling back to the content-type `name`.
    pub fn filename(&self) -> Option<&str> {
        self.disposition_filename
            .as_deref()
            .or(self.name.as_deref())
    }

    fn is_pdf(&self) -> bool {
        self.content_type.eq_ignore_ascii_case("application")
            && self.subtype.eq_ignore_ascii_case("pdf")
    }

    fn is_image(&self) -> bool {
        self.content_type.eq_ignore_ascii_case("image")
    }

    fn has_disposition(&self, kind: &str) -> bool {
        self.disposition
            .as_deref()
            .map(|d| d.eq_ignore_ascii_case(kind))
            .unwrap_or(false)
    }

    fn has_pdf_filename(&self) -> bool {
        [self.disposition_filename.as_deref(), self.name.as_deref()]
            .into_iter()
            .flatten()
            .any(ends_with_pdf)
    }

    /// Inline PDFs and images count, as do PDFs with no disposition at all.
    pub fn qualifies_as_attachment(&self) -> bool {
        self.has_disposition("attachment")
            || (self.has_disposition("inline") && (self.is_pdf() || self.is_image()))
            || self.is_pdf()
            || self.has_pdf_filename()
    }

    pub fn is_interesting(&self) -> bool {
        is_interesting_attachment(&self.mime_type(), self.filename())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StructureNode {
    Leaf(PartInfo),
    Group(Vec<StructureNode>),
}

impl StructureNode {
    /// Depth-first, stops at the first qualifying leaf.
    pub fn has_attachment(&self) -> bool {
        match self {
            StructureNode::Leaf(part) => part.qualifies_as_attachment(),
            StructureNode::Group(children) => children.iter().any(StructureNode::has_attachment),
        }
    }

    /// Leaves that would survive the attachment download filter, in tree order.
    pub fn interesting_parts(&self) -> Vec<&PartInfo> {
        let mut parts = Vec::new();

        fn walk<'a>(node: &'a StructureNode, parts: &mut Vec<&'a PartInfo>) {
            match node {
                StructureNode::Leaf(part) => {
                    if part.is_interesting() {
                        parts.push(part);
                    }
                }
                StructureNode::Group(children) => {
                    for child in children {
                        walk(child, parts);
                    }
                }
            }
        }

        walk(self, &mut parts);
        parts
    }
}

pub fn has_attachments(structure: Option<&StructureNode>) -> bool {
    structure.map(StructureNode::has_attachment).unwrap_or(false)
}

fn ends_with_pdf(filename: &str) -> bool {
    filename.to_ascii_lowercase().ends_with(".pdf")
}

/// Decides whether a decoded part is worth handing to invoice processing:
/// PDFs (by type or by filename) and images.
pub fn is_interesting_attachment(content_type: &str, filename: Option<&str>) -> bool {
    content_type.eq_ignore_ascii_case("application/pdf")
        || filename.map(ends_with_pdf).unwrap_or(false)
        || content_type.to_ascii_lowercase().starts_with("image/")
}
