//! Relationships documents (`.rels` parts)
//!
//! A relationships document is the list of typed, identified pointers from one part to
//! other parts (or to external resources). Entry order is kept as read: some consumers
//! care about it.

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::name::QName;
use quick_xml::{Reader as XmlReader, Writer as XmlWriter};

use crate::partname;
use crate::utils::{malformed, parse_u32};
use crate::MergeError;

/// Namespace of relationships documents
pub const PACKAGE_RELATIONSHIPS_NS: &str =
    "http://schemas.openxmlformats.org/package/2006/relationships";

/// Default prefix of relationship ids
pub const RID_PREFIX: &str = "rId";

/// Relationship types the merge needs to recognize
pub mod rel_type {
    /// Package to workbook
    pub const OFFICE_DOCUMENT: &str =
        "http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument";
    /// Workbook to worksheet
    pub const WORKSHEET: &str =
        "http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet";
    /// Workbook to chartsheet
    pub const CHARTSHEET: &str =
        "http://schemas.openxmlformats.org/officeDocument/2006/relationships/chartsheet";
    /// Workbook to dialog sheet
    pub const DIALOGSHEET: &str =
        "http://schemas.openxmlformats.org/officeDocument/2006/relationships/dialogsheet";
    /// Package to `docProps/core.xml`
    pub const CORE_PROPERTIES: &str =
        "http://schemas.openxmlformats.org/package/2006/relationships/metadata/core-properties";
    /// Package to `docProps/app.xml`
    pub const EXTENDED_PROPERTIES: &str =
        "http://schemas.openxmlformats.org/officeDocument/2006/relationships/extended-properties";

    /// Workbook to its VBA project
    pub const VBA_PROJECT: &str = "http://schemas.microsoft.com/office/2006/relationships/vbaProject";

    /// Does this relationship type point at a sheet listed in the workbook
    pub fn is_sheet(typ: &str) -> bool {
        typ == WORKSHEET || typ == CHARTSHEET || typ == DIALOGSHEET
    }
}

/// Where a relationship target lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetMode {
    /// A part of the same package
    #[default]
    Internal,
    /// Anything else (urls, files on disk)
    External,
}

/// One `<Relationship>` entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relationship {
    /// Id, unique within its document
    pub id: String,
    /// Relationship type uri
    pub rel_type: String,
    /// Target, relative to the owning part folder unless absolute
    pub target: String,
    /// Target mode
    pub target_mode: TargetMode,
}

impl Relationship {
    /// Creates a new internal relationship
    pub fn internal(id: String, rel_type: &str, target: String) -> Self {
        Relationship {
            id,
            rel_type: rel_type.to_string(),
            target,
            target_mode: TargetMode::Internal,
        }
    }

    /// Is the target outside of the package
    pub fn is_external(&self) -> bool {
        self.target_mode == TargetMode::External
    }

    /// The part name this relationship points at, for internal relationships
    pub fn resolve(&self, owner_dir: &str) -> Option<String> {
        if self.is_external() {
            None
        } else {
            Some(partname::resolve(owner_dir, &self.target))
        }
    }
}

/// Parses a relationships document
pub fn parse(part: &str, xml: &[u8]) -> Result<Vec<Relationship>, MergeError> {
    let mut reader = XmlReader::from_reader(xml);
    let config = reader.config_mut();
    config.trim_text(false);
    config.expand_empty_elements = true;

    let mut relationships = Vec::new();
    let mut depth = 0usize;
    let mut has_root = false;
    let mut buf = Vec::with_capacity(256);
    loop {
        buf.clear();
        match reader.read_event_into(&mut buf).map_err(malformed(part))? {
            Event::Start(ref e) => {
                depth += 1;
                match depth {
                    1 if e.local_name().as_ref() == b"Relationships" => has_root = true,
                    1 => return Err(malformed(part)("expecting 'Relationships' root element")),
                    2 if e.local_name().as_ref() == b"Relationship" => {
                        relationships.push(read_relationship(part, e, reader.decoder())?);
                    }
                    _ => (),
                }
            }
            Event::End(_) => depth = depth.saturating_sub(1),
            Event::Eof => break,
            _ => (),
        }
    }
    if !has_root || depth != 0 {
        return Err(malformed(part)("unexpected end of 'Relationships'"));
    }
    Ok(relationships)
}

fn read_relationship(
    part: &str,
    e: &BytesStart<'_>,
    decoder: quick_xml::encoding::Decoder,
) -> Result<Relationship, MergeError> {
    let mut id = None;
    let mut rel_type = String::new();
    let mut target = String::new();
    let mut target_mode = TargetMode::Internal;
    for a in e.attributes() {
        let a = a.map_err(malformed(part))?;
        let value = || {
            a.decode_and_unescape_value(decoder)
                .map(|v| v.into_owned())
                .map_err(malformed(part))
        };
        match a.key {
            QName(b"Id") => id = Some(value()?),
            QName(b"Type") => rel_type = value()?,
            QName(b"Target") => target = value()?,
            QName(b"TargetMode") => {
                if value()? == "External" {
                    target_mode = TargetMode::External;
                }
            }
            _ => (),
        }
    }
    let id = id.ok_or_else(|| malformed(part)("relationship without 'Id'"))?;
    if rel_type.is_empty() && target.is_empty() {
        return Err(malformed(part)(format!(
            "relationship '{id}' has neither type nor target"
        )));
    }
    Ok(Relationship {
        id,
        rel_type,
        target,
        target_mode,
    })
}

/// Serializes relationships into a canonical document, keeping the given order
pub fn serialize(relationships: &[Relationship]) -> Result<Vec<u8>, MergeError> {
    let mut writer = XmlWriter::new(Vec::with_capacity(128 + relationships.len() * 160));
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), Some("yes"))))?;
    writer.get_mut().extend_from_slice(b"\r\n");

    let mut root = BytesStart::new("Relationships");
    root.push_attribute(("xmlns", PACKAGE_RELATIONSHIPS_NS));
    writer.write_event(Event::Start(root))?;
    for r in relationships {
        let mut e = BytesStart::new("Relationship");
        e.push_attribute(("Id", r.id.as_str()));
        e.push_attribute(("Type", r.rel_type.as_str()));
        e.push_attribute(("Target", r.target.as_str()));
        if r.is_external() {
            e.push_attribute(("TargetMode", "External"));
        }
        writer.write_event(Event::Empty(e))?;
    }
    writer.write_event(Event::End(BytesEnd::new("Relationships")))?;
    Ok(writer.into_inner())
}

/// Highest numeric suffix among ids starting with `prefix`, 0 if there is none
pub fn max_numeric_id(relationships: &[Relationship], prefix: &str) -> u32 {
    relationships
        .iter()
        .filter_map(|r| r.id.strip_prefix(prefix))
        .filter_map(|n| parse_u32(n.as_bytes()))
        .max()
        .unwrap_or(0)
}

/// A fresh id, one above the highest numeric one
///
/// Suffixes are counted in `u64`: ids past `u32::MAX` are never parsed as numeric, so
/// the loop only skips them when they are already taken.
pub fn allocate_id(relationships: &[Relationship], prefix: &str) -> String {
    let mut next = u64::from(max_numeric_id(relationships, prefix)) + 1;
    loop {
        let id = format!("{prefix}{next}");
        if relationships.iter().all(|r| r.id != id) {
            return id;
        }
        next += 1;
    }
}
