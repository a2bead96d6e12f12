//! Package integrity checks
//!
//! Verifies what a consumer needs to open a package: relationship targets exist,
//! relationship ids are unique and known, sheets are uniquely identified and every part
//! has a content type.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader as XmlReader;

use crate::content_types::ContentTypes;
use crate::package::Package;
use crate::partname::{self, CONTENT_TYPES_PART};
use crate::rels;
use crate::rewrite::{find_part, NamespaceScopes, OFFICE_RELATIONSHIPS_NS};
use crate::utils::malformed;
use crate::workbook::{self, WORKBOOK_PART};
use crate::MergeError;

/// A structural problem found in a package
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Issue {
    /// An internal relationship points at a missing part
    DanglingTarget {
        /// relationships part
        rels: String,
        /// target as written
        target: String,
    },
    /// A relationship id is used twice in the same document
    DuplicateRelationshipId {
        /// relationships part
        rels: String,
        /// duplicated id
        id: String,
    },
    /// A part references a relationship id missing from its relationships
    UnknownRelationshipId {
        /// referencing part
        part: String,
        /// unknown id
        id: String,
    },
    /// Two sheets share a `sheetId`
    DuplicateSheetId(u32),
    /// Two sheets share a name (case insensitive)
    DuplicateSheetName(String),
    /// A part has no content type
    MissingContentType(String),
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Issue::DanglingTarget { rels, target } => {
                write!(f, "'{rels}' targets missing part '{target}'")
            }
            Issue::DuplicateRelationshipId { rels, id } => {
                write!(f, "'{rels}' defines '{id}' more than once")
            }
            Issue::UnknownRelationshipId { part, id } => {
                write!(f, "'{part}' references unknown relationship '{id}'")
            }
            Issue::DuplicateSheetId(id) => write!(f, "duplicate sheetId {id}"),
            Issue::DuplicateSheetName(name) => write!(f, "duplicate sheet name '{name}'"),
            Issue::MissingContentType(part) => write!(f, "no content type for '{part}'"),
        }
    }
}

/// Checks the integrity of a package
///
/// Returns every issue found, an empty list meaning the package is consistent. Parts that
/// cannot be parsed are errors, not issues.
pub fn validate(package: &Package) -> Result<Vec<Issue>, MergeError> {
    let names = package.part_names();
    let mut issues = Vec::new();

    let registry = match package.part(CONTENT_TYPES_PART) {
        Some(xml) => ContentTypes::parse(xml)?,
        None => ContentTypes::default(),
    };
    issues.extend(
        package
            .paths()
            .filter(|p| *p != CONTENT_TYPES_PART && registry.content_type(p).is_none())
            .map(|p| Issue::MissingContentType(p.to_string())),
    );

    for (part, xml) in package.iter() {
        if let Some(owner) = partname::source_part_of(part) {
            check_relationships(part, &owner, xml, &names, &mut issues)?;
        } else if partname::extension(part).as_deref() == Some("xml")
            && contains(xml, OFFICE_RELATIONSHIPS_NS.as_bytes())
        {
            let known: HashSet<String> = match package.part(&partname::rels_part_for(part)) {
                Some(rels_xml) => rels::parse(part, rels_xml)?
                    .into_iter()
                    .map(|r| r.id)
                    .collect(),
                None => HashSet::new(),
            };
            issues.extend(
                relationship_ids(part, xml)?
                    .into_iter()
                    .filter(|id| !known.contains(id))
                    .map(|id| Issue::UnknownRelationshipId {
                        part: part.to_string(),
                        id,
                    }),
            );
        }
    }

    if let Some(xml) = package.part(WORKBOOK_PART) {
        let sheets = workbook::read_sheets(WORKBOOK_PART, xml)?;
        let mut ids = HashSet::new();
        let mut sheet_names = HashSet::new();
        for sheet in sheets {
            if !ids.insert(sheet.sheet_id) {
                issues.push(Issue::DuplicateSheetId(sheet.sheet_id));
            }
            if !sheet_names.insert(sheet.name.to_lowercase()) {
                issues.push(Issue::DuplicateSheetName(sheet.name));
            }
        }
    }
    Ok(issues)
}

fn check_relationships(
    part: &str,
    owner: &str,
    xml: &[u8],
    names: &BTreeSet<String>,
    issues: &mut Vec<Issue>,
) -> Result<(), MergeError> {
    let owner_dir = partname::directory(owner);
    let mut ids = HashSet::new();
    for r in rels::parse(part, xml)? {
        if let Some(target) = r.resolve(owner_dir) {
            if find_part(names, &target).is_none() {
                issues.push(Issue::DanglingTarget {
                    rels: part.to_string(),
                    target: r.target.clone(),
                });
            }
        }
        if !ids.insert(r.id.clone()) {
            issues.push(Issue::DuplicateRelationshipId {
                rels: part.to_string(),
                id: r.id,
            });
        }
    }
    Ok(())
}

/// Values of the relationship id attributes (`r:id`, `r:embed`, ...) of a part
fn relationship_ids(part: &str, xml: &[u8]) -> Result<Vec<String>, MergeError> {
    let mut reader = XmlReader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut scopes = NamespaceScopes::default();
    let mut ids = Vec::new();
    let mut buf = Vec::with_capacity(1024);

    let mut collect = |scopes: &NamespaceScopes,
                       e: &BytesStart<'_>,
                       decoder: quick_xml::encoding::Decoder| {
        for a in e.attributes() {
            let a = a.map_err(malformed(part))?;
            if scopes.is_relationship_id(a.key) {
                let id = a
                    .decode_and_unescape_value(decoder)
                    .map_err(malformed(part))?;
                if !id.is_empty() {
                    ids.push(id.into_owned());
                }
            }
        }
        Ok::<_, MergeError>(())
    };
    loop {
        buf.clear();
        match reader.read_event_into(&mut buf).map_err(malformed(part))? {
            Event::Start(e) => {
                scopes.push(&e).map_err(malformed(part))?;
                collect(&scopes, &e, reader.decoder())?;
            }
            Event::Empty(e) => {
                scopes.push(&e).map_err(malformed(part))?;
                collect(&scopes, &e, reader.decoder())?;
                scopes.pop();
            }
            Event::End(_) => scopes.pop(),
            Event::Eof => break,
            _ => (),
        }
    }
    Ok(ids)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
