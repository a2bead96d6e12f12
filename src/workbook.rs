//! Workbook sheet list: parsing, merging and appending `<sheet>` entries
//!
//! Only the `<sheets>` element of the workbook is interpreted, everything else is passed
//! through as is.

use std::collections::HashSet;

use log::debug;
use quick_xml::escape::escape;
use quick_xml::events::attributes::Attribute;
use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::name::QName;
use quick_xml::{Reader as XmlReader, Writer as XmlWriter};

use crate::rels::{self, Relationship, RID_PREFIX};
use crate::rewrite::{split_name, NamespaceScopes, RidMap, OFFICE_RELATIONSHIPS_NS};
use crate::utils::{malformed, parse_u32};
use crate::MergeError;

/// The workbook part
pub const WORKBOOK_PART: &str = "xl/workbook.xml";

/// Maximum length of a sheet name, in characters
pub const MAX_SHEET_NAME_LEN: usize = 31;

/// Largest `(n)` suffix tried to make a sheet name unique
pub const MAX_NAME_SUFFIX: u32 = 9_999;

/// Sheet visibility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SheetVisible {
    /// Visible
    #[default]
    Visible,
    /// Hidden
    Hidden,
    /// The sheet is hidden and cannot be displayed using the user interface
    VeryHidden,
}

impl SheetVisible {
    fn as_str(self) -> &'static str {
        match self {
            SheetVisible::Visible => "visible",
            SheetVisible::Hidden => "hidden",
            SheetVisible::VeryHidden => "veryHidden",
        }
    }
}

/// A `<sheet>` entry of the workbook
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetDescriptor {
    /// Name
    pub name: String,
    /// `sheetId`, unique in the workbook
    pub sheet_id: u32,
    /// Id of the workbook relationship pointing at the sheet part
    pub relationship_id: String,
    /// Visibility
    pub visible: SheetVisible,
}

/// Outcome of [`merge_sheets`]
#[derive(Debug, Clone, Default)]
pub struct SheetMerge {
    /// Output sheets followed by the renamed incoming ones
    pub sheets: Vec<SheetDescriptor>,
    /// Workbook relationships to add, one per incoming sheet
    pub relationships: Vec<Relationship>,
    /// Incoming workbook relationship ids to their new value
    pub rid_map: RidMap,
}

impl SheetMerge {
    /// Sheets coming from the incoming workbook
    pub fn added(&self) -> &[SheetDescriptor] {
        let n = self.sheets.len() - self.relationships.len();
        &self.sheets[n..]
    }
}

/// Reads the `<sheet>` entries of a workbook, in document order
pub fn read_sheets(part: &str, xml: &[u8]) -> Result<Vec<SheetDescriptor>, MergeError> {
    let mut reader = XmlReader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut scopes = NamespaceScopes::default();
    let mut sheets = Vec::new();
    let mut buf = Vec::with_capacity(1024);
    loop {
        buf.clear();
        match reader.read_event_into(&mut buf).map_err(malformed(part))? {
            Event::Start(e) => {
                scopes.push(&e).map_err(malformed(part))?;
                if e.local_name().as_ref() == b"sheet" {
                    sheets.push(read_sheet(part, &scopes, &e, reader.decoder())?);
                }
            }
            Event::Empty(e) => {
                scopes.push(&e).map_err(malformed(part))?;
                if e.local_name().as_ref() == b"sheet" {
                    sheets.push(read_sheet(part, &scopes, &e, reader.decoder())?);
                }
                scopes.pop();
            }
            Event::End(_) => scopes.pop(),
            Event::Eof => break,
            _ => (),
        }
    }
    Ok(sheets)
}

fn read_sheet(
    part: &str,
    scopes: &NamespaceScopes,
    e: &BytesStart<'_>,
    decoder: quick_xml::encoding::Decoder,
) -> Result<SheetDescriptor, MergeError> {
    let mut name = None;
    let mut sheet_id = None;
    let mut relationship_id = None;
    let mut visible = SheetVisible::Visible;
    for a in e.attributes() {
        let a = a.map_err(malformed(part))?;
        match a {
            Attribute {
                key: QName(b"name"),
                ..
            } => {
                name = Some(
                    a.decode_and_unescape_value(decoder)
                        .map_err(malformed(part))?
                        .into_owned(),
                );
            }
            Attribute {
                key: QName(b"sheetId"),
                ref value,
            } => {
                let id = parse_u32(value).filter(|id| *id > 0).ok_or_else(|| {
                    malformed(part)(format!(
                        "invalid sheetId '{}'",
                        String::from_utf8_lossy(value)
                    ))
                })?;
                sheet_id = Some(id);
            }
            Attribute {
                key: QName(b"state"),
                ..
            } => {
                visible = match a
                    .decode_and_unescape_value(decoder)
                    .map_err(malformed(part))?
                    .as_ref()
                {
                    "visible" => SheetVisible::Visible,
                    "hidden" => SheetVisible::Hidden,
                    "veryHidden" => SheetVisible::VeryHidden,
                    v => return Err(malformed(part)(format!("unknown sheet state '{v}'"))),
                }
            }
            Attribute { key, .. } if scopes.is_relationship_id(key) => {
                relationship_id = Some(
                    a.decode_and_unescape_value(decoder)
                        .map_err(malformed(part))?
                        .into_owned(),
                );
            }
            _ => (),
        }
    }
    match (name, sheet_id, relationship_id) {
        (Some(name), Some(sheet_id), Some(relationship_id)) => Ok(SheetDescriptor {
            name,
            sheet_id,
            relationship_id,
            visible,
        }),
        (name, _, _) => Err(malformed(part)(format!(
            "sheet '{}' lacks a name, a sheetId or a relationship id",
            name.unwrap_or_default()
        ))),
    }
}

/// Names of the `<definedName>` entries of a workbook
pub fn defined_names(part: &str, xml: &[u8]) -> Result<Vec<String>, MergeError> {
    let mut reader = XmlReader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut names = Vec::new();
    let mut buf = Vec::with_capacity(1024);
    loop {
        buf.clear();
        match reader.read_event_into(&mut buf).map_err(malformed(part))? {
            Event::Start(ref e) | Event::Empty(ref e)
                if e.local_name().as_ref() == b"definedName" =>
            {
                if let Some(a) = e.try_get_attribute("name").map_err(malformed(part))? {
                    names.push(
                        a.decode_and_unescape_value(reader.decoder())
                            .map_err(malformed(part))?
                            .into_owned(),
                    );
                }
            }
            Event::Eof => break,
            _ => (),
        }
    }
    Ok(names)
}

/// Unions the sheets of two workbooks
///
/// Incoming sheets are appended in their original order. Each gets the next free `sheetId`,
/// a name unique across every name claimed so far and a fresh workbook relationship. Their
/// relationships are looked up in `incoming_rels`, whose targets must already point at the
/// final sheet parts.
pub fn merge_sheets(
    output: &[SheetDescriptor],
    incoming: &[SheetDescriptor],
    output_rels: &[Relationship],
    incoming_rels: &[Relationship],
) -> Result<SheetMerge, MergeError> {
    let mut last_sheet_id = output.iter().map(|s| s.sheet_id).max().unwrap_or(0);
    let mut taken_rels = output_rels.to_vec();
    let mut claimed: HashSet<String> = output.iter().map(|s| s.name.to_lowercase()).collect();

    let mut merge = SheetMerge {
        sheets: output.to_vec(),
        ..SheetMerge::default()
    };
    for sheet in incoming {
        let rel = incoming_rels
            .iter()
            .find(|r| r.id == sheet.relationship_id)
            .ok_or_else(|| MergeError::UnresolvedReference {
                part: WORKBOOK_PART.to_string(),
                target: sheet.relationship_id.clone(),
            })?;

        let sheet_id = last_sheet_id.checked_add(1).ok_or_else(|| {
            MergeError::IdExhausted(format!("sheetId for sheet '{}'", sheet.name))
        })?;
        last_sheet_id = sheet_id;
        let name = unique_name(&sheet.name, &claimed)?;
        claimed.insert(name.to_lowercase());
        let rid = rels::allocate_id(&taken_rels, RID_PREFIX);
        debug!(
            "sheet '{}' ({}) -> '{}' ({}, sheetId {})",
            sheet.name, sheet.relationship_id, name, rid, sheet_id
        );

        let rel = Relationship {
            id: rid.clone(),
            ..rel.clone()
        };
        taken_rels.push(rel.clone());
        merge
            .rid_map
            .insert(sheet.relationship_id.clone(), rid.clone());
        merge.relationships.push(rel);
        merge.sheets.push(SheetDescriptor {
            name,
            sheet_id,
            relationship_id: rid,
            visible: sheet.visible,
        });
    }
    Ok(merge)
}

/// First name, `name` or `name(n)`, not in `claimed` (lowercase names)
///
/// The base name is truncated so the suffixed name fits in [`MAX_SHEET_NAME_LEN`]
/// characters.
pub fn unique_name(name: &str, claimed: &HashSet<String>) -> Result<String, MergeError> {
    if !claimed.contains(&name.to_lowercase()) {
        return Ok(name.to_string());
    }
    for n in 1..=MAX_NAME_SUFFIX {
        let suffix = format!("({n})");
        let room = MAX_SHEET_NAME_LEN.saturating_sub(suffix.chars().count());
        let mut candidate: String = name.chars().take(room).collect();
        candidate.push_str(&suffix);
        if !claimed.contains(&candidate.to_lowercase()) {
            return Ok(candidate);
        }
    }
    Err(MergeError::SheetLimitExceeded(name.to_string()))
}

/// Appends `sheets` at the end of the `<sheets>` element of a workbook
///
/// New elements use the prefixes already in use in the workbook. Everything else is
/// written back unchanged.
pub fn append_sheets(
    part: &str,
    xml: &[u8],
    sheets: &[SheetDescriptor],
) -> Result<Vec<u8>, MergeError> {
    let mut reader = XmlReader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut writer = XmlWriter::new(Vec::with_capacity(xml.len() + sheets.len() * 96));
    let mut scopes = NamespaceScopes::default();
    let mut depth = 0usize;
    let mut sheets_depth = None;
    let mut appended = false;
    let mut buf = Vec::with_capacity(1024);
    loop {
        buf.clear();
        match reader.read_event_into(&mut buf).map_err(malformed(part))? {
            Event::Start(e) => {
                depth += 1;
                scopes.push(&e).map_err(malformed(part))?;
                if !appended && is_sheets(&e) {
                    sheets_depth = Some(depth);
                }
                writer.write_event(Event::Start(e))?;
            }
            Event::Empty(e) if !appended && is_sheets(&e) => {
                scopes.push(&e).map_err(malformed(part))?;
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                writer.write_event(Event::Start(e))?;
                write_sheets(&mut writer, &scopes, &name, sheets)?;
                writer.write_event(Event::End(BytesEnd::new(name)))?;
                scopes.pop();
                appended = true;
            }
            Event::End(e) => {
                if sheets_depth == Some(depth) {
                    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    write_sheets(&mut writer, &scopes, &name, sheets)?;
                    sheets_depth = None;
                    appended = true;
                }
                scopes.pop();
                depth = depth.saturating_sub(1);
                writer.write_event(Event::End(e))?;
            }
            Event::Eof => break,
            ev => writer.write_event(ev)?,
        }
    }
    if !appended {
        return Err(malformed(part)("workbook without 'sheets'"));
    }
    Ok(writer.into_inner())
}

fn is_sheets(e: &BytesStart<'_>) -> bool {
    e.local_name().as_ref() == b"sheets"
}

/// Writes `<sheet>` elements inside the `sheets_name` element
fn write_sheets(
    writer: &mut XmlWriter<Vec<u8>>,
    scopes: &NamespaceScopes,
    sheets_name: &str,
    sheets: &[SheetDescriptor],
) -> Result<(), MergeError> {
    let element = match split_name(sheets_name.as_bytes()) {
        (Some(prefix), _) => format!("{}:sheet", String::from_utf8_lossy(prefix)),
        (None, _) => "sheet".to_string(),
    };
    let rel_prefix = scopes
        .prefix_of(OFFICE_RELATIONSHIPS_NS.as_bytes())
        .filter(|p| !p.is_empty())
        .map(|p| String::from_utf8_lossy(p).into_owned());
    for sheet in sheets {
        let mut e = BytesStart::new(element.as_str());
        e.push_attribute(("name", sheet.name.as_str()));
        let sheet_id = sheet.sheet_id.to_string();
        e.push_attribute(("sheetId", sheet_id.as_str()));
        if sheet.visible != SheetVisible::Visible {
            e.push_attribute(("state", sheet.visible.as_str()));
        }
        match &rel_prefix {
            Some(prefix) => {
                let key = format!("{prefix}:id");
                e.push_attribute(Attribute {
                    key: QName(key.as_bytes()),
                    value: escape(sheet.relationship_id.as_str()).as_bytes().into(),
                });
            }
            None => {
                e.push_attribute(("xmlns:r", OFFICE_RELATIONSHIPS_NS));
                e.push_attribute(("r:id", sheet.relationship_id.as_str()));
            }
        }
        writer.write_event(Event::Empty(e))?;
    }
    Ok(())
}
