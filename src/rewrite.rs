//! Cross reference rewriting
//!
//! Once incoming parts are renamed, every place pointing at them must follow: relationship
//! `Target`s, relationship `Id`s and the relationship-namespaced attributes (`r:id`,
//! `r:embed`, ...) used by workbooks, worksheets and drawings.
//!
//! Parts are streamed event by event; only attributes that actually change are
//! re-encoded, and a part with nothing to change is returned untouched.

use std::borrow::Cow;
use std::collections::{BTreeSet, HashMap};

use quick_xml::escape::escape;
use quick_xml::events::attributes::{AttrError, Attribute};
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::QName;
use quick_xml::{Reader as XmlReader, Writer as XmlWriter};

use crate::family::RenameMap;
use crate::partname;
use crate::utils::malformed;
use crate::MergeError;

pub use crate::rels::PACKAGE_RELATIONSHIPS_NS;

/// SpreadsheetML main namespace
pub const SPREADSHEETML_NS: &str = "http://schemas.openxmlformats.org/spreadsheetml/2006/main";

/// Namespace of relationship id attributes (`r:id`, `r:embed`, ...)
pub const OFFICE_RELATIONSHIPS_NS: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships";

/// Old relationship id to new relationship id
pub type RidMap = HashMap<String, String>;

/// Rewrites references of incoming parts to their final identities
#[derive(Debug, Clone, Copy)]
pub struct Rewriter<'a> {
    renames: &'a RenameMap,
    rids: &'a RidMap,
    known_parts: &'a BTreeSet<String>,
}

impl<'a> Rewriter<'a> {
    /// Creates a new rewriter
    ///
    /// `known_parts` are the part names, before renaming, of the package the rewritten parts
    /// come from; internal relationship targets must resolve to one of them.
    pub fn new(renames: &'a RenameMap, rids: &'a RidMap, known_parts: &'a BTreeSet<String>) -> Self {
        Rewriter {
            renames,
            rids,
            known_parts,
        }
    }

    fn final_name<'p>(&'p self, part: &'p str) -> &'p str {
        self.renames.get(part).map_or(part, String::as_str)
    }

    /// Rewrites the references held by `part`, named as in its source package
    pub fn rewrite<'x>(&self, part: &str, xml: &'x [u8]) -> Result<Cow<'x, [u8]>, MergeError> {
        let kind = match partname::source_part_of(part) {
            Some(owner) => {
                let new_owner = self.final_name(&owner);
                PartKind::Relationships {
                    owner_dir: partname::directory(&owner).to_string(),
                    new_owner_dir: partname::directory(new_owner).to_string(),
                }
            }
            None if self.rids.is_empty() => return Ok(Cow::Borrowed(xml)),
            None => PartKind::Xml,
        };

        let mut reader = XmlReader::from_reader(xml);
        reader.config_mut().trim_text(false);
        let mut writer = XmlWriter::new(Vec::with_capacity(xml.len() + 64));
        let mut scopes = NamespaceScopes::default();
        let mut changed = false;
        let mut buf = Vec::with_capacity(1024);
        loop {
            buf.clear();
            match reader.read_event_into(&mut buf).map_err(malformed(part))? {
                Event::Start(e) => {
                    scopes.push(&e).map_err(malformed(part))?;
                    match self.rewrite_element(part, &kind, &scopes, &e, reader.decoder())? {
                        Some(new) => {
                            changed = true;
                            writer.write_event(Event::Start(new))?;
                        }
                        None => writer.write_event(Event::Start(e))?,
                    }
                }
                Event::Empty(e) => {
                    scopes.push(&e).map_err(malformed(part))?;
                    let rewritten =
                        self.rewrite_element(part, &kind, &scopes, &e, reader.decoder())?;
                    scopes.pop();
                    match rewritten {
                        Some(new) => {
                            changed = true;
                            writer.write_event(Event::Empty(new))?;
                        }
                        None => writer.write_event(Event::Empty(e))?,
                    }
                }
                Event::End(e) => {
                    scopes.pop();
                    writer.write_event(Event::End(e))?;
                }
                Event::Eof => break,
                ev => writer.write_event(ev)?,
            }
        }

        if changed {
            Ok(Cow::Owned(writer.into_inner()))
        } else {
            Ok(Cow::Borrowed(xml))
        }
    }

    /// Returns the rewritten element, `None` when nothing changes
    fn rewrite_element(
        &self,
        part: &str,
        kind: &PartKind,
        scopes: &NamespaceScopes,
        e: &BytesStart<'_>,
        decoder: quick_xml::encoding::Decoder,
    ) -> Result<Option<BytesStart<'static>>, MergeError> {
        let attributes = e
            .attributes()
            .collect::<Result<Vec<_>, _>>()
            .map_err(malformed(part))?;
        let value = |a: &Attribute<'_>| {
            a.decode_and_unescape_value(decoder)
                .map(Cow::into_owned)
                .map_err(malformed(part))
        };

        let mut replacements: Vec<Option<String>> = vec![None; attributes.len()];
        match kind {
            PartKind::Relationships {
                owner_dir,
                new_owner_dir,
            } => {
                if e.local_name().as_ref() != b"Relationship" {
                    return Ok(None);
                }
                let external = attributes
                    .iter()
                    .any(|a| a.key == QName(b"TargetMode") && a.value.as_ref() == b"External");
                for (a, replacement) in attributes.iter().zip(replacements.iter_mut()) {
                    match a.key {
                        QName(b"Id") => {
                            let id = value(a)?;
                            *replacement = self.rids.get(&id).cloned();
                        }
                        QName(b"Target") if !external => {
                            let target = value(a)?;
                            *replacement =
                                self.rewrite_target(part, owner_dir, new_owner_dir, &target)?;
                        }
                        _ => (),
                    }
                }
            }
            PartKind::Xml => {
                for (a, replacement) in attributes.iter().zip(replacements.iter_mut()) {
                    if scopes.is_relationship_id(a.key) {
                        *replacement = self.rids.get(&value(a)?).cloned();
                    }
                }
            }
        }

        if replacements.iter().all(Option::is_none) {
            return Ok(None);
        }
        let mut new = e.clone().into_owned();
        new.clear_attributes();
        for (a, replacement) in attributes.into_iter().zip(replacements) {
            match replacement {
                Some(v) => new.push_attribute(Attribute {
                    key: a.key,
                    value: Cow::Owned(escape(v.as_str()).into_owned().into_bytes()),
                }),
                None => new.push_attribute(a),
            }
        }
        Ok(Some(new))
    }

    /// The new target of a relationship, `None` if it stays as it is
    fn rewrite_target(
        &self,
        part: &str,
        owner_dir: &str,
        new_owner_dir: &str,
        target: &str,
    ) -> Result<Option<String>, MergeError> {
        let resolved = partname::resolve(owner_dir, target);
        let resolved = find_part(self.known_parts, &resolved)
            .map(String::as_str)
            .ok_or_else(|| MergeError::UnresolvedReference {
                part: part.to_string(),
                target: target.to_string(),
            })?;
        let destination = self.final_name(resolved);
        if destination == resolved && owner_dir == new_owner_dir {
            return Ok(None);
        }
        let new_target = if target.starts_with('/') {
            format!("/{destination}")
        } else {
            partname::relative_target(new_owner_dir, destination)
        };
        Ok(if new_target == target {
            None
        } else {
            Some(new_target)
        })
    }
}

/// Rewrites the references of a single part
///
/// See [`Rewriter::rewrite`].
pub fn rewrite_references<'x>(
    part: &str,
    xml: &'x [u8],
    renames: &RenameMap,
    rids: &RidMap,
    known_parts: &BTreeSet<String>,
) -> Result<Cow<'x, [u8]>, MergeError> {
    Rewriter::new(renames, rids, known_parts).rewrite(part, xml)
}

enum PartKind {
    Relationships {
        owner_dir: String,
        new_owner_dir: String,
    },
    Xml,
}

/// Finds a part, falling back to a case insensitive match as Excel does
pub(crate) fn find_part<'s>(parts: &'s BTreeSet<String>, name: &str) -> Option<&'s String> {
    parts
        .get(name)
        .or_else(|| parts.iter().find(|p| p.eq_ignore_ascii_case(name)))
}

/// Stack of namespace declarations of the currently opened elements
#[derive(Debug, Default)]
pub(crate) struct NamespaceScopes {
    frames: Vec<Vec<(Vec<u8>, Vec<u8>)>>,
}

impl NamespaceScopes {
    /// Opens the scope of element `e`
    pub fn push(&mut self, e: &BytesStart<'_>) -> Result<(), AttrError> {
        let mut frame = Vec::new();
        for a in e.attributes() {
            let a = a?;
            let key = a.key.as_ref();
            if key == b"xmlns" {
                frame.push((Vec::new(), a.value.into_owned()));
            } else if let Some(prefix) = key.strip_prefix(b"xmlns:") {
                frame.push((prefix.to_vec(), a.value.into_owned()));
            }
        }
        self.frames.push(frame);
        Ok(())
    }

    /// Closes the innermost scope
    pub fn pop(&mut self) {
        self.frames.pop();
    }

    /// Namespace bound to `prefix` (empty prefix for the default namespace)
    pub fn resolve(&self, prefix: &[u8]) -> Option<&[u8]> {
        self.frames
            .iter()
            .rev()
            .flat_map(|f| f.iter().rev())
            .find(|(p, _)| p == prefix)
            .map(|(_, ns)| ns.as_slice())
    }

    /// A prefix currently bound to `ns`
    pub fn prefix_of(&self, ns: &[u8]) -> Option<&[u8]> {
        self.frames
            .iter()
            .rev()
            .flat_map(|f| f.iter().rev())
            .filter(|(_, uri)| uri == ns)
            .map(|(p, _)| p.as_slice())
            .find(|p| self.resolve(p) == Some(ns))
    }

    /// Is this attribute in the relationships namespace
    pub fn is_relationship_id(&self, key: QName<'_>) -> bool {
        match split_name(key.as_ref()) {
            (Some(b"xmlns"), _) => false,
            (Some(prefix), _) => self.resolve(prefix) == Some(OFFICE_RELATIONSHIPS_NS.as_bytes()),
            (None, _) => false,
        }
    }
}

/// Splits `prefix:local`
pub(crate) fn split_name(name: &[u8]) -> (Option<&[u8]>, &[u8]) {
    match name.iter().position(|b| *b == b':') {
        Some(i) => (Some(&name[..i]), &name[i + 1..]),
        None => (None, name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known(parts: &[&str]) -> BTreeSet<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    fn renames(pairs: &[(&str, &str)]) -> RenameMap {
        pairs
            .iter()
            .map(|(a, b)| (a.to_string(), b.to_string()))
            .collect()
    }

    const SHEET_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId2" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/hyperlink" Target="https://example.com/a&amp;b" TargetMode="External"/><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/drawing" Target="../drawings/drawing1.xml"/></Relationships>"#;

    #[test]
    fn rels_targets_follow_renamed_parts() {
        let parts = known(&[
            "xl/worksheets/sheet1.xml",
            "xl/worksheets/_rels/sheet1.xml.rels",
            "xl/drawings/drawing1.xml",
        ]);
        let renames = renames(&[
            ("xl/worksheets/sheet1.xml", "xl/worksheets/sheet3.xml"),
            ("xl/drawings/drawing1.xml", "xl/drawings/drawing4.xml"),
        ]);
        let rids = RidMap::new();
        let rewriter = Rewriter::new(&renames, &rids, &parts);
        let out = rewriter
            .rewrite("xl/worksheets/_rels/sheet1.xml.rels", SHEET_RELS.as_bytes())
            .unwrap();
        let out = std::str::from_utf8(&out).unwrap();
        assert_eq!(
            out,
            SHEET_RELS.replace("../drawings/drawing1.xml", "../drawings/drawing4.xml")
        );
    }

    #[test]
    fn untouched_parts_are_borrowed() {
        let parts = known(&["xl/worksheets/sheet1.xml", "xl/drawings/drawing1.xml"]);
        let renames = RenameMap::new();
        let rids = RidMap::new();
        let rewriter = Rewriter::new(&renames, &rids, &parts);
        let out = rewriter
            .rewrite("xl/worksheets/_rels/sheet1.xml.rels", SHEET_RELS.as_bytes())
            .unwrap();
        assert!(matches!(out, Cow::Borrowed(_)));
        let sheet = br#"<worksheet xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><drawing r:id="rId1"/></worksheet>"#;
        let out = rewriter.rewrite("xl/worksheets/sheet1.xml", sheet).unwrap();
        assert!(matches!(out, Cow::Borrowed(_)));
    }

    #[test]
    fn dangling_target_is_an_error() {
        let parts = known(&["xl/worksheets/sheet1.xml"]);
        let renames = RenameMap::new();
        let rids = RidMap::new();
        let rewriter = Rewriter::new(&renames, &rids, &parts);
        match rewriter.rewrite("xl/worksheets/_rels/sheet1.xml.rels", SHEET_RELS.as_bytes()) {
            Err(MergeError::UnresolvedReference { part, target }) => {
                assert_eq!(part, "xl/worksheets/_rels/sheet1.xml.rels");
                assert_eq!(target, "../drawings/drawing1.xml");
            }
            r => panic!("expecting an unresolved reference, got {r:?}"),
        }
    }

    #[test]
    fn relationship_ids_follow_rid_map() {
        let workbook = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:rel="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets><sheet name="A &amp; B" sheetId="1" rel:id="rId1"/><sheet name="Other" sheetId="2" rel:id="rId9"/></sheets><definedNames/></workbook>"#;
        let parts = BTreeSet::new();
        let renames = RenameMap::new();
        let rids: RidMap = [("rId1".to_string(), "rId7".to_string())].into();
        let rewriter = Rewriter::new(&renames, &rids, &parts);
        let out = rewriter.rewrite("xl/workbook.xml", workbook.as_bytes()).unwrap();
        assert_eq!(
            std::str::from_utf8(&out).unwrap(),
            workbook.replace(r#"rel:id="rId1""#, r#"rel:id="rId7""#)
        );
    }

    #[test]
    fn unbound_prefix_is_not_a_relationship_id() {
        let xml = br#"<root xmlns:r="urn:other"><a r:id="rId1"/></root>"#;
        let parts = BTreeSet::new();
        let renames = RenameMap::new();
        let rids: RidMap = [("rId1".to_string(), "rId2".to_string())].into();
        let rewriter = Rewriter::new(&renames, &rids, &parts);
        assert!(matches!(rewriter.rewrite("x.xml", xml).unwrap(), Cow::Borrowed(_)));
    }

    #[test]
    fn rels_ids_and_absolute_targets() {
        let rels = r#"<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="t" Target="/xl/worksheets/sheet1.xml"/></Relationships>"#;
        let parts = known(&["xl/worksheets/sheet1.xml"]);
        let renames = renames(&[("xl/worksheets/sheet1.xml", "xl/worksheets/sheet2.xml")]);
        let rids: RidMap = [("rId1".to_string(), "rId5".to_string())].into();
        let rewriter = Rewriter::new(&renames, &rids, &parts);
        let out = rewriter.rewrite("xl/_rels/workbook.xml.rels", rels.as_bytes()).unwrap();
        assert_eq!(
            std::str::from_utf8(&out).unwrap(),
            r#"<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId5" Type="t" Target="/xl/worksheets/sheet2.xml"/></Relationships>"#
        );
    }

    #[test]
    fn malformed_part() {
        let parts = BTreeSet::new();
        let renames = RenameMap::new();
        let rids = RidMap::new();
        let rewriter = Rewriter::new(&renames, &rids, &parts);
        assert!(matches!(
            rewriter.rewrite("xl/_rels/workbook.xml.rels", b"<Relationships><a></b></Relationships>"),
            Err(MergeError::MalformedXml { .. })
        ));
    }

    #[test]
    fn namespace_scopes() {
        let mut scopes = NamespaceScopes::default();
        let root = BytesStart::from_content(
            r#"w xmlns="urn:main" xmlns:r="urn:rel" xmlns:x="urn:main""#,
            1,
        );
        scopes.push(&root).unwrap();
        assert_eq!(scopes.resolve(b""), Some(&b"urn:main"[..]));
        assert_eq!(scopes.prefix_of(b"urn:rel"), Some(&b"r"[..]));
        let inner = BytesStart::from_content(r#"s xmlns:r="urn:shadow""#, 1);
        scopes.push(&inner).unwrap();
        assert_eq!(scopes.prefix_of(b"urn:rel"), None);
        assert_eq!(scopes.resolve(b"x"), Some(&b"urn:main"[..]));
        scopes.pop();
        assert_eq!(scopes.resolve(b"r"), Some(&b"urn:rel"[..]));
    }
}
