//! `[Content_Types].xml` registry

use log::debug;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::name::QName;
use quick_xml::{Reader as XmlReader, Writer as XmlWriter};

use crate::family::ResourceFamily;
use crate::partname::{self, CONTENT_TYPES_PART};
use crate::utils::malformed;
use crate::MergeError;

/// Namespace of the content types registry
pub const CONTENT_TYPES_NS: &str = "http://schemas.openxmlformats.org/package/2006/content-types";

/// Content type of relationships documents
pub const RELATIONSHIPS_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-package.relationships+xml";

/// Content type of a workbook without macros
pub const WORKBOOK_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml";

/// Content type of a workbook with a VBA project
pub const MACRO_ENABLED_WORKBOOK_CONTENT_TYPE: &str =
    "application/vnd.ms-excel.sheet.macroEnabled.main+xml";

/// Content type of `xl/vbaProject.bin`
pub const VBA_PROJECT_CONTENT_TYPE: &str = "application/vnd.ms-office.vbaProject";

/// Content types of parts with a fixed name
const SINGLETONS: &[(&str, &str)] = &[
    ("xl/workbook.xml", WORKBOOK_CONTENT_TYPE),
    (
        "xl/styles.xml",
        "application/vnd.openxmlformats-officedocument.spreadsheetml.styles+xml",
    ),
    (
        "xl/sharedStrings.xml",
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sharedStrings+xml",
    ),
    (
        "xl/calcChain.xml",
        "application/vnd.openxmlformats-officedocument.spreadsheetml.calcChain+xml",
    ),
    ("xl/vbaProject.bin", VBA_PROJECT_CONTENT_TYPE),
    ("xl/vbaData.xml", "application/vnd.ms-word.vbaData+xml"),
    (
        "docProps/core.xml",
        "application/vnd.openxmlformats-package.core-properties+xml",
    ),
    (
        "docProps/app.xml",
        "application/vnd.openxmlformats-officedocument.extended-properties+xml",
    ),
];

/// Content types derived from the extension alone
const BY_EXTENSION: &[(&str, &str)] = &[
    ("rels", RELATIONSHIPS_CONTENT_TYPE),
    ("png", "image/png"),
    ("jpeg", "image/jpeg"),
    ("jpg", "image/jpeg"),
    ("gif", "image/gif"),
    ("bmp", "image/bmp"),
    ("tif", "image/tiff"),
    ("tiff", "image/tiff"),
    ("emf", "image/x-emf"),
    ("wmf", "image/x-wmf"),
    ("svg", "image/svg+xml"),
];

const THEME_CONTENT_TYPE: &str = "application/vnd.openxmlformats-officedocument.theme+xml";

/// Content type the merge expects for a part, `None` for unknown kinds of part
pub fn derived_content_type(part: &str) -> Option<&'static str> {
    if let Some(family) = ResourceFamily::of(part) {
        return Some(family.content_type);
    }
    if let Some((_, ct)) = SINGLETONS.iter().find(|(p, _)| *p == part) {
        return Some(ct);
    }
    if part.starts_with("xl/theme/") && part.ends_with(".xml") && !partname::is_rels(part) {
        return Some(THEME_CONTENT_TYPE);
    }
    let ext = partname::extension(part)?;
    BY_EXTENSION
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, ct)| *ct)
}

/// The content types registry of a package
///
/// Entries are kept in document order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentTypes {
    /// Lowercase extension to content type
    defaults: Vec<(String, String)>,
    /// Part name (without leading `/`) to content type
    overrides: Vec<(String, String)>,
}

impl ContentTypes {
    /// Parses a `[Content_Types].xml` part
    pub fn parse(xml: &[u8]) -> Result<ContentTypes, MergeError> {
        let part = CONTENT_TYPES_PART;
        let mut reader = XmlReader::from_reader(xml);
        reader.config_mut().trim_text(false);
        let mut registry = ContentTypes::default();
        let mut has_root = false;
        let mut buf = Vec::with_capacity(1024);
        loop {
            buf.clear();
            match reader.read_event_into(&mut buf).map_err(malformed(part))? {
                Event::Start(ref e) | Event::Empty(ref e) => match e.local_name().as_ref() {
                    b"Types" => has_root = true,
                    b"Default" | b"Override" if has_root => {
                        let mut key = None;
                        let mut content_type = None;
                        for a in e.attributes() {
                            let a = a.map_err(malformed(part))?;
                            let value = || {
                                a.decode_and_unescape_value(reader.decoder())
                                    .map(|v| v.into_owned())
                                    .map_err(malformed(part))
                            };
                            match a.key {
                                QName(b"Extension") => key = Some(value()?.to_ascii_lowercase()),
                                QName(b"PartName") => key = Some(partname::normalize(&value()?)),
                                QName(b"ContentType") => content_type = Some(value()?),
                                _ => (),
                            }
                        }
                        let (Some(key), Some(content_type)) = (key, content_type) else {
                            return Err(malformed(part)("incomplete content type entry"));
                        };
                        if e.local_name().as_ref() == b"Default" {
                            registry.defaults.push((key, content_type));
                        } else {
                            registry.overrides.push((key, content_type));
                        }
                    }
                    _ => (),
                },
                Event::Eof => break,
                _ => (),
            }
        }
        if !has_root {
            return Err(malformed(part)("expecting 'Types' root element"));
        }
        Ok(registry)
    }

    /// Serializes the registry
    pub fn serialize(&self) -> Result<Vec<u8>, MergeError> {
        let mut writer = XmlWriter::new(Vec::with_capacity(
            256 + (self.defaults.len() + self.overrides.len()) * 128,
        ));
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), Some("yes"))))?;
        writer.get_mut().extend_from_slice(b"\r\n");
        let mut root = BytesStart::new("Types");
        root.push_attribute(("xmlns", CONTENT_TYPES_NS));
        writer.write_event(Event::Start(root))?;
        for (ext, ct) in &self.defaults {
            let mut e = BytesStart::new("Default");
            e.push_attribute(("Extension", ext.as_str()));
            e.push_attribute(("ContentType", ct.as_str()));
            writer.write_event(Event::Empty(e))?;
        }
        for (part, ct) in &self.overrides {
            let mut e = BytesStart::new("Override");
            let name = format!("/{part}");
            e.push_attribute(("PartName", name.as_str()));
            e.push_attribute(("ContentType", ct.as_str()));
            writer.write_event(Event::Empty(e))?;
        }
        writer.write_event(Event::End(BytesEnd::new("Types")))?;
        Ok(writer.into_inner())
    }

    /// Content type registered for an extension
    pub fn default_for(&self, extension: &str) -> Option<&str> {
        self.defaults
            .iter()
            .find(|(e, _)| e.eq_ignore_ascii_case(extension))
            .map(|(_, ct)| ct.as_str())
    }

    /// Content type registered for exactly this part
    pub fn override_for(&self, part: &str) -> Option<&str> {
        self.overrides
            .iter()
            .find(|(p, _)| p.eq_ignore_ascii_case(part))
            .map(|(_, ct)| ct.as_str())
    }

    /// Content type of a part, override first then default
    pub fn content_type(&self, part: &str) -> Option<&str> {
        self.override_for(part).or_else(|| {
            partname::extension(part)
                .as_deref()
                .and_then(|ext| self.default_for(ext))
        })
    }

    /// Registers a content type for an extension, if not already present
    pub fn add_default(&mut self, extension: &str, content_type: &str) {
        if self.default_for(extension).is_none() {
            self.defaults
                .push((extension.to_ascii_lowercase(), content_type.to_string()));
        }
    }

    /// Sets the content type of a part
    pub fn set_override(&mut self, part: &str, content_type: &str) {
        match self
            .overrides
            .iter_mut()
            .find(|(p, _)| p.eq_ignore_ascii_case(part))
        {
            Some((_, ct)) => *ct = content_type.to_string(),
            None => self
                .overrides
                .push((part.to_string(), content_type.to_string())),
        }
    }

    /// Removes the overrides of parts for which `keep` returns false
    pub fn retain_overrides<F: FnMut(&str) -> bool>(&mut self, mut keep: F) {
        self.overrides.retain(|(part, ct)| {
            let kept = keep(part);
            if !kept {
                debug!("dropping stale content type override {part} ({ct})");
            }
            kept
        });
    }

    /// Makes sure `part` has a content type
    ///
    /// The type is derived from the kind of part, falling back to `supplied`. Nothing
    /// changes when an override exists, or when the extension default already gives the
    /// derived type. Returns whether an override was added.
    pub fn ensure_registered(
        &mut self,
        part: &str,
        supplied: Option<&str>,
    ) -> Result<bool, MergeError> {
        if self.override_for(part).is_some() {
            return Ok(false);
        }
        let default = partname::extension(part)
            .as_deref()
            .and_then(|ext| self.default_for(ext))
            .map(str::to_string);
        match (derived_content_type(part).or(supplied), default) {
            (Some(ct), Some(default)) if ct == default => Ok(false),
            (Some(ct), _) => {
                debug!("registering {part} as {ct}");
                self.set_override(part, ct);
                Ok(true)
            }
            (None, Some(_)) => Ok(false),
            (None, None) => Err(MergeError::UnknownContentType(part.to_string())),
        }
    }
}
