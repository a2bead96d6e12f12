//! In memory package: part name to part bytes
//!
//! A package is fully extracted when read and fully serialized when written, it is
//! never flushed partially.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Cursor, Read, Seek, Write};

use log::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::partname::{self, CONTENT_TYPES_PART, PACKAGE_RELS_PART};
use crate::MergeError;

/// Deflate level used when none is given
pub const DEFAULT_COMPRESSION_LEVEL: i64 = 6;

/// The parts of an OOXML package
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Package {
    parts: BTreeMap<String, Vec<u8>>,
}

impl Package {
    /// Creates an empty package
    pub fn new() -> Self {
        Package::default()
    }

    /// Reads a package from zip bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MergeError> {
        Package::from_reader(Cursor::new(bytes))
    }

    /// Reads a package from a zip archive
    ///
    /// Fails with [`MergeError::CorruptArchive`] if the archive cannot be read or has no
    /// `[Content_Types].xml`.
    pub fn from_reader<RS: Read + Seek>(reader: RS) -> Result<Self, MergeError> {
        let corrupt = |e: &dyn std::fmt::Display| MergeError::CorruptArchive(e.to_string());
        let mut zip = ZipArchive::new(reader).map_err(|e| corrupt(&e))?;
        let mut parts = BTreeMap::new();
        for i in 0..zip.len() {
            let mut file = zip.by_index(i).map_err(|e| corrupt(&e))?;
            if file.is_dir() {
                continue;
            }
            let name = partname::normalize(file.name());
            let mut bytes = Vec::with_capacity(file.size().min(1 << 24) as usize);
            file.read_to_end(&mut bytes)
                .map_err(|e| corrupt(&format_args!("cannot read '{name}': {e}")))?;
            if parts.insert(name.clone(), bytes).is_some() {
                return Err(corrupt(&format_args!("duplicate part '{name}'")));
            }
        }
        if !parts.contains_key(CONTENT_TYPES_PART) {
            return Err(corrupt(&format_args!("missing '{CONTENT_TYPES_PART}'")));
        }
        debug!("read package with {} parts", parts.len());
        Ok(Package { parts })
    }

    /// Serializes the package into zip bytes
    pub fn to_bytes(&self, compression_level: Option<i64>) -> Result<Vec<u8>, MergeError> {
        let cursor = self.write(Cursor::new(Vec::new()), compression_level)?;
        Ok(cursor.into_inner())
    }

    /// Writes the package as a zip archive, content types registry first
    pub fn write<W: Write + Seek>(
        &self,
        writer: W,
        compression_level: Option<i64>,
    ) -> Result<W, MergeError> {
        let mut zip = ZipWriter::new(writer);
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(
                compression_level.unwrap_or(DEFAULT_COMPRESSION_LEVEL),
            ));

        let first = [CONTENT_TYPES_PART, PACKAGE_RELS_PART];
        let ordered = first
            .iter()
            .filter_map(|name| self.parts.get_key_value(*name))
            .chain(
                self.parts
                    .iter()
                    .filter(|(name, _)| !first.contains(&name.as_str())),
            );
        for (name, bytes) in ordered {
            zip.start_file(name.as_str(), options)?;
            zip.write_all(bytes)?;
        }
        Ok(zip.finish()?)
    }

    /// The bytes of a part
    pub fn part(&self, name: &str) -> Option<&[u8]> {
        self.parts.get(name).map(Vec::as_slice)
    }

    /// Adds or replaces a part, returning the previous bytes
    pub fn set_part<N: Into<String>, B: Into<Vec<u8>>>(
        &mut self,
        name: N,
        bytes: B,
    ) -> Option<Vec<u8>> {
        self.parts.insert(name.into(), bytes.into())
    }

    /// Removes a part
    pub fn remove_part(&mut self, name: &str) -> Option<Vec<u8>> {
        self.parts.remove(name)
    }

    /// Is there a part with this name
    pub fn contains(&self, name: &str) -> bool {
        self.parts.contains_key(name)
    }

    /// Part names, sorted
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.parts.keys().map(String::as_str)
    }

    /// Parts, sorted by name
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.parts.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Set of part names
    pub fn part_names(&self) -> BTreeSet<String> {
        self.parts.keys().cloned().collect()
    }

    /// Number of parts
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    /// Is the package empty
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn package() -> Package {
        let mut p = Package::new();
        p.set_part("xl/workbook.xml", b"<workbook/>".to_vec());
        p.set_part(PACKAGE_RELS_PART, b"<Relationships/>".to_vec());
        p.set_part(CONTENT_TYPES_PART, b"<Types/>".to_vec());
        p
    }

    #[test]
    fn zip_round_trip() {
        let p = package();
        let bytes = p.to_bytes(None).unwrap();
        assert_eq!(Package::from_bytes(&bytes).unwrap(), p);

        let zip = ZipArchive::new(Cursor::new(bytes)).unwrap();
        let names: Vec<_> = zip.file_names().collect();
        assert!(names.contains(&CONTENT_TYPES_PART));
        assert_eq!(zip.name_for_index(0), Some(CONTENT_TYPES_PART));
        assert_eq!(zip.name_for_index(1), Some(PACKAGE_RELS_PART));
    }

    #[test]
    fn not_a_zip() {
        assert!(matches!(
            Package::from_bytes(b"definitely not a zip"),
            Err(MergeError::CorruptArchive(_))
        ));
    }

    #[test]
    fn missing_content_types() {
        let mut p = package();
        p.remove_part(CONTENT_TYPES_PART);
        let bytes = p.to_bytes(Some(1)).unwrap();
        assert!(matches!(
            Package::from_bytes(&bytes),
            Err(MergeError::CorruptArchive(m)) if m.contains("[Content_Types].xml")
        ));
    }

    #[test]
    fn part_access() {
        let mut p = package();
        assert_eq!(p.len(), 3);
        assert!(p.contains("xl/workbook.xml"));
        assert_eq!(p.part("xl/workbook.xml"), Some(&b"<workbook/>"[..]));
        assert_eq!(
            p.set_part("xl/workbook.xml", "<w/>"),
            Some(b"<workbook/>".to_vec())
        );
        assert!(p.remove_part("xl/workbook.xml").is_some());
        assert_eq!(p.paths().collect::<Vec<_>>(), [CONTENT_TYPES_PART, PACKAGE_RELS_PART]);
        assert!(!p.is_empty());
    }
}
