//! Merge of Excel (OOXML spreadsheet) packages
//!
//! # Status
//!
//! **xlmerge** is a pure Rust library combining the sheets of two `.xlsx` packages into a
//! single package Excel can open.
//!
//! Both packages number their parts (`sheet1.xml`, `drawing1.xml`, `image1.png`, ...) and
//! their relationship ids (`rId1`, ...) independently. The merge renumbers every incoming
//! part colliding with the output, rewrites every reference to them, unions the sheet
//! lists (renaming `Sheet1` into `Sheet1(1)` when needed), then regenerates the content
//! types registry and the summary metadata.
//!
//! Cell values, formulas and styles are not interpreted: workbook level resources
//! (styles, shared strings, theme, defined names) of the incoming package are not carried
//! over.
//!
//! # Examples
//! ```no_run
//! use xlmerge::{merge_packages, MergeOptions, Merger};
//!
//! let a = std::fs::read("a.xlsx")?;
//! let b = std::fs::read("b.xlsx")?;
//!
//! // default options
//! std::fs::write("merged.xlsx", merge_packages(&a, &b)?)?;
//!
//! // or customize the metadata written in the merged package
//! let options = MergeOptions::default().with_creator("reporting");
//! let merged = Merger::new().with_options(options).merge(&a, &b)?;
//! std::fs::write("merged.xlsx", merged)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
#![deny(missing_docs)]

#[macro_use]
mod utils;
mod errors;
mod merge;
mod package;

pub mod content_types;
pub mod docprops;
pub mod family;
pub mod partname;
pub mod rels;
pub mod rewrite;
pub mod validate;
pub mod workbook;

pub use crate::content_types::ContentTypes;
pub use crate::errors::MergeError;
pub use crate::family::{
    rename_collisions, rename_media, renumber, RenameMap, ResourceFamily, FAMILIES,
};
pub use crate::merge::{MergeOptions, Stage, WORKBOOK_RELS_PART};
pub use crate::package::Package;
pub use crate::rels::{allocate_id, max_numeric_id, Relationship, TargetMode};
pub use crate::rewrite::{rewrite_references, RidMap};
pub use crate::validate::{validate, Issue};
pub use crate::workbook::{
    append_sheets, merge_sheets, read_sheets, SheetDescriptor, SheetMerge, SheetVisible,
};

/// Merges packages with a set of [`MergeOptions`]
#[derive(Debug, Clone, Default)]
pub struct Merger {
    options: MergeOptions,
}

impl Merger {
    /// Creates a merger with default options
    pub fn new() -> Self {
        Merger::default()
    }

    /// Replaces the options
    pub fn with_options(self, options: MergeOptions) -> Self {
        Merger { options }
    }

    /// Current options
    pub fn options(&self) -> &MergeOptions {
        &self.options
    }

    /// Merges the sheets of the `incoming` zip into the `output` zip
    ///
    /// Returns the merged zip, nothing is returned if any step fails.
    pub fn merge(&self, output: &[u8], incoming: &[u8]) -> Result<Vec<u8>, MergeError> {
        let output = Package::from_bytes(output)?;
        let incoming = Package::from_bytes(incoming)?;
        self.merge_packages(&output, &incoming)?
            .to_bytes(self.options.compression_level)
    }

    /// Merges already extracted packages
    ///
    /// Neither input is modified.
    pub fn merge_packages(
        &self,
        output: &Package,
        incoming: &Package,
    ) -> Result<Package, MergeError> {
        merge::merge(output, incoming, &self.options)
    }
}

/// Merges the sheets of the `incoming` zip into the `output` zip, with default options
pub fn merge_packages(output: &[u8], incoming: &[u8]) -> Result<Vec<u8>, MergeError> {
    Merger::new().merge(output, incoming)
}
