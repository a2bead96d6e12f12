//! `MergeError` management module
//!
//! Every failure of a merge is fatal: the engine never returns a partial package.

use crate::validate::Issue;

/// An enum for all merge errors
#[derive(Debug)]
pub enum MergeError {
    /// Io error
    Io(std::io::Error),
    /// Zip error while serializing the output package
    Zip(zip::result::ZipError),
    /// Input is not a readable zip, or lacks a required root part
    CorruptArchive(String),
    /// A part's xml cannot be parsed
    MalformedXml {
        /// part path
        part: String,
        /// parser message
        message: String,
    },
    /// An internal relationship target cannot be resolved to any known part
    UnresolvedReference {
        /// part holding the reference
        part: String,
        /// unresolved target or relationship id
        target: String,
    },
    /// A part has no known content type
    UnknownContentType(String),
    /// A sheet name cannot be made unique within 31 characters
    SheetLimitExceeded(String),
    /// A numbering scheme (sheet ids, part numbers) has no value left
    IdExhausted(String),
    /// The merged package failed the integrity check
    Inconsistent(Vec<Issue>),
}

from_err!(std::io::Error, MergeError, Io);
from_err!(zip::result::ZipError, MergeError, Zip);

impl std::fmt::Display for MergeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MergeError::Io(e) => write!(f, "I/O error: {e}"),
            MergeError::Zip(e) => write!(f, "Zip error: {e}"),
            MergeError::CorruptArchive(e) => write!(f, "Corrupt archive: {e}"),
            MergeError::MalformedXml { part, message } => {
                write!(f, "Malformed xml in '{part}': {message}")
            }
            MergeError::UnresolvedReference { part, target } => {
                write!(f, "Unresolved reference '{target}' in '{part}'")
            }
            MergeError::UnknownContentType(p) => write!(f, "Unknown content type for '{p}'"),
            MergeError::SheetLimitExceeded(n) => {
                write!(f, "Cannot find a unique sheet name for '{n}'")
            }
            MergeError::IdExhausted(what) => write!(f, "No {what} left"),
            MergeError::Inconsistent(issues) => {
                write!(f, "Merged package is inconsistent")?;
                for issue in issues {
                    write!(f, "; {issue}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for MergeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MergeError::Io(e) => Some(e),
            MergeError::Zip(e) => Some(e),
            _ => None,
        }
    }
}
