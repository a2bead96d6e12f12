//! Resource families and collision free renaming
//!
//! Excel numbers most of its parts (`sheet1.xml`, `drawing3.xml`, `chart12.xml`, ...).
//! Two packages both start counting at 1, so every numbered part of the incoming package
//! is renumbered after the highest number already used in the output. Media, and any
//! other part whose name is already used, keep their file name with a `(n)` counter.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use log::debug;

use crate::partname;
use crate::utils::parse_u32;
use crate::MergeError;

/// Old part name to new part name
pub type RenameMap = BTreeMap<String, String>;

/// A monotonically numbered series of parts: `{prefix}{n}{extension}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceFamily {
    /// Part name up to the number, e.g. `xl/drawings/drawing`
    pub prefix: &'static str,
    /// Extension, dot included
    pub extension: &'static str,
    /// Content type of the members
    pub content_type: &'static str,
}

/// Numbered families known to the merge
pub const FAMILIES: &[ResourceFamily] = &[
    ResourceFamily {
        prefix: "xl/worksheets/sheet",
        extension: ".xml",
        content_type: "application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml",
    },
    ResourceFamily {
        prefix: "xl/chartsheets/sheet",
        extension: ".xml",
        content_type: "application/vnd.openxmlformats-officedocument.spreadsheetml.chartsheet+xml",
    },
    ResourceFamily {
        prefix: "xl/dialogsheets/sheet",
        extension: ".xml",
        content_type: "application/vnd.openxmlformats-officedocument.spreadsheetml.dialogsheet+xml",
    },
    ResourceFamily {
        prefix: "xl/drawings/drawing",
        extension: ".xml",
        content_type: "application/vnd.openxmlformats-officedocument.drawing+xml",
    },
    ResourceFamily {
        prefix: "xl/drawings/vmlDrawing",
        extension: ".vml",
        content_type: "application/vnd.openxmlformats-officedocument.vmlDrawing",
    },
    ResourceFamily {
        prefix: "xl/charts/chart",
        extension: ".xml",
        content_type: "application/vnd.openxmlformats-officedocument.drawingml.chart+xml",
    },
    ResourceFamily {
        prefix: "xl/charts/colors",
        extension: ".xml",
        content_type: "application/vnd.ms-office.chartcolorstyle+xml",
    },
    ResourceFamily {
        prefix: "xl/charts/style",
        extension: ".xml",
        content_type: "application/vnd.ms-office.chartstyle+xml",
    },
    ResourceFamily {
        prefix: "xl/comments",
        extension: ".xml",
        content_type: "application/vnd.openxmlformats-officedocument.spreadsheetml.comments+xml",
    },
    ResourceFamily {
        prefix: "xl/threadedComments/threadedComment",
        extension: ".xml",
        content_type: "application/vnd.ms-excel.threadedcomments+xml",
    },
    ResourceFamily {
        prefix: "xl/tables/table",
        extension: ".xml",
        content_type: "application/vnd.openxmlformats-officedocument.spreadsheetml.table+xml",
    },
    ResourceFamily {
        prefix: "xl/pivotTables/pivotTable",
        extension: ".xml",
        content_type: "application/vnd.openxmlformats-officedocument.spreadsheetml.pivotTable+xml",
    },
    ResourceFamily {
        prefix: "xl/printerSettings/printerSettings",
        extension: ".bin",
        content_type: "application/vnd.openxmlformats-officedocument.spreadsheetml.printerSettings",
    },
];

/// Folders whose parts keep their names and get a `(n)` counter on collision
pub const MEDIA_FOLDERS: &[&str] = &["xl/media/", "xl/embeddings/"];

impl ResourceFamily {
    /// The number of a member part, `None` if the part is not part of the family
    pub fn index_of(&self, part: &str) -> Option<u32> {
        let n = part
            .strip_prefix(self.prefix)?
            .strip_suffix(self.extension)?;
        parse_u32(n.as_bytes())
    }

    /// The part name of member `index`
    pub fn part_name(&self, index: u32) -> String {
        format!("{}{}{}", self.prefix, index, self.extension)
    }

    /// Finds the family of a part
    pub fn of(part: &str) -> Option<&'static ResourceFamily> {
        FAMILIES.iter().find(|f| f.index_of(part).is_some())
    }
}

/// Renames every incoming member of `family` after the highest member number found in
/// `existing`
///
/// Members are numbered in ascending order of their current number, so merging the same
/// inputs twice yields the same names. The `.rels` sibling of a renamed member follows its
/// part.
pub fn renumber(
    family: &ResourceFamily,
    existing: &BTreeSet<String>,
    incoming: &BTreeSet<String>,
) -> Result<RenameMap, MergeError> {
    let mut members: Vec<(u32, &String)> = incoming
        .iter()
        .filter_map(|p| family.index_of(p).map(|i| (i, p)))
        .collect();
    members.sort();

    let mut next = existing
        .iter()
        .filter_map(|p| family.index_of(p))
        .max()
        .unwrap_or(0);

    let mut renames = RenameMap::new();
    for (_, old) in members {
        let new = loop {
            next = next.checked_add(1).ok_or_else(|| {
                MergeError::IdExhausted(format!(
                    "number for '{}{}' parts",
                    family.prefix, family.extension
                ))
            })?;
            let candidate = family.part_name(next);
            if !existing.contains(&candidate) {
                break candidate;
            }
        };
        debug!("renumbering {old} -> {new}");
        let old_rels = partname::rels_part_for(old);
        if incoming.contains(&old_rels) {
            renames.insert(old_rels, partname::rels_part_for(&new));
        }
        renames.insert(old.clone(), new);
    }
    Ok(renames)
}

/// Renames incoming parts of a media `folder` colliding with `existing` parts
///
/// `image1.png` becomes `image1(1).png`, or the first free `image1(n).png`.
pub fn rename_media(
    folder: &str,
    existing: &BTreeSet<String>,
    incoming: &BTreeSet<String>,
) -> Result<RenameMap, MergeError> {
    let media = incoming
        .iter()
        .filter(|p| p.starts_with(folder) && !partname::is_rels(p));
    let mut taken: BTreeSet<String> = existing.iter().chain(incoming.iter()).cloned().collect();
    counter_renames(media, existing, incoming, &mut taken)
}

/// Renames incoming parts colliding with `existing` ones and not already in `planned`
///
/// This covers parts outside of the numbered families and media folders, such as form
/// controls or pivot caches, with the same `(n)` counter as media.
pub fn rename_collisions(
    existing: &BTreeSet<String>,
    incoming: &BTreeSet<String>,
    planned: &RenameMap,
) -> Result<RenameMap, MergeError> {
    let others = incoming
        .iter()
        .filter(|p| !partname::is_rels(p) && !planned.contains_key(*p));
    let mut taken: BTreeSet<String> = existing
        .iter()
        .chain(incoming.iter())
        .chain(planned.values())
        .cloned()
        .collect();
    counter_renames(others, existing, incoming, &mut taken)
}

/// Gives each of `parts` found in `existing` the first `stem(n).ext` name not `taken`
fn counter_renames<'p, I: Iterator<Item = &'p String>>(
    parts: I,
    existing: &BTreeSet<String>,
    incoming: &BTreeSet<String>,
    taken: &mut BTreeSet<String>,
) -> Result<RenameMap, MergeError> {
    let mut renames = RenameMap::new();
    for old in parts {
        if !existing.contains(old) {
            continue;
        }
        let (stem, ext) = split_extension(old);
        let new = (1..=u32::MAX)
            .map(|n| format!("{stem}({n}){ext}"))
            .find(|candidate| !taken.contains(candidate))
            .ok_or_else(|| MergeError::IdExhausted(format!("free name for '{old}'")))?;
        debug!("renaming colliding part {old} -> {new}");
        taken.insert(new.clone());
        let old_rels = partname::rels_part_for(old);
        if incoming.contains(&old_rels) {
            let new_rels = partname::rels_part_for(&new);
            taken.insert(new_rels.clone());
            renames.insert(old_rels, new_rels);
        }
        renames.insert(old.clone(), new);
    }
    Ok(renames)
}

/// Renames for every family, media folder and other colliding part of the incoming
/// package
pub fn plan_renames(
    existing: &BTreeSet<String>,
    incoming: &BTreeSet<String>,
) -> Result<RenameMap, MergeError> {
    let mut renames = RenameMap::new();
    for family in FAMILIES {
        renames.extend(renumber(family, existing, incoming)?);
    }
    for folder in MEDIA_FOLDERS {
        renames.extend(rename_media(folder, existing, incoming)?);
    }
    let others = rename_collisions(existing, incoming, &renames)?;
    renames.extend(others);
    Ok(renames)
}

/// Splits `xl/media/image1.png` into `xl/media/image1` and `.png`
fn split_extension(part: &str) -> (&str, &str) {
    let name_start = part.rfind('/').map_or(0, |i| i + 1);
    match part[name_start..].rfind('.') {
        Some(i) if i > 0 => part.split_at(name_start + i),
        _ => (part, ""),
    }
}
