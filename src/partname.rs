//! Part name helpers
//!
//! Part names are stored without a leading slash and always use `/` as separator,
//! whatever the host OS is (e.g. `xl/worksheets/sheet1.xml`).

/// The content types registry part
pub const CONTENT_TYPES_PART: &str = "[Content_Types].xml";
/// The package level relationships part
pub const PACKAGE_RELS_PART: &str = "_rels/.rels";

/// Normalizes a zip entry name into a part name
pub fn normalize(name: &str) -> String {
    let name = name.replace('\\', "/");
    collapse(name.trim_start_matches('/'))
}

/// The folder of a part (`xl/worksheets` for `xl/worksheets/sheet1.xml`), empty at the root
pub fn directory(part: &str) -> &str {
    match part.rfind('/') {
        Some(i) => &part[..i],
        None => "",
    }
}

/// The last segment of a part name
pub fn file_name(part: &str) -> &str {
    match part.rfind('/') {
        Some(i) => &part[i + 1..],
        None => part,
    }
}

/// The lowercase extension of a part, without the dot
pub fn extension(part: &str) -> Option<String> {
    let name = file_name(part);
    match name.rfind('.') {
        Some(i) if i + 1 < name.len() => Some(name[i + 1..].to_ascii_lowercase()),
        _ => None,
    }
}

/// Is this part a relationships document
pub fn is_rels(part: &str) -> bool {
    part.ends_with(".rels") && directory(part).rsplit('/').next() == Some("_rels")
}

/// The relationships document describing `part` (`<dir>/_rels/<name>.rels`)
///
/// The package itself (empty part name) owns `_rels/.rels`.
pub fn rels_part_for(part: &str) -> String {
    let dir = directory(part);
    let name = file_name(part);
    if dir.is_empty() {
        format!("_rels/{name}.rels")
    } else {
        format!("{dir}/_rels/{name}.rels")
    }
}

/// The part owning a relationships document, the inverse of [`rels_part_for`]
///
/// Returns an empty string for the package relationships.
pub fn source_part_of(rels: &str) -> Option<String> {
    if !is_rels(rels) {
        return None;
    }
    let rels_dir = directory(rels);
    let owner_dir = directory(rels_dir);
    let name = file_name(rels).strip_suffix(".rels")?;
    Some(if owner_dir.is_empty() {
        name.to_string()
    } else {
        format!("{owner_dir}/{name}")
    })
}

/// Resolves a relationship target against the folder of the owning part
pub fn resolve(base_dir: &str, target: &str) -> String {
    let target = target.replace('\\', "/");
    if let Some(absolute) = target.strip_prefix('/') {
        collapse(absolute)
    } else if base_dir.is_empty() {
        collapse(&target)
    } else {
        collapse(&format!("{base_dir}/{target}"))
    }
}

/// Computes the target to write in a relationship of a part living in `from_dir` so it
/// points at `to`
pub fn relative_target(from_dir: &str, to: &str) -> String {
    let from: Vec<&str> = from_dir.split('/').filter(|s| !s.is_empty()).collect();
    let to_segments: Vec<&str> = to.split('/').filter(|s| !s.is_empty()).collect();
    let common = from
        .iter()
        .zip(&to_segments)
        .take_while(|(a, b)| a == b)
        .count();
    // never share the file name itself
    let common = common.min(to_segments.len().saturating_sub(1));
    let mut segments = vec![".."; from.len() - common];
    segments.extend_from_slice(&to_segments[common..]);
    segments.join("/")
}

/// Removes `.` and `..` segments
fn collapse(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => (),
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    parts.join("/")
}
