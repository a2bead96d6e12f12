//! Package merge engine
//!
//! The merge is a linear state machine, every stage relying on what the previous ones
//! established:
//!
//! `Init -> RenumberFamilies -> RewriteIncomingReferences -> MergeWorkbookSheets ->
//! RewriteWorkbookRids -> UnionRelationshipDocuments -> RegisterContentTypes ->
//! RegenerateMetadata -> Done`
//!
//! The output starts as a copy of the first package, the incoming package is only read.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::content_types::{ContentTypes, MACRO_ENABLED_WORKBOOK_CONTENT_TYPE};
use crate::docprops::{self, APP_PART, CORE_PART};
use crate::family::{self, RenameMap};
use crate::package::Package;
use crate::partname::{self, CONTENT_TYPES_PART, PACKAGE_RELS_PART};
use crate::rels::{self, rel_type, Relationship, RID_PREFIX};
use crate::rewrite::{find_part, RidMap, Rewriter};
use crate::validate::validate;
use crate::workbook::{self, SheetDescriptor, SheetMerge, WORKBOOK_PART};
use crate::MergeError;

/// Relationships of the workbook part
pub const WORKBOOK_RELS_PART: &str = "xl/_rels/workbook.xml.rels";

/// Parts of the incoming package that are never copied, the output ones being rebuilt
const CONTROL_PARTS: &[&str] = &[
    CONTENT_TYPES_PART,
    PACKAGE_RELS_PART,
    APP_PART,
    CORE_PART,
    WORKBOOK_PART,
    WORKBOOK_RELS_PART,
];

/// Merge options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeOptions {
    /// Author written in the core properties
    pub creator: String,
    /// Application written in the extended properties
    pub application: String,
    /// Modification time, now if `None`
    pub modified: Option<DateTime<Utc>>,
    /// Check the integrity of the merged package
    pub verify: bool,
    /// Deflate level of the output archive
    pub compression_level: Option<i64>,
}

impl Default for MergeOptions {
    fn default() -> Self {
        MergeOptions {
            creator: "xlmerge".to_string(),
            application: "Microsoft Excel".to_string(),
            modified: None,
            verify: true,
            compression_level: None,
        }
    }
}

impl MergeOptions {
    /// Sets the author of the merged package
    pub fn with_creator(self, creator: &str) -> Self {
        MergeOptions {
            creator: creator.to_string(),
            ..self
        }
    }

    /// Sets the application name
    pub fn with_application(self, application: &str) -> Self {
        MergeOptions {
            application: application.to_string(),
            ..self
        }
    }

    /// Sets a fixed modification time
    pub fn with_modified(self, modified: DateTime<Utc>) -> Self {
        MergeOptions {
            modified: Some(modified),
            ..self
        }
    }

    /// Enables or disables the integrity check of the result
    pub fn with_verify(self, verify: bool) -> Self {
        MergeOptions { verify, ..self }
    }

    /// Sets the deflate level of the output archive
    pub fn with_compression_level(self, level: i64) -> Self {
        MergeOptions {
            compression_level: Some(level),
            ..self
        }
    }
}

/// Stages of a merge
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    /// Inputs are checked
    Init,
    /// Incoming numbered parts get collision free names
    RenumberFamilies,
    /// Incoming relationships follow the new names
    RewriteIncomingReferences,
    /// Sheet lists are unioned
    MergeWorkbookSheets,
    /// Incoming sheet relationship ids are remapped
    RewriteWorkbookRids,
    /// Relationships documents are merged or inserted
    UnionRelationshipDocuments,
    /// Every part gets a content type
    RegisterContentTypes,
    /// Summary documents are rebuilt
    RegenerateMetadata,
    /// The merged package is complete
    Done,
}

/// Merges `incoming` into a copy of `output`
pub(crate) fn merge(
    output: &Package,
    incoming: &Package,
    options: &MergeOptions,
) -> Result<Package, MergeError> {
    let mut engine = Engine::init(output, incoming, options)?;
    engine.renumber_families()?;
    engine.rewrite_incoming_references()?;
    let sheets = engine.merge_workbook_sheets()?;
    engine.rewrite_workbook_rids(&sheets)?;
    engine.union_relationship_documents(&sheets)?;
    engine.register_content_types()?;
    engine.regenerate_metadata(&sheets)?;
    engine.done()
}

struct Engine<'a> {
    options: &'a MergeOptions,
    stage: Stage,
    incoming: &'a Package,
    incoming_names: BTreeSet<String>,
    incoming_registry: ContentTypes,
    output: Package,
    registry: ContentTypes,
    /// Incoming parts copied to the output, by original name
    carried: BTreeSet<String>,
    renames: RenameMap,
    /// Final name to original name of carried parts
    origins: BTreeMap<String, String>,
    /// Carried relationships documents waiting for the union, by final name
    pending_rels: BTreeMap<String, Vec<u8>>,
    incoming_workbook_rels: Vec<Relationship>,
    /// Incoming VBA project carried into an output without macros, by original name
    vba_project: Option<String>,
}

fn required<'p>(package: &'p Package, part: &str, which: &str) -> Result<&'p [u8], MergeError> {
    package
        .part(part)
        .ok_or_else(|| MergeError::CorruptArchive(format!("{which} package lacks '{part}'")))
}

impl<'a> Engine<'a> {
    fn enter(&mut self, stage: Stage) {
        debug!("merge stage {:?} -> {:?}", self.stage, stage);
        self.stage = stage;
    }

    fn init(
        output: &Package,
        incoming: &'a Package,
        options: &'a MergeOptions,
    ) -> Result<Self, MergeError> {
        debug!("merge stage {:?}", Stage::Init);
        let registry = ContentTypes::parse(required(output, CONTENT_TYPES_PART, "output")?)?;
        let incoming_registry =
            ContentTypes::parse(required(incoming, CONTENT_TYPES_PART, "incoming")?)?;
        required(output, WORKBOOK_PART, "output")?;
        let output_workbook_rels = rels::parse(
            WORKBOOK_RELS_PART,
            required(output, WORKBOOK_RELS_PART, "output")?,
        )?;
        required(incoming, WORKBOOK_PART, "incoming")?;
        let incoming_workbook_rels = rels::parse(
            WORKBOOK_RELS_PART,
            required(incoming, WORKBOOK_RELS_PART, "incoming")?,
        )?;

        let incoming_names = incoming.part_names();
        let vba_project = if has_vba_project(&output_workbook_rels) {
            None
        } else {
            vba_project(&incoming_names, &incoming_workbook_rels)
        };
        let carried = carried_parts(
            incoming,
            &incoming_names,
            &incoming_workbook_rels,
            vba_project.is_some(),
        )?;
        Ok(Engine {
            options,
            stage: Stage::Init,
            incoming,
            incoming_names,
            incoming_registry,
            output: output.clone(),
            registry,
            carried,
            renames: RenameMap::new(),
            origins: BTreeMap::new(),
            pending_rels: BTreeMap::new(),
            incoming_workbook_rels,
            vba_project,
        })
    }

    fn final_name<'n>(&'n self, part: &'n str) -> &'n str {
        self.renames.get(part).map_or(part, String::as_str)
    }

    fn renumber_families(&mut self) -> Result<(), MergeError> {
        self.enter(Stage::RenumberFamilies);
        self.renames = family::plan_renames(&self.output.part_names(), &self.carried)?;
        Ok(())
    }

    /// Rewrites carried parts and inserts the non relationship ones
    fn rewrite_incoming_references(&mut self) -> Result<(), MergeError> {
        self.enter(Stage::RewriteIncomingReferences);
        let rids = RidMap::new();
        let rewriter = Rewriter::new(&self.renames, &rids, &self.incoming_names);

        let mut inserts = Vec::new();
        let mut pending_rels = BTreeMap::new();
        let mut origins = BTreeMap::new();
        for part in &self.carried {
            let Some(bytes) = self.incoming.part(part) else {
                continue;
            };
            let new_name = self.final_name(part).to_string();
            let bytes = match partname::extension(part).as_deref() {
                Some("xml") | Some("rels") => rewriter.rewrite(part, bytes)?.into_owned(),
                _ => bytes.to_vec(),
            };
            origins.insert(new_name.clone(), part.clone());
            if partname::is_rels(&new_name) {
                pending_rels.insert(new_name, bytes);
            } else {
                inserts.push((new_name, bytes));
            }
        }

        // the workbook relationships need the final sheet names too
        let workbook_rels = required(self.incoming, WORKBOOK_RELS_PART, "incoming")?;
        let workbook_rels = rewriter.rewrite(WORKBOOK_RELS_PART, workbook_rels)?;
        self.incoming_workbook_rels = rels::parse(WORKBOOK_RELS_PART, &workbook_rels)?;

        for (name, bytes) in inserts {
            self.output.set_part(name, bytes);
        }
        self.pending_rels = pending_rels;
        self.origins = origins;
        Ok(())
    }

    fn merge_workbook_sheets(&mut self) -> Result<SheetMerge, MergeError> {
        self.enter(Stage::MergeWorkbookSheets);
        let output_sheets = workbook::read_sheets(
            WORKBOOK_PART,
            required(&self.output, WORKBOOK_PART, "output")?,
        )?;
        let incoming_workbook = required(self.incoming, WORKBOOK_PART, "incoming")?;
        let incoming_sheets = workbook::read_sheets(WORKBOOK_PART, incoming_workbook)?;
        for name in workbook::defined_names(WORKBOOK_PART, incoming_workbook)? {
            warn!("incoming defined name '{name}' is not carried over");
        }
        let output_rels = rels::parse(
            WORKBOOK_RELS_PART,
            required(&self.output, WORKBOOK_RELS_PART, "output")?,
        )?;
        workbook::merge_sheets(
            &output_sheets,
            &incoming_sheets,
            &output_rels,
            &self.incoming_workbook_rels,
        )
    }

    /// Appends the incoming `<sheet>` entries, with their new relationship ids, to the
    /// output workbook
    fn rewrite_workbook_rids(&mut self, sheets: &SheetMerge) -> Result<(), MergeError> {
        self.enter(Stage::RewriteWorkbookRids);
        let no_renames = RenameMap::new();
        let no_parts = BTreeSet::new();
        let incoming_workbook = required(self.incoming, WORKBOOK_PART, "incoming")?;
        let rewritten = Rewriter::new(&no_renames, &sheets.rid_map, &no_parts)
            .rewrite(WORKBOOK_PART, incoming_workbook)?;

        let added: Vec<SheetDescriptor> = workbook::read_sheets(WORKBOOK_PART, &rewritten)?
            .into_iter()
            .zip(sheets.added())
            .map(|(incoming, merged)| SheetDescriptor {
                name: merged.name.clone(),
                sheet_id: merged.sheet_id,
                ..incoming
            })
            .collect();
        let output_workbook = required(&self.output, WORKBOOK_PART, "output")?;
        let merged = workbook::append_sheets(WORKBOOK_PART, output_workbook, &added)?;
        self.output.set_part(WORKBOOK_PART, merged);
        Ok(())
    }

    fn union_relationship_documents(&mut self, sheets: &SheetMerge) -> Result<(), MergeError> {
        self.enter(Stage::UnionRelationshipDocuments);
        let mut workbook_rels = rels::parse(
            WORKBOOK_RELS_PART,
            required(&self.output, WORKBOOK_RELS_PART, "output")?,
        )?;
        workbook_rels.extend(sheets.relationships.iter().cloned());
        if let Some(vba) = &self.vba_project {
            let id = rels::allocate_id(&workbook_rels, RID_PREFIX);
            let target = partname::relative_target(
                partname::directory(WORKBOOK_PART),
                self.final_name(vba),
            );
            debug!("adding workbook relationship {id} to the VBA project '{target}'");
            workbook_rels.push(Relationship::internal(id, rel_type::VBA_PROJECT, target));
        }
        self.output
            .set_part(WORKBOOK_RELS_PART, rels::serialize(&workbook_rels)?);

        for (name, bytes) in std::mem::take(&mut self.pending_rels) {
            let owner = partname::source_part_of(&name).unwrap_or_default();
            let Some(existing) = self.output.part(&name) else {
                self.output.set_part(name, bytes);
                continue;
            };
            let existing = rels::parse(&name, existing)?;
            let incoming = rels::parse(&name, &bytes)?;
            let (union, rids) = union_relationships(existing, incoming, partname::directory(&owner));
            debug!("merged relationships '{name}' ({} entries)", union.len());
            self.output.set_part(name.clone(), rels::serialize(&union)?);
            if !rids.is_empty() && self.origins.contains_key(&owner) {
                self.rewrite_owner(&owner, &rids)?;
            }
        }
        Ok(())
    }

    /// Applies relationship id changes to an incoming part already in the output
    fn rewrite_owner(&mut self, owner: &str, rids: &RidMap) -> Result<(), MergeError> {
        let no_renames = RenameMap::new();
        let no_parts = BTreeSet::new();
        let Some(xml) = self.output.part(owner) else {
            return Ok(());
        };
        let rewritten = Rewriter::new(&no_renames, rids, &no_parts)
            .rewrite(owner, xml)?
            .into_owned();
        self.output.set_part(owner, rewritten);
        Ok(())
    }

    fn register_content_types(&mut self) -> Result<(), MergeError> {
        self.enter(Stage::RegisterContentTypes);
        let output = &self.output;
        self.registry.retain_overrides(|part| output.contains(part));
        for part in self.output.paths() {
            if part == CONTENT_TYPES_PART {
                continue;
            }
            let hint = self
                .origins
                .get(part)
                .and_then(|original| self.incoming_registry.content_type(original));
            self.registry.ensure_registered(part, hint)?;
        }
        if self.vba_project.is_some() {
            self.registry
                .set_override(WORKBOOK_PART, MACRO_ENABLED_WORKBOOK_CONTENT_TYPE);
        }
        Ok(())
    }

    fn regenerate_metadata(&mut self, sheets: &SheetMerge) -> Result<(), MergeError> {
        self.enter(Stage::RegenerateMetadata);
        let workbook_rels = rels::parse(
            WORKBOOK_RELS_PART,
            required(&self.output, WORKBOOK_RELS_PART, "output")?,
        )?;
        let mut worksheets = Vec::new();
        let mut charts = Vec::new();
        for sheet in &sheets.sheets {
            let is_chart = workbook_rels
                .iter()
                .any(|r| r.id == sheet.relationship_id && r.rel_type == rel_type::CHARTSHEET);
            if is_chart {
                charts.push(sheet.name.as_str());
            } else {
                worksheets.push(sheet.name.as_str());
            }
        }
        let app = docprops::app_properties(&self.options.application, &worksheets, &charts)?;
        let created = match self.output.part(CORE_PART) {
            Some(core) => docprops::read_created(core)?,
            None => None,
        };
        let modified = self.options.modified.unwrap_or_else(Utc::now);
        let core = docprops::core_properties(&self.options.creator, created.as_deref(), modified)?;

        let mut package_rels = match self.output.part(PACKAGE_RELS_PART) {
            Some(xml) => rels::parse(PACKAGE_RELS_PART, xml)?,
            None => vec![Relationship::internal(
                format!("{RID_PREFIX}1"),
                rel_type::OFFICE_DOCUMENT,
                WORKBOOK_PART.to_string(),
            )],
        };
        let mut changed = !self.output.contains(PACKAGE_RELS_PART);
        for (typ, part) in [
            (rel_type::EXTENDED_PROPERTIES, APP_PART),
            (rel_type::CORE_PROPERTIES, CORE_PART),
        ] {
            if package_rels.iter().all(|r| r.rel_type != typ) {
                let id = rels::allocate_id(&package_rels, RID_PREFIX);
                debug!("adding package relationship {id} to '{part}'");
                package_rels.push(Relationship::internal(id, typ, part.to_string()));
                changed = true;
            }
        }
        if changed {
            self.output
                .set_part(PACKAGE_RELS_PART, rels::serialize(&package_rels)?);
        }

        self.output.set_part(APP_PART, app);
        self.output.set_part(CORE_PART, core);
        for part in [PACKAGE_RELS_PART, APP_PART, CORE_PART] {
            self.registry.ensure_registered(part, None)?;
        }
        self.output
            .set_part(CONTENT_TYPES_PART, self.registry.serialize()?);
        Ok(())
    }

    fn done(mut self) -> Result<Package, MergeError> {
        if self.options.verify {
            let issues = validate(&self.output)?;
            if !issues.is_empty() {
                return Err(MergeError::Inconsistent(issues));
            }
        }
        self.enter(Stage::Done);
        Ok(self.output)
    }
}

/// Does the workbook have a VBA project
fn has_vba_project(workbook_rels: &[Relationship]) -> bool {
    workbook_rels
        .iter()
        .any(|r| r.rel_type == rel_type::VBA_PROJECT)
}

/// The VBA project part of a workbook, if any
fn vba_project(names: &BTreeSet<String>, workbook_rels: &[Relationship]) -> Option<String> {
    let workbook_dir = partname::directory(WORKBOOK_PART);
    workbook_rels
        .iter()
        .filter(|r| r.rel_type == rel_type::VBA_PROJECT)
        .filter_map(|r| r.resolve(workbook_dir))
        .find_map(|target| find_part(names, &target).cloned())
}

/// Incoming parts to copy: everything but the control parts and the workbook level
/// resources no incoming sheet depends on
///
/// With `carry_vba`, the VBA project is carried too, with its own relationships.
fn carried_parts(
    incoming: &Package,
    names: &BTreeSet<String>,
    workbook_rels: &[Relationship],
    carry_vba: bool,
) -> Result<BTreeSet<String>, MergeError> {
    let workbook_dir = partname::directory(WORKBOOK_PART);
    let (roots, workbook_roots): (Vec<_>, Vec<_>) = workbook_rels
        .iter()
        .filter_map(|r| {
            let carry = rel_type::is_sheet(&r.rel_type)
                || (carry_vba && r.rel_type == rel_type::VBA_PROJECT);
            r.resolve(workbook_dir).map(|t| (carry, t))
        })
        .partition(|(carry, _)| *carry);

    let mut workbook_roots: Vec<String> = workbook_roots.into_iter().map(|(_, t)| t).collect();
    if let Some(xml) = incoming.part(PACKAGE_RELS_PART) {
        workbook_roots.extend(
            rels::parse(PACKAGE_RELS_PART, xml)?
                .iter()
                .filter_map(|r| r.resolve(""))
                .filter(|t| !CONTROL_PARTS.contains(&t.as_str())),
        );
    }

    let needed = reachable(incoming, names, roots.into_iter().map(|(_, t)| t))?;
    let workbook_level = reachable(incoming, names, workbook_roots)?;
    let mut carried = BTreeSet::new();
    for part in names {
        if CONTROL_PARTS.contains(&part.as_str()) {
            continue;
        }
        if workbook_level.contains(part) && !needed.contains(part) {
            if !partname::is_rels(part) {
                warn!("incoming workbook part '{part}' is not carried over");
            }
            continue;
        }
        carried.insert(part.clone());
    }
    Ok(carried)
}

/// Parts reachable from `roots` through internal relationships, with their `.rels`
fn reachable<I: IntoIterator<Item = String>>(
    package: &Package,
    names: &BTreeSet<String>,
    roots: I,
) -> Result<BTreeSet<String>, MergeError> {
    let mut seen = BTreeSet::new();
    let mut queue: Vec<String> = roots.into_iter().collect();
    while let Some(target) = queue.pop() {
        let Some(part) = find_part(names, &target) else {
            continue;
        };
        if !seen.insert(part.clone()) {
            continue;
        }
        let rels_part = partname::rels_part_for(part);
        if let Some(xml) = package.part(&rels_part) {
            let dir = partname::directory(part);
            queue.extend(
                rels::parse(&rels_part, xml)?
                    .iter()
                    .filter_map(|r| r.resolve(dir)),
            );
            seen.insert(rels_part);
        }
    }
    Ok(seen)
}

/// Appends `incoming` entries to `existing` ones
///
/// Entries pointing at the same target with the same type are kept once. Incoming ids
/// clashing with an existing one are reallocated, the returned map gives their new value.
fn union_relationships(
    mut existing: Vec<Relationship>,
    incoming: Vec<Relationship>,
    owner_dir: &str,
) -> (Vec<Relationship>, RidMap) {
    let mut rids = RidMap::new();
    for mut r in incoming {
        let same = existing.iter().find(|e| {
            e.rel_type == r.rel_type
                && e.target_mode == r.target_mode
                && match (e.resolve(owner_dir), r.resolve(owner_dir)) {
                    (Some(a), Some(b)) => a == b,
                    (None, None) => e.target == r.target,
                    _ => false,
                }
        });
        if let Some(same) = same {
            if same.id != r.id {
                rids.insert(r.id.clone(), same.id.clone());
            }
            continue;
        }
        if existing.iter().any(|e| e.id == r.id) {
            let id = rels::allocate_id(&existing, RID_PREFIX);
            debug!("relationship id {} reallocated to {id}", r.id);
            rids.insert(std::mem::replace(&mut r.id, id.clone()), id);
        }
        existing.push(r);
    }
    (existing, rids)
}
