#![allow(dead_code)]

use std::collections::BTreeSet;

use xlmerge::{Package, Relationship};

pub const MAIN_NS: &str = "http://schemas.openxmlformats.org/spreadsheetml/2006/main";
pub const REL_NS: &str = "http://schemas.openxmlformats.org/officeDocument/2006/relationships";
pub const WORKSHEET_REL: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet";
pub const CHARTSHEET_REL: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/chartsheet";
pub const VBA_PROJECT_REL: &str = "http://schemas.microsoft.com/office/2006/relationships/vbaProject";

/// Not a decodable image, the merge never looks inside media
pub const PNG: &[u8] = b"\x89PNG\r\n\x1a\n fake image";

pub fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Clone, Debug)]
struct SheetEntry {
    name: String,
    numbers: Vec<f64>,
    image: Option<String>,
    state: Option<&'static str>,
    chart: bool,
    /// Extra relationships of the sheet: type and target
    links: Vec<(String, String)>,
}

impl SheetEntry {
    fn new(name: &str) -> Self {
        SheetEntry {
            name: name.to_string(),
            numbers: Vec::new(),
            image: None,
            state: None,
            chart: false,
            links: Vec::new(),
        }
    }
}

/// Builds minimal but complete xlsx packages
#[derive(Clone, Debug, Default)]
pub struct PackageBuilder {
    sheets: Vec<SheetEntry>,
    defined_names: Vec<(String, String)>,
    created: Option<String>,
    /// Extra parts: name, content and content type override
    parts: Vec<(String, String, Option<String>)>,
    vba_project: Option<Vec<u8>>,
}

impl PackageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sheet with numbers in column A
    pub fn sheet(mut self, name: &str, numbers: &[f64]) -> Self {
        self.sheets.push(SheetEntry {
            numbers: numbers.to_vec(),
            ..SheetEntry::new(name)
        });
        self
    }

    /// Add a sheet showing `xl/media/{image}` through its own drawing
    pub fn sheet_with_image(mut self, name: &str, image: &str) -> Self {
        self.sheets.push(SheetEntry {
            numbers: vec![1.0],
            image: Some(image.to_string()),
            ..SheetEntry::new(name)
        });
        self
    }

    pub fn hidden_sheet(mut self, name: &str) -> Self {
        self.sheets.push(SheetEntry {
            state: Some("hidden"),
            ..SheetEntry::new(name)
        });
        self
    }

    /// Add a chartsheet, with no chart in it
    pub fn chartsheet(mut self, name: &str) -> Self {
        self.sheets.push(SheetEntry {
            chart: true,
            ..SheetEntry::new(name)
        });
        self
    }

    /// Add a relationship from the last sheet
    pub fn link(mut self, rel_type: &str, target: &str) -> Self {
        if let Some(sheet) = self.sheets.last_mut() {
            sheet.links.push((rel_type.to_string(), target.to_string()));
        }
        self
    }

    /// Add any part, with an override when `content_type` is given
    pub fn part(mut self, name: &str, content: &str, content_type: Option<&str>) -> Self {
        self.parts.push((
            name.to_string(),
            content.to_string(),
            content_type.map(str::to_string),
        ));
        self
    }

    /// Add `xl/vbaProject.bin`, making the workbook macro enabled
    pub fn vba_project(mut self, content: &[u8]) -> Self {
        self.vba_project = Some(content.to_vec());
        self
    }

    pub fn defined_name(mut self, name: &str, formula: &str) -> Self {
        self.defined_names
            .push((name.to_string(), formula.to_string()));
        self
    }

    pub fn created(mut self, created: &str) -> Self {
        self.created = Some(created.to_string());
        self
    }

    pub fn build(&self) -> Package {
        let mut p = Package::new();
        let mut overrides = vec![
            ("xl/workbook.xml", "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml".to_string()),
            ("xl/styles.xml", "application/vnd.openxmlformats-officedocument.spreadsheetml.styles+xml".to_string()),
            ("docProps/core.xml", "application/vnd.openxmlformats-package.core-properties+xml".to_string()),
            ("docProps/app.xml", "application/vnd.openxmlformats-officedocument.extended-properties+xml".to_string()),
        ]
        .into_iter()
        .map(|(p, c)| (p.to_string(), c))
        .collect::<Vec<_>>();

        let mut sheets_xml = String::new();
        let mut workbook_rels = String::new();
        let mut drawing = 0;
        for (i, sheet) in self.sheets.iter().enumerate() {
            let n = i + 1;
            let state = sheet
                .state
                .map(|s| format!(r#" state="{s}""#))
                .unwrap_or_default();
            sheets_xml.push_str(&format!(
                r#"<sheet name="{}" sheetId="{n}"{state} r:id="rId{n}"/>"#,
                sheet.name
            ));
            let folder = if sheet.chart { "chartsheets" } else { "worksheets" };
            let rel_type = if sheet.chart { CHARTSHEET_REL } else { WORKSHEET_REL };
            workbook_rels.push_str(&format!(
                r#"<Relationship Id="rId{n}" Type="{rel_type}" Target="{folder}/sheet{n}.xml"/>"#
            ));

            let mut sheet_rels: Vec<(String, String, String)> = Vec::new();
            let mut sheet_xml = if sheet.chart {
                format!(
                    r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<chartsheet xmlns="{MAIN_NS}" xmlns:r="{REL_NS}"><sheetViews><sheetView workbookViewId="0"/></sheetViews>"#
                )
            } else {
                let rows: String = sheet
                    .numbers
                    .iter()
                    .enumerate()
                    .map(|(r, v)| format!(r#"<row r="{0}"><c r="A{0}"><v>{v}</v></c></row>"#, r + 1))
                    .collect();
                format!(
                    r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<worksheet xmlns="{MAIN_NS}" xmlns:r="{REL_NS}"><sheetData>{rows}</sheetData>"#
                )
            };
            if let Some(image) = &sheet.image {
                drawing += 1;
                sheet_xml.push_str(r#"<drawing r:id="rId1"/>"#);
                sheet_rels.push((
                    "rId1".to_string(),
                    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/drawing"
                        .to_string(),
                    format!("../drawings/drawing{drawing}.xml"),
                ));
                p.set_part(
                    format!("xl/drawings/drawing{drawing}.xml"),
                    drawing_xml(&sheet.name),
                );
                p.set_part(
                    format!("xl/drawings/_rels/drawing{drawing}.xml.rels"),
                    rels(&[(
                        "rId1",
                        "http://schemas.openxmlformats.org/officeDocument/2006/relationships/image",
                        format!("../media/{image}").as_str(),
                    )]),
                );
                p.set_part(format!("xl/media/{image}"), PNG);
                overrides.push((
                    format!("xl/drawings/drawing{drawing}.xml"),
                    "application/vnd.openxmlformats-officedocument.drawing+xml".to_string(),
                ));
            }
            for (rel_type, target) in &sheet.links {
                let id = format!("rId{}", sheet_rels.len() + 1);
                sheet_rels.push((id, rel_type.clone(), target.clone()));
            }
            if !sheet_rels.is_empty() {
                let entries: Vec<(&str, &str, &str)> = sheet_rels
                    .iter()
                    .map(|(id, typ, target)| (id.as_str(), typ.as_str(), target.as_str()))
                    .collect();
                p.set_part(format!("xl/{folder}/_rels/sheet{n}.xml.rels"), rels(&entries));
            }
            sheet_xml.push_str(if sheet.chart { "</chartsheet>" } else { "</worksheet>" });
            p.set_part(format!("xl/{folder}/sheet{n}.xml"), sheet_xml);
            let content_type = if sheet.chart {
                "application/vnd.openxmlformats-officedocument.spreadsheetml.chartsheet+xml"
            } else {
                "application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"
            };
            overrides.push((format!("xl/{folder}/sheet{n}.xml"), content_type.to_string()));
        }
        let styles_rid = self.sheets.len() + 1;
        workbook_rels.push_str(&format!(
            r#"<Relationship Id="rId{styles_rid}" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/styles" Target="styles.xml"/>"#
        ));
        if let Some(vba) = &self.vba_project {
            let vba_rid = styles_rid + 1;
            workbook_rels.push_str(&format!(
                r#"<Relationship Id="rId{vba_rid}" Type="{VBA_PROJECT_REL}" Target="vbaProject.bin"/>"#
            ));
            p.set_part("xl/vbaProject.bin", vba.clone());
            overrides[0].1 = "application/vnd.ms-excel.sheet.macroEnabled.main+xml".to_string();
            overrides.push((
                "xl/vbaProject.bin".to_string(),
                "application/vnd.ms-office.vbaProject".to_string(),
            ));
        }
        for (name, content, content_type) in &self.parts {
            p.set_part(name.clone(), content.clone());
            if let Some(ct) = content_type {
                overrides.push((name.clone(), ct.clone()));
            }
        }

        let defined_names = if self.defined_names.is_empty() {
            String::new()
        } else {
            let names: String = self
                .defined_names
                .iter()
                .map(|(n, f)| format!(r#"<definedName name="{n}">{f}</definedName>"#))
                .collect();
            format!("<definedNames>{names}</definedNames>")
        };
        p.set_part(
            "xl/workbook.xml",
            format!(
                r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<workbook xmlns="{MAIN_NS}" xmlns:r="{REL_NS}"><bookViews><workbookView/></bookViews><sheets>{sheets_xml}</sheets>{defined_names}</workbook>"#
            ),
        );
        p.set_part(
            "xl/_rels/workbook.xml.rels",
            format!(
                r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">{workbook_rels}</Relationships>"#
            ),
        );
        p.set_part(
            "xl/styles.xml",
            format!(r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><styleSheet xmlns="{MAIN_NS}"/>"#),
        );
        p.set_part(
            "_rels/.rels",
            rels(&[
                ("rId1", "http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument", "xl/workbook.xml"),
                ("rId2", "http://schemas.openxmlformats.org/package/2006/relationships/metadata/core-properties", "docProps/core.xml"),
                ("rId3", "http://schemas.openxmlformats.org/officeDocument/2006/relationships/extended-properties", "docProps/app.xml"),
            ]),
        );
        let created = self.created.as_deref().unwrap_or("2020-01-01T00:00:00Z");
        p.set_part(
            "docProps/core.xml",
            format!(
                r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<cp:coreProperties xmlns:cp="http://schemas.openxmlformats.org/package/2006/metadata/core-properties" xmlns:dcterms="http://purl.org/dc/terms/" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance"><dcterms:created xsi:type="dcterms:W3CDTF">{created}</dcterms:created></cp:coreProperties>"#
            ),
        );
        p.set_part(
            "docProps/app.xml",
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Properties xmlns="http://schemas.openxmlformats.org/officeDocument/2006/extended-properties"><Application>Builder</Application></Properties>"#,
        );

        let overrides: String = overrides
            .iter()
            .map(|(p, c)| format!(r#"<Override PartName="/{p}" ContentType="{c}"/>"#))
            .collect();
        p.set_part(
            "[Content_Types].xml",
            format!(
                r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Default Extension="png" ContentType="image/png"/>{overrides}</Types>"#
            ),
        );
        p
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.build().to_bytes(None).unwrap()
    }
}

pub fn rels(entries: &[(&str, &str, &str)]) -> String {
    let entries: String = entries
        .iter()
        .map(|(id, typ, target)| {
            format!(r#"<Relationship Id="{id}" Type="{typ}" Target="{target}"/>"#)
        })
        .collect();
    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">{entries}</Relationships>"#
    )
}

fn drawing_xml(sheet: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<xdr:wsDr xmlns:xdr="http://schemas.openxmlformats.org/drawingml/2006/spreadsheetDrawing" xmlns:a="http://schemas.openxmlformats.org/drawingml/2006/main"><xdr:oneCellAnchor><xdr:from><xdr:col>1</xdr:col><xdr:colOff>0</xdr:colOff><xdr:row>1</xdr:row><xdr:rowOff>0</xdr:rowOff></xdr:from><xdr:ext cx="9525" cy="9525"/><xdr:pic><xdr:nvPicPr><xdr:cNvPr id="2" name="Picture of {sheet}"/><xdr:cNvPicPr/></xdr:nvPicPr><xdr:blipFill><a:blip xmlns:r="{REL_NS}" r:embed="rId1"/></xdr:blipFill><xdr:spPr/></xdr:pic><xdr:clientData/></xdr:oneCellAnchor></xdr:wsDr>"#
    )
}

pub fn part_str<'a>(package: &'a Package, part: &str) -> &'a str {
    std::str::from_utf8(
        package
            .part(part)
            .unwrap_or_else(|| panic!("missing part {part}")),
    )
    .unwrap()
}

pub fn sheet_names(package: &Package) -> Vec<String> {
    xlmerge::read_sheets("xl/workbook.xml", package.part("xl/workbook.xml").unwrap())
        .unwrap()
        .into_iter()
        .map(|s| s.name)
        .collect()
}

/// Relationships of `rels_part`
pub fn relationships(package: &Package, rels_part: &str) -> Vec<Relationship> {
    xlmerge::rels::parse(rels_part, package.part(rels_part).unwrap()).unwrap()
}

pub fn names(package: &Package) -> BTreeSet<String> {
    package.paths().map(str::to_string).collect()
}
