//! Summary metadata (`docProps/app.xml` and `docProps/core.xml`)
//!
//! Both documents are derived from the merged workbook rather than merged.

use chrono::{DateTime, SecondsFormat, Utc};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader as XmlReader, Writer as XmlWriter};

use crate::utils::malformed;
use crate::MergeError;

/// Extended properties part
pub const APP_PART: &str = "docProps/app.xml";
/// Core properties part
pub const CORE_PART: &str = "docProps/core.xml";

const EXTENDED_PROPERTIES_NS: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/extended-properties";
const VT_NS: &str = "http://schemas.openxmlformats.org/officeDocument/2006/docPropsVTypes";
const CORE_PROPERTIES_NS: &str =
    "http://schemas.openxmlformats.org/package/2006/metadata/core-properties";

type Writer = XmlWriter<Vec<u8>>;

fn start(writer: &mut Writer, name: &str, attributes: &[(&str, &str)]) -> std::io::Result<()> {
    let mut e = BytesStart::new(name);
    for attr in attributes {
        e.push_attribute(*attr);
    }
    writer.write_event(Event::Start(e))
}

fn end(writer: &mut Writer, name: &str) -> std::io::Result<()> {
    writer.write_event(Event::End(BytesEnd::new(name)))
}

fn text_element(
    writer: &mut Writer,
    name: &str,
    attributes: &[(&str, &str)],
    text: &str,
) -> std::io::Result<()> {
    start(writer, name, attributes)?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    end(writer, name)
}

fn new_writer() -> std::io::Result<Writer> {
    let mut writer = XmlWriter::new(Vec::with_capacity(1024));
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), Some("yes"))))?;
    writer.get_mut().extend_from_slice(b"\r\n");
    Ok(writer)
}

/// Builds `docProps/app.xml` listing `worksheets` then `charts` (chartsheet names)
///
/// Each non empty group gets its own heading pair, as Excel writes them.
pub fn app_properties(
    application: &str,
    worksheets: &[&str],
    charts: &[&str],
) -> Result<Vec<u8>, MergeError> {
    let mut w = new_writer()?;
    start(
        &mut w,
        "Properties",
        &[("xmlns", EXTENDED_PROPERTIES_NS), ("xmlns:vt", VT_NS)],
    )?;
    text_element(&mut w, "Application", &[], application)?;
    text_element(&mut w, "DocSecurity", &[], "0")?;
    text_element(&mut w, "ScaleCrop", &[], "false")?;

    let mut pairs: Vec<(&str, usize)> =
        [("Worksheets", worksheets.len()), ("Charts", charts.len())]
            .into_iter()
            .filter(|(_, n)| *n > 0)
            .collect();
    if pairs.is_empty() {
        pairs.push(("Worksheets", 0));
    }
    let size = (pairs.len() * 2).to_string();
    start(&mut w, "HeadingPairs", &[])?;
    start(
        &mut w,
        "vt:vector",
        &[("size", size.as_str()), ("baseType", "variant")],
    )?;
    for (heading, n) in pairs {
        start(&mut w, "vt:variant", &[])?;
        text_element(&mut w, "vt:lpstr", &[], heading)?;
        end(&mut w, "vt:variant")?;
        start(&mut w, "vt:variant", &[])?;
        text_element(&mut w, "vt:i4", &[], &n.to_string())?;
        end(&mut w, "vt:variant")?;
    }
    end(&mut w, "vt:vector")?;
    end(&mut w, "HeadingPairs")?;

    let count = (worksheets.len() + charts.len()).to_string();
    start(&mut w, "TitlesOfParts", &[])?;
    start(
        &mut w,
        "vt:vector",
        &[("size", count.as_str()), ("baseType", "lpstr")],
    )?;
    for name in worksheets.iter().chain(charts) {
        text_element(&mut w, "vt:lpstr", &[], name)?;
    }
    end(&mut w, "vt:vector")?;
    end(&mut w, "TitlesOfParts")?;

    text_element(&mut w, "LinksUpToDate", &[], "false")?;
    text_element(&mut w, "SharedDoc", &[], "false")?;
    text_element(&mut w, "HyperlinksChanged", &[], "false")?;
    text_element(&mut w, "AppVersion", &[], "16.0300")?;
    end(&mut w, "Properties")?;
    Ok(w.into_inner())
}

/// Builds `docProps/core.xml`
///
/// `created` is written as is, defaulting to `modified`.
pub fn core_properties(
    creator: &str,
    created: Option<&str>,
    modified: DateTime<Utc>,
) -> Result<Vec<u8>, MergeError> {
    let modified = modified.to_rfc3339_opts(SecondsFormat::Secs, true);
    let created = created.unwrap_or(&modified);
    let w3cdtf = [("xsi:type", "dcterms:W3CDTF")];

    let mut w = new_writer()?;
    start(
        &mut w,
        "cp:coreProperties",
        &[
            ("xmlns:cp", CORE_PROPERTIES_NS),
            ("xmlns:dc", "http://purl.org/dc/elements/1.1/"),
            ("xmlns:dcterms", "http://purl.org/dc/terms/"),
            ("xmlns:dcmitype", "http://purl.org/dc/dcmitype/"),
            ("xmlns:xsi", "http://www.w3.org/2001/XMLSchema-instance"),
        ],
    )?;
    text_element(&mut w, "dc:creator", &[], creator)?;
    text_element(&mut w, "cp:lastModifiedBy", &[], creator)?;
    text_element(&mut w, "dcterms:created", &w3cdtf, created)?;
    text_element(&mut w, "dcterms:modified", &w3cdtf, &modified)?;
    end(&mut w, "cp:coreProperties")?;
    Ok(w.into_inner())
}

/// Reads `dcterms:created` out of an existing core properties part
pub fn read_created(xml: &[u8]) -> Result<Option<String>, MergeError> {
    let mut reader = XmlReader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut in_created = false;
    let mut buf = Vec::with_capacity(512);
    loop {
        buf.clear();
        match reader.read_event_into(&mut buf).map_err(malformed(CORE_PART))? {
            Event::Start(ref e) if e.local_name().as_ref() == b"created" => in_created = true,
            Event::Text(ref t) if in_created => {
                let created = t.decode().map_err(malformed(CORE_PART))?;
                return Ok(Some(created.into_owned()));
            }
            Event::End(_) => in_created = false,
            Event::Eof => return Ok(None),
            _ => (),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn app_lists_sheets() {
        let xml = app_properties("Microsoft Excel", &["Data", "R&D"], &[]).unwrap();
        let xml = std::str::from_utf8(&xml).unwrap();
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\r\n"));
        assert!(xml.contains(
            r#"<HeadingPairs><vt:vector size="2" baseType="variant"><vt:variant><vt:lpstr>Worksheets</vt:lpstr></vt:variant><vt:variant><vt:i4>2</vt:i4></vt:variant></vt:vector></HeadingPairs>"#
        ));
        assert!(xml.contains(
            r#"<TitlesOfParts><vt:vector size="2" baseType="lpstr"><vt:lpstr>Data</vt:lpstr><vt:lpstr>R&amp;D</vt:lpstr></vt:vector></TitlesOfParts>"#
        ));
    }

    #[test]
    fn app_lists_charts_apart() {
        let xml = app_properties("Microsoft Excel", &["Data"], &["Chart1", "Chart2"]).unwrap();
        let xml = std::str::from_utf8(&xml).unwrap();
        assert!(xml.contains(
            r#"<HeadingPairs><vt:vector size="4" baseType="variant"><vt:variant><vt:lpstr>Worksheets</vt:lpstr></vt:variant><vt:variant><vt:i4>1</vt:i4></vt:variant><vt:variant><vt:lpstr>Charts</vt:lpstr></vt:variant><vt:variant><vt:i4>2</vt:i4></vt:variant></vt:vector></HeadingPairs>"#
        ));
        assert!(xml.contains(
            r#"<TitlesOfParts><vt:vector size="3" baseType="lpstr"><vt:lpstr>Data</vt:lpstr><vt:lpstr>Chart1</vt:lpstr><vt:lpstr>Chart2</vt:lpstr></vt:vector></TitlesOfParts>"#
        ));

        let xml = app_properties("Microsoft Excel", &[], &["Chart1"]).unwrap();
        let xml = std::str::from_utf8(&xml).unwrap();
        assert!(xml.contains(r#"<vt:vector size="2" baseType="variant">"#));
        assert!(!xml.contains("Worksheets"));
    }

    #[test]
    fn core_timestamps() {
        let modified = Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap();
        let xml = core_properties("me", None, modified).unwrap();
        let xml = std::str::from_utf8(&xml).unwrap();
        assert!(xml.contains(
            r#"<dcterms:created xsi:type="dcterms:W3CDTF">2024-05-06T07:08:09Z</dcterms:created>"#
        ));
        assert!(xml.contains("<cp:lastModifiedBy>me</cp:lastModifiedBy>"));
        assert_eq!(
            read_created(xml.as_bytes()).unwrap().as_deref(),
            Some("2024-05-06T07:08:09Z")
        );

        let xml = core_properties("me", Some("2001-01-01T00:00:00Z"), modified).unwrap();
        assert_eq!(
            read_created(&xml).unwrap().as_deref(),
            Some("2001-01-01T00:00:00Z")
        );
    }

    #[test]
    fn created_is_optional() {
        assert_eq!(read_created(b"<cp:coreProperties/>").unwrap(), None);
    }
}
