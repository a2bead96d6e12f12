use std::env;
use std::fs;
use std::path::PathBuf;

use xlmerge::{MergeError, Merger, Package};

fn main() -> Result<(), MergeError> {
    env_logger::init();

    // merges the sheets of the second file into the first one, writing the result to the
    // third argument
    let mut args = env::args().skip(1);
    let (Some(output), Some(incoming), Some(dest)) = (args.next(), args.next(), args.next())
    else {
        eprintln!("usage: merge_xlsx <output.xlsx> <incoming.xlsx> <merged.xlsx>");
        std::process::exit(1);
    };
    for file in [&output, &incoming, &dest] {
        match PathBuf::from(file).extension().and_then(|s| s.to_str()) {
            Some("xlsx") | Some("xlsm") => (),
            _ => {
                eprintln!("expecting an xlsx or xlsm file, got '{file}'");
                std::process::exit(1);
            }
        }
    }

    let output = Package::from_bytes(&fs::read(output)?)?;
    let incoming = Package::from_bytes(&fs::read(incoming)?)?;
    let merger = Merger::new();
    let merged = merger.merge_packages(&output, &incoming)?;

    let workbook = merged.part("xl/workbook.xml").unwrap_or_default();
    for sheet in xlmerge::read_sheets("xl/workbook.xml", workbook)? {
        println!("{} (sheetId {}, {:?})", sheet.name, sheet.sheet_id, sheet.visible);
    }
    fs::write(dest, merged.to_bytes(merger.options().compression_level)?)?;
    Ok(())
}
