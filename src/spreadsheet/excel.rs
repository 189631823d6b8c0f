//! Office Open XML package helpers: relationships, styles and part paths.
use crate::error::SourceError;
use crate::helpers::file::SourceFile;
use crate::helpers::xml::XmlNodeHelper;
use crate::helpers::zip::ZipHelper;
use crate::match_xml_events;
use crate::spreadsheet::cell::CellType;
use quick_xml::events::Event;
use quick_xml::name::QName;
use std::borrow::Cow;
use std::collections::HashMap;
use std::path::Path;
use zip::ZipArchive;

const TAG_RELATIONSHIP: &[u8] = b"Relationship";
const TAG_CUSTOM_FORMATS: QName = QName(b"numFmts");
const TAG_CUSTOM_FORMAT: QName = QName(b"numFmt");
const TAG_FORMAT_INDEXES: QName = QName(b"cellXfs");
const TAG_FORMAT_INDEX: QName = QName(b"xf");

pub(super) type Package = ZipArchive<SourceFile>;

/// Opens the ZIP container of an Office Open XML workbook.
pub(super) fn open_package(path: &Path) -> Result<Package, SourceError> {
    Ok(ZipArchive::new(SourceFile::open_package(path)?)?)
}

/// Maps worksheet relationship ids to their part paths.
pub(super) fn load_relationships(zip: &mut Package, path: &str) -> Result<HashMap<String, String>, SourceError> {
    let mut reader = zip.require_xml_reader(path)?;
    let mut relationships: HashMap<String, String> = HashMap::new();
    match_xml_events!(reader => {
        Event::Start(event) if event.local_name().as_ref() == TAG_RELATIONSHIP => {
            let id = event.get_attribute_value("Id")?;
            let kind = event.get_attribute_value("Type")?;
            let target = event.get_attribute_value("Target")?;
            if kind.map(|it| it.ends_with("/worksheet")).unwrap_or(true) {
                if let Some((id, target)) = id.zip(target) {
                    relationships.insert(id.to_string(), to_zip_path(target));
                }
            }
        }
    });
    Ok(relationships)
}

/// Reads `xl/styles.xml` into one [`CellType`] per cell style index.
/// A workbook without styles yields an empty table, so every number stays a number.
pub(super) fn load_number_formats(zip: &mut Package, is_1904: bool) -> Result<Vec<CellType>, SourceError> {
    let mut reader = match zip.xml_reader("xl/styles.xml")? {
        Some(reader) => reader,
        None => return Ok(Vec::new()),
    };

    let mut custom_formats_context = false;
    let mut custom_formats = HashMap::<String, CellType>::new();
    let mut format_indexes_context = false;
    let mut format_indexes = Vec::<String>::new();
    let mut has_format_indexes = false;

    match_xml_events!(reader => {
        Event::Start(event) if event.name() == TAG_CUSTOM_FORMATS => custom_formats_context = true,
        Event::End(event) if event.name() == TAG_CUSTOM_FORMATS => custom_formats_context = false,
        Event::Start(event) if custom_formats_context && event.name() == TAG_CUSTOM_FORMAT => {
            let id = event.get_attribute_value("numFmtId")?;
            let format = event.get_attribute_value("formatCode")?;
            if let Some((id, format)) = id.zip(format) {
                custom_formats.insert(id.to_string(), CellType::parse_custom_number_format(&format, is_1904));
            }
        }

        Event::Start(event) if event.name() == TAG_FORMAT_INDEXES => {
            format_indexes_context = true;
            has_format_indexes = true;
        }
        Event::End(event) if event.name() == TAG_FORMAT_INDEXES => {
            format_indexes_context = false;
            // numFmts always precedes cellXfs.
            if has_format_indexes {
                break;
            }
        }
        Event::Start(event) if format_indexes_context && event.name() == TAG_FORMAT_INDEX => {
            let id = event.get_attribute_value("numFmtId")?;
            format_indexes.push(id.map(|id| id.to_string()).unwrap_or_default());
        }
    });

    Ok(format_indexes
        .iter()
        .map(|id| {
            custom_formats
                .get(id)
                .copied()
                .or_else(|| CellType::parse_builtin_number_format_id(id, is_1904))
                .unwrap_or(CellType::Number)
        })
        .collect())
}

/// Normalizes a relationship target to an archive path under `xl/`.
pub(super) fn to_zip_path(path: Cow<'_, str>) -> String {
    if let Some(absolute) = path.strip_prefix('/') {
        absolute.to_owned()
    } else if path.starts_with("xl/") {
        path.into_owned()
    } else {
        format!("xl/{path}")
    }
}
