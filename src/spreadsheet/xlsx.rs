use crate::error::ResultMessage;
use crate::error::ResultOptionChain;
use crate::error::SourceError;
use crate::helpers::file::SourceFile;
use crate::helpers::xml::XmlAttributeHelper;
use crate::helpers::xml::XmlNodeHelper;
use crate::helpers::xml::XmlReader;
use crate::helpers::xml::XmlTextContextHelper;
use crate::helpers::zip::ZipHelper;
use crate::match_xml_events;
use crate::selection::reference::reference_to_index;
use crate::selection::SheetDescriptor;
use crate::spreadsheet::cell::Cell;
use crate::spreadsheet::cell::CellType;
use crate::spreadsheet::excel;
use crate::spreadsheet::excel::Package;
use crate::spreadsheet::section::SectionBuilder;
use crate::spreadsheet::Spreadsheet;
use quick_xml::events::Event;
use quick_xml::name::QName;
use std::borrow::Cow;
use std::collections::HashMap;
use std::collections::HashSet;
use std::io::BufReader;
use std::ops::ControlFlow;
use std::path::Path;
use tracing::debug;
use zip::read::ZipFile;

const SHARED_STRINGS: &str = "xl/sharedStrings.xml";

const TAG_SHARED_STRING_ITEM: QName = QName(b"si");
const TAG_PHONETIC_TEXT: QName = QName(b"rPh");
const TAG_TEXT: QName = QName(b"t");
const TAG_WORKBOOK_PROPERTIES: QName = QName(b"workbookPr");
const TAG_SHEET: QName = QName(b"sheet");
const TAG_DIMENSION: QName = QName(b"dimension");
const TAG_SHEET_DATA: QName = QName(b"sheetData");
const TAG_ROW: QName = QName(b"row");
const TAG_CELL: QName = QName(b"c");
const TAG_INLINE_STRING: QName = QName(b"is");
const TAG_VALUE: QName = QName(b"v");

/// An Excel 2007+ workbook (`.xlsx`).
pub(crate) struct XlsxSpreadsheet {
    zip: Package,
    /// Worksheets as (name, archive path), in workbook order.
    sheets: Vec<(String, String)>,
    is_1904: bool,
}

impl XlsxSpreadsheet {
    pub(crate) fn open(path: &Path) -> Result<XlsxSpreadsheet, SourceError> {
        let mut zip = excel::open_package(path)?;
        let (sheets, is_1904) = load_workbook(&mut zip)?;
        Ok(XlsxSpreadsheet { zip, sheets, is_1904 })
    }
}

impl Spreadsheet for XlsxSpreadsheet {
    /// Trusts each worksheet's `<dimension>` element, which precedes the cell
    /// data. Sheets without one are scanned for the last cell holding a value.
    fn probe(&mut self) -> Result<Vec<SheetDescriptor>, SourceError> {
        let mut catalog = Vec::with_capacity(self.sheets.len());
        for (index, (name, path)) in self.sheets.iter().enumerate() {
            let (row_count, col_count) = read_dimension(&mut self.zip, path)
                .ok_none_else(|| scan_dimension(&mut self.zip, path))
                .with_prefix(name)?
                .unwrap_or_default();
            catalog.push(SheetDescriptor {
                name: name.to_owned(),
                index,
                row_count,
                col_count,
            });
        }
        Ok(catalog)
    }

    /// Two passes over the worksheet, both ending at the last requested row: the
    /// first collects the shared string indexes used inside the range so that
    /// only those strings are loaded, the second decodes the cells.
    fn read_section(&mut self, sheet_index: usize, builder: &mut SectionBuilder<'_>) -> Result<(), SourceError> {
        let (name, path) = self
            .sheets
            .get(sheet_index)
            .ok_or_else(|| SourceError::Corrupt(format!("worksheet #{sheet_index} does not exist")))?;
        let number_formats = excel::load_number_formats(&mut self.zip, self.is_1904)?;
        let range = builder.range();

        let mut indexes = HashSet::<usize>::new();
        if self.zip.file(SHARED_STRINGS)?.is_some() {
            walk_cells(&mut self.zip, path, &number_formats, true, |cell| {
                if cell.row >= range.end_row() {
                    return Ok(ControlFlow::Break(()));
                }
                if cell.kind == CellType::SharedString && range.contains(cell.row, cell.col) {
                    indexes.insert(cell.value.trim().parse::<usize>()?);
                }
                Ok(ControlFlow::Continue(()))
            })
            .with_prefix(name)?;
        }
        let (shared_strings, mappings) = load_shared_strings(&mut self.zip, indexes)?;
        debug!(sheet = %name, shared_strings = shared_strings.len(), "Load shared strings");

        walk_cells(&mut self.zip, path, &number_formats, true, |cell| {
            if builder.after_rows(cell.row) {
                return Ok(ControlFlow::Break(()));
            }
            if !range.contains(cell.row, cell.col) {
                return Ok(ControlFlow::Continue(()));
            }
            let (row, col) = (cell.row, cell.col);
            let value = cell.into_value(|index| {
                mappings
                    .get(&index)
                    .and_then(|position| shared_strings.get(*position))
                    .map(String::as_str)
            })?;
            Ok(builder.push(row, col, value))
        })
        .with_prefix(name)
    }
}

/// Lists worksheets from `xl/workbook.xml` and detects the 1904 date system.
fn load_workbook(zip: &mut Package) -> Result<(Vec<(String, String)>, bool), SourceError> {
    let relationships = excel::load_relationships(zip, "xl/_rels/workbook.xml.rels")?;
    let mut reader = zip.require_xml_reader("xl/workbook.xml")?;
    let mut sheets: Vec<(String, String)> = Vec::new();
    let mut is_1904 = false;
    match_xml_events!(reader => {
        Event::Start(event) if event.name() == TAG_SHEET => {
            let mut name = None::<Cow<str>>;
            let mut id = None::<Cow<str>>;
            for result in event.attributes() {
                let attribute = result?;
                let key = attribute.key.local_name();
                if key.as_ref() == b"name" {
                    name = Some(attribute.get_value()?);
                } else if key.as_ref() == b"id" {
                    id = Some(attribute.get_value()?);
                }
            }
            if let Some((name, id)) = name.zip(id) {
                if let Some(path) = relationships.get(id.as_ref()) {
                    sheets.push((name.to_string(), path.to_owned()));
                }
            }
        }
        Event::Start(event) if event.name() == TAG_WORKBOOK_PROPERTIES => {
            is_1904 = event.get_attribute_value("date1904")?
                .map(|value| value == "1" || value == "true")
                .unwrap_or(false);
        }
    });
    Ok((sheets, is_1904))
}

/// Reads `<dimension ref="A1:E100">` as (rows, columns) counted from A1.
/// `None` when the element is missing or only says `A1`, which writers also
/// emit for empty sheets.
fn read_dimension(zip: &mut Package, path: &str) -> Result<Option<(usize, usize)>, SourceError> {
    let mut reader = zip.require_xml_reader(path)?;
    match_xml_events!(reader => {
        Event::Start(event) if event.name() == TAG_SHEET_DATA => break,
        Event::Start(event) if event.name() == TAG_DIMENSION => {
            let reference = event.get_attribute_value("ref")?.unwrap_or_default();
            let last = reference.rsplit(':').next().unwrap_or_default();
            return Ok(reference_to_index(last)
                .filter(|(row, col)| *row > 0 || *col > 0)
                .map(|(row, col)| (row + 1, col + 1)));
        }
    });
    Ok(None)
}

/// Finds the extent of the cells that hold a value, without decoding any of them.
fn scan_dimension(zip: &mut Package, path: &str) -> Result<Option<(usize, usize)>, SourceError> {
    let mut extent = (0usize, 0usize);
    walk_cells(zip, path, &[], false, |cell| {
        extent.0 = extent.0.max(cell.row + 1);
        extent.1 = extent.1.max(cell.col + 1);
        Ok(ControlFlow::Continue(()))
    })?;
    Ok(Some(extent))
}

/// Visits, in document order, every `<c>` that holds a `<v>` or `<is>` value.
/// With `decode` off the value elements are skipped and `Cell::value` stays empty.
fn walk_cells<F>(zip: &mut Package, path: &str, number_formats: &[CellType], decode: bool, mut visit: F) -> Result<(), SourceError>
where
    F: FnMut(Cell) -> Result<ControlFlow<()>, SourceError>,
{
    let mut reader = zip.require_xml_reader(path)?;
    let mut row_count = 0usize;
    let mut col_count = 0usize;
    let mut current = None::<Cell>;
    let mut has_value = false;
    match_xml_events!(reader => {
        Event::Start(event) if event.name() == TAG_ROW => {
            if let Some(row) = event.parse_attribute_value::<usize>("r")? {
                row_count = row.saturating_sub(1);
            }
            col_count = 0;
        }
        Event::End(event) if event.name() == TAG_ROW => row_count += 1,
        Event::Start(event) if event.name() == TAG_CELL => {
            let (row, col) = event.get_attribute_value("r")?
                .and_then(|reference| reference_to_index(&reference))
                .unwrap_or((row_count, col_count));
            col_count = col + 1;
            let mut kind = match event.get_attribute_value("t")?.as_deref() {
                Some("inlineStr") | Some("str") => CellType::InlineString,
                Some("s") => CellType::SharedString,
                Some("d") => CellType::IsoDateTime,
                Some("b") => CellType::Boolean,
                Some("e") => CellType::Error,
                _ => CellType::Number,
            };
            if kind == CellType::Number {
                if let Some(style) = event.parse_attribute_value::<usize>("s")? {
                    kind = number_formats.get(style).copied().unwrap_or(CellType::Number);
                }
            }
            current = Some(Cell { row, col, kind, value: String::new() });
            has_value = false;
        }
        Event::Start(event) if current.is_some() && event.name() == TAG_VALUE => {
            has_value = true;
            if decode {
                let value = read_string_value(&mut reader, TAG_VALUE, true)?;
                if let Some(cell) = current.as_mut() {
                    cell.value = value;
                }
            } else {
                reader.skip_element(TAG_VALUE)?;
            }
        }
        Event::Start(event) if current.is_some() && event.name() == TAG_INLINE_STRING => {
            has_value = true;
            if decode {
                let value = read_string_value(&mut reader, TAG_INLINE_STRING, false)?;
                if let Some(cell) = current.as_mut() {
                    cell.value = value;
                }
            } else {
                reader.skip_element(TAG_INLINE_STRING)?;
            }
        }
        Event::End(event) if event.name() == TAG_CELL => {
            if let Some(cell) = current.take().filter(|_| has_value) {
                if visit(cell)?.is_break() {
                    break;
                }
            }
        }
    });
    Ok(())
}

/// Loads the shared strings whose table index is in `indexes`.
/// Returns the strings plus a map from table index to position in that vector.
fn load_shared_strings(zip: &mut Package, mut indexes: HashSet<usize>) -> Result<(Vec<String>, HashMap<usize, usize>), SourceError> {
    let mut shared_strings = Vec::<String>::with_capacity(indexes.len());
    let mut mappings = HashMap::<usize, usize>::with_capacity(indexes.len());
    if indexes.is_empty() {
        return Ok((shared_strings, mappings));
    }
    let mut reader = match zip.xml_reader(SHARED_STRINGS)? {
        Some(reader) => reader,
        None => return Ok((shared_strings, mappings)),
    };

    let mut id = 0usize;
    match_xml_events!(reader => {
        Event::Start(event) if event.name() == TAG_SHARED_STRING_ITEM => {
            if indexes.remove(&id) {
                let string = read_string_value(&mut reader, TAG_SHARED_STRING_ITEM, false)?;
                mappings.insert(id, shared_strings.len());
                shared_strings.push(string);
            } else {
                reader.skip_element(TAG_SHARED_STRING_ITEM)?;
            }
            if indexes.is_empty() {
                break;
            }
            id += 1;
        }
    });
    Ok((shared_strings, mappings))
}

/// Collects the text of an element, skipping phonetic runs.
fn read_string_value(
    reader: &mut XmlReader<BufReader<ZipFile<'_, SourceFile>>>,
    end_tag: QName,
    is_text_content: bool,
) -> Result<String, SourceError> {
    let mut is_phonetic_text = false;
    let mut is_text = is_text_content;
    let mut text = String::new();
    match_xml_events!(reader => {
        Event::End(event) if event.name() == end_tag => break,
        Event::Start(event) if event.name() == TAG_PHONETIC_TEXT => is_phonetic_text = true,
        Event::End(event) if event.name() == TAG_PHONETIC_TEXT => is_phonetic_text = false,
        Event::Start(event) if !is_phonetic_text && event.name() == TAG_TEXT => is_text = true,
        Event::End(event) if is_text && event.name() == TAG_TEXT => is_text = false,
        Event::Text(event) if is_text => text.push_bytes_text(&event)?,
        Event::CData(event) if is_text => text.push_str(&event.xml_content()?),
        Event::GeneralRef(event) if is_text => text.push_bytes_ref(&event)?,
    });
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selection::RangeSpec;
    use crate::spreadsheet::CellValue;
    use crate::spreadsheet::Row;
    use crate::testing;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn read(spreadsheet: &mut XlsxSpreadsheet, sheet_index: usize, range: RangeSpec) -> Result<Vec<Row>, SourceError> {
        let mut rows = Vec::new();
        let mut sink = |chunk: Vec<Row>| {
            rows.extend(chunk);
            ControlFlow::Continue(())
        };
        let mut builder = SectionBuilder::new(range, 2, &mut sink);
        spreadsheet.read_section(sheet_index, &mut builder)?;
        let _ = builder.finish();
        Ok(rows)
    }

    #[test]
    fn probe_uses_dimension() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("book.xlsx");
        testing::write_xlsx(&path, &[("Numbers", testing::numbers(5, 5)), ("Wide", testing::numbers(2, 30))]);

        let catalog = XlsxSpreadsheet::open(&path).unwrap().probe().unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!((catalog[0].name.as_str(), catalog[0].row_count, catalog[0].col_count), ("Numbers", 5, 5));
        assert_eq!((catalog[1].name.as_str(), catalog[1].index, catalog[1].col_count), ("Wide", 1, 30));
    }

    #[test]
    fn probe_scans_without_dimension() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("book.xlsx");
        testing::write_zip(
            &path,
            &testing::xlsx_parts(
                &[r#"<c r="A1"><v>1</v></c><c r="B1" s="1"/>"#, r#"<c r="C2" t="inlineStr"><is><t>x</t></is></c>"#],
                "",
                None,
            ),
        );
        let catalog = XlsxSpreadsheet::open(&path).unwrap().probe().unwrap();
        assert_eq!((catalog[0].row_count, catalog[0].col_count), (2, 3));
    }

    #[test]
    fn read_requested_rectangle() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("book.xlsx");
        testing::write_xlsx(&path, &[("Numbers", testing::numbers(5, 5))]);

        let mut spreadsheet = XlsxSpreadsheet::open(&path).unwrap();
        let rows = read(&mut spreadsheet, 0, RangeSpec::new(0, 3, 0, 2).unwrap()).unwrap();
        assert_eq!(rows, testing::numbers_at(0..3, 0..2));

        let rows = read(&mut spreadsheet, 0, RangeSpec::new(3, 5, 2, 5).unwrap()).unwrap();
        assert_eq!(rows, testing::numbers_at(3..5, 2..5));
    }

    #[test]
    fn read_typed_values() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("book.xlsx");
        let styles = r#"<styleSheet><numFmts count="1"><numFmt numFmtId="164" formatCode="yyyy-mm-dd hh:mm"/></numFmts><cellXfs count="3"><xf numFmtId="0"/><xf numFmtId="14"/><xf numFmtId="164"/></cellXfs></styleSheet>"#;
        let row = concat!(
            r#"<c r="A1" t="s"><v>1</v></c>"#,
            r#"<c r="B1" t="b"><v>1</v></c>"#,
            r#"<c r="C1" s="1"><v>45322</v></c>"#,
            r#"<c r="D1" s="2"><v>45322.5</v></c>"#,
            r#"<c r="E1" t="e"><v>#DIV/0!</v></c>"#,
            r#"<c r="F1" t="inlineStr"><is><r><t>a &amp; </t></r><r><t>b</t></r></is></c>"#,
        );
        let shared_strings = r#"<sst><si><t>unused</t></si><si><t>shared</t><rPh><t>phonetic</t></rPh></si></sst>"#;
        let mut parts = testing::xlsx_parts(&[row], styles, Some("A1:F1"));
        parts.push(("xl/sharedStrings.xml".to_owned(), shared_strings.to_owned()));
        testing::write_zip(&path, &parts);

        let mut spreadsheet = XlsxSpreadsheet::open(&path).unwrap();
        let rows = read(&mut spreadsheet, 0, RangeSpec::new(0, 1, 0, 6).unwrap()).unwrap();
        assert_eq!(
            rows,
            vec![vec![
                CellValue::from("shared"),
                CellValue::Bool(true),
                CellValue::from("2024-01-31"),
                CellValue::from("2024-01-31 12:00:00"),
                CellValue::from("#DIV/0!"),
                CellValue::from("a & b"),
            ]]
        );
    }

    #[test]
    fn unknown_sheet_index_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("book.xlsx");
        testing::write_xlsx(&path, &[("Numbers", testing::numbers(1, 1))]);

        let mut spreadsheet = XlsxSpreadsheet::open(&path).unwrap();
        let result = read(&mut spreadsheet, 3, RangeSpec::new(0, 1, 0, 1).unwrap());
        assert!(matches!(result, Err(SourceError::Corrupt(_))));
    }

    #[test]
    fn not_a_zip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("book.xlsx");
        std::fs::write(&path, b"plain text").unwrap();
        assert!(matches!(XlsxSpreadsheet::open(&path), Err(SourceError::ZipError(_))));
    }
}
