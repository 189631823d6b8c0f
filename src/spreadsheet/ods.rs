use crate::error::ResultMessage;
use crate::error::SourceError;
use crate::helpers::file::SourceFile;
use crate::helpers::xml::XmlNodeHelper;
use crate::helpers::xml::XmlReader;
use crate::helpers::xml::XmlTextContextHelper;
use crate::helpers::zip::ZipHelper;
use crate::match_xml_events;
use crate::selection::SheetDescriptor;
use crate::spreadsheet::cell::Cell;
use crate::spreadsheet::cell::CellType;
use crate::spreadsheet::section::SectionBuilder;
use crate::spreadsheet::Spreadsheet;
use quick_xml::events::Event;
use quick_xml::name::QName;
use std::io::BufReader;
use std::io::Read;
use std::ops::ControlFlow;
use std::path::Path;
use zip::read::ZipFile;
use zip::ZipArchive;

const MIME_TYPE: &[u8] = b"application/vnd.oasis.opendocument.spreadsheet";
const CONTENT: &str = "content.xml";

const TABLE: QName = QName(b"table:table");
const TABLE_ROW: QName = QName(b"table:table-row");
const TABLE_CELL: QName = QName(b"table:table-cell");
const TABLE_COVERED_CELL: QName = QName(b"table:covered-table-cell");
const ANNOTATION: QName = QName(b"office:annotation");
const PARAGRAPH: QName = QName(b"text:p");
const STRING: QName = QName(b"text:s");

type ContentReader<'a> = XmlReader<BufReader<ZipFile<'a, SourceFile>>>;

/// A non-empty cell of a table row, possibly repeated across columns.
#[derive(Debug)]
struct RowCell {
    col: usize,
    repeat: usize,
    kind: CellType,
    value: String,
}

/// An OpenDocument spreadsheet (`.ods`).
pub(crate) struct OdsSpreadsheet {
    zip: ZipArchive<SourceFile>,
}

impl OdsSpreadsheet {
    pub(crate) fn open(path: &Path) -> Result<Self, SourceError> {
        let mut zip = ZipArchive::new(SourceFile::open(path)?)?;
        check_mime(&mut zip)?;
        if is_password_protected(&mut zip)? {
            Err(SourceError::Unsupported(format!("'{}' is password protected", path.display())))?;
        }
        Ok(OdsSpreadsheet { zip })
    }
}

impl Spreadsheet for OdsSpreadsheet {
    /// Extents come from the row and column repeat counts; trailing repeats
    /// of empty rows and cells, which writers use to pad the grid, are not counted.
    fn probe(&mut self) -> Result<Vec<SheetDescriptor>, SourceError> {
        let mut catalog = Vec::new();
        let mut reader = self.zip.require_xml_reader(CONTENT)?;
        loop {
            let name = match next_table(&mut reader, catalog.len())? {
                Some(name) => name,
                None => break,
            };
            let mut row_count = 0usize;
            let mut col_count = 0usize;
            read_rows(&mut reader, false, |row, repeat, cells| {
                row_count = row + repeat;
                col_count = cells.iter().map(|cell| cell.col + cell.repeat).fold(col_count, usize::max);
                Ok(ControlFlow::Continue(()))
            })
            .with_prefix(&name)?;
            catalog.push(SheetDescriptor {
                name,
                index: catalog.len(),
                row_count,
                col_count,
            });
        }
        Ok(catalog)
    }

    fn read_section(&mut self, sheet_index: usize, builder: &mut SectionBuilder<'_>) -> Result<(), SourceError> {
        let mut reader = self.zip.require_xml_reader(CONTENT)?;
        let mut index = 0usize;
        let name = loop {
            match next_table(&mut reader, index)? {
                Some(name) if index == sheet_index => break name,
                Some(_) => reader.skip_element(TABLE)?,
                None => Err(SourceError::Corrupt(format!("table #{sheet_index} does not exist")))?,
            }
            index += 1;
        };

        let range = builder.range();
        read_rows(&mut reader, true, |row, repeat, cells| {
            if builder.after_rows(row) {
                return Ok(ControlFlow::Break(()));
            }
            let mut values = Vec::with_capacity(cells.len());
            for cell in cells {
                let from = cell.col.max(range.start_col());
                let to = (cell.col + cell.repeat).min(range.end_col());
                if from < to {
                    let value = Cell {
                        row,
                        col: cell.col,
                        kind: cell.kind,
                        value: cell.value.clone(),
                    }
                    .into_value(|_| None)?;
                    values.push((from, to, value));
                }
            }
            for row in row.max(range.start_row())..(row + repeat).min(range.end_row()) {
                for (from, to, value) in &values {
                    for col in *from..*to {
                        if builder.push(row, col, value.clone()).is_break() {
                            return Ok(ControlFlow::Break(()));
                        }
                    }
                }
            }
            if builder.after_rows(row + repeat) {
                Ok(ControlFlow::Break(()))
            } else {
                Ok(ControlFlow::Continue(()))
            }
        })
        .with_prefix(&name)
    }
}

/// Advances to the next `<table:table>` and returns its name, `None` when there are no more.
fn next_table(reader: &mut ContentReader<'_>, index: usize) -> Result<Option<String>, SourceError> {
    match_xml_events!(reader => {
        Event::Start(event) if event.name() == TABLE => {
            let name = event
                .get_attribute_value("table:name")?
                .map(|name| name.into_owned())
                .unwrap_or_else(|| format!("Sheet{}", index + 1));
            return Ok(Some(name));
        }
    });
    Ok(None)
}

/// Reads the rows of the current table up to its end tag.
///
/// `visit` receives each row holding at least one value: the row index, the
/// number of times the row repeats, and its non-empty cells. Text content is
/// only collected when `decode` is set.
fn read_rows<F>(reader: &mut ContentReader<'_>, decode: bool, mut visit: F) -> Result<(), SourceError>
where
    F: FnMut(usize, usize, &[RowCell]) -> Result<ControlFlow<()>, SourceError>,
{
    let mut row = 0usize;
    let mut row_repeat = 1usize;
    let mut col = 0usize;
    let mut cells = Vec::<RowCell>::new();
    let mut current = None::<RowCell>;
    let mut element_context = false;
    let mut comment_context = false;
    match_xml_events!(reader => {
        Event::End(event) if event.name() == TABLE => break,
        Event::Start(event) if event.name() == TABLE_ROW => {
            row_repeat = event.parse_attribute_value::<usize>("table:number-rows-repeated")?.unwrap_or(1).max(1);
            col = 0;
            cells.clear();
        }
        Event::End(event) if event.name() == TABLE_ROW => {
            if !cells.is_empty() && visit(row, row_repeat, &cells)?.is_break() {
                return Ok(());
            }
            row += row_repeat;
        }
        Event::Start(event) if event.name() == TABLE_CELL || event.name() == TABLE_COVERED_CELL => {
            let repeat = event.parse_attribute_value::<usize>("table:number-columns-repeated")?.unwrap_or(1).max(1);
            let mut kind = CellType::Empty;
            let mut value = String::new();
            if let Some(value_type) = event.get_attribute_value("office:value-type")? {
                let (cell_kind, attribute) = match value_type.as_ref() {
                    "string" => {
                        let is_error = event.get_attribute_value("calcext:value-type")?
                            .map(|kind| kind == "error")
                            .unwrap_or(false);
                        (if is_error { CellType::Error } else { CellType::InlineString }, None)
                    }
                    "boolean" => (CellType::Boolean, Some("office:boolean-value")),
                    "date" => (CellType::IsoDateTime, Some("office:date-value")),
                    "time" => (CellType::IsoDuration, Some("office:time-value")),
                    _ => (CellType::Number, Some("office:value")),
                };
                kind = cell_kind;
                if let Some(attribute) = attribute {
                    match event.get_attribute_value(attribute)? {
                        Some(data) if decode => value.push_str(&data),
                        Some(_) => (),
                        None => kind = CellType::Empty,
                    }
                }
            }
            element_context = decode && matches!(kind, CellType::InlineString | CellType::Error);
            current = Some(RowCell { col, repeat, kind, value });
        }
        Event::End(event) if event.name() == TABLE_CELL || event.name() == TABLE_COVERED_CELL => {
            if let Some(cell) = current.take() {
                col += cell.repeat;
                if cell.kind != CellType::Empty {
                    cells.push(cell);
                }
            }
            element_context = false;
            comment_context = false;
        }
        Event::Start(event) if element_context && event.name() == ANNOTATION => comment_context = true,
        Event::End(event) if element_context && event.name() == ANNOTATION => comment_context = false,
        Event::Start(event) if element_context && !comment_context && event.name() == PARAGRAPH => {
            if let Some(cell) = current.as_mut().filter(|cell| !cell.value.is_empty()) {
                cell.value.push('\n');
            }
        }
        Event::Start(event) if element_context && !comment_context && event.name() == STRING => {
            let count = event.parse_attribute_value::<usize>("text:c")?.unwrap_or(1);
            if let Some(cell) = current.as_mut() {
                cell.value.push_str(&" ".repeat(count));
            }
        }
        Event::Text(event) if element_context && !comment_context => {
            if let Some(cell) = current.as_mut() {
                cell.value.push_bytes_text(&event)?;
            }
        }
        Event::GeneralRef(event) if element_context && !comment_context => {
            if let Some(cell) = current.as_mut() {
                cell.value.push_bytes_ref(&event)?;
            }
        }
    });
    Ok(())
}

fn check_mime(zip: &mut ZipArchive<SourceFile>) -> Result<(), SourceError> {
    if let Some(file) = &mut zip.file("mimetype")? {
        let mut buffer = Vec::with_capacity(MIME_TYPE.len());
        file.take(MIME_TYPE.len() as u64 + 1).read_to_end(&mut buffer)?;
        if buffer.trim_ascii_end() != MIME_TYPE {
            Err(SourceError::Unsupported(format!(
                "mimetype '{}' is not an OpenDocument spreadsheet",
                String::from_utf8_lossy(&buffer)
            )))?;
        }
    }
    Ok(())
}

/// Encrypted entries are declared in the manifest; the archive itself stays a plain ZIP.
fn is_password_protected(zip: &mut ZipArchive<SourceFile>) -> Result<bool, SourceError> {
    let mut reader = match zip.xml_reader("META-INF/manifest.xml")? {
        Some(reader) => reader,
        None => return Ok(false),
    };
    match_xml_events!(reader => {
        Event::Start(event) if event.name() == QName(b"manifest:encryption-data") => return Ok(true),
    });
    Ok(false)
}
