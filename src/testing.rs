//! Fixture builders shared by the unit tests.
use crate::coordinator::cancel::CancelToken;
use crate::error::SourceError;
use crate::selection::reference::index_to_reference;
use crate::selection::SheetDescriptor;
use crate::spreadsheet::section::SectionBuilder;
use crate::spreadsheet::Spreadsheet;
use crate::spreadsheet::CellValue;
use crate::spreadsheet::Row;
use quick_xml::escape::escape;
use std::fs::File;
use std::io::Write;
use std::ops::Range;
use std::path::Path;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

/// A `rows` x `cols` grid where cell (r, c) holds `r * 10 + c`.
pub(crate) fn numbers(rows: usize, cols: usize) -> Vec<Row> {
    numbers_at(0..rows, 0..cols)
}

/// The slice `rows` x `cols` of the [`numbers`] grid.
pub(crate) fn numbers_at(rows: Range<usize>, cols: Range<usize>) -> Vec<Row> {
    rows.map(|row| cols.clone().map(|col| CellValue::Number((row * 10 + col) as f64)).collect())
        .collect()
}

/// The [`numbers`] grid as a JSON array of arrays.
pub(crate) fn numbers_json(rows: usize, cols: usize) -> String {
    let grid: Vec<Vec<usize>> = (0..rows)
        .map(|row| (0..cols).map(|col| row * 10 + col).collect())
        .collect();
    serde_json::to_string(&grid).unwrap()
}

pub(crate) fn write_zip(path: &Path, parts: &[(String, String)]) {
    let mut zip = ZipWriter::new(File::create(path).unwrap());
    for (name, content) in parts {
        zip.start_file(name.as_str(), SimpleFileOptions::default()).unwrap();
        zip.write_all(content.as_bytes()).unwrap();
    }
    zip.finish().unwrap();
}

pub(crate) fn write_csv(path: &Path, rows: &[Row]) {
    let mut writer = csv::WriterBuilder::new().flexible(true).from_path(path).unwrap();
    for row in rows {
        writer.write_record(row.iter().map(|value| value.to_string())).unwrap();
    }
    writer.flush().unwrap();
}

/// Parts of a one-sheet workbook whose `<sheetData>` holds `rows`, each the
/// inner XML of `<row r="n">`. `styles` is written only when non-empty.
pub(crate) fn xlsx_parts(rows: &[&str], styles: &str, dimension: Option<&str>) -> Vec<(String, String)> {
    let dimension = dimension
        .map(|reference| format!(r#"<dimension ref="{reference}"/>"#))
        .unwrap_or_default();
    let data: String = rows
        .iter()
        .enumerate()
        .map(|(index, cells)| format!(r#"<row r="{}">{cells}</row>"#, index + 1))
        .collect();
    let mut parts = workbook_parts(&["Sheet1"]);
    parts.push(("xl/worksheets/sheet1.xml".to_owned(), worksheet(&dimension, &data)));
    if !styles.is_empty() {
        parts.push(("xl/styles.xml".to_owned(), styles.to_owned()));
    }
    parts
}

/// Writes a workbook with one worksheet per entry. Text goes to the shared
/// string table and empty cells are left out.
pub(crate) fn write_xlsx(path: &Path, sheets: &[(&str, Vec<Row>)]) {
    let names: Vec<&str> = sheets.iter().map(|(name, _)| *name).collect();
    let mut parts = workbook_parts(&names);
    let mut shared_strings = Vec::<String>::new();
    for (index, (_, rows)) in sheets.iter().enumerate() {
        let width = rows.iter().map(Vec::len).max().unwrap_or(0);
        let dimension = match (rows.len(), width) {
            (0, _) | (_, 0) => String::new(),
            (height, width) => format!(r#"<dimension ref="A1:{}"/>"#, index_to_reference(height - 1, width - 1)),
        };
        let mut data = String::new();
        for (row, values) in rows.iter().enumerate() {
            data.push_str(&format!(r#"<row r="{}">"#, row + 1));
            for (col, value) in values.iter().enumerate() {
                let reference = index_to_reference(row, col);
                match value {
                    CellValue::Empty => (),
                    CellValue::Bool(value) => {
                        data.push_str(&format!(r#"<c r="{reference}" t="b"><v>{}</v></c>"#, u8::from(*value)))
                    }
                    CellValue::Number(value) => data.push_str(&format!(r#"<c r="{reference}"><v>{value}</v></c>"#)),
                    CellValue::Text(value) => {
                        data.push_str(&format!(r#"<c r="{reference}" t="s"><v>{}</v></c>"#, shared_strings.len()));
                        shared_strings.push(format!("<si><t>{}</t></si>", escape(value.as_str())));
                    }
                }
            }
            data.push_str("</row>");
        }
        parts.push((format!("xl/worksheets/sheet{}.xml", index + 1), worksheet(&dimension, &data)));
    }
    if !shared_strings.is_empty() {
        parts.push((
            "xl/sharedStrings.xml".to_owned(),
            format!("<sst>{}</sst>", shared_strings.concat()),
        ));
    }
    write_zip(path, &parts);
}

fn workbook_parts(names: &[&str]) -> Vec<(String, String)> {
    let sheets: String = names
        .iter()
        .enumerate()
        .map(|(index, name)| {
            format!(
                r#"<sheet name="{}" sheetId="{}" r:id="rId{}"/>"#,
                escape(*name),
                index + 1,
                index + 1
            )
        })
        .collect();
    let relationships: String = (1..=names.len())
        .map(|id| {
            format!(
                r#"<Relationship Id="rId{id}" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet{id}.xml"/>"#
            )
        })
        .collect();
    vec![
        (
            "[Content_Types].xml".to_owned(),
            r#"<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"/>"#.to_owned(),
        ),
        (
            "xl/workbook.xml".to_owned(),
            format!(
                r#"<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets>{sheets}</sheets></workbook>"#
            ),
        ),
        (
            "xl/_rels/workbook.xml.rels".to_owned(),
            format!(
                r#"<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">{relationships}</Relationships>"#
            ),
        ),
    ]
}

fn worksheet(dimension: &str, data: &str) -> String {
    format!(
        r#"<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main">{dimension}<sheetData>{data}</sheetData></worksheet>"#
    )
}

/// Parts of an OpenDocument spreadsheet whose body holds `tables`.
/// The first part is always `mimetype`.
pub(crate) fn ods_parts(tables: &str) -> Vec<(String, String)> {
    vec![
        (
            "mimetype".to_owned(),
            "application/vnd.oasis.opendocument.spreadsheet".to_owned(),
        ),
        (
            "content.xml".to_owned(),
            format!(
                concat!(
                    r#"<office:document-content"#,
                    r#" xmlns:office="urn:oasis:names:tc:opendocument:xmlns:office:1.0""#,
                    r#" xmlns:table="urn:oasis:names:tc:opendocument:xmlns:table:1.0""#,
                    r#" xmlns:text="urn:oasis:names:tc:opendocument:xmlns:text:1.0">"#,
                    r#"<office:body><office:spreadsheet>{}</office:spreadsheet></office:body>"#,
                    r#"</office:document-content>"#
                ),
                tables
            ),
        ),
    ]
}

/// Writes one table per entry, each followed by the padding rows and columns
/// spreadsheet applications append to fill the grid.
pub(crate) fn write_ods(path: &Path, sheets: &[(&str, Vec<Row>)]) {
    let mut tables = String::new();
    for (name, rows) in sheets {
        tables.push_str(&format!(r#"<table:table table:name="{}">"#, escape(*name)));
        for values in rows {
            tables.push_str("<table:table-row>");
            for value in values {
                match value {
                    CellValue::Empty => tables.push_str("<table:table-cell/>"),
                    CellValue::Bool(value) => tables.push_str(&format!(
                        r#"<table:table-cell office:value-type="boolean" office:boolean-value="{value}"/>"#
                    )),
                    CellValue::Number(value) => tables.push_str(&format!(
                        r#"<table:table-cell office:value-type="float" office:value="{value}"/>"#
                    )),
                    CellValue::Text(value) => tables.push_str(&format!(
                        r#"<table:table-cell office:value-type="string"><text:p>{}</text:p></table:table-cell>"#,
                        escape(value.as_str())
                    )),
                }
            }
            tables.push_str(r#"<table:table-cell table:number-columns-repeated="1000"/>"#);
            tables.push_str("</table:table-row>");
        }
        tables.push_str(concat!(
            r#"<table:table-row table:number-rows-repeated="1048000">"#,
            r#"<table:table-cell table:number-columns-repeated="1024"/>"#,
            r#"</table:table-row>"#,
            r#"</table:table>"#
        ));
    }
    write_zip(path, &ods_parts(&tables));
}

/// An in-memory sheet that cancels `cancel` once its first row has been pushed,
/// counting the cells the builder accepted.
pub(crate) struct CancellingSheet {
    rows: Vec<Row>,
    cancel: CancelToken,
    pushed: Arc<AtomicUsize>,
}

impl CancellingSheet {
    pub(crate) fn new(rows: Vec<Row>, cancel: CancelToken) -> Self {
        CancellingSheet {
            rows,
            cancel,
            pushed: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn pushed(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.pushed)
    }
}

impl Spreadsheet for CancellingSheet {
    fn probe(&mut self) -> Result<Vec<SheetDescriptor>, SourceError> {
        Ok(vec![SheetDescriptor {
            name: "numbers".to_owned(),
            index: 0,
            row_count: self.rows.len(),
            col_count: self.rows.iter().map(Vec::len).max().unwrap_or(0),
        }])
    }

    fn read_section(&mut self, _sheet_index: usize, builder: &mut SectionBuilder<'_>) -> Result<(), SourceError> {
        for (row, cells) in self.rows.iter().enumerate() {
            for (col, value) in cells.iter().enumerate() {
                if builder.push(row, col, value.clone()).is_break() {
                    return Ok(());
                }
                self.pushed.fetch_add(1, Ordering::SeqCst);
            }
            if row == 0 {
                self.cancel.cancel();
            }
        }
        Ok(())
    }
}
