//! JSON documents as workbooks.
//!
//! A top-level array is one sheet named after the file stem; a top-level object
//! maps sheet names to arrays. Each array element is a row: an array of cells,
//! an object, or a single scalar. Object rows are laid out under a header row
//! made of the first object's keys, and later objects are matched by key.
//!
//! The document is streamed through serde visitors, so neither a probe nor a
//! fetch builds a DOM. Cells a pass does not need are skipped with
//! [`IgnoredAny`], and a fetch stops parsing once its last row is read.
use crate::error::SourceError;
use crate::helpers::file::SourceFile;
use crate::selection::SheetDescriptor;
use crate::spreadsheet::section::SectionBuilder;
use crate::spreadsheet::CellValue;
use crate::spreadsheet::Spreadsheet;
use serde::de;
use serde::de::value::MapAccessDeserializer;
use serde::de::value::SeqAccessDeserializer;
use serde::de::DeserializeSeed;
use serde::de::Deserializer;
use serde::de::IgnoredAny;
use serde::de::MapAccess;
use serde::de::SeqAccess;
use serde::de::Visitor;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Formatter;
use std::path::Path;
use std::path::PathBuf;

/// Message of the error used to abandon parsing once a pass is complete.
const STOPPED: &str = "parsing stopped";

pub(crate) struct JsonSpreadsheet {
    path: PathBuf,
}

impl JsonSpreadsheet {
    pub(crate) fn open(path: &Path) -> Result<Self, SourceError> {
        SourceFile::open(path)?;
        Ok(JsonSpreadsheet { path: path.to_owned() })
    }

    fn stream<S: SheetSink>(&self, sink: &mut S) -> Result<(), SourceError> {
        let stem = self
            .path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut deserializer = serde_json::Deserializer::from_reader(SourceFile::open(&self.path)?);
        let result = DocumentSeed { stem: &stem, sink: &mut *sink }
            .deserialize(&mut deserializer)
            .and_then(|()| deserializer.end());
        match result {
            Ok(()) => Ok(()),
            Err(_) if sink.is_done() => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}

impl Spreadsheet for JsonSpreadsheet {
    fn probe(&mut self) -> Result<Vec<SheetDescriptor>, SourceError> {
        let mut sink = ProbeSink::default();
        self.stream(&mut sink)?;
        Ok(sink.catalog)
    }

    fn read_section(&mut self, sheet_index: usize, builder: &mut SectionBuilder<'_>) -> Result<(), SourceError> {
        let mut sink = SectionSink {
            target: sheet_index,
            seen: 0,
            reading: false,
            found: false,
            done: false,
            builder,
        };
        self.stream(&mut sink)?;
        if !sink.found {
            Err(SourceError::Corrupt(format!("sheet #{sheet_index} does not exist")))?;
        }
        Ok(())
    }
}

/// What one pass over the document does with the sheets it meets.
trait SheetSink {
    /// A sheet starts; returning `false` skips it unread.
    fn begin_sheet(&mut self, name: &str) -> bool;

    fn end_sheet(&mut self, row_count: usize, col_count: usize);

    /// Whether the value at (row, col) must be decoded.
    fn wants_cell(&self, row: usize, col: usize) -> bool;

    fn push(&mut self, row: usize, col: usize, value: CellValue);

    /// All rows before `next_row` of the current sheet have been seen.
    fn end_row(&mut self, next_row: usize);

    /// The pass needs nothing more from the document.
    fn is_done(&self) -> bool;
}

#[derive(Default)]
struct ProbeSink {
    catalog: Vec<SheetDescriptor>,
    current: String,
}

impl SheetSink for ProbeSink {
    fn begin_sheet(&mut self, name: &str) -> bool {
        self.current = name.to_owned();
        true
    }

    fn end_sheet(&mut self, row_count: usize, col_count: usize) {
        self.catalog.push(SheetDescriptor {
            name: std::mem::take(&mut self.current),
            index: self.catalog.len(),
            row_count,
            col_count,
        });
    }

    fn wants_cell(&self, _: usize, _: usize) -> bool {
        false
    }

    fn push(&mut self, _: usize, _: usize, _: CellValue) {}

    fn end_row(&mut self, _: usize) {}

    fn is_done(&self) -> bool {
        false
    }
}

struct SectionSink<'b, 's> {
    target: usize,
    seen: usize,
    reading: bool,
    found: bool,
    done: bool,
    builder: &'b mut SectionBuilder<'s>,
}

impl SheetSink for SectionSink<'_, '_> {
    fn begin_sheet(&mut self, _: &str) -> bool {
        self.reading = self.seen == self.target;
        self.found |= self.reading;
        self.seen += 1;
        self.reading
    }

    fn end_sheet(&mut self, _: usize, _: usize) {
        self.done |= self.reading;
    }

    fn wants_cell(&self, row: usize, col: usize) -> bool {
        self.reading && self.builder.range().contains(row, col)
    }

    fn push(&mut self, row: usize, col: usize, value: CellValue) {
        if self.builder.push(row, col, value).is_break() {
            self.done = true;
        }
    }

    fn end_row(&mut self, next_row: usize) {
        self.done |= self.reading && self.builder.after_rows(next_row);
    }

    fn is_done(&self) -> bool {
        self.done
    }
}

struct DocumentSeed<'a, S> {
    stem: &'a str,
    sink: &'a mut S,
}

impl<'de, S: SheetSink> DeserializeSeed<'de> for DocumentSeed<'_, S> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_any(self)
    }
}

impl<'de, S: SheetSink> Visitor<'de> for DocumentSeed<'_, S> {
    type Value = ();

    fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
        formatter.write_str("an array of rows or an object of named arrays of rows")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, seq: A) -> Result<(), A::Error> {
        if self.sink.begin_sheet(self.stem) {
            let (row_count, col_count) = read_sheet(seq, &mut *self.sink)?;
            self.sink.end_sheet(row_count, col_count);
        }
        Ok(())
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<(), A::Error> {
        while let Some(name) = map.next_key::<String>()? {
            if self.sink.begin_sheet(&name) {
                let (row_count, col_count) = map.next_value_seed(SheetSeed { sink: &mut *self.sink })?;
                self.sink.end_sheet(row_count, col_count);
                if self.sink.is_done() {
                    return Err(de::Error::custom(STOPPED));
                }
            } else {
                map.next_value::<IgnoredAny>()?;
            }
        }
        Ok(())
    }
}

struct SheetSeed<'a, S> {
    sink: &'a mut S,
}

impl<'de, S: SheetSink> DeserializeSeed<'de> for SheetSeed<'_, S> {
    type Value = (usize, usize);

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
        deserializer.deserialize_seq(self)
    }
}

impl<'de, S: SheetSink> Visitor<'de> for SheetSeed<'_, S> {
    type Value = (usize, usize);

    fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
        formatter.write_str("an array of rows")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, seq: A) -> Result<Self::Value, A::Error> {
        read_sheet(seq, self.sink)
    }
}

/// Column positions taken from the first object row.
#[derive(Default)]
struct Header {
    columns: HashMap<String, usize>,
}

/// Rows consumed by one array element: 2 for the object that also defines the header.
struct RowShape {
    width: usize,
    rows: usize,
}

/// Reads the rows of one sheet and returns its (rows, columns) extent.
fn read_sheet<'de, A: SeqAccess<'de>, S: SheetSink>(mut seq: A, sink: &mut S) -> Result<(usize, usize), A::Error> {
    let mut header = None::<Header>;
    let mut row = 0usize;
    let mut col_count = 0usize;
    while let Some(shape) = seq.next_element_seed(RowSeed {
        row,
        header: &mut header,
        sink: &mut *sink,
    })? {
        row += shape.rows;
        col_count = col_count.max(shape.width);
        sink.end_row(row);
        if sink.is_done() {
            return Err(de::Error::custom(STOPPED));
        }
    }
    Ok((row, col_count))
}

struct RowSeed<'a, S> {
    row: usize,
    header: &'a mut Option<Header>,
    sink: &'a mut S,
}

impl<'de, S: SheetSink> DeserializeSeed<'de> for RowSeed<'_, S> {
    type Value = RowShape;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<RowShape, D::Error> {
        deserializer.deserialize_any(self)
    }
}

impl<S: SheetSink> RowSeed<'_, S> {
    fn scalar<E>(self, value: CellValue) -> Result<RowShape, E> {
        if self.sink.wants_cell(self.row, 0) {
            self.sink.push(self.row, 0, value);
        }
        Ok(RowShape { width: 1, rows: 1 })
    }

    fn cell<'de, A: MapAccess<'de>>(&mut self, map: &mut A, row: usize, col: Option<usize>) -> Result<(), A::Error> {
        match col.filter(|col| self.sink.wants_cell(row, *col)) {
            Some(col) => {
                let JsonCell(value) = map.next_value()?;
                self.sink.push(row, col, value);
            }
            None => {
                map.next_value::<IgnoredAny>()?;
            }
        }
        Ok(())
    }
}

impl<'de, S: SheetSink> Visitor<'de> for RowSeed<'_, S> {
    type Value = RowShape;

    fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
        formatter.write_str("a row: an array, an object or a scalar")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<RowShape, A::Error> {
        let mut col = 0usize;
        loop {
            let present = if self.sink.wants_cell(self.row, col) {
                match seq.next_element::<JsonCell>()? {
                    Some(JsonCell(value)) => {
                        self.sink.push(self.row, col, value);
                        true
                    }
                    None => false,
                }
            } else {
                seq.next_element::<IgnoredAny>()?.is_some()
            };
            if !present {
                break;
            }
            col += 1;
        }
        Ok(RowShape { width: col, rows: 1 })
    }

    fn visit_map<A: MapAccess<'de>>(mut self, mut map: A) -> Result<RowShape, A::Error> {
        let row = self.row;
        if let Some(header) = self.header.take() {
            while let Some(key) = map.next_key::<String>()? {
                let col = header.columns.get(&key).copied();
                self.cell(&mut map, row, col)?;
            }
            let width = header.columns.len();
            *self.header = Some(header);
            return Ok(RowShape { width, rows: 1 });
        }

        // Keys form row `row` and values row `row + 1`; push them in that order.
        let mut header = Header::default();
        let mut keys = Vec::new();
        let mut values = Vec::new();
        while let Some(key) = map.next_key::<String>()? {
            if header.columns.contains_key(&key) {
                map.next_value::<IgnoredAny>()?;
                continue;
            }
            let col = keys.len();
            if self.sink.wants_cell(row + 1, col) {
                let JsonCell(value) = map.next_value()?;
                values.push((col, value));
            } else {
                map.next_value::<IgnoredAny>()?;
            }
            header.columns.insert(key.clone(), col);
            keys.push(key);
        }
        for (col, key) in keys.into_iter().enumerate() {
            if self.sink.wants_cell(row, col) {
                self.sink.push(row, col, CellValue::Text(key));
            }
        }
        for (col, value) in values {
            self.sink.push(row + 1, col, value);
        }
        let width = header.columns.len();
        *self.header = Some(header);
        Ok(RowShape { width, rows: 2 })
    }

    fn visit_bool<E: de::Error>(self, value: bool) -> Result<RowShape, E> {
        self.scalar(CellValue::Bool(value))
    }

    fn visit_i64<E: de::Error>(self, value: i64) -> Result<RowShape, E> {
        self.scalar(CellValue::Number(value as f64))
    }

    fn visit_u64<E: de::Error>(self, value: u64) -> Result<RowShape, E> {
        self.scalar(CellValue::Number(value as f64))
    }

    fn visit_f64<E: de::Error>(self, value: f64) -> Result<RowShape, E> {
        self.scalar(CellValue::Number(value))
    }

    fn visit_str<E: de::Error>(self, value: &str) -> Result<RowShape, E> {
        self.scalar(CellValue::Text(value.to_owned()))
    }

    fn visit_unit<E: de::Error>(self) -> Result<RowShape, E> {
        Ok(RowShape { width: 0, rows: 1 })
    }
}

/// A single cell. Nested arrays and objects are kept as compact JSON text.
struct JsonCell(CellValue);

impl<'de> Deserialize<'de> for JsonCell {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(CellVisitor)
    }
}

struct CellVisitor;

impl<'de> Visitor<'de> for CellVisitor {
    type Value = JsonCell;

    fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
        formatter.write_str("a JSON value")
    }

    fn visit_bool<E: de::Error>(self, value: bool) -> Result<JsonCell, E> {
        Ok(JsonCell(CellValue::Bool(value)))
    }

    fn visit_i64<E: de::Error>(self, value: i64) -> Result<JsonCell, E> {
        Ok(JsonCell(CellValue::Number(value as f64)))
    }

    fn visit_u64<E: de::Error>(self, value: u64) -> Result<JsonCell, E> {
        Ok(JsonCell(CellValue::Number(value as f64)))
    }

    fn visit_f64<E: de::Error>(self, value: f64) -> Result<JsonCell, E> {
        Ok(JsonCell(CellValue::Number(value)))
    }

    fn visit_str<E: de::Error>(self, value: &str) -> Result<JsonCell, E> {
        Ok(JsonCell(CellValue::Text(value.to_owned())))
    }

    fn visit_string<E: de::Error>(self, value: String) -> Result<JsonCell, E> {
        Ok(JsonCell(CellValue::Text(value)))
    }

    fn visit_unit<E: de::Error>(self) -> Result<JsonCell, E> {
        Ok(JsonCell(CellValue::Empty))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, seq: A) -> Result<JsonCell, A::Error> {
        let value = Value::deserialize(SeqAccessDeserializer::new(seq))?;
        Ok(JsonCell(CellValue::Text(value.to_string())))
    }

    fn visit_map<A: MapAccess<'de>>(self, map: A) -> Result<JsonCell, A::Error> {
        let value = Value::deserialize(MapAccessDeserializer::new(map))?;
        Ok(JsonCell(CellValue::Text(value.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selection::RangeSpec;
    use crate::spreadsheet::Row;
    use crate::testing;
    use pretty_assertions::assert_eq;
    use std::ops::ControlFlow;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, content: &str) -> JsonSpreadsheet {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        JsonSpreadsheet::open(&path).unwrap()
    }

    fn read(spreadsheet: &mut JsonSpreadsheet, sheet_index: usize, range: RangeSpec) -> Result<Vec<Row>, SourceError> {
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

    fn summary(catalog: &[SheetDescriptor]) -> Vec<(&str, usize, usize, usize)> {
        catalog
            .iter()
            .map(|sheet| (sheet.name.as_str(), sheet.index, sheet.row_count, sheet.col_count))
            .collect()
    }

    #[test]
    fn top_level_array_is_one_sheet() {
        let dir = TempDir::new().unwrap();
        let mut spreadsheet = write(&dir, "numbers.json", &testing::numbers_json(5, 5));
        assert_eq!(summary(&spreadsheet.probe().unwrap()), vec![("numbers", 0, 5, 5)]);

        let rows = read(&mut spreadsheet, 0, RangeSpec::new(0, 3, 0, 2).unwrap()).unwrap();
        assert_eq!(rows, testing::numbers_at(0..3, 0..2));
    }

    #[test]
    fn object_of_sheets() {
        let dir = TempDir::new().unwrap();
        let mut spreadsheet = write(&dir, "book.json", r#"{"First": [[1, 2]], "Second": [[true], [null, "x", 3]]}"#);
        assert_eq!(summary(&spreadsheet.probe().unwrap()), vec![("First", 0, 1, 2), ("Second", 1, 2, 3)]);

        let rows = read(&mut spreadsheet, 1, RangeSpec::new(0, 2, 0, 3).unwrap()).unwrap();
        assert_eq!(
            rows,
            vec![
                vec![CellValue::Bool(true), CellValue::Empty, CellValue::Empty],
                vec![CellValue::Empty, CellValue::from("x"), CellValue::Number(3.0)],
            ]
        );
    }

    #[test]
    fn object_rows_get_a_header() {
        let dir = TempDir::new().unwrap();
        let content = r#"[{"id": 1, "name": "a"}, {"name": "b", "id": 2, "extra": [1, {"k": 2}]}, {"id": 3}]"#;
        let mut spreadsheet = write(&dir, "people.json", content);
        assert_eq!(summary(&spreadsheet.probe().unwrap()), vec![("people", 0, 4, 2)]);

        let rows = read(&mut spreadsheet, 0, RangeSpec::new(0, 4, 0, 2).unwrap()).unwrap();
        assert_eq!(
            rows,
            vec![
                vec![CellValue::from("id"), CellValue::from("name")],
                vec![CellValue::Number(1.0), CellValue::from("a")],
                vec![CellValue::Number(2.0), CellValue::from("b")],
                vec![CellValue::Number(3.0), CellValue::Empty],
            ]
        );
    }

    #[test]
    fn nested_values_become_json_text() {
        let dir = TempDir::new().unwrap();
        let mut spreadsheet = write(&dir, "nested.json", r#"[[{"a": [1, 2]}, [true]], "scalar"]"#);
        let rows = read(&mut spreadsheet, 0, RangeSpec::new(0, 2, 0, 2).unwrap()).unwrap();
        assert_eq!(
            rows,
            vec![
                vec![CellValue::from(r#"{"a":[1,2]}"#), CellValue::from("[true]")],
                vec![CellValue::from("scalar"), CellValue::Empty],
            ]
        );
    }

    #[test]
    fn stops_after_last_row() {
        let dir = TempDir::new().unwrap();
        // The document is cut off after the requested rows.
        let mut spreadsheet = write(&dir, "truncated.json", "[[1], [2], [3], [4, ");
        let rows = read(&mut spreadsheet, 0, RangeSpec::new(0, 2, 0, 1).unwrap()).unwrap();
        assert_eq!(rows, vec![vec![CellValue::Number(1.0)], vec![CellValue::Number(2.0)]]);

        assert!(matches!(spreadsheet.probe(), Err(SourceError::JsonError(_))));
    }

    #[test]
    fn not_a_workbook() {
        let dir = TempDir::new().unwrap();
        let mut spreadsheet = write(&dir, "scalar.json", "42");
        assert!(matches!(spreadsheet.probe(), Err(SourceError::JsonError(_))));

        let mut spreadsheet = write(&dir, "flat.json", r#"{"name": "x"}"#);
        assert!(matches!(spreadsheet.probe(), Err(SourceError::JsonError(_))));
    }

    #[test]
    fn missing_sheet_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let mut spreadsheet = write(&dir, "one.json", "[[1]]");
        let result = read(&mut spreadsheet, 1, RangeSpec::new(0, 1, 0, 1).unwrap());
        assert!(matches!(result, Err(SourceError::Corrupt(_))));
    }
}
