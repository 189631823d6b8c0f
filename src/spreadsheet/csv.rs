use crate::error::SourceError;
use crate::helpers::file::SourceFile;
use crate::selection::SheetDescriptor;
use crate::spreadsheet::section::SectionBuilder;
use crate::spreadsheet::CellValue;
use crate::spreadsheet::Spreadsheet;
use csv::ByteRecord;
use csv::Reader;
use csv::ReaderBuilder;
use std::path::Path;
use std::path::PathBuf;

/// A delimited text file (`.csv`, `.tsv`), exposed as one sheet named after the file stem.
///
/// Rows may be ragged; the sheet is as wide as its longest row. Fields are typed
/// by [`CellValue::infer`].
pub(crate) struct CsvSpreadsheet {
    path: PathBuf,
    delimiter: u8,
}

impl CsvSpreadsheet {
    pub(crate) fn open(path: &Path, delimiter: u8) -> Result<Self, SourceError> {
        // Fail early on missing or unreadable files, like the archive formats do.
        SourceFile::open(path)?;
        Ok(CsvSpreadsheet {
            path: path.to_owned(),
            delimiter,
        })
    }

    fn reader(&self) -> Result<Reader<SourceFile>, SourceError> {
        Ok(ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .delimiter(self.delimiter)
            .from_reader(SourceFile::open(&self.path)?))
    }
}

impl Spreadsheet for CsvSpreadsheet {
    fn probe(&mut self) -> Result<Vec<SheetDescriptor>, SourceError> {
        let mut reader = self.reader()?;
        let mut record = ByteRecord::new();
        let mut row_count = 0usize;
        let mut col_count = 0usize;
        while reader.read_byte_record(&mut record)? {
            row_count += 1;
            col_count = col_count.max(record.len());
        }
        Ok(vec![SheetDescriptor {
            name: sheet_name(&self.path),
            index: 0,
            row_count,
            col_count,
        }])
    }

    fn read_section(&mut self, sheet_index: usize, builder: &mut SectionBuilder<'_>) -> Result<(), SourceError> {
        if sheet_index != 0 {
            Err(SourceError::Corrupt(format!("delimited files have one sheet, not #{sheet_index}")))?;
        }
        let range = builder.range();
        let mut reader = self.reader()?;
        let mut record = ByteRecord::new();
        let mut row = 0usize;
        while !builder.after_rows(row) && reader.read_byte_record(&mut record)? {
            if !builder.before_rows(row) {
                for col in range.start_col()..range.end_col().min(record.len()) {
                    let field = std::str::from_utf8(&record[col])?;
                    if builder.push(row, col, CellValue::infer(field)).is_break() {
                        return Ok(());
                    }
                }
            }
            row += 1;
        }
        Ok(())
    }
}

fn sheet_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}
