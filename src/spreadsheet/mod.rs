//! Format readers and the lazy data source built on them.
//!
//! Every format implements [`Spreadsheet`]: a value-free probe that lists the
//! sheets with their extents, and a section read that streams the cells of one
//! rectangle into a [`SectionBuilder`]. [`LazyDataSource`] opens a fresh handle
//! per call, so nothing stays open between requests.
use crate::coordinator::cancel::CancelReason;
use crate::coordinator::cancel::CancelToken;
use crate::error::SourceError;
use crate::selection::RangeSpec;
use crate::selection::SheetDescriptor;
use crate::spreadsheet::csv::CsvSpreadsheet;
use crate::spreadsheet::json::JsonSpreadsheet;
use crate::spreadsheet::ods::OdsSpreadsheet;
use crate::spreadsheet::section::SectionBuilder;
use crate::spreadsheet::xlsx::XlsxSpreadsheet;
use std::any::Any;
use std::ops::ControlFlow;
use std::panic::catch_unwind;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use thiserror::Error;
use tracing::debug;
use tracing::warn;

pub(crate) mod cell;
mod csv;
mod excel;
mod json;
mod ods;
pub(crate) mod section;
mod xlsx;

pub use cell::CellValue;

pub type Row = Vec<CellValue>;

/// Rows of a fetched section, each exactly as wide as the requested range.
pub type Grid = Vec<Row>;

/// One opened source file.
pub(crate) trait Spreadsheet {
    /// Lists the sheets in workbook order without decoding cell values.
    fn probe(&mut self) -> Result<Vec<SheetDescriptor>, SourceError>;

    /// Streams the cells of `builder.range()` on sheet `sheet_index`, in row order.
    /// Returns early once the builder reports it is stopped.
    fn read_section(&mut self, sheet_index: usize, builder: &mut SectionBuilder<'_>) -> Result<(), SourceError>;
}

/// Picks the reader by file extension (case-insensitive).
pub(crate) fn open(path: &Path) -> Result<Box<dyn Spreadsheet>, SourceError> {
    let extension = path
        .extension()
        .map(|extension| extension.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    let spreadsheet: Box<dyn Spreadsheet> = match extension.as_str() {
        "xlsx" | "xlsm" | "xltx" | "xltm" => Box::new(XlsxSpreadsheet::open(path)?),
        "ods" => Box::new(OdsSpreadsheet::open(path)?),
        "csv" => Box::new(CsvSpreadsheet::open(path, b',')?),
        "tsv" | "tab" => Box::new(CsvSpreadsheet::open(path, b'\t')?),
        "json" => Box::new(JsonSpreadsheet::open(path)?),
        _ => Err(SourceError::Unsupported(format!(
            "cannot detect the format of '{}' from its extension",
            path.display()
        )))?,
    };
    Ok(spreadsheet)
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("{0}")]
    Cancelled(CancelReason),
}

/// Source of sheet catalogs and cell sections.
///
/// The coordinator only talks to this trait, so tests can substitute a source
/// that counts calls or fails on demand.
pub trait DataSource: Send + Sync {
    fn probe(&self, path: &Path) -> Result<Vec<SheetDescriptor>, SourceError>;

    /// Reads `range` of sheet `sheet_index`, handing rows over in chunks of at most
    /// `max_chunk_rows`. `cancel` is checked before the read and after every chunk.
    fn fetch_section(
        &self,
        path: &Path,
        sheet_index: usize,
        range: RangeSpec,
        max_chunk_rows: usize,
        cancel: &CancelToken,
    ) -> Result<Grid, FetchError>;
}

/// The [`DataSource`] over local files.
///
/// A panic inside a reader is caught and reported as [`SourceError::Corrupt`].
#[derive(Copy, Clone, Debug, Default)]
pub struct LazyDataSource;

impl DataSource for LazyDataSource {
    fn probe(&self, path: &Path) -> Result<Vec<SheetDescriptor>, SourceError> {
        let catalog = guard(|| open(path)?.probe())?;
        debug!(path = %path.display(), sheets = catalog.len(), "Probe source");
        Ok(catalog)
    }

    fn fetch_section(
        &self,
        path: &Path,
        sheet_index: usize,
        range: RangeSpec,
        max_chunk_rows: usize,
        cancel: &CancelToken,
    ) -> Result<Grid, FetchError> {
        cancel.check().map_err(FetchError::Cancelled)?;
        read_chunked(path, || open(path), sheet_index, range, max_chunk_rows, cancel)
    }
}

/// Reads one section from the spreadsheet `open_sheet` yields, chunk by chunk.
///
/// `cancel` is checked after every chunk; once it fires the current chunk is
/// kept, the reader is stopped and the partial grid is discarded.
pub(crate) fn read_chunked<F>(
    path: &Path,
    open_sheet: F,
    sheet_index: usize,
    range: RangeSpec,
    max_chunk_rows: usize,
    cancel: &CancelToken,
) -> Result<Grid, FetchError>
where
    F: FnOnce() -> Result<Box<dyn Spreadsheet>, SourceError>,
{
    let mut grid = Grid::with_capacity(range.row_count());
    let mut cancelled = None;
    let mut chunks = 0usize;
    guard(|| {
        let mut spreadsheet = open_sheet()?;
        let mut sink = |chunk: Vec<Row>| {
            chunks += 1;
            grid.extend(chunk);
            match cancel.check() {
                Ok(()) => ControlFlow::Continue(()),
                Err(reason) => {
                    cancelled = Some(reason);
                    ControlFlow::Break(())
                }
            }
        };
        let mut builder = SectionBuilder::new(range, max_chunk_rows, &mut sink);
        spreadsheet.read_section(sheet_index, &mut builder)?;
        let _ = builder.finish();
        Ok(())
    })?;

    if let Some(reason) = cancelled {
        debug!(path = %path.display(), %range, chunks, "Fetch cancelled between chunks");
        return Err(FetchError::Cancelled(reason));
    }
    debug!(path = %path.display(), %range, chunks, "Fetch section");
    Ok(grid)
}

/// Runs a reader, turning a panic into [`SourceError::Corrupt`].
fn guard<T, F>(read: F) -> Result<T, SourceError>
where
    F: FnOnce() -> Result<T, SourceError>,
{
    catch_unwind(AssertUnwindSafe(read)).unwrap_or_else(|payload| {
        let message = panic_message(payload.as_ref());
        warn!(message, "Reader panicked");
        Err(SourceError::Corrupt(format!("reader panicked: {message}")))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
