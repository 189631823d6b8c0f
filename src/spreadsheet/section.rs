use crate::selection::RangeSpec;
use crate::spreadsheet::CellValue;
use crate::spreadsheet::Row;
use std::ops::ControlFlow;
use tracing::trace;

/// Receives each completed chunk; `Break` stops the read.
pub(crate) type ChunkSink<'s> = dyn FnMut(Vec<Row>) -> ControlFlow<()> + 's;

/// Assembles the dense rows of one section from sparse cells.
///
/// Readers push cells in row order. Cells outside the range are dropped, gaps
/// are filled with [`CellValue::Empty`], and every `max_chunk_rows` completed
/// rows are handed to the sink, so at most one chunk of rows is buffered here.
pub(crate) struct SectionBuilder<'s> {
    range: RangeSpec,
    max_chunk_rows: usize,
    /// First row of the range not yet moved into `chunk`.
    next_row: usize,
    current: Option<(usize, Row)>,
    chunk: Vec<Row>,
    sink: &'s mut ChunkSink<'s>,
    stopped: bool,
}

impl<'s> SectionBuilder<'s> {
    pub(crate) fn new(range: RangeSpec, max_chunk_rows: usize, sink: &'s mut ChunkSink<'s>) -> Self {
        let max_chunk_rows = max_chunk_rows.max(1);
        Self {
            range,
            max_chunk_rows,
            next_row: range.start_row(),
            current: None,
            chunk: Vec::with_capacity(max_chunk_rows.min(range.row_count())),
            sink,
            stopped: false,
        }
    }

    pub(crate) fn range(&self) -> RangeSpec {
        self.range
    }

    pub(crate) fn before_rows(&self, row: usize) -> bool {
        row < self.range.start_row()
    }

    /// `true` once `row` lies below the range: later rows cannot contribute.
    pub(crate) fn after_rows(&self, row: usize) -> bool {
        row >= self.range.end_row()
    }

    /// Places one cell. Cells outside the range and rows that go backwards are ignored.
    pub(crate) fn push(&mut self, row: usize, col: usize, value: CellValue) -> ControlFlow<()> {
        if self.stopped {
            return ControlFlow::Break(());
        }
        if !self.range.contains(row, col) || row < self.next_row {
            return ControlFlow::Continue(());
        }
        if self.current.as_ref().map(|(current_row, _)| *current_row != row).unwrap_or(false)
            && self.close_current().is_break()
        {
            return ControlFlow::Break(());
        }
        if self.current.is_none() {
            if self.fill_until(row).is_break() {
                return ControlFlow::Break(());
            }
            self.current = Some((row, vec![CellValue::Empty; self.range.col_count()]));
        }
        if let Some((_, cells)) = self.current.as_mut() {
            cells[col - self.range.start_col()] = value;
        }
        ControlFlow::Continue(())
    }

    /// Pads the remaining rows and flushes the last chunk.
    pub(crate) fn finish(mut self) -> ControlFlow<()> {
        if self.stopped || self.close_current().is_break() || self.fill_until(self.range.end_row()).is_break() {
            return ControlFlow::Break(());
        }
        self.flush()
    }

    fn close_current(&mut self) -> ControlFlow<()> {
        match self.current.take() {
            Some((row, cells)) => {
                if self.fill_until(row).is_break() {
                    return ControlFlow::Break(());
                }
                self.emit(cells)
            }
            None => ControlFlow::Continue(()),
        }
    }

    fn fill_until(&mut self, row: usize) -> ControlFlow<()> {
        while self.next_row < row {
            if self.emit(vec![CellValue::Empty; self.range.col_count()]).is_break() {
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn emit(&mut self, cells: Row) -> ControlFlow<()> {
        self.chunk.push(cells);
        self.next_row += 1;
        if self.chunk.len() >= self.max_chunk_rows {
            self.flush()
        } else {
            ControlFlow::Continue(())
        }
    }

    fn flush(&mut self) -> ControlFlow<()> {
        if self.chunk.is_empty() {
            return ControlFlow::Continue(());
        }
        let capacity = self.max_chunk_rows.min(self.range.end_row() - self.next_row);
        let chunk = std::mem::replace(&mut self.chunk, Vec::with_capacity(capacity));
        trace!(rows = chunk.len(), next_row = self.next_row, "Flush chunk");
        let flow = (self.sink)(chunk);
        if flow.is_break() {
            self.stopped = true;
        }
        flow
    }
}
