//! Request resolution: which sheet, and which rectangle of it.
//!
//! Both steps are pure functions over the catalog produced by a probe, so they
//! run before any cell data is read.
use serde::Serialize;
use std::fmt::Display;
use thiserror::Error;

pub mod range;
pub(crate) mod reference;
pub mod sheet;

/// User-input problems. Always surfaced immediately and never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Invalid range '{expr}': {reason}")]
    InvalidRange { expr: String, reason: String },

    #[error("Sheet '{0}' not found")]
    SheetNotFound(String),
}

impl ParseError {
    pub(crate) fn invalid_range(expr: &str, reason: impl Into<String>) -> Self {
        ParseError::InvalidRange {
            expr: expr.to_owned(),
            reason: reason.into(),
        }
    }
}

/// A non-empty rectangle of cells: 0-based, half-open on both axes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct RangeSpec {
    start_row: usize,
    end_row: usize,
    start_col: usize,
    end_col: usize,
}

impl RangeSpec {
    /// Builds `[start_row, end_row) × [start_col, end_col)`, `None` if either side is empty.
    pub fn new(start_row: usize, end_row: usize, start_col: usize, end_col: usize) -> Option<Self> {
        (start_row < end_row && start_col < end_col).then_some(RangeSpec {
            start_row,
            end_row,
            start_col,
            end_col,
        })
    }

    pub fn start_row(&self) -> usize {
        self.start_row
    }

    pub fn end_row(&self) -> usize {
        self.end_row
    }

    pub fn start_col(&self) -> usize {
        self.start_col
    }

    pub fn end_col(&self) -> usize {
        self.end_col
    }

    pub fn row_count(&self) -> usize {
        self.end_row - self.start_row
    }

    pub fn col_count(&self) -> usize {
        self.end_col - self.start_col
    }

    pub fn contains(&self, row: usize, col: usize) -> bool {
        self.start_row <= row && row < self.end_row && self.start_col <= col && col < self.end_col
    }

    /// Same columns, first `rows` rows. `None` when `rows` is zero.
    pub fn with_row_count(&self, rows: usize) -> Option<Self> {
        RangeSpec::new(self.start_row, self.start_row + rows.min(self.row_count()), self.start_col, self.end_col)
    }

    /// The equally-sized window directly below this one.
    pub fn next_rows(&self) -> Self {
        RangeSpec {
            start_row: self.end_row,
            end_row: self.end_row + self.row_count(),
            ..*self
        }
    }

    /// `true` when `next` starts exactly where this range ends and spans the same columns.
    pub fn is_followed_by(&self, next: &RangeSpec) -> bool {
        next.start_row == self.end_row && next.start_col == self.start_col && next.end_col == self.end_col
    }
}

impl Display for RangeSpec {
    /// A1 notation with an inclusive end cell, e.g. `A1:B3`.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}",
            reference::index_to_reference(self.start_row, self.start_col),
            reference::index_to_reference(self.end_row - 1, self.end_col - 1)
        )
    }
}

/// Structural metadata of one sheet as read by a probe.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct SheetDescriptor {
    pub name: String,
    /// Position in the workbook, 0-based.
    pub index: usize,
    /// Rows counted from row 1, so `row_count` is one past the last used row.
    pub row_count: usize,
    /// Columns counted from column A.
    pub col_count: usize,
}

impl SheetDescriptor {
    /// The whole used area, `None` for an empty sheet.
    pub fn extent(&self) -> Option<RangeSpec> {
        RangeSpec::new(0, self.row_count, 0, self.col_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_ranges_are_rejected() {
        assert!(RangeSpec::new(0, 0, 0, 1).is_none());
        assert!(RangeSpec::new(3, 2, 0, 1).is_none());
        assert!(RangeSpec::new(0, 1, 1, 1).is_none());
        assert!(RangeSpec::new(0, 1, 0, 1).is_some());
    }

    #[test]
    fn adjacency() {
        let first = RangeSpec::new(0, 10, 0, 3).unwrap();
        let second = first.next_rows();
        assert_eq!(second, RangeSpec::new(10, 20, 0, 3).unwrap());
        assert!(first.is_followed_by(&second));
        assert!(!second.is_followed_by(&first));
        assert!(!first.is_followed_by(&RangeSpec::new(10, 20, 0, 4).unwrap()));
    }

    #[test]
    fn display_is_inclusive_a1() {
        assert_eq!(RangeSpec::new(0, 3, 0, 2).unwrap().to_string(), "A1:B3");
        assert_eq!(RangeSpec::new(9, 10, 26, 27).unwrap().to_string(), "AA10:AA10");
    }

    #[test]
    fn truncate_rows() {
        let range = RangeSpec::new(2, 10, 0, 3).unwrap();
        assert_eq!(range.with_row_count(3), RangeSpec::new(2, 5, 0, 3));
        assert_eq!(range.with_row_count(100), Some(range));
        assert_eq!(range.with_row_count(0), None);
    }

    #[test]
    fn empty_sheet_has_no_extent() {
        let sheet = SheetDescriptor {
            name: "Empty".to_owned(),
            index: 0,
            row_count: 0,
            col_count: 0,
        };
        assert!(sheet.extent().is_none());
    }
}
