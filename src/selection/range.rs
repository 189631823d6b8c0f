//! Range expressions.
//!
//! Two grammars are accepted:
//!
//! - A1 notation, `A1:E100`, plus its partial forms: a single cell (`B2`),
//!   whole columns (`A:C`), whole rows (`2:10`) and open ends (`B2:`, `:C5`).
//!   Letters are case-insensitive and `$` markers are ignored. Rows are 1-based
//!   and the end cell is inclusive.
//! - Numeric bounds, `{row: [0,3), col: [0,2)}`, 0-based and half-open. Either
//!   axis may be omitted.
//!
//! Bounds past the sheet edge are clipped rather than rejected; the clipping is
//! reported so the caller can flag the result as truncated.
use crate::selection::reference::col_to_index;
use crate::selection::reference::parse_saturating;
use crate::selection::reference::row_to_index;
use crate::selection::ParseError;
use crate::selection::RangeSpec;
use crate::selection::SheetDescriptor;
use regex::Captures;
use regex::Regex;
use std::sync::LazyLock;

static A1_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\$?([A-Z]*)\$?(\d*)(:\$?([A-Z]*)\$?(\d*))?$").expect("Hardcode regex pattern")
});

static AXIS_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(row|col)\s*:\s*\[\s*(\d+)\s*,\s*(\d+)\s*\)$").expect("Hardcode regex pattern")
});

/// Parsed but not yet resolved range: any bound may be open.
/// Bounds are 0-based; upper bounds are exclusive.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RangeExpr {
    pub row_lower_bound: Option<usize>,
    pub row_upper_bound: Option<usize>,
    pub col_lower_bound: Option<usize>,
    pub col_upper_bound: Option<usize>,
}

/// A range resolved against a concrete sheet.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ResolvedRange {
    pub range: RangeSpec,
    /// An explicit bound exceeded the sheet and was reduced to its edge.
    pub clipped: bool,
}

/// Parses `expr` and resolves it against `sheet`.
pub fn parse(expr: &str, sheet: &SheetDescriptor) -> Result<ResolvedRange, ParseError> {
    RangeExpr::try_from(expr)?.resolve(expr, sheet)
}

impl TryFrom<&str> for RangeExpr {
    type Error = ParseError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            Ok(RangeExpr::default())
        } else if trimmed.starts_with('{') {
            parse_numeric(value, trimmed)
        } else {
            parse_a1(value, &trimmed.to_ascii_uppercase())
        }
    }
}

impl RangeExpr {
    /// Applies the sheet dimensions: open bounds take the sheet edge, explicit
    /// bounds beyond it are clipped.
    pub fn resolve(&self, expr: &str, sheet: &SheetDescriptor) -> Result<ResolvedRange, ParseError> {
        let (start_row, end_row, rows_clipped) = clip(self.row_lower_bound, self.row_upper_bound, sheet.row_count);
        let (start_col, end_col, cols_clipped) = clip(self.col_lower_bound, self.col_upper_bound, sheet.col_count);
        let range = RangeSpec::new(start_row, end_row, start_col, end_col).ok_or_else(|| {
            ParseError::invalid_range(
                expr,
                format!(
                    "no cells inside sheet '{}' ({} rows x {} columns)",
                    sheet.name, sheet.row_count, sheet.col_count
                ),
            )
        })?;
        Ok(ResolvedRange {
            range,
            clipped: rows_clipped || cols_clipped,
        })
    }
}

fn clip(lower: Option<usize>, upper: Option<usize>, limit: usize) -> (usize, usize, bool) {
    let start = lower.unwrap_or(0);
    match upper {
        Some(end) if end > limit => (start, limit, true),
        Some(end) => (start, end, false),
        None => (start, limit, false),
    }
}

fn parse_a1(expr: &str, value: &str) -> Result<RangeExpr, ParseError> {
    let captures = A1_PATTERN
        .captures(value)
        .ok_or_else(|| ParseError::invalid_range(expr, "expected A1 notation or {row: [a,b), col: [c,d)}"))?;
    let lower_col = letters(expr, &captures, 1)?;
    let lower_row = digits(expr, &captures, 2)?;

    if captures.get(3).is_none() {
        // Single reference: a cell, a whole column or a whole row.
        if lower_col.is_none() && lower_row.is_none() {
            Err(ParseError::invalid_range(expr, "empty reference"))?;
        }
        return Ok(RangeExpr {
            row_lower_bound: lower_row,
            row_upper_bound: lower_row.map(|row| row + 1),
            col_lower_bound: lower_col,
            col_upper_bound: lower_col.map(|col| col + 1),
        });
    }

    let upper_col = letters(expr, &captures, 4)?;
    let upper_row = digits(expr, &captures, 5)?;
    if lower_col.is_none() && lower_row.is_none() && upper_col.is_none() && upper_row.is_none() {
        Err(ParseError::invalid_range(expr, "empty reference"))?;
    }
    if lower_row.zip(upper_row).map(|(lower, upper)| upper < lower).unwrap_or(false)
        || lower_col.zip(upper_col).map(|(lower, upper)| upper < lower).unwrap_or(false)
    {
        Err(ParseError::invalid_range(expr, "end cell precedes start cell"))?;
    }
    Ok(RangeExpr {
        row_lower_bound: lower_row,
        row_upper_bound: upper_row.map(|row| row + 1),
        col_lower_bound: lower_col,
        col_upper_bound: upper_col.map(|col| col + 1),
    })
}

fn letters(expr: &str, captures: &Captures, group: usize) -> Result<Option<usize>, ParseError> {
    match captures.get(group).map(|matcher| matcher.as_str()).filter(|text| !text.is_empty()) {
        Some(text) => col_to_index(text)
            .map(Some)
            .ok_or_else(|| ParseError::invalid_range(expr, format!("column '{text}' is out of range"))),
        None => Ok(None),
    }
}

fn digits(expr: &str, captures: &Captures, group: usize) -> Result<Option<usize>, ParseError> {
    match captures.get(group).map(|matcher| matcher.as_str()).filter(|text| !text.is_empty()) {
        Some(text) => row_to_index(text)
            .map(Some)
            .ok_or_else(|| ParseError::invalid_range(expr, format!("row '{text}' is not a 1-based row number"))),
        None => Ok(None),
    }
}

fn parse_numeric(expr: &str, value: &str) -> Result<RangeExpr, ParseError> {
    let body = value
        .strip_prefix('{')
        .and_then(|rest| rest.strip_suffix('}'))
        .ok_or_else(|| ParseError::invalid_range(expr, "unbalanced braces"))?;

    let mut range = RangeExpr::default();
    let mut seen = (false, false);
    // Split on the commas between axes, not the ones inside `[a,b)`.
    for part in body.split_inclusive(')').map(|part| part.trim().trim_start_matches(',').trim()) {
        if part.is_empty() {
            continue;
        }
        let captures = AXIS_PATTERN
            .captures(part)
            .ok_or_else(|| ParseError::invalid_range(expr, format!("'{part}' is not 'row: [a,b)' or 'col: [c,d)'")))?;
        let lower = number(expr, &captures[2])?;
        let upper = number(expr, &captures[3])?;
        if lower >= upper {
            Err(ParseError::invalid_range(expr, format!("[{lower},{upper}) is empty")))?;
        }
        let axis_seen = if &captures[1] == "row" { &mut seen.0 } else { &mut seen.1 };
        if *axis_seen {
            Err(ParseError::invalid_range(expr, format!("'{}' given twice", &captures[1])))?;
        }
        *axis_seen = true;
        if &captures[1] == "row" {
            range.row_lower_bound = Some(lower);
            range.row_upper_bound = Some(upper);
        } else {
            range.col_lower_bound = Some(lower);
            range.col_upper_bound = Some(upper);
        }
    }
    if !seen.0 && !seen.1 {
        Err(ParseError::invalid_range(expr, "no bounds given"))?;
    }
    Ok(range)
}

fn number(expr: &str, text: &str) -> Result<usize, ParseError> {
    parse_saturating(text).ok_or_else(|| ParseError::invalid_range(expr, format!("'{text}' is not a number")))
}
