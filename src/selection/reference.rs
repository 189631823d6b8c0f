//! Conversions between A1-style references and 0-based indexes.
use std::num::IntErrorKind;


/// Converts column letters to a 0-based index: `A` = 0, `Z` = 25, `AA` = 26.
/// Returns `None` for empty input or non-letters. Indexes too large for
/// `usize` saturate at `usize::MAX - 1`.
pub(crate) fn col_to_index(letters: &str) -> Option<usize> {
    if letters.is_empty() {
        return None;
    }
    letters
        .bytes()
        .try_fold(0usize, |index, letter| {
            let digit = match letter {
                b'A'..=b'Z' => letter - b'A' + 1,
                b'a'..=b'z' => letter - b'a' + 1,
                _ => return None,
            };
            Some(index.saturating_mul(26).saturating_add(digit as usize))
        })
        .map(|column| column - 1)
}

/// Converts a 1-based row number to a 0-based index; `0` and garbage are rejected.
/// Numbers too large for `usize` saturate at `usize::MAX - 1`.
pub(crate) fn row_to_index(number: &str) -> Option<usize> {
    parse_saturating(number)
        .filter(|row| *row > 0)
        .map(|row| row - 1)
}

/// Parses a run of ASCII digits, saturating at `usize::MAX` instead of failing.
pub(crate) fn parse_saturating(digits: &str) -> Option<usize> {
    if digits.is_empty() || !digits.bytes().all(|digit| digit.is_ascii_digit()) {
        return None;
    }
    match digits.parse::<usize>() {
        Ok(number) => Some(number),
        Err(error) if *error.kind() == IntErrorKind::PosOverflow => Some(usize::MAX),
        Err(_) => None,
    }
}

/// Converts a 0-based column index to letters.
pub(crate) fn index_to_col(col: usize) -> String {
    let mut column = col + 1;
    let mut letters = Vec::new();
    while column > 0 {
        column -= 1;
        letters.push(b'A' + (column % 26) as u8);
        column /= 26;
    }
    letters.iter().rev().map(|letter| *letter as char).collect()
}

/// Renders a 0-based (row, col) as an A1 reference.
pub(crate) fn index_to_reference(row: usize, col: usize) -> String {
    format!("{}{}", index_to_col(col), row + 1)
}

/// Parses an A1 reference (`$` markers allowed) into 0-based (row, col).
pub(crate) fn reference_to_index(reference: &str) -> Option<(usize, usize)> {
    let reference = reference.trim().replace('$', "");
    let split = reference.find(|c: char| c.is_ascii_digit())?;
    let (letters, digits) = reference.split_at(split);
    Some((row_to_index(digits)?, col_to_index(letters)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn columns() {
        assert_eq!(col_to_index("A"), Some(0));
        assert_eq!(col_to_index("z"), Some(25));
        assert_eq!(col_to_index("AA"), Some(26));
        assert_eq!(col_to_index("XFD"), Some(16_383));
        assert_eq!(col_to_index(""), None);
        assert_eq!(col_to_index("A1"), None);

        for index in [0, 25, 26, 701, 702, 16_383] {
            assert_eq!(col_to_index(&index_to_col(index)), Some(index));
        }
        assert_eq!(index_to_col(701), "ZZ");
        assert_eq!(index_to_col(702), "AAA");
    }

    #[test]
    fn rows() {
        assert_eq!(row_to_index("1"), Some(0));
        assert_eq!(row_to_index("0"), None);
        assert_eq!(row_to_index(""), None);
        assert_eq!(row_to_index("-3"), None);
        assert_eq!(row_to_index("+3"), None);
        assert_eq!(row_to_index("99999999999999999999999"), Some(usize::MAX - 1));
        assert_eq!(col_to_index("ZZZZZZZZZZZZZZZZZZZZZZZZ"), Some(usize::MAX - 1));
    }

    #[test]
    fn references() {
        assert_eq!(reference_to_index("B3"), Some((2, 1)));
        assert_eq!(reference_to_index("$AA$10"), Some((9, 26)));
        assert_eq!(reference_to_index("10"), None);
        assert_eq!(reference_to_index("B"), None);
        assert_eq!(index_to_reference(2, 1), "B3");
    }
}
