use crate::error::SourceError;
use crate::selection::reference::index_to_reference;
use chrono::Duration;
use chrono::NaiveDate;
use iso8601_duration::Duration as IsoDuration;
use serde::Serialize;
use std::fmt::Display;
use std::mem::size_of;

/// How a raw cell value read from a file must be interpreted.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub(crate) enum CellType {
    #[default]
    Empty,
    /// `1` or `0`
    Boolean,
    Number,
    /// Serial numbers counted from the 1900 epoch
    NumberDateTime1900,
    NumberDate1900,
    NumberTime1900,
    /// Serial numbers counted from the 1904 epoch
    NumberDateTime1904,
    NumberDate1904,
    NumberTime1904,
    /// `2024-01-31` or `2024-01-31T12:00:00`
    IsoDateTime,
    /// `PT12H30M00S`
    IsoDuration,
    InlineString,
    /// Index into the workbook's shared string table
    SharedString,
    /// Formula error such as `#DIV/0!`
    Error,
}

impl CellType {
    /// Maps the built-in number format ids that denote dates and times.
    pub(crate) fn parse_builtin_number_format_id(id: &str, is_1904: bool) -> Option<Self> {
        match id {
            "22" => Some(if is_1904 { Self::NumberDateTime1904 } else { Self::NumberDateTime1900 }),
            "14" | "15" | "16" | "17" => Some(if is_1904 { Self::NumberDate1904 } else { Self::NumberDate1900 }),
            "18" | "19" | "20" | "21" | "45" | "46" | "47" => Some(if is_1904 { Self::NumberTime1904 } else { Self::NumberTime1900 }),
            _ => None,
        }
    }

    /// Classifies a custom format code by the date and time tokens outside literals and brackets.
    pub(crate) fn parse_custom_number_format(format: &str, is_1904: bool) -> Self {
        let mut is_escaped = false;
        let mut is_literal = false;
        let mut is_date = false;
        let mut is_time = false;
        let mut is_color = false;
        for character in format.chars() {
            match character {
                _ if is_escaped => is_escaped = false,
                '_' | '\\' => is_escaped = true,

                '"' if is_literal => is_literal = false,
                '"' if !is_color => is_literal = true,

                ']' if is_color => is_color = false,
                '[' if !is_literal => is_color = true,
                _ if is_literal || is_color => (),

                'Y' | 'y' | 'D' | 'd' => is_date = true,
                'H' | 'h' | 'S' | 's' => is_time = true,
                _ => (),
            }
        }

        match (is_date, is_time, is_1904) {
            (true, true, false) => Self::NumberDateTime1900,
            (true, true, true) => Self::NumberDateTime1904,
            (true, false, false) => Self::NumberDate1900,
            (true, false, true) => Self::NumberDate1904,
            (false, true, false) => Self::NumberTime1900,
            (false, true, true) => Self::NumberTime1904,
            (false, false, _) => Self::Number,
        }
    }
}

/// One cell of a returned grid.
///
/// Dates and times are rendered as ISO 8601 text, so every value fits one of
/// four shapes. Serializes as plain JSON: `null`, a boolean, a number or a string.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CellValue {
    #[default]
    Empty,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl CellValue {
    pub fn is_empty(&self) -> bool {
        matches!(self, CellValue::Empty)
    }

    /// Bytes held by this value, including its heap allocation.
    pub(crate) fn size_in_bytes(&self) -> usize {
        size_of::<CellValue>()
            + match self {
                CellValue::Text(text) => text.capacity(),
                _ => 0,
            }
    }

    /// Infers a value from delimited text: empty, boolean, finite number, else text.
    pub(crate) fn infer(text: &str) -> Self {
        if text.is_empty() {
            CellValue::Empty
        } else if text.eq_ignore_ascii_case("true") {
            CellValue::Bool(true)
        } else if text.eq_ignore_ascii_case("false") {
            CellValue::Bool(false)
        } else {
            match text.trim().parse::<f64>() {
                Ok(number) if number.is_finite() => CellValue::Number(number),
                _ => CellValue::Text(text.to_owned()),
            }
        }
    }
}

impl Display for CellValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CellValue::Empty => Ok(()),
            CellValue::Bool(value) => write!(f, "{value}"),
            CellValue::Number(value) => write!(f, "{value}"),
            CellValue::Text(value) => write!(f, "{value}"),
        }
    }
}

impl From<bool> for CellValue {
    fn from(value: bool) -> Self {
        CellValue::Bool(value)
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        CellValue::Number(value)
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        CellValue::Text(value.to_owned())
    }
}

/// A raw cell as it appears in the file: position, interpretation and text.
#[derive(Clone, Debug)]
pub(crate) struct Cell {
    pub(crate) row: usize,
    pub(crate) col: usize,
    pub(crate) kind: CellType,
    pub(crate) value: String,
}

impl Cell {
    pub(crate) fn reference(&self) -> String {
        index_to_reference(self.row, self.col)
    }

    /// Decodes the raw text. Shared string cells are resolved through `lookup`,
    /// which maps a table index to its text.
    pub(crate) fn into_value<'a, F>(self, lookup: F) -> Result<CellValue, SourceError>
    where
        F: FnOnce(usize) -> Option<&'a str>,
    {
        let value = match self.kind {
            CellType::Empty => CellValue::Empty,
            CellType::Boolean => CellValue::Bool(self.value.trim() == "1" || self.value.trim().eq_ignore_ascii_case("true")),
            CellType::Number => CellValue::Number(self.to_number()?),
            CellType::NumberDateTime1900 => CellValue::Text(to_datetime_string(self.to_number()?, false)?),
            CellType::NumberDateTime1904 => CellValue::Text(to_datetime_string(self.to_number()?, true)?),
            CellType::NumberDate1900 => CellValue::Text(to_date_string(self.to_number()?, false)?),
            CellType::NumberDate1904 => CellValue::Text(to_date_string(self.to_number()?, true)?),
            CellType::NumberTime1900 | CellType::NumberTime1904 => CellValue::Text(to_time_string(self.to_number()?)),
            CellType::IsoDateTime => CellValue::Text(self.value.replace('T', " ")),
            CellType::IsoDuration => CellValue::Text(self.to_duration_string()?),
            CellType::InlineString | CellType::Error => CellValue::Text(self.value),
            CellType::SharedString => {
                let index = self.value.trim().parse::<usize>()?;
                match lookup(index) {
                    Some(text) => CellValue::Text(text.to_owned()),
                    None => Err(SourceError::Corrupt(format!(
                        "{} refers to missing shared string #{index}",
                        self.reference()
                    )))?,
                }
            }
        };
        Ok(value)
    }

    fn to_number(&self) -> Result<f64, SourceError> {
        self.value
            .trim()
            .parse::<f64>()
            .map_err(|_| SourceError::Corrupt(format!("{} holds '{}', not a number", self.reference(), self.value)))
    }

    fn to_duration_string(&self) -> Result<String, SourceError> {
        let duration = self
            .value
            .parse::<IsoDuration>()
            .map_err(|_| SourceError::Corrupt(format!("{} holds '{}', not a duration", self.reference(), self.value)))?;
        let seconds = duration.day as f64 * 86_400.0
            + duration.hour as f64 * 3_600.0
            + duration.minute as f64 * 60.0
            + duration.second as f64;
        Ok(to_time_string(seconds / 86_400.0))
    }
}

const MILLISECONDS_PER_DAY: i64 = 86_400_000;

/// Splits a serial into whole days and milliseconds into the day, carrying
/// a rounded-up fraction into the next day.
fn split_serial(serial: f64) -> (i64, i64) {
    let milliseconds = (serial * MILLISECONDS_PER_DAY as f64).round() as i64;
    (
        milliseconds.div_euclid(MILLISECONDS_PER_DAY),
        milliseconds.rem_euclid(MILLISECONDS_PER_DAY),
    )
}

fn days_to_date(days: i64, is_1904: bool) -> Result<NaiveDate, SourceError> {
    // Serials below 60 predate the phantom 1900-02-29 of the 1900 system.
    let offset = if is_1904 {
        1_462
    } else if days < 60 {
        1
    } else {
        0
    };
    NaiveDate::from_ymd_opt(1899, 12, 30)
        .zip(Duration::try_days(days + offset))
        .and_then(|(epoch, duration)| epoch.checked_add_signed(duration))
        .ok_or_else(|| SourceError::Corrupt(format!("serial date {days} is out of range")))
}

fn format_time(milliseconds: i64) -> String {
    let mut rest = milliseconds;
    let fraction = rest % 1_000;
    rest /= 1_000;
    let seconds = rest % 60;
    rest /= 60;
    let minutes = rest % 60;
    let hours = rest / 60;
    if fraction > 0 {
        format!("{hours:02}:{minutes:02}:{seconds:02}.{fraction:03}")
    } else {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    }
}

pub(crate) fn to_date_string(serial: f64, is_1904: bool) -> Result<String, SourceError> {
    let (days, _) = split_serial(serial.trunc());
    Ok(days_to_date(days, is_1904)?.format("%Y-%m-%d").to_string())
}

/// Renders the serial as elapsed time, so values past one day keep counting hours.
pub(crate) fn to_time_string(serial: f64) -> String {
    let (days, milliseconds) = split_serial(serial);
    format_time(days * MILLISECONDS_PER_DAY + milliseconds)
}

pub(crate) fn to_datetime_string(serial: f64, is_1904: bool) -> Result<String, SourceError> {
    let (days, milliseconds) = split_serial(serial);
    let date = days_to_date(days, is_1904)?;
    Ok(format!("{} {}", date.format("%Y-%m-%d"), format_time(milliseconds)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell(kind: CellType, value: &str) -> Cell {
        Cell {
            row: 0,
            col: 0,
            kind,
            value: value.to_owned(),
        }
    }

    fn decode(kind: CellType, value: &str) -> CellValue {
        cell(kind, value).into_value(|_| None).unwrap()
    }

    #[test]
    fn number_formats() {
        assert_eq!(CellType::parse_builtin_number_format_id("14", false), Some(CellType::NumberDate1900));
        assert_eq!(CellType::parse_builtin_number_format_id("22", true), Some(CellType::NumberDateTime1904));
        assert_eq!(CellType::parse_builtin_number_format_id("2", false), None);

        assert_eq!(CellType::parse_custom_number_format("yyyy-mm-dd", false), CellType::NumberDate1900);
        assert_eq!(CellType::parse_custom_number_format("yyyy-mm-dd hh:mm", true), CellType::NumberDateTime1904);
        assert_eq!(CellType::parse_custom_number_format("hh:mm:ss", false), CellType::NumberTime1900);
        assert_eq!(CellType::parse_custom_number_format("0.00\" days\"", false), CellType::Number);
        assert_eq!(CellType::parse_custom_number_format("[Red]0.00", false), CellType::Number);
        assert_eq!(CellType::parse_custom_number_format("#,##0\\d", false), CellType::Number);
    }

    #[test]
    fn dates() {
        assert_eq!(to_date_string(45322.0, false).unwrap(), "2024-01-31");
        assert_eq!(to_date_string(45322.75, false).unwrap(), "2024-01-31");
        assert_eq!(to_date_string(1.0, false).unwrap(), "1900-01-01");
        assert_eq!(to_date_string(61.0, false).unwrap(), "1900-03-01");
        assert_eq!(to_date_string(0.0, true).unwrap(), "1904-01-01");
        assert!(to_date_string(1e15, false).is_err());
    }

    #[test]
    fn times() {
        assert_eq!(to_time_string(0.5), "12:00:00");
        assert_eq!(to_time_string(0.5 + 1.0 / 86_400_000.0 * 250.0), "12:00:00.250");
        assert_eq!(to_time_string(1.25), "30:00:00");
        assert_eq!(to_datetime_string(45322.5, false).unwrap(), "2024-01-31 12:00:00");
        assert_eq!(to_datetime_string(45322.0, false).unwrap(), "2024-01-31 00:00:00");
        // One millisecond short of midnight rounds into the next day.
        assert_eq!(to_datetime_string(45322.999_999_999, false).unwrap(), "2024-02-01 00:00:00");
    }

    #[test]
    fn decode_values() {
        assert_eq!(decode(CellType::Empty, ""), CellValue::Empty);
        assert_eq!(decode(CellType::Boolean, "1"), CellValue::Bool(true));
        assert_eq!(decode(CellType::Boolean, "0"), CellValue::Bool(false));
        assert_eq!(decode(CellType::Number, " 42.5 "), CellValue::Number(42.5));
        assert_eq!(decode(CellType::NumberDate1900, "45322"), CellValue::from("2024-01-31"));
        assert_eq!(decode(CellType::IsoDateTime, "2024-01-31T08:30:00"), CellValue::from("2024-01-31 08:30:00"));
        assert_eq!(decode(CellType::IsoDuration, "PT12H30M05S"), CellValue::from("12:30:05"));
        assert_eq!(decode(CellType::Error, "#DIV/0!"), CellValue::from("#DIV/0!"));
        assert!(cell(CellType::Number, "abc").into_value(|_| None).is_err());
    }

    #[test]
    fn shared_strings() {
        let table = ["zero".to_owned(), "one".to_owned()];
        let lookup = |index: usize| table.get(index).map(String::as_str);
        assert_eq!(cell(CellType::SharedString, "1").into_value(lookup).unwrap(), CellValue::from("one"));
        assert!(matches!(
            cell(CellType::SharedString, "7").into_value(lookup),
            Err(SourceError::Corrupt(_))
        ));
    }

    #[test]
    fn infer_from_text() {
        assert_eq!(CellValue::infer(""), CellValue::Empty);
        assert_eq!(CellValue::infer("TRUE"), CellValue::Bool(true));
        assert_eq!(CellValue::infer("false"), CellValue::Bool(false));
        assert_eq!(CellValue::infer("-1.5e3"), CellValue::Number(-1500.0));
        assert_eq!(CellValue::infer("NaN"), CellValue::from("NaN"));
        assert_eq!(CellValue::infer("12 apples"), CellValue::from("12 apples"));
        assert_eq!(CellValue::infer(" "), CellValue::from(" "));
    }

    #[test]
    fn serializes_as_plain_json() {
        let row = vec![CellValue::Empty, CellValue::Bool(true), CellValue::Number(1.5), CellValue::from("x")];
        assert_eq!(serde_json::to_string(&row).unwrap(), r#"[null,true,1.5,"x"]"#);
    }
}
