use crate::selection::ParseError;
use crate::selection::SheetDescriptor;

/// Picks the sheet a request refers to.
///
/// An absent or empty name selects the first sheet. Otherwise the name must
/// match exactly (case-sensitive); there is no fuzzy or default fallback.
pub fn resolve<'a>(sheet_name: Option<&str>, catalog: &'a [SheetDescriptor]) -> Result<&'a SheetDescriptor, ParseError> {
    match sheet_name.filter(|name| !name.is_empty()) {
        None => catalog
            .first()
            .ok_or_else(|| ParseError::SheetNotFound(String::new())),
        Some(name) => catalog
            .iter()
            .find(|sheet| sheet.name == name)
            .ok_or_else(|| ParseError::SheetNotFound(name.to_owned())),
    }
}
