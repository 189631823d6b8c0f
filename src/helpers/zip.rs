//! ZIP archive helpers for the xlsx and ods containers.

use crate::error::SourceError;
use crate::helpers::xml::XmlReader;
use std::io::BufReader;
use std::io::Read;
use std::io::Seek;
use zip::read::ZipFile;
use zip::result::ZipError;
use zip::ZipArchive;

/// Lookup helpers over a [`ZipArchive`].
pub(crate) trait ZipHelper<RS: Read + Seek> {
    /// Gets an entry by name (case-insensitive, path separator agnostic).
    fn file(&'_ mut self, name: &str) -> Result<Option<ZipFile<'_, RS>>, SourceError>;

    /// Creates an XML reader over an entry, `None` when the entry is absent.
    fn xml_reader(
        &'_ mut self,
        name: &str,
    ) -> Result<Option<XmlReader<BufReader<ZipFile<'_, RS>>>>, SourceError>;

    /// Like [`ZipHelper::xml_reader`], but a missing entry is a corrupt container.
    fn require_xml_reader(
        &'_ mut self,
        name: &str,
    ) -> Result<XmlReader<BufReader<ZipFile<'_, RS>>>, SourceError>;
}

impl<RS: Read + Seek> ZipHelper<RS> for ZipArchive<RS> {
    fn file(&'_ mut self, name: &str) -> Result<Option<ZipFile<'_, RS>>, SourceError> {
        let pattern = name.replace('\\', "/");
        let path = self
            .file_names()
            .find(|file_name| pattern.eq_ignore_ascii_case(file_name))
            .map(|file_name| file_name.to_owned());
        match path.map(|file_name| self.by_name(&file_name)).transpose() {
            Ok(Some(file)) => Ok(Some(file)),
            Ok(None) | Err(ZipError::FileNotFound) => Ok(None),
            Err(error) => Err(error)?,
        }
    }

    fn xml_reader(
        &'_ mut self,
        name: &str,
    ) -> Result<Option<XmlReader<BufReader<ZipFile<'_, RS>>>>, SourceError> {
        let reader = self
            .file(name)?
            .map(|file| XmlReader::new(BufReader::new(file)));
        Ok(reader)
    }

    fn require_xml_reader(
        &'_ mut self,
        name: &str,
    ) -> Result<XmlReader<BufReader<ZipFile<'_, RS>>>, SourceError> {
        self.xml_reader(name)?
            .ok_or_else(|| SourceError::Corrupt(format!("missing archive entry '{name}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::io::Write;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn archive() -> ZipArchive<Cursor<Vec<u8>>> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        writer.start_file("xl/Workbook.xml", SimpleFileOptions::default()).unwrap();
        writer.write_all(b"<workbook/>").unwrap();
        let cursor = writer.finish().unwrap();
        ZipArchive::new(Cursor::new(cursor.into_inner())).unwrap()
    }

    #[test]
    fn lookup_ignores_case_and_separators() {
        let mut zip = archive();
        assert!(zip.file("xl\\workbook.xml").unwrap().is_some());
        assert!(zip.file("xl/styles.xml").unwrap().is_none());
    }

    #[test]
    fn required_entry_missing_is_corrupt() {
        let mut zip = archive();
        assert!(matches!(zip.require_xml_reader("content.xml"), Err(SourceError::Corrupt(_))));
        assert!(zip.require_xml_reader("xl/workbook.xml").is_ok());
    }
}
