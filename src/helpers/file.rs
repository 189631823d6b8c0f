use crate::error::SourceError;
use std::fs::File;
use std::io::BufReader;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::path::Path;

/// Signature of an OLE compound document (legacy `.xls`, or an encrypted OOXML package).
const CFB_SIGNATURE: [u8; 8] = [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];

/// Buffered handle over a local source file.
///
/// The handle is owned by a single probe or fetch call and closed when dropped,
/// on success and error paths alike.
pub(crate) struct SourceFile {
    reader: BufReader<File>,
}

impl SourceFile {
    pub(crate) fn open(path: &Path) -> Result<SourceFile, SourceError> {
        let file = File::open(path)?;
        Ok(SourceFile {
            reader: BufReader::new(file),
        })
    }

    /// Opens a file expected to be a ZIP container, rejecting compound documents up front
    /// so that encrypted workbooks report a clear error instead of a ZIP failure.
    pub(crate) fn open_package(path: &Path) -> Result<SourceFile, SourceError> {
        let mut file = Self::open(path)?;
        if file.is_compound_document()? {
            Err(SourceError::Unsupported(format!(
                "'{}' is password protected or a legacy binary workbook",
                path.display()
            )))?;
        }
        Ok(file)
    }

    fn is_compound_document(&mut self) -> Result<bool, SourceError> {
        let mut signature = [0u8; 8];
        let mut filled = 0;
        while filled < signature.len() {
            match self.reader.read(&mut signature[filled..])? {
                0 => break,
                count => filled += count,
            }
        }
        self.reader.seek(SeekFrom::Start(0))?;
        Ok(filled == signature.len() && signature == CFB_SIGNATURE)
    }
}

impl Read for SourceFile {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Seek for SourceFile {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.reader.seek(pos)
    }
}
