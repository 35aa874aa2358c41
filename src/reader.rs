use std::io::{Read, Seek, SeekFrom};

use crate::parser::{ParseError, ParseErrorKind};

/// Byte reader that tracks its absolute offset and reports failures as [`ParseError`]s.
pub struct Mp4Reader<R> {
    reader: R,
    pub(crate) current_offset: u64,
}

impl<R: Read + Seek> Mp4Reader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            current_offset: 0,
        }
    }

    /// Starts reading at `offset`.
    pub fn at(reader: R, offset: u64) -> Result<Self, ParseError> {
        let mut reader = Self::new(reader);
        reader.seek(SeekFrom::Start(offset))?;
        Ok(reader)
    }

    pub fn current_offset(&self) -> u64 {
        self.current_offset
    }

    pub(crate) fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), ParseError> {
        let size = buf.len() as u64;
        self.reader.read_exact(buf).map_err(|e| {
            let kind = if e.kind() == std::io::ErrorKind::UnexpectedEof {
                ParseErrorKind::Eof
            } else {
                ParseErrorKind::Io
            };
            ParseError {
                kind,
                location: Some((self.current_offset, size)),
                source: Some(Box::new(e)),
            }
        })?;
        self.current_offset += size;
        Ok(())
    }

    pub(crate) fn read_data(&mut self, size: usize) -> Result<Vec<u8>, ParseError> {
        let mut data = vec![0u8; size];
        self.read_exact(&mut data)?;
        Ok(data)
    }

    pub(crate) fn seek(&mut self, pos: SeekFrom) -> Result<(), ParseError> {
        match self.reader.seek(pos) {
            Ok(offset) => {
                self.current_offset = offset;
                Ok(())
            }
            Err(err) => Err(ParseError {
                kind: ParseErrorKind::Io,
                location: None,
                source: Some(Box::new(err)),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn test_offset_tracking_and_eof() {
        let mut reader = Mp4Reader::at(Cursor::new(vec![1, 2, 3, 4, 5]), 1).unwrap();
        assert_eq!(reader.read_data(2).unwrap(), vec![2, 3]);
        assert_eq!(reader.current_offset(), 3);
        let err = reader.read_data(4).unwrap_err();
        assert_eq!(err.kind(), ParseErrorKind::Eof);
        assert_eq!(err.location(), Some((3, 4)));
    }
}
