use std::io::{Seek, SeekFrom, Write};

use crate::{Atom, Error, Result};

/// Byte writer that tracks its absolute offset.
pub struct Mp4Writer<W> {
    writer: W,
    offset: u64,
}

impl<W: Write + Seek> Mp4Writer<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, offset: 0 }
    }

    /// Starts writing at `offset`.
    pub fn at(writer: W, offset: u64) -> Result<Self> {
        let mut writer = Self::new(writer);
        writer.seek(offset)?;
        Ok(writer)
    }

    pub fn current_offset(&self) -> u64 {
        self.offset
    }

    pub fn seek(&mut self, offset: u64) -> Result<()> {
        self.offset = self
            .writer
            .seek(SeekFrom::Start(offset))
            .map_err(|e| Error::io(format!("seek to {offset}"), e))?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush().map_err(|e| Error::io("flush", e))
    }

    pub fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        self.writer
            .write_all(data)
            .map_err(|e| Error::io(format!("write {} bytes at {}", data.len(), self.offset), e))?;
        self.offset += data.len() as u64;
        Ok(())
    }

    /// Writes a serialized atom at the current offset. Sizes must already be computed.
    pub fn write_atom(&mut self, atom: &Atom) -> Result<()> {
        tracing::trace!(atom_type = %atom.atom_type(), offset = self.offset, size = atom.size(), "write atom");
        self.write_raw(&atom.to_bytes())
    }

    /// Rewrites only the header of `atom` at its start offset, then returns to the current offset.
    pub fn patch_atom_header(&mut self, atom: &Atom) -> Result<()> {
        let resume = self.offset;
        self.seek(atom.start())?;
        self.write_raw(&atom.header_bytes())?;
        self.seek(resume)
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::atom::{AtomHeader, FourCC};

    #[test]
    fn test_patch_atom_header() {
        let mut writer = Mp4Writer::new(Cursor::new(Vec::new()));
        writer.write_raw(&[0u8; 8]).unwrap();
        writer.write_raw(b"data").unwrap();

        let mdat = Atom::on_disk(AtomHeader {
            size: 12,
            ..AtomHeader::new(FourCC::new(b"mdat"))
        });
        writer.patch_atom_header(&mdat).unwrap();
        assert_eq!(writer.current_offset(), 12);
        let bytes = writer.into_inner().into_inner();
        assert_eq!(&bytes[..8], &[0, 0, 0, 12, b'm', b'd', b'a', b't']);
        assert_eq!(&bytes[8..], b"data");
    }
}
