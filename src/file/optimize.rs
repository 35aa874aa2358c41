use std::{
    fs::{File, OpenOptions},
    path::Path,
};

use tempfile::NamedTempFile;

use super::{nth_trak_mut, open, samples::read_at, Mp4File};
use crate::{
    atom::{util::convert_time, AtomHeader, AtomKind, FTYP, MDAT, MOOV, TRAK},
    track::{SampleTable, SampleTableMut, Track, HINT_TRACK_TYPE},
    writer::Mp4Writer,
    Atom, Error, FourCC, Result,
};

/// One chunk to copy into the optimized file.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ChunkInfo {
    /// Position of the track's `trak` among the `trak` atoms of `moov`.
    trak_index: usize,
    chunk_id: u32,
    source_offset: u64,
    size: u64,
}

/// Walks the chunks of one track in order.
struct ChunkCursor<'a> {
    trak_index: usize,
    table: SampleTable<'a>,
    is_hint: bool,
    time_scale: u32,
    next_chunk: u32,
    chunks: u32,
    /// Start of `next_chunk` in the movie time scale, once computed.
    next_time: Option<u64>,
}

impl ChunkCursor<'_> {
    fn is_exhausted(&self) -> bool {
        self.next_chunk > self.chunks
    }

    fn next_time(&mut self, movie_time_scale: u32) -> Result<u64> {
        if let Some(time) = self.next_time {
            return Ok(time);
        }
        let time = convert_time(
            self.table.chunk_time(self.next_chunk)?,
            self.time_scale,
            movie_time_scale,
        )?;
        self.next_time = Some(time);
        Ok(time)
    }

    fn take(&mut self) -> Result<ChunkInfo> {
        let chunk = ChunkInfo {
            trak_index: self.trak_index,
            chunk_id: self.next_chunk,
            source_offset: self.table.chunk_offset(self.next_chunk)?,
            size: self.table.chunk_size(self.next_chunk)?,
        };
        self.next_chunk += 1;
        self.next_time = None;
        Ok(chunk)
    }
}

/// Orders the chunks of every track by start time. Hint chunks go first on ties, then the
/// earlier track.
fn interleave_chunks(moov: &Atom, movie_time_scale: u32) -> Result<Vec<ChunkInfo>> {
    let mut cursors = Vec::new();
    for (trak_index, trak) in moov
        .children()
        .iter()
        .filter(|atom| atom.atom_type() == TRAK)
        .enumerate()
    {
        let Ok(table) = SampleTable::new(trak) else {
            tracing::warn!("trak {trak_index} has no sample table, no media to copy");
            continue;
        };
        let cursor = Track::from_trak(trak)
            .and_then(|track| {
                Ok(ChunkCursor {
                    trak_index,
                    is_hint: track.track_type() == HINT_TRACK_TYPE,
                    time_scale: Track::time_scale(trak)?,
                    chunks: table.number_of_chunks()?,
                    table,
                    next_chunk: 1,
                    next_time: None,
                })
            })
            // its chunk offsets would point into the old layout
            .map_err(|err| {
                Error::malformed(format!("can't relocate the media of trak {trak_index}: {err}"))
            })?;
        cursors.push(cursor);
    }

    let mut chunks = Vec::new();
    loop {
        let mut best: Option<(u64, bool, usize)> = None;
        for (index, cursor) in cursors.iter_mut().enumerate() {
            if cursor.is_exhausted() {
                continue;
            }
            let key = (cursor.next_time(movie_time_scale)?, !cursor.is_hint, index);
            if best.map_or(true, |best| key < best) {
                best = Some(key);
            }
        }
        let Some((_, _, index)) = best else {
            break;
        };
        chunks.push(cursors[index].take()?);
    }
    Ok(chunks)
}

impl Mp4File {
    /// Rewrites `old` with its metadata ahead of the media and the chunks of all tracks
    /// interleaved by time. Writes to `new`, or replaces `old` when `new` is `None`.
    pub fn optimize(old: impl AsRef<Path>, new: Option<&Path>) -> Result<()> {
        let old = old.as_ref();
        let source = Mp4File::read(old)?;
        match new {
            Some(new) => {
                let target = open(
                    new,
                    OpenOptions::new()
                        .read(true)
                        .write(true)
                        .create(true)
                        .truncate(true),
                )?;
                source.write_optimized(&target)?;
            }
            None => {
                let dir = old
                    .parent()
                    .filter(|dir| !dir.as_os_str().is_empty())
                    .unwrap_or(Path::new("."));
                let temp = NamedTempFile::new_in(dir).map_err(|e| {
                    Error::io(format!("create temporary file in {}", dir.display()), e)
                })?;
                source.write_optimized(temp.as_file())?;
                temp.persist(old)
                    .map_err(|e| Error::io(format!("replace {}", old.display()), e.error))?;
            }
        }
        tracing::debug!(old = %old.display(), new = ?new, "optimized");
        Ok(())
    }

    fn write_optimized(mut self, target: &File) -> Result<()> {
        self.stamp_modification_time()?;
        let Mp4File { root, file, .. } = self;
        let moov = root
            .child(MOOV)
            .ok_or_else(|| Error::malformed("no moov atom"))?;
        let movie_time_scale = moov.integer_property("mvhd.timeScale")? as u32;
        let chunks = interleave_chunks(moov, movie_time_scale)?;
        let media_size: u64 = chunks.iter().map(|chunk| chunk.size).sum();

        let mut layout = Atom::root();
        let mut others = Vec::new();
        for atom in root.children {
            if atom.atom_type() == FTYP {
                layout.add_child(atom);
            } else if atom.kind() == AtomKind::OnDisk {
                tracing::trace!(atom_type = %atom.atom_type(), size = atom.size(), "dropping");
            } else {
                others.push(atom);
            }
        }
        // moov goes right after ftyp
        if let Some(index) = others.iter().position(|atom| atom.atom_type() == MOOV) {
            let moov = others.remove(index);
            layout.add_child(moov);
        }
        for atom in others {
            layout.add_child(atom);
        }

        let metadata_size = layout.compute_sizes();
        let header_size: u8 = if media_size + 8 > u64::from(u32::MAX) { 16 } else { 8 };
        if metadata_size + u64::from(header_size) + media_size > u64::from(u32::MAX) {
            for trak_index in 0.. {
                let Some(trak) = nth_trak_mut(&mut layout, trak_index) else {
                    break;
                };
                if let Ok(mut table) = SampleTableMut::new(trak) {
                    table.promote_chunk_offsets()?;
                }
            }
        }
        layout.add_child(Atom::on_disk(AtomHeader {
            size: u64::from(header_size) + media_size,
            header_size,
            ..AtomHeader::new(FourCC::new(MDAT))
        }));
        layout.compute_sizes();
        layout.assign_offsets(0);

        let mut writer = Mp4Writer::new(target);
        for atom in layout.children() {
            writer.write_atom(atom)?;
        }
        let mut offsets = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            let data = read_at(&file, chunk.source_offset, chunk.size as usize)?;
            offsets.push(writer.current_offset());
            writer.write_raw(&data)?;
            tracing::trace!(
                trak = chunk.trak_index,
                chunk = chunk.chunk_id,
                from = chunk.source_offset,
                to = writer.current_offset() - chunk.size,
                "chunk copied"
            );
        }

        for (chunk, offset) in chunks.iter().zip(offsets) {
            let trak = nth_trak_mut(&mut layout, chunk.trak_index)
                .ok_or_else(|| Error::not_found(format!("moov.trak[{}]", chunk.trak_index)))?;
            SampleTableMut::new(trak)?.set_chunk_offset(chunk.chunk_id, offset)?;
        }
        let moov_size = layout.child(MOOV).map_or(0, Atom::size);
        layout.compute_sizes();
        let moov = layout
            .child(MOOV)
            .ok_or_else(|| Error::malformed("no moov atom"))?;
        if moov.size() != moov_size {
            return Err(Error::malformed("moov changed size while updating chunk offsets"));
        }
        writer.seek(moov.start())?;
        writer.write_atom(moov)?;
        writer.flush()?;
        tracing::debug!(chunks = chunks.len(), media_size, "media interleaved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::ROOT;

    fn trak(track_type: &str, id: u64, time_scale: u64) -> Atom {
        let mut trak = Atom::generate(FourCC::new(TRAK), FourCC::new(MOOV));
        trak.set_integer_property("tkhd.trackId", id).unwrap();
        trak.set_string_property("mdia.hdlr.handlerType", track_type)
            .unwrap();
        trak.set_integer_property("mdia.mdhd.timeScale", time_scale)
            .unwrap();
        trak
    }

    fn add_chunks(trak: &mut Atom, offsets: &[u64], duration: u64) {
        let mut track = Track::from_trak(trak).unwrap();
        for &offset in offsets {
            track
                .append_sample(trak, &[0; 4], Some(duration), 0, true, 1000)
                .unwrap();
            track.take_chunk();
            Track::record_chunk(trak, offset, 1).unwrap();
        }
    }

    #[test]
    fn test_hint_chunks_win_ties() {
        let mut moov = Atom::generate(FourCC::new(MOOV), ROOT);
        let mut audio = trak("soun", 1, 8000);
        add_chunks(&mut audio, &[100, 200], 8000);
        let mut hint = trak("hint", 2, 1000);
        add_chunks(&mut hint, &[300, 400], 1000);
        moov.add_child(audio);
        moov.add_child(hint);

        let order: Vec<(usize, u32)> = interleave_chunks(&moov, 1000)
            .unwrap()
            .into_iter()
            .map(|chunk| (chunk.trak_index, chunk.chunk_id))
            .collect();
        assert_eq!(order, vec![(1, 1), (0, 1), (1, 2), (0, 2)]);
    }

    #[test]
    fn test_trak_without_sample_table_is_skipped() {
        let mut moov = Atom::generate(FourCC::new(MOOV), ROOT);
        let mut audio = trak("soun", 1, 1000);
        add_chunks(&mut audio, &[100], 1000);
        let mut empty = trak("vide", 2, 1000);
        let minf = empty.find_atom_mut("mdia.minf").unwrap();
        let stbl = minf.child_position(b"stbl").unwrap();
        minf.delete_child(stbl).unwrap();
        moov.add_child(empty);
        moov.add_child(audio);

        let chunks = interleave_chunks(&moov, 1000).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].trak_index, 1);
    }

    #[test]
    fn test_unreadable_chunk_table_fails() {
        let mut moov = Atom::generate(FourCC::new(MOOV), ROOT);
        let mut broken = trak("soun", 1, 1000);
        add_chunks(&mut broken, &[100], 1000);
        let stbl = broken.find_atom_mut("mdia.minf.stbl").unwrap();
        let stco = stbl.child_position(b"stco").unwrap();
        stbl.delete_child(stco).unwrap();
        moov.add_child(broken);

        let err = interleave_chunks(&moov, 1000).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Malformed);
    }

    #[test]
    fn test_optimize_stamps_modification_time() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("old.mp4");
        let new = dir.path().join("new.mp4");
        Mp4File::create(&old).call().unwrap().close().unwrap();
        let mut source = Mp4File::read(&old).unwrap();
        source
            .root
            .set_integer_property("moov.mvhd.modificationTime", 0)
            .unwrap();
        let target = File::create(&new).unwrap();
        source.write_optimized(&target).unwrap();

        let optimized = Mp4File::read(&new).unwrap();
        assert!(optimized.integer_property("moov.mvhd.modificationTime").unwrap() > 0);
    }

    #[test]
    fn test_earlier_chunks_first() {
        let mut moov = Atom::generate(FourCC::new(MOOV), ROOT);
        let mut slow = trak("vide", 1, 1000);
        add_chunks(&mut slow, &[10, 20], 1000);
        let mut fast = trak("soun", 2, 1000);
        add_chunks(&mut fast, &[30, 40, 50], 400);
        moov.add_child(slow);
        moov.add_child(fast);

        let order: Vec<(usize, u64)> = interleave_chunks(&moov, 1000)
            .unwrap()
            .into_iter()
            .map(|chunk| (chunk.trak_index, chunk.source_offset))
            .collect();
        // times: slow 0, 1000; fast 0, 400, 800
        assert_eq!(order, vec![(0, 10), (1, 30), (1, 40), (1, 50), (0, 20)]);
    }
}
