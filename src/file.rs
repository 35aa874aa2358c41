/*!
 * The file engine.
 *
 * An [`Mp4File`] owns the atom tree of one file and the per-track state needed to append samples
 * to it. Files are opened with [`Mp4File::read`], [`Mp4File::create`] or [`Mp4File::modify`] and
 * written out by [`Mp4File::close`]. [`Mp4File::optimize`] rewrites a file with its metadata first
 * and its chunks interleaved by time.
 */

use std::{
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
};

use bon::bon;

use crate::{
    atom::{path::PropertyHandle, util::mp4_timestamp_now, AtomHeader, FREE, FTYP, MDAT, MOOV, ROOT, SKIP, TRAK},
    parser,
    reader::Mp4Reader,
    writer::Mp4Writer,
    track::{Track, OD_TRACK_TYPE},
    Atom, Error, FourCC, Result,
};

mod hint;
mod optimize;
mod samples;
mod tracks;

pub use self::hint::RtpPayload;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Read,
    Write,
}

/// `moov.mvhd` properties touched on every write.
#[derive(Debug, Clone)]
struct MovieHandles {
    modification_time: PropertyHandle,
    time_scale: PropertyHandle,
    duration: PropertyHandle,
}

#[derive(Debug)]
pub struct Mp4File {
    path: PathBuf,
    file: File,
    mode: Mode,
    /// New tracks get `co64` chunk offsets.
    use_64bit: bool,
    /// Size of the file when it was opened; 0 for created files.
    original_size: u64,
    /// Where the next chunk is written.
    write_position: u64,
    root: Atom,
    tracks: Vec<Track>,
    /// Track id of every `moov.trak`, in order. 0 for a `trak` without `tkhd` or `hdlr`.
    trak_ids: Vec<u32>,
    od_track_id: Option<u32>,
    movie: Option<MovieHandles>,
}

fn open(path: &Path, options: &OpenOptions) -> Result<File> {
    options
        .open(path)
        .map_err(|e| Error::io(format!("open {}", path.display()), e))
}

fn parse(file: &File, path: &Path) -> Result<(Atom, u64)> {
    let size = file
        .metadata()
        .map_err(|e| Error::io(format!("stat {}", path.display()), e))?
        .len();
    let root = parser::read_root(&mut Mp4Reader::new(file), size)?;
    Ok((root, size))
}

fn writer_at(file: &File, offset: u64) -> Result<Mp4Writer<&File>> {
    Mp4Writer::at(file, offset)
}

/// The `index`th `trak` among the children of `moov`.
fn nth_trak_mut(root: &mut Atom, index: usize) -> Option<&mut Atom> {
    root.child_mut(MOOV)?
        .children
        .iter_mut()
        .filter(|child| child.atom_type() == TRAK)
        .nth(index)
}

#[bon]
impl Mp4File {
    fn new(path: &Path, file: File, mode: Mode, root: Atom, original_size: u64) -> Self {
        let mut this = Self {
            path: path.to_path_buf(),
            file,
            mode,
            use_64bit: false,
            original_size,
            write_position: 0,
            root,
            tracks: Vec::new(),
            trak_ids: Vec::new(),
            od_track_id: None,
            movie: None,
        };
        this.generate_tracks();
        this.cache_handles();
        this
    }

    /// Opens an existing file read-only.
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = open(path, OpenOptions::new().read(true))?;
        let (root, size) = parse(&file, path)?;
        tracing::debug!(path = %path.display(), size, "opened for reading");
        Ok(Self::new(path, file, Mode::Read, root, size))
    }

    /// Creates a new file holding an empty movie, ready for tracks and samples.
    #[builder]
    pub fn create(
        #[builder(start_fn)] path: &Path,
        /// Use a 64-bit `mdat` header and `co64` chunk offsets.
        #[builder(default)]
        use_64bit: bool,
    ) -> Result<Self> {
        let file = open(
            path,
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true),
        )?;
        let mut root = Atom::root();
        root.add_child(Atom::generate(FourCC::new(FTYP), ROOT));
        root.add_child(Atom::generate(FourCC::new(MOOV), ROOT));

        let mut this = Self::new(path, file, Mode::Write, root, 0);
        this.use_64bit = use_64bit;
        let mut mdat = Atom::generate(FourCC::new(MDAT), ROOT);
        if use_64bit {
            mdat.header.header_size = 16;
            mdat.header.size = 16;
        }
        this.root.insert_child(1, mdat);
        this.root.compute_sizes();
        this.root.assign_offsets(0);

        let mut writer = writer_at(&this.file, 0)?;
        writer.write_atom(&this.root.children[0])?;
        writer.write_atom(&this.root.children[1])?;
        this.write_position = writer.current_offset();
        this.cache_handles();
        tracing::debug!(path = %path.display(), use_64bit, "created");
        Ok(this)
    }

    /// Opens an existing file for appending tracks and samples.
    pub fn modify(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = open(path, OpenOptions::new().read(true).write(true))?;
        let (root, size) = parse(&file, path)?;
        let mut this = Self::new(path, file, Mode::Write, root, size);
        this.begin_modify()?;
        tracing::debug!(path = %path.display(), size, resume = this.write_position, "opened for modification");
        Ok(this)
    }

    fn begin_modify(&mut self) -> Result<()> {
        while self
            .root
            .children
            .last()
            .is_some_and(|atom| [FREE, SKIP].contains(&&atom.atom_type().0))
        {
            self.root.children.pop();
        }
        self.patch_open_ended_atoms()?;

        let moovs: Vec<usize> = self
            .root
            .children
            .iter()
            .enumerate()
            .filter(|(_, atom)| atom.atom_type() == MOOV)
            .map(|(i, _)| i)
            .collect();
        match moovs[..] {
            [] => {
                self.write_position = self.root.children.last().map_or(0, Atom::end);
                self.root
                    .add_child(Atom::generate(FourCC::new(MOOV), ROOT));
            }
            [index] if index + 1 == self.root.children.len() => {
                self.write_position = self.root.children[index].start();
            }
            [index] => {
                let moov = self.root.children.remove(index);
                let free = Atom::on_disk(AtomHeader {
                    start: moov.start(),
                    size: moov.size(),
                    header_size: moov.header().header_size,
                    ..AtomHeader::new(FourCC::new(FREE))
                });
                writer_at(&self.file, free.start())?.write_atom(&free)?;
                self.root.insert_child(index, free);
                self.write_position = self.root.children.last().map_or(0, Atom::end);
                self.root.add_child(moov);
            }
            _ => return Err(Error::malformed("multiple moov atoms")),
        }

        let moov_index = self.root.children.len() - 1;
        let mdat = Atom::on_disk(AtomHeader {
            start: self.write_position,
            ..AtomHeader::new(FourCC::new(MDAT))
        });
        let mut writer = writer_at(&self.file, self.write_position)?;
        writer.write_atom(&mdat)?;
        self.write_position = writer.current_offset();
        self.root.insert_child(moov_index, mdat);
        self.cache_handles();
        Ok(())
    }

    /// Gives atoms that were written with the size-0 "to end" sentinel their real size, since data
    /// will follow them.
    fn patch_open_ended_atoms(&mut self) -> Result<()> {
        let mut writer = writer_at(&self.file, 0)?;
        for atom in self.root.children.iter_mut() {
            if !atom.header.extends_to_end {
                continue;
            }
            if atom.header.header_size == 8 && atom.size() > u64::from(u32::MAX) {
                return Err(Error::exhausted(format!(
                    "{} extends to the end and is too large for its header",
                    atom.atom_type()
                )));
            }
            atom.header.extends_to_end = false;
            writer.patch_atom_header(atom)?;
            tracing::debug!(atom_type = %atom.atom_type(), size = atom.size(), "patched open-ended atom");
        }
        Ok(())
    }

    /// Finishes pending writes and releases the file.
    pub fn close(mut self) -> Result<()> {
        if self.mode == Mode::Write {
            self.finish_write()?;
        }
        tracing::debug!(path = %self.path.display(), "closed");
        Ok(())
    }

    fn finish_write(&mut self) -> Result<()> {
        self.stamp_modification_time()?;
        for index in 0..self.tracks.len() {
            self.flush_chunk(index)?;
        }
        self.store_hint_statistics()?;

        let mdat_index = self.media_index()?;
        self.root.compute_sizes();
        self.root.assign_offsets(0);

        let mdat = &self.root.children[mdat_index];
        if mdat.header().header_size == 8 && mdat.size() > u64::from(u32::MAX) {
            return Err(Error::exhausted(
                "media data exceeds 4 GiB; create the file with 64-bit support",
            ));
        }
        let mut writer = writer_at(&self.file, mdat.end())?;
        writer.patch_atom_header(mdat)?;
        for atom in &self.root.children[mdat_index + 1..] {
            writer.write_atom(atom)?;
        }
        writer.flush()?;
        let end = writer.current_offset();
        tracing::debug!(end, mdat_size = mdat.size(), "layout written");

        if end < self.original_size {
            let gap = self.original_size - end;
            if gap >= 8 {
                let free = Atom::on_disk(AtomHeader {
                    start: end,
                    size: gap,
                    ..AtomHeader::new(FourCC::new(FREE))
                });
                writer.write_atom(&free)?;
            } else {
                self.file
                    .set_len(end)
                    .map_err(|e| Error::io(format!("truncate to {end}"), e))?;
            }
        }
        Ok(())
    }

    pub fn dump(&self, out: &mut dyn io::Write, dump_implicits: bool) -> Result<()> {
        let dump = |out: &mut dyn io::Write| -> io::Result<()> {
            writeln!(out, "Dumping {} meta-information...", self.path.display())?;
            self.root.dump(out, 0, dump_implicits)
        };
        dump(out).map_err(|e| Error::io("dump", e))
    }
}

// state and lookups
impl Mp4File {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn root(&self) -> &Atom {
        &self.root
    }

    pub fn find_atom(&self, path: &str) -> Option<&Atom> {
        if path.is_empty() {
            return Some(&self.root);
        }
        self.root.find_atom(path)
    }

    /// Index in the root of the `mdat` being appended to, which is always the last one.
    pub(crate) fn media_index(&self) -> Result<usize> {
        self.root
            .children
            .iter()
            .rposition(|atom| atom.atom_type() == MDAT)
            .ok_or_else(|| Error::malformed("no mdat being written"))
    }

    pub(crate) fn protect_write(&self, operation: &str) -> Result<()> {
        match self.mode {
            Mode::Write => Ok(()),
            Mode::Read => Err(Error::write_protected(operation)),
        }
    }

    fn generate_tracks(&mut self) {
        self.tracks.clear();
        self.trak_ids.clear();
        self.od_track_id = None;
        let Some(moov) = self.root.child(MOOV) else {
            return;
        };
        for trak in moov.children().iter().filter(|a| a.atom_type() == TRAK) {
            let has_basics = trak.find_property("tkhd.trackId").is_some()
                && trak.find_property("mdia.hdlr.handlerType").is_some();
            if !has_basics {
                self.trak_ids.push(0);
                continue;
            }
            let id = trak.integer_property("tkhd.trackId").unwrap_or(0) as u32;
            self.trak_ids.push(id);
            match Track::from_trak(trak) {
                Ok(track) => {
                    if track.track_type() == OD_TRACK_TYPE {
                        if self.od_track_id.is_none() {
                            self.od_track_id = Some(id);
                        } else {
                            tracing::warn!("multiple OD tracks present, using track {:?}", self.od_track_id);
                        }
                    }
                    self.tracks.push(track);
                }
                Err(err) => tracing::warn!("skipping track {id}: {err}"),
            }
        }
    }

    /// Re-resolves the cached `mvhd` handles. Needed after any change to the top-level layout.
    pub(crate) fn cache_handles(&mut self) {
        let resolve = |name: &str| PropertyHandle::resolve(&self.root, &format!("moov.mvhd.{name}"));
        self.movie = match (
            resolve("modificationTime"),
            resolve("timeScale"),
            resolve("duration"),
        ) {
            (Some(modification_time), Some(time_scale), Some(duration)) => Some(MovieHandles {
                modification_time,
                time_scale,
                duration,
            }),
            _ => None,
        };
    }

    fn movie_handles(&self) -> Result<&MovieHandles> {
        self.movie
            .as_ref()
            .ok_or_else(|| Error::not_found("moov.mvhd"))
    }

    fn movie_integer(&self, handle: impl Fn(&MovieHandles) -> &PropertyHandle) -> Result<u64> {
        let handle = handle(self.movie_handles()?);
        handle
            .get(&self.root)
            .ok_or_else(|| Error::not_found("moov.mvhd"))?
            .integer(handle.index)
    }

    fn set_movie_integer(
        &mut self,
        handle: impl Fn(&MovieHandles) -> &PropertyHandle,
        value: u64,
    ) -> Result<()> {
        let handle = handle(self.movie_handles()?).clone();
        handle
            .get_mut(&mut self.root)
            .ok_or_else(|| Error::not_found("moov.mvhd"))?
            .set_integer(handle.index, value)
    }

    pub(crate) fn stamp_modification_time(&mut self) -> Result<()> {
        self.set_movie_integer(|m| &m.modification_time, mp4_timestamp_now())
    }

    /// Runs `f` and restores the movie and track registry if it fails.
    pub(crate) fn transaction<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let root = self.root.clone();
        let tracks = self.tracks.clone();
        let trak_ids = self.trak_ids.clone();
        let od_track_id = self.od_track_id;
        let result = f(self);
        if result.is_err() {
            self.root = root;
            self.tracks = tracks;
            self.trak_ids = trak_ids;
            self.od_track_id = od_track_id;
            self.cache_handles();
        }
        result
    }

    pub(crate) fn track_index(&self, track_id: u32) -> Result<usize> {
        self.tracks
            .iter()
            .position(|t| t.id() == track_id)
            .ok_or_else(|| Error::invalid(format!("track id {track_id} doesn't exist")))
    }

    pub(crate) fn trak_index(&self, track_id: u32) -> Result<usize> {
        self.trak_ids
            .iter()
            .position(|&id| id != 0 && id == track_id)
            .ok_or_else(|| Error::invalid(format!("track id {track_id} doesn't exist")))
    }

    pub(crate) fn track(&self, track_id: u32) -> Result<&Track> {
        Ok(&self.tracks[self.track_index(track_id)?])
    }

    pub(crate) fn trak(&self, track_id: u32) -> Result<&Atom> {
        let index = self.trak_index(track_id)?;
        self.root
            .child(MOOV)
            .and_then(|moov| {
                moov.children()
                    .iter()
                    .filter(|a| a.atom_type() == TRAK)
                    .nth(index)
            })
            .ok_or_else(|| Error::not_found(format!("moov.trak[{index}]")))
    }

    pub(crate) fn trak_mut(&mut self, track_id: u32) -> Result<&mut Atom> {
        let index = self.trak_index(track_id)?;
        nth_trak_mut(&mut self.root, index)
            .ok_or_else(|| Error::not_found(format!("moov.trak[{index}]")))
    }

    pub(crate) fn track_and_trak_mut(&mut self, track_id: u32) -> Result<(&mut Track, &mut Atom)> {
        let track = self.track_index(track_id)?;
        let index = self.trak_index(track_id)?;
        let trak = nth_trak_mut(&mut self.root, index)
            .ok_or_else(|| Error::not_found(format!("moov.trak[{index}]")))?;
        Ok((&mut self.tracks[track], trak))
    }

    /// `moov.trak[N].name` for the `trak` of a track.
    pub(crate) fn track_path(&self, track_id: u32, name: &str) -> Result<String> {
        let index = self.trak_index(track_id)?;
        Ok(match name {
            "" => format!("moov.trak[{index}]"),
            name => format!("moov.trak[{index}].{name}"),
        })
    }
}

// structural edits
impl Mp4File {
    /// Generates an atom of `atom_type` and appends it to the atom at `parent`.
    pub fn add_atom(&mut self, parent: &str, atom_type: &[u8; 4]) -> Result<&mut Atom> {
        let count = self
            .find_atom(parent)
            .ok_or_else(|| Error::not_found(parent.to_string()))?
            .children()
            .len();
        self.insert_atom(parent, atom_type, count)
    }

    pub fn insert_atom(&mut self, parent: &str, atom_type: &[u8; 4], index: usize) -> Result<&mut Atom> {
        self.protect_write("insert_atom")?;
        if parent.is_empty() && index <= self.media_index()? {
            return Err(Error::invalid(format!(
                "top-level index {index} is at or before the media data, which is already written"
            )));
        }
        let parent_atom = match parent {
            "" => &mut self.root,
            path => self
                .root
                .find_atom_mut(path)
                .ok_or_else(|| Error::not_found(path.to_string()))?,
        };
        let child = Atom::generate(FourCC::new(atom_type), parent_atom.atom_type());
        let index = index.min(parent_atom.children().len());
        parent_atom.insert_child(index, child);
        let in_moov = parent_atom.atom_type() == MOOV && parent_atom.parent_type() == ROOT;
        if in_moov && FourCC::new(atom_type) == TRAK {
            // keep trak_ids[i] in step with moov.trak[i]; a generated trak has no id yet
            let ordinal = parent_atom.children()[..index]
                .iter()
                .filter(|atom| atom.atom_type() == TRAK)
                .count();
            self.trak_ids.insert(ordinal, 0);
        }
        if parent.is_empty() || in_moov {
            self.cache_handles();
        }
        let parent_atom = match parent {
            "" => &mut self.root,
            path => self
                .root
                .find_atom_mut(path)
                .ok_or_else(|| Error::not_found(path.to_string()))?,
        };
        parent_atom
            .child_at_mut(index)
            .ok_or_else(|| Error::not_found(format!("{parent}.children[{index}]")))
    }
}

// typed property access
impl Mp4File {
    pub fn integer_property(&self, path: &str) -> Result<u64> {
        self.root.integer_property(path)
    }

    pub fn set_integer_property(&mut self, path: &str, value: u64) -> Result<()> {
        self.protect_write("set_integer_property")?;
        self.root.set_integer_property(path, value)
    }

    pub fn float_property(&self, path: &str) -> Result<f32> {
        self.root.float_property(path)
    }

    pub fn set_float_property(&mut self, path: &str, value: f32) -> Result<()> {
        self.protect_write("set_float_property")?;
        self.root.set_float_property(path, value)
    }

    pub fn string_property(&self, path: &str) -> Result<String> {
        self.root.string_property(path)
    }

    pub fn set_string_property(&mut self, path: &str, value: &str) -> Result<()> {
        self.protect_write("set_string_property")?;
        self.root.set_string_property(path, value)
    }

    pub fn bytes_property(&self, path: &str) -> Result<Vec<u8>> {
        self.root.bytes_property(path)
    }

    pub fn set_bytes_property(&mut self, path: &str, value: Vec<u8>) -> Result<()> {
        self.protect_write("set_bytes_property")?;
        self.root.set_bytes_property(path, value)
    }

    pub fn track_integer_property(&self, track_id: u32, path: &str) -> Result<u64> {
        self.integer_property(&self.track_path(track_id, path)?)
    }

    pub fn set_track_integer_property(&mut self, track_id: u32, path: &str, value: u64) -> Result<()> {
        let path = self.track_path(track_id, path)?;
        self.set_integer_property(&path, value)
    }

    pub fn track_float_property(&self, track_id: u32, path: &str) -> Result<f32> {
        self.float_property(&self.track_path(track_id, path)?)
    }

    pub fn set_track_float_property(&mut self, track_id: u32, path: &str, value: f32) -> Result<()> {
        let path = self.track_path(track_id, path)?;
        self.set_float_property(&path, value)
    }

    pub fn track_string_property(&self, track_id: u32, path: &str) -> Result<String> {
        self.string_property(&self.track_path(track_id, path)?)
    }

    pub fn set_track_string_property(&mut self, track_id: u32, path: &str, value: &str) -> Result<()> {
        let path = self.track_path(track_id, path)?;
        self.set_string_property(&path, value)
    }

    pub fn track_bytes_property(&self, track_id: u32, path: &str) -> Result<Vec<u8>> {
        self.bytes_property(&self.track_path(track_id, path)?)
    }

    pub fn set_track_bytes_property(&mut self, track_id: u32, path: &str, value: Vec<u8>) -> Result<()> {
        let path = self.track_path(track_id, path)?;
        self.set_bytes_property(&path, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn test_create_writes_ftyp_and_mdat_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("new.mp4");
        let file = Mp4File::create(&path).call().unwrap();
        assert_eq!(file.mode(), Mode::Write);
        assert_eq!(file.integer_property("moov.mvhd.nextTrackId").unwrap(), 1);
        let ftyp_size = file.root().children()[0].size();
        assert_eq!(file.write_position, ftyp_size + 8);
        file.close().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[4..8], b"ftyp");
        assert_eq!(&bytes[ftyp_size as usize + 4..ftyp_size as usize + 8], b"mdat");
    }

    #[test]
    fn test_read_mode_is_write_protected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ro.mp4");
        Mp4File::create(&path).call().unwrap().close().unwrap();

        let mut file = Mp4File::read(&path).unwrap();
        let err = file
            .set_integer_property("moov.mvhd.timeScale", 600)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WriteProtected);
        assert_eq!(
            err.to_string(),
            "operation not permitted in read mode: set_integer_property"
        );
    }

    #[test]
    fn test_failed_transaction_restores_movie() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = Mp4File::create(&dir.path().join("tx.mp4")).call().unwrap();
        let result: Result<()> = file.transaction(|file| {
            file.add_atom("moov", b"udta")?;
            Err(Error::invalid("abort"))
        });
        assert!(result.is_err());
        assert!(file.find_atom("moov.udta").is_none());
        assert_eq!(file.movie_integer(|m| &m.time_scale).unwrap(), 1000);
    }
}
