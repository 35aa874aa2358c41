/*!
 * Tracks and their sample tables.
 *
 * A [`Track`] holds only what cannot be read back from its `trak` atom: the pending chunk of
 * samples not yet written, chunking settings and, for hint tracks, the RTP hint state. Everything
 * else lives in the atom tree and is reached through [`SampleTable`] and [`SampleTableMut`],
 * which wrap the track's `stbl` atom.
 */

use crate::{
    atom::{
        util::{convert_time, mp4_timestamp_now},
        FourCC,
    },
    property::{add_table_row, delete_table_row, Property},
    Atom, Error, Result,
};

pub mod hint;

pub use self::hint::HintTrack;

pub const AUDIO_TRACK_TYPE: &str = "soun";
pub const VIDEO_TRACK_TYPE: &str = "vide";
pub const HINT_TRACK_TYPE: &str = "hint";
pub const OD_TRACK_TYPE: &str = "odsm";
pub const SCENE_TRACK_TYPE: &str = "sdsm";
pub const CLOCK_TRACK_TYPE: &str = "crsm";
pub const MPEG7_TRACK_TYPE: &str = "m7sm";
pub const IPMP_TRACK_TYPE: &str = "ipsm";
pub const OCI_TRACK_TYPE: &str = "ocsm";
pub const MPEGJ_TRACK_TYPE: &str = "mjsm";

pub(crate) const STBL: &str = "mdia.minf.stbl";
pub(crate) const MDHD: &str = "mdia.mdhd";
pub(crate) const TKHD: &str = "tkhd";

/// Maps the long names accepted by track queries to handler types.
pub fn normalize_track_type(track_type: &str) -> String {
    match track_type.to_ascii_lowercase().as_str() {
        "audio" => AUDIO_TRACK_TYPE,
        "video" => VIDEO_TRACK_TYPE,
        "od" => OD_TRACK_TYPE,
        "scene" => SCENE_TRACK_TYPE,
        "clock" => CLOCK_TRACK_TYPE,
        "mpeg7" => MPEG7_TRACK_TYPE,
        "ipmp" => IPMP_TRACK_TYPE,
        "oci" => OCI_TRACK_TYPE,
        "mpegj" => MPEGJ_TRACK_TYPE,
        _ => track_type,
    }
    .to_string()
}

/// `streamType` of the decoder config descriptor for a handler type.
pub fn es_stream_type(track_type: &str) -> u64 {
    match track_type {
        OD_TRACK_TYPE => 0x01,
        CLOCK_TRACK_TYPE => 0x02,
        SCENE_TRACK_TYPE => 0x03,
        VIDEO_TRACK_TYPE => 0x04,
        AUDIO_TRACK_TYPE => 0x05,
        MPEG7_TRACK_TYPE => 0x06,
        IPMP_TRACK_TYPE => 0x07,
        OCI_TRACK_TYPE => 0x08,
        MPEGJ_TRACK_TYPE => 0x09,
        _ => 0x20,
    }
}

fn entries(atom: &Atom) -> Option<&Property> {
    atom.property("entries")
}

fn rows(atom: &Atom) -> usize {
    entries(atom).map_or(0, Property::len)
}

fn cell(atom: &Atom, column: &str, row: usize) -> Result<u64> {
    entries(atom)
        .and_then(|t| t.column(column))
        .ok_or_else(|| Error::not_found(format!("{}.entries.{column}", atom.atom_type())))?
        .integer(row)
}

fn set_cell(atom: &mut Atom, column: &str, row: usize, value: u64) -> Result<()> {
    let atom_type = atom.atom_type();
    atom.property_mut("entries")
        .and_then(|t| t.column_mut(column))
        .ok_or_else(|| Error::not_found(format!("{atom_type}.entries.{column}")))?
        .set_integer(row, value)
}

fn push_row(atom: &mut Atom, values: &[(&str, u64)]) -> Result<usize> {
    let row = add_table_row(atom.properties_mut(), "entries")?;
    for (column, value) in values {
        set_cell(atom, column, row, *value)?;
    }
    Ok(row)
}

fn clear_rows(atom: &mut Atom) -> Result<()> {
    while let Some(last) = rows(atom).checked_sub(1) {
        delete_table_row(atom.properties_mut(), "entries", last)?;
    }
    Ok(())
}

fn integer(atom: &Atom, name: &str) -> Result<u64> {
    atom.property(name)
        .ok_or_else(|| Error::not_found(format!("{}.{name}", atom.atom_type())))?
        .integer(0)
}

fn set_integer(atom: &mut Atom, name: &str, value: u64) -> Result<()> {
    let atom_type = atom.atom_type();
    atom.property_mut(name)
        .ok_or_else(|| Error::not_found(format!("{atom_type}.{name}")))?
        .set_integer(0, value)
}

fn no_sample(sample_id: u32) -> Error {
    Error::not_found(format!("sample {sample_id}"))
}

fn no_chunk(chunk_id: u32) -> Error {
    Error::not_found(format!("chunk {chunk_id}"))
}

/// Read access to a track's `stbl` atom. Sample and chunk ids are 1-based.
#[derive(Debug, Clone, Copy)]
pub struct SampleTable<'a>(&'a Atom);

impl<'a> SampleTable<'a> {
    pub fn new(trak: &'a Atom) -> Result<Self> {
        trak.find_atom(STBL)
            .map(Self)
            .ok_or_else(|| Error::not_found(format!("trak.{STBL}")))
    }

    fn table(&self, atom_type: &[u8; 4]) -> Result<&'a Atom> {
        self.0
            .child(atom_type)
            .ok_or_else(|| Error::not_found(format!("stbl.{}", FourCC::new(atom_type))))
    }

    fn chunk_offsets(&self) -> Result<&'a Atom> {
        self.table(b"stco").or_else(|_| self.table(b"co64"))
    }

    pub fn number_of_samples(&self) -> Result<u32> {
        Ok(integer(self.table(b"stsz")?, "sampleCount")? as u32)
    }

    fn check_sample(&self, sample_id: u32) -> Result<()> {
        if sample_id == 0 || sample_id > self.number_of_samples()? {
            return Err(no_sample(sample_id));
        }
        Ok(())
    }

    pub fn sample_size(&self, sample_id: u32) -> Result<u32> {
        self.check_sample(sample_id)?;
        let stsz = self.table(b"stsz")?;
        match integer(stsz, "sampleSize")? {
            0 => Ok(cell(stsz, "sampleSize", sample_id as usize - 1)? as u32),
            fixed => Ok(fixed as u32),
        }
    }

    pub fn max_sample_size(&self) -> Result<u32> {
        let stsz = self.table(b"stsz")?;
        match integer(stsz, "sampleSize")? {
            0 => (0..rows(stsz))
                .map(|row| cell(stsz, "sampleSize", row))
                .try_fold(0u64, |max, size| size.map(|s| max.max(s)))
                .map(|max| max as u32),
            fixed => Ok(fixed as u32),
        }
    }

    /// Start time and duration of a sample in the track time scale.
    pub fn sample_times(&self, sample_id: u32) -> Result<(u64, u64)> {
        self.check_sample(sample_id)?;
        let stts = self.table(b"stts")?;
        let mut first = 1u64;
        let mut elapsed = 0u64;
        for row in 0..rows(stts) {
            let count = cell(stts, "sampleCount", row)?;
            let delta = cell(stts, "sampleDelta", row)?;
            let id = u64::from(sample_id);
            if id < first + count {
                return Ok((elapsed + (id - first) * delta, delta));
            }
            first += count;
            elapsed += count * delta;
        }
        Err(no_sample(sample_id))
    }

    /// Sample playing at `when`, or the first sync sample at or after it.
    pub fn sample_id_from_time(&self, when: u64, want_sync: bool) -> Result<u32> {
        let stts = self.table(b"stts")?;
        let mut first = 1u64;
        let mut elapsed = 0u64;
        for row in 0..rows(stts) {
            let count = cell(stts, "sampleCount", row)?;
            let delta = cell(stts, "sampleDelta", row)?;
            if when < elapsed + count * delta {
                let id = first + (when - elapsed).checked_div(delta).unwrap_or(0);
                let id = id as u32;
                return if want_sync {
                    self.next_sync_sample(id)
                } else {
                    Ok(id)
                };
            }
            first += count;
            elapsed += count * delta;
        }
        Err(Error::not_found(format!("sample at time {when}")))
    }

    fn next_sync_sample(&self, from: u32) -> Result<u32> {
        let Ok(stss) = self.table(b"stss") else {
            return Ok(from);
        };
        for row in 0..rows(stss) {
            let number = cell(stss, "sampleNumber", row)? as u32;
            if number >= from {
                return Ok(number);
            }
        }
        Err(Error::not_found(format!("sync sample after {from}")))
    }

    /// Every sample is a sync sample when the track has no `stss`.
    pub fn is_sync_sample(&self, sample_id: u32) -> Result<bool> {
        self.check_sample(sample_id)?;
        let Ok(stss) = self.table(b"stss") else {
            return Ok(true);
        };
        for row in 0..rows(stss) {
            let number = cell(stss, "sampleNumber", row)?;
            if number >= u64::from(sample_id) {
                return Ok(number == u64::from(sample_id));
            }
        }
        Ok(false)
    }

    pub fn rendering_offset(&self, sample_id: u32) -> Result<u64> {
        self.check_sample(sample_id)?;
        let Ok(ctts) = self.table(b"ctts") else {
            return Ok(0);
        };
        let mut first = 1u64;
        for row in 0..rows(ctts) {
            let count = cell(ctts, "sampleCount", row)?;
            if u64::from(sample_id) < first + count {
                return cell(ctts, "sampleOffset", row);
            }
            first += count;
        }
        Ok(0)
    }

    /// Offsets of every sample, with zero for samples past the end of `ctts`.
    fn rendering_offsets(&self) -> Result<Vec<u64>> {
        let samples = self.number_of_samples()? as usize;
        let mut offsets = Vec::with_capacity(samples);
        if let Ok(ctts) = self.table(b"ctts") {
            for row in 0..rows(ctts) {
                let count = cell(ctts, "sampleCount", row)? as usize;
                let offset = cell(ctts, "sampleOffset", row)?;
                offsets.extend(std::iter::repeat_n(offset, count));
            }
        }
        offsets.resize(samples, 0);
        Ok(offsets)
    }

    pub fn number_of_chunks(&self) -> Result<u32> {
        Ok(rows(self.chunk_offsets()?) as u32)
    }

    pub fn chunk_offset(&self, chunk_id: u32) -> Result<u64> {
        if chunk_id == 0 {
            return Err(no_chunk(chunk_id));
        }
        cell(self.chunk_offsets()?, "chunkOffset", chunk_id as usize - 1)
            .map_err(|_| no_chunk(chunk_id))
    }

    /// Last `stsc` row satisfying `pred`.
    fn stsc_row(&self, pred: impl Fn(u64, u64) -> bool) -> Result<(u64, u64, u64)> {
        let stsc = self.table(b"stsc")?;
        let mut found = None;
        for row in 0..rows(stsc) {
            let first_chunk = cell(stsc, "firstChunk", row)?;
            let first_sample = cell(stsc, "firstSample", row)?;
            if !pred(first_chunk, first_sample) {
                break;
            }
            found = Some(row);
        }
        let row = found.ok_or_else(|| Error::malformed("stsc does not cover the sample"))?;
        let samples_per_chunk = cell(stsc, "samplesPerChunk", row)?;
        if samples_per_chunk == 0 {
            return Err(Error::malformed("stsc entry with zero samples per chunk"));
        }
        Ok((
            cell(stsc, "firstChunk", row)?,
            samples_per_chunk,
            cell(stsc, "firstSample", row)?,
        ))
    }

    /// Chunk holding a sample and the first sample of that chunk.
    pub fn sample_chunk(&self, sample_id: u32) -> Result<(u32, u32)> {
        self.check_sample(sample_id)?;
        let id = u64::from(sample_id);
        let (first_chunk, per_chunk, first_sample) = self.stsc_row(|_, first| first <= id)?;
        let chunk = first_chunk + (id - first_sample) / per_chunk;
        let first = first_sample + (chunk - first_chunk) * per_chunk;
        Ok((chunk as u32, first as u32))
    }

    /// First sample and number of samples in a chunk.
    pub fn chunk_samples(&self, chunk_id: u32) -> Result<(u32, u32)> {
        if chunk_id == 0 || chunk_id > self.number_of_chunks()? {
            return Err(no_chunk(chunk_id));
        }
        let chunk = u64::from(chunk_id);
        let (first_chunk, per_chunk, first_sample) = self.stsc_row(|first, _| first <= chunk)?;
        let first = first_sample + (chunk - first_chunk) * per_chunk;
        let available = (u64::from(self.number_of_samples()?) + 1).saturating_sub(first);
        Ok((first as u32, per_chunk.min(available) as u32))
    }

    /// Absolute file offset of a sample.
    pub fn sample_offset(&self, sample_id: u32) -> Result<u64> {
        let (chunk, first) = self.sample_chunk(sample_id)?;
        let mut offset = self.chunk_offset(chunk)?;
        for id in first..sample_id {
            offset += u64::from(self.sample_size(id)?);
        }
        Ok(offset)
    }

    pub fn chunk_size(&self, chunk_id: u32) -> Result<u64> {
        let (first, count) = self.chunk_samples(chunk_id)?;
        (first..first + count).try_fold(0u64, |total, id| {
            Ok(total + u64::from(self.sample_size(id)?))
        })
    }

    /// Start time of the first sample of a chunk, in the track time scale.
    pub fn chunk_time(&self, chunk_id: u32) -> Result<u64> {
        let (first, _) = self.chunk_samples(chunk_id)?;
        Ok(self.sample_times(first)?.0)
    }

    /// The single `stts` delta, if every sample has the same duration.
    pub fn fixed_sample_duration(&self) -> Result<Option<u64>> {
        let stts = self.table(b"stts")?;
        match rows(stts) {
            1 => Ok(Some(cell(stts, "sampleDelta", 0)?)),
            _ => Ok(None),
        }
    }
}

/// Write access to a track's `stbl` atom.
#[derive(Debug)]
pub struct SampleTableMut<'a>(&'a mut Atom);

impl<'a> SampleTableMut<'a> {
    pub fn new(trak: &'a mut Atom) -> Result<Self> {
        trak.find_atom_mut(STBL)
            .map(Self)
            .ok_or_else(|| Error::not_found(format!("trak.{STBL}")))
    }

    pub fn view(&self) -> SampleTable<'_> {
        SampleTable(self.0)
    }

    fn table_mut(&mut self, atom_type: &[u8; 4]) -> Result<&mut Atom> {
        self.0
            .child_mut(atom_type)
            .ok_or_else(|| Error::not_found(format!("stbl.{}", FourCC::new(atom_type))))
    }

    fn chunk_offsets_mut(&mut self) -> Result<&mut Atom> {
        let atom_type = if self.0.child(b"stco").is_some() {
            b"stco"
        } else {
            b"co64"
        };
        self.table_mut(atom_type)
    }

    /// Generates a missing optional table, placed after `after` when that exists.
    fn ensure_table(&mut self, atom_type: &[u8; 4], after: &[u8; 4]) -> &mut Atom {
        let index = self.0.child_position(after).map(|i| i + 1);
        self.0
            .find_or_insert_child(atom_type)
            .maybe_insert_index(index)
            .call()
    }

    pub(crate) fn update_sample_sizes(&mut self, sample_id: u32, size: u32) -> Result<()> {
        let stsz = self.table_mut(b"stsz")?;
        let count = integer(stsz, "sampleCount")?;
        let fixed = integer(stsz, "sampleSize")?;
        if sample_id == 1 && count == 0 {
            set_integer(stsz, "sampleSize", u64::from(size))?;
        } else if fixed != 0 && u64::from(size) != fixed {
            // sizes diverged; spell out every earlier sample
            set_integer(stsz, "sampleSize", 0)?;
            for _ in 0..count {
                push_row(stsz, &[("sampleSize", fixed)])?;
            }
        }
        if integer(stsz, "sampleSize")? == 0 {
            push_row(stsz, &[("sampleSize", u64::from(size))])?;
        }
        set_integer(stsz, "sampleCount", count + 1)
    }

    pub(crate) fn update_sample_times(&mut self, duration: u64) -> Result<()> {
        let stts = self.table_mut(b"stts")?;
        if let Some(last) = rows(stts).checked_sub(1) {
            if cell(stts, "sampleDelta", last)? == duration {
                let count = cell(stts, "sampleCount", last)?;
                return set_cell(stts, "sampleCount", last, count + 1);
            }
        }
        push_row(stts, &[("sampleCount", 1), ("sampleDelta", duration)]).map(|_| ())
    }

    pub(crate) fn update_rendering_offsets(&mut self, sample_id: u32, offset: u64) -> Result<()> {
        if self.0.child(b"ctts").is_none() {
            if offset == 0 {
                return Ok(());
            }
            let ctts = self.ensure_table(b"ctts", b"stts");
            if sample_id > 1 {
                push_row(
                    ctts,
                    &[("sampleCount", u64::from(sample_id - 1)), ("sampleOffset", 0)],
                )?;
            }
        }
        let ctts = self.table_mut(b"ctts")?;
        if let Some(last) = rows(ctts).checked_sub(1) {
            if cell(ctts, "sampleOffset", last)? == offset {
                let count = cell(ctts, "sampleCount", last)?;
                return set_cell(ctts, "sampleCount", last, count + 1);
            }
        }
        push_row(ctts, &[("sampleCount", 1), ("sampleOffset", offset)]).map(|_| ())
    }

    /// Rewrites `ctts` so that one sample gets a new offset.
    pub fn set_rendering_offset(&mut self, sample_id: u32, offset: u64) -> Result<()> {
        let table = self.view();
        table.check_sample(sample_id)?;
        let mut offsets = table.rendering_offsets()?;
        offsets[sample_id as usize - 1] = offset;

        let ctts = self.ensure_table(b"ctts", b"stts");
        clear_rows(ctts)?;
        let mut runs: Vec<(u64, u64)> = Vec::new();
        for offset in offsets {
            match runs.last_mut() {
                Some((count, last)) if *last == offset => *count += 1,
                _ => runs.push((1, offset)),
            }
        }
        for (count, offset) in runs {
            push_row(ctts, &[("sampleCount", count), ("sampleOffset", offset)])?;
        }
        Ok(())
    }

    /// `stss` only exists once a sample is not a sync sample.
    pub(crate) fn update_sync_samples(&mut self, sample_id: u32, sync: bool) -> Result<()> {
        if let Some(stss) = self.0.child_mut(b"stss") {
            if sync {
                push_row(stss, &[("sampleNumber", u64::from(sample_id))])?;
            }
            return Ok(());
        }
        if !sync {
            let stss = self.ensure_table(b"stss", b"stsz");
            for id in 1..sample_id {
                push_row(stss, &[("sampleNumber", u64::from(id))])?;
            }
        }
        Ok(())
    }

    pub(crate) fn update_sample_to_chunk(
        &mut self,
        chunk_id: u32,
        samples: u32,
        first_sample: u32,
    ) -> Result<()> {
        let stsc = self.table_mut(b"stsc")?;
        if let Some(last) = rows(stsc).checked_sub(1) {
            if cell(stsc, "samplesPerChunk", last)? == u64::from(samples)
                && cell(stsc, "sampleDescriptionIndex", last)? == 1
            {
                return Ok(());
            }
        }
        push_row(
            stsc,
            &[
                ("firstChunk", u64::from(chunk_id)),
                ("samplesPerChunk", u64::from(samples)),
                ("sampleDescriptionIndex", 1),
                ("firstSample", u64::from(first_sample)),
            ],
        )
        .map(|_| ())
    }

    pub(crate) fn update_chunk_offsets(&mut self, offset: u64) -> Result<()> {
        if offset > u64::from(u32::MAX) {
            self.promote_chunk_offsets()?;
        }
        push_row(self.chunk_offsets_mut()?, &[("chunkOffset", offset)]).map(|_| ())
    }

    pub fn set_chunk_offset(&mut self, chunk_id: u32, offset: u64) -> Result<()> {
        if chunk_id == 0 {
            return Err(no_chunk(chunk_id));
        }
        if offset > u64::from(u32::MAX) {
            self.promote_chunk_offsets()?;
        }
        set_cell(self.chunk_offsets_mut()?, "chunkOffset", chunk_id as usize - 1, offset)
            .map_err(|_| no_chunk(chunk_id))
    }

    /// Replaces `stco` with an equivalent `co64`. No-op when the track already uses `co64`.
    pub fn promote_chunk_offsets(&mut self) -> Result<()> {
        let Some(index) = self.0.child_position(b"stco") else {
            return Ok(());
        };
        let stco = self.0.delete_child(index)?;
        let mut co64 = Atom::generate(FourCC::new(b"co64"), FourCC::new(b"stbl"));
        for row in 0..rows(&stco) {
            push_row(&mut co64, &[("chunkOffset", cell(&stco, "chunkOffset", row)?)])?;
        }
        tracing::debug!("promoted stco with {} entries to co64", rows(&stco));
        self.0.insert_child(index, co64);
        Ok(())
    }
}

/// Samples appended since the last chunk was written.
#[derive(Debug, Clone, Default)]
pub(crate) struct PendingChunk {
    pub data: Vec<u8>,
    pub sizes: Vec<u32>,
    pub duration: u64,
}

/// Where the bytes of a sample can be found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SampleLocation {
    Pending(Vec<u8>),
    File { offset: u64, size: u32 },
}

#[derive(Debug, Clone)]
pub struct Track {
    id: u32,
    track_type: String,
    /// Present for `hint` tracks.
    pub(crate) hint: Option<HintTrack>,
    pending: PendingChunk,
    /// Samples per chunk; 0 means chunks are cut by duration.
    samples_per_chunk: u32,
    /// Chunk duration in the track time scale; 0 means one second.
    chunk_duration: u64,
    fixed_sample_duration: Option<u64>,
}

impl Track {
    /// Derives a track from a parsed or freshly built `trak` atom.
    pub(crate) fn from_trak(trak: &Atom) -> Result<Self> {
        let id = trak.integer_property("tkhd.trackId")? as u32;
        let track_type = normalize_track_type(&trak.string_property("mdia.hdlr.handlerType")?);
        let hint = (track_type == HINT_TRACK_TYPE).then(HintTrack::default);
        Ok(Self {
            id,
            track_type,
            hint,
            pending: PendingChunk::default(),
            samples_per_chunk: 0,
            chunk_duration: 0,
            fixed_sample_duration: None,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn track_type(&self) -> &str {
        &self.track_type
    }

    pub fn is_hint(&self) -> bool {
        self.hint.is_some()
    }

    pub(crate) fn time_scale(trak: &Atom) -> Result<u32> {
        Ok(trak.integer_property(&format!("{MDHD}.timeScale"))? as u32)
    }

    pub(crate) fn duration(trak: &Atom) -> Result<u64> {
        trak.integer_property(&format!("{MDHD}.duration"))
    }

    pub(crate) fn set_samples_per_chunk(&mut self, samples: u32) {
        self.samples_per_chunk = samples;
    }

    pub(crate) fn set_chunk_duration(&mut self, duration: u64) {
        self.chunk_duration = duration;
    }

    pub(crate) fn set_fixed_sample_duration(&mut self, duration: u64) {
        self.fixed_sample_duration = Some(duration);
    }

    pub(crate) fn fixed_sample_duration(&self, trak: &Atom) -> Result<u64> {
        let table = SampleTable::new(trak)?;
        if table.number_of_samples()? == 0 {
            return Ok(self.fixed_sample_duration.unwrap_or(0));
        }
        Ok(table.fixed_sample_duration()?.unwrap_or(0))
    }

    /// Appends a sample to the pending chunk and records it in the sample tables. Returns the
    /// new sample id and the track duration in `movie_time_scale`.
    pub(crate) fn append_sample(
        &mut self,
        trak: &mut Atom,
        data: &[u8],
        duration: Option<u64>,
        rendering_offset: u64,
        sync: bool,
        movie_time_scale: u32,
    ) -> Result<(u32, u64)> {
        let duration = duration.or(self.fixed_sample_duration).ok_or_else(|| {
            Error::invalid(format!(
                "track {} has no fixed sample duration; one must be given",
                self.id
            ))
        })?;
        let size = u32::try_from(data.len())
            .map_err(|_| Error::invalid(format!("sample of {} bytes", data.len())))?;

        let mut table = SampleTableMut::new(trak)?;
        let sample_id = table.view().number_of_samples()? + 1;
        table.update_sample_sizes(sample_id, size)?;
        table.update_sample_times(duration)?;
        table.update_rendering_offsets(sample_id, rendering_offset)?;
        table.update_sync_samples(sample_id, sync)?;

        self.pending.data.extend_from_slice(data);
        self.pending.sizes.push(size);
        self.pending.duration += duration;

        let movie_duration = Self::update_durations(trak, duration, movie_time_scale)?;
        tracing::trace!(track = self.id, sample_id, size, duration, "sample appended");
        Ok((sample_id, movie_duration))
    }

    fn update_durations(trak: &mut Atom, duration: u64, movie_time_scale: u32) -> Result<u64> {
        let time_scale = Self::time_scale(trak)?;
        let media_duration = Self::duration(trak)? + duration;
        trak.set_integer_property(&format!("{MDHD}.duration"), media_duration)?;
        let track_duration = convert_time(media_duration, time_scale, movie_time_scale)?;
        trak.set_integer_property(&format!("{TKHD}.duration"), track_duration)?;

        let now = mp4_timestamp_now();
        trak.set_integer_property(&format!("{MDHD}.modificationTime"), now)?;
        trak.set_integer_property(&format!("{TKHD}.modificationTime"), now)?;
        Ok(track_duration)
    }

    pub(crate) fn chunk_is_full(&self, trak: &Atom) -> Result<bool> {
        if self.pending.sizes.is_empty() {
            return Ok(false);
        }
        if self.samples_per_chunk > 0 {
            return Ok(self.pending.sizes.len() >= self.samples_per_chunk as usize);
        }
        let limit = match self.chunk_duration {
            0 => u64::from(Self::time_scale(trak)?),
            duration => duration,
        };
        Ok(self.pending.duration >= limit)
    }

    pub(crate) fn take_chunk(&mut self) -> Option<PendingChunk> {
        if self.pending.sizes.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.pending))
    }

    /// Records a chunk of `samples` samples written at `offset`.
    pub(crate) fn record_chunk(trak: &mut Atom, offset: u64, samples: u32) -> Result<()> {
        let mut table = SampleTableMut::new(trak)?;
        let chunk_id = table.view().number_of_chunks()? + 1;
        let first_sample = table.view().number_of_samples()? + 1 - samples;
        table.update_sample_to_chunk(chunk_id, samples, first_sample)?;
        table.update_chunk_offsets(offset)
    }

    pub(crate) fn locate_sample(&self, trak: &Atom, sample_id: u32) -> Result<SampleLocation> {
        let table = SampleTable::new(trak)?;
        let samples = table.number_of_samples()?;
        let pending = self.pending.sizes.len() as u32;
        let first_pending = samples + 1 - pending;
        if pending > 0 && sample_id >= first_pending && sample_id <= samples {
            let index = (sample_id - first_pending) as usize;
            let start: usize = self.pending.sizes[..index].iter().map(|s| *s as usize).sum();
            let end = start + self.pending.sizes[index] as usize;
            return Ok(SampleLocation::Pending(self.pending.data[start..end].to_vec()));
        }
        Ok(SampleLocation::File {
            offset: table.sample_offset(sample_id)?,
            size: table.sample_size(sample_id)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::{MOOV, TRAK};

    fn trak() -> Atom {
        let mut trak = Atom::generate(FourCC::new(TRAK), FourCC::new(MOOV));
        trak.set_integer_property("tkhd.trackId", 1).unwrap();
        trak.set_string_property("mdia.hdlr.handlerType", "soun").unwrap();
        trak.set_integer_property("mdia.mdhd.timeScale", 8000).unwrap();
        trak
    }

    #[test]
    fn test_sizes_stay_fixed_until_they_differ() {
        let mut trak = trak();
        let mut track = Track::from_trak(&trak).unwrap();
        track.set_fixed_sample_duration(160);
        for len in [20, 20, 30] {
            track
                .append_sample(&mut trak, &vec![0; len], None, 0, true, 1000)
                .unwrap();
        }
        let stsz = trak.find_atom("mdia.minf.stbl.stsz").unwrap();
        assert_eq!(stsz.property("sampleSize").unwrap().integer(0).unwrap(), 0);
        assert_eq!(stsz.property("sampleCount").unwrap().integer(0).unwrap(), 3);
        let table = SampleTable::new(&trak).unwrap();
        assert_eq!(table.sample_size(1).unwrap(), 20);
        assert_eq!(table.sample_size(3).unwrap(), 30);
        assert_eq!(table.max_sample_size().unwrap(), 30);
        assert!(table.sample_size(4).is_err());
    }

    #[test]
    fn test_stts_runs_and_times() {
        let mut trak = trak();
        let mut track = Track::from_trak(&trak).unwrap();
        for duration in [160, 160, 80] {
            track
                .append_sample(&mut trak, &[1], Some(duration), 0, true, 1000)
                .unwrap();
        }
        let table = SampleTable::new(&trak).unwrap();
        assert_eq!(table.sample_times(2).unwrap(), (160, 160));
        assert_eq!(table.sample_times(3).unwrap(), (320, 80));
        assert_eq!(table.sample_id_from_time(330, false).unwrap(), 3);
        assert_eq!(table.fixed_sample_duration().unwrap(), None);
        assert_eq!(Track::duration(&trak).unwrap(), 400);
        assert_eq!(trak.integer_property("tkhd.duration").unwrap(), 50);
    }

    #[test]
    fn test_stss_created_on_first_non_sync_sample() {
        let mut trak = trak();
        let mut track = Track::from_trak(&trak).unwrap();
        for sync in [true, true, false, true] {
            track
                .append_sample(&mut trak, &[1], Some(1), 0, sync, 1000)
                .unwrap();
        }
        let table = SampleTable::new(&trak).unwrap();
        let flags: Vec<bool> = (1..=4).map(|id| table.is_sync_sample(id).unwrap()).collect();
        assert_eq!(flags, vec![true, true, false, true]);
        assert_eq!(table.sample_id_from_time(2, true).unwrap(), 4);
    }

    #[test]
    fn test_rendering_offsets() {
        let mut trak = trak();
        let mut track = Track::from_trak(&trak).unwrap();
        for offset in [0, 0, 5, 5] {
            track
                .append_sample(&mut trak, &[1], Some(1), offset, true, 1000)
                .unwrap();
        }
        let mut table = SampleTableMut::new(&mut trak).unwrap();
        assert_eq!(table.view().rendering_offset(2).unwrap(), 0);
        assert_eq!(table.view().rendering_offset(3).unwrap(), 5);
        table.set_rendering_offset(4, 9).unwrap();
        let offsets: Vec<u64> = (1..=4)
            .map(|id| table.view().rendering_offset(id).unwrap())
            .collect();
        assert_eq!(offsets, vec![0, 0, 5, 9]);
        let ctts = trak.find_atom("mdia.minf.stbl.ctts").unwrap();
        assert_eq!(ctts.property("entryCount").unwrap().integer(0).unwrap(), 3);
    }

    #[test]
    fn test_chunks_and_pending_samples() {
        let mut trak = trak();
        let mut track = Track::from_trak(&trak).unwrap();
        track.set_samples_per_chunk(2);
        for byte in 1..=3u8 {
            track
                .append_sample(&mut trak, &[byte; 4], Some(10), 0, true, 1000)
                .unwrap();
            if track.chunk_is_full(&trak).unwrap() {
                let chunk = track.take_chunk().unwrap();
                Track::record_chunk(&mut trak, 1000, chunk.sizes.len() as u32).unwrap();
            }
        }
        let table = SampleTable::new(&trak).unwrap();
        assert_eq!(table.number_of_chunks().unwrap(), 1);
        assert_eq!(table.sample_offset(2).unwrap(), 1004);
        assert_eq!(table.chunk_samples(1).unwrap(), (1, 2));
        assert_eq!(table.chunk_size(1).unwrap(), 8);
        assert_eq!(
            track.locate_sample(&trak, 3).unwrap(),
            SampleLocation::Pending(vec![3; 4])
        );
        assert_eq!(
            track.locate_sample(&trak, 1).unwrap(),
            SampleLocation::File { offset: 1000, size: 4 }
        );
    }

    #[test]
    fn test_chunk_offsets_promote_to_co64() {
        let mut trak = trak();
        let mut table = SampleTableMut::new(&mut trak).unwrap();
        table.update_chunk_offsets(100).unwrap();
        table.update_chunk_offsets(u64::from(u32::MAX) + 10).unwrap();
        assert_eq!(table.view().chunk_offset(1).unwrap(), 100);
        assert_eq!(
            table.view().chunk_offset(2).unwrap(),
            u64::from(u32::MAX) + 10
        );
        assert!(trak.find_atom("mdia.minf.stbl.co64").is_some());
        assert!(trak.find_atom("mdia.minf.stbl.stco").is_none());
    }

    #[test]
    fn test_normalize_and_stream_types() {
        assert_eq!(normalize_track_type("audio"), "soun");
        assert_eq!(normalize_track_type("vide"), "vide");
        assert_eq!(es_stream_type(&normalize_track_type("od")), 1);
        assert_eq!(es_stream_type("text"), 0x20);
    }
}
