use std::fs::File;

use bon::bon;

use super::{writer_at, Mp4File};
use crate::{
    reader::Mp4Reader,
    track::{SampleLocation, SampleTable, SampleTableMut, Track},
    Result,
};

pub(crate) fn read_at(file: &File, offset: u64, size: usize) -> Result<Vec<u8>> {
    Ok(Mp4Reader::at(file, offset)?.read_data(size)?)
}

#[bon]
impl Mp4File {
    /// Appends a sample to a track and returns its id. Samples are buffered per track and
    /// written out a chunk at a time.
    #[builder]
    pub fn write_sample(
        &mut self,
        #[builder(start_fn)] track_id: u32,
        #[builder(start_fn)] data: &[u8],
        /// Defaults to the track's fixed sample duration.
        duration: Option<u64>,
        #[builder(default)] rendering_offset: u64,
        #[builder(default = true)] sync: bool,
    ) -> Result<u32> {
        self.protect_write("write_sample")?;
        let movie_time_scale = self.time_scale()?;
        let index = self.track_index(track_id)?;
        let (track, trak) = self.track_and_trak_mut(track_id)?;
        let (sample_id, track_duration) =
            track.append_sample(trak, data, duration, rendering_offset, sync, movie_time_scale)?;
        let full = track.chunk_is_full(trak)?;
        self.update_duration(track_duration)?;
        if full {
            self.flush_chunk(index)?;
        }
        Ok(sample_id)
    }
}

impl Mp4File {
    /// Writes the pending chunk of the track at `index` to the end of `mdat`.
    pub(crate) fn flush_chunk(&mut self, index: usize) -> Result<()> {
        let Some(chunk) = self.tracks[index].take_chunk() else {
            return Ok(());
        };
        let track_id = self.tracks[index].id();
        let mdat = self.media_index()?;
        let offset = self.write_position;
        let mut writer = writer_at(&self.file, offset)?;
        writer.write_raw(&chunk.data)?;
        self.write_position = writer.current_offset();

        Track::record_chunk(self.trak_mut(track_id)?, offset, chunk.sizes.len() as u32)?;
        self.root.children[mdat].header.size += chunk.data.len() as u64;
        tracing::trace!(
            track = track_id,
            offset,
            samples = chunk.sizes.len(),
            size = chunk.data.len(),
            "chunk written"
        );
        Ok(())
    }

    pub fn read_sample(&self, track_id: u32, sample_id: u32) -> Result<Vec<u8>> {
        let location = self
            .track(track_id)?
            .locate_sample(self.trak(track_id)?, sample_id)?;
        match location {
            SampleLocation::Pending(data) => Ok(data),
            SampleLocation::File { offset, size } => read_at(&self.file, offset, size as usize),
        }
    }

    fn sample_table(&self, track_id: u32) -> Result<SampleTable<'_>> {
        SampleTable::new(self.trak(track_id)?)
    }

    pub fn number_of_samples(&self, track_id: u32) -> Result<u32> {
        self.sample_table(track_id)?.number_of_samples()
    }

    pub fn sample_size(&self, track_id: u32, sample_id: u32) -> Result<u32> {
        self.sample_table(track_id)?.sample_size(sample_id)
    }

    pub fn max_sample_size(&self, track_id: u32) -> Result<u32> {
        self.sample_table(track_id)?.max_sample_size()
    }

    /// Start time of a sample in the track time scale.
    pub fn sample_time(&self, track_id: u32, sample_id: u32) -> Result<u64> {
        Ok(self.sample_table(track_id)?.sample_times(sample_id)?.0)
    }

    pub fn sample_duration(&self, track_id: u32, sample_id: u32) -> Result<u64> {
        Ok(self.sample_table(track_id)?.sample_times(sample_id)?.1)
    }

    pub fn sample_rendering_offset(&self, track_id: u32, sample_id: u32) -> Result<u64> {
        self.sample_table(track_id)?.rendering_offset(sample_id)
    }

    pub fn set_sample_rendering_offset(
        &mut self,
        track_id: u32,
        sample_id: u32,
        offset: u64,
    ) -> Result<()> {
        self.protect_write("set_sample_rendering_offset")?;
        SampleTableMut::new(self.trak_mut(track_id)?)?.set_rendering_offset(sample_id, offset)
    }

    pub fn is_sync_sample(&self, track_id: u32, sample_id: u32) -> Result<bool> {
        self.sample_table(track_id)?.is_sync_sample(sample_id)
    }

    /// Sample playing at `when` (track time scale), or the next sync sample from there when
    /// `want_sync` is set.
    pub fn sample_id_from_time(&self, track_id: u32, when: u64, want_sync: bool) -> Result<u32> {
        self.sample_table(track_id)?
            .sample_id_from_time(when, want_sync)
    }

    /// Cuts chunks every `samples` samples instead of by duration.
    pub fn set_track_samples_per_chunk(&mut self, track_id: u32, samples: u32) -> Result<()> {
        self.protect_write("set_track_samples_per_chunk")?;
        let index = self.track_index(track_id)?;
        self.tracks[index].set_samples_per_chunk(samples);
        Ok(())
    }

    /// Cuts chunks every `duration` track time units; 0 restores the default of one second.
    pub fn set_track_chunk_duration(&mut self, track_id: u32, duration: u64) -> Result<()> {
        self.protect_write("set_track_chunk_duration")?;
        let index = self.track_index(track_id)?;
        self.tracks[index].set_chunk_duration(duration);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_samples_are_readable() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = Mp4File::create(&dir.path().join("pending.mp4")).call().unwrap();
        let track = file
            .add_audio_track()
            .time_scale(8000)
            .sample_duration(160)
            .call()
            .unwrap();
        file.write_sample(track, b"first").call().unwrap();
        file.write_sample(track, b"second").sync(false).call().unwrap();
        assert_eq!(file.read_sample(track, 2).unwrap(), b"second");
        assert!(!file.is_sync_sample(track, 2).unwrap());
        assert_eq!(file.sample_time(track, 2).unwrap(), 160);
    }

    #[test]
    fn test_chunk_flushed_after_sample_count() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = Mp4File::create(&dir.path().join("chunks.mp4")).call().unwrap();
        let track = file.add_track("video", 90000).unwrap();
        file.set_track_samples_per_chunk(track, 2).unwrap();
        let start = file.write_position;
        for data in [b"aa", b"bb", b"cc"] {
            file.write_sample(track, data).duration(3000).call().unwrap();
        }
        let table = file.sample_table(track).unwrap();
        assert_eq!(table.number_of_chunks().unwrap(), 1);
        assert_eq!(table.chunk_offset(1).unwrap(), start);
        assert_eq!(file.write_position, start + 4);
        assert_eq!(file.read_sample(track, 2).unwrap(), b"bb");
        assert_eq!(file.read_sample(track, 3).unwrap(), b"cc");
    }

    #[test]
    fn test_sample_without_duration_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = Mp4File::create(&dir.path().join("nodur.mp4")).call().unwrap();
        let track = file.add_track("video", 90000).unwrap();
        assert!(file.write_sample(track, b"x").call().is_err());
    }
}
