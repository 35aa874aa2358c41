use bon::bon;

use super::Mp4File;
use crate::{
    atom::{util::convert_time, MOOV, STSD, TRAK},
    descriptor::{DEC_SPECIFIC_TAG, ES_ID_INC_TAG},
    property::{add_table_row, delete_table_row},
    track::{
        es_stream_type, normalize_track_type, SampleTableMut, Track, AUDIO_TRACK_TYPE,
        HINT_TRACK_TYPE, MDHD, OD_TRACK_TYPE, SCENE_TRACK_TYPE, STBL, VIDEO_TRACK_TYPE,
    },
    Atom, Error, FourCC, Result,
};

const MAX_TRACK_ID: u64 = 0xFFFF;
const SESSION_SDP: &str = "moov.udta.hnti.rtp .sdpText";
/// Object type of the systems streams (ISO/IEC 14496-1 v1).
const SYSTEMS_OBJECT_TYPE: u64 = 0x01;
const ES_CONFIG: &str = "mdia.minf.stbl.stsd.*[0].esds.decConfigDescr";

fn reference_ids(atom: &Atom) -> Vec<u64> {
    atom.property("entries")
        .and_then(|entries| entries.column("trackId"))
        .map(|column| (0..column.len()).filter_map(|i| column.integer(i).ok()).collect())
        .unwrap_or_default()
}

/// Adds `entry_type` to the track's `stsd` and bumps its entry count.
fn add_sample_entry<'t>(trak: &'t mut Atom, entry_type: &[u8; 4]) -> Result<&'t mut Atom> {
    let stsd = trak
        .find_atom_mut(&format!("{STBL}.stsd"))
        .ok_or_else(|| Error::not_found(format!("{STBL}.stsd")))?;
    stsd.property_mut("entryCount")
        .ok_or_else(|| Error::not_found("stsd.entryCount"))?
        .increment(0, 1)?;
    Ok(stsd.add_child(Atom::generate(FourCC::new(entry_type), FourCC::new(STSD))))
}

/// Puts the media header `header_type` first in `minf`.
fn insert_media_header(trak: &mut Atom, header_type: &[u8; 4]) -> Result<()> {
    let minf = trak
        .find_atom_mut("mdia.minf")
        .ok_or_else(|| Error::not_found("mdia.minf"))?;
    minf.find_or_insert_child(header_type)
        .insert_index(0)
        .call();
    Ok(())
}

fn set_es_fields(entry: &mut Atom, track_id: u32, object_type: u64, stream_type: u64) -> Result<()> {
    entry.set_integer_property("esds.ESID", u64::from(track_id))?;
    entry.set_integer_property("esds.decConfigDescr.objectTypeId", object_type)?;
    entry.set_integer_property("esds.decConfigDescr.streamType", stream_type)
}

#[bon]
impl Mp4File {
    fn alloc_track_id(&mut self) -> Result<u32> {
        let next = self.integer_property("moov.mvhd.nextTrackId")?;
        if next <= MAX_TRACK_ID && next > 0 {
            self.root
                .set_integer_property("moov.mvhd.nextTrackId", next + 1)?;
            return Ok(next as u32);
        }
        (1..=MAX_TRACK_ID as u32)
            .find(|id| !self.trak_ids.contains(id))
            .ok_or_else(|| Error::exhausted("no track id left"))
    }

    /// Adds an empty track of `track_type` and returns its id.
    pub fn add_track(&mut self, track_type: &str, time_scale: u32) -> Result<u32> {
        self.protect_write("add_track")?;
        self.transaction(|file| file.add_track_unchecked(track_type, time_scale))
    }

    fn add_track_unchecked(&mut self, track_type: &str, time_scale: u32) -> Result<u32> {
        let track_type = normalize_track_type(track_type);
        let id = self.alloc_track_id()?;
        let use_64bit = self.use_64bit;

        let moov = self
            .root
            .child_mut(MOOV)
            .ok_or_else(|| Error::not_found("moov"))?;
        let trak = moov.add_child(Atom::generate(FourCC::new(TRAK), FourCC::new(MOOV)));
        trak.set_integer_property("tkhd.trackId", u64::from(id))?;
        trak.set_string_property("mdia.hdlr.handlerType", &track_type)?;
        trak.set_integer_property(&format!("{MDHD}.timeScale"), u64::from(time_scale.max(1)))?;
        if track_type != HINT_TRACK_TYPE {
            trak.set_integer_property("tkhd.flags", 1)?;
        }
        let dref = trak
            .find_atom_mut("mdia.minf.dinf.dref")
            .ok_or_else(|| Error::not_found("mdia.minf.dinf.dref"))?;
        dref.property_mut("entryCount")
            .ok_or_else(|| Error::not_found("dref.entryCount"))?
            .increment(0, 1)?;
        dref.add_child(Atom::generate(FourCC::new(b"url "), FourCC::new(b"dref")))
            .set_integer_property("flags", 1)?;
        if use_64bit {
            SampleTableMut::new(trak)?.promote_chunk_offsets()?;
        }

        let track = Track::from_trak(trak)?;
        self.trak_ids.push(id);
        self.tracks.push(track);
        tracing::debug!(track = id, track_type = %track_type, time_scale, "track added");
        Ok(id)
    }

    /// Adds a track for an MPEG-4 systems stream, e.g. `od` or `scene`.
    pub fn add_systems_track(&mut self, track_type: &str) -> Result<u32> {
        self.protect_write("add_systems_track")?;
        self.transaction(|file| file.add_systems_track_unchecked(track_type))
    }

    fn add_systems_track_unchecked(&mut self, track_type: &str) -> Result<u32> {
        let id = self.add_track_unchecked(track_type, 1000)?;
        let track_type = normalize_track_type(track_type);
        let trak = self.trak_mut(id)?;
        insert_media_header(trak, b"nmhd")?;
        let entry = add_sample_entry(trak, b"mp4s")?;
        set_es_fields(entry, id, SYSTEMS_OBJECT_TYPE, es_stream_type(&track_type))?;
        Ok(id)
    }

    /// Adds the object descriptor track. A movie has at most one.
    pub fn add_od_track(&mut self) -> Result<u32> {
        self.protect_write("add_od_track")?;
        if let Some(id) = self.od_track_id {
            return Err(Error::invalid(format!("object descriptor track {id} already exists")));
        }
        self.transaction(|file| {
            let id = file.add_systems_track_unchecked(OD_TRACK_TYPE)?;
            file.add_track_to_iod(id)?;
            file.trak_mut(id)?
                .find_or_insert_child(b"tref")
                .call()
                .find_or_insert_child(b"mpod")
                .call();
            file.od_track_id = Some(id);
            Ok(id)
        })
    }

    pub fn add_scene_track(&mut self) -> Result<u32> {
        self.protect_write("add_scene_track")?;
        self.transaction(|file| {
            let id = file.add_systems_track_unchecked(SCENE_TRACK_TYPE)?;
            file.add_track_to_iod(id)?;
            file.add_track_to_od(id)?;
            Ok(id)
        })
    }

    #[builder]
    pub fn add_audio_track(
        &mut self,
        time_scale: u32,
        /// Duration of every sample in `time_scale` units.
        sample_duration: u64,
        /// MPEG-4 object type of the audio.
        #[builder(default = 0x40)]
        audio_type: u8,
    ) -> Result<u32> {
        self.protect_write("add_audio_track")?;
        self.transaction(|file| {
            let id = file.add_track_unchecked(AUDIO_TRACK_TYPE, time_scale)?;
            file.add_track_to_od(id)?;
            let trak = file.trak_mut(id)?;
            trak.set_float_property("tkhd.volume", 1.0)?;
            insert_media_header(trak, b"smhd")?;
            let entry = add_sample_entry(trak, b"mp4a")?;
            entry.set_integer_property("timeScale", u64::from(time_scale))?;
            set_es_fields(entry, id, u64::from(audio_type), es_stream_type(AUDIO_TRACK_TYPE))?;
            let index = file.track_index(id)?;
            file.tracks[index].set_fixed_sample_duration(sample_duration);
            Ok(id)
        })
    }

    #[builder]
    pub fn add_video_track(
        &mut self,
        time_scale: u32,
        /// Duration of every sample in `time_scale` units.
        sample_duration: u64,
        width: u16,
        height: u16,
        #[builder(default = 0x20)]
        video_type: u8,
    ) -> Result<u32> {
        self.protect_write("add_video_track")?;
        self.transaction(|file| {
            let id = file.add_track_unchecked(VIDEO_TRACK_TYPE, time_scale)?;
            file.add_track_to_od(id)?;
            let trak = file.trak_mut(id)?;
            trak.set_float_property("tkhd.width", f32::from(width))?;
            trak.set_float_property("tkhd.height", f32::from(height))?;
            insert_media_header(trak, b"vmhd")?;
            let entry = add_sample_entry(trak, b"mp4v")?;
            entry.set_integer_property("width", u64::from(width))?;
            entry.set_integer_property("height", u64::from(height))?;
            set_es_fields(entry, id, u64::from(video_type), es_stream_type(VIDEO_TRACK_TYPE))?;
            let index = file.track_index(id)?;
            file.tracks[index].set_fixed_sample_duration(sample_duration);
            Ok(id)
        })
    }

    /// Adds an RTP hint track for the media track `ref_track_id`.
    pub fn add_hint_track(&mut self, ref_track_id: u32) -> Result<u32> {
        self.protect_write("add_hint_track")?;
        let time_scale = self.track_time_scale(ref_track_id)?;
        self.transaction(|file| {
            let id = file.add_track_unchecked(HINT_TRACK_TYPE, time_scale)?;
            let trak = file.trak_mut(id)?;
            insert_media_header(trak, b"hmhd")?;
            let entry = add_sample_entry(trak, b"rtp ")?;
            entry.set_integer_property("tims.timeScale", u64::from(time_scale))?;
            trak.find_or_insert_child(b"tref")
                .call()
                .find_or_insert_child(b"hint")
                .call();
            let udta = trak.find_or_insert_child(b"udta").call();
            udta.find_or_insert_child(b"hnti")
                .call()
                .find_or_insert_child(b"sdp ")
                .call();
            udta.find_or_insert_child(b"hinf").call();

            let tref = file.track_path(id, "tref.hint")?;
            file.add_track_reference(&tref, ref_track_id)?;
            Ok(id)
        })
    }

    pub fn delete_track(&mut self, track_id: u32) -> Result<()> {
        self.protect_write("delete_track")?;
        let trak_index = self.trak_index(track_id)?;
        self.transaction(|file| {
            file.remove_track_from_iod(track_id)?;
            file.remove_track_from_od(track_id)?;
            if file.od_track_id == Some(track_id) {
                file.od_track_id = None;
            }
            let moov = file
                .root
                .child_mut(MOOV)
                .ok_or_else(|| Error::not_found("moov"))?;
            let child = moov
                .children()
                .iter()
                .enumerate()
                .filter(|(_, atom)| atom.atom_type() == TRAK)
                .nth(trak_index)
                .map(|(i, _)| i)
                .ok_or_else(|| Error::not_found(format!("moov.trak[{trak_index}]")))?;
            moov.delete_child(child)?;
            file.trak_ids.remove(trak_index);
            if let Ok(index) = file.track_index(track_id) {
                file.tracks.remove(index);
            }
            file.cache_handles();
            tracing::debug!(track = track_id, "track deleted");
            Ok(())
        })
    }
}

// IOD and OD registration
impl Mp4File {
    fn add_track_to_iod(&mut self, track_id: u32) -> Result<()> {
        let es_ids = self
            .root
            .find_property_mut("moov.iods.esIds")
            .ok_or_else(|| Error::not_found("moov.iods.esIds"))?;
        es_ids
            .add_descriptor(ES_ID_INC_TAG)?
            .property_mut("id")
            .ok_or_else(|| Error::not_found("moov.iods.esIds.id"))?
            .set_integer(0, u64::from(track_id))
    }

    fn remove_track_from_iod(&mut self, track_id: u32) -> Result<()> {
        let Some(es_ids) = self.root.find_property_mut("moov.iods.esIds") else {
            return Ok(());
        };
        let matches: Vec<usize> = es_ids
            .descriptors()
            .unwrap_or_default()
            .iter()
            .enumerate()
            .filter(|(_, d)| {
                d.tag() == ES_ID_INC_TAG
                    && d.property("id").and_then(|p| p.integer(0).ok()) == Some(u64::from(track_id))
            })
            .map(|(i, _)| i)
            .collect();
        for index in matches.into_iter().rev() {
            es_ids.delete_descriptor(index)?;
        }
        Ok(())
    }

    fn add_track_to_od(&mut self, track_id: u32) -> Result<()> {
        match self.od_track_id {
            Some(od) => {
                let tref = self.track_path(od, "tref.mpod")?;
                self.add_track_reference(&tref, track_id)
            }
            None => Ok(()),
        }
    }

    fn remove_track_from_od(&mut self, track_id: u32) -> Result<()> {
        match self.od_track_id {
            Some(od) => {
                let tref = self.track_path(od, "tref.mpod")?;
                self.remove_track_reference(&tref, track_id)
            }
            None => Ok(()),
        }
    }
}

// track references
impl Mp4File {
    /// Appends `ref_track_id` to the reference atom at `tref_path`, e.g. `moov.trak[1].tref.hint`.
    pub fn add_track_reference(&mut self, tref_path: &str, ref_track_id: u32) -> Result<()> {
        self.protect_write("add_track_reference")?;
        let atom = self
            .root
            .find_atom_mut(tref_path)
            .ok_or_else(|| Error::not_found(tref_path.to_string()))?;
        let row = add_table_row(atom.properties_mut(), "entries")?;
        atom.property_mut("entries")
            .and_then(|entries| entries.column_mut("trackId"))
            .ok_or_else(|| Error::not_found(format!("{tref_path}.entries.trackId")))?
            .set_integer(row, u64::from(ref_track_id))
    }

    /// 1-based position of `ref_track_id` in the reference atom at `tref_path`.
    pub fn find_track_reference(&self, tref_path: &str, ref_track_id: u32) -> Result<Option<u32>> {
        let atom = self
            .root
            .find_atom(tref_path)
            .ok_or_else(|| Error::not_found(tref_path.to_string()))?;
        Ok(reference_ids(atom)
            .iter()
            .position(|&id| id == u64::from(ref_track_id))
            .map(|i| i as u32 + 1))
    }

    pub fn remove_track_reference(&mut self, tref_path: &str, ref_track_id: u32) -> Result<()> {
        self.protect_write("remove_track_reference")?;
        let atom = self
            .root
            .find_atom_mut(tref_path)
            .ok_or_else(|| Error::not_found(tref_path.to_string()))?;
        let rows: Vec<usize> = reference_ids(atom)
            .iter()
            .enumerate()
            .filter(|(_, &id)| id == u64::from(ref_track_id))
            .map(|(i, _)| i)
            .collect();
        for row in rows.into_iter().rev() {
            delete_table_row(atom.properties_mut(), "entries", row)?;
        }
        Ok(())
    }
}

// track queries
impl Mp4File {
    /// Number of tracks, or of tracks of `track_type` when given.
    pub fn number_of_tracks(&self, track_type: Option<&str>) -> usize {
        let wanted = track_type.map(normalize_track_type);
        self.tracks
            .iter()
            .filter(|track| wanted.as_deref().map_or(true, |t| track.track_type() == t))
            .count()
    }

    /// Id of the `index`th track, counting only tracks of `track_type` when given.
    pub fn find_track_id(&self, index: usize, track_type: Option<&str>) -> Result<u32> {
        let wanted = track_type.map(normalize_track_type);
        self.tracks
            .iter()
            .filter(|track| wanted.as_deref().map_or(true, |t| track.track_type() == t))
            .nth(index)
            .map(Track::id)
            .ok_or_else(|| Error::invalid(format!("no track at index {index}")))
    }

    pub fn track_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.tracks.iter().map(Track::id)
    }

    pub fn track_type(&self, track_id: u32) -> Result<&str> {
        Ok(self.track(track_id)?.track_type())
    }

    pub fn track_time_scale(&self, track_id: u32) -> Result<u32> {
        Track::time_scale(self.trak(track_id)?)
    }

    pub fn set_track_time_scale(&mut self, track_id: u32, time_scale: u32) -> Result<()> {
        self.protect_write("set_track_time_scale")?;
        if time_scale == 0 {
            return Err(Error::invalid("track time scale of 0"));
        }
        self.trak_mut(track_id)?
            .set_integer_property(&format!("{MDHD}.timeScale"), u64::from(time_scale))
    }

    /// Media duration in the track time scale.
    pub fn track_duration(&self, track_id: u32) -> Result<u64> {
        Track::duration(self.trak(track_id)?)
    }

    pub fn track_audio_type(&self, track_id: u32) -> Result<u8> {
        let path = format!("{STBL}.stsd.mp4a.esds.decConfigDescr.objectTypeId");
        Ok(self.trak(track_id)?.integer_property(&path)? as u8)
    }

    pub fn track_video_type(&self, track_id: u32) -> Result<u8> {
        let path = format!("{STBL}.stsd.mp4v.esds.decConfigDescr.objectTypeId");
        Ok(self.trak(track_id)?.integer_property(&path)? as u8)
    }

    /// Duration shared by every sample of the track, or 0 when they differ.
    pub fn track_fixed_sample_duration(&self, track_id: u32) -> Result<u64> {
        self.track(track_id)?
            .fixed_sample_duration(self.trak(track_id)?)
    }

    /// Decoder specific configuration of the first sample entry.
    pub fn track_es_configuration(&self, track_id: u32) -> Result<Vec<u8>> {
        self.trak(track_id)?
            .bytes_property(&format!("{ES_CONFIG}.decSpecificInfo[0].info"))
    }

    pub fn set_track_es_configuration(&mut self, track_id: u32, config: &[u8]) -> Result<()> {
        self.protect_write("set_track_es_configuration")?;
        let path = format!("{ES_CONFIG}.decSpecificInfo");
        let infos = self
            .trak_mut(track_id)?
            .find_property_mut(&path)
            .ok_or_else(|| Error::not_found(path.clone()))?;
        let descriptor = match infos.descriptors_mut() {
            Some(descriptors) if !descriptors.is_empty() => &mut descriptors[0],
            _ => infos.add_descriptor(DEC_SPECIFIC_TAG)?,
        };
        descriptor
            .property_mut("info")
            .ok_or_else(|| Error::not_found(format!("{path}.info")))?
            .set_bytes(0, config.to_vec())
    }
}

// movie
impl Mp4File {
    /// Movie duration in the movie time scale.
    pub fn duration(&self) -> Result<u64> {
        self.movie_integer(|m| &m.duration)
    }

    pub fn time_scale(&self) -> Result<u32> {
        Ok(self.movie_integer(|m| &m.time_scale)? as u32)
    }

    pub fn set_time_scale(&mut self, time_scale: u32) -> Result<()> {
        self.protect_write("set_time_scale")?;
        if time_scale == 0 {
            return Err(Error::invalid("movie time scale of 0"));
        }
        self.set_movie_integer(|m| &m.time_scale, u64::from(time_scale))
    }

    /// Grows the movie duration to `duration` if it is longer.
    pub(crate) fn update_duration(&mut self, duration: u64) -> Result<()> {
        if duration > self.duration()? {
            self.set_movie_integer(|m| &m.duration, duration)?;
        }
        Ok(())
    }

    fn profile_level(&self, name: &str) -> Result<u8> {
        Ok(self.integer_property(&format!("moov.iods.{name}"))? as u8)
    }

    fn set_profile_level(&mut self, name: &str, value: u8) -> Result<()> {
        self.set_integer_property(&format!("moov.iods.{name}"), u64::from(value))
    }

    pub fn od_profile_level(&self) -> Result<u8> {
        self.profile_level("ODProfileLevelId")
    }

    pub fn set_od_profile_level(&mut self, value: u8) -> Result<()> {
        self.set_profile_level("ODProfileLevelId", value)
    }

    pub fn scene_profile_level(&self) -> Result<u8> {
        self.profile_level("sceneProfileLevelId")
    }

    pub fn set_scene_profile_level(&mut self, value: u8) -> Result<()> {
        self.set_profile_level("sceneProfileLevelId", value)
    }

    pub fn audio_profile_level(&self) -> Result<u8> {
        self.profile_level("audioProfileLevelId")
    }

    pub fn set_audio_profile_level(&mut self, value: u8) -> Result<()> {
        self.set_profile_level("audioProfileLevelId", value)
    }

    pub fn video_profile_level(&self) -> Result<u8> {
        self.profile_level("visualProfileLevelId")
    }

    pub fn set_video_profile_level(&mut self, value: u8) -> Result<()> {
        self.set_profile_level("visualProfileLevelId", value)
    }

    pub fn graphics_profile_level(&self) -> Result<u8> {
        self.profile_level("graphicsProfileLevelId")
    }

    pub fn set_graphics_profile_level(&mut self, value: u8) -> Result<()> {
        self.set_profile_level("graphicsProfileLevelId", value)
    }

    pub fn session_sdp(&self) -> Result<String> {
        self.string_property(SESSION_SDP)
    }

    /// Sets the movie level SDP, creating `moov.udta.hnti.rtp ` as needed.
    pub fn set_session_sdp(&mut self, sdp: &str) -> Result<()> {
        self.protect_write("set_session_sdp")?;
        self.root
            .child_mut(MOOV)
            .ok_or_else(|| Error::not_found("moov"))?
            .find_or_insert_child(b"udta")
            .call()
            .find_or_insert_child(b"hnti")
            .call()
            .find_or_insert_child(b"rtp ")
            .call();
        self.set_string_property(SESSION_SDP, sdp)
    }

    pub fn append_session_sdp(&mut self, fragment: &str) -> Result<()> {
        match self.session_sdp() {
            Ok(sdp) => self.set_session_sdp(&(sdp + fragment)),
            Err(_) => self.set_session_sdp(fragment),
        }
    }
}

// time conversion
impl Mp4File {
    /// Converts a duration in the movie time scale to `time_scale`.
    pub fn convert_from_movie_duration(&self, duration: u64, time_scale: u32) -> Result<u64> {
        convert_time(duration, self.time_scale()?, time_scale)
    }

    /// Converts a timestamp in the track time scale to `time_scale`.
    pub fn convert_from_track_timestamp(
        &self,
        track_id: u32,
        timestamp: u64,
        time_scale: u32,
    ) -> Result<u64> {
        convert_time(timestamp, self.track_time_scale(track_id)?, time_scale)
    }

    /// Converts a timestamp in `time_scale` to the track time scale.
    pub fn convert_to_track_timestamp(
        &self,
        track_id: u32,
        timestamp: u64,
        time_scale: u32,
    ) -> Result<u64> {
        convert_time(timestamp, time_scale, self.track_time_scale(track_id)?)
    }

    pub fn convert_from_track_duration(
        &self,
        track_id: u32,
        duration: u64,
        time_scale: u32,
    ) -> Result<u64> {
        convert_time(duration, self.track_time_scale(track_id)?, time_scale)
    }

    pub fn convert_to_track_duration(
        &self,
        track_id: u32,
        duration: u64,
        time_scale: u32,
    ) -> Result<u64> {
        convert_time(duration, time_scale, self.track_time_scale(track_id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    fn new_file(dir: &tempfile::TempDir) -> Mp4File {
        Mp4File::create(&dir.path().join("tracks.mp4")).call().unwrap()
    }

    #[test]
    fn test_track_ids_are_allocated_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = new_file(&dir);
        let audio = file.add_track("audio", 8000).unwrap();
        let video = file.add_track("video", 90000).unwrap();
        assert_eq!((audio, video), (1, 2));
        assert_eq!(file.integer_property("moov.mvhd.nextTrackId").unwrap(), 3);
        assert_eq!(file.track_type(video).unwrap(), VIDEO_TRACK_TYPE);
        assert_eq!(file.number_of_tracks(Some("audio")), 1);
        assert_eq!(file.find_track_id(0, Some("vide")).unwrap(), video);
        assert_eq!(file.track_integer_property(audio, "tkhd.flags").unwrap(), 1);
        assert_eq!(
            file.track_integer_property(audio, "mdia.minf.dinf.dref.entryCount")
                .unwrap(),
            1
        );
    }

    #[test]
    fn test_exhausted_next_track_id_reuses_free_ids() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = new_file(&dir);
        file.set_integer_property("moov.mvhd.nextTrackId", 0x1_0000)
            .unwrap();
        assert_eq!(file.add_track("audio", 8000).unwrap(), 1);
        assert_eq!(file.add_track("audio", 8000).unwrap(), 2);
    }

    #[test]
    fn test_audio_track_is_registered_with_od() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = new_file(&dir);
        let od = file.add_od_track().unwrap();
        let audio = file
            .add_audio_track()
            .time_scale(44100)
            .sample_duration(1024)
            .call()
            .unwrap();
        let tref = file.track_path(od, "tref.mpod").unwrap();
        assert_eq!(file.find_track_reference(&tref, audio).unwrap(), Some(1));
        assert_eq!(file.track_audio_type(audio).unwrap(), 0x40);
        assert_eq!(file.track_fixed_sample_duration(audio).unwrap(), 1024);
        assert_eq!(
            file.track_integer_property(audio, "mdia.minf.stbl.stsd.mp4a.esds.ESID")
                .unwrap(),
            u64::from(audio)
        );
        assert_eq!(
            file.add_od_track().unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );

        file.delete_track(audio).unwrap();
        assert_eq!(file.find_track_reference(&tref, audio).unwrap(), None);
        assert_eq!(file.integer_property(&format!("{tref}.entryCount")).unwrap(), 0);
    }

    #[test]
    fn test_es_configuration_creates_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = new_file(&dir);
        let video = file
            .add_video_track()
            .time_scale(90000)
            .sample_duration(3000)
            .width(320)
            .height(240)
            .call()
            .unwrap();
        assert!(file.track_es_configuration(video).is_err());
        file.set_track_es_configuration(video, &[0, 0, 1, 0xB0])
            .unwrap();
        assert_eq!(file.track_es_configuration(video).unwrap(), vec![0, 0, 1, 0xB0]);
        assert_eq!(file.track_float_property(video, "tkhd.width").unwrap(), 320.0);
    }

    #[test]
    fn test_zero_time_scale_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = new_file(&dir);
        assert_eq!(file.set_time_scale(0).unwrap_err().kind(), ErrorKind::InvalidArgument);
        let track = file.add_track("video", 0).unwrap();
        assert_eq!(file.track_time_scale(track).unwrap(), 1);
        assert!(file.set_track_time_scale(track, 0).is_err());
    }

    #[test]
    fn test_append_session_sdp_without_value() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = new_file(&dir);
        file.append_session_sdp("v=0\r\n").unwrap();
        file.append_session_sdp("s=test\r\n").unwrap();
        assert_eq!(file.session_sdp().unwrap(), "v=0\r\ns=test\r\n");
    }

    #[test]
    fn test_convert_track_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = new_file(&dir);
        let track = file.add_track("audio", 8000).unwrap();
        assert_eq!(file.convert_from_track_timestamp(track, 8000, 1000).unwrap(), 1000);
        assert_eq!(file.convert_to_track_duration(track, 500, 1000).unwrap(), 4000);
        assert_eq!(file.convert_from_movie_duration(2000, 90000).unwrap(), 180000);
    }
}
