use bon::bon;

use super::Mp4File;
use crate::{
    atom::util::convert_time,
    track::{
        hint::{DataEntry, HintSample, MAX_IMMEDIATE_BYTES},
        HintTrack, SampleTable, AUDIO_TRACK_TYPE, STBL, VIDEO_TRACK_TYPE,
    },
    Error, Result,
};

/// First dynamic RTP payload number.
const DYNAMIC_PAYLOAD_START: u8 = 96;
const DYNAMIC_PAYLOAD_END: u8 = 128;
const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 1460;

const HINT_SDP: &str = "udta.hnti.sdp .sdpText";
const PAYLOAD_NUMBER: &str = "udta.hinf.payt.payloadNumber";
const RTP_MAP: &str = "udta.hinf.payt.rtpMap";

fn rtp_entry(name: &str) -> String {
    format!("{STBL}.stsd.rtp .{name}")
}

/// RTP payload of a hint track as recorded in `payt` and its sample entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPayload {
    /// Encoding name, e.g. `MP4A-LATM`.
    pub name: String,
    pub number: u8,
    pub max_payload_size: u32,
    /// What follows `name/clock` in the rtpmap.
    pub encoding_params: Option<String>,
}

#[bon]
impl Mp4File {
    /// Records the RTP payload a hint track produces and announces it in the track's SDP.
    /// Returns the payload number, allocated from the dynamic range when not given.
    #[builder]
    pub fn set_hint_track_rtp_payload(
        &mut self,
        #[builder(start_fn)] hint_track_id: u32,
        #[builder(start_fn)] name: &str,
        payload_number: Option<u8>,
        #[builder(default = DEFAULT_MAX_PAYLOAD_SIZE)] max_payload_size: u32,
        encoding_params: Option<&str>,
    ) -> Result<u8> {
        self.protect_write("set_hint_track_rtp_payload")?;
        self.hint(hint_track_id)?;
        let number = match payload_number {
            Some(number) => number,
            None => self.allocate_payload_number(hint_track_id)?,
        };
        let clock = self.track_time_scale(hint_track_id)?;
        let rtp_map = match encoding_params {
            Some(params) => format!("{name}/{clock}/{params}"),
            None => format!("{name}/{clock}"),
        };
        let media = match self.hint_track_reference_track_id(hint_track_id) {
            Ok(id) => match self.track_type(id)? {
                AUDIO_TRACK_TYPE => "audio",
                VIDEO_TRACK_TYPE => "video",
                _ => "application",
            },
            Err(_) => "application",
        };

        self.transaction(|file| {
            let trak = file.trak_mut(hint_track_id)?;
            trak.find_or_insert_child(b"udta")
                .call()
                .find_or_insert_child(b"hinf")
                .call()
                .find_or_insert_child(b"payt")
                .call();
            trak.set_integer_property(PAYLOAD_NUMBER, u64::from(number))?;
            trak.set_string_property(RTP_MAP, &rtp_map)?;
            trak.set_integer_property(&rtp_entry("maxPacketSize"), u64::from(max_payload_size))?;
            file.append_hint_track_sdp(
                hint_track_id,
                &format!(
                    "m={media} 0 RTP/AVP {number}\r\na=rtpmap:{number} {rtp_map}\r\na=control:trackID={hint_track_id}\r\n"
                ),
            )
        })?;
        tracing::debug!(track = hint_track_id, number, rtp_map = %rtp_map, "rtp payload set");
        Ok(number)
    }

    /// Starts a hint sample; packets are added to it until [`Mp4File::write_rtp_hint`].
    #[builder]
    pub fn add_rtp_hint(
        &mut self,
        #[builder(start_fn)] hint_track_id: u32,
        #[builder(default)] b_frame: bool,
        /// Added to the RTP timestamp of every packet of the hint.
        #[builder(default)]
        timestamp_offset: u32,
    ) -> Result<()> {
        self.protect_write("add_rtp_hint")?;
        self.hint_state(hint_track_id)?
            .begin_hint(b_frame, timestamp_offset)
    }

    #[builder]
    pub fn add_rtp_packet(
        &mut self,
        #[builder(start_fn)] hint_track_id: u32,
        #[builder(default)] marker: bool,
        #[builder(default)] transmit_offset: i32,
    ) -> Result<()> {
        self.protect_write("add_rtp_packet")?;
        let payload_type = self
            .track_integer_property(hint_track_id, PAYLOAD_NUMBER)
            .map_err(|_| Error::invalid(format!("track {hint_track_id} has no rtp payload")))?;
        self.hint_state(hint_track_id)?
            .add_packet(marker, transmit_offset, payload_type as u8)
    }

    /// Finishes the pending hint and writes it as a sample of `duration` hint track ticks.
    #[builder]
    pub fn write_rtp_hint(
        &mut self,
        #[builder(start_fn)] hint_track_id: u32,
        duration: u64,
        #[builder(default = true)] sync: bool,
    ) -> Result<u32> {
        self.protect_write("write_rtp_hint")?;
        let duration_ms = convert_time(duration, self.track_time_scale(hint_track_id)?, 1000)?;
        let hint = self.hint_state(hint_track_id)?.finish_hint(duration_ms)?;
        self.write_sample(hint_track_id, &hint.to_bytes())
            .duration(duration)
            .sync(sync)
            .call()
    }

    /// Builds packet `packet_index` of the hint loaded by [`Mp4File::read_rtp_hint`].
    #[builder]
    pub fn read_rtp_packet(
        &self,
        #[builder(start_fn)] hint_track_id: u32,
        #[builder(start_fn)] packet_index: usize,
        #[builder(default)] ssrc: u32,
        #[builder(default = true)] include_header: bool,
        #[builder(default = true)] include_payload: bool,
    ) -> Result<Vec<u8>> {
        let hint = self.hint(hint_track_id)?;
        let (hint_sample_id, _) = hint.loaded()?;
        let packet = hint.packet(packet_index)?;

        let mut out = Vec::new();
        if include_header {
            let start = SampleTable::new(self.trak(hint_track_id)?)?
                .sample_times(hint_sample_id)?
                .0;
            let timestamp = u64::from(self.rtp_timestamp_start(hint_track_id)?)
                + start
                + u64::from(packet.timestamp_offset.unwrap_or(0));
            out.extend_from_slice(&packet.header(timestamp as u32, ssrc));
        }
        if include_payload {
            for entry in &packet.entries {
                self.resolve_data_entry(hint_track_id, entry, &mut out)?;
            }
        }
        Ok(out)
    }
}

impl Mp4File {
    fn hint_state(&mut self, track_id: u32) -> Result<&mut HintTrack> {
        let index = self.track_index(track_id)?;
        self.tracks[index]
            .hint
            .as_mut()
            .ok_or_else(|| Error::invalid(format!("track {track_id} is not a hint track")))
    }

    fn hint(&self, track_id: u32) -> Result<&HintTrack> {
        self.track(track_id)?
            .hint
            .as_ref()
            .ok_or_else(|| Error::invalid(format!("track {track_id} is not a hint track")))
    }

    /// Lowest dynamic payload number no other hint track uses.
    fn allocate_payload_number(&self, hint_track_id: u32) -> Result<u8> {
        let used: Vec<u64> = self
            .tracks
            .iter()
            .filter(|track| track.is_hint() && track.id() != hint_track_id)
            .filter_map(|track| self.track_integer_property(track.id(), PAYLOAD_NUMBER).ok())
            .collect();
        (DYNAMIC_PAYLOAD_START..DYNAMIC_PAYLOAD_END)
            .find(|n| !used.contains(&u64::from(*n)))
            .ok_or_else(|| Error::exhausted("no dynamic rtp payload number left"))
    }

    pub fn hint_track_rtp_payload(&self, hint_track_id: u32) -> Result<RtpPayload> {
        self.hint(hint_track_id)?;
        let number = self.track_integer_property(hint_track_id, PAYLOAD_NUMBER)? as u8;
        let rtp_map = self.track_string_property(hint_track_id, RTP_MAP)?;
        let max_payload_size =
            self.track_integer_property(hint_track_id, &rtp_entry("maxPacketSize"))? as u32;
        let mut parts = rtp_map.splitn(3, '/');
        let name = parts.next().unwrap_or_default().to_string();
        let encoding_params = parts.nth(1).map(str::to_string);
        Ok(RtpPayload {
            name,
            number,
            max_payload_size,
            encoding_params,
        })
    }

    /// The media track a hint track packetizes.
    pub fn hint_track_reference_track_id(&self, hint_track_id: u32) -> Result<u32> {
        self.hint(hint_track_id)?;
        Ok(self.track_integer_property(hint_track_id, "tref.hint.entries[0].trackId")? as u32)
    }

    pub fn hint_track_sdp(&self, hint_track_id: u32) -> Result<String> {
        self.track_string_property(hint_track_id, HINT_SDP)
    }

    pub fn set_hint_track_sdp(&mut self, hint_track_id: u32, sdp: &str) -> Result<()> {
        self.protect_write("set_hint_track_sdp")?;
        self.hint(hint_track_id)?;
        self.trak_mut(hint_track_id)?
            .find_or_insert_child(b"udta")
            .call()
            .find_or_insert_child(b"hnti")
            .call()
            .find_or_insert_child(b"sdp ")
            .call();
        self.set_track_string_property(hint_track_id, HINT_SDP, sdp)
    }

    pub fn append_hint_track_sdp(&mut self, hint_track_id: u32, fragment: &str) -> Result<()> {
        match self.hint_track_sdp(hint_track_id) {
            Ok(sdp) => self.set_hint_track_sdp(hint_track_id, &(sdp + fragment)),
            Err(_) => self.set_hint_track_sdp(hint_track_id, fragment),
        }
    }

    pub fn add_rtp_immediate_data(&mut self, hint_track_id: u32, data: &[u8]) -> Result<()> {
        self.protect_write("add_rtp_immediate_data")?;
        self.hint_state(hint_track_id)?.add_immediate_data(data)
    }

    /// Adds `length` bytes at `offset` of sample `sample_id` of the referenced media track.
    pub fn add_rtp_sample_data(
        &mut self,
        hint_track_id: u32,
        sample_id: u32,
        offset: u32,
        length: u16,
    ) -> Result<()> {
        self.protect_write("add_rtp_sample_data")?;
        self.hint_state(hint_track_id)?
            .add_sample_data(sample_id, offset, length)
    }

    /// Adds a packet carrying the decoder configuration of the referenced media track. The
    /// payload points into its sample description when the configuration is found there and is
    /// copied into the hint otherwise.
    pub fn add_rtp_es_configuration_packet(&mut self, hint_track_id: u32) -> Result<()> {
        self.protect_write("add_rtp_es_configuration_packet")?;
        let media_track_id = self.hint_track_reference_track_id(hint_track_id)?;
        let config = self.track_es_configuration(media_track_id)?;
        if config.is_empty() {
            return Err(Error::invalid(format!(
                "track {media_track_id} has no decoder configuration"
            )));
        }
        let max_payload_size = self
            .track_integer_property(hint_track_id, &rtp_entry("maxPacketSize"))
            .unwrap_or(u64::from(DEFAULT_MAX_PAYLOAD_SIZE));
        if config.len() as u64 > max_payload_size {
            return Err(Error::invalid(format!(
                "decoder configuration of {} bytes exceeds the {max_payload_size} byte payload",
                config.len()
            )));
        }
        let entry = self.sample_entry_bytes(media_track_id, 1)?;
        let offset = entry
            .windows(config.len())
            .position(|window| window == config.as_slice());

        self.add_rtp_packet(hint_track_id).marker(true).call()?;
        let hint = self.hint_state(hint_track_id)?;
        match (offset, u16::try_from(config.len())) {
            (Some(offset), Ok(length)) => hint.add_sample_description_data(offset as u32, length),
            _ => config
                .chunks(MAX_IMMEDIATE_BYTES)
                .try_for_each(|chunk| hint.add_immediate_data(chunk)),
        }
    }

    /// Loads hint sample `sample_id` for the packet queries.
    pub fn read_rtp_hint(&mut self, hint_track_id: u32, sample_id: u32) -> Result<()> {
        let data = self.read_sample(hint_track_id, sample_id)?;
        let offset = self
            .sample_table_offset(hint_track_id, sample_id)
            .unwrap_or(0);
        let hint = HintSample::parse(&data, offset)?;
        self.hint_state(hint_track_id)?.load(sample_id, hint);
        Ok(())
    }

    fn sample_table_offset(&self, track_id: u32, sample_id: u32) -> Option<u64> {
        SampleTable::new(self.trak(track_id).ok()?)
            .ok()?
            .sample_offset(sample_id)
            .ok()
    }

    pub fn rtp_hint_number_of_packets(&self, hint_track_id: u32) -> Result<usize> {
        Ok(self.hint(hint_track_id)?.loaded()?.1.packets.len())
    }

    pub fn rtp_hint_b_frame(&self, hint_track_id: u32) -> Result<bool> {
        Ok(self.hint(hint_track_id)?.loaded()?.1.is_b_frame())
    }

    pub fn rtp_packet_transmit_offset(&self, hint_track_id: u32, packet_index: usize) -> Result<i32> {
        Ok(self.hint(hint_track_id)?.packet(packet_index)?.transmit_offset)
    }

    /// RTP timestamp of the start of the track; 0 unless set.
    pub fn rtp_timestamp_start(&self, hint_track_id: u32) -> Result<u32> {
        self.hint(hint_track_id)?;
        Ok(self
            .track_integer_property(hint_track_id, &rtp_entry("tsro.offset"))
            .unwrap_or(0) as u32)
    }

    pub fn set_rtp_timestamp_start(&mut self, hint_track_id: u32, start: u32) -> Result<()> {
        self.protect_write("set_rtp_timestamp_start")?;
        self.hint(hint_track_id)?;
        let path = format!("{STBL}.stsd.rtp ");
        self.trak_mut(hint_track_id)?
            .find_atom_mut(&path)
            .ok_or_else(|| Error::not_found(path.clone()))?
            .find_or_insert_child(b"tsro")
            .call()
            .set_integer_property("offset", u64::from(start))
    }

    /// Serialized sample entry `index` (1-based) of a track's `stsd`.
    fn sample_entry_bytes(&self, track_id: u32, index: u32) -> Result<Vec<u8>> {
        let path = format!("{STBL}.stsd");
        let stsd = self
            .trak(track_id)?
            .find_atom(&path)
            .ok_or_else(|| Error::not_found(path.clone()))?;
        let mut entry = index
            .checked_sub(1)
            .and_then(|i| stsd.children().get(i as usize))
            .cloned()
            .ok_or_else(|| Error::not_found(format!("{path}[{index}]")))?;
        entry.compute_sizes();
        Ok(entry.to_bytes())
    }

    /// Track a data entry refers to: -1 is the hint track, otherwise an index into `tref.hint`.
    fn referenced_track(&self, hint_track_id: u32, track_ref_index: i8) -> Result<u32> {
        match track_ref_index {
            -1 => Ok(hint_track_id),
            index => Ok(self.track_integer_property(
                hint_track_id,
                &format!("tref.hint.entries[{index}].trackId"),
            )? as u32),
        }
    }

    fn resolve_data_entry(&self, hint_track_id: u32, entry: &DataEntry, out: &mut Vec<u8>) -> Result<()> {
        let slice = |data: Vec<u8>, offset: u32, length: u16| -> Result<Vec<u8>> {
            let start = offset as usize;
            let end = start + usize::from(length);
            data.get(start..end)
                .map(<[u8]>::to_vec)
                .ok_or_else(|| Error::malformed(format!("hint data {start}..{end} out of range")))
        };
        match entry {
            DataEntry::NoOp => {}
            DataEntry::Immediate(data) => out.extend_from_slice(data),
            DataEntry::Sample {
                track_ref_index,
                length,
                sample_id,
                offset,
            } => {
                let track_id = self.referenced_track(hint_track_id, *track_ref_index)?;
                let data = self.read_sample(track_id, *sample_id)?;
                out.extend(slice(data, *offset, *length)?);
            }
            DataEntry::SampleDescription {
                track_ref_index,
                length,
                index,
                offset,
            } => {
                let track_id = self.referenced_track(hint_track_id, *track_ref_index)?;
                let data = self.sample_entry_bytes(track_id, *index)?;
                out.extend(slice(data, *offset, *length)?);
            }
        }
        Ok(())
    }

    /// Writes the statistics of hint tracks that gained hints to their `udta.hinf`.
    pub(crate) fn store_hint_statistics(&mut self) -> Result<()> {
        let written: Vec<_> = self
            .tracks
            .iter()
            .filter_map(|track| Some((track.id(), track.hint.as_ref()?.stats)))
            .filter(|(_, stats)| stats.packets_sent > 0)
            .collect();
        for (track_id, stats) in written {
            let hinf = self
                .trak_mut(track_id)?
                .find_or_insert_child(b"udta")
                .call()
                .find_or_insert_child(b"hinf")
                .call();
            let values: [(&[u8; 4], &str, u64); 7] = [
                (b"trpy", "bytes", stats.bytes_sent),
                (b"nump", "packets", stats.packets_sent),
                (b"tpyl", "bytes", stats.payload_bytes),
                (b"dmed", "bytes", stats.media_bytes),
                (b"dimm", "bytes", stats.immediate_bytes),
                (b"pmax", "bytes", u64::from(stats.max_packet_size)),
                (b"dmax", "milliSecs", u64::from(stats.max_duration_ms)),
            ];
            for (atom_type, name, value) in values {
                hinf.find_or_insert_child(atom_type)
                    .call()
                    .set_integer_property(name, value)?;
            }
            tracing::debug!(track = track_id, packets = stats.packets_sent, "hint statistics stored");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hinted_file(dir: &tempfile::TempDir) -> (Mp4File, u32, u32) {
        let mut file = Mp4File::create(&dir.path().join("hint.mp4")).call().unwrap();
        let audio = file
            .add_audio_track()
            .time_scale(8000)
            .sample_duration(160)
            .call()
            .unwrap();
        file.set_track_es_configuration(audio, &[0x15, 0x88]).unwrap();
        let hint = file.add_hint_track(audio).unwrap();
        (file, audio, hint)
    }

    #[test]
    fn test_payload_numbers_are_allocated() {
        let dir = tempfile::tempdir().unwrap();
        let (mut file, audio, hint) = hinted_file(&dir);
        let number = file
            .set_hint_track_rtp_payload(hint, "MP4A-LATM")
            .call()
            .unwrap();
        assert_eq!(number, 96);
        let second = file.add_hint_track(audio).unwrap();
        let number = file
            .set_hint_track_rtp_payload(second, "MP4A-LATM")
            .encoding_params("2")
            .call()
            .unwrap();
        assert_eq!(number, 97);

        let payload = file.hint_track_rtp_payload(second).unwrap();
        assert_eq!(payload.name, "MP4A-LATM");
        assert_eq!(payload.max_payload_size, 1460);
        assert_eq!(payload.encoding_params.as_deref(), Some("2"));
        assert!(file
            .hint_track_sdp(hint)
            .unwrap()
            .starts_with("m=audio 0 RTP/AVP 96\r\na=rtpmap:96 MP4A-LATM/8000\r\n"));
        assert_eq!(file.hint_track_reference_track_id(hint).unwrap(), audio);
    }

    #[test]
    fn test_packets_resolve_sample_and_description_data() {
        let dir = tempfile::tempdir().unwrap();
        let (mut file, audio, hint) = hinted_file(&dir);
        file.set_hint_track_rtp_payload(hint, "MP4A-LATM")
            .call()
            .unwrap();
        file.write_sample(audio, b"0123456789").call().unwrap();

        file.add_rtp_hint(hint).call().unwrap();
        file.add_rtp_es_configuration_packet(hint).unwrap();
        file.add_rtp_packet(hint).marker(true).call().unwrap();
        file.add_rtp_immediate_data(hint, &[0xFF]).unwrap();
        file.add_rtp_sample_data(hint, 1, 2, 4).unwrap();
        file.write_rtp_hint(hint).duration(160).call().unwrap();

        file.read_rtp_hint(hint, 1).unwrap();
        assert_eq!(file.rtp_hint_number_of_packets(hint).unwrap(), 2);
        assert!(!file.rtp_hint_b_frame(hint).unwrap());
        let config = file
            .read_rtp_packet(hint, 0)
            .include_header(false)
            .call()
            .unwrap();
        assert_eq!(config, vec![0x15, 0x88]);
        let packet = file.read_rtp_packet(hint, 1).ssrc(7).call().unwrap();
        assert_eq!(packet[1], 0x80 | 96);
        assert_eq!(&packet[8..12], &7u32.to_be_bytes());
        assert_eq!(&packet[12..], &[0xFF, b'2', b'3', b'4', b'5']);
    }

    #[test]
    fn test_statistics_stored_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let (mut file, _, hint) = hinted_file(&dir);
        file.set_hint_track_rtp_payload(hint, "MP4A-LATM")
            .call()
            .unwrap();
        file.add_rtp_hint(hint).call().unwrap();
        file.add_rtp_packet(hint).call().unwrap();
        file.add_rtp_immediate_data(hint, &[1, 2, 3]).unwrap();
        file.write_rtp_hint(hint).duration(8000).call().unwrap();
        file.close().unwrap();

        let file = Mp4File::read(dir.path().join("hint.mp4")).unwrap();
        let hint = file.find_track_id(0, Some("hint")).unwrap();
        assert_eq!(file.track_integer_property(hint, "udta.hinf.nump.packets").unwrap(), 1);
        assert_eq!(file.track_integer_property(hint, "udta.hinf.trpy.bytes").unwrap(), 15);
        assert_eq!(file.track_integer_property(hint, "udta.hinf.dmax.milliSecs").unwrap(), 1000);
    }

    #[test]
    fn test_rtp_timestamp_start_defaults_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        let (mut file, audio, hint) = hinted_file(&dir);
        assert_eq!(file.rtp_timestamp_start(hint).unwrap(), 0);
        file.set_rtp_timestamp_start(hint, 1234).unwrap();
        assert_eq!(file.rtp_timestamp_start(hint).unwrap(), 1234);
        assert!(file.rtp_timestamp_start(audio).is_err());
    }
}
