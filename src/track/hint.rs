/*!
 * RTP hint samples.
 *
 * A hint sample is a packet count followed by packet descriptions. Each packet carries the RTP
 * header fields that vary per packet and a list of 16-byte data entries telling a streamer where
 * the payload bytes come from.
 */

use winnow::{
    binary::{be_i32, be_u16, be_u32, i8},
    combinator::{repeat, trace},
    error::StrContext,
    ModalResult, Parser,
};

use crate::{
    atom::util::parser::{byte_array, fourcc, rest_vec, stream, Stream},
    parser::{ParseError, ParseErrorKind},
    Error, Result,
};

/// Largest payload a single immediate data entry can hold.
pub const MAX_IMMEDIATE_BYTES: usize = 14;

/// TLV carrying a per-packet RTP timestamp offset.
pub const RTPO_TLV: &[u8; 4] = b"rtpo";

/// Length of the fixed RTP header prepended by [`RtpPacket::header`].
pub const RTP_HEADER_SIZE: usize = 12;

const DATA_ENTRY_SIZE: usize = 16;

/// Where the bytes of one part of a packet payload come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataEntry {
    NoOp,
    Immediate(Vec<u8>),
    /// `track_ref_index` -1 is the hint track itself, 0 the first `tref.hint` track.
    Sample {
        track_ref_index: i8,
        length: u16,
        sample_id: u32,
        offset: u32,
    },
    SampleDescription {
        track_ref_index: i8,
        length: u16,
        index: u32,
        offset: u32,
    },
}

impl DataEntry {
    pub fn payload_len(&self) -> usize {
        match self {
            DataEntry::NoOp => 0,
            DataEntry::Immediate(data) => data.len(),
            DataEntry::Sample { length, .. } | DataEntry::SampleDescription { length, .. } => {
                usize::from(*length)
            }
        }
    }

    fn write(&self, out: &mut Vec<u8>) {
        let start = out.len();
        match self {
            DataEntry::NoOp => out.push(0),
            DataEntry::Immediate(data) => {
                out.push(1);
                out.push(data.len() as u8);
                out.extend_from_slice(data);
            }
            DataEntry::Sample {
                track_ref_index,
                length,
                sample_id,
                offset,
            } => {
                out.push(2);
                out.push(*track_ref_index as u8);
                out.extend_from_slice(&length.to_be_bytes());
                out.extend_from_slice(&sample_id.to_be_bytes());
                out.extend_from_slice(&offset.to_be_bytes());
                // bytes per compression block, samples per compression block
                out.extend_from_slice(&1u16.to_be_bytes());
                out.extend_from_slice(&1u16.to_be_bytes());
            }
            DataEntry::SampleDescription {
                track_ref_index,
                length,
                index,
                offset,
            } => {
                out.push(3);
                out.push(*track_ref_index as u8);
                out.extend_from_slice(&length.to_be_bytes());
                out.extend_from_slice(&index.to_be_bytes());
                out.extend_from_slice(&offset.to_be_bytes());
            }
        }
        out.resize(start + DATA_ENTRY_SIZE, 0);
    }
}

fn data_entry(input: &mut Stream<'_>) -> ModalResult<DataEntry> {
    trace("data_entry", move |input: &mut Stream<'_>| {
        let entry: [u8; DATA_ENTRY_SIZE] = byte_array
            .context(StrContext::Label("data entry"))
            .parse_next(input)?;
        let mut body = stream(&entry[1..]);
        let body = &mut body;
        Ok(match entry[0] {
            1 => {
                let count = usize::from(entry[1]).min(MAX_IMMEDIATE_BYTES);
                DataEntry::Immediate(entry[2..2 + count].to_vec())
            }
            2 => DataEntry::Sample {
                track_ref_index: i8.parse_next(body)?,
                length: be_u16.parse_next(body)?,
                sample_id: be_u32.parse_next(body)?,
                offset: be_u32.parse_next(body)?,
            },
            3 => DataEntry::SampleDescription {
                track_ref_index: i8.parse_next(body)?,
                length: be_u16.parse_next(body)?,
                index: be_u32.parse_next(body)?,
                offset: be_u32.parse_next(body)?,
            },
            _ => DataEntry::NoOp,
        })
    })
    .parse_next(input)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RtpPacket {
    /// Transmission time relative to the hint sample time.
    pub transmit_offset: i32,
    pub padding: bool,
    pub extension: bool,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub b_frame: bool,
    pub repeat: bool,
    /// Added to the RTP timestamp of this packet (`rtpo` TLV).
    pub timestamp_offset: Option<u32>,
    pub entries: Vec<DataEntry>,
}

impl RtpPacket {
    pub fn payload_len(&self) -> usize {
        self.entries.iter().map(DataEntry::payload_len).sum()
    }

    /// RTP fixed header for this packet.
    pub fn header(&self, timestamp: u32, ssrc: u32) -> [u8; RTP_HEADER_SIZE] {
        let mut header = [0u8; RTP_HEADER_SIZE];
        header[0] = 0x80 | (u8::from(self.padding) << 5) | (u8::from(self.extension) << 4);
        header[1] = (u8::from(self.marker) << 7) | (self.payload_type & 0x7F);
        header[2..4].copy_from_slice(&self.sequence_number.to_be_bytes());
        header[4..8].copy_from_slice(&timestamp.to_be_bytes());
        header[8..12].copy_from_slice(&ssrc.to_be_bytes());
        header
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.transmit_offset.to_be_bytes());
        let header_info = (2u16 << 14)
            | (u16::from(self.padding) << 13)
            | (u16::from(self.extension) << 12)
            | (u16::from(self.marker) << 7)
            | u16::from(self.payload_type & 0x7F);
        out.extend_from_slice(&header_info.to_be_bytes());
        out.extend_from_slice(&self.sequence_number.to_be_bytes());
        let flags = (u16::from(self.timestamp_offset.is_some()) << 2)
            | (u16::from(self.b_frame) << 1)
            | u16::from(self.repeat);
        out.extend_from_slice(&flags.to_be_bytes());
        out.extend_from_slice(&(self.entries.len() as u16).to_be_bytes());
        if let Some(offset) = self.timestamp_offset {
            out.extend_from_slice(&16u32.to_be_bytes());
            out.extend_from_slice(&12u32.to_be_bytes());
            out.extend_from_slice(RTPO_TLV);
            out.extend_from_slice(&offset.to_be_bytes());
        }
        for entry in &self.entries {
            entry.write(out);
        }
    }
}

/// Reads the TLV table of a packet and returns the `rtpo` value, if any.
fn tlv_table(input: &mut Stream<'_>) -> ModalResult<Option<u32>> {
    trace("tlv_table", move |input: &mut Stream<'_>| {
        let total = be_u32
            .context(StrContext::Label("tlv size"))
            .parse_next(input)?;
        let body: &[u8] = winnow::token::take(total.saturating_sub(4) as usize)
            .context(StrContext::Label("tlv table"))
            .parse_next(input)?;
        let mut body = stream(body);
        let mut offset = None;
        while body.len() >= 8 {
            let length = be_u32.parse_next(&mut body)? as usize;
            let tlv_type = fourcc.parse_next(&mut body)?;
            let value: &[u8] = winnow::token::take(length.saturating_sub(8).min(body.len()))
                .parse_next(&mut body)?;
            if tlv_type == RTPO_TLV && value.len() >= 4 {
                offset = Some(u32::from_be_bytes([value[0], value[1], value[2], value[3]]));
            }
        }
        Ok(offset)
    })
    .parse_next(input)
}

fn rtp_packet(input: &mut Stream<'_>) -> ModalResult<RtpPacket> {
    trace("rtp_packet", move |input: &mut Stream<'_>| {
        let transmit_offset = be_i32.parse_next(input)?;
        let header_info = be_u16.parse_next(input)?;
        let sequence_number = be_u16.parse_next(input)?;
        let flags = be_u16.parse_next(input)?;
        let entry_count = be_u16
            .context(StrContext::Label("entry count"))
            .parse_next(input)?;
        let timestamp_offset = if flags & 0x4 != 0 {
            tlv_table.parse_next(input)?
        } else {
            None
        };
        let entries: Vec<DataEntry> =
            repeat(usize::from(entry_count), data_entry).parse_next(input)?;
        Ok(RtpPacket {
            transmit_offset,
            padding: header_info & (1 << 13) != 0,
            extension: header_info & (1 << 12) != 0,
            marker: header_info & (1 << 7) != 0,
            payload_type: (header_info & 0x7F) as u8,
            sequence_number,
            b_frame: flags & 0x2 != 0,
            repeat: flags & 0x1 != 0,
            timestamp_offset,
            entries,
        })
    })
    .parse_next(input)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HintSample {
    pub packets: Vec<RtpPacket>,
    /// Bytes after the packet table.
    pub extra: Vec<u8>,
}

impl HintSample {
    pub fn parse(data: &[u8], offset: u64) -> Result<Self, ParseError> {
        hint_sample
            .parse(stream(data))
            .map_err(|e| ParseError::from_winnow(ParseErrorKind::AtomParsing, e, (offset, data.len() as u64)))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.packets.len() as u16).to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        for packet in &self.packets {
            packet.write(&mut out);
        }
        out.extend_from_slice(&self.extra);
        out
    }

    pub fn is_b_frame(&self) -> bool {
        self.packets.first().is_some_and(|p| p.b_frame)
    }
}

fn hint_sample(input: &mut Stream<'_>) -> ModalResult<HintSample> {
    trace("hint_sample", move |input: &mut Stream<'_>| {
        let packet_count = be_u16
            .context(StrContext::Label("packet count"))
            .parse_next(input)?;
        let _reserved = be_u16.parse_next(input)?;
        let packets: Vec<RtpPacket> =
            repeat(usize::from(packet_count), rtp_packet).parse_next(input)?;
        let extra = rest_vec.parse_next(input)?;
        Ok(HintSample { packets, extra })
    })
    .parse_next(input)
}

/// Totals stored under `udta.hinf` when the file is closed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HintStatistics {
    /// Bytes sent including RTP headers (`trpy`).
    pub bytes_sent: u64,
    /// `nump`
    pub packets_sent: u64,
    /// Bytes sent excluding RTP headers (`tpyl`).
    pub payload_bytes: u64,
    /// Payload bytes taken from media samples (`dmed`).
    pub media_bytes: u64,
    /// Payload bytes carried in the hint samples (`dimm`).
    pub immediate_bytes: u64,
    /// Largest packet including its RTP header (`pmax`).
    pub max_packet_size: u32,
    /// Longest hint sample in milliseconds (`dmax`).
    pub max_duration_ms: u32,
}

/// Hinting state of an RTP hint track.
#[derive(Debug, Clone, Default)]
pub struct HintTrack {
    writing: Option<HintSample>,
    b_frame: bool,
    timestamp_offset: u32,
    next_sequence_number: u16,
    reading: Option<(u32, HintSample)>,
    pub(crate) stats: HintStatistics,
}

impl HintTrack {
    /// Starts a new hint sample.
    pub fn begin_hint(&mut self, b_frame: bool, timestamp_offset: u32) -> Result<()> {
        if self.writing.is_some() {
            return Err(Error::invalid("unwritten hint is still pending"));
        }
        self.writing = Some(HintSample::default());
        self.b_frame = b_frame;
        self.timestamp_offset = timestamp_offset;
        Ok(())
    }

    pub fn add_packet(&mut self, marker: bool, transmit_offset: i32, payload_type: u8) -> Result<()> {
        let hint = self
            .writing
            .as_mut()
            .ok_or_else(|| Error::invalid("no hint pending"))?;
        hint.packets.push(RtpPacket {
            transmit_offset,
            marker,
            payload_type,
            sequence_number: self.next_sequence_number,
            b_frame: self.b_frame,
            timestamp_offset: (self.timestamp_offset != 0).then_some(self.timestamp_offset),
            ..RtpPacket::default()
        });
        self.next_sequence_number = self.next_sequence_number.wrapping_add(1);
        Ok(())
    }

    fn current_packet(&mut self) -> Result<&mut RtpPacket> {
        self.writing
            .as_mut()
            .and_then(|hint| hint.packets.last_mut())
            .ok_or_else(|| Error::invalid("no packet pending"))
    }

    /// Appends payload bytes stored in the hint sample itself.
    pub fn add_immediate_data(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() || data.len() > MAX_IMMEDIATE_BYTES {
            return Err(Error::invalid(format!(
                "immediate data must be 1 to {MAX_IMMEDIATE_BYTES} bytes, got {}",
                data.len()
            )));
        }
        self.current_packet()?
            .entries
            .push(DataEntry::Immediate(data.to_vec()));
        Ok(())
    }

    pub fn add_sample_data(&mut self, sample_id: u32, offset: u32, length: u16) -> Result<()> {
        if length == 0 {
            return Err(Error::invalid("sample data of 0 bytes"));
        }
        self.current_packet()?.entries.push(DataEntry::Sample {
            track_ref_index: 0,
            length,
            sample_id,
            offset,
        });
        Ok(())
    }

    pub fn add_sample_description_data(&mut self, offset: u32, length: u16) -> Result<()> {
        self.current_packet()?
            .entries
            .push(DataEntry::SampleDescription {
                track_ref_index: 0,
                length,
                index: 1,
                offset,
            });
        Ok(())
    }

    /// Takes the finished hint sample and accounts for it in the statistics.
    pub fn finish_hint(&mut self, duration_ms: u64) -> Result<HintSample> {
        let hint = self
            .writing
            .take()
            .ok_or_else(|| Error::invalid("no hint pending"))?;
        for packet in &hint.packets {
            let payload = packet.payload_len() as u64;
            let size = payload + RTP_HEADER_SIZE as u64;
            self.stats.packets_sent += 1;
            self.stats.payload_bytes += payload;
            self.stats.bytes_sent += size;
            self.stats.max_packet_size = self.stats.max_packet_size.max(size as u32);
            for entry in &packet.entries {
                match entry {
                    DataEntry::Immediate(data) => self.stats.immediate_bytes += data.len() as u64,
                    DataEntry::Sample { length, .. } => {
                        self.stats.media_bytes += u64::from(*length)
                    }
                    _ => {}
                }
            }
        }
        self.stats.max_duration_ms = self
            .stats
            .max_duration_ms
            .max(u32::try_from(duration_ms).unwrap_or(u32::MAX));
        Ok(hint)
    }

    pub fn is_writing(&self) -> bool {
        self.writing.is_some()
    }

    /// Makes `hint` the sample that packet queries refer to.
    pub fn load(&mut self, sample_id: u32, hint: HintSample) {
        self.reading = Some((sample_id, hint));
    }

    /// The loaded hint sample and its id.
    pub fn loaded(&self) -> Result<(u32, &HintSample)> {
        self.reading
            .as_ref()
            .map(|(id, hint)| (*id, hint))
            .ok_or_else(|| Error::invalid("no hint has been read"))
    }

    pub fn packet(&self, index: usize) -> Result<&RtpPacket> {
        let (_, hint) = self.loaded()?;
        hint.packets
            .get(index)
            .ok_or_else(|| Error::not_found(format!("packet {index}")))
    }
}
