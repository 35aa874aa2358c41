/*!
 * MPEG-4 tag-length-value descriptors (ISO/IEC 14496-1) as carried by `esds` and `iods`.
 */

use std::io;

use winnow::{
    binary::u8,
    combinator::trace,
    error::StrContext,
    token::take,
    ModalResult, Parser,
};

use crate::{
    atom::util::{
        parser::{descriptor_length, rest_vec, stream, Stream},
        serializer,
    },
    property::{read_properties, write_properties, BitReader, BitWriter, Property, StringFormat},
};

pub const OD_TAG: u8 = 0x01;
pub const IOD_TAG: u8 = 0x02;
pub const ES_TAG: u8 = 0x03;
pub const DECODER_CONFIG_TAG: u8 = 0x04;
pub const DEC_SPECIFIC_TAG: u8 = 0x05;
pub const SL_CONFIG_TAG: u8 = 0x06;
pub const ES_ID_INC_TAG: u8 = 0x0E;
pub const ES_ID_REF_TAG: u8 = 0x0F;
pub const MP4_IOD_TAG: u8 = 0x10;
pub const MP4_OD_TAG: u8 = 0x11;
pub const EXT_DESCR_TAGS: TagRange = TagRange::new(0x80, 0xFE);

/// Inclusive range of tags a descriptor array accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagRange {
    lo: u8,
    hi: u8,
}

impl TagRange {
    pub const fn new(lo: u8, hi: u8) -> Self {
        Self { lo, hi }
    }

    pub const fn one(tag: u8) -> Self {
        Self { lo: tag, hi: tag }
    }

    pub fn contains(&self, tag: u8) -> bool {
        (self.lo..=self.hi).contains(&tag)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Descriptor {
    tag: u8,
    properties: Vec<Property>,
    /// Bytes used by the length field; kept from parsing so rewrites are byte identical.
    length_width: u8,
    trailing: Vec<u8>,
}

impl Descriptor {
    fn new(tag: u8) -> Self {
        Self {
            tag,
            properties: schema(tag),
            length_width: 4,
            trailing: Vec::new(),
        }
    }

    /// Builds a descriptor with generated defaults and its mandatory sub-descriptors.
    pub fn generate(tag: u8) -> Self {
        let mut descriptor = Self::new(tag);
        let set = |d: &mut Descriptor, name: &str, v: u64| {
            let result = d.property_mut(name).map(|p| p.set_integer(0, v));
            debug_assert!(
                matches!(result, Some(Ok(()))),
                "tag {tag:#04x} has no integer field {name}"
            );
        };
        match tag {
            ES_TAG => {
                descriptor.push_child("decConfigDescr", DECODER_CONFIG_TAG);
                descriptor.push_child("slConfigDescr", SL_CONFIG_TAG);
            }
            DECODER_CONFIG_TAG => set(&mut descriptor, "reserved", 1),
            SL_CONFIG_TAG => set(&mut descriptor, "predefined", 2),
            IOD_TAG | MP4_IOD_TAG => {
                set(&mut descriptor, "objectDescriptorId", 1);
                set(&mut descriptor, "reserved", 0xF);
                for name in [
                    "ODProfileLevelId",
                    "sceneProfileLevelId",
                    "audioProfileLevelId",
                    "visualProfileLevelId",
                    "graphicsProfileLevelId",
                ] {
                    set(&mut descriptor, name, 0xFF);
                }
            }
            OD_TAG | MP4_OD_TAG => {
                set(&mut descriptor, "objectDescriptorId", 1);
                set(&mut descriptor, "reserved", 0x1F);
            }
            _ => {}
        }
        descriptor
    }

    fn push_child(&mut self, array: &str, tag: u8) {
        if let Some(descriptors) = self.property_mut(array).and_then(Property::descriptors_mut) {
            descriptors.push(Self::generate(tag));
        }
    }

    pub fn tag(&self) -> u8 {
        self.tag
    }

    pub fn properties(&self) -> &[Property] {
        &self.properties
    }

    pub fn properties_mut(&mut self) -> &mut [Property] {
        &mut self.properties
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties
            .iter()
            .find(|p| p.name().eq_ignore_ascii_case(name))
    }

    pub fn property_mut(&mut self, name: &str) -> Option<&mut Property> {
        self.properties
            .iter_mut()
            .find(|p| p.name().eq_ignore_ascii_case(name))
    }

    pub fn parse(input: &mut Stream<'_>) -> ModalResult<Self> {
        trace("descriptor", move |input: &mut Stream<'_>| {
            let tag = u8.context(StrContext::Label("tag")).parse_next(input)?;
            let (length, length_width) = descriptor_length
                .context(StrContext::Label("length"))
                .parse_next(input)?;
            let body: &[u8] = take(length as usize)
                .context(StrContext::Label("body"))
                .parse_next(input)?;

            let mut descriptor = Self::new(tag);
            descriptor.length_width = length_width;
            let mut body = stream(body);
            read_properties(&mut BitReader::new(&mut body), &mut descriptor.properties)?;
            descriptor.trailing = rest_vec.parse_next(&mut body)?;
            Ok(descriptor)
        })
        .parse_next(input)
    }

    fn body_size(&self) -> u64 {
        crate::property::properties_size(&self.properties) + self.trailing.len() as u64
    }

    /// Width of the length field actually written, grown if the body no longer fits.
    fn effective_length_width(&self) -> u8 {
        let body = self.body_size();
        let needed = match body {
            0..=0x7F => 1,
            0x80..=0x3FFF => 2,
            0x4000..=0x1F_FFFF => 3,
            _ => 4,
        };
        self.length_width.max(needed)
    }

    /// Total serialized size including tag and length bytes.
    pub fn size(&self) -> u64 {
        1 + u64::from(self.effective_length_width()) + self.body_size()
    }

    pub(crate) fn write(&self, out: &mut Vec<u8>) {
        out.push(self.tag);
        out.extend(serializer::descriptor_length(
            self.body_size() as u32,
            self.effective_length_width(),
        ));
        write_properties(&mut BitWriter::new(out), &self.properties);
        out.extend_from_slice(&self.trailing);
    }

    pub(crate) fn dump(
        &self,
        out: &mut dyn io::Write,
        indent: usize,
        dump_implicits: bool,
    ) -> io::Result<()> {
        writeln!(
            out,
            "{:pad$}descriptor {} ({:#04x})",
            "",
            tag_name(self.tag),
            self.tag,
            pad = indent * 2
        )?;
        for property in &self.properties {
            property.dump(out, indent + 1, dump_implicits)?;
        }
        Ok(())
    }
}

fn tag_name(tag: u8) -> &'static str {
    match tag {
        OD_TAG | MP4_OD_TAG => "OD",
        IOD_TAG | MP4_IOD_TAG => "IOD",
        ES_TAG => "ES",
        DECODER_CONFIG_TAG => "DecoderConfig",
        DEC_SPECIFIC_TAG => "DecoderSpecificInfo",
        SL_CONFIG_TAG => "SLConfig",
        ES_ID_INC_TAG => "ES_ID_Inc",
        ES_ID_REF_TAG => "ES_ID_Ref",
        _ => "unknown",
    }
}

fn schema(tag: u8) -> Vec<Property> {
    match tag {
        ES_TAG => vec![
            Property::u16("ESID"),
            Property::bits("streamDependenceFlag", 1),
            Property::bits("URLFlag", 1),
            Property::bits("OCRstreamFlag", 1),
            Property::bits("streamPriority", 5),
            Property::u16("dependsOnESID").if_non_zero("streamDependenceFlag"),
            Property::text("URL", StringFormat::Counted).if_non_zero("URLFlag"),
            Property::u16("OCRESID").if_non_zero("OCRstreamFlag"),
            Property::descriptor_array("decConfigDescr", TagRange::one(DECODER_CONFIG_TAG), Some(1)),
            Property::descriptor_array("slConfigDescr", TagRange::one(SL_CONFIG_TAG), Some(1)),
            Property::descriptor_array("extDescr", EXT_DESCR_TAGS, None),
        ],
        DECODER_CONFIG_TAG => vec![
            Property::u8("objectTypeId"),
            Property::bits("streamType", 6),
            Property::bits("upStream", 1),
            Property::bits("reserved", 1),
            Property::u24("bufferSizeDB"),
            Property::u32("maxBitrate"),
            Property::u32("avgBitrate"),
            Property::descriptor_array("decSpecificInfo", TagRange::one(DEC_SPECIFIC_TAG), Some(1)),
            Property::descriptor_array("extDescr", EXT_DESCR_TAGS, None),
        ],
        DEC_SPECIFIC_TAG => vec![Property::blob("info", crate::property::BytesFormat::ToEnd)],
        SL_CONFIG_TAG => vec![
            Property::u8("predefined"),
            Property::blob("data", crate::property::BytesFormat::ToEnd),
        ],
        ES_ID_INC_TAG => vec![Property::u32("id")],
        ES_ID_REF_TAG => vec![Property::u16("refIndex")],
        IOD_TAG | MP4_IOD_TAG => vec![
            Property::bits("objectDescriptorId", 10),
            Property::bits("URLFlag", 1),
            Property::bits("includeInlineProfileLevelFlag", 1),
            Property::bits("reserved", 4),
            Property::text("URL", StringFormat::Counted).if_non_zero("URLFlag"),
            Property::u8("ODProfileLevelId").if_zero("URLFlag"),
            Property::u8("sceneProfileLevelId").if_zero("URLFlag"),
            Property::u8("audioProfileLevelId").if_zero("URLFlag"),
            Property::u8("visualProfileLevelId").if_zero("URLFlag"),
            Property::u8("graphicsProfileLevelId").if_zero("URLFlag"),
            Property::descriptor_array("esIds", TagRange::new(ES_ID_INC_TAG, ES_ID_REF_TAG), None),
            Property::descriptor_array("extDescr", EXT_DESCR_TAGS, None),
        ],
        OD_TAG | MP4_OD_TAG => vec![
            Property::bits("objectDescriptorId", 10),
            Property::bits("URLFlag", 1),
            Property::bits("reserved", 5),
            Property::text("URL", StringFormat::Counted).if_non_zero("URLFlag"),
            Property::descriptor_array("esIds", TagRange::new(ES_ID_INC_TAG, ES_ID_REF_TAG), None),
            Property::descriptor_array("extDescr", EXT_DESCR_TAGS, None),
        ],
        _ => vec![Property::blob("data", crate::property::BytesFormat::ToEnd)],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn es_descriptor_bytes() -> Vec<u8> {
        vec![
            0x03, 0x19, // ES, length 25
            0x00, 0x01, // ESID
            0x00, // flags + priority
            0x04, 0x11, // DecoderConfig, length 17
            0x40, // objectTypeId
            0x15, // streamType 5, upStream 0, reserved 1
            0x00, 0x00, 0x00, // bufferSizeDB
            0x00, 0x00, 0xFA, 0x00, // maxBitrate
            0x00, 0x00, 0xFA, 0x00, // avgBitrate
            0x05, 0x02, 0x12, 0x10, // DecSpecificInfo
            0x06, 0x01, 0x02, // SLConfig
        ]
    }

    #[test]
    fn test_parse_es_descriptor() {
        let data = es_descriptor_bytes();
        let descriptor = Descriptor::parse.parse(stream(&data)).unwrap();
        assert_eq!(descriptor.tag(), ES_TAG);
        assert_eq!(descriptor.property("ESID").unwrap().integer(0).unwrap(), 1);

        let config = &descriptor.property("decConfigDescr").unwrap().descriptors().unwrap()[0];
        assert_eq!(config.property("objectTypeId").unwrap().integer(0).unwrap(), 0x40);
        assert_eq!(config.property("streamType").unwrap().integer(0).unwrap(), 5);
        let info = &config.property("decSpecificInfo").unwrap().descriptors().unwrap()[0];
        assert_eq!(
            info.property("info").unwrap().bytes(0).unwrap(),
            vec![0x12, 0x10]
        );

        let mut out = Vec::new();
        descriptor.write(&mut out);
        assert_eq!(out, data);
        assert_eq!(descriptor.size(), data.len() as u64);
    }

    #[test]
    fn test_length_width_preserved() {
        let data = vec![0x0E, 0x80, 0x80, 0x80, 0x04, 0x00, 0x00, 0x00, 0x02];
        let descriptor = Descriptor::parse.parse(stream(&data)).unwrap();
        assert_eq!(descriptor.property("id").unwrap().integer(0).unwrap(), 2);
        let mut out = Vec::new();
        descriptor.write(&mut out);
        assert_eq!(out, data);
    }

    #[test]
    fn test_unknown_tag_keeps_bytes() {
        let data = vec![0x42, 0x03, 1, 2, 3];
        let descriptor = Descriptor::parse.parse(stream(&data)).unwrap();
        assert_eq!(descriptor.property("data").unwrap().bytes(0).unwrap(), vec![1, 2, 3]);
        let mut out = Vec::new();
        descriptor.write(&mut out);
        assert_eq!(out, data);
    }

    #[test]
    fn test_generate_es_descriptor() {
        let descriptor = Descriptor::generate(ES_TAG);
        let config = &descriptor.property("decConfigDescr").unwrap().descriptors().unwrap()[0];
        assert_eq!(config.property("reserved").unwrap().integer(0).unwrap(), 1);
        let sl = &descriptor.property("slConfigDescr").unwrap().descriptors().unwrap()[0];
        assert_eq!(sl.property("predefined").unwrap().integer(0).unwrap(), 2);
        // tag + 4 length bytes + 3 fields + decoder config (5 + 13) + sl config (5 + 1)
        assert_eq!(descriptor.size(), 5 + 3 + 18 + 6);
    }

    #[test]
    fn test_generate_sets_defaults_for_every_known_tag() {
        let od = Descriptor::generate(MP4_OD_TAG);
        assert_eq!(od.property("objectDescriptorId").unwrap().integer(0).unwrap(), 1);
        assert_eq!(od.property("reserved").unwrap().integer(0).unwrap(), 0x1F);
        let iod = Descriptor::generate(IOD_TAG);
        assert_eq!(iod.property("reserved").unwrap().integer(0).unwrap(), 0xF);
        for tag in [OD_TAG, DECODER_CONFIG_TAG, DEC_SPECIFIC_TAG, SL_CONFIG_TAG, ES_ID_INC_TAG] {
            assert_eq!(Descriptor::generate(tag).tag(), tag);
        }
    }

    #[test]
    fn test_generate_iod_profile_levels() {
        let descriptor = Descriptor::generate(MP4_IOD_TAG);
        let mut out = Vec::new();
        descriptor.write(&mut out);
        assert_eq!(
            out,
            vec![0x10, 0x80, 0x80, 0x80, 0x07, 0x00, 0x4F, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]
        );
    }
}
