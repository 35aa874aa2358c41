/*!
 * Per-type property templates, generated defaults and required children.
 */

use crate::{
    atom::util::mp4_timestamp_now,
    descriptor::{TagRange, ES_TAG, MP4_IOD_TAG},
    property::{BytesFormat, FloatFormat, Property, StringFormat},
    FourCC,
};

pub(crate) struct Template {
    /// Body may contain child atoms after the properties.
    pub container: bool,
    pub properties: Vec<Property>,
}

const IDENTITY_MATRIX: [u64; 9] = [0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000];

/// Packed ISO-639-2 code for "und".
const LANGUAGE_UND: u64 = 0x55C4;

fn full(version: u8, flags: u64, properties: Vec<Property>) -> Vec<Property> {
    let mut all = vec![
        Property::u8("version").with_integer(u64::from(version)),
        Property::u24("flags").with_integer(flags),
    ];
    all.extend(properties);
    all
}

fn container() -> Option<Template> {
    Some(Template {
        container: true,
        properties: Vec::new(),
    })
}

fn leaf(properties: Vec<Property>) -> Option<Template> {
    Some(Template {
        container: false,
        properties,
    })
}

fn with_children(properties: Vec<Property>) -> Option<Template> {
    Some(Template {
        container: true,
        properties,
    })
}

fn counted_table(columns: Vec<Property>) -> Vec<Property> {
    vec![
        Property::u32("entryCount"),
        Property::table("entries", "entryCount", columns),
    ]
}

fn sample_entry_header() -> Vec<Property> {
    vec![
        Property::reserved("reserved1", 6),
        Property::u16("dataReferenceIndex").with_integer(1),
    ]
}

/// Whether the atom carries a leading version and flags.
pub(crate) fn is_versioned(atom_type: FourCC, parent: FourCC) -> bool {
    template(atom_type, parent, 0)
        .and_then(|t| t.properties.first().map(|p| p.name() == "version"))
        .unwrap_or(false)
}

/// Property layout for `atom_type` found under `parent`. `None` for unknown atoms.
pub(crate) fn template(atom_type: FourCC, parent: FourCC, version: u8) -> Option<Template> {
    let t = |name: &'static str| Property::versioned(name, version);
    match (&atom_type.0, &parent.0) {
        (b"moov" | b"trak" | b"mdia" | b"minf" | b"dinf" | b"stbl" | b"edts" | b"udta", _)
        | (b"hnti" | b"hinf" | b"tref", _) => container(),
        (b"ftyp", _) => leaf(vec![
            Property::text("majorBrand", StringFormat::Fixed(4)).with_string("mp42"),
            Property::u32("minorVersion"),
            Property::u32("compatibleBrandsCount").implicit(),
            Property::table_to_end(
                "compatibleBrands",
                "compatibleBrandsCount",
                vec![Property::text("brand", StringFormat::Fixed(4))],
            ),
        ]),
        (b"mvhd", _) => leaf(full(
            version,
            0,
            vec![
                t("creationTime"),
                t("modificationTime"),
                Property::u32("timeScale").with_integer(1000),
                t("duration"),
                Property::floating("rate", FloatFormat::Fixed16x16).with_float(1.0),
                Property::floating("volume", FloatFormat::Fixed8x8).with_float(1.0),
                Property::reserved("reserved", 10),
                Property::u32("matrix").with_integers(&IDENTITY_MATRIX),
                Property::reserved("predefined", 24),
                Property::u32("nextTrackId").with_integer(1),
            ],
        )),
        (b"iods", _) => leaf(full(
            version,
            0,
            vec![Property::descriptor_array("", TagRange::one(MP4_IOD_TAG), Some(1))],
        )),
        (b"tkhd", _) => leaf(full(
            version,
            0,
            vec![
                t("creationTime"),
                t("modificationTime"),
                Property::u32("trackId"),
                Property::reserved("reserved1", 4),
                t("duration"),
                Property::reserved("reserved2", 8),
                Property::u16("layer"),
                Property::u16("alternateGroup"),
                Property::floating("volume", FloatFormat::Fixed8x8),
                Property::reserved("reserved3", 2),
                Property::u32("matrix").with_integers(&IDENTITY_MATRIX),
                Property::floating("width", FloatFormat::Fixed16x16),
                Property::floating("height", FloatFormat::Fixed16x16),
            ],
        )),
        (b"hint" | b"dpnd" | b"ipir" | b"mpod" | b"sync", b"tref") => leaf(vec![
            Property::u32("entryCount").implicit(),
            Property::table_to_end("entries", "entryCount", vec![Property::u32("trackId")]),
        ]),
        (b"elst", _) => leaf(full(
            version,
            0,
            counted_table(vec![
                t("segmentDuration"),
                t("mediaTime"),
                Property::u16("mediaRate"),
                Property::u16("mediaRateFraction"),
            ]),
        )),
        (b"mdhd", _) => leaf(full(
            version,
            0,
            vec![
                t("creationTime"),
                t("modificationTime"),
                Property::u32("timeScale"),
                t("duration"),
                Property::u16("language").with_integer(LANGUAGE_UND),
                Property::u16("quality"),
            ],
        )),
        (b"hdlr", _) => leaf(full(
            version,
            0,
            vec![
                Property::reserved("reserved1", 4),
                Property::text("handlerType", StringFormat::Fixed(4)),
                Property::reserved("reserved2", 12),
                Property::text("name", StringFormat::NullTerminated),
            ],
        )),
        (b"vmhd", _) => leaf(full(
            version,
            1,
            vec![
                Property::u16("graphicsMode"),
                Property::u16("opColor").array(3),
            ],
        )),
        (b"smhd", _) => leaf(full(
            version,
            0,
            vec![Property::u16("balance"), Property::reserved("reserved", 2)],
        )),
        (b"hmhd", _) => leaf(full(
            version,
            0,
            vec![
                Property::u16("maxPduSize"),
                Property::u16("avgPduSize"),
                Property::u32("maxBitRate"),
                Property::u32("avgBitRate"),
                Property::u32("slidingAvgBitRate"),
            ],
        )),
        (b"nmhd", _) => leaf(full(version, 0, Vec::new())),
        (b"dref" | b"stsd", _) => with_children(full(version, 0, vec![Property::u32("entryCount")])),
        (b"url ", _) => leaf(full(
            version,
            0,
            vec![Property::text("location", StringFormat::NullTerminated).unless_flag(1)],
        )),
        (b"urn ", _) => leaf(full(
            version,
            0,
            vec![
                Property::text("name", StringFormat::NullTerminated),
                Property::text("location", StringFormat::NullTerminated),
            ],
        )),
        (b"mp4a", _) => {
            let mut properties = sample_entry_header();
            properties.extend([
                Property::u16("soundVersion"),
                Property::reserved("reserved2", 6),
                Property::u16("channels").with_integer(2),
                Property::u16("sampleSize").with_integer(16),
                Property::reserved("reserved3", 4),
                Property::u16("timeScale"),
                Property::reserved("reserved4", 2),
            ]);
            with_children(properties)
        }
        (b"mp4v", _) => {
            let mut properties = sample_entry_header();
            properties.extend([
                Property::reserved("reserved2", 16),
                Property::u16("width"),
                Property::u16("height"),
                Property::reserved_with(
                    "reserved3",
                    &[0, 0x48, 0, 0, 0, 0x48, 0, 0, 0, 0, 0, 0, 0, 1],
                ),
                Property::reserved("compressorName", 32),
                Property::reserved_with("reserved4", &[0, 0x18, 0xFF, 0xFF]),
            ]);
            with_children(properties)
        }
        (b"mp4s", _) => with_children(sample_entry_header()),
        (b"rtp ", b"stsd") => {
            let mut properties = sample_entry_header();
            properties.extend([
                Property::u16("hintTrackVersion").with_integer(1),
                Property::u16("highestCompatibleVersion").with_integer(1),
                Property::u32("maxPacketSize"),
            ]);
            with_children(properties)
        }
        (b"rtp ", _) => leaf(vec![
            Property::text("descriptionFormat", StringFormat::Fixed(4)).with_string("sdp "),
            Property::text("sdpText", StringFormat::ToEnd),
        ]),
        (b"sdp ", _) => leaf(vec![Property::text("sdpText", StringFormat::ToEnd)]),
        (b"tims", _) => leaf(vec![Property::u32("timeScale")]),
        (b"tsro" | b"snro", _) => leaf(vec![Property::u32("offset")]),
        (b"esds", _) => leaf(full(
            version,
            0,
            vec![Property::descriptor_array("", TagRange::one(ES_TAG), Some(1))],
        )),
        (b"stts", _) => leaf(full(
            version,
            0,
            counted_table(vec![Property::u32("sampleCount"), Property::u32("sampleDelta")]),
        )),
        (b"ctts", _) => leaf(full(
            version,
            0,
            counted_table(vec![Property::u32("sampleCount"), Property::u32("sampleOffset")]),
        )),
        (b"stsc", _) => leaf(full(
            version,
            0,
            counted_table(vec![
                Property::u32("firstChunk"),
                Property::u32("samplesPerChunk"),
                Property::u32("sampleDescriptionIndex"),
                Property::u32("firstSample").implicit(),
            ]),
        )),
        (b"stsz", _) => leaf(full(
            version,
            0,
            vec![
                Property::u32("sampleSize"),
                Property::u32("sampleCount"),
                Property::table("entries", "sampleCount", vec![Property::u32("sampleSize")])
                    .if_zero("sampleSize"),
            ],
        )),
        (b"stco", _) => leaf(full(version, 0, counted_table(vec![Property::u32("chunkOffset")]))),
        (b"co64", _) => leaf(full(version, 0, counted_table(vec![Property::u64("chunkOffset")]))),
        (b"stss", _) => leaf(full(version, 0, counted_table(vec![Property::u32("sampleNumber")]))),
        (b"trpy" | b"tpyl" | b"dmed" | b"dimm" | b"drep", b"hinf") => {
            leaf(vec![Property::u64("bytes")])
        }
        (b"nump", b"hinf") => leaf(vec![Property::u64("packets")]),
        (b"maxr", b"hinf") => leaf(vec![Property::u32("granularity"), Property::u32("bytes")]),
        (b"tmin" | b"tmax" | b"dmax", b"hinf") => leaf(vec![Property::u32("milliSecs")]),
        (b"pmax", b"hinf") => leaf(vec![Property::u32("bytes")]),
        (b"payt", b"hinf") => leaf(vec![
            Property::u32("payloadNumber"),
            Property::text("rtpMap", StringFormat::Counted),
        ]),
        (b"free" | b"skip", _) => leaf(vec![Property::blob("data", BytesFormat::ToEnd)]),
        _ => None,
    }
}

/// Version used when an atom is generated rather than parsed.
pub(crate) fn generated_version(atom_type: FourCC) -> u8 {
    match &atom_type.0 {
        b"mvhd" => 1,
        _ => 0,
    }
}

/// Children created along with a generated atom.
pub(crate) fn required_children(atom_type: FourCC, parent: FourCC) -> &'static [&'static [u8; 4]] {
    match (&atom_type.0, &parent.0) {
        (b"moov", _) => &[b"mvhd", b"iods"],
        (b"trak", _) => &[b"tkhd", b"mdia"],
        (b"mdia", _) => &[b"mdhd", b"hdlr", b"minf"],
        (b"minf", _) => &[b"dinf", b"stbl"],
        (b"dinf", _) => &[b"dref"],
        (b"stbl", _) => &[b"stsd", b"stts", b"stsc", b"stsz", b"stco"],
        (b"mp4a" | b"mp4v" | b"mp4s", _) => &[b"esds"],
        (b"rtp ", b"stsd") => &[b"tims"],
        (b"edts", _) => &[b"elst"],
        _ => &[],
    }
}

/// Values that depend on the moment of generation.
pub(crate) fn generated_properties(atom_type: FourCC, properties: &mut [Property]) {
    let now = mp4_timestamp_now();
    for property in properties.iter_mut() {
        let name = property.name();
        let result = match (&atom_type.0, name) {
            (b"mvhd" | b"tkhd" | b"mdhd", "creationTime" | "modificationTime") => {
                property.set_integer(0, now)
            }
            (b"ftyp", "compatibleBrands") => {
                let Some(brand) = property.column_mut("brand") else {
                    continue;
                };
                brand
                    .add_string("mp42")
                    .and_then(|_| brand.add_string("isom"))
            }
            (b"ftyp", "compatibleBrandsCount") => property.set_integer(0, 2),
            (b"esds", "") => property.add_descriptor(ES_TAG).map(|_| ()),
            (b"iods", "") => property.add_descriptor(MP4_IOD_TAG).map(|_| ()),
            _ => Ok(()),
        };
        if let Err(err) = result {
            tracing::warn!("failed to generate {atom_type}.{name}: {err}");
        }
    }
}

/// Fills implicit values that are derived from what was read.
pub(crate) fn after_read(atom_type: FourCC, properties: &mut [Property]) {
    if atom_type != b"stsc" {
        return;
    }
    let Some(table) = properties.iter_mut().find(|p| p.name() == "entries") else {
        return;
    };
    let rows = table.len();
    let column = |table: &Property, name: &str, row: usize| {
        table
            .column(name)
            .and_then(|c| c.integer(row).ok())
            .unwrap_or(0)
    };
    let mut first_sample = 1u64;
    for row in 0..rows {
        if row > 0 {
            let chunks = column(table, "firstChunk", row)
                .saturating_sub(column(table, "firstChunk", row - 1));
            first_sample += chunks * column(table, "samplesPerChunk", row - 1);
        }
        if let Some(first) = table.column_mut("firstSample") {
            if first.set_integer(row, first_sample).is_err() {
                return;
            }
        }
    }
}
