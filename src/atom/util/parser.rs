use winnow::{
    binary::{be_u32, be_u64, length_and_then, u8},
    combinator::trace,
    error::{StrContext, StrContextValue},
    token::{rest, take, take_till},
    Bytes, LocatingSlice, ModalResult, Parser,
};

use crate::FourCC;

pub type Stream<'i> = LocatingSlice<&'i Bytes>;

pub fn stream(b: &[u8]) -> Stream<'_> {
    LocatingSlice::new(Bytes::new(b))
}

pub fn fourcc(input: &mut Stream<'_>) -> ModalResult<FourCC> {
    trace(
        "fourcc",
        (byte_array)
            .map(FourCC)
            .context(StrContext::Label("fourcc")),
    )
    .parse_next(input)
}

pub fn byte_array<const N: usize>(input: &mut Stream<'_>) -> ModalResult<[u8; N]> {
    trace(
        "byte_array",
        take(N).map(|data: &[u8]| {
            let mut buf = [0u8; N];
            buf.copy_from_slice(data);
            buf
        }),
    )
    .parse_next(input)
}

pub fn rest_vec(input: &mut Stream<'_>) -> ModalResult<Vec<u8>> {
    trace("rest_vec", rest.map(|data: &[u8]| data.to_vec())).parse_next(input)
}

/// Atom header as seen on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawHeader {
    pub atom_type: FourCC,
    /// Declared size, `None` for the size-0 "to end" sentinel.
    pub size: Option<u64>,
    pub header_size: u8,
}

pub fn atom_header(input: &mut Stream<'_>) -> ModalResult<RawHeader> {
    trace("atom_header", move |input: &mut Stream<'_>| {
        let size = be_u32
            .context(StrContext::Label("size"))
            .parse_next(input)?;
        let atom_type = fourcc.parse_next(input)?;
        let (size, header_size) = match size {
            0 => (None, 8),
            1 => (
                Some(
                    be_u64
                        .context(StrContext::Label("extended size"))
                        .parse_next(input)?,
                ),
                16,
            ),
            n => (Some(u64::from(n)), 8),
        };
        Ok(RawHeader {
            atom_type,
            size,
            header_size,
        })
    })
    .parse_next(input)
}

/// Parses a u8 len, and then a UTF8 string with that len
pub fn pascal_string(input: &mut Stream<'_>) -> ModalResult<String> {
    trace("pascal_string", length_and_then(u8, utf8_string)).parse_next(input)
}

/// Parses a UTF8 string from the remainder of the buffer
pub fn utf8_string(input: &mut Stream<'_>) -> ModalResult<String> {
    trace(
        "utf8_string",
        rest.map(|data: &[u8]| String::from_utf8_lossy(data).into_owned())
            .context(StrContext::Expected(StrContextValue::Description(
                "UTF8 string",
            ))),
    )
    .parse_next(input)
}

/// Parses bytes up to a NUL (consumed) or the end of input.
pub fn c_string(input: &mut Stream<'_>) -> ModalResult<String> {
    trace("c_string", move |input: &mut Stream<'_>| {
        let data: &[u8] = take_till(0.., 0u8).parse_next(input)?;
        let value = String::from_utf8_lossy(data).into_owned();
        if !input.is_empty() {
            u8.parse_next(input)?;
        }
        Ok(value)
    })
    .parse_next(input)
}

/// Scales of the 16.16 and 8.8 fixed point properties.
pub const FIXED_POINT_16X16_SCALE: f32 = 65536.0;
pub const FIXED_POINT_8X8_SCALE: f32 = 256.0;

/// Reads an MPEG-4 descriptor length: 1 to 4 bytes of 7-bit groups.
/// Returns the length and the number of bytes it occupied.
pub fn descriptor_length(input: &mut Stream<'_>) -> ModalResult<(u32, u8)> {
    trace("descriptor_length", move |input: &mut Stream<'_>| {
        let mut length = 0u32;
        let mut width = 0u8;
        for _ in 0..4 {
            let byte = u8.parse_next(input)?;
            width += 1;
            length = (length << 7) | u32::from(byte & 0b0111_1111);
            if (byte & 0b1000_0000) == 0 {
                break;
            }
        }
        Ok((length, width))
    })
    .parse_next(input)
}
