use derive_more::Display;
use std::io::{Read, Seek, SeekFrom};
use thiserror::Error;
use winnow::{
    combinator::{cut_err, fail, trace},
    error::{ContextError, ErrMode, StrContext},
    stream::{Location, Stream as _},
    token::take,
    ModalResult, Parser,
};

use crate::{
    atom::{
        schema,
        util::parser::{atom_header, rest_vec, stream, RawHeader, Stream},
        Atom, AtomHeader, AtomKind, FourCC, FREE, MDAT, ROOT, SKIP,
    },
    property::{read_properties, BitReader, BytesFormat, Property},
    reader::Mp4Reader,
};

#[derive(Debug, Error)]
#[error(
    "{kind}{}",
    self.location.map(|(offset, length)|
        format!(" at offset {offset} with length {length}")).unwrap_or_default()
)]
pub struct ParseError {
    /// The kind of error that occurred during parsing.
    pub(crate) kind: ParseErrorKind,
    /// location is the (offset, length) of the input data related to the error
    pub(crate) location: Option<(u64, u64)>,
    /// The source error that caused this error.
    #[source]
    pub(crate) source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    #[display("I/O error")]
    Io,
    #[display("EOF error")]
    Eof,
    #[display("Invalid atom header")]
    InvalidHeader,
    #[display("Invalid atom size")]
    InvalidSize,
    #[display("Atom parsing failed")]
    AtomParsing,
}

impl ParseError {
    pub(crate) fn new(kind: ParseErrorKind, location: Option<(u64, u64)>) -> Self {
        Self {
            kind,
            location,
            source: None,
        }
    }

    pub fn kind(&self) -> ParseErrorKind {
        self.kind
    }

    pub fn location(&self) -> Option<(u64, u64)> {
        self.location
    }

    pub(crate) fn from_winnow(
        kind: ParseErrorKind,
        error: winnow::error::ParseError<Stream<'_>, ContextError>,
        location: (u64, u64),
    ) -> Self {
        Self {
            kind,
            location: Some((location.0 + error.offset() as u64, location.1)),
            source: Some(error.into_inner().to_string().into()),
        }
    }
}

fn is_on_disk(atom_type: FourCC) -> bool {
    [MDAT, FREE, SKIP].contains(&&atom_type.0)
}

/// Parses an atom body already read into memory. `header.start` must be absolute so that child
/// offsets are too.
pub(crate) fn parse_atom_body(
    header: AtomHeader,
    parent: FourCC,
    body: &[u8],
) -> Result<Atom, ParseError> {
    let location = (header.body_start(), body.len() as u64);
    atom_body(header, parent)
        .parse(stream(body))
        .map_err(|e| ParseError::from_winnow(ParseErrorKind::AtomParsing, e, location))
}

fn atom_body<'i>(
    header: AtomHeader,
    parent: FourCC,
) -> impl Parser<Stream<'i>, Atom, ErrMode<ContextError>> {
    trace("atom_body", move |input: &mut Stream<'i>| -> ModalResult<Atom> {
        let atom_type = header.atom_type;
        let version = if schema::is_versioned(atom_type, parent) {
            input.first().copied().unwrap_or(0)
        } else {
            0
        };
        let mut atom = Atom::with_version(atom_type, parent, version);
        atom.header = header;

        if atom.kind == AtomKind::Raw {
            atom.properties = vec![Property::blob("data", BytesFormat::ToEnd)
                .with_bytes(rest_vec.parse_next(input)?)];
            return Ok(atom);
        }

        cut_err(|input: &mut Stream<'i>| {
            read_properties(&mut BitReader::new(input), &mut atom.properties)
        })
        .context(StrContext::Label("properties"))
        .parse_next(input)?;
        schema::after_read(atom_type, &mut atom.properties);

        let is_container = schema::template(atom_type, parent, version).is_some_and(|t| t.container);
        if is_container {
            while input.len() >= 8 {
                let checkpoint = input.checkpoint();
                match child_atom(input, atom_type, header.body_start()) {
                    Ok(child) => atom.children.push(child),
                    Err(ErrMode::Backtrack(_)) => {
                        input.reset(&checkpoint);
                        tracing::warn!(
                            "{atom_type}: keeping {} bytes that do not form an atom",
                            input.len()
                        );
                        break;
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        atom.trailing = rest_vec.parse_next(input)?;
        if !atom.trailing.is_empty() {
            tracing::debug!("{atom_type}: {} trailing bytes retained", atom.trailing.len());
        }
        Ok(atom)
    })
}

/// One complete child atom. Offsets in `input` are relative to `base`.
fn child_atom(input: &mut Stream<'_>, parent: FourCC, base: u64) -> ModalResult<Atom> {
    let start = base + input.current_token_start() as u64;
    let RawHeader {
        atom_type,
        size,
        header_size,
    } = atom_header.parse_next(input)?;
    let (size, extends_to_end) = match size {
        Some(size) => (size, false),
        None => (u64::from(header_size) + input.len() as u64, true),
    };
    if size < u64::from(header_size) {
        return fail.context(StrContext::Label("atom size")).parse_next(input);
    }
    let body: &[u8] = take(size - u64::from(header_size))
        .context(StrContext::Label("atom body"))
        .parse_next(input)?;
    let header = AtomHeader {
        atom_type,
        start,
        size,
        header_size,
        extends_to_end,
    };
    tracing::trace!(%atom_type, start, size, "parsed atom");
    cut_err(atom_body(header, parent)).parse_next(&mut stream(body))
}

/// Reads the top-level atoms of a file. `mdat`, `free` and `skip` are not loaded.
pub(crate) fn read_root<R: Read + Seek>(
    reader: &mut Mp4Reader<R>,
    file_size: u64,
) -> Result<Atom, ParseError> {
    let mut root = Atom::root();
    while reader.current_offset + 8 <= file_size {
        let start = reader.current_offset;
        let mut buf = [0u8; 16];
        reader.read_exact(&mut buf[..8])?;
        let width = if buf[..4] == [0, 0, 0, 1] {
            reader.read_exact(&mut buf[8..])?;
            16
        } else {
            8
        };
        let raw = atom_header
            .parse(stream(&buf[..width]))
            .map_err(|e| ParseError::from_winnow(ParseErrorKind::InvalidHeader, e, (start, width as u64)))?;

        let header_size = u64::from(raw.header_size);
        let size = raw.size.unwrap_or(file_size - start);
        if size < header_size || start + size > file_size {
            return Err(ParseError::new(
                ParseErrorKind::InvalidSize,
                Some((start, size)),
            ));
        }
        let header = AtomHeader {
            atom_type: raw.atom_type,
            start,
            size,
            header_size: raw.header_size,
            extends_to_end: raw.size.is_none(),
        };
        tracing::trace!(atom_type = %raw.atom_type, start, size, "top-level atom");

        if is_on_disk(raw.atom_type) {
            root.children.push(Atom::on_disk(header));
            reader.seek(SeekFrom::Start(start + size))?;
            continue;
        }
        let body = reader.read_data((size - header_size) as usize)?;
        root.children.push(parse_atom_body(header, ROOT, &body)?);
    }
    let leftover = file_size.saturating_sub(reader.current_offset);
    if leftover > 0 {
        tracing::warn!("ignoring {leftover} bytes after the last atom");
    }
    root.header.size = root.children.iter().map(Atom::size).sum();
    Ok(root)
}
