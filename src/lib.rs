pub mod atom;
pub mod descriptor;
pub mod error;
pub mod file;
pub mod parser;
pub mod property;
pub mod reader;
pub mod track;
pub mod writer;

pub use atom::{Atom, FourCC};
pub use descriptor::Descriptor;
pub use error::{Error, ErrorKind, Result};
pub use file::{Mode, Mp4File, RtpPayload};
pub use parser::{ParseError, ParseErrorKind};
pub use property::Property;
pub use reader::Mp4Reader;
pub use track::{SampleTable, Track};
pub use writer::Mp4Writer;
