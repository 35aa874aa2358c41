pub(crate) mod debug;
mod fourcc;
pub(crate) mod parser;
pub(crate) mod serializer;
mod time;

pub(crate) use debug::*;
pub use fourcc::*;
pub use time::*;
