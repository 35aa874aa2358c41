use derive_more::Deref;
use std::{fmt, str::FromStr};

use crate::Error;

#[derive(Clone, Copy, Deref, PartialEq, Eq, Hash)]
pub struct FourCC(pub(crate) [u8; 4]);

impl FourCC {
    pub const fn new(bytes: &[u8; 4]) -> Self {
        Self(*bytes)
    }

    pub fn into_bytes(self) -> [u8; 4] {
        self.0
    }

    /// Compares against one segment of a lookup path. `*` matches any type.
    pub(crate) fn matches_name(&self, name: &str) -> bool {
        name == "*" || name.as_bytes().eq_ignore_ascii_case(&self.0)
    }
}

impl From<[u8; 4]> for FourCC {
    fn from(value: [u8; 4]) -> Self {
        FourCC(value)
    }
}

impl FromStr for FourCC {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes: [u8; 4] = s
            .as_bytes()
            .try_into()
            .map_err(|_| Error::invalid(format!("atom type must be 4 bytes: {s:?}")))?;
        Ok(FourCC(bytes))
    }
}

impl PartialEq<&[u8; 4]> for FourCC {
    fn eq(&self, other: &&[u8; 4]) -> bool {
        &self.0 == *other
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => f.write_str(s),
            Err(_) => f.write_str(&convert_mac_roman_to_utf8(&self.0)),
        }
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCC({})", self)
    }
}

fn convert_mac_roman_to_utf8(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&byte| match byte {
            0xA9 => '©',
            0xAE => '®',
            0x99 => '™',
            b if b.is_ascii() => b as char,
            _ => '�',
        })
        .collect()
}
