use std::fmt;

pub struct DebugEllipsis(pub Option<usize>);

impl fmt::Debug for DebugEllipsis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("...")?;
        if let Some(size) = self.0 {
            write!(f, "({size})")?;
        }
        Ok(())
    }
}

/// Length plus the first 16 bytes in hex, for dumps.
pub struct HexPreview<'a>(pub &'a [u8]);

impl fmt::Display for HexPreview<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} bytes>", self.0.len())?;
        for b in self.0.iter().take(16) {
            write!(f, " {b:02x}")?;
        }
        if self.0.len() > 16 {
            write!(f, " {:?}", DebugEllipsis(Some(self.0.len() - 16)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_preview() {
        assert_eq!(HexPreview(&[0xde, 0xad]).to_string(), "<2 bytes> de ad");
        let long = [0u8; 18];
        assert!(HexPreview(&long).to_string().ends_with("...(2)"));
    }
}
