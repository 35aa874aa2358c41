use crate::FourCC;

/// Serializes an atom header. A 16 byte header is written when `header_size` asks for it or
/// when `size` does not fit in 32 bits.
pub fn atom_header(atom_type: FourCC, size: u64, header_size: u8) -> Vec<u8> {
    let mut result = Vec::with_capacity(16);
    if header_size == 16 || size > u64::from(u32::MAX) {
        result.extend_from_slice(&1u32.to_be_bytes());
        result.extend_from_slice(&atom_type.0);
        result.extend_from_slice(&size.to_be_bytes());
    } else {
        result.extend_from_slice(&(size as u32).to_be_bytes());
        result.extend_from_slice(&atom_type.0);
    }
    result
}

/// Encodes a descriptor length as `width` bytes of 7-bit groups, most significant first.
pub fn descriptor_length(length: u32, width: u8) -> Vec<u8> {
    (0..width)
        .rev()
        .map(|i| {
            let byte = ((length >> (7 * u32::from(i))) & 0x7F) as u8;
            if i > 0 {
                byte | 0x80
            } else {
                byte
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atom_header_widths() {
        let header = atom_header(FourCC::new(b"moov"), 108, 8);
        assert_eq!(header, vec![0, 0, 0, 108, b'm', b'o', b'o', b'v']);

        let header = atom_header(FourCC::new(b"mdat"), 16, 16);
        assert_eq!(header.len(), 16);
        assert_eq!(&header[..4], &[0, 0, 0, 1]);
        assert_eq!(&header[8..], &16u64.to_be_bytes());

        let header = atom_header(FourCC::new(b"mdat"), u64::from(u32::MAX) + 1, 8);
        assert_eq!(header.len(), 16);
    }

    #[test]
    fn test_descriptor_length() {
        assert_eq!(descriptor_length(0x19, 1), vec![0x19]);
        assert_eq!(descriptor_length(0x19, 4), vec![0x80, 0x80, 0x80, 0x19]);
        assert_eq!(descriptor_length(200, 2), vec![0x81, 0x48]);
    }
}
