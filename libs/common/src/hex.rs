//! Hex formatting for wire dumps

use std::fmt::Write;

/// Space separated uppercase dump, as used in frame debug output
/// Example: [0x2B, 0x01, 0x04] -> "2B 01 04"
pub fn dump(data: &[u8]) -> String {
    let mut result = String::with_capacity(data.len() * 3);
    for (i, byte) in data.iter().enumerate() {
        if i > 0 {
            result.push(' ');
        }
        let _ = write!(&mut result, "{:02X}", byte);
    }
    result
}

/// Format an object identifier the way device documentation prints it
pub fn oid(id: u32) -> String {
    format!("0x{:08X}", id)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_dump() {
        assert_eq!(dump(&[0x2B, 0x05, 0x08]), "2B 05 08");
        assert_eq!(dump(&[0x0F]), "0F");
        assert_eq!(dump(&[]), "");
    }

    #[test]
    fn test_oid() {
        assert_eq!(oid(0xAA9AA253), "0xAA9AA253");
        assert_eq!(oid(0x0104EB6A), "0x0104EB6A");
    }
}
