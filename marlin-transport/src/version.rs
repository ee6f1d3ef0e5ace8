#![forbid(unsafe_code)]

//! Versioning fiber: a single protocol-version byte at the front of every
//! datagram. Mismatched versions are dropped before any further parsing.

use marlin_core::Buffer;

/// Current wire version.
pub const WIRE_VERSION: u8 = 0;

/// Check and strip the version byte. Returns `false` (buffer untouched)
/// on a short datagram or version mismatch.
pub fn strip_version(datagram: &mut Buffer) -> bool {
    match datagram.read_u8(0) {
        Some(v) if v == WIRE_VERSION => {
            datagram.cover_unsafe(1);
            true
        }
        _ => false,
    }
}

/// Write the version byte at position 0 of an outbound packet whose
/// layout reserves it.
pub fn write_version(packet: &mut Buffer) {
    packet.write_u8_unsafe(0, WIRE_VERSION);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_matching_version() {
        let mut buf = Buffer::from_vec(vec![WIRE_VERSION, 0xaa]);
        assert!(strip_version(&mut buf));
        assert_eq!(buf.as_slice(), &[0xaa]);
    }

    #[test]
    fn drops_mismatch() {
        let mut buf = Buffer::from_vec(vec![WIRE_VERSION + 1, 0xaa]);
        assert!(!strip_version(&mut buf));
        assert_eq!(buf.size(), 2);
    }

    #[test]
    fn drops_empty() {
        let mut buf = Buffer::from_vec(vec![]);
        assert!(!strip_version(&mut buf));
    }
}
