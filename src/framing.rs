//! Helpers for common message framing schemes.

use crate::callback::MessageFramer;

/// Build a framer for messages carrying a big-endian length prefix.
///
/// `header_len` is the prefix size in bytes (1, 2, 4 or 8). The delivered
/// message contains the prefix followed by the body.
///
/// # Panics
///
/// Panics if `header_len` is not one of the supported sizes.
pub fn length_prefix_framer(header_len: usize) -> MessageFramer {
    assert!(
        matches!(header_len, 1 | 2 | 4 | 8),
        "unsupported length prefix size: {header_len}"
    );

    Box::new(move |readable: &[u8]| {
        if readable.len() < header_len {
            return header_len - readable.len();
        }
        let mut prefix = [0u8; 8];
        prefix[8 - header_len..].copy_from_slice(&readable[..header_len]);
        let total = header_len + u64::from_be_bytes(prefix) as usize;
        total.saturating_sub(readable.len())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_byte_prefix() {
        let framer = length_prefix_framer(2);

        // empty buffer: the whole header is still missing
        assert_eq!(framer(&[]), 2);
        assert_eq!(framer(&[0x00]), 1);
        // header says 3 body bytes follow
        assert_eq!(framer(&[0x00, 0x03]), 3);
        assert_eq!(framer(&[0x00, 0x03, 0xaa]), 2);
        assert_eq!(framer(&[0x00, 0x03, 0xaa, 0xbb, 0xcc]), 0);
    }

    #[test]
    fn empty_body_is_complete_at_header() {
        let framer = length_prefix_framer(4);
        assert_eq!(framer(&[0, 0, 0, 0]), 0);
    }

    #[test]
    #[should_panic(expected = "unsupported length prefix size")]
    fn rejects_odd_header_len() {
        length_prefix_framer(3);
    }
}
