//! Wire format of the chip-select-gated bus exchange.
//!
//! The link carries no length header in this demo mode; the receiving role
//! instead treats `0x00` and `0xFF` as "no data" filler and takes the payload
//! to end at the last byte that is neither. Test vectors depend on this
//! convention, so it must not be replaced with a smarter framing.

/// Fixed outbound frame for the sending role.
pub const TX_FRAME: &[u8; 5] = b"HELLO";

/// The receiving role clocks out this many zero bytes per exchange.
pub const RX_FRAME_LEN: usize = 32;

pub const RX_OUT_FRAME: [u8; RX_FRAME_LEN] = [0_u8; RX_FRAME_LEN];

pub fn is_sentinel(byte: u8) -> bool {
    byte == 0x00 || byte == 0xFF
}

/// Returns the classified payload length: index of the last non-sentinel byte
/// plus one, or `None` when the response is all filler.
pub fn classify(response: &[u8]) -> Option<usize> {
    response
        .iter()
        .rposition(|byte| !is_sentinel(*byte))
        .map(|index| index + 1)
}

/// Space-separated two-digit uppercase hex, e.g. `"48 45 4C 4C 4F"`.
pub fn render_hex(payload: &[u8]) -> String {
    let mut out = String::with_capacity(payload.len() * 3);
    for (index, byte) in payload.iter().enumerate() {
        if index > 0 {
            out.push(' ');
        }
        out.push_str(&format!("{byte:02X}"));
    }
    out
}

/// Printable ASCII rendering; non-printable bytes become `.`.
pub fn render_ascii(payload: &[u8]) -> String {
    payload
        .iter()
        .map(|byte| {
            if (0x20..=0x7E).contains(byte) {
                *byte as char
            } else {
                '.'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn all_sentinel_response_is_empty() {
        let mut response = [0xFF_u8; RX_FRAME_LEN];
        response[0] = 0x00;
        response[17] = 0x00;

        assert_eq!(classify(&response), None);
    }

    #[test]
    fn single_byte_at_index_three_yields_length_four() {
        let mut response = [0x00_u8; RX_FRAME_LEN];
        response[3] = 0x41;

        assert_eq!(classify(&response), Some(4));
        assert_eq!(render_hex(&response[..4]), "00 00 00 41");
        assert_eq!(render_ascii(&response[..4]), "...A");
    }

    #[test]
    fn trailing_sentinels_are_not_payload() {
        let mut response = [0xFF_u8; RX_FRAME_LEN];
        response[..5].copy_from_slice(TX_FRAME);

        let len = classify(&response).unwrap();
        assert_eq!(len, 5);
        assert_eq!(render_hex(&response[..len]), "48 45 4C 4C 4F");
        assert_eq!(render_ascii(&response[..len]), "HELLO");
    }

    #[test]
    fn interior_sentinels_are_kept() {
        let response = [0x00, 0x48, 0x00, 0x49, 0x00, 0x00];

        let len = classify(&response).unwrap();
        assert_eq!(len, 4);
        assert_eq!(render_hex(&response[..len]), "00 48 00 49");
        assert_eq!(render_ascii(&response[..len]), ".H.I");
    }

    #[test]
    fn non_printable_bytes_render_as_dots() {
        assert_eq!(render_ascii(&[0x1F, 0x20, 0x7E, 0x7F]), ". ~.");
    }
}
