//! PID response decoding
//!
//! Turns a framed adapter response into a rotational-speed value. Adapters
//! format responses in several ways (spaces on/off, CAN headers on/off,
//! multi-frame line indices), so the text is first reduced to a plain byte
//! sequence and then searched for a known response header.

use byteorder::{BigEndian, ByteOrder};

use super::{ProtocolError, RpmPid};

/// Offset of the motor-speed word from the start of an EV block header
pub const EV_SPEED_OFFSET: usize = 53;

/// How the value is laid out after a header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueEncoding {
    /// Signed big-endian 16-bit word at a fixed offset from the header start
    SignedWordAt(usize),
    /// Two bytes right after the header, (A * 256 + B) / 4
    QuarterRpm,
}

#[derive(Debug, Clone, Copy)]
struct ResponseLayout {
    pid: RpmPid,
    header: &'static [u8],
    encoding: ValueEncoding,
}

impl ResponseLayout {
    fn read(&self, bytes: &[u8], start: usize) -> Option<i32> {
        match self.encoding {
            ValueEncoding::SignedWordAt(offset) => {
                let word = bytes.get(start + offset..start + offset + 2)?;
                Some(BigEndian::read_i16(word) as i32)
            }
            ValueEncoding::QuarterRpm => {
                let data = start + self.header.len();
                let word = bytes.get(data..data + 2)?;
                Some(BigEndian::read_u16(word) as i32 / 4)
            }
        }
    }
}

/// Known layouts, in priority order
const LAYOUTS: [ResponseLayout; 3] = [
    ResponseLayout {
        pid: RpmPid::ElectricPrimary,
        header: &[0x62, 0x01, 0x01],
        encoding: ValueEncoding::SignedWordAt(EV_SPEED_OFFSET),
    },
    ResponseLayout {
        pid: RpmPid::ElectricLegacy,
        header: &[0x61, 0x01],
        encoding: ValueEncoding::SignedWordAt(EV_SPEED_OFFSET),
    },
    ResponseLayout {
        pid: RpmPid::Standard,
        header: &[0x41, 0x0C],
        encoding: ValueEncoding::QuarterRpm,
    },
];

fn hex_pairs(token: &str, out: &mut Vec<u8>) {
    let digits = token.as_bytes();
    for pair in digits.chunks_exact(2) {
        // Already checked to be ASCII hex digits
        if let Ok(s) = std::str::from_utf8(pair) {
            if let Ok(byte) = u8::from_str_radix(s, 16) {
                out.push(byte);
            }
        }
    }
}

/// Reduce a response to its data bytes.
///
/// Drops `n:` frame indices, non-hex tokens (`SEARCHING...`, prompts) and
/// odd-length tokens such as ISO-TP length prefixes (`03E`) and 11-bit CAN
/// IDs (`7E8`). With spaces disabled a line may arrive as one long token;
/// an odd-length run longer than three digits is treated as a CAN ID
/// followed by data.
pub fn normalize_response(response: &str) -> Vec<u8> {
    let mut bytes = Vec::new();

    for line in response.split(['\r', '\n']) {
        for token in line.split_whitespace() {
            let token = match token.split_once(':') {
                Some((_, rest)) => rest,
                None => token,
            };
            if token.is_empty() || !token.bytes().all(|b| b.is_ascii_hexdigit()) {
                continue;
            }
            if token.len() % 2 == 0 {
                hex_pairs(token, &mut bytes);
            } else if token.len() > 3 {
                hex_pairs(&token[3..], &mut bytes);
            }
        }
    }

    bytes
}

fn find_header(bytes: &[u8], header: &[u8]) -> Option<usize> {
    bytes.windows(header.len()).position(|w| w == header)
}

/// Decode a signed rotational-speed value and the PID whose layout matched.
///
/// The layout belonging to `hint` is tried first, then the rest in their
/// fixed order. The first layout whose header is found decides: if its
/// block is incomplete the response is rejected rather than read under
/// another layout. Returns `None` if nothing matches.
pub fn decode_pid(response: &str, hint: Option<RpmPid>) -> Option<(RpmPid, i32)> {
    let bytes = normalize_response(response);
    if bytes.is_empty() {
        return None;
    }

    let hinted = hint.and_then(|pid| LAYOUTS.iter().find(|l| l.pid == pid));
    let ordered = hinted
        .into_iter()
        .chain(LAYOUTS.iter().filter(|l| Some(l.pid) != hint));

    for layout in ordered {
        if let Some(start) = find_header(&bytes, layout.header) {
            return layout.read(&bytes, start).map(|value| (layout.pid, value));
        }
    }

    None
}

/// Decode a signed rotational-speed value from a framed response
pub fn decode(response: &str, hint: Option<RpmPid>) -> Option<i32> {
    decode_pid(response, hint).map(|(_, value)| value)
}

/// The PID a response answers, judged by the first known header it carries
pub fn identify_response(response: &str) -> Option<RpmPid> {
    let bytes = normalize_response(response);
    LAYOUTS
        .iter()
        .find(|layout| find_header(&bytes, layout.header).is_some())
        .map(|layout| layout.pid)
}

/// Decode and fold to a magnitude; regenerative braking reads negative
pub fn decode_rpm(response: &str, hint: Option<RpmPid>) -> Result<u32, ProtocolError> {
    decode(response, hint)
        .map(i32::unsigned_abs)
        .ok_or_else(|| ProtocolError::UnrecognizedResponse(response.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev_response(header: &str, word: i16) -> String {
        let header_len = header.split_whitespace().count();
        let mut parts = vec!["7E8".to_string(), "10".to_string(), "3E".to_string()];
        parts.push(header.to_string());
        for _ in header_len..EV_SPEED_OFFSET {
            parts.push("00".to_string());
        }
        let [hi, lo] = word.to_be_bytes();
        parts.push(format!("{:02X}", hi));
        parts.push(format!("{:02X}", lo));
        parts.push("3E 3E 3E".to_string());
        parts.join(" ")
    }

    #[test]
    fn test_regen_reading_scenario() {
        let response = ev_response("62 01 01", -200);
        assert!(response.contains("FF 38 3E 3E 3E"));
        assert_eq!(decode(&response, None), Some(-200));
        assert_eq!(decode_rpm(&response, None).unwrap(), 200);
    }

    #[test]
    fn test_primary_layout_magnitudes() {
        for word in [0i16, 1, 750, 4321, 10_500, i16::MAX, -1, -4321, i16::MIN] {
            let response = ev_response("62 01 01", word);
            assert_eq!(
                decode_rpm(&response, Some(RpmPid::ElectricPrimary)).unwrap(),
                (word as i32).unsigned_abs(),
                "word {}",
                word
            );
        }
    }

    #[test]
    fn test_legacy_layout() {
        let response = ev_response("61 01", 3200);
        assert_eq!(decode(&response, Some(RpmPid::ElectricLegacy)), Some(3200));
    }

    #[test]
    fn test_standard_layout() {
        assert_eq!(decode("41 0C 1A F8", None), Some(1726));
        assert_eq!(decode("410C1AF8", Some(RpmPid::Standard)), Some(1726));
        assert_eq!(decode("7E8 04 41 0C 0F A0", None), Some(1000));
    }

    #[test]
    fn test_headers_off_multiframe() {
        // 03E length prefix, then indexed frames
        let mut payload = vec!["62".to_string(), "01".to_string(), "01".to_string()];
        payload.extend((3..EV_SPEED_OFFSET).map(|_| "00".to_string()));
        payload.push("0B".to_string());
        payload.push("B8".to_string());
        let mut lines = vec!["03E".to_string()];
        for (i, chunk) in payload.chunks(7).enumerate() {
            lines.push(format!("{:X}: {}", i % 16, chunk.join(" ")));
        }
        let response = lines.join("\r");
        assert_eq!(decode(&response, None), Some(3000));
    }

    #[test]
    fn test_spaces_off_with_can_id() {
        assert_eq!(normalize_response("7E8410C0FA0"), vec![0x41, 0x0C, 0x0F, 0xA0]);
        assert_eq!(decode("7E8410C0FA0", None), Some(1000));
    }

    #[test]
    fn test_leading_garbage_is_tolerated() {
        assert_eq!(decode("SEARCHING...\r41 0C 0F A0", None), Some(1000));
        assert_eq!(decode("?? OK 41 0C 0F A0", None), Some(1000));
    }

    #[test]
    fn test_short_ev_block_is_rejected() {
        let response = "62 01 01 00 00 00 00";
        assert_eq!(decode(response, None), None);
        assert!(matches!(
            decode_rpm(response, None),
            Err(ProtocolError::UnrecognizedResponse(_))
        ));
    }

    #[test]
    fn test_error_responses_decode_to_none() {
        assert_eq!(decode("NO DATA", None), None);
        assert_eq!(decode("", None), None);
        assert_eq!(decode("7F 22 12", Some(RpmPid::ElectricPrimary)), None);
    }

    #[test]
    fn test_truncated_block_is_not_read_as_another_layout() {
        // 41 0C inside a cut-off EV block must not decode as quarter RPM
        let response = "62 01 01 41 0C 0F A0";
        assert_eq!(decode(response, Some(RpmPid::ElectricPrimary)), None);
        assert_eq!(decode(response, None), None);
        assert_eq!(identify_response(response), Some(RpmPid::ElectricPrimary));
    }

    #[test]
    fn test_decode_reports_matching_pid() {
        let response = ev_response("62 01 01", 1500);
        assert_eq!(
            decode_pid(&response, Some(RpmPid::ElectricLegacy)),
            Some((RpmPid::ElectricPrimary, 1500))
        );
        assert_eq!(decode_pid("41 0C 0F A0", None), Some((RpmPid::Standard, 1000)));
        assert_eq!(identify_response("NO DATA"), None);
        assert_eq!(identify_response("7E8 03 41 0C"), Some(RpmPid::Standard));
    }

    #[test]
    fn test_hint_is_tried_first() {
        // Quarter-RPM header inside an otherwise EV-shaped block
        let mut response = ev_response("62 01 01", 2500);
        response = format!("41 0C 0F A0 {}", response);
        assert_eq!(decode(&response, Some(RpmPid::Standard)), Some(1000));
        assert_eq!(decode(&response, Some(RpmPid::ElectricPrimary)), Some(2500));
        assert_eq!(decode(&response, None), Some(2500));
    }
}
