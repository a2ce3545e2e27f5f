//! STX/ETX frame codec with LRC checksum

use std::ops::Range;

use crate::error::FramingError;

pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;
pub const EOT: u8 = 0x04;
pub const ENQ: u8 = 0x05;
pub const ACK: u8 = 0x06;
pub const NAK: u8 = 0x15;

/// Literal token written to make the terminal drop the current conversation
pub const ABORT: &[u8] = b"ABORT";

/// Frame codec for wrapping/unwrapping terminal payloads
///
/// Wire format: `STX + payload + ETX + LRC`, where LRC is the XOR of every
/// byte after STX up to and including ETX.
pub struct FrameCodec;

impl FrameCodec {
    /// XOR fold over `bytes`
    pub fn lrc(bytes: &[u8]) -> u8 {
        bytes.iter().fold(0u8, |acc, &b| acc ^ b)
    }

    /// Wrap a payload into a complete frame
    pub fn wrap(payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(payload.len() + 3);
        frame.push(STX);
        frame.extend_from_slice(payload);
        frame.push(ETX);
        let lrc = Self::lrc(&frame[1..]);
        frame.push(lrc);
        frame
    }

    /// Verify a frame and return its payload
    ///
    /// Bytes before STX are ignored. The first ETX after STX ends the payload
    /// and must be followed by the LRC byte.
    pub fn unwrap(bytes: &[u8]) -> Result<Vec<u8>, FramingError> {
        let stx = bytes
            .iter()
            .position(|&b| b == STX)
            .ok_or_else(|| FramingError::MalformedFrame("no STX".into()))?;
        let etx = bytes[stx + 1..]
            .iter()
            .position(|&b| b == ETX)
            .map(|offset| stx + 1 + offset)
            .ok_or_else(|| FramingError::MalformedFrame("no ETX after STX".into()))?;
        let actual = *bytes
            .get(etx + 1)
            .ok_or_else(|| FramingError::MalformedFrame("missing LRC after ETX".into()))?;

        let expected = Self::lrc(&bytes[stx + 1..=etx]);
        if expected != actual {
            return Err(FramingError::ChecksumMismatch { expected, actual });
        }

        Ok(bytes[stx + 1..etx].to_vec())
    }

    /// Range of the first complete frame (STX through LRC) in `buf`, if one
    /// has fully arrived
    pub fn find_complete_frame(buf: &[u8]) -> Option<Range<usize>> {
        let stx = buf.iter().position(|&b| b == STX)?;
        let etx = stx + 1 + buf[stx + 1..].iter().position(|&b| b == ETX)?;
        if buf.len() > etx + 1 {
            Some(stx..etx + 2)
        } else {
            None
        }
    }
}

/// Printable name of a control byte, for logs
pub fn describe_control(byte: u8) -> String {
    match byte {
        STX => "STX".into(),
        ETX => "ETX".into(),
        EOT => "EOT".into(),
        ENQ => "ENQ".into(),
        ACK => "ACK".into(),
        NAK => "NAK".into(),
        other => format!("{:#04X}", other),
    }
}

/// Format bytes as hex string for diagnostics
pub fn to_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_FRAME: [u8; 16] = [
        0x02, 0x43, 0x32, 0x30, 0x30, 0x7C, 0x30, 0x31, 0x7C, 0x30, 0x30, 0x30, 0x31, 0x30, 0x30,
        0x03,
    ];

    #[test]
    fn test_lrc_of_known_frame() {
        assert_eq!(FrameCodec::lrc(&SAMPLE_FRAME[1..16]), 0x72);
    }

    #[test]
    fn test_wrap_matches_known_frame() {
        let frame = FrameCodec::wrap(b"C200|01|000100");
        assert_eq!(&frame[..16], &SAMPLE_FRAME);
        assert_eq!(frame[16], 0x72);
    }

    #[test]
    fn test_wrap_unwrap_roundtrip() {
        for payload in [&b""[..], b"C902", b"R200001234", b"C200|01|000100"] {
            let frame = FrameCodec::wrap(payload);
            assert_eq!(FrameCodec::unwrap(&frame).unwrap(), payload);
        }
    }

    #[test]
    fn test_every_bit_flip_is_detected() {
        let frame = FrameCodec::wrap(b"C20001000000001099");
        // ETX is left alone: flipping it removes the terminator.
        for index in 1..frame.len() - 2 {
            for bit in 0..8 {
                let mut corrupted = frame.clone();
                corrupted[index] ^= 1 << bit;
                if corrupted[index] == ETX || corrupted[index] == STX {
                    continue;
                }
                assert!(
                    matches!(
                        FrameCodec::unwrap(&corrupted),
                        Err(FramingError::ChecksumMismatch { .. })
                    ),
                    "flip at byte {} bit {} went undetected",
                    index,
                    bit
                );
            }
        }
    }

    #[test]
    fn test_corrupted_lrc_is_detected() {
        let mut frame = FrameCodec::wrap(b"C902");
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        assert!(matches!(
            FrameCodec::unwrap(&frame),
            Err(FramingError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_missing_markers_are_malformed() {
        assert!(matches!(
            FrameCodec::unwrap(b"C902\x03\x00"),
            Err(FramingError::MalformedFrame(_))
        ));
        assert!(matches!(
            FrameCodec::unwrap(b"\x02C902"),
            Err(FramingError::MalformedFrame(_))
        ));
        assert!(matches!(
            FrameCodec::unwrap(b"\x02C902\x03"),
            Err(FramingError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_leading_noise_is_skipped() {
        let mut bytes = vec![0x00, 0xFF, ACK];
        bytes.extend(FrameCodec::wrap(b"R902"));
        assert_eq!(FrameCodec::unwrap(&bytes).unwrap(), b"R902");
    }

    #[test]
    fn test_find_complete_frame() {
        let frame = FrameCodec::wrap(b"R902");
        assert_eq!(FrameCodec::find_complete_frame(&frame[..frame.len() - 1]), None);

        let mut buf = vec![0x00];
        buf.extend(&frame);
        buf.push(EOT);
        assert_eq!(FrameCodec::find_complete_frame(&buf), Some(1..1 + frame.len()));
    }

    #[test]
    fn test_describe_control() {
        assert_eq!(describe_control(ACK), "ACK");
        assert_eq!(describe_control(0x41), "0x41");
        assert_eq!(to_hex(&[0x02, 0xAB]), "02 AB");
    }
}
