//! Decoder for the standard heart-rate-measurement notification payload.
//!
//! The decoder is a pure, total function over arbitrary bytes: malformed or
//! truncated input never produces an error, it only omits whatever optional
//! field cannot be fully read.

/// Flags bitfield, byte 0 of every measurement frame.
pub const FLAG_BPM_U16: u8 = 0x01;
pub const FLAG_ENERGY_EXPENDED: u8 = 0x08;
pub const FLAG_RR_INTERVALS: u8 = 0x10;

/// Fields recovered from a single measurement frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedFrame {
    pub bpm: u16,
    pub energy_expended: Option<u16>,
    /// RR intervals in milliseconds, in frame order.
    pub rr_intervals_ms: Vec<u32>,
}

/// Decode a heart-rate-measurement frame.
///
/// Byte 0 is a flags bitfield. Bit 0 selects 8-bit vs 16-bit little-endian
/// bpm encoding. Bit 3 announces a 16-bit energy-expended field. Bit 4
/// announces trailing 16-bit RR values in 1/1024 s units, converted here to
/// milliseconds. An empty frame decodes to bpm 0 with no optional fields.
pub fn decode_measurement(data: &[u8]) -> DecodedFrame {
    let mut frame = DecodedFrame::default();
    let Some(&flags) = data.first() else {
        return frame;
    };
    let mut offset = 1usize;

    if flags & FLAG_BPM_U16 != 0 {
        match data.get(offset..offset + 2) {
            Some(b) => {
                frame.bpm = u16::from_le_bytes([b[0], b[1]]);
                offset += 2;
            }
            None => return frame,
        }
    } else {
        match data.get(offset) {
            Some(&b) => {
                frame.bpm = b.into();
                offset += 1;
            }
            None => return frame,
        }
    }

    if flags & FLAG_ENERGY_EXPENDED != 0 {
        match data.get(offset..offset + 2) {
            Some(b) => {
                frame.energy_expended = Some(u16::from_le_bytes([b[0], b[1]]));
                offset += 2;
            }
            // Truncated energy field also hides any RR data behind it.
            None => return frame,
        }
    }

    if flags & FLAG_RR_INTERVALS != 0 {
        while let Some(b) = data.get(offset..offset + 2) {
            frame
                .rr_intervals_ms
                .push(rr_1024_to_ms(u16::from_le_bytes([b[0], b[1]])));
            offset += 2;
        }
    }

    frame
}

/// Convert an RR value in 1/1024 s units to rounded milliseconds.
pub fn rr_1024_to_ms(raw: u16) -> u32 {
    (u32::from(raw) * 1000 + 512) / 1024
}

/// Decode the single-byte battery-level characteristic value, clamped to
/// 0-100. Empty input yields `None`.
pub fn decode_battery_level(data: &[u8]) -> Option<u8> {
    data.first().map(|&pct| pct.min(100))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_decodes_to_zero() {
        let frame = decode_measurement(&[]);
        assert_eq!(frame.bpm, 0);
        assert_eq!(frame.energy_expended, None);
        assert!(frame.rr_intervals_ms.is_empty());
    }

    #[test]
    fn decodes_u8_bpm() {
        let frame = decode_measurement(&[0x00, 72]);
        assert_eq!(frame.bpm, 72);
        assert_eq!(frame.energy_expended, None);
        assert!(frame.rr_intervals_ms.is_empty());
    }

    #[test]
    fn decodes_u16_bpm_little_endian() {
        // 300 bpm = 0x012C
        let frame = decode_measurement(&[FLAG_BPM_U16, 0x2C, 0x01]);
        assert_eq!(frame.bpm, 300);
    }

    #[test]
    fn decodes_energy_expended() {
        // 0x0203 = 515
        let frame = decode_measurement(&[FLAG_ENERGY_EXPENDED, 88, 0x03, 0x02]);
        assert_eq!(frame.bpm, 88);
        assert_eq!(frame.energy_expended, Some(515));
    }

    #[test]
    fn truncated_energy_is_treated_as_absent() {
        let frame = decode_measurement(&[FLAG_ENERGY_EXPENDED, 88, 0x03]);
        assert_eq!(frame.bpm, 88);
        assert_eq!(frame.energy_expended, None);
    }

    #[test]
    fn decodes_rr_intervals_within_one_ms() {
        // 1024/1024 s = 1000 ms, 853/1024 s = 833.0078... ms
        let frame = decode_measurement(&[FLAG_RR_INTERVALS, 70, 0x00, 0x04, 0x55, 0x03]);
        assert_eq!(frame.bpm, 70);
        assert_eq!(frame.rr_intervals_ms.len(), 2);
        assert_eq!(frame.rr_intervals_ms[0], 1000);
        assert!((frame.rr_intervals_ms[1] as i64 - 833).abs() <= 1);
    }

    #[test]
    fn rr_decoding_stops_on_trailing_odd_byte() {
        let frame = decode_measurement(&[FLAG_RR_INTERVALS, 70, 0x00, 0x04, 0x55]);
        assert_eq!(frame.rr_intervals_ms, vec![1000]);
    }

    #[test]
    fn decodes_full_frame_exactly() {
        // u16 bpm + energy + two RR values
        let flags = FLAG_BPM_U16 | FLAG_ENERGY_EXPENDED | FLAG_RR_INTERVALS;
        let frame = decode_measurement(&[flags, 0x9B, 0x00, 0x2A, 0x00, 0x00, 0x04, 0x00, 0x02]);
        assert_eq!(frame.bpm, 155);
        assert_eq!(frame.energy_expended, Some(42));
        assert_eq!(frame.rr_intervals_ms, vec![1000, 500]);
    }

    #[test]
    fn u16_bpm_flag_with_one_byte_degrades_to_zero() {
        let frame = decode_measurement(&[FLAG_BPM_U16, 0x2C]);
        assert_eq!(frame.bpm, 0);
        assert!(frame.rr_intervals_ms.is_empty());
    }

    #[test]
    fn rr_quantization_rounds_to_nearest() {
        // 512/1024 s = exactly 500 ms; 513/1024 s = 500.97... -> 501
        assert_eq!(rr_1024_to_ms(512), 500);
        assert_eq!(rr_1024_to_ms(513), 501);
        assert_eq!(rr_1024_to_ms(0), 0);
    }

    #[test]
    fn battery_level_decoding() {
        assert_eq!(decode_battery_level(&[]), None);
        assert_eq!(decode_battery_level(&[85]), Some(85));
        assert_eq!(decode_battery_level(&[120]), Some(100));
    }
}
