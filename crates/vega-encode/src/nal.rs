//! Byte-level Annex-B scanning and H.264 temporal metadata extraction.

use vega_core::types::H264Metadata;

/// Long start code `00 00 00 01`.
pub const START_CODE_LENGTH: usize = 4;
/// Short start code `00 00 01`.
pub const START_CODE_ALT_LENGTH: usize = 3;

/// Find the next Annex-B start code in `buf`, returning its offset and
/// length (3 or 4). Runs of more than two leading zero bytes resolve to the
/// last valid pattern, never a shifted 3-byte match. A start code needs at
/// least one byte of payload behind it to be reported.
pub fn next_start_code(buf: &[u8]) -> Option<(usize, usize)> {
    if buf.len() < START_CODE_LENGTH {
        return None;
    }
    let mut head = 0;
    // Stop 4 bytes before the end so head+1..head+3 stay in bounds.
    let end = buf.len() - START_CODE_LENGTH;

    while head < end {
        if buf[head] != 0 {
            head += 1;
            continue;
        }
        if buf[head + 1] != 0 {
            // got 00 xx
            head += 2;
            continue;
        }
        if buf[head + 2] > 1 {
            // got 00 00 xx
            head += 3;
            continue;
        }
        if buf[head + 2] != 1 && buf[head + 3] != 1 {
            // got 00 00 00 xx with xx != 1, keep searching
            head += 1;
            continue;
        }
        let len = if buf[head + 2] == 1 {
            START_CODE_ALT_LENGTH
        } else {
            START_CODE_LENGTH
        };
        return Some((head, len));
    }
    None
}

/// Scan an H.264 access unit for temporal scalability markers: IDR slices
/// (type 5) and prefix NAL units (type 14) whose SVC extension header
/// carries the priority and temporal ids. Returns `None` when the stream
/// carries no prefix NAL — single-layer streams need no frame marking.
pub fn h264_temporal_info(buf: &[u8]) -> Option<H264Metadata> {
    let mut temporal_id = 0u8;
    let mut priority_id = 0u8;
    let mut idr = false;
    let mut found_prefix = false;

    let mut pos = 0;
    while let Some((off, sc_len)) = next_start_code(&buf[pos..]) {
        let nal_start = pos + off + sc_len;
        if nal_start >= buf.len() {
            break;
        }
        match buf[nal_start] & 0x1F {
            5 => idr = true,
            14 => {
                // Prefix NAL: svc_extension_flag(1) idr_flag(1)
                // priority_id(6) | no_inter_layer_pred(1) dependency_id(3)
                // quality_id(4) | temporal_id(3) ...
                if nal_start + 3 < buf.len() {
                    let b0 = buf[nal_start + 1];
                    let b2 = buf[nal_start + 3];
                    priority_id = b0 & 0x3F;
                    if b0 & 0x40 != 0 {
                        idr = true;
                    }
                    temporal_id = b2 >> 5;
                    found_prefix = true;
                }
            }
            _ => {}
        }
        pos = nal_start;
    }

    found_prefix.then_some(H264Metadata {
        temporal_id,
        priority_id,
        idr_frame: idr,
        base_layer_sync: !idr && temporal_id > 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_three_byte_code() {
        let buf = [0xAB, 0x00, 0x00, 0x01, 0x65, 0x88];
        assert_eq!(next_start_code(&buf), Some((1, 3)));
    }

    #[test]
    fn finds_four_byte_code() {
        let buf = [0x00, 0x00, 0x00, 0x01, 0x41, 0x9A];
        assert_eq!(next_start_code(&buf), Some((0, 4)));
    }

    #[test]
    fn long_zero_run_reports_last_valid_pattern() {
        // 00 00 00 00 01: the valid 4-byte code starts at offset 1.
        let buf = [0x00, 0x00, 0x00, 0x00, 0x01, 0x67, 0x42];
        assert_eq!(next_start_code(&buf), Some((1, 4)));
    }

    #[test]
    fn five_leading_zeros() {
        let buf = [0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x67, 0x42];
        assert_eq!(next_start_code(&buf), Some((2, 4)));
    }

    #[test]
    fn zeros_without_terminator_not_matched() {
        let buf = [0x00, 0x00, 0x02, 0x00, 0x00, 0x03, 0xFF, 0xFF];
        assert_eq!(next_start_code(&buf), None);
    }

    #[test]
    fn too_short_buffer() {
        assert_eq!(next_start_code(&[0x00, 0x00, 0x01]), None);
    }

    #[test]
    fn idr_without_prefix_nal_is_unmarked() {
        let buf = [0x00, 0x00, 0x00, 0x01, 0x65, 0x11, 0x22];
        assert_eq!(h264_temporal_info(&buf), None);
    }

    #[test]
    fn prefix_nal_yields_temporal_info() {
        // Prefix NAL (type 14) with priority_id 2, temporal_id 1, then a
        // non-IDR slice.
        let buf = [
            0x00, 0x00, 0x00, 0x01, 0x6E, 0x82, 0x00, 0x20, //
            0x00, 0x00, 0x00, 0x01, 0x41, 0x9A, 0x00,
        ];
        let info = h264_temporal_info(&buf).expect("prefix NAL present");
        assert_eq!(info.priority_id, 2);
        assert_eq!(info.temporal_id, 1);
        assert!(!info.idr_frame);
        assert!(info.base_layer_sync, "non-IDR upper layer syncs off base");
    }

    #[test]
    fn prefix_nal_with_idr_slice() {
        let buf = [
            0x00, 0x00, 0x00, 0x01, 0x6E, 0x80, 0x00, 0x00, //
            0x00, 0x00, 0x00, 0x01, 0x65, 0x9A, 0x00,
        ];
        let info = h264_temporal_info(&buf).expect("prefix NAL present");
        assert_eq!(info.temporal_id, 0);
        assert!(info.idr_frame);
        assert!(!info.base_layer_sync);
    }
}
