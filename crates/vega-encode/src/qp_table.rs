//! Quantization-index to native-quantizer mapping.

/// VP9 quantization index bounds used for quality scaling.
pub const MIN_QINDEX_VP9: u16 = 1;
pub const MAX_QINDEX_VP9: u16 = 28;

/// Upper quantizer limit when the software rate model drives VP9.
pub const MAX_QP_VP9_SOFTWARE_BRC: u16 = 224;

/// AV1 quantization index bounds.
pub const MIN_QINDEX_AV1: u16 = 58;
pub const MAX_QINDEX_AV1: u16 = 180;

/// Ascending quantizer breakpoints, one per native quantizer step.
const QUANTIZER_TABLE: [u16; 64] = [
    0, 4, 8, 12, 16, 20, 24, 28, 32, 36, 40, 44, 48, //
    52, 56, 60, 64, 68, 72, 76, 80, 84, 88, 92, 96, 100, //
    104, 108, 112, 116, 120, 124, 128, 132, 136, 140, 144, 148, 152, //
    156, 160, 164, 168, 172, 176, 180, 184, 188, 192, 196, 200, 204, //
    208, 212, 216, 220, 224, 228, 232, 236, 240, 244, 249, 255,
];

/// Map a quantization index to a native quantizer: the smallest table entry
/// that is >= the requested index, or the last entry when none qualifies.
/// Monotonic non-decreasing and bounded to the table's value range.
pub fn index_to_quantizer(index: u16) -> u16 {
    for &entry in QUANTIZER_TABLE.iter() {
        if entry >= index {
            return entry;
        }
    }
    QUANTIZER_TABLE[QUANTIZER_TABLE.len() - 1]
}
