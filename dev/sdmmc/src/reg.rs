//! Register decoding beyond what `sdio-host` provides: the 64-byte SWITCH
//! function status, the EXT_CSD fields driving mode selection, TRAN_SPEED
//! clock derivation and the fixed tuning block patterns.

use blocks::bits::get_bits;

// EXT_CSD byte indices.
pub const EXT_CSD_FLUSH_CACHE: u8 = 32;
pub const EXT_CSD_CACHE_CTRL: u8 = 33;
pub const EXT_CSD_BUS_WIDTH: u8 = 183;
pub const EXT_CSD_HS_TIMING: u8 = 185;

// EXT_CSD.BUS_WIDTH values.
pub const BUS_WIDTH_1BIT: u8 = 0;
pub const BUS_WIDTH_4BIT: u8 = 1;
pub const BUS_WIDTH_8BIT: u8 = 2;
pub const BUS_WIDTH_4BIT_DDR: u8 = 5;
pub const BUS_WIDTH_8BIT_DDR: u8 = 6;
/// Set on top of a DDR width to sample reads on the card strobe.
pub const BUS_WIDTH_STROBE: u8 = 0x80;

// EXT_CSD.HS_TIMING values (low nibble; the high nibble selects the driver
// strength on HS200/HS400 capable devices).
pub const HS_TIMING_COMPAT: u8 = 0;
pub const HS_TIMING_HS: u8 = 1;
pub const HS_TIMING_HS200: u8 = 2;
pub const HS_TIMING_HS400: u8 = 3;

// EXT_CSD.CARD_TYPE bits.
pub const CARD_TYPE_HS_26: u8 = 1 << 0;
pub const CARD_TYPE_HS_52: u8 = 1 << 1;
pub const CARD_TYPE_DDR_52_1V8_3V: u8 = 1 << 2;
pub const CARD_TYPE_DDR_52_1V2: u8 = 1 << 3;
pub const CARD_TYPE_HS200_1V8: u8 = 1 << 4;
pub const CARD_TYPE_HS200_1V2: u8 = 1 << 5;
pub const CARD_TYPE_HS400_1V8: u8 = 1 << 6;
pub const CARD_TYPE_HS400_1V2: u8 = 1 << 7;

/// The EXT_CSD fields consumed after identification, decoded once from the
/// 512-byte register block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtCsdInfo {
    pub rev: u8,
    pub card_type: u8,
    pub driver_strength: u8,
    pub strobe_support: u8,
    pub sec_count: u32,
    pub cache_size_kb: u32,
}

impl ExtCsdInfo {
    pub fn parse(raw: &[u8]) -> Self {
        ExtCsdInfo {
            rev: raw[192],
            card_type: raw[196],
            driver_strength: raw[197],
            strobe_support: raw[184],
            sec_count: u32::from_le_bytes([raw[212], raw[213], raw[214], raw[215]]),
            // CACHE_SIZE is given in KiBit.
            cache_size_kb: u32::from_le_bytes([raw[249], raw[250], raw[251], raw[252]]) / 8,
        }
    }
}

/// Response of the SD SWITCH function command (CMD6), 512 bits wire order.
pub struct SwitchStatus(pub [u8; 64]);

// Function group 1 (access mode) function numbers.
pub const SD_FUNC_ACCESS_MODE: u8 = 1;
pub const SD_FUNC_DRIVER_STRENGTH: u8 = 2;
pub const SD_ACCESS_MODE_SDR12: u8 = 0;
pub const SD_ACCESS_MODE_HS: u8 = 1;
pub const SD_ACCESS_MODE_SDR50: u8 = 2;
pub const SD_ACCESS_MODE_SDR104: u8 = 3;
pub const SD_ACCESS_MODE_DDR50: u8 = 4;

impl SwitchStatus {
    /// Support bit of `function` within `group` (1-based group index).
    pub fn is_function_supported(&self, group: u8, function: u8) -> bool {
        let bit = 400 + 16 * (u32::from(group) - 1) + u32::from(function);
        get_bits(&self.0, bit, bit) != 0
    }

    /// Function selected for `group` by the last switch.
    pub fn selected_function(&self, group: u8) -> u8 {
        let first = 376 + 4 * (u32::from(group) - 1);
        get_bits(&self.0, first, first + 3) as u8
    }

    /// Maximum current the card draws with the selected functions, mA.
    pub fn max_current_ma(&self) -> u16 {
        get_bits(&self.0, 496, 511) as u16
    }

    pub fn is_function_busy(&self, group: u8, function: u8) -> bool {
        let bit = 272 + 16 * (u32::from(group) - 1) + u32::from(function);
        get_bits(&self.0, bit, bit) != 0
    }
}

/// Builds the CMD6 argument: `mode` false queries, true switches; one
/// function per group, 0xF leaves a group untouched.
pub fn switch_arg(mode: bool, group: u8, function: u8) -> u32 {
    let mut arg = 0x00FF_FFFF;
    let shift = 4 * (u32::from(group) - 1);
    arg &= !(0xF << shift);
    arg |= u32::from(function) << shift;
    if mode {
        arg |= 1 << 31;
    }
    arg
}

// TRAN_SPEED: frequency unit times a factor; both come out of the CSD byte.
// Values are scaled by 10 to keep the 1.2/2.6/5.2 style factors integral.
static TRAN_SPEED_UNITS_KHZ_X10: [u32; 4] = [1000, 10_000, 100_000, 1_000_000];
static TRAN_SPEED_FACTORS_SD: [u32; 16] =
    [0, 10, 12, 13, 15, 20, 25, 30, 35, 40, 45, 50, 55, 60, 70, 80];
static TRAN_SPEED_FACTORS_MMC: [u32; 16] =
    [0, 10, 12, 13, 15, 20, 26, 30, 35, 40, 45, 52, 55, 60, 70, 80];

/// Maximum serial clock in kHz encoded by the CSD TRAN_SPEED byte.
pub fn tran_speed_khz(tran_speed: u8, is_mmc: bool) -> u32 {
    let unit = usize::from(tran_speed & 0x7);
    let factor = usize::from((tran_speed >> 3) & 0xF);
    if unit >= TRAN_SPEED_UNITS_KHZ_X10.len() {
        return 0;
    }
    let factors = if is_mmc {
        &TRAN_SPEED_FACTORS_MMC
    } else {
        &TRAN_SPEED_FACTORS_SD
    };
    TRAN_SPEED_UNITS_KHZ_X10[unit] / 100 * factors[factor] / 10 * 10
}

/// Converts a big-endian register dump into the little-endian word layout
/// `sdio-host` register types are built from.
pub fn words_from_be_bytes<const W: usize>(bytes: &[u8]) -> [u32; W] {
    let mut words = [0u32; W];
    for (i, chunk) in bytes.chunks_exact(4).enumerate() {
        words[W - 1 - i] = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    words
}

/// Tuning block pattern for 4-bit transfers (CMD19/CMD21, 64 bytes).
pub static TUNING_PATTERN_4BIT: [u8; 64] = [
    0xFF, 0x0F, 0xFF, 0x00, 0xFF, 0xCC, 0xC3, 0xCC, 0xC3, 0x3C, 0xCC, 0xFF, 0xFE, 0xFF, 0xFE,
    0xEF, 0xFF, 0xDF, 0xFF, 0xDD, 0xFF, 0xFB, 0xFF, 0xFB, 0xBF, 0xFF, 0x7F, 0xFF, 0x77, 0xF7,
    0xBD, 0xEF, 0xFF, 0xF0, 0xFF, 0xF0, 0x0F, 0xFC, 0xCC, 0x3C, 0xCC, 0x33, 0xCC, 0xCF, 0xFF,
    0xEF, 0xFF, 0xEE, 0xFF, 0xFD, 0xFF, 0xFD, 0xDF, 0xFF, 0xBF, 0xFF, 0xBB, 0xFF, 0xF7, 0xFF,
    0xF7, 0x7F, 0x7B, 0xDE,
];

/// Tuning block pattern for 8-bit transfers (CMD21, 128 bytes).
pub static TUNING_PATTERN_8BIT: [u8; 128] = [
    0xFF, 0xFF, 0x00, 0xFF, 0xFF, 0xFF, 0x00, 0x00, 0xFF, 0xFF, 0xCC, 0xCC, 0xCC, 0x33, 0xCC,
    0xCC, 0xCC, 0x33, 0x33, 0xCC, 0xCC, 0xCC, 0xFF, 0xFF, 0xFF, 0xEE, 0xFF, 0xFF, 0xFF, 0xEE,
    0xEE, 0xFF, 0xFF, 0xFF, 0xDD, 0xFF, 0xFF, 0xFF, 0xDD, 0xDD, 0xFF, 0xFF, 0xFF, 0xBB, 0xFF,
    0xFF, 0xFF, 0xBB, 0xBB, 0xFF, 0xFF, 0xFF, 0x77, 0xFF, 0xFF, 0xFF, 0x77, 0x77, 0xFF, 0x77,
    0xBB, 0xDD, 0xEE, 0xFF, 0xFF, 0xFF, 0xFF, 0x00, 0xFF, 0xFF, 0xFF, 0x00, 0x00, 0xFF, 0xFF,
    0xCC, 0xCC, 0xCC, 0x33, 0xCC, 0xCC, 0xCC, 0x33, 0x33, 0xCC, 0xCC, 0xCC, 0xFF, 0xFF, 0xFF,
    0xEE, 0xFF, 0xFF, 0xFF, 0xEE, 0xEE, 0xFF, 0xFF, 0xFF, 0xDD, 0xFF, 0xFF, 0xFF, 0xDD, 0xDD,
    0xFF, 0xFF, 0xFF, 0xBB, 0xFF, 0xFF, 0xFF, 0xBB, 0xBB, 0xFF, 0xFF, 0xFF, 0x77, 0xFF, 0xFF,
    0xFF, 0x77, 0x77, 0xFF, 0x77, 0xBB, 0xDD, 0xEE,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tran_speed_defaults() {
        // 0x32: 25 MHz SD default speed, 26 MHz on MMC.
        assert_eq!(tran_speed_khz(0x32, false), 25_000);
        assert_eq!(tran_speed_khz(0x32, true), 26_000);
        // 0x5A: 50 MHz SD high speed, 52 MHz on MMC.
        assert_eq!(tran_speed_khz(0x5A, false), 50_000);
        assert_eq!(tran_speed_khz(0x5A, true), 52_000);
        // 0x08: 100 kHz unit, factor 1.0.
        assert_eq!(tran_speed_khz(0x08, false), 100);
    }

    #[test]
    fn switch_status_fields() {
        let mut raw = [0u8; 64];
        // Group 1 support mask lives in bits 415:400, bytes 12..14.
        raw[12] = 0x80; // function 15
        raw[13] = 0x1F; // functions 0..4
        // Selected functions: group 1 in bits 379:376.
        raw[16] = 0x03; // byte holding bits 383:376
        // Max current in bits 511:496.
        raw[0] = 0x01;
        raw[1] = 0x90;
        let status = SwitchStatus(raw);
        for function in 0..=4 {
            assert!(status.is_function_supported(1, function));
        }
        assert!(!status.is_function_supported(1, 5));
        assert!(status.is_function_supported(1, 15));
        assert_eq!(status.selected_function(1), SD_ACCESS_MODE_SDR104);
        assert_eq!(status.max_current_ma(), 400);
    }

    #[test]
    fn switch_arg_encoding() {
        assert_eq!(switch_arg(false, 1, 0xF), 0x00FF_FFFF);
        assert_eq!(switch_arg(false, 1, SD_ACCESS_MODE_HS), 0x00FF_FFF1);
        assert_eq!(switch_arg(true, 1, SD_ACCESS_MODE_SDR104), 0x80FF_FFF3);
        assert_eq!(switch_arg(true, 2, 1), 0x80FF_FF1F);
    }

    #[test]
    fn ext_csd_fields() {
        let mut raw = [0u8; 512];
        raw[192] = 8; // rev 1.8 (v5.1)
        raw[196] = CARD_TYPE_HS_52 | CARD_TYPE_HS400_1V8;
        raw[184] = 1; // enhanced strobe supported
        raw[212..216].copy_from_slice(&0x0074_0000u32.to_le_bytes());
        raw[249..253].copy_from_slice(&(512u32 * 8).to_le_bytes());
        let info = ExtCsdInfo::parse(&raw);
        assert_eq!(info.rev, 8);
        assert_eq!(info.card_type & CARD_TYPE_HS400_1V8, CARD_TYPE_HS400_1V8);
        assert_eq!(info.strobe_support, 1);
        assert_eq!(info.sec_count, 0x0074_0000);
        assert_eq!(info.cache_size_kb, 512);
    }
}
