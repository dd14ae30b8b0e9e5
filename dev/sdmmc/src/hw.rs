//! Hardware adapter contract for native-mode (4/8-bit parallel) SD/MMC
//! controllers.
//!
//! The driver core issues commands and moves sector data exclusively through
//! this trait. Burst hints, voltage switching and sampling-point tuning are
//! optional; their default bodies report the feature as absent and the core
//! degrades accordingly (1-sector bursts, 3.3 V only, no tuned modes).

use bitflags::bitflags;
use blocks::{Error, Result};
use sdio_host::common_cmd::ResponseLen;

bitflags! {
    /// Per-command options passed to [`HwCardMode::send_cmd`].
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct CmdFlags: u16 {
        /// Precede the command with the 74-clock initialisation sequence.
        const INIT               = 1 << 0;
        /// The response signals busy on DAT0 (R1b).
        const BUSY               = 1 << 1;
        /// A data read phase follows the response.
        const DATA_READ          = 1 << 2;
        /// A data write phase follows the response.
        const DATA_WRITE         = 1 << 3;
        /// Do not check the response CRC (CMD0/ACMD41 class commands).
        const NO_CRC_CHECK       = 1 << 4;
        /// Move data over 4 lines.
        const USE_SD4            = 1 << 5;
        /// Move data over 8 lines.
        const USE_MMC8           = 1 << 6;
        /// This is a transmission-stop command (CMD12).
        const STOP_TRANS         = 1 << 7;
        /// The sector buffer is replayed for every block of the burst.
        const WRITE_BURST_REPEAT = 1 << 8;
        /// Every 32-bit word of every block repeats the first word.
        const WRITE_BURST_FILL   = 1 << 9;
        /// The command starts the 1.8 V switch sequence (CMD11).
        const SWITCH_VOLTAGE     = 1 << 10;
    }

    /// Options for [`HwCardMode::set_max_clock`].
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct ClockFlags: u8 {
        /// Sample data on both clock edges.
        const DDR_MODE    = 1 << 0;
        /// Sample reads on the card-driven strobe (HS400 enhanced strobe).
        const STROBE_MODE = 1 << 1;
    }
}

/// Controller primitives, one implementation per host controller.
pub trait HwCardMode {
    /// One-time controller bring-up (clocks gated, power on).
    fn init(&mut self) -> Result;

    fn delay_ms(&mut self, ms: u32);

    fn is_present(&mut self) -> bool;

    fn is_write_protected(&mut self) -> bool;

    /// Caps the bus clock at `freq_khz` and returns the frequency actually
    /// configured, in kHz.
    fn set_max_clock(&mut self, freq_khz: u32, flags: ClockFlags) -> u32;

    fn set_response_timeout_ms(&mut self, ms: u32);

    fn set_read_data_timeout_ms(&mut self, ms: u32);

    fn send_cmd(&mut self, index: u8, flags: CmdFlags, resp_len: ResponseLen, arg: u32) -> Result;

    /// Returns the response of the last command as little-endian words:
    /// `resp[0]` holds bits 39:8 of a short response; a long response fills
    /// all four words with `resp[3]` most significant, CRC stripped.
    fn get_response(&mut self) -> Result<[u32; 4]>;

    /// Moves `num_blocks * block_len` bytes from the card into `buf`.
    fn read_data(&mut self, buf: &mut [u8], block_len: usize, num_blocks: usize) -> Result;

    /// Moves data to the card. With one of the burst-replay command flags
    /// set, `buf` holds a single block that the controller repeats.
    fn write_data(&mut self, buf: &[u8], block_len: usize, num_blocks: usize) -> Result;

    fn max_read_burst(&mut self) -> u32;

    fn max_write_burst(&mut self) -> u32;

    /// Largest burst for repeated-sector writes; 0 when the controller
    /// cannot replay a buffer.
    fn max_write_burst_repeat(&mut self) -> u32 {
        0
    }

    /// Largest burst for pattern-fill writes; 0 when unsupported.
    fn max_write_burst_fill(&mut self) -> u32 {
        0
    }

    /// Changes the signalling voltage. `is_sd` distinguishes the SD CMD11
    /// handshake (which pauses the clock) from the plain eMMC rail switch.
    fn set_voltage(&mut self, _min_mv: u16, _max_mv: u16, _is_sd: bool) -> Result {
        Err(Error::NotSupported)
    }

    /// Currently configured signalling voltage, if the hardware knows it.
    fn voltage_mv(&mut self) -> Option<u16> {
        None
    }

    // Sampling-point tuning, for SDR50/SDR104/HS200.

    fn enable_tuning(&mut self) -> Result {
        Err(Error::NotSupported)
    }

    fn start_tuning(&mut self, _step: u32) -> Result {
        Err(Error::NotSupported)
    }

    fn disable_tuning(&mut self, _is_error: bool) {}

    /// Number of selectable sampling points; 0 disables tuning entirely.
    fn max_tunings(&mut self) -> u32 {
        0
    }
}
