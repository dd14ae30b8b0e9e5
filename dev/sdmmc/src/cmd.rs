//! Typed command execution on top of the `sdio-host` encoders.
//!
//! Every executed command gets a bounded retry budget; retries fire on
//! controller-level failures and on card-reported soft errors alike, and
//! stop early when the medium disappears. Data commands add the per-bus
//! width flags and, on failure, a stop-transmission recovery before the
//! next attempt.

use bitflags::bitflags;
use blocks::{Error, Result};
use sdio_host::{
    common_cmd::{self, cmd, Cmd, Resp, R1, R2, R3, Rz},
    sd_cmd,
};

use crate::{
    hw::{CmdFlags, HwCardMode},
    Inner, NUM_RETRIES_CMD,
};

/// Any of these bits in an R1 response fails the command.
pub(crate) const STATUS_ERROR_MASK: u32 = (1 << 31)  // OUT_OF_RANGE
    | (1 << 30)  // ADDRESS_ERROR
    | (1 << 29)  // BLOCK_LEN_ERROR
    | (1 << 28)  // ERASE_SEQ_ERROR
    | (1 << 27)  // ERASE_PARAM
    | (1 << 26)  // WP_VIOLATION
    | (1 << 24)  // LOCK_UNLOCK_FAILED
    | (1 << 23)  // COM_CRC_ERROR
    | (1 << 22)  // ILLEGAL_COMMAND
    | (1 << 21)  // CARD_ECC_FAILED
    | (1 << 20)  // CC_ERROR
    | (1 << 19)  // ERROR
    | (1 << 16)  // CSD_OVERWRITE
    | (1 << 15)  // WP_ERASE_SKIP
    | (1 << 3); // AKE_SEQ_ERROR

pub(crate) const STATUS_ILLEGAL_COMMAND: u32 = 1 << 22;
pub(crate) const STATUS_READY_FOR_DATA: u32 = 1 << 8;

/// CURRENT_STATE field of an R1 response.
pub(crate) fn status_state(status: u32) -> u8 {
    ((status >> 9) & 0xF) as u8
}

bitflags! {
    /// Card states a command may leave the card in.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct StateMask: u16 {
        const IDLE  = 1 << 0;
        const READY = 1 << 1;
        const IDENT = 1 << 2;
        const STBY  = 1 << 3;
        const TRAN  = 1 << 4;
        const DATA  = 1 << 5;
        const RCV   = 1 << 6;
        const PRG   = 1 << 7;
        const DIS   = 1 << 8;
        const BTST  = 1 << 9;
        const SLP   = 1 << 10;
    }
}

impl StateMask {
    pub(crate) fn matches(self, state: u8) -> bool {
        state < 16 && self.bits() & (1 << state) != 0
    }
}

/// Maps the raw 4-word response to the representation of each response
/// type.
pub(crate) trait RespExt: Resp {
    type Repr: Copy;

    fn from_raw(resp: [u32; 4]) -> Self::Repr;
}

impl RespExt for Rz {
    type Repr = ();

    fn from_raw(_: [u32; 4]) -> Self::Repr {}
}

impl RespExt for R1 {
    type Repr = u32;

    fn from_raw([r0, ..]: [u32; 4]) -> Self::Repr {
        r0
    }
}

impl RespExt for R2 {
    type Repr = [u32; 4];

    fn from_raw(resp: [u32; 4]) -> Self::Repr {
        resp
    }
}

impl RespExt for R3 {
    type Repr = u32;

    fn from_raw([r0, ..]: [u32; 4]) -> Self::Repr {
        r0
    }
}

impl RespExt for sd_cmd::R6 {
    type Repr = u32;

    fn from_raw([r0, ..]: [u32; 4]) -> Self::Repr {
        r0
    }
}

impl RespExt for sd_cmd::R7 {
    type Repr = u32;

    fn from_raw([r0, ..]: [u32; 4]) -> Self::Repr {
        r0
    }
}

// Commands the `sdio-host` encoders do not cover.

/// CMD5: eMMC sleep/awake.
pub(crate) fn sleep_awake(rca: u16, sleep: bool) -> Cmd<R1> {
    cmd(5, u32::from(rca) << 16 | u32::from(sleep) << 15)
}

/// CMD21: eMMC tuning block read.
pub(crate) fn send_tuning_block_mmc() -> Cmd<R1> {
    cmd(21, 0)
}

/// CMD23 with the eMMC reliable-write request bit.
pub(crate) fn set_block_count(count: u16, reliable_write: bool) -> Cmd<R1> {
    cmd(23, u32::from(count) | u32::from(reliable_write) << 31)
}

/// CMD38: erase the previously selected group; `mark_for_erase` turns the
/// operation into a trim.
pub(crate) fn erase(mark_for_erase: bool) -> Cmd<R1> {
    cmd(38, u32::from(mark_for_erase))
}

/// CMD42: lock/unlock; the payload travels in the data phase.
pub(crate) fn lock_unlock() -> Cmd<R1> {
    cmd(42, 0)
}

/// ACMD23: number of blocks to pre-erase before a multi-block write.
pub(crate) fn set_wr_blk_erase_count(count: u32) -> Cmd<R1> {
    cmd(23, count & 0x007F_FFFF)
}

/// ACMD42: connect (true) or disconnect the DAT3 pull-up.
pub(crate) fn set_clr_card_detect(connect: bool) -> Cmd<R1> {
    cmd(42, u32::from(connect))
}

/// Payload byte 0 of the CMD42 data block: force-erase the card, dropping
/// any password.
pub(crate) const LOCK_UNLOCK_ERASE: u8 = 1 << 3;

/// What to do with the data state machine when a data command fails.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum Recovery {
    /// Retry blindly; used by BUSTEST and tuning-block commands, which the
    /// card terminates on its own.
    None,
    /// Stop an interrupted transfer before retrying.
    StopTransmission,
}

impl<H: HwCardMode> Inner<H> {
    /// Sends one command and fetches its response; no retries, no status
    /// interpretation.
    pub(crate) fn cmd_raw<R: RespExt>(&mut self, cmd: Cmd<R>, flags: CmdFlags) -> Result<R::Repr> {
        if !self.hw.is_present() {
            return Err(Error::NoDevice);
        }
        self.hw.send_cmd(cmd.cmd, flags, cmd.response_len(), cmd.arg)?;
        let raw = self.hw.get_response()?;
        Ok(R::from_raw(raw))
    }

    pub(crate) fn exec_r1(&mut self, index: u8, arg: u32, flags: CmdFlags) -> Result<u32> {
        self.exec_r1_masked(index, arg, flags, NUM_RETRIES_CMD, 0)
    }

    /// R1 command with retry on controller failure or card soft error.
    /// `ignore_mask` drops individual status bits from the error check; the
    /// MMC RCA assignment uses it to tolerate the ILLEGAL_COMMAND left over
    /// from probing the SD opcode first.
    pub(crate) fn exec_r1_masked(
        &mut self,
        index: u8,
        arg: u32,
        flags: CmdFlags,
        mut retries: u32,
        ignore_mask: u32,
    ) -> Result<u32> {
        loop {
            let r = self.cmd_raw(cmd::<R1>(index, arg), flags);
            let err = match r {
                Ok(status) => {
                    if status & STATUS_ERROR_MASK & !ignore_mask == 0 {
                        return Ok(status);
                    }
                    log::warn!("CMD{index}: card reports error status {status:#010x}");
                    Error::Protocol
                }
                Err(Error::NoDevice) => return Err(Error::NoDevice),
                Err(e) => e,
            };
            if !self.hw.is_present() {
                return Err(Error::NoDevice);
            }
            if retries == 0 {
                return Err(err);
            }
            retries -= 1;
        }
    }

    /// Application command: CMD55 with the current RCA, then `index`.
    pub(crate) fn exec_app_r1(&mut self, index: u8, arg: u32, flags: CmdFlags) -> Result<u32> {
        let mut retries = NUM_RETRIES_CMD;
        loop {
            let r = self.app_attempt::<R1>(index, arg, flags);
            let err = match r {
                Ok(status) => {
                    if status & STATUS_ERROR_MASK == 0 {
                        return Ok(status);
                    }
                    log::warn!("ACMD{index}: card reports error status {status:#010x}");
                    Error::Protocol
                }
                Err(Error::NoDevice) => return Err(Error::NoDevice),
                Err(e) => e,
            };
            if retries == 0 {
                return Err(err);
            }
            retries -= 1;
        }
    }

    /// Application command with an R3 response (ACMD41); R3 carries no CRC.
    pub(crate) fn exec_app_r3(&mut self, index: u8, arg: u32) -> Result<u32> {
        self.app_attempt::<R3>(index, arg, CmdFlags::NO_CRC_CHECK)
    }

    fn app_attempt<R: RespExt>(&mut self, index: u8, arg: u32, flags: CmdFlags) -> Result<R::Repr> {
        let rca = self.rca;
        let status = self.cmd_raw(common_cmd::app_cmd(rca), CmdFlags::empty())?;
        if status & STATUS_ERROR_MASK != 0 {
            return Err(Error::Protocol);
        }
        self.cmd_raw(cmd::<R>(index, arg), flags)
    }

    /// Reads the card status (CMD13).
    pub(crate) fn read_card_status(&mut self) -> Result<u32> {
        let c = common_cmd::card_status(self.rca, false);
        self.exec_r1(c.cmd, c.arg, CmdFlags::empty())
    }

    /// R1 command whose success is defined by the card ending up in one of
    /// `next_states`. A communication error is recoverable exactly when a
    /// follow-up CMD13 shows the expected state was reached anyway.
    pub(crate) fn exec_r1_check_state(
        &mut self,
        index: u8,
        arg: u32,
        flags: CmdFlags,
        next_states: StateMask,
    ) -> Result<u32> {
        let r = self.cmd_raw(cmd::<R1>(index, arg), flags);
        match r {
            Ok(status) if status & STATUS_ERROR_MASK == 0 => Ok(status),
            Err(Error::NoDevice) => Err(Error::NoDevice),
            _ => {
                let status = self.read_card_status()?;
                if next_states.matches(status_state(status)) {
                    Ok(status)
                } else {
                    log::warn!(
                        "CMD{index}: card in state {} instead of {next_states:?}",
                        status_state(status)
                    );
                    Err(Error::Protocol)
                }
            }
        }
    }

    /// Per-bus-width data-phase flags.
    pub(crate) fn data_flags(&self) -> CmdFlags {
        match self.bus_width {
            4 => CmdFlags::USE_SD4,
            8 => CmdFlags::USE_MMC8,
            _ => CmdFlags::empty(),
        }
    }

    /// R1 command followed by a data read.
    pub(crate) fn exec_r1_read(
        &mut self,
        index: u8,
        arg: u32,
        extra_flags: CmdFlags,
        buf: &mut [u8],
        block_len: usize,
        num_blocks: usize,
        mut retries: u32,
        recovery: Recovery,
    ) -> Result<u32> {
        let flags = self.data_flags() | extra_flags | CmdFlags::DATA_READ;
        loop {
            let r = self.read_attempt(index, arg, flags, buf, block_len, num_blocks);
            let err = match r {
                Ok(status) => return Ok(status),
                Err(Error::NoDevice) => return Err(Error::NoDevice),
                Err(e) => e,
            };
            if recovery == Recovery::StopTransmission {
                self.stop_transmission_if_required();
            }
            if retries == 0 {
                return Err(err);
            }
            retries -= 1;
        }
    }

    fn read_attempt(
        &mut self,
        index: u8,
        arg: u32,
        flags: CmdFlags,
        buf: &mut [u8],
        block_len: usize,
        num_blocks: usize,
    ) -> Result<u32> {
        let status = self.cmd_raw(cmd::<R1>(index, arg), flags)?;
        if status & STATUS_ERROR_MASK != 0 {
            log::warn!("CMD{index}: card reports error status {status:#010x}");
            return Err(Error::Protocol);
        }
        self.hw.read_data(buf, block_len, num_blocks)?;
        Ok(status)
    }

    /// R1 command followed by a data write.
    pub(crate) fn exec_r1_write(
        &mut self,
        index: u8,
        arg: u32,
        extra_flags: CmdFlags,
        buf: &[u8],
        block_len: usize,
        num_blocks: usize,
        mut retries: u32,
    ) -> Result<u32> {
        let flags = self.data_flags() | extra_flags | CmdFlags::DATA_WRITE;
        loop {
            let r = self.write_attempt(index, arg, flags, buf, block_len, num_blocks);
            let err = match r {
                Ok(status) => return Ok(status),
                Err(Error::NoDevice) => return Err(Error::NoDevice),
                Err(e) => e,
            };
            self.stop_transmission_if_required();
            if retries == 0 {
                return Err(err);
            }
            retries -= 1;
        }
    }

    fn write_attempt(
        &mut self,
        index: u8,
        arg: u32,
        flags: CmdFlags,
        buf: &[u8],
        block_len: usize,
        num_blocks: usize,
    ) -> Result<u32> {
        let status = self.cmd_raw(cmd::<R1>(index, arg), flags)?;
        if status & STATUS_ERROR_MASK != 0 {
            log::warn!("CMD{index}: card reports error status {status:#010x}");
            return Err(Error::Protocol);
        }
        self.hw.write_data(buf, block_len, num_blocks)?;
        Ok(status)
    }

    /// Ends an interrupted transfer so the card is ready for the retry.
    pub(crate) fn stop_transmission_if_required(&mut self) {
        let Ok(status) = self.read_card_status() else {
            return;
        };
        let busy = StateMask::DATA | StateMask::RCV | StateMask::PRG;
        if busy.matches(status_state(status)) {
            let _ = self.cmd_raw(
                common_cmd::stop_transmission(),
                CmdFlags::STOP_TRANS | CmdFlags::BUSY,
            );
        }
    }
}
