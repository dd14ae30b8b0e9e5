//! Card identification and configuration.
//!
//! One pass of `identify_once` walks the whole bring-up: reset, card-type
//! probe, voltage negotiation, addressing, register reads, bus width and
//! the access-mode ladder. A capability that fails (a bus width, an access
//! mode, the 1.8 V switch, a tuning run) is latched as permanently
//! unavailable for this mount and the pass is rerun from the top with the
//! capability suppressed, bounded by `NUM_RETRIES_INIT`.

use blocks::{Error, Result};
use sdio_host::{
    common_cmd::{self, cmd, Rz, R1},
    emmc::EMMC,
    emmc_cmd,
    sd::{BusWidth as SdBusWidth, CIC, CSD, OCR, SCR, SD, SDSpecVersion, SDStatus},
    sd_cmd,
};

use crate::{
    cmd::{status_state, StateMask, STATUS_ILLEGAL_COMMAND, STATUS_READY_FOR_DATA},
    hw::{ClockFlags, CmdFlags, HwCardMode},
    reg::{self, ExtCsdInfo, SwitchStatus},
    AccessMode, CardType, Decision, Inner, CHECK_PATTERN, DEFAULT_MMC_RCA, NUM_RETRIES_GO_IDLE,
    NUM_RETRIES_IDENTIFY_MMC, NUM_RETRIES_IDENTIFY_SD, NUM_RETRIES_INIT, NUM_RETRIES_RCA,
    NUM_RETRIES_SWITCH, NUM_RETRIES_TUNING, STARTUP_FREQ_KHZ, VOLTAGE_DEFAULT_MV,
    VOLTAGE_LOW_MAX_MV, VOLTAGE_LOW_MIN_MV, VOLTAGE_UHS_MV,
};

/// OCR argument for CMD1: sector addressing plus the 2.7-3.6 V window.
const MMC_OCR_HIGH_VOLTAGE: u32 = 0x40FF_8000;
/// OCR argument for CMD1 in the 1.70-1.95 V range.
const MMC_OCR_LOW_VOLTAGE: u32 = 0x4000_0080;

const DEFAULT_RESPONSE_TIMEOUT_MS: u32 = 250;
const DEFAULT_READ_DATA_TIMEOUT_MS: u32 = 100;
/// Bound for the CMD13 wait loops, in 1 ms iterations.
const WAIT_STATE_TIMEOUT_LOOPS: u32 = 10_000;

impl<H: HwCardMode> Inner<H> {
    /// Mount entry: runs identification passes until one succeeds with the
    /// still-available capabilities.
    pub(crate) fn init_medium_internal(&mut self) -> Result {
        if self.is_inited {
            return Ok(());
        }
        if !self.is_hw_inited {
            self.hw.init()?;
            self.is_hw_inited = true;
        }
        if !self.hw.is_present() {
            return Err(Error::NoMedium);
        }
        self.caps = Default::default();
        let mut retries = NUM_RETRIES_INIT;
        loop {
            match self.identify_once() {
                Ok(()) => {
                    self.has_error = false;
                    self.is_inited = true;
                    log::info!(
                        "medium ready: {:?}, {} sectors, {}-bit {:?} at {} kHz, {} mV",
                        self.card_type,
                        self.usable_sectors,
                        self.bus_width,
                        self.access_mode,
                        self.clock_khz,
                        self.voltage_mv,
                    );
                    return Ok(());
                }
                Err(e @ (Error::NoDevice | Error::NoMedium | Error::InvalidParam)) => {
                    return Err(e)
                }
                Err(e) => {
                    if retries == 0 {
                        self.has_error = true;
                        return Err(e);
                    }
                    retries -= 1;
                }
            }
        }
    }

    fn identify_once(&mut self) -> Result {
        self.reset_card_state();

        // Reset the card into idle; the first command also clocks out the
        // power-up init sequence.
        for i in 0..NUM_RETRIES_GO_IDLE {
            let flags = if i == 0 {
                CmdFlags::INIT | CmdFlags::NO_CRC_CHECK
            } else {
                CmdFlags::NO_CRC_CHECK
            };
            if self.cmd_raw(common_cmd::idle(), flags).is_ok() {
                break;
            }
        }
        self.hw.delay_ms(10);

        self.hw.set_response_timeout_ms(DEFAULT_RESPONSE_TIMEOUT_MS);
        self.clock_khz = self.hw.set_max_clock(STARTUP_FREQ_KHZ, ClockFlags::empty());
        self.hw.set_read_data_timeout_ms(DEFAULT_READ_DATA_TIMEOUT_MS);

        self.identify_card_type()?;
        self.read_cid_and_rca()?;
        if self.card_type == CardType::Sd {
            self.read_scr()?;
        }
        self.read_csd()?;

        self.select_card()?;
        if self.card_type == CardType::Sd && self.is_locked().unwrap_or(false) {
            log::warn!("card is password locked; data access will fail until unlocked");
        }
        if self.card_type == CardType::Mmc {
            self.read_and_apply_ext_csd()?;
        }
        self.select_bus_width()?;
        match self.card_type {
            CardType::Sd => self.select_access_mode_sd()?,
            _ => self.select_access_mode_mmc()?,
        }

        if self.card_type == CardType::Mmc {
            self.enable_cache_if_present()?;
        }

        // DDR-clocked modes run with a fixed 512-byte block length.
        if !matches!(self.access_mode, AccessMode::HsDdr | AccessMode::Hs400) {
            self.exec_r1(16, blocks::BYTES_PER_SECTOR as u32, CmdFlags::empty())?;
        }

        self.apply_sector_restriction()?;
        self.is_write_protected = self.hw.is_write_protected();
        self.max_read_burst = self.hw.max_read_burst().max(1);
        self.max_write_burst = self.hw.max_write_burst().max(1);
        self.max_write_burst_repeat = self.hw.max_write_burst_repeat();
        self.max_write_burst_fill = self.hw.max_write_burst_fill();
        Ok(())
    }

    fn reset_card_state(&mut self) {
        self.card_type = CardType::Unknown;
        self.rca = 0;
        self.is_high_capacity = false;
        self.bus_width = 1;
        self.access_mode = AccessMode::Ds;
        self.voltage_mv = VOLTAGE_DEFAULT_MV;
        self.is_cache_enabled = false;
        self.is_reliable_write_active = false;
        self.is_close_ended_rw_supported = false;
        self.is_power_save_active = false;
        self.is_enhanced_strobe_active = false;
        self.driver_strength_active = 0;
    }

    /// Classifies the card: CMD8 echo means SD v2+, an answer to ACMD41
    /// alone means SD v1, CMD1 means MMC. Also negotiates the operating
    /// voltage along the way.
    fn identify_card_type(&mut self) -> Result {
        let want_1v8 = self.perm.allow_voltage_1v8 && self.caps.voltage_1v8 == Decision::Untried;

        let r = self.cmd_raw(sd_cmd::send_if_cond(1, CHECK_PATTERN), CmdFlags::empty());
        if let Ok(raw) = r {
            let cic: CIC = raw.into();
            if cic.pattern() != CHECK_PATTERN || cic.voltage_accepted() & 1 == 0 {
                log::error!("unusable interface condition {raw:#x}");
                return Err(Error::NoMedium);
            }
            let ocr = self.sd_op_cond_loop(true, want_1v8)?;
            self.finish_sd_identification(ocr, want_1v8)?;
            return Ok(());
        }

        // No CMD8 answer: either SD v1 or MMC.
        if let Ok(ocr) = self.sd_op_cond_loop(false, false) {
            self.finish_sd_identification(ocr, false)?;
            return Ok(());
        }
        self.identify_mmc(want_1v8)
    }

    fn sd_op_cond_loop(&mut self, hcs: bool, s18r: bool) -> Result<OCR<SD>> {
        let mut retries = NUM_RETRIES_IDENTIFY_SD;
        loop {
            let c = sd_cmd::sd_send_op_cond(hcs, false, s18r, 0x1FF);
            let raw = self.exec_app_r3(c.cmd, c.arg)?;
            let ocr: OCR<SD> = raw.into();
            if !ocr.is_busy() {
                return Ok(ocr);
            }
            if retries == 0 {
                return Err(Error::TimedOut);
            }
            retries -= 1;
        }
    }

    fn finish_sd_identification(&mut self, ocr: OCR<SD>, s18r: bool) -> Result {
        self.card_type = CardType::Sd;
        self.is_high_capacity = ocr.high_capacity();
        if s18r && ocr.v18_allowed() {
            self.switch_voltage_sd()?;
        }
        Ok(())
    }

    /// SD 1.8 V handshake: CMD11, then the controller swaps the rail while
    /// the clock is stopped.
    fn switch_voltage_sd(&mut self) -> Result {
        let r = (|| {
            let status = self.cmd_raw(
                cmd::<R1>(sd_cmd::voltage_switch().cmd, 0),
                CmdFlags::SWITCH_VOLTAGE,
            )?;
            if status & (1 << 19) != 0 {
                return Err(Error::Protocol);
            }
            self.hw
                .set_voltage(VOLTAGE_LOW_MIN_MV, VOLTAGE_LOW_MAX_MV, true)
        })();
        match r {
            Ok(()) => {
                self.voltage_mv = VOLTAGE_UHS_MV;
                Ok(())
            }
            Err(Error::NotSupported) => Ok(()), // stay at 3.3 V
            Err(e) => {
                log::warn!("1.8 V switch failed, staying at 3.3 V");
                self.caps.voltage_1v8 = Decision::Unavailable;
                Err(e)
            }
        }
    }

    fn identify_mmc(&mut self, want_1v8: bool) -> Result {
        let ocr = self.mmc_op_cond_loop(MMC_OCR_HIGH_VOLTAGE)?;
        self.card_type = CardType::Mmc;
        self.is_high_capacity = (ocr.0 >> 29) & 0x3 == 0x2;
        if want_1v8 && ocr.1 {
            // No card handshake on MMC: switch the rail, then repeat CMD1
            // in the low-voltage range.
            let r = (|| {
                self.hw
                    .set_voltage(VOLTAGE_LOW_MIN_MV, VOLTAGE_LOW_MAX_MV, false)?;
                self.mmc_op_cond_loop(MMC_OCR_LOW_VOLTAGE)
            })();
            match r {
                Ok(_) => self.voltage_mv = VOLTAGE_UHS_MV,
                Err(Error::NotSupported) => {}
                Err(e) => {
                    self.caps.voltage_1v8 = Decision::Unavailable;
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Returns the raw OCR and whether the device is dual-voltage.
    fn mmc_op_cond_loop(&mut self, ocr_arg: u32) -> Result<(u32, bool)> {
        let mut retries = NUM_RETRIES_IDENTIFY_MMC;
        loop {
            let raw = self.cmd_raw(emmc_cmd::send_op_cond(ocr_arg), CmdFlags::NO_CRC_CHECK)?;
            if raw & 0x8000_0000 != 0 {
                let ocr: OCR<EMMC> = raw.into();
                return Ok((raw, ocr.is_dual_voltage_card()));
            }
            if retries == 0 {
                return Err(Error::TimedOut);
            }
            retries -= 1;
        }
    }

    fn read_cid_and_rca(&mut self) -> Result {
        self.cid_raw = self.cmd_raw(common_cmd::all_send_cid(), CmdFlags::empty())?;
        match self.card_type {
            CardType::Sd => {
                let mut retries = NUM_RETRIES_RCA;
                loop {
                    let raw = self.cmd_raw(sd_cmd::send_relative_address(), CmdFlags::empty())?;
                    let rca = (raw >> 16) as u16;
                    if rca != 0 {
                        self.rca = rca;
                        break;
                    }
                    if retries == 0 {
                        return Err(Error::Protocol);
                    }
                    retries -= 1;
                }
            }
            _ => {
                // The host assigns the address. An ILLEGAL_COMMAND flag in
                // the response is leftover from probing the SD opcodes
                // first and not an error.
                let c = emmc_cmd::assign_relative_address(DEFAULT_MMC_RCA);
                self.exec_r1_masked(
                    c.cmd,
                    c.arg,
                    CmdFlags::empty(),
                    NUM_RETRIES_RCA,
                    STATUS_ILLEGAL_COMMAND,
                )?;
                self.rca = DEFAULT_MMC_RCA;
            }
        }
        log::info!("card RCA {:#x}", self.rca);
        Ok(())
    }

    fn read_scr(&mut self) -> Result {
        self.select_card()?;
        let mut scr = [0u8; 8];
        self.exec_app_r1_read(sd_cmd::send_scr().cmd, 0, &mut scr)?;
        self.scr = scr;
        self.deselect_card()?;
        Ok(())
    }

    fn read_csd(&mut self) -> Result {
        let rca = self.rca;
        self.csd_raw = self.cmd_raw(common_cmd::send_csd(rca), CmdFlags::empty())?;
        let csd_u128 = u128_from_words(self.csd_raw);
        let version = (csd_u128 >> 126) as u8 & 0x3;
        match self.card_type {
            CardType::Sd => {
                if version > 2 {
                    log::error!("unsupported CSD version {version}");
                    return Err(Error::NoMedium);
                }
                let csd: CSD<SD> = self.csd_raw.into();
                self.num_sectors = csd.block_count().min(u64::from(u32::MAX)) as u32;
            }
            _ => {
                // C_SIZE == 0xFFF means the capacity lives in EXT_CSD.
                let c_size = ((csd_u128 >> 62) & 0xFFF) as u32;
                let c_size_mult = ((csd_u128 >> 47) & 0x7) as u32;
                let read_bl_len = ((csd_u128 >> 80) & 0xF) as u32;
                self.mmc_spec_vers = ((csd_u128 >> 122) & 0xF) as u8;
                self.num_sectors = if c_size == 0xFFF {
                    0 // filled in from EXT_CSD
                } else {
                    let num_blocks = (c_size + 1) << (c_size_mult + 2);
                    num_blocks << read_bl_len >> blocks::BYTES_PER_SECTOR_SHIFT
                };
            }
        }
        Ok(())
    }

    pub(crate) fn select_card(&mut self) -> Result {
        let rca = self.rca;
        let c = common_cmd::select_card(rca);
        self.exec_r1_check_state(c.cmd, c.arg, CmdFlags::BUSY, StateMask::TRAN | StateMask::PRG)?;
        Ok(())
    }

    pub(crate) fn deselect_card(&mut self) -> Result {
        // CMD7 with a zero RCA gets no response.
        self.cmd_raw(cmd::<Rz>(7, 0), CmdFlags::empty())?;
        Ok(())
    }

    fn exec_app_r1_read(&mut self, index: u8, arg: u32, buf: &mut [u8]) -> Result<u32> {
        let rca = self.rca;
        let status = self.cmd_raw(common_cmd::app_cmd(rca), CmdFlags::empty())?;
        if status & crate::cmd::STATUS_ERROR_MASK != 0 {
            return Err(Error::Protocol);
        }
        let len = buf.len();
        self.exec_r1_read(
            index,
            arg,
            CmdFlags::empty(),
            buf,
            len,
            1,
            0,
            crate::cmd::Recovery::StopTransmission,
        )
    }

    fn read_ext_csd(&mut self, raw: &mut [u8; 512]) -> Result {
        let c = emmc_cmd::send_ext_csd();
        self.exec_r1_read(
            c.cmd,
            c.arg,
            CmdFlags::empty(),
            raw,
            512,
            1,
            0,
            crate::cmd::Recovery::StopTransmission,
        )?;
        Ok(())
    }

    fn read_and_apply_ext_csd(&mut self) -> Result {
        let mut raw = [0u8; 512];
        self.read_ext_csd(&mut raw)?;
        let info = ExtCsdInfo::parse(&raw);
        if self.num_sectors == 0 {
            self.num_sectors = info.sec_count;
        }
        // Fall back to the default strength when the card does not
        // advertise the requested one.
        if self.driver_strength != 0 && info.driver_strength & (1 << self.driver_strength) == 0 {
            log::warn!(
                "driver strength {} not supported, using default",
                self.driver_strength
            );
            self.driver_strength = 0;
        }
        self.ext_csd = info;
        self.is_reliable_write_active = self.perm.allow_reliable_write;
        Ok(())
    }

    // Bus width.

    fn select_bus_width(&mut self) -> Result {
        match self.card_type {
            CardType::Sd => self.select_bus_width_sd(),
            _ => self.select_bus_width_mmc(),
        }
    }

    fn select_bus_width_sd(&mut self) -> Result {
        // The DAT3 pull-up has to go before the line carries data.
        let c = crate::cmd::set_clr_card_detect(false);
        let _ = self.exec_app_r1(c.cmd, c.arg, CmdFlags::empty());

        let scr = SCR(u64::from_be_bytes(self.scr));
        if !self.perm.allow_4bit
            || self.caps.bus_width_4 == Decision::Unavailable
            || !scr.bus_width_four()
        {
            return Ok(());
        }
        let r = (|| {
            let c = sd_cmd::set_bus_width(true);
            self.exec_app_r1(c.cmd, c.arg, CmdFlags::empty())?;
            self.bus_width = 4;
            // The card reports the active width in the SD status block.
            let mut sd_status = [0u8; 64];
            let c = sd_cmd::sd_status();
            self.exec_app_r1_read(c.cmd, c.arg, &mut sd_status)?;
            let words: [u32; 16] = reg::words_from_be_bytes(&sd_status);
            let status = SDStatus::from(words);
            if status.bus_width() != SdBusWidth::Four {
                return Err(Error::Protocol);
            }
            Ok(())
        })();
        if let Err(e) = r {
            log::warn!("4-bit bus width rejected");
            self.bus_width = 1;
            self.caps.bus_width_4 = Decision::Unavailable;
            return Err(e);
        }
        Ok(())
    }

    fn select_bus_width_mmc(&mut self) -> Result {
        if self.mmc_spec_vers < 4 {
            return Ok(());
        }
        let sec_count = self.ext_csd.sec_count;
        for (width, code, allowed, cap) in [
            (
                8u8,
                reg::BUS_WIDTH_8BIT,
                self.perm.allow_8bit,
                self.caps.bus_width_8,
            ),
            (
                4u8,
                reg::BUS_WIDTH_4BIT,
                self.perm.allow_4bit,
                self.caps.bus_width_4,
            ),
        ] {
            if !allowed || cap == Decision::Unavailable {
                continue;
            }
            let r = (|| {
                self.mmc_switch(reg::EXT_CSD_BUS_WIDTH, code)?;
                self.bus_width = width;
                // Verify by rereading EXT_CSD over the new width: garbled
                // lanes will not reproduce the sector count.
                let mut raw = [0u8; 512];
                self.read_ext_csd(&mut raw)?;
                if ExtCsdInfo::parse(&raw).sec_count != sec_count {
                    return Err(Error::Protocol);
                }
                Ok(())
            })();
            match r {
                Ok(()) => return Ok(()),
                Err(e) => {
                    log::warn!("{width}-bit bus width rejected");
                    self.bus_width = 1;
                    *self.cap_for_bus_width(width) = Decision::Unavailable;
                    let _ = self.mmc_switch(reg::EXT_CSD_BUS_WIDTH, reg::BUS_WIDTH_1BIT);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn cap_for_bus_width(&mut self, width: u8) -> &mut Decision {
        if width == 8 {
            &mut self.caps.bus_width_8
        } else {
            &mut self.caps.bus_width_4
        }
    }

    /// EXT_CSD byte write via CMD6, polling out the busy phase and
    /// checking SWITCH_ERROR.
    pub(crate) fn mmc_switch(&mut self, index: u8, value: u8) -> Result {
        let c = emmc_cmd::modify_ext_csd(emmc_cmd::AccessMode::WriteByte, index, value);
        self.exec_r1(c.cmd, c.arg, CmdFlags::BUSY)?;
        let mut retries = NUM_RETRIES_SWITCH;
        loop {
            let status = self.read_card_status()?;
            if status & (1 << 7) != 0 {
                log::warn!("SWITCH to EXT_CSD[{index}] = {value:#x} rejected");
                return Err(Error::Protocol);
            }
            if status & STATUS_READY_FOR_DATA != 0
                && StateMask::TRAN.matches(status_state(status))
            {
                return Ok(());
            }
            if retries == 0 {
                return Err(Error::TimedOut);
            }
            retries -= 1;
            self.hw.delay_ms(1);
        }
    }

    // Access modes.

    fn cap_for_mode(&mut self, mode: AccessMode) -> &mut Decision {
        match mode {
            AccessMode::Ds => unreachable!("default speed is always available"),
            AccessMode::Hs => &mut self.caps.high_speed,
            AccessMode::HsDdr => &mut self.caps.hs_ddr,
            AccessMode::Sdr50 => &mut self.caps.sdr50,
            AccessMode::Ddr50 => &mut self.caps.ddr50,
            AccessMode::Sdr104 => &mut self.caps.sdr104,
            AccessMode::Hs200 => &mut self.caps.hs200,
            AccessMode::Hs400 => &mut self.caps.hs400,
        }
    }

    fn csd_clock_khz(&self) -> u32 {
        let tran_speed = (u128_from_words(self.csd_raw) >> 96) as u8;
        reg::tran_speed_khz(tran_speed, self.card_type == CardType::Mmc)
    }

    /// CMD6 switch-function transaction; `set` false only queries.
    fn sd_switch_func(&mut self, set: bool, group: u8, function: u8) -> Result<SwitchStatus> {
        let arg = reg::switch_arg(set, group, function);
        let mut status = SwitchStatus([0u8; 64]);
        let c = sd_cmd::cmd6(arg);
        self.exec_r1_read(
            c.cmd,
            c.arg,
            CmdFlags::empty(),
            &mut status.0,
            64,
            1,
            0,
            crate::cmd::Recovery::StopTransmission,
        )?;
        Ok(status)
    }

    /// Forces the controller rail to 1.8 V when the card denied S18A but
    /// still advertises UHS functions; some cards come out of a warm reset
    /// this way.
    fn force_1v8_if_uhs_capable(&mut self) -> Result {
        if self.voltage_mv <= VOLTAGE_UHS_MV
            || !self.perm.allow_voltage_1v8
            || self.caps.voltage_1v8 == Decision::Unavailable
        {
            return Ok(());
        }
        let status = self.sd_switch_func(false, reg::SD_FUNC_ACCESS_MODE, 0xF)?;
        let any_uhs = status.is_function_supported(1, reg::SD_ACCESS_MODE_SDR50)
            || status.is_function_supported(1, reg::SD_ACCESS_MODE_SDR104)
            || status.is_function_supported(1, reg::SD_ACCESS_MODE_DDR50);
        if !any_uhs {
            return Ok(());
        }
        match self.hw.set_voltage(VOLTAGE_UHS_MV, VOLTAGE_UHS_MV, true) {
            Ok(()) => {
                self.voltage_mv = VOLTAGE_UHS_MV;
                Ok(())
            }
            Err(Error::NotSupported) => Ok(()),
            Err(e) => {
                self.caps.voltage_1v8 = Decision::Unavailable;
                Err(e)
            }
        }
    }

    fn select_access_mode_sd(&mut self) -> Result {
        let scr = SCR(u64::from_be_bytes(self.scr));
        self.is_close_ended_rw_supported = blocks::bits::get_bits(&self.scr, 33, 33) != 0;
        // CMD6 only exists from spec 1.10 on.
        if matches!(scr.version(), SDSpecVersion::V1_0) {
            self.clock_khz = self.hw.set_max_clock(self.csd_clock_khz(), ClockFlags::empty());
            return Ok(());
        }

        self.force_1v8_if_uhs_capable()?;
        let uhs_ready = self.voltage_mv <= VOLTAGE_UHS_MV;

        let rungs = [
            (
                AccessMode::Sdr104,
                reg::SD_ACCESS_MODE_SDR104,
                self.perm.allow_sdr104 && uhs_ready,
                208_000u32,
                ClockFlags::empty(),
                self.perm.tuning_sdr104,
            ),
            (
                AccessMode::Ddr50,
                reg::SD_ACCESS_MODE_DDR50,
                self.perm.allow_ddr50 && uhs_ready && self.bus_width >= 4,
                50_000,
                ClockFlags::DDR_MODE,
                false,
            ),
            (
                AccessMode::Sdr50,
                reg::SD_ACCESS_MODE_SDR50,
                self.perm.allow_sdr50 && uhs_ready,
                100_000,
                ClockFlags::empty(),
                self.perm.tuning_sdr50,
            ),
            (
                AccessMode::Hs,
                reg::SD_ACCESS_MODE_HS,
                self.perm.allow_high_speed,
                50_000,
                ClockFlags::empty(),
                false,
            ),
        ];

        for (mode, function, allowed, freq_khz, clock_flags, needs_tuning) in rungs {
            if !allowed || *self.cap_for_mode(mode) == Decision::Unavailable {
                continue;
            }
            let probe = self.sd_switch_func(false, reg::SD_FUNC_ACCESS_MODE, function)?;
            if !probe.is_function_supported(reg::SD_FUNC_ACCESS_MODE, function) {
                continue;
            }
            let r = (|| {
                let status = self.sd_switch_func(true, reg::SD_FUNC_ACCESS_MODE, function)?;
                if status.selected_function(reg::SD_FUNC_ACCESS_MODE) != function {
                    return Err(Error::Protocol);
                }
                self.access_mode = mode;
                if mode == AccessMode::Hs {
                    // TRAN_SPEED changed; pick it up again.
                    self.deselect_card()?;
                    self.read_csd()?;
                    self.select_card()?;
                    self.clock_khz = self
                        .hw
                        .set_max_clock(self.csd_clock_khz(), clock_flags);
                } else {
                    let freq = if mode == AccessMode::Ddr50 {
                        self.csd_clock_khz() / 2
                    } else {
                        freq_khz
                    };
                    self.clock_khz = self.hw.set_max_clock(freq, clock_flags);
                }
                self.select_driver_strength_sd()?;
                if needs_tuning {
                    self.tune_sampling_point()?;
                }
                Ok(())
            })();
            if let Err(e) = r {
                *self.cap_for_mode(mode) = Decision::Unavailable;
                self.access_mode = AccessMode::Ds;
                return Err(e);
            }
            return Ok(());
        }
        self.clock_khz = self.hw.set_max_clock(self.csd_clock_khz(), ClockFlags::empty());
        Ok(())
    }

    fn select_driver_strength_sd(&mut self) -> Result {
        if self.driver_strength == 0 {
            return Ok(());
        }
        let requested = self.driver_strength;
        let probe = self.sd_switch_func(false, reg::SD_FUNC_DRIVER_STRENGTH, requested)?;
        if !probe.is_function_supported(reg::SD_FUNC_DRIVER_STRENGTH, requested) {
            return Ok(());
        }
        let status = self.sd_switch_func(true, reg::SD_FUNC_DRIVER_STRENGTH, requested)?;
        if status.selected_function(reg::SD_FUNC_DRIVER_STRENGTH) == requested {
            self.driver_strength_active = requested;
        }
        Ok(())
    }

    fn select_access_mode_mmc(&mut self) -> Result {
        let card_type = self.ext_csd.card_type;
        let low_voltage = self.voltage_mv <= VOLTAGE_UHS_MV;

        // HS400 with enhanced strobe skips the HS200 tuning pass: the card
        // drives the read strobe itself.
        if self.perm.allow_hs400
            && self.perm.allow_enhanced_strobe
            && self.caps.hs400 == Decision::Untried
            && self.bus_width == 8
            && low_voltage
            && card_type & reg::CARD_TYPE_HS400_1V8 != 0
            && self.ext_csd.strobe_support != 0
        {
            let r = self.switch_to_hs400_enhanced_strobe();
            if let Err(e) = r {
                self.caps.hs400 = Decision::Unavailable;
                return Err(e);
            }
            self.access_mode = AccessMode::Hs400;
            self.is_enhanced_strobe_active = true;
            return Ok(());
        }

        if self.perm.allow_hs200
            && self.caps.hs200 == Decision::Untried
            && low_voltage
            && self.bus_width >= 4
            && card_type & reg::CARD_TYPE_HS200_1V8 != 0
        {
            let r = (|| {
                self.mmc_switch(reg::EXT_CSD_HS_TIMING, reg::HS_TIMING_HS200)?;
                self.clock_khz = self.hw.set_max_clock(200_000, ClockFlags::empty());
                if self.perm.tuning_hs200 {
                    self.tune_sampling_point()?;
                }
                Ok(())
            })();
            if let Err(e) = r {
                self.caps.hs200 = Decision::Unavailable;
                return Err(e);
            }
            self.access_mode = AccessMode::Hs200;
            return Ok(());
        }

        if self.perm.allow_hs_ddr
            && self.caps.hs_ddr == Decision::Untried
            && self.bus_width >= 4
            && card_type & reg::CARD_TYPE_DDR_52_1V8_3V != 0
        {
            let code = if self.bus_width == 8 {
                reg::BUS_WIDTH_8BIT_DDR
            } else {
                reg::BUS_WIDTH_4BIT_DDR
            };
            let r = (|| {
                self.mmc_switch(reg::EXT_CSD_HS_TIMING, reg::HS_TIMING_HS)?;
                self.mmc_switch(reg::EXT_CSD_BUS_WIDTH, code)?;
                self.clock_khz = self.hw.set_max_clock(52_000, ClockFlags::DDR_MODE);
                Ok(())
            })();
            if let Err(e) = r {
                self.caps.hs_ddr = Decision::Unavailable;
                return Err(e);
            }
            self.access_mode = AccessMode::HsDdr;
            return Ok(());
        }

        if self.perm.allow_high_speed
            && self.caps.high_speed == Decision::Untried
            && card_type & (reg::CARD_TYPE_HS_52 | reg::CARD_TYPE_HS_26) != 0
        {
            let r = self.mmc_switch(reg::EXT_CSD_HS_TIMING, reg::HS_TIMING_HS);
            if let Err(e) = r {
                self.caps.high_speed = Decision::Unavailable;
                return Err(e);
            }
            let freq = if card_type & reg::CARD_TYPE_HS_52 != 0 {
                52_000
            } else {
                26_000
            };
            self.clock_khz = self.hw.set_max_clock(freq, ClockFlags::empty());
            self.access_mode = AccessMode::Hs;
            return Ok(());
        }

        self.clock_khz = self.hw.set_max_clock(self.csd_clock_khz(), ClockFlags::empty());
        Ok(())
    }

    fn switch_to_hs400_enhanced_strobe(&mut self) -> Result {
        self.mmc_switch(reg::EXT_CSD_HS_TIMING, reg::HS_TIMING_HS)?;
        self.clock_khz = self.hw.set_max_clock(52_000, ClockFlags::empty());
        self.mmc_switch(
            reg::EXT_CSD_BUS_WIDTH,
            reg::BUS_WIDTH_8BIT_DDR | reg::BUS_WIDTH_STROBE,
        )?;
        self.mmc_switch(reg::EXT_CSD_HS_TIMING, reg::HS_TIMING_HS400)?;
        self.wait_for_ready()?;
        self.clock_khz = self
            .hw
            .set_max_clock(200_000, ClockFlags::DDR_MODE | ClockFlags::STROBE_MODE);
        Ok(())
    }

    /// Sampling-point tuning: try every tap, pick the midpoint of the
    /// longest passing run, revalidate it. A controller without tuning
    /// support makes this a no-op.
    pub(crate) fn tune_sampling_point(&mut self) -> Result {
        let num_taps = self.hw.max_tunings();
        if num_taps == 0 || self.hw.enable_tuning().is_err() {
            return Ok(());
        }

        let is_mmc = self.card_type == CardType::Mmc;
        let index = if is_mmc {
            crate::cmd::send_tuning_block_mmc().cmd
        } else {
            sd_cmd::send_tuning_block(0).cmd
        };
        let pattern: &[u8] = if is_mmc && self.bus_width == 8 {
            &reg::TUNING_PATTERN_8BIT
        } else {
            &reg::TUNING_PATTERN_4BIT
        };

        let mut run: Option<(u32, u32)> = None;
        let mut best: Option<(u32, u32)> = None;
        for step in 0..num_taps {
            if self.hw.start_tuning(step).is_err() {
                break;
            }
            let passed = self.read_tuning_block(index, pattern);
            if passed {
                let (first, last) = match run {
                    Some((first, _)) => (first, step),
                    None => (step, step),
                };
                run = Some((first, last));
                if best.map_or(true, |(bf, bl)| last - first > bl - bf) {
                    best = Some((first, last));
                }
            } else {
                run = None;
            }
        }

        let ok = (|| {
            let (first, last) = best?;
            let mid = (first + last) / 2;
            self.hw.start_tuning(mid).ok()?;
            (0..NUM_RETRIES_TUNING)
                .any(|_| self.read_tuning_block(index, pattern))
                .then_some(())
        })()
        .is_some();

        self.hw.disable_tuning(!ok);
        if !ok {
            log::warn!("sampling-point tuning failed");
            return Err(Error::Io);
        }
        Ok(())
    }

    fn read_tuning_block(&mut self, index: u8, pattern: &[u8]) -> bool {
        let mut buf = [0u8; 128];
        let buf = &mut buf[..pattern.len()];
        let len = buf.len();
        let r = self.exec_r1_read(
            index,
            0,
            CmdFlags::empty(),
            buf,
            len,
            1,
            0,
            crate::cmd::Recovery::None,
        );
        r.is_ok() && buf == pattern
    }

    fn enable_cache_if_present(&mut self) -> Result {
        if !self.perm.allow_cache || self.ext_csd.cache_size_kb == 0 {
            return Ok(());
        }
        match self.mmc_switch(reg::EXT_CSD_CACHE_CTRL, 1) {
            Ok(()) => {
                self.is_cache_enabled = true;
                Ok(())
            }
            // A card that rejects cache activation still works.
            Err(Error::Protocol) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn apply_sector_restriction(&mut self) -> Result {
        if self.start_sector >= self.num_sectors {
            log::error!(
                "start sector {} beyond medium capacity {}",
                self.start_sector,
                self.num_sectors
            );
            return Err(Error::InvalidParam);
        }
        let mut usable = self.num_sectors - self.start_sector;
        if self.max_num_sectors != 0 {
            usable = usable.min(self.max_num_sectors);
        }
        if usable == 0 {
            return Err(Error::InvalidParam);
        }
        self.usable_sectors = usable;
        Ok(())
    }

    // Card-state waits. All of them latch `has_error` on expiry; further
    // I/O is rejected until the medium is mounted again.

    pub(crate) fn wait_for_ready(&mut self) -> Result<u32> {
        self.wait_status(|status| status & STATUS_READY_FOR_DATA != 0)
    }

    pub(crate) fn wait_for_idle(&mut self) -> Result<u32> {
        self.wait_status(|status| {
            (StateMask::STBY | StateMask::TRAN).matches(status_state(status))
        })
    }

    pub(crate) fn wait_for_state(&mut self, states: StateMask) -> Result<u32> {
        self.wait_status(move |status| states.matches(status_state(status)))
    }

    fn wait_status(&mut self, done: impl Fn(u32) -> bool) -> Result<u32> {
        let mut timeout = WAIT_STATE_TIMEOUT_LOOPS;
        loop {
            let status = match self.read_card_status() {
                Ok(status) => status,
                Err(Error::NoDevice) => return Err(Error::NoDevice),
                Err(e) => {
                    self.has_error = true;
                    return Err(e);
                }
            };
            if done(status) {
                return Ok(status);
            }
            timeout -= 1;
            if timeout == 0 {
                log::error!("card stuck in state {}", status_state(status));
                self.has_error = true;
                return Err(Error::TimedOut);
            }
            self.hw.delay_ms(1);
        }
    }

    // Power save.

    pub(crate) fn enter_power_save(&mut self) -> Result {
        if !self.perm.allow_power_save || self.is_power_save_active {
            return Ok(());
        }
        self.wait_for_idle()?;
        self.deselect_card()?;
        if self.card_type == CardType::Mmc {
            let rca = self.rca;
            let c = crate::cmd::sleep_awake(rca, true);
            self.exec_r1_check_state(c.cmd, c.arg, CmdFlags::BUSY, StateMask::SLP)?;
        }
        self.is_power_save_active = true;
        Ok(())
    }

    pub(crate) fn leave_power_save(&mut self) -> Result {
        if !self.is_power_save_active {
            return Ok(());
        }
        if self.card_type == CardType::Mmc {
            let rca = self.rca;
            let c = crate::cmd::sleep_awake(rca, false);
            self.exec_r1_check_state(c.cmd, c.arg, CmdFlags::BUSY, StateMask::STBY)?;
        }
        self.select_card()?;
        self.is_power_save_active = false;
        Ok(())
    }

    // Unmount.

    pub(crate) fn unmount_internal(&mut self, forced: bool) {
        if self.is_inited && !forced && !self.has_error {
            if self.is_cache_enabled {
                let _ = self.mmc_switch(reg::EXT_CSD_FLUSH_CACHE, 1);
                let _ = self.mmc_switch(reg::EXT_CSD_CACHE_CTRL, 0);
            }
            let _ = self.wait_for_idle();
            if self.card_type == CardType::Sd {
                // Put the DAT3 pull-up back for card-detection circuits.
                let c = crate::cmd::set_clr_card_detect(true);
                let _ = self.exec_app_r1(c.cmd, c.arg, CmdFlags::empty());
            }
            let _ = self.deselect_card();
        }
        self.is_inited = false;
        self.has_error = false;
        self.is_cache_enabled = false;
        self.is_power_save_active = false;
    }
}

pub(crate) fn u128_from_words(words: [u32; 4]) -> u128 {
    (u128::from(words[3]) << 96)
        | (u128::from(words[2]) << 64)
        | (u128::from(words[1]) << 32)
        | u128::from(words[0])
}
