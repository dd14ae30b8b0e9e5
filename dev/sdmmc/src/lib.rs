//! Block-device driver for SD and MMC/eMMC cards operated in native
//! (4/8-bit parallel) card mode.
//!
//! The driver identifies the medium on first access, negotiates bus width,
//! signalling voltage and access mode up to HS400 with enhanced strobe,
//! then serves 512-byte sector I/O with bounded retries. All controller
//! access goes through the [`HwCardMode`] trait; nothing here touches
//! hardware registers directly.
#![cfg_attr(not(test), no_std)]

mod cmd;
mod hw;
mod ident;
mod io;
mod reg;

use array_macro::array;
use blocks::{
    BlockDevice, BurstType, DeviceInfo, Error, IoctlCmd, MediumStatus, Result, BYTES_PER_SECTOR,
};
use spin::Mutex;
use static_assertions::const_assert_eq;

pub use crate::hw::{ClockFlags, CmdFlags, HwCardMode};
use crate::reg::ExtCsdInfo;

// The whole command layer assumes the fixed 512-byte sector of the block
// contract.
const_assert_eq!(BYTES_PER_SECTOR, 512);
const_assert_eq!(1usize << blocks::BYTES_PER_SECTOR_SHIFT, BYTES_PER_SECTOR);

// Retry budgets and wire constants.
pub(crate) const NUM_RETRIES_CMD: u32 = 5;
pub(crate) const NUM_RETRIES_DATA: u32 = 5;
pub(crate) const NUM_RETRIES_IDENTIFY_SD: u32 = 2000;
pub(crate) const NUM_RETRIES_IDENTIFY_MMC: u32 = 4000;
pub(crate) const NUM_RETRIES_GO_IDLE: u32 = 10;
pub(crate) const NUM_RETRIES_RCA: u32 = 10;
pub(crate) const NUM_RETRIES_SWITCH: u32 = 100;
pub(crate) const NUM_RETRIES_INIT: u32 = 5;
pub(crate) const NUM_RETRIES_TUNING: u32 = 10;

pub(crate) const STARTUP_FREQ_KHZ: u32 = 400;
pub(crate) const VOLTAGE_DEFAULT_MV: u16 = 3300;
pub(crate) const VOLTAGE_LOW_MIN_MV: u16 = 1700;
pub(crate) const VOLTAGE_LOW_MAX_MV: u16 = 1950;
pub(crate) const VOLTAGE_UHS_MV: u16 = 1800;
pub(crate) const CHECK_PATTERN: u8 = 0xAA;
pub(crate) const DEFAULT_MMC_RCA: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CardType {
    #[default]
    Unknown,
    Sd,
    Mmc,
}

/// Signalling/throughput tier the card ends up in after configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMode {
    #[default]
    Ds,
    Hs,
    HsDdr,
    Sdr50,
    Ddr50,
    Sdr104,
    Hs200,
    Hs400,
}

/// Outcome of a capability probe. A capability that failed once is not
/// probed again for the lifetime of the mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum Decision {
    #[default]
    Untried,
    Unavailable,
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct CapDecisions {
    pub voltage_1v8: Decision,
    pub bus_width_8: Decision,
    pub bus_width_4: Decision,
    pub high_speed: Decision,
    pub hs_ddr: Decision,
    pub sdr50: Decision,
    pub ddr50: Decision,
    pub sdr104: Decision,
    pub hs200: Decision,
    pub hs400: Decision,
}

/// What the integration permits the driver to negotiate. Consumed once
/// when the instance is created; immutable afterwards.
#[derive(Debug, Clone, Copy)]
pub struct Permissions {
    pub allow_4bit: bool,
    pub allow_8bit: bool,
    pub allow_high_speed: bool,
    pub allow_hs_ddr: bool,
    pub allow_sdr50: bool,
    pub allow_ddr50: bool,
    pub allow_sdr104: bool,
    pub allow_hs200: bool,
    pub allow_hs400: bool,
    pub allow_voltage_1v8: bool,
    pub allow_reliable_write: bool,
    pub allow_buffered_write: bool,
    pub allow_cache: bool,
    pub allow_power_save: bool,
    pub allow_enhanced_strobe: bool,
    pub tuning_sdr50: bool,
    pub tuning_sdr104: bool,
    pub tuning_hs200: bool,
    /// Issue the final sector of a multi-block read as a single-block
    /// command; works around controllers that mishandle the last burst.
    pub read_single_last_sector: bool,
    /// Requested driver strength (SD group 3 / EXT_CSD code); 0 keeps the
    /// card default.
    pub driver_strength: u8,
    /// First usable sector on the medium.
    pub start_sector: u32,
    /// Cap on the reported capacity; 0 leaves it unlimited.
    pub max_num_sectors: u32,
}

impl Default for Permissions {
    fn default() -> Self {
        Permissions {
            allow_4bit: true,
            allow_8bit: true,
            allow_high_speed: true,
            allow_hs_ddr: true,
            allow_sdr50: true,
            allow_ddr50: true,
            allow_sdr104: true,
            allow_hs200: true,
            allow_hs400: true,
            allow_voltage_1v8: true,
            allow_reliable_write: true,
            allow_buffered_write: true,
            allow_cache: true,
            allow_power_save: false,
            allow_enhanced_strobe: true,
            tuning_sdr50: true,
            tuning_sdr104: true,
            tuning_hs200: true,
            read_single_last_sector: false,
            driver_strength: 0,
            start_sector: 0,
            max_num_sectors: 0,
        }
    }
}

/// Operation counters, kept across remounts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub read_sector_cnt: u32,
    pub read_error_cnt: u32,
    pub write_sector_cnt: u32,
    pub write_error_cnt: u32,
}

pub(crate) struct Inner<H> {
    pub(crate) hw: H,
    pub(crate) perm: Permissions,

    pub(crate) card_type: CardType,
    pub(crate) rca: u16,
    pub(crate) is_high_capacity: bool,
    pub(crate) is_write_protected: bool,

    pub(crate) num_sectors: u32,
    pub(crate) start_sector: u32,
    pub(crate) max_num_sectors: u32,
    pub(crate) usable_sectors: u32,

    pub(crate) bus_width: u8,
    pub(crate) clock_khz: u32,
    pub(crate) voltage_mv: u16,
    pub(crate) access_mode: AccessMode,
    pub(crate) driver_strength: u8,
    pub(crate) driver_strength_active: u8,
    pub(crate) caps: CapDecisions,

    pub(crate) is_inited: bool,
    pub(crate) is_hw_inited: bool,
    pub(crate) has_error: bool,
    pub(crate) is_cache_enabled: bool,
    pub(crate) is_reliable_write_active: bool,
    pub(crate) is_close_ended_rw_supported: bool,
    pub(crate) is_power_save_active: bool,
    pub(crate) is_enhanced_strobe_active: bool,

    pub(crate) max_read_burst: u32,
    pub(crate) max_write_burst: u32,
    pub(crate) max_write_burst_repeat: u32,
    pub(crate) max_write_burst_fill: u32,

    pub(crate) cid_raw: [u32; 4],
    pub(crate) csd_raw: [u32; 4],
    pub(crate) scr: [u8; 8],
    pub(crate) ext_csd: ExtCsdInfo,
    pub(crate) mmc_spec_vers: u8,

    pub(crate) stats: Stats,
}

/// One SD/MMC unit.
pub struct Sdmmc<H: HwCardMode> {
    inner: Mutex<Inner<H>>,
}

impl<H: HwCardMode> Sdmmc<H> {
    pub fn new(hw: H, perm: Permissions) -> Self {
        Sdmmc {
            inner: Mutex::new(Inner {
                hw,
                perm,
                card_type: CardType::Unknown,
                rca: 0,
                is_high_capacity: false,
                is_write_protected: false,
                num_sectors: 0,
                start_sector: perm.start_sector,
                max_num_sectors: perm.max_num_sectors,
                usable_sectors: 0,
                bus_width: 1,
                clock_khz: 0,
                voltage_mv: VOLTAGE_DEFAULT_MV,
                access_mode: AccessMode::Ds,
                driver_strength: perm.driver_strength,
                driver_strength_active: 0,
                caps: CapDecisions::default(),
                is_inited: false,
                is_hw_inited: false,
                has_error: false,
                is_cache_enabled: false,
                is_reliable_write_active: false,
                is_close_ended_rw_supported: false,
                is_power_save_active: false,
                is_enhanced_strobe_active: false,
                max_read_burst: 1,
                max_write_burst: 1,
                max_write_burst_repeat: 0,
                max_write_burst_fill: 0,
                cid_raw: [0; 4],
                csd_raw: [0; 4],
                scr: [0; 8],
                ext_csd: ExtCsdInfo::default(),
                mmc_spec_vers: 0,
                stats: Stats::default(),
            }),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut Inner<H>) -> T) -> T {
        f(&mut self.inner.lock())
    }

    pub fn stats(&self) -> Stats {
        self.with(|s| s.stats)
    }

    pub fn card_type(&self) -> CardType {
        self.with(|s| s.card_type)
    }

    pub fn access_mode(&self) -> AccessMode {
        self.with(|s| s.access_mode)
    }

    pub fn bus_width(&self) -> u8 {
        self.with(|s| s.bus_width)
    }

    pub fn clock_khz(&self) -> u32 {
        self.with(|s| s.clock_khz)
    }

    pub fn voltage_mv(&self) -> u16 {
        self.with(|s| s.voltage_mv)
    }

    pub fn is_high_capacity(&self) -> bool {
        self.with(|s| s.is_high_capacity)
    }

    pub fn is_enhanced_strobe_active(&self) -> bool {
        self.with(|s| s.is_enhanced_strobe_active)
    }

    pub fn rca(&self) -> u16 {
        self.with(|s| s.rca)
    }

    /// Raw CID bytes as sent by the card; stable across remounts of the
    /// same medium.
    pub fn cid(&self) -> [u8; 16] {
        self.with(|s| s.cid_bytes())
    }

    /// Force-erases a password-locked SD card, losing its contents.
    pub fn force_unlock(&self) -> Result {
        self.with(|s| s.unlock_forced())
    }

    /// Erases a sector range. Only MMC devices act on it; on SD the call
    /// succeeds without touching the medium.
    pub fn erase(&self, first_sector: u32, num_sectors: u32) -> Result {
        self.with(|s| s.erase_sectors(first_sector, num_sectors, false))
    }
}

impl<H: HwCardMode> BlockDevice for Sdmmc<H> {
    fn status(&self) -> MediumStatus {
        self.with(|s| {
            if !s.is_hw_inited {
                if s.hw.init().is_err() {
                    return MediumStatus::Unknown;
                }
                s.is_hw_inited = true;
            }
            if s.hw.is_present() {
                MediumStatus::Present
            } else {
                MediumStatus::NotPresent
            }
        })
    }

    fn device_info(&self) -> Result<DeviceInfo> {
        self.with(|s| {
            s.init_medium_internal()?;
            Ok(DeviceInfo {
                num_sectors: s.usable_sectors,
                bytes_per_sector: BYTES_PER_SECTOR as u16,
            })
        })
    }

    fn read(&self, sector: u32, buf: &mut [u8], num_sectors: u32) -> Result {
        self.with(|s| s.read_sectors(sector, buf, num_sectors))
    }

    fn write(&self, sector: u32, buf: &[u8], num_sectors: u32, burst: BurstType) -> Result {
        self.with(|s| s.write_sectors(sector, buf, num_sectors, burst))
    }

    fn ioctl(&self, cmd: IoctlCmd) -> Result {
        self.with(|s| match cmd {
            IoctlCmd::Unmount => {
                s.unmount_internal(false);
                Ok(())
            }
            IoctlCmd::UnmountForced | IoctlCmd::Deinit => {
                s.unmount_internal(true);
                Ok(())
            }
            IoctlCmd::GetDevInfo => s.init_medium_internal(),
            IoctlCmd::FreeSectors {
                first_sector,
                num_sectors,
            } => s.erase_sectors(first_sector, num_sectors, true),
        })
    }

    fn init_medium(&self) -> Result {
        self.with(|s| s.init_medium_internal())
    }
}

/// Unit table handed to the filesystem integration; instances are created
/// explicitly and torn down with [`IoctlCmd::Deinit`].
pub struct Registry<H: HwCardMode, const N: usize> {
    units: [Mutex<Option<Sdmmc<H>>>; N],
}

impl<H: HwCardMode, const N: usize> Registry<H, N> {
    pub fn new() -> Self {
        Registry {
            units: array![_ => Mutex::new(None); N],
        }
    }

    pub fn add_unit(&self, unit: usize, hw: H, perm: Permissions) -> Result {
        let mut slot = self.units.get(unit).ok_or(Error::InvalidParam)?.lock();
        if slot.is_some() {
            return Err(Error::InvalidParam);
        }
        *slot = Some(Sdmmc::new(hw, perm));
        Ok(())
    }

    pub fn remove_unit(&self, unit: usize) -> Result {
        let mut slot = self.units.get(unit).ok_or(Error::InvalidParam)?.lock();
        slot.take().ok_or(Error::NoDevice).map(drop)
    }

    pub fn with_unit<T>(&self, unit: usize, f: impl FnOnce(&Sdmmc<H>) -> T) -> Result<T> {
        let slot = self.units.get(unit).ok_or(Error::InvalidParam)?.lock();
        slot.as_ref().map(f).ok_or(Error::NoDevice)
    }

    pub fn status(&self, unit: usize) -> MediumStatus {
        self.with_unit(unit, |card| card.status())
            .unwrap_or(MediumStatus::Unknown)
    }

    pub fn device_info(&self, unit: usize) -> Result<DeviceInfo> {
        self.with_unit(unit, |card| card.device_info())?
    }

    pub fn read(&self, unit: usize, sector: u32, buf: &mut [u8], num_sectors: u32) -> Result {
        self.with_unit(unit, |card| card.read(sector, buf, num_sectors))?
    }

    pub fn write(
        &self,
        unit: usize,
        sector: u32,
        buf: &[u8],
        num_sectors: u32,
        burst: BurstType,
    ) -> Result {
        self.with_unit(unit, |card| card.write(sector, buf, num_sectors, burst))?
    }

    pub fn ioctl(&self, unit: usize, cmd: IoctlCmd) -> Result {
        if matches!(cmd, IoctlCmd::Deinit) {
            let _ = self.with_unit(unit, |card| card.ioctl(IoctlCmd::UnmountForced));
            return self.remove_unit(unit);
        }
        self.with_unit(unit, |card| card.ioctl(cmd))?
    }

    pub fn init_medium(&self, unit: usize) -> Result {
        self.with_unit(unit, |card| card.init_medium())?
    }
}

impl<H: HwCardMode, const N: usize> Default for Registry<H, N> {
    fn default() -> Self {
        Self::new()
    }
}
