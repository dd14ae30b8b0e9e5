use crate::error::Result;

/// All drivers in this workspace expose 512-byte logical sectors.
pub const BYTES_PER_SECTOR_SHIFT: u32 = 9;
pub const BYTES_PER_SECTOR: usize = 1 << BYTES_PER_SECTOR_SHIFT;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediumStatus {
    Unknown,
    NotPresent,
    Present,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub num_sectors: u32,
    pub bytes_per_sector: u16,
}

/// Write intent hint passed down by the filesystem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BurstType {
    /// Every sector carries distinct data.
    #[default]
    Normal,
    /// The same sector buffer is replayed for each sector.
    Repeat,
    /// Every 32-bit word of every sector holds the same value.
    Fill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoctlCmd {
    /// Shut the medium down cleanly and forget the identification state.
    Unmount,
    /// Forget the identification state without touching the medium.
    UnmountForced,
    /// Query [`DeviceInfo`].
    GetDevInfo,
    /// Tell the medium the sector range is no longer in use (trim).
    FreeSectors { first_sector: u32, num_sectors: u32 },
    /// Release the instance entirely.
    Deinit,
}

/// Contract consumed by the filesystem layer.
///
/// The first call that needs medium access triggers identification; after a
/// fatal error every operation except a forced unmount fails until the
/// medium is re-identified.
pub trait BlockDevice {
    fn status(&self) -> MediumStatus;

    /// Initialises the medium on first use.
    fn device_info(&self) -> Result<DeviceInfo>;

    fn read(&self, sector: u32, buf: &mut [u8], num_sectors: u32) -> Result;

    fn write(&self, sector: u32, buf: &[u8], num_sectors: u32, burst: BurstType) -> Result;

    fn ioctl(&self, cmd: IoctlCmd) -> Result;

    /// Explicit identification trigger.
    fn init_medium(&self) -> Result;
}
