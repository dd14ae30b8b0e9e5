//! Family-aware driver for SPI-attached NOR flash devices.
//!
//! Bring-up walks an ordered list of family descriptors; the first one whose
//! `identify` accepts the RDID response stays bound to the instance and
//! handles everything the vendors disagree on (quad enable bits, 4-byte
//! address entry, error flags, write-protection schemes). Geometry and read
//! mode come from SFDP where the device has it, from CFI or hard-coded
//! tables where it does not.
//!
//! Two identical dies wired in parallel are driven as one device of twice
//! the capacity; the hardware layer splits each transaction between the
//! dies and the `_x2` code paths check both status bytes.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod cmds;
mod device;
mod family;
mod hw;
mod sfdp;

use alloc::boxed::Box;

use blocks::{Error, Result};

pub use self::{
    cmds::*,
    device::{Device, DeviceList, SectorBlock},
    family::*,
    hw::{BusWidth, HwSpi, PollPara, XferFlags},
};

/// Largest number of sector blocks a supported device reports (Microchip
/// parts describe five).
pub const MAX_SECTOR_BLOCKS: usize = 5;

/// Default page size used to chunk writes when SFDP does not say otherwise.
pub const PAGE_SIZE: usize = 256;

/// Geometry parameters of known devices without SFDP, keyed by the third
/// RDID byte.
struct DeviceInfo {
    id: u8,
    ld_bytes_per_sector: u8,
    ld_num_sectors: u8,
    num_bytes_addr: u8,
}

static DEVICE_INFO_BY_ID: &[DeviceInfo] = &[
    DeviceInfo { id: 0x11, ld_bytes_per_sector: 15, ld_num_sectors: 2, num_bytes_addr: 3 }, //   1 Mbit
    DeviceInfo { id: 0x12, ld_bytes_per_sector: 16, ld_num_sectors: 2, num_bytes_addr: 3 }, //   2 Mbit
    DeviceInfo { id: 0x13, ld_bytes_per_sector: 16, ld_num_sectors: 3, num_bytes_addr: 3 }, //   4 Mbit
    DeviceInfo { id: 0x14, ld_bytes_per_sector: 16, ld_num_sectors: 4, num_bytes_addr: 3 }, //   8 Mbit
    DeviceInfo { id: 0x15, ld_bytes_per_sector: 16, ld_num_sectors: 5, num_bytes_addr: 3 }, //  16 Mbit
    DeviceInfo { id: 0x16, ld_bytes_per_sector: 16, ld_num_sectors: 6, num_bytes_addr: 3 }, //  32 Mbit
    DeviceInfo { id: 0x17, ld_bytes_per_sector: 16, ld_num_sectors: 7, num_bytes_addr: 3 }, //  64 Mbit
    DeviceInfo { id: 0x18, ld_bytes_per_sector: 18, ld_num_sectors: 6, num_bytes_addr: 3 }, // 128 Mbit
    DeviceInfo { id: 0x19, ld_bytes_per_sector: 16, ld_num_sectors: 9, num_bytes_addr: 4 }, // 256 Mbit
    DeviceInfo { id: 0x1A, ld_bytes_per_sector: 16, ld_num_sectors: 10, num_bytes_addr: 4 }, // 512 Mbit
];

/// One SPI NOR unit: the hardware port, the negotiated transfer parameters
/// and the bound family descriptor.
pub struct Inst {
    pub(crate) hw: Box<dyn HwSpi + Send>,

    // Current framing for plain register commands; octal families flip
    // these when they switch the device interface mode.
    pub(crate) bus_width: BusWidth,
    pub(crate) flags: XferFlags,
    pub(crate) is_dual_device: bool,

    pub(crate) sector_blocks: [SectorBlock; MAX_SECTOR_BLOCKS],
    pub(crate) num_sector_blocks: u8,
    pub(crate) num_addr_bytes: u8,

    // Data-path configuration filled in during identification.
    pub(crate) cmd_read: u8,
    pub(crate) cmd_read_ex: u8,
    pub(crate) bus_width_read: BusWidth,
    pub(crate) num_bytes_read_dummy: u8,
    pub(crate) flags_read: XferFlags,
    pub(crate) cmd_write: u8,
    pub(crate) bus_width_write: BusWidth,

    pub(crate) allow_2bit: bool,
    pub(crate) allow_4bit: bool,
    pub(crate) allow_octal: bool,
    pub(crate) allow_dtr: bool,
    pub(crate) read_modes_disabled: u8,
    pub(crate) ld_bps_requested: u8,

    pub(crate) poll_reg_write: PollPara,
    pub(crate) poll_page_write: PollPara,
    pub(crate) poll_sector_erase: PollPara,

    device: Option<&'static dyn Device>,
}

impl Inst {
    pub fn new(hw: Box<dyn HwSpi + Send>) -> Self {
        Inst {
            hw,
            bus_width: BusWidth::single(),
            flags: XferFlags::empty(),
            is_dual_device: false,
            sector_blocks: [SectorBlock::default(); MAX_SECTOR_BLOCKS],
            num_sector_blocks: 0,
            num_addr_bytes: 3,
            cmd_read: CMD_FAST_READ,
            cmd_read_ex: 0,
            bus_width_read: BusWidth::single(),
            num_bytes_read_dummy: 1,
            flags_read: XferFlags::empty(),
            cmd_write: 0,
            bus_width_write: BusWidth::single(),
            allow_2bit: false,
            allow_4bit: false,
            allow_octal: false,
            allow_dtr: false,
            read_modes_disabled: 0,
            ld_bps_requested: 0,
            poll_reg_write: PollPara::new(1000, 0, 0),
            poll_page_write: PollPara::new(10_000, 1, 1),
            poll_sector_erase: PollPara::new(500_000, 1, 1),
            device: None,
        }
    }

    // Configuration; applied before the first identification.

    pub fn allow_2bit_mode(&mut self, on: bool) {
        self.allow_2bit = on;
    }

    pub fn allow_4bit_mode(&mut self, on: bool) {
        self.allow_4bit = on;
    }

    pub fn allow_octal_mode(&mut self, on: bool) {
        self.allow_octal = on;
    }

    pub fn allow_dtr_mode(&mut self, on: bool) {
        self.allow_dtr = on;
    }

    /// Requests a specific physical sector size instead of the largest one
    /// the device can erase. `bytes_per_sector` must be a power of two.
    pub fn set_sector_size(&mut self, bytes_per_sector: u32) {
        self.ld_bps_requested = sfdp::ld(bytes_per_sector) as u8;
    }

    pub fn set_poll_paras(&mut self, reg_write: PollPara, page_write: PollPara, sector_erase: PollPara) {
        self.poll_reg_write = reg_write;
        self.poll_page_write = page_write;
        self.poll_sector_erase = sector_erase;
    }

    // Identification.

    /// Walks the descriptor list and binds the first family whose
    /// `identify` accepts the id, then lets it apply geometry, address
    /// width and bus width. The descriptor stays bound for the lifetime of
    /// the instance.
    pub fn identify(&mut self, list: &DeviceList) -> Result {
        let mut id = [0u8; 6];
        for &device in list.devices {
            device.init(self);
            id.fill(0);
            self.read_id(&mut id);
            if device.identify(self, &id).is_ok() {
                log::info!(
                    "NOR device identified, id {:02x} {:02x} {:02x}",
                    id[0],
                    id[1],
                    id[2]
                );
                self.device = Some(device);
                device.read_apply_para(self)?;
                device.set_num_addr_bytes(self)?;
                device.set_bus_width(self)?;
                return Ok(());
            }
        }
        log::warn!("no matching NOR device found");
        Err(Error::NoMedium)
    }

    /// Fallback identification over the fixed id table for devices without
    /// SFDP; fills in geometry and the plain 1-1-1 fast-read mode.
    pub fn read_apply_para_by_id(&mut self) -> Result {
        let mut id = [0u8; 3];
        self.read_id(&mut id);
        let info = DEVICE_INFO_BY_ID
            .iter()
            .find(|info| info.id == id[2])
            .ok_or(Error::NoMedium)?;
        self.set_uniform_sectors(
            1 << info.ld_num_sectors,
            info.ld_bytes_per_sector,
            CMD_SE,
        );
        self.num_addr_bytes = info.num_bytes_addr;
        self.cmd_read = CMD_FAST_READ;
        self.bus_width_read = BusWidth::single();
        self.num_bytes_read_dummy = 1;
        Ok(())
    }

    fn bound_device(&self) -> Result<&'static dyn Device> {
        self.device.ok_or(Error::NoMedium)
    }

    // Geometry.

    pub(crate) fn set_uniform_sectors(&mut self, num_sectors: u32, ld_bps: u8, cmd_erase: u8) {
        self.sector_blocks[0] = SectorBlock {
            num_sectors,
            ld_bytes_per_sector: ld_bps,
            cmd_erase,
        };
        self.num_sector_blocks = 1;
    }

    pub(crate) fn set_sector_blocks(&mut self, blocks: &[SectorBlock]) {
        self.sector_blocks[..blocks.len()].copy_from_slice(blocks);
        self.num_sector_blocks = blocks.len() as u8;
    }

    pub(crate) fn sector_blocks(&self) -> &[SectorBlock] {
        &self.sector_blocks[..self.num_sector_blocks as usize]
    }

    pub fn num_sectors(&self) -> u32 {
        self.sector_blocks().iter().map(|b| b.num_sectors).sum()
    }

    pub fn device_capacity_kbytes(&self) -> u32 {
        self.sector_blocks()
            .iter()
            .map(|b| b.num_sectors << (b.ld_bytes_per_sector - 10))
            .sum()
    }

    /// Byte offset of `sector_index`, adding up the blocks before it.
    pub fn sector_off(&self, mut sector_index: u32) -> u32 {
        let blocks = self.sector_blocks();
        match blocks {
            [] => 0,
            // Uniform layout short-circuit.
            [block] => sector_index << block.ld_bytes_per_sector,
            _ => {
                let mut off = 0;
                for block in blocks {
                    let in_block = sector_index.min(block.num_sectors);
                    off += in_block << block.ld_bytes_per_sector;
                    sector_index -= in_block;
                    if sector_index == 0 {
                        break;
                    }
                }
                off
            }
        }
    }

    /// Size in bytes of `sector_index`, 0 when out of range.
    pub fn sector_size(&self, mut sector_index: u32) -> u32 {
        let blocks = self.sector_blocks();
        match blocks {
            [] => 0,
            [block] => 1 << block.ld_bytes_per_sector,
            _ => {
                for block in blocks {
                    if sector_index < block.num_sectors {
                        return 1 << block.ld_bytes_per_sector;
                    }
                    sector_index -= block.num_sectors;
                }
                0
            }
        }
    }

    /// Erase opcode of the block owning `sector_index`, 0 when out of range.
    pub fn sector_erase_cmd(&self, mut sector_index: u32) -> u8 {
        let blocks = self.sector_blocks();
        match blocks {
            [] => 0,
            [block] => block.cmd_erase,
            _ => {
                for block in blocks {
                    if sector_index < block.num_sectors {
                        return block.cmd_erase;
                    }
                    sector_index -= block.num_sectors;
                }
                0
            }
        }
    }

    // Data path.

    /// Reads `data.len()` bytes starting at byte address `addr`, using the
    /// read opcode, dummy count and flags chosen at identification.
    pub fn read(&mut self, addr: u32, data: &mut [u8]) -> Result {
        log::trace!("NOR read at {addr:#x}, len {:#x}", data.len());
        let cmd = [self.cmd_read, self.cmd_read_ex];
        let num_bytes_cmd = if self.cmd_read_ex != 0 { 2 } else { 1 };

        let mut num_addr_bytes = self.num_addr_bytes as usize;
        let mut flags = self.flags_read;
        if num_addr_bytes == 3 && addr > 0x00FF_FFFF {
            // Dual 16 Mbit dies: one extra address bit, see the write path.
            num_addr_bytes = 4;
            flags |= XferFlags::ADDR_3BYTE;
        }

        let mut para = [0u8; MAX_NUM_BYTES_ADDR + 2 * NUM_CYCLES_DUMMY_DEFAULT as usize];
        let mut n = 0;
        if num_addr_bytes == 4 {
            para[n] = (addr >> 24) as u8;
            n += 1;
        }
        para[n] = (addr >> 16) as u8;
        para[n + 1] = (addr >> 8) as u8;
        para[n + 2] = addr as u8;
        n += 3;
        let num_para = n + self.num_bytes_read_dummy as usize;

        let bus_width = self.bus_width_read;
        self.hw.read_with_cmd_and_addr(
            &cmd[..num_bytes_cmd],
            &para[..num_para],
            num_addr_bytes,
            data,
            bus_width,
            flags,
        )
    }

    /// Programs `data` starting at `addr`, page by page, waiting for each
    /// program operation to finish.
    pub fn write(&mut self, mut addr: u32, mut data: &[u8]) -> Result {
        log::trace!("NOR write at {addr:#x}, len {:#x}", data.len());
        let device = self.bound_device()?;
        let poll = self.poll_page_write;
        while !data.is_empty() {
            let page_off = addr as usize & (PAGE_SIZE - 1);
            let chunk = (PAGE_SIZE - page_off).min(data.len());
            device.write_page(self, addr, &data[..chunk])?;
            device.wait_for_end_of_op(self, &poll)?;
            addr += chunk as u32;
            data = &data[chunk..];
        }
        Ok(())
    }

    /// Erases one physical sector and waits for completion.
    pub fn erase_sector(&mut self, sector_index: u32) -> Result {
        let cmd = self.sector_erase_cmd(sector_index);
        if cmd == 0 {
            return Err(Error::InvalidParam);
        }
        let addr = self.sector_off(sector_index);
        log::trace!("NOR erase sector {sector_index} at {addr:#x}");
        let device = self.bound_device()?;
        let poll = self.poll_sector_erase;
        device.erase_sector(self, cmd, addr)?;
        device.wait_for_end_of_op(self, &poll)
    }

    /// Clears the write locks covering the given range.
    pub fn remove_write_protection(&mut self, addr: u32, num_bytes: u32) -> Result {
        let device = self.bound_device()?;
        device.remove_write_protection(self, addr, num_bytes)
    }

    /// Re-tunes the dummy-cycle count after a serial clock change, on the
    /// families that need it.
    pub fn set_num_dummy_cycles(&mut self, freq_hz: u32) -> Result {
        let device = self.bound_device()?;
        device.set_num_dummy_cycles(self, freq_hz)
    }

    pub fn is_dual_device(&self) -> bool {
        self.is_dual_device
    }

    pub fn num_addr_bytes(&self) -> u8 {
        self.num_addr_bytes
    }

    pub fn read_mode(&self) -> (u8, BusWidth, u8, XferFlags) {
        (
            self.cmd_read,
            self.bus_width_read,
            self.num_bytes_read_dummy,
            self.flags_read,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::HwSpi;

    struct NullHw;

    impl HwSpi for NullHw {
        fn control(&mut self, _cmd: u8, _bus_width: BusWidth) -> Result {
            Ok(())
        }
        fn write(&mut self, _cmd: u8, _data: &[u8], _bus_width: BusWidth) -> Result {
            Ok(())
        }
        fn read(&mut self, _cmd: u8, _data: &mut [u8], _bus_width: BusWidth) -> Result {
            Ok(())
        }
        fn write_with_addr(
            &mut self,
            _cmd: u8,
            _para: &[u8],
            _num_addr_bytes: usize,
            _data: &[u8],
            _bus_width: BusWidth,
        ) -> Result {
            Ok(())
        }
        fn read_with_addr(
            &mut self,
            _cmd: u8,
            _para: &[u8],
            _num_addr_bytes: usize,
            _data: &mut [u8],
            _bus_width: BusWidth,
        ) -> Result {
            Ok(())
        }
    }

    fn inst_with_blocks(blocks: &[SectorBlock]) -> Inst {
        let mut inst = Inst::new(Box::new(NullHw));
        inst.set_sector_blocks(blocks);
        inst
    }

    #[test]
    fn uniform_geometry_short_circuit() {
        let inst = inst_with_blocks(&[SectorBlock {
            num_sectors: 256,
            ld_bytes_per_sector: 16,
            cmd_erase: CMD_SE,
        }]);
        assert_eq!(inst.sector_off(0), 0);
        assert_eq!(inst.sector_off(5), 5 << 16);
        assert_eq!(inst.sector_size(17), 1 << 16);
        assert_eq!(inst.sector_erase_cmd(255), CMD_SE);
        assert_eq!(inst.device_capacity_kbytes(), 256 * 64);
    }

    #[test]
    fn hybrid_geometry_walk() {
        // 8 x 4 KiB parameter sectors followed by 127 x 64 KiB sectors,
        // then 8 x 8 KiB at the top.
        let blocks = [
            SectorBlock { num_sectors: 8, ld_bytes_per_sector: 12, cmd_erase: CMD_P4E },
            SectorBlock { num_sectors: 127, ld_bytes_per_sector: 16, cmd_erase: CMD_SE },
            SectorBlock { num_sectors: 8, ld_bytes_per_sector: 13, cmd_erase: CMD_P4E },
        ];
        let inst = inst_with_blocks(&blocks);
        assert_eq!(inst.sector_off(8), 8 << 12);
        assert_eq!(inst.sector_off(9), (8 << 12) + (1 << 16));
        assert_eq!(inst.sector_size(7), 1 << 12);
        assert_eq!(inst.sector_size(8), 1 << 16);
        assert_eq!(inst.sector_erase_cmd(8 + 127), CMD_P4E);
        assert_eq!(inst.sector_size(8 + 127 + 8), 0);
        assert_eq!(inst.sector_erase_cmd(8 + 127 + 8), 0);

        // The blocks have to add up to the device capacity.
        let capacity_bytes: u64 = blocks
            .iter()
            .map(|b| u64::from(b.num_sectors) << b.ld_bytes_per_sector)
            .sum();
        let last = 8 + 127 + 8 - 1;
        assert_eq!(
            u64::from(inst.sector_off(last)) + u64::from(inst.sector_size(last)),
            capacity_bytes
        );
    }

    #[test]
    fn id_table_fallback() {
        struct IdHw;
        impl HwSpi for IdHw {
            fn control(&mut self, _cmd: u8, _bus_width: BusWidth) -> Result {
                Ok(())
            }
            fn write(&mut self, _cmd: u8, _data: &[u8], _bus_width: BusWidth) -> Result {
                Ok(())
            }
            fn read(&mut self, cmd: u8, data: &mut [u8], _bus_width: BusWidth) -> Result {
                if cmd == CMD_RDID {
                    data.copy_from_slice(&[0x20, 0xBA, 0x19]);
                }
                Ok(())
            }
            fn write_with_addr(
                &mut self,
                _cmd: u8,
                _para: &[u8],
                _num_addr_bytes: usize,
                _data: &[u8],
                _bus_width: BusWidth,
            ) -> Result {
                Ok(())
            }
            fn read_with_addr(
                &mut self,
                _cmd: u8,
                _para: &[u8],
                _num_addr_bytes: usize,
                _data: &mut [u8],
                _bus_width: BusWidth,
            ) -> Result {
                Ok(())
            }
        }
        let mut inst = Inst::new(Box::new(IdHw));
        inst.read_apply_para_by_id().unwrap();
        // 256 Mbit: 512 x 64 KiB sectors, 4-byte addressing.
        assert_eq!(inst.num_sectors(), 512);
        assert_eq!(inst.num_addr_bytes(), 4);
        assert_eq!(inst.sector_size(0), 1 << 16);
    }
}
