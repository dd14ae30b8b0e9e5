//! Device descriptor trait and the vendor-independent protocol primitives.
//!
//! A family descriptor bundles the handful of operations that differ between
//! manufacturers. The default bodies implement the plain JEDEC behaviour, so
//! a family only overrides what its data sheet does differently. `_x2`
//! variants drive two identical dies wired in parallel: status bytes arrive
//! pairwise and both dies must agree before an operation counts as done.

use blocks::{Error, Result};

use crate::{
    cmds::*,
    hw::{BusWidth, PollPara, XferFlags},
    sfdp, Inst,
};

/// Vendor family descriptor.
///
/// Descriptors are unit structs held in static, ordered [`DeviceList`]s; the
/// first `identify` that succeeds binds the descriptor to the instance for
/// its whole lifetime.
pub trait Device: Sync {
    /// Checks the RDID response. A descriptor may also plant instance quirks
    /// here (disabled read modes, hard-coded geometry).
    fn identify(&self, inst: &mut Inst, id: &[u8]) -> Result;

    /// Prepares the device for operation right after power-up.
    fn init(&self, inst: &mut Inst) {
        inst.init_device();
    }

    /// Flips whatever vendor bit enables the data width of the selected
    /// read mode.
    fn set_bus_width(&self, _inst: &mut Inst) -> Result {
        Ok(())
    }

    /// Puts the device into 3- or 4-byte address mode per
    /// `inst.num_addr_bytes`, verified where the vendor defined a flag.
    fn set_num_addr_bytes(&self, _inst: &mut Inst) -> Result {
        Ok(())
    }

    /// Fills in geometry and read mode, typically from SFDP.
    fn read_apply_para(&self, inst: &mut Inst) -> Result {
        sfdp::read_apply_para(inst)
    }

    /// Makes the given address range writable.
    fn remove_write_protection(&self, inst: &mut Inst, addr: u32, num_bytes: u32) -> Result {
        inst.remove_write_protection_bp(addr, num_bytes)
    }

    fn erase_sector(&self, inst: &mut Inst, cmd_erase: u8, addr: u32) -> Result {
        inst.erase_sector_raw(cmd_erase, addr)
    }

    fn write_page(&self, inst: &mut Inst, addr: u32, data: &[u8]) -> Result {
        inst.write_page_raw(addr, data)
    }

    /// Busy wait plus the family's error-flag check.
    fn wait_for_end_of_op(&self, inst: &mut Inst, poll: &PollPara) -> Result {
        inst.wait_busy_cleared(poll)
    }

    /// Only Macronix octal parts reprogram their dummy-cycle count from the
    /// serial clock frequency.
    fn set_num_dummy_cycles(&self, _inst: &mut Inst, _freq_hz: u32) -> Result {
        Ok(())
    }
}

/// Ordered list of descriptors consulted at bring-up.
pub struct DeviceList {
    pub devices: &'static [&'static dyn Device],
}

/// A run of adjacent sectors sharing size and erase opcode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SectorBlock {
    pub num_sectors: u32,
    pub ld_bytes_per_sector: u8,
    pub cmd_erase: u8,
}

fn bit(pos: u8) -> u8 {
    1 << pos
}

impl Inst {
    pub(crate) fn read_id(&mut self, data: &mut [u8]) {
        let bus_width = self.bus_width;
        let _ = self.hw.read(CMD_RDID, data, bus_width);
    }

    pub(crate) fn read_status(&mut self) -> u8 {
        let mut data = [0u8; 1];
        let bus_width = self.bus_width;
        let _ = self.hw.read(CMD_RDSR, &mut data, bus_width);
        data[0]
    }

    /// Both dies answer; one status byte each.
    pub(crate) fn read_status_x2(&mut self) -> [u8; 2] {
        let mut data = [0u8; 2];
        let bus_width = self.bus_width;
        let _ = self.hw.read(CMD_RDSR, &mut data, bus_width);
        data
    }

    /// Command Extension Inverted framing used by Macronix octal parts:
    /// 2-byte opcode, 4 address bytes and 4 dummy bytes (8 in DTR mode).
    pub(crate) fn read_reg_cei(&mut self, cmd: u8, addr: u32) -> Result<u8> {
        let cmd2 = [cmd, !cmd];
        let mut para = [0u8; NUM_BYTES_ADDR_OPI + NUM_BYTES_DUMMY_OPI * 2];
        para[0] = (addr >> 24) as u8;
        para[1] = (addr >> 16) as u8;
        para[2] = (addr >> 8) as u8;
        para[3] = addr as u8;
        let mut num_bytes = NUM_BYTES_ADDR_OPI + NUM_BYTES_DUMMY_OPI;
        if self.flags.contains(XferFlags::DTR_ADDR) {
            num_bytes += NUM_BYTES_DUMMY_OPI;
        }
        let mut data = [0u8; 1];
        let (bus_width, flags) = (self.bus_width, self.flags);
        self.hw.read_with_cmd_and_addr(
            &cmd2,
            &para[..num_bytes],
            NUM_BYTES_ADDR_OPI,
            &mut data,
            bus_width,
            flags,
        )?;
        Ok(data[0])
    }

    pub(crate) fn read_status_cei(&mut self) -> Result<u8> {
        self.read_reg_cei(CMD_RDSR, 0)
    }

    pub(crate) fn read_status2(&mut self) -> u8 {
        self.read_reg_plain(CMD_RDSR2)
    }

    pub(crate) fn read_status2_alt(&mut self) -> u8 {
        self.read_reg_plain(CMD_RDSR2_ALT)
    }

    pub(crate) fn read_status3(&mut self) -> u8 {
        self.read_reg_plain(CMD_RDSR3)
    }

    pub(crate) fn read_flag_status(&mut self) -> u8 {
        self.read_reg_plain(CMD_RFSR)
    }

    pub(crate) fn read_flag_status_x2(&mut self) -> [u8; 2] {
        let mut data = [0u8; 2];
        let bus_width = self.bus_width;
        let _ = self.hw.read(CMD_RFSR, &mut data, bus_width);
        data
    }

    pub(crate) fn read_extended_read_reg(&mut self) -> u8 {
        self.read_reg_plain(CMD_RDERP)
    }

    pub(crate) fn clear_extended_read_reg(&mut self) -> Result {
        let bus_width = self.bus_width;
        self.hw.control(CMD_CLERP, bus_width)
    }

    pub(crate) fn read_security_reg(&mut self) -> u8 {
        self.read_reg_plain(CMD_RDSCUR)
    }

    pub(crate) fn read_security_reg_cei(&mut self) -> Result<u8> {
        self.read_reg_cei(CMD_RDSCUR, 0)
    }

    /// Adesto keeps its extra status registers behind an indirect read:
    /// one address byte selects the register, one dummy byte follows.
    pub(crate) fn read_status_indirect(&mut self, addr: u8) -> u8 {
        let para = [addr, 0xFF];
        let mut data = [0u8; 1];
        let bus_width = self.bus_width;
        let _ = self
            .hw
            .read_with_addr(CMD_RDSRI, &para, 1, &mut data, bus_width);
        data[0]
    }

    pub(crate) fn read_config_reg(&mut self) -> u8 {
        self.read_reg_plain(CMD_RDCR)
    }

    pub(crate) fn read_config_reg_alt(&mut self) -> u8 {
        self.read_reg_plain(CMD_RDCR_ALT)
    }

    pub(crate) fn read_enhanced_config_reg(&mut self) -> u8 {
        self.read_reg_plain(CMD_RECR)
    }

    pub(crate) fn write_enhanced_config_reg(&mut self, config: u8) -> Result {
        self.enable_write()?;
        let bus_width = self.bus_width;
        self.hw.write(CMD_WECR, &[config], bus_width)
    }

    pub(crate) fn read_bank_reg(&mut self) -> u8 {
        self.read_reg_plain(CMD_BRRD)
    }

    pub(crate) fn write_bank_reg(&mut self, data: u8) -> Result {
        let bus_width = self.bus_width;
        self.hw.write(CMD_BRWR, &[data], bus_width)
    }

    fn read_reg_plain(&mut self, cmd: u8) -> u8 {
        let mut data = [0u8; 1];
        let bus_width = self.bus_width;
        let _ = self.hw.read(cmd, &mut data, bus_width);
        data[0]
    }

    /// Sets WEL and verifies it took; data-modifying commands are ignored
    /// while the latch is clear.
    pub(crate) fn enable_write(&mut self) -> Result {
        let mut timeout = self.poll_reg_write.timeout;
        let bus_width = self.bus_width;
        loop {
            if self.hw.control(CMD_WREN, bus_width).is_ok() {
                let status = self.read_status();
                if status & bit(STATUS_WEL_BIT) != 0 {
                    return Ok(());
                }
            }
            timeout = timeout.saturating_sub(1);
            if timeout == 0 {
                return Err(Error::TimedOut);
            }
        }
    }

    pub(crate) fn enable_write_x2(&mut self) -> Result {
        let mut timeout = self.poll_reg_write.timeout;
        let bus_width = self.bus_width;
        loop {
            if self.hw.control(CMD_WREN, bus_width).is_ok() {
                let status = self.read_status_x2();
                if status[0] & bit(STATUS_WEL_BIT) != 0 && status[1] & bit(STATUS_WEL_BIT) != 0 {
                    return Ok(());
                }
            }
            timeout = timeout.saturating_sub(1);
            if timeout == 0 {
                return Err(Error::TimedOut);
            }
        }
    }

    pub(crate) fn enable_write_cei(&mut self) -> Result {
        let cmd = [CMD_WREN, !CMD_WREN];
        let mut timeout = self.poll_reg_write.timeout;
        loop {
            let (bus_width, flags) = (self.bus_width, self.flags);
            self.hw.control_with_cmd(&cmd, bus_width, flags)?;
            let status = self.read_status_cei()?;
            if status & bit(STATUS_WEL_BIT) != 0 {
                return Ok(());
            }
            timeout = timeout.saturating_sub(1);
            if timeout == 0 {
                return Err(Error::TimedOut);
            }
        }
    }

    pub(crate) fn disable_write(&mut self) -> Result {
        let mut timeout = self.poll_reg_write.timeout;
        let bus_width = self.bus_width;
        loop {
            if self.hw.control(CMD_WRDIS, bus_width).is_ok() {
                let status = self.read_status();
                if status & bit(STATUS_WEL_BIT) == 0 {
                    return Ok(());
                }
            }
            timeout = timeout.saturating_sub(1);
            if timeout == 0 {
                return Err(Error::TimedOut);
            }
        }
    }

    pub(crate) fn disable_write_x2(&mut self) -> Result {
        let mut timeout = self.poll_reg_write.timeout;
        let bus_width = self.bus_width;
        loop {
            if self.hw.control(CMD_WRDIS, bus_width).is_ok() {
                let status = self.read_status_x2();
                if status[0] & bit(STATUS_WEL_BIT) == 0 && status[1] & bit(STATUS_WEL_BIT) == 0 {
                    return Ok(());
                }
            }
            timeout = timeout.saturating_sub(1);
            if timeout == 0 {
                return Err(Error::TimedOut);
            }
        }
    }

    /// A WEL left over from an aborted write makes some devices (Micron
    /// N25Q032A for one) ignore read commands.
    pub(crate) fn disable_write_if_required(&mut self) -> Result {
        if self.read_status() & bit(STATUS_WEL_BIT) != 0 {
            return self.disable_write();
        }
        Ok(())
    }

    pub(crate) fn disable_write_if_required_x2(&mut self) -> Result {
        let status = self.read_status_x2();
        if status[0] & bit(STATUS_WEL_BIT) != 0 || status[1] & bit(STATUS_WEL_BIT) != 0 {
            return self.disable_write_x2();
        }
        Ok(())
    }

    pub(crate) fn write_status_reg(&mut self, data: &[u8]) -> Result {
        let poll = self.poll_reg_write;
        self.enable_write()?;
        let bus_width = self.bus_width;
        self.hw.write(CMD_WRSR, data, bus_width)?;
        self.wait_busy_cleared(&poll)
    }

    pub(crate) fn write_status_reg_x2(&mut self, data: &[u8]) -> Result {
        let poll = self.poll_reg_write;
        self.enable_write_x2()?;
        let bus_width = self.bus_width;
        self.hw.write(CMD_WRSR, data, bus_width)?;
        self.wait_busy_cleared_x2(&poll)
    }

    pub(crate) fn write_status_reg2(&mut self, data: &[u8]) -> Result {
        let poll = self.poll_reg_write;
        self.enable_write()?;
        let bus_width = self.bus_width;
        self.hw.write(CMD_WRSR2, data, bus_width)?;
        self.wait_busy_cleared(&poll)
    }

    pub(crate) fn clear_status_reg(&mut self) -> Result {
        let bus_width = self.bus_width;
        self.hw.control(CMD_CLSR, bus_width)
    }

    pub(crate) fn clear_flag_status_reg(&mut self) -> Result {
        let bus_width = self.bus_width;
        self.hw.control(CMD_CFSR, bus_width)
    }

    pub(crate) fn enable_write_volatile(&mut self) -> Result {
        let bus_width = self.bus_width;
        self.hw.control(CMD_WRENV, bus_width)
    }

    // Macronix configuration register 2: plain and CEI access.

    pub(crate) fn read_config_reg2(&mut self, addr: u32) -> u8 {
        let para = addr.to_be_bytes();
        let mut data = [0u8; 1];
        let bus_width = self.bus_width;
        let _ = self
            .hw
            .read_with_addr(CMD_RDCR2, &para, para.len(), &mut data, bus_width);
        data[0]
    }

    pub(crate) fn read_config_reg2_cei(&mut self, addr: u32) -> Result<u8> {
        self.read_reg_cei(CMD_RDCR2, addr)
    }

    pub(crate) fn write_config_reg2(&mut self, addr: u32, value: u8) -> Result {
        let para = addr.to_be_bytes();
        self.enable_write()?;
        let bus_width = self.bus_width;
        self.hw
            .write_with_addr(CMD_WRCR2, &para, para.len(), &[value], bus_width)
    }

    pub(crate) fn write_config_reg2_cei(&mut self, addr: u32, value: u8) -> Result {
        let cmd = [CMD_WRCR2, !CMD_WRCR2];
        let para = addr.to_be_bytes();
        // In DTR mode the data phase moves a multiple of two bytes.
        let data = [value, value];
        let num_bytes = if self.flags.contains(XferFlags::DTR_DATA) {
            2
        } else {
            1
        };
        self.enable_write_cei()?;
        let (bus_width, flags) = (self.bus_width, self.flags);
        self.hw.write_with_cmd_and_addr(
            &cmd,
            &para,
            para.len(),
            &data[..num_bytes],
            bus_width,
            flags,
        )
    }

    // Block protection register (Microchip).

    pub(crate) fn read_block_protection_reg(&mut self, data: &mut [u8]) {
        let bus_width = self.bus_width;
        let _ = self.hw.read(CMD_RBPR, data, bus_width);
    }

    pub(crate) fn write_block_protection_reg(&mut self, data: &[u8]) -> Result {
        let poll = self.poll_reg_write;
        self.enable_write()?;
        let bus_width = self.bus_width;
        self.hw.write(CMD_WBPR, data, bus_width)?;
        self.wait_busy_cleared(&poll)
    }

    // SFDP access.

    pub(crate) fn read_sfdp(&mut self, addr: u32, data: &mut [u8]) {
        let para = [
            (addr >> 16) as u8,
            (addr >> 8) as u8,
            addr as u8,
            0xFF, // the data is valid only after 8 dummy clock cycles
        ];
        let bus_width = self.bus_width;
        let _ = self
            .hw
            .read_with_addr(CMD_READ_SFDP, &para, NUM_BYTES_ADDR_SFDP, data, bus_width);
    }

    /// Dual-die SFDP read: the bus interleaves one byte per die, so `data`
    /// holds `2 * n` raw bytes which are verified pairwise and condensed
    /// in place to the single-die form in `data[..n]`.
    pub(crate) fn read_sfdp_x2(&mut self, addr: u32, data: &mut [u8]) -> Result {
        debug_assert!(data.len() % 2 == 0);
        let para = [(addr >> 16) as u8, (addr >> 8) as u8, addr as u8, 0xFF];
        let bus_width = self.bus_width;
        let _ = self
            .hw
            .read_with_addr(CMD_READ_SFDP, &para, NUM_BYTES_ADDR_SFDP, data, bus_width);
        let mut mismatch = false;
        for i in 0..data.len() / 2 {
            if data[2 * i] != data[2 * i + 1] {
                mismatch = true;
            }
            data[i] = data[2 * i];
        }
        if mismatch {
            log::warn!("NOR dies report different SFDP data");
            return Err(Error::Protocol);
        }
        Ok(())
    }

    // Address mode.

    pub(crate) fn enter_4byte_addr_mode(&mut self) -> Result {
        let bus_width = self.bus_width;
        self.hw.control(CMD_EN4B, bus_width)
    }

    pub(crate) fn exit_4byte_addr_mode(&mut self) -> Result {
        let bus_width = self.bus_width;
        self.hw.control(CMD_EX4B, bus_width)
    }

    // Power-up preparation.

    /// Wakes the device from deep power-down. Older parts want the bare
    /// opcode, newer ones the opcode followed by dummy bytes; both forms
    /// are issued.
    pub(crate) fn release_from_power_down(&mut self) -> Result {
        let bus_width = self.bus_width;
        let mut r = self.hw.control(CMD_RES, bus_width);
        let _ = self.hw.delay_ms(1);
        let dummy = [0u8; 4];
        let result = self.hw.write(CMD_RES, &dummy, bus_width);
        if result.is_err() {
            r = result;
        }
        r
    }

    pub(crate) fn release_from_power_down_x2(&mut self) -> Result {
        let bus_width = self.bus_width;
        let mut r = self.hw.control(CMD_RES, bus_width);
        let _ = self.hw.delay_ms(1);
        let dummy = [0u8; 4 * 2];
        let result = self.hw.write(CMD_RES, &dummy, bus_width);
        if result.is_err() {
            r = result;
        }
        r
    }

    pub(crate) fn init_device(&mut self) {
        let _ = self.release_from_power_down();
        let _ = self.disable_write_if_required();
    }

    pub(crate) fn init_device_x2(&mut self) {
        let _ = self.release_from_power_down_x2();
        let _ = self.disable_write_if_required_x2();
    }

    // Write protection.

    pub(crate) fn remove_write_protection_bp(&mut self, _addr: u32, _num_bytes: u32) -> Result {
        let status = self.read_status();
        if status & (STATUS_BP_MASK << STATUS_BP_BIT) != 0 {
            return self.write_status_reg(&[0]);
        }
        Ok(())
    }

    pub(crate) fn remove_write_protection_bp_x2(&mut self, _addr: u32, _num_bytes: u32) -> Result {
        let status = self.read_status_x2();
        if status[0] & (STATUS_BP_MASK << STATUS_BP_BIT) != 0
            || status[1] & (STATUS_BP_MASK << STATUS_BP_BIT) != 0
        {
            return self.write_status_reg_x2(&[0, 0]);
        }
        Ok(())
    }

    // Page program.

    fn encode_addr(addr: u32, num_addr_bytes: usize, out: &mut [u8; MAX_NUM_BYTES_ADDR]) -> usize {
        let mut n = 0;
        if num_addr_bytes == 4 {
            out[n] = (addr >> 24) as u8;
            n += 1;
        }
        out[n] = (addr >> 16) as u8;
        out[n + 1] = (addr >> 8) as u8;
        out[n + 2] = addr as u8;
        n + 3
    }

    pub(crate) fn write_page_data(
        &mut self,
        cmd_write: u8,
        addr: u32,
        data: &[u8],
        bus_width: BusWidth,
    ) -> Result {
        let mut para = [0u8; MAX_NUM_BYTES_ADDR];
        let n = Self::encode_addr(addr, self.num_addr_bytes as usize, &mut para);
        self.hw
            .write_with_addr(cmd_write, &para[..n], n, data, bus_width)
    }

    /// The combined capacity of two 16 Mbit dies needs 25 address bits, one
    /// more than their native 3-byte address. The upper half is sent with a
    /// 4-byte address and `ADDR_3BYTE` tells the hardware layer to halve it
    /// per die as if it were the original request.
    pub(crate) fn write_page_data_x2(
        &mut self,
        cmd_write: u8,
        addr: u32,
        data: &[u8],
        bus_width: BusWidth,
    ) -> Result {
        let mut num_addr_bytes = self.num_addr_bytes as usize;
        let mut flags = XferFlags::empty();
        if num_addr_bytes == 3 && addr > 0x00FF_FFFF {
            num_addr_bytes = 4;
            flags = XferFlags::ADDR_3BYTE;
        }
        let mut para = [0u8; MAX_NUM_BYTES_ADDR];
        let n = {
            let mut i = 0;
            if num_addr_bytes == 4 {
                para[i] = (addr >> 24) as u8;
                i += 1;
            }
            para[i] = (addr >> 16) as u8;
            para[i + 1] = (addr >> 8) as u8;
            para[i + 2] = addr as u8;
            i + 3
        };
        self.hw
            .write_with_cmd_and_addr(&[cmd_write], &para[..n], n, data, bus_width, flags)
    }

    pub(crate) fn write_page_data_cei(
        &mut self,
        cmd_write: u8,
        addr: u32,
        data: &[u8],
        bus_width: BusWidth,
        flags: XferFlags,
    ) -> Result {
        let cmd = [cmd_write, !cmd_write];
        let para = addr.to_be_bytes();
        self.hw
            .write_with_cmd_and_addr(&cmd, &para, para.len(), data, bus_width, flags)
    }

    pub(crate) fn write_page_raw(&mut self, addr: u32, data: &[u8]) -> Result {
        let (cmd, bus_width) = if self.cmd_write != 0 {
            (self.cmd_write, self.bus_width_write)
        } else {
            (CMD_PP, self.bus_width)
        };
        self.enable_write()?;
        self.write_page_data(cmd, addr, data, bus_width)
    }

    pub(crate) fn write_page_raw_x2(&mut self, addr: u32, data: &[u8]) -> Result {
        let (cmd, bus_width) = if self.cmd_write != 0 {
            (self.cmd_write, self.bus_width_write)
        } else {
            (CMD_PP, self.bus_width)
        };
        self.enable_write_x2()?;
        self.write_page_data_x2(cmd, addr, data, bus_width)
    }

    // Sector erase.

    pub(crate) fn erase_sector_raw(&mut self, cmd_erase: u8, addr: u32) -> Result {
        let mut para = [0u8; MAX_NUM_BYTES_ADDR];
        let n = Self::encode_addr(addr, self.num_addr_bytes as usize, &mut para);
        let bus_width = self.bus_width;
        self.enable_write()?;
        // The address travels in the data phase here; plain controllers
        // do not distinguish.
        self.hw.write(cmd_erase, &para[..n], bus_width)
    }

    pub(crate) fn erase_sector_raw_x2(&mut self, cmd_erase: u8, addr: u32) -> Result {
        let mut num_addr_bytes = self.num_addr_bytes as usize;
        let mut flags = XferFlags::empty();
        if num_addr_bytes == 3 && addr > 0x00FF_FFFF {
            num_addr_bytes = 4;
            flags = XferFlags::ADDR_3BYTE;
        }
        let mut para = [0u8; MAX_NUM_BYTES_ADDR];
        let n = {
            let mut i = 0;
            if num_addr_bytes == 4 {
                para[i] = (addr >> 24) as u8;
                i += 1;
            }
            para[i] = (addr >> 16) as u8;
            para[i + 1] = (addr >> 8) as u8;
            para[i + 2] = addr as u8;
            i + 3
        };
        let bus_width = self.bus_width;
        self.enable_write_x2()?;
        // Sent as a real address so the hardware layer can halve it per die.
        self.hw
            .write_with_cmd_and_addr(&[cmd_erase], &para[..n], n, &[], bus_width, flags)
    }

    // Busy polling.

    pub(crate) fn delay_poll(&mut self, timeout: u32, poll: &PollPara) -> u32 {
        if poll.delay != 0 && self.hw.delay_ms(poll.delay_ms as u32).is_ok() {
            return timeout.saturating_sub(poll.delay);
        }
        timeout
    }

    /// Waits for the BUSY bit to clear, preferring the controller's own
    /// polling engine over the software loop.
    pub(crate) fn wait_busy_cleared(&mut self, poll: &PollPara) -> Result {
        let bus_width = self.bus_width;
        match self.hw.poll(
            CMD_RDSR,
            STATUS_BUSY_BIT,
            0,
            poll.delay,
            poll.timeout,
            bus_width,
        ) {
            Some(Ok(())) => Ok(()),
            Some(Err(_)) => {
                log::warn!("NOR busy wait timed out");
                Err(Error::TimedOut)
            }
            None => {
                let mut timeout = poll.timeout;
                loop {
                    if self.read_status() & bit(STATUS_BUSY_BIT) == 0 {
                        return Ok(());
                    }
                    timeout = timeout.saturating_sub(1);
                    timeout = self.delay_poll(timeout, poll);
                    if timeout == 0 {
                        log::warn!("NOR busy wait timed out");
                        return Err(Error::TimedOut);
                    }
                }
            }
        }
    }

    pub(crate) fn wait_busy_cleared_x2(&mut self, poll: &PollPara) -> Result {
        let bus_width = self.bus_width;
        match self.hw.poll(
            CMD_RDSR,
            STATUS_BUSY_BIT,
            0,
            poll.delay,
            poll.timeout,
            bus_width,
        ) {
            Some(Ok(())) => Ok(()),
            Some(Err(_)) => Err(Error::TimedOut),
            None => {
                let mut timeout = poll.timeout;
                loop {
                    let status = self.read_status_x2();
                    if status[0] & bit(STATUS_BUSY_BIT) == 0
                        && status[1] & bit(STATUS_BUSY_BIT) == 0
                    {
                        return Ok(());
                    }
                    timeout = timeout.saturating_sub(1);
                    timeout = self.delay_poll(timeout, poll);
                    if timeout == 0 {
                        log::warn!("NOR busy wait timed out");
                        return Err(Error::TimedOut);
                    }
                }
            }
        }
    }

    /// CEI-framed busy wait for Macronix parts running in OPI mode.
    pub(crate) fn wait_busy_cleared_cei(&mut self, poll: &PollPara) -> Result {
        let cmd = [CMD_RDSR, !CMD_RDSR];
        let para = [0u8; NUM_BYTES_ADDR_OPI + NUM_BYTES_DUMMY_OPI * 2];
        let mut num_bytes = NUM_BYTES_ADDR_OPI + NUM_BYTES_DUMMY_OPI;
        if self.flags.contains(XferFlags::DTR_ADDR) {
            num_bytes += NUM_BYTES_DUMMY_OPI;
        }
        let (bus_width, flags) = (self.bus_width, self.flags);
        match self.hw.poll_with_cmd(
            &cmd,
            &para[..num_bytes],
            NUM_BYTES_ADDR_OPI,
            STATUS_BUSY_BIT,
            0,
            poll.delay,
            poll.timeout,
            bus_width,
            flags,
        ) {
            Some(Ok(())) => Ok(()),
            Some(Err(_)) => Err(Error::TimedOut),
            None => {
                let mut timeout = poll.timeout;
                loop {
                    let status = self.read_status_cei()?;
                    if status & bit(STATUS_BUSY_BIT) == 0 {
                        return Ok(());
                    }
                    timeout = timeout.saturating_sub(1);
                    timeout = self.delay_poll(timeout, poll);
                    if timeout == 0 {
                        log::warn!("NOR busy wait timed out");
                        return Err(Error::TimedOut);
                    }
                }
            }
        }
    }
}
