//! Sector I/O: single- and multi-block transfers with open- or close-ended
//! framing, burst-type handling for writes, erase/trim, and the bounded
//! retry envelope that degrades to single-sector transfers after the first
//! failure.

use blocks::{BurstType, Error, Result, BYTES_PER_SECTOR};
use sdio_host::{common_cmd, emmc_cmd};

use crate::{
    cmd::{self, Recovery, StateMask},
    hw::{CmdFlags, HwCardMode},
    CardType, Inner, NUM_RETRIES_DATA,
};

impl<H: HwCardMode> Inner<H> {
    fn check_io(&mut self, sector: u32, num_sectors: u32) -> Result<u32> {
        if self.has_error {
            return Err(Error::HasError);
        }
        self.init_medium_internal()?;
        if num_sectors == 0 || num_sectors > self.usable_sectors
            || sector > self.usable_sectors - num_sectors
        {
            return Err(Error::InvalidParam);
        }
        Ok(sector + self.start_sector)
    }

    /// The data address of a sector: sector number on high-capacity cards,
    /// byte offset on the older byte-addressed ones.
    fn data_addr(&self, sector: u32) -> u32 {
        if self.is_high_capacity {
            sector
        } else {
            sector << blocks::BYTES_PER_SECTOR_SHIFT
        }
    }

    fn ensure_transfer_state(&mut self) -> Result {
        let status = self.read_card_status()?;
        if StateMask::TRAN.matches(cmd::status_state(status)) {
            return Ok(());
        }
        if StateMask::STBY.matches(cmd::status_state(status)) {
            self.select_card()?;
            return Ok(());
        }
        self.wait_for_idle()?;
        if StateMask::STBY.matches(cmd::status_state(self.read_card_status()?)) {
            self.select_card()?;
        }
        Ok(())
    }

    pub(crate) fn read_sectors(&mut self, sector: u32, buf: &mut [u8], num_sectors: u32) -> Result {
        let first = self.check_io(sector, num_sectors)?;
        if buf.len() < num_sectors as usize * BYTES_PER_SECTOR {
            return Err(Error::InvalidParam);
        }
        log::trace!("read {num_sectors} sectors at {sector}");
        self.leave_power_save()?;
        self.ensure_transfer_state()?;

        let mut retries = NUM_RETRIES_DATA;
        let mut burst = self.max_read_burst;
        let last_device_sector = self.start_sector + self.usable_sectors;
        let mut current = first;
        let mut remaining = num_sectors;
        let mut off = 0usize;
        while remaining > 0 {
            let mut chunk = remaining.min(burst);
            // Some controllers corrupt a multi-block read ending on the
            // final sector; split the tail off into a single-block read.
            if self.perm.read_single_last_sector
                && chunk > 1
                && current + chunk == last_device_sector
            {
                chunk -= 1;
            }
            let end = off + chunk as usize * BYTES_PER_SECTOR;
            let r = self.read_chunk(current, &mut buf[off..end], chunk);
            match r {
                Ok(()) => {
                    self.stats.read_sector_cnt += chunk;
                    current += chunk;
                    remaining -= chunk;
                    off = end;
                }
                Err(Error::NoDevice) => return Err(Error::NoDevice),
                Err(e) => {
                    self.stats.read_error_cnt += 1;
                    if retries == 0 {
                        return Err(e);
                    }
                    retries -= 1;
                    burst = 1;
                }
            }
        }
        self.enter_power_save()?;
        Ok(())
    }

    fn read_chunk(&mut self, sector: u32, buf: &mut [u8], num_sectors: u32) -> Result {
        let addr = self.data_addr(sector);
        if num_sectors == 1 {
            let c = common_cmd::read_single_block(addr);
            self.exec_r1_read(
                c.cmd,
                c.arg,
                CmdFlags::empty(),
                buf,
                BYTES_PER_SECTOR,
                1,
                0,
                Recovery::StopTransmission,
            )?;
            return Ok(());
        }

        let close_ended = self.card_type == CardType::Mmc || self.is_close_ended_rw_supported;
        if close_ended {
            let c = cmd::set_block_count(num_sectors as u16, false);
            self.exec_r1(c.cmd, c.arg, CmdFlags::empty())?;
        }
        let c = common_cmd::read_multiple_blocks(addr);
        let r = self.exec_r1_read(
            c.cmd,
            c.arg,
            CmdFlags::empty(),
            buf,
            BYTES_PER_SECTOR,
            num_sectors as usize,
            0,
            Recovery::StopTransmission,
        );
        if !close_ended {
            let stop = self.cmd_raw(
                common_cmd::stop_transmission(),
                CmdFlags::STOP_TRANS | CmdFlags::BUSY,
            );
            r?;
            stop?;
        } else {
            r?;
        }
        Ok(())
    }

    pub(crate) fn write_sectors(
        &mut self,
        sector: u32,
        buf: &[u8],
        num_sectors: u32,
        burst_type: BurstType,
    ) -> Result {
        let first = self.check_io(sector, num_sectors)?;
        if self.is_write_protected {
            return Err(Error::WriteProtected);
        }
        let min_len = match burst_type {
            BurstType::Normal => num_sectors as usize * BYTES_PER_SECTOR,
            _ => BYTES_PER_SECTOR,
        };
        if buf.len() < min_len {
            return Err(Error::InvalidParam);
        }
        log::trace!("write {num_sectors} sectors at {sector}, {burst_type:?}");
        self.leave_power_save()?;
        self.ensure_transfer_state()?;

        let mut burst = match burst_type {
            BurstType::Normal => self.max_write_burst,
            BurstType::Repeat => self.max_write_burst_repeat,
            BurstType::Fill => self.max_write_burst_fill.max(self.max_write_burst_repeat),
        };
        if burst == 0 {
            burst = 1;
        }
        let burst_flags = match burst_type {
            BurstType::Normal => CmdFlags::empty(),
            BurstType::Repeat => CmdFlags::WRITE_BURST_REPEAT,
            BurstType::Fill => CmdFlags::WRITE_BURST_FILL,
        };

        let mut retries = NUM_RETRIES_DATA;
        let mut current = first;
        let mut remaining = num_sectors;
        let mut off = 0usize;
        while remaining > 0 {
            // Without buffered writes every chunk waits for the previous
            // program operation and goes out alone.
            let chunk = if self.perm.allow_buffered_write {
                remaining.min(burst)
            } else {
                self.wait_for_state(StateMask::TRAN)?;
                1
            };
            let data = match burst_type {
                BurstType::Normal => &buf[off..off + chunk as usize * BYTES_PER_SECTOR],
                _ => &buf[..BYTES_PER_SECTOR],
            };
            let r = self.write_chunk(current, data, chunk, burst_flags);
            match r {
                Ok(()) => {
                    self.stats.write_sector_cnt += chunk;
                    current += chunk;
                    remaining -= chunk;
                    off += chunk as usize * BYTES_PER_SECTOR;
                }
                Err(Error::NoDevice) => return Err(Error::NoDevice),
                Err(e) => {
                    self.stats.write_error_cnt += 1;
                    if retries == 0 {
                        return Err(e);
                    }
                    retries -= 1;
                    burst = 1;
                }
            }
        }
        self.enter_power_save()?;
        Ok(())
    }

    fn write_chunk(
        &mut self,
        sector: u32,
        data: &[u8],
        num_sectors: u32,
        burst_flags: CmdFlags,
    ) -> Result {
        let addr = self.data_addr(sector);
        if num_sectors == 1 {
            let c = common_cmd::write_single_block(addr);
            self.exec_r1_write(
                c.cmd,
                c.arg,
                burst_flags,
                data,
                BYTES_PER_SECTOR,
                1,
                0,
            )?;
            return Ok(());
        }

        // Prepare step: MMC always announces the count (optionally as a
        // reliable write); an SD card takes CMD23 when it supports it and
        // a pre-erase hint otherwise.
        let close_ended = match self.card_type {
            CardType::Mmc => {
                let reliable = self.is_reliable_write_active;
                let c = cmd::set_block_count(num_sectors as u16, reliable);
                self.exec_r1(c.cmd, c.arg, CmdFlags::empty())?;
                true
            }
            _ if self.is_close_ended_rw_supported => {
                let c = cmd::set_block_count(num_sectors as u16, false);
                self.exec_r1(c.cmd, c.arg, CmdFlags::empty())?;
                true
            }
            _ => {
                let c = cmd::set_wr_blk_erase_count(num_sectors);
                let _ = self.exec_app_r1(c.cmd, c.arg, CmdFlags::empty());
                false
            }
        };
        let c = common_cmd::write_multiple_blocks(addr);
        let r = self.exec_r1_write(
            c.cmd,
            c.arg,
            burst_flags,
            data,
            BYTES_PER_SECTOR,
            num_sectors as usize,
            0,
        );
        if !close_ended {
            let stop = self.cmd_raw(
                common_cmd::stop_transmission(),
                CmdFlags::STOP_TRANS | CmdFlags::BUSY,
            );
            r?;
            stop?;
        } else {
            r?;
        }
        Ok(())
    }

    /// Erase or trim a sector range. Only implemented for MMC; on SD the
    /// request succeeds without touching the card so the filesystem can
    /// keep calling it unconditionally.
    pub(crate) fn erase_sectors(
        &mut self,
        first_sector: u32,
        num_sectors: u32,
        mark_for_erase: bool,
    ) -> Result {
        let first = self.check_io(first_sector, num_sectors)?;
        if self.card_type != CardType::Mmc {
            return Ok(());
        }
        if self.is_write_protected {
            return Err(Error::WriteProtected);
        }
        self.leave_power_save()?;
        self.ensure_transfer_state()?;

        let start = self.data_addr(first);
        let end = self.data_addr(first + num_sectors - 1);
        let c = emmc_cmd::erase_group_start(start);
        self.exec_r1(c.cmd, c.arg, CmdFlags::empty())?;
        let c = emmc_cmd::erase_group_end(end);
        self.exec_r1(c.cmd, c.arg, CmdFlags::empty())?;
        let c = cmd::erase(mark_for_erase);
        self.exec_r1(c.cmd, c.arg, CmdFlags::BUSY)?;
        self.wait_for_ready()?;
        self.enter_power_save()?;
        Ok(())
    }

    /// Force-erases a password-locked SD card: the lock structure goes out
    /// as a 36-byte data block with only the ERASE flag set.
    pub(crate) fn unlock_forced(&mut self) -> Result {
        if self.has_error {
            return Err(Error::HasError);
        }
        self.init_medium_internal()?;
        if self.card_type != CardType::Sd {
            return Err(Error::NotSupported);
        }
        self.ensure_transfer_state()?;

        const LOCK_DATA_LEN: usize = 36;
        let c = common_cmd::set_block_length(LOCK_DATA_LEN as u32);
        self.exec_r1(c.cmd, c.arg, CmdFlags::empty())?;
        let mut lock_data = [0u8; LOCK_DATA_LEN];
        lock_data[0] = cmd::LOCK_UNLOCK_ERASE;
        let c = cmd::lock_unlock();
        self.exec_r1_write(c.cmd, c.arg, CmdFlags::empty(), &lock_data, LOCK_DATA_LEN, 1, 0)?;
        let c = common_cmd::set_block_length(BYTES_PER_SECTOR as u32);
        self.exec_r1(c.cmd, c.arg, CmdFlags::empty())?;
        self.wait_for_ready()?;
        Ok(())
    }

    /// SD cards report password locking in the card status; a locked card
    /// mounts read-only until unlocked.
    pub(crate) fn is_locked(&mut self) -> Result<bool> {
        let status = self.read_card_status()?;
        Ok(status & (1 << 25) != 0)
    }

    pub(crate) fn cid_bytes(&self) -> [u8; 16] {
        crate::ident::u128_from_words(self.cid_raw).to_be_bytes()
    }
}
