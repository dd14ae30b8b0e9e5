//! Micron N25Q / MT25Q series.
//!
//! These parts carry a Flag Status Register whose error bits must be
//! cleared after a failed program or erase, otherwise the device silently
//! ignores the next data operation.

use blocks::{Error, Result};

use crate::{cmds::*, device::Device, hw::PollPara, sfdp, Inst};

fn has_flag_status_register(id: &[u8]) -> bool {
    // 0x20 0x.. 0x16  N25Q032A        0x20 0x.. 0x20  N25Q512A
    // 0x20 0x.. 0x17  N25Q064A        0x20 0x.. 0x21  MT25QL01GB, N25Q00AA
    // 0x20 0x.. 0x18  N25Q128A        0x20 0x.. 0x22  MT25QL02GC
    // 0x20 0x.. 0x19  N25Q256A
    id[0] == MFG_ID_MICRON && (0x16..=0x22).contains(&id[2])
}

fn check_flag_status(status: u8) -> Result {
    let errors = 1 << FLAG_STATUS_PROT_ERROR_BIT
        | 1 << FLAG_STATUS_VPP_ERROR_BIT
        | 1 << FLAG_STATUS_PROG_ERROR_BIT
        | 1 << FLAG_STATUS_ERASE_ERROR_BIT;
    if status & errors != 0 {
        log::warn!("NOR flash reports error {status:#x}");
        return Err(Error::DeviceReported);
    }
    Ok(())
}

pub struct Micron;

impl Device for Micron {
    fn identify(&self, _inst: &mut Inst, id: &[u8]) -> Result {
        if has_flag_status_register(id) {
            Ok(())
        } else {
            Err(Error::NoMedium)
        }
    }

    fn set_bus_width(&self, inst: &mut Inst) -> Result {
        // DQ3 doubles as HOLD#/RESET#; release it before quad transfers.
        if inst.bus_width_read.data == 4 {
            let config = inst.read_enhanced_config_reg();
            if config & (1 << CONFIG_HOLD_BIT) != 0 {
                return inst.write_enhanced_config_reg(config & !(1 << CONFIG_HOLD_BIT));
            }
        }
        Ok(())
    }

    fn set_num_addr_bytes(&self, inst: &mut Inst) -> Result {
        // Some 512 Mbit devices take the mode switch only with WEL set.
        inst.enable_write()?;
        if inst.num_addr_bytes == 4 {
            inst.enter_4byte_addr_mode()?;
            if inst.read_flag_status() & (1 << FLAG_STATUS_ADDR_BIT) == 0 {
                return Err(Error::Protocol);
            }
        } else {
            inst.exit_4byte_addr_mode()?;
            // Reserved on 3-byte-only devices and reserved flags read 0,
            // so the check holds there too.
            if inst.read_flag_status() & (1 << FLAG_STATUS_ADDR_BIT) != 0 {
                return Err(Error::Protocol);
            }
        }
        Ok(())
    }

    fn wait_for_end_of_op(&self, inst: &mut Inst, poll: &PollPara) -> Result {
        let status = wait_ready(inst, poll)?;
        check_flag_status(status).inspect_err(|_| {
            let _ = inst.clear_flag_status_reg();
        })
    }
}

fn wait_ready(inst: &mut Inst, poll: &PollPara) -> Result<u8> {
    let bus_width = inst.bus_width;
    match inst.hw.poll(
        CMD_RFSR,
        FLAG_STATUS_READY_BIT,
        1,
        poll.delay,
        poll.timeout,
        bus_width,
    ) {
        Some(Ok(())) => Ok(inst.read_flag_status()),
        Some(Err(_)) => {
            log::warn!("NOR busy wait timed out");
            Err(Error::TimedOut)
        }
        None => {
            let mut timeout = poll.timeout;
            loop {
                let status = inst.read_flag_status();
                if status & (1 << FLAG_STATUS_READY_BIT) != 0 {
                    return Ok(status);
                }
                timeout = timeout.saturating_sub(1);
                timeout = inst.delay_poll(timeout, poll);
                if timeout == 0 {
                    log::warn!("NOR busy wait timed out");
                    return Err(Error::TimedOut);
                }
            }
        }
    }
}

/// Two identical Micron dies wired in parallel.
pub struct MicronX2;

impl Device for MicronX2 {
    fn identify(&self, inst: &mut Inst, id: &[u8]) -> Result {
        // Interleaved id: bytes 0/1 are the manufacturer from each die,
        // bytes 4/5 the device id from each die.
        if id.len() >= 6
            && id[0] == MFG_ID_MICRON
            && id[1] == MFG_ID_MICRON
            && id[4] == id[5]
            && (0x16..=0x22).contains(&id[4])
        {
            inst.is_dual_device = true;
            Ok(())
        } else {
            Err(Error::NoMedium)
        }
    }

    fn init(&self, inst: &mut Inst) {
        inst.init_device_x2();
    }

    fn set_num_addr_bytes(&self, inst: &mut Inst) -> Result {
        inst.enable_write_x2()?;
        if inst.num_addr_bytes == 4 {
            inst.enter_4byte_addr_mode()?;
            let status = inst.read_flag_status_x2();
            if status[0] & (1 << FLAG_STATUS_ADDR_BIT) == 0
                || status[1] & (1 << FLAG_STATUS_ADDR_BIT) == 0
            {
                return Err(Error::Protocol);
            }
        } else {
            inst.exit_4byte_addr_mode()?;
            let status = inst.read_flag_status_x2();
            if status[0] & (1 << FLAG_STATUS_ADDR_BIT) != 0
                || status[1] & (1 << FLAG_STATUS_ADDR_BIT) != 0
            {
                return Err(Error::Protocol);
            }
        }
        Ok(())
    }

    fn read_apply_para(&self, inst: &mut Inst) -> Result {
        sfdp::read_apply_para_x2(inst)
    }

    fn remove_write_protection(&self, inst: &mut Inst, addr: u32, num_bytes: u32) -> Result {
        inst.remove_write_protection_bp_x2(addr, num_bytes)
    }

    fn erase_sector(&self, inst: &mut Inst, cmd_erase: u8, addr: u32) -> Result {
        inst.erase_sector_raw_x2(cmd_erase, addr)
    }

    fn write_page(&self, inst: &mut Inst, addr: u32, data: &[u8]) -> Result {
        inst.write_page_raw_x2(addr, data)
    }

    fn wait_for_end_of_op(&self, inst: &mut Inst, poll: &PollPara) -> Result {
        let status = wait_ready_x2(inst, poll)?;
        let r = check_flag_status(status[0]).and(check_flag_status(status[1]));
        r.inspect_err(|_| {
            let _ = inst.clear_flag_status_reg();
        })
    }
}

fn wait_ready_x2(inst: &mut Inst, poll: &PollPara) -> Result<[u8; 2]> {
    let bus_width = inst.bus_width;
    match inst.hw.poll(
        CMD_RFSR,
        FLAG_STATUS_READY_BIT,
        1,
        poll.delay,
        poll.timeout,
        bus_width,
    ) {
        Some(Ok(())) => Ok(inst.read_flag_status_x2()),
        Some(Err(_)) => {
            log::warn!("NOR busy wait timed out");
            Err(Error::TimedOut)
        }
        None => {
            let mut timeout = poll.timeout;
            loop {
                let status = inst.read_flag_status_x2();
                if status[0] & (1 << FLAG_STATUS_READY_BIT) != 0
                    && status[1] & (1 << FLAG_STATUS_READY_BIT) != 0
                {
                    return Ok(status);
                }
                timeout = timeout.saturating_sub(1);
                timeout = inst.delay_poll(timeout, poll);
                if timeout == 0 {
                    log::warn!("NOR busy wait timed out");
                    return Err(Error::TimedOut);
                }
            }
        }
    }
}
