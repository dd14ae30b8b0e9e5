//! Macronix MX25/MX66 series, including the MX25LM/MX25UM octal parts.
//!
//! The octal parts switch their whole interface between SPI, octal STR and
//! octal DTR through Configuration Register 2. Once in an OPI mode every
//! command is framed as `[cmd, !cmd]` (Command Extension Inverted), the
//! address is always 4 bytes and register reads need dummy cycles. A device
//! left in OPI mode by a previous run no longer answers plain SPI commands,
//! so `init` probes the id and forces the mode back if needed.

use blocks::{Error, Result};

use crate::{
    cmds::*,
    device::Device,
    hw::{BusWidth, PollPara, XferFlags},
    Inst,
};

/// Register encoding of the dummy-cycle count, index 0 to 7.
static DUMMY_CYCLES: [u8; 8] = [20, 18, 16, 14, 12, 10, 8, 6];

fn has_security_register(id: &[u8]) -> bool {
    // Devices whose security register reports program/erase failures:
    //   0xC2 0x.. 0x15  MX25V1635        0xC2 0x.. 0x19  MX25L256
    //   0xC2 0x.. 0x16  MX25L3233        0xC2 0x.. 0x1A  MX25L512
    //   0xC2 0x.. 0x17  MX25R64          0xC2 0x.. 0x39  MX25U256
    //   0xC2 0x.. 0x18  MX25L128         0xC2 0x.. 0x3C  MX66L2G45G
    id[0] == MFG_ID_MACRONIX
        && matches!(id[2], 0x15..=0x1A | 0x39 | 0x3C)
}

fn is_octal_part(id: &[u8]) -> bool {
    // 0xC2 0x.. 0x3A  MX25LM51245G (no SFDP support)
    id[0] == MFG_ID_MACRONIX && id[2] == 0x3A
}

fn check_security_register(status: u8) -> Result {
    if status & (1 << SCUR_E_FAIL_BIT | 1 << SCUR_P_FAIL_BIT) != 0 {
        log::warn!("NOR flash reports error {status:#x}");
        return Err(Error::DeviceReported);
    }
    Ok(())
}

pub struct Macronix;

impl Device for Macronix {
    fn identify(&self, _inst: &mut Inst, id: &[u8]) -> Result {
        if has_security_register(id) {
            Ok(())
        } else {
            Err(Error::NoMedium)
        }
    }

    fn set_bus_width(&self, inst: &mut Inst) -> Result {
        // QE is bit 6 of the status register.
        let data = inst.read_status();
        match inst.bus_width_read.data {
            4 => {
                if data & (1 << STATUS_QE_BIT) == 0 {
                    return inst.write_status_reg(&[data | 1 << STATUS_QE_BIT]);
                }
            }
            _ => {
                if data & (1 << STATUS_QE_BIT) != 0 {
                    return inst.write_status_reg(&[data & !(1 << STATUS_QE_BIT)]);
                }
            }
        }
        Ok(())
    }

    fn set_num_addr_bytes(&self, inst: &mut Inst) -> Result {
        if inst.num_addr_bytes == 4 {
            inst.enter_4byte_addr_mode()?;
            if inst.read_config_reg_alt() & (1 << CONFIG_4BYTE_BIT) == 0 {
                return Err(Error::Protocol);
            }
        } else {
            inst.exit_4byte_addr_mode()?;
            // Reserved (and therefore 0) on 3-byte-only devices.
            if inst.read_config_reg_alt() & (1 << CONFIG_4BYTE_BIT) != 0 {
                return Err(Error::Protocol);
            }
        }
        Ok(())
    }

    fn wait_for_end_of_op(&self, inst: &mut Inst, poll: &PollPara) -> Result {
        inst.wait_busy_cleared(poll)?;
        check_security_register(inst.read_security_reg())
    }
}

/// Octal part operated over the plain single-bit SPI interface.
pub struct MacronixOctal;

impl Device for MacronixOctal {
    fn identify(&self, inst: &mut Inst, id: &[u8]) -> Result {
        if !is_octal_part(id) || inst.allow_octal {
            return Err(Error::NoMedium);
        }
        // No SFDP on this part; commands and geometry are hard-coded.
        inst.cmd_read = CMD_FAST_READ4B;
        inst.cmd_read_ex = 0;
        inst.num_bytes_read_dummy = 1;
        inst.bus_width_read = BusWidth::single();
        inst.cmd_write = CMD_PP4B;
        inst.bus_width_write = BusWidth::single();
        inst.set_uniform_sectors(1024, 16, CMD_SE4B);
        inst.num_addr_bytes = 4;
        Ok(())
    }

    fn read_apply_para(&self, _inst: &mut Inst) -> Result {
        Ok(()) // configured during `identify`
    }

    fn wait_for_end_of_op(&self, inst: &mut Inst, poll: &PollPara) -> Result {
        inst.wait_busy_cleared(poll)?;
        check_security_register(inst.read_security_reg())
    }
}

fn identify_octal_opi(inst: &mut Inst, id: &[u8], want_dtr: bool) -> Result {
    if !is_octal_part(id) || !inst.allow_octal || inst.allow_dtr != want_dtr {
        return Err(Error::NoMedium);
    }
    let read_cmd = if want_dtr { CMD_8DTRD } else { CMD_8READ };
    inst.cmd_read = read_cmd;
    inst.cmd_read_ex = !read_cmd;
    inst.num_bytes_read_dummy = if want_dtr {
        // Two bytes cross the bus per dummy cycle.
        NUM_CYCLES_DUMMY_DEFAULT << 1
    } else {
        NUM_CYCLES_DUMMY_DEFAULT
    };
    inst.bus_width_read = BusWidth::octal();
    if want_dtr {
        inst.flags_read = XferFlags::DTR_DATA
            | XferFlags::DTR_ADDR
            | XferFlags::DTR_CMD
            | XferFlags::DTR_D1_D0;
    }
    inst.cmd_write = CMD_PP4B;
    inst.bus_width_write = BusWidth::octal();
    inst.set_uniform_sectors(1024, 16, CMD_SE4B);
    inst.num_addr_bytes = 4;
    Ok(())
}

/// Probes the id over plain SPI; a wrong answer means the device is still
/// in OPI mode, so a CEI-framed CR2 write forces it back to SPI.
fn recover_from_opi(inst: &mut Inst, dtr: bool) {
    if !inst.allow_octal {
        return;
    }
    let mut id = [0u8; 3];
    inst.read_id(&mut id);
    if !is_octal_part(&id) {
        inst.bus_width = BusWidth::octal();
        if dtr {
            inst.flags = XferFlags::DTR_ADDR | XferFlags::DTR_CMD | XferFlags::DTR_D1_D0;
        }
        let _ = inst.write_config_reg2_cei(CONFIG2_ADDR_MODE, CONFIG2_MODE_SPI);
        inst.bus_width = BusWidth::single();
        inst.flags = XferFlags::empty();
    }
}

/// Programs the dummy-cycle count that matches the serial clock. The data
/// sheet ties the minimum count to both frequency and package type; the
/// package is not discoverable at run time, so the value that satisfies
/// every package is used.
fn set_num_cycles_dummy(inst: &mut Inst, freq_hz: u32) -> Result {
    let num_cycles = if freq_hz <= 66_000_000 {
        6
    } else {
        NUM_CYCLES_DUMMY_DEFAULT
    };
    let encoded = DUMMY_CYCLES
        .iter()
        .position(|&c| c == num_cycles)
        .unwrap_or(0) as u8;

    let config = inst.read_config_reg2(CONFIG2_ADDR_DUMMY);
    if (config >> CONFIG2_DUMMY_BIT) & CONFIG2_DUMMY_MASK != encoded {
        let new = (config & !(CONFIG2_DUMMY_MASK << CONFIG2_DUMMY_BIT))
            | encoded << CONFIG2_DUMMY_BIT;
        inst.write_config_reg2(CONFIG2_ADDR_DUMMY, new)?;
        let readback = inst.read_config_reg2(CONFIG2_ADDR_DUMMY);
        if (readback >> CONFIG2_DUMMY_BIT) & CONFIG2_DUMMY_MASK != encoded {
            return Err(Error::Protocol);
        }
    }
    inst.num_bytes_read_dummy = if inst.allow_dtr {
        num_cycles << 1
    } else {
        num_cycles
    };
    Ok(())
}

fn erase_sector_cei(inst: &mut Inst, cmd_erase: u8, addr: u32) -> Result {
    let cmd = [cmd_erase, !cmd_erase];
    let para = addr.to_be_bytes();
    inst.enable_write_cei()?;
    let (bus_width, mut flags) = (inst.bus_width, inst.flags);
    // The sector address goes out as data here; match its DTR setting to
    // the address phase.
    if flags.contains(XferFlags::DTR_ADDR) && !flags.contains(XferFlags::DTR_DATA) {
        flags |= XferFlags::DTR_DATA;
    }
    inst.hw.write_with_cmd(&cmd, &para, bus_width, flags)
}

fn write_page_cei(inst: &mut Inst, addr: u32, data: &[u8]) -> Result {
    let (cmd, bus_width) = if inst.cmd_write != 0 {
        (inst.cmd_write, inst.bus_width_write)
    } else {
        (CMD_PP, inst.bus_width)
    };
    // Writes run at the same transfer rate as reads.
    let flags = inst.flags_read;
    inst.enable_write_cei()?;
    inst.write_page_data_cei(cmd, addr, data, bus_width, flags)
}

fn wait_for_end_of_op_cei(inst: &mut Inst, poll: &PollPara) -> Result {
    inst.wait_busy_cleared_cei(poll)?;
    check_security_register(inst.read_security_reg_cei()?)
}

/// Octal part in STR OPI mode.
pub struct MacronixOctalStr;

impl Device for MacronixOctalStr {
    fn identify(&self, inst: &mut Inst, id: &[u8]) -> Result {
        identify_octal_opi(inst, id, false)
    }

    fn init(&self, inst: &mut Inst) {
        recover_from_opi(inst, false);
        inst.init_device();
    }

    fn set_bus_width(&self, inst: &mut Inst) -> Result {
        let config = inst.read_config_reg2(CONFIG2_ADDR_MODE);
        let mode = config & (CONFIG2_MODE_MASK << CONFIG2_MODE_BIT);
        if inst.bus_width_read.data == 8 {
            if mode != CONFIG2_MODE_SOPI {
                let new = (config & !(CONFIG2_MODE_MASK << CONFIG2_MODE_BIT))
                    | CONFIG2_MODE_SOPI << CONFIG2_MODE_BIT;
                inst.write_config_reg2(CONFIG2_ADDR_MODE, new)?;
                let saved = inst.bus_width;
                inst.bus_width = BusWidth::octal();
                let entered = matches!(
                    inst.read_config_reg2_cei(CONFIG2_ADDR_MODE),
                    Ok(c) if c & (CONFIG2_MODE_MASK << CONFIG2_MODE_BIT) == CONFIG2_MODE_SOPI
                );
                if !entered {
                    inst.bus_width = saved;
                    return Err(Error::Protocol);
                }
            }
        } else if mode != CONFIG2_MODE_SPI {
            let new = config & !(CONFIG2_MODE_MASK << CONFIG2_MODE_BIT);
            inst.write_config_reg2_cei(CONFIG2_ADDR_MODE, new)?;
            let saved = inst.bus_width;
            inst.bus_width = BusWidth::single();
            let readback = inst.read_config_reg2(CONFIG2_ADDR_MODE);
            if readback & (CONFIG2_MODE_MASK << CONFIG2_MODE_BIT) != CONFIG2_MODE_SPI {
                inst.bus_width = saved;
                return Err(Error::Protocol);
            }
        }
        Ok(())
    }

    fn read_apply_para(&self, _inst: &mut Inst) -> Result {
        Ok(())
    }

    fn erase_sector(&self, inst: &mut Inst, cmd_erase: u8, addr: u32) -> Result {
        erase_sector_cei(inst, cmd_erase, addr)
    }

    fn write_page(&self, inst: &mut Inst, addr: u32, data: &[u8]) -> Result {
        write_page_cei(inst, addr, data)
    }

    fn wait_for_end_of_op(&self, inst: &mut Inst, poll: &PollPara) -> Result {
        wait_for_end_of_op_cei(inst, poll)
    }

    fn set_num_dummy_cycles(&self, inst: &mut Inst, freq_hz: u32) -> Result {
        set_num_cycles_dummy(inst, freq_hz)
    }
}

/// Octal part in DTR OPI mode: command, address and data all move on both
/// clock edges.
pub struct MacronixOctalDtr;

impl Device for MacronixOctalDtr {
    fn identify(&self, inst: &mut Inst, id: &[u8]) -> Result {
        identify_octal_opi(inst, id, true)
    }

    fn init(&self, inst: &mut Inst) {
        recover_from_opi(inst, true);
        inst.init_device();
    }

    fn set_bus_width(&self, inst: &mut Inst) -> Result {
        let config = inst.read_config_reg2(CONFIG2_ADDR_MODE);
        let mode = config & (CONFIG2_MODE_MASK << CONFIG2_MODE_BIT);
        if inst.bus_width_read.data == 8 {
            if mode != CONFIG2_MODE_DOPI {
                let new = (config & !(CONFIG2_MODE_MASK << CONFIG2_MODE_BIT))
                    | CONFIG2_MODE_DOPI << CONFIG2_MODE_BIT;
                inst.write_config_reg2(CONFIG2_ADDR_MODE, new)?;
                let saved_width = inst.bus_width;
                let saved_flags = inst.flags;
                inst.bus_width = BusWidth::octal();
                inst.flags = XferFlags::DTR_ADDR | XferFlags::DTR_CMD | XferFlags::DTR_D1_D0;
                let entered = matches!(
                    inst.read_config_reg2_cei(CONFIG2_ADDR_MODE),
                    Ok(c) if c & (CONFIG2_MODE_MASK << CONFIG2_MODE_BIT) == CONFIG2_MODE_DOPI
                );
                if !entered {
                    inst.bus_width = saved_width;
                    inst.flags = saved_flags;
                    return Err(Error::Protocol);
                }
            }
        } else if mode != CONFIG2_MODE_SPI {
            let new = config & !(CONFIG2_MODE_MASK << CONFIG2_MODE_BIT);
            inst.write_config_reg2_cei(CONFIG2_ADDR_MODE, new)?;
            let saved_width = inst.bus_width;
            let saved_flags = inst.flags;
            inst.bus_width = BusWidth::single();
            inst.flags = XferFlags::empty();
            let readback = inst.read_config_reg2(CONFIG2_ADDR_MODE);
            if readback & (CONFIG2_MODE_MASK << CONFIG2_MODE_BIT) != CONFIG2_MODE_SPI {
                inst.bus_width = saved_width;
                inst.flags = saved_flags;
                return Err(Error::Protocol);
            }
        }
        Ok(())
    }

    fn read_apply_para(&self, _inst: &mut Inst) -> Result {
        Ok(())
    }

    fn erase_sector(&self, inst: &mut Inst, cmd_erase: u8, addr: u32) -> Result {
        erase_sector_cei(inst, cmd_erase, addr)
    }

    fn write_page(&self, inst: &mut Inst, addr: u32, data: &[u8]) -> Result {
        write_page_cei(inst, addr, data)
    }

    fn wait_for_end_of_op(&self, inst: &mut Inst, poll: &PollPara) -> Result {
        wait_for_end_of_op_cei(inst, poll)
    }

    fn set_num_dummy_cycles(&self, inst: &mut Inst, freq_hz: u32) -> Result {
        set_num_cycles_dummy(inst, freq_hz)
    }
}
