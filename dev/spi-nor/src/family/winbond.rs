//! Winbond W25Q series, with an optional DTR configuration for the parts
//! that read correctly on both clock edges.

use blocks::{Error, Result};

use crate::{
    cmds::*,
    device::Device,
    hw::{BusWidth, XferFlags},
    sfdp, Inst,
};

pub struct Winbond;

impl Device for Winbond {
    fn identify(&self, _inst: &mut Inst, id: &[u8]) -> Result {
        // Devices with SFDP support:
        //   0xEF 0x.. 0x15  W25Q16DV, W25Q16JV
        //   0xEF 0x.. 0x16  W25Q32JV
        //   0xEF 0x.. 0x17  W25Q64FW, W25Q64JV
        //   0xEF 0x.. 0x18  W25Q128FW
        //   0xEF 0x.. 0x19  W25Q256JV
        //   0xEF 0x.. 0x20  W25Q512JV
        if id[0] == MFG_ID_WINBOND && (0x15..=0x20).contains(&id[2]) {
            Ok(())
        } else {
            Err(Error::NoMedium)
        }
    }

    fn set_bus_width(&self, inst: &mut Inst) -> Result {
        set_bus_width(inst)
    }

    fn set_num_addr_bytes(&self, inst: &mut Inst) -> Result {
        if inst.num_addr_bytes == 4 {
            inst.enter_4byte_addr_mode()
        } else {
            inst.exit_4byte_addr_mode()
        }
    }
}

pub(crate) fn set_bus_width(inst: &mut Inst) -> Result {
    // QE is bit 1 of status register 2.
    let reg_data = inst.read_status2_alt();
    match inst.bus_width_read.data {
        4 => {
            if reg_data & (1 << STATUS2_QE_BIT) == 0 {
                return inst.write_status_reg2(&[reg_data | 1 << STATUS2_QE_BIT]);
            }
        }
        _ => {
            if reg_data & (1 << STATUS2_QE_BIT) != 0 {
                return inst.write_status_reg2(&[reg_data & !(1 << STATUS2_QE_BIT)]);
            }
        }
    }
    Ok(())
}

pub struct WinbondDtr;

impl Device for WinbondDtr {
    fn identify(&self, inst: &mut Inst, id: &[u8]) -> Result {
        // Devices verified to support SFDP and DTR reads:
        //   0xEF 0x70 0x17  W25Q64JV
        //   0xEF 0x70 0x18  W25Q128JV
        //   0xEF 0x80 0x19  W25Q256JW
        //   0xEF 0x70 0x20  W25Q512JV
        if !inst.allow_dtr || id[0] != MFG_ID_WINBOND {
            return Err(Error::NoMedium);
        }
        let matched = match id[1] {
            0x70 => matches!(id[2], 0x17 | 0x18 | 0x20),
            0x80 => id[2] == 0x19,
            _ => false,
        };
        if matched {
            Ok(())
        } else {
            Err(Error::NoMedium)
        }
    }

    fn set_bus_width(&self, inst: &mut Inst) -> Result {
        set_bus_width(inst)
    }

    fn set_num_addr_bytes(&self, inst: &mut Inst) -> Result {
        if inst.num_addr_bytes == 4 {
            inst.enter_4byte_addr_mode()
        } else {
            inst.exit_4byte_addr_mode()
        }
    }

    fn read_apply_para(&self, inst: &mut Inst) -> Result {
        sfdp::read_apply_para(inst)?;
        // SFDP says nothing about the DTR read opcodes; override the read
        // mode with the data-sheet values. Address and data travel on both
        // edges, the opcode on one.
        let mut flags = XferFlags::DTR_ADDR | XferFlags::DTR_DATA;
        if inst.allow_4bit {
            // The byte after the address carries the bits that control the
            // read-command bypass mode.
            flags |= XferFlags::MODE_8BIT;
            inst.cmd_read = CMD_QUAD_READ_DTR;
            inst.num_bytes_read_dummy = 8;
            inst.bus_width_read = BusWidth::new(1, 4, 4);
        } else if inst.allow_2bit {
            flags |= XferFlags::MODE_8BIT;
            inst.cmd_read = CMD_DUAL_READ_DTR;
            inst.num_bytes_read_dummy = 3;
            inst.bus_width_read = BusWidth::new(1, 2, 2);
        } else {
            // 6 dummy cycles, which is one byte and a half; the extra
            // nibble is requested via the flags.
            flags |= XferFlags::DUMMY_4BIT;
            inst.cmd_read = CMD_READ_DTR;
            inst.num_bytes_read_dummy = 1;
            inst.bus_width_read = BusWidth::single();
        }
        inst.flags_read = flags;
        Ok(())
    }
}
