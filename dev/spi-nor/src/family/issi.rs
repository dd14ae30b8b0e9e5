//! ISSI IS25 series: parts with the Extended Read Register ("enhanced"),
//! parts with only the plain status register, and one legacy part without
//! SFDP whose geometry is hard-coded.

use blocks::{Error, Result};

use crate::{
    cmds::*,
    device::Device,
    hw::{BusWidth, PollPara},
    Inst,
};

pub struct IssiEnhanced;

impl Device for IssiEnhanced {
    fn identify(&self, inst: &mut Inst, id: &[u8]) -> Result {
        // Devices with SFDP and the Extended Read Register:
        //   0x9D 0x.. 0x18  IS25LP128F, IS25WP128F
        //   0x9D 0x.. 0x19  IS25LP256D, IS25WP256D
        //   0x9D 0x.. 0x1A  IS25LP512M, IS25WP512M
        //   0x9D 0x.. 0x1B  IS25LP01G, IS25WP01G
        if id[0] != MFG_ID_ISSI {
            return Err(Error::NoMedium);
        }
        match id[2] {
            0x19 | 0x1A | 0x1B => Ok(()),
            // IS25LP128 answers with the same id as IS25LP128F but has no
            // Extended Read Register. Per ISSI support, an IS25LP128F
            // returns 0x10 in the 5 low bits of that register.
            0x18 if inst.read_extended_read_reg() & 0x1F == 0x10 => Ok(()),
            _ => Err(Error::NoMedium),
        }
    }

    fn set_bus_width(&self, inst: &mut Inst) -> Result {
        set_bus_width(inst)
    }

    fn set_num_addr_bytes(&self, inst: &mut Inst) -> Result {
        set_num_addr_bytes(inst)
    }

    fn wait_for_end_of_op(&self, inst: &mut Inst, poll: &PollPara) -> Result {
        inst.wait_busy_cleared(poll)?;
        let status = inst.read_extended_read_reg();
        let errors =
            1 << EXT_READ_PROT_E_BIT | 1 << EXT_READ_P_ERR_BIT | 1 << EXT_READ_E_ERR_BIT;
        if status & errors != 0 {
            let _ = inst.clear_extended_read_reg();
            log::warn!("NOR flash reports error {status:#x}");
            return Err(Error::DeviceReported);
        }
        Ok(())
    }
}

pub struct IssiStandard;

impl Device for IssiStandard {
    fn identify(&self, inst: &mut Inst, id: &[u8]) -> Result {
        // Devices with SFDP and the standard status register:
        //   0x9D 0x.. 0x14  IS25LQ080B
        //   0x9D 0x.. 0x15  IS25LQ016B
        //   0x9D 0x.. 0x16  IS25LQ032B
        //   0x9D 0x.. 0x17  IS25LP064A
        //   0x9D 0x.. 0x18  IS25LP128
        if id[0] == MFG_ID_ISSI && (0x14..=0x18).contains(&id[2]) {
            if id[2] == 0x17 {
                // IS25LP064A encodes the wrong dummy-cycle count for 1-2-2
                // in SFDP; 1-1-2 works as specified.
                inst.read_modes_disabled = 1 << READ_MODE_122_BIT;
            }
            Ok(())
        } else {
            Err(Error::NoMedium)
        }
    }

    fn set_bus_width(&self, inst: &mut Inst) -> Result {
        set_bus_width(inst)
    }
}

pub struct IssiLegacy;

impl Device for IssiLegacy {
    fn identify(&self, inst: &mut Inst, id: &[u8]) -> Result {
        // IS25LQ080 has no SFDP; it also prefixes its id with 0x7F:
        //   0x7F 0x9D 0x44  IS25LQ080
        let mfg_id = if id[0] == 0x7F { id[1] } else { id[0] };
        if mfg_id != MFG_ID_ISSI || id[2] != 0x44 {
            return Err(Error::NoMedium);
        }
        if inst.allow_4bit {
            inst.cmd_read = CMD_QUAD_READ;
            inst.num_bytes_read_dummy = 3;
            inst.bus_width_read = BusWidth::new(1, 4, 4);
        } else if inst.allow_2bit {
            inst.cmd_read = CMD_DUAL_READ;
            inst.num_bytes_read_dummy = 1;
            inst.bus_width_read = BusWidth::new(1, 2, 2);
        } else {
            inst.cmd_read = CMD_FAST_READ;
            inst.num_bytes_read_dummy = 1;
            inst.bus_width_read = BusWidth::single();
        }
        inst.set_uniform_sectors(16, 16, CMD_SE);
        inst.num_addr_bytes = 3;
        Ok(())
    }

    fn set_bus_width(&self, inst: &mut Inst) -> Result {
        set_bus_width(inst)
    }

    fn read_apply_para(&self, _inst: &mut Inst) -> Result {
        Ok(()) // geometry comes from `identify`
    }
}

fn set_bus_width(inst: &mut Inst) -> Result {
    // QE is bit 6 of the status register, non-volatile.
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

fn set_num_addr_bytes(inst: &mut Inst) -> Result {
    // Same bank-register scheme as Spansion.
    let data = inst.read_bank_reg();
    if inst.num_addr_bytes == 4 {
        if data & (1 << BAR_EXTADD_BIT) == 0 {
            return inst.write_bank_reg(data | 1 << BAR_EXTADD_BIT);
        }
    } else if data & (1 << BAR_EXTADD_BIT) != 0 {
        return inst.write_bank_reg(data & !(1 << BAR_EXTADD_BIT));
    }
    Ok(())
}
