//! Adesto AT25 series.

use blocks::{Error, Result};

use crate::{cmds::*, device::Device, hw::PollPara, Inst};

pub struct AdestoStandard;

impl Device for AdestoStandard {
    fn identify(&self, _inst: &mut Inst, id: &[u8]) -> Result {
        //   0x1F 0x89 0x01  AT25SF128A
        //   0x1F 0x42 0x16  AT25SL321
        if id[0] == MFG_ID_ADESTO && matches!(id[2], 0x01 | 0x16) {
            Ok(())
        } else {
            Err(Error::NoMedium)
        }
    }

    fn set_bus_width(&self, inst: &mut Inst) -> Result {
        set_bus_width(inst)
    }
}

pub struct AdestoEnhanced;

impl Device for AdestoEnhanced {
    fn identify(&self, inst: &mut Inst, id: &[u8]) -> Result {
        // The second id byte identifies these; the third carries no
        // capacity information.
        //   0x1F 0x44 0x0C  AT25XE041D
        //   0x1F 0x45 0x0C  AT25XE081D
        //   0x1F 0x46 0x0C  AT25XE161D
        if id[0] == MFG_ID_ADESTO && matches!(id[1], 0x44 | 0x45 | 0x46) {
            // SFDP advertises the wrong dummy count for 1-4-4; 1-1-4 is
            // used instead.
            inst.read_modes_disabled = 1 << READ_MODE_144_BIT;
            Ok(())
        } else {
            Err(Error::NoMedium)
        }
    }

    fn set_bus_width(&self, inst: &mut Inst) -> Result {
        set_bus_width(inst)
    }

    fn wait_for_end_of_op(&self, inst: &mut Inst, poll: &PollPara) -> Result {
        inst.wait_busy_cleared(poll)?;
        let status = inst.read_status_indirect(REG_ADDR_ERROR);
        if status & (1 << STATUS4_EE_BIT | 1 << STATUS4_PE_BIT) != 0 {
            log::warn!("NOR flash reports error {status:#x}");
            return Err(Error::DeviceReported);
        }
        Ok(())
    }
}

fn set_bus_width(inst: &mut Inst) -> Result {
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
