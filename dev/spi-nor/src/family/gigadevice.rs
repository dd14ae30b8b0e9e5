//! GigaDevice GD25 series and the compatible BYT BY25Q parts.

use blocks::{Error, Result};

use crate::{cmds::*, device::Device, hw::PollPara, Inst};

pub struct GigaDeviceEnhanced;

impl Device for GigaDeviceEnhanced {
    fn identify(&self, _inst: &mut Inst, id: &[u8]) -> Result {
        // 0xC8 0x.. 0x19  GD25Q256D (program/erase flags in status reg 3)
        if id[0] == MFG_ID_GIGADEVICE && id[2] == 0x19 {
            Ok(())
        } else {
            Err(Error::NoMedium)
        }
    }

    fn set_bus_width(&self, inst: &mut Inst) -> Result {
        set_bus_width(inst)
    }

    fn set_num_addr_bytes(&self, inst: &mut Inst) -> Result {
        // The current address mode is readable as ADS in status register 2.
        if inst.num_addr_bytes == 4 {
            if inst.read_status2_alt() & (1 << STATUS2_ADS_BIT) == 0 {
                inst.enter_4byte_addr_mode()?;
                if inst.read_status2_alt() & (1 << STATUS2_ADS_BIT) == 0 {
                    return Err(Error::Protocol);
                }
            }
        } else if inst.read_status2_alt() & (1 << STATUS2_ADS_BIT) != 0 {
            inst.exit_4byte_addr_mode()?;
            if inst.read_status2_alt() & (1 << STATUS2_ADS_BIT) != 0 {
                return Err(Error::Protocol);
            }
        }
        Ok(())
    }

    fn wait_for_end_of_op(&self, inst: &mut Inst, poll: &PollPara) -> Result {
        inst.wait_busy_cleared(poll)?;
        let status = inst.read_status3();
        if status & (1 << STATUS3_EE_BIT | 1 << STATUS3_PE_BIT) != 0 {
            let _ = inst.clear_status_reg();
            log::warn!("NOR flash reports error {status:#x}");
            return Err(Error::DeviceReported);
        }
        Ok(())
    }
}

pub struct GigaDeviceStandard;

impl Device for GigaDeviceStandard {
    fn identify(&self, _inst: &mut Inst, id: &[u8]) -> Result {
        //   0xC8 0x40 0x16  GD25Q32C
        //   0xC8 0x40 0x17  GD25Q64C
        //   0xC8 0x40 0x18  GD25Q127C
        if id[0] == MFG_ID_GIGADEVICE && id[1] == 0x40 && (0x16..=0x18).contains(&id[2]) {
            Ok(())
        } else {
            Err(Error::NoMedium)
        }
    }

    fn set_bus_width(&self, inst: &mut Inst) -> Result {
        set_bus_width(inst)
    }
}

/// 1.8 V parts: they have two status registers and the plain write-status
/// command rewrites both, unlike the 3.3 V parts where it touches only the
/// first. The second id byte tells them apart; the third matches the 3.3 V
/// device of the same capacity.
pub struct GigaDeviceLowVoltage;

impl Device for GigaDeviceLowVoltage {
    fn identify(&self, _inst: &mut Inst, id: &[u8]) -> Result {
        //   0xC8 0x60 0x15  GD25LQ16C
        //   0xC8 0x60 0x18  GD25LQ128D, GD25LQ128E
        if id[0] == MFG_ID_GIGADEVICE && id[1] == 0x60 && matches!(id[2], 0x15 | 0x18) {
            Ok(())
        } else {
            Err(Error::NoMedium)
        }
    }

    fn set_bus_width(&self, inst: &mut Inst) -> Result {
        let mut reg_data = [inst.read_status(), inst.read_status2_alt()];
        match inst.bus_width_read.data {
            4 => {
                if reg_data[1] & (1 << STATUS2_QE_BIT) == 0 {
                    reg_data[1] |= 1 << STATUS2_QE_BIT;
                    return inst.write_status_reg(&reg_data);
                }
            }
            _ => {
                if reg_data[1] & (1 << STATUS2_QE_BIT) != 0 {
                    reg_data[1] &= !(1 << STATUS2_QE_BIT);
                    return inst.write_status_reg(&reg_data);
                }
            }
        }
        Ok(())
    }
}

pub struct Byt;

impl Device for Byt {
    fn identify(&self, _inst: &mut Inst, id: &[u8]) -> Result {
        //   0x68 0x40 0x16  BY25Q32ES
        //   0x68 0x40 0x17  BY25Q64ES
        //   0x68 0x40 0x18  BY25Q128ES
        if id[0] == MFG_ID_BYT && id[1] == 0x40 && (0x16..=0x18).contains(&id[2]) {
            Ok(())
        } else {
            Err(Error::NoMedium)
        }
    }

    fn set_bus_width(&self, inst: &mut Inst) -> Result {
        set_bus_width(inst)
    }
}

fn set_bus_width(inst: &mut Inst) -> Result {
    // QE is bit 1 of status register 2, written through its own opcode.
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
