//! Spansion S25FL/S25FS series and the newer Cypress S25FL...L parts.

use blocks::{Error, Result};

use crate::{
    cmds::*,
    device::{Device, SectorBlock},
    hw::{BusWidth, PollPara},
    sfdp, Inst, MAX_SECTOR_BLOCKS,
};

pub struct Spansion;

impl Device for Spansion {
    fn identify(&self, _inst: &mut Inst, id: &[u8]) -> Result {
        // Devices with error reporting in the status register:
        //   0x01 0x.. 0x15  S25FL032P
        //   0x01 0x.. 0x16  S25FL064P, S25FL132K
        //   0x01 0x.. 0x17  S25FL164K
        //   0x01 0x.. 0x18  S25FL129P, S25FS128S, S25FL127S, S70FL256P
        //   0x01 0x.. 0x19  S25FS256S, S25FL256S
        //   0x01 0x.. 0x20  S25FS512S, S25FL512S, S70FL01GS
        // The S25FL256L answers with the same device id as the S25FL256S but
        // is not compatible; the second id byte separates them (0x02 for the
        // S variant, 0x60 for the L variant). Same for S25FL164K/S25FL064L.
        let (device_type, device_id) = (id[1], id[2]);
        let matched = id[0] == MFG_ID_SPANSION
            && (0x15..=0x20).contains(&device_id)
            && (!(0x17..=0x19).contains(&device_id) || device_type == 0x02);
        if matched {
            Ok(())
        } else {
            Err(Error::NoMedium)
        }
    }

    fn set_bus_width(&self, inst: &mut Inst) -> Result {
        // The write command always writes the status register first and the
        // configuration register second, so both have to be read up front.
        let mut reg_data = [inst.read_status(), inst.read_config_reg()];
        match inst.bus_width_read.data {
            4 => {
                if reg_data[1] & (1 << CONFIG_QUAD_BIT) == 0 {
                    reg_data[1] |= 1 << CONFIG_QUAD_BIT;
                    return inst.write_status_reg(&reg_data);
                }
            }
            _ => {
                if reg_data[1] & (1 << CONFIG_QUAD_BIT) != 0 {
                    reg_data[1] &= !(1 << CONFIG_QUAD_BIT);
                    return inst.write_status_reg(&reg_data);
                }
            }
        }
        Ok(())
    }

    fn set_num_addr_bytes(&self, inst: &mut Inst) -> Result {
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

    fn read_apply_para(&self, inst: &mut Inst) -> Result {
        read_apply_para(inst)
    }

    fn wait_for_end_of_op(&self, inst: &mut Inst, poll: &PollPara) -> Result {
        inst.wait_busy_cleared(poll)?;
        let status = inst.read_status();
        if status & (1 << STATUS_E_ERR_BIT | 1 << STATUS_P_ERR_BIT) != 0 {
            let _ = inst.clear_status_reg();
            log::warn!("NOR flash reports error {status:#x}");
            return Err(Error::DeviceReported);
        }
        Ok(())
    }
}

fn cfi_is_supported(inst: &mut Inst) -> bool {
    let mut id = [0u8; 19];
    inst.read_id(&mut id);
    id[0x10] == b'Q' && id[0x11] == b'R' && id[0x12] == b'Y'
}

/// Older parts without SFDP publish their sector layout via CFI, packed
/// into the tail of the extended READ ID response.
fn cfi_read_apply_device_geometry(inst: &mut Inst) -> Result {
    let mut id = [0u8; 0x2D + MAX_SECTOR_BLOCKS * 4];
    inst.read_id(&mut id);

    let num_sector_blocks = id[0x2C] as usize;
    if num_sector_blocks > MAX_SECTOR_BLOCKS {
        return Err(Error::Protocol);
    }
    let mut blocks = [SectorBlock::default(); MAX_SECTOR_BLOCKS];
    let mut off = 0x2D;
    for block in blocks.iter_mut().take(num_sector_blocks) {
        // Sector count is stored minus one, the size as a factor of 256 B.
        let num_sectors = (u32::from(id[off]) | u32::from(id[off + 1]) << 8) + 1;
        let num_chunks = u32::from(id[off + 2]) | u32::from(id[off + 3]) << 8;
        off += 4;
        let ld_bytes_per_sector = (8 + sfdp::ld(num_chunks)) as u8;
        block.num_sectors = num_sectors;
        block.ld_bytes_per_sector = ld_bytes_per_sector;
        block.cmd_erase = if ld_bytes_per_sector == 12 {
            CMD_P4E
        } else {
            CMD_SE
        };
    }
    inst.set_sector_blocks(&blocks[..num_sector_blocks]);
    Ok(())
}

fn read_apply_para(inst: &mut Inst) -> Result {
    if !sfdp::is_supported(inst) {
        if !cfi_is_supported(inst) {
            log::warn!("NOR flash supports neither SFDP nor CFI");
            return Err(Error::NotSupported);
        }
        cfi_read_apply_device_geometry(inst)?;
        // The 64/256 KB erase command also wipes 4 KB parameter sectors in
        // its way, so a hybrid layout can be reported as uniform.
        if inst.num_sector_blocks == 2 {
            let mut num_sectors_4kb = 0;
            let mut num_sectors = 0;
            let mut ld_bps = 0;
            for block in inst.sector_blocks().iter() {
                if block.ld_bytes_per_sector == 12 {
                    num_sectors_4kb = block.num_sectors;
                } else {
                    num_sectors = block.num_sectors;
                    ld_bps = block.ld_bytes_per_sector;
                }
            }
            if num_sectors_4kb != 0 {
                num_sectors += num_sectors_4kb >> (ld_bps - 12);
                inst.set_uniform_sectors(num_sectors, ld_bps, CMD_SE);
            }
        }
        let num_kbytes = inst.device_capacity_kbytes();
        inst.num_addr_bytes = if num_kbytes > 16 * 1024 { 4 } else { 3 };
        inst.cmd_read = CMD_FAST_READ;
        inst.bus_width_read = BusWidth::single();
        inst.num_bytes_read_dummy = 1;
        return Ok(());
    }

    let (bpt, _) = sfdp::bpt_addr(inst)?;
    read_apply_device_geometry(inst, bpt)?;
    sfdp::read_apply_read_mode(inst, bpt)?;

    // In SPI mode the dummy-cycle count of FAST_READ follows the LC bits of
    // the configuration register; LC == 0b11 means none at all.
    if inst.cmd_read == CMD_FAST_READ {
        let config = inst.read_config_reg();
        if config & (CONFIG_LATENCY_MASK << CONFIG_LATENCY_BIT)
            == CONFIG_LATENCY_NONE << CONFIG_LATENCY_BIT
        {
            inst.num_bytes_read_dummy = 0;
        }
    }
    Ok(())
}

/// Like the plain SFDP geometry pass, with the S25FL127S correction: the
/// D8h_O flag (bit 7 of status register 2) selects whether opcode 0xD8
/// erases 64 KB or 256 KB, and SFDP reports the other size when the flag
/// disagrees with the factory default. Applies to 128 Mbit parts and to any
/// device advertising both 64 KB and 256 KB blocks.
fn read_apply_device_geometry(inst: &mut Inst, bpt: u32) -> Result {
    let ld_num_bits = sfdp::read_ld_num_bits(inst, bpt);

    let mut cmd_erase = CMD_SE;
    let mut ld_bps = 0u8;
    let mut supports_64kb = false;
    let mut supports_256kb = false;
    let mut addr = bpt + 0x1C;
    for _ in 0..4 {
        let mut data = [0u8; 2];
        inst.read_sfdp(addr, &mut data);
        let ld_to_check = data[0];
        if ld_to_check > ld_bps {
            ld_bps = ld_to_check;
            cmd_erase = data[1];
        }
        if ld_to_check == 16 {
            supports_64kb = true;
        }
        if ld_to_check == 18 {
            supports_256kb = true;
        }
        addr += 2;
    }
    if ld_bps == 0 {
        return Err(Error::Protocol);
    }
    let mut num_sectors = 1u32 << (u32::from(ld_num_bits) - 3 - u32::from(ld_bps));

    if ld_num_bits == 27 || (supports_64kb && supports_256kb) {
        let status = inst.read_status2();
        if status & (1 << STATUS2_D8H_O_BIT) != 0 {
            if ld_bps == 16 {
                ld_bps = 18;
                num_sectors >>= 2;
            }
        } else if ld_bps == 18 {
            ld_bps = 16;
            num_sectors <<= 2;
        }
    }

    inst.set_uniform_sectors(num_sectors, ld_bps, cmd_erase);
    inst.num_addr_bytes = if ld_num_bits > 27 { 4 } else { 3 };
    Ok(())
}

pub struct Cypress;

impl Device for Cypress {
    fn identify(&self, _inst: &mut Inst, id: &[u8]) -> Result {
        //   0x01 0x60 0x17  S25FL064L
        //   0x01 0x60 0x18  S25FL128L
        //   0x01 0x60 0x19  S25FL256L
        if id[0] == MFG_ID_CYPRESS && id[1] == 0x60 && (0x17..=0x19).contains(&id[2]) {
            Ok(())
        } else {
            Err(Error::NoMedium)
        }
    }

    fn set_bus_width(&self, inst: &mut Inst) -> Result {
        // QUAD sits in CR1V; volatile registers take writes only after the
        // WRENV opcode, and WRR rewrites SR1V before CR1V.
        let mut reg_data = [inst.read_status(), inst.read_config_reg()];
        match inst.bus_width_read.data {
            4 => {
                if reg_data[1] & (1 << CONFIG_QUAD_BIT) == 0 {
                    reg_data[1] |= 1 << CONFIG_QUAD_BIT;
                    inst.enable_write_volatile()?;
                    return inst.write_status_reg(&reg_data);
                }
            }
            _ => {
                if reg_data[1] & (1 << CONFIG_QUAD_BIT) != 0 {
                    reg_data[1] &= !(1 << CONFIG_QUAD_BIT);
                    inst.enable_write_volatile()?;
                    return inst.write_status_reg(&reg_data);
                }
            }
        }
        Ok(())
    }

    fn set_num_addr_bytes(&self, inst: &mut Inst) -> Result {
        if inst.num_addr_bytes == 4 {
            if inst.read_config_reg_alt() & (1 << CONFIG2_ADS_BIT) == 0 {
                inst.enter_4byte_addr_mode()?;
                if inst.read_config_reg_alt() & (1 << CONFIG2_ADS_BIT) == 0 {
                    return Err(Error::Protocol);
                }
            }
        } else if inst.read_config_reg_alt() & (1 << CONFIG2_ADS_BIT) != 0 {
            inst.exit_4byte_addr_mode()?;
            if inst.read_config_reg_alt() & (1 << CONFIG2_ADS_BIT) != 0 {
                return Err(Error::Protocol);
            }
        }
        Ok(())
    }

    fn wait_for_end_of_op(&self, inst: &mut Inst, poll: &PollPara) -> Result {
        inst.wait_busy_cleared(poll)?;
        let status = inst.read_status2();
        if status & (1 << STATUS2_E_ERR_BIT | 1 << STATUS2_P_ERR_BIT) != 0 {
            let _ = inst.clear_status_reg();
            log::warn!("NOR flash reports error {status:#x}");
            return Err(Error::DeviceReported);
        }
        Ok(())
    }
}
