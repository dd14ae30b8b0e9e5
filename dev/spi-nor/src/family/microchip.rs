//! Microchip SST26VF series.
//!
//! Every physical sector powers up write-locked; the lock bitmap lives in a
//! dedicated Block Protection Register whose layout is derived from the
//! vendor parameter table in SFDP. Some sector blocks interleave read-lock
//! bits with the write-lock bits, which doubles the bit stride there.

use blocks::{bits::clear_bits, Error, Result};

use crate::{
    cmds::*,
    device::{Device, SectorBlock},
    sfdp, Inst,
};

// Layout of the vendor parameter table.
const OFF_FIRST_SECTOR_BLOCK: u32 = 0x4C;
const NUM_BYTES_SECTOR_BLOCK: u32 = 4;
const NUM_SECTOR_BLOCKS: u32 = 5;
const OFF_FIRST_SECTOR_TYPE: u32 = 0x1C;
const NUM_BYTES_SECTOR_TYPE: u32 = 2;

pub struct Microchip;

impl Device for Microchip {
    fn identify(&self, _inst: &mut Inst, id: &[u8]) -> Result {
        // Devices with SFDP support:
        //   0xBF 0x.. 0x41  SST26VF016B
        //   0xBF 0x.. 0x42  SST26VF032B, SST26VF032BA
        //   0xBF 0x.. 0x43  SST26VF064B
        if id[0] == MFG_ID_MICROCHIP && (0x41..=0x43).contains(&id[2]) {
            Ok(())
        } else {
            Err(Error::NoMedium)
        }
    }

    fn set_bus_width(&self, inst: &mut Inst) -> Result {
        // IOC lives in the configuration register; the write command takes
        // status first, configuration second.
        let mut reg_data = [inst.read_status(), inst.read_config_reg()];
        if inst.bus_width_read.data == 4 {
            reg_data[1] |= 1 << CONFIG_IOC_BIT;
        } else {
            reg_data[1] &= !(1 << CONFIG_IOC_BIT);
        }
        inst.write_status_reg(&reg_data)
    }

    fn read_apply_para(&self, inst: &mut Inst) -> Result {
        if !sfdp::is_supported(inst) {
            return Err(Error::NotSupported);
        }
        let (bpt, _) = sfdp::bpt_addr(inst)?;
        let (vpt, num_bytes_vpt) = sfdp::vpt_addr(inst, MFG_ID_MICROCHIP)?;
        read_apply_device_geometry(inst, bpt, vpt, num_bytes_vpt)?;
        sfdp::read_apply_read_mode(inst, bpt)
    }

    fn remove_write_protection(&self, inst: &mut Inst, addr: u32, num_bytes: u32) -> Result {
        // The removal fails when WPEN is set in the configuration register
        // while WP# is held low; clearing WPEN is the integrator's job.
        let mut bpr = [0u8; 18];
        inst.read_block_protection_reg(&mut bpr);
        clear_write_lock_bits(inst, addr, num_bytes, &mut bpr)?;
        inst.write_block_protection_reg(&bpr)
    }
}

fn read_sector_block_info(
    inst: &mut Inst,
    addr_bpt: u32,
    addr_vpt: u32,
    block_index: u32,
) -> SectorBlock {
    let mut data = [0u8; 2];
    // The sector type (1-based) and the sector count live in the first two
    // bytes of a sector block entry.
    let addr = addr_vpt + OFF_FIRST_SECTOR_BLOCK + block_index * NUM_BYTES_SECTOR_BLOCK;
    inst.read_sfdp(addr, &mut data);
    let sector_type = u32::from(data[0]) - 1;
    let mut num_sectors = 1u32 << data[1];
    if block_index == 2 {
        num_sectors -= 2; // the 3rd block's count is not a power of two
    }

    let addr = addr_bpt + OFF_FIRST_SECTOR_TYPE + sector_type * NUM_BYTES_SECTOR_TYPE;
    inst.read_sfdp(addr, &mut data);
    SectorBlock {
        num_sectors,
        ld_bytes_per_sector: data[0],
        cmd_erase: data[1],
    }
}

fn calc_bit_index(c: i8, m: u8) -> u32 {
    if c == 0 {
        0
    } else {
        ((1u32 << m) as i32 + 1 + i32::from(c)) as u32
    }
}

/// Clears the write-lock bits covering `addr..addr + num_bytes` in the BPR
/// image, walking the sector blocks of the vendor parameter table.
fn clear_write_lock_bits(inst: &mut Inst, mut addr: u32, mut num_bytes: u32, bpr: &mut [u8]) -> Result {
    let (bpt, _) = sfdp::bpt_addr(inst)?;

    // The BPR length follows the device density.
    let ld_num_bits = sfdp::read_ld_num_bits(inst, bpt);
    let num_bytes_bpr = match ld_num_bits {
        24 => 6,  // 16 Mbit
        25 => 10, // 32 Mbit
        _ => bpr.len(),
    };
    let bpr = &mut bpr[..];
    let bpr_tail = bpr.len() - num_bytes_bpr;
    let bpr = &mut bpr[bpr_tail..];

    let (vpt, _) = sfdp::vpt_addr(inst, MFG_ID_MICROCHIP)?;

    // The bit-index factor is stored as the sector count of the 3rd block.
    let mut data = [0u8; 2];
    inst.read_sfdp(
        vpt + OFF_FIRST_SECTOR_BLOCK + 2 * NUM_BYTES_SECTOR_BLOCK + 1,
        &mut data[..1],
    );
    let bit_factor = data[0];

    let mut addr_start = 0u32;
    for block_index in 0..NUM_SECTOR_BLOCKS {
        let block = read_sector_block_info(inst, bpt, vpt, block_index);
        let ld_bps = u32::from(block.ld_bytes_per_sector);
        let bytes_per_sector = 1u32 << ld_bps;
        let num_sectors_block = block.num_sectors;
        let addr_end = addr_start + (num_sectors_block << ld_bps);
        if addr >= addr_start && addr < addr_end {
            let mut num_bytes_block = addr_end - addr;
            let sector_off = (addr - addr_start) >> ld_bps;
            num_bytes_block = num_bytes_block.min(num_bytes);
            let mut num_sectors = (num_bytes_block + (bytes_per_sector - 1)) >> ld_bps;

            // Start/end bit indices sit in the last two bytes of the entry.
            inst.read_sfdp(
                vpt + OFF_FIRST_SECTOR_BLOCK + block_index * NUM_BYTES_SECTOR_BLOCK + 2,
                &mut data,
            );
            let mut bit_start = calc_bit_index(data[0] as i8, bit_factor);
            let bit_end = calc_bit_index(data[1] as i8, bit_factor);
            if bit_end - bit_start > num_sectors_block {
                // More bits than sectors: this block interleaves read-lock
                // bits, the write locks sit at even indices.
                bit_start += sector_off << 1;
                while num_sectors != 0 {
                    clear_bits(bpr, bit_start, bit_start);
                    bit_start += 2;
                    num_sectors -= 1;
                }
            } else {
                bit_start += sector_off;
                let bit_end = bit_start + num_sectors - 1;
                clear_bits(bpr, bit_end, bit_start);
            }
            num_bytes -= num_bytes_block;
            addr += num_bytes_block;
        }
        if num_bytes == 0 {
            break;
        }
        addr_start = addr_end;
    }
    Ok(())
}

fn read_apply_device_geometry(
    inst: &mut Inst,
    addr_bpt: u32,
    addr_vpt: u32,
    num_bytes_vpt: u32,
) -> Result {
    let ld_num_bits = sfdp::read_ld_num_bits(inst, addr_bpt);

    if num_bytes_vpt > OFF_FIRST_SECTOR_BLOCK {
        let mut blocks = [SectorBlock::default(); NUM_SECTOR_BLOCKS as usize];
        for (block_index, block) in blocks.iter_mut().enumerate() {
            *block = read_sector_block_info(inst, addr_bpt, addr_vpt, block_index as u32);
        }
        inst.set_sector_blocks(&blocks);
    }
    inst.num_addr_bytes = if ld_num_bits > 27 { 4 } else { 3 };
    Ok(())
}
