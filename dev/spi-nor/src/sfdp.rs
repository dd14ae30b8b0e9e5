//! Serial Flash Discoverable Parameters (JEDEC JESD216) reader.
//!
//! Only the revision-1 layout is consumed: the Basic Parameter Table gives
//! density, the erase block menu and the fast-read mode menu; vendor tables
//! are looked up by manufacturer id for the families that keep their
//! geometry there (Microchip).

use blocks::{Error, Result};

use crate::{
    cmds::*,
    hw::{BusWidth, XferFlags},
    Inst,
};

/// Checks the signature and major revision at the start of the SFDP space.
pub(crate) fn is_supported(inst: &mut Inst) -> bool {
    let mut data = [0u8; 6];
    inst.read_sfdp(0x00, &mut data);
    data[..4] == *b"SFDP" && data[5] <= SFDP_MIN_REVISION_SUPPORTED
}

pub(crate) fn is_supported_x2(inst: &mut Inst) -> bool {
    let mut data = [0u8; 6 * 2];
    if inst.read_sfdp_x2(0x00, &mut data).is_err() {
        return false;
    }
    data[..4] == *b"SFDP" && data[5] <= SFDP_MIN_REVISION_SUPPORTED
}

/// Returns the byte address of the Basic Parameter Table, with its size in
/// bytes, or an error when the mandatory JEDEC header is absent or too old.
///
/// Early Spansion S25FL127S parts store the pointer as a double-word index;
/// they are recognised by a Spansion parameter header with minor revision 0
/// and the pointer is shifted into a byte address.
pub(crate) fn bpt_addr(inst: &mut Inst) -> Result<(u32, u32)> {
    let mut data = [0u8; 8];
    inst.read_sfdp(0, &mut data);
    let num_paras = u32::from(data[6]) + 1; // 0-based on the wire

    inst.read_sfdp(0x08, &mut data);
    if data[0] != 0x00 {
        return Err(Error::Protocol); // expected the JEDEC header first
    }
    if data[2] > SFDP_MIN_REVISION_SUPPORTED {
        return Err(Error::NotSupported);
    }
    let num_bytes = u32::from(data[3]) << 2; // length is in 32-bit words
    if num_bytes < 36 {
        return Err(Error::Protocol);
    }
    let mut addr = u32::from(data[4]) | u32::from(data[5]) << 8 | u32::from(data[6]) << 16;

    let mut off = 0x10;
    for _ in 0..num_paras {
        inst.read_sfdp(off, &mut data);
        if data[0] == MFG_ID_SPANSION && data[1] == 0 {
            addr <<= 2;
            break;
        }
        off += data.len() as u32;
    }
    Ok((addr, num_bytes))
}

pub(crate) fn bpt_addr_x2(inst: &mut Inst) -> Result<(u32, u32)> {
    let mut data = [0u8; 8 * 2];
    inst.read_sfdp_x2(0, &mut data)?;
    let num_paras = u32::from(data[6]) + 1;

    inst.read_sfdp_x2(0x08 * 2, &mut data)?;
    if data[0] != 0x00 {
        return Err(Error::Protocol);
    }
    if data[2] > SFDP_MIN_REVISION_SUPPORTED {
        return Err(Error::NotSupported);
    }
    let num_bytes = u32::from(data[3]) << 2;
    if num_bytes < 36 {
        return Err(Error::Protocol);
    }
    let mut addr = u32::from(data[4]) | u32::from(data[5]) << 8 | u32::from(data[6]) << 16;

    let mut off = 0x10u32;
    for _ in 0..num_paras {
        inst.read_sfdp_x2(off * 2, &mut data)?;
        if data[0] == MFG_ID_SPANSION && data[1] == 0 {
            addr <<= 2;
            break;
        }
        off += 8;
    }
    Ok((addr, num_bytes))
}

/// Scans the parameter headers for the vendor table of `mfg_id`.
pub(crate) fn vpt_addr(inst: &mut Inst, mfg_id: u8) -> Result<(u32, u32)> {
    let mut data = [0u8; 8];
    inst.read_sfdp(0, &mut data);
    let num_paras = u32::from(data[6]) + 1;
    let mut off = 0x10;
    for _ in 0..num_paras {
        inst.read_sfdp(off, &mut data);
        if data[0] == mfg_id {
            let num_bytes = u32::from(data[3]) << 2;
            let addr = u32::from(data[4]) | u32::from(data[5]) << 8 | u32::from(data[6]) << 16;
            return Ok((addr, num_bytes));
        }
        off += data.len() as u32;
    }
    Err(Error::NotSupported)
}

/// Decodes the density double-word at `bpt + 0x04` into `log2(bits)`.
pub(crate) fn read_ld_num_bits(inst: &mut Inst, bpt: u32) -> u16 {
    let mut data = [0u8; 4];
    inst.read_sfdp(bpt + 0x04, &mut data);
    decode_density(u32::from_le_bytes(data))
}

pub(crate) fn decode_density(density: u32) -> u16 {
    // Up to 2 Gbit the field holds `bits - 1`; above, bit 31 flags a
    // power-of-two exponent.
    if density & (1 << 31) != 0 {
        (density & !(1 << 31)) as u16
    } else {
        ld(density + 1) as u16
    }
}

pub(crate) fn ld(value: u32) -> u32 {
    (0..32).find(|&i| 1u32 << i == value).unwrap_or(32)
}

/// Reads the erase menu and density, fills in the single uniform sector
/// block and the address-byte count.
pub(crate) fn read_apply_device_geometry(inst: &mut Inst, bpt: u32) -> Result {
    let ld_num_bits = read_ld_num_bits(inst, bpt);

    // Find the largest erasable sector, or the one the application asked for.
    let mut cmd_erase = CMD_SE;
    let mut ld_bps = 0u8;
    let requested = inst.ld_bps_requested;
    let mut addr = bpt + 0x1C;
    for _ in 0..4 {
        let mut data = [0u8; 2];
        inst.read_sfdp(addr, &mut data);
        let ld_to_check = data[0];
        if requested == 0 {
            if ld_to_check > ld_bps {
                ld_bps = ld_to_check;
                cmd_erase = data[1];
            }
        } else if ld_to_check == requested {
            ld_bps = ld_to_check;
            cmd_erase = data[1];
            break;
        }
        addr += 2;
    }
    if ld_bps == 0 {
        return Err(Error::Protocol); // no valid sector information found
    }

    let num_sectors = 1u32 << (u32::from(ld_num_bits) - 3 - u32::from(ld_bps));
    inst.set_uniform_sectors(num_sectors, ld_bps, cmd_erase);
    inst.num_addr_bytes = if ld_num_bits > 27 { 4 } else { 3 };
    Ok(())
}

pub(crate) fn read_apply_device_geometry_x2(inst: &mut Inst, bpt: u32) -> Result {
    let mut data = [0u8; 4 * 2];
    inst.read_sfdp_x2((bpt + 0x04) * 2, &mut data)?;
    let ld_num_bits = decode_density(u32::from_le_bytes([data[0], data[1], data[2], data[3]]));

    let mut cmd_erase = CMD_SE;
    let mut ld_bps = 0u8;
    let requested = inst.ld_bps_requested;
    let mut addr = bpt + 0x1C;
    for _ in 0..4 {
        let mut entry = [0u8; 2 * 2];
        inst.read_sfdp_x2(addr * 2, &mut entry)?;
        let ld_to_check = entry[0];
        if requested == 0 {
            if ld_to_check > ld_bps {
                ld_bps = ld_to_check;
                cmd_erase = entry[1];
            }
        } else if ld_to_check == requested {
            ld_bps = ld_to_check;
            cmd_erase = entry[1];
            break;
        }
        addr += 2;
    }
    if ld_bps == 0 {
        return Err(Error::Protocol);
    }

    let num_sectors = 1u32 << (u32::from(ld_num_bits) - 3 - u32::from(ld_bps));
    // Two sectors are erased at a time, one per die.
    inst.set_uniform_sectors(num_sectors, ld_bps + 1, cmd_erase);
    inst.num_addr_bytes = if ld_num_bits > 27 { 4 } else { 3 };
    Ok(())
}

struct ReadModeEntry {
    /// Offset of the wait-states/opcode pair inside the BPT.
    off: u32,
    bus_width: BusWidth,
    /// Bits moved per dummy clock cycle (log2).
    ld_bits_per_clock: u8,
}

/// Picks the widest read mode the device advertises and the instance
/// permits, in the preference order 1-4-4, 1-1-4, 1-2-2, 1-1-2, falling
/// back to plain FAST_READ with one dummy byte.
pub(crate) fn read_apply_read_mode(inst: &mut Inst, bpt: u32) -> Result {
    let mut data = [0u8; 2];
    inst.read_sfdp(bpt + 0x02, &mut data[..1]);
    let supported = data[0] & !inst.read_modes_disabled;

    let mode_144 = ReadModeEntry {
        off: 0x08,
        bus_width: BusWidth::new(1, 4, 4),
        ld_bits_per_clock: 2,
    };
    let mode_114 = ReadModeEntry {
        off: 0x0A,
        bus_width: BusWidth::new(1, 1, 4),
        ld_bits_per_clock: 0,
    };
    let mode_122 = ReadModeEntry {
        off: 0x0E,
        bus_width: BusWidth::new(1, 2, 2),
        ld_bits_per_clock: 1,
    };
    let mode_112 = ReadModeEntry {
        off: 0x0C,
        bus_width: BusWidth::new(1, 1, 2),
        ld_bits_per_clock: 0,
    };

    let mut selected = None;
    if inst.allow_4bit {
        if supported & (1 << READ_MODE_144_BIT) != 0 {
            selected = Some(mode_144);
        } else if supported & (1 << READ_MODE_114_BIT) != 0 {
            selected = Some(mode_114);
        }
    }
    if selected.is_none() && inst.allow_2bit {
        if supported & (1 << READ_MODE_122_BIT) != 0 {
            selected = Some(mode_122);
        } else if supported & (1 << READ_MODE_112_BIT) != 0 {
            selected = Some(mode_112);
        }
    }

    let mut flags = inst.flags_read;
    let (cmd, bus_width, num_bytes_dummy, num_bits_mode);
    match selected {
        Some(mode) => {
            inst.read_sfdp(bpt + mode.off, &mut data);
            let num_clocks_wait = u32::from(data[0]) & 0x1F;
            let num_clocks_mode = (u32::from(data[0]) >> 5) & 0x07;
            let num_bits_dummy = (num_clocks_wait + num_clocks_mode) << mode.ld_bits_per_clock;
            num_bits_mode = num_clocks_mode << mode.ld_bits_per_clock;
            cmd = data[1];
            bus_width = mode.bus_width;
            num_bytes_dummy = num_bits_dummy >> 3;
        }
        None => {
            cmd = CMD_FAST_READ;
            bus_width = BusWidth::single();
            num_bytes_dummy = 1;
            num_bits_mode = 0;
        }
    }
    // Anything above one byte of mode bits has no transfer flag; the
    // cycles still count towards the dummy total.
    if num_bits_mode > 0 {
        if num_bits_mode <= 4 {
            flags |= XferFlags::MODE_4BIT;
        } else if num_bits_mode <= 8 {
            flags |= XferFlags::MODE_8BIT;
        }
    }
    inst.cmd_read = cmd;
    inst.bus_width_read = bus_width;
    inst.num_bytes_read_dummy = num_bytes_dummy as u8;
    inst.flags_read = flags;
    Ok(())
}

/// Dual-die variant; mode-bit flags are not used because the dies see the
/// transaction byte-interleaved.
pub(crate) fn read_apply_read_mode_x2(inst: &mut Inst, bpt: u32) -> Result {
    let mut data = [0u8; 2 * 2];
    inst.read_sfdp_x2((bpt + 0x02) * 2, &mut data[..2])?;
    let supported = data[0] & !inst.read_modes_disabled;

    let mut cmd = CMD_FAST_READ;
    let mut bus_width = BusWidth::single();
    let mut num_bytes_dummy = 1u32;

    let apply = |inst: &mut Inst,
                 off: u32,
                 width: BusWidth,
                 ld_bits_per_clock: u8|
     -> Result<(u8, BusWidth, u32)> {
        let mut entry = [0u8; 2 * 2];
        inst.read_sfdp_x2((bpt + off) * 2, &mut entry)?;
        let num_clocks_wait = u32::from(entry[0]) & 0x1F;
        let num_clocks_mode = (u32::from(entry[0]) >> 5) & 0x07;
        let num_bits_dummy = (num_clocks_wait + num_clocks_mode) << ld_bits_per_clock;
        Ok((entry[1], width, num_bits_dummy >> 3))
    };

    if inst.allow_4bit && supported & (1 << READ_MODE_144_BIT) != 0 {
        (cmd, bus_width, num_bytes_dummy) = apply(inst, 0x08, BusWidth::new(1, 4, 4), 2)?;
    } else if inst.allow_4bit && supported & (1 << READ_MODE_114_BIT) != 0 {
        (cmd, bus_width, num_bytes_dummy) = apply(inst, 0x0A, BusWidth::new(1, 1, 4), 0)?;
    } else if inst.allow_2bit && supported & (1 << READ_MODE_122_BIT) != 0 {
        (cmd, bus_width, num_bytes_dummy) = apply(inst, 0x0E, BusWidth::new(1, 2, 2), 1)?;
    } else if inst.allow_2bit && supported & (1 << READ_MODE_112_BIT) != 0 {
        (cmd, bus_width, num_bytes_dummy) = apply(inst, 0x0C, BusWidth::new(1, 1, 2), 0)?;
    }

    inst.cmd_read = cmd;
    inst.bus_width_read = bus_width;
    inst.num_bytes_read_dummy = num_bytes_dummy as u8;
    Ok(())
}

/// Full SFDP identification: support check, BPT lookup, geometry, read mode.
pub(crate) fn read_apply_para(inst: &mut Inst) -> Result {
    if !is_supported(inst) {
        return Err(Error::NotSupported);
    }
    let (bpt, _) = bpt_addr(inst).map_err(|e| {
        log::warn!("NOR SFDP: could not locate the basic parameter table");
        e
    })?;
    read_apply_device_geometry(inst, bpt)?;
    read_apply_read_mode(inst, bpt)
}

pub(crate) fn read_apply_para_x2(inst: &mut Inst) -> Result {
    if !is_supported_x2(inst) {
        return Err(Error::NotSupported);
    }
    let (bpt, _) = bpt_addr_x2(inst).map_err(|e| {
        log::warn!("NOR SFDP: could not locate the basic parameter table");
        e
    })?;
    read_apply_device_geometry_x2(inst, bpt)?;
    read_apply_read_mode_x2(inst, bpt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn density_decoding() {
        // 128 Mbit, linear form: bits - 1.
        assert_eq!(decode_density(0x07FF_FFFF), 27);
        // 4 Gbit, exponent form.
        assert_eq!(decode_density(0x8000_0020), 32);
        // 1 Mbit.
        assert_eq!(decode_density(0x000F_FFFF), 20);
    }

    #[test]
    fn log2_lookup() {
        assert_eq!(ld(1), 0);
        assert_eq!(ld(0x10000), 16);
        assert_eq!(ld(3), 32); // not a power of two
    }
}
