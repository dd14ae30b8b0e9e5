//! Identification tests against scripted device models.

use std::sync::{Arc, Mutex};

use blocks::{Error, Result};
use spi_nor::{
    BusWidth, HwSpi, Inst, XferFlags, CMD_8DTRD, CMD_QUAD_READ, CMD_RDID, CMD_RDSR, CMD_READ_SFDP,
    CMD_SE4B, CMD_WRCR2, CMD_WRDIS, CMD_WREN, CONFIG2_MODE_DOPI, CONFIG2_MODE_SPI,
    DEVICE_LIST_ALL, DEVICE_LIST_MACRONIX_OCTAL, DEVICE_LIST_MICRON_X2,
};

/// Builds a minimal SFDP image: header, one JEDEC parameter header pointing
/// at a basic parameter table at `bpt`, and the table fields the driver
/// consumes.
fn sfdp_image(density: u32, erase: &[(u8, u8)], mode_byte: u8, entry_144: [u8; 2]) -> Vec<u8> {
    let bpt = 0x30usize;
    let mut img = vec![0u8; 0x100];
    img[0..4].copy_from_slice(b"SFDP");
    img[4] = 0x06; // minor revision
    img[5] = 0x01; // major revision
    img[6] = 0x00; // one parameter header
    img[7] = 0xFF;
    // JEDEC parameter header.
    img[0x08] = 0x00; // id
    img[0x09] = 0x06; // minor
    img[0x0A] = 0x01; // major
    img[0x0B] = 0x09; // 9 double words
    img[0x0C] = bpt as u8;
    // Basic parameter table.
    img[bpt + 0x02] = mode_byte;
    img[bpt + 0x04..bpt + 0x08].copy_from_slice(&density.to_le_bytes());
    img[bpt + 0x08] = entry_144[0];
    img[bpt + 0x09] = entry_144[1];
    for (i, &(ld_bps, opcode)) in erase.iter().enumerate() {
        img[bpt + 0x1C + 2 * i] = ld_bps;
        img[bpt + 0x1D + 2 * i] = opcode;
    }
    img
}

/// Single Micron die with SFDP.
struct MicronModel {
    id: [u8; 3],
    sfdp: Vec<u8>,
    wel: bool,
}

impl HwSpi for MicronModel {
    fn control(&mut self, cmd: u8, _bus_width: BusWidth) -> Result {
        if cmd == CMD_WREN {
            self.wel = true;
        }
        Ok(())
    }

    fn write(&mut self, _cmd: u8, _data: &[u8], _bus_width: BusWidth) -> Result {
        Ok(())
    }

    fn read(&mut self, cmd: u8, data: &mut [u8], _bus_width: BusWidth) -> Result {
        match cmd {
            CMD_RDID => {
                for (i, b) in data.iter_mut().enumerate() {
                    *b = *self.id.get(i).unwrap_or(&0);
                }
            }
            CMD_RDSR => data[0] = u8::from(self.wel) << 1,
            0x70 => data[0] = 1 << 7, // flag status: ready, no errors
            _ => data.fill(0),
        }
        Ok(())
    }

    fn write_with_addr(
        &mut self,
        _cmd: u8,
        _para: &[u8],
        _num_addr_bytes: usize,
        _data: &[u8],
        _bus_width: BusWidth,
    ) -> Result {
        Ok(())
    }

    fn read_with_addr(
        &mut self,
        cmd: u8,
        para: &[u8],
        _num_addr_bytes: usize,
        data: &mut [u8],
        _bus_width: BusWidth,
    ) -> Result {
        if cmd == CMD_READ_SFDP {
            let addr = usize::from(para[0]) << 16 | usize::from(para[1]) << 8 | usize::from(para[2]);
            for (i, b) in data.iter_mut().enumerate() {
                *b = *self.sfdp.get(addr + i).unwrap_or(&0);
            }
        } else {
            data.fill(0);
        }
        Ok(())
    }
}

#[test]
fn micron_128mbit_quad_read() {
    // 128 Mbit, 4 KB and 64 KB erase, 1-1-2/1-2-2/1-4-4/1-1-4 advertised,
    // 1-4-4 opcode 0xEB with 4 wait + 2 mode clocks.
    let sfdp = sfdp_image(
        0x07FF_FFFF,
        &[(12, 0x20), (16, 0xD8)],
        0x71,
        [0x44, CMD_QUAD_READ],
    );
    let model = MicronModel {
        id: [0x20, 0xBA, 0x18],
        sfdp,
        wel: false,
    };
    let mut inst = Inst::new(Box::new(model));
    inst.allow_2bit_mode(true);
    inst.allow_4bit_mode(true);
    inst.identify(&DEVICE_LIST_ALL).unwrap();

    assert_eq!(inst.num_sectors(), 256);
    assert_eq!(inst.sector_size(0), 64 * 1024);
    assert_eq!(inst.sector_erase_cmd(0), 0xD8);
    assert_eq!(inst.num_addr_bytes(), 3);
    let (cmd, bus_width, dummy, flags) = inst.read_mode();
    assert_eq!(cmd, CMD_QUAD_READ);
    assert_eq!(bus_width, BusWidth::new(1, 4, 4));
    assert_eq!(dummy, 3); // (4 + 2) clocks at 4 bits each
    assert!(flags.contains(XferFlags::MODE_8BIT));
}

#[test]
fn micron_without_quad_permission_falls_back() {
    let sfdp = sfdp_image(
        0x07FF_FFFF,
        &[(12, 0x20), (16, 0xD8)],
        0x71,
        [0x44, CMD_QUAD_READ],
    );
    let model = MicronModel {
        id: [0x20, 0xBA, 0x18],
        sfdp,
        wel: false,
    };
    let mut inst = Inst::new(Box::new(model));
    inst.identify(&DEVICE_LIST_ALL).unwrap();
    let (cmd, bus_width, dummy, _) = inst.read_mode();
    assert_eq!(cmd, 0x0B);
    assert_eq!(bus_width, BusWidth::single());
    assert_eq!(dummy, 1);
}

/// Two Micron dies in parallel; every byte arrives twice and SFDP
/// addresses are issued doubled.
struct MicronX2Model {
    sfdp: Vec<u8>,
    wel: bool,
    corrupt_die1: bool,
}

impl HwSpi for MicronX2Model {
    fn control(&mut self, cmd: u8, _bus_width: BusWidth) -> Result {
        if cmd == CMD_WREN {
            self.wel = true;
        }
        Ok(())
    }

    fn write(&mut self, _cmd: u8, _data: &[u8], _bus_width: BusWidth) -> Result {
        Ok(())
    }

    fn read(&mut self, cmd: u8, data: &mut [u8], _bus_width: BusWidth) -> Result {
        match cmd {
            CMD_RDID => {
                // Interleaved: mfg, mfg, type, type, id, id.
                let id = [0x20, 0x20, 0xBA, 0xBA, 0x18, 0x18];
                for (i, b) in data.iter_mut().enumerate() {
                    *b = *id.get(i).unwrap_or(&0);
                }
            }
            CMD_RDSR => {
                let status = u8::from(self.wel) << 1;
                data.fill(status);
            }
            0x70 => data.fill(1 << 7),
            _ => data.fill(0),
        }
        Ok(())
    }

    fn write_with_addr(
        &mut self,
        _cmd: u8,
        _para: &[u8],
        _num_addr_bytes: usize,
        _data: &[u8],
        _bus_width: BusWidth,
    ) -> Result {
        Ok(())
    }

    fn read_with_addr(
        &mut self,
        cmd: u8,
        para: &[u8],
        _num_addr_bytes: usize,
        data: &mut [u8],
        _bus_width: BusWidth,
    ) -> Result {
        if cmd == CMD_READ_SFDP {
            let addr = usize::from(para[0]) << 16 | usize::from(para[1]) << 8 | usize::from(para[2]);
            let addr = addr / 2; // the hardware halves the address per die
            for i in 0..data.len() / 2 {
                let byte = *self.sfdp.get(addr + i).unwrap_or(&0);
                data[2 * i] = byte;
                data[2 * i + 1] = if self.corrupt_die1 && addr + i == 0x34 {
                    !byte
                } else {
                    byte
                };
            }
        } else {
            data.fill(0);
        }
        Ok(())
    }
}

#[test]
fn micron_x2_doubles_sector_size() {
    let sfdp = sfdp_image(0x07FF_FFFF, &[(16, 0xD8)], 0x71, [0x44, CMD_QUAD_READ]);
    let model = MicronX2Model {
        sfdp,
        wel: false,
        corrupt_die1: false,
    };
    let mut inst = Inst::new(Box::new(model));
    inst.allow_4bit_mode(true);
    inst.identify(&DEVICE_LIST_MICRON_X2).unwrap();

    assert!(inst.is_dual_device());
    // Same sector count, twice the bytes per sector.
    assert_eq!(inst.num_sectors(), 256);
    assert_eq!(inst.sector_size(0), 128 * 1024);
}

#[test]
fn micron_x2_rejects_disagreeing_dies() {
    let sfdp = sfdp_image(0x07FF_FFFF, &[(16, 0xD8)], 0x71, [0x44, CMD_QUAD_READ]);
    let model = MicronX2Model {
        sfdp,
        wel: false,
        corrupt_die1: true,
    };
    let mut inst = Inst::new(Box::new(model));
    inst.allow_4bit_mode(true);
    assert!(inst.identify(&DEVICE_LIST_MICRON_X2).is_err());
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum OpiMode {
    Spi,
    Dopi,
}

/// Macronix MX25LM51245G left in DTR OPI mode by a previous run.
struct MacronixModel {
    mode: Arc<Mutex<OpiMode>>,
    cr2_mode: Arc<Mutex<u8>>,
    wel: bool,
}

impl MacronixModel {
    fn in_spi(&self) -> bool {
        *self.mode.lock().unwrap() == OpiMode::Spi
    }
}

impl HwSpi for MacronixModel {
    fn control(&mut self, cmd: u8, _bus_width: BusWidth) -> Result {
        if self.in_spi() {
            match cmd {
                CMD_WREN => self.wel = true,
                CMD_WRDIS => self.wel = false,
                _ => {}
            }
        }
        Ok(())
    }

    fn write(&mut self, _cmd: u8, _data: &[u8], _bus_width: BusWidth) -> Result {
        Ok(())
    }

    fn read(&mut self, cmd: u8, data: &mut [u8], _bus_width: BusWidth) -> Result {
        if !self.in_spi() {
            // An OPI-mode device does not understand single-bit commands.
            data.fill(0);
            return Ok(());
        }
        match cmd {
            CMD_RDID => {
                let id = [0xC2, 0x80, 0x3A];
                for (i, b) in data.iter_mut().enumerate() {
                    *b = *id.get(i).unwrap_or(&0);
                }
            }
            CMD_RDSR => data[0] = u8::from(self.wel) << 1,
            0x2B => data[0] = 0, // security register: no failures
            _ => data.fill(0),
        }
        Ok(())
    }

    fn write_with_addr(
        &mut self,
        cmd: u8,
        para: &[u8],
        _num_addr_bytes: usize,
        data: &[u8],
        _bus_width: BusWidth,
    ) -> Result {
        if self.in_spi() && cmd == CMD_WRCR2 {
            let addr = u32::from_be_bytes([para[0], para[1], para[2], para[3]]);
            if addr == 0 {
                *self.cr2_mode.lock().unwrap() = data[0];
                if data[0] & 0x3 == CONFIG2_MODE_DOPI {
                    *self.mode.lock().unwrap() = OpiMode::Dopi;
                }
            }
        }
        Ok(())
    }

    fn read_with_addr(
        &mut self,
        cmd: u8,
        para: &[u8],
        _num_addr_bytes: usize,
        data: &mut [u8],
        _bus_width: BusWidth,
    ) -> Result {
        if self.in_spi() && cmd == 0x71 {
            let addr = u32::from_be_bytes([para[0], para[1], para[2], para[3]]);
            data[0] = if addr == 0 {
                *self.cr2_mode.lock().unwrap()
            } else {
                0
            };
        } else {
            data.fill(0);
        }
        Ok(())
    }

    fn control_with_cmd(&mut self, cmd: &[u8], _bus_width: BusWidth, flags: XferFlags) -> Result {
        // CEI framing is only understood in OPI mode; WREN there.
        if !self.in_spi() && flags.contains(XferFlags::DTR_CMD) && cmd == [CMD_WREN, !CMD_WREN] {
            self.wel = true;
        }
        Ok(())
    }

    fn write_with_cmd(
        &mut self,
        _cmd: &[u8],
        _data: &[u8],
        _bus_width: BusWidth,
        _flags: XferFlags,
    ) -> Result {
        Ok(())
    }

    fn write_with_cmd_and_addr(
        &mut self,
        cmd: &[u8],
        para: &[u8],
        _num_addr_bytes: usize,
        data: &[u8],
        _bus_width: BusWidth,
        flags: XferFlags,
    ) -> Result {
        if cmd.len() == 2 && cmd[0] == CMD_WRCR2 && cmd[1] == !CMD_WRCR2 {
            let in_spi = self.in_spi();
            // A DOPI-mode device only takes DTR-framed commands.
            if !in_spi && !flags.contains(XferFlags::DTR_CMD) {
                return Ok(());
            }
            if !in_spi {
                let addr = u32::from_be_bytes([para[0], para[1], para[2], para[3]]);
                if addr == 0 && data[0] & 0x3 == CONFIG2_MODE_SPI {
                    *self.mode.lock().unwrap() = OpiMode::Spi;
                    *self.cr2_mode.lock().unwrap() = CONFIG2_MODE_SPI;
                }
            }
        }
        Ok(())
    }

    fn read_with_cmd_and_addr(
        &mut self,
        cmd: &[u8],
        para: &[u8],
        _num_addr_bytes: usize,
        data: &mut [u8],
        _bus_width: BusWidth,
        _flags: XferFlags,
    ) -> Result {
        if cmd.len() == 2 && cmd[0] == 0x71 {
            let addr = u32::from_be_bytes([para[0], para[1], para[2], para[3]]);
            data[0] = if addr == 0 {
                *self.cr2_mode.lock().unwrap()
            } else {
                0
            };
        } else if cmd.len() == 2 && cmd[0] == CMD_RDSR {
            data[0] = u8::from(self.wel) << 1;
        } else if cmd.len() == 2 && cmd[0] == 0x2B {
            data[0] = 0;
        } else {
            data.fill(0);
        }
        Ok(())
    }
}

#[test]
fn macronix_octal_dtr_recovers_from_opi() {
    let mode = Arc::new(Mutex::new(OpiMode::Dopi));
    let cr2_mode = Arc::new(Mutex::new(CONFIG2_MODE_DOPI));
    let model = MacronixModel {
        mode: mode.clone(),
        cr2_mode: cr2_mode.clone(),
        wel: false,
    };
    let mut inst = Inst::new(Box::new(model));
    inst.allow_octal_mode(true);
    inst.allow_dtr_mode(true);
    inst.identify(&DEVICE_LIST_MACRONIX_OCTAL).unwrap();

    // Init forced the device back to SPI mode, identification matched the
    // DTR descriptor and bus-width selection switched it to DOPI.
    assert_eq!(*mode.lock().unwrap(), OpiMode::Dopi);
    assert_eq!(inst.num_sectors(), 1024);
    assert_eq!(inst.sector_erase_cmd(0), CMD_SE4B);
    assert_eq!(inst.num_addr_bytes(), 4);
    let (cmd, bus_width, dummy, flags) = inst.read_mode();
    assert_eq!(cmd, CMD_8DTRD);
    assert_eq!(bus_width, BusWidth::octal());
    assert_eq!(dummy, 40); // 20 dummy cycles, two bytes per cycle
    assert!(flags.contains(XferFlags::DTR_CMD | XferFlags::DTR_ADDR | XferFlags::DTR_DATA));
}

#[test]
fn macronix_octal_writes_use_cei_framing() {
    let mode = Arc::new(Mutex::new(OpiMode::Spi));
    let cr2_mode = Arc::new(Mutex::new(CONFIG2_MODE_SPI));
    let model = MacronixModel {
        mode,
        cr2_mode,
        wel: false,
    };
    let mut inst = Inst::new(Box::new(model));
    inst.allow_octal_mode(true);
    inst.allow_dtr_mode(true);
    inst.identify(&DEVICE_LIST_MACRONIX_OCTAL).unwrap();
    assert_eq!(inst.read_mode().0, CMD_8DTRD);
    // Page program runs through the CEI path with the PP4B opcode.
    let data = [0xA5u8; 16];
    inst.write(0x10000, &data).unwrap();
    let err = inst.erase_sector(2048);
    assert_eq!(err, Err(Error::InvalidParam));
    inst.erase_sector(3).unwrap();
}
