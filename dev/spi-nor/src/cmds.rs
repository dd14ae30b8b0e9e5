//! Serial NOR opcodes and register bit positions.

pub const CMD_WRSR: u8 = 0x01; // Write status register
pub const CMD_PP: u8 = 0x02; // Page program
pub const CMD_WRDIS: u8 = 0x04; // Write disable
pub const CMD_RDSR: u8 = 0x05; // Read status register
pub const CMD_WREN: u8 = 0x06; // Write enable
pub const CMD_RDSR2: u8 = 0x07; // Read status register 2
pub const CMD_FAST_READ: u8 = 0x0B; // Read data bytes at higher speed
pub const CMD_FAST_READ4B: u8 = 0x0C; // Fast read with 4-byte address
pub const CMD_READ_DTR: u8 = 0x0D; // 1S-1D-1D read (Winbond)
pub const CMD_PP4B: u8 = 0x12; // Page program with 4-byte address
pub const CMD_RDCR_ALT: u8 = 0x15; // Read configuration register (Macronix)
pub const CMD_RDSR3: u8 = 0x15; // Read status register 3 (GigaDevice)
pub const CMD_BRRD: u8 = 0x16; // Bank register read (Spansion, ISSI)
pub const CMD_BRWR: u8 = 0x17; // Bank register write (Spansion, ISSI)
pub const CMD_P4E: u8 = 0x20; // 4 KB sector erase
pub const CMD_RDSCUR: u8 = 0x2B; // Read security register (Macronix)
pub const CMD_CLSR: u8 = 0x30; // Clear status register error bits (Spansion)
pub const CMD_WRSR2: u8 = 0x31; // Write status register 2 (GigaDevice)
pub const CMD_RDCR: u8 = 0x35; // Read configuration register (Spansion, Microchip)
pub const CMD_RDSR2_ALT: u8 = 0x35; // Read status register 2 (GigaDevice, Winbond)
pub const CMD_WBPR: u8 = 0x42; // Write block-protection register (Microchip)
pub const CMD_CFSR: u8 = 0x50; // Clear flag status register (Micron)
pub const CMD_WRENV: u8 = 0x50; // Write enable for volatile registers (Cypress)
pub const CMD_READ_SFDP: u8 = 0x5A; // Read SFDP data
pub const CMD_WECR: u8 = 0x61; // Write enhanced volatile config register (Micron)
pub const CMD_RDSRI: u8 = 0x65; // Read status register indirect (Adesto)
pub const CMD_RECR: u8 = 0x65; // Read enhanced volatile config register (Micron)
pub const CMD_RFSR: u8 = 0x70; // Read flag status register (Micron)
pub const CMD_RDCR2: u8 = 0x71; // Read configuration register 2 (Macronix)
pub const CMD_RBPR: u8 = 0x72; // Read block-protection register (Microchip)
pub const CMD_WRCR2: u8 = 0x72; // Write configuration register 2 (Macronix)
pub const CMD_RDERP: u8 = 0x81; // Read extended read register (ISSI)
pub const CMD_CLERP: u8 = 0x82; // Clear extended read register (ISSI)
pub const CMD_RDID: u8 = 0x9F; // Read identification
pub const CMD_RES: u8 = 0xAB; // Release from deep power-down
pub const CMD_EN4B: u8 = 0xB7; // Enter 4-byte address mode
pub const CMD_DUAL_READ: u8 = 0xBB; // 1S-2S-2S read
pub const CMD_DUAL_READ_DTR: u8 = 0xBD; // 1S-2D-2D read (Winbond)
pub const CMD_SE: u8 = 0xD8; // Sector erase
pub const CMD_SE4B: u8 = 0xDC; // Sector erase with 4-byte address
pub const CMD_EX4B: u8 = 0xE9; // Exit 4-byte address mode
pub const CMD_QUAD_READ: u8 = 0xEB; // 1S-4S-4S read
pub const CMD_QUAD_READ_DTR: u8 = 0xED; // 1S-4D-4D read (Winbond)
pub const CMD_8READ: u8 = 0xEC; // Octal STR read (Macronix)
pub const CMD_8DTRD: u8 = 0xEE; // Octal DTR read (Macronix)

// Status register bits.
pub const STATUS_BUSY_BIT: u8 = 0;
pub const STATUS_WEL_BIT: u8 = 1;
pub const STATUS_BP_BIT: u8 = 2;
pub const STATUS_BP_MASK: u8 = 0x7;
pub const STATUS_E_ERR_BIT: u8 = 5; // Spansion
pub const STATUS_P_ERR_BIT: u8 = 6; // Spansion
pub const STATUS_QE_BIT: u8 = 6; // ISSI and Macronix, non-volatile

// Extended read register bits (ISSI).
pub const EXT_READ_PROT_E_BIT: u8 = 1;
pub const EXT_READ_P_ERR_BIT: u8 = 2;
pub const EXT_READ_E_ERR_BIT: u8 = 3;

// Status register 3 bits (GigaDevice).
pub const STATUS3_PE_BIT: u8 = 2;
pub const STATUS3_EE_BIT: u8 = 3;

// Flag status register bits (Micron).
pub const FLAG_STATUS_ADDR_BIT: u8 = 0;
pub const FLAG_STATUS_PROT_ERROR_BIT: u8 = 1;
pub const FLAG_STATUS_VPP_ERROR_BIT: u8 = 3;
pub const FLAG_STATUS_PROG_ERROR_BIT: u8 = 4;
pub const FLAG_STATUS_ERASE_ERROR_BIT: u8 = 5;
pub const FLAG_STATUS_READY_BIT: u8 = 7;

// Security register bits (Macronix).
pub const SCUR_P_FAIL_BIT: u8 = 5;
pub const SCUR_E_FAIL_BIT: u8 = 6;

// Status register 2 bits (Cypress).
pub const STATUS2_P_ERR_BIT: u8 = 5;
pub const STATUS2_E_ERR_BIT: u8 = 6;

// Status register 4 bits (Adesto, read through the indirect register).
pub const STATUS4_EE_BIT: u8 = 4;
pub const STATUS4_PE_BIT: u8 = 5;

// Configuration register 2 (Macronix octal parts).
pub const CONFIG2_ADDR_MODE: u32 = 0x0000_0000;
pub const CONFIG2_ADDR_DUMMY: u32 = 0x0000_0300;
pub const CONFIG2_MODE_BIT: u8 = 0;
pub const CONFIG2_MODE_SPI: u8 = 0x0;
pub const CONFIG2_MODE_SOPI: u8 = 0x1;
pub const CONFIG2_MODE_DOPI: u8 = 0x2;
pub const CONFIG2_MODE_MASK: u8 = 0x3;
pub const CONFIG2_DUMMY_BIT: u8 = 0;
pub const CONFIG2_DUMMY_MASK: u8 = 0x7;

// Manufacturer ids.
pub const MFG_ID_SPANSION: u8 = 0x01;
pub const MFG_ID_EON: u8 = 0x1C;
pub const MFG_ID_ADESTO: u8 = 0x1F;
pub const MFG_ID_MICRON: u8 = 0x20;
pub const MFG_ID_BYT: u8 = 0x68;
pub const MFG_ID_ISSI: u8 = 0x9D;
pub const MFG_ID_MICROCHIP: u8 = 0xBF;
pub const MFG_ID_MACRONIX: u8 = 0xC2;
pub const MFG_ID_GIGADEVICE: u8 = 0xC8;
pub const MFG_ID_WINBOND: u8 = 0xEF;
pub const MFG_ID_CYPRESS: u8 = MFG_ID_SPANSION;

// Bits for the read modes advertised by the SFDP basic parameter table.
pub const READ_MODE_112_BIT: u8 = 0;
pub const READ_MODE_122_BIT: u8 = 4;
pub const READ_MODE_144_BIT: u8 = 5;
pub const READ_MODE_114_BIT: u8 = 6;

// Misc register bits.
pub const SFDP_MIN_REVISION_SUPPORTED: u8 = 1;
pub const CONFIG_QUAD_BIT: u8 = 1; // Spansion
pub const CONFIG_LATENCY_BIT: u8 = 6; // Spansion
pub const CONFIG_LATENCY_MASK: u8 = 0x3; // Spansion
pub const CONFIG_LATENCY_NONE: u8 = 0x3; // Spansion
pub const CONFIG_IOC_BIT: u8 = 1; // Microchip
pub const BAR_EXTADD_BIT: u8 = 7; // Spansion
pub const CONFIG_4BYTE_BIT: u8 = 5; // Macronix
pub const STATUS2_ADS_BIT: u8 = 0; // GigaDevice
pub const STATUS2_QE_BIT: u8 = 1; // GigaDevice, Winbond, BYT, Adesto
pub const STATUS2_D8H_O_BIT: u8 = 7; // Spansion
pub const CONFIG2_ADS_BIT: u8 = 0; // Cypress
pub const REG_ADDR_ERROR: u8 = 4; // Adesto indirect status address
pub const CONFIG_HOLD_BIT: u8 = 4; // Micron

// Octal (OPI) framing: 2-byte opcode, 4 address bytes, 4 dummy bytes.
pub const NUM_BYTES_CMD_OPI: usize = 2;
pub const NUM_BYTES_ADDR_OPI: usize = 4;
pub const NUM_BYTES_DUMMY_OPI: usize = 4;
pub const NUM_BYTES_ADDR_SFDP: usize = 3;
pub const NUM_BYTES_DUMMY_SFDP: usize = 1;
pub const MAX_NUM_BYTES_ADDR: usize = 4;
pub const NUM_CYCLES_DUMMY_DEFAULT: u8 = 20; // Macronix octal
