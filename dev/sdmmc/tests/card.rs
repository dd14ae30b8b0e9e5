//! Bring-up and sector I/O against scripted card models.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use blocks::{BlockDevice, BurstType, Error, IoctlCmd, Result, BYTES_PER_SECTOR};
use sdio_host::common_cmd::ResponseLen;
use sdmmc::{AccessMode, CardType, ClockFlags, CmdFlags, HwCardMode, Permissions, Sdmmc};

const STATE_IDENT: u32 = 2;
const STATE_STBY: u32 = 3;
const STATE_TRAN: u32 = 4;

fn r1(state: u32) -> u32 {
    state << 9 | 1 << 8 // CURRENT_STATE | READY_FOR_DATA
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Kind {
    SdV2Hc,
    MmcHs400,
}

enum DataOp {
    ReadScr,
    ReadSdStatus,
    ReadSwitchStatus,
    ReadExtCsd,
    ReadBlocks { addr: u32 },
    WriteBlocks { addr: u32 },
}

/// Shared side-channel the tests inspect after driving the driver.
#[derive(Default)]
struct Journal {
    cmds: Vec<u8>,
    write_failures_left: u32,
    clock_khz: u32,
    clock_flags: ClockFlags,
    voltage_mv: u16,
}

struct MockCard {
    kind: Kind,
    journal: Arc<Mutex<Journal>>,
    state: u32,
    rca: u16,
    app_cmd: bool,
    wide: u8,
    resp: [u32; 4],
    pending: Option<DataOp>,
    switch_data: [u8; 64],
    tran_speed: u8,
    ext_csd: [u8; 512],
    sectors: HashMap<u32, Vec<u8>>,
    write_protected: bool,
    ocr_s18a: bool,
}

const SD_RCA: u16 = 0x1234;
const SD_C_SIZE: u32 = 0x7FF; // (c_size + 1) * 1024 sectors
const MMC_SEC_COUNT: u32 = 0x0074_0000;

impl MockCard {
    fn new(kind: Kind, journal: Arc<Mutex<Journal>>) -> Self {
        let mut ext_csd = [0u8; 512];
        // 26/52 MHz, DDR52, HS200 and HS400 at 1.8 V; enhanced strobe.
        ext_csd[196] = 0x57;
        ext_csd[184] = 1;
        ext_csd[192] = 8;
        ext_csd[197] = 0x1F;
        ext_csd[212..216].copy_from_slice(&MMC_SEC_COUNT.to_le_bytes());
        ext_csd[249..253].copy_from_slice(&(1024u32 * 8).to_le_bytes());
        MockCard {
            kind,
            journal,
            state: 0,
            rca: 0,
            app_cmd: false,
            wide: 1,
            resp: [0; 4],
            pending: None,
            switch_data: [0; 64],
            tran_speed: 0x32,
            ext_csd,
            sectors: HashMap::new(),
            write_protected: false,
            ocr_s18a: false,
        }
    }

    fn csd_words(&self) -> [u32; 4] {
        let mut v: u128 = 0;
        match self.kind {
            Kind::SdV2Hc => {
                v |= 1 << 126; // CSD version 2.0
                v |= u128::from(SD_C_SIZE) << 48;
            }
            Kind::MmcHs400 => {
                v |= 3 << 126; // CSD_STRUCTURE: version in EXT_CSD
                v |= 4 << 122; // SPEC_VERS 4
                v |= 0xFFF << 62; // capacity lives in EXT_CSD
            }
        }
        v |= u128::from(self.tran_speed) << 96;
        v |= 9 << 80; // READ_BL_LEN 512
        [
            v as u32,
            (v >> 32) as u32,
            (v >> 64) as u32,
            (v >> 96) as u32,
        ]
    }

    fn cid_words(&self) -> [u32; 4] {
        [0x1122_3344, 0x5566_7788, 0x99AA_BBCC, 0x03AB_CDEF]
    }

    fn scr_bytes(&self) -> [u8; 8] {
        let mut scr = [0u8; 8];
        scr[0] = 0x02; // SD_SPEC 2.0
        scr[1] = 0x05; // 1-bit and 4-bit
        scr[3] = 0x02; // CMD23 supported
        scr
    }

    fn switch_status(&self, selected: u8) -> [u8; 64] {
        let mut raw = [0u8; 64];
        raw[13] = 0x03; // group 1: default speed and high speed
        raw[16] = selected & 0xF;
        raw
    }

    fn sd_cmd(&mut self, index: u8, arg: u32) -> Result {
        match index {
            41 => {
                // Ready, SDHC; S18A only when the model opts in.
                self.resp[0] = 0xC0FF_8000 | u32::from(self.ocr_s18a) << 24;
                self.state = 0;
            }
            11 => self.resp[0] = r1(self.state),
            6 if self.app_cmd => {
                // Bus width; 0b10 selects 4 lines.
                self.wide = if arg == 2 { 4 } else { 1 };
                self.resp[0] = r1(self.state);
            }
            13 if self.app_cmd => {
                self.pending = Some(DataOp::ReadSdStatus);
                self.resp[0] = r1(self.state);
            }
            42 if self.app_cmd => self.resp[0] = r1(self.state),
            51 if self.app_cmd => {
                self.pending = Some(DataOp::ReadScr);
                self.resp[0] = r1(self.state);
            }
            23 if self.app_cmd => self.resp[0] = r1(self.state),
            3 => {
                self.rca = SD_RCA;
                self.state = STATE_STBY;
                self.resp[0] = u32::from(SD_RCA) << 16;
            }
            6 => {
                // SWITCH_FUNC; a set of group 1 function 1 turns on HS
                // timing and the faster TRAN_SPEED.
                let set = arg & 1 << 31 != 0;
                let group1 = (arg & 0xF) as u8;
                if set && group1 == 1 {
                    self.tran_speed = 0x5A;
                }
                self.switch_data = self.switch_status(if set { group1 } else { 0 });
                self.pending = Some(DataOp::ReadSwitchStatus);
                self.resp[0] = r1(self.state);
            }
            8 => self.resp[0] = arg & 0xFFF, // voltage + pattern echo
            _ => return self.common_cmd(index, arg),
        }
        Ok(())
    }

    fn mmc_cmd(&mut self, index: u8, arg: u32) -> Result {
        match index {
            8 if self.state == 0 => return Err(Error::Io), // no SEND_IF_COND
            55 => return Err(Error::Io),                   // no app commands
            1 => {
                // Ready, sector addressing, dual voltage.
                self.resp[0] = 0xC0FF_8080;
            }
            3 => {
                self.rca = (arg >> 16) as u16;
                self.state = STATE_STBY;
                self.resp[0] = r1(self.state);
            }
            8 => {
                self.pending = Some(DataOp::ReadExtCsd);
                self.resp[0] = r1(self.state);
            }
            6 => {
                // SWITCH: write one EXT_CSD byte.
                let index = (arg >> 16) as u8 as usize;
                let value = (arg >> 8) as u8;
                self.ext_csd[index] = value;
                if index == 183 {
                    self.wide = match value & 0xF {
                        2 | 6 => 8,
                        1 | 5 => 4,
                        _ => 1,
                    };
                }
                self.resp[0] = r1(self.state);
            }
            _ => return self.common_cmd(index, arg),
        }
        Ok(())
    }

    fn common_cmd(&mut self, index: u8, arg: u32) -> Result {
        match index {
            0 => {
                self.state = 0;
                self.rca = 0;
                self.wide = 1;
                self.resp[0] = 0;
            }
            2 => {
                self.state = STATE_IDENT;
                self.resp = self.cid_words();
            }
            9 => self.resp = self.csd_words(),
            7 => {
                self.state = if arg == 0 { STATE_STBY } else { STATE_TRAN };
                self.resp[0] = r1(self.state);
            }
            13 | 16 | 23 => self.resp[0] = r1(self.state),
            12 => {
                self.state = STATE_TRAN;
                self.resp[0] = r1(self.state);
            }
            17 | 18 => {
                self.pending = Some(DataOp::ReadBlocks { addr: arg });
                self.resp[0] = r1(self.state);
            }
            24 | 25 => {
                self.pending = Some(DataOp::WriteBlocks { addr: arg });
                self.resp[0] = r1(self.state);
            }
            35 | 36 | 38 => self.resp[0] = r1(self.state),
            _ => return Err(Error::Io),
        }
        Ok(())
    }

    fn dispatch(&mut self, index: u8, arg: u32) -> Result {
        if index == 55 && self.kind == Kind::SdV2Hc {
            self.app_cmd = true;
            self.resp[0] = r1(self.state) | 1 << 5;
            return Ok(());
        }
        let r = match self.kind {
            Kind::SdV2Hc => self.sd_cmd(index, arg),
            Kind::MmcHs400 => self.mmc_cmd(index, arg),
        };
        self.app_cmd = false;
        r
    }
}

struct MockHw {
    card: MockCard,
    switchable_to_1v8: bool,
    voltage_switch_broken: bool,
}

impl HwCardMode for MockHw {
    fn init(&mut self) -> Result {
        Ok(())
    }

    fn delay_ms(&mut self, _ms: u32) {}

    fn is_present(&mut self) -> bool {
        true
    }

    fn is_write_protected(&mut self) -> bool {
        self.card.write_protected
    }

    fn set_max_clock(&mut self, freq_khz: u32, flags: ClockFlags) -> u32 {
        let mut journal = self.card.journal.lock().unwrap();
        journal.clock_khz = freq_khz;
        journal.clock_flags = flags;
        freq_khz
    }

    fn set_response_timeout_ms(&mut self, _ms: u32) {}

    fn set_read_data_timeout_ms(&mut self, _ms: u32) {}

    fn send_cmd(&mut self, index: u8, _flags: CmdFlags, _resp: ResponseLen, arg: u32) -> Result {
        self.card.journal.lock().unwrap().cmds.push(index);
        self.card.dispatch(index, arg)
    }

    fn get_response(&mut self) -> Result<[u32; 4]> {
        Ok(self.card.resp)
    }

    fn read_data(&mut self, buf: &mut [u8], block_len: usize, num_blocks: usize) -> Result {
        match self.card.pending.take() {
            Some(DataOp::ReadScr) => buf.copy_from_slice(&self.card.scr_bytes()),
            Some(DataOp::ReadSdStatus) => {
                buf.fill(0);
                buf[0] = if self.card.wide == 4 { 0x80 } else { 0 };
            }
            Some(DataOp::ReadSwitchStatus) => {
                let data = self.card.switch_data;
                buf.copy_from_slice(&data);
            }
            Some(DataOp::ReadExtCsd) => buf.copy_from_slice(&self.card.ext_csd),
            Some(DataOp::ReadBlocks { addr, .. }) => {
                for (i, chunk) in buf.chunks_mut(block_len).enumerate().take(num_blocks) {
                    match self.card.sectors.get(&(addr + i as u32)) {
                        Some(data) => chunk.copy_from_slice(data),
                        None => chunk.fill(0xFF),
                    }
                }
            }
            _ => return Err(Error::Protocol),
        }
        Ok(())
    }

    fn write_data(&mut self, buf: &[u8], block_len: usize, num_blocks: usize) -> Result {
        let Some(DataOp::WriteBlocks { addr, .. }) = self.card.pending.take() else {
            return Err(Error::Protocol);
        };
        {
            let mut journal = self.card.journal.lock().unwrap();
            if journal.write_failures_left > 0 {
                journal.write_failures_left -= 1;
                return Err(Error::Io);
            }
        }
        for i in 0..num_blocks {
            let chunk = &buf[i * block_len..(i + 1) * block_len];
            self.card.sectors.insert(addr + i as u32, chunk.to_vec());
        }
        Ok(())
    }

    fn max_read_burst(&mut self) -> u32 {
        32
    }

    fn max_write_burst(&mut self) -> u32 {
        32
    }

    fn set_voltage(&mut self, min_mv: u16, _max_mv: u16, _is_sd: bool) -> Result {
        if self.voltage_switch_broken {
            return Err(Error::Io);
        }
        if !self.switchable_to_1v8 {
            return Err(Error::NotSupported);
        }
        self.card.journal.lock().unwrap().voltage_mv = min_mv;
        Ok(())
    }
}

fn sd_card() -> (Sdmmc<MockHw>, Arc<Mutex<Journal>>) {
    let journal = Arc::new(Mutex::new(Journal::default()));
    let hw = MockHw {
        card: MockCard::new(Kind::SdV2Hc, journal.clone()),
        switchable_to_1v8: false,
        voltage_switch_broken: false,
    };
    (Sdmmc::new(hw, Permissions::default()), journal)
}

fn mmc_card() -> (Sdmmc<MockHw>, Arc<Mutex<Journal>>) {
    let journal = Arc::new(Mutex::new(Journal::default()));
    let hw = MockHw {
        card: MockCard::new(Kind::MmcHs400, journal.clone()),
        switchable_to_1v8: true,
        voltage_switch_broken: false,
    };
    (Sdmmc::new(hw, Permissions::default()), journal)
}

#[test]
fn sd_v2_hc_mounts_in_4bit_high_speed() {
    let (card, _journal) = sd_card();
    let info = card.device_info().unwrap();
    assert_eq!(info.bytes_per_sector as usize, BYTES_PER_SECTOR);
    assert_eq!(info.num_sectors, (SD_C_SIZE + 1) * 1024);

    assert_eq!(card.card_type(), CardType::Sd);
    assert_eq!(card.access_mode(), AccessMode::Hs);
    assert_eq!(card.bus_width(), 4);
    assert!(card.is_high_capacity());
    assert_ne!(card.rca(), 0);
    assert_eq!(card.voltage_mv(), 3300);
    assert_eq!(card.clock_khz(), 50_000);
}

#[test]
fn mmc_mounts_in_hs400_with_enhanced_strobe() {
    let (card, journal) = mmc_card();
    let info = card.device_info().unwrap();
    assert_eq!(info.num_sectors, MMC_SEC_COUNT);

    assert_eq!(card.card_type(), CardType::Mmc);
    assert_eq!(card.access_mode(), AccessMode::Hs400);
    assert_eq!(card.bus_width(), 8);
    assert_eq!(card.voltage_mv(), 1800);
    assert_eq!(card.clock_khz(), 200_000);
    assert!(card.is_enhanced_strobe_active());

    let journal = journal.lock().unwrap();
    assert!(journal.clock_flags.contains(ClockFlags::DDR_MODE | ClockFlags::STROBE_MODE));
    // With the strobe active there is no HS200 tuning pass.
    assert!(!journal.cmds.contains(&21));
    assert_eq!(journal.voltage_mv, 1700);
}

#[test]
fn sector_data_round_trips() {
    let (card, _journal) = sd_card();
    let mut data = vec![0u8; 4 * BYTES_PER_SECTOR];
    for (i, b) in data.iter_mut().enumerate() {
        *b = i as u8;
    }
    card.write(10, &data, 4, BurstType::Normal).unwrap();
    let mut back = vec![0u8; 4 * BYTES_PER_SECTOR];
    card.read(10, &mut back, 4).unwrap();
    assert_eq!(data, back);
}

#[test]
fn write_retry_falls_back_to_single_sector() {
    let (card, journal) = sd_card();
    card.init_medium().unwrap();
    journal.lock().unwrap().write_failures_left = 2;
    journal.lock().unwrap().cmds.clear();

    let data = vec![0xA5u8; 16 * BYTES_PER_SECTOR];
    card.write(0, &data, 16, BurstType::Normal).unwrap();

    let stats = card.stats();
    assert_eq!(stats.write_error_cnt, 2);
    assert_eq!(stats.write_sector_cnt, 16);

    // One failed CMD25, then single-sector CMD24s for the remainder.
    let journal = journal.lock().unwrap();
    assert_eq!(journal.cmds.iter().filter(|&&c| c == 25).count(), 1);
    assert_eq!(journal.cmds.iter().filter(|&&c| c == 24).count(), 17);
}

#[test]
fn write_gives_up_after_retry_budget() {
    let (card, journal) = sd_card();
    card.init_medium().unwrap();
    journal.lock().unwrap().write_failures_left = 16;

    let data = vec![0xA5u8; 4 * BYTES_PER_SECTOR];
    assert!(card.write(0, &data, 4, BurstType::Normal).is_err());
}

#[test]
fn trim_on_sd_is_a_silent_no_op() {
    let (card, journal) = sd_card();
    card.init_medium().unwrap();
    journal.lock().unwrap().cmds.clear();

    card.ioctl(IoctlCmd::FreeSectors {
        first_sector: 0,
        num_sectors: 8,
    })
    .unwrap();

    let journal = journal.lock().unwrap();
    for erase_cmd in [35u8, 36, 38] {
        assert!(!journal.cmds.contains(&erase_cmd));
    }
}

#[test]
fn write_protected_card_rejects_writes_without_commands() {
    let journal = Arc::new(Mutex::new(Journal::default()));
    let mut mock = MockCard::new(Kind::SdV2Hc, journal.clone());
    mock.write_protected = true;
    let card = Sdmmc::new(
        MockHw {
            card: mock,
            switchable_to_1v8: false,
            voltage_switch_broken: false,
        },
        Permissions::default(),
    );
    card.init_medium().unwrap();
    journal.lock().unwrap().cmds.clear();

    let data = vec![0u8; BYTES_PER_SECTOR];
    assert_eq!(
        card.write(0, &data, 1, BurstType::Normal),
        Err(Error::WriteProtected)
    );
    for write_cmd in [24u8, 25] {
        assert!(!journal.lock().unwrap().cmds.contains(&write_cmd));
    }
}

#[test]
fn cid_is_stable_across_remounts() {
    let (card, _journal) = sd_card();
    card.init_medium().unwrap();
    let cid = card.cid();
    card.ioctl(IoctlCmd::Unmount).unwrap();
    card.init_medium().unwrap();
    assert_eq!(card.cid(), cid);
}

#[test]
fn sector_restriction_bounds_capacity() {
    let journal = Arc::new(Mutex::new(Journal::default()));
    let total = (SD_C_SIZE + 1) * 1024;
    let perm = Permissions {
        start_sector: total - 1,
        max_num_sectors: 0,
        ..Permissions::default()
    };
    let card = Sdmmc::new(
        MockHw {
            card: MockCard::new(Kind::SdV2Hc, journal.clone()),
            switchable_to_1v8: false,
            voltage_switch_broken: false,
        },
        perm,
    );
    // One usable sector at the very top of the medium.
    assert_eq!(card.device_info().unwrap().num_sectors, 1);

    let perm = Permissions {
        start_sector: total,
        ..Permissions::default()
    };
    let card = Sdmmc::new(
        MockHw {
            card: MockCard::new(Kind::SdV2Hc, journal),
            switchable_to_1v8: false,
            voltage_switch_broken: false,
        },
        perm,
    );
    assert_eq!(card.device_info(), Err(Error::InvalidParam));
}

#[test]
fn failed_voltage_switch_is_not_probed_again() {
    let journal = Arc::new(Mutex::new(Journal::default()));
    let mut mock = MockCard::new(Kind::SdV2Hc, journal.clone());
    mock.ocr_s18a = true;
    let card = Sdmmc::new(
        MockHw {
            card: mock,
            switchable_to_1v8: true,
            voltage_switch_broken: true,
        },
        Permissions::default(),
    );
    // First pass fails at the rail switch; the rerun suppresses the 1.8 V
    // request and mounts at the default voltage.
    card.init_medium().unwrap();
    assert_eq!(card.voltage_mv(), 3300);
    assert_eq!(card.access_mode(), AccessMode::Hs);

    let journal = journal.lock().unwrap();
    assert_eq!(journal.cmds.iter().filter(|&&c| c == 11).count(), 1);
}
