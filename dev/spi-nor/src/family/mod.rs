//! Vendor family descriptors and the ordered lists they are consulted in.

mod adesto;
mod eon;
mod gigadevice;
mod issi;
mod macronix;
mod microchip;
mod micron;
mod spansion;
mod winbond;

use blocks::Result;

pub use self::{
    adesto::{AdestoEnhanced, AdestoStandard},
    eon::Eon,
    gigadevice::{Byt, GigaDeviceEnhanced, GigaDeviceLowVoltage, GigaDeviceStandard},
    issi::{IssiEnhanced, IssiLegacy, IssiStandard},
    macronix::{Macronix, MacronixOctal, MacronixOctalDtr, MacronixOctalStr},
    microchip::Microchip,
    micron::{Micron, MicronX2},
    spansion::{Cypress, Spansion},
    winbond::{Winbond, WinbondDtr},
};
use crate::{
    device::{Device, DeviceList},
    Inst,
};

/// Catch-all terminator: no id check, plain SFDP identification, no vendor
/// error flags.
pub struct DefaultDevice;

impl Device for DefaultDevice {
    fn identify(&self, _inst: &mut Inst, _id: &[u8]) -> Result {
        Ok(())
    }
}

pub static DEVICE_LIST_ALL: DeviceList = DeviceList {
    devices: &[
        &Micron,
        &MicronX2,
        &Spansion,
        &Microchip,
        &WinbondDtr,
        &Winbond,
        &IssiEnhanced,
        &IssiStandard,
        &IssiLegacy,
        &Macronix,
        &MacronixOctalStr,
        &MacronixOctalDtr,
        &MacronixOctal,
        &GigaDeviceEnhanced,
        &GigaDeviceStandard,
        &GigaDeviceLowVoltage,
        &Byt,
        &Cypress,
        &AdestoStandard,
        &AdestoEnhanced,
        &Eon,
        &DefaultDevice,
    ],
};

/// Micron stays in the default list for compatibility with the first
/// SPIFI-attached boards, which relied on its flag status handling.
pub static DEVICE_LIST_DEFAULT: DeviceList = DeviceList {
    devices: &[&Micron, &DefaultDevice],
};

pub static DEVICE_LIST_MICRON: DeviceList = DeviceList {
    devices: &[&Micron],
};

pub static DEVICE_LIST_MICRON_X: DeviceList = DeviceList {
    devices: &[&Micron, &MicronX2],
};

pub static DEVICE_LIST_MICRON_X2: DeviceList = DeviceList {
    devices: &[&MicronX2],
};

pub static DEVICE_LIST_SPANSION: DeviceList = DeviceList {
    devices: &[&Spansion],
};

pub static DEVICE_LIST_MICROCHIP: DeviceList = DeviceList {
    devices: &[&Microchip],
};

pub static DEVICE_LIST_WINBOND: DeviceList = DeviceList {
    devices: &[&WinbondDtr, &Winbond],
};

pub static DEVICE_LIST_ISSI: DeviceList = DeviceList {
    devices: &[&IssiEnhanced, &IssiStandard, &IssiLegacy],
};

pub static DEVICE_LIST_MACRONIX: DeviceList = DeviceList {
    devices: &[&Macronix, &MacronixOctal],
};

pub static DEVICE_LIST_MACRONIX_OCTAL: DeviceList = DeviceList {
    devices: &[&MacronixOctalStr, &MacronixOctalDtr],
};

pub static DEVICE_LIST_GIGADEVICE: DeviceList = DeviceList {
    devices: &[
        &GigaDeviceEnhanced,
        &GigaDeviceStandard,
        &GigaDeviceLowVoltage,
    ],
};

pub static DEVICE_LIST_BYT: DeviceList = DeviceList { devices: &[&Byt] };

pub static DEVICE_LIST_CYPRESS: DeviceList = DeviceList {
    devices: &[&Cypress],
};

pub static DEVICE_LIST_ADESTO: DeviceList = DeviceList {
    devices: &[&AdestoStandard, &AdestoEnhanced],
};

pub static DEVICE_LIST_EON: DeviceList = DeviceList { devices: &[&Eon] };
