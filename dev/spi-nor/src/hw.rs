//! Hardware adapter contract.
//!
//! The driver core never touches a controller register. Everything goes
//! through this trait, one implementation per SPI/QSPI/OSPI controller (or
//! bit-banged port). Optional capabilities keep their default bodies and
//! report "not supported"; the core treats that as a missing feature, not as
//! a failure.

use bitflags::bitflags;
use blocks::{Error, Result};

/// Number of data lines used for each phase of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusWidth {
    pub cmd: u8,
    pub addr: u8,
    pub data: u8,
}

impl BusWidth {
    pub const fn new(cmd: u8, addr: u8, data: u8) -> Self {
        Self { cmd, addr, data }
    }

    pub const fn single() -> Self {
        Self::new(1, 1, 1)
    }

    pub const fn octal() -> Self {
        Self::new(8, 8, 8)
    }
}

impl Default for BusWidth {
    fn default() -> Self {
        Self::single()
    }
}

bitflags! {
    /// Transfer options passed down to the hardware layer.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct XferFlags: u16 {
        /// Data bytes change on both clock edges.
        const DTR_DATA   = 1 << 0;
        /// Address bytes change on both clock edges.
        const DTR_ADDR   = 1 << 1;
        /// Opcode bytes change on both clock edges.
        const DTR_CMD    = 1 << 2;
        /// In DTR mode the byte sampled on the falling edge comes first.
        const DTR_D1_D0  = 1 << 3;
        /// The first parameter byte carries 4 mode bits.
        const MODE_4BIT  = 1 << 4;
        /// The first parameter byte carries 8 mode bits.
        const MODE_8BIT  = 1 << 5;
        /// An extra nibble of dummy cycles follows the parameter bytes.
        const DUMMY_4BIT = 1 << 6;
        /// A 4-byte address encodes a request the device sees as 3-byte;
        /// dual-die setups halve it per die.
        const ADDR_3BYTE = 1 << 7;
    }
}

/// Parameters of one polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPara {
    /// Number of wait cycles before the operation is declared dead.
    pub timeout: u32,
    /// Clock cycles between two hardware-assisted queries.
    pub delay: u32,
    /// Milliseconds slept between two software queries.
    pub delay_ms: u16,
}

impl PollPara {
    pub const fn new(timeout: u32, delay: u32, delay_ms: u16) -> Self {
        Self {
            timeout,
            delay,
            delay_ms,
        }
    }
}

/// Blocking primitives provided by the platform integration.
///
/// The `*_with_cmd*` family takes multi-byte opcodes; Macronix octal parts
/// frame every command as `[cmd, !cmd]` (CEI) and dual-die setups route one
/// transaction to two devices at once. Controllers that serve only plain
/// single-die SPI leave the default bodies in place.
pub trait HwSpi {
    fn control(&mut self, cmd: u8, bus_width: BusWidth) -> Result;

    fn write(&mut self, cmd: u8, data: &[u8], bus_width: BusWidth) -> Result;

    fn read(&mut self, cmd: u8, data: &mut [u8], bus_width: BusWidth) -> Result;

    /// Like [`HwSpi::write`], with address/dummy bytes between opcode and
    /// data. The first `num_addr_bytes` of `para` form the address.
    fn write_with_addr(
        &mut self,
        cmd: u8,
        para: &[u8],
        num_addr_bytes: usize,
        data: &[u8],
        bus_width: BusWidth,
    ) -> Result;

    /// Like [`HwSpi::read`], with address/dummy bytes between opcode and
    /// data.
    fn read_with_addr(
        &mut self,
        cmd: u8,
        para: &[u8],
        num_addr_bytes: usize,
        data: &mut [u8],
        bus_width: BusWidth,
    ) -> Result;

    /// Hardware-assisted status polling: repeatedly issues `cmd` and waits
    /// until bit `bit_pos` of the returned byte equals `bit_value`.
    ///
    /// `None` means the controller cannot poll on its own and the core has
    /// to fall back to a software loop.
    fn poll(
        &mut self,
        _cmd: u8,
        _bit_pos: u8,
        _bit_value: u8,
        _delay: u32,
        _timeout_ms: u32,
        _bus_width: BusWidth,
    ) -> Option<Result> {
        None
    }

    fn delay_ms(&mut self, _ms: u32) -> Result {
        Err(Error::NotSupported)
    }

    fn control_with_cmd(&mut self, _cmd: &[u8], _bus_width: BusWidth, _flags: XferFlags) -> Result {
        Err(Error::NotSupported)
    }

    fn write_with_cmd(
        &mut self,
        _cmd: &[u8],
        _data: &[u8],
        _bus_width: BusWidth,
        _flags: XferFlags,
    ) -> Result {
        Err(Error::NotSupported)
    }

    fn read_with_cmd_and_addr(
        &mut self,
        _cmd: &[u8],
        _para: &[u8],
        _num_addr_bytes: usize,
        _data: &mut [u8],
        _bus_width: BusWidth,
        _flags: XferFlags,
    ) -> Result {
        Err(Error::NotSupported)
    }

    fn write_with_cmd_and_addr(
        &mut self,
        _cmd: &[u8],
        _para: &[u8],
        _num_addr_bytes: usize,
        _data: &[u8],
        _bus_width: BusWidth,
        _flags: XferFlags,
    ) -> Result {
        Err(Error::NotSupported)
    }

    fn poll_with_cmd(
        &mut self,
        _cmd: &[u8],
        _para: &[u8],
        _num_addr_bytes: usize,
        _bit_pos: u8,
        _bit_value: u8,
        _delay: u32,
        _timeout_ms: u32,
        _bus_width: BusWidth,
        _flags: XferFlags,
    ) -> Option<Result> {
        None
    }
}
