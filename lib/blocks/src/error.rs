use core::fmt;

pub type Result<T = ()> = core::result::Result<T, Error>;

/// Error kinds surfaced by the storage drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Controller-level failure (CRC error, FIFO fault, command timeout on
    /// the bus). Usually transient; commands carrying it are retried.
    Io,
    /// A bounded wait loop expired before the device signalled readiness.
    TimedOut,
    /// The medium went away in the middle of an operation.
    NoDevice,
    /// The requested feature is not implemented by the device or by the
    /// hardware layer. Not fatal; callers treat it as "skip this step".
    NotSupported,
    /// Invalid argument (sector out of range, bad buffer length, ...).
    InvalidParam,
    /// The device answered, but the response violates the protocol
    /// (bad check pattern, unexpected state transition, id mismatch).
    Protocol,
    /// Write attempted on a write-protected medium.
    WriteProtected,
    /// The device itself flagged the operation as failed in one of its
    /// status registers (program error, erase error, protection error).
    DeviceReported,
    /// No usable medium was identified at bring-up.
    NoMedium,
    /// The instance latched a previous fatal error; remount to recover.
    HasError,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Error::Io => "I/O error",
            Error::TimedOut => "operation timed out",
            Error::NoDevice => "device removed",
            Error::NotSupported => "operation not supported",
            Error::InvalidParam => "invalid parameter",
            Error::Protocol => "protocol violation",
            Error::WriteProtected => "medium is write protected",
            Error::DeviceReported => "device reported a failure",
            Error::NoMedium => "no medium present",
            Error::HasError => "instance in error state",
        };
        f.write_str(s)
    }
}
