use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure modes reported across the subsystem's public surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// Malformed request, missing required field, or stale version.
    InvalidParameter,
    /// The hardware cannot satisfy the configuration at all.
    InvalidConfiguration,
    /// Memory or descriptor allocation failed.
    InsufficientResources,
    /// The device or a stream resource is held by another owner.
    ResourceInUse,
    /// The operation's direction does not match the device's.
    AccessDenied,
    /// The request has no meaning for this object.
    NotSupported,
    /// The supplied buffer is too small for the reply.
    DataLengthMismatch,
    /// The hardware reported a transfer fault.
    DeviceIoError,
    /// A wait or hardware handshake exceeded its budget.
    Timeout,
    /// Nothing left to read.
    EndOfFile,
    /// No object matches the given name.
    NotFound,
    /// The transfer was torn down while in flight.
    Cancelled,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let description = match self {
            Error::InvalidParameter => "invalid parameter",
            Error::InvalidConfiguration => "invalid configuration",
            Error::InsufficientResources => "insufficient resources",
            Error::ResourceInUse => "resource in use",
            Error::AccessDenied => "access denied",
            Error::NotSupported => "not supported",
            Error::DataLengthMismatch => "data length mismatch",
            Error::DeviceIoError => "device I/O error",
            Error::Timeout => "timed out",
            Error::EndOfFile => "end of file",
            Error::NotFound => "not found",
            Error::Cancelled => "cancelled",
        };
        f.write_str(description)
    }
}

impl std::error::Error for Error {}
